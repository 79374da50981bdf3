pub mod broker;
pub mod consumer;
pub mod intake;
pub mod memory;
pub mod progress;
pub mod queue;
pub mod reclaimer;
pub mod retry;
pub mod sink;
pub mod storage;
pub mod token;
