pub mod claims;
pub mod job;
pub mod progress;
pub mod result;
