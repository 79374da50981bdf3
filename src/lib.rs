//! Image Relay
//!
//! Staged image-processing workers and the Redis Streams substrate that carries
//! their results back to the orchestrating side. Intake admits a signed upload,
//! the pipeline validates, decodes, processes, encodes and stores it, and the
//! result sink appends a durable record that a consumer group applies
//! transactionally.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
