pub mod config;
pub mod error;
pub mod lifecycle;
pub mod messaging;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod routes;
pub mod service;
pub mod store;
pub mod stream_buffer;
pub mod worker_processing;
pub mod worker_scheduler;
