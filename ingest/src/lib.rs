pub mod api;
pub mod batch;
pub mod config;
pub mod event;
pub mod normalizer;
pub mod push_endpoint;
pub mod router;
pub mod sampler;
pub mod server;
pub mod sinks;
pub mod writer;
