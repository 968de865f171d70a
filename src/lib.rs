pub mod adapter;
pub mod app;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod platforms;
pub mod stream;
pub mod telemetry;
