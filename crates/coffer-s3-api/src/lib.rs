//! S3 API Server for Coffer

pub mod body;
pub mod metrics;
pub mod router;
pub mod routes;
pub mod server;
pub mod services;
pub mod xml;

pub use metrics::MetricsRecorder;
pub use router::{Operation, S3Request};
pub use server::{create_router, AppState, S3Server};
