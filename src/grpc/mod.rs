//! gRPC surface for the admission service.

pub mod proto;
mod server;
mod service;

pub use server::GrpcServer;
pub use service::AdmissionService;

// Re-export commonly used types
pub use proto::{admission_server::AdmissionServer, CheckRequest, CheckResponse};
