//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::admission_server::AdmissionServer;
use super::service::AdmissionService;
use crate::error::{Result, TollgateError};
use crate::ratelimit::{AuditSink, RateLimiter, TracingAuditSink};

/// gRPC server for the admission service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    limiter: Arc<RateLimiter>,
    audit: Arc<dyn AuditSink>,
    trust_proxy_headers: bool,
}

impl GrpcServer {
    /// Create a new gRPC server that audits denials to the log.
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>) -> Self {
        Self {
            addr,
            limiter,
            audit: Arc::new(TracingAuditSink),
            trust_proxy_headers: false,
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    fn service(&self) -> AdmissionServer<AdmissionService> {
        let service = AdmissionService::new(Arc::clone(&self.limiter))
            .with_audit_sink(Arc::clone(&self.audit))
            .with_trust_proxy_headers(self.trust_proxy_headers);
        AdmissionServer::new(service)
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.addr, "Starting gRPC server for Admission");

        Server::builder()
            .add_service(self.service())
            .serve(self.addr)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Grpc(e)
            })
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        info!(
            addr = %self.addr,
            trust_proxy_headers = self.trust_proxy_headers,
            "Starting gRPC server for Admission with graceful shutdown"
        );

        Server::builder()
            .add_service(self.service())
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let limiter = Arc::new(RateLimiter::default());
        let _server = GrpcServer::new(addr, limiter).with_trust_proxy_headers(true);
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = GrpcServer::new(addr, Arc::new(RateLimiter::default()));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.serve_with_shutdown(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await;

        tokio_test::assert_ok!(tokio_test::assert_ok!(result));
    }
}
