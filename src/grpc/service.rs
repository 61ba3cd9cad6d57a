//! Admission service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::{
    admission_server::Admission, to_proto_duration, to_proto_timestamp, CategoryStats,
    CheckRequest, CheckResponse, ClearBlockRequest, ClearBlockResponse, SnapshotRequest,
    SnapshotResponse,
};

use crate::ratelimit::{client_address, AuditEvent, AuditSink, Category, RateLimiter, TracingAuditSink};

/// Implementation of the `tollgate.admission.v1.Admission` gRPC interface.
pub struct AdmissionService {
    /// The rate limiter instance
    limiter: Arc<RateLimiter>,
    /// Receives an event for every denied check
    audit: Arc<dyn AuditSink>,
    /// Honour `forwarded_for` / `real_ip` on check requests
    trust_proxy_headers: bool,
}

impl AdmissionService {
    /// Create a new service that audits denials to the log.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
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
}

fn parse_category(name: &str) -> Result<Category, Status> {
    name.parse::<Category>().map_err(|e| {
        warn!(category = %name, "Received request for unknown category");
        Status::from(e)
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[tonic::async_trait]
impl Admission for AdmissionService {
    /// Count one request against its key and report the decision.
    #[instrument(
        skip(self, request),
        fields(category = %request.get_ref().category)
    )]
    async fn check(&self, request: Request<CheckRequest>) -> Result<Response<CheckResponse>, Status> {
        let req = request.into_inner();
        let category = parse_category(&req.category)?;
        let identity = non_empty(&req.identity);

        let address = if self.trust_proxy_headers {
            client_address(req.forwarded_for.as_deref(), req.real_ip.as_deref(), &req.address)
        } else {
            req.address.as_str()
        };

        if identity.is_none() && address.trim().is_empty() {
            warn!("Received check with neither identity nor address");
            return Err(Status::invalid_argument("identity or address is required"));
        }

        let decision = self.limiter.check(category, identity, address)?;
        let now = self.limiter.now();

        if !decision.allowed {
            debug!(
                key_kind = decision.key.kind(),
                blocked = decision.blocked,
                "Request denied, emitting audit event"
            );
            self.audit.record(AuditEvent::rate_limit_exceeded(&decision)).await;
        }

        Ok(Response::new(CheckResponse {
            allowed: decision.allowed,
            limit: decision.limit,
            remaining: decision.remaining,
            reset_after: Some(to_proto_duration(decision.reset_after(now))),
            retry_after: decision.retry_after.map(to_proto_duration),
            blocked: decision.blocked,
            key_kind: decision.key.kind().to_string(),
        }))
    }

    #[instrument(skip(self, request), fields(reset = request.get_ref().reset))]
    async fn snapshot(
        &self,
        request: Request<SnapshotRequest>,
    ) -> Result<Response<SnapshotResponse>, Status> {
        let snapshot = if request.into_inner().reset {
            self.limiter.take_snapshot()
        } else {
            self.limiter.snapshot()
        };

        let categories = snapshot
            .categories
            .iter()
            .map(|(category, stats)| CategoryStats {
                category: category.as_str().to_string(),
                requests: stats.requests,
                denied: stats.denied,
            })
            .collect();

        Ok(Response::new(SnapshotResponse {
            tracked_keys: snapshot.tracked_keys,
            blocked_keys: snapshot.blocked_keys,
            total_requests: snapshot.total_requests,
            allowed_requests: snapshot.allowed_requests,
            denied_requests: snapshot.denied_requests,
            clock_anomalies: snapshot.clock_anomalies,
            since: Some(to_proto_timestamp(snapshot.since)),
            categories,
        }))
    }

    #[instrument(skip(self, request), fields(category = %request.get_ref().category))]
    async fn clear_block(
        &self,
        request: Request<ClearBlockRequest>,
    ) -> Result<Response<ClearBlockResponse>, Status> {
        let req = request.into_inner();
        let category = parse_category(&req.category)?;
        let identity = non_empty(&req.identity);

        if identity.is_none() && req.address.trim().is_empty() {
            return Err(Status::invalid_argument("identity or address is required"));
        }

        let key = self.limiter.resolver().resolve(identity, &req.address);
        let cleared = self.limiter.clear_block(category, &key);

        info!(key_kind = key.kind(), cleared = cleared, "Clear block request handled");

        Ok(Response::new(ClearBlockResponse { cleared }))
    }
}
