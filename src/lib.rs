//! Tollgate - Adaptive Request Rate Limiting
//!
//! This crate implements a per-category sliding window rate limiter with
//! escalating lockouts. Requests are keyed by authenticated identity when one
//! is present and by client address otherwise. The limiter can be embedded
//! directly or run as a gRPC admission service.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
