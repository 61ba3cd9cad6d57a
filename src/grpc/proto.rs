//! Wire messages for `tollgate.admission.v1.Admission`.

use std::time::Duration;

use chrono::{DateTime, Utc};

// Server stubs generated by build.rs
include!(concat!(env!("OUT_DIR"), "/tollgate.admission.v1.Admission.rs"));

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckRequest {
    /// Category wire name, e.g. `authentication`
    #[prost(string, tag = "1")]
    pub category: String,
    /// Authenticated principal, if any
    #[prost(string, optional, tag = "2")]
    pub identity: Option<String>,
    /// Peer address as seen by the caller
    #[prost(string, tag = "3")]
    pub address: String,
    #[prost(string, optional, tag = "4")]
    pub forwarded_for: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub real_ip: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckResponse {
    #[prost(bool, tag = "1")]
    pub allowed: bool,
    #[prost(uint32, tag = "2")]
    pub limit: u32,
    #[prost(uint32, tag = "3")]
    pub remaining: u32,
    /// Time until the oldest counted request leaves the window
    #[prost(message, optional, tag = "4")]
    pub reset_after: Option<::prost_types::Duration>,
    /// Set only on denial
    #[prost(message, optional, tag = "5")]
    pub retry_after: Option<::prost_types::Duration>,
    #[prost(bool, tag = "6")]
    pub blocked: bool,
    /// `identity` or `address`
    #[prost(string, tag = "7")]
    pub key_kind: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotRequest {
    /// Reset the counters after reading them
    #[prost(bool, tag = "1")]
    pub reset: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CategoryStats {
    #[prost(string, tag = "1")]
    pub category: String,
    #[prost(uint64, tag = "2")]
    pub requests: u64,
    #[prost(uint64, tag = "3")]
    pub denied: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotResponse {
    #[prost(uint64, tag = "1")]
    pub tracked_keys: u64,
    #[prost(uint64, tag = "2")]
    pub blocked_keys: u64,
    #[prost(uint64, tag = "3")]
    pub total_requests: u64,
    #[prost(uint64, tag = "4")]
    pub allowed_requests: u64,
    #[prost(uint64, tag = "5")]
    pub denied_requests: u64,
    #[prost(uint64, tag = "6")]
    pub clock_anomalies: u64,
    #[prost(message, optional, tag = "7")]
    pub since: Option<::prost_types::Timestamp>,
    #[prost(message, repeated, tag = "8")]
    pub categories: Vec<CategoryStats>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClearBlockRequest {
    #[prost(string, tag = "1")]
    pub category: String,
    #[prost(string, optional, tag = "2")]
    pub identity: Option<String>,
    #[prost(string, tag = "3")]
    pub address: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClearBlockResponse {
    /// False when the key was not tracked
    #[prost(bool, tag = "1")]
    pub cleared: bool,
}

pub(crate) fn to_proto_duration(duration: Duration) -> ::prost_types::Duration {
    ::prost_types::Duration {
        seconds: i64::try_from(duration.as_secs()).unwrap_or(i64::MAX),
        nanos: duration.subsec_nanos() as i32,
    }
}

pub(crate) fn to_proto_timestamp(at: DateTime<Utc>) -> ::prost_types::Timestamp {
    ::prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}
