//! Rate limiting logic and state management.

mod audit;
mod category;
mod clock;
mod decision;
mod janitor;
mod key;
mod limiter;
mod policy;
mod stats;
mod window;

pub use audit::{AuditEvent, AuditSink, MemoryAuditSink, TracingAuditSink, RATE_LIMIT_EXCEEDED};
pub use category::Category;
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::Decision;
pub use janitor::Janitor;
pub use key::{client_address, EntryKey, KeyResolver, RateLimitKey};
pub use limiter::RateLimiter;
pub use policy::{LimitPolicy, PolicyRule, PolicyTable, Profile, MAX_POLICY_DURATION};
pub use stats::{CategoryStats, StatsSnapshot};
pub use window::WindowEntry;
