pub mod events;
pub mod lifecycle;
pub mod producer;
pub mod rate_limiter;

pub use events::{EventSubscription, QueueEvents};
pub use jobqueue_core::{QueueError, QueueResult};
pub use lifecycle::{
    ClaimOutcome, FailOutcome, FlowIds, JobCounts, JobFailure, JobLifecycle, NewJob, Sequence,
    StagedJob,
};
pub use producer::{FlowJob, Queue};
pub use rate_limiter::{LimiterDecision, RateLimiter};
