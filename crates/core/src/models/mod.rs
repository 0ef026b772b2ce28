pub mod event;
pub mod job;
pub mod limiter;
pub mod options;
pub mod repeat;

pub use event::{EventId, EventKind, EventRecord, NewEvent};
pub use job::{fields, from_millis, to_millis, wait_score, JobLock, JobRecord, JobState};
pub use limiter::{LimiterState, RateLimiterOptions};
pub use options::{BackoffPolicy, JobOptions, KeepJobs, MAX_PRIORITY};
pub use repeat::{RepeatDescriptor, RepeatOptions};
