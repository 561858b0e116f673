//! Poll loop: drives fetch → classify → decide → execute → commit cycles.

pub mod backoff;
pub mod scheduler;

pub use backoff::{BackoffConfig, ChannelHealth, ChannelHealthView};
pub use scheduler::{ChannelOutcome, CycleReport, HealthBoard, PollLoop, PollerConfig};
