//! Moderation policy: typed documents, validation, and snapshotting.
//!
//! Two documents drive the moderator:
//! - `channels.json`: which channels are polled (`monitored` minus `excluded`)
//! - `policies.json`: per-category rules (threshold, action, notify)
//!
//! Both are validated once per load and handed to the loop as an immutable
//! [`PolicySnapshot`]. Nothing reads configuration ambiently.

pub mod model;
pub mod store;

pub use model::{
    Category, ChannelSelection, ModerationAction, Policy, PolicyRule, Threshold, ThresholdScale,
    ThresholdTier,
};
pub use store::{FilePolicySource, PolicySnapshot, PolicySource, PolicyStore};
