//! Chat moderator: polls chat channels, scores messages against a policy,
//! and applies the resulting action.

pub mod classify;
pub mod config;
pub mod error;
pub mod executor;
pub mod moderation;
pub mod notify;
pub mod policy;
pub mod poller;
pub mod status;
pub mod store;
pub mod transport;
