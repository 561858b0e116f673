//! Moderation decisions.

pub mod decision;

pub use decision::{Decision, decide};
