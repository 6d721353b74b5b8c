//! Bidirectional translation between the Anthropic Messages shape
//! ([`crate::types`]) and the upstream wire dialects.

pub mod inbound;
pub mod outbound;
pub mod stream;
