//! # Session Protocol
//!
//! The JSON conversation protocol spoken over the socket, independent of the
//! socket itself.
//!
//! - **messages**: inbound frame classification and outbound frame builders
//! - **transcript**: per-turn transcript text and the user-visible message log
//! - **session**: the connection state machine that ties them together

pub mod messages;
pub mod session;
pub mod transcript;
