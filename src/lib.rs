//! Realtime Hub - connection registry and notification fan-out
//!
//! Push clients hold a WebSocket, poll clients hold an event stream fed from
//! a per-client mailbox. Both are addressed by client id, channel, room or
//! identity through one `NotificationHub`. Every HTTP entry point sits behind
//! a multi-tier rate limiter.

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;
pub mod storage;

// Re-export main components
pub use config::*;
pub use constants::*;
