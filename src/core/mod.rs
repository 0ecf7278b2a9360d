//! Core functionality for the hub

pub mod client_key;
pub mod clock;
pub mod connection;
pub mod dispatcher;
pub mod event;
pub mod identity_index;
pub mod mailbox;
pub mod message_handler;
pub mod message_types;
pub mod rate_limiter;
pub mod registry;
pub mod router;
pub mod sink;

// Re-export main components for convenience
pub use connection::{ClientState, Connection};
pub use dispatcher::{ClientGuard, NotificationHub, SharedHub};
pub use event::{ClientId, Event, Identity, TransportKind};
pub use mailbox::Mailbox;
pub use message_handler::MessageHandler;
pub use rate_limiter::{MultiTierRateLimiter, RateLimitConfig, RateLimitDecision, RateLimitTier};
pub use registry::Registry;
pub use router::{ChannelRouter, RoomRouter};
pub use sink::Sink;
