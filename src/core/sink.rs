//! The single delivery capability shared by both transports

use crate::core::event::Event;

/// Something that can deliver an event to a client.
///
/// Returns `false` when the client could not be reached. Router broadcast
/// is written once against this trait; the registry writes to sockets and
/// the mailbox queues for the next poll cycle.
pub trait Sink {
    fn send(&mut self, client_id: &str, event: &Event) -> bool;
}
