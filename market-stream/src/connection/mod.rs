/// Pure connection state machine: events in, effects out.
pub mod machine;

/// Tokio driver executing the machine's effects.
pub mod manager;

/// Single socket task: handshake, reads, writes and idle detection.
pub mod socket;

pub mod state;

pub use machine::{ConnectionMachine, Effect, Event, Generation, StatusChange};
pub use manager::ConnectionManager;
pub use state::ConnectionState;
