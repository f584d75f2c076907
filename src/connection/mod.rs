//! Connection manager.
//!
//! `RealtimeClient` is the service object consumers hold; the state machine
//! itself runs in a background task that owns the transport.

mod client;
mod manager;
mod state;

pub use client::RealtimeClient;
pub use state::{ConnectionEvent, ConnectionInfo, ConnectionState, ConnectionStatus};
