//! Campus relay server library.
//!
//! Exposes the relay hub and WebSocket server for use in tests and
//! embedding. Every message a connected client sends is forwarded verbatim
//! to all other connected clients.

pub mod config;
pub mod hub;
pub mod server;
pub mod shutdown;
