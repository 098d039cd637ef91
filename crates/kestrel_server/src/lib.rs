//! KestrelDB server: the two-context request pipeline over TCP.
//!
//! A tokio network context owns sockets and buffers; a dedicated
//! transaction thread owns every index, journal and engine mutation.
//! The two meet over bounded channels, with response batching one way
//! and a connection-scaled in-flight budget the other.

pub mod connection;
pub mod pipeline;
pub mod relay;
pub mod server;

pub use server::KestrelServer;
