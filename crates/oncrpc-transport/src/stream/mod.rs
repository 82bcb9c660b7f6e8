//! Connection-oriented transport: records carried over a byte stream with
//! record marking.

pub mod client;
pub mod connection;
pub mod listener;

pub use client::StreamClient;
pub use connection::{IoMode, StreamTransport, TransportStat};
pub use listener::{accept_with_eviction, StreamListener};
