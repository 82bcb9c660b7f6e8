//! Connectionless transport: one call or reply per datagram.

pub mod client;
pub mod server;

pub use client::{DatagramClient, PendingCall};
pub use server::{DatagramOutcome, DatagramTransport};
