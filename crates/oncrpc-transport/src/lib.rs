#![warn(missing_docs)]

//! ONC RPC transport runtime: record marking over byte streams, datagram
//! calls with retransmission and duplicate suppression, call/reply matching,
//! and server-side connection lifecycle management.

pub mod call;
pub mod cancel;
pub mod config;
pub mod datagram;
pub mod dispatch;
pub mod dup_cache;
pub mod error;
pub mod io;
pub mod message;
pub mod record;
pub mod registry;
pub mod server;
pub mod stream;
pub mod xdr;

pub use call::{CallMatcher, CallState, TimerAction};
pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use config::{CallTiming, DuplicateKeyMode, TransportConfig};
pub use datagram::{DatagramClient, DatagramOutcome, DatagramTransport, PendingCall};
pub use dispatch::{reply_channel, CallContext, Dispatch, PendingReply, ReplySender};
pub use dup_cache::{DuplicateCache, DuplicateCacheStats, SharedDuplicateCache};
pub use error::{Result, RpcError};
pub use message::{CallCodec, CallHeader, RpcMessageCodec, XidGenerator};
pub use record::{RecordReader, RecordWriter};
pub use registry::{ConnectionId, ConnectionKind, ConnectionRegistry, Registration};
pub use server::{RpcServer, ServerStats};
pub use stream::{StreamClient, StreamListener, StreamTransport};
