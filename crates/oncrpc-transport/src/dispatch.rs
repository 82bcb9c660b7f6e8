//! Boundary between server transports and the program handlers above them.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::message::{write_xid, CallHeader, XID_LEN};

/// A complete call handed to a handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Decoded call header.
    pub header: CallHeader,
    /// The whole call message, envelope included.
    pub request: Bytes,
    /// Where the call came from, if known.
    pub peer: Option<SocketAddr>,
}

impl CallContext {
    /// Procedure arguments, still encoded.
    pub fn args(&self) -> &[u8] {
        self.request.get(self.header.args_offset..).unwrap_or(&[])
    }
}

/// Handler invoked by server transports for every complete call.
///
/// The handler must either [`send`](ReplySender::send) a reply or
/// [`decline`](ReplySender::decline). Dropping the sender counts as
/// declining. Handlers that need to do slow work should move the sender into
/// a task of their own.
pub trait Dispatch: Send + Sync + 'static {
    /// Handles one call.
    fn dispatch(&self, call: CallContext, reply: ReplySender);
}

impl<F> Dispatch for F
where
    F: Fn(CallContext, ReplySender) + Send + Sync + 'static,
{
    fn dispatch(&self, call: CallContext, reply: ReplySender) {
        self(call, reply)
    }
}

/// Sends the reply to one call back through the transport it arrived on.
#[derive(Debug)]
pub struct ReplySender {
    xid: u32,
    tx: oneshot::Sender<Bytes>,
}

impl ReplySender {
    /// Transaction id the reply will carry.
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Sends the reply. The transport stamps the call's xid into the first
    /// four bytes. Returns `false` if the transport is already gone.
    pub fn send(self, reply: impl Into<Bytes>) -> bool {
        self.tx.send(reply.into()).is_ok()
    }

    /// Declines to answer the call.
    pub fn decline(self) {}
}

/// Receiving half of a [`ReplySender`], held by the transport.
#[derive(Debug)]
pub struct PendingReply {
    xid: u32,
    rx: oneshot::Receiver<Bytes>,
}

impl PendingReply {
    /// Transaction id of the call being answered.
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Waits for the handler. `None` means the call was declined.
    pub async fn recv(self) -> Option<Bytes> {
        self.rx.await.ok()
    }
}

/// Creates a sender/receiver pair bound to `xid`.
pub fn reply_channel(xid: u32) -> (ReplySender, PendingReply) {
    let (tx, rx) = oneshot::channel();
    (ReplySender { xid, tx }, PendingReply { xid, rx })
}

/// Returns `reply` with its first four bytes replaced by `xid`.
pub fn bind_reply_xid(reply: Bytes, xid: u32) -> Result<Bytes> {
    if reply.len() < XID_LEN {
        return Err(RpcError::encode(format!(
            "reply of {} bytes cannot carry a transaction id",
            reply.len()
        )));
    }
    if reply[..XID_LEN] == xid.to_be_bytes() {
        return Ok(reply);
    }
    let mut owned = BytesMut::from(&reply[..]);
    write_xid(&mut owned, xid)?;
    Ok(owned.freeze())
}
