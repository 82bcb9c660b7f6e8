//! RPC message envelope (RFC 5531).
//!
//! The transport only ever interprets the transaction id, which is always
//! the first four bytes of a message in network byte order. Servers also
//! need the program/version/procedure triple to dispatch and to key the
//! duplicate request cache; that comes from a pluggable [`CallCodec`].

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;

use crate::error::{Result, RpcError};
use crate::xdr::{XdrDecoder, XdrEncoder};

/// RPC protocol version carried in every call.
pub const RPC_VERSION: u32 = 2;

/// RPC message type: CALL
pub const RPC_CALL: u32 = 0;
/// RPC message type: REPLY
pub const RPC_REPLY: u32 = 1;

/// Reply status: accepted
pub const MSG_ACCEPTED: u32 = 0;
/// Reply status: denied
pub const MSG_DENIED: u32 = 1;

/// RPC accept status: success
pub const ACCEPT_SUCCESS: u32 = 0;

/// RPC authentication flavor: none
pub const AUTH_NONE: u32 = 0;

/// Longest credential or verifier body allowed by the protocol.
pub const MAX_AUTH_BYTES: usize = 400;

/// Length of the transaction id prefix.
pub const XID_LEN: usize = 4;

/// Reads the transaction id from the front of a message.
pub fn read_xid(message: &[u8]) -> Option<u32> {
    let prefix: [u8; XID_LEN] = message.get(..XID_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix))
}

/// Overwrites the transaction id at the front of a message.
pub fn write_xid(message: &mut [u8], xid: u32) -> Result<()> {
    let prefix = message
        .get_mut(..XID_LEN)
        .ok_or_else(|| RpcError::encode("message shorter than a transaction id"))?;
    prefix.copy_from_slice(&xid.to_be_bytes());
    Ok(())
}

/// Direction of a message, the second word of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// A request from client to server.
    Call,
    /// A response from server to client.
    Reply,
}

impl Direction {
    /// Reads the direction word that follows the xid.
    pub fn of(message: &[u8]) -> Option<Self> {
        match read_xid(message.get(XID_LEN..)?)? {
            RPC_CALL => Some(Direction::Call),
            RPC_REPLY => Some(Direction::Reply),
            _ => None,
        }
    }
}

/// The fields of a call the transport needs for dispatch and duplicate
/// detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallHeader {
    /// Transaction id.
    pub xid: u32,
    /// Program number.
    pub prog: u32,
    /// Program version.
    pub vers: u32,
    /// Procedure number.
    pub proc: u32,
    /// Offset of the procedure arguments within the message.
    pub args_offset: usize,
}

/// Extracts a [`CallHeader`] from a complete call message.
pub trait CallCodec: Send + Sync + 'static {
    /// Decodes the call header; failures are reported as `DecodeFailed`.
    fn decode_call(&self, message: &[u8]) -> Result<CallHeader>;
}

/// Decodes standard RFC 5531 call headers, skipping the credential and
/// verifier without interpreting them.
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcMessageCodec;

impl CallCodec for RpcMessageCodec {
    fn decode_call(&self, message: &[u8]) -> Result<CallHeader> {
        let mut dec = XdrDecoder::new(message);
        let xid = dec.decode_u32()?;
        let msg_type = dec.decode_u32()?;
        if msg_type != RPC_CALL {
            return Err(RpcError::decode(format!(
                "expected RPC CALL, got message type {}",
                msg_type
            )));
        }
        let rpcvers = dec.decode_u32()?;
        if rpcvers != RPC_VERSION {
            return Err(RpcError::decode(format!(
                "unsupported RPC version {}",
                rpcvers
            )));
        }
        let prog = dec.decode_u32()?;
        let vers = dec.decode_u32()?;
        let proc = dec.decode_u32()?;
        for _ in 0..2 {
            dec.decode_u32()?;
            dec.decode_opaque_variable(MAX_AUTH_BYTES)?;
        }
        Ok(CallHeader {
            xid,
            prog,
            vers,
            proc,
            args_offset: dec.position(),
        })
    }
}

impl<F> CallCodec for F
where
    F: Fn(&[u8]) -> Result<CallHeader> + Send + Sync + 'static,
{
    fn decode_call(&self, message: &[u8]) -> Result<CallHeader> {
        self(message)
    }
}

/// Builds a call message with AUTH_NONE credentials around opaque,
/// already-encoded arguments.
pub fn encode_call(xid: u32, prog: u32, vers: u32, proc: u32, args: &[u8]) -> Bytes {
    let mut enc = XdrEncoder::new();
    enc.encode_u32(xid);
    enc.encode_u32(RPC_CALL);
    enc.encode_u32(RPC_VERSION);
    enc.encode_u32(prog);
    enc.encode_u32(vers);
    enc.encode_u32(proc);
    for _ in 0..2 {
        enc.encode_u32(AUTH_NONE);
        enc.encode_opaque_variable(&[]);
    }
    enc.append_raw(args);
    enc.finish()
}

/// Builds an accepted, successful reply around opaque, already-encoded
/// results.
pub fn encode_accepted_reply(xid: u32, results: &[u8]) -> Bytes {
    let mut enc = XdrEncoder::new();
    enc.encode_u32(xid);
    enc.encode_u32(RPC_REPLY);
    enc.encode_u32(MSG_ACCEPTED);
    enc.encode_u32(AUTH_NONE);
    enc.encode_opaque_variable(&[]);
    enc.encode_u32(ACCEPT_SUCCESS);
    enc.append_raw(results);
    enc.finish()
}

/// Offset of the results in a reply built by [`encode_accepted_reply`].
pub const ACCEPTED_REPLY_HEADER_LEN: usize = 24;

/// Hands out transaction ids for one client handle.
#[derive(Debug)]
pub struct XidGenerator {
    next: AtomicU32,
}

impl XidGenerator {
    /// Starts at a random value so restarted clients do not reuse ids that a
    /// server may still hold in its duplicate cache.
    pub fn new() -> Self {
        Self::starting_at(rand::random())
    }

    /// Starts at a fixed value.
    pub fn starting_at(xid: u32) -> Self {
        Self {
            next: AtomicU32::new(xid),
        }
    }

    /// Returns the next transaction id, wrapping on overflow.
    pub fn next_xid(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call will use.
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    /// Sets the id the next call will use.
    pub fn set_next(&self, xid: u32) {
        self.next.store(xid, Ordering::Relaxed);
    }
}

impl Default for XidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_xid_big_endian() {
        assert_eq!(read_xid(&[0, 0, 0, 42, 9, 9]), Some(42));
        assert_eq!(read_xid(&[0x12, 0x34, 0x56, 0x78]), Some(0x1234_5678));
        assert_eq!(read_xid(&[1, 2, 3]), None);
    }

    #[test]
    fn test_write_xid_in_place() {
        let mut msg = vec![0u8; 8];
        write_xid(&mut msg, 0xdead_beef).unwrap();
        assert_eq!(&msg[..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&msg[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_write_xid_too_short() {
        let mut msg = vec![0u8; 2];
        assert!(matches!(
            write_xid(&mut msg, 1),
            Err(RpcError::EncodeFailed { .. })
        ));
    }

    #[test]
    fn test_direction() {
        let call = encode_call(1, 100000, 2, 0, &[]);
        let reply = encode_accepted_reply(1, &[]);
        assert_eq!(Direction::of(&call), Some(Direction::Call));
        assert_eq!(Direction::of(&reply), Some(Direction::Reply));
        assert_eq!(Direction::of(&[0, 0, 0, 1]), None);
    }

    #[test]
    fn test_decode_call_roundtrip() {
        let msg = encode_call(12345, 100003, 3, 1, b"argsdata");
        let header = RpcMessageCodec.decode_call(&msg).unwrap();
        assert_eq!(header.xid, 12345);
        assert_eq!(header.prog, 100003);
        assert_eq!(header.vers, 3);
        assert_eq!(header.proc, 1);
        assert_eq!(&msg[header.args_offset..], b"argsdata");
    }

    #[test]
    fn test_decode_call_with_auth_body() {
        let mut enc = XdrEncoder::new();
        enc.encode_u32(999);
        enc.encode_u32(RPC_CALL);
        enc.encode_u32(RPC_VERSION);
        enc.encode_u32(100005);
        enc.encode_u32(3);
        enc.encode_u32(1);
        enc.encode_u32(1);
        enc.encode_opaque_variable(b"clienthost-credentials");
        enc.encode_u32(AUTH_NONE);
        enc.encode_opaque_variable(&[]);
        enc.append_raw(b"tail");
        let msg = enc.finish();

        let header = RpcMessageCodec.decode_call(&msg).unwrap();
        assert_eq!(header.xid, 999);
        assert_eq!(header.prog, 100005);
        assert_eq!(&msg[header.args_offset..], b"tail");
    }

    #[test]
    fn test_decode_call_wrong_msg_type() {
        let reply = encode_accepted_reply(7, b"x");
        assert!(matches!(
            RpcMessageCodec.decode_call(&reply),
            Err(RpcError::DecodeFailed { .. })
        ));
    }

    #[test]
    fn test_decode_call_wrong_rpc_version() {
        let mut msg = encode_call(7, 1, 1, 1, &[]).to_vec();
        msg[8..12].copy_from_slice(&3u32.to_be_bytes());
        assert!(RpcMessageCodec.decode_call(&msg).is_err());
    }

    #[test]
    fn test_decode_call_truncated() {
        let msg = encode_call(7, 1, 1, 1, &[]);
        assert!(RpcMessageCodec.decode_call(&msg[..10]).is_err());
    }

    #[test]
    fn test_accepted_reply_layout() {
        let reply = encode_accepted_reply(42, b"result");
        assert_eq!(read_xid(&reply), Some(42));
        assert_eq!(&reply[ACCEPTED_REPLY_HEADER_LEN..], b"result");
    }

    #[test]
    fn test_closure_codec() {
        let codec = |msg: &[u8]| -> Result<CallHeader> {
            Ok(CallHeader {
                xid: read_xid(msg).unwrap_or(0),
                prog: 1,
                vers: 1,
                proc: 0,
                args_offset: 4,
            })
        };
        let header = codec.decode_call(&[0, 0, 0, 5]).unwrap();
        assert_eq!(header.xid, 5);
    }

    #[test]
    fn test_xid_generator_wraps() {
        let xids = XidGenerator::starting_at(u32::MAX);
        assert_eq!(xids.next_xid(), u32::MAX);
        assert_eq!(xids.next_xid(), 0);
        xids.set_next(77);
        assert_eq!(xids.peek(), 77);
        assert_eq!(xids.next_xid(), 77);
    }
}
