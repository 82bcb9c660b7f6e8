//! Minimal XDR encoding/decoding (RFC 4506) for RPC message headers.
//!
//! Only the primitives the transport needs to build and inspect call/reply
//! headers live here; argument and result bodies stay opaque.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// XDR encoder writing into a growable buffer.
pub struct XdrEncoder {
    buf: BytesMut,
}

impl XdrEncoder {
    /// Creates a new XdrEncoder.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Encodes a 32-bit unsigned integer.
    pub fn encode_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Encodes fixed-length opaque data (padded to 4-byte boundary).
    pub fn encode_opaque_fixed(&mut self, data: &[u8]) {
        let padding = (4 - (data.len() % 4)) % 4;
        self.buf.extend_from_slice(data);
        self.buf.put_bytes(0, padding);
    }

    /// Encodes variable-length opaque data (length prefix + padded data).
    pub fn encode_opaque_variable(&mut self, data: &[u8]) {
        self.encode_u32(data.len() as u32);
        self.encode_opaque_fixed(data);
    }

    /// Appends bytes that are already XDR encoded.
    pub fn append_raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Consumes the encoder and returns the encoded bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for XdrEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// XDR decoder over a borrowed message.
pub struct XdrDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> XdrDecoder<'a> {
    /// Creates a new XdrDecoder from encoded bytes.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| RpcError::decode("truncated data"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Decodes a 32-bit unsigned integer.
    pub fn decode_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Decodes variable-length opaque data, refusing anything longer than
    /// `max_len`.
    pub fn decode_opaque_variable(&mut self, max_len: usize) -> Result<&'a [u8]> {
        let len = self.decode_u32()? as usize;
        if len > max_len {
            return Err(RpcError::decode(format!(
                "opaque length {} exceeds limit {}",
                len, max_len
            )));
        }
        let padded = len
            .checked_add((4 - (len % 4)) % 4)
            .ok_or_else(|| RpcError::decode("opaque length overflow"))?;
        let data = self.take(padded)?;
        Ok(&data[..len])
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to decode.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_u32() {
        let mut enc = XdrEncoder::new();
        enc.encode_u32(0x12345678);
        let buf = enc.finish();
        assert_eq!(&buf[..], &[0x12, 0x34, 0x56, 0x78]);

        let mut dec = XdrDecoder::new(&buf);
        assert_eq!(dec.decode_u32().unwrap(), 0x12345678);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn test_opaque_fixed_is_padded() {
        let mut enc = XdrEncoder::new();
        enc.encode_opaque_fixed(b"abc");
        let buf = enc.finish();
        assert_eq!(&buf[..], &[b'a', b'b', b'c', 0]);
    }

    #[test]
    fn test_opaque_variable_roundtrip() {
        let mut enc = XdrEncoder::new();
        enc.encode_opaque_variable(b"hello");
        enc.encode_u32(7);
        let buf = enc.finish();
        assert_eq!(buf.len(), 4 + 8 + 4);

        let mut dec = XdrDecoder::new(&buf);
        assert_eq!(dec.decode_opaque_variable(400).unwrap(), b"hello");
        assert_eq!(dec.position(), 12);
        assert_eq!(dec.decode_u32().unwrap(), 7);
    }

    #[test]
    fn test_opaque_over_limit_rejected() {
        let mut enc = XdrEncoder::new();
        enc.encode_opaque_variable(&[0u8; 16]);
        let buf = enc.finish();

        let mut dec = XdrDecoder::new(&buf);
        assert!(matches!(
            dec.decode_opaque_variable(8),
            Err(RpcError::DecodeFailed { .. })
        ));
    }

    #[test]
    fn test_error_truncated_data() {
        let buf = [0x12, 0x34];
        let mut dec = XdrDecoder::new(&buf);
        assert!(dec.decode_u32().is_err());
    }

    #[test]
    fn test_huge_declared_length_does_not_overflow() {
        let buf = [0xff, 0xff, 0xff, 0xff];
        let mut dec = XdrDecoder::new(&buf);
        assert!(dec.decode_opaque_variable(usize::MAX).is_err());
    }
}
