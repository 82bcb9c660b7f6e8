//! Record marking (RFC 5531 section 11).
//!
//! A logical message travels over a byte stream as one or more fragments.
//! Each fragment starts with a 4-byte big-endian header whose top bit marks
//! the last fragment of the record and whose low 31 bits carry the payload
//! length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use crate::io::StreamIo;

/// Size of a fragment header on the wire.
pub const HEADER_LEN: usize = 4;
/// Last-fragment flag (bit 31 of the header).
pub const LAST_FRAGMENT: u32 = 0x8000_0000;
/// Largest payload length expressible in a header.
pub const MAX_FRAGMENT_LEN: u32 = 0x7fff_ffff;

/// Decoded fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Payload bytes following the header.
    pub length: u32,
    /// Whether this fragment terminates its record.
    pub is_last: bool,
}

impl FragmentHeader {
    /// Builds a header, rejecting lengths that do not fit in 31 bits.
    pub fn new(length: u32, is_last: bool) -> Result<Self> {
        if length > MAX_FRAGMENT_LEN {
            return Err(RpcError::protocol(format!(
                "fragment length {} does not fit in 31 bits",
                length
            )));
        }
        Ok(Self { length, is_last })
    }

    /// Splits raw header bytes without any validation.
    pub fn from_wire(bytes: [u8; 4]) -> Self {
        let raw = u32::from_be_bytes(bytes);
        Self {
            length: raw & MAX_FRAGMENT_LEN,
            is_last: raw & LAST_FRAGMENT != 0,
        }
    }

    /// Header bytes as they appear on the wire.
    pub fn to_wire(self) -> [u8; 4] {
        let flag = if self.is_last { LAST_FRAGMENT } else { 0 };
        (flag | (self.length & MAX_FRAGMENT_LEN)).to_be_bytes()
    }

    /// Rejects the zero-length non-terminal fragment, the one header that can
    /// be positively identified as bogus.
    pub fn validate(self) -> Result<Self> {
        if self.length == 0 && !self.is_last {
            return Err(RpcError::protocol("zero-length non-terminal fragment"));
        }
        Ok(self)
    }
}

/// Encodes a fragment header.
pub fn encode_header(length: u32, is_last: bool) -> Result<[u8; 4]> {
    Ok(FragmentHeader::new(length, is_last)?.to_wire())
}

/// Decodes and validates a fragment header.
pub fn decode_header(bytes: [u8; 4]) -> Result<FragmentHeader> {
    FragmentHeader::from_wire(bytes).validate()
}

/// Splits outgoing records into fragments.
#[derive(Debug, Clone, Copy)]
pub struct RecordWriter {
    max_fragment: usize,
}

impl RecordWriter {
    /// Creates a writer emitting fragments of at most `max_fragment` payload
    /// bytes.
    pub fn new(max_fragment: usize) -> Self {
        Self {
            max_fragment: max_fragment.clamp(1, MAX_FRAGMENT_LEN as usize),
        }
    }

    /// Creates a writer sized from the configured send buffer.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.fragment_payload_size())
    }

    /// Largest payload per fragment.
    pub fn max_fragment(&self) -> usize {
        self.max_fragment
    }

    /// Appends `record` to `out` as a run of fragments, the final one marked
    /// last. An empty record becomes a single empty terminating fragment.
    /// Returns the number of fragments written.
    pub fn write_record(&self, record: &[u8], out: &mut BytesMut) -> Result<usize> {
        if record.is_empty() {
            out.put_slice(&encode_header(0, true)?);
            return Ok(1);
        }
        out.reserve(record.len() + HEADER_LEN * record.len().div_ceil(self.max_fragment));
        let mut chunks = record.chunks(self.max_fragment).peekable();
        let mut count = 0;
        while let Some(chunk) = chunks.next() {
            let is_last = chunks.peek().is_none();
            out.put_slice(&encode_header(chunk.len() as u32, is_last)?);
            out.put_slice(chunk);
            count += 1;
        }
        Ok(count)
    }

    /// Convenience wrapper returning the framed bytes of a single record.
    pub fn encode(&self, record: &[u8]) -> Result<Bytes> {
        let mut out = BytesMut::new();
        self.write_record(record, &mut out)?;
        Ok(out.freeze())
    }
}

/// Where the reassembly state machine stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Collecting the 4 header bytes of the next fragment.
    AwaitingHeader {
        /// Header bytes received so far.
        partial: [u8; 4],
        /// How many of `partial` are valid.
        have: usize,
    },
    /// Copying fragment payload into the record.
    ReadingBody {
        /// Payload bytes still expected for this fragment.
        remaining: usize,
        /// Whether this fragment ends the record.
        is_last: bool,
    },
}

impl ReadState {
    const START: ReadState = ReadState::AwaitingHeader {
        partial: [0; 4],
        have: 0,
    };
}

/// Reassembles records from a byte stream, tolerating arbitrary splits of
/// headers and payload across reads.
pub struct RecordReader {
    state: ReadState,
    record: BytesMut,
    input: BytesMut,
    scratch: Vec<u8>,
    max_record_size: usize,
}

impl RecordReader {
    /// Creates a reader that refuses records larger than `max_record_size`
    /// and requests `read_chunk` bytes per socket read.
    pub fn new(max_record_size: usize, read_chunk: usize) -> Self {
        Self {
            state: ReadState::START,
            record: BytesMut::new(),
            input: BytesMut::new(),
            scratch: vec![0; read_chunk.max(HEADER_LEN)],
            max_record_size,
        }
    }

    /// Creates a reader from transport configuration.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.max_record_size, config.read_chunk_size())
    }

    /// Current state of the state machine.
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Payload bytes of the record being assembled.
    pub fn partial_len(&self) -> usize {
        self.record.len()
    }

    /// Returns `true` if bytes beyond the last returned record are buffered.
    pub fn has_buffered_input(&self) -> bool {
        !self.input.is_empty()
    }

    /// Returns `true` if no part of a record has been received.
    pub fn at_record_boundary(&self) -> bool {
        self.state == ReadState::START && self.record.is_empty() && self.input.is_empty()
    }

    /// Drops any partially received record and buffered input.
    pub fn reset(&mut self) {
        self.state = ReadState::START;
        self.record.clear();
        self.input.clear();
    }

    /// Feeds bytes obtained out of band (for instance from a readiness
    /// driven read elsewhere).
    pub fn extend_input(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
    }

    /// Advances the state machine over buffered input only. Returns a record
    /// once its last fragment has been consumed.
    pub fn next_record(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                ReadState::AwaitingHeader { mut partial, have } => {
                    let take = (HEADER_LEN - have).min(self.input.len());
                    if take == 0 {
                        return Ok(None);
                    }
                    partial[have..have + take].copy_from_slice(&self.input[..take]);
                    self.input.advance(take);
                    let have = have + take;
                    if have < HEADER_LEN {
                        self.state = ReadState::AwaitingHeader { partial, have };
                        return Ok(None);
                    }
                    self.state = ReadState::START;

                    let header = decode_header(partial)?;
                    let length = header.length as usize;
                    if self.record.len().saturating_add(length) > self.max_record_size {
                        return Err(RpcError::protocol(format!(
                            "record of at least {} bytes exceeds limit {}",
                            self.record.len().saturating_add(length),
                            self.max_record_size
                        )));
                    }
                    trace!(length, is_last = header.is_last, "fragment header");
                    if length == 0 {
                        // Only an empty terminator gets here.
                        return Ok(Some(self.record.split().freeze()));
                    }
                    self.record.reserve(length);
                    self.state = ReadState::ReadingBody {
                        remaining: length,
                        is_last: header.is_last,
                    };
                }
                ReadState::ReadingBody { remaining, is_last } => {
                    let take = remaining.min(self.input.len());
                    if take == 0 {
                        return Ok(None);
                    }
                    self.record.extend_from_slice(&self.input[..take]);
                    self.input.advance(take);
                    let remaining = remaining - take;
                    if remaining > 0 {
                        self.state = ReadState::ReadingBody { remaining, is_last };
                        return Ok(None);
                    }
                    self.state = ReadState::START;
                    if is_last {
                        return Ok(Some(self.record.split().freeze()));
                    }
                }
            }
        }
    }

    /// Reads from `io` until a record completes or the stream would block.
    ///
    /// `Ok(None)` means would-block; everything read so far is kept and the
    /// next call resumes where this one stopped. End of stream at a record
    /// boundary is `Disconnected`, inside a fragment header a protocol
    /// violation, and inside a payload `ConnectionReset`.
    pub fn poll_record<I: StreamIo + ?Sized>(&mut self, io: &mut I) -> Result<Option<Bytes>> {
        loop {
            if let Some(record) = self.next_record()? {
                return Ok(Some(record));
            }
            match io.read_some(&mut self.scratch) {
                Ok(0) => return Err(self.eof_error()),
                Ok(n) => self.input.extend_from_slice(&self.scratch[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(RpcError::Io(e)),
            }
        }
    }

    fn eof_error(&self) -> RpcError {
        match self.state {
            _ if self.at_record_boundary() => RpcError::Disconnected,
            ReadState::AwaitingHeader { have, .. } if have > 0 => {
                RpcError::protocol(format!("truncated fragment header ({} of 4 bytes)", have))
            }
            _ => RpcError::ConnectionReset,
        }
    }
}

impl std::fmt::Debug for RecordReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordReader")
            .field("state", &self.state)
            .field("partial_len", &self.record.len())
            .field("buffered", &self.input.len())
            .field("max_record_size", &self.max_record_size)
            .finish()
    }
}
