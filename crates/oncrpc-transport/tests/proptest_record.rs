//! Property-based tests for record marking and the duplicate request cache.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use oncrpc_transport::config::DuplicateKeyMode;
use oncrpc_transport::message::{encode_call, CallCodec, RpcMessageCodec};
use oncrpc_transport::record::{FragmentHeader, RecordReader, RecordWriter, MAX_FRAGMENT_LEN};
use oncrpc_transport::DuplicateCache;
use proptest::prelude::*;

/// Records of varied size, empty included.
fn any_records() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..3000), 1..6)
}

/// Feeds `wire` to a reader in chunks whose sizes cycle through `cuts`.
fn reassemble(wire: &[u8], cuts: &[usize]) -> Vec<Bytes> {
    let mut reader = RecordReader::new(1 << 20, 4096);
    let mut out = Vec::new();
    let mut pos = 0;
    let mut i = 0;
    while pos < wire.len() {
        let take = cuts[i % cuts.len()].min(wire.len() - pos);
        reader.extend_input(&wire[pos..pos + take]);
        pos += take;
        i += 1;
        while let Some(record) = reader.next_record().unwrap() {
            out.push(record);
        }
    }
    out
}

proptest! {
    #[test]
    fn test_header_wire_roundtrip(length in 0u32..=MAX_FRAGMENT_LEN, is_last in any::<bool>()) {
        let header = FragmentHeader::new(length, is_last).unwrap();
        prop_assert_eq!(FragmentHeader::from_wire(header.to_wire()), header);
    }

    #[test]
    fn test_oversized_length_is_rejected(length in (MAX_FRAGMENT_LEN + 1)..=u32::MAX) {
        prop_assert!(FragmentHeader::new(length, true).is_err());
    }

    #[test]
    fn test_records_survive_arbitrary_fragmentation_and_chunking(
        records in any_records(),
        fragment in 1usize..700,
        cuts in proptest::collection::vec(1usize..97, 1..8),
    ) {
        let writer = RecordWriter::new(fragment);
        let mut wire = BytesMut::new();
        for record in &records {
            writer.write_record(record, &mut wire).unwrap();
        }
        let got = reassemble(&wire, &cuts);
        prop_assert_eq!(got.len(), records.len());
        for (got, want) in got.iter().zip(&records) {
            prop_assert_eq!(got.as_ref(), want.as_slice());
        }
    }

    #[test]
    fn test_fragment_count_matches_payload(len in 1usize..5000, fragment in 1usize..600) {
        let writer = RecordWriter::new(fragment);
        let mut wire = BytesMut::new();
        let count = writer.write_record(&vec![7u8; len], &mut wire).unwrap();
        prop_assert_eq!(count, len.div_ceil(fragment));
        prop_assert_eq!(wire.len(), len + 4 * count);
    }

    #[test]
    fn test_dup_cache_never_exceeds_capacity(
        capacity in 1usize..16,
        xids in proptest::collection::vec(any::<u32>(), 0..64),
    ) {
        let mut cache = DuplicateCache::new(capacity, DuplicateKeyMode::CallIdentity);
        let client: SocketAddr = "10.0.0.1:700".parse().unwrap();
        for xid in &xids {
            let request = encode_call(*xid, 1, 1, 1, b"");
            let header = RpcMessageCodec.decode_call(&request).unwrap();
            cache.insert(&header, client, &request, Bytes::from_static(b"r"));
            prop_assert!(cache.len() <= capacity);
        }
        // The most recent insertion is always retrievable.
        if let Some(xid) = xids.last() {
            let request = encode_call(*xid, 1, 1, 1, b"");
            let header = RpcMessageCodec.decode_call(&request).unwrap();
            prop_assert!(cache.lookup(&header, client, &request).is_some());
        }
    }
}
