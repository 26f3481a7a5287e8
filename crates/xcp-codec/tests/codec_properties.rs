//! Property-based tests for envelope codecs.
//!
//! The core property: for every built-in codec and every envelope it can
//! represent, decode(encode(e)) == e.

use bytes::Bytes;
use proptest::prelude::*;
use xcp_codec::{
    Attachment, BinaryStructCodec, Ether, EtherCodec, JsonCodec, TensorCodec, Value, ValueMap,
};

/// Strategy for leaf values (finite floats only; NaN is not JSON-encodable
/// and never equals itself).
fn arbitrary_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::I64),
        any::<u64>().prop_map(Value::U64),
        any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(Value::F64),
        "[ -~]{0,32}".prop_map(Value::Str),
        prop::collection::vec(any::<u8>(), 0..64)
            .prop_map(|b| Value::Bytes(Bytes::from(b))),
    ]
}

/// Strategy for values nested up to two levels.
fn arbitrary_value() -> impl Strategy<Value = Value> {
    arbitrary_leaf().prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..4).prop_map(Value::Map),
        ]
    })
}

fn arbitrary_value_map() -> impl Strategy<Value = ValueMap> {
    prop::collection::btree_map("[a-z_]{1,10}", arbitrary_value(), 0..5)
}

/// Strategy for attachments (inline or URI, never both).
fn arbitrary_attachment(index: usize) -> impl Strategy<Value = Attachment> {
    (
        prop::bool::ANY,
        prop::collection::vec(any::<u8>(), 0..32),
        "[a-z/.-]{3,20}",
        any::<u64>(),
    )
        .prop_map(move |(inline, data, media_type, size)| {
            if inline {
                Attachment::inline(format!("att-{index}"), media_type, Bytes::from(data))
            } else {
                Attachment::by_uri(
                    format!("att-{index}"),
                    media_type,
                    format!("shm://ns/blob-{index}#0,{size}"),
                    size,
                )
            }
        })
}

/// Strategy for arbitrary well-formed envelopes.
fn arbitrary_ether() -> impl Strategy<Value = Ether> {
    (
        "[a-z][a-z._-]{0,20}",
        1u32..=u32::MAX,
        arbitrary_value_map(),
        arbitrary_value_map(),
        prop::option::of(arbitrary_value_map()),
        prop::collection::vec(any::<bool>(), 0..3),
    )
        .prop_flat_map(|(kind, schema_version, payload, metadata, extra, attachment_seeds)| {
            let attachments = attachment_seeds
                .iter()
                .enumerate()
                .map(|(i, _)| arbitrary_attachment(i).boxed())
                .collect::<Vec<_>>();
            (
                Just(kind),
                Just(schema_version),
                Just(payload),
                Just(metadata),
                Just(extra),
                attachments,
            )
        })
        .prop_map(|(kind, schema_version, payload, metadata, extra_fields, attachments)| Ether {
            kind,
            schema_version,
            payload,
            metadata,
            extra_fields,
            attachments,
        })
}

#[test]
fn prop_json_round_trip() {
    proptest!(|(ether in arbitrary_ether())| {
        let codec = JsonCodec;
        let bytes = codec.encode(&ether).expect("encode should succeed");

        // Canonical JSON is valid UTF-8 without a BOM.
        let text = std::str::from_utf8(&bytes).expect("JSON must be UTF-8");
        let bom = '\u{FEFF}';
        prop_assert!(!text.starts_with(bom));

        let decoded = codec.decode(&bytes).expect("decode should succeed");
        prop_assert_eq!(decoded, ether);
    });
}

#[test]
fn prop_binary_struct_round_trip() {
    proptest!(|(ether in arbitrary_ether())| {
        let codec = BinaryStructCodec;
        let bytes = codec.encode(&ether).expect("encode should succeed");
        let decoded = codec.decode(&bytes).expect("decode should succeed");
        prop_assert_eq!(decoded, ether);
    });
}

#[test]
fn prop_binary_struct_truncation_rejected() {
    proptest!(|(ether in arbitrary_ether(), cut in any::<prop::sample::Index>())| {
        let codec = BinaryStructCodec;
        let bytes = codec.encode(&ether).expect("encode should succeed");
        let cut = cut.index(bytes.len());
        prop_assume!(cut < bytes.len());

        // PROPERTY: strict prefixes never decode (and never panic).
        prop_assert!(codec.decode(&bytes[..cut]).is_err());
    });
}

#[test]
fn prop_tensor_f32_round_trip() {
    proptest!(|(
        rows in 1u64..8,
        cols in 1u64..8,
        seed in any::<u32>(),
    )| {
        let count = (rows * cols) as usize;
        let mut data = Vec::with_capacity(count * 4);
        for i in 0..count {
            let v = (seed.wrapping_add(i as u32) as f32) / 7.0;
            data.extend_from_slice(&v.to_le_bytes());
        }

        let ether = Ether::new("tensor.f32", 1)
            .expect("valid ether")
            .with_payload("data", data)
            .with_payload(
                "shape",
                Value::List(vec![Value::U64(rows), Value::U64(cols)]),
            );

        let codec = TensorCodec::F32;
        let decoded = codec.decode(&codec.encode(&ether).expect("encode")).expect("decode");
        prop_assert_eq!(decoded, ether);
    });
}

#[test]
fn prop_cross_codec_payload_equivalence() {
    proptest!(|(ether in arbitrary_ether())| {
        // Encoding with JSON and with the binary struct must preserve the
        // same envelope; the two codecs agree on semantics.
        let via_json = JsonCodec.decode(&JsonCodec.encode(&ether).expect("json encode"))
            .expect("json decode");
        let via_binary = BinaryStructCodec
            .decode(&BinaryStructCodec.encode(&ether).expect("binary encode"))
            .expect("binary decode");
        prop_assert_eq!(via_json, via_binary);
    });
}
