//! Transaction protocol integration tests: the signature survives a full
//! JSON wire roundtrip, every envelope mutation breaks it, and the
//! canonical form is stable.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_json::json;

use collabd::tx::{canonical_timestamp, Op, Tx};

fn signed_tx(key: &SigningKey) -> Tx {
    Tx::build_signed(
        Op::SessionCreate,
        "tx-1",
        Some("s1".into()),
        "nonce-1",
        "2026-03-01T10:00:00.500Z",
        "user:alice",
        &json!({
            "session_id": "s1", "name": "demo",
            "steps": [{"step_id": "k1", "step_key": "draft", "name": "Draft"}]
        }),
        key,
    )
    .unwrap()
}

#[test]
fn signature_survives_wire_roundtrip() {
    let key = SigningKey::generate(&mut OsRng);
    let tx = signed_tx(&key);

    // Leader → raft log → follower: the envelope is serialized and parsed
    // again; the payload must come back byte-identical.
    let wire = serde_json::to_string(&tx).unwrap();
    let parsed: Tx = serde_json::from_str(&wire).unwrap();
    parsed.validate_basic().unwrap();
    parsed.verify().unwrap();
    assert_eq!(parsed.payload.get(), tx.payload.get());
}

#[test]
fn every_envelope_field_is_covered_by_the_signature() {
    let key = SigningKey::generate(&mut OsRng);
    let base = signed_tx(&key);

    let mutations: Vec<Box<dyn Fn(&mut Tx)>> = vec![
        Box::new(|t| t.tx_id = "tx-2".into()),
        Box::new(|t| t.session_id = Some("s2".into())),
        Box::new(|t| t.session_id = None),
        Box::new(|t| t.nonce = "nonce-2".into()),
        Box::new(|t| t.timestamp = "2026-03-01T10:00:01.500Z".into()),
        Box::new(|t| t.actor = "user:bob".into()),
        Box::new(|t| t.op = Op::StepResolve),
        Box::new(|t| {
            t.payload =
                serde_json::value::RawValue::from_string("{\"session_id\":\"s2\"}".into())
                    .unwrap()
        }),
    ];

    for (i, mutate) in mutations.iter().enumerate() {
        let mut tx = base.clone();
        mutate(&mut tx);
        assert!(tx.verify().is_err(), "mutation {i} was not detected");
    }
}

#[test]
fn signing_bytes_are_stable_for_equivalent_timestamps() {
    let key = SigningKey::generate(&mut OsRng);
    let mut a = signed_tx(&key);
    let b = a.clone();

    // Same instant, different rendering: identical canonical bytes.
    a.timestamp = "2026-03-01T11:00:00.500+01:00".into();
    assert_eq!(a.signing_bytes().unwrap(), b.signing_bytes().unwrap());
    a.verify().unwrap();
}

#[test]
fn canonical_timestamp_normalizes_offsets_and_precision() {
    assert_eq!(
        canonical_timestamp("2026-03-01T10:00:00Z").unwrap(),
        "2026-03-01T10:00:00.000Z"
    );
    assert_eq!(
        canonical_timestamp("2026-03-01T12:30:00.25+02:30").unwrap(),
        "2026-03-01T10:00:00.250Z"
    );
    assert!(canonical_timestamp("yesterday").is_err());
}

#[test]
fn malformed_keys_and_signatures_are_rejected_by_size() {
    let key = SigningKey::generate(&mut OsRng);

    let mut short_key = signed_tx(&key);
    short_key.public_key = BASE64.encode([1u8; 31]);
    assert!(short_key.verify().unwrap_err().message.contains("32 bytes"));

    let mut short_sig = signed_tx(&key);
    short_sig.signature = BASE64.encode([1u8; 63]);
    assert!(short_sig.verify().unwrap_err().message.contains("64 bytes"));

    let mut not_b64 = signed_tx(&key);
    not_b64.signature = "!!!not-base64!!!".into();
    assert!(not_b64.verify().is_err());
}

#[test]
fn unsigned_envelope_fails_basic_validation() {
    let raw = json!({
        "tx_id": "t1", "nonce": "n1", "timestamp": "2026-03-01T10:00:00Z",
        "actor": "user:alice", "op": "STEP_RELEASE",
        "payload": {"step_id": "k1", "participant_id": "p1"},
        "public_key": "", "signature": ""
    });
    let tx: Tx = serde_json::from_value(raw).unwrap();
    let err = tx.validate_basic().unwrap_err();
    assert!(err.message.contains("signature"));
}
