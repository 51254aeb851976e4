//! Fixed vectors for cross-implementation validation
//!
//! These bytes pin the discovery key derivation and the envelope layout. A
//! change here is a wire-compatibility break and needs a protocol version bump.

use crate::crypto::derive_discovery_key;
use crate::protocol::{decode, encode, Envelope, Heartbeat, Payload};
use crate::types::*;

const CLAWVERSE_V1_KEY_HEX: &str =
    "de785811d8f0fb8301a57fd3cb564815987b68b997d3a94675884dc6b1aa8c94";

#[test]
fn discovery_key_vector() {
    let key = derive_discovery_key("clawverse-v1");
    assert_eq!(hex::encode(key.as_bytes()), CLAWVERSE_V1_KEY_HEX);
    assert_eq!(key.to_string(), CLAWVERSE_V1_KEY_HEX);
}

#[test]
fn sync_envelope_layout() {
    let bytes = encode(&Envelope::sync(vec![0xaa, 0xbb])).unwrap();
    // version=1, kind=2, body len=3, body = [len=2, 0xaa, 0xbb]
    assert_eq!(bytes, vec![0x01, 0x02, 0x03, 0x02, 0xaa, 0xbb]);
}

#[test]
fn private_message_envelope_layout() {
    let envelope = Envelope::private_message(PeerId::new("a"), PeerId::new("b"), "hi");
    let bytes = encode(&envelope).unwrap();
    // version=1, kind=4, body len=7, body = "a" "b" "hi" as length-prefixed strings
    assert_eq!(
        bytes,
        vec![0x01, 0x04, 0x07, 0x01, b'a', 0x01, b'b', 0x02, b'h', b'i']
    );
    assert_eq!(decode(&bytes).unwrap(), envelope);
}

#[test]
fn heartbeat_envelope_prefix() {
    let hb = Heartbeat::new(
        PeerId::new("abc123"),
        LoadSample {
            cpu_usage: 10.0,
            ram_usage: 20.0,
        },
        Position::new(1.0, 2.0),
        Mood::Idle,
        1,
    );
    let bytes = encode(&Envelope::heartbeat(hb.clone())).unwrap();
    assert_eq!(&bytes[..2], &[0x01, 0x01]);
    // body: peer_id string first
    assert_eq!(&bytes[3..10], b"\x06abc123");
    // f64 fields are little-endian IEEE-754
    assert_eq!(&bytes[10..18], &10.0f64.to_le_bytes());
    assert_eq!(decode(&bytes).unwrap().payload, Some(Payload::Heartbeat(hb)));
}
