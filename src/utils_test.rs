use anyhow::Result;
use rand::prelude::*;

use crate::utils;

#[test]
fn encode_decode_u64_roundtrip() -> Result<()> {
    let mut rng = rand::thread_rng();
    for _ in 0..1000 {
        let val: u64 = rng.gen();
        let encoded = utils::encode_u64(val);
        let output = utils::decode_u64(&encoded)?;
        assert_eq!(output, val, "expected decoded value {} got {}", val, output);
    }
    Ok(())
}

#[test]
fn decode_u64_rejects_bad_len() {
    let output = utils::decode_u64(&[0u8; 7]);
    assert!(output.is_err(), "expected error decoding 7 byte buffer as u64");
}

#[test]
fn encode_byte_prefix_preserves_order() {
    let prefix = b"e";
    let low = utils::encode_byte_prefix(prefix, 100);
    let high = utils::encode_byte_prefix(prefix, 200);
    assert!(low < high, "expected lexicographic order to match numeric order");
    assert_eq!(low[0], b'e');
}

#[test]
fn encode_byte_prefix_u32_roundtrip() -> Result<()> {
    let key = utils::encode_byte_prefix_u32(&[0u8], 0xdead_beef);
    assert_eq!(key[0], 0);
    let id = utils::decode_u32(&key[1..])?;
    assert_eq!(id, 0xdead_beef);
    Ok(())
}

#[test]
fn bin_encode_decode_roundtrip() -> Result<()> {
    let model = vec![(String::from("a"), 1u64), (String::from("b"), 2u64)];
    let encoded = utils::bin_encode(&model)?;
    let output: Vec<(String, u64)> = utils::bin_decode(&encoded)?;
    assert_eq!(output, model);
    Ok(())
}
