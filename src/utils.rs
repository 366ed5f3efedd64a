use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Serialize};

const ERR_BINCODE_ENCODE: &str = "error from bincode while serializing model to bytes";
const ERR_BINCODE_DECODE: &str = "error from bincode while deserializing model from bytes";

/// Encode a byte + u64 prefix key.
///
/// This allows for efficient BTree prefix storage without the overhead of allocating additional
/// vectors, strings or other sorts of buffers.
///
/// NOTE: if any data in a tree is encoded with a prefix, then all data in that tree will need
/// to be encoded with a well-defined prefix as well in order to avoid unintended collisions
/// and or data corruption.
pub fn encode_byte_prefix(prefix: &[u8; 1], offset: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = prefix[0];
    key[1..].copy_from_slice(&encode_u64(offset));
    key
}

/// Encode a byte + u32 prefix key, used for merkle leaf addressing.
///
/// See `encode_byte_prefix` for more details.
pub fn encode_byte_prefix_u32(prefix: &[u8; 1], id: u32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = prefix[0];
    key[1..].copy_from_slice(&id.to_be_bytes());
    key
}

/// Encode the given u64 as an array of big-endian bytes.
pub fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u64.
pub fn decode_u64(val: &[u8]) -> Result<u64> {
    match val {
        [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(u64::from_be_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7])),
        _ => bail!("invalid byte array given to decode as u64, invalid len {} needed 8", val.len()),
    }
}

/// Decode the given bytes as a u32.
pub fn decode_u32(val: &[u8]) -> Result<u32> {
    match val {
        [b0, b1, b2, b3] => Ok(u32::from_be_bytes([*b0, *b1, *b2, *b3])),
        _ => bail!("invalid byte array given to decode as u32, invalid len {} needed 4", val.len()),
    }
}

/// Encode the given model using bincode.
pub fn bin_encode<T: Serialize>(model: &T) -> Result<Vec<u8>> {
    bincode::serialize(model).context(ERR_BINCODE_ENCODE)
}

/// Decode the given payload using bincode.
pub fn bin_decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).context(ERR_BINCODE_DECODE)
}

/// Encode the given protobuf message as bytes.
pub fn encode_proto<T: prost::Message>(msg: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf).context("error encoding protobuf message")?;
    Ok(buf)
}

/// Decode a buffer of bytes as a protobuf message.
pub fn decode_proto<T: prost::Message + Default>(buf: &[u8]) -> Result<T> {
    T::decode(buf).context("error decoding protobuf message")
}
