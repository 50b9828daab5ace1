//! Block header codec
//!
//! Byte layout (integers little-endian):
//!
//! | field                | width | notes                               |
//! |----------------------|-------|-------------------------------------|
//! | version              | 4     |                                     |
//! | timestamp            | 4     | seconds since chain epoch           |
//! | height               | 4     |                                     |
//! | previousBlock        | 8     | big-endian numeric id, zero if none |
//! | numberOfTransactions | 4     |                                     |
//! | totalAmount          | 8     |                                     |
//! | totalFee             | 8     |                                     |
//! | reward               | 8     |                                     |
//! | payloadLength        | 4     |                                     |
//! | payloadHash          | 32    | raw digest                          |
//! | generatorPublicKey   | 33    | compressed secp256k1 key            |
//! | blockSignature       | var   | DER, only when requested            |
//!
//! A full serialization appends one u32 length per transaction followed by the
//! transaction payloads themselves.

use crate::core::block::BlockData;
use crate::crypto::{sha256, verify_der};
use thiserror::Error;

pub const PAYLOAD_HASH_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Header size without the signature
pub const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 4 + 8 + 8 + 8 + 4 + PAYLOAD_HASH_SIZE + PUBLIC_KEY_SIZE;

#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("Invalid hex in {field}")]
    InvalidHex { field: &'static str },
    #[error("{field} must be {expected} bytes, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid block id: {0}")]
    InvalidId(String),
    #[error("Truncated input at offset {0}")]
    Truncated(usize),
    #[error("Expected {expected} transactions, got {actual}")]
    TransactionCount { expected: u32, actual: usize },
    #[error("{0} trailing bytes after block")]
    TrailingBytes(usize),
}

/// A block decoded from its full binary form
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlock {
    pub header: BlockData,
    pub transactions: Vec<Vec<u8>>,
}

fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>, CodecError> {
    hex::decode(value).map_err(|_| CodecError::InvalidHex { field })
}

fn decode_fixed(field: &'static str, value: &str, expected: usize) -> Result<Vec<u8>, CodecError> {
    let bytes = decode_field(field, value)?;
    if bytes.len() != expected {
        return Err(CodecError::InvalidLength {
            field,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Parse a decimal block id into its numeric form
pub fn parse_id(id: &str) -> Result<u64, CodecError> {
    id.parse::<u64>()
        .map_err(|_| CodecError::InvalidId(id.to_string()))
}

/// Serialize the header, appending the signature only when asked
pub fn serialize(block: &BlockData, include_signature: bool) -> Result<Vec<u8>, CodecError> {
    let previous = match block.previous_block.as_deref() {
        Some(id) => parse_id(id)?,
        None => 0,
    };
    let payload_hash = decode_fixed("payloadHash", &block.payload_hash, PAYLOAD_HASH_SIZE)?;
    let public_key = decode_fixed(
        "generatorPublicKey",
        &block.generator_public_key,
        PUBLIC_KEY_SIZE,
    )?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + 72);
    buf.extend_from_slice(&block.version.to_le_bytes());
    buf.extend_from_slice(&block.timestamp.to_le_bytes());
    buf.extend_from_slice(&block.height.to_le_bytes());
    buf.extend_from_slice(&previous.to_be_bytes());
    buf.extend_from_slice(&block.number_of_transactions.to_le_bytes());
    buf.extend_from_slice(&block.total_amount.to_le_bytes());
    buf.extend_from_slice(&block.total_fee.to_le_bytes());
    buf.extend_from_slice(&block.reward.to_le_bytes());
    buf.extend_from_slice(&block.payload_length.to_le_bytes());
    buf.extend_from_slice(&payload_hash);
    buf.extend_from_slice(&public_key);

    if include_signature {
        buf.extend_from_slice(&decode_field("blockSignature", &block.block_signature)?);
    }

    Ok(buf)
}

/// Header plus signature plus length-prefixed transaction payloads
pub fn serialize_full(block: &BlockData, transactions: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
    let mut buf = serialize(block, true)?;
    if transactions.is_empty() {
        return Ok(buf);
    }
    if transactions.len() != block.number_of_transactions as usize {
        return Err(CodecError::TransactionCount {
            expected: block.number_of_transactions,
            actual: transactions.len(),
        });
    }

    for tx in transactions {
        buf.extend_from_slice(&(tx.len() as u32).to_le_bytes());
    }
    for tx in transactions {
        buf.extend_from_slice(tx);
    }
    Ok(buf)
}

/// SHA-256 of the header, with or without the signature
pub fn hash(block: &BlockData, include_signature: bool) -> Result<[u8; 32], CodecError> {
    Ok(sha256(&serialize(block, include_signature)?))
}

/// First 8 digest bytes, reversed, as 16 hex characters
pub fn get_id_hex(block: &BlockData) -> Result<String, CodecError> {
    Ok(format!("{:016x}", id_number(block)?))
}

/// Canonical decimal block id
pub fn get_id(block: &BlockData) -> Result<String, CodecError> {
    Ok(id_number(block)?.to_string())
}

fn id_number(block: &BlockData) -> Result<u64, CodecError> {
    let digest = hash(block, true)?;
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    // reversing the bytes and reading big-endian is a little-endian read
    Ok(u64::from_le_bytes(first))
}

/// Verify `blockSignature` over the unsigned header. Never errors.
pub fn verify_signature(block: &BlockData) -> bool {
    let Ok(digest) = hash(block, false) else {
        return false;
    };
    let Ok(public_key) = hex::decode(&block.generator_public_key) else {
        return false;
    };
    let Ok(signature) = hex::decode(&block.block_signature) else {
        return false;
    };
    verify_der(&public_key, &digest, &signature)
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(CodecError::Truncated(self.offset))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn u64_be(&mut self) -> Result<u64, CodecError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

/// Decode a full block from hex
pub fn deserialize(hex_string: &str) -> Result<DecodedBlock, CodecError> {
    let bytes = decode_field("block", hex_string)?;
    deserialize_bytes(&bytes)
}

/// Decode a full block from raw bytes
pub fn deserialize_bytes(bytes: &[u8]) -> Result<DecodedBlock, CodecError> {
    let mut reader = Reader { bytes, offset: 0 };

    let version = reader.u32()?;
    let timestamp = reader.u32()?;
    let height = reader.u32()?;
    let previous = reader.u64_be()?;
    let number_of_transactions = reader.u32()?;
    let total_amount = reader.u64()?;
    let total_fee = reader.u64()?;
    let reward = reader.u64()?;
    let payload_length = reader.u32()?;
    let payload_hash = hex::encode(reader.take(PAYLOAD_HASH_SIZE)?);
    let generator_public_key = hex::encode(reader.take(PUBLIC_KEY_SIZE)?);

    // DER: 0x30, body length, body
    let block_signature = if reader.remaining() == 0 {
        String::new()
    } else {
        let der_len = *reader
            .bytes
            .get(reader.offset + 1)
            .ok_or(CodecError::Truncated(reader.offset))? as usize;
        hex::encode(reader.take(der_len + 2)?)
    };

    let mut transactions = Vec::new();
    if reader.remaining() > 0 {
        let lengths = (0..number_of_transactions)
            .map(|_| reader.u32())
            .collect::<Result<Vec<_>, _>>()?;
        for len in lengths {
            transactions.push(reader.take(len as usize)?.to_vec());
        }
        if reader.remaining() > 0 {
            return Err(CodecError::TrailingBytes(reader.remaining()));
        }
    }

    let mut header = BlockData {
        id: String::new(),
        version,
        timestamp,
        height,
        previous_block: (previous != 0).then(|| previous.to_string()),
        number_of_transactions,
        total_amount,
        total_fee,
        reward,
        payload_length,
        payload_hash,
        generator_public_key,
        block_signature,
        transactions: Vec::new(),
    };
    header.id = get_id(&header)?;

    Ok(DecodedBlock {
        header,
        transactions,
    })
}
