//! Block types
//!
//! `BlockData` is the header exactly as it travels between peers. `Block` is
//! the verified, immutable form held in the window: the only way to obtain
//! one is through `Block::new`, which checks the generator signature and that
//! the announced id matches the one derived from the header.

use crate::core::codec::{self, CodecError};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;

/// Block validation errors
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Invalid block signature (id {id}, height {height})")]
    InvalidSignature { id: String, height: u32 },
    #[error("Announced id {announced} does not match header id {computed}")]
    IdMismatch { announced: String, computed: String },
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// A block header as announced by peers.
///
/// Transactions are carried through untouched; this node never interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockData {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub version: u32,
    pub timestamp: u32,
    pub height: u32,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub previous_block: Option<String>,
    pub number_of_transactions: u32,
    #[serde(deserialize_with = "u64_lenient")]
    pub total_amount: u64,
    #[serde(deserialize_with = "u64_lenient")]
    pub total_fee: u64,
    #[serde(deserialize_with = "u64_lenient")]
    pub reward: u64,
    pub payload_length: u32,
    pub payload_hash: String,
    pub generator_public_key: String,
    pub block_signature: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<serde_json::Value>,
}

impl BlockData {
    /// Decimal id derived from the header bytes (not the announced `id`)
    pub fn computed_id(&self) -> Result<String, CodecError> {
        codec::get_id(self)
    }

    /// Whether the generator signature verifies; fails closed
    pub fn verify_signature(&self) -> bool {
        codec::verify_signature(self)
    }
}

/// A block that has passed signature and id verification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Block(BlockData);

impl Block {
    /// Verify `data` and wrap it. Construction is the validation gate.
    pub fn new(data: BlockData) -> Result<Self, BlockError> {
        if !data.verify_signature() {
            return Err(BlockError::InvalidSignature {
                id: data.id,
                height: data.height,
            });
        }
        // The id is not covered by the signature.
        let computed = data.computed_id()?;
        if computed != data.id {
            return Err(BlockError::IdMismatch {
                announced: data.id,
                computed,
            });
        }
        Ok(Self(data))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn height(&self) -> u32 {
        self.0.height
    }

    pub fn timestamp(&self) -> u32 {
        self.0.timestamp
    }

    pub fn previous_block(&self) -> Option<&str> {
        self.0.previous_block.as_deref()
    }

    pub fn block_signature(&self) -> &str {
        &self.0.block_signature
    }

    pub fn number_of_transactions(&self) -> u32 {
        self.0.number_of_transactions
    }

    /// Borrow the underlying header
    pub fn data(&self) -> &BlockData {
        &self.0
    }

    pub fn into_data(self) -> BlockData {
        self.0
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.0.id, self.0.height)
    }
}

// Older peers send numeric fields as strings and ids as numbers.

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(u64),
}

impl StringOrNumber {
    fn into_string(self) -> String {
        match self {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    StringOrNumber::deserialize(deserializer).map(StringOrNumber::into_string)
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<StringOrNumber>::deserialize(deserializer)?
        .map(StringOrNumber::into_string)
        .filter(|s| !s.is_empty()))
}

fn u64_lenient<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Number(n) => Ok(n),
        StringOrNumber::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
