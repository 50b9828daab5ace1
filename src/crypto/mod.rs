//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256 hashing
//! - ECDSA key management and DER signature verification (secp256k1)

pub mod hash;
pub mod keys;

pub use hash::sha256;
pub use keys::{public_key_from_bytes, verify_der, KeyError, KeyPair};
