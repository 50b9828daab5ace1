//! ECDSA key management
//!
//! Block generators sign with secp256k1. Signatures travel as DER and public
//! keys in compressed 33-byte form, both hex-encoded on the wire.

use rand::rngs::OsRng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Get the public key as a hex string (compressed format)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Sign a 32-byte digest, returning the DER-encoded signature
    pub fn sign(&self, digest: &[u8; 32]) -> Vec<u8> {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest(*digest);
        secp.sign_ecdsa(&message, &self.secret_key)
            .serialize_der()
            .to_vec()
    }
}

/// Parse a compressed or uncompressed public key from raw bytes
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, KeyError> {
    PublicKey::from_slice(bytes).map_err(|_| KeyError::InvalidPublicKey)
}

/// Verify a DER signature over a 32-byte digest.
///
/// Any malformed input yields `false`. High-S signatures are normalised first,
/// since generators on the network are not required to produce low-S form.
pub fn verify_der(public_key: &[u8], digest: &[u8; 32], signature: &[u8]) -> bool {
    let Ok(public_key) = public_key_from_bytes(public_key) else {
        return false;
    };
    let Ok(mut sig) = Signature::from_der(signature) else {
        return false;
    };
    sig.normalize_s();

    let secp = Secp256k1::verification_only();
    let message = Message::from_digest(*digest);
    secp.verify_ecdsa(&message, &sig, &public_key).is_ok()
}
