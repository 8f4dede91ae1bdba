use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

/// Hash de 256 bits usado para identificar blocos, transações e outros dados
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    /// Creates a zeroed hash
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Creates a hash from a 32-byte array
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the hash
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Computes Keccak-256 hash of the provided data
    #[must_use]
    pub fn keccak256(data: &[u8]) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Self(hash)
    }

    /// Interpreta o hash como inteiro sem sinal big-endian de 256 bits
    ///
    /// Usado na comparação contra o alvo de PoW: um bloco é válido sse
    /// `uint256(hash) <= target`.
    #[must_use]
    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// Decodifica um hash a partir de string hexadecimal (com ou sem `0x`)
    ///
    /// # Errors
    ///
    /// Retorna erro se a string não for hex válido de 32 bytes
    pub fn from_hex(text: &str) -> crate::Result<Self> {
        let stripped = text.strip_prefix("0x").unwrap_or(text);
        let bytes = hex::decode(stripped)
            .map_err(|e| crate::ChainError::SerializationError(e.to_string()))?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            crate::ChainError::SerializationError("hash deve ter 32 bytes".to_string())
        })?;
        Ok(Self(array))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_creation_and_display() {
        let hash = Hash256::zero();
        assert_eq!(
            hash.to_string(),
            "0000000000000000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn test_keccak256_hashing() {
        let data = b"hello world";
        let hash = Hash256::keccak256(data);
        // Dados válidos devem produzir hash não-zero
        assert_ne!(hash, Hash256::zero());

        // Determinístico
        assert_eq!(hash, Hash256::keccak256(data));
    }

    #[test]
    fn test_to_biguint_big_endian() {
        let mut bytes = [0u8; 32];
        bytes[31] = 0x01;
        bytes[30] = 0x02;
        let hash = Hash256::from_bytes(bytes);
        assert_eq!(hash.to_biguint(), BigUint::from(0x0201u32));
    }

    #[test]
    fn test_from_hex_round_trip() {
        let hash = Hash256::keccak256(b"tessera");
        let parsed = Hash256::from_hex(&hash.to_string()).unwrap();
        assert_eq!(hash, parsed);

        let prefixed = Hash256::from_hex(&format!("0x{hash}")).unwrap();
        assert_eq!(hash, prefixed);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(Hash256::from_hex("zz").is_err());
        assert!(Hash256::from_hex("abcd").is_err()); // 2 bytes, não 32
    }
}
