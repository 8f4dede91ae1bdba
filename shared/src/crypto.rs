//! Módulo de Criptografia Pós-Quântica da Tessera
//!
//! Implementação concreta do esquema de assinatura do nó (ML-DSA).
//! Blocos, transações e votos assinam bytes canônicos através destas
//! primitivas.

use crate::{ChainError, Hash256, Result};
use chrono::{DateTime, Utc};
use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{
    PublicKey as PQCPublicKeyTrait, SecretKey as PQCSecretKeyTrait, SignedMessage,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Algoritmos de assinatura suportados
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    MLDSA65,
}

/// Chave pública ML-DSA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    key_data: Vec<u8>,
    algorithm: SignatureAlgorithm,
}

/// Chave privada ML-DSA
#[derive(Debug, Clone)]
pub struct PrivateKey {
    key_data: Vec<u8>,
    algorithm: SignatureAlgorithm,
}

/// Par de chaves ML-DSA
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

/// Assinatura digital pós-quântica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    data: Vec<u8>,
    public_key: PublicKey,
    algorithm: SignatureAlgorithm,
    timestamp: DateTime<Utc>,
}

impl PublicKey {
    /// Cria uma chave pública a partir de bytes
    ///
    /// # Errors
    ///
    /// Retorna erro se os bytes não representarem uma chave válida
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ChainError::CryptographicError(
                "Chave pública vazia".to_string(),
            ));
        }
        Ok(Self {
            key_data: bytes,
            algorithm: SignatureAlgorithm::MLDSA65,
        })
    }

    /// Returns the raw bytes of the public key
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the signature algorithm used by this key
    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// Endereço derivado da chave pública (Keccak-256 dos bytes da chave)
    #[must_use]
    pub fn address(&self) -> Hash256 {
        Hash256::keccak256(&self.key_data)
    }

    fn to_pqc_public_key(&self) -> Result<dilithium5::PublicKey> {
        dilithium5::PublicKey::from_bytes(&self.key_data)
            .map_err(|_| ChainError::CryptographicError("Chave pública malformada".to_string()))
    }
}

impl PrivateKey {
    /// Creates a `PrivateKey` from raw bytes
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are invalid for the algorithm
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ChainError::CryptographicError(
                "Chave privada vazia".to_string(),
            ));
        }
        Ok(Self {
            key_data: bytes,
            algorithm: SignatureAlgorithm::MLDSA65,
        })
    }

    /// Returns the raw bytes of the private key
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the signature algorithm used by this key
    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    fn to_pqc_secret_key(&self) -> Result<dilithium5::SecretKey> {
        dilithium5::SecretKey::from_bytes(&self.key_data)
            .map_err(|_| ChainError::CryptographicError("Chave privada malformada".to_string()))
    }
}

impl KeyPair {
    /// Generates a new keypair for ML-DSA-65
    ///
    /// # Errors
    ///
    /// Returns error if key generation fails
    pub fn generate() -> Result<Self> {
        let (public_key_bytes, secret_key_bytes) = dilithium5::keypair();

        let public_key = PublicKey::from_bytes(public_key_bytes.as_bytes().to_vec())?;
        let private_key = PrivateKey::from_bytes(secret_key_bytes.as_bytes().to_vec())?;

        Ok(Self {
            public_key,
            private_key,
        })
    }

    /// Signs a message using the private key
    ///
    /// # Errors
    ///
    /// Returns error if signing fails
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let secret_key = self.private_key.to_pqc_secret_key()?;
        let signed_message = dilithium5::sign(message, &secret_key);

        Ok(Signature {
            data: signed_message.as_bytes().to_vec(),
            public_key: self.public_key.clone(),
            algorithm: SignatureAlgorithm::MLDSA65,
            timestamp: Utc::now(),
        })
    }

    /// Endereço do par de chaves (derivado da chave pública)
    #[must_use]
    pub fn address(&self) -> Hash256 {
        self.public_key.address()
    }
}

impl Signature {
    /// Verifies the signature against a message
    ///
    /// # Errors
    ///
    /// Returns error if the embedded public key is malformed
    pub fn verify(&self, message: &[u8]) -> Result<bool> {
        let public_key = self.public_key.to_pqc_public_key()?;
        let signed_message =
            SignedMessage::from_bytes(&self.data).map_err(|_| ChainError::InvalidSignature)?;

        dilithium5::open(&signed_message, &public_key).map_or(Ok(false), |verified_message| {
            Ok(verified_message == message)
        })
    }

    /// Returns the public key used for verification
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Returns the signature algorithm
    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// Returns the timestamp when the signature was created
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the size in bytes of this signature
    #[must_use]
    pub const fn size(&self) -> usize {
        self.data.len()
    }
}

impl Zeroize for PrivateKey {
    fn zeroize(&mut self) {
        self.key_data.zeroize();
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Assina bytes canônicos com o par de chaves fornecido
///
/// # Errors
///
/// Retorna erro se a assinatura falhar
pub fn sign_message(message: &[u8], keypair: &KeyPair) -> Result<Signature> {
    keypair.sign(message)
}

/// Verifica uma assinatura contra bytes canônicos
///
/// # Errors
///
/// Retorna erro se a verificação falhar
pub fn verify_message_signature(message: &[u8], signature: &Signature) -> Result<bool> {
    signature.verify(message)
}

/// Creates a public key from raw bytes
///
/// # Errors
///
/// Returns error if the bytes are invalid
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_bytes(bytes.to_vec())
}

/// Creates a signature from raw components
#[must_use]
pub const fn signature_from_bytes(
    signature_data: Vec<u8>,
    public_key: PublicKey,
    timestamp: DateTime<Utc>,
) -> Signature {
    Signature {
        data: signature_data,
        public_key,
        algorithm: SignatureAlgorithm::MLDSA65,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate().unwrap();
        let message = b"Tessera - hybrid consensus blockchain";

        let signature = keypair.sign(message).unwrap();
        assert!(signature.verify(message).unwrap());
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let keypair = KeyPair::generate().unwrap();
        let signature = keypair.sign(b"original").unwrap();

        assert!(!signature.verify(b"tampered").unwrap());
    }

    #[test]
    fn test_address_derivation_is_stable() {
        let keypair = KeyPair::generate().unwrap();
        assert_eq!(keypair.address(), keypair.public_key.address());
        assert_ne!(keypair.address(), Hash256::zero());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(PublicKey::from_bytes(vec![]).is_err());
        assert!(PrivateKey::from_bytes(vec![]).is_err());
    }

    #[test]
    fn test_free_helpers_round_trip() {
        let keypair = KeyPair::generate().unwrap();
        let payload = Hash256::keccak256(b"payload");

        let signature = sign_message(payload.as_bytes(), &keypair).unwrap();
        assert!(verify_message_signature(payload.as_bytes(), &signature).unwrap());

        let rebuilt = public_key_from_bytes(keypair.public_key.as_bytes()).unwrap();
        assert_eq!(rebuilt, keypair.public_key);
    }
}
