pub mod amount;
pub mod breaker;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod types;

// Re-exports principais
pub use amount::{Amount, Ratio};
pub use breaker::{BreakerStatus, CircuitBreaker, RetryPolicy};
pub use crypto::{
    public_key_from_bytes, sign_message, signature_from_bytes, verify_message_signature, KeyPair,
    PrivateKey, PublicKey, Signature, SignatureAlgorithm,
};
pub use error::ChainError;
pub use hash::Hash256;
pub use types::{
    Address, BlockHeight, ChainId, NetworkType, Nonce, OutPoint, PeriodId, Timestamp, TxId,
};

pub type Result<T> = std::result::Result<T, ChainError>;
