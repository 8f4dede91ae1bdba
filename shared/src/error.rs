use thiserror::Error;

/// Erros da blockchain Tessera
///
/// Cada variante corresponde a uma tag de erro observável pelo chamador.
/// A classificação de retry (`is_retryable`) decide o que o laço de
/// backoff pode repetir.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Bloco inválido: {0}")]
    InvalidBlock(String),

    #[error("Transação inválida: {0}")]
    InvalidTransaction(String),

    #[error("Voto inválido: {0}")]
    InvalidVote(String),

    #[error("Assinatura inválida")]
    InvalidSignature,

    #[error("Merkle root inválida: esperada {expected}, calculada {actual}")]
    InvalidMerkle { expected: String, actual: String },

    #[error("Valor inválido: {0}")]
    InvalidAmount(String),

    #[error("Nonce inválido: esperado {expected}, recebido {actual}")]
    InvalidNonce { expected: u64, actual: u64 },

    #[error("Timestamp inválido: {0}")]
    InvalidTimestamp(String),

    #[error("Gasto duplo detectado: {0}")]
    DoubleSpend(String),

    #[error("Profundidade de fork excedida: {depth} > {max}")]
    ForkDepthExceeded { depth: u64, max: u64 },

    #[error("Timeout na resolução de fork")]
    ForkResolutionTimeout,

    #[error("PoW insuficiente para fork sem período de votação ativo")]
    InsufficientPowForFork,

    #[error("Circuit breaker aberto: {0}")]
    CircuitOpen(String),

    #[error("Requisição descartada por rate limit")]
    RateLimited,

    #[error("Erro transitório de armazenamento: {0}")]
    StoreTransient(String),

    #[error("Erro fatal de armazenamento: {0}")]
    StoreFatal(String),

    #[error("Timeout em {0}")]
    Timeout(String),

    #[error("Estado do nó não saudável: {0}")]
    UnhealthyState(String),

    #[error("Falha ao anexar bloco: {0}")]
    AppendFailed(String),

    #[error("UTXO não encontrado")]
    UtxoNotFound,

    #[error("Fundos insuficientes")]
    InsufficientFunds,

    #[error("Nonce de mineração não encontrado")]
    NonceNotFound,

    #[error("Erro criptográfico: {0}")]
    CryptographicError(String),

    #[error("Erro de serialização: {0}")]
    SerializationError(String),
}

impl ChainError {
    /// Tag curta do erro, usada em logs e métricas
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::InvalidBlock(_) => "invalid_block",
            Self::InvalidTransaction(_) => "invalid_transaction",
            Self::InvalidVote(_) => "invalid_vote",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidMerkle { .. } => "invalid_merkle",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidNonce { .. } => "invalid_nonce",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::DoubleSpend(_) => "double_spend",
            Self::ForkDepthExceeded { .. } => "fork_depth_exceeded",
            Self::ForkResolutionTimeout => "fork_resolution_timeout",
            Self::InsufficientPowForFork => "insufficient_pow_for_fork",
            Self::CircuitOpen(_) => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::StoreTransient(_) => "store_transient",
            Self::StoreFatal(_) => "store_fatal",
            Self::Timeout(_) => "timeout",
            Self::UnhealthyState(_) => "unhealthy_state",
            Self::AppendFailed(_) => "append_failed",
            Self::UtxoNotFound => "utxo_not_found",
            Self::InsufficientFunds => "insufficient_funds",
            Self::NonceNotFound => "nonce_not_found",
            Self::CryptographicError(_) => "cryptographic_error",
            Self::SerializationError(_) => "serialization_error",
        }
    }

    /// Erros que o laço de retry pode repetir com backoff.
    ///
    /// `CircuitOpen` não é retryable: o chamador deve esperar o
    /// `reset_timeout` do breaker, não insistir.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreTransient(_) | Self::Timeout(_) | Self::NonceNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_tags() {
        assert_eq!(ChainError::UtxoNotFound.tag(), "utxo_not_found");
        assert_eq!(
            ChainError::DoubleSpend("outpoint".to_string()).tag(),
            "double_spend"
        );
        assert_eq!(
            ChainError::ForkDepthExceeded { depth: 120, max: 100 }.tag(),
            "fork_depth_exceeded"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(ChainError::StoreTransient("io".to_string()).is_retryable());
        assert!(ChainError::Timeout("append".to_string()).is_retryable());
        assert!(!ChainError::StoreFatal("corrupt".to_string()).is_retryable());
        assert!(!ChainError::CircuitOpen("consensus".to_string()).is_retryable());
        assert!(!ChainError::InvalidSignature.is_retryable());
    }
}
