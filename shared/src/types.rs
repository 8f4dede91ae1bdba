//! Tipos compartilhados entre módulos da Tessera

use serde::{Deserialize, Serialize};

/// Alias para identificador único de transação
pub type TxId = crate::Hash256;

/// Alias para identificador único de bloco
pub type BlockId = crate::Hash256;

/// Endereço derivado de chave pública (Keccak-256 da chave)
pub type Address = crate::Hash256;

/// Identificador de uma cadeia competidora (hash do primeiro bloco do ramo)
pub type ChainId = crate::Hash256;

/// Alias para timestamp Unix em milissegundos
pub type Timestamp = i64;

/// Alias para altura do bloco na blockchain
pub type BlockHeight = u64;

/// Contador monotônico por remetente
pub type Nonce = u64;

/// Identificador de período de votação
pub type PeriodId = u64;

/// Referência a uma saída de transação (UTXO)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Hash da transação que contém a saída
    pub txid: TxId,
    /// Índice da saída na transação
    pub vout: u32,
}

impl OutPoint {
    /// Creates a new transaction output reference
    #[must_use]
    pub const fn new(txid: TxId, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// Network configurations for different environments
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    /// Main production network
    Mainnet,
    /// Test network
    Testnet,
    /// Local development network
    #[default]
    Devnet,
    /// Regression network for testing
    Regtest,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hash256;

    #[test]
    fn test_outpoint_creation() {
        let txid = Hash256::zero();
        let outpoint = OutPoint::new(txid, 3);

        assert_eq!(outpoint.txid, txid);
        assert_eq!(outpoint.vout, 3);
    }

    #[test]
    fn test_outpoint_display() {
        let outpoint = OutPoint::new(Hash256::zero(), 0);
        assert!(outpoint.to_string().ends_with(":0"));
    }
}
