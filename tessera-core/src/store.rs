//! Abstração do armazenamento transacional
//!
//! O motor chave-valor persistente é um colaborador externo; o núcleo
//! enxerga apenas esta interface com transações atômicas e snapshots.
//! `MemoryStore` é a implementação de referência usada por testes e
//! pelo nó standalone.

use crate::block::Block;
use crate::transaction::Transaction;
use crate::utxo::Utxo;
use crate::vote::{Vote, VotingPeriod};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::{Address, ChainError, Hash256, OutPoint, Result, Timestamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Registro do estado da cadeia ativa
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStateRecord {
    pub height: u64,
    pub last_block_hash: Hash256,
    pub timestamp: Timestamp,
}

/// Solução de PoW encontrada por um minerador local
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowSolutionRecord {
    pub block_hash: Hash256,
    pub height: u64,
    pub nonce: u64,
    pub found_at: Timestamp,
}

/// Layout de chaves do armazenamento
pub mod keys {
    use shared::{Address, Hash256, OutPoint};

    #[must_use]
    pub fn block(hash: &Hash256) -> String {
        format!("block:{hash}")
    }

    #[must_use]
    pub fn block_by_height(height: u64) -> String {
        format!("block_by_height:{height}")
    }

    #[must_use]
    pub fn chain_state() -> String {
        "chain_state".to_string()
    }

    #[must_use]
    pub fn utxo(outpoint: &OutPoint) -> String {
        format!("utxo:{}:{}", outpoint.txid, outpoint.vout)
    }

    #[must_use]
    pub fn utxos_by_address(address: &Address) -> String {
        format!("utxos_by_address:{address}")
    }

    #[must_use]
    pub fn transaction(id: &Hash256) -> String {
        format!("tx:{id}")
    }

    #[must_use]
    pub fn nonce(sender: &Address) -> String {
        format!("nonce:{sender}")
    }

    #[must_use]
    pub fn vote(block_hash: &Hash256, voter: &Address) -> String {
        format!("vote:{block_hash}:{voter}")
    }

    #[must_use]
    pub fn voting_period(id: u64) -> String {
        format!("voting_period:{id}")
    }

    #[must_use]
    pub fn pow_solution(miner: &Address, timestamp: i64) -> String {
        format!("pow_solution:{miner}:{timestamp}")
    }
}

/// Transação de escrita; efeitos só aparecem após `commit`
pub trait StoreTxn: Send {
    fn put(&mut self, key: &str, value: Vec<u8>);
    fn delete(&mut self, key: &str);

    /// Aplica todas as escritas atomicamente
    ///
    /// # Errors
    ///
    /// Retorna `StoreTransient`/`StoreFatal` conforme a natureza da falha
    fn commit(self: Box<Self>) -> Result<()>;

    /// Descarta todas as escritas pendentes
    fn rollback(self: Box<Self>);
}

/// Identificador de snapshot
pub type SnapshotId = u64;

/// Armazenamento transacional chave-valor
pub trait ChainStore: Send + Sync {
    /// Leitura pontual
    ///
    /// # Errors
    ///
    /// Retorna erro de armazenamento em falha de I/O
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Abre uma transação de escrita
    ///
    /// # Errors
    ///
    /// Retorna erro de armazenamento se a transação não puder abrir
    fn begin(&self) -> Result<Box<dyn StoreTxn>>;

    /// Captura um snapshot do estado completo
    ///
    /// # Errors
    ///
    /// Retorna erro de armazenamento em falha
    fn snapshot(&self) -> Result<SnapshotId>;

    /// Restaura o estado de um snapshot
    ///
    /// # Errors
    ///
    /// Retorna `StoreFatal` se o snapshot não existir
    fn restore_snapshot(&self, id: SnapshotId) -> Result<()>;

    /// Libera um snapshot sem restaurar
    fn drop_snapshot(&self, id: SnapshotId);
}

/// Helpers tipados sobre qualquer `ChainStore`
pub trait StoreExt: ChainStore {
    /// Lê e decodifica um valor JSON
    ///
    /// # Errors
    ///
    /// Retorna `StoreFatal` se o valor existir mas não decodificar
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ChainError::StoreFatal(format!("valor corrompido em {key}: {e}"))),
        }
    }

    /// Bloco por hash
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        self.get_json(&keys::block(hash))
    }

    /// Bloco por altura
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        match self.get_json::<Hash256>(&keys::block_by_height(height))? {
            None => Ok(None),
            Some(hash) => self.get_block(&hash),
        }
    }

    /// Estado da cadeia ativa
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    fn get_chain_state(&self) -> Result<Option<ChainStateRecord>> {
        self.get_json(&keys::chain_state())
    }

    /// Próximo nonce confirmado de um remetente
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    fn get_nonce(&self, sender: &Address) -> Result<u64> {
        Ok(self.get_json(&keys::nonce(sender))?.unwrap_or(0))
    }

    /// Transação confirmada por id
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    fn get_transaction(&self, id: &Hash256) -> Result<Option<Transaction>> {
        self.get_json(&keys::transaction(id))
    }

    /// UTXO persistida
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        self.get_json(&keys::utxo(outpoint))
    }

    /// Voto persistido
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    fn get_vote(&self, block_hash: &Hash256, voter: &Address) -> Result<Option<Vote>> {
        self.get_json(&keys::vote(block_hash, voter))
    }

    /// Período de votação persistido
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    fn get_voting_period(&self, id: u64) -> Result<Option<VotingPeriod>> {
        self.get_json(&keys::voting_period(id))
    }
}

impl<S: ChainStore + ?Sized> StoreExt for S {}

/// Codifica um valor para escrita em transação
///
/// # Errors
///
/// Retorna `SerializationError` se a codificação falhar
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ChainError::SerializationError(e.to_string()))
}

type Kv = HashMap<String, Vec<u8>>;

/// Implementação de referência em memória
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<Kv>>,
    snapshots: Mutex<HashMap<SnapshotId, Kv>>,
    next_snapshot: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryTxn {
    data: Arc<RwLock<Kv>>,
    writes: Vec<(String, Option<Vec<u8>>)>,
}

impl StoreTxn for MemoryTxn {
    fn put(&mut self, key: &str, value: Vec<u8>) {
        self.writes.push((key.to_string(), Some(value)));
    }

    fn delete(&mut self, key: &str) {
        self.writes.push((key.to_string(), None));
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|_| ChainError::StoreFatal("lock do store envenenado".to_string()))?;
        for (key, value) in self.writes {
            match value {
                Some(bytes) => {
                    data.insert(key, bytes);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        // Escritas nunca tocaram o mapa; nada a desfazer
    }
}

impl ChainStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self
            .data
            .read()
            .map_err(|_| ChainError::StoreFatal("lock do store envenenado".to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn begin(&self) -> Result<Box<dyn StoreTxn>> {
        Ok(Box::new(MemoryTxn {
            data: Arc::clone(&self.data),
            writes: Vec::new(),
        }))
    }

    fn snapshot(&self) -> Result<SnapshotId> {
        let data = self
            .data
            .read()
            .map_err(|_| ChainError::StoreFatal("lock do store envenenado".to_string()))?;
        let id = self.next_snapshot.fetch_add(1, Ordering::SeqCst);
        self.snapshots
            .lock()
            .map_err(|_| ChainError::StoreFatal("lock de snapshots envenenado".to_string()))?
            .insert(id, data.clone());
        Ok(id)
    }

    fn restore_snapshot(&self, id: SnapshotId) -> Result<()> {
        let snapshot = self
            .snapshots
            .lock()
            .map_err(|_| ChainError::StoreFatal("lock de snapshots envenenado".to_string()))?
            .remove(&id)
            .ok_or_else(|| ChainError::StoreFatal(format!("snapshot {id} inexistente")))?;
        let mut data = self
            .data
            .write()
            .map_err(|_| ChainError::StoreFatal("lock do store envenenado".to_string()))?;
        *data = snapshot;
        Ok(())
    }

    fn drop_snapshot(&self, id: SnapshotId) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_commit_is_atomic() {
        let store = MemoryStore::new();

        let mut txn = store.begin().unwrap();
        txn.put("a", vec![1]);
        txn.put("b", vec![2]);

        // Antes do commit nada é visível
        assert!(store.get("a").unwrap().is_none());

        txn.commit().unwrap();
        assert_eq!(store.get("a").unwrap(), Some(vec![1]));
        assert_eq!(store.get("b").unwrap(), Some(vec![2]));
    }

    #[test]
    fn test_txn_rollback_discards() {
        let store = MemoryStore::new();

        let mut txn = store.begin().unwrap();
        txn.put("a", vec![1]);
        txn.rollback();

        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_delete_in_txn() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        txn.put("a", vec![1]);
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        txn.delete("a");
        txn.commit().unwrap();
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_restore() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        txn.put("a", vec![1]);
        txn.commit().unwrap();

        let snapshot = store.snapshot().unwrap();

        let mut txn = store.begin().unwrap();
        txn.put("a", vec![9]);
        txn.put("b", vec![2]);
        txn.commit().unwrap();

        store.restore_snapshot(snapshot).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(vec![1]));
        assert!(store.get("b").unwrap().is_none());
    }

    #[test]
    fn test_restore_unknown_snapshot_is_fatal() {
        let store = MemoryStore::new();
        let err = store.restore_snapshot(42).unwrap_err();
        assert!(matches!(err, ChainError::StoreFatal(_)));
    }

    #[test]
    fn test_typed_helpers() {
        let store = MemoryStore::new();
        let state = ChainStateRecord {
            height: 7,
            last_block_hash: Hash256::keccak256(b"tip"),
            timestamp: 1_000,
        };

        let mut txn = store.begin().unwrap();
        txn.put(&keys::chain_state(), encode_value(&state).unwrap());
        txn.commit().unwrap();

        assert_eq!(store.get_chain_state().unwrap(), Some(state));
        assert_eq!(store.get_nonce(&Hash256::keccak256(b"alice")).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_value_is_fatal() {
        let store = MemoryStore::new();
        let mut txn = store.begin().unwrap();
        txn.put(&keys::chain_state(), b"not json".to_vec());
        txn.commit().unwrap();

        let err = store.get_chain_state().unwrap_err();
        assert!(matches!(err, ChainError::StoreFatal(_)));
    }
}
