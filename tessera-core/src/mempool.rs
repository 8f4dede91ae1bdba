//! Mempool de transações pendentes
//!
//! Admissão sob trava exclusiva com gate de nonce por remetente,
//! rastreio de gastos pendentes contra gasto duplo, limites de memória,
//! blacklist e rate limit. A manutenção periódica expira por TTL e
//! evita por menor taxa quando acima da marca d'água.

use crate::params::NetworkParams;
use crate::transaction::Transaction;
use chrono::Utc;
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use shared::{Address, Amount, ChainError, Nonce, Ratio, Result, Timestamp, TxId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Entrada do mempool
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub id: TxId,
    pub fee: Amount,
    pub size: usize,
    /// Taxa por byte truncada, usada para ordenação e percentis
    pub fee_per_byte: u64,
    pub added_at: Timestamp,
}

/// Estatísticas emitidas por ciclo de manutenção
#[derive(Debug, Clone, Default)]
pub struct MempoolStats {
    pub transactions: usize,
    pub bytes: usize,
    pub unique_senders: usize,
    pub evicted_expired: usize,
    pub evicted_capacity: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<TxId, MempoolEntry>,
    /// Nonces pendentes por remetente, ordenados
    by_sender: HashMap<Address, BTreeMap<Nonce, TxId>>,
    /// `txid da saída referenciada → índices consumidos` por pendentes
    spent_tracker: HashMap<TxId, HashSet<u32>>,
    bytes: usize,
    strikes: HashMap<String, u32>,
    blacklist: HashSet<Address>,
    rate_windows: HashMap<Address, (Timestamp, u32)>,
}

/// Pool de transações pendentes
#[derive(Debug)]
pub struct Mempool {
    params: Arc<NetworkParams>,
    inner: Mutex<Inner>,
    /// Travas por remetente, criadas sob demanda; guardam o par
    /// (verificação de nonce, inserção) contra corridas do mesmo
    /// remetente
    account_locks: Mutex<HashMap<Address, Arc<Mutex<()>>>>,
}

impl Mempool {
    #[must_use]
    pub fn new(params: Arc<NetworkParams>) -> Self {
        Self {
            params,
            inner: Mutex::new(Inner::default()),
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    fn sender_lock(&self, sender: &Address) -> Arc<Mutex<()>> {
        let mut locks = self.account_locks.lock().expect("account_locks envenenado");
        Arc::clone(locks.entry(*sender).or_default())
    }

    /// Adiciona uma transação já validada pelo validador
    ///
    /// `confirmed_nonce` é o próximo nonce confirmado do remetente
    /// (registro `nonce:{sender}` do armazenamento).
    ///
    /// # Errors
    ///
    /// Rejeita com a tag apropriada: id duplicado, nonce inesperado,
    /// gasto duplo pendente, mempool cheio, remetente bloqueado ou
    /// rate limit
    pub fn add(&self, tx: Transaction, fee: Amount, confirmed_nonce: Nonce) -> Result<()> {
        let sender = tx.sender;
        let sender_lock = self.sender_lock(&sender);
        let _sender_guard = sender_lock.lock().expect("account lock envenenado");

        let now = Utc::now().timestamp_millis();
        let id = tx.id();
        let size = tx.serialized_size();

        let mut inner = self.inner.lock().expect("mempool lock envenenado");

        if inner.blacklist.contains(&sender) {
            return Err(ChainError::InvalidTransaction(
                "Remetente na blacklist".to_string(),
            ));
        }

        // Rate limit por remetente (janela deslizante simples)
        let window = self.params.mempool_rate_window_ms;
        let limit = self.params.mempool_rate_limit;
        let entry = inner.rate_windows.entry(sender).or_insert((now, 0));
        if now - entry.0 > window {
            *entry = (now, 0);
        }
        if entry.1 >= limit {
            return Err(ChainError::RateLimited);
        }
        entry.1 += 1;

        if inner.entries.contains_key(&id) {
            return Err(ChainError::InvalidTransaction(
                "Transação duplicada no mempool".to_string(),
            ));
        }

        // Gate de nonce: estritamente sequencial a partir do confirmado
        let pending = inner.by_sender.get(&sender);
        let expected = confirmed_nonce + pending.map_or(0, |m| m.len() as u64);
        if tx.nonce != expected {
            return Err(ChainError::InvalidNonce {
                expected,
                actual: tx.nonce,
            });
        }
        if pending.is_some_and(|m| m.contains_key(&tx.nonce)) {
            return Err(ChainError::InvalidNonce {
                expected,
                actual: tx.nonce,
            });
        }

        // Gasto duplo entre pendentes
        for input in &tx.inputs {
            let outpoint = &input.previous_output;
            if inner
                .spent_tracker
                .get(&outpoint.txid)
                .is_some_and(|set| set.contains(&outpoint.vout))
            {
                return Err(ChainError::DoubleSpend(format!(
                    "Saída {outpoint} já consumida por transação pendente"
                )));
            }
        }

        // Limites de memória
        if inner.entries.len() + 1 > self.params.max_mempool_size
            || inner.bytes + size > self.params.max_mempool_bytes
        {
            return Err(ChainError::InvalidTransaction(
                "Mempool cheio".to_string(),
            ));
        }

        // Efetivar
        for input in &tx.inputs {
            let outpoint = input.previous_output;
            inner
                .spent_tracker
                .entry(outpoint.txid)
                .or_default()
                .insert(outpoint.vout);
        }
        inner
            .by_sender
            .entry(sender)
            .or_default()
            .insert(tx.nonce, id);
        inner.bytes += size;

        let fee_per_byte = fee_rate(&fee, size);
        inner.entries.insert(
            id,
            MempoolEntry {
                tx,
                id,
                fee,
                size,
                fee_per_byte,
                added_at: now,
            },
        );

        debug!(tx = %id, size, "transaction admitted to mempool");
        Ok(())
    }

    fn remove_locked(inner: &mut Inner, id: &TxId) -> Option<MempoolEntry> {
        let entry = inner.entries.remove(id)?;
        inner.bytes = inner.bytes.saturating_sub(entry.size);

        if let Some(nonces) = inner.by_sender.get_mut(&entry.tx.sender) {
            nonces.retain(|_, tx_id| tx_id != id);
            if nonces.is_empty() {
                inner.by_sender.remove(&entry.tx.sender);
            }
        }
        for input in &entry.tx.inputs {
            let outpoint = input.previous_output;
            if let Some(set) = inner.spent_tracker.get_mut(&outpoint.txid) {
                set.remove(&outpoint.vout);
                if set.is_empty() {
                    inner.spent_tracker.remove(&outpoint.txid);
                }
            }
        }
        Some(entry)
    }

    /// Remove uma transação confirmada
    pub fn remove(&self, id: &TxId) -> Option<Transaction> {
        let mut inner = self.inner.lock().expect("mempool lock envenenado");
        Self::remove_locked(&mut inner, id).map(|entry| entry.tx)
    }

    /// Remove um lote de transações confirmadas em bloco
    pub fn remove_batch(&self, ids: &[TxId]) -> usize {
        let mut inner = self.inner.lock().expect("mempool lock envenenado");
        ids.iter()
            .filter(|id| Self::remove_locked(&mut inner, id).is_some())
            .count()
    }

    /// Snapshot das transações ordenado por taxa (maior primeiro) e
    /// idade (mais antiga primeiro) para alimentar o template de bloco
    #[must_use]
    pub fn get_transactions(&self) -> Vec<Transaction> {
        let inner = self.inner.lock().expect("mempool lock envenenado");
        let mut entries: Vec<&MempoolEntry> = inner.entries.values().collect();
        entries.sort_by(|a, b| {
            b.fee_per_byte
                .cmp(&a.fee_per_byte)
                .then(a.added_at.cmp(&b.added_at))
        });
        entries.iter().map(|entry| entry.tx.clone()).collect()
    }

    /// Número de transações pendentes
    #[must_use]
    pub fn get_size(&self) -> usize {
        self.inner.lock().expect("mempool lock envenenado").entries.len()
    }

    /// Bytes ocupados pelas pendentes
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.inner.lock().expect("mempool lock envenenado").bytes
    }

    /// Fração de ocupação em relação ao máximo
    #[must_use]
    pub fn fill_ratio(&self) -> Ratio {
        let len = self.get_size() as u64;
        Ratio::new(len, self.params.max_mempool_size.max(1) as u64)
    }

    /// O mempool está sob backpressure?
    #[must_use]
    pub fn under_backpressure(&self) -> bool {
        self.fill_ratio().ge(&self.params.mempool_backpressure_fill)
    }

    /// Percentil de taxa por byte das pendentes (`p` em 0..=100)
    ///
    /// Sob backpressure, taxas abaixo do 10º percentil são descartadas.
    #[must_use]
    pub fn fee_rate_percentile(&self, p: u32) -> Option<u64> {
        let inner = self.inner.lock().expect("mempool lock envenenado");
        if inner.entries.is_empty() {
            return None;
        }
        let mut rates: Vec<u64> = inner.entries.values().map(|e| e.fee_per_byte).collect();
        rates.sort_unstable();
        let index = ((rates.len() - 1) as u64 * u64::from(p) / 100) as usize;
        Some(rates[index])
    }

    /// Registra falha de validação atribuída a uma origem
    ///
    /// Origens reincidentes acumulam strikes; remetentes com strikes
    /// demais entram na blacklist.
    pub fn handle_validation_failure(&self, key: &TxId, source: &str) {
        let mut inner = self.inner.lock().expect("mempool lock envenenado");
        let strikes = inner.strikes.entry(source.to_string()).or_insert(0);
        *strikes += 1;
        let count = *strikes;

        warn!(tx = %key, source, strikes = count, "validation failure recorded");

        if count >= self.params.max_strikes {
            if let Ok(address) = shared::Hash256::from_hex(source) {
                inner.blacklist.insert(address);
                info!(source, "sender blacklisted after repeated failures");
            }
        }
        // Entrada pendente do ofensor, se houver, é removida
        Self::remove_locked(&mut inner, key);
    }

    /// Remetente está na blacklist?
    #[must_use]
    pub fn is_blacklisted(&self, sender: &Address) -> bool {
        self.inner
            .lock()
            .expect("mempool lock envenenado")
            .blacklist
            .contains(sender)
    }

    /// Ciclo de manutenção: expira por TTL e evita por taxa acima da
    /// marca d'água. Emite as métricas do ciclo.
    pub fn maintain(&self) -> MempoolStats {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock().expect("mempool lock envenenado");

        // 1. Idade acima do TTL sai primeiro
        let expired: Vec<TxId> = inner
            .entries
            .values()
            .filter(|entry| now - entry.added_at > self.params.mempool_ttl_ms)
            .map(|entry| entry.id)
            .collect();
        for id in &expired {
            Self::remove_locked(&mut inner, id);
        }

        // 2. Acima da marca d'água: menor taxa primeiro, depois mais velha
        let high_watermark =
            self.params.max_mempool_size * 9 / 10;
        let mut evicted_capacity = 0;
        if inner.entries.len() > high_watermark {
            let mut candidates: Vec<(u64, Timestamp, TxId)> = inner
                .entries
                .values()
                .map(|entry| (entry.fee_per_byte, entry.added_at, entry.id))
                .collect();
            candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

            for (_, _, id) in candidates {
                if inner.entries.len() <= high_watermark {
                    break;
                }
                Self::remove_locked(&mut inner, &id);
                evicted_capacity += 1;
            }
        }

        let stats = MempoolStats {
            transactions: inner.entries.len(),
            bytes: inner.bytes,
            unique_senders: inner.by_sender.len(),
            evicted_expired: expired.len(),
            evicted_capacity,
        };
        info!(
            transactions = stats.transactions,
            bytes = stats.bytes,
            evicted_expired = stats.evicted_expired,
            evicted_capacity = stats.evicted_capacity,
            "mempool maintenance cycle"
        );
        stats
    }

    /// Laço de manutenção periódica; cancela quando `shutdown` resolve
    pub async fn maintenance_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = std::time::Duration::from_millis(self.params.cleanup_interval_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.maintain();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Taxa por byte truncada para u64
fn fee_rate(fee: &Amount, size: usize) -> u64 {
    if size == 0 {
        return 0;
    }
    let rate: BigUint = fee.as_biguint() / BigUint::from(size);
    rate.to_u64().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TxInput, TxOutput};
    use shared::{Hash256, OutPoint};

    fn test_params() -> Arc<NetworkParams> {
        Arc::new(NetworkParams {
            max_mempool_size: 10,
            mempool_rate_limit: 100,
            ..NetworkParams::regtest()
        })
    }

    fn tx_from(sender: Address, nonce: u64, prev: OutPoint, value: u64) -> Transaction {
        Transaction::new(
            1,
            sender,
            vec![TxInput::new(prev, vec![], 0)],
            vec![TxOutput::new(
                Amount::from_u64(value),
                vec![],
                Hash256::keccak256(b"dest"),
            )],
            0,
            nonce,
        )
    }

    fn outpoint(tag: &[u8], vout: u32) -> OutPoint {
        OutPoint::new(Hash256::keccak256(tag), vout)
    }

    #[test]
    fn test_add_and_remove() {
        let mempool = Mempool::new(test_params());
        let sender = Hash256::keccak256(b"alice");
        let tx = tx_from(sender, 0, outpoint(b"a", 0), 10);
        let id = tx.id();

        mempool.add(tx, Amount::from_u64(5), 0).unwrap();
        assert_eq!(mempool.get_size(), 1);

        assert!(mempool.remove(&id).is_some());
        assert_eq!(mempool.get_size(), 0);
        assert_eq!(mempool.size_bytes(), 0);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mempool = Mempool::new(test_params());
        let sender = Hash256::keccak256(b"alice");
        let tx = tx_from(sender, 0, outpoint(b"a", 0), 10);

        mempool.add(tx.clone(), Amount::from_u64(5), 0).unwrap();
        assert!(mempool.add(tx, Amount::from_u64(5), 0).is_err());
    }

    #[test]
    fn test_nonce_gate() {
        let mempool = Mempool::new(test_params());
        let sender = Hash256::keccak256(b"alice");

        // Nonce 1 com confirmado 0: fora de sequência
        let out_of_order = tx_from(sender, 1, outpoint(b"a", 0), 10);
        let err = mempool.add(out_of_order, Amount::from_u64(5), 0).unwrap_err();
        assert!(matches!(err, ChainError::InvalidNonce { expected: 0, actual: 1 }));

        // Sequência correta: 0 depois 1
        mempool
            .add(tx_from(sender, 0, outpoint(b"a", 0), 10), Amount::from_u64(5), 0)
            .unwrap();
        mempool
            .add(tx_from(sender, 1, outpoint(b"b", 0), 10), Amount::from_u64(5), 0)
            .unwrap();
        assert_eq!(mempool.get_size(), 2);
    }

    #[test]
    fn test_pending_double_spend_rejected() {
        let mempool = Mempool::new(test_params());
        let alice = Hash256::keccak256(b"alice");
        let bob = Hash256::keccak256(b"bob");
        let shared_outpoint = outpoint(b"contested", 0);

        mempool
            .add(tx_from(alice, 0, shared_outpoint, 10), Amount::from_u64(5), 0)
            .unwrap();

        let err = mempool
            .add(tx_from(bob, 0, shared_outpoint, 10), Amount::from_u64(5), 0)
            .unwrap_err();
        assert!(matches!(err, ChainError::DoubleSpend(_)));
        // Exatamente uma aceita
        assert_eq!(mempool.get_size(), 1);
    }

    #[test]
    fn test_capacity_cap() {
        let params = Arc::new(NetworkParams {
            max_mempool_size: 2,
            ..NetworkParams::regtest()
        });
        let mempool = Mempool::new(params);

        for i in 0..2u8 {
            let sender = Hash256::keccak256(&[i]);
            mempool
                .add(tx_from(sender, 0, outpoint(&[i, 1], 0), 10), Amount::from_u64(1), 0)
                .unwrap();
        }

        let sender = Hash256::keccak256(b"late");
        let err = mempool
            .add(tx_from(sender, 0, outpoint(b"late", 0), 10), Amount::from_u64(1), 0)
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidTransaction(_)));
    }

    #[test]
    fn test_rate_limit() {
        let params = Arc::new(NetworkParams {
            mempool_rate_limit: 2,
            max_mempool_size: 100,
            ..NetworkParams::regtest()
        });
        let mempool = Mempool::new(params);
        let sender = Hash256::keccak256(b"spammer");

        mempool
            .add(tx_from(sender, 0, outpoint(b"a", 0), 10), Amount::from_u64(1), 0)
            .unwrap();
        mempool
            .add(tx_from(sender, 1, outpoint(b"b", 0), 10), Amount::from_u64(1), 0)
            .unwrap();
        let err = mempool
            .add(tx_from(sender, 2, outpoint(b"c", 0), 10), Amount::from_u64(1), 0)
            .unwrap_err();
        assert_eq!(err, ChainError::RateLimited);
    }

    #[test]
    fn test_strikes_lead_to_blacklist() {
        let params = Arc::new(NetworkParams {
            max_strikes: 2,
            ..NetworkParams::regtest()
        });
        let mempool = Mempool::new(params);
        let sender = Hash256::keccak256(b"offender");
        let source = sender.to_string();

        let id = Hash256::keccak256(b"tx");
        mempool.handle_validation_failure(&id, &source);
        assert!(!mempool.is_blacklisted(&sender));
        mempool.handle_validation_failure(&id, &source);
        assert!(mempool.is_blacklisted(&sender));

        let err = mempool
            .add(tx_from(sender, 0, outpoint(b"x", 0), 10), Amount::from_u64(1), 0)
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidTransaction(_)));
    }

    #[test]
    fn test_snapshot_ordered_by_fee_rate() {
        let mempool = Mempool::new(test_params());

        let cheap_sender = Hash256::keccak256(b"cheap");
        let rich_sender = Hash256::keccak256(b"rich");
        let cheap = tx_from(cheap_sender, 0, outpoint(b"a", 0), 10);
        let rich = tx_from(rich_sender, 0, outpoint(b"b", 0), 10);

        mempool.add(cheap, Amount::from_u64(1), 0).unwrap();
        mempool.add(rich.clone(), Amount::from_u64(100_000), 0).unwrap();

        let snapshot = mempool.get_transactions();
        assert_eq!(snapshot[0].id(), rich.id());
    }

    #[test]
    fn test_maintenance_expires_by_ttl() {
        let params = Arc::new(NetworkParams {
            mempool_ttl_ms: 0,
            ..NetworkParams::regtest()
        });
        let mempool = Mempool::new(params);
        let sender = Hash256::keccak256(b"alice");
        mempool
            .add(tx_from(sender, 0, outpoint(b"a", 0), 10), Amount::from_u64(5), 0)
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let stats = mempool.maintain();
        assert_eq!(stats.evicted_expired, 1);
        assert_eq!(mempool.get_size(), 0);
    }

    #[test]
    fn test_maintenance_evicts_lowest_fee_first() {
        let params = Arc::new(NetworkParams {
            max_mempool_size: 2, // marca d'água = 1
            mempool_ttl_ms: i64::MAX / 2,
            ..NetworkParams::regtest()
        });
        let mempool = Mempool::new(params);

        let cheap_sender = Hash256::keccak256(b"cheap");
        let rich_sender = Hash256::keccak256(b"rich");
        let cheap = tx_from(cheap_sender, 0, outpoint(b"a", 0), 10);
        let rich = tx_from(rich_sender, 0, outpoint(b"b", 0), 10);
        let rich_id = rich.id();

        mempool.add(cheap, Amount::from_u64(1), 0).unwrap();
        mempool.add(rich, Amount::from_u64(100_000), 0).unwrap();

        let stats = mempool.maintain();
        assert_eq!(stats.evicted_capacity, 1);

        let remaining = mempool.get_transactions();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), rich_id);
    }

    #[test]
    fn test_fee_percentile() {
        let mempool = Mempool::new(test_params());
        assert_eq!(mempool.fee_rate_percentile(10), None);

        for i in 1..=5u8 {
            let sender = Hash256::keccak256(&[i]);
            let tx = tx_from(sender, 0, outpoint(&[i, i], 0), 10);
            let size = tx.serialized_size() as u64;
            mempool
                .add(tx, Amount::from_u64(u64::from(i) * size), 0)
                .unwrap();
        }

        let p10 = mempool.fee_rate_percentile(10).unwrap();
        let p100 = mempool.fee_rate_percentile(100).unwrap();
        assert!(p10 <= p100);
        assert_eq!(p100, 5);
    }
}
