//! Cache de veredictos de validação com tiers de prioridade
//!
//! Cache limitado chaveado pelo hash do bloco. Aceitações vivem até a
//! evicção; rejeições carregam um TTL curto para que um bloco
//! rejeitado transitoriamente possa ser revalidado. A evicção remove
//! primeiro as entradas do tier mais baixo, depois as mais velhas, e
//! incrementa um contador observável pelo nó.

use shared::{ChainError, Hash256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tessera_core::store::{ChainStore, StoreExt};
use tracing::{debug, info};

/// Blocos carregados por um warmup do cache
const WARMUP_BLOCKS: u64 = 100;
/// Tamanho do lote de warmup; a tarefa cede entre lotes
const WARMUP_BATCH: u64 = 20;

/// Tier de prioridade de um veredicto em cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheTier {
    Pow = 0,
    Consensus = 1,
    QuadraticVote = 2,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    /// `None` = aceito; `Some(tag)` = rejeitado com o erro original
    rejection: Option<ChainError>,
    tier: CacheTier,
    inserted_at: Instant,
}

/// Contadores expostos para observabilidade
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Cache limitado de validação
#[derive(Debug)]
pub struct ValidationCache {
    capacity: usize,
    rejection_ttl: Duration,
    entries: Mutex<HashMap<Hash256, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ValidationCache {
    #[must_use]
    pub fn new(capacity: usize, rejection_ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            rejection_ttl,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Veredicto em cache para um hash de bloco
    ///
    /// Rejeições expiradas são descartadas e contam como miss.
    #[must_use]
    pub fn get(&self, hash: &Hash256) -> Option<Result<(), ChainError>> {
        let mut entries = self.entries.lock().expect("lock do cache envenenado");
        match entries.get(hash) {
            Some(entry) => {
                if entry.rejection.is_some() && entry.inserted_at.elapsed() >= self.rejection_ttl {
                    entries.remove(hash);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(match &entry.rejection {
                    None => Ok(()),
                    Some(error) => Err(error.clone()),
                })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Armazena um veredicto, com evicção quando na capacidade
    pub fn insert(&self, hash: Hash256, tier: CacheTier, verdict: Result<(), ChainError>) {
        let mut entries = self.entries.lock().expect("lock do cache envenenado");

        if entries.len() >= self.capacity && !entries.contains_key(&hash) {
            // Tier mais baixo primeiro, depois a mais velha
            if let Some(victim) = entries
                .iter()
                .min_by(|a, b| {
                    a.1.tier
                        .cmp(&b.1.tier)
                        .then(b.1.inserted_at.elapsed().cmp(&a.1.inserted_at.elapsed()))
                })
                .map(|(key, _)| *key)
            {
                entries.remove(&victim);
                let total = self.evictions.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(evictions = total, "validation cache eviction");
            }
        }

        entries.insert(
            hash,
            CacheEntry {
                rejection: verdict.err(),
                tier,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Descarta todas as entradas
    pub fn clear(&self) {
        self.entries.lock().expect("lock do cache envenenado").clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock do cache envenenado").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Pré-carrega veredictos dos blocos mais recentes
    ///
    /// Carrega até 100 blocos abaixo da ponta em lotes de 20, cedendo
    /// entre lotes. Blocos já na cadeia são aceitos por definição.
    ///
    /// # Errors
    ///
    /// Propaga falhas de leitura do armazenamento
    pub async fn warmup(&self, store: &Arc<dyn ChainStore>, tip_height: u64) -> shared::Result<usize> {
        let start = tip_height.saturating_sub(WARMUP_BLOCKS.saturating_sub(1));
        let mut loaded = 0usize;

        let mut height = tip_height;
        loop {
            let batch_floor = height.saturating_sub(WARMUP_BATCH - 1).max(start);
            for h in (batch_floor..=height).rev() {
                if let Some(block) = store.get_block_by_height(h)? {
                    self.insert(block.hash(), CacheTier::Consensus, Ok(()));
                    loaded += 1;
                }
            }
            if batch_floor == start {
                break;
            }
            height = batch_floor - 1;
            tokio::task::yield_now().await;
        }

        info!(loaded, tip_height, "validation cache warmed up");
        Ok(loaded)
    }
}
