//! Coordenador do consenso híbrido
//!
//! Coordena o motor de PoW e o motor de votação. Fluxo por bloco:
//! `Received → HashVerified → PoWValid → [ForkDetected | Linear] →
//! [VoteAwait → Decided | Appended] → Committed | Rejected`.
//!
//! A costura síncrona [`BlockValidator`] usada pelo gerenciador da
//! cadeia cobre os caminhos linear e de PoW de emergência; a resolução
//! de fork por votação é assíncrona
//! ([`HybridConsensus::handle_chain_fork`]) e roda antes de qualquer
//! reorganização.

use crate::cache::{CacheTier, ValidationCache};
use crate::voting::VotingEngine;
use num_bigint::BigUint;
use shared::{ChainError, ChainId, CircuitBreaker, Hash256, Ratio, Result, RetryPolicy};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tessera_core::block::{Block, BlockHeader, ConsensusData};
use tessera_core::chain::BlockValidator;
use tessera_core::params::NetworkParams;
use tessera_core::pow::{MiningResult, PowEngine};
use tessera_core::store::{ChainStore, StoreExt};
use tracing::{debug, error, info, warn};

/// Motor de consenso híbrido
pub struct HybridConsensus {
    params: Arc<NetworkParams>,
    store: Arc<dyn ChainStore>,
    pow: PowEngine,
    voting: Arc<VotingEngine>,
    cache: ValidationCache,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    /// Trava global de resolução de fork; mantida através do await da
    /// votação
    fork_lock: tokio::sync::Mutex<()>,
    /// Dificuldade atual da rede, atualizada a cada commit
    network_difficulty: RwLock<BigUint>,
    /// Período que o próximo bloco produzido deve referenciar
    current_period: RwLock<u64>,
}

impl HybridConsensus {
    #[must_use]
    pub fn new(
        params: Arc<NetworkParams>,
        store: Arc<dyn ChainStore>,
        voting: Arc<VotingEngine>,
    ) -> Self {
        let cache = ValidationCache::new(
            params.validation_cache_capacity,
            Duration::from_millis(params.rejection_cache_ttl_ms.max(0) as u64),
        );
        let breaker = CircuitBreaker::new(
            "consensus",
            params.breaker_threshold,
            Duration::from_millis(params.breaker_reset_timeout_ms),
        );
        let initial_difficulty = BigUint::from(params.initial_difficulty.max(1));
        Self {
            pow: PowEngine::new(Arc::clone(&params)),
            params,
            store,
            voting,
            cache,
            breaker,
            retry: RetryPolicy::default(),
            fork_lock: tokio::sync::Mutex::new(()),
            network_difficulty: RwLock::new(initial_difficulty),
            current_period: RwLock::new(0),
        }
    }

    /// Acesso ao motor de votação
    #[must_use]
    pub fn voting(&self) -> Arc<VotingEngine> {
        Arc::clone(&self.voting)
    }

    /// Dificuldade atual da rede
    #[must_use]
    pub fn network_difficulty(&self) -> BigUint {
        self.network_difficulty
            .read()
            .expect("lock de dificuldade envenenado")
            .clone()
    }

    /// `pow_score` de um bloco contra a dificuldade atual da rede
    #[must_use]
    pub fn pow_score_for(&self, header: &BlockHeader) -> Ratio {
        PowEngine::pow_score(&header.difficulty, &self.network_difficulty())
    }

    /// Dados de consenso do próximo bloco produzido
    #[must_use]
    pub fn next_consensus_data(&self) -> ConsensusData {
        let network = self.network_difficulty();
        ConsensusData {
            pow_score: PowEngine::pow_score(&network, &network),
            voting_score: Ratio::zero(),
            participation_rate: Ratio::zero(),
            period_id: *self.current_period.read().expect("lock de período envenenado"),
        }
    }

    fn expected_difficulty(&self, block: &Block) -> Result<BigUint> {
        let parent = self
            .store
            .get_block(&block.header.previous_hash)?
            .ok_or_else(|| {
                ChainError::InvalidBlock("bloco pai desconhecido".to_string())
            })?;
        let store = Arc::clone(&self.store);
        self.pow.next_difficulty(&parent.header, move |height| {
            store
                .get_block_by_height(height)?
                .map(|block| block.header)
                .ok_or_else(|| ChainError::StoreFatal(format!("cabeçalho {height} ausente")))
        })
    }

    /// Teste de ponto de fork: outro bloco já ocupa esta altura
    ///
    /// # Errors
    ///
    /// Propaga falhas do armazenamento
    pub fn is_fork_point(&self, block: &Block) -> Result<bool> {
        match self.store.get_block_by_height(block.height())? {
            Some(existing) => Ok(existing.hash() != block.hash()),
            None => Ok(false),
        }
    }

    fn validate_inner(&self, block: &Block) -> Result<()> {
        // 3. Merkle
        block.verify_merkle()?;
        debug!(hash = %block.hash(), "block state: HashVerified");

        // 4. PoW
        let expected = self.expected_difficulty(block)?;
        self.pow.validate_block(block, &expected)?;
        debug!(hash = %block.hash(), "block state: PoWValid");

        // 5–7. Ponto de fork
        if self.is_fork_point(block)? {
            debug!(hash = %block.hash(), "block state: ForkDetected");
            if self.voting.any_active_period() {
                // VoteAwait: a resolução acontece no caminho assíncrono
                return Err(ChainError::InvalidVote(
                    "fork aguardando resolução por votação".to_string(),
                ));
            }
            // Caminho de emergência: só PoW esmagador é aceito
            let score = self.pow_score_for(&block.header);
            if score.lt(&self.params.emergency_pow_threshold) {
                return Err(ChainError::InsufficientPowForFork);
            }
            info!(hash = %block.hash(), %score, "fork accepted on emergency PoW");
        }

        Ok(())
    }

    /// Validação completa de consenso de um bloco
    ///
    /// Pipeline: caminho rápido do cache → circuit breaker → merkle →
    /// PoW → ponto de fork → (votação ativa | PoW de emergência). O
    /// veredicto é cacheado; rejeições expiram após um TTL curto.
    ///
    /// # Errors
    ///
    /// `CircuitOpen` com o breaker aberto (não conta como nova falha);
    /// caso contrário, a tag da primeira verificação que falhar
    pub fn validate(&self, block: &Block) -> Result<()> {
        let hash = block.hash();

        // 1. Caminho rápido
        if let Some(verdict) = self.cache.get(&hash) {
            return verdict;
        }

        // 2. Falha rápida enquanto o breaker estiver aberto
        self.breaker.check()?;

        let verdict = self.validate_inner(block);
        match &verdict {
            Ok(()) => self.breaker.record_success(),
            Err(error) => {
                // Falhas de infraestrutura disparam o breaker; blocos
                // inválidos não
                if matches!(error, ChainError::StoreTransient(_) | ChainError::StoreFatal(_)) {
                    self.breaker.record_failure();
                }
            }
        }

        // 8. Cachear e retornar; forks aguardando votação ficam fora do
        // cache para a decisão não ser mascarada por rejeição antiga
        let awaiting_vote = matches!(&verdict, Err(ChainError::InvalidVote(_)));
        if !awaiting_vote {
            self.cache.insert(hash, CacheTier::Consensus, verdict.clone());
        }
        verdict
    }

    /// Resolve um fork por votação direta
    ///
    /// Mantém a trava global de resolução de fork. Valida comprimento
    /// do ramo e monotonicidade de timestamp, abre (ou adere a) um
    /// período de seleção de cadeia e apura dentro de
    /// `fork_resolution_timeout_ms`. Em timeout ou empate a cadeia
    /// incumbente vence.
    ///
    /// # Errors
    ///
    /// `ForkDepthExceeded` para forks profundos; `InvalidBlock` para
    /// ramos malformados; erros do armazenamento são propagados
    pub async fn handle_chain_fork(&self, block: &Block) -> Result<Hash256> {
        let _fork_guard = self.fork_lock.lock().await;

        let incumbent = self
            .store
            .get_block_by_height(block.height())?
            .ok_or_else(|| {
                ChainError::InvalidBlock("fork sem bloco incumbente".to_string())
            })?;
        let old_chain_id: ChainId = incumbent.hash();
        let new_chain_id: ChainId = block.hash();

        // Ancestral comum: caminhar por previous_hash, limitado por
        // max_fork_length
        let mut cursor = block.clone();
        let mut fork_length = 0u64;
        let ancestor = loop {
            if fork_length >= self.params.max_fork_length {
                return Err(ChainError::InvalidBlock(format!(
                    "ramo excede max_fork_length de {}",
                    self.params.max_fork_length
                )));
            }
            let parent_hash = cursor.header.previous_hash;
            let parent = self.store.get_block(&parent_hash)?.ok_or_else(|| {
                ChainError::InvalidBlock("ancestral do fork desconhecido".to_string())
            })?;
            let on_main = self
                .store
                .get_block_by_height(parent.height())?
                .is_some_and(|main| main.hash() == parent.hash());
            if on_main {
                break parent;
            }
            cursor = parent;
            fork_length += 1;
        };

        // Monotonicidade de timestamp relativa ao ancestral
        if block.header.timestamp <= ancestor.header.timestamp {
            return Err(ChainError::InvalidTimestamp(
                "bloco do fork não avança o tempo do ancestral".to_string(),
            ));
        }

        let tip_height = self
            .store
            .get_chain_state()?
            .map(|state| state.height)
            .unwrap_or(block.height());

        let period_id = match self
            .voting
            .active_node_selection_period(&old_chain_id, &new_chain_id)
        {
            Some(existing) => existing,
            None => self.voting.initialize_chain_voting_period(
                old_chain_id,
                new_chain_id,
                ancestor.height(),
                tip_height,
            )?,
        };
        debug!(period_id, hash = %new_chain_id, "block state: VoteAwait");

        let timeout = Duration::from_millis(self.params.fork_resolution_timeout_ms)
            + Duration::from_millis(500);
        let winner = match tokio::time::timeout(timeout, self.voting.collect_and_tally(period_id))
            .await
        {
            Ok(Ok(result)) => result.winner.unwrap_or(old_chain_id),
            Ok(Err(tally_error)) => {
                error!(period_id, error = %tally_error, "fork tally failed; keeping incumbent");
                old_chain_id
            }
            Err(_) => {
                error!(
                    period_id,
                    "fork resolution timed out; keeping incumbent chain"
                );
                self.voting.cancel_period(period_id);
                return Err(ChainError::ForkResolutionTimeout);
            }
        };

        // Veredicto da votação entra no cache com o tier mais alto: a
        // reaplicação do ramo vencedor pega o caminho rápido e o
        // perdedor não é revalidado
        let loser = if winner == new_chain_id {
            old_chain_id
        } else {
            new_chain_id
        };
        self.cache.insert(winner, CacheTier::QuadraticVote, Ok(()));
        self.cache.insert(
            loser,
            CacheTier::QuadraticVote,
            Err(ChainError::InvalidBlock(
                "ramo perdedor da votação de seleção".to_string(),
            )),
        );

        info!(period_id, %winner, "block state: Decided");
        Ok(winner)
    }

    /// Produz o PoW de um rascunho de bloco
    ///
    /// Reverifica a merkle root e minera com tentativas limitadas e
    /// backoff exponencial com teto de 30 s; cada tentativa roda sob o
    /// timeout de processamento e respeita cancelamento cooperativo.
    ///
    /// # Errors
    ///
    /// `Timeout` quando o prazo de processamento expira;
    /// `NonceNotFound` após esgotar as tentativas
    pub async fn process_block(
        &self,
        mut block: Block,
        cancel: Arc<std::sync::atomic::AtomicBool>,
    ) -> Result<Block> {
        block.verify_merkle()?;

        let deadline = Duration::from_millis(self.params.processing_timeout_ms);
        let started = std::time::Instant::now();

        let mut attempt = 0u32;
        loop {
            let header = block.header.clone();
            let pow = PowEngine::new(Arc::clone(&self.params));
            let mine_cancel = Arc::clone(&cancel);
            let task =
                tokio::task::spawn_blocking(move || pow.mine(&header, &mine_cancel));

            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                cancel.store(true, std::sync::atomic::Ordering::SeqCst);
                return Err(ChainError::Timeout("block_processing".to_string()));
            }

            let outcome: Result<MiningResult> = match tokio::time::timeout(remaining, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(ChainError::StoreTransient(format!(
                    "worker de mineração abortou: {join_error}"
                ))),
                Err(_) => {
                    cancel.store(true, std::sync::atomic::Ordering::SeqCst);
                    return Err(ChainError::Timeout("block_processing".to_string()));
                }
            };

            match outcome {
                Ok(mined) => {
                    block.header = mined.header;
                    debug!(hash = %block.hash(), attempts = mined.attempts, "block mined");
                    return Ok(block);
                }
                Err(mining_error) => {
                    if !self.retry.should_retry(&mining_error, attempt) {
                        return Err(mining_error);
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %mining_error,
                        "mining attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Atualização de estado pós-commit: dificuldade, agenda de
    /// votação, cache
    pub fn update_state(&self, block: &Block) {
        // A dificuldade da rede segue a ponta comitada
        let store = Arc::clone(&self.store);
        match self.pow.next_difficulty(&block.header, move |height| {
            store
                .get_block_by_height(height)?
                .map(|ancestor| ancestor.header)
                .ok_or_else(|| ChainError::StoreFatal(format!("cabeçalho {height} ausente")))
        }) {
            Ok(next) => {
                *self
                    .network_difficulty
                    .write()
                    .expect("lock de dificuldade envenenado") = next;
            }
            Err(difficulty_error) => {
                warn!(error = %difficulty_error, "could not update network difficulty");
            }
        }

        // Períodos agendados abrem nas fronteiras de altura
        if let Some(period_id) = self.voting.maybe_start_scheduled_period(block.height()) {
            *self.current_period.write().expect("lock de período envenenado") = period_id;
        }

        self.cache
            .insert(block.hash(), CacheTier::Consensus, Ok(()));
        debug!(hash = %block.hash(), height = block.height(), "block state: Committed");
    }

    /// Aquece o cache de validação com os blocos mais recentes
    ///
    /// # Errors
    ///
    /// Propaga falhas do armazenamento
    pub async fn warmup_cache(&self) -> Result<usize> {
        let tip = self
            .store
            .get_chain_state()?
            .map(|state| state.height)
            .unwrap_or(0);
        self.cache.warmup(&self.store, tip).await
    }

    /// Contadores do cache para observabilidade
    #[must_use]
    pub fn cache_counters(&self) -> crate::cache::CacheCounters {
        self.cache.counters()
    }

    /// Estado do breaker de consenso para o relatório de saúde
    #[must_use]
    pub fn breaker_status(&self) -> shared::BreakerStatus {
        self.breaker.status()
    }
}

impl BlockValidator for HybridConsensus {
    fn validate_block(&self, block: &Block) -> Result<()> {
        self.validate(block)
    }

    fn on_block_committed(&self, block: &Block) {
        self.update_state(block);
    }
}
