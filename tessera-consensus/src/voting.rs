//! Motor de Votação Direta
//!
//! Gerencia períodos de votação agendados e períodos de seleção de
//! cadeia disparados por forks:
//! - Agenda: períodos começam em alturas múltiplas de
//!   `voting_period_blocks`
//! - Admissão de votos com verificação de assinatura em cache
//! - Apuração de precisão arbitrária com decaimento de poder de voto
//! - Decisão por limiar de aprovação (racional exato, sem ponto
//!   flutuante)

use chrono::Utc;
use num_bigint::BigUint;
use num_traits::Zero;
use shared::{
    Address, Amount, ChainError, ChainId, Hash256, PeriodId, Ratio, Result, Timestamp,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tessera_core::params::NetworkParams;
use tessera_core::vote::{CompetingChains, PeriodKind, PeriodStatus, Vote, VotingPeriod};
use tracing::{debug, info, warn};

/// Expoente máximo do decaimento de poder de voto
const MAX_DECAY_PERIODS: u64 = 16;

/// Informações de um validador registrado
#[derive(Debug, Clone)]
pub struct ValidatorInfo {
    pub address: Address,
    pub stake: Amount,
    pub registered_at_height: u64,
    pub active: bool,
    /// Último período em que o validador votou (decaimento de poder)
    pub last_participated_period: Option<PeriodId>,
}

/// Registro de validadores ativos
#[derive(Debug, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<Address, ValidatorInfo>,
}

impl ValidatorRegistry {
    /// Registra (ou reativa) um validador
    pub fn register(&mut self, address: Address, stake: Amount, height: u64) {
        self.validators
            .entry(address)
            .and_modify(|info| {
                info.stake = stake.clone();
                info.active = true;
            })
            .or_insert(ValidatorInfo {
                address,
                stake,
                registered_at_height: height,
                active: true,
                last_participated_period: None,
            });
    }

    /// Desativa um validador
    pub fn deactivate(&mut self, address: &Address) {
        if let Some(info) = self.validators.get_mut(address) {
            info.active = false;
        }
    }

    #[must_use]
    pub fn is_active(&self, address: &Address) -> bool {
        self.validators
            .get(address)
            .is_some_and(|info| info.active)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.validators.values().filter(|info| info.active).count()
    }

    #[must_use]
    pub fn active_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self
            .validators
            .values()
            .filter(|info| info.active)
            .map(|info| info.address)
            .collect();
        addresses.sort();
        addresses
    }

    fn periods_missed(&self, address: &Address, current_period: PeriodId) -> u64 {
        let last = self
            .validators
            .get(address)
            .and_then(|info| info.last_participated_period);
        match last {
            None => 0,
            Some(last) => current_period.saturating_sub(last).saturating_sub(1),
        }
        .min(MAX_DECAY_PERIODS)
    }

    fn mark_participated(&mut self, address: &Address, period: PeriodId) {
        if let Some(info) = self.validators.get_mut(address) {
            info.last_participated_period = Some(period);
        }
    }
}

/// Resultado de uma apuração
#[derive(Debug, Clone)]
pub struct TallyResult {
    pub period_id: PeriodId,
    /// Peso aprovador (precisão arbitrária, com decaimento)
    pub approved: BigUint,
    /// Peso rejeitador
    pub rejected: BigUint,
    /// Votos booleanos contados
    pub valid_votes: usize,
    /// Votos ignorados por `approve` não-booleano
    pub ignored_votes: usize,
    /// `aprovados / (aprovados + rejeitados)` como racional exato
    pub approval_ratio: Ratio,
    /// Votantes válidos / validadores ativos no início do período
    pub participation_rate: Ratio,
    /// Cadeia vencedora (períodos de seleção de cadeia)
    pub winner: Option<ChainId>,
}

type VoteCacheKey = (Address, Timestamp, Hash256);

struct VoteCache {
    entries: HashMap<VoteCacheKey, (bool, Instant)>,
    generation: u64,
}

/// Motor de votação
pub struct VotingEngine {
    params: Arc<NetworkParams>,
    registry: RwLock<ValidatorRegistry>,
    /// Geração do conjunto de validadores; mudanças invalidam o cache
    registry_generation: AtomicU64,
    periods: RwLock<HashMap<PeriodId, VotingPeriod>>,
    decisions: RwLock<HashMap<PeriodId, ChainId>>,
    next_period_id: AtomicU64,
    vote_cache: Mutex<VoteCache>,
    rate_windows: Mutex<HashMap<Address, (Timestamp, u32)>>,
}

impl VotingEngine {
    #[must_use]
    pub fn new(params: Arc<NetworkParams>) -> Self {
        Self {
            params,
            registry: RwLock::new(ValidatorRegistry::default()),
            registry_generation: AtomicU64::new(0),
            periods: RwLock::new(HashMap::new()),
            decisions: RwLock::new(HashMap::new()),
            next_period_id: AtomicU64::new(1),
            vote_cache: Mutex::new(VoteCache {
                entries: HashMap::new(),
                generation: 0,
            }),
            rate_windows: Mutex::new(HashMap::new()),
        }
    }

    /// Registra um validador; invalida o cache de verificação
    pub fn register_validator(&self, address: Address, stake: Amount, height: u64) {
        self.registry
            .write()
            .expect("registry lock envenenado")
            .register(address, stake, height);
        self.registry_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Desativa um validador; invalida o cache de verificação
    pub fn deactivate_validator(&self, address: &Address) {
        self.registry
            .write()
            .expect("registry lock envenenado")
            .deactivate(address);
        self.registry_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Validadores ativos no momento
    #[must_use]
    pub fn active_validators(&self) -> Vec<Address> {
        self.registry
            .read()
            .expect("registry lock envenenado")
            .active_addresses()
    }

    /// Inicia o período de governança agendado desta altura, se houver
    ///
    /// Períodos começam quando `altura ≡ 0 (mod voting_period_blocks)`.
    pub fn maybe_start_scheduled_period(&self, height: u64) -> Option<PeriodId> {
        if height == 0
            || self.params.voting_period_blocks == 0
            || height % self.params.voting_period_blocks != 0
        {
            return None;
        }

        let period_id = self.next_period_id.fetch_add(1, Ordering::SeqCst);
        let duration_ms = (self.params.voting_period_blocks
            * self.params.target_block_time_ms) as i64;
        // Snapshot dos validadores ativos na abertura: a elegibilidade
        // do período não acompanha mudanças posteriores do registro
        let validators = self
            .registry
            .read()
            .expect("registry lock envenenado")
            .active_addresses();
        let period = VotingPeriod::scheduled(
            period_id,
            height,
            self.params.voting_period_blocks,
            Utc::now().timestamp_millis(),
            duration_ms,
            validators,
        );

        self.periods
            .write()
            .expect("periods lock envenenado")
            .insert(period_id, period);
        info!(period_id, height, "scheduled voting period opened");
        Some(period_id)
    }

    /// Inicializa um período de seleção de cadeia para um fork
    ///
    /// # Errors
    ///
    /// `ForkDepthExceeded` se o fork for mais profundo que
    /// `max_fork_depth`
    pub fn initialize_chain_voting_period(
        &self,
        old_chain_id: ChainId,
        new_chain_id: ChainId,
        fork_height: u64,
        current_height: u64,
    ) -> Result<PeriodId> {
        let depth = current_height.saturating_sub(fork_height);
        if depth > self.params.max_fork_depth {
            return Err(ChainError::ForkDepthExceeded {
                depth,
                max: self.params.max_fork_depth,
            });
        }

        let period_id = self.next_period_id.fetch_add(1, Ordering::SeqCst);
        let validators = self
            .registry
            .read()
            .expect("registry lock envenenado")
            .active_addresses();
        let period = VotingPeriod::node_selection(
            period_id,
            CompetingChains {
                old_chain_id,
                new_chain_id,
                common_ancestor_height: fork_height,
            },
            current_height,
            Utc::now().timestamp_millis(),
            self.params.fork_resolution_timeout_ms as i64,
            validators,
        );

        self.periods
            .write()
            .expect("periods lock envenenado")
            .insert(period_id, period);
        info!(
            period_id,
            fork_height, "node selection period opened for fork"
        );
        Ok(period_id)
    }

    /// Período de seleção de cadeia ativo para estas competidoras
    #[must_use]
    pub fn active_node_selection_period(
        &self,
        old_chain_id: &ChainId,
        new_chain_id: &ChainId,
    ) -> Option<PeriodId> {
        let now = Utc::now().timestamp_millis();
        self.periods
            .read()
            .expect("periods lock envenenado")
            .values()
            .find(|period| {
                period.kind == PeriodKind::NodeSelection
                    && period.is_active(now)
                    && period.competing_chains.as_ref().is_some_and(|chains| {
                        chains.old_chain_id == *old_chain_id
                            && chains.new_chain_id == *new_chain_id
                    })
            })
            .map(|period| period.period_id)
    }

    /// Período ativo apropriado para um voto com este alvo
    ///
    /// Prefere um período de seleção de cadeia cujas competidoras
    /// incluam o alvo; na ausência, qualquer período ativo.
    #[must_use]
    pub fn find_active_period(&self, target: &ChainId) -> Option<PeriodId> {
        let now = Utc::now().timestamp_millis();
        let periods = self.periods.read().expect("periods lock envenenado");

        periods
            .values()
            .filter(|period| period.is_active(now))
            .find(|period| {
                period.competing_chains.as_ref().is_some_and(|chains| {
                    chains.old_chain_id == *target || chains.new_chain_id == *target
                })
            })
            .or_else(|| periods.values().find(|period| period.is_active(now)))
            .map(|period| period.period_id)
    }

    /// Há qualquer período ativo neste instante?
    #[must_use]
    pub fn any_active_period(&self) -> bool {
        let now = Utc::now().timestamp_millis();
        self.periods
            .read()
            .expect("periods lock envenenado")
            .values()
            .any(|period| period.is_active(now))
    }

    /// Consulta um período
    #[must_use]
    pub fn get_period(&self, period_id: PeriodId) -> Option<VotingPeriod> {
        self.periods
            .read()
            .expect("periods lock envenenado")
            .get(&period_id)
            .cloned()
    }

    /// Decisão registrada de um período completado
    #[must_use]
    pub fn decision_for(&self, period_id: PeriodId) -> Option<ChainId> {
        self.decisions
            .read()
            .expect("decisions lock envenenado")
            .get(&period_id)
            .copied()
    }

    fn vote_cache_key(vote: &Vote) -> Result<VoteCacheKey> {
        let signature = vote
            .signature
            .as_ref()
            .ok_or(ChainError::InvalidSignature)?;
        let signature_digest = Hash256::keccak256(
            &serde_json::to_vec(signature)
                .map_err(|e| ChainError::SerializationError(e.to_string()))?,
        );
        Ok((vote.voter, vote.timestamp, signature_digest))
    }

    /// Consulta o cache de verificação
    ///
    /// Chave `(votante, timestamp, hash da assinatura)` com TTL; o cache
    /// inteiro é descartado quando o conjunto de validadores muda.
    fn vote_cache_lookup(&self, key: &VoteCacheKey, generation: u64) -> Option<bool> {
        let ttl = Duration::from_millis(self.params.vote_cache_ttl_ms.max(0) as u64);
        let mut cache = self.vote_cache.lock().expect("vote cache envenenado");
        if cache.generation != generation {
            cache.entries.clear();
            cache.generation = generation;
            return None;
        }
        cache
            .entries
            .get(key)
            .filter(|(_, at)| at.elapsed() < ttl)
            .map(|(verdict, _)| *verdict)
    }

    fn vote_cache_store(&self, key: VoteCacheKey, generation: u64, verdict: bool) {
        let mut cache = self.vote_cache.lock().expect("vote cache envenenado");
        if cache.generation == generation {
            cache.entries.insert(key, (verdict, Instant::now()));
        }
    }

    /// Admite um voto em um período
    ///
    /// Verifica, nesta ordem: período ativo e janela de aceitação,
    /// capacidade do período, votante presente no snapshot de
    /// validadores do início do período, idade do voto, rate limit por
    /// votante e assinatura (com timeout).
    ///
    /// # Errors
    ///
    /// Retorna a tag da primeira verificação que falhar
    pub async fn submit_vote(&self, period_id: PeriodId, vote: Vote) -> Result<()> {
        let now = Utc::now().timestamp_millis();

        {
            let periods = self.periods.read().expect("periods lock envenenado");
            let period = periods.get(&period_id).ok_or_else(|| {
                ChainError::InvalidVote(format!("período {period_id} inexistente"))
            })?;

            if period.status != PeriodStatus::Active {
                return Err(ChainError::InvalidVote("período não está ativo".to_string()));
            }
            if !period.accepts_at(vote.timestamp) {
                return Err(ChainError::InvalidVote(
                    "timestamp fora da janela do período".to_string(),
                ));
            }
            if period.vote_count() >= self.params.max_votes_per_period {
                return Err(ChainError::InvalidVote(
                    "período atingiu o máximo de votos".to_string(),
                ));
            }
            // Elegibilidade contra o snapshot de start_height, não o
            // registro vivo: quem entrou depois da abertura não vota
            if !period.is_eligible_voter(&vote.voter) {
                return Err(ChainError::InvalidVote(
                    "votante não era validador ativo no início do período".to_string(),
                ));
            }
        }

        if vote.age_ms(now) > self.params.max_vote_age_ms {
            return Err(ChainError::InvalidVote("voto velho demais".to_string()));
        }

        // Rate limit por votante
        {
            let mut windows = self.rate_windows.lock().expect("rate lock envenenado");
            let entry = windows.entry(vote.voter).or_insert((now, 0));
            if now - entry.0 > self.params.mempool_rate_window_ms {
                *entry = (now, 0);
            }
            if entry.1 >= self.params.mempool_rate_limit {
                return Err(ChainError::RateLimited);
            }
            entry.1 += 1;
        }

        // Assinatura com timeout de 5 s em worker bloqueante
        let signature_timeout = Duration::from_millis(self.params.signature_timeout_ms);
        let generation = self.registry_generation.load(Ordering::SeqCst);
        let cache_key = Self::vote_cache_key(&vote)?;
        let verified = match self.vote_cache_lookup(&cache_key, generation) {
            Some(verdict) => verdict,
            None => {
                let vote_clone = vote.clone();
                let task = tokio::task::spawn_blocking(move || vote_clone.verify_signature());
                match tokio::time::timeout(signature_timeout, task).await {
                    Ok(Ok(result)) => {
                        let verdict = result?;
                        self.vote_cache_store(cache_key, generation, verdict);
                        verdict
                    }
                    Ok(Err(join_error)) => {
                        return Err(ChainError::InvalidVote(format!(
                            "worker de verificação abortou: {join_error}"
                        )));
                    }
                    Err(_) => {
                        return Err(ChainError::Timeout("vote_signature".to_string()));
                    }
                }
            }
        };
        if !verified {
            return Err(ChainError::InvalidSignature);
        }

        let mut periods = self.periods.write().expect("periods lock envenenado");
        let period = periods
            .get_mut(&period_id)
            .ok_or_else(|| ChainError::InvalidVote(format!("período {period_id} sumiu")))?;
        // Duplicata do mesmo votante resolve para o último recebido
        period.record_vote(vote);
        debug!(period_id, votes = period.vote_count(), "vote recorded");
        Ok(())
    }

    /// Apura um período
    ///
    /// Votos com `approve` não-booleano são ignorados (não contam como
    /// rejeição nem entram no total válido). Pesos usam o decaimento
    /// `vote_power_decay^k`, com `k` períodos de inatividade do
    /// votante, somados em precisão arbitrária com denominador comum.
    /// Cede o processador a cada 1000 votos.
    ///
    /// # Errors
    ///
    /// Retorna erro se o período não existir
    pub async fn tally(&self, period_id: PeriodId) -> Result<TallyResult> {
        let period = self
            .get_period(period_id)
            .ok_or_else(|| ChainError::InvalidVote(format!("período {period_id} inexistente")))?;

        // Denominador da participação: validadores ativos no início do
        // período (snapshot), não o registro vivo
        let active_validators = period.validator_count();

        // Expoentes de decaimento por votante
        let decay = self.params.vote_power_decay;
        let exponents: HashMap<Address, u64> = {
            let registry = self.registry.read().expect("registry lock envenenado");
            period
                .votes
                .keys()
                .map(|voter| (*voter, registry.periods_missed(voter, period_id)))
                .collect()
        };
        let max_exponent = exponents.values().copied().max().unwrap_or(0);

        let num = BigUint::from(decay.num);
        let den = BigUint::from(decay.den.max(1));

        let mut approved = BigUint::zero();
        let mut rejected = BigUint::zero();
        let mut valid_votes = 0usize;
        let mut ignored_votes = 0usize;

        for (index, vote) in period.votes.values().enumerate() {
            // Cooperação com o agendador em apurações grandes
            if index > 0 && index % 1_000 == 0 {
                tokio::task::yield_now().await;
            }

            let Some(approve) = vote.approve else {
                ignored_votes += 1;
                continue;
            };

            let k = exponents.get(&vote.voter).copied().unwrap_or(0);
            // peso = num^k * den^(K-k); denominador comum den^K
            let weight = num.pow(k as u32) * den.pow((max_exponent - k) as u32);

            if approve {
                approved += &weight;
            } else {
                rejected += &weight;
            }
            valid_votes += 1;
        }

        let total = &approved + &rejected;
        let approval_ratio = Ratio::from_biguints(approved.clone(), total.clone());
        let participation_rate = Ratio::new(
            valid_votes as u64,
            (active_validators as u64).max(1),
        );

        // Decisão: aprovação ≥ limiar e quórum mínimo
        let winner = period.competing_chains.as_ref().map(|chains| {
            let quorum = valid_votes >= self.params.min_votes_for_validity;
            let threshold = self.params.node_selection_threshold;
            let passes = !total.is_zero()
                && approved.clone() * BigUint::from(threshold.den)
                    >= BigUint::from(threshold.num) * total.clone();
            if quorum && passes {
                chains.new_chain_id
            } else {
                chains.old_chain_id
            }
        });

        // Completar o período e registrar participação
        {
            let mut periods = self.periods.write().expect("periods lock envenenado");
            if let Some(stored) = periods.get_mut(&period_id) {
                stored.status = PeriodStatus::Completed;
            }
        }
        {
            let mut registry = self.registry.write().expect("registry lock envenenado");
            for voter in period.votes.keys() {
                registry.mark_participated(voter, period_id);
            }
        }
        if let Some(winner) = winner {
            self.decisions
                .write()
                .expect("decisions lock envenenado")
                .insert(period_id, winner);
        }

        info!(
            period_id,
            valid_votes, ignored_votes, %approval_ratio, "period tallied"
        );

        Ok(TallyResult {
            period_id,
            approved,
            rejected,
            valid_votes,
            ignored_votes,
            approval_ratio,
            participation_rate,
            winner,
        })
    }

    /// Coleta bloqueando até `end_time` e então apura
    ///
    /// # Errors
    ///
    /// Retorna erro se o período não existir
    pub async fn collect_and_tally(&self, period_id: PeriodId) -> Result<TallyResult> {
        let period = self
            .get_period(period_id)
            .ok_or_else(|| ChainError::InvalidVote(format!("período {period_id} inexistente")))?;

        let now = Utc::now().timestamp_millis();
        if period.end_time > now {
            let wait = Duration::from_millis((period.end_time - now) as u64);
            tokio::time::sleep(wait).await;
        }
        self.tally(period_id).await
    }

    /// Cancela um período ativo
    pub fn cancel_period(&self, period_id: PeriodId) {
        let mut periods = self.periods.write().expect("periods lock envenenado");
        if let Some(period) = periods.get_mut(&period_id) {
            if period.status == PeriodStatus::Active {
                period.status = PeriodStatus::Cancelled;
                warn!(period_id, "voting period cancelled");
            }
        }
    }
}
