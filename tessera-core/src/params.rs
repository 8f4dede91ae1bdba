//! Parâmetros da rede Tessera
//!
//! Todas as constantes de consenso, mineração, mempool e votação vivem
//! aqui. O `Default` corresponde à mainnet; testes usam `regtest()`.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use shared::{Amount, Ratio};

/// Parâmetros da rede
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkParams {
    // ── Votação ──
    /// Períodos de votação agendados começam a cada N blocos
    pub voting_period_blocks: u64,
    /// Máximo de votos aceitos por período
    pub max_votes_per_period: usize,
    /// Mínimo de votos para um tally válido
    pub min_votes_for_validity: usize,
    /// Decaimento do poder de voto por período de inatividade
    pub vote_power_decay: Ratio,
    /// Idade máxima de um voto (ms)
    pub max_vote_age_ms: i64,
    /// TTL do cache de verificação de votos (ms)
    pub vote_cache_ttl_ms: i64,
    /// Fração de aprovação para a cadeia nova vencer o fork
    pub node_selection_threshold: Ratio,
    /// Timeout da resolução de fork (ms)
    pub fork_resolution_timeout_ms: u64,
    /// Profundidade máxima de fork aceita para votação
    pub max_fork_depth: u64,
    /// Comprimento máximo do ramo competidor
    pub max_fork_length: u64,
    /// `pow_score` mínimo para aceitar fork sem período ativo
    pub emergency_pow_threshold: Ratio,

    // ── Proof-of-Work ──
    pub initial_difficulty: u64,
    pub min_difficulty: u64,
    /// Timespan alvo de um intervalo de retarget (ms)
    pub target_timespan_ms: u64,
    /// Tempo alvo entre blocos (ms)
    pub target_block_time_ms: u64,
    /// Retarget a cada N blocos
    pub difficulty_adjustment_interval: u64,
    /// Clamp do timespan observado: `[alvo/f, alvo*f]`
    pub max_adjustment_factor: u64,
    /// Alvo máximo (hex `0x…`); `target = max_target / difficulty`
    pub max_target_hex: String,
    /// Nonces testados por lote antes de checar cancelamento
    pub hash_batch_size: u64,
    /// Threads de mineração
    pub mining_threads: usize,

    // ── Blocos e transações ──
    pub max_block_size: usize,
    pub max_transactions: usize,
    pub max_tx_size: usize,
    pub min_fee_per_byte: u64,
    pub max_signature_size: usize,
    pub max_script_size: usize,
    pub max_inputs: usize,
    pub max_outputs: usize,
    /// Confirmações mínimas de um UTXO antes de poder ser gasto
    pub min_input_age: u64,
    /// Maturidade de coinbase (confirmações)
    pub coinbase_maturity: u64,
    /// Drift máximo do timestamp em relação ao relógio local (ms)
    pub max_time_drift_ms: i64,
    /// Idade máxima de uma transação incluída em bloco (ms)
    pub max_tx_age_ms: i64,
    pub min_tx_version: u32,
    pub max_tx_version: u32,

    // ── Economia ──
    pub halving_interval: u64,
    pub initial_reward: u64,
    pub min_reward: u64,
    pub max_supply: u128,

    // ── Mempool ──
    pub max_mempool_size: usize,
    pub max_mempool_bytes: usize,
    pub mempool_ttl_ms: i64,
    pub cleanup_interval_ms: u64,
    /// Acima desta fração do mempool, só taxas altas entram
    pub mempool_backpressure_fill: Ratio,
    /// Transações por remetente por janela de rate limit
    pub mempool_rate_limit: u32,
    pub mempool_rate_window_ms: i64,
    /// Strikes até blacklist do remetente
    pub max_strikes: u32,

    // ── Cadeia ──
    pub max_reorg_depth: u64,
    pub height_cache_ttl_ms: i64,
    pub validation_timeout_ms: u64,
    pub processing_timeout_ms: u64,
    pub signature_timeout_ms: u64,

    // ── Circuit breakers ──
    pub breaker_threshold: u32,
    pub breaker_reset_timeout_ms: u64,

    // ── Cache de validação ──
    pub validation_cache_capacity: usize,
    pub rejection_cache_ttl_ms: i64,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            voting_period_blocks: 1000,
            max_votes_per_period: 10_000,
            min_votes_for_validity: 3,
            vote_power_decay: Ratio::new(9, 10),
            max_vote_age_ms: 3_600_000, // 1h
            vote_cache_ttl_ms: 300_000, // 5min
            node_selection_threshold: Ratio::new(66, 100),
            fork_resolution_timeout_ms: 30_000,
            max_fork_depth: 100,
            max_fork_length: 50,
            emergency_pow_threshold: Ratio::new(8, 10),

            initial_difficulty: 16,
            min_difficulty: 1,
            target_timespan_ms: 1_209_600_000, // 2 semanas
            target_block_time_ms: 600_000,     // 10 minutos
            difficulty_adjustment_interval: 2016,
            max_adjustment_factor: 4,
            max_target_hex: format!("0x{}", "f".repeat(64)),
            hash_batch_size: 10_000,
            mining_threads: 1,

            max_block_size: 4_000_000, // 4MB
            max_transactions: 2_000,
            max_tx_size: 100_000,
            min_fee_per_byte: 1,
            max_signature_size: 8_192,
            max_script_size: 10_000,
            max_inputs: 1_000,
            max_outputs: 1_000,
            min_input_age: 1,
            coinbase_maturity: 100,
            max_time_drift_ms: 3_600_000,      // 1h
            max_tx_age_ms: 259_200_000,        // 72h
            min_tx_version: 1,
            max_tx_version: 2,

            halving_interval: 210_000,
            initial_reward: 5_000,
            min_reward: 1,
            max_supply: 2_100_000_000_000,

            max_mempool_size: 50_000,
            max_mempool_bytes: 300_000_000, // 300MB
            mempool_ttl_ms: 86_400_000,     // 24h
            cleanup_interval_ms: 60_000,
            mempool_backpressure_fill: Ratio::new(9, 10),
            mempool_rate_limit: 100,
            mempool_rate_window_ms: 60_000,
            max_strikes: 5,

            max_reorg_depth: 100,
            height_cache_ttl_ms: 5_000,
            validation_timeout_ms: 5_000,
            processing_timeout_ms: 60_000,
            signature_timeout_ms: 5_000,

            breaker_threshold: 5,
            breaker_reset_timeout_ms: 30_000,

            validation_cache_capacity: 10_000,
            rejection_cache_ttl_ms: 60_000,
        }
    }
}

impl NetworkParams {
    /// Parâmetros para testes: dificuldade mínima, limites pequenos
    #[must_use]
    pub fn regtest() -> Self {
        Self {
            initial_difficulty: 1,
            difficulty_adjustment_interval: 10,
            target_block_time_ms: 1_000,
            target_timespan_ms: 10_000,
            voting_period_blocks: 10,
            max_mempool_size: 100,
            mining_threads: 1,
            coinbase_maturity: 2,
            min_input_age: 1,
            halving_interval: 100,
            ..Self::default()
        }
    }

    /// Alvo máximo decodificado
    ///
    /// # Errors
    ///
    /// Retorna erro se o hex configurado for inválido
    pub fn max_target(&self) -> shared::Result<BigUint> {
        let stripped = self.max_target_hex.strip_prefix("0x").unwrap_or(&self.max_target_hex);
        BigUint::parse_bytes(stripped.as_bytes(), 16).ok_or_else(|| {
            shared::ChainError::SerializationError("max_target_hex inválido".to_string())
        })
    }

    /// Recompensa inicial como `Amount`
    #[must_use]
    pub fn initial_reward_amount(&self) -> Amount {
        Amount::from_u64(self.initial_reward)
    }

    /// Oferta máxima como `Amount`
    #[must_use]
    pub fn max_supply_amount(&self) -> Amount {
        Amount::from_biguint(BigUint::from(self.max_supply))
    }
}
