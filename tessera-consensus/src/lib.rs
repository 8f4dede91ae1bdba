//! # Tessera Consensus - Consenso Híbrido PoW + Votação Direta
//!
//! Este crate coordena os dois mecanismos de consenso da Tessera:
//! - **Proof-of-Work** para produção de blocos (motor em
//!   `tessera-core`)
//! - **Votação direta on-chain** para resolução de forks e seleção de
//!   cadeia por governança
//!
//! ## Resolução de forks
//!
//! Um fork existe quando dois blocos distintos ocupam a mesma altura.
//! Com um período de votação ativo, validadores decidem a cadeia
//! vencedora por limiar de aprovação; sem período ativo, só um
//! `pow_score` acima do limiar de emergência aceita o ramo novo. Em
//! timeout ou empate a cadeia incumbente permanece.
//!
//! ## Módulos
//!
//! - [`voting`] - períodos, admissão de votos, apuração com decaimento
//! - [`hybrid`] - pipeline de validação, forks, cache de validação
//! - [`cache`] - cache limitado de veredictos com tiers de prioridade

pub mod cache;
pub mod hybrid;
pub mod voting;

// Re-exports principais
pub use cache::{CacheCounters, CacheTier, ValidationCache};
pub use hybrid::HybridConsensus;
pub use voting::{TallyResult, ValidatorInfo, ValidatorRegistry, VotingEngine};
