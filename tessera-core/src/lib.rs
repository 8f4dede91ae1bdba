pub mod block;
pub mod builder;
pub mod chain;
pub mod codec;
pub mod mempool;
pub mod params;
pub mod pow;
pub mod reward;
pub mod store;
pub mod transaction;
pub mod utxo;
pub mod validation;
pub mod vote;

// Re-exports principais
pub use block::{merkle_root, Block, BlockHeader, ConsensusData};
pub use builder::BlockBuilder;
pub use chain::{BlockValidator, ChainEvent, ChainManager, ChainStats, ChainTip, TipStatus};
pub use mempool::{Mempool, MempoolStats};
pub use params::NetworkParams;
pub use pow::{MiningResult, PowEngine};
pub use reward::{block_reward, capped_reward};
pub use store::{ChainStateRecord, ChainStore, MemoryStore, StoreExt, StoreTxn};
pub use transaction::{Transaction, TxInput, TxOutput};
pub use utxo::{Utxo, UtxoSet};
pub use validation::TransactionValidator;
pub use vote::{ChainVoteData, CompetingChains, PeriodKind, PeriodStatus, Vote, VotingPeriod};

// Re-exports de tipos compartilhados
pub use shared::{Amount, ChainError, Hash256, Ratio, Result};
