//! Montador de blocos
//!
//! Recebe o template (transações do mempool, votos, validadores),
//! impõe os limites do protocolo, recalcula a merkle root sob trava
//! exclusiva e assina o cabeçalho do minerador. O hash final é
//! preenchido pelo motor de PoW.

use crate::block::{merkle_root, Block, BlockHeader, ConsensusData};
use crate::params::NetworkParams;
use crate::pow::PowEngine;
use crate::transaction::Transaction;
use crate::utxo::UtxoSet;
use crate::vote::Vote;
use chrono::Utc;
use num_bigint::BigUint;
use shared::{Address, Amount, ChainError, Hash256, KeyPair, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct BuilderState {
    transactions: Vec<Transaction>,
    merkle_root: Option<Hash256>,
    fees: Amount,
    validators: Vec<Address>,
    votes: Vec<Vote>,
    consensus_data: Option<ConsensusData>,
    max_size_override: Option<usize>,
    /// Timestamp do pai; o bloco deve avançar o relógio da cadeia
    min_timestamp: i64,
}

/// Montador de um bloco candidato
#[derive(Debug)]
pub struct BlockBuilder {
    params: Arc<NetworkParams>,
    previous_hash: Hash256,
    height: u64,
    difficulty: BigUint,
    state: Mutex<BuilderState>,
}

impl BlockBuilder {
    #[must_use]
    pub fn new(
        params: Arc<NetworkParams>,
        previous_hash: Hash256,
        height: u64,
        difficulty: BigUint,
    ) -> Self {
        Self {
            params,
            previous_hash,
            height,
            difficulty,
            state: Mutex::new(BuilderState::default()),
        }
    }

    /// Timestamp do bloco pai; o cabeçalho construído nunca fica atrás
    /// dele (a mediana dos ancestrais exigiria rejeição)
    pub fn set_min_timestamp(&self, parent_timestamp: i64) {
        let mut state = self.state.lock().expect("builder lock envenenado");
        state.min_timestamp = parent_timestamp;
    }

    /// Tamanho máximo efetivo do bloco
    ///
    /// Sob backpressure do mempool o nó reduz o teto em até 50% do
    /// valor base, proporcional ao preenchimento.
    pub fn set_max_block_size(&self, max_size: usize) {
        let floor = self.params.max_block_size / 2;
        let mut state = self.state.lock().expect("builder lock envenenado");
        state.max_size_override = Some(max_size.clamp(floor, self.params.max_block_size));
    }

    fn effective_max_size(state: &BuilderState, params: &NetworkParams) -> usize {
        state.max_size_override.unwrap_or(params.max_block_size)
    }

    /// Define as transações do template (sem a coinbase)
    ///
    /// Impõe: contagem dentro do limite, idade de cada transação,
    /// ids únicos e tamanho total serializado. Recalcula a merkle root
    /// sob a trava exclusiva do montador.
    ///
    /// # Errors
    ///
    /// Retorna erro se qualquer limite for violado
    pub fn set_transactions(&self, transactions: Vec<Transaction>, utxo_set: &UtxoSet) -> Result<()> {
        let mut state = self.state.lock().expect("builder lock envenenado");

        if transactions.len() + 1 > self.params.max_transactions {
            return Err(ChainError::InvalidBlock(format!(
                "Template com {} transações excede o máximo de {}",
                transactions.len() + 1,
                self.params.max_transactions
            )));
        }

        let now = Utc::now().timestamp_millis();
        let mut seen = HashSet::new();
        let mut total_size = 0usize;
        let mut fees = Amount::zero();

        // Visão incremental: taxas de transações encadeadas dentro do
        // mesmo template resolvem contra as saídas das anteriores
        let mut view = utxo_set.clone();
        for tx in &transactions {
            if now - tx.timestamp > self.params.max_tx_age_ms {
                return Err(ChainError::InvalidBlock(format!(
                    "Transação {} velha demais para inclusão",
                    tx.id()
                )));
            }
            if !seen.insert(tx.id()) {
                return Err(ChainError::InvalidBlock(
                    "Id duplicado no template".to_string(),
                ));
            }
            total_size += tx.serialized_size();
            fees = fees.checked_add(&tx.fee(&view)?)?;
            view.stage_transaction(tx, self.height, now);
        }

        if total_size > Self::effective_max_size(&state, &self.params) {
            return Err(ChainError::InvalidBlock(format!(
                "Template de {total_size} bytes excede o tamanho máximo"
            )));
        }

        let mut ids: Vec<Hash256> = Vec::with_capacity(transactions.len());
        for tx in &transactions {
            ids.push(tx.id());
        }
        state.merkle_root = Some(merkle_root(&ids));
        state.fees = fees;
        state.transactions = transactions;
        Ok(())
    }

    /// Merkle root do template atual (sem a coinbase), recalculada na
    /// última chamada de `set_transactions`
    #[must_use]
    pub fn template_merkle_root(&self) -> Option<Hash256> {
        self.state
            .lock()
            .expect("builder lock envenenado")
            .merkle_root
    }

    /// Define os validadores do período carregados pelo bloco
    pub fn set_validators(&self, validators: Vec<Address>) {
        let mut state = self.state.lock().expect("builder lock envenenado");
        state.validators = validators;
    }

    /// Define os votos de resolução de fork carregados pelo bloco
    pub fn set_votes(&self, votes: Vec<Vote>) {
        let mut state = self.state.lock().expect("builder lock envenenado");
        state.votes = votes;
    }

    /// Define os dados de consenso do cabeçalho
    pub fn set_consensus_data(&self, data: ConsensusData) {
        let mut state = self.state.lock().expect("builder lock envenenado");
        state.consensus_data = Some(data);
    }

    /// Monta e assina o bloco candidato
    ///
    /// A coinbase credita `recompensa + taxas` ao minerador; `fees` do
    /// cabeçalho é a soma das taxas do template. O nonce permanece em
    /// zero: o motor de PoW o preenche junto com o hash final.
    ///
    /// # Errors
    ///
    /// Retorna erro se a montagem ou a assinatura falharem
    pub fn build(
        &self,
        miner_key: &KeyPair,
        block_reward: Amount,
        total_supply_after: Amount,
    ) -> Result<Block> {
        let state = self.state.lock().expect("builder lock envenenado");
        let miner = miner_key.address();

        let coinbase_value = block_reward.checked_add(&state.fees)?;
        let coinbase = Transaction::coinbase(self.height, coinbase_value, vec![], miner);

        let mut all_transactions = vec![coinbase];
        all_transactions.extend(state.transactions.iter().cloned());

        let mut ids: Vec<Hash256> = Vec::with_capacity(all_transactions.len());
        for tx in &all_transactions {
            ids.push(tx.id());
        }
        let tx_root = merkle_root(&ids);
        let validator_root = merkle_root(&state.validators);

        let target = PowEngine::encode_target(
            &(self.params.max_target()? / self.difficulty.clone().max(BigUint::from(1u8))),
        );

        let mut header = BlockHeader {
            version: 1,
            previous_hash: self.previous_hash,
            merkle_root: tx_root,
            validator_merkle_root: validator_root,
            timestamp: Utc::now()
                .timestamp_millis()
                .max(state.min_timestamp.saturating_add(1)),
            difficulty: self.difficulty.clone(),
            nonce: 0,
            height: self.height,
            miner,
            total_supply: total_supply_after,
            block_reward,
            fees: state.fees.clone(),
            target,
            consensus_data: state.consensus_data.clone().unwrap_or(ConsensusData::genesis()),
            signature: None,
            public_key: None,
            hash: Hash256::zero(),
        };
        header.sign(miner_key)?;
        header.hash = header.compute_hash()?;

        let mut block = Block::new(header, all_transactions);
        block.votes = state.votes.clone();
        block.validators = state.validators.clone();
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TxInput, TxOutput};
    use shared::OutPoint;

    fn setup() -> (Arc<NetworkParams>, KeyPair, Block, UtxoSet) {
        let params = Arc::new(NetworkParams::regtest());
        let keypair = KeyPair::generate().unwrap();
        let genesis = Block::genesis(&params, &keypair).unwrap();
        let mut utxo_set = UtxoSet::new();
        utxo_set.apply_block(&genesis).unwrap();
        (params, keypair, genesis, utxo_set)
    }

    fn spend_from_genesis(genesis: &Block, keypair: &KeyPair, value: u64) -> Transaction {
        let outpoint = OutPoint::new(genesis.transactions[0].id(), 0);
        let mut tx = Transaction::new(
            1,
            keypair.address(),
            vec![TxInput::new(outpoint, vec![], 0)],
            vec![TxOutput::new(
                Amount::from_u64(value),
                vec![],
                Hash256::keccak256(b"dest"),
            )],
            0,
            0,
        );
        tx.sign(keypair).unwrap();
        tx
    }

    #[test]
    fn test_build_empty_block_still_credits_miner() {
        let (params, keypair, genesis, utxo_set) = setup();
        let builder = BlockBuilder::new(
            Arc::clone(&params),
            genesis.hash(),
            1,
            genesis.header.difficulty.clone(),
        );
        builder.set_transactions(vec![], &utxo_set).unwrap();

        let block = builder
            .build(&keypair, Amount::from_u64(5000), Amount::from_u64(10_000))
            .unwrap();

        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(block.transactions[0].outputs[0].value, Amount::from_u64(5000));
        assert_eq!(block.header.fees, Amount::zero());
        assert!(block.header.verify_signature().unwrap());
        block.verify_merkle().unwrap();
    }

    #[test]
    fn test_build_sums_fees_into_coinbase() {
        let (params, keypair, genesis, utxo_set) = setup();
        let builder = BlockBuilder::new(
            Arc::clone(&params),
            genesis.hash(),
            1,
            genesis.header.difficulty.clone(),
        );

        // Gasta 5000, devolve 4900: taxa de 100
        let tx = spend_from_genesis(&genesis, &keypair, 4_900);
        builder.set_transactions(vec![tx], &utxo_set).unwrap();

        let block = builder
            .build(&keypair, Amount::from_u64(5000), Amount::from_u64(10_000))
            .unwrap();

        assert_eq!(block.header.fees, Amount::from_u64(100));
        assert_eq!(block.transactions[0].outputs[0].value, Amount::from_u64(5_100));
    }

    #[test]
    fn test_template_merkle_root_recomputed_under_lock() {
        let (params, keypair, genesis, utxo_set) = setup();
        let builder = BlockBuilder::new(
            Arc::clone(&params),
            genesis.hash(),
            1,
            genesis.header.difficulty.clone(),
        );
        assert!(builder.template_merkle_root().is_none());

        let tx = spend_from_genesis(&genesis, &keypair, 4_900);
        let expected = merkle_root(&[tx.id()]);
        builder.set_transactions(vec![tx], &utxo_set).unwrap();

        assert_eq!(builder.template_merkle_root(), Some(expected));
    }

    #[test]
    fn test_duplicate_template_ids_rejected() {
        let (params, keypair, genesis, utxo_set) = setup();
        let builder = BlockBuilder::new(
            Arc::clone(&params),
            genesis.hash(),
            1,
            genesis.header.difficulty.clone(),
        );

        let tx = spend_from_genesis(&genesis, &keypair, 4_900);
        let err = builder
            .set_transactions(vec![tx.clone(), tx], &utxo_set)
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock(_)));
    }

    #[test]
    fn test_stale_transaction_rejected() {
        let (params, keypair, genesis, utxo_set) = setup();
        let builder = BlockBuilder::new(
            Arc::clone(&params),
            genesis.hash(),
            1,
            genesis.header.difficulty.clone(),
        );

        let mut tx = spend_from_genesis(&genesis, &keypair, 4_900);
        tx.timestamp -= params.max_tx_age_ms + 1_000;
        tx.sign(&keypair).unwrap();

        let err = builder.set_transactions(vec![tx], &utxo_set).unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock(_)));
    }

    #[test]
    fn test_max_size_override_floors_at_half() {
        let (params, _, genesis, _) = setup();
        let builder = BlockBuilder::new(
            Arc::clone(&params),
            genesis.hash(),
            1,
            genesis.header.difficulty.clone(),
        );

        builder.set_max_block_size(1);
        let state = builder.state.lock().unwrap();
        assert_eq!(state.max_size_override, Some(params.max_block_size / 2));
    }

    #[test]
    fn test_validator_merkle_root_in_header() {
        let (params, keypair, genesis, utxo_set) = setup();
        let builder = BlockBuilder::new(
            Arc::clone(&params),
            genesis.hash(),
            1,
            genesis.header.difficulty.clone(),
        );
        builder.set_transactions(vec![], &utxo_set).unwrap();
        let validators = vec![Hash256::keccak256(b"v1"), Hash256::keccak256(b"v2")];
        builder.set_validators(validators.clone());

        let block = builder
            .build(&keypair, Amount::from_u64(5000), Amount::from_u64(10_000))
            .unwrap();

        assert_eq!(block.validators, validators);
        assert_eq!(
            block.header.validator_merkle_root,
            merkle_root(&validators)
        );
    }
}
