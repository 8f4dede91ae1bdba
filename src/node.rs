//! Fachada do nó Tessera
//!
//! Expõe a superfície observável (submissão de transações, blocos e
//! votos; consultas de cadeia; saúde) sobre os subsistemas do núcleo.
//! O [`NodeBuilder`] constrói as dependências em ordem (armazenamento →
//! UTXO → mempool → validador → votação → consenso → cadeia) e as
//! conecta de uma vez, sem ciclos de referência.

use crate::events::{EventBus, NodeEvent};
use shared::{Amount, BreakerStatus, ChainError, Hash256, KeyPair, Result, TxId};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use tessera_consensus::HybridConsensus;
use tessera_core::chain::{ChainEvent, ChainManager, ChainTip};
use tessera_core::reward::capped_reward;
use tessera_core::store::{ChainStore, MemoryStore, StoreExt};
use tessera_core::vote::Vote;
use tessera_core::{
    Block, BlockBuilder, Mempool, NetworkParams, Transaction, TransactionValidator, UtxoSet,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Relatório de saúde do nó
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub unhealthy_subsystems: Vec<String>,
}

/// Nó Tessera
pub struct Node {
    params: Arc<NetworkParams>,
    chain: Arc<ChainManager>,
    mempool: Arc<Mempool>,
    validator: Arc<TransactionValidator>,
    consensus: Arc<HybridConsensus>,
    keypair: KeyPair,
    events: EventBus,
    chain_events: Mutex<Option<tokio::sync::mpsc::Receiver<ChainEvent>>>,
    /// Blocos órfãos e de fork aguardando resolução, por hash
    orphans: Mutex<std::collections::HashMap<Hash256, Block>>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl Node {
    /// Assina o barramento de eventos do nó
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Inicia as tarefas de fundo (manutenção do mempool, ponte de
    /// eventos da cadeia, warmup do cache de validação)
    ///
    /// # Errors
    ///
    /// Propaga falhas do warmup
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.consensus.warmup_cache().await?;

        // Ponte: eventos da cadeia → barramento do nó
        if let Some(mut receiver) = self
            .chain_events
            .lock()
            .expect("chain_events lock envenenado")
            .take()
        {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    let mapped = match event {
                        ChainEvent::BlockAppended { hash, height } => {
                            NodeEvent::BlockAppended { hash, height }
                        }
                        ChainEvent::ReorgCompleted {
                            old_tip,
                            new_tip,
                            ancestor_height,
                        } => NodeEvent::ReorgCompleted {
                            old_tip,
                            new_tip,
                            ancestor_height,
                        },
                    };
                    node.events.publish(mapped);
                }
            });
        }

        let mempool = Arc::clone(&self.mempool);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(mempool.maintenance_loop(shutdown));

        Ok(())
    }

    /// Sinaliza o encerramento das tarefas de fundo
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Endereço do minerador local
    #[must_use]
    pub fn miner_address(&self) -> Hash256 {
        self.keypair.address()
    }

    // ── Superfície observável ──

    /// Bloco por hash
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    pub fn get_block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>> {
        self.chain.get_block_by_hash(hash)
    }

    /// Bloco por altura
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        self.chain.get_block_by_height(height)
    }

    /// Altura atual da cadeia ativa
    ///
    /// # Errors
    ///
    /// Retorna erro se o estado não puder ser lido
    pub fn get_current_height(&self) -> Result<u64> {
        self.chain.current_height()
    }

    /// Pontas de cadeia conhecidas
    ///
    /// # Errors
    ///
    /// Retorna erro se o estado não puder ser lido
    pub fn get_chain_tips(&self) -> Result<Vec<ChainTip>> {
        self.chain.get_chain_tips()
    }

    /// Snapshot do mempool
    #[must_use]
    pub fn get_mempool(&self) -> Vec<Transaction> {
        self.mempool.get_transactions()
    }

    /// Submete uma transação: valida e admite no mempool
    ///
    /// Sob backpressure o piso de taxa sobe para o 10º percentil do
    /// mempool.
    ///
    /// # Errors
    ///
    /// Retorna a tag de rejeição; falhas registram strike do remetente
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<TxId> {
        let id = tx.id();
        let sender = tx.sender;
        let height = self.chain.current_height()?;

        let fee_floor = if self.mempool.under_backpressure() {
            self.mempool.fee_rate_percentile(10)
        } else {
            None
        };

        let fee = match self
            .validator
            .validate_with_timeout(tx.clone(), self.chain.utxo_set(), height, fee_floor)
            .await
        {
            Ok(fee) => fee,
            Err(validation_error) => {
                self.mempool
                    .handle_validation_failure(&id, &sender.to_string());
                return Err(validation_error);
            }
        };

        let confirmed_nonce = self.chain.store().get_nonce(&sender)?;
        self.mempool.add(tx, fee, confirmed_nonce)?;
        Ok(id)
    }

    /// Submete um bloco recebido
    ///
    /// Blocos lineares seguem para o gerenciador da cadeia; blocos em
    /// fork passam pela resolução por votação e, vencendo, disparam a
    /// reorganização.
    ///
    /// # Errors
    ///
    /// Retorna a razão da rejeição
    pub async fn submit_block(&self, block: Block) -> Result<()> {
        if self.consensus.is_fork_point(&block)? {
            self.orphans
                .lock()
                .expect("orphans lock envenenado")
                .insert(block.hash(), block.clone());
            self.chain.record_side_block(&block);

            let winner = self.consensus.handle_chain_fork(&block).await?;
            if winner != block.hash() {
                info!(hash = %block.hash(), %winner, "fork block lost the vote");
                return Err(ChainError::InvalidBlock(
                    "cadeia incumbente mantida pela votação".to_string(),
                ));
            }

            let branch = self.assemble_branch(block)?;
            return self.chain.reorganize(&branch);
        }

        match self.chain.append_block(&block) {
            Ok(()) => Ok(()),
            Err(append_error) => {
                // Pai desconhecido: guardar como órfão para montagem
                // futura de ramo
                if matches!(append_error, ChainError::InvalidBlock(_)) {
                    self.orphans
                        .lock()
                        .expect("orphans lock envenenado")
                        .insert(block.hash(), block);
                }
                Err(append_error)
            }
        }
    }

    /// Monta o ramo do fork, do ancestral comum até o bloco vencedor
    fn assemble_branch(&self, tip: Block) -> Result<Vec<Block>> {
        let orphans = self.orphans.lock().expect("orphans lock envenenado");
        let store = self.chain.store();

        let mut branch = vec![tip];
        loop {
            let first = &branch[0];
            let parent_hash = first.header.previous_hash;
            let parent_height = first.height().saturating_sub(1);

            let on_main = store
                .get_block_by_height(parent_height)?
                .is_some_and(|main| main.hash() == parent_hash);
            if on_main {
                break;
            }

            let parent = orphans
                .get(&parent_hash)
                .cloned()
                .or(store.get_block(&parent_hash)?)
                .ok_or_else(|| {
                    ChainError::InvalidBlock("ramo do fork incompleto".to_string())
                })?;
            branch.insert(0, parent);

            if branch.len() as u64 > self.params.max_fork_length {
                return Err(ChainError::InvalidBlock(
                    "ramo excede o comprimento máximo".to_string(),
                ));
            }
        }
        Ok(branch)
    }

    /// Submete um voto ao período ativo apropriado
    ///
    /// # Errors
    ///
    /// Retorna a tag de validade do voto
    pub async fn submit_vote(&self, vote: Vote) -> Result<()> {
        let voting = self.consensus.voting();
        let period_id = voting
            .find_active_period(&vote.target_chain_id)
            .ok_or_else(|| {
                ChainError::InvalidVote("nenhum período de votação ativo".to_string())
            })?;
        voting.submit_vote(period_id, vote).await
    }

    /// Saúde do nó: booleano e lista de subsistemas não saudáveis
    #[must_use]
    pub fn health_check(&self) -> HealthReport {
        let mut unhealthy = Vec::new();

        if let Err(chain_error) = self.chain.health_check() {
            warn!(error = %chain_error, "chain unhealthy");
            unhealthy.push("chain".to_string());
        }
        if self.consensus.breaker_status() == BreakerStatus::Open {
            unhealthy.push("consensus".to_string());
        }
        if self.mempool.get_size() >= self.params.max_mempool_size {
            unhealthy.push("mempool".to_string());
        }

        HealthReport {
            healthy: unhealthy.is_empty(),
            unhealthy_subsystems: unhealthy,
        }
    }

    /// Minera e anexa o próximo bloco com as transações do mempool
    ///
    /// # Errors
    ///
    /// Propaga falhas de template, mineração ou anexação
    pub async fn mine_block(&self) -> Result<Block> {
        let tip_hash = self.chain.tip_hash()?;
        let tip = self
            .chain
            .get_block_by_hash(&tip_hash)?
            .ok_or_else(|| ChainError::StoreFatal("ponta ausente".to_string()))?;
        let height = tip.height() + 1;
        let difficulty = self.consensus.network_difficulty();

        let builder = BlockBuilder::new(
            Arc::clone(&self.params),
            tip.hash(),
            height,
            difficulty,
        );
        builder.set_min_timestamp(tip.header.timestamp);

        // Backpressure: teto do bloco encolhe proporcionalmente ao
        // preenchimento do mempool, até 50% do base
        let fill = self.mempool.fill_ratio();
        if fill.ge(&self.params.mempool_backpressure_fill) {
            let base = self.params.max_block_size as u64;
            let reduced = base - (base / 2) * fill.num.min(fill.den) / fill.den.max(1);
            builder.set_max_block_size(reduced as usize);
        }

        // Template: transações ainda válidas contra o estado atual
        let candidates = self.mempool.get_transactions();
        let mut template = Vec::new();
        {
            let utxo = self.chain.utxo_set();
            let set = utxo.read().expect("utxo lock envenenado");
            let mut seen_inputs = std::collections::HashSet::new();
            for tx in candidates {
                if template.len() + 1 >= self.params.max_transactions {
                    break;
                }
                let inputs_free = tx
                    .inputs
                    .iter()
                    .all(|input| seen_inputs.insert(input.previous_output));
                if inputs_free && tx.fee(&set).is_ok() {
                    template.push(tx);
                }
            }
            builder.set_transactions(template, &set)?;
        }

        builder.set_consensus_data(self.consensus.next_consensus_data());
        builder.set_validators(self.consensus.voting().active_validators());

        let reward = capped_reward(height, &tip.header.total_supply, &self.params);
        let supply = tip.header.total_supply.checked_add(&reward)?;
        let draft = builder.build(&self.keypair, reward, supply)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let mined = self.consensus.process_block(draft, cancel).await?;

        self.chain.append_block(&mined)?;

        // Registro da solução de PoW do minerador local
        let solution = tessera_core::store::PowSolutionRecord {
            block_hash: mined.hash(),
            height: mined.height(),
            nonce: mined.header.nonce,
            found_at: mined.header.timestamp,
        };
        let store = self.chain.store();
        let mut txn = store.begin()?;
        txn.put(
            &tessera_core::store::keys::pow_solution(
                &self.keypair.address(),
                mined.header.timestamp,
            ),
            tessera_core::store::encode_value(&solution)?,
        );
        txn.commit()?;

        self.events.publish(NodeEvent::BlockMined {
            hash: mined.hash(),
            height: mined.height(),
        });
        Ok(mined)
    }

    /// Importa um lote de blocos em ordem (sincronização de catch-up)
    ///
    /// Blocos já conhecidos são pulados; o primeiro erro interrompe o
    /// lote. Emite `SyncCompleted` com a altura final ou `SyncError`.
    ///
    /// # Errors
    ///
    /// Retorna o erro do bloco que interrompeu a sincronização
    pub async fn import_blocks(&self, blocks: Vec<Block>) -> Result<u64> {
        for block in blocks {
            if self
                .chain
                .get_block_by_hash(&block.hash())?
                .is_some()
            {
                continue;
            }
            if let Err(import_error) = self.submit_block(block).await {
                self.events.publish(NodeEvent::SyncError {
                    reason: import_error.to_string(),
                });
                return Err(import_error);
            }
        }

        let height = self.chain.current_height()?;
        self.events.publish(NodeEvent::SyncCompleted { height });
        Ok(height)
    }

    /// Estatísticas da cadeia
    ///
    /// # Errors
    ///
    /// Retorna erro se o estado não puder ser lido
    pub fn stats(&self) -> Result<tessera_core::ChainStats> {
        self.chain.stats()
    }

    /// Cria uma transferência simples a partir do saldo do nó
    ///
    /// # Errors
    ///
    /// `InsufficientFunds` se o saldo não cobrir valor + taxa
    pub fn create_transfer(
        &self,
        to: Hash256,
        amount: Amount,
        fee: Amount,
    ) -> Result<Transaction> {
        let sender = self.keypair.address();
        let total = amount.checked_add(&fee)?;

        let utxo = self.chain.utxo_set();
        let set = utxo.read().expect("utxo lock envenenado");
        let selected = set.select_for_amount(&sender, &total)?;

        let mut input_total = Amount::zero();
        let inputs: Vec<tessera_core::TxInput> = selected
            .iter()
            .map(|(outpoint, utxo)| {
                input_total += &utxo.output.value;
                tessera_core::TxInput::new(*outpoint, vec![], 0)
            })
            .collect();

        let mut outputs = vec![tessera_core::TxOutput::new(amount, vec![], to)];
        let change = input_total.checked_sub(&total)?;
        if !change.is_zero() {
            outputs.push(tessera_core::TxOutput::new(change, vec![], sender));
        }

        let nonce = self.chain.store().get_nonce(&sender)?
            + self
                .mempool
                .get_transactions()
                .iter()
                .filter(|tx| tx.sender == sender)
                .count() as u64;

        let mut tx = Transaction::new(1, sender, inputs, outputs, 0, nonce);
        tx.sign(&self.keypair)?;
        Ok(tx)
    }
}

/// Construtor do nó; injeta dependências em ordem
pub struct NodeBuilder {
    params: NetworkParams,
    store: Option<Arc<dyn ChainStore>>,
    keypair: Option<KeyPair>,
}

impl NodeBuilder {
    #[must_use]
    pub fn new(params: NetworkParams) -> Self {
        Self {
            params,
            store: None,
            keypair: None,
        }
    }

    /// Armazenamento customizado (padrão: `MemoryStore`)
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ChainStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Identidade do nó (padrão: par de chaves novo)
    #[must_use]
    pub fn with_keypair(mut self, keypair: KeyPair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Constrói e conecta os subsistemas
    ///
    /// # Errors
    ///
    /// Propaga falhas de inicialização do gênese ou de carga do estado
    pub fn build(self) -> Result<Arc<Node>> {
        let params = Arc::new(self.params);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn ChainStore>);
        let keypair = match self.keypair {
            Some(keypair) => keypair,
            None => KeyPair::generate()?,
        };

        // Ordem de dependência: armazenamento → UTXO → mempool →
        // validador → votação → consenso → cadeia
        let utxo = Arc::new(RwLock::new(UtxoSet::new()));
        let mempool = Arc::new(Mempool::new(Arc::clone(&params)));
        let validator = Arc::new(TransactionValidator::new(Arc::clone(&params)));
        let voting = Arc::new(tessera_consensus::VotingEngine::new(Arc::clone(&params)));
        let consensus = Arc::new(HybridConsensus::new(
            Arc::clone(&params),
            Arc::clone(&store),
            voting,
        ));
        let chain = Arc::new(ChainManager::new(
            Arc::clone(&params),
            Arc::clone(&store),
            utxo,
            Arc::clone(&mempool),
        ));

        // Conexão única, sem updateDependencies posterior
        chain.set_validator(Arc::clone(&consensus) as Arc<dyn tessera_core::BlockValidator>);
        let (chain_tx, chain_rx) = tokio::sync::mpsc::channel(crate::events::EVENT_CHANNEL_CAPACITY);
        chain.set_event_sender(chain_tx);

        // Gênese ou carga do estado persistido
        if store.get_chain_state()?.is_none() {
            let genesis = Block::genesis(&params, &keypair)?;
            chain.initialize(genesis)?;
        } else {
            chain.load_from_store()?;
        }

        // Estado de consenso alinhado à ponta atual
        let tip_hash = chain.tip_hash()?;
        if let Some(tip) = chain.get_block_by_hash(&tip_hash)? {
            consensus.update_state(&tip);
        }

        let (shutdown, _) = tokio::sync::watch::channel(false);
        Ok(Arc::new(Node {
            params,
            chain,
            mempool,
            validator,
            consensus,
            keypair,
            events: EventBus::new(),
            chain_events: Mutex::new(Some(chain_rx)),
            orphans: Mutex::new(std::collections::HashMap::new()),
            shutdown,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node() -> Arc<Node> {
        let mut params = NetworkParams::regtest();
        params.min_fee_per_byte = 0;
        params.coinbase_maturity = 0;
        params.difficulty_adjustment_interval = 1_000_000;
        NodeBuilder::new(params).build().unwrap()
    }

    #[tokio::test]
    async fn test_mine_and_query() {
        let node = test_node();
        assert_eq!(node.get_current_height().unwrap(), 0);

        let block = node.mine_block().await.unwrap();
        assert_eq!(block.height(), 1);
        assert_eq!(node.get_current_height().unwrap(), 1);
        assert_eq!(
            node.get_block_by_height(1).unwrap().unwrap().hash(),
            block.hash()
        );
        assert!(node
            .get_block_by_hash(&block.hash())
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_submit_transaction_flow() {
        let node = test_node();

        // Maturar o saldo do gênese
        node.mine_block().await.unwrap();

        let dest = Hash256::keccak256(b"friend");
        let tx = node
            .create_transfer(dest, Amount::from_u64(1_000), Amount::from_u64(50))
            .unwrap();

        let id = node.submit_transaction(tx).await.unwrap();
        assert_eq!(node.get_mempool().len(), 1);

        // Minerar confirma e drena o mempool
        let block = node.mine_block().await.unwrap();
        assert!(block.transactions.iter().any(|tx| tx.id() == id));
        assert!(node.get_mempool().is_empty());

        // Saldo do destinatário refletido
        let utxo = node.chain.utxo_set();
        let set = utxo.read().unwrap();
        assert_eq!(set.balance_of(&dest), Amount::from_u64(1_000));
    }

    #[tokio::test]
    async fn test_double_spend_exactly_one_accepted() {
        let node = test_node();
        node.mine_block().await.unwrap();

        let tx_a = node
            .create_transfer(Hash256::keccak256(b"a"), Amount::from_u64(100), Amount::from_u64(10))
            .unwrap();
        // Mesmo input, outro destino, mesmo nonce
        let mut tx_b = tx_a.clone();
        tx_b.outputs[0].address = Hash256::keccak256(b"b");
        tx_b.sign(&node.keypair).unwrap();

        let size_before = node.get_mempool().len();
        node.submit_transaction(tx_a).await.unwrap();
        let err = node.submit_transaction(tx_b).await.unwrap_err();

        assert!(matches!(
            err,
            ChainError::DoubleSpend(_) | ChainError::InvalidNonce { .. }
        ));
        assert_eq!(node.get_mempool().len(), size_before + 1);
    }

    #[tokio::test]
    async fn test_health_report() {
        let node = test_node();
        let report = node.health_check();
        assert!(report.healthy);
        assert!(report.unhealthy_subsystems.is_empty());
    }

    #[tokio::test]
    async fn test_events_on_mined_block() {
        let node = test_node();
        let mut events = node.subscribe();

        node.mine_block().await.unwrap();

        match events.recv().await.unwrap() {
            NodeEvent::BlockMined { height, .. } => assert_eq!(height, 1),
            other => panic!("evento inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_import_blocks_skips_known_and_reports_sync() {
        let node = test_node();
        let mut exported = Vec::new();
        for _ in 0..3 {
            exported.push(node.mine_block().await.unwrap());
        }
        let mut events = node.subscribe();

        // Reimportar a própria cadeia: tudo já conhecido, sem erro
        let height = node.import_blocks(exported).await.unwrap();
        assert_eq!(height, 3);

        loop {
            match events.recv().await.unwrap() {
                NodeEvent::SyncCompleted { height } => {
                    assert_eq!(height, 3);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_import_blocks_reports_error_on_bad_block() {
        let node = test_node();
        node.mine_block().await.unwrap();

        let mut forged = node.get_block_by_height(1).unwrap().unwrap();
        forged.header.height = 5; // quebra a ligação com a ponta
        forged.header.hash = forged.header.compute_hash().unwrap();
        let mut events = node.subscribe();

        assert!(node.import_blocks(vec![forged]).await.is_err());
        match events.recv().await.unwrap() {
            NodeEvent::SyncError { .. } => {}
            other => panic!("evento inesperado: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fork_block_wins_vote_and_reorganizes() {
        let mut params = NetworkParams::regtest();
        params.min_fee_per_byte = 0;
        params.coinbase_maturity = 0;
        params.difficulty_adjustment_interval = 1_000_000;
        params.fork_resolution_timeout_ms = 400;
        params.min_votes_for_validity = 1;
        let node = NodeBuilder::new(params).build().unwrap();

        // Cadeia ativa: gênese → A
        let block_a = node.mine_block().await.unwrap();

        // Ramo rival a partir do gênese
        let genesis = node.get_block_by_height(0).unwrap().unwrap();
        let builder = BlockBuilder::new(
            Arc::clone(&node.params),
            genesis.hash(),
            1,
            genesis.header.difficulty.clone(),
        );
        builder.set_min_timestamp(genesis.header.timestamp);
        {
            let empty = UtxoSet::new();
            builder.set_transactions(vec![], &empty).unwrap();
        }
        let reward = capped_reward(1, &genesis.header.total_supply, &node.params);
        let supply = genesis.header.total_supply.checked_add(&reward).unwrap();
        let draft = builder.build(&node.keypair, reward, supply).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let rival = node.consensus.process_block(draft, cancel).await.unwrap();
        assert_ne!(rival.hash(), block_a.hash());

        // Validadores que aprovarão o ramo rival
        let voting = node.consensus.voting();
        let mut keypairs = Vec::new();
        for _ in 0..2 {
            let keypair = KeyPair::generate().unwrap();
            voting.register_validator(keypair.address(), Amount::from_u64(100), 0);
            keypairs.push(keypair);
        }

        // Submete o bloco rival; a resolução bloqueia até o fim do
        // período, então os votos chegam em paralelo
        let submitter = Arc::clone(&node);
        let rival_clone = rival.clone();
        let submit_task =
            tokio::spawn(async move { submitter.submit_block(rival_clone).await });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        for keypair in &keypairs {
            let mut vote = Vote::new(
                keypair.address(),
                rival.hash(),
                rival.hash(),
                true,
            );
            vote.sign(keypair).unwrap();
            node.submit_vote(vote).await.unwrap();
        }

        submit_task.await.unwrap().unwrap();

        // O ramo rival venceu: ponta trocada, estado reconstruído
        assert_eq!(node.get_current_height().unwrap(), 1);
        assert_eq!(
            node.get_block_by_height(1).unwrap().unwrap().hash(),
            rival.hash()
        );
    }

    #[tokio::test]
    async fn test_submit_vote_requires_active_period() {
        let node = test_node();
        let keypair = KeyPair::generate().unwrap();
        let mut vote = Vote::new(
            keypair.address(),
            Hash256::keccak256(b"block"),
            Hash256::keccak256(b"chain"),
            true,
        );
        vote.sign(&keypair).unwrap();

        let err = node.submit_vote(vote).await.unwrap_err();
        assert!(matches!(err, ChainError::InvalidVote(_)));
    }
}
