//! Gerenciador da cadeia
//!
//! Dono exclusivo da sequência de blocos e do conjunto de pontas.
//! Todo caminho que muta a cadeia serializa em `chain_lock`; blocos na
//! altura `h+1` observam o estado totalmente comitado da altura `h`.
//! Reorganizações usam snapshot do armazenamento para limitar o raio
//! da falha.

use crate::block::{median_time_past, Block};
use crate::mempool::Mempool;
use crate::params::NetworkParams;
use crate::reward::capped_reward;
use crate::store::{encode_value, keys, ChainStateRecord, ChainStore, StoreExt};
use crate::utxo::UtxoSet;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::{Amount, ChainError, CircuitBreaker, Hash256, Result, Timestamp};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Passos máximos da classificação iterativa de uma ponta
const TIP_CLASSIFY_MAX_STEPS: usize = 100;

/// Validação de consenso plugada pelo construtor do nó
///
/// O gerenciador da cadeia não conhece o motor híbrido; recebe esta
/// interface já construída, quebrando o ciclo consenso ↔ cadeia.
pub trait BlockValidator: Send + Sync {
    /// Validação completa de consenso (merkle, PoW, fork)
    ///
    /// # Errors
    ///
    /// Retorna o erro tageado da primeira verificação que falhar
    fn validate_block(&self, block: &Block) -> Result<()>;

    /// Notificação pós-commit para atualização de estado de consenso
    fn on_block_committed(&self, block: &Block);
}

/// Estado de uma ponta de cadeia
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TipStatus {
    /// Ponta da cadeia ativa
    Active,
    /// Ramo válido conectado à cadeia ativa
    ValidFork,
    /// Cabeçalhos conhecidos sem conexão validada
    ValidHeaders,
    /// Ramo marcado como inválido
    Invalid,
}

/// Ponta de cadeia observável
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTip {
    pub height: u64,
    pub hash: Hash256,
    pub branch_length: u64,
    pub status: TipStatus,
    pub first_block_hash: Hash256,
    pub last_validated_at: Timestamp,
}

/// Eventos emitidos pelo gerenciador
#[derive(Debug, Clone)]
pub enum ChainEvent {
    BlockAppended { hash: Hash256, height: u64 },
    ReorgCompleted { old_tip: Hash256, new_tip: Hash256, ancestor_height: u64 },
}

/// Estatísticas da cadeia
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStats {
    pub height: u64,
    pub tip_hash: Hash256,
    pub total_transactions: u64,
    pub total_utxos: u64,
    pub circulating_supply: Amount,
    pub last_block_time: Timestamp,
}

#[derive(Debug, Clone, Copy)]
struct HeightCache {
    value: u64,
    cached_at: Instant,
}

/// Gerenciador da cadeia
pub struct ChainManager {
    params: Arc<NetworkParams>,
    store: Arc<dyn ChainStore>,
    utxo: Arc<RwLock<UtxoSet>>,
    mempool: Arc<Mempool>,
    validator: RwLock<Option<Arc<dyn BlockValidator>>>,
    /// Serializa todo caminho que muta a cadeia
    chain_lock: Mutex<()>,
    /// Impede reorganizações concorrentes
    reorg_lock: Mutex<()>,
    height_cache: Mutex<Option<HeightCache>>,
    /// Vetor snapshot dos hashes da cadeia ativa
    chain: RwLock<Vec<Hash256>>,
    /// Blocos competidores observados (alimenta `get_chain_tips`)
    side_blocks: RwLock<HashMap<Hash256, Block>>,
    health_breaker: CircuitBreaker,
    events: RwLock<Option<tokio::sync::mpsc::Sender<ChainEvent>>>,
    total_transactions: RwLock<u64>,
}

impl ChainManager {
    #[must_use]
    pub fn new(
        params: Arc<NetworkParams>,
        store: Arc<dyn ChainStore>,
        utxo: Arc<RwLock<UtxoSet>>,
        mempool: Arc<Mempool>,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            "health",
            params.breaker_threshold,
            Duration::from_millis(params.breaker_reset_timeout_ms),
        );
        Self {
            params,
            store,
            utxo,
            mempool,
            validator: RwLock::new(None),
            chain_lock: Mutex::new(()),
            reorg_lock: Mutex::new(()),
            height_cache: Mutex::new(None),
            chain: RwLock::new(Vec::new()),
            side_blocks: RwLock::new(HashMap::new()),
            health_breaker: breaker,
            events: RwLock::new(None),
            total_transactions: RwLock::new(0),
        }
    }

    /// Conecta o validador de consenso (feito uma única vez pelo builder)
    pub fn set_validator(&self, validator: Arc<dyn BlockValidator>) {
        *self.validator.write().expect("validator lock envenenado") = Some(validator);
    }

    /// Conecta o canal de eventos do nó
    pub fn set_event_sender(&self, sender: tokio::sync::mpsc::Sender<ChainEvent>) {
        *self.events.write().expect("events lock envenenado") = Some(sender);
    }

    fn emit(&self, event: ChainEvent) {
        if let Some(sender) = self.events.read().expect("events lock envenenado").as_ref() {
            // Canal cheio ou fechado não pode travar o caminho de append
            let _ = sender.try_send(event);
        }
    }

    /// Instala o bloco gênese em armazenamento vazio
    ///
    /// # Errors
    ///
    /// Retorna erro se já houver estado ou se a persistência falhar
    pub fn initialize(&self, genesis: Block) -> Result<()> {
        let _chain_guard = self.chain_lock.lock().expect("chain lock envenenado");

        if self.store.get_chain_state()?.is_some() {
            return Err(ChainError::InvalidBlock(
                "Armazenamento já inicializado".to_string(),
            ));
        }

        let mut staged = UtxoSet::new();
        staged.apply_block(&genesis)?;

        self.persist_block(&genesis, &staged)?;
        *self.utxo.write().expect("utxo lock envenenado") = staged;
        self.chain
            .write()
            .expect("chain vector envenenado")
            .push(genesis.hash());
        *self.total_transactions.write().expect("contador envenenado") =
            genesis.transactions.len() as u64;
        self.invalidate_height_cache();

        info!(hash = %genesis.hash(), "genesis installed");
        Ok(())
    }

    /// Restaura o estado em memória a partir do armazenamento
    ///
    /// # Errors
    ///
    /// Retorna erro se a cadeia persistida estiver inconsistente
    pub fn load_from_store(&self) -> Result<()> {
        let _chain_guard = self.chain_lock.lock().expect("chain lock envenenado");
        let state = self
            .store
            .get_chain_state()?
            .ok_or_else(|| ChainError::UnhealthyState("armazenamento vazio".to_string()))?;

        let mut hashes = Vec::with_capacity(state.height as usize + 1);
        let mut rebuilt = UtxoSet::new();
        let mut tx_count = 0u64;
        for height in 0..=state.height {
            let block = self
                .store
                .get_block_by_height(height)?
                .ok_or_else(|| ChainError::StoreFatal(format!("bloco {height} ausente")))?;
            tx_count += block.transactions.len() as u64;
            rebuilt.apply_block(&block)?;
            hashes.push(block.hash());
        }

        *self.utxo.write().expect("utxo lock envenenado") = rebuilt;
        *self.chain.write().expect("chain vector envenenado") = hashes;
        *self.total_transactions.write().expect("contador envenenado") = tx_count;
        self.invalidate_height_cache();
        Ok(())
    }

    /// Anexa um bloco à ponta da cadeia ativa
    ///
    /// Sob `chain_lock`: saúde → validação pré-anexação → transação de
    /// armazenamento → commit → troca do snapshot em memória → efeitos
    /// pós-commit (mempool, consenso, eventos).
    ///
    /// # Errors
    ///
    /// Retorna o erro de validação, ou `AppendFailed` em falha de
    /// persistência (com rollback da transação)
    pub fn append_block(&self, block: &Block) -> Result<()> {
        let _chain_guard = self.chain_lock.lock().expect("chain lock envenenado");
        self.append_block_inner(block)
    }

    /// Corpo do append; o chamador já detém `chain_lock`
    fn append_block_inner(&self, block: &Block) -> Result<()> {
        // 1. Saúde
        self.health_check()?;

        // 2. Validação pré-anexação
        self.validate_block_pre_add(block)?;

        // 3–4. Persistir e comitar; UTXO preparado fora da transação
        let mut staged = self
            .utxo
            .read()
            .expect("utxo lock envenenado")
            .clone();
        staged.apply_block(block)?;

        if let Err(persist_error) = self.persist_block(block, &staged) {
            error!(
                operation = "append_block",
                height = block.height(),
                error = %persist_error,
                "append failed, transaction rolled back"
            );
            return Err(ChainError::AppendFailed(persist_error.to_string()));
        }

        // Troca do snapshot em memória
        *self.utxo.write().expect("utxo lock envenenado") = staged;
        self.chain
            .write()
            .expect("chain vector envenenado")
            .push(block.hash());
        *self.total_transactions.write().expect("contador envenenado") +=
            block.transactions.len() as u64;
        self.invalidate_height_cache();

        // 5. Pós-commit
        let confirmed: Vec<Hash256> = block.transactions.iter().map(|tx| tx.id()).collect();
        self.mempool.remove_batch(&confirmed);
        if let Some(validator) = self
            .validator
            .read()
            .expect("validator lock envenenado")
            .as_ref()
        {
            validator.on_block_committed(block);
        }
        self.emit(ChainEvent::BlockAppended {
            hash: block.hash(),
            height: block.height(),
        });

        info!(height = block.height(), hash = %block.hash(), "block appended");
        Ok(())
    }

    /// Validações de assinatura, estrutura, consenso e ligação ao pai
    fn validate_block_pre_add(&self, block: &Block) -> Result<()> {
        if !block.header.verify_signature()? {
            return Err(ChainError::InvalidSignature);
        }
        block.validate_structure(&self.params)?;

        if let Some(validator) = self
            .validator
            .read()
            .expect("validator lock envenenado")
            .as_ref()
        {
            validator.validate_block(block)?;
        }

        let state = self
            .store
            .get_chain_state()?
            .ok_or_else(|| ChainError::UnhealthyState("cadeia não inicializada".to_string()))?;
        let parent = self
            .store
            .get_block(&state.last_block_hash)?
            .ok_or_else(|| ChainError::StoreFatal("bloco da ponta ausente".to_string()))?;

        if block.header.previous_hash != parent.hash() {
            return Err(ChainError::InvalidBlock(
                "previous_hash não aponta para a ponta ativa".to_string(),
            ));
        }
        if block.height() != parent.height() + 1 {
            return Err(ChainError::InvalidBlock(format!(
                "Altura {} esperava {}",
                block.height(),
                parent.height() + 1
            )));
        }

        // Timestamp: estritamente acima da mediana dos últimos 11 e
        // dentro do drift permitido
        let mut ancestors = Vec::new();
        let start = parent.height().saturating_sub(10);
        for height in start..=parent.height() {
            if let Some(ancestor) = self.store.get_block_by_height(height)? {
                ancestors.push(ancestor.header.timestamp);
            }
        }
        if let Some(median) = median_time_past(&ancestors) {
            if block.header.timestamp <= median {
                return Err(ChainError::InvalidTimestamp(format!(
                    "Timestamp {} não excede a mediana {median}",
                    block.header.timestamp
                )));
            }
        }
        let now = Utc::now().timestamp_millis();
        if block.header.timestamp - now > self.params.max_time_drift_ms {
            return Err(ChainError::InvalidTimestamp(
                "Timestamp à frente do relógio local".to_string(),
            ));
        }

        // Economia: coinbase = recompensa limitada + taxas; oferta
        // declarada consistente com o pai. As taxas são somadas sobre
        // uma visão incremental: saídas criadas por transações
        // anteriores do próprio bloco ficam visíveis para inputs
        // posteriores, como em `apply_block`.
        let mut view = self.utxo.read().expect("utxo lock envenenado").clone();
        let mut fees = Amount::zero();
        for (index, tx) in block.transactions.iter().enumerate() {
            if index > 0 {
                fees = fees.checked_add(&tx.fee(&view)?)?;
            }
            view.stage_transaction(tx, block.height(), block.header.timestamp);
        }
        drop(view);

        let expected_reward = capped_reward(
            block.height(),
            &parent.header.total_supply,
            &self.params,
        );
        let expected_coinbase = expected_reward.checked_add(&fees)?;
        let coinbase_value = block.transactions[0].total_output_value()?;
        if coinbase_value != expected_coinbase {
            return Err(ChainError::InvalidBlock(format!(
                "Coinbase {coinbase_value} difere do esperado {expected_coinbase}"
            )));
        }
        let expected_supply = parent.header.total_supply.checked_add(&expected_reward)?;
        if block.header.total_supply != expected_supply {
            return Err(ChainError::InvalidBlock(
                "total_supply inconsistente com o pai".to_string(),
            ));
        }

        Ok(())
    }

    /// Persiste bloco, índices, nonces e delta de UTXO em uma transação
    fn persist_block(&self, block: &Block, resulting_utxo: &UtxoSet) -> Result<()> {
        let mut txn = self.store.begin()?;

        txn.put(&keys::block(&block.hash()), encode_value(block)?);
        txn.put(
            &keys::block_by_height(block.height()),
            encode_value(&block.hash())?,
        );
        txn.put(
            &keys::chain_state(),
            encode_value(&ChainStateRecord {
                height: block.height(),
                last_block_hash: block.hash(),
                timestamp: block.header.timestamp,
            })?,
        );

        // Delta do índice por endereço acumulado no bloco inteiro
        let mut index_added: HashMap<Hash256, Vec<shared::OutPoint>> = HashMap::new();
        let mut index_removed: HashMap<Hash256, Vec<shared::OutPoint>> = HashMap::new();

        for tx in &block.transactions {
            let id = tx.id();
            txn.put(&keys::transaction(&id), encode_value(tx)?);

            if !tx.is_coinbase() {
                txn.put(&keys::nonce(&tx.sender), encode_value(&(tx.nonce + 1))?);
                // Inputs consumidos: registro marcado como gasto
                for input in &tx.inputs {
                    if let Some(utxo) = resulting_utxo.get(&input.previous_output) {
                        txn.put(&keys::utxo(&input.previous_output), encode_value(utxo)?);
                        index_removed
                            .entry(utxo.output.address)
                            .or_default()
                            .push(input.previous_output);
                    }
                }
            }
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = shared::OutPoint::new(id, index as u32);
                if let Some(utxo) = resulting_utxo.get(&outpoint) {
                    txn.put(&keys::utxo(&outpoint), encode_value(utxo)?);
                }
                index_added
                    .entry(output.address)
                    .or_default()
                    .push(outpoint);
            }
        }

        // Índice `utxos_by_address` atualizado na mesma transação
        let mut touched: std::collections::HashSet<Hash256> = HashSet::new();
        touched.extend(index_added.keys().copied());
        touched.extend(index_removed.keys().copied());
        for address in touched {
            let mut set: std::collections::BTreeSet<shared::OutPoint> = self
                .store
                .get_json(&keys::utxos_by_address(&address))?
                .unwrap_or_default();
            for outpoint in index_removed.get(&address).into_iter().flatten() {
                set.remove(outpoint);
            }
            for outpoint in index_added.get(&address).into_iter().flatten() {
                set.insert(*outpoint);
            }
            txn.put(&keys::utxos_by_address(&address), encode_value(&set)?);
        }

        for vote in &block.votes {
            txn.put(
                &keys::vote(&block.hash(), &vote.voter),
                encode_value(vote)?,
            );
        }

        txn.commit()
    }

    /// Altura atual com cache TTL
    ///
    /// # Errors
    ///
    /// Retorna erro se o estado da cadeia não puder ser lido
    pub fn current_height(&self) -> Result<u64> {
        let ttl = Duration::from_millis(self.params.height_cache_ttl_ms.max(0) as u64);
        {
            let cache = self.height_cache.lock().expect("height cache envenenado");
            if let Some(entry) = cache.as_ref() {
                if entry.cached_at.elapsed() < ttl {
                    return Ok(entry.value);
                }
            }
        }

        let state = self
            .store
            .get_chain_state()?
            .ok_or_else(|| ChainError::UnhealthyState("cadeia não inicializada".to_string()))?;

        let mut cache = self.height_cache.lock().expect("height cache envenenado");
        *cache = Some(HeightCache {
            value: state.height,
            cached_at: Instant::now(),
        });
        Ok(state.height)
    }

    fn invalidate_height_cache(&self) {
        *self.height_cache.lock().expect("height cache envenenado") = None;
    }

    /// Hash da ponta ativa
    ///
    /// # Errors
    ///
    /// Retorna erro se o estado da cadeia não puder ser lido
    pub fn tip_hash(&self) -> Result<Hash256> {
        self.store
            .get_chain_state()?
            .map(|state| state.last_block_hash)
            .ok_or_else(|| ChainError::UnhealthyState("cadeia não inicializada".to_string()))
    }

    /// Bloco por hash
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    pub fn get_block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>> {
        self.store.get_block(hash)
    }

    /// Bloco por altura
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        self.store.get_block_by_height(height)
    }

    /// Registra um bloco competidor observado em fork
    pub fn record_side_block(&self, block: &Block) {
        self.side_blocks
            .write()
            .expect("side blocks envenenado")
            .insert(block.hash(), block.clone());
    }

    /// Pontas conhecidas: a ativa mais cada competidor classificado
    ///
    /// # Errors
    ///
    /// Retorna erro se o estado da cadeia não puder ser lido
    pub fn get_chain_tips(&self) -> Result<Vec<ChainTip>> {
        let state = self
            .store
            .get_chain_state()?
            .ok_or_else(|| ChainError::UnhealthyState("cadeia não inicializada".to_string()))?;
        let now = Utc::now().timestamp_millis();

        let mut tips = vec![ChainTip {
            height: state.height,
            hash: state.last_block_hash,
            branch_length: 0,
            status: TipStatus::Active,
            first_block_hash: state.last_block_hash,
            last_validated_at: now,
        }];

        let chain = self.chain.read().expect("chain vector envenenado");
        let on_active = |hash: &Hash256| chain.iter().any(|h| h == hash);

        let side = self.side_blocks.read().expect("side blocks envenenado");
        for block in side.values() {
            // Classificação por travessia iterativa limitada
            let mut cursor = block.clone();
            let mut steps = 0usize;
            let mut status = TipStatus::ValidHeaders;
            let mut first_block_hash = cursor.hash();

            while steps < TIP_CLASSIFY_MAX_STEPS {
                let parent_hash = cursor.header.previous_hash;
                if on_active(&parent_hash) {
                    status = TipStatus::ValidFork;
                    break;
                }
                match side
                    .get(&parent_hash)
                    .cloned()
                    .or(self.store.get_block(&parent_hash)?)
                {
                    Some(parent) => {
                        first_block_hash = parent.hash();
                        cursor = parent;
                        steps += 1;
                    }
                    None => {
                        status = TipStatus::ValidHeaders;
                        break;
                    }
                }
            }

            tips.push(ChainTip {
                height: block.height(),
                hash: block.hash(),
                branch_length: steps as u64 + 1,
                status,
                first_block_hash,
                last_validated_at: now,
            });
        }

        Ok(tips)
    }

    /// Reverte o bloco da ponta: desfaz UTXOs, devolve transações ao
    /// mempool e recua o estado da cadeia
    fn revert_tip_block(&self, block: &Block) -> Result<()> {
        let prior_height = block
            .height()
            .checked_sub(1)
            .ok_or_else(|| ChainError::InvalidBlock("não há como reverter o gênese".to_string()))?;
        let parent = self
            .store
            .get_block_by_height(prior_height)?
            .ok_or_else(|| ChainError::StoreFatal("pai ausente na reversão".to_string()))?;

        // UTXO em memória: transações em ordem inversa, estado prévio
        // autoritativo resolvido do armazenamento
        {
            let mut utxo = self.utxo.write().expect("utxo lock envenenado");
            for tx in block.transactions.iter().rev() {
                let store = Arc::clone(&self.store);
                utxo.revert_transaction(tx, |outpoint| {
                    store
                        .get_utxo(outpoint)?
                        .ok_or_else(|| {
                            ChainError::StoreFatal(format!(
                                "estado prévio de {outpoint} ausente"
                            ))
                        })
                })?;
            }
        }

        let mut txn = self.store.begin()?;
        txn.delete(&keys::block_by_height(block.height()));
        txn.put(
            &keys::chain_state(),
            encode_value(&ChainStateRecord {
                height: parent.height(),
                last_block_hash: parent.hash(),
                timestamp: parent.header.timestamp,
            })?,
        );
        // Registros de UTXO restaurados/removidos, com o índice por
        // endereço desfeito no mesmo commit
        let mut index_added: HashMap<Hash256, Vec<shared::OutPoint>> = HashMap::new();
        let mut index_removed: HashMap<Hash256, Vec<shared::OutPoint>> = HashMap::new();
        for tx in block.transactions.iter().rev() {
            let id = tx.id();
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = shared::OutPoint::new(id, index as u32);
                txn.delete(&keys::utxo(&outpoint));
                index_removed
                    .entry(output.address)
                    .or_default()
                    .push(outpoint);
            }
            if !tx.is_coinbase() {
                txn.put(&keys::nonce(&tx.sender), encode_value(&tx.nonce)?);
                for input in &tx.inputs {
                    if let Some(mut prior) = self.store.get_utxo(&input.previous_output)? {
                        prior.spent = false;
                        index_added
                            .entry(prior.output.address)
                            .or_default()
                            .push(input.previous_output);
                        txn.put(&keys::utxo(&input.previous_output), encode_value(&prior)?);
                    }
                }
            }
        }
        let mut touched: HashSet<Hash256> = HashSet::new();
        touched.extend(index_added.keys().copied());
        touched.extend(index_removed.keys().copied());
        for address in touched {
            let mut set: std::collections::BTreeSet<shared::OutPoint> = self
                .store
                .get_json(&keys::utxos_by_address(&address))?
                .unwrap_or_default();
            for outpoint in index_removed.get(&address).into_iter().flatten() {
                set.remove(outpoint);
            }
            for outpoint in index_added.get(&address).into_iter().flatten() {
                set.insert(*outpoint);
            }
            txn.put(&keys::utxos_by_address(&address), encode_value(&set)?);
        }
        txn.commit()?;

        self.chain.write().expect("chain vector envenenado").pop();
        {
            let mut count = self.total_transactions.write().expect("contador envenenado");
            *count = count.saturating_sub(block.transactions.len() as u64);
        }
        self.invalidate_height_cache();

        // Transações órfãs voltam ao mempool (melhor esforço)
        let utxo = self.utxo.read().expect("utxo lock envenenado");
        for tx in block.transactions.iter().skip(1) {
            let fee = match tx.fee(&utxo) {
                Ok(fee) => fee,
                Err(_) => continue,
            };
            let confirmed_nonce = self.store.get_nonce(&tx.sender).unwrap_or(0);
            if let Err(add_error) = self.mempool.add(tx.clone(), fee, confirmed_nonce) {
                warn!(tx = %tx.id(), error = %add_error, "orphaned tx not readmitted");
            }
        }

        Ok(())
    }

    /// Reorganiza a cadeia para um ramo alternativo
    ///
    /// `branch` é o sufixo alternativo em ordem crescente; o
    /// `previous_hash` do primeiro bloco deve apontar para um ancestral
    /// da cadeia ativa dentro de `max_reorg_depth`. Em qualquer falha o
    /// snapshot do armazenamento e o estado em memória são restaurados.
    ///
    /// # Errors
    ///
    /// `ForkDepthExceeded` para ancestral profundo demais;
    /// `AppendFailed` para falha na aplicação (após rollback)
    pub fn reorganize(&self, branch: &[Block]) -> Result<()> {
        let _reorg_guard = self.reorg_lock.lock().expect("reorg lock envenenado");
        let _chain_guard = self.chain_lock.lock().expect("chain lock envenenado");

        let first = branch
            .first()
            .ok_or_else(|| ChainError::InvalidBlock("ramo vazio".to_string()))?;

        let current_height = self.current_height()?;
        let old_tip = self.tip_hash()?;

        // Ancestral comum: caminhar por previous_hash limitado à
        // profundidade máxima
        let ancestor = self
            .store
            .get_block(&first.header.previous_hash)?
            .ok_or_else(|| {
                ChainError::InvalidBlock("ancestral do ramo desconhecido".to_string())
            })?;
        let depth = current_height.saturating_sub(ancestor.height());
        if depth > self.params.max_reorg_depth {
            return Err(ChainError::ForkDepthExceeded {
                depth,
                max: self.params.max_reorg_depth,
            });
        }

        // Snapshot do armazenamento + estado em memória pareado
        let snapshot = self.store.snapshot()?;
        let utxo_backup = self.utxo.read().expect("utxo lock envenenado").clone();
        let chain_backup = self.chain.read().expect("chain vector envenenado").clone();
        let tx_count_backup = *self.total_transactions.read().expect("contador envenenado");

        let result = (|| -> Result<()> {
            // Reverter até o ancestral
            for height in ((ancestor.height() + 1)..=current_height).rev() {
                let block = self
                    .store
                    .get_block_by_height(height)?
                    .ok_or_else(|| ChainError::StoreFatal(format!("bloco {height} ausente")))?;
                self.revert_tip_block(&block)?;
            }

            // Aplicar o ramo novo em ordem
            for block in branch {
                self.append_block_inner(block)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.store.drop_snapshot(snapshot);
                self.emit(ChainEvent::ReorgCompleted {
                    old_tip,
                    new_tip: self.tip_hash()?,
                    ancestor_height: ancestor.height(),
                });
                info!(
                    ancestor = ancestor.height(),
                    new_tip = %self.tip_hash()?,
                    "reorganization completed"
                );
                Ok(())
            }
            Err(reorg_error) => {
                error!(
                    operation = "reorganize",
                    height = current_height,
                    error = %reorg_error,
                    "reorganization failed, restoring snapshot"
                );
                self.store.restore_snapshot(snapshot)?;
                *self.utxo.write().expect("utxo lock envenenado") = utxo_backup;
                *self.chain.write().expect("chain vector envenenado") = chain_backup;
                *self.total_transactions.write().expect("contador envenenado") = tx_count_backup;
                self.invalidate_height_cache();
                Err(ChainError::AppendFailed(reorg_error.to_string()))
            }
        }
    }

    /// Verificação de saúde exigida antes de anexar
    ///
    /// # Errors
    ///
    /// `CircuitOpen` com o breaker aberto; `UnhealthyState` se o
    /// armazenamento estiver ilegível
    pub fn health_check(&self) -> Result<()> {
        self.health_breaker.check()?;

        match self.store.get(&keys::chain_state()) {
            Ok(_) => {
                self.health_breaker.record_success();
                Ok(())
            }
            Err(store_error) => {
                self.health_breaker.record_failure();
                Err(ChainError::UnhealthyState(store_error.to_string()))
            }
        }
    }

    /// Estatísticas da cadeia ativa
    ///
    /// # Errors
    ///
    /// Retorna erro se o estado não puder ser lido
    pub fn stats(&self) -> Result<ChainStats> {
        let state = self
            .store
            .get_chain_state()?
            .ok_or_else(|| ChainError::UnhealthyState("cadeia não inicializada".to_string()))?;
        let utxo = self.utxo.read().expect("utxo lock envenenado");

        Ok(ChainStats {
            height: state.height,
            tip_hash: state.last_block_hash,
            total_transactions: *self.total_transactions.read().expect("contador envenenado"),
            total_utxos: utxo.unspent_len() as u64,
            circulating_supply: utxo.total_value()?,
            last_block_time: state.timestamp,
        })
    }

    /// Verifica a integridade do conjunto de UTXOs e o reconstrói por
    /// replay determinístico do gênese quando a verificação falha
    ///
    /// Procedimento de manutenção; em produção, restrito a janelas de
    /// manutenção.
    ///
    /// # Errors
    ///
    /// Retorna erro se o replay também falhar
    pub fn verify_and_repair_utxo(&self) -> Result<bool> {
        let _chain_guard = self.chain_lock.lock().expect("chain lock envenenado");

        let verdict = self
            .utxo
            .read()
            .expect("utxo lock envenenado")
            .validate();
        let Err(validation_error) = verdict else {
            return Ok(false);
        };
        warn!(error = %validation_error, "UTXO set failed validation, rebuilding");

        let state = self
            .store
            .get_chain_state()?
            .ok_or_else(|| ChainError::UnhealthyState("cadeia não inicializada".to_string()))?;

        let mut rebuilt = UtxoSet::new();
        for height in 0..=state.height {
            let block = self
                .store
                .get_block_by_height(height)?
                .ok_or_else(|| ChainError::StoreFatal(format!("bloco {height} ausente")))?;
            rebuilt.apply_block(&block)?;
        }
        rebuilt.validate()?;

        *self.utxo.write().expect("utxo lock envenenado") = rebuilt;
        info!(height = state.height, "UTXO set rebuilt from genesis replay");
        Ok(true)
    }

    /// UTXOs de um endereço segundo o índice persistido
    ///
    /// # Errors
    ///
    /// Propaga erros do armazenamento
    pub fn utxos_for_address(
        &self,
        address: &Hash256,
    ) -> Result<Vec<shared::OutPoint>> {
        let set: std::collections::BTreeSet<shared::OutPoint> = self
            .store
            .get_json(&keys::utxos_by_address(address))?
            .unwrap_or_default();
        Ok(set.into_iter().collect())
    }

    /// Acesso ao conjunto de UTXOs
    #[must_use]
    pub fn utxo_set(&self) -> Arc<RwLock<UtxoSet>> {
        Arc::clone(&self.utxo)
    }

    /// Acesso ao armazenamento
    #[must_use]
    pub fn store(&self) -> Arc<dyn ChainStore> {
        Arc::clone(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BlockBuilder;
    use crate::pow::PowEngine;
    use crate::store::MemoryStore;
    use crate::transaction::{Transaction, TxInput, TxOutput};
    use shared::{KeyPair, OutPoint};
    use std::sync::atomic::AtomicBool;

    struct Harness {
        params: Arc<NetworkParams>,
        manager: ChainManager,
        keypair: KeyPair,
        pow: PowEngine,
    }

    fn harness() -> Harness {
        let mut params = NetworkParams::regtest();
        params.min_fee_per_byte = 0;
        params.coinbase_maturity = 0;
        // Sem retarget nos testes de append
        params.difficulty_adjustment_interval = 1_000_000;
        let params = Arc::new(params);

        let store: Arc<dyn ChainStore> = Arc::new(MemoryStore::new());
        let utxo = Arc::new(RwLock::new(UtxoSet::new()));
        let mempool = Arc::new(Mempool::new(Arc::clone(&params)));
        let manager = ChainManager::new(
            Arc::clone(&params),
            store,
            utxo,
            mempool,
        );
        let keypair = KeyPair::generate().unwrap();
        let genesis = Block::genesis(&params, &keypair).unwrap();
        manager.initialize(genesis).unwrap();

        Harness {
            pow: PowEngine::new(Arc::clone(&params)),
            params,
            manager,
            keypair,
        }
    }

    fn mine_child(h: &Harness, transactions: Vec<Transaction>) -> Block {
        let tip_hash = h.manager.tip_hash().unwrap();
        let tip = h.manager.get_block_by_hash(&tip_hash).unwrap().unwrap();
        let height = tip.height() + 1;

        let builder = BlockBuilder::new(
            Arc::clone(&h.params),
            tip.hash(),
            height,
            tip.header.difficulty.clone(),
        );
        builder.set_min_timestamp(tip.header.timestamp);
        {
            let utxo = h.manager.utxo_set();
            let set = utxo.read().unwrap();
            builder.set_transactions(transactions, &set).unwrap();
        }

        let reward = capped_reward(height, &tip.header.total_supply, &h.params);
        let supply = tip.header.total_supply.checked_add(&reward).unwrap();
        let draft = builder.build(&h.keypair, reward, supply).unwrap();

        let cancel = Arc::new(AtomicBool::new(false));
        let mined = h.pow.mine(&draft.header, &cancel).unwrap();
        let mut block = draft;
        block.header = mined.header;
        block
    }

    fn spend_outpoint(
        h: &Harness,
        outpoint: OutPoint,
        nonce: u64,
        outputs: Vec<(u64, &[u8])>,
    ) -> Transaction {
        let mut tx = Transaction::new(
            1,
            h.keypair.address(),
            vec![TxInput::new(outpoint, vec![], 0)],
            outputs
                .into_iter()
                .map(|(value, tag)| {
                    TxOutput::new(Amount::from_u64(value), vec![], Hash256::keccak256(tag))
                })
                .collect(),
            0,
            nonce,
        );
        tx.sign(&h.keypair).unwrap();
        tx
    }

    #[test]
    fn test_linear_append() {
        let h = harness();
        let genesis_coinbase = OutPoint::new(
            h.manager
                .get_block_by_height(0)
                .unwrap()
                .unwrap()
                .transactions[0]
                .id(),
            0,
        );

        let utxos_before = h.manager.utxo_set().read().unwrap().unspent_len();

        // Gasta 5000 em duas saídas (4000, 900) com taxa 100
        let tx = spend_outpoint(&h, genesis_coinbase, 0, vec![(4_000, b"a"), (900, b"b")]);
        let block = mine_child(&h, vec![tx]);

        h.manager.append_block(&block).unwrap();

        assert_eq!(h.manager.current_height().unwrap(), 1);
        let utxo = h.manager.utxo_set();
        let set = utxo.read().unwrap();
        // Perde 1 (gasta), ganha 2 + coinbase
        assert_eq!(set.unspent_len(), utxos_before - 1 + 2 + 1);
        assert_eq!(h.manager.mempool.get_size(), 0);
    }

    #[test]
    fn test_append_accepts_chained_spends_within_block() {
        let h = harness();
        let genesis_coinbase = OutPoint::new(
            h.manager
                .get_block_by_height(0)
                .unwrap()
                .unwrap()
                .transactions[0]
                .id(),
            0,
        );

        // tx2 gasta a saída criada por tx1 no mesmo bloco
        let tx1 = spend_outpoint(&h, genesis_coinbase, 0, vec![(4_900, b"hop")]);
        let tx2 = spend_outpoint(&h, OutPoint::new(tx1.id(), 0), 1, vec![(4_800, b"final")]);

        let block = mine_child(&h, vec![tx1, tx2]);
        h.manager.append_block(&block).unwrap();

        assert_eq!(h.manager.current_height().unwrap(), 1);
        // Taxas encadeadas (100 + 100) entram na coinbase
        let coinbase_value = block.transactions[0].total_output_value().unwrap();
        assert_eq!(coinbase_value, Amount::from_u64(5_000 + 200));

        // Saída intermediária nasce gasta; a final permanece
        let utxo = h.manager.utxo_set();
        let set = utxo.read().unwrap();
        assert!(!set.contains_unspent(&OutPoint::new(block.transactions[1].id(), 0)));
        assert_eq!(
            set.balance_of(&Hash256::keccak256(b"final")),
            Amount::from_u64(4_800)
        );
    }

    #[test]
    fn test_append_rejects_wrong_parent() {
        let h = harness();
        let mut block = mine_child(&h, vec![]);
        block.header.previous_hash = Hash256::keccak256(b"elsewhere");
        // Reassina e reminera para passar nas fases anteriores
        block.header.sign(&h.keypair).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let mined = h.pow.mine(&block.header, &cancel).unwrap();
        block.header = mined.header;

        let err = h.manager.append_block(&block).unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock(_)));
        assert_eq!(h.manager.current_height().unwrap(), 0);
    }

    #[test]
    fn test_append_rejects_wrong_coinbase_value() {
        let h = harness();
        let tip = h.manager.get_block_by_height(0).unwrap().unwrap();

        let builder = BlockBuilder::new(
            Arc::clone(&h.params),
            tip.hash(),
            1,
            tip.header.difficulty.clone(),
        );
        {
            let utxo = h.manager.utxo_set();
            let set = utxo.read().unwrap();
            builder.set_transactions(vec![], &set).unwrap();
        }
        // Recompensa inflada
        let bogus_reward = Amount::from_u64(999_999);
        let supply = tip.header.total_supply.checked_add(&bogus_reward).unwrap();
        let draft = builder.build(&h.keypair, bogus_reward, supply).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let mined = h.pow.mine(&draft.header, &cancel).unwrap();
        let mut block = draft;
        block.header = mined.header;

        let err = h.manager.append_block(&block).unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock(_)));
    }

    #[test]
    fn test_height_cache_invalidated_on_append() {
        let h = harness();
        assert_eq!(h.manager.current_height().unwrap(), 0);

        let block = mine_child(&h, vec![]);
        h.manager.append_block(&block).unwrap();
        assert_eq!(h.manager.current_height().unwrap(), 1);
    }

    #[test]
    fn test_reorganize_to_sibling_branch() {
        let h = harness();

        // Cadeia ativa: gênese → A
        let block_a = mine_child(&h, vec![]);
        h.manager.append_block(&block_a).unwrap();

        // Ramo alternativo a partir do gênese: B1 → B2
        let genesis = h.manager.get_block_by_height(0).unwrap().unwrap();
        let build_on = |parent: &Block, height: u64| {
            let builder = BlockBuilder::new(
                Arc::clone(&h.params),
                parent.hash(),
                height,
                parent.header.difficulty.clone(),
            );
            builder.set_min_timestamp(parent.header.timestamp);
            let empty = UtxoSet::new();
            builder.set_transactions(vec![], &empty).unwrap();
            let reward = capped_reward(height, &parent.header.total_supply, &h.params);
            let supply = parent.header.total_supply.checked_add(&reward).unwrap();
            let draft = builder.build(&h.keypair, reward, supply).unwrap();
            let cancel = Arc::new(AtomicBool::new(false));
            let mined = h.pow.mine(&draft.header, &cancel).unwrap();
            let mut block = draft;
            block.header = mined.header;
            block
        };
        let b1 = build_on(&genesis, 1);
        let b2 = build_on(&b1, 2);

        h.manager.reorganize(&[b1.clone(), b2.clone()]).unwrap();

        assert_eq!(h.manager.current_height().unwrap(), 2);
        assert_eq!(h.manager.tip_hash().unwrap(), b2.hash());

        // Estado idêntico ao replay do zero
        let replayed = UtxoSet::rebuild([&genesis, &b1, &b2].into_iter()).unwrap();
        let utxo = h.manager.utxo_set();
        let current = utxo.read().unwrap();
        assert_eq!(current.total_value().unwrap(), replayed.total_value().unwrap());
        assert_eq!(current.unspent_len(), replayed.unspent_len());
    }

    #[test]
    fn test_reorganize_failure_restores_snapshot() {
        let h = harness();
        let block_a = mine_child(&h, vec![]);
        h.manager.append_block(&block_a).unwrap();
        let original_tip = h.manager.tip_hash().unwrap();
        let original_supply = h
            .manager
            .utxo_set()
            .read()
            .unwrap()
            .total_value()
            .unwrap();

        // Ramo com segundo bloco corrompido (altura errada)
        let genesis = h.manager.get_block_by_height(0).unwrap().unwrap();
        let build_on = |parent: &Block, height: u64| {
            let builder = BlockBuilder::new(
                Arc::clone(&h.params),
                parent.hash(),
                height,
                parent.header.difficulty.clone(),
            );
            builder.set_min_timestamp(parent.header.timestamp);
            let empty = UtxoSet::new();
            builder.set_transactions(vec![], &empty).unwrap();
            let reward = capped_reward(height, &parent.header.total_supply, &h.params);
            let supply = parent.header.total_supply.checked_add(&reward).unwrap();
            let draft = builder.build(&h.keypair, reward, supply).unwrap();
            let cancel = Arc::new(AtomicBool::new(false));
            let mined = h.pow.mine(&draft.header, &cancel).unwrap();
            let mut block = draft;
            block.header = mined.header;
            block
        };
        let b1 = build_on(&genesis, 1);
        let mut b2 = build_on(&b1, 2);
        b2.header.previous_hash = Hash256::keccak256(b"corrupted");

        let err = h.manager.reorganize(&[b1, b2]).unwrap_err();
        assert!(matches!(err, ChainError::AppendFailed(_)));

        // Estado restaurado byte a byte
        assert_eq!(h.manager.tip_hash().unwrap(), original_tip);
        assert_eq!(h.manager.current_height().unwrap(), 1);
        assert_eq!(
            h.manager
                .utxo_set()
                .read()
                .unwrap()
                .total_value()
                .unwrap(),
            original_supply
        );
    }

    #[test]
    fn test_reorg_depth_limit() {
        let mut params = NetworkParams::regtest();
        params.min_fee_per_byte = 0;
        params.coinbase_maturity = 0;
        params.difficulty_adjustment_interval = 1_000_000;
        params.max_reorg_depth = 1;
        let params = Arc::new(params);

        let store: Arc<dyn ChainStore> = Arc::new(MemoryStore::new());
        let utxo = Arc::new(RwLock::new(UtxoSet::new()));
        let mempool = Arc::new(Mempool::new(Arc::clone(&params)));
        let manager = ChainManager::new(Arc::clone(&params), store, utxo, mempool);
        let keypair = KeyPair::generate().unwrap();
        let genesis = Block::genesis(&params, &keypair).unwrap();
        manager.initialize(genesis.clone()).unwrap();

        let h = Harness {
            pow: PowEngine::new(Arc::clone(&params)),
            params: Arc::clone(&params),
            manager,
            keypair,
        };

        // Avança 2 blocos; ancestral no gênese fica a profundidade 2 > 1
        let a1 = mine_child(&h, vec![]);
        h.manager.append_block(&a1).unwrap();
        let a2 = mine_child(&h, vec![]);
        h.manager.append_block(&a2).unwrap();

        let builder = BlockBuilder::new(
            Arc::clone(&h.params),
            genesis.hash(),
            1,
            genesis.header.difficulty.clone(),
        );
        builder.set_min_timestamp(genesis.header.timestamp);
        let empty = UtxoSet::new();
        builder.set_transactions(vec![], &empty).unwrap();
        let reward = capped_reward(1, &genesis.header.total_supply, &h.params);
        let supply = genesis.header.total_supply.checked_add(&reward).unwrap();
        let draft = builder.build(&h.keypair, reward, supply).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let mined = h.pow.mine(&draft.header, &cancel).unwrap();
        let mut b1 = draft;
        b1.header = mined.header;

        let err = h.manager.reorganize(&[b1]).unwrap_err();
        assert!(matches!(err, ChainError::ForkDepthExceeded { .. }));
    }

    #[test]
    fn test_chain_tips_classification() {
        let h = harness();
        let block_a = mine_child(&h, vec![]);
        h.manager.append_block(&block_a).unwrap();

        // Competidor na mesma altura, filho do gênese
        let genesis = h.manager.get_block_by_height(0).unwrap().unwrap();
        let builder = BlockBuilder::new(
            Arc::clone(&h.params),
            genesis.hash(),
            1,
            genesis.header.difficulty.clone(),
        );
        builder.set_min_timestamp(genesis.header.timestamp);
        let empty = UtxoSet::new();
        builder.set_transactions(vec![], &empty).unwrap();
        let reward = capped_reward(1, &genesis.header.total_supply, &h.params);
        let supply = genesis.header.total_supply.checked_add(&reward).unwrap();
        let draft = builder.build(&h.keypair, reward, supply).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let mined = h.pow.mine(&draft.header, &cancel).unwrap();
        let mut rival = draft;
        rival.header = mined.header;

        h.manager.record_side_block(&rival);

        let tips = h.manager.get_chain_tips().unwrap();
        assert_eq!(tips.len(), 2);
        assert_eq!(tips[0].status, TipStatus::Active);
        assert_eq!(tips[1].status, TipStatus::ValidFork);
        assert_eq!(tips[1].hash, rival.hash());
    }

    #[test]
    fn test_address_index_follows_spends() {
        let h = harness();
        let miner = h.keypair.address();

        // Gênese credita o minerador no índice persistido
        let before = h.manager.utxos_for_address(&miner).unwrap();
        assert_eq!(before.len(), 1);

        let genesis_coinbase = OutPoint::new(
            h.manager
                .get_block_by_height(0)
                .unwrap()
                .unwrap()
                .transactions[0]
                .id(),
            0,
        );
        let tx = spend_outpoint(&h, genesis_coinbase, 0, vec![(4_000, b"a"), (900, b"b")]);
        let block = mine_child(&h, vec![tx]);
        h.manager.append_block(&block).unwrap();

        // Saída gasta saiu do índice do minerador; nova coinbase entrou
        let after = h.manager.utxos_for_address(&miner).unwrap();
        assert_eq!(after.len(), 1);
        assert!(!after.contains(&genesis_coinbase));

        let dest_a = h
            .manager
            .utxos_for_address(&Hash256::keccak256(b"a"))
            .unwrap();
        assert_eq!(dest_a.len(), 1);
    }

    #[test]
    fn test_verify_and_repair_on_healthy_set() {
        let h = harness();
        let block = mine_child(&h, vec![]);
        h.manager.append_block(&block).unwrap();

        // Conjunto íntegro: nenhuma reconstrução
        assert!(!h.manager.verify_and_repair_utxo().unwrap());
    }

    #[test]
    fn test_load_from_store_rebuilds_state() {
        let h = harness();
        let block = mine_child(&h, vec![]);
        h.manager.append_block(&block).unwrap();

        let supply_before = h
            .manager
            .utxo_set()
            .read()
            .unwrap()
            .total_value()
            .unwrap();

        // Novo gerenciador sobre o mesmo armazenamento
        let manager = ChainManager::new(
            Arc::clone(&h.params),
            h.manager.store(),
            Arc::new(RwLock::new(UtxoSet::new())),
            Arc::new(Mempool::new(Arc::clone(&h.params))),
        );
        manager.load_from_store().unwrap();

        assert_eq!(manager.current_height().unwrap(), 1);
        assert_eq!(
            manager.utxo_set().read().unwrap().total_value().unwrap(),
            supply_before
        );
    }
}
