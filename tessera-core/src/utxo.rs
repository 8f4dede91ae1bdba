use crate::block::Block;
use crate::transaction::TxOutput;
use serde::{Deserialize, Serialize};
use shared::{Address, Amount, ChainError, OutPoint, Result, Timestamp};
use std::collections::{HashMap, HashSet};

/// Representa uma saída de transação com seu estado de gasto
///
/// Uma UTXO ou está não gasta ou foi integralmente consumida; não há
/// gasto parcial. Uma vez `spent`, só volta a ser gastável durante o
/// rollback de uma reorganização.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utxo {
    /// A saída original da transação
    pub output: TxOutput,
    /// Altura do bloco onde foi criada
    pub height: u64,
    /// Timestamp do bloco criador (ms)
    pub block_timestamp: Timestamp,
    /// Criada por uma transação coinbase
    pub coinbase: bool,
    /// Consumida por alguma transação confirmada
    pub spent: bool,
}

impl Utxo {
    /// Cria uma nova UTXO não gasta
    #[must_use]
    pub const fn new(
        output: TxOutput,
        height: u64,
        block_timestamp: Timestamp,
        coinbase: bool,
    ) -> Self {
        Self {
            output,
            height,
            block_timestamp,
            coinbase,
            spent: false,
        }
    }

    /// Número de confirmações na altura atual
    #[must_use]
    pub const fn confirmations(&self, current_height: u64) -> u64 {
        if current_height >= self.height {
            current_height - self.height + 1
        } else {
            0
        }
    }

    /// Verifica maturidade: UTXOs de coinbase exigem `maturity`
    /// confirmações antes de poderem ser gastas
    #[must_use]
    pub const fn is_mature(&self, current_height: u64, maturity: u64) -> bool {
        if self.coinbase {
            self.confirmations(current_height) >= maturity
        } else {
            true
        }
    }
}

/// Conjunto autoritativo de UTXOs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UtxoSet {
    utxos: HashMap<OutPoint, Utxo>,
    by_address: HashMap<Address, HashSet<OutPoint>>,
}

impl UtxoSet {
    /// Cria um conjunto vazio
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtém uma UTXO (gasta ou não)
    #[must_use]
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint)
    }

    /// Obtém uma UTXO apenas se ainda não gasta
    #[must_use]
    pub fn get_unspent(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint).filter(|utxo| !utxo.spent)
    }

    /// Verifica se existe uma UTXO não gasta
    #[must_use]
    pub fn contains_unspent(&self, outpoint: &OutPoint) -> bool {
        self.get_unspent(outpoint).is_some()
    }

    /// Insere uma UTXO
    pub fn insert(&mut self, outpoint: OutPoint, utxo: Utxo) {
        self.by_address
            .entry(utxo.output.address)
            .or_default()
            .insert(outpoint);
        self.utxos.insert(outpoint, utxo);
    }

    /// Aplica um bloco ao conjunto
    ///
    /// Primeira fase valida tudo (inputs existentes e não gastos, sem
    /// gasto duplo dentro do bloco, sem chaves duplicadas, somas sem
    /// overflow); a segunda fase muta. Falha sem efeitos colaterais.
    ///
    /// # Errors
    ///
    /// Retorna erro se qualquer input faltar ou já estiver gasto
    pub fn apply_block(&mut self, block: &Block) -> Result<()> {
        let height = block.height();
        let block_timestamp = block.header.timestamp;

        // ── Fase de validação ──
        let mut spent_in_block: HashSet<OutPoint> = HashSet::new();
        let mut created_in_block: HashSet<OutPoint> = HashSet::new();

        for tx in &block.transactions {
            let txid = tx.id();

            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let outpoint = input.previous_output;
                    if !spent_in_block.insert(outpoint) {
                        return Err(ChainError::DoubleSpend(format!(
                            "gasto duplo de {outpoint} dentro do bloco"
                        )));
                    }
                    let known = self.get_unspent(&outpoint).is_some()
                        || created_in_block.contains(&outpoint);
                    if !known {
                        return Err(ChainError::UtxoNotFound);
                    }
                }
            }

            let mut output_sum = Amount::zero();
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, index as u32);
                if self.utxos.contains_key(&outpoint) || !created_in_block.insert(outpoint) {
                    return Err(ChainError::InvalidBlock(format!(
                        "chave de UTXO duplicada: {outpoint}"
                    )));
                }
                output_sum = output_sum.checked_add(&output.value)?;
            }
        }

        // ── Fase de aplicação ──
        for tx in &block.transactions {
            let txid = tx.id();

            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    if let Some(utxo) = self.utxos.get_mut(&input.previous_output) {
                        utxo.spent = true;
                    }
                }
            }

            let coinbase = tx.is_coinbase();
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, index as u32);
                self.insert(
                    outpoint,
                    Utxo::new(output.clone(), height, block_timestamp, coinbase),
                );
            }
        }

        Ok(())
    }

    /// Aplica uma única transação sem validação
    ///
    /// Constrói a visão incremental dentro de um bloco: saídas criadas
    /// por transações anteriores ficam visíveis para inputs
    /// posteriores, como em `apply_block`. O chamador é responsável
    /// pela validação; usado pelos cálculos de taxa do montador e da
    /// checagem econômica de pré-anexação.
    pub fn stage_transaction(
        &mut self,
        tx: &crate::transaction::Transaction,
        height: u64,
        block_timestamp: Timestamp,
    ) {
        let txid = tx.id();

        if !tx.is_coinbase() {
            for input in &tx.inputs {
                if let Some(utxo) = self.utxos.get_mut(&input.previous_output) {
                    utxo.spent = true;
                }
            }
        }

        let coinbase = tx.is_coinbase();
        for (index, output) in tx.outputs.iter().enumerate() {
            self.insert(
                OutPoint::new(txid, index as u32),
                Utxo::new(output.clone(), height, block_timestamp, coinbase),
            );
        }
    }

    /// Reverte uma transação durante uma reorganização
    ///
    /// Os inputs voltam a não gastos com o estado autoritativo prévio
    /// resolvido pelo armazenamento transacional; os outputs criados
    /// pela transação são removidos.
    ///
    /// # Errors
    ///
    /// Retorna erro se o estado prévio de algum input não puder ser
    /// resolvido
    pub fn revert_transaction(
        &mut self,
        tx: &crate::transaction::Transaction,
        resolve_prior: impl Fn(&OutPoint) -> Result<Utxo>,
    ) -> Result<()> {
        let txid = tx.id();

        // Remover outputs criados
        for index in 0..tx.outputs.len() {
            let outpoint = OutPoint::new(txid, index as u32);
            if let Some(utxo) = self.utxos.remove(&outpoint) {
                if let Some(set) = self.by_address.get_mut(&utxo.output.address) {
                    set.remove(&outpoint);
                    if set.is_empty() {
                        self.by_address.remove(&utxo.output.address);
                    }
                }
            }
        }

        // Restaurar inputs como não gastos
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                let mut prior = resolve_prior(&input.previous_output)?;
                prior.spent = false;
                self.insert(input.previous_output, prior);
            }
        }

        Ok(())
    }

    /// Verifica integridade referencial do conjunto
    ///
    /// # Errors
    ///
    /// Retorna `StoreFatal` se o índice por endereço divergir das UTXOs
    pub fn validate(&self) -> Result<()> {
        for (address, outpoints) in &self.by_address {
            for outpoint in outpoints {
                match self.utxos.get(outpoint) {
                    Some(utxo) if utxo.output.address == *address => {}
                    Some(_) => {
                        return Err(ChainError::StoreFatal(format!(
                            "índice por endereço aponta {outpoint} para endereço errado"
                        )))
                    }
                    None => {
                        return Err(ChainError::StoreFatal(format!(
                            "índice por endereço referencia UTXO inexistente {outpoint}"
                        )))
                    }
                }
            }
        }
        for (outpoint, utxo) in &self.utxos {
            let indexed = self
                .by_address
                .get(&utxo.output.address)
                .is_some_and(|set| set.contains(outpoint));
            if !indexed {
                return Err(ChainError::StoreFatal(format!(
                    "UTXO {outpoint} ausente do índice por endereço"
                )));
            }
        }
        Ok(())
    }

    /// Soma dos valores não gastos (oferta circulante)
    ///
    /// # Errors
    ///
    /// Retorna erro em caso de overflow (impossível sob `MAX_SUPPLY`)
    pub fn total_value(&self) -> Result<Amount> {
        let mut total = Amount::zero();
        for utxo in self.utxos.values() {
            if !utxo.spent {
                total = total.checked_add(&utxo.output.value)?;
            }
        }
        Ok(total)
    }

    /// Saldo não gasto de um endereço
    #[must_use]
    pub fn balance_of(&self, address: &Address) -> Amount {
        let mut total = Amount::zero();
        if let Some(outpoints) = self.by_address.get(address) {
            for outpoint in outpoints {
                if let Some(utxo) = self.get_unspent(outpoint) {
                    total += &utxo.output.value;
                }
            }
        }
        total
    }

    /// Seleciona UTXOs não gastas de um endereço até cobrir um valor
    ///
    /// # Errors
    ///
    /// Retorna `InsufficientFunds` se o saldo não cobrir o valor
    pub fn select_for_amount(
        &self,
        address: &Address,
        amount: &Amount,
    ) -> Result<Vec<(OutPoint, &Utxo)>> {
        let mut selected = Vec::new();
        let mut total = Amount::zero();

        if let Some(outpoints) = self.by_address.get(address) {
            // Ordena para seleção determinística
            let mut sorted: Vec<&OutPoint> = outpoints.iter().collect();
            sorted.sort();

            for outpoint in sorted {
                if let Some(utxo) = self.get_unspent(outpoint) {
                    total = total.checked_add(&utxo.output.value)?;
                    selected.push((*outpoint, utxo));
                    if total >= *amount {
                        return Ok(selected);
                    }
                }
            }
        }

        Err(ChainError::InsufficientFunds)
    }

    /// Reconstrói o conjunto a partir da cadeia completa
    ///
    /// Operação de manutenção: replay determinístico desde o gênese.
    ///
    /// # Errors
    ///
    /// Retorna erro se algum bloco não aplicar
    pub fn rebuild<'a>(blocks: impl Iterator<Item = &'a Block>) -> Result<Self> {
        let mut set = Self::new();
        for block in blocks {
            set.apply_block(block)?;
        }
        Ok(set)
    }

    /// Número total de entradas (inclui gastas)
    #[must_use]
    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    /// Número de UTXOs não gastas
    #[must_use]
    pub fn unspent_len(&self) -> usize {
        self.utxos.values().filter(|utxo| !utxo.spent).count()
    }

    /// Verifica se o conjunto está vazio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }
}
