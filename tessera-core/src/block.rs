use crate::codec::{CanonicalReader, CanonicalWriter};
use crate::params::NetworkParams;
use crate::transaction::Transaction;
use crate::vote::Vote;
use chrono::Utc;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use shared::{
    Address, Amount, ChainError, Hash256, KeyPair, PublicKey, Ratio, Result, Signature, Timestamp,
};

/// Janela da mediana de timestamps dos ancestrais
pub const MEDIAN_TIME_WINDOW: usize = 11;

/// Dados de consenso híbrido embutidos no cabeçalho
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusData {
    /// `dificuldade do bloco / dificuldade da rede`
    pub pow_score: Ratio,
    /// Score agregado de votação do período
    pub voting_score: Ratio,
    /// Fração de validadores ativos que votaram no período
    pub participation_rate: Ratio,
    /// Período de votação vigente quando o bloco foi produzido
    pub period_id: u64,
}

impl ConsensusData {
    /// Dados de consenso de um bloco linear fora de período de votação
    #[must_use]
    pub const fn genesis() -> Self {
        Self {
            pow_score: Ratio::one(),
            voting_score: Ratio::zero(),
            participation_rate: Ratio::zero(),
            period_id: 0,
        }
    }

    fn encode(&self, writer: &mut CanonicalWriter) {
        writer.put_ratio(&self.pow_score);
        writer.put_ratio(&self.voting_score);
        writer.put_ratio(&self.participation_rate);
        writer.put_u64(self.period_id);
    }

    fn decode(reader: &mut CanonicalReader<'_>) -> Result<Self> {
        Ok(Self {
            pow_score: reader.get_ratio()?,
            voting_score: reader.get_ratio()?,
            participation_rate: reader.get_ratio()?,
            period_id: reader.get_u64()?,
        })
    }
}

/// Cabeçalho do bloco
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Versão do bloco
    pub version: u32,
    /// Hash do bloco anterior
    pub previous_hash: Hash256,
    /// Merkle root das transações
    pub merkle_root: Hash256,
    /// Merkle root do conjunto de validadores do bloco
    pub validator_merkle_root: Hash256,
    /// Timestamp do bloco (ms)
    pub timestamp: Timestamp,
    /// Dificuldade; `alvo = alvo_máximo / dificuldade`
    pub difficulty: BigUint,
    /// Nonce de mineração
    pub nonce: u64,
    /// Altura do bloco
    pub height: u64,
    /// Endereço do minerador
    pub miner: Address,
    /// Oferta circulante após este bloco
    pub total_supply: Amount,
    /// Recompensa deste bloco
    pub block_reward: Amount,
    /// Soma das taxas das transações
    pub fees: Amount,
    /// Alvo de PoW em hex (`0x…`)
    pub target: String,
    /// Dados de consenso híbrido
    pub consensus_data: ConsensusData,
    /// Assinatura do minerador sobre o conteúdo estável do cabeçalho
    pub signature: Option<Signature>,
    /// Chave pública do minerador
    pub public_key: Option<PublicKey>,
    /// Hash do cabeçalho (calculado sobre a serialização canônica)
    pub hash: Hash256,
}

impl BlockHeader {
    /// Payload assinado pelo minerador: o conteúdo do cabeçalho que é
    /// estável durante a mineração (sem nonce, timestamp, assinatura
    /// e hash).
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut writer = CanonicalWriter::new();
        writer.put_u32(self.version);
        writer.put_hash(&self.previous_hash);
        writer.put_hash(&self.merkle_root);
        writer.put_hash(&self.validator_merkle_root);
        writer.put_biguint(&self.difficulty);
        writer.put_u64(self.height);
        writer.put_hash(&self.miner);
        writer.put_amount(&self.total_supply);
        writer.put_amount(&self.block_reward);
        writer.put_amount(&self.fees);
        writer.put_string(&self.target);
        self.consensus_data.encode(&mut writer);
        writer.into_bytes()
    }

    fn encode_for_hash(&self) -> Result<Vec<u8>> {
        let mut writer = CanonicalWriter::new();
        writer.put_u32(self.version);
        writer.put_hash(&self.previous_hash);
        writer.put_hash(&self.merkle_root);
        writer.put_hash(&self.validator_merkle_root);
        writer.put_timestamp(self.timestamp);
        writer.put_biguint(&self.difficulty);
        writer.put_u64(self.nonce);
        writer.put_u64(self.height);
        writer.put_hash(&self.miner);
        writer.put_amount(&self.total_supply);
        writer.put_amount(&self.block_reward);
        writer.put_amount(&self.fees);
        writer.put_string(&self.target);
        self.consensus_data.encode(&mut writer);
        encode_optional_json(&mut writer, self.signature.as_ref())?;
        encode_optional_json(&mut writer, self.public_key.as_ref())?;
        Ok(writer.into_bytes())
    }

    /// Calcula o hash do cabeçalho (sem o próprio campo `hash`)
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização falhar
    pub fn compute_hash(&self) -> Result<Hash256> {
        Ok(Hash256::keccak256(&self.encode_for_hash()?))
    }

    /// Assina o cabeçalho e preenche chave pública
    ///
    /// # Errors
    ///
    /// Retorna erro se a assinatura falhar
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<()> {
        let signature = keypair.sign(&self.signing_payload())?;
        self.signature = Some(signature);
        self.public_key = Some(keypair.public_key.clone());
        Ok(())
    }

    /// Verifica a assinatura do minerador
    ///
    /// # Errors
    ///
    /// Retorna erro se assinatura ou chave estiverem ausentes
    pub fn verify_signature(&self) -> Result<bool> {
        let signature = self.signature.as_ref().ok_or(ChainError::InvalidSignature)?;
        let public_key = self.public_key.as_ref().ok_or(ChainError::InvalidSignature)?;

        if public_key.address() != self.miner {
            return Ok(false);
        }
        if signature.public_key() != public_key {
            return Ok(false);
        }
        signature.verify(&self.signing_payload())
    }

    /// Serialização canônica completa do cabeçalho (com `hash`)
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização falhar
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = CanonicalWriter::new();
        self.encode_into(&mut writer)?;
        Ok(writer.into_bytes())
    }

    pub(crate) fn encode_into(&self, writer: &mut CanonicalWriter) -> Result<()> {
        let body = self.encode_for_hash()?;
        writer.put_bytes(&body);
        writer.put_hash(&self.hash);
        Ok(())
    }

    pub(crate) fn decode_from(reader: &mut CanonicalReader<'_>) -> Result<Self> {
        let body = reader.get_bytes()?;
        let hash = reader.get_hash()?;

        let mut body_reader = CanonicalReader::new(&body);
        let version = body_reader.get_u32()?;
        let previous_hash = body_reader.get_hash()?;
        let merkle_root = body_reader.get_hash()?;
        let validator_merkle_root = body_reader.get_hash()?;
        let timestamp = body_reader.get_timestamp()?;
        let difficulty = body_reader.get_biguint()?;
        let nonce = body_reader.get_u64()?;
        let height = body_reader.get_u64()?;
        let miner = body_reader.get_hash()?;
        let total_supply = body_reader.get_amount()?;
        let block_reward = body_reader.get_amount()?;
        let fees = body_reader.get_amount()?;
        let target = body_reader.get_string()?;
        let consensus_data = ConsensusData::decode(&mut body_reader)?;
        let signature = decode_optional_json(&mut body_reader)?;
        let public_key = decode_optional_json(&mut body_reader)?;
        body_reader.finish()?;

        Ok(Self {
            version,
            previous_hash,
            merkle_root,
            validator_merkle_root,
            timestamp,
            difficulty,
            nonce,
            height,
            miner,
            total_supply,
            block_reward,
            fees,
            target,
            consensus_data,
            signature,
            public_key,
            hash,
        })
    }
}

fn encode_optional_json<T: Serialize>(writer: &mut CanonicalWriter, value: Option<&T>) -> Result<()> {
    match value {
        Some(inner) => {
            writer.put_u8(1);
            let bytes = serde_json::to_vec(inner)
                .map_err(|e| ChainError::SerializationError(e.to_string()))?;
            writer.put_bytes(&bytes);
        }
        None => writer.put_u8(0),
    }
    Ok(())
}

fn decode_optional_json<T: for<'de> Deserialize<'de>>(
    reader: &mut CanonicalReader<'_>,
) -> Result<Option<T>> {
    match reader.get_u8()? {
        0 => Ok(None),
        1 => {
            let bytes = reader.get_bytes()?;
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| ChainError::SerializationError(e.to_string()))?;
            Ok(Some(value))
        }
        other => Err(ChainError::SerializationError(format!(
            "marcador opcional inválido: {other}"
        ))),
    }
}

/// Bloco completo da blockchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Cabeçalho do bloco
    pub header: BlockHeader,
    /// Transações no bloco; a primeira é a coinbase
    pub transactions: Vec<Transaction>,
    /// Votos de resolução de fork carregados pelo bloco
    pub votes: Vec<Vote>,
    /// Validadores que participaram do período do bloco
    pub validators: Vec<Address>,
}

impl Block {
    /// Cria um novo bloco
    #[must_use]
    pub const fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
            votes: Vec::new(),
            validators: Vec::new(),
        }
    }

    /// Cria e minera o bloco gênese
    ///
    /// # Errors
    ///
    /// Retorna erro se a mineração ou o cálculo do merkle root falharem
    pub fn genesis(params: &NetworkParams, keypair: &KeyPair) -> Result<Self> {
        let miner = keypair.address();
        let reward = params.initial_reward_amount();
        let coinbase = Transaction::coinbase(0, reward.clone(), vec![], miner);
        let merkle = merkle_root(&[coinbase.id()]);

        let difficulty = BigUint::from(params.initial_difficulty.max(1));
        let max_target = params.max_target()?;
        let target = &max_target / &difficulty;

        let mut header = BlockHeader {
            version: 1,
            previous_hash: Hash256::zero(),
            merkle_root: merkle,
            validator_merkle_root: merkle_root(&[]),
            timestamp: Utc::now().timestamp_millis(),
            difficulty,
            nonce: 0,
            height: 0,
            miner,
            total_supply: reward.clone(),
            block_reward: reward,
            fees: Amount::zero(),
            target: format!("0x{}", target.to_str_radix(16)),
            consensus_data: ConsensusData::genesis(),
            signature: None,
            public_key: None,
            hash: Hash256::zero(),
        };
        header.sign(keypair)?;

        // Minerar o bloco gênese
        loop {
            let hash = header.compute_hash()?;
            if hash.to_biguint() <= target {
                header.hash = hash;
                break;
            }
            header.nonce += 1;
        }

        Ok(Self::new(header, vec![coinbase]))
    }

    /// Obter o hash do bloco
    #[must_use]
    pub const fn hash(&self) -> Hash256 {
        self.header.hash
    }

    /// Altura do bloco
    #[must_use]
    pub const fn height(&self) -> u64 {
        self.header.height
    }

    /// Merkle root calculada sobre os ids das transações
    #[must_use]
    pub fn compute_merkle_root(&self) -> Hash256 {
        let ids: Vec<Hash256> = self.transactions.iter().map(Transaction::id).collect();
        merkle_root(&ids)
    }

    /// Merkle root do conjunto de validadores
    #[must_use]
    pub fn compute_validator_merkle_root(&self) -> Hash256 {
        merkle_root(&self.validators)
    }

    /// Validação estrutural do bloco
    ///
    /// # Errors
    ///
    /// Retorna erro se algum invariante estrutural for violado
    pub fn validate_structure(&self, params: &NetworkParams) -> Result<()> {
        let header = &self.header;

        if header.version < params.min_tx_version || header.version > params.max_tx_version {
            return Err(ChainError::InvalidBlock(format!(
                "Versão {} fora de [{}, {}]",
                header.version, params.min_tx_version, params.max_tx_version
            )));
        }
        if header.signature.is_none() || header.public_key.is_none() {
            return Err(ChainError::InvalidBlock(
                "Cabeçalho sem assinatura ou chave pública".to_string(),
            ));
        }
        if header.target.is_empty() {
            return Err(ChainError::InvalidBlock("Alvo ausente".to_string()));
        }
        if !header.consensus_data.participation_rate.in_unit_interval() {
            return Err(ChainError::InvalidBlock(
                "participation_rate fora de [0, 1]".to_string(),
            ));
        }
        if header.consensus_data.pow_score.den == 0 {
            return Err(ChainError::InvalidBlock("pow_score malformado".to_string()));
        }
        if header.consensus_data.voting_score.den == 0 {
            return Err(ChainError::InvalidBlock(
                "voting_score malformado".to_string(),
            ));
        }

        if self.transactions.is_empty() {
            return Err(ChainError::InvalidBlock(
                "Bloco sem transações".to_string(),
            ));
        }
        if !self.transactions[0].is_coinbase() {
            return Err(ChainError::InvalidBlock(
                "Primeira transação não é coinbase".to_string(),
            ));
        }
        for (i, tx) in self.transactions.iter().enumerate() {
            if i > 0 && tx.is_coinbase() {
                return Err(ChainError::InvalidBlock(
                    "Múltiplas transações coinbase".to_string(),
                ));
            }
            tx.validate_basic()?;
        }

        // Ids únicos dentro do bloco
        let mut seen = std::collections::HashSet::new();
        for tx in &self.transactions {
            if !seen.insert(tx.id()) {
                return Err(ChainError::InvalidBlock(
                    "Id de transação duplicado no bloco".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Verifica `merkle_root` e `validator_merkle_root` contra o conteúdo
    ///
    /// # Errors
    ///
    /// Retorna `InvalidMerkle` em caso de divergência
    pub fn verify_merkle(&self) -> Result<()> {
        let computed = self.compute_merkle_root();
        if computed != self.header.merkle_root {
            return Err(ChainError::InvalidMerkle {
                expected: self.header.merkle_root.to_string(),
                actual: computed.to_string(),
            });
        }
        let validators = self.compute_validator_merkle_root();
        if validators != self.header.validator_merkle_root {
            return Err(ChainError::InvalidMerkle {
                expected: self.header.validator_merkle_root.to_string(),
                actual: validators.to_string(),
            });
        }
        Ok(())
    }

    /// Tamanho serializado do bloco em bytes
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        self.encode().map_or(0, |bytes| bytes.len())
    }

    /// Serialização canônica do bloco
    ///
    /// # Errors
    ///
    /// Retorna erro se a serialização falhar
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = CanonicalWriter::new();
        self.header.encode_into(&mut writer)?;
        writer.put_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut writer)?;
        }
        writer.put_varint(self.votes.len() as u64);
        for vote in &self.votes {
            vote.encode_into(&mut writer)?;
        }
        writer.put_varint(self.validators.len() as u64);
        for validator in &self.validators {
            writer.put_hash(validator);
        }
        Ok(writer.into_bytes())
    }

    /// Decodifica um bloco da serialização canônica
    ///
    /// # Errors
    ///
    /// Retorna erro se os bytes forem malformados
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = CanonicalReader::new(data);
        let header = BlockHeader::decode_from(&mut reader)?;

        let tx_count = reader.get_varint()?;
        let mut transactions = Vec::with_capacity(tx_count.min(4096) as usize);
        for _ in 0..tx_count {
            let bytes = reader.get_bytes()?;
            transactions.push(Transaction::decode(&bytes)?);
        }

        let vote_count = reader.get_varint()?;
        let mut votes = Vec::with_capacity(vote_count.min(4096) as usize);
        for _ in 0..vote_count {
            let bytes = reader.get_bytes()?;
            votes.push(Vote::decode(&bytes)?);
        }

        let validator_count = reader.get_varint()?;
        let mut validators = Vec::with_capacity(validator_count.min(4096) as usize);
        for _ in 0..validator_count {
            validators.push(reader.get_hash()?);
        }

        reader.finish()?;
        Ok(Self {
            header,
            transactions,
            votes,
            validators,
        })
    }
}

/// Calcula a merkle root de uma lista de ids
///
/// Árvore binária no estilo Bitcoin: em níveis com contagem ímpar o
/// último nó é duplicado. Lista vazia produz `keccak256("")`.
#[must_use]
pub fn merkle_root(ids: &[Hash256]) -> Hash256 {
    if ids.is_empty() {
        return Hash256::keccak256(b"");
    }

    let mut hashes: Vec<Hash256> = ids.to_vec();

    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));

        for chunk in hashes.chunks(2) {
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(chunk[0].as_bytes());
            if chunk.len() == 2 {
                data.extend_from_slice(chunk[1].as_bytes());
            } else {
                // Nó ímpar: combina consigo mesmo
                data.extend_from_slice(chunk[0].as_bytes());
            }
            next_level.push(Hash256::keccak256(&data));
        }

        hashes = next_level;
    }

    hashes[0]
}

/// Mediana dos timestamps dos últimos ancestrais
///
/// Novos blocos devem ter timestamp estritamente maior que a mediana
/// dos últimos [`MEDIAN_TIME_WINDOW`] blocos.
#[must_use]
pub fn median_time_past(ancestor_timestamps: &[Timestamp]) -> Option<Timestamp> {
    if ancestor_timestamps.is_empty() {
        return None;
    }
    let mut times: Vec<Timestamp> = ancestor_timestamps
        .iter()
        .rev()
        .take(MEDIAN_TIME_WINDOW)
        .copied()
        .collect();
    times.sort_unstable();
    Some(times[times.len() / 2])
}
