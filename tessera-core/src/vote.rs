//! Votos e períodos de votação
//!
//! Tipos de dados da votação direta on-chain. A engine que agenda
//! períodos e apura resultados vive em `tessera-consensus`; aqui ficam
//! as estruturas que blocos e o armazenamento carregam.

use crate::codec::{CanonicalReader, CanonicalWriter};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::{
    Address, ChainError, ChainId, Hash256, KeyPair, PeriodId, Result, Signature, Timestamp,
};
use std::collections::HashMap;

/// Dados auxiliares de um voto de seleção de cadeia
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVoteData {
    /// Cadeia preferida pelo votante
    pub preferred_chain: ChainId,
    /// Altura do fork que originou a votação
    pub fork_height: u64,
}

/// Voto de um validador
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Identificador único do voto
    pub vote_id: Hash256,
    /// Endereço do validador votante
    pub voter: Address,
    /// Bloco ao qual o voto se refere
    pub block_hash: Hash256,
    /// Cadeia pela qual o validador vota
    pub target_chain_id: ChainId,
    /// Timestamp do voto (ms)
    pub timestamp: Timestamp,
    /// Aprovação; `None` representa voto malformado vindo do fio e é
    /// ignorado na apuração
    pub approve: Option<bool>,
    /// Assinatura sobre `target_chain_id || timestamp`
    pub signature: Option<Signature>,
    /// Dados de seleção de cadeia, quando aplicável
    pub chain_vote_data: Option<ChainVoteData>,
}

impl Vote {
    /// Cria um voto não assinado
    #[must_use]
    pub fn new(
        voter: Address,
        block_hash: Hash256,
        target_chain_id: ChainId,
        approve: bool,
    ) -> Self {
        let timestamp = Utc::now().timestamp_millis();
        let vote_id = Self::derive_id(&voter, &target_chain_id, timestamp);
        Self {
            vote_id,
            voter,
            block_hash,
            target_chain_id,
            timestamp,
            approve: Some(approve),
            signature: None,
            chain_vote_data: None,
        }
    }

    fn derive_id(voter: &Address, target_chain_id: &ChainId, timestamp: Timestamp) -> Hash256 {
        let mut writer = CanonicalWriter::new();
        writer.put_hash(voter);
        writer.put_hash(target_chain_id);
        writer.put_timestamp(timestamp);
        Hash256::keccak256(&writer.into_bytes())
    }

    /// Payload assinado: `target_chain_id || timestamp`
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut writer = CanonicalWriter::new();
        writer.put_hash(&self.target_chain_id);
        writer.put_timestamp(self.timestamp);
        writer.into_bytes()
    }

    /// Assina o voto
    ///
    /// # Errors
    ///
    /// Retorna erro se a chave não corresponder ao votante
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<()> {
        if keypair.address() != self.voter {
            return Err(ChainError::InvalidVote(
                "Chave não corresponde ao votante".to_string(),
            ));
        }
        self.signature = Some(keypair.sign(&self.signing_payload())?);
        Ok(())
    }

    /// Verifica assinatura e posse da chave pelo votante
    ///
    /// # Errors
    ///
    /// Retorna erro na ausência de assinatura
    pub fn verify_signature(&self) -> Result<bool> {
        let signature = self.signature.as_ref().ok_or(ChainError::InvalidSignature)?;
        if signature.public_key().address() != self.voter {
            return Ok(false);
        }
        signature.verify(&self.signing_payload())
    }

    /// Idade do voto em milissegundos relativa a `now`
    #[must_use]
    pub const fn age_ms(&self, now: Timestamp) -> i64 {
        now - self.timestamp
    }

    /// Serialização canônica
    ///
    /// # Errors
    ///
    /// Retorna erro se a assinatura não puder ser serializada
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = CanonicalWriter::new();
        writer.put_hash(&self.vote_id);
        writer.put_hash(&self.voter);
        writer.put_hash(&self.block_hash);
        writer.put_hash(&self.target_chain_id);
        writer.put_timestamp(self.timestamp);
        match self.approve {
            None => writer.put_u8(2),
            Some(false) => writer.put_u8(0),
            Some(true) => writer.put_u8(1),
        }
        let extras = serde_json::to_vec(&(&self.signature, &self.chain_vote_data))
            .map_err(|e| ChainError::SerializationError(e.to_string()))?;
        writer.put_bytes(&extras);
        Ok(writer.into_bytes())
    }

    pub(crate) fn encode_into(&self, writer: &mut CanonicalWriter) -> Result<()> {
        let bytes = self.encode()?;
        writer.put_bytes(&bytes);
        Ok(())
    }

    /// Decodifica um voto
    ///
    /// # Errors
    ///
    /// Retorna erro se os bytes forem malformados
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = CanonicalReader::new(data);
        let vote_id = reader.get_hash()?;
        let voter = reader.get_hash()?;
        let block_hash = reader.get_hash()?;
        let target_chain_id = reader.get_hash()?;
        let timestamp = reader.get_timestamp()?;
        let approve = match reader.get_u8()? {
            0 => Some(false),
            1 => Some(true),
            2 => None,
            other => {
                return Err(ChainError::SerializationError(format!(
                    "marcador de aprovação inválido: {other}"
                )))
            }
        };
        let extras = reader.get_bytes()?;
        let (signature, chain_vote_data) = serde_json::from_slice(&extras)
            .map_err(|e| ChainError::SerializationError(e.to_string()))?;
        reader.finish()?;

        Ok(Self {
            vote_id,
            voter,
            block_hash,
            target_chain_id,
            timestamp,
            approve,
            signature,
            chain_vote_data,
        })
    }
}

/// Estado de um período de votação
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

/// Natureza do período
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodKind {
    /// Seleção de cadeia após fork
    NodeSelection,
    /// Governança agendada
    Governance,
}

/// Cadeias competidoras de um período de seleção
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetingChains {
    pub old_chain_id: ChainId,
    pub new_chain_id: ChainId,
    pub common_ancestor_height: u64,
}

/// Período de votação
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingPeriod {
    pub period_id: PeriodId,
    pub start_height: u64,
    pub end_height: u64,
    /// Início da janela de aceitação (ms)
    pub start_time: Timestamp,
    /// Fim da janela de aceitação, inclusivo (ms)
    pub end_time: Timestamp,
    pub status: PeriodStatus,
    pub kind: PeriodKind,
    pub competing_chains: Option<CompetingChains>,
    /// Snapshot dos validadores ativos em `start_height`; a
    /// elegibilidade e a taxa de participação são resolvidas contra
    /// este conjunto, não contra o registro vivo
    pub validators: Vec<Address>,
    /// Votos aceitos, um por votante; duplicatas resolvem para o último
    /// recebido
    pub votes: HashMap<Address, Vote>,
}

impl VotingPeriod {
    /// Cria um período de governança agendado
    #[must_use]
    pub fn scheduled(
        period_id: PeriodId,
        start_height: u64,
        duration_blocks: u64,
        start_time: Timestamp,
        duration_ms: i64,
        validators: Vec<Address>,
    ) -> Self {
        Self {
            period_id,
            start_height,
            end_height: start_height + duration_blocks,
            start_time,
            end_time: start_time + duration_ms,
            status: PeriodStatus::Active,
            kind: PeriodKind::Governance,
            competing_chains: None,
            validators,
            votes: HashMap::new(),
        }
    }

    /// Cria um período de seleção de cadeia disparado por fork
    #[must_use]
    pub fn node_selection(
        period_id: PeriodId,
        competing: CompetingChains,
        current_height: u64,
        start_time: Timestamp,
        duration_ms: i64,
        validators: Vec<Address>,
    ) -> Self {
        Self {
            period_id,
            start_height: current_height,
            end_height: current_height,
            start_time,
            end_time: start_time + duration_ms,
            status: PeriodStatus::Active,
            kind: PeriodKind::NodeSelection,
            competing_chains: Some(competing),
            validators,
            votes: HashMap::new(),
        }
    }

    /// O endereço era validador ativo no início do período?
    #[must_use]
    pub fn is_eligible_voter(&self, voter: &Address) -> bool {
        self.validators.contains(voter)
    }

    /// Validadores ativos no início do período
    #[must_use]
    pub fn validator_count(&self) -> usize {
        self.validators.len()
    }

    /// Janela de aceitação contém o instante? Limite superior inclusivo:
    /// um voto exatamente em `end_time` é aceito, 1 ms depois não.
    #[must_use]
    pub const fn accepts_at(&self, time: Timestamp) -> bool {
        time >= self.start_time && time <= self.end_time
    }

    /// O período está ativo neste instante?
    #[must_use]
    pub fn is_active(&self, now: Timestamp) -> bool {
        self.status == PeriodStatus::Active && self.accepts_at(now)
    }

    /// Registra um voto; duplicata do mesmo votante substitui a anterior
    pub fn record_vote(&mut self, vote: Vote) {
        self.votes.insert(vote.voter, vote);
    }

    /// Número de votos registrados
    #[must_use]
    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vote(approve: bool) -> Vote {
        Vote::new(
            Hash256::keccak256(b"voter"),
            Hash256::keccak256(b"block"),
            Hash256::keccak256(b"chain"),
            approve,
        )
    }

    #[test]
    fn test_vote_sign_and_verify() {
        let keypair = KeyPair::generate().unwrap();
        let mut vote = Vote::new(
            keypair.address(),
            Hash256::keccak256(b"block"),
            Hash256::keccak256(b"chain"),
            true,
        );

        vote.sign(&keypair).unwrap();
        assert!(vote.verify_signature().unwrap());

        // Payload cobre target_chain_id e timestamp
        vote.timestamp += 1;
        assert!(!vote.verify_signature().unwrap());
    }

    #[test]
    fn test_vote_sign_rejects_wrong_key() {
        let keypair = KeyPair::generate().unwrap();
        let mut vote = sample_vote(true);
        assert!(vote.sign(&keypair).is_err());
    }

    #[test]
    fn test_vote_round_trip_preserves_non_boolean_approve() {
        let mut vote = sample_vote(true);
        vote.approve = None;

        let bytes = vote.encode().unwrap();
        let decoded = Vote::decode(&bytes).unwrap();
        assert_eq!(vote, decoded);
        assert_eq!(decoded.approve, None);
    }

    #[test]
    fn test_period_window_boundaries() {
        let period = VotingPeriod::scheduled(1, 100, 10, 1_000, 500, vec![]);

        assert!(!period.accepts_at(999));
        assert!(period.accepts_at(1_000));
        // Exatamente em end_time: aceito
        assert!(period.accepts_at(1_500));
        // 1 ms depois: rejeitado
        assert!(!period.accepts_at(1_501));
    }

    #[test]
    fn test_validator_snapshot_defines_eligibility() {
        let member = Hash256::keccak256(b"member");
        let outsider = Hash256::keccak256(b"outsider");
        let period = VotingPeriod::scheduled(1, 100, 10, 0, 500, vec![member]);

        assert!(period.is_eligible_voter(&member));
        assert!(!period.is_eligible_voter(&outsider));
        assert_eq!(period.validator_count(), 1);
    }

    #[test]
    fn test_duplicate_voter_resolves_to_last_received() {
        let mut period = VotingPeriod::scheduled(1, 100, 10, 0, i64::MAX / 2, vec![]);

        let first = sample_vote(true);
        let mut second = sample_vote(false);
        second.timestamp = first.timestamp + 10;

        period.record_vote(first);
        period.record_vote(second.clone());

        assert_eq!(period.vote_count(), 1);
        let stored = period.votes.values().next().unwrap();
        assert_eq!(stored.approve, Some(false));
        assert_eq!(stored.timestamp, second.timestamp);
    }
}
