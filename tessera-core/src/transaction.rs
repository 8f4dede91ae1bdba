use crate::codec::{CanonicalReader, CanonicalWriter};
use crate::utxo::UtxoSet;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::{
    Address, Amount, ChainError, Hash256, KeyPair, OutPoint, Result, Signature, Timestamp, TxId,
};

/// Input de transação
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Referência ao UTXO sendo gasto
    pub previous_output: OutPoint,
    /// Script que prova o direito de gastar o UTXO
    pub script_sig: Vec<u8>,
    /// Número de sequência
    pub sequence: u32,
}

impl TxInput {
    /// Cria um novo input de transação
    #[must_use]
    pub const fn new(previous_output: OutPoint, script_sig: Vec<u8>, sequence: u32) -> Self {
        Self {
            previous_output,
            script_sig,
            sequence,
        }
    }

    /// Cria um input de coinbase (primeira transação de um bloco)
    #[must_use]
    pub const fn coinbase(script_sig: Vec<u8>) -> Self {
        Self {
            previous_output: OutPoint {
                txid: Hash256::zero(),
                vout: 0xFFFF_FFFF,
            },
            script_sig,
            sequence: 0xFFFF_FFFF,
        }
    }

    /// Verifica se este input é de uma transação coinbase
    #[must_use]
    pub fn is_coinbase(&self) -> bool {
        self.previous_output.txid == Hash256::zero() && self.previous_output.vout == 0xFFFF_FFFF
    }

    fn encode(&self, writer: &mut CanonicalWriter) {
        writer.put_hash(&self.previous_output.txid);
        writer.put_u32(self.previous_output.vout);
        writer.put_bytes(&self.script_sig);
        writer.put_u32(self.sequence);
    }

    fn decode(reader: &mut CanonicalReader<'_>) -> Result<Self> {
        let txid = reader.get_hash()?;
        let vout = reader.get_u32()?;
        let script_sig = reader.get_bytes()?;
        let sequence = reader.get_u32()?;
        Ok(Self::new(OutPoint::new(txid, vout), script_sig, sequence))
    }
}

/// Output de transação
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Valor da saída
    pub value: Amount,
    /// Script que define as condições para gastar este output
    pub script_pubkey: Vec<u8>,
    /// Endereço do beneficiário
    pub address: Address,
}

impl TxOutput {
    /// Cria um novo output de transação
    #[must_use]
    pub const fn new(value: Amount, script_pubkey: Vec<u8>, address: Address) -> Self {
        Self {
            value,
            script_pubkey,
            address,
        }
    }

    fn encode(&self, writer: &mut CanonicalWriter) {
        writer.put_amount(&self.value);
        writer.put_bytes(&self.script_pubkey);
        writer.put_hash(&self.address);
    }

    fn decode(reader: &mut CanonicalReader<'_>) -> Result<Self> {
        let value = reader.get_amount()?;
        let script_pubkey = reader.get_bytes()?;
        let address = reader.get_hash()?;
        Ok(Self::new(value, script_pubkey, address))
    }
}

/// Transação da blockchain Tessera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Versão da transação
    pub version: u32,
    /// Endereço do remetente (derivado da chave pública)
    pub sender: Address,
    /// Inputs da transação
    pub inputs: Vec<TxInput>,
    /// Outputs da transação
    pub outputs: Vec<TxOutput>,
    /// Lock time (altura de bloco ou timestamp, por convenção)
    pub lock_time: u64,
    /// Contador monotônico por remetente
    pub nonce: u64,
    /// Timestamp de criação (ms)
    pub timestamp: Timestamp,
    /// Assinatura sobre a serialização canônica sem o campo de assinatura
    pub signature: Option<Signature>,
}

impl Transaction {
    /// Cria uma nova transação não assinada
    #[must_use]
    pub fn new(
        version: u32,
        sender: Address,
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        lock_time: u64,
        nonce: u64,
    ) -> Self {
        Self {
            version,
            sender,
            inputs,
            outputs,
            lock_time,
            nonce,
            timestamp: Utc::now().timestamp_millis(),
            signature: None,
        }
    }

    /// Cria a transação de recompensa de um bloco
    ///
    /// O script sig contém a altura do bloco para garantir ids únicos
    /// entre coinbases de alturas diferentes.
    #[must_use]
    pub fn coinbase(block_height: u64, reward: Amount, script_pubkey: Vec<u8>, miner: Address) -> Self {
        let script_sig = block_height.to_le_bytes().to_vec();
        let inputs = vec![TxInput::coinbase(script_sig)];
        let outputs = vec![TxOutput::new(reward, script_pubkey, miner)];

        Self::new(1, miner, inputs, outputs, 0, block_height)
    }

    /// Verifica se é uma transação de coinbase
    #[must_use]
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Altura embutida no script sig da coinbase
    ///
    /// # Errors
    ///
    /// Retorna erro se a transação não for coinbase válida
    pub fn coinbase_height(&self) -> Result<u64> {
        if !self.is_coinbase() {
            return Err(ChainError::InvalidTransaction(
                "Não é uma transação coinbase".to_string(),
            ));
        }
        let script_sig = &self.inputs[0].script_sig;
        let height_bytes: [u8; 8] = script_sig
            .get(0..8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                ChainError::InvalidTransaction("Altura da coinbase malformada".to_string())
            })?;
        Ok(u64::from_le_bytes(height_bytes))
    }

    /// Serialização canônica sem o campo de assinatura
    ///
    /// É a entrada do hash de identidade e do payload de assinatura.
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut writer = CanonicalWriter::new();
        self.encode_core(&mut writer);
        writer.into_bytes()
    }

    fn encode_core(&self, writer: &mut CanonicalWriter) {
        writer.put_u32(self.version);
        writer.put_hash(&self.sender);
        writer.put_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(writer);
        }
        writer.put_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(writer);
        }
        writer.put_varint(self.lock_time);
        writer.put_u64(self.nonce);
        writer.put_timestamp(self.timestamp);
    }

    /// Serialização canônica completa (com assinatura, se presente)
    ///
    /// # Errors
    ///
    /// Retorna erro se a assinatura não puder ser serializada
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = CanonicalWriter::new();
        self.encode_core(&mut writer);
        match &self.signature {
            Some(signature) => {
                writer.put_u8(1);
                let bytes = serde_json::to_vec(signature)
                    .map_err(|e| ChainError::SerializationError(e.to_string()))?;
                writer.put_bytes(&bytes);
            }
            None => writer.put_u8(0),
        }
        Ok(writer.into_bytes())
    }

    /// Decodifica uma transação da serialização canônica
    ///
    /// # Errors
    ///
    /// Retorna erro se os bytes forem malformados
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = CanonicalReader::new(data);
        let tx = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(tx)
    }

    pub(crate) fn decode_from(reader: &mut CanonicalReader<'_>) -> Result<Self> {
        let version = reader.get_u32()?;
        let sender = reader.get_hash()?;

        let input_count = reader.get_varint()?;
        let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
        for _ in 0..input_count {
            inputs.push(TxInput::decode(reader)?);
        }

        let output_count = reader.get_varint()?;
        let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            outputs.push(TxOutput::decode(reader)?);
        }

        let lock_time = reader.get_varint()?;
        let nonce = reader.get_u64()?;
        let timestamp = reader.get_timestamp()?;

        let signature = match reader.get_u8()? {
            0 => None,
            1 => {
                let bytes = reader.get_bytes()?;
                Some(
                    serde_json::from_slice(&bytes)
                        .map_err(|e| ChainError::SerializationError(e.to_string()))?,
                )
            }
            other => {
                return Err(ChainError::SerializationError(format!(
                    "marcador de assinatura inválido: {other}"
                )))
            }
        };

        Ok(Self {
            version,
            sender,
            inputs,
            outputs,
            lock_time,
            nonce,
            timestamp,
            signature,
        })
    }

    pub(crate) fn encode_into(&self, writer: &mut CanonicalWriter) -> Result<()> {
        let bytes = self.encode()?;
        writer.put_bytes(&bytes);
        Ok(())
    }

    /// Id da transação: Keccak-256 da serialização canônica sem assinatura
    #[must_use]
    pub fn id(&self) -> TxId {
        Hash256::keccak256(&self.signing_payload())
    }

    /// Tamanho serializado em bytes
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        self.encode().map_or(0, |bytes| bytes.len())
    }

    /// Assina a transação com o par de chaves do remetente
    ///
    /// # Errors
    ///
    /// Retorna erro se o remetente não corresponder à chave ou se a
    /// assinatura falhar
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<()> {
        if keypair.address() != self.sender {
            return Err(ChainError::InvalidTransaction(
                "Chave não corresponde ao remetente".to_string(),
            ));
        }
        let signature = keypair.sign(&self.signing_payload())?;
        self.signature = Some(signature);
        Ok(())
    }

    /// Verifica a assinatura e a posse da chave pelo remetente
    ///
    /// # Errors
    ///
    /// Retorna erro na ausência de assinatura ou falha criptográfica
    pub fn verify_signature(&self) -> Result<bool> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(ChainError::InvalidSignature)?;

        if signature.public_key().address() != self.sender {
            return Ok(false);
        }
        signature.verify(&self.signing_payload())
    }

    /// Calcula o valor total dos inputs consultando o conjunto de UTXOs
    ///
    /// # Errors
    ///
    /// Retorna erro se alguma UTXO não for encontrada ou se houver overflow
    pub fn total_input_value(&self, utxo_set: &UtxoSet) -> Result<Amount> {
        let mut total = Amount::zero();

        for input in &self.inputs {
            if input.is_coinbase() {
                continue;
            }
            let utxo = utxo_set
                .get(&input.previous_output)
                .ok_or(ChainError::UtxoNotFound)?;
            total = total.checked_add(&utxo.output.value)?;
        }

        Ok(total)
    }

    /// Calcula o valor total dos outputs
    ///
    /// # Errors
    ///
    /// Retorna erro se houver overflow no cálculo dos valores
    pub fn total_output_value(&self) -> Result<Amount> {
        let mut total = Amount::zero();
        for output in &self.outputs {
            total = total.checked_add(&output.value)?;
        }
        Ok(total)
    }

    /// Calcula a taxa paga pela transação: `Σ inputs − Σ outputs`
    ///
    /// # Errors
    ///
    /// Retorna erro se a taxa fosse negativa ou se alguma UTXO faltar
    pub fn fee(&self, utxo_set: &UtxoSet) -> Result<Amount> {
        if self.is_coinbase() {
            return Ok(Amount::zero());
        }

        let input_value = self.total_input_value(utxo_set)?;
        let output_value = self.total_output_value()?;

        input_value
            .checked_sub(&output_value)
            .map_err(|_| ChainError::InvalidTransaction("Taxa negativa".to_string()))
    }

    /// Validação estrutural independente de estado
    ///
    /// # Errors
    ///
    /// Retorna erro se a transação não atender aos critérios básicos
    pub fn validate_basic(&self) -> Result<()> {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Inputs ou outputs vazios".to_string(),
            ));
        }

        // Overflow nos outputs
        self.total_output_value()?;

        for output in &self.outputs {
            if output.value.is_zero() {
                return Err(ChainError::InvalidTransaction(
                    "Output de valor zero".to_string(),
                ));
            }
        }

        if self.is_coinbase() {
            if self.inputs.len() != 1 {
                return Err(ChainError::InvalidTransaction(
                    "Coinbase deve ter exatamente um input".to_string(),
                ));
            }
        } else {
            for input in &self.inputs {
                if input.is_coinbase() {
                    return Err(ChainError::InvalidTransaction(
                        "Input de coinbase em transação regular".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_output(value: u64) -> TxOutput {
        TxOutput::new(
            Amount::from_u64(value),
            vec![1, 2, 3],
            Hash256::keccak256(b"dest"),
        )
    }

    #[test]
    fn test_coinbase_transaction() {
        let miner = Hash256::keccak256(b"miner");
        let coinbase = Transaction::coinbase(100, Amount::from_u64(5000), vec![1, 2, 3], miner);

        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.coinbase_height().unwrap(), 100);
        assert_eq!(coinbase.inputs.len(), 1);
        assert_eq!(coinbase.outputs[0].value, Amount::from_u64(5000));
    }

    #[test]
    fn test_transaction_id_deterministic_and_signature_free() {
        let miner = Hash256::keccak256(b"miner");
        let tx = Transaction::coinbase(7, Amount::from_u64(10), vec![], miner);

        let id1 = tx.id();
        let id2 = tx.id();
        assert_eq!(id1, id2);
        assert_ne!(id1, Hash256::zero());
    }

    #[test]
    fn test_canonical_round_trip() {
        let sender = Hash256::keccak256(b"sender");
        let input = TxInput::new(OutPoint::new(Hash256::keccak256(b"prev"), 1), vec![9], 0);
        let tx = Transaction::new(1, sender, vec![input], vec![sample_output(42)], 5, 3);

        let bytes = tx.encode().unwrap();
        let decoded = Transaction::decode(&bytes).unwrap();
        assert_eq!(tx, decoded);
        assert_eq!(tx.id(), decoded.id());
    }

    #[test]
    fn test_validate_basic_rejects_empty() {
        let sender = Hash256::keccak256(b"sender");
        let empty = Transaction::new(1, sender, vec![], vec![], 0, 0);
        assert!(empty.validate_basic().is_err());
    }

    #[test]
    fn test_validate_basic_rejects_zero_output() {
        let sender = Hash256::keccak256(b"sender");
        let input = TxInput::new(OutPoint::new(Hash256::keccak256(b"prev"), 0), vec![], 0);
        let tx = Transaction::new(1, sender, vec![input], vec![sample_output(0)], 0, 0);
        assert!(tx.validate_basic().is_err());
    }

    #[test]
    fn test_validate_basic_rejects_coinbase_input_in_regular_tx() {
        let sender = Hash256::keccak256(b"sender");
        let regular = TxInput::new(OutPoint::new(Hash256::keccak256(b"prev"), 0), vec![], 0);
        let tx = Transaction::new(
            1,
            sender,
            vec![regular, TxInput::coinbase(vec![0; 8])],
            vec![sample_output(1)],
            0,
            0,
        );
        assert!(tx.validate_basic().is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate().unwrap();
        let input = TxInput::new(OutPoint::new(Hash256::keccak256(b"prev"), 0), vec![], 0);
        let mut tx = Transaction::new(1, keypair.address(), vec![input], vec![sample_output(5)], 0, 0);

        tx.sign(&keypair).unwrap();
        assert!(tx.verify_signature().unwrap());

        // Adulterar o nonce invalida a assinatura
        tx.nonce += 1;
        assert!(!tx.verify_signature().unwrap());
    }

    #[test]
    fn test_sign_rejects_wrong_key() {
        let keypair = KeyPair::generate().unwrap();
        let other_sender = Hash256::keccak256(b"someone-else");
        let input = TxInput::new(OutPoint::new(Hash256::keccak256(b"prev"), 0), vec![], 0);
        let mut tx = Transaction::new(1, other_sender, vec![input], vec![sample_output(5)], 0, 0);

        assert!(tx.sign(&keypair).is_err());
    }
}
