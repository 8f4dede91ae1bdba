//! Validador de transações
//!
//! Executa as verificações na ordem fixa do protocolo e devolve a taxa
//! da transação em caso de sucesso. Falhas carregam a tag de erro que o
//! chamador reporta; a variante assíncrona aplica o timeout de
//! validação e devolve `Timeout` sem efeitos colaterais.

use crate::params::NetworkParams;
use crate::transaction::Transaction;
use crate::utxo::UtxoSet;
use chrono::Utc;
use shared::{Amount, ChainError, Result, Timestamp};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

/// Validador de transações
#[derive(Debug)]
pub struct TransactionValidator {
    params: Arc<NetworkParams>,
}

impl TransactionValidator {
    #[must_use]
    pub fn new(params: Arc<NetworkParams>) -> Self {
        Self { params }
    }

    /// Valida uma transação contra o estado atual
    ///
    /// `fee_floor_per_byte` substitui a taxa mínima configurada quando o
    /// mempool está sob backpressure (modo rejeita-exceto-taxa-alta).
    ///
    /// # Errors
    ///
    /// Retorna o erro tageado da primeira verificação que falhar
    pub fn validate(
        &self,
        tx: &Transaction,
        utxo_set: &UtxoSet,
        current_height: u64,
        now: Timestamp,
        fee_floor_per_byte: Option<u64>,
    ) -> Result<Amount> {
        let params = &self.params;

        // 1. Tamanho e contagens
        let size = tx.serialized_size();
        if size == 0 || size > params.max_tx_size {
            return Err(ChainError::InvalidTransaction(format!(
                "Tamanho {size} excede o máximo de {} bytes",
                params.max_tx_size
            )));
        }
        if tx.inputs.is_empty() || tx.inputs.len() > params.max_inputs {
            return Err(ChainError::InvalidTransaction(format!(
                "Número de inputs fora dos limites: {}",
                tx.inputs.len()
            )));
        }
        if tx.outputs.is_empty() || tx.outputs.len() > params.max_outputs {
            return Err(ChainError::InvalidTransaction(format!(
                "Número de outputs fora dos limites: {}",
                tx.outputs.len()
            )));
        }

        // 2. Versão e janela de timestamp
        if tx.version < params.min_tx_version || tx.version > params.max_tx_version {
            return Err(ChainError::InvalidTransaction(format!(
                "Versão {} fora de [{}, {}]",
                tx.version, params.min_tx_version, params.max_tx_version
            )));
        }
        if tx.timestamp - now > params.max_time_drift_ms {
            return Err(ChainError::InvalidTimestamp(format!(
                "Timestamp {} ms no futuro",
                tx.timestamp - now
            )));
        }

        // 3. Tamanhos de scripts e assinatura
        for input in &tx.inputs {
            if input.script_sig.len() > params.max_script_size {
                return Err(ChainError::InvalidTransaction(
                    "Script sig excede o tamanho máximo".to_string(),
                ));
            }
        }
        for output in &tx.outputs {
            if output.script_pubkey.len() > params.max_script_size {
                return Err(ChainError::InvalidTransaction(
                    "Script pubkey excede o tamanho máximo".to_string(),
                ));
            }
        }
        if let Some(signature) = &tx.signature {
            if signature.size() > params.max_signature_size {
                return Err(ChainError::InvalidTransaction(
                    "Assinatura excede o tamanho máximo".to_string(),
                ));
            }
        }

        // 4. Inputs: existência, idade, autorização
        tx.validate_basic()?;
        for input in &tx.inputs {
            let utxo = utxo_set
                .get_unspent(&input.previous_output)
                .ok_or(ChainError::UtxoNotFound)?;

            if utxo.confirmations(current_height) < params.min_input_age {
                return Err(ChainError::InvalidTransaction(format!(
                    "Input {} com {} confirmações, mínimo {}",
                    input.previous_output,
                    utxo.confirmations(current_height),
                    params.min_input_age
                )));
            }
            if !utxo.is_mature(current_height, params.coinbase_maturity) {
                return Err(ChainError::InvalidTransaction(format!(
                    "Coinbase imatura em {}",
                    input.previous_output
                )));
            }
            // O script autoriza o gasto: a saída pertence ao remetente
            if utxo.output.address != tx.sender {
                return Err(ChainError::InvalidTransaction(format!(
                    "Remetente não autorizado a gastar {}",
                    input.previous_output
                )));
            }
        }

        // 5. Somas e taxa mínima
        let input_value = tx.total_input_value(utxo_set)?;
        let output_value = tx.total_output_value()?;
        if input_value < output_value {
            return Err(ChainError::InsufficientFunds);
        }
        let fee = tx.fee(utxo_set)?;

        let floor_rate = fee_floor_per_byte.unwrap_or(params.min_fee_per_byte);
        let min_fee = Amount::from_u64(floor_rate).checked_mul_u64(size as u64)?;
        if fee < min_fee {
            return Err(ChainError::InvalidTransaction(format!(
                "Taxa {fee} abaixo do mínimo {min_fee}"
            )));
        }

        // 6. Assinatura sobre a serialização canônica sem assinatura
        if !tx.verify_signature()? {
            return Err(ChainError::InvalidSignature);
        }

        // 7. Inputs duplicados e auto-gasto
        let mut seen = HashSet::new();
        for input in &tx.inputs {
            if !seen.insert(input.previous_output) {
                return Err(ChainError::DoubleSpend(format!(
                    "Input duplicado {}",
                    input.previous_output
                )));
            }
        }
        let own_id = tx.id();
        if tx.inputs.iter().any(|input| input.previous_output.txid == own_id) {
            return Err(ChainError::InvalidTransaction(
                "Transação gasta a própria saída".to_string(),
            ));
        }

        Ok(fee)
    }

    /// Variante com timeout de validação
    ///
    /// A verificação roda em um worker bloqueante; estourado o prazo o
    /// chamador recebe `Timeout` e nenhum estado é alterado.
    ///
    /// # Errors
    ///
    /// Retorna `Timeout` se `validation_timeout_ms` expirar, ou o erro
    /// da validação em si
    pub async fn validate_with_timeout(
        self: &Arc<Self>,
        tx: Transaction,
        utxo_set: Arc<RwLock<UtxoSet>>,
        current_height: u64,
        fee_floor_per_byte: Option<u64>,
    ) -> Result<Amount> {
        let validator = Arc::clone(self);
        let timeout = Duration::from_millis(self.params.validation_timeout_ms);

        let task = tokio::task::spawn_blocking(move || {
            let set = utxo_set
                .read()
                .map_err(|_| ChainError::StoreFatal("utxo lock envenenado".to_string()))?;
            validator.validate(
                &tx,
                &set,
                current_height,
                Utc::now().timestamp_millis(),
                fee_floor_per_byte,
            )
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ChainError::InvalidTransaction(format!(
                "Worker de validação abortou: {join_error}"
            ))),
            Err(_) => {
                warn!(operation = "tx_validation", height = current_height, "validation timed out");
                Err(ChainError::Timeout("tx_validation".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::transaction::{TxInput, TxOutput};
    use shared::{Hash256, KeyPair, OutPoint};

    struct Fixture {
        validator: TransactionValidator,
        utxo_set: UtxoSet,
        keypair: KeyPair,
        coinbase_outpoint: OutPoint,
        params: Arc<NetworkParams>,
    }

    fn fixture() -> Fixture {
        let mut params = NetworkParams::regtest();
        params.coinbase_maturity = 0;
        params.min_fee_per_byte = 0;
        let params = Arc::new(params);

        let keypair = KeyPair::generate().unwrap();
        let genesis = Block::genesis(&params, &keypair).unwrap();
        let mut utxo_set = UtxoSet::new();
        utxo_set.apply_block(&genesis).unwrap();
        let coinbase_outpoint = OutPoint::new(genesis.transactions[0].id(), 0);

        Fixture {
            validator: TransactionValidator::new(Arc::clone(&params)),
            utxo_set,
            keypair,
            coinbase_outpoint,
            params,
        }
    }

    fn spend(fixture: &Fixture, value: u64) -> Transaction {
        let mut tx = Transaction::new(
            1,
            fixture.keypair.address(),
            vec![TxInput::new(fixture.coinbase_outpoint, vec![], 0)],
            vec![TxOutput::new(
                Amount::from_u64(value),
                vec![2],
                Hash256::keccak256(b"dest"),
            )],
            0,
            0,
        );
        tx.sign(&fixture.keypair).unwrap();
        tx
    }

    fn now() -> Timestamp {
        Utc::now().timestamp_millis()
    }

    #[test]
    fn test_valid_spend_returns_fee() {
        let fixture = fixture();
        let tx = spend(&fixture, 4_900); // taxa de 100

        let fee = fixture
            .validator
            .validate(&tx, &fixture.utxo_set, 10, now(), None)
            .unwrap();
        assert_eq!(fee, Amount::from_u64(100));
    }

    #[test]
    fn test_missing_utxo_rejected() {
        let fixture = fixture();
        let mut tx = spend(&fixture, 100);
        tx.inputs[0].previous_output = OutPoint::new(Hash256::keccak256(b"missing"), 0);
        tx.sign(&fixture.keypair).unwrap();

        let err = fixture
            .validator
            .validate(&tx, &fixture.utxo_set, 10, now(), None)
            .unwrap_err();
        assert_eq!(err, ChainError::UtxoNotFound);
    }

    #[test]
    fn test_outputs_exceeding_inputs_rejected() {
        let fixture = fixture();
        let tx = spend(&fixture, 10_000);

        let err = fixture
            .validator
            .validate(&tx, &fixture.utxo_set, 10, now(), None)
            .unwrap_err();
        assert_eq!(err, ChainError::InsufficientFunds);
    }

    #[test]
    fn test_unauthorized_sender_rejected() {
        let fixture = fixture();
        let thief = KeyPair::generate().unwrap();
        let mut tx = spend(&fixture, 100);
        tx.sender = thief.address();
        tx.sign(&thief).unwrap();

        let err = fixture
            .validator
            .validate(&tx, &fixture.utxo_set, 10, now(), None)
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidTransaction(_)));
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let fixture = fixture();
        let mut tx = spend(&fixture, 100);
        tx.timestamp = now() + fixture.params.max_time_drift_ms + 1_000;
        tx.sign(&fixture.keypair).unwrap();

        let err = fixture
            .validator
            .validate(&tx, &fixture.utxo_set, 10, now(), None)
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidTimestamp(_)));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let fixture = fixture();
        let mut tx = spend(&fixture, 100);
        tx.nonce = 99; // invalida a assinatura existente

        let err = fixture
            .validator
            .validate(&tx, &fixture.utxo_set, 10, now(), None)
            .unwrap_err();
        assert_eq!(err, ChainError::InvalidSignature);
    }

    #[test]
    fn test_duplicate_inputs_rejected() {
        let fixture = fixture();
        let mut tx = spend(&fixture, 100);
        let duplicate = tx.inputs[0].clone();
        tx.inputs.push(duplicate);
        tx.sign(&fixture.keypair).unwrap();

        let err = fixture
            .validator
            .validate(&tx, &fixture.utxo_set, 10, now(), None)
            .unwrap_err();
        assert!(matches!(err, ChainError::DoubleSpend(_)));
    }

    #[test]
    fn test_backpressure_fee_floor_applies() {
        let fixture = fixture();
        let tx = spend(&fixture, 4_999); // taxa de 1

        // Sem backpressure passa
        fixture
            .validator
            .validate(&tx, &fixture.utxo_set, 10, now(), None)
            .unwrap();

        // Com piso elevado é rejeitada
        let err = fixture
            .validator
            .validate(&tx, &fixture.utxo_set, 10, now(), Some(1_000))
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidTransaction(_)));
    }

    #[tokio::test]
    async fn test_validate_with_timeout_happy_path() {
        let fixture = fixture();
        let validator = Arc::new(TransactionValidator::new(Arc::clone(&fixture.params)));
        let utxo = Arc::new(RwLock::new(fixture.utxo_set.clone()));
        let tx = spend(&fixture, 4_900);

        let fee = validator
            .validate_with_timeout(tx, utxo, 10, None)
            .await
            .unwrap();
        assert_eq!(fee, Amount::from_u64(100));
    }
}
