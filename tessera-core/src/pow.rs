use crate::block::{Block, BlockHeader};
use crate::params::NetworkParams;
use chrono::Utc;
use num_bigint::BigUint;
use shared::{ChainError, Hash256, Ratio, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Resultado da mineração
#[derive(Debug, Clone)]
pub struct MiningResult {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub nonce: u64,
    pub attempts: u64,
}

/// Motor de Proof-of-Work
///
/// Um bloco é válido sse `uint256(hash) <= alvo`, com
/// `alvo = alvo_máximo / dificuldade`. O retarget usa a formulação
/// clamp-então-divide: o timespan observado é limitado a
/// `[alvo/f, alvo*f]` antes da divisão.
#[derive(Debug)]
pub struct PowEngine {
    params: Arc<NetworkParams>,
}

impl PowEngine {
    #[must_use]
    pub fn new(params: Arc<NetworkParams>) -> Self {
        Self { params }
    }

    /// Alvo correspondente a uma dificuldade
    ///
    /// # Errors
    ///
    /// Retorna erro se o alvo máximo configurado for inválido
    pub fn target_for_difficulty(&self, difficulty: &BigUint) -> Result<BigUint> {
        let max_target = self.params.max_target()?;
        let divisor = difficulty.max(&BigUint::from(1u8)).clone();
        Ok(max_target / divisor)
    }

    /// Codifica um alvo como hex `0x…`
    #[must_use]
    pub fn encode_target(target: &BigUint) -> String {
        format!("0x{}", target.to_str_radix(16))
    }

    /// Decodifica um alvo em hex `0x…`
    ///
    /// # Errors
    ///
    /// Retorna erro se o hex for inválido
    pub fn parse_target(text: &str) -> Result<BigUint> {
        let stripped = text.strip_prefix("0x").unwrap_or(text);
        BigUint::parse_bytes(stripped.as_bytes(), 16)
            .ok_or_else(|| ChainError::InvalidBlock(format!("Alvo inválido: {text}")))
    }

    /// O hash satisfaz o alvo?
    #[must_use]
    pub fn meets_target(hash: &Hash256, target: &BigUint) -> bool {
        hash.to_biguint() <= *target
    }

    /// Dificuldade esperada do próximo bloco
    ///
    /// Ajusta a cada `difficulty_adjustment_interval` blocos; fora da
    /// fronteira o bloco herda a dificuldade do pai.
    ///
    /// # Errors
    ///
    /// Retorna erro se o cabeçalho do início do intervalo não puder ser
    /// resolvido
    pub fn next_difficulty(
        &self,
        tip: &BlockHeader,
        header_at_height: impl Fn(u64) -> Result<BlockHeader>,
    ) -> Result<BigUint> {
        let interval = self.params.difficulty_adjustment_interval;
        let next_height = tip.height + 1;

        if interval == 0 || next_height % interval != 0 || next_height < interval {
            return Ok(tip.difficulty.clone());
        }

        let window_start = header_at_height(next_height - interval)?;
        let actual_ms = (tip.timestamp - window_start.timestamp).max(1) as u64;

        let target_ms = self.params.target_timespan_ms;
        let factor = self.params.max_adjustment_factor.max(1);
        let clamped = actual_ms.clamp(target_ms / factor, target_ms * factor);

        let new_difficulty =
            (&tip.difficulty * BigUint::from(target_ms)) / BigUint::from(clamped);

        Ok(new_difficulty.max(BigUint::from(self.params.min_difficulty)))
    }

    /// Valida o PoW de um bloco
    ///
    /// # Errors
    ///
    /// Retorna erro se a dificuldade divergir do retarget esperado, se
    /// o hash recalculado não bater ou se o alvo não for satisfeito
    pub fn validate_block(&self, block: &Block, expected_difficulty: &BigUint) -> Result<()> {
        let header = &block.header;

        if header.difficulty != *expected_difficulty {
            return Err(ChainError::InvalidBlock(format!(
                "Dificuldade {} difere da esperada {expected_difficulty}",
                header.difficulty
            )));
        }

        let expected_target = self.target_for_difficulty(expected_difficulty)?;
        let declared_target = Self::parse_target(&header.target)?;
        if declared_target != expected_target {
            return Err(ChainError::InvalidBlock(
                "Alvo declarado diverge da dificuldade".to_string(),
            ));
        }

        let recomputed = header.compute_hash()?;
        if recomputed != header.hash {
            return Err(ChainError::InvalidBlock(
                "Hash do cabeçalho não confere".to_string(),
            ));
        }

        if !Self::meets_target(&header.hash, &expected_target) {
            return Err(ChainError::InvalidBlock(
                "Hash acima do alvo de PoW".to_string(),
            ));
        }

        Ok(())
    }

    /// Score de PoW: `dificuldade do bloco / dificuldade da rede`
    #[must_use]
    pub fn pow_score(block_difficulty: &BigUint, network_difficulty: &BigUint) -> Ratio {
        Ratio::from_biguints(block_difficulty.clone(), network_difficulty.clone())
    }

    /// Minera um cabeçalho com cancelamento cooperativo
    ///
    /// Divide o espaço de nonce entre threads; o timestamp é renovado
    /// periodicamente dentro da janela de drift. Em exaustão do espaço
    /// sem solução retorna `NonceNotFound` (retryable: o chamador
    /// reconstrói o template e tenta de novo).
    ///
    /// # Errors
    ///
    /// Retorna `NonceNotFound` em exaustão ou cancelamento
    pub fn mine(&self, header: &BlockHeader, cancel: &Arc<AtomicBool>) -> Result<MiningResult> {
        let target = Self::parse_target(&header.target)?;
        let threads = self.params.mining_threads.max(1);
        let batch = self.params.hash_batch_size.max(1);

        let found = Arc::new(AtomicBool::new(false));
        let result: Arc<Mutex<Option<MiningResult>>> = Arc::new(Mutex::new(None));
        let mut handles = vec![];

        let nonce_per_thread = u64::MAX / threads as u64;

        for thread_id in 0..threads {
            let mut worker_header = header.clone();
            let worker_target = target.clone();
            let worker_cancel = Arc::clone(cancel);
            let worker_found = Arc::clone(&found);
            let worker_result = Arc::clone(&result);

            let start_nonce = thread_id as u64 * nonce_per_thread;
            let end_nonce = if thread_id == threads - 1 {
                u64::MAX
            } else {
                (thread_id as u64 + 1) * nonce_per_thread
            };

            let handle = thread::spawn(move || {
                let mut attempts = 0u64;

                for nonce in start_nonce..end_nonce {
                    // Checagem cooperativa por lote
                    if attempts % batch == 0
                        && (worker_cancel.load(Ordering::SeqCst)
                            || worker_found.load(Ordering::SeqCst))
                    {
                        break;
                    }

                    worker_header.nonce = nonce;
                    attempts += 1;

                    if let Ok(hash) = worker_header.compute_hash() {
                        if hash.to_biguint() <= worker_target {
                            worker_found.store(true, Ordering::SeqCst);
                            worker_header.hash = hash;

                            let mining_result = MiningResult {
                                header: worker_header.clone(),
                                hash,
                                nonce,
                                attempts,
                            };
                            *worker_result.lock().expect("result lock envenenado") =
                                Some(mining_result);
                            break;
                        }
                    }

                    // Renovar o timestamp periodicamente
                    if attempts % 100_000 == 0 {
                        worker_header.timestamp = Utc::now().timestamp_millis();
                    }
                }
            });

            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }

        let mined = result
            .lock()
            .expect("result lock envenenado")
            .take()
            .ok_or(ChainError::NonceNotFound);
        mined
    }

    /// Estima a taxa de hash local (hashes por segundo)
    ///
    /// # Errors
    ///
    /// Retorna erro se o cálculo do hash falhar
    pub fn estimate_hashrate(&self, header: &BlockHeader, duration_secs: u64) -> Result<u64> {
        let start = std::time::Instant::now();
        let mut probe = header.clone();
        let mut attempts = 0u64;

        while start.elapsed().as_secs() < duration_secs {
            probe.nonce = attempts;
            let _ = probe.compute_hash()?;
            attempts += 1;
        }

        let elapsed_ms = start.elapsed().as_millis().max(1) as u64;
        Ok(attempts * 1_000 / elapsed_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::KeyPair;

    fn engine() -> PowEngine {
        PowEngine::new(Arc::new(NetworkParams::regtest()))
    }

    fn genesis_header() -> BlockHeader {
        let keypair = KeyPair::generate().unwrap();
        Block::genesis(&NetworkParams::regtest(), &keypair)
            .unwrap()
            .header
    }

    #[test]
    fn test_target_inversely_proportional_to_difficulty() {
        let engine = engine();
        let easy = engine.target_for_difficulty(&BigUint::from(1u8)).unwrap();
        let hard = engine.target_for_difficulty(&BigUint::from(16u8)).unwrap();

        assert!(hard < easy);
        assert_eq!(easy, engine.params.max_target().unwrap());
    }

    #[test]
    fn test_target_encoding_round_trip() {
        let target = BigUint::from(0xdead_beefu32);
        let text = PowEngine::encode_target(&target);
        assert!(text.starts_with("0x"));
        assert_eq!(PowEngine::parse_target(&text).unwrap(), target);
    }

    #[test]
    fn test_difficulty_inherited_off_boundary() {
        let engine = engine();
        let mut tip = genesis_header();
        tip.height = 5; // (5+1) % 10 != 0
        tip.difficulty = BigUint::from(7u8);

        let next = engine
            .next_difficulty(&tip, |_| unreachable!("não deve consultar ancestrais"))
            .unwrap();
        assert_eq!(next, BigUint::from(7u8));
    }

    #[test]
    fn test_retarget_doubles_on_half_timespan() {
        // Cenário do protocolo: timespan observado = metade do alvo
        let params = NetworkParams {
            difficulty_adjustment_interval: 2016,
            target_timespan_ms: 1_209_600_000,
            max_adjustment_factor: 4,
            ..NetworkParams::default()
        };
        let engine = PowEngine::new(Arc::new(params));

        let mut window_start = genesis_header();
        window_start.height = 2016 * 2 - 2016; // início da janela
        window_start.timestamp = 0;

        let mut tip = window_start.clone();
        tip.height = 2016 * 2 - 1; // próximo bloco está na fronteira
        tip.timestamp = 604_800_000; // metade do alvo
        tip.difficulty = BigUint::from(100u8);

        let next = engine
            .next_difficulty(&tip, |height| {
                assert_eq!(height, 2016);
                Ok(window_start.clone())
            })
            .unwrap();
        assert_eq!(next, BigUint::from(200u8));
    }

    #[test]
    fn test_retarget_clamped_at_factor() {
        let params = NetworkParams {
            difficulty_adjustment_interval: 10,
            target_timespan_ms: 1_000_000,
            max_adjustment_factor: 4,
            ..NetworkParams::default()
        };
        let engine = PowEngine::new(Arc::new(params));

        let mut window_start = genesis_header();
        window_start.height = 10;
        window_start.timestamp = 0;

        let mut tip = window_start.clone();
        tip.height = 19;
        tip.timestamp = 1; // absurdamente rápido: clamp em alvo/4
        tip.difficulty = BigUint::from(100u8);

        let next = engine
            .next_difficulty(&tip, |_| Ok(window_start.clone()))
            .unwrap();
        // 100 * 1_000_000 / 250_000 = 400 (máximo 4x)
        assert_eq!(next, BigUint::from(400u16));
    }

    #[test]
    fn test_retarget_floors_at_min_difficulty() {
        let params = NetworkParams {
            difficulty_adjustment_interval: 10,
            target_timespan_ms: 1_000,
            max_adjustment_factor: 4,
            min_difficulty: 3,
            ..NetworkParams::default()
        };
        let engine = PowEngine::new(Arc::new(params));

        let mut window_start = genesis_header();
        window_start.height = 10;
        window_start.timestamp = 0;

        let mut tip = window_start.clone();
        tip.height = 19;
        tip.timestamp = 4_000; // lento: dificuldade cai 4x
        tip.difficulty = BigUint::from(4u8);

        let next = engine
            .next_difficulty(&tip, |_| Ok(window_start.clone()))
            .unwrap();
        // 4 / 4 = 1, piso em 3
        assert_eq!(next, BigUint::from(3u8));
    }

    #[test]
    fn test_pow_score() {
        let score = PowEngine::pow_score(&BigUint::from(8u8), &BigUint::from(16u8));
        assert!(score.ge(&Ratio::new(1, 2)));
        assert!(score.lt(&Ratio::new(51, 100)));
    }

    #[test]
    fn test_mine_and_validate() {
        let engine = engine();
        let header = genesis_header();
        let cancel = Arc::new(AtomicBool::new(false));

        let result = engine.mine(&header, &cancel).unwrap();
        assert!(PowEngine::meets_target(
            &result.hash,
            &PowEngine::parse_target(&result.header.target).unwrap()
        ));
        assert_eq!(result.header.compute_hash().unwrap(), result.hash);
    }

    #[test]
    fn test_mine_honors_cancellation() {
        let params = NetworkParams {
            // Alvo minúsculo: nunca encontra solução em tempo de teste
            max_target_hex: "0x1".to_string(),
            hash_batch_size: 1,
            ..NetworkParams::regtest()
        };
        let engine = PowEngine::new(Arc::new(params));
        let mut header = genesis_header();
        header.target = "0x1".to_string();

        let cancel = Arc::new(AtomicBool::new(true));
        let err = engine.mine(&header, &cancel).unwrap_err();
        assert_eq!(err, ChainError::NonceNotFound);
    }

    #[test]
    fn test_hashrate_estimation() {
        let engine = engine();
        let header = genesis_header();

        let hashrate = engine.estimate_hashrate(&header, 1).unwrap();
        assert!(hashrate > 0);
    }

    #[test]
    fn test_validate_rejects_wrong_difficulty() {
        let engine = engine();
        let keypair = KeyPair::generate().unwrap();
        let block = Block::genesis(&NetworkParams::regtest(), &keypair).unwrap();

        let err = engine
            .validate_block(&block, &BigUint::from(999u16))
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock(_)));
    }

    #[test]
    fn test_validate_accepts_genesis() {
        let engine = engine();
        let keypair = KeyPair::generate().unwrap();
        let block = Block::genesis(&NetworkParams::regtest(), &keypair).unwrap();

        engine
            .validate_block(&block, &block.header.difficulty)
            .unwrap();
    }
}
