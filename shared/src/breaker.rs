//! Circuit breakers e políticas de retry
//!
//! Breakers são structs simples chaveadas por operação (`network`,
//! `consensus`, `health`); o estado vive atrás de um mutex pequeno.
//! Após `threshold` falhas consecutivas o breaker abre e rejeita
//! chamadores de imediato até `reset_timeout` passar; então admite uma
//! única sondagem (meio-aberto). A rejeição imediata não conta como
//! nova falha.

use crate::{ChainError, Result};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Estado observável do breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    failures: u32,
    last_failure: Option<Instant>,
    probing: bool,
}

/// Guarda de falha rápida sobre uma operação falível
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            threshold,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                failures: 0,
                last_failure: None,
                probing: false,
            }),
        }
    }

    /// Checagem de admissão; chamar antes da operação guardada
    ///
    /// # Errors
    ///
    /// Retorna `CircuitOpen` enquanto o breaker estiver aberto e o
    /// timeout de reset não tiver passado
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("lock do breaker envenenado");
        if inner.failures < self.threshold {
            return Ok(());
        }
        match inner.last_failure {
            Some(at) if at.elapsed() >= self.reset_timeout => {
                // Meio-aberto: admite exatamente uma sondagem
                if inner.probing {
                    Err(ChainError::CircuitOpen(self.name.clone()))
                } else {
                    inner.probing = true;
                    Ok(())
                }
            }
            _ => Err(ChainError::CircuitOpen(self.name.clone())),
        }
    }

    /// Registra sucesso da operação guardada; fecha o breaker
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("lock do breaker envenenado");
        inner.failures = 0;
        inner.last_failure = None;
        inner.probing = false;
    }

    /// Registra falha da operação guardada
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("lock do breaker envenenado");
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.probing = false;
    }

    #[must_use]
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock().expect("lock do breaker envenenado");
        if inner.failures < self.threshold {
            BreakerStatus::Closed
        } else {
            match inner.last_failure {
                Some(at) if at.elapsed() >= self.reset_timeout => BreakerStatus::HalfOpen,
                _ => BreakerStatus::Open,
            }
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Backoff exponencial com jitter, limitado a `max_delay`
///
/// A política apenas calcula atrasos e classifica erros; o sleep fica
/// com o chamador, então a mesma política serve contextos síncronos e
/// assíncronos.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Atraso antes da tentativa `attempt` (base zero), com até 25% de
    /// jitter
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let base = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        let jitter_budget = base.as_millis() as u64 / 4;
        let jitter = if jitter_budget == 0 {
            0
        } else {
            rand::random::<u64>() % jitter_budget
        };
        (base + Duration::from_millis(jitter)).min(self.max_delay)
    }

    /// Uma tentativa falhada deve ser repetida?
    #[must_use]
    pub fn should_retry(&self, error: &ChainError, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts && error.is_retryable()
    }
}
