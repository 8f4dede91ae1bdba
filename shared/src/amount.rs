//! Aritmética monetária e racional do consenso
//!
//! Todos os valores monetários e de trabalho acumulado usam precisão
//! arbitrária (`BigUint`), com suporte até 2^256. Nenhum caminho de
//! consenso usa ponto flutuante: taxas de participação e scores são
//! pares inteiros (`Ratio`) comparados por multiplicação cruzada.

use crate::error::ChainError;
use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign};

/// Valor monetário de precisão arbitrária (não negativo)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Amount(BigUint);

impl Amount {
    /// Valor zero
    #[must_use]
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    /// Cria um valor a partir de um `u64`
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        Self(BigUint::from(value))
    }

    /// Cria um valor a partir de um `BigUint`
    #[must_use]
    pub const fn from_biguint(value: BigUint) -> Self {
        Self(value)
    }

    /// Verifica se o valor é zero
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Referência ao `BigUint` interno
    #[must_use]
    pub const fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    /// Soma com verificação de limite (2^256)
    ///
    /// # Errors
    ///
    /// Retorna `InvalidAmount` se a soma exceder 2^256
    pub fn checked_add(&self, other: &Self) -> Result<Self, ChainError> {
        let sum = &self.0 + &other.0;
        if sum.bits() > 256 {
            return Err(ChainError::InvalidAmount(
                "Soma excede 2^256".to_string(),
            ));
        }
        Ok(Self(sum))
    }

    /// Subtração com verificação de underflow
    ///
    /// # Errors
    ///
    /// Retorna `InvalidAmount` se `other > self`
    pub fn checked_sub(&self, other: &Self) -> Result<Self, ChainError> {
        if other.0 > self.0 {
            return Err(ChainError::InvalidAmount(
                "Subtração resultaria em valor negativo".to_string(),
            ));
        }
        Ok(Self(&self.0 - &other.0))
    }

    /// Multiplica por um escalar `u64`
    ///
    /// # Errors
    ///
    /// Retorna `InvalidAmount` se o produto exceder 2^256
    pub fn checked_mul_u64(&self, factor: u64) -> Result<Self, ChainError> {
        let product = &self.0 * BigUint::from(factor);
        if product.bits() > 256 {
            return Err(ChainError::InvalidAmount(
                "Produto excede 2^256".to_string(),
            ));
        }
        Ok(Self(product))
    }

    /// Divide o valor por 2 (usado no halving de recompensa)
    #[must_use]
    pub fn halved(&self) -> Self {
        Self(&self.0 >> 1u32)
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl AddAssign<&Amount> for Amount {
    fn add_assign(&mut self, other: &Self) {
        self.0 += &other.0;
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Serializa como string decimal: JSON não representa inteiros de 256 bits
impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_str_radix(10))
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let value = BigUint::parse_bytes(text.as_bytes(), 10)
            .ok_or_else(|| serde::de::Error::custom("valor decimal inválido"))?;
        Ok(Self(value))
    }
}

/// Racional exato em `[0, 1]` quando `num <= den`
///
/// Usado para taxa de participação, `pow_score` e `voting_score`.
/// Comparações por multiplicação cruzada em `u128`, sem divisão inteira
/// nem ponto flutuante.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratio {
    pub num: u64,
    pub den: u64,
}

impl Ratio {
    /// Cria um racional; `den` deve ser positivo
    #[must_use]
    pub const fn new(num: u64, den: u64) -> Self {
        Self { num, den }
    }

    /// Racional zero (0/1)
    #[must_use]
    pub const fn zero() -> Self {
        Self { num: 0, den: 1 }
    }

    /// Racional um (1/1)
    #[must_use]
    pub const fn one() -> Self {
        Self { num: 1, den: 1 }
    }

    /// Verifica se representa um valor em `[0, 1]`
    #[must_use]
    pub const fn in_unit_interval(&self) -> bool {
        self.den > 0 && self.num <= self.den
    }

    /// Constrói um racional a partir de inteiros de precisão arbitrária
    ///
    /// Ambos os lados são deslocados igualmente até caberem em `u64`,
    /// preservando a razão com precisão suficiente para comparação
    /// contra limiares.
    #[must_use]
    pub fn from_biguints(mut num: BigUint, mut den: BigUint) -> Self {
        use num_traits::ToPrimitive;

        if den.is_zero() {
            return Self::zero();
        }
        let max = BigUint::from(u64::MAX);
        while num > max || den > max {
            num >>= 1u32;
            den >>= 1u32;
        }
        let den = den.to_u64().unwrap_or(1).max(1);
        Self {
            num: num.to_u64().unwrap_or(0),
            den,
        }
    }

    /// `self >= other` por multiplicação cruzada
    #[must_use]
    pub const fn ge(&self, other: &Self) -> bool {
        (self.num as u128) * (other.den as u128) >= (other.num as u128) * (self.den as u128)
    }

    /// `self < other` por multiplicação cruzada
    #[must_use]
    pub const fn lt(&self, other: &Self) -> bool {
        !self.ge(other)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}
