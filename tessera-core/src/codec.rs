//! Codec canônico determinístico
//!
//! Formato de fio usado por hashing e assinaturas: inteiros sem sinal
//! big-endian, strings UTF-8 com prefixo de comprimento, arrays com
//! prefixo varint (CompactSize de 1/3/5/9 bytes). Valores monetários
//! são fixos em 32 bytes big-endian para eliminar ambiguidade de
//! comprimento. A mesma entrada produz sempre os mesmos bytes em
//! qualquer plataforma.

use num_bigint::BigUint;
use shared::{Amount, ChainError, Hash256, Ratio, Result};

/// Escritor canônico sobre um buffer de bytes
#[derive(Debug, Default)]
pub struct CanonicalWriter {
    buffer: Vec<u8>,
}

impl CanonicalWriter {
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Consome o escritor e devolve os bytes
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Timestamps são não-negativos; codificados como u64 big-endian
    pub fn put_timestamp(&mut self, value: i64) {
        self.put_u64(value.max(0) as u64);
    }

    /// CompactSize: 1, 3, 5 ou 9 bytes conforme a magnitude
    pub fn put_varint(&mut self, value: u64) {
        match value {
            0..=0xFC => self.buffer.push(value as u8),
            0xFD..=0xFFFF => {
                self.buffer.push(0xFD);
                self.buffer.extend_from_slice(&(value as u16).to_be_bytes());
            }
            0x1_0000..=0xFFFF_FFFF => {
                self.buffer.push(0xFE);
                self.buffer.extend_from_slice(&(value as u32).to_be_bytes());
            }
            _ => {
                self.buffer.push(0xFF);
                self.buffer.extend_from_slice(&value.to_be_bytes());
            }
        }
    }

    /// Bytes com prefixo varint de comprimento
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_varint(bytes.len() as u64);
        self.buffer.extend_from_slice(bytes);
    }

    /// String UTF-8 com prefixo de comprimento
    pub fn put_string(&mut self, text: &str) {
        self.put_bytes(text.as_bytes());
    }

    /// Hash de 32 bytes, sem prefixo
    pub fn put_hash(&mut self, hash: &Hash256) {
        self.buffer.extend_from_slice(hash.as_bytes());
    }

    /// Valor monetário: 32 bytes big-endian com zeros à esquerda
    pub fn put_amount(&mut self, amount: &Amount) {
        let bytes = amount.as_biguint().to_bytes_be();
        let mut padded = [0u8; 32];
        padded[32 - bytes.len()..].copy_from_slice(&bytes);
        self.buffer.extend_from_slice(&padded);
    }

    /// Inteiro de precisão arbitrária limitado a 256 bits (dificuldade)
    pub fn put_biguint(&mut self, value: &BigUint) {
        let bytes = value.to_bytes_be();
        let mut padded = [0u8; 32];
        padded[32 - bytes.len().min(32)..].copy_from_slice(&bytes[bytes.len().saturating_sub(32)..]);
        self.buffer.extend_from_slice(&padded);
    }

    /// Racional como par de u64
    pub fn put_ratio(&mut self, ratio: &Ratio) {
        self.put_u64(ratio.num);
        self.put_u64(ratio.den);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Leitor canônico sobre uma fatia de bytes
#[derive(Debug)]
pub struct CanonicalReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> CanonicalReader<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.position + count > self.data.len() {
            return Err(ChainError::SerializationError(format!(
                "fim inesperado: precisava de {count} bytes na posição {}",
                self.position
            )));
        }
        let slice = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("slice de 4 bytes");
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("slice de 8 bytes");
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn get_timestamp(&mut self) -> Result<i64> {
        let raw = self.get_u64()?;
        i64::try_from(raw)
            .map_err(|_| ChainError::SerializationError("timestamp fora de alcance".to_string()))
    }

    pub fn get_varint(&mut self) -> Result<u64> {
        let tag = self.get_u8()?;
        match tag {
            0..=0xFC => Ok(u64::from(tag)),
            0xFD => {
                let bytes: [u8; 2] = self.take(2)?.try_into().expect("slice de 2 bytes");
                Ok(u64::from(u16::from_be_bytes(bytes)))
            }
            0xFE => {
                let bytes: [u8; 4] = self.take(4)?.try_into().expect("slice de 4 bytes");
                Ok(u64::from(u32::from_be_bytes(bytes)))
            }
            0xFF => self.get_u64(),
        }
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_varint()?;
        let len = usize::try_from(len)
            .map_err(|_| ChainError::SerializationError("comprimento excessivo".to_string()))?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| ChainError::SerializationError(format!("UTF-8 inválido: {e}")))
    }

    pub fn get_hash(&mut self) -> Result<Hash256> {
        let bytes: [u8; 32] = self.take(32)?.try_into().expect("slice de 32 bytes");
        Ok(Hash256::from_bytes(bytes))
    }

    pub fn get_amount(&mut self) -> Result<Amount> {
        let bytes = self.take(32)?;
        Ok(Amount::from_biguint(BigUint::from_bytes_be(bytes)))
    }

    pub fn get_biguint(&mut self) -> Result<BigUint> {
        let bytes = self.take(32)?;
        Ok(BigUint::from_bytes_be(bytes))
    }

    pub fn get_ratio(&mut self) -> Result<Ratio> {
        let num = self.get_u64()?;
        let den = self.get_u64()?;
        Ok(Ratio::new(num, den))
    }

    /// Verifica que todo o buffer foi consumido
    ///
    /// # Errors
    ///
    /// Retorna erro se sobraram bytes (codificação não-canônica)
    pub fn finish(self) -> Result<()> {
        if self.position != self.data.len() {
            return Err(ChainError::SerializationError(format!(
                "{} bytes residuais após decodificação",
                self.data.len() - self.position
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, u64::MAX] {
            let mut writer = CanonicalWriter::new();
            writer.put_varint(value);
            let bytes = writer.into_bytes();

            let expected_len = match value {
                0..=0xFC => 1,
                0xFD..=0xFFFF => 3,
                0x1_0000..=0xFFFF_FFFF => 5,
                _ => 9,
            };
            assert_eq!(bytes.len(), expected_len, "varint {value}");

            let mut reader = CanonicalReader::new(&bytes);
            assert_eq!(reader.get_varint().unwrap(), value);
            reader.finish().unwrap();
        }
    }

    #[test]
    fn test_amount_round_trip_256_bits() {
        let amount = Amount::from_biguint(BigUint::from(2u8).pow(255) + BigUint::from(7u8));
        let mut writer = CanonicalWriter::new();
        writer.put_amount(&amount);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 32);

        let mut reader = CanonicalReader::new(&bytes);
        assert_eq!(reader.get_amount().unwrap(), amount);
    }

    #[test]
    fn test_string_and_bytes_round_trip() {
        let mut writer = CanonicalWriter::new();
        writer.put_string("tessera");
        writer.put_bytes(&[1, 2, 3]);
        writer.put_u32(42);
        let bytes = writer.into_bytes();

        let mut reader = CanonicalReader::new(&bytes);
        assert_eq!(reader.get_string().unwrap(), "tessera");
        assert_eq!(reader.get_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(reader.get_u32().unwrap(), 42);
        reader.finish().unwrap();
    }

    #[test]
    fn test_residual_bytes_rejected() {
        let mut writer = CanonicalWriter::new();
        writer.put_u64(1);
        writer.put_u8(9);
        let bytes = writer.into_bytes();

        let mut reader = CanonicalReader::new(&bytes);
        reader.get_u64().unwrap();
        assert!(reader.finish().is_err());
    }

    #[test]
    fn test_truncated_input_rejected() {
        let mut reader = CanonicalReader::new(&[0x01, 0x02]);
        assert!(reader.get_u64().is_err());
    }

    #[test]
    fn test_determinism() {
        let encode = || {
            let mut writer = CanonicalWriter::new();
            writer.put_string("déterministe");
            writer.put_amount(&Amount::from_u64(10));
            writer.put_ratio(&Ratio::new(2, 3));
            writer.into_bytes()
        };
        assert_eq!(encode(), encode());
    }
}
