// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.
use std::io::Write;

use byteorder::BigEndian;
use byteorder::WriteBytesExt;
use thiserror::Error;

use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterError;
use crate::codec::evc::nalu::NaluType;
use crate::codec::evc::nalu::NALU_HEADER_SIZE;

#[derive(Error, Debug)]
pub enum NaluWriterError {
    #[error("value increment caused value overflow")]
    Overflow,
    #[error("NAL unit of {0} bytes is shorter than its header")]
    TooShort(usize),
    #[error("NAL unit of {0} bytes does not fit a 32-bit length prefix")]
    TooLarge(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    BitWriterError(#[from] BitWriterError),
}

pub type NaluWriterResult<T> = std::result::Result<T, NaluWriterError>;

/// A writer for EVC NAL unit payloads. EVC carries no emulation prevention,
/// so bits go straight to the underlying writer.
pub struct NaluWriter<W: Write>(BitWriter<W>);

impl<W: Write> NaluWriter<W> {
    pub fn new(writer: W) -> Self {
        Self(BitWriter::new(writer))
    }

    /// Writes fixed bit size integer (up to 32 bit). Corresponds to `f(n)`.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.0
            .write_f(bits, value)
            .map_err(NaluWriterError::BitWriterError)
    }

    /// An alias to [`Self::write_f`]. Corresponds to `u(n)`.
    pub fn write_u<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.write_f(bits, value)
    }

    /// Writes a number in exponential golumb format.
    pub fn write_exp_golumb(&mut self, value: u32) -> NaluWriterResult<()> {
        let value = value.checked_add(1).ok_or(NaluWriterError::Overflow)?;
        let bits = 32 - value.leading_zeros() as usize;
        let zeros = bits - 1;

        self.write_f(zeros, 0u32)?;
        self.write_f(bits, value)?;

        Ok(())
    }

    /// Writes a unsigned integer in exponential golumb format.
    /// Corresponds to `ue(v)`.
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> NaluWriterResult<()> {
        let value = value.into();

        self.write_exp_golumb(value)
    }

    /// Writes a signed integer in exponential golumb format.
    /// Corresponds to `se(v)`.
    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> NaluWriterResult<()> {
        let value: i32 = value.into();
        let abs_value: u32 = value.unsigned_abs();
        let doubled = abs_value.checked_mul(2).ok_or(NaluWriterError::Overflow)?;

        if value <= 0 {
            self.write_ue(doubled)
        } else {
            self.write_ue(doubled - 1)
        }
    }

    /// Returns `true` if ['Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.0.has_data_pending()
    }

    /// Writes an EVC NAL unit header. Any pending bits are flushed first.
    pub fn write_header(&mut self, type_: NaluType, temporal_id: u8) -> NaluWriterResult<()> {
        self.0.flush()?;

        // forbidden_zero_bit, nal_unit_type_plus1, nuh_temporal_id,
        // nuh_reserved_zero_5bits, nuh_extension_flag
        let header = (u16::from(type_ as u8 + 1) & 0x3f) << 9 | (u16::from(temporal_id) & 0x7) << 6;
        let out = self.0.inner_mut();
        out.write_u16::<BigEndian>(header)?;

        Ok(())
    }

    /// Returns `true` if next bits will be aligned to 8
    pub fn aligned(&self) -> bool {
        !self.0.has_data_pending()
    }
}

/// Writes `nalu` (header included) preceded by its 4-byte big-endian length.
pub fn write_length_prefixed<W: Write>(out: &mut W, nalu: &[u8]) -> NaluWriterResult<()> {
    if nalu.len() < NALU_HEADER_SIZE {
        return Err(NaluWriterError::TooShort(nalu.len()));
    }

    let len = u32::try_from(nalu.len()).map_err(|_| NaluWriterError::TooLarge(nalu.len()))?;
    out.write_u32::<BigEndian>(len)?;
    out.write_all(nalu)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::BitReader;
    use crate::codec::evc::nalu::read_header;

    #[test]
    fn simple_bits() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf);
            writer.write_f(1, true).unwrap();
            writer.write_f(1, false).unwrap();
            writer.write_f(1, false).unwrap();
            writer.write_f(1, false).unwrap();
            writer.write_f(1, true).unwrap();
            writer.write_f(1, true).unwrap();
            writer.write_f(1, true).unwrap();
            writer.write_f(1, true).unwrap();
        }
        assert_eq!(buf, vec![0b10001111u8]);
    }

    #[test]
    fn simple_first_few_ue() {
        fn single_ue(value: u32) -> Vec<u8> {
            let mut buf = Vec::<u8>::new();
            {
                let mut writer = NaluWriter::new(&mut buf);
                writer.write_ue(value).unwrap();
            }
            buf
        }

        assert_eq!(single_ue(0), vec![0b10000000u8]);
        assert_eq!(single_ue(1), vec![0b01000000u8]);
        assert_eq!(single_ue(2), vec![0b01100000u8]);
        assert_eq!(single_ue(3), vec![0b00100000u8]);
        assert_eq!(single_ue(4), vec![0b00101000u8]);
        assert_eq!(single_ue(5), vec![0b00110000u8]);
        assert_eq!(single_ue(6), vec![0b00111000u8]);
        assert_eq!(single_ue(7), vec![0b00010000u8]);
        assert_eq!(single_ue(8), vec![0b00010010u8]);
        assert_eq!(single_ue(9), vec![0b00010100u8]);
    }

    #[test]
    fn writer_reader() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf);
            writer.write_ue(10u32).unwrap();
            writer.write_se(-42).unwrap();
            writer.write_se(3).unwrap();
            writer.write_ue(5u32).unwrap();
        }

        let mut reader = BitReader::new(&buf);

        assert_eq!(reader.read_ue::<u32>().unwrap(), 10);
        assert_eq!(reader.read_se::<i32>().unwrap(), -42);
        assert_eq!(reader.read_se::<i32>().unwrap(), 3);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 5);
    }

    #[test]
    fn exp_golomb_limits() {
        let ue_values = [0u32, 1, 2, 254, 255, 65_535, 0x7fff_ffff, u32::MAX - 1];
        let se_values = [0i32, 1, -1, 127, -128, i32::MAX, i32::MIN + 1];

        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf);
            for v in ue_values {
                writer.write_ue(v).unwrap();
            }
            for v in se_values {
                writer.write_se(v).unwrap();
            }

            assert!(matches!(
                writer.write_ue(u32::MAX),
                Err(NaluWriterError::Overflow)
            ));
            assert!(matches!(
                writer.write_se(i32::MIN),
                Err(NaluWriterError::Overflow)
            ));
        }

        let mut reader = BitReader::new(&buf);
        for v in ue_values {
            assert_eq!(reader.read_ue::<u32>().unwrap(), v);
        }
        for v in se_values {
            assert_eq!(reader.read_se::<i32>().unwrap(), v);
        }
    }

    #[test]
    fn header_and_framing() {
        let mut nalu = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut nalu);
            writer.write_header(NaluType::Pps, 3).unwrap();
            writer.write_u(8, 0xa5u8).unwrap();
        }
        assert_eq!(nalu.len(), 3);

        let hdr = read_header(&nalu).unwrap();
        assert_eq!(hdr.type_, NaluType::Pps);
        assert_eq!(hdr.temporal_id, 3);

        let mut framed = Vec::new();
        write_length_prefixed(&mut framed, &nalu).unwrap();
        assert_eq!(&framed[..4], &[0x00, 0x00, 0x00, 0x03]);
        assert_eq!(&framed[4..], &nalu[..]);
    }
}
