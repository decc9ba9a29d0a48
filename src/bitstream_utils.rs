// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;
use std::io::Read;
use std::io::Write;
use std::marker::PhantomData;

use thiserror::Error;

use crate::codec::evc::nalu::Nalu as EvcNalu;

/// A bit reader for EVC NAL unit payloads.
///
/// Length-prefixed EVC NAL units carry no emulation prevention bytes, so the
/// reader walks the payload as-is. Every read first checks that enough bits
/// remain, so a failed read leaves the reader where it was.
#[derive(Clone)]
pub struct BitReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_bytes.
    curr_byte: u8,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// How many bits have been read so far.
    position: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadBitsError {
    #[error("more than 32 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("reader ran out of bits: {requested} requested, {available} left")]
    NotEnoughBits { requested: usize, available: usize },
    #[error("invalid exp-golomb code")]
    InvalidExpGolomb,
    #[error("value out of bounds: expected {min} - {max}, got {value}")]
    OutOfBounds { min: i64, max: i64, value: i64 },
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

pub type ReadBitsResult<T> = std::result::Result<T, ReadBitsError>;

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            position: 0,
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> ReadBitsResult<bool> {
        let bit = self.read_bits::<u32>(1)?;
        Ok(bit == 1)
    }

    /// Read up to 32 bits from the stream. Corresponds to `u(n)`.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> ReadBitsResult<U> {
        if num_bits > 32 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        if num_bits == 0 {
            return U::try_from(0).map_err(|_| ReadBitsError::ConversionFailed);
        }

        let available = self.num_bits_left();
        if available < num_bits {
            return Err(ReadBitsError::NotEnoughBits {
                requested: num_bits,
                available,
            });
        }

        let mut bits_left = num_bits;
        let mut out = 0u64;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= u64::from(self.curr_byte) << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.move_to_next_byte()?;
        }

        out |= u64::from(self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left));
        out &= (1u64 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;
        self.position += num_bits as u64;

        let out = u32::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)?;
        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> ReadBitsResult<()> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 32);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        let unread_bytes = self.data.get_ref().len() - self.data.position() as usize;
        unread_bytes * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Reads an unsigned exponential golomb coding number from the next bytes
    /// in the bitstream. Corresponds to `ue(v)`.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> ReadBitsResult<U> {
        let mut num_bits = 0;

        while !self.read_bit()? {
            num_bits += 1;
            if num_bits > 31 {
                return Err(ReadBitsError::InvalidExpGolomb);
            }
        }

        let value = ((1u32 << num_bits) - 1)
            .checked_add(self.read_bits::<u32>(num_bits)?)
            .ok_or(ReadBitsError::InvalidExpGolomb)?;

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(&mut self, min: u32, max: u32) -> ReadBitsResult<U> {
        let ue = self.read_ue::<u32>()?;
        if ue > max || ue < min {
            Err(ReadBitsError::OutOfBounds {
                min: min.into(),
                max: max.into(),
                value: ue.into(),
            })
        } else {
            U::try_from(ue).map_err(|_| ReadBitsError::ConversionFailed)
        }
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> ReadBitsResult<U> {
        self.read_ue_bounded(0, max)
    }

    /// Reads a signed exponential golomb coding number. Even codes map to
    /// non-positive values and odd codes to positive ones. Corresponds to
    /// `se(v)`.
    pub fn read_se<U: TryFrom<i64>>(&mut self) -> ReadBitsResult<U> {
        let ue = i64::from(self.read_ue::<u32>()?);

        let value = if ue % 2 == 0 { -(ue / 2) } else { ue / 2 + 1 };

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_se_bounded<U: TryFrom<i64>>(&mut self, min: i32, max: i32) -> ReadBitsResult<U> {
        let se = self.read_se::<i64>()?;
        if se < i64::from(min) || se > i64::from(max) {
            Err(ReadBitsError::OutOfBounds {
                min: min.into(),
                max: max.into(),
                value: se,
            })
        } else {
            U::try_from(se).map_err(|_| ReadBitsError::ConversionFailed)
        }
    }

    /// Return the position of this bitstream in bits.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn move_to_next_byte(&mut self) -> ReadBitsResult<()> {
        let mut buf = [0u8; 1];
        self.data
            .read_exact(&mut buf)
            .map_err(|_| ReadBitsError::NotEnoughBits {
                requested: 8,
                available: 0,
            })?;

        self.num_remaining_bits_in_curr_byte = 8;
        self.curr_byte = buf[0];
        Ok(())
    }
}

/// Iterator over the length-prefixed NAL units of a complete EVC stream.
///
/// Yields each NAL unit together with its 4-byte length prefix. Iteration
/// stops at the first malformed or truncated unit.
pub struct NalIterator<'a, Nalu>(Cursor<&'a [u8]>, PhantomData<Nalu>);

impl<'a, Nalu> NalIterator<'a, Nalu> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self(Cursor::new(stream), PhantomData)
    }
}

impl<'a> Iterator for NalIterator<'a, EvcNalu<'a>> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        EvcNalu::next(&mut self.0).map(|n| n.framed()).ok()
    }
}

#[derive(Error, Debug)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit)
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let mut written = 0;
        for bit in (0..bits).rev() {
            let bit = 1u32 << bit;

            self.write_bit((value & bit) == bit)?;
            written += 1;
        }

        Ok(written)
    }

    /// Takes a single bit that will be outputed to [`std::io::Write`]
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Immediately outputs any cached bits to [`std::io::Write`]
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Returns `true` if ['Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }

    pub(crate) fn inner_mut(&mut self) -> &mut W {
        &mut self.out
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitwriter_f1() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
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
    fn test_bitwriter_f3() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(3, 0b100u8).unwrap();
            writer.write_f(3, 0b101u8).unwrap();
            writer.write_f(3, 0b011u8).unwrap();
        }
        assert_eq!(buf, vec![0b10010101u8, 0b10000000u8]);
    }

    #[test]
    fn test_bitwriter_f32() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(32, 0xdead_beefu32).unwrap();
            assert!(matches!(
                writer.write_f(33, 0u32),
                Err(BitWriterError::InvalidBitCount)
            ));
        }
        assert_eq!(buf, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn read_fixed_width_fields() {
        const DATA: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xa0];

        let mut reader = BitReader::new(&DATA);
        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 47);

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x02);
        assert_eq!(reader.num_bits_left(), 39);

        assert_eq!(reader.read_bits::<u32>(31).unwrap(), 0x23456789);
        assert_eq!(reader.num_bits_left(), 8);

        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.num_bits_left(), 7);
        assert_eq!(reader.position(), 41);
    }

    #[test]
    fn read_full_32_bits() {
        let mut reader = BitReader::new(&[0xff, 0xff, 0xff, 0xfe, 0x80]);
        assert_eq!(reader.read_bits::<u32>(32).unwrap(), 0xffff_fffe);
        assert!(reader.read_bit().unwrap());
        assert_eq!(
            reader.read_bits::<u32>(33),
            Err(ReadBitsError::TooManyBitsRequested(33))
        );
    }

    #[test]
    fn failed_read_has_no_side_effects() {
        let mut reader = BitReader::new(&[0b1010_1010, 0b0101_0101]);
        assert_eq!(reader.read_bits::<u8>(4).unwrap(), 0b1010);

        assert_eq!(
            reader.read_bits::<u32>(13),
            Err(ReadBitsError::NotEnoughBits {
                requested: 13,
                available: 12
            })
        );
        assert_eq!(reader.num_bits_left(), 12);
        assert_eq!(reader.position(), 4);
        assert_eq!(reader.read_bits::<u16>(12).unwrap(), 0b1010_0101_0101);
    }

    #[test]
    fn conversion_failure() {
        let mut reader = BitReader::new(&[0xff, 0xff]);
        assert_eq!(
            reader.read_bits::<u8>(9),
            Err(ReadBitsError::ConversionFailed)
        );
    }

    // Check that read_ue behaves properly with input at the limits.
    #[test]
    fn read_ue() {
        // Regular value.
        let mut reader = BitReader::new(&[0b0001_1010]);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 12);
        assert_eq!(reader.data.position(), 1);
        assert_eq!(reader.num_remaining_bits_in_curr_byte, 1);

        // 0 value.
        let mut reader = BitReader::new(&[0b1000_0000]);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);
        assert_eq!(reader.data.position(), 1);
        assert_eq!(reader.num_remaining_bits_in_curr_byte, 7);

        // No prefix stop bit.
        let mut reader = BitReader::new(&[0b0000_0000]);
        reader.read_ue::<u32>().unwrap_err();

        // u32 max value: 31 0-bits, 1 bit marker, 31 bits 1-bits.
        let mut reader = BitReader::new(&[
            0b0000_0000,
            0b0000_0000,
            0b0000_0000,
            0b0000_0001,
            0b1111_1111,
            0b1111_1111,
            0b1111_1111,
            0b1111_1110,
        ]);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0xffff_fffe);
        assert_eq!(reader.data.position(), 8);
        assert_eq!(reader.num_remaining_bits_in_curr_byte, 1);

        // 32 leading zeros can never be valid.
        let mut reader = BitReader::new(&[0, 0, 0, 0, 0x80]);
        assert_eq!(
            reader.read_ue::<u32>(),
            Err(ReadBitsError::InvalidExpGolomb)
        );
    }

    #[test]
    fn read_ue_bounds() {
        // ue(v) == 4
        let mut reader = BitReader::new(&[0b0010_1000]);
        assert_eq!(
            reader.read_ue_max::<u8>(3),
            Err(ReadBitsError::OutOfBounds {
                min: 0,
                max: 3,
                value: 4
            })
        );

        let mut reader = BitReader::new(&[0b0010_1000]);
        assert_eq!(reader.read_ue_bounded::<u8>(4, 4).unwrap(), 4);
    }

    #[test]
    fn read_se() {
        // 1 -> 0, 010 -> 1, 011 -> -1, 00100 -> 2, 00101 -> -2
        let mut reader = BitReader::new(&[0b1010_0110, 0b0100_0010, 0b1000_0000]);
        assert_eq!(reader.read_se::<i32>().unwrap(), 0);
        assert_eq!(reader.read_se::<i32>().unwrap(), 1);
        assert_eq!(reader.read_se::<i32>().unwrap(), -1);
        assert_eq!(reader.read_se::<i32>().unwrap(), 2);
        assert_eq!(reader.read_se::<i32>().unwrap(), -2);
    }

    #[test]
    fn read_se_out_of_range_for_target() {
        // ue == 0xffff_fffe maps to -0x7fff_ffff which fits an i32, but not an i8.
        let data = [0, 0, 0, 1, 0xff, 0xff, 0xff, 0xfe];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_se::<i32>().unwrap(), -0x7fff_ffff);

        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_se::<i8>(), Err(ReadBitsError::ConversionFailed));
    }
}
