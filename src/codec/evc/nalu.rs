// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use enumn::N;

use crate::codec::evc::Error;
use crate::codec::evc::Result;

/// Size of the big-endian length that precedes every NAL unit.
pub const NALU_LENGTH_PREFIX_SIZE: usize = 4;
/// Size of the EVC NAL unit header.
pub const NALU_HEADER_SIZE: usize = 2;

/// EVC NAL unit types, ISO/IEC 23094-1 Table 4.
#[derive(N, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NaluType {
    NoIdr = 0,
    Idr = 1,
    ReservedVcl02 = 2,
    ReservedVcl03 = 3,
    ReservedVcl04 = 4,
    ReservedVcl05 = 5,
    ReservedVcl06 = 6,
    ReservedVcl07 = 7,
    ReservedVcl08 = 8,
    ReservedVcl09 = 9,
    ReservedVcl10 = 10,
    ReservedVcl11 = 11,
    ReservedVcl12 = 12,
    ReservedVcl13 = 13,
    ReservedVcl14 = 14,
    ReservedVcl15 = 15,
    ReservedVcl16 = 16,
    ReservedVcl17 = 17,
    ReservedVcl18 = 18,
    ReservedVcl19 = 19,
    ReservedVcl20 = 20,
    ReservedVcl21 = 21,
    ReservedVcl22 = 22,
    ReservedVcl23 = 23,
    Sps = 24,
    Pps = 25,
    Aps = 26,
    Fd = 27,
    Sei = 28,
    ReservedNonVcl29 = 29,
    ReservedNonVcl30 = 30,
    ReservedNonVcl31 = 31,
    ReservedNonVcl32 = 32,
    ReservedNonVcl33 = 33,
    ReservedNonVcl34 = 34,
    ReservedNonVcl35 = 35,
    ReservedNonVcl36 = 36,
    ReservedNonVcl37 = 37,
    ReservedNonVcl38 = 38,
    ReservedNonVcl39 = 39,
    ReservedNonVcl40 = 40,
    ReservedNonVcl41 = 41,
    ReservedNonVcl42 = 42,
    ReservedNonVcl43 = 43,
    ReservedNonVcl44 = 44,
    ReservedNonVcl45 = 45,
    ReservedNonVcl46 = 46,
    ReservedNonVcl47 = 47,
    ReservedNonVcl48 = 48,
    ReservedNonVcl49 = 49,
    ReservedNonVcl50 = 50,
    ReservedNonVcl51 = 51,
    ReservedNonVcl52 = 52,
    ReservedNonVcl53 = 53,
    ReservedNonVcl54 = 54,
    ReservedNonVcl55 = 55,
    Unspecified56 = 56,
    Unspecified57 = 57,
    Unspecified58 = 58,
    Unspecified59 = 59,
    Unspecified60 = 60,
    Unspecified61 = 61,
    Unspecified62 = 62,
}

impl NaluType {
    /// Whether this NAL unit carries coded slice data.
    pub fn is_vcl(&self) -> bool {
        (*self as u8) <= NaluType::ReservedVcl23 as u8
    }

    /// Whether this NAL unit is a slice this parser knows how to handle.
    pub fn is_slice(&self) -> bool {
        matches!(self, NaluType::NoIdr | NaluType::Idr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub type_: NaluType,
    pub temporal_id: u8,
    pub reserved_zero_5bits: u8,
    pub extension_flag: bool,
}

impl NaluHeader {
    /// Parses the 2-byte header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < NALU_HEADER_SIZE {
            return Err(Error::InvalidData(format!(
                "NAL unit header needs {} bytes, got {}",
                NALU_HEADER_SIZE,
                data.len()
            )));
        }

        let header = BigEndian::read_u16(data);

        if header & 0x8000 != 0 {
            return Err(Error::InvalidData("forbidden_zero_bit is set".into()));
        }

        let type_plus1 = (header >> 9) & 0x3f;
        if type_plus1 == 0 {
            return Err(Error::InvalidData("nal_unit_type_plus1 is 0".into()));
        }

        let type_ = NaluType::n((type_plus1 - 1) as u8).ok_or_else(|| {
            Error::InvalidData(format!("invalid NAL unit type {}", type_plus1 - 1))
        })?;

        Ok(NaluHeader {
            type_,
            temporal_id: ((header >> 6) & 0x7) as u8,
            reserved_zero_5bits: ((header >> 1) & 0x1f) as u8,
            extension_flag: header & 0x1 != 0,
        })
    }

    pub fn len(&self) -> usize {
        NALU_HEADER_SIZE
    }
}

/// Reads the 4-byte big-endian length that precedes a NAL unit.
pub fn read_length_prefix(data: &[u8]) -> Result<u32> {
    if data.len() < NALU_LENGTH_PREFIX_SIZE {
        return Err(Error::InvalidData(format!(
            "NAL unit length prefix needs {} bytes, got {}",
            NALU_LENGTH_PREFIX_SIZE,
            data.len()
        )));
    }

    match BigEndian::read_u32(data) {
        0 => Err(Error::InvalidData("NAL unit length is 0".into())),
        len => Ok(len),
    }
}

/// Reads the NAL unit header at the start of `data`.
pub fn read_header(data: &[u8]) -> Result<NaluHeader> {
    NaluHeader::parse(data)
}

/// A length-prefixed NAL unit borrowed from a larger buffer.
#[derive(Debug, Clone)]
pub struct Nalu<'a> {
    pub header: NaluHeader,
    /// The buffer this NAL unit lives in. Possibly shared with the other NAL
    /// units of the stream.
    pub data: &'a [u8],
    /// Size of the NAL unit, header included, as given by its length prefix.
    pub size: usize,
    /// Offset of the NAL unit header in `data`.
    pub offset: usize,
    /// Offset of the length prefix in `data`.
    pub prefix_offset: usize,
}

impl<'a> Nalu<'a> {
    /// Reads the NAL unit at the cursor position. The cursor only advances if
    /// a complete, well-formed NAL unit was found.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> Result<Nalu<'a>> {
        let data: &'a [u8] = *cursor.get_ref();
        let prefix_offset = usize::try_from(cursor.position())
            .map_err(|_| Error::InvalidData("cursor position overflow".into()))?;
        let remaining = data.get(prefix_offset..).unwrap_or_default();

        let size = read_length_prefix(remaining)? as usize;
        let offset = prefix_offset + NALU_LENGTH_PREFIX_SIZE;
        let available = remaining.len() - NALU_LENGTH_PREFIX_SIZE;
        if size > available {
            return Err(Error::InvalidData(format!(
                "NAL unit of size {} exceeds the {} remaining bytes",
                size, available
            )));
        }

        let header = read_header(&data[offset..offset + size])?;
        cursor.set_position((offset + size) as u64);

        Ok(Nalu {
            header,
            data,
            size,
            offset,
            prefix_offset,
        })
    }

    /// Parses a buffer holding exactly one length-prefixed NAL unit.
    pub fn from_framed(data: &'a [u8]) -> Result<Nalu<'a>> {
        let mut cursor = Cursor::new(data);
        let nalu = Nalu::next(&mut cursor)?;
        if nalu.framed().len() != data.len() {
            return Err(Error::InvalidData(format!(
                "{} trailing bytes after NAL unit",
                data.len() - nalu.framed().len()
            )));
        }

        Ok(nalu)
    }

    /// The NAL unit including its length prefix.
    pub fn framed(&self) -> &'a [u8] {
        &self.data[self.prefix_offset..self.offset + self.size]
    }

    /// The NAL unit payload following the header.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.offset + self.header.len()..self.offset + self.size]
    }
}

impl AsRef<[u8]> for Nalu<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }
}
