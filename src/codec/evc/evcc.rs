// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The EVC decoder configuration record (`evcC` box payload), ISO/IEC
//! 14496-15 12.3.3.

use std::io::Cursor;
use std::io::Read;
use std::io::Write;

use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use thiserror::Error;

use crate::codec::evc::nalu::Nalu;
use crate::codec::evc::nalu::NaluType;
use crate::codec::evc::nalu::NALU_LENGTH_PREFIX_SIZE;
use crate::codec::evc::nalu_writer::write_length_prefixed;
use crate::codec::evc::nalu_writer::NaluWriterError;
use crate::codec::evc::parser::Parser;
use crate::codec::evc::parser::MAX_SPS_COUNT;

/// Minimal size of data [`write_evcc`] accepts.
const MIN_RECORD_SIZE: usize = 8;

#[derive(Error, Debug)]
pub enum EvcCError {
    #[error("invalid configuration record: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Parse(#[from] crate::codec::evc::Error),
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type EvcCResult<T> = std::result::Result<T, EvcCError>;

/// NAL units of a single type carried in the record, without their length
/// prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NalUnitArray {
    /// Whether all NAL units of this type are in the array rather than in
    /// the stream.
    pub array_completeness: bool,
    pub nal_unit_type: NaluType,
    pub nal_units: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvcDecoderConfigurationRecord {
    pub configuration_version: u8,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub toolset_idc_h: u32,
    pub toolset_idc_l: u32,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub pic_width_in_luma_samples: u16,
    pub pic_height_in_luma_samples: u16,
    /// Size of the NAL unit length prefix in samples, minus one.
    pub length_size_minus_one: u8,
    pub arrays: Vec<NalUnitArray>,
}

impl Default for EvcDecoderConfigurationRecord {
    fn default() -> Self {
        Self {
            configuration_version: 1,
            profile_idc: 0,
            level_idc: 0,
            toolset_idc_h: 0,
            toolset_idc_l: 0,
            chroma_format_idc: 0,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            pic_width_in_luma_samples: 0,
            pic_height_in_luma_samples: 0,
            length_size_minus_one: (NALU_LENGTH_PREFIX_SIZE - 1) as u8,
            arrays: Vec::new(),
        }
    }
}

/// Whether `data` already is a configuration record rather than a
/// length-prefixed stream.
pub fn is_evcc(data: &[u8]) -> bool {
    data.len() >= MIN_RECORD_SIZE && data[0] == 1
}

/// Writes the configuration record describing `data` to `out`. `data` is
/// either a length-prefixed stream starting with the parameter sets, or an
/// already formed record which is copied as is.
pub fn write_evcc<W: Write>(
    out: &mut W,
    data: &[u8],
    ps_array_completeness: bool,
) -> EvcCResult<()> {
    if data.len() < MIN_RECORD_SIZE {
        return Err(EvcCError::InvalidData(format!(
            "{} bytes are not enough to build a record",
            data.len()
        )));
    }

    if is_evcc(data) {
        out.write_all(data)?;
        return Ok(());
    }

    EvcDecoderConfigurationRecord::from_stream(data, ps_array_completeness)?.write(out)
}

fn field<T: TryFrom<u32>>(name: &str, value: u32) -> EvcCResult<T> {
    T::try_from(value)
        .map_err(|_| EvcCError::InvalidData(format!("{} {} does not fit the record", name, value)))
}

impl EvcDecoderConfigurationRecord {
    /// Builds a record from the parameter sets found in `data`, a
    /// length-prefixed stream. The coding parameters come from the first SPS.
    ///
    /// Scanning stops at the first malformed NAL unit.
    pub fn from_stream(data: &[u8], ps_array_completeness: bool) -> EvcCResult<Self> {
        let mut record = Self::default();
        let mut parser = Parser::default();
        let mut got_sps = false;

        let mut cursor = Cursor::new(data);
        while let Ok(nalu) = Nalu::next(&mut cursor) {
            let nal_type = nalu.header.type_;
            if !matches!(
                nal_type,
                NaluType::Sps | NaluType::Pps | NaluType::Aps | NaluType::Sei
            ) {
                continue;
            }

            if nal_type == NaluType::Sps && !got_sps {
                let sps = parser.parse_sps(&nalu)?;

                record.profile_idc = sps.profile_idc;
                record.level_idc = sps.level_idc;
                record.toolset_idc_h = sps.toolset_idc_h;
                record.toolset_idc_l = sps.toolset_idc_l;
                record.chroma_format_idc = sps.chroma_format_idc;
                record.bit_depth_luma_minus8 = sps.bit_depth_luma_minus8;
                record.bit_depth_chroma_minus8 = sps.bit_depth_chroma_minus8;
                record.pic_width_in_luma_samples =
                    field("pic_width_in_luma_samples", sps.pic_width_in_luma_samples)?;
                record.pic_height_in_luma_samples =
                    field("pic_height_in_luma_samples", sps.pic_height_in_luma_samples)?;
                got_sps = true;
            }

            let completeness =
                ps_array_completeness && matches!(nal_type, NaluType::Sps | NaluType::Pps);
            record.add_nal_unit(nal_type, nalu.as_ref(), completeness)?;
        }

        record.check_sps_count()?;
        Ok(record)
    }

    fn add_nal_unit(
        &mut self,
        nal_unit_type: NaluType,
        nal_unit: &[u8],
        array_completeness: bool,
    ) -> EvcCResult<()> {
        field::<u16>("nalUnitLength", nal_unit.len() as u32)?;

        match self
            .arrays
            .iter_mut()
            .find(|a| a.nal_unit_type == nal_unit_type)
        {
            Some(array) => array.nal_units.push(nal_unit.to_vec()),
            None => self.arrays.push(NalUnitArray {
                array_completeness,
                nal_unit_type,
                nal_units: vec![nal_unit.to_vec()],
            }),
        }

        Ok(())
    }

    fn check_sps_count(&self) -> EvcCResult<()> {
        let sps_count: usize = self
            .arrays
            .iter()
            .filter(|a| a.nal_unit_type == NaluType::Sps)
            .map(|a| a.nal_units.len())
            .sum();

        if sps_count == 0 || sps_count > MAX_SPS_COUNT {
            return Err(EvcCError::InvalidData(format!(
                "record needs 1 to {} SPS, got {}",
                MAX_SPS_COUNT, sps_count
            )));
        }

        Ok(())
    }

    /// Serializes the record.
    pub fn write<W: Write>(&self, out: &mut W) -> EvcCResult<()> {
        self.check_sps_count()?;

        if self.chroma_format_idc > 3
            || self.bit_depth_luma_minus8 > 7
            || self.bit_depth_chroma_minus8 > 7
            || self.length_size_minus_one > 3
        {
            return Err(EvcCError::InvalidData(
                "field does not fit its bit width".into(),
            ));
        }

        let num_of_arrays: u8 = field("numOfArrays", self.arrays.len() as u32)?;

        out.write_u8(self.configuration_version)?;
        out.write_u8(self.profile_idc)?;
        out.write_u8(self.level_idc)?;
        out.write_u32::<BigEndian>(self.toolset_idc_h)?;
        out.write_u32::<BigEndian>(self.toolset_idc_l)?;
        out.write_u8(
            self.chroma_format_idc << 6
                | self.bit_depth_luma_minus8 << 3
                | self.bit_depth_chroma_minus8,
        )?;
        out.write_u16::<BigEndian>(self.pic_width_in_luma_samples)?;
        out.write_u16::<BigEndian>(self.pic_height_in_luma_samples)?;
        // bit(6) reserved = '111111'b
        out.write_u8(0xfc | self.length_size_minus_one)?;
        out.write_u8(num_of_arrays)?;

        for array in &self.arrays {
            out.write_u8(
                (u8::from(array.array_completeness) << 7) | (array.nal_unit_type as u8 & 0x3f),
            )?;
            out.write_u16::<BigEndian>(field("numNalus", array.nal_units.len() as u32)?)?;

            for nal_unit in &array.nal_units {
                out.write_u16::<BigEndian>(field("nalUnitLength", nal_unit.len() as u32)?)?;
                out.write_all(nal_unit)?;
            }
        }

        Ok(())
    }

    /// Reads a serialized record.
    pub fn parse(data: &[u8]) -> EvcCResult<Self> {
        let mut r = Cursor::new(data);

        let configuration_version = r.read_u8()?;
        if configuration_version != 1 {
            return Err(EvcCError::InvalidData(format!(
                "unknown configurationVersion {}",
                configuration_version
            )));
        }

        let profile_idc = r.read_u8()?;
        let level_idc = r.read_u8()?;
        let toolset_idc_h = r.read_u32::<BigEndian>()?;
        let toolset_idc_l = r.read_u32::<BigEndian>()?;
        let formats = r.read_u8()?;
        let pic_width_in_luma_samples = r.read_u16::<BigEndian>()?;
        let pic_height_in_luma_samples = r.read_u16::<BigEndian>()?;
        let length_size_minus_one = r.read_u8()? & 0x3;
        let num_of_arrays = r.read_u8()?;

        let mut arrays = Vec::with_capacity(usize::from(num_of_arrays));
        for _ in 0..num_of_arrays {
            let byte = r.read_u8()?;
            let nal_unit_type = NaluType::n(byte & 0x3f).ok_or_else(|| {
                EvcCError::InvalidData(format!("invalid NAL unit type {}", byte & 0x3f))
            })?;

            let num_nalus = r.read_u16::<BigEndian>()?;
            let mut nal_units = Vec::with_capacity(usize::from(num_nalus));
            for _ in 0..num_nalus {
                let len = r.read_u16::<BigEndian>()?;
                let mut nal_unit = vec![0; usize::from(len)];
                r.read_exact(&mut nal_unit)?;
                nal_units.push(nal_unit);
            }

            arrays.push(NalUnitArray {
                array_completeness: byte & 0x80 != 0,
                nal_unit_type,
                nal_units,
            });
        }

        Ok(Self {
            configuration_version,
            profile_idc,
            level_idc,
            toolset_idc_h,
            toolset_idc_l,
            chroma_format_idc: formats >> 6,
            bit_depth_luma_minus8: (formats >> 3) & 0x7,
            bit_depth_chroma_minus8: formats & 0x7,
            pic_width_in_luma_samples,
            pic_height_in_luma_samples,
            length_size_minus_one,
            arrays,
        })
    }

    /// Writes the NAL units of the record as a length-prefixed stream, so
    /// that they can be fed to the stream parser ahead of the samples.
    pub fn write_nal_units<W: Write>(&self, out: &mut W) -> EvcCResult<()> {
        for array in &self.arrays {
            for nal_unit in &array.nal_units {
                write_length_prefixed(out, nal_unit)?;
            }
        }

        Ok(())
    }
}
