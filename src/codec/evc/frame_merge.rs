// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reassembly of length-prefixed NAL units into access units.

use bytes::Bytes;

use crate::codec::evc::nalu::Nalu;
use crate::codec::evc::nalu::NaluType;
use crate::codec::evc::parser::Parser;
use crate::codec::evc::parser::Profile;
use crate::codec::evc::parser::Sps;
use crate::codec::evc::poc::PocState;
use crate::codec::evc::Error;
use crate::codec::evc::Result;

/// Initial capacity of the access unit buffer, in bytes.
pub const INIT_AU_BUF_CAPACITY: usize = 1024;

/// Accumulates the framed NAL units of the access unit being assembled. The
/// capacity doubles whenever an append would not fit, and is kept across
/// access units.
#[derive(Debug)]
pub struct AccessUnitBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl AccessUnitBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let needed = self
            .data
            .len()
            .checked_add(bytes.len())
            .ok_or_else(|| Error::InvalidData("access unit too large".into()))?;

        if needed > self.capacity {
            let mut capacity = self.capacity;
            while capacity < needed {
                capacity = capacity
                    .checked_mul(2)
                    .ok_or_else(|| Error::InvalidData("access unit too large".into()))?;
            }

            log::debug!(
                "Growing access unit buffer from {} to {} bytes",
                self.capacity,
                capacity
            );
            self.data.reserve(capacity - self.data.len());
            self.capacity = capacity;
        }

        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Drops the contents, keeping the capacity.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Whether a NAL unit of type `nal_type`, whose picture order count has just
/// been derived into `poc`, terminates the access unit it belongs to.
pub fn end_of_access_unit(profile: Profile, nal_type: NaluType, poc: &PocState) -> bool {
    match (profile, nal_type) {
        (_, NaluType::Idr) => true,
        (Profile::Baseline, NaluType::NoIdr) => true,
        // A new picture has started.
        (Profile::Main, NaluType::NoIdr) => poc.pic_order_cnt_val != poc.prev_pic_order_cnt_val,
        _ => false,
    }
}

/// A complete access unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessUnit {
    /// The length-prefixed NAL units of the access unit.
    pub data: Bytes,
    /// The picture order count of the last slice of the access unit, if it
    /// contains any.
    pub poc: Option<i32>,
    /// Whether the access unit contains an IDR slice.
    pub key_frame: bool,
    /// The types of the NAL units in `data`, in order.
    pub nal_types: Vec<NaluType>,
}

/// Parses complete NAL units one at a time and groups them into access
/// units.
#[derive(Debug)]
pub struct FrameMerger {
    parser: Parser,
    poc: PocState,
    profile: Profile,
    last_sps_id: Option<u8>,
    buffer: AccessUnitBuffer,
    nal_types: Vec<NaluType>,
    key_frame: bool,
    au_poc: Option<i32>,
}

impl Default for FrameMerger {
    fn default() -> Self {
        Self::new(INIT_AU_BUF_CAPACITY)
    }
}

impl FrameMerger {
    pub fn new(initial_au_capacity: usize) -> Self {
        Self {
            parser: Default::default(),
            poc: Default::default(),
            profile: Default::default(),
            last_sps_id: None,
            buffer: AccessUnitBuffer::with_capacity(initial_au_capacity),
            nal_types: Default::default(),
            key_frame: false,
            au_poc: None,
        }
    }

    /// Parses `framed`, a single NAL unit with its length prefix, and adds it
    /// to the access unit being assembled.
    ///
    /// Returns the access unit if this NAL unit completes it. A NAL unit that
    /// fails to parse is not added and leaves the picture order count state
    /// untouched.
    pub fn push_nalu(&mut self, framed: &[u8]) -> Result<Option<AccessUnit>> {
        let nalu = Nalu::from_framed(framed)?;
        let nal_type = nalu.header.type_;

        let mut slice_poc = None;
        match nal_type {
            NaluType::Sps => {
                let sps = self.parser.parse_sps(&nalu)?;
                self.profile = sps.profile();
                self.last_sps_id = Some(sps.sps_seq_parameter_set_id);
            }
            NaluType::Pps => {
                self.parser.parse_pps(&nalu)?;
            }
            NaluType::Idr | NaluType::NoIdr => {
                let pps_id = self
                    .parser
                    .parse_slice_header(&nalu)?
                    .slice_pic_parameter_set_id;

                let hdr = self.parser.get_slice_header(pps_id);
                let sps = self
                    .parser
                    .get_pps(pps_id)
                    .and_then(|pps| self.parser.get_sps(pps.pps_seq_parameter_set_id));

                let (Some(hdr), Some(sps)) = (hdr, sps) else {
                    return Err(Error::InvalidData(format!(
                        "parameter sets for PPS {} are gone",
                        pps_id
                    )));
                };

                slice_poc = Some(
                    self.poc
                        .derive(nal_type, nalu.header.temporal_id, sps, hdr)?,
                );
            }
            _ => (),
        }

        self.buffer.append(nalu.framed())?;
        self.nal_types.push(nal_type);
        if matches!(nal_type, NaluType::Idr) {
            self.key_frame = true;
        }
        if slice_poc.is_some() {
            self.au_poc = slice_poc;
        }

        if end_of_access_unit(self.profile, nal_type, &self.poc) {
            Ok(self.take_pending())
        } else {
            Ok(None)
        }
    }

    /// Returns the access unit being assembled, if any NAL unit has been
    /// added to it, and starts a new one.
    pub fn take_pending(&mut self) -> Option<AccessUnit> {
        if self.buffer.is_empty() {
            return None;
        }

        let au = AccessUnit {
            data: Bytes::copy_from_slice(self.buffer.as_slice()),
            poc: self.au_poc.take(),
            key_frame: std::mem::take(&mut self.key_frame),
            nal_types: std::mem::take(&mut self.nal_types),
        };
        self.buffer.clear();

        log::debug!(
            "Access unit of {} bytes, {} NAL units, POC {:?}, key frame {}",
            au.data.len(),
            au.nal_types.len(),
            au.poc,
            au.key_frame
        );

        Some(au)
    }

    /// The parameter sets and slice headers seen so far.
    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    pub fn poc_state(&self) -> &PocState {
        &self.poc
    }

    /// The profile of the most recent SPS. Baseline until an SPS is seen.
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// The most recently parsed SPS.
    pub fn last_sps(&self) -> Option<&Sps> {
        self.last_sps_id.and_then(|id| self.parser.get_sps(id))
    }

    pub fn buffer(&self) -> &AccessUnitBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::evc::parser::Pps;
    use crate::codec::evc::parser::SliceHeader;
    use crate::codec::evc::parser::SliceType;
    use crate::codec::evc::synthesizer::Synthesizer;

    struct Stream {
        sps: Sps,
        pps: Pps,
    }

    impl Stream {
        fn new(profile_idc: u8, sps_pocs_flag: bool) -> Self {
            Self {
                sps: Sps {
                    profile_idc,
                    chroma_format_idc: 1,
                    pic_width_in_luma_samples: 176,
                    pic_height_in_luma_samples: 144,
                    sps_pocs_flag,
                    sps_rpl_flag: sps_pocs_flag,
                    log2_max_pic_order_cnt_lsb_minus4: if sps_pocs_flag { 4 } else { 0 },
                    log2_sub_gop_length: if sps_pocs_flag { 0 } else { 2 },
                    ..Default::default()
                },
                pps: Pps {
                    single_tile_in_pic_flag: true,
                    ..Default::default()
                },
            }
        }

        fn sps(&self) -> Vec<u8> {
            let mut buf = Vec::new();
            Synthesizer::<'_, Sps, _>::synthesize(0, &self.sps, &mut buf).unwrap();
            buf
        }

        fn pps(&self) -> Vec<u8> {
            let mut buf = Vec::new();
            Synthesizer::<'_, Pps, _>::synthesize(0, &self.pps, &mut buf).unwrap();
            buf
        }

        fn slice(&self, nal_type: NaluType, temporal_id: u8, poc_lsb: u32) -> Vec<u8> {
            let hdr = SliceHeader {
                single_tile_in_slice_flag: true,
                slice_type: if nal_type == NaluType::Idr {
                    SliceType::I
                } else {
                    SliceType::B
                },
                slice_pic_order_cnt_lsb: poc_lsb,
                ..Default::default()
            };

            let mut buf = Vec::new();
            Synthesizer::<'_, SliceHeader, _>::synthesize(
                nal_type,
                temporal_id,
                &hdr,
                &self.pps,
                &self.sps,
                &mut buf,
            )
            .unwrap();
            buf
        }
    }

    #[test]
    fn buffer_doubles_and_keeps_capacity() {
        let mut buffer = AccessUnitBuffer::with_capacity(4);
        buffer.append(&[1, 2, 3]).unwrap();
        assert_eq!(buffer.capacity(), 4);

        buffer.append(&[4, 5, 6, 7, 8, 9, 10, 11, 12, 13]).unwrap();
        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13]);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 16);

        assert_eq!(AccessUnitBuffer::with_capacity(0).capacity(), 1);
    }

    #[test]
    fn end_of_access_unit_rules() {
        let new_picture = PocState {
            pic_order_cnt_val: 2,
            prev_pic_order_cnt_val: 1,
            doc_offset: 0,
        };
        let same_picture = PocState {
            pic_order_cnt_val: 2,
            prev_pic_order_cnt_val: 2,
            doc_offset: 0,
        };

        assert!(end_of_access_unit(Profile::Baseline, NaluType::Idr, &same_picture));
        assert!(end_of_access_unit(Profile::Baseline, NaluType::NoIdr, &same_picture));
        assert!(end_of_access_unit(Profile::Main, NaluType::Idr, &same_picture));
        assert!(end_of_access_unit(Profile::Main, NaluType::NoIdr, &new_picture));
        assert!(!end_of_access_unit(Profile::Main, NaluType::NoIdr, &same_picture));

        for nal_type in [NaluType::Sps, NaluType::Pps, NaluType::Aps, NaluType::Sei, NaluType::Fd] {
            assert!(!end_of_access_unit(Profile::Baseline, nal_type, &new_picture));
            assert!(!end_of_access_unit(Profile::Main, nal_type, &new_picture));
        }
    }

    #[test]
    fn baseline_every_slice_ends_access_unit() {
        let stream = Stream::new(0, false);
        let mut merger = FrameMerger::default();

        let sps = stream.sps();
        let pps = stream.pps();
        let idr = stream.slice(NaluType::Idr, 0, 0);
        let noidr = stream.slice(NaluType::NoIdr, 0, 0);

        assert_eq!(merger.push_nalu(&sps).unwrap(), None);
        assert_eq!(merger.push_nalu(&pps).unwrap(), None);
        assert_eq!(merger.profile(), Profile::Baseline);
        assert_eq!(merger.last_sps(), Some(&stream.sps));

        let au = merger.push_nalu(&idr).unwrap().unwrap();
        assert_eq!(au.data, [sps.clone(), pps.clone(), idr.clone()].concat());
        assert_eq!(au.nal_types, vec![NaluType::Sps, NaluType::Pps, NaluType::Idr]);
        assert_eq!(au.poc, Some(0));
        assert!(au.key_frame);

        let au = merger.push_nalu(&noidr).unwrap().unwrap();
        assert_eq!(au.data, noidr);
        assert_eq!(au.poc, Some(4));
        assert!(!au.key_frame);

        assert_eq!(merger.take_pending(), None);
    }

    #[test]
    fn main_groups_slices_by_poc() {
        let stream = Stream::new(1, true);
        let mut merger = FrameMerger::default();

        merger.push_nalu(&stream.sps()).unwrap();
        merger.push_nalu(&stream.pps()).unwrap();
        assert_eq!(merger.profile(), Profile::Main);

        let au = merger
            .push_nalu(&stream.slice(NaluType::Idr, 0, 0))
            .unwrap()
            .unwrap();
        assert_eq!(au.poc, Some(0));

        // The first slice of POC 1 starts a new picture and closes the access
        // unit it is appended to.
        let first = stream.slice(NaluType::NoIdr, 0, 1);
        let au = merger.push_nalu(&first).unwrap().unwrap();
        assert_eq!(au.data, first);
        assert_eq!(au.poc, Some(1));

        // A second slice of the same picture does not.
        let second = stream.slice(NaluType::NoIdr, 0, 1);
        assert_eq!(merger.push_nalu(&second).unwrap(), None);

        let sei = [0x00, 0x00, 0x00, 0x03, 0x3a, 0x00, 0x80];
        assert_eq!(merger.push_nalu(&sei).unwrap(), None);

        let third = stream.slice(NaluType::NoIdr, 0, 2);
        let au = merger.push_nalu(&third).unwrap().unwrap();
        assert_eq!(au.data, [&second[..], &sei[..], &third[..]].concat());
        assert_eq!(au.nal_types, vec![NaluType::NoIdr, NaluType::Sei, NaluType::NoIdr]);
        assert_eq!(au.poc, Some(2));
    }

    #[test]
    fn failing_nalu_is_not_appended() {
        let stream = Stream::new(0, false);
        let mut merger = FrameMerger::default();

        // A slice before any parameter set.
        let idr = stream.slice(NaluType::Idr, 0, 0);
        assert!(matches!(merger.push_nalu(&idr), Err(Error::InvalidData(_))));
        assert!(merger.buffer().is_empty());

        merger.push_nalu(&stream.sps()).unwrap();
        merger.push_nalu(&stream.pps()).unwrap();
        merger.push_nalu(&idr).unwrap().unwrap();

        // Temporal id 3 cannot appear in a sub-GOP of 4.
        let state = merger.poc_state().clone();
        let bad = stream.slice(NaluType::NoIdr, 3, 0);
        assert!(merger.push_nalu(&bad).is_err());
        assert_eq!(merger.poc_state(), &state);
        assert!(merger.buffer().is_empty());

        // Garbage framing.
        assert!(merger.push_nalu(&[0x00, 0x00, 0x00, 0x05, 0x32]).is_err());
        assert!(merger.buffer().is_empty());
    }

    #[test]
    fn pending_access_unit() {
        let stream = Stream::new(0, false);
        let mut merger = FrameMerger::default();

        let sps = stream.sps();
        merger.push_nalu(&sps).unwrap();

        let au = merger.take_pending().unwrap();
        assert_eq!(au.data, sps);
        assert_eq!(au.poc, None);
        assert!(!au.key_frame);
        assert_eq!(merger.take_pending(), None);
    }
}
