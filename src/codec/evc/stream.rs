// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Access unit extraction from an EVC elementary stream delivered in chunks.

use std::collections::VecDeque;

use bytes::Buf;
use bytes::BytesMut;

use crate::bitstream_utils::NalIterator;
use crate::codec::evc::frame_merge::AccessUnit;
use crate::codec::evc::frame_merge::FrameMerger;
use crate::codec::evc::frame_merge::INIT_AU_BUF_CAPACITY;
use crate::codec::evc::nalu::read_header;
use crate::codec::evc::nalu::read_length_prefix;
use crate::codec::evc::nalu::Nalu;
use crate::codec::evc::nalu::NaluType;
use crate::codec::evc::nalu::NALU_LENGTH_PREFIX_SIZE;
use crate::codec::evc::parser::Profile;
use crate::codec::evc::parser::Sps;
use crate::codec::evc::Error;
use crate::codec::evc::Result;
use crate::Resolution;

/// Score returned by [`probe`] for data that looks like an EVC stream.
pub const PROBE_SCORE: u32 = 51;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamParserConfig {
    /// Initial capacity of the access unit buffer, in bytes.
    pub initial_au_capacity: usize,
    /// NAL units announcing a larger size are rejected instead of being
    /// buffered.
    pub max_nalu_size: usize,
}

impl Default for StreamParserConfig {
    fn default() -> Self {
        Self {
            initial_au_capacity: INIT_AU_BUF_CAPACITY,
            max_nalu_size: 64 << 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedStatus {
    /// No access unit was completed and a NAL unit is partially buffered.
    NeedMoreData,
    /// The access units completed so far. May be empty if the input ended
    /// exactly on a NAL unit boundary.
    AccessUnits(Vec<AccessUnit>),
}

/// Stream configuration, as signalled by the most recent SPS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub sps_id: u8,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub resolution: Resolution,
    pub chroma_format_idc: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    /// Length of the hierarchical sub-GOP.
    pub gop_size: u32,
    /// Frame rate as a `(numerator, denominator)` pair, from the VUI timing
    /// information.
    pub framerate: Option<(u32, u32)>,
    /// Whether pictures may be output in a different order than decoded.
    pub has_b_frames: bool,
}

impl From<&Sps> for StreamInfo {
    fn from(sps: &Sps) -> Self {
        let vui = &sps.vui_parameters;
        let framerate = (sps.vui_parameters_present_flag
            && vui.timing_info_present_flag
            && vui.num_units_in_tick != 0)
            .then_some((vui.time_scale, vui.num_units_in_tick));

        let has_b_frames = if sps.vui_parameters_present_flag && vui.bitstream_restriction_flag {
            vui.num_reorder_pics > 0
        } else {
            // Implicit reference structures are hierarchical, so any sub-GOP
            // longer than one picture is reordered.
            !sps.sps_rpl_flag && sps.log2_sub_gop_length > 0
        };

        Self {
            sps_id: sps.sps_seq_parameter_set_id,
            profile_idc: sps.profile_idc,
            level_idc: sps.level_idc,
            resolution: sps.resolution(),
            chroma_format_idc: sps.chroma_format_idc,
            bit_depth_luma: sps.bit_depth_luma(),
            bit_depth_chroma: sps.bit_depth_chroma(),
            gop_size: sps.sub_gop_length(),
            framerate,
            has_b_frames,
        }
    }
}

impl StreamInfo {
    /// Checks that the stream can be consumed by the decoding engines, which
    /// support the Baseline and Main profiles in 4:2:0 only.
    pub fn check_supported(&self) -> Result<()> {
        if Profile::n(self.profile_idc).is_none() {
            log::warn!("Unsupported EVC profile_idc {}", self.profile_idc);
            return Err(Error::Unsupported(format!(
                "profile_idc {}",
                self.profile_idc
            )));
        }

        if self.chroma_format_idc != 1 {
            log::warn!(
                "Unsupported EVC chroma_format_idc {}",
                self.chroma_format_idc
            );
            return Err(Error::Unsupported(format!(
                "chroma_format_idc {}",
                self.chroma_format_idc
            )));
        }

        Ok(())
    }
}

/// Splits a chunked EVC elementary stream into access units.
///
/// Input is a sequence of NAL units, each preceded by its 4-byte big-endian
/// length. Chunks may split NAL units and length prefixes anywhere.
#[derive(Debug)]
pub struct EvcStreamParser {
    config: StreamParserConfig,
    merger: FrameMerger,
    /// Bytes of the NAL unit (or length prefix) in flight.
    pending: BytesMut,
    /// Bytes still owed to complete the NAL unit in flight. 0 iff the input
    /// so far ended on a NAL unit boundary.
    to_read: usize,
    stream_info: Option<StreamInfo>,
    ready: VecDeque<AccessUnit>,
}

impl Default for EvcStreamParser {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl EvcStreamParser {
    pub fn new(config: StreamParserConfig) -> Self {
        Self {
            merger: FrameMerger::new(config.initial_au_capacity),
            config,
            pending: BytesMut::new(),
            to_read: 0,
            stream_info: None,
            ready: VecDeque::new(),
        }
    }

    /// Drops the bytes of a bad length prefix so that the next call starts
    /// right after it.
    fn skip_length_prefix(&mut self) {
        self.pending.advance(NALU_LENGTH_PREFIX_SIZE);
        self.to_read = 0;
    }

    fn process_nalu(&mut self, framed: &[u8]) -> Result<()> {
        let nal_type = read_header(&framed[NALU_LENGTH_PREFIX_SIZE..])?.type_;

        if let Some(au) = self.merger.push_nalu(framed)? {
            self.ready.push_back(au);
        }

        if nal_type == NaluType::Sps {
            self.stream_info = self.merger.last_sps().map(StreamInfo::from);
            log::debug!("Stream configuration: {:?}", self.stream_info);
        }

        Ok(())
    }

    /// Adds `chunk` to the stream and returns the access units it completes.
    ///
    /// On error the offending NAL unit (or length prefix) is dropped. The
    /// rest of the input stays buffered and the access units completed
    /// before the error are returned by the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<FeedStatus> {
        self.pending.extend_from_slice(chunk);

        loop {
            if self.pending.len() < NALU_LENGTH_PREFIX_SIZE {
                self.to_read = if self.pending.is_empty() {
                    0
                } else {
                    NALU_LENGTH_PREFIX_SIZE - self.pending.len()
                };
                break;
            }

            let size = match read_length_prefix(&self.pending) {
                Ok(size) => size as usize,
                Err(e) => {
                    self.skip_length_prefix();
                    return Err(e);
                }
            };

            if size > self.config.max_nalu_size {
                self.skip_length_prefix();
                return Err(Error::InvalidData(format!(
                    "NAL unit of {} bytes exceeds the {} bytes limit",
                    size, self.config.max_nalu_size
                )));
            }

            let total = NALU_LENGTH_PREFIX_SIZE + size;
            if self.pending.len() < total {
                self.to_read = total - self.pending.len();
                break;
            }

            let framed = self.pending.split_to(total);
            self.to_read = 0;
            self.process_nalu(&framed)?;
        }

        if self.ready.is_empty() && self.to_read > 0 {
            Ok(FeedStatus::NeedMoreData)
        } else {
            Ok(FeedStatus::AccessUnits(self.ready.drain(..).collect()))
        }
    }

    /// Signals the end of the stream. Returns the access units not handed
    /// out yet, including the last, unterminated one.
    ///
    /// Bytes of a truncated NAL unit are discarded.
    pub fn flush(&mut self) -> Vec<AccessUnit> {
        if !self.pending.is_empty() {
            log::warn!(
                "Discarding {} bytes of a truncated NAL unit ({} missing)",
                self.pending.len(),
                self.to_read
            );
            self.pending.clear();
            self.to_read = 0;
        }

        let mut aus: Vec<_> = self.ready.drain(..).collect();
        aus.extend(self.merger.take_pending());
        aus
    }

    /// Drops all state, including parameter sets, as if the parser was
    /// freshly created.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    /// Bytes still owed to complete the NAL unit in flight.
    pub fn to_read(&self) -> usize {
        self.to_read
    }

    /// Configuration of the stream, from the most recent SPS.
    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    pub fn frame_merger(&self) -> &FrameMerger {
        &self.merger
    }
}

/// Returns [`PROBE_SCORE`] if `data` starts like an EVC elementary stream,
/// i.e. it has SPS and PPS NAL units followed by an IDR or more than three
/// non-IDR slices, 0 otherwise.
pub fn probe(data: &[u8]) -> u32 {
    let mut sps = 0;
    let mut pps = 0;
    let mut idr = 0;
    let mut noidr = 0;

    for framed in NalIterator::<Nalu>::new(data) {
        let Ok(header) = read_header(&framed[NALU_LENGTH_PREFIX_SIZE..]) else {
            break;
        };

        match header.type_ {
            NaluType::Sps => sps += 1,
            NaluType::Pps => pps += 1,
            NaluType::Idr => idr += 1,
            NaluType::NoIdr => noidr += 1,
            _ => (),
        }
    }

    log::debug!("Probed sps:{} pps:{} idr:{} noidr:{}", sps, pps, idr, noidr);

    if sps > 0 && pps > 0 && (idr > 0 || noidr > 3) {
        PROBE_SCORE
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::evc::parser::Pps;
    use crate::codec::evc::parser::SliceHeader;
    use crate::codec::evc::parser::SliceType;
    use crate::codec::evc::parser::VuiParams;
    use crate::codec::evc::synthesizer::Synthesizer;

    fn sps() -> Sps {
        Sps {
            profile_idc: 1,
            level_idc: 51,
            chroma_format_idc: 1,
            pic_width_in_luma_samples: 1280,
            pic_height_in_luma_samples: 720,
            log2_sub_gop_length: 3,
            vui_parameters_present_flag: true,
            vui_parameters: VuiParams {
                timing_info_present_flag: true,
                num_units_in_tick: 1,
                time_scale: 30,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pps() -> Pps {
        Pps {
            single_tile_in_pic_flag: true,
            ..Default::default()
        }
    }

    fn stream(sps: &Sps, slices: &[NaluType]) -> Vec<u8> {
        let pps = pps();
        let mut buf = Vec::new();
        Synthesizer::<'_, Sps, _>::synthesize(0, sps, &mut buf).unwrap();
        Synthesizer::<'_, Pps, _>::synthesize(0, &pps, &mut buf).unwrap();

        for nal_type in slices {
            let hdr = SliceHeader {
                single_tile_in_slice_flag: true,
                slice_type: SliceType::I,
                ..Default::default()
            };
            Synthesizer::<'_, SliceHeader, _>::synthesize(*nal_type, 0, &hdr, &pps, sps, &mut buf)
                .unwrap();
        }

        buf
    }

    fn access_units(status: FeedStatus) -> Vec<AccessUnit> {
        match status {
            FeedStatus::AccessUnits(aus) => aus,
            FeedStatus::NeedMoreData => panic!("expected access units"),
        }
    }

    #[test]
    fn stream_info_from_sps() {
        let data = stream(&sps(), &[]);
        let mut parser = EvcStreamParser::default();
        assert!(parser.stream_info().is_none());

        assert_eq!(access_units(parser.feed(&data).unwrap()), vec![]);

        let info = parser.stream_info().unwrap();
        assert_eq!(info.profile_idc, 1);
        assert_eq!(info.level_idc, 51);
        assert_eq!(
            info.resolution,
            Resolution {
                width: 1280,
                height: 720
            }
        );
        assert_eq!(info.bit_depth_luma, 8);
        assert_eq!(info.gop_size, 8);
        assert_eq!(info.framerate, Some((30, 1)));
        assert!(info.has_b_frames);
        assert!(info.check_supported().is_ok());
    }

    #[test]
    fn unsupported_configurations() {
        let info = StreamInfo::from(&Sps {
            profile_idc: 2,
            chroma_format_idc: 1,
            ..Default::default()
        });
        assert!(matches!(info.check_supported(), Err(Error::Unsupported(_))));

        for chroma_format_idc in [0, 2, 3] {
            let info = StreamInfo::from(&Sps {
                chroma_format_idc,
                ..Default::default()
            });
            assert!(matches!(info.check_supported(), Err(Error::Unsupported(_))));
        }
    }

    #[test]
    fn byte_by_byte() {
        // Baseline, so that every slice ends an access unit.
        let sps = Sps {
            profile_idc: 0,
            ..sps()
        };
        let data = stream(&sps, &[NaluType::Idr, NaluType::NoIdr]);
        let mut parser = EvcStreamParser::default();

        let mut aus = vec![];
        for (i, byte) in data.iter().enumerate() {
            match parser.feed(std::slice::from_ref(byte)).unwrap() {
                FeedStatus::NeedMoreData => assert!(parser.to_read() > 0),
                FeedStatus::AccessUnits(mut new) => {
                    assert_eq!(parser.to_read(), 0, "at byte {}", i);
                    aus.append(&mut new);
                }
            }
        }

        assert_eq!(aus.len(), 2);
        assert_eq!(aus[0].nal_types, vec![NaluType::Sps, NaluType::Pps, NaluType::Idr]);
        assert_eq!(aus[1].nal_types, vec![NaluType::NoIdr]);
        assert_eq!([&aus[0].data[..], &aus[1].data[..]].concat(), data);
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn need_more_data_in_prefix() {
        let data = stream(&sps(), &[NaluType::Idr]);
        let mut parser = EvcStreamParser::default();

        assert_eq!(parser.feed(&data[..2]).unwrap(), FeedStatus::NeedMoreData);
        assert_eq!(parser.to_read(), 2);

        let aus = access_units(parser.feed(&data[2..]).unwrap());
        assert_eq!(aus.len(), 1);
        assert_eq!(aus[0].data, data);
    }

    #[test]
    fn zero_length_prefix() {
        let data = stream(&sps(), &[NaluType::Idr]);
        let mut parser = EvcStreamParser::default();

        let mut input = vec![0x00, 0x00, 0x00, 0x00];
        input.extend_from_slice(&data);

        assert!(matches!(parser.feed(&input), Err(Error::InvalidData(_))));
        // The prefix was dropped, the rest of the stream is still there.
        let aus = access_units(parser.feed(&[]).unwrap());
        assert_eq!(aus.len(), 1);
        assert_eq!(aus[0].data, data);
    }

    #[test]
    fn oversized_nalu() {
        let mut parser = EvcStreamParser::new(StreamParserConfig {
            max_nalu_size: 16,
            ..Default::default()
        });

        assert!(matches!(
            parser.feed(&[0x00, 0x00, 0x00, 0x11]),
            Err(Error::InvalidData(_))
        ));
        assert_eq!(parser.to_read(), 0);
        assert_eq!(access_units(parser.feed(&[]).unwrap()), vec![]);
    }

    #[test]
    fn error_keeps_completed_access_units() {
        let data = stream(&sps(), &[NaluType::Idr]);
        // A PPS referencing a SPS that does not exist.
        let bad_pps = Pps {
            pps_pic_parameter_set_id: 1,
            pps_seq_parameter_set_id: 9,
            single_tile_in_pic_flag: true,
            ..Default::default()
        };
        let mut input = data.clone();
        Synthesizer::<'_, Pps, _>::synthesize(0, &bad_pps, &mut input).unwrap();

        let mut parser = EvcStreamParser::default();
        assert!(matches!(parser.feed(&input), Err(Error::InvalidData(_))));

        let aus = access_units(parser.feed(&[]).unwrap());
        assert_eq!(aus.len(), 1);
        assert_eq!(aus[0].data, data);
    }

    #[test]
    fn flush_and_reset() {
        let data = stream(&sps(), &[NaluType::Idr]);
        let mut parser = EvcStreamParser::default();

        // SPS and PPS, then a truncated IDR.
        let idr_start = stream(&sps(), &[]).len();
        assert_eq!(
            parser.feed(&data[..idr_start + 5]).unwrap(),
            FeedStatus::NeedMoreData
        );

        let aus = parser.flush();
        assert_eq!(aus.len(), 1);
        assert_eq!(aus[0].nal_types, vec![NaluType::Sps, NaluType::Pps]);
        assert_eq!(parser.to_read(), 0);

        parser.reset();
        assert!(parser.stream_info().is_none());
        assert!(parser.frame_merger().parser().get_sps(0).is_none());
    }

    #[test]
    fn probing() {
        assert_eq!(probe(&stream(&sps(), &[NaluType::Idr])), PROBE_SCORE);
        assert_eq!(probe(&stream(&sps(), &[NaluType::NoIdr; 3])), 0);
        assert_eq!(probe(&stream(&sps(), &[NaluType::NoIdr; 4])), PROBE_SCORE);
        assert_eq!(probe(&stream(&sps(), &[])), 0);
        assert_eq!(probe(&[0x00, 0x00, 0x00, 0x00, 0x32, 0x00]), 0);
        assert_eq!(probe(&[]), 0);
    }
}
