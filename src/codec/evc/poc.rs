// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture order count derivation, ISO/IEC 23094-1 8.3.1.

use crate::codec::evc::nalu::NaluType;
use crate::codec::evc::parser::SliceHeader;
use crate::codec::evc::parser::Sps;
use crate::codec::evc::Error;
use crate::codec::evc::Result;

fn overflow() -> Error {
    Error::InvalidData("picture order count overflow".into())
}

/// The temporal id expected for a picture at `doc_offset` in a hierarchical
/// sub-GOP.
fn expected_temporal_id(doc_offset: i32) -> u32 {
    if doc_offset <= 0 {
        0
    } else {
        // 1 + floor(log2(doc_offset))
        32 - doc_offset.leading_zeros()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PocState {
    /// PicOrderCntVal of the last derived picture.
    pub pic_order_cnt_val: i32,
    /// PicOrderCntVal of the picture before it, or the anchor of the current
    /// sub-GOP when the POC is derived implicitly.
    pub prev_pic_order_cnt_val: i32,
    /// Decoding order offset of the last picture inside its sub-GOP.
    pub doc_offset: i32,
}

impl PocState {
    /// Derives the picture order count of the slice `hdr` and returns it.
    ///
    /// The state is only updated if the derivation succeeds.
    pub fn derive(
        &mut self,
        nal_type: NaluType,
        temporal_id: u8,
        sps: &Sps,
        hdr: &SliceHeader,
    ) -> Result<i32> {
        if !nal_type.is_slice() {
            return Err(Error::InvalidData(format!(
                "cannot derive a picture order count for {:?}",
                nal_type
            )));
        }

        let mut next = self.clone();
        if sps.sps_pocs_flag {
            next.derive_explicit(nal_type, sps, hdr)?;
        } else {
            next.derive_implicit(nal_type, u32::from(temporal_id), sps)?;
        }

        *self = next;
        Ok(self.pic_order_cnt_val)
    }

    fn derive_explicit(&mut self, nal_type: NaluType, sps: &Sps, hdr: &SliceHeader) -> Result<()> {
        self.prev_pic_order_cnt_val = self.pic_order_cnt_val;

        let max_lsb = sps.max_pic_order_cnt_lsb() as i32;
        let lsb = i32::try_from(hdr.slice_pic_order_cnt_lsb)
            .ok()
            .filter(|lsb| *lsb < max_lsb)
            .ok_or_else(|| {
                Error::InvalidData(format!(
                    "slice_pic_order_cnt_lsb {} exceeds {}",
                    hdr.slice_pic_order_cnt_lsb, max_lsb
                ))
            })?;

        let msb = if matches!(nal_type, NaluType::Idr) {
            0
        } else {
            let prev_lsb = self.prev_pic_order_cnt_val & (max_lsb - 1);
            let prev_msb = self.prev_pic_order_cnt_val - prev_lsb;

            if lsb < prev_lsb && prev_lsb - lsb >= max_lsb / 2 {
                prev_msb.checked_add(max_lsb).ok_or_else(overflow)?
            } else if lsb > prev_lsb && lsb - prev_lsb > max_lsb / 2 {
                prev_msb.checked_sub(max_lsb).ok_or_else(overflow)?
            } else {
                prev_msb
            }
        };

        self.pic_order_cnt_val = msb.checked_add(lsb).ok_or_else(overflow)?;
        Ok(())
    }

    fn derive_implicit(&mut self, nal_type: NaluType, temporal_id: u32, sps: &Sps) -> Result<()> {
        if matches!(nal_type, NaluType::Idr) {
            self.pic_order_cnt_val = 0;
            self.prev_pic_order_cnt_val = 0;
            self.doc_offset = -1;
            return Ok(());
        }

        let log2_sub_gop_length = u32::from(sps.log2_sub_gop_length);
        let sub_gop_length = sps.sub_gop_length() as i32;

        if temporal_id == 0 {
            self.pic_order_cnt_val = self
                .prev_pic_order_cnt_val
                .checked_add(sub_gop_length)
                .ok_or_else(overflow)?;
            self.doc_offset = 0;
            self.prev_pic_order_cnt_val = self.pic_order_cnt_val;
            return Ok(());
        }

        // No position in the sub-GOP carries a temporal id above its log2 size.
        if temporal_id > log2_sub_gop_length {
            return Err(Error::InvalidData(format!(
                "temporal id {} does not fit a sub-GOP of length {}",
                temporal_id, sub_gop_length
            )));
        }

        self.doc_offset = (self.doc_offset + 1).rem_euclid(sub_gop_length);
        if self.doc_offset == 0 {
            self.prev_pic_order_cnt_val = self
                .prev_pic_order_cnt_val
                .checked_add(sub_gop_length)
                .ok_or_else(overflow)?;
        }

        while expected_temporal_id(self.doc_offset) != temporal_id {
            self.doc_offset = (self.doc_offset + 1) % sub_gop_length;
        }

        // SubGopLength * ((2 * DocOffset + 1) / 2^tid - 2), exact as tid <= log2(SubGopLength).
        let poc_offset = ((2 * self.doc_offset + 1) << (log2_sub_gop_length - temporal_id))
            - (2 << log2_sub_gop_length);

        self.pic_order_cnt_val = self
            .prev_pic_order_cnt_val
            .checked_add(poc_offset)
            .ok_or_else(overflow)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explicit_sps(log2_max_pic_order_cnt_lsb_minus4: u8) -> Sps {
        Sps {
            sps_pocs_flag: true,
            log2_max_pic_order_cnt_lsb_minus4,
            ..Default::default()
        }
    }

    fn implicit_sps(log2_sub_gop_length: u8) -> Sps {
        Sps {
            log2_sub_gop_length,
            ..Default::default()
        }
    }

    fn slice(lsb: u32) -> SliceHeader {
        SliceHeader {
            slice_pic_order_cnt_lsb: lsb,
            ..Default::default()
        }
    }

    #[test]
    fn explicit_wraparound() {
        // MaxPicOrderCntLsb = 16
        let sps = explicit_sps(0);
        let mut poc = PocState::default();

        assert_eq!(poc.derive(NaluType::Idr, 0, &sps, &slice(0)).unwrap(), 0);
        assert_eq!(poc.derive(NaluType::NoIdr, 0, &sps, &slice(4)).unwrap(), 4);
        assert_eq!(poc.derive(NaluType::NoIdr, 0, &sps, &slice(12)).unwrap(), 12);
        assert_eq!(poc.prev_pic_order_cnt_val, 4);

        // 12 -> 2: the LSBs wrapped forward.
        assert_eq!(poc.derive(NaluType::NoIdr, 0, &sps, &slice(2)).unwrap(), 18);
        // 18 (lsb 2) -> 13: difference of 11 > 8, wraps backwards.
        assert_eq!(poc.derive(NaluType::NoIdr, 0, &sps, &slice(13)).unwrap(), 13);
    }

    #[test]
    fn explicit_half_range_boundary() {
        let sps = explicit_sps(0);

        // prev_lsb - lsb == max_lsb / 2 moves forward.
        let mut poc = PocState {
            pic_order_cnt_val: 8,
            ..Default::default()
        };
        assert_eq!(poc.derive(NaluType::NoIdr, 0, &sps, &slice(0)).unwrap(), 16);

        // lsb - prev_lsb == max_lsb / 2 keeps the MSBs.
        let mut poc = PocState {
            pic_order_cnt_val: 16,
            ..Default::default()
        };
        assert_eq!(poc.derive(NaluType::NoIdr, 0, &sps, &slice(8)).unwrap(), 24);

        // One more than half the range goes back.
        let mut poc = PocState {
            pic_order_cnt_val: 16,
            ..Default::default()
        };
        assert_eq!(poc.derive(NaluType::NoIdr, 0, &sps, &slice(9)).unwrap(), 9);
    }

    #[test]
    fn explicit_idr_resets_msb() {
        let sps = explicit_sps(0);
        let mut poc = PocState {
            pic_order_cnt_val: 100,
            ..Default::default()
        };

        assert_eq!(poc.derive(NaluType::Idr, 0, &sps, &slice(0)).unwrap(), 0);
        assert_eq!(poc.prev_pic_order_cnt_val, 100);
    }

    #[test]
    fn implicit_hierarchy() {
        // SubGopLength = 4: decoding order tid 0, 1, 2, 2 maps to POCs 4, 2, 1, 3.
        let sps = implicit_sps(2);
        let mut poc = PocState::default();

        assert_eq!(poc.derive(NaluType::Idr, 0, &sps, &slice(0)).unwrap(), 0);
        assert_eq!(poc.doc_offset, -1);

        assert_eq!(poc.derive(NaluType::NoIdr, 0, &sps, &slice(0)).unwrap(), 4);
        assert_eq!(poc.derive(NaluType::NoIdr, 1, &sps, &slice(0)).unwrap(), 2);
        assert_eq!(poc.derive(NaluType::NoIdr, 2, &sps, &slice(0)).unwrap(), 1);
        assert_eq!(poc.derive(NaluType::NoIdr, 2, &sps, &slice(0)).unwrap(), 3);

        // Next sub-GOP.
        assert_eq!(poc.derive(NaluType::NoIdr, 0, &sps, &slice(0)).unwrap(), 8);
        assert_eq!(poc.derive(NaluType::NoIdr, 1, &sps, &slice(0)).unwrap(), 6);
    }

    #[test]
    fn implicit_after_idr() {
        // Pictures right after the IDR start a new sub-GOP: tid 1 at
        // DocOffset 1 with prev = 4, giving 4 + (3 << 1) - 8 = 2.
        let sps = implicit_sps(2);
        let mut poc = PocState {
            pic_order_cnt_val: 40,
            prev_pic_order_cnt_val: 40,
            doc_offset: 2,
        };

        assert_eq!(poc.derive(NaluType::Idr, 0, &sps, &slice(0)).unwrap(), 0);
        assert_eq!(poc.prev_pic_order_cnt_val, 0);
        assert_eq!(poc.derive(NaluType::NoIdr, 1, &sps, &slice(0)).unwrap(), 2);
        assert_eq!(poc.prev_pic_order_cnt_val, 4);
        assert_eq!(poc.doc_offset, 1);
    }

    #[test]
    fn implicit_skips_to_expected_temporal_id() {
        // SubGopLength = 8, a tid 3 picture right after the tid 0 anchor skips
        // from DocOffset 1 (tid 1) to 4, the first tid 3 slot.
        let sps = implicit_sps(3);
        let mut poc = PocState::default();

        assert_eq!(poc.derive(NaluType::NoIdr, 0, &sps, &slice(0)).unwrap(), 8);
        assert_eq!(poc.derive(NaluType::NoIdr, 3, &sps, &slice(0)).unwrap(), 1);
        assert_eq!(poc.doc_offset, 4);
    }

    #[test]
    fn implicit_temporal_id_too_large() {
        let sps = implicit_sps(1);
        let mut poc = PocState::default();
        poc.derive(NaluType::Idr, 0, &sps, &slice(0)).unwrap();

        let before = poc.clone();
        assert!(matches!(
            poc.derive(NaluType::NoIdr, 2, &sps, &slice(0)),
            Err(Error::InvalidData(_))
        ));
        assert_eq!(poc, before);

        let sps = implicit_sps(0);
        assert!(poc.derive(NaluType::NoIdr, 1, &sps, &slice(0)).is_err());
        assert_eq!(poc, before);
    }

    #[test]
    fn non_slice_rejected() {
        let mut poc = PocState::default();
        assert!(poc
            .derive(NaluType::Sps, 0, &implicit_sps(0), &slice(0))
            .is_err());
        assert_eq!(poc, PocState::default());
    }

    #[test]
    fn expected_temporal_ids() {
        assert_eq!(expected_temporal_id(0), 0);
        assert_eq!(expected_temporal_id(1), 1);
        assert_eq!(expected_temporal_id(2), 2);
        assert_eq!(expected_temporal_id(3), 2);
        assert_eq!(expected_temporal_id(4), 3);
        assert_eq!(expected_temporal_id(7), 3);
        assert_eq!(expected_temporal_id(8), 4);
    }
}
