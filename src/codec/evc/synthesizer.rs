// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.
use std::io::Write;

use thiserror::Error;

use crate::codec::evc::nalu::NaluType;
use crate::codec::evc::nalu_writer::write_length_prefixed;
use crate::codec::evc::nalu_writer::NaluWriter;
use crate::codec::evc::nalu_writer::NaluWriterError;
use crate::codec::evc::parser::ChromaQpTable;
use crate::codec::evc::parser::HrdParams;
use crate::codec::evc::parser::Pps;
use crate::codec::evc::parser::RefPicListStruct;
use crate::codec::evc::parser::SliceHeader;
use crate::codec::evc::parser::Sps;
use crate::codec::evc::parser::EXTENDED_SAR;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for Pps {}

impl private::NaluStruct for SliceHeader {}

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// A helper to output typed NALUs to [`std::io::Write`] using [`NaluWriter`].
///
/// Every synthesized NAL unit is written with its 4-byte length prefix, so
/// that the output can be fed back to the stream parser as is.
pub struct Synthesizer<'n, N: private::NaluStruct, W: Write> {
    writer: NaluWriter<W>,
    nalu: &'n N,
}

/// Writes a single length-prefixed NAL unit whose payload is produced by
/// `body`.
fn synthesize_framed<'n, N, W, F>(
    type_: NaluType,
    temporal_id: u8,
    nalu: &'n N,
    mut writer: W,
    body: F,
) -> SynthesizerResult<()>
where
    N: private::NaluStruct,
    W: Write,
    F: for<'b> FnOnce(&mut Synthesizer<'n, N, &'b mut Vec<u8>>) -> SynthesizerResult<()>,
{
    let mut buf = Vec::new();
    {
        let mut s = Synthesizer {
            writer: NaluWriter::new(&mut buf),
            nalu,
        };

        s.writer.write_header(type_, temporal_id)?;
        body(&mut s)?;
        s.rbsp_trailing_bits()?;
    }

    write_length_prefixed(&mut writer, &buf)?;
    Ok(())
}

impl<N: private::NaluStruct, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_u(bits, value)?;
        Ok(())
    }

    fn f<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_f(bits, value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value)?;
        Ok(())
    }

    fn se<T: Into<i32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_se(value)?;
        Ok(())
    }

    fn rbsp_trailing_bits(&mut self) -> SynthesizerResult<()> {
        self.f(1, 1u32)?;

        while !self.writer.aligned() {
            self.f(1, 0u32)?;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(temporal_id: u8, sps: &'n Sps, writer: W) -> SynthesizerResult<()> {
        synthesize_framed(NaluType::Sps, temporal_id, sps, writer, |s| {
            s.seq_parameter_set_rbsp()
        })
    }

    fn hrd_parameters(&mut self, hrd_params: &HrdParams) -> SynthesizerResult<()> {
        self.ue(hrd_params.cpb_cnt_minus1)?;
        self.u(4, hrd_params.bit_rate_scale)?;
        self.u(4, hrd_params.cpb_size_scale)?;

        for i in 0..=(hrd_params.cpb_cnt_minus1 as usize) {
            self.ue(hrd_params.bit_rate_value_minus1[i])?;
            self.ue(hrd_params.cpb_size_value_minus1[i])?;
            self.u(1, hrd_params.cbr_flag[i])?;
        }

        self.u(5, hrd_params.initial_cpb_removal_delay_length_minus1)?;
        self.u(5, hrd_params.cpb_removal_delay_length_minus1)?;
        self.u(5, hrd_params.dpb_output_delay_length_minus1)?;
        self.u(5, hrd_params.time_offset_length)?;

        Ok(())
    }

    fn vui_parameters(&mut self) -> SynthesizerResult<()> {
        // ISO/IEC 23094-1 E.2.1
        let vui_params = &self.nalu.vui_parameters;

        self.u(1, vui_params.aspect_ratio_info_present_flag)?;
        if vui_params.aspect_ratio_info_present_flag {
            self.u(8, vui_params.aspect_ratio_idc)?;
            if vui_params.aspect_ratio_idc == EXTENDED_SAR {
                self.u(16, vui_params.sar_width)?;
                self.u(16, vui_params.sar_height)?;
            }
        }

        self.u(1, vui_params.overscan_info_present_flag)?;
        if vui_params.overscan_info_present_flag {
            self.u(1, vui_params.overscan_appropriate_flag)?;
        }

        self.u(1, vui_params.video_signal_type_present_flag)?;
        if vui_params.video_signal_type_present_flag {
            self.u(3, vui_params.video_format)?;
            self.u(1, vui_params.video_full_range_flag)?;

            self.u(1, vui_params.colour_description_present_flag)?;
            if vui_params.colour_description_present_flag {
                self.u(8, vui_params.colour_primaries)?;
                self.u(8, vui_params.transfer_characteristics)?;
                self.u(8, vui_params.matrix_coefficients)?;
            }
        }

        self.u(1, vui_params.chroma_loc_info_present_flag)?;
        if vui_params.chroma_loc_info_present_flag {
            self.ue(vui_params.chroma_sample_loc_type_top_field)?;
            self.ue(vui_params.chroma_sample_loc_type_bottom_field)?;
        }

        self.u(1, vui_params.neutral_chroma_indication_flag)?;
        self.u(1, vui_params.field_seq_flag)?;

        self.u(1, vui_params.timing_info_present_flag)?;
        if vui_params.timing_info_present_flag {
            self.u(32, vui_params.num_units_in_tick)?;
            self.u(32, vui_params.time_scale)?;
            self.u(1, vui_params.fixed_pic_rate_flag)?;
        }

        self.u(1, vui_params.nal_hrd_parameters_present_flag)?;
        if vui_params.nal_hrd_parameters_present_flag {
            self.hrd_parameters(&vui_params.nal_hrd_parameters)?;
        }
        self.u(1, vui_params.vcl_hrd_parameters_present_flag)?;
        if vui_params.vcl_hrd_parameters_present_flag {
            self.hrd_parameters(&vui_params.vcl_hrd_parameters)?;
        }

        if vui_params.nal_hrd_parameters_present_flag || vui_params.vcl_hrd_parameters_present_flag
        {
            self.u(1, vui_params.low_delay_hrd_flag)?;
        }

        self.u(1, vui_params.pic_struct_present_flag)?;

        self.u(1, vui_params.bitstream_restriction_flag)?;
        if vui_params.bitstream_restriction_flag {
            self.u(1, vui_params.motion_vectors_over_pic_boundaries_flag)?;
            self.ue(vui_params.max_bytes_per_pic_denom)?;
            self.ue(vui_params.max_bits_per_mb_denom)?;
            self.ue(vui_params.log2_max_mv_length_horizontal)?;
            self.ue(vui_params.log2_max_mv_length_vertical)?;
            self.ue(vui_params.num_reorder_pics)?;
            self.ue(vui_params.max_dec_pic_buffering)?;
        }

        Ok(())
    }

    fn ref_pic_list_struct(&mut self, rpl: &RefPicListStruct) -> SynthesizerResult<()> {
        let num = usize::from(rpl.ref_pic_num);
        if num > rpl.ref_pics.len() {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(rpl.ref_pic_num)?;

        // Entries are stored accumulated, the bitstream carries the deltas.
        let mut prev = 0i64;
        for &ref_pic in &rpl.ref_pics[..num] {
            let delta = i64::from(ref_pic) - prev;
            let abs = u32::try_from(delta.unsigned_abs()).map_err(|_| SynthesizerError::Unsupported)?;

            self.ue(abs)?;
            if abs != 0 {
                self.u(1, delta < 0)?;
            }

            prev = i64::from(ref_pic);
        }

        Ok(())
    }

    fn chroma_qp_table(&mut self, table: &ChromaQpTable) -> SynthesizerResult<()> {
        self.u(1, table.chroma_qp_table_present_flag)?;
        if !table.chroma_qp_table_present_flag {
            return Ok(());
        }

        self.u(1, table.same_qp_table_for_chroma)?;
        self.u(1, table.global_offset_flag)?;

        for i in 0..table.num_tables() {
            let num_points = usize::from(table.num_points_in_qp_table_minus1[i]) + 1;
            if table.delta_qp_in_val_minus1[i].len() != num_points
                || table.delta_qp_out_val[i].len() != num_points
            {
                return Err(SynthesizerError::Unsupported);
            }

            self.ue(table.num_points_in_qp_table_minus1[i])?;
            for j in 0..num_points {
                self.u(6, table.delta_qp_in_val_minus1[i][j])?;
                self.se(table.delta_qp_out_val[i][j])?;
            }
        }

        Ok(())
    }

    fn seq_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        // ISO/IEC 23094-1 7.3.2.1
        let sps = self.nalu;

        self.ue(sps.sps_seq_parameter_set_id)?;
        self.u(8, sps.profile_idc)?;
        self.u(8, sps.level_idc)?;
        self.u(32, sps.toolset_idc_h)?;
        self.u(32, sps.toolset_idc_l)?;
        self.ue(sps.chroma_format_idc)?;
        self.ue(sps.pic_width_in_luma_samples)?;
        self.ue(sps.pic_height_in_luma_samples)?;
        self.ue(sps.bit_depth_luma_minus8)?;
        self.ue(sps.bit_depth_chroma_minus8)?;

        self.u(1, sps.sps_btt_flag)?;
        if sps.sps_btt_flag {
            self.ue(sps.log2_ctu_size_minus5)?;
            self.ue(sps.log2_min_cb_size_minus2)?;
            self.ue(sps.log2_diff_ctu_max_14_cb_size)?;
            self.ue(sps.log2_diff_ctu_max_tt_cb_size)?;
            self.ue(sps.log2_diff_min_cb_min_tt_cb_size_minus2)?;
        }

        self.u(1, sps.sps_suco_flag)?;
        if sps.sps_suco_flag {
            self.ue(sps.log2_diff_ctu_size_max_suco_cb_size)?;
            self.ue(sps.log2_diff_max_suco_min_suco_cb_size)?;
        }

        self.u(1, sps.sps_admvp_flag)?;
        if sps.sps_admvp_flag {
            self.u(1, sps.sps_affine_flag)?;
            self.u(1, sps.sps_amvr_flag)?;
            self.u(1, sps.sps_dmvr_flag)?;
            self.u(1, sps.sps_mmvd_flag)?;
            self.u(1, sps.sps_hmvp_flag)?;
        }

        self.u(1, sps.sps_eipd_flag)?;
        if sps.sps_eipd_flag {
            self.u(1, sps.sps_ibc_flag)?;
            if sps.sps_ibc_flag {
                self.ue(sps.log2_max_ibc_cand_size_minus2)?;
            }
        }

        self.u(1, sps.sps_cm_init_flag)?;
        if sps.sps_cm_init_flag {
            self.u(1, sps.sps_adcc_flag)?;
        }

        self.u(1, sps.sps_iqt_flag)?;
        if sps.sps_iqt_flag {
            self.u(1, sps.sps_ats_flag)?;
        }

        self.u(1, sps.sps_addb_flag)?;
        self.u(1, sps.sps_alf_flag)?;
        self.u(1, sps.sps_htdf_flag)?;
        self.u(1, sps.sps_rpl_flag)?;
        self.u(1, sps.sps_pocs_flag)?;
        self.u(1, sps.sps_dquant_flag)?;
        self.u(1, sps.sps_dra_flag)?;

        if sps.sps_pocs_flag {
            self.ue(sps.log2_max_pic_order_cnt_lsb_minus4)?;
        }

        if !sps.sps_pocs_flag || !sps.sps_rpl_flag {
            self.ue(sps.log2_sub_gop_length)?;
            if sps.log2_sub_gop_length == 0 {
                self.ue(sps.log2_ref_pic_gap_length)?;
            }
        }

        if !sps.sps_rpl_flag {
            self.ue(sps.max_num_tid0_ref_pics)?;
        } else {
            self.ue(sps.sps_max_dec_pic_buffering_minus1)?;
            self.u(1, sps.long_term_ref_pic_flag)?;
            self.u(1, sps.rpl1_same_as_rpl0_flag)?;

            let num_lists = if sps.rpl1_same_as_rpl0_flag { 1 } else { 2 };
            for list in 0..num_lists {
                if sps.rpls[list].len() != usize::from(sps.num_ref_pic_list_in_sps[list]) {
                    return Err(SynthesizerError::Unsupported);
                }

                self.ue(sps.num_ref_pic_list_in_sps[list])?;
                for rpl in &sps.rpls[list] {
                    self.ref_pic_list_struct(rpl)?;
                }
            }
        }

        self.u(1, sps.picture_cropping_flag)?;
        if sps.picture_cropping_flag {
            self.ue(sps.picture_crop_left_offset)?;
            self.ue(sps.picture_crop_right_offset)?;
            self.ue(sps.picture_crop_top_offset)?;
            self.ue(sps.picture_crop_bottom_offset)?;
        }

        if sps.chroma_format_idc != 0 {
            self.chroma_qp_table(&sps.chroma_qp_table)?;
        }

        self.u(1, sps.vui_parameters_present_flag)?;
        if sps.vui_parameters_present_flag {
            self.vui_parameters()?;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    pub fn synthesize(temporal_id: u8, pps: &'n Pps, writer: W) -> SynthesizerResult<()> {
        synthesize_framed(NaluType::Pps, temporal_id, pps, writer, |s| {
            s.pic_parameter_set_rbsp()
        })
    }

    fn pic_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        // ISO/IEC 23094-1 7.3.2.2
        let pps = self.nalu;

        self.ue(pps.pps_pic_parameter_set_id)?;
        self.ue(pps.pps_seq_parameter_set_id)?;
        self.ue(pps.num_ref_idx_default_active_minus1[0])?;
        self.ue(pps.num_ref_idx_default_active_minus1[1])?;
        self.ue(pps.additional_lt_poc_lsb_len)?;
        self.u(1, pps.rpl1_idx_present_flag)?;

        self.u(1, pps.single_tile_in_pic_flag)?;
        if !pps.single_tile_in_pic_flag {
            self.ue(pps.num_tile_columns_minus1)?;
            self.ue(pps.num_tile_rows_minus1)?;

            self.u(1, pps.uniform_tile_spacing_flag)?;
            if !pps.uniform_tile_spacing_flag {
                if pps.tile_column_width_minus1.len() != pps.num_tile_columns_minus1 as usize
                    || pps.tile_row_height_minus1.len() != pps.num_tile_rows_minus1 as usize
                {
                    return Err(SynthesizerError::Unsupported);
                }

                for width in &pps.tile_column_width_minus1 {
                    self.ue(*width)?;
                }
                for height in &pps.tile_row_height_minus1 {
                    self.ue(*height)?;
                }
            }

            self.u(1, pps.loop_filter_across_tiles_enabled_flag)?;
            self.ue(pps.tile_offset_len_minus1)?;
        }

        self.ue(pps.tile_id_len_minus1)?;
        self.u(1, pps.explicit_tile_id_flag)?;
        if pps.explicit_tile_id_flag {
            let rows = pps.num_tile_rows_minus1 as usize + 1;
            let cols = pps.num_tile_columns_minus1 as usize + 1;
            if pps.tile_id_val.len() != rows || pps.tile_id_val.iter().any(|r| r.len() != cols) {
                return Err(SynthesizerError::Unsupported);
            }

            for row in &pps.tile_id_val {
                for id in row {
                    self.u(pps.tile_id_len(), *id)?;
                }
            }
        }

        self.u(1, pps.pic_dra_enabled_flag)?;
        if pps.pic_dra_enabled_flag {
            self.u(5, pps.pic_dra_aps_id)?;
        }

        self.u(1, pps.arbitrary_slice_present_flag)?;
        self.u(1, pps.constrained_intra_pred_flag)?;
        self.u(1, pps.cu_qp_delta_enabled_flag)?;
        if pps.cu_qp_delta_enabled_flag {
            self.ue(pps.log2_cu_qp_delta_area_minus6)?;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, SliceHeader, W> {
    /// Writes a slice NAL unit of type `nal_type` carrying `hdr` and no slice
    /// data. `pps` and `sps` must be the parameter sets `hdr` refers to.
    pub fn synthesize(
        nal_type: NaluType,
        temporal_id: u8,
        hdr: &'n SliceHeader,
        pps: &Pps,
        sps: &Sps,
        writer: W,
    ) -> SynthesizerResult<()> {
        if !nal_type.is_slice() {
            return Err(SynthesizerError::Unsupported);
        }

        let is_idr = matches!(nal_type, NaluType::Idr);
        synthesize_framed(nal_type, temporal_id, hdr, writer, |s| {
            s.slice_header(is_idr, pps, sps)
        })
    }

    fn alf(&mut self, chroma_array_type: u8) -> SynthesizerResult<()> {
        let hdr = self.nalu;

        self.u(1, hdr.slice_alf_enabled_flag)?;
        if hdr.slice_alf_enabled_flag {
            self.u(5, hdr.slice_alf_luma_aps_id)?;
            self.u(1, hdr.slice_alf_map_flag)?;
            self.u(2, hdr.slice_alf_chroma_idc)?;

            if (chroma_array_type == 1 || chroma_array_type == 2) && hdr.slice_alf_chroma_idc > 0 {
                self.u(5, hdr.slice_alf_chroma_aps_id)?;
            }
        }

        if chroma_array_type == 3 {
            if !hdr.slice_alf_enabled_flag {
                self.u(2, hdr.slice_alf_chroma_idc)?;
            }

            let (chroma, chroma2) = hdr.chroma_alf_enabled();
            if chroma {
                self.u(5, hdr.slice_alf_chroma_aps_id)?;
                self.u(1, hdr.slice_alf_chroma_map_flag)?;
            }

            if chroma2 {
                self.u(5, hdr.slice_alf_chroma2_aps_id)?;
                self.u(1, hdr.slice_alf_chroma2_map_flag)?;
            }
        }

        Ok(())
    }

    fn slice_header(&mut self, is_idr: bool, pps: &Pps, sps: &Sps) -> SynthesizerResult<()> {
        // ISO/IEC 23094-1 7.3.3
        let hdr = self.nalu;

        self.ue(hdr.slice_pic_parameter_set_id)?;

        if !pps.single_tile_in_pic_flag {
            self.u(1, hdr.single_tile_in_slice_flag)?;
            self.u(pps.tile_id_len(), hdr.first_tile_id)?;
        } else if !hdr.single_tile_in_slice_flag {
            return Err(SynthesizerError::Unsupported);
        }

        if !hdr.single_tile_in_slice_flag {
            if pps.arbitrary_slice_present_flag {
                self.u(1, hdr.arbitrary_slice_flag)?;
            } else if hdr.arbitrary_slice_flag {
                return Err(SynthesizerError::Unsupported);
            }

            if !hdr.arbitrary_slice_flag {
                self.u(pps.tile_id_len(), hdr.last_tile_id)?;
            } else {
                let num_deltas = hdr.num_remaining_tiles_in_slice_minus1 as usize + 1;
                if hdr.delta_tile_id_minus1.len() != num_deltas {
                    return Err(SynthesizerError::Unsupported);
                }

                self.ue(hdr.num_remaining_tiles_in_slice_minus1)?;
                for delta in &hdr.delta_tile_id_minus1 {
                    self.ue(*delta)?;
                }
            }
        }

        self.ue(hdr.slice_type as u32)?;

        if is_idr {
            self.u(1, hdr.no_output_of_prior_pics_flag)?;
        }

        if sps.sps_mmvd_flag && (hdr.slice_type.is_b() || hdr.slice_type.is_p()) {
            self.u(1, hdr.mmvd_group_enable_flag)?;
        }

        if sps.sps_alf_flag {
            self.alf(sps.chroma_array_type())?;
        }

        if !is_idr && sps.sps_pocs_flag {
            self.u(
                usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4,
                hdr.slice_pic_order_cnt_lsb,
            )?;
        }

        Ok(())
    }
}
