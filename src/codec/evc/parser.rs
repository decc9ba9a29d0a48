// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// Can't reasonably expect client code to consume everything that has been parsed.
#![allow(dead_code)]

use std::collections::BTreeMap;

use enumn::N;

use crate::bitstream_utils::BitReader;
use crate::codec::evc::nalu::Nalu;
use crate::codec::evc::nalu::NaluType;
use crate::codec::evc::Error;
use crate::codec::evc::Result;
use crate::Resolution;

pub const MAX_SPS_COUNT: usize = 16;
pub const MAX_PPS_COUNT: usize = 64;
pub const MAX_NUM_REF_PICS: usize = 21;
pub const MAX_NUM_RPLS: usize = 32;
pub const MAX_TILE_COLUMNS: usize = 20;
pub const MAX_TILE_ROWS: usize = 22;
pub const MAX_QP_TABLE_SIZE: usize = 58;
pub const NUM_CPB: usize = 32;

/// Extended Sample Aspect Ratio - ISO/IEC 23091-2 Table 7
pub const EXTENDED_SAR: u8 = 255;

/// The largest `log2_max_pic_order_cnt_lsb_minus4` allowed by 7.4.3.1.
const MAX_LOG2_MAX_POC_LSB_MINUS4: u32 = 12;
/// The largest `log2_sub_gop_length` allowed by 7.4.3.1.
const MAX_LOG2_SUB_GOP_LENGTH: u32 = 5;

#[derive(N, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Baseline = 0,
    Main = 1,
}

impl Profile {
    /// Maps a `profile_idc` to the frame merging rules that apply to it. Any
    /// value other than Main follows the Baseline rules.
    pub fn from_idc(profile_idc: u8) -> Self {
        if profile_idc == Profile::Main as u8 {
            Profile::Main
        } else {
            Profile::Baseline
        }
    }
}

#[derive(N, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    #[default]
    B = 0,
    P = 1,
    I = 2,
}

impl SliceType {
    /// Whether this is a B slice.
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether this is a P slice.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether this is an I slice.
    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    /// Plus 1 specifies the number of alternative CPB specifications in the
    /// bitstream.
    pub cpb_cnt_minus1: u8,
    /// Together with `bit_rate_value_minus1[SchedSelIdx]` specifies the
    /// maximum input bit rate of the SchedSelIdx-th CPB.
    pub bit_rate_scale: u8,
    /// Together with `cpb_size_value_minus1[SchedSelIdx]` specifies the CPB
    /// size of the SchedSelIdx-th CPB.
    pub cpb_size_scale: u8,

    pub bit_rate_value_minus1: [u32; NUM_CPB],
    pub cpb_size_value_minus1: [u32; NUM_CPB],
    /// Whether the SchedSelIdx-th CPB is operated in constant bit rate mode.
    pub cbr_flag: [bool; NUM_CPB],

    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    /// Specifies the value of the sample aspect ratio of the luma samples.
    pub aspect_ratio_idc: u8,
    /// Horizontal size of the sample aspect ratio, when `aspect_ratio_idc` is
    /// [`EXTENDED_SAR`].
    pub sar_width: u16,
    /// Vertical size of the sample aspect ratio, when `aspect_ratio_idc` is
    /// [`EXTENDED_SAR`].
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub neutral_chroma_indication_flag: bool,
    pub field_seq_flag: bool,

    /// Whether `num_units_in_tick`, `time_scale` and `fixed_pic_rate_flag`
    /// are present.
    pub timing_info_present_flag: bool,
    /// The number of time units of a clock operating at `time_scale` Hz that
    /// corresponds to one increment of a clock tick counter.
    pub num_units_in_tick: u32,
    /// The number of time units that pass in one second.
    pub time_scale: u32,
    pub fixed_pic_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,

    pub pic_struct_present_flag: bool,

    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    /// Maximum number of pictures that can precede any picture in decoding
    /// order and follow it in output order.
    pub num_reorder_pics: u32,
    pub max_dec_pic_buffering: u32,
}

/// A `ref_pic_list_struct()` from the SPS. Entries are stored as the
/// accumulated POC deltas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListStruct {
    pub ref_pic_num: u8,
    pub ref_pics: [i32; MAX_NUM_REF_PICS],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChromaQpTable {
    pub chroma_qp_table_present_flag: bool,
    pub same_qp_table_for_chroma: bool,
    pub global_offset_flag: bool,
    pub num_points_in_qp_table_minus1: [u8; 2],
    pub delta_qp_in_val_minus1: [Vec<u8>; 2],
    pub delta_qp_out_val: [Vec<i32>; 2],
}

impl ChromaQpTable {
    /// Number of tables actually coded in the bitstream.
    pub fn num_tables(&self) -> usize {
        if self.same_qp_table_for_chroma {
            1
        } else {
            2
        }
    }
}

/// A EVC Sequence Parameter Set, ISO/IEC 23094-1 7.3.2.1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    /// Identifies the SPS for reference by other syntax elements.
    pub sps_seq_parameter_set_id: u8,
    /// Profile to which the coded video sequence conforms.
    pub profile_idc: u8,
    /// Level to which the coded video sequence conforms.
    pub level_idc: u8,
    pub toolset_idc_h: u32,
    pub toolset_idc_l: u32,

    /// Specifies the chroma sampling relative to the luma sampling.
    pub chroma_format_idc: u8,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,

    pub sps_btt_flag: bool,
    pub log2_ctu_size_minus5: u32,
    pub log2_min_cb_size_minus2: u32,
    pub log2_diff_ctu_max_14_cb_size: u32,
    pub log2_diff_ctu_max_tt_cb_size: u32,
    pub log2_diff_min_cb_min_tt_cb_size_minus2: u32,

    pub sps_suco_flag: bool,
    pub log2_diff_ctu_size_max_suco_cb_size: u32,
    pub log2_diff_max_suco_min_suco_cb_size: u32,

    pub sps_admvp_flag: bool,
    pub sps_affine_flag: bool,
    pub sps_amvr_flag: bool,
    pub sps_dmvr_flag: bool,
    pub sps_mmvd_flag: bool,
    pub sps_hmvp_flag: bool,

    pub sps_eipd_flag: bool,
    pub sps_ibc_flag: bool,
    pub log2_max_ibc_cand_size_minus2: u32,

    pub sps_cm_init_flag: bool,
    pub sps_adcc_flag: bool,

    pub sps_iqt_flag: bool,
    pub sps_ats_flag: bool,

    pub sps_addb_flag: bool,
    pub sps_alf_flag: bool,
    pub sps_htdf_flag: bool,
    pub sps_rpl_flag: bool,
    /// Whether the picture order count is signalled in slice headers.
    pub sps_pocs_flag: bool,
    pub sps_dquant_flag: bool,
    pub sps_dra_flag: bool,

    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    /// Log2 of the hierarchical sub-GOP length used to derive the picture
    /// order count when `sps_pocs_flag` is unset.
    pub log2_sub_gop_length: u8,
    pub log2_ref_pic_gap_length: u32,

    pub max_num_tid0_ref_pics: u32,

    pub sps_max_dec_pic_buffering_minus1: u32,
    pub long_term_ref_pic_flag: bool,
    pub rpl1_same_as_rpl0_flag: bool,
    pub num_ref_pic_list_in_sps: [u8; 2],
    pub rpls: [Vec<RefPicListStruct>; 2],

    pub picture_cropping_flag: bool,
    pub picture_crop_left_offset: u32,
    pub picture_crop_right_offset: u32,
    pub picture_crop_top_offset: u32,
    pub picture_crop_bottom_offset: u32,

    pub chroma_qp_table: ChromaQpTable,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    pub fn profile(&self) -> Profile {
        Profile::from_idc(self.profile_idc)
    }

    /// Same as ChromaArrayType. EVC has no separate colour planes.
    pub fn chroma_array_type(&self) -> u8 {
        self.chroma_format_idc
    }

    pub fn bit_depth_luma(&self) -> u8 {
        self.bit_depth_luma_minus8 + 8
    }

    pub fn bit_depth_chroma(&self) -> u8 {
        self.bit_depth_chroma_minus8 + 8
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.pic_width_in_luma_samples,
            height: self.pic_height_in_luma_samples,
        }
    }

    /// MaxPicOrderCntLsb
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// SubGopLength
    pub fn sub_gop_length(&self) -> u32 {
        1 << self.log2_sub_gop_length
    }
}

/// A EVC Picture Parameter Set, ISO/IEC 23094-1 7.3.2.2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    /// Identifies the PPS for reference by other syntax elements.
    pub pps_pic_parameter_set_id: u8,
    /// The SPS this PPS refers to. Always resolved when the PPS was parsed.
    pub pps_seq_parameter_set_id: u8,
    pub num_ref_idx_default_active_minus1: [u32; 2],
    pub additional_lt_poc_lsb_len: u32,
    pub rpl1_idx_present_flag: bool,

    pub single_tile_in_pic_flag: bool,
    pub num_tile_columns_minus1: u32,
    pub num_tile_rows_minus1: u32,
    pub uniform_tile_spacing_flag: bool,
    pub tile_column_width_minus1: Vec<u32>,
    pub tile_row_height_minus1: Vec<u32>,
    pub loop_filter_across_tiles_enabled_flag: bool,
    pub tile_offset_len_minus1: u32,

    /// Plus 1 gives the width in bits of tile ids.
    pub tile_id_len_minus1: u8,
    pub explicit_tile_id_flag: bool,
    /// Explicit tile ids, indexed by tile row then tile column.
    pub tile_id_val: Vec<Vec<u32>>,

    pub pic_dra_enabled_flag: bool,
    pub pic_dra_aps_id: u8,

    pub arbitrary_slice_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub cu_qp_delta_enabled_flag: bool,
    pub log2_cu_qp_delta_area_minus6: u32,
}

impl Pps {
    /// Number of bits used to code tile ids in slice headers.
    pub fn tile_id_len(&self) -> usize {
        usize::from(self.tile_id_len_minus1) + 1
    }
}

/// A EVC slice header, ISO/IEC 23094-1 7.3.3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// The PPS in use. Always resolved when the header was parsed.
    pub slice_pic_parameter_set_id: u8,
    pub single_tile_in_slice_flag: bool,
    pub first_tile_id: u32,
    pub arbitrary_slice_flag: bool,
    pub last_tile_id: u32,
    pub num_remaining_tiles_in_slice_minus1: u32,
    pub delta_tile_id_minus1: Vec<u32>,

    pub slice_type: SliceType,
    pub no_output_of_prior_pics_flag: bool,
    pub mmvd_group_enable_flag: bool,

    pub slice_alf_enabled_flag: bool,
    pub slice_alf_luma_aps_id: u8,
    pub slice_alf_map_flag: bool,
    pub slice_alf_chroma_idc: u8,
    pub slice_alf_chroma_aps_id: u8,
    pub slice_alf_chroma_map_flag: bool,
    pub slice_alf_chroma2_aps_id: u8,
    pub slice_alf_chroma2_map_flag: bool,

    /// The picture order count modulo MaxPicOrderCntLsb. Only coded when
    /// `sps_pocs_flag` is set and the slice is not part of an IDR picture.
    pub slice_pic_order_cnt_lsb: u32,
}

impl SliceHeader {
    /// Whether the first (Cb) and second (Cr) chroma ALF sets are enabled,
    /// as selected by `slice_alf_chroma_idc`.
    pub fn chroma_alf_enabled(&self) -> (bool, bool) {
        match self.slice_alf_chroma_idc {
            1 => (true, false),
            2 => (false, true),
            3 => (true, true),
            _ => (false, false),
        }
    }
}

/// Parses EVC parameter sets and slice headers, keeping the parameter sets
/// around so that later NAL units can refer to them by id.
#[derive(Debug, Default)]
pub struct Parser {
    active_spses: BTreeMap<u8, Sps>,
    active_ppses: BTreeMap<u8, Pps>,
    slice_headers: BTreeMap<u8, SliceHeader>,
}

fn check_nalu_type(nalu: &Nalu, expected: &[NaluType]) -> Result<()> {
    if expected.contains(&nalu.header.type_) {
        Ok(())
    } else {
        Err(Error::InvalidData(format!(
            "Invalid NALU type, expected {:?}, got {:?}",
            expected, nalu.header.type_
        )))
    }
}

impl Parser {
    fn parse_hrd(r: &mut BitReader, hrd: &mut HrdParams) -> Result<()> {
        hrd.cpb_cnt_minus1 = r.read_ue_max(NUM_CPB as u32 - 1)?;
        hrd.bit_rate_scale = r.read_bits(4)?;
        hrd.cpb_size_scale = r.read_bits(4)?;

        for sched_sel_idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
            hrd.bit_rate_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cpb_size_value_minus1[sched_sel_idx] = r.read_ue()?;
            hrd.cbr_flag[sched_sel_idx] = r.read_bit()?;
        }

        hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
        hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
        hrd.time_offset_length = r.read_bits(5)?;
        Ok(())
    }

    fn parse_vui(r: &mut BitReader, vui: &mut VuiParams) -> Result<()> {
        vui.aspect_ratio_info_present_flag = r.read_bit()?;
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            if vui.aspect_ratio_idc == EXTENDED_SAR {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit()?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coefficients = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.neutral_chroma_indication_flag = r.read_bit()?;
        vui.field_seq_flag = r.read_bit()?;

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits(32)?;
            vui.time_scale = r.read_bits(32)?;
            vui.fixed_pic_rate_flag = r.read_bit()?;
        }

        vui.nal_hrd_parameters_present_flag = r.read_bit()?;
        if vui.nal_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.nal_hrd_parameters)?;
        }

        vui.vcl_hrd_parameters_present_flag = r.read_bit()?;
        if vui.vcl_hrd_parameters_present_flag {
            Parser::parse_hrd(r, &mut vui.vcl_hrd_parameters)?;
        }

        if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
            vui.low_delay_hrd_flag = r.read_bit()?;
        }

        vui.pic_struct_present_flag = r.read_bit()?;
        vui.bitstream_restriction_flag = r.read_bit()?;

        if vui.bitstream_restriction_flag {
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.max_bytes_per_pic_denom = r.read_ue()?;
            vui.max_bits_per_mb_denom = r.read_ue_max(16)?;
            vui.log2_max_mv_length_horizontal = r.read_ue_max(16)?;
            vui.log2_max_mv_length_vertical = r.read_ue_max(16)?;
            vui.num_reorder_pics = r.read_ue()?;
            vui.max_dec_pic_buffering = r.read_ue()?;
        }

        Ok(())
    }

    fn parse_ref_pic_list_struct(r: &mut BitReader) -> Result<RefPicListStruct> {
        let mut rpl = RefPicListStruct {
            ref_pic_num: r.read_ue_max(MAX_NUM_REF_PICS as u32)?,
            ..Default::default()
        };

        let mut prev = 0i64;
        for i in 0..usize::from(rpl.ref_pic_num) {
            let delta_poc_st = i64::from(r.read_ue::<u32>()?);
            let strp_entry_sign_flag = if delta_poc_st != 0 {
                r.read_bit()?
            } else {
                false
            };

            let delta = if strp_entry_sign_flag {
                -delta_poc_st
            } else {
                delta_poc_st
            };

            let value = prev + delta;
            rpl.ref_pics[i] = i32::try_from(value).map_err(|_| {
                Error::InvalidData(format!("reference picture delta {} out of range", value))
            })?;
            prev = value;
        }

        Ok(rpl)
    }

    fn parse_chroma_qp_table(r: &mut BitReader, table: &mut ChromaQpTable) -> Result<()> {
        table.chroma_qp_table_present_flag = r.read_bit()?;
        if !table.chroma_qp_table_present_flag {
            return Ok(());
        }

        table.same_qp_table_for_chroma = r.read_bit()?;
        table.global_offset_flag = r.read_bit()?;

        for i in 0..table.num_tables() {
            table.num_points_in_qp_table_minus1[i] = r.read_ue_max(MAX_QP_TABLE_SIZE as u32 - 1)?;

            let num_points = usize::from(table.num_points_in_qp_table_minus1[i]) + 1;
            table.delta_qp_in_val_minus1[i] = Vec::with_capacity(num_points);
            table.delta_qp_out_val[i] = Vec::with_capacity(num_points);

            for _ in 0..num_points {
                table.delta_qp_in_val_minus1[i].push(r.read_bits(6)?);
                table.delta_qp_out_val[i].push(r.read_se()?);
            }
        }

        Ok(())
    }

    /// Parse a SPS and add it to the list of active SPSes, replacing any SPS
    /// with the same id.
    ///
    /// Returns a reference to the new SPS.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> Result<&Sps> {
        check_nalu_type(nalu, &[NaluType::Sps])?;

        let mut r = BitReader::new(nalu.payload());
        let mut sps = Sps {
            sps_seq_parameter_set_id: r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?,
            profile_idc: r.read_bits(8)?,
            level_idc: r.read_bits(8)?,
            toolset_idc_h: r.read_bits(32)?,
            toolset_idc_l: r.read_bits(32)?,
            chroma_format_idc: r.read_ue_max(3)?,
            pic_width_in_luma_samples: r.read_ue()?,
            pic_height_in_luma_samples: r.read_ue()?,
            bit_depth_luma_minus8: r.read_ue_max(8)?,
            bit_depth_chroma_minus8: r.read_ue_max(8)?,
            ..Default::default()
        };

        sps.sps_btt_flag = r.read_bit()?;
        if sps.sps_btt_flag {
            sps.log2_ctu_size_minus5 = r.read_ue()?;
            sps.log2_min_cb_size_minus2 = r.read_ue()?;
            sps.log2_diff_ctu_max_14_cb_size = r.read_ue()?;
            sps.log2_diff_ctu_max_tt_cb_size = r.read_ue()?;
            sps.log2_diff_min_cb_min_tt_cb_size_minus2 = r.read_ue()?;
        }

        sps.sps_suco_flag = r.read_bit()?;
        if sps.sps_suco_flag {
            sps.log2_diff_ctu_size_max_suco_cb_size = r.read_ue()?;
            sps.log2_diff_max_suco_min_suco_cb_size = r.read_ue()?;
        }

        sps.sps_admvp_flag = r.read_bit()?;
        if sps.sps_admvp_flag {
            sps.sps_affine_flag = r.read_bit()?;
            sps.sps_amvr_flag = r.read_bit()?;
            sps.sps_dmvr_flag = r.read_bit()?;
            sps.sps_mmvd_flag = r.read_bit()?;
            sps.sps_hmvp_flag = r.read_bit()?;
        }

        sps.sps_eipd_flag = r.read_bit()?;
        if sps.sps_eipd_flag {
            sps.sps_ibc_flag = r.read_bit()?;
            if sps.sps_ibc_flag {
                sps.log2_max_ibc_cand_size_minus2 = r.read_ue()?;
            }
        }

        sps.sps_cm_init_flag = r.read_bit()?;
        if sps.sps_cm_init_flag {
            sps.sps_adcc_flag = r.read_bit()?;
        }

        sps.sps_iqt_flag = r.read_bit()?;
        if sps.sps_iqt_flag {
            sps.sps_ats_flag = r.read_bit()?;
        }

        sps.sps_addb_flag = r.read_bit()?;
        sps.sps_alf_flag = r.read_bit()?;
        sps.sps_htdf_flag = r.read_bit()?;
        sps.sps_rpl_flag = r.read_bit()?;
        sps.sps_pocs_flag = r.read_bit()?;
        sps.sps_dquant_flag = r.read_bit()?;
        sps.sps_dra_flag = r.read_bit()?;

        if sps.sps_pocs_flag {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(MAX_LOG2_MAX_POC_LSB_MINUS4)?;
        }

        if !sps.sps_pocs_flag || !sps.sps_rpl_flag {
            sps.log2_sub_gop_length = r.read_ue_max(MAX_LOG2_SUB_GOP_LENGTH)?;
            if sps.log2_sub_gop_length == 0 {
                sps.log2_ref_pic_gap_length = r.read_ue()?;
            }
        }

        if !sps.sps_rpl_flag {
            sps.max_num_tid0_ref_pics = r.read_ue()?;
        } else {
            sps.sps_max_dec_pic_buffering_minus1 = r.read_ue()?;
            sps.long_term_ref_pic_flag = r.read_bit()?;
            sps.rpl1_same_as_rpl0_flag = r.read_bit()?;

            let num_lists = if sps.rpl1_same_as_rpl0_flag { 1 } else { 2 };
            for list in 0..num_lists {
                sps.num_ref_pic_list_in_sps[list] = r.read_ue_max(MAX_NUM_RPLS as u32)?;
                sps.rpls[list] = (0..sps.num_ref_pic_list_in_sps[list])
                    .map(|_| Parser::parse_ref_pic_list_struct(&mut r))
                    .collect::<Result<Vec<_>>>()?;
            }
        }

        sps.picture_cropping_flag = r.read_bit()?;
        if sps.picture_cropping_flag {
            sps.picture_crop_left_offset = r.read_ue()?;
            sps.picture_crop_right_offset = r.read_ue()?;
            sps.picture_crop_top_offset = r.read_ue()?;
            sps.picture_crop_bottom_offset = r.read_ue()?;
        }

        if sps.chroma_format_idc != 0 {
            Parser::parse_chroma_qp_table(&mut r, &mut sps.chroma_qp_table)?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            Parser::parse_vui(&mut r, &mut sps.vui_parameters)?;
        }

        log::debug!(
            "Parsed SPS {}: profile {} level {} {}x{} chroma_format_idc {} pocs {} rpl {}",
            sps.sps_seq_parameter_set_id,
            sps.profile_idc,
            sps.level_idc,
            sps.pic_width_in_luma_samples,
            sps.pic_height_in_luma_samples,
            sps.chroma_format_idc,
            sps.sps_pocs_flag,
            sps.sps_rpl_flag
        );

        let key = sps.sps_seq_parameter_set_id;
        self.active_spses.remove(&key);
        Ok(self.active_spses.entry(key).or_insert(sps))
    }

    /// Parse a PPS and add it to the list of active PPSes. The SPS it refers
    /// to must have been parsed already.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> Result<&Pps> {
        check_nalu_type(nalu, &[NaluType::Pps])?;

        let mut r = BitReader::new(nalu.payload());
        let pps_pic_parameter_set_id = r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?;
        let pps_seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?;
        if self.get_sps(pps_seq_parameter_set_id).is_none() {
            return Err(Error::InvalidData(format!(
                "Broken stream: PPS {} references SPS {} that has not been successfully parsed",
                pps_pic_parameter_set_id, pps_seq_parameter_set_id
            )));
        }

        let mut pps = Pps {
            pps_pic_parameter_set_id,
            pps_seq_parameter_set_id,
            ..Default::default()
        };

        pps.num_ref_idx_default_active_minus1[0] = r.read_ue()?;
        pps.num_ref_idx_default_active_minus1[1] = r.read_ue()?;
        pps.additional_lt_poc_lsb_len = r.read_ue()?;
        pps.rpl1_idx_present_flag = r.read_bit()?;
        pps.single_tile_in_pic_flag = r.read_bit()?;

        if !pps.single_tile_in_pic_flag {
            pps.num_tile_columns_minus1 = r.read_ue_max(MAX_TILE_COLUMNS as u32 - 1)?;
            pps.num_tile_rows_minus1 = r.read_ue_max(MAX_TILE_ROWS as u32 - 1)?;
            pps.uniform_tile_spacing_flag = r.read_bit()?;

            if !pps.uniform_tile_spacing_flag {
                pps.tile_column_width_minus1 = (0..pps.num_tile_columns_minus1)
                    .map(|_| r.read_ue())
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                pps.tile_row_height_minus1 = (0..pps.num_tile_rows_minus1)
                    .map(|_| r.read_ue())
                    .collect::<std::result::Result<Vec<_>, _>>()?;
            }

            pps.loop_filter_across_tiles_enabled_flag = r.read_bit()?;
            pps.tile_offset_len_minus1 = r.read_ue()?;
        }

        pps.tile_id_len_minus1 = r.read_ue_max(31)?;
        pps.explicit_tile_id_flag = r.read_bit()?;
        if pps.explicit_tile_id_flag {
            for _ in 0..=pps.num_tile_rows_minus1 {
                let row = (0..=pps.num_tile_columns_minus1)
                    .map(|_| r.read_bits(pps.tile_id_len()))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                pps.tile_id_val.push(row);
            }
        }

        pps.pic_dra_enabled_flag = r.read_bit()?;
        if pps.pic_dra_enabled_flag {
            pps.pic_dra_aps_id = r.read_bits(5)?;
        }

        pps.arbitrary_slice_present_flag = r.read_bit()?;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.cu_qp_delta_enabled_flag = r.read_bit()?;
        if pps.cu_qp_delta_enabled_flag {
            pps.log2_cu_qp_delta_area_minus6 = r.read_ue()?;
        }

        log::debug!(
            "Parsed PPS {} referencing SPS {}",
            pps.pps_pic_parameter_set_id,
            pps.pps_seq_parameter_set_id
        );

        let key = pps.pps_pic_parameter_set_id;
        self.active_ppses.remove(&key);
        Ok(self.active_ppses.entry(key).or_insert(pps))
    }

    fn parse_alf(
        r: &mut BitReader,
        hdr: &mut SliceHeader,
        chroma_array_type: u8,
    ) -> Result<()> {
        hdr.slice_alf_enabled_flag = r.read_bit()?;
        if hdr.slice_alf_enabled_flag {
            hdr.slice_alf_luma_aps_id = r.read_bits(5)?;
            hdr.slice_alf_map_flag = r.read_bit()?;
            hdr.slice_alf_chroma_idc = r.read_bits(2)?;

            if (chroma_array_type == 1 || chroma_array_type == 2) && hdr.slice_alf_chroma_idc > 0 {
                hdr.slice_alf_chroma_aps_id = r.read_bits(5)?;
            }
        }

        if chroma_array_type == 3 {
            if !hdr.slice_alf_enabled_flag {
                hdr.slice_alf_chroma_idc = r.read_bits(2)?;
            }

            let (chroma, chroma2) = hdr.chroma_alf_enabled();
            if chroma {
                hdr.slice_alf_chroma_aps_id = r.read_bits(5)?;
                hdr.slice_alf_chroma_map_flag = r.read_bit()?;
            }

            if chroma2 {
                hdr.slice_alf_chroma2_aps_id = r.read_bits(5)?;
                hdr.slice_alf_chroma2_map_flag = r.read_bit()?;
            }
        }

        Ok(())
    }

    /// Parse the header of an IDR or non-IDR slice. The PPS it refers to, and
    /// the SPS that PPS refers to, must have been parsed already.
    ///
    /// The parsed header replaces the previous one stored for the same PPS id.
    pub fn parse_slice_header(&mut self, nalu: &Nalu) -> Result<&SliceHeader> {
        check_nalu_type(nalu, &[NaluType::NoIdr, NaluType::Idr])?;
        let is_idr = matches!(nalu.header.type_, NaluType::Idr);

        let mut r = BitReader::new(nalu.payload());
        let pps_id: u8 = r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?;
        let pps = self.get_pps(pps_id).ok_or_else(|| {
            Error::InvalidData(format!(
                "Broken stream: slice references PPS {} that has not been successfully parsed",
                pps_id
            ))
        })?;
        let sps = self.get_sps(pps.pps_seq_parameter_set_id).ok_or_else(|| {
            Error::InvalidData(format!(
                "Broken stream: PPS {} references SPS {} that is no longer available",
                pps_id, pps.pps_seq_parameter_set_id
            ))
        })?;

        let mut hdr = SliceHeader {
            slice_pic_parameter_set_id: pps_id,
            ..Default::default()
        };

        if !pps.single_tile_in_pic_flag {
            hdr.single_tile_in_slice_flag = r.read_bit()?;
            hdr.first_tile_id = r.read_bits(pps.tile_id_len())?;
        } else {
            hdr.single_tile_in_slice_flag = true;
        }

        if !hdr.single_tile_in_slice_flag {
            if pps.arbitrary_slice_present_flag {
                hdr.arbitrary_slice_flag = r.read_bit()?;
            }

            if !hdr.arbitrary_slice_flag {
                hdr.last_tile_id = r.read_bits(pps.tile_id_len())?;
            } else {
                hdr.num_remaining_tiles_in_slice_minus1 =
                    r.read_ue_max((MAX_TILE_ROWS * MAX_TILE_COLUMNS) as u32 - 1)?;
                hdr.delta_tile_id_minus1 = (0..=hdr.num_remaining_tiles_in_slice_minus1)
                    .map(|_| r.read_ue())
                    .collect::<std::result::Result<Vec<_>, _>>()?;
            }
        }

        let slice_type: u8 = r.read_ue_max(SliceType::I as u32)?;
        hdr.slice_type = SliceType::n(slice_type)
            .ok_or_else(|| Error::InvalidData(format!("Invalid slice type {}", slice_type)))?;

        if is_idr {
            hdr.no_output_of_prior_pics_flag = r.read_bit()?;
        }

        if sps.sps_mmvd_flag && (hdr.slice_type.is_b() || hdr.slice_type.is_p()) {
            hdr.mmvd_group_enable_flag = r.read_bit()?;
        }

        if sps.sps_alf_flag {
            Parser::parse_alf(&mut r, &mut hdr, sps.chroma_array_type())?;
        }

        if !is_idr && sps.sps_pocs_flag {
            hdr.slice_pic_order_cnt_lsb =
                r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;
        }

        self.slice_headers.remove(&pps_id);
        Ok(self.slice_headers.entry(pps_id).or_insert(hdr))
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Sps> {
        self.active_spses.get(&sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Pps> {
        self.active_ppses.get(&pps_id)
    }

    /// The last slice header parsed against `pps_id`.
    pub fn get_slice_header(&self, pps_id: u8) -> Option<&SliceHeader> {
        self.slice_headers.get(&pps_id)
    }
}
