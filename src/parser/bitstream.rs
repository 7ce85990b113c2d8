// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A real, but deliberately shallow, bit-level [`super::Parser`]. It decodes
//! exactly the SPS/PPS/slice-header fields named in [`super::types`] using
//! Exp-Golomb codes per clause 9.1 of the standard. It does not parse HRD
//! parameters, scaling lists, or anything this core does not consume.

use std::collections::HashMap;

use bitreader::BitReader;

use super::types::BitstreamRestriction;
use super::types::Mmco;
use super::types::Pps;
use super::types::RefPicListModification;
use super::types::RefPicMarking;
use super::types::SliceHeader;
use super::types::SliceType;
use super::types::Sps;
use super::Parser;
use crate::nal::NalHeader;
use crate::nal::ParseError;

/// Thin wrapper around [`BitReader`] adding the `ue(v)`/`se(v)` Exp-Golomb
/// codes that `bitreader` does not provide natively.
struct ExpGolombReader<'a> {
    inner: BitReader<'a>,
}

impl<'a> ExpGolombReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { inner: BitReader::new(data) }
    }

    fn bit(&mut self) -> Result<bool, ParseError> {
        self.inner.read_bool().map_err(|_| ParseError::BitstreamExhausted)
    }

    fn u(&mut self, bits: u8) -> Result<u32, ParseError> {
        if bits == 0 {
            return Ok(0);
        }
        self.inner.read_u32(bits).map_err(|_| ParseError::BitstreamExhausted)
    }

    /// `ue(v)`: unsigned Exp-Golomb.
    fn ue(&mut self) -> Result<u32, ParseError> {
        let mut leading_zero_bits: u32 = 0;
        while !self.bit()? {
            leading_zero_bits += 1;
            if leading_zero_bits > 32 {
                return Err(ParseError::BitstreamExhausted);
            }
        }
        if leading_zero_bits == 0 {
            return Ok(0);
        }
        let suffix = self.u(leading_zero_bits as u8)?;
        Ok((1u32 << leading_zero_bits) - 1 + suffix)
    }

    /// `se(v)`: signed Exp-Golomb.
    fn se(&mut self) -> Result<i32, ParseError> {
        let code = self.ue()? as i64;
        let value = if code % 2 == 0 { -(code / 2) } else { (code + 1) / 2 };
        Ok(value as i32)
    }

    fn flag(&mut self) -> Result<bool, ParseError> {
        self.bit()
    }
}

#[derive(Default)]
pub struct DefaultParser {
    sps_cache: HashMap<u8, Sps>,
    pps_cache: HashMap<u8, Pps>,
}

impl DefaultParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_vui(&self, r: &mut ExpGolombReader) -> Result<Option<BitstreamRestriction>, ParseError> {
        // aspect_ratio_info, overscan_info, video_signal_type, chroma_loc_info
        // and timing_info are skipped (parsed past, not interpreted) since
        // the core does not consume them.
        if r.flag()? {
            // aspect_ratio_info_present_flag
            let aspect_ratio_idc = r.u(8)?;
            if aspect_ratio_idc == 255 {
                r.u(16)?; // sar_width
                r.u(16)?; // sar_height
            }
        }
        if r.flag()? {
            // overscan_info_present_flag
            r.flag()?;
        }
        if r.flag()? {
            // video_signal_type_present_flag
            r.u(3)?;
            r.flag()?;
            if r.flag()? {
                // colour_description_present_flag
                r.u(8)?;
                r.u(8)?;
                r.u(8)?;
            }
        }
        if r.flag()? {
            // chroma_loc_info_present_flag
            r.ue()?;
            r.ue()?;
        }
        if r.flag()? {
            // timing_info_present_flag
            r.u(32)?;
            r.u(32)?;
            r.flag()?;
        }
        let nal_hrd_present = r.flag()?;
        if nal_hrd_present {
            self.skip_hrd_parameters(r)?;
        }
        let vcl_hrd_present = r.flag()?;
        if vcl_hrd_present {
            self.skip_hrd_parameters(r)?;
        }
        if nal_hrd_present || vcl_hrd_present {
            r.flag()?; // low_delay_hrd_flag
        }
        r.flag()?; // pic_struct_present_flag
        if r.flag()? {
            // bitstream_restriction_flag
            r.flag()?; // motion_vectors_over_pic_boundaries_flag
            r.ue()?; // max_bytes_per_pic_denom
            r.ue()?; // max_bits_per_mb_denom
            r.ue()?; // log2_max_mv_length_horizontal
            r.ue()?; // log2_max_mv_length_vertical
            let num_reorder_frames = r.ue()?;
            let max_dec_frame_buffering = r.ue()?;
            return Ok(Some(BitstreamRestriction { max_dec_frame_buffering, num_reorder_frames }));
        }
        Ok(None)
    }

    fn skip_hrd_parameters(&self, r: &mut ExpGolombReader) -> Result<(), ParseError> {
        let cpb_cnt_minus1 = r.ue()?;
        r.u(4)?; // bit_rate_scale
        r.u(4)?; // cpb_size_scale
        for _ in 0..=cpb_cnt_minus1 {
            r.ue()?; // bit_rate_value_minus1
            r.ue()?; // cpb_size_value_minus1
            r.flag()?; // cbr_flag
        }
        r.u(5)?; // initial_cpb_removal_delay_length_minus1
        r.u(5)?; // cpb_removal_delay_length_minus1
        r.u(5)?; // dpb_output_delay_length_minus1
        r.u(5)?; // time_offset_length
        Ok(())
    }
}

impl Parser for DefaultParser {
    fn parse_sps(&mut self, rbsp: &[u8]) -> Result<Sps, ParseError> {
        let mut r = ExpGolombReader::new(rbsp);

        let profile_idc = r.u(8)? as u8;
        let constraint_set0 = r.flag()?;
        let constraint_set1 = r.flag()?;
        let constraint_set2 = r.flag()?;
        let constraint_set3_flag = r.flag()?;
        let _ = (constraint_set0, constraint_set1, constraint_set2);
        r.u(4)?; // reserved_zero_4bits
        let level_idc = r.u(8)? as u8;
        let sps_id = r.ue()? as u8;

        let mut chroma_format_idc = 1u8;
        if matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135) {
            chroma_format_idc = r.ue()? as u8;
            if chroma_format_idc == 3 {
                r.flag()?; // separate_colour_plane_flag
            }
            r.ue()?; // bit_depth_luma_minus8
            r.ue()?; // bit_depth_chroma_minus8
            r.flag()?; // qpprime_y_zero_transform_bypass_flag
            let seq_scaling_matrix_present_flag = r.flag()?;
            if seq_scaling_matrix_present_flag {
                let count = if chroma_format_idc != 3 { 8 } else { 12 };
                for _ in 0..count {
                    if r.flag()? {
                        // scaling_list_present_flag: this core never reads
                        // scaling lists, so they are not decoded further.
                        return Err(ParseError::BitstreamExhausted);
                    }
                }
            }
        }

        let log2_max_frame_num_minus4 = r.ue()? as u8;
        let pic_order_cnt_type = r.ue()? as u8;

        let mut log2_max_pic_order_cnt_lsb_minus4 = 0;
        let mut delta_pic_order_always_zero_flag = false;
        let mut offset_for_non_ref_pic = 0;
        let mut offset_for_top_to_bottom_field = 0;
        let mut offset_for_ref_frame = Vec::new();

        match pic_order_cnt_type {
            0 => {
                log2_max_pic_order_cnt_lsb_minus4 = r.ue()? as u8;
            }
            1 => {
                delta_pic_order_always_zero_flag = r.flag()?;
                offset_for_non_ref_pic = r.se()?;
                offset_for_top_to_bottom_field = r.se()?;
                let num_ref_frames_in_pic_order_cnt_cycle = r.ue()?;
                offset_for_ref_frame.reserve(num_ref_frames_in_pic_order_cnt_cycle as usize);
                for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
                    offset_for_ref_frame.push(r.se()?);
                }
            }
            2 => {}
            other => return Err(ParseError::UnsupportedPicOrderCntType(other)),
        }

        let max_num_ref_frames = r.ue()?;
        let gaps_in_frame_num_value_allowed_flag = r.flag()?;
        let pic_width_in_mbs_minus1 = r.ue()?;
        let pic_height_in_map_units_minus1 = r.ue()?;
        let frame_mbs_only_flag = r.flag()?;
        let mb_adaptive_frame_field_flag = if !frame_mbs_only_flag { r.flag()? } else { false };
        r.flag()?; // direct_8x8_inference_flag

        let frame_cropping_flag = r.flag()?;
        let (mut left, mut right, mut top, mut bottom) = (0, 0, 0, 0);
        if frame_cropping_flag {
            left = r.ue()?;
            right = r.ue()?;
            top = r.ue()?;
            bottom = r.ue()?;
        }

        let vui_parameters_present_flag = r.flag()?;
        let bitstream_restriction = if vui_parameters_present_flag { self.parse_vui(&mut r)? } else { None };

        let sps = Sps {
            sps_id,
            profile_idc,
            constraint_set3_flag,
            level_idc,
            chroma_format_idc,
            log2_max_frame_num_minus4,
            pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb_minus4,
            delta_pic_order_always_zero_flag,
            offset_for_non_ref_pic,
            offset_for_top_to_bottom_field,
            offset_for_ref_frame,
            max_num_ref_frames,
            gaps_in_frame_num_value_allowed_flag,
            pic_width_in_mbs_minus1,
            pic_height_in_map_units_minus1,
            frame_mbs_only_flag,
            mb_adaptive_frame_field_flag,
            frame_crop_left_offset: left,
            frame_crop_right_offset: right,
            frame_crop_top_offset: top,
            frame_crop_bottom_offset: bottom,
            vui_parameters_present_flag,
            bitstream_restriction,
        };
        self.sps_cache.insert(sps.sps_id, sps.clone());
        Ok(sps)
    }

    fn parse_pps(&mut self, rbsp: &[u8]) -> Result<Pps, ParseError> {
        let mut r = ExpGolombReader::new(rbsp);
        let pps_id = r.ue()? as u8;
        let sps_id = r.ue()? as u8;
        if !self.sps_cache.contains_key(&sps_id) {
            return Err(ParseError::UnknownSpsId(sps_id));
        }
        r.flag()?; // entropy_coding_mode_flag
        r.flag()?; // bottom_field_pic_order_in_frame_present_flag
        let num_slice_groups_minus1 = r.ue()?;
        if num_slice_groups_minus1 > 0 {
            return Err(ParseError::FmoUnsupported);
        }
        let num_ref_idx_l0_default_active_minus1 = r.ue()?;
        let num_ref_idx_l1_default_active_minus1 = r.ue()?;

        let pps = Pps {
            pps_id,
            sps_id,
            num_slice_groups_minus1,
            num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_default_active_minus1,
        };
        self.pps_cache.insert(pps.pps_id, pps.clone());
        Ok(pps)
    }

    fn parse_slice_header(&mut self, rbsp: &[u8], nalu: NalHeader) -> Result<SliceHeader, ParseError> {
        let mut r = ExpGolombReader::new(rbsp);

        let first_mb_in_slice = r.ue()?;
        let slice_type =
            SliceType::from_u8(r.ue()? as u8).ok_or(ParseError::BitstreamExhausted)?;
        let pps_id = r.ue()? as u8;

        let pps = self.pps_cache.get(&pps_id).ok_or(ParseError::UnknownPpsId(pps_id))?.clone();
        let sps = self.sps_cache.get(&pps.sps_id).ok_or(ParseError::UnknownSpsId(pps.sps_id))?.clone();

        let frame_num_bits = sps.log2_max_frame_num_minus4 + 4;
        let frame_num = r.u(frame_num_bits)? as i32;

        let mut field_pic_flag = false;
        let mut bottom_field_flag = false;
        if !sps.frame_mbs_only_flag {
            field_pic_flag = r.flag()?;
            if field_pic_flag {
                bottom_field_flag = r.flag()?;
            }
        }

        let idr = nalu.is_idr();
        let mut idr_pic_id = 0;
        if idr {
            idr_pic_id = r.ue()? as u16;
        }

        let mut pic_order_cnt_lsb = 0;
        let mut delta_pic_order_cnt_bottom = 0;
        let mut delta_pic_order_cnt = [0i32; 2];
        if sps.pic_order_cnt_type == 0 {
            pic_order_cnt_lsb = r.u(sps.log2_max_pic_order_cnt_lsb_minus4 + 4)? as u16;
            delta_pic_order_cnt_bottom = r.se()?;
        } else if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            delta_pic_order_cnt[0] = r.se()?;
            if !field_pic_flag {
                delta_pic_order_cnt[1] = r.se()?;
            }
        }

        let mut num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
        let mut num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
        let num_ref_idx_active_override_flag =
            if !slice_type.is_intra() { r.flag()? } else { false };
        if num_ref_idx_active_override_flag {
            num_ref_idx_l0_active_minus1 = r.ue()?;
            if slice_type.is_b() {
                num_ref_idx_l1_active_minus1 = r.ue()?;
            }
        }

        let (ref_pic_list_modification_flag_l0, ref_pic_list_modification_l0) =
            if !slice_type.is_intra() { self.parse_ref_pic_list_modification(&mut r)? } else { (false, Vec::new()) };
        let (ref_pic_list_modification_flag_l1, ref_pic_list_modification_l1) =
            if slice_type.is_b() { self.parse_ref_pic_list_modification(&mut r)? } else { (false, Vec::new()) };

        let dec_ref_pic_marking = if nalu.nal_ref_idc != 0 {
            self.parse_dec_ref_pic_marking(&mut r, idr)?
        } else {
            RefPicMarking::default()
        };

        Ok(SliceHeader {
            first_mb_in_slice,
            slice_type,
            pps_id,
            frame_num,
            field_pic_flag,
            bottom_field_flag,
            idr_pic_id,
            pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom,
            delta_pic_order_cnt,
            num_ref_idx_active_override_flag,
            num_ref_idx_l0_active_minus1,
            num_ref_idx_l1_active_minus1,
            ref_pic_list_modification_flag_l0,
            ref_pic_list_modification_l0,
            ref_pic_list_modification_flag_l1,
            ref_pic_list_modification_l1,
            dec_ref_pic_marking,
        })
    }

    fn get_sps(&self, sps_id: u8) -> Option<&Sps> {
        self.sps_cache.get(&sps_id)
    }

    fn get_pps(&self, pps_id: u8) -> Option<&Pps> {
        self.pps_cache.get(&pps_id)
    }
}

impl DefaultParser {
    fn parse_ref_pic_list_modification(
        &self,
        r: &mut ExpGolombReader,
    ) -> Result<(bool, Vec<RefPicListModification>), ParseError> {
        let flag = r.flag()?;
        let mut modifications = Vec::new();
        if flag {
            loop {
                let idc = r.ue()?;
                match idc {
                    0 => modifications.push(RefPicListModification::ShortTermSubtract {
                        abs_diff_pic_num_minus1: r.ue()?,
                    }),
                    1 => modifications.push(RefPicListModification::ShortTermAdd {
                        abs_diff_pic_num_minus1: r.ue()?,
                    }),
                    2 => modifications.push(RefPicListModification::LongTerm {
                        long_term_pic_num: r.ue()?,
                    }),
                    3 => break,
                    _ => return Err(ParseError::BitstreamExhausted),
                }
            }
        }
        Ok((flag, modifications))
    }

    fn parse_dec_ref_pic_marking(
        &self,
        r: &mut ExpGolombReader,
        idr: bool,
    ) -> Result<RefPicMarking, ParseError> {
        if idr {
            let no_output_of_prior_pics_flag = r.flag()?;
            let long_term_reference_flag = r.flag()?;
            return Ok(RefPicMarking {
                adaptive_ref_pic_marking_mode_flag: false,
                operations: Vec::new(),
                no_output_of_prior_pics_flag,
                long_term_reference_flag,
            });
        }

        let adaptive_ref_pic_marking_mode_flag = r.flag()?;
        let mut operations = Vec::new();
        if adaptive_ref_pic_marking_mode_flag {
            loop {
                let op = r.ue()?;
                match op {
                    0 => break,
                    1 => operations.push(Mmco::UnmarkShortTerm {
                        difference_of_pic_nums_minus1: r.ue()?,
                    }),
                    2 => operations.push(Mmco::UnmarkLongTerm { long_term_pic_num: r.ue()? }),
                    3 => {
                        let difference_of_pic_nums_minus1 = r.ue()?;
                        let long_term_frame_idx = r.ue()?;
                        operations.push(Mmco::MarkLongTerm { difference_of_pic_nums_minus1, long_term_frame_idx });
                    }
                    4 => operations.push(Mmco::SetMaxLongTermFrameIdx {
                        max_long_term_frame_idx_plus1: r.ue()?,
                    }),
                    5 => operations.push(Mmco::ResetAll),
                    6 => operations.push(Mmco::MarkCurrentLongTerm { long_term_frame_idx: r.ue()? }),
                    _ => return Err(ParseError::BitstreamExhausted),
                }
            }
        }

        Ok(RefPicMarking {
            adaptive_ref_pic_marking_mode_flag,
            operations,
            no_output_of_prior_pics_flag: false,
            long_term_reference_flag: false,
        })
    }
}
