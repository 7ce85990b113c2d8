// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed records produced by a [`super::Parser`] implementation. These are
//! the fields the DPB, POC calculator, reference-list builder and driver
//! actually consume; fields this core never reads (HRD parameters, scaling
//! lists, full VUI timing info) are omitted rather than modeled, per the
//! parser's out-of-scope bitstream depth.

use crate::resolution::Rect;
use crate::resolution::Resolution;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceType {
    /// `slice_type` values 5..9 mean "all slices in this picture share this
    /// type"; both ranges collapse to the same five categories.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value % 5 {
            0 => Some(SliceType::P),
            1 => Some(SliceType::B),
            2 => Some(SliceType::I),
            3 => Some(SliceType::Sp),
            4 => Some(SliceType::Si),
            _ => None,
        }
    }

    pub fn is_b(self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_intra(self) -> bool {
        matches!(self, SliceType::I | SliceType::Si)
    }
}

impl Default for SliceType {
    fn default() -> Self {
        SliceType::I
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitstreamRestriction {
    pub max_dec_frame_buffering: u32,
    pub num_reorder_frames: u32,
}

/// Sequence Parameter Set: the fields the DPB/POC/ref-list subsystems read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sps {
    pub sps_id: u8,
    pub profile_idc: u8,
    pub constraint_set3_flag: bool,
    pub level_idc: u8,
    pub chroma_format_idc: u8,

    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offset_for_ref_frame: Vec<i32>,

    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,

    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,

    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
    pub bitstream_restriction: Option<BitstreamRestriction>,
}

impl Sps {
    pub fn max_frame_num(&self) -> i32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    pub fn interlaced(&self) -> bool {
        !self.frame_mbs_only_flag
    }

    pub fn width_in_mbs(&self) -> u32 {
        self.pic_width_in_mbs_minus1 + 1
    }

    pub fn height_in_map_units(&self) -> u32 {
        self.pic_height_in_map_units_minus1 + 1
    }

    pub fn coded_resolution(&self) -> Resolution {
        let frame_height_in_mbs = (2 - self.frame_mbs_only_flag as u32) * self.height_in_map_units();
        Resolution::new(self.width_in_mbs() * 16, frame_height_in_mbs * 16)
    }

    /// The frame cropping window (7.4.2.1.1) applied to the coded
    /// resolution: the rectangle actually meant for display.
    pub fn visible_rectangle(&self) -> Rect {
        let coded = self.coded_resolution();
        let chroma_array_type_is_monochrome_or_444 = matches!(self.chroma_format_idc, 0 | 3);
        let (sub_width_c, sub_height_c) = match self.chroma_format_idc {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };
        let crop_unit_x = if chroma_array_type_is_monochrome_or_444 { 1 } else { sub_width_c };
        let crop_unit_y = if chroma_array_type_is_monochrome_or_444 {
            2 - self.frame_mbs_only_flag as u32
        } else {
            sub_height_c * (2 - self.frame_mbs_only_flag as u32)
        };

        let left = self.frame_crop_left_offset * crop_unit_x;
        let right = self.frame_crop_right_offset * crop_unit_x;
        let top = self.frame_crop_top_offset * crop_unit_y;
        let bottom = self.frame_crop_bottom_offset * crop_unit_y;

        Rect {
            min: crate::resolution::Point { x: left, y: top },
            max: crate::resolution::Point {
                x: coded.width.saturating_sub(right),
                y: coded.height.saturating_sub(bottom),
            },
        }
    }

    /// `max_dec_frame_buffering` from the VUI bitstream-restriction info, if
    /// present.
    pub fn max_dec_frame_buffering(&self) -> Option<u32> {
        self.bitstream_restriction.as_ref().map(|r| r.max_dec_frame_buffering)
    }

    pub fn num_reorder_frames(&self) -> Option<u32> {
        self.bitstream_restriction.as_ref().map(|r| r.num_reorder_frames)
    }
}

/// Picture Parameter Set: only the fields this core cares about (slice-group
/// presence, to reject FMO, and the default active reference counts).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pps {
    pub pps_id: u8,
    pub sps_id: u8,
    pub num_slice_groups_minus1: u32,
    pub num_ref_idx_l0_default_active_minus1: u32,
    pub num_ref_idx_l1_default_active_minus1: u32,
}

/// One `modification_of_pic_nums_idc` entry from `ref_pic_list_modification()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefPicListModification {
    ShortTermSubtract { abs_diff_pic_num_minus1: u32 },
    ShortTermAdd { abs_diff_pic_num_minus1: u32 },
    LongTerm { long_term_pic_num: u32 },
}

/// One `memory_management_control_operation` entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mmco {
    /// Op 1: unmark a short-term picture.
    UnmarkShortTerm { difference_of_pic_nums_minus1: u32 },
    /// Op 2: unmark a long-term picture.
    UnmarkLongTerm { long_term_pic_num: u32 },
    /// Op 3: promote a short-term picture to long-term.
    MarkLongTerm { difference_of_pic_nums_minus1: u32, long_term_frame_idx: u32 },
    /// Op 4: set `max_long_term_frame_idx`.
    SetMaxLongTermFrameIdx { max_long_term_frame_idx_plus1: u32 },
    /// Op 5: reset the DPB, mark all references unused.
    ResetAll,
    /// Op 6: mark the current picture long-term.
    MarkCurrentLongTerm { long_term_frame_idx: u32 },
}

/// `dec_ref_pic_marking()`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub operations: Vec<Mmco>,
    /// IDR-only.
    pub no_output_of_prior_pics_flag: bool,
    /// IDR-only.
    pub long_term_reference_flag: bool,
}

/// `slice_header()`, limited to the fields the DPB/POC/ref-list subsystems
/// and the driver consume.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pps_id: u8,
    pub frame_num: i32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u16,

    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],

    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,

    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,

    pub dec_ref_pic_marking: RefPicMarking,
}

impl SliceHeader {
    /// `MaxPicNum` (7-1): doubled for field pictures, where each field
    /// counts separately.
    pub fn max_pic_num(&self, sps: &Sps) -> i32 {
        if self.field_pic_flag {
            2 * sps.max_frame_num()
        } else {
            sps.max_frame_num()
        }
    }
}
