// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `MaxDpbMbs` per level (Table A-1 of the standard) and the Dpb-size /
//! reorder-frame derivation built on top of it.

use crate::parser::Sps;

/// `(level_idc, max_dpb_mbs)`, Table A-1. `level_idc` is the raw SPS field
/// (level 1b is signaled as level_idc 11 with constraint_set3_flag set; the
/// lookup below special-cases it).
const LEVEL_LIMITS: &[(u8, u32)] = &[
    (10, 396),
    (11, 900),
    (12, 2376),
    (13, 2376),
    (20, 2376),
    (21, 4752),
    (22, 8100),
    (30, 8100),
    (31, 18000),
    (32, 20480),
    (40, 32768),
    (41, 32768),
    (42, 34816),
    (50, 110400),
    (51, 184320),
    (52, 184320),
    (60, 696320),
    (61, 696320),
    (62, 696320),
];

/// Level 1b's `max_dpb_mbs`. A.3.1/A.3.2: for the Baseline, Constrained
/// Baseline and Main profiles, `level_idc == 11` with `constraint_set3_flag`
/// set signals level 1b.
const LEVEL_1B_MAX_DPB_MBS: u32 = 396;

fn max_dpb_mbs(sps: &Sps) -> u32 {
    if sps.level_idc == 11 && matches!(sps.profile_idc, 66 | 77) && sps.constraint_set3_flag {
        return LEVEL_1B_MAX_DPB_MBS;
    }
    LEVEL_LIMITS
        .iter()
        .find(|&&(level, _)| level == sps.level_idc)
        .map(|&(_, mbs)| mbs)
        .unwrap_or(LEVEL_LIMITS.last().unwrap().1)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DpbSizing {
    pub max_dpb_size: usize,
    pub max_num_reorder_frames: usize,
}

/// Profiles for which `constraint_set3_flag` implies
/// `max_num_reorder_frames = 0` when no VUI override is present.
const NON_B_PROFILES: &[u8] = &[44, 86, 100, 110, 122, 244];

/// Baseline-family profiles where, absent strict compliance, reordering is
/// assumed impossible.
const BASELINE_PROFILES: &[u8] = &[66, 83];

pub fn derive_dpb_sizing(sps: &Sps, strict_compliance: bool) -> DpbSizing {
    let mbs = max_dpb_mbs(sps);
    let coded = sps.coded_resolution();
    let frame_mbs = (coded.width_in_mbs() * coded.height_in_mbs()).max(1);

    let mut max_dpb_frames = ((mbs / frame_mbs) as usize).min(16);
    // The bitstream-restriction info, when present, overrides the level
    // derivation outright.
    if let Some(restriction_buffering) = sps.max_dec_frame_buffering() {
        max_dpb_frames = (restriction_buffering as usize).max(1);
    }

    let max_dpb_size = max_dpb_frames.max(sps.max_num_ref_frames as usize).min(16);

    let max_num_reorder_frames = if let Some(n) = sps.num_reorder_frames() {
        (n as usize).min(max_dpb_size)
    } else if sps.constraint_set3_flag && NON_B_PROFILES.contains(&sps.profile_idc) {
        0
    } else if !strict_compliance && BASELINE_PROFILES.contains(&sps.profile_idc) {
        0
    } else {
        max_dpb_size
    };

    DpbSizing { max_dpb_size, max_num_reorder_frames }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sps_with(level_idc: u8, profile_idc: u8, width_mbs_minus1: u32, height_map_units_minus1: u32) -> Sps {
        Sps {
            sps_id: 0,
            profile_idc,
            constraint_set3_flag: false,
            level_idc,
            chroma_format_idc: 1,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            delta_pic_order_always_zero_flag: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            offset_for_ref_frame: Vec::new(),
            max_num_ref_frames: 4,
            gaps_in_frame_num_value_allowed_flag: false,
            pic_width_in_mbs_minus1: width_mbs_minus1,
            pic_height_in_map_units_minus1: height_map_units_minus1,
            frame_mbs_only_flag: true,
            mb_adaptive_frame_field_flag: false,
            frame_crop_left_offset: 0,
            frame_crop_right_offset: 0,
            frame_crop_top_offset: 0,
            frame_crop_bottom_offset: 0,
            vui_parameters_present_flag: false,
            bitstream_restriction: None,
        }
    }

    #[test]
    fn level_31_cif_sized_picture() {
        // 352x288 -> 22x18 mbs = 396 mbs/frame. Level 3.1 max_dpb_mbs=18000.
        let sps = sps_with(31, 66, 21, 17);
        let sizing = derive_dpb_sizing(&sps, true);
        assert_eq!(sizing.max_dpb_size, (18000 / 396).min(16));
    }

    #[test]
    fn baseline_non_strict_has_zero_reorder_frames() {
        let sps = sps_with(30, 66, 10, 8);
        let sizing = derive_dpb_sizing(&sps, false);
        assert_eq!(sizing.max_num_reorder_frames, 0);
    }

    #[test]
    fn baseline_strict_compliance_keeps_full_reorder_window() {
        let sps = sps_with(30, 66, 10, 8);
        let sizing = derive_dpb_sizing(&sps, true);
        assert_eq!(sizing.max_num_reorder_frames, sizing.max_dpb_size);
    }
}
