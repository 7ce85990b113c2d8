// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture-order-count computation (8.2.1 of the standard), one branch per
//! `pic_order_cnt_type`.

use crate::decoders::h264::picture::Field;
use crate::decoders::h264::picture::H264Picture;
use crate::error::DecoderError;
use crate::parser::Sps;

/// Running POC state carried across pictures. The reference-only half
/// (`prev_ref_*`) feeds type-0 computation, the unconditional half feeds the
/// `frame_num_offset` derivation of types 1 and 2. Updated only by
/// [`PocCalculator::update_from_finished`], which the driver calls after
/// reference marking so that an MMCO-5 POC reset is already reflected in the
/// values recorded here.
#[derive(Default, Clone, Copy)]
struct PocState {
    prev_ref_has_mmco5: bool,
    prev_ref_top_field_order_cnt: i32,
    prev_ref_pic_order_cnt_msb: i32,
    prev_ref_pic_order_cnt_lsb: i32,
    prev_ref_field: Field,

    prev_frame_num: i32,
    prev_frame_num_offset: i32,
    prev_has_mmco5: bool,
}

#[derive(Default)]
pub struct PocCalculator {
    state: PocState,
}

impl PocCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes and assigns `top_field_order_cnt`, `bottom_field_order_cnt`
    /// and the effective `pic_order_cnt` on `picture`, per the branch named
    /// by `sps.pic_order_cnt_type`. Must be called once per picture, after
    /// its slice-header-derived POC inputs have been populated and before it
    /// is inserted into the Dpb.
    pub fn compute<B>(&mut self, picture: &mut H264Picture<B>, sps: &Sps) -> Result<(), DecoderError> {
        match sps.pic_order_cnt_type {
            0 => self.compute_type0(picture, sps)?,
            1 => self.compute_type1(picture, sps)?,
            2 => self.compute_type2(picture, sps)?,
            other => {
                return Err(DecoderError::UnsupportedStream(format!(
                    "unsupported pic_order_cnt_type {}",
                    other
                )))
            }
        }

        picture.data.pic_order_cnt = match picture.data.field {
            Field::Frame => picture.data.top_field_order_cnt.min(picture.data.bottom_field_order_cnt),
            Field::Top => picture.data.top_field_order_cnt,
            Field::Bottom => picture.data.bottom_field_order_cnt,
        };

        Ok(())
    }

    /// Advances the running state from a picture that has completed its
    /// reference-marking process. MMCO-5 adjustments have already been
    /// applied to the picture's POC fields and `frame_num` at that point,
    /// which is exactly what must be recorded.
    pub fn update_from_finished<B>(&mut self, picture: &H264Picture<B>) {
        if picture.is_ref() {
            self.state.prev_ref_has_mmco5 = picture.data.mem_mgmt_5;
            self.state.prev_ref_top_field_order_cnt = picture.data.top_field_order_cnt;
            self.state.prev_ref_pic_order_cnt_msb = picture.data.pic_order_cnt_msb;
            self.state.prev_ref_pic_order_cnt_lsb = picture.data.pic_order_cnt_lsb;
            self.state.prev_ref_field = picture.data.field;
        }

        self.state.prev_frame_num = picture.data.frame_num;
        self.state.prev_frame_num_offset = picture.data.frame_num_offset;
        self.state.prev_has_mmco5 = picture.data.mem_mgmt_5;
    }

    // 8.2.1.1
    fn compute_type0<B>(&mut self, picture: &mut H264Picture<B>, sps: &Sps) -> Result<(), DecoderError> {
        let max_poc_lsb = sps.max_pic_order_cnt_lsb();

        let (prev_msb, prev_lsb) = if picture.data.idr {
            (0, 0)
        } else if self.state.prev_ref_has_mmco5 {
            if self.state.prev_ref_field != Field::Bottom {
                (0, self.state.prev_ref_top_field_order_cnt)
            } else {
                (0, 0)
            }
        } else {
            (self.state.prev_ref_pic_order_cnt_msb, self.state.prev_ref_pic_order_cnt_lsb)
        };

        let lsb = picture.data.pic_order_cnt_lsb;
        let msb = if lsb < prev_lsb && (prev_lsb - lsb) >= max_poc_lsb / 2 {
            prev_msb + max_poc_lsb
        } else if lsb > prev_lsb && (lsb - prev_lsb) > max_poc_lsb / 2 {
            prev_msb - max_poc_lsb
        } else {
            prev_msb
        };
        picture.data.pic_order_cnt_msb = msb;

        match picture.data.field {
            Field::Frame => {
                picture.data.top_field_order_cnt = msb + lsb;
                picture.data.bottom_field_order_cnt =
                    picture.data.top_field_order_cnt + picture.data.delta_pic_order_cnt_bottom;
            }
            Field::Top => {
                picture.data.top_field_order_cnt = msb + lsb;
            }
            Field::Bottom => {
                picture.data.bottom_field_order_cnt = msb + lsb;
            }
        }

        Ok(())
    }

    // 8.2.1.2
    fn compute_type1<B>(&mut self, picture: &mut H264Picture<B>, sps: &Sps) -> Result<(), DecoderError> {
        let num_ref_frames_in_cycle = sps.offset_for_ref_frame.len() as i32;
        if num_ref_frames_in_cycle == 0 {
            return Err(DecoderError::UnsupportedStream(
                "pic_order_cnt_type 1 with num_ref_frames_in_pic_order_cnt_cycle == 0".into(),
            ));
        }

        let prev_frame_num_offset = if self.state.prev_has_mmco5 { 0 } else { self.state.prev_frame_num_offset };

        let frame_num_offset = if picture.data.idr {
            0
        } else if self.state.prev_frame_num > picture.data.frame_num {
            prev_frame_num_offset + sps.max_frame_num()
        } else {
            prev_frame_num_offset
        };
        picture.data.frame_num_offset = frame_num_offset;

        let mut abs_frame_num = frame_num_offset + picture.data.frame_num;
        if picture.data.nal_ref_idc == 0 && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        let mut expected_poc = 0i32;
        if abs_frame_num > 0 {
            let poc_cycle_cnt = (abs_frame_num - 1) / num_ref_frames_in_cycle;
            let frame_num_in_cycle = (abs_frame_num - 1) % num_ref_frames_in_cycle;
            let expected_delta_per_cycle: i32 = sps.offset_for_ref_frame.iter().sum();

            expected_poc = poc_cycle_cnt * expected_delta_per_cycle;
            for i in 0..=frame_num_in_cycle {
                expected_poc += sps.offset_for_ref_frame[i as usize];
            }
        }
        if picture.data.nal_ref_idc == 0 {
            expected_poc += sps.offset_for_non_ref_pic;
        }

        match picture.data.field {
            Field::Frame => {
                picture.data.top_field_order_cnt = expected_poc + picture.data.delta_pic_order_cnt[0];
                picture.data.bottom_field_order_cnt = picture.data.top_field_order_cnt
                    + sps.offset_for_top_to_bottom_field
                    + picture.data.delta_pic_order_cnt[1];
            }
            Field::Top => {
                picture.data.top_field_order_cnt = expected_poc + picture.data.delta_pic_order_cnt[0];
            }
            Field::Bottom => {
                picture.data.bottom_field_order_cnt = expected_poc
                    + sps.offset_for_top_to_bottom_field
                    + picture.data.delta_pic_order_cnt[0];
            }
        }

        Ok(())
    }

    // 8.2.1.3
    fn compute_type2<B>(&mut self, picture: &mut H264Picture<B>, sps: &Sps) -> Result<(), DecoderError> {
        let prev_frame_num_offset = if self.state.prev_has_mmco5 { 0 } else { self.state.prev_frame_num_offset };

        let frame_num_offset = if picture.data.idr {
            0
        } else if self.state.prev_frame_num > picture.data.frame_num {
            prev_frame_num_offset + sps.max_frame_num()
        } else {
            prev_frame_num_offset
        };
        picture.data.frame_num_offset = frame_num_offset;

        let temp_poc = if picture.data.idr {
            0
        } else if picture.data.nal_ref_idc == 0 {
            2 * (frame_num_offset + picture.data.frame_num) - 1
        } else {
            2 * (frame_num_offset + picture.data.frame_num)
        };

        match picture.data.field {
            Field::Frame => {
                picture.data.top_field_order_cnt = temp_poc;
                picture.data.bottom_field_order_cnt = temp_poc;
            }
            Field::Top => {
                picture.data.top_field_order_cnt = temp_poc;
            }
            Field::Bottom => {
                picture.data.bottom_field_order_cnt = temp_poc;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SliceType;

    fn sps_type(pic_order_cnt_type: u8) -> Sps {
        Sps {
            pic_order_cnt_type,
            log2_max_frame_num_minus4: 4,
            log2_max_pic_order_cnt_lsb_minus4: 2,
            offset_for_ref_frame: vec![2, 2],
            max_num_ref_frames: 2,
            pic_width_in_mbs_minus1: 10,
            pic_height_in_map_units_minus1: 8,
            frame_mbs_only_flag: true,
            chroma_format_idc: 1,
            profile_idc: 66,
            level_idc: 30,
            ..Default::default()
        }
    }

    fn picture(idr: bool, frame_num: i32, lsb: i32, nal_ref_idc: u8) -> H264Picture<()> {
        let mut pic: H264Picture<()> = H264Picture::new();
        pic.data.idr = idr;
        pic.data.frame_num = frame_num;
        pic.data.pic_order_cnt_lsb = lsb;
        pic.data.nal_ref_idc = nal_ref_idc;
        if nal_ref_idc != 0 {
            pic.set_reference(crate::decoders::h264::picture::Reference::ShortTerm, false);
        }
        pic.data.type_ = SliceType::I;
        pic
    }

    #[test]
    fn type0_idr_resets_poc_to_lsb() {
        let sps = sps_type(0);
        let mut calc = PocCalculator::new();
        let mut pic = picture(true, 0, 0, 1);
        calc.compute(&mut pic, &sps).unwrap();
        assert_eq!(pic.data.pic_order_cnt, 0);
    }

    #[test]
    fn type0_wraps_msb_on_lsb_rollover() {
        let sps = sps_type(0); // max_pic_order_cnt_lsb = 64
        let mut calc = PocCalculator::new();
        for (frame_num, lsb, expected) in [(0, 0, 0), (1, 24, 24), (2, 48, 48)] {
            let mut pic = picture(frame_num == 0, frame_num, lsb, 1);
            calc.compute(&mut pic, &sps).unwrap();
            calc.update_from_finished(&pic);
            assert_eq!(pic.data.pic_order_cnt, expected);
        }

        // lsb falls from 48 to 8 by more than half the range: the msb wraps
        // forward.
        let mut wrapped = picture(false, 3, 8, 1);
        calc.compute(&mut wrapped, &sps).unwrap();
        assert_eq!(wrapped.data.pic_order_cnt, 72);
    }

    #[test]
    fn type0_mmco5_reset_carries_adjusted_state() {
        let sps = sps_type(0);
        let mut calc = PocCalculator::new();

        let mut idr = picture(true, 0, 0, 1);
        calc.compute(&mut idr, &sps).unwrap();
        calc.update_from_finished(&idr);

        let mut p = picture(false, 1, 4, 1);
        calc.compute(&mut p, &sps).unwrap();
        assert_eq!(p.data.pic_order_cnt, 4);
        // MMCO-5 zeroes the POC fields before state update.
        p.data.mem_mgmt_5 = true;
        p.data.top_field_order_cnt = 0;
        p.data.bottom_field_order_cnt = 0;
        p.data.pic_order_cnt = 0;
        p.data.frame_num = 0;
        calc.update_from_finished(&p);

        // The next reference picture computes POC relative to the reset.
        let mut next = picture(false, 1, 2, 1);
        calc.compute(&mut next, &sps).unwrap();
        assert_eq!(next.data.pic_order_cnt, 2);
    }

    #[test]
    fn type2_non_ref_gets_odd_temp_poc() {
        let sps = sps_type(2);
        let mut calc = PocCalculator::new();
        let mut idr = picture(true, 0, 0, 1);
        calc.compute(&mut idr, &sps).unwrap();
        calc.update_from_finished(&idr);
        assert_eq!(idr.data.pic_order_cnt, 0);

        let mut b = picture(false, 1, 0, 0);
        calc.compute(&mut b, &sps).unwrap();
        assert_eq!(b.data.pic_order_cnt, 1);
    }

    #[test]
    fn type1_rejects_empty_ref_frame_cycle() {
        let mut sps = sps_type(1);
        sps.offset_for_ref_frame.clear();
        let mut calc = PocCalculator::new();
        let mut pic = picture(false, 1, 0, 1);
        assert!(calc.compute(&mut pic, &sps).is_err());
    }

    #[test]
    fn type1_expected_poc_walks_ref_frame_cycle() {
        let sps = sps_type(1); // offsets [2, 2]
        let mut calc = PocCalculator::new();

        let mut idr = picture(true, 0, 0, 1);
        calc.compute(&mut idr, &sps).unwrap();
        calc.update_from_finished(&idr);
        assert_eq!(idr.data.pic_order_cnt, 0);

        let mut p1 = picture(false, 1, 0, 1);
        calc.compute(&mut p1, &sps).unwrap();
        calc.update_from_finished(&p1);
        assert_eq!(p1.data.pic_order_cnt, 2);

        let mut p2 = picture(false, 2, 0, 1);
        calc.compute(&mut p2, &sps).unwrap();
        assert_eq!(p2.data.pic_order_cnt, 4);
    }
}
