// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference-picture list construction (8.2.4.2) and per-slice list
//! modification (8.2.4.3).

use std::cmp::Reverse;
use std::rc::Rc;

use log::warn;

use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::picture::Field;
use crate::decoders::h264::picture::H264Picture;
use crate::decoders::h264::picture::PictureHandle;
use crate::decoders::h264::picture::Reference;
use crate::parser::RefPicListModification;

/// A reference list as handed to the back end. Slots can be empty when
/// `num_ref_idx_lX_active_minus1` asks for more references than the Dpb can
/// provide; back ends must treat an empty slot as non-reference.
pub type RefList<B> = Vec<Option<PictureHandle<B>>>;

#[derive(Default)]
pub struct RefListBuilder;

impl RefListBuilder {
    pub fn new() -> Self {
        Self
    }

    /// The initial (pre-modification) P/SP list 0 for `current`.
    pub fn build_ref_pic_list_p<B>(&self, dpb: &Dpb<B>, current: &H264Picture<B>) -> Vec<PictureHandle<B>> {
        if current.data.field == Field::Frame {
            // 8.2.4.2.1: short-term by descending pic_num, then long-term by
            // ascending long_term_pic_num.
            let mut list: Vec<PictureHandle<B>> = Vec::new();
            dpb.get_short_term_ref(false, false, &mut list);
            list.sort_by_key(|p| Reverse(p.borrow().data.pic_num));

            let mut long: Vec<PictureHandle<B>> = Vec::new();
            dpb.get_long_term_ref(false, &mut long);
            long.sort_by_key(|p| p.borrow().data.long_term_pic_num);

            list.extend(long);
            list
        } else {
            // 8.2.4.2.2: frame-level lists by descending frame_num_wrap /
            // ascending long_term_frame_idx, then the 8.2.4.2.5 parity
            // interleave.
            let mut frame_short: Vec<PictureHandle<B>> = Vec::new();
            dpb.get_short_term_ref(false, true, &mut frame_short);
            frame_short.sort_by_key(|p| Reverse(p.borrow().data.frame_num_wrap));

            let mut frame_long: Vec<PictureHandle<B>> = Vec::new();
            dpb.get_long_term_ref(true, &mut frame_long);
            frame_long.sort_by_key(|p| p.borrow().data.long_term_frame_idx);

            let mut list = Vec::with_capacity(frame_short.len() + frame_long.len());
            interleave_fields(current.data.field, &frame_short, &mut list);
            interleave_fields(current.data.field, &frame_long, &mut list);
            list
        }
    }

    /// The initial B lists 0 and 1 for `current`.
    pub fn build_ref_pic_lists_b<B>(
        &self,
        dpb: &Dpb<B>,
        current: &H264Picture<B>,
    ) -> (Vec<PictureHandle<B>>, Vec<PictureHandle<B>>) {
        // 8.2.4.2.3: under POC type 0, non-existing pictures never enter a
        // B list.
        let include_nonexisting = current.data.pic_order_cnt_type != 0;
        let cur_poc = current.data.pic_order_cnt;

        if current.data.field == Field::Frame {
            let mut short: Vec<PictureHandle<B>> = Vec::new();
            dpb.get_short_term_ref(include_nonexisting, false, &mut short);
            let (part0_first, part0_second, part1_first, part1_second) = split_b_halves(&short, cur_poc);

            let mut long: Vec<PictureHandle<B>> = Vec::new();
            dpb.get_long_term_ref(false, &mut long);
            long.sort_by_key(|p| p.borrow().data.long_term_pic_num);

            let mut list0 = part0_first;
            list0.extend(part0_second);
            list0.extend(long.iter().cloned());

            let mut list1 = part1_first;
            list1.extend(part1_second);
            list1.extend(long);

            if list1.len() > 1 && lists_equal(&list0, &list1) {
                list1.swap(0, 1);
            }

            (list0, list1)
        } else {
            let mut short: Vec<PictureHandle<B>> = Vec::new();
            dpb.get_short_term_ref(include_nonexisting, true, &mut short);
            let (frame0_first, frame0_second, frame1_first, frame1_second) = split_b_halves(&short, cur_poc);

            let mut frame_list0 = frame0_first;
            frame_list0.extend(frame0_second);
            let mut frame_list1 = frame1_first;
            frame_list1.extend(frame1_second);

            let mut frame_long: Vec<PictureHandle<B>> = Vec::new();
            dpb.get_long_term_ref(true, &mut frame_long);
            frame_long.sort_by_key(|p| p.borrow().data.long_term_frame_idx);

            let mut list0 = Vec::with_capacity(frame_list0.len() + frame_long.len());
            interleave_fields(current.data.field, &frame_list0, &mut list0);
            interleave_fields(current.data.field, &frame_long, &mut list0);

            let mut list1 = Vec::with_capacity(frame_list1.len() + frame_long.len());
            interleave_fields(current.data.field, &frame_list1, &mut list1);
            interleave_fields(current.data.field, &frame_long, &mut list1);

            if list1.len() > 1 && lists_equal(&list0, &list1) {
                list1.swap(0, 1);
            }

            (list0, list1)
        }
    }

    /// 8.2.4.3: applies one list's `ref_pic_list_modification()` commands.
    /// The working list is transiently one entry longer than the requested
    /// length; it is trimmed back before returning.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_modifications<B>(
        &self,
        dpb: &Dpb<B>,
        current: &H264Picture<B>,
        initial: &[PictureHandle<B>],
        modification_flag: bool,
        modifications: &[RefPicListModification],
        num_ref_idx_active_minus1: usize,
        max_pic_num: i32,
        max_long_term_frame_idx: i32,
    ) -> RefList<B> {
        let mut working: RefList<B> = initial.iter().cloned().map(Some).collect();

        // 8.2.4.2: num_ref_idx_lX_active_minus1 may exceed the number of
        // constructed references; superfluous slots stay empty.
        if working.len() > num_ref_idx_active_minus1 + 1 {
            working.truncate(num_ref_idx_active_minus1 + 1);
        }

        if !modification_flag {
            return working;
        }

        let mut pic_num_pred = current.data.pic_num;
        let mut ref_idx = 0usize;

        for modification in modifications {
            if ref_idx > num_ref_idx_active_minus1 + 1 {
                warn!("more list modifications than active references, ignoring the rest");
                break;
            }
            match *modification {
                RefPicListModification::ShortTermSubtract { abs_diff_pic_num_minus1 }
                | RefPicListModification::ShortTermAdd { abs_diff_pic_num_minus1 } => {
                    let diff = abs_diff_pic_num_minus1 as i32 + 1;
                    // 8-34 / 8-35
                    let no_wrap = match modification {
                        RefPicListModification::ShortTermSubtract { .. } => {
                            let v = pic_num_pred - diff;
                            if v < 0 {
                                v + max_pic_num
                            } else {
                                v
                            }
                        }
                        _ => {
                            let v = pic_num_pred + diff;
                            if v >= max_pic_num {
                                v - max_pic_num
                            } else {
                                v
                            }
                        }
                    };
                    pic_num_pred = no_wrap;

                    // 8-36
                    let pic_num = if no_wrap > current.data.pic_num { no_wrap - max_pic_num } else { no_wrap };

                    // 8-37
                    let Some(pic) = dpb.get_short_ref_by_pic_num(pic_num) else {
                        warn!("malformed stream: no short-term reference with pic_num {}", pic_num);
                        continue;
                    };
                    shift_right_and_insert(&mut working, ref_idx, num_ref_idx_active_minus1, pic);
                    ref_idx += 1;
                    compact_duplicates(&mut working, ref_idx, num_ref_idx_active_minus1, |p| {
                        pic_num_f(p, max_pic_num) == pic_num
                    });
                }
                RefPicListModification::LongTerm { long_term_pic_num } => {
                    // 8-28
                    let Some(pic) = dpb.get_long_ref_by_long_term_pic_num(long_term_pic_num as i32) else {
                        warn!(
                            "malformed stream: no long-term reference with long_term_pic_num {}",
                            long_term_pic_num
                        );
                        continue;
                    };
                    shift_right_and_insert(&mut working, ref_idx, num_ref_idx_active_minus1, pic);
                    ref_idx += 1;
                    compact_duplicates(&mut working, ref_idx, num_ref_idx_active_minus1, |p| {
                        long_term_pic_num_f(p, max_long_term_frame_idx) == long_term_pic_num as i32
                    });
                }
            }
        }

        if working.len() > num_ref_idx_active_minus1 + 1 {
            working.truncate(num_ref_idx_active_minus1 + 1);
        }
        working
    }
}

/// `PicNumF` (8-32): short-term references expose their pic_num, anything
/// else a sentinel that can never match.
fn pic_num_f<B>(picture: &PictureHandle<B>, max_pic_num: i32) -> i32 {
    let p = picture.borrow();
    if p.reference() == Reference::ShortTerm {
        p.data.pic_num
    } else {
        max_pic_num
    }
}

/// `LongTermPicNumF` (8-33).
fn long_term_pic_num_f<B>(picture: &PictureHandle<B>, max_long_term_frame_idx: i32) -> i32 {
    let p = picture.borrow();
    if p.reference() == Reference::LongTerm {
        p.data.long_term_pic_num
    } else {
        2 * (max_long_term_frame_idx + 1)
    }
}

/// Pads or trims the working list to `num_ref_idx_active_minus1 + 1`
/// entries, then inserts `picture` at `ref_idx`, shifting the tail right.
fn shift_right_and_insert<B>(
    working: &mut RefList<B>,
    ref_idx: usize,
    num_ref_idx_active_minus1: usize,
    picture: PictureHandle<B>,
) {
    working.resize(num_ref_idx_active_minus1 + 2, None);
    working.insert(ref_idx, Some(picture));
}

/// The compaction half of 8.2.4.3.1/8.2.4.3.2: starting right after the
/// freshly inserted entry, keep only entries whose identity differs from the
/// inserted picture's, writing survivors forward.
fn compact_duplicates<B>(
    working: &mut RefList<B>,
    ref_idx: usize,
    num_ref_idx_active_minus1: usize,
    matches: impl Fn(&PictureHandle<B>) -> bool,
) {
    let mut dst = ref_idx;
    for src in ref_idx..=num_ref_idx_active_minus1 + 1 {
        let entry = working[src].clone();
        let is_duplicate = entry.as_ref().map(|p| matches(p)).unwrap_or(false);
        if !is_duplicate {
            working[dst] = entry;
            dst += 1;
        }
    }
}

/// Splits short-term references into the two POC-ordered halves of the
/// initial B lists: list 0 starts at-or-below the current POC descending and
/// continues above it ascending; list 1 swaps the precedence.
fn split_b_halves<B>(
    short: &[PictureHandle<B>],
    cur_poc: i32,
) -> (
    Vec<PictureHandle<B>>,
    Vec<PictureHandle<B>>,
    Vec<PictureHandle<B>>,
    Vec<PictureHandle<B>>,
) {
    let mut list0_first: Vec<PictureHandle<B>> =
        short.iter().filter(|p| p.borrow().data.pic_order_cnt <= cur_poc).cloned().collect();
    list0_first.sort_by_key(|p| Reverse(p.borrow().data.pic_order_cnt));

    let mut list0_second: Vec<PictureHandle<B>> =
        short.iter().filter(|p| p.borrow().data.pic_order_cnt > cur_poc).cloned().collect();
    list0_second.sort_by_key(|p| p.borrow().data.pic_order_cnt);

    let mut list1_first: Vec<PictureHandle<B>> =
        short.iter().filter(|p| p.borrow().data.pic_order_cnt >= cur_poc).cloned().collect();
    list1_first.sort_by_key(|p| p.borrow().data.pic_order_cnt);

    let mut list1_second: Vec<PictureHandle<B>> =
        short.iter().filter(|p| p.borrow().data.pic_order_cnt < cur_poc).cloned().collect();
    list1_second.sort_by_key(|p| Reverse(p.borrow().data.pic_order_cnt));

    (list0_first, list0_second, list1_first, list1_second)
}

fn lists_equal<B>(a: &[PictureHandle<B>], b: &[PictureHandle<B>]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| Rc::ptr_eq(x, y))
}

/// 8.2.4.2.5: walks a frame-level reference list with two independent
/// cursors, alternating the next field of the current picture's parity with
/// the next field of the opposite parity until both are exhausted.
fn interleave_fields<B>(field: Field, frame_list: &[PictureHandle<B>], out: &mut Vec<PictureHandle<B>>) {
    let mut same = 0usize;
    let mut opposite = 0usize;

    loop {
        while same < frame_list.len() {
            let candidate = &frame_list[same];
            same += 1;
            if candidate.borrow().data.field == field {
                out.push(candidate.clone());
                break;
            }
        }

        while opposite < frame_list.len() {
            let candidate = &frame_list[opposite];
            opposite += 1;
            if candidate.borrow().data.field != field {
                out.push(candidate.clone());
                break;
            }
        }

        if same >= frame_list.len() && opposite >= frame_list.len() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn make_short_ref(pic_num: i32, poc: i32) -> PictureHandle<()> {
        let mut pic: H264Picture<()> = H264Picture::new();
        pic.data.pic_num = pic_num;
        pic.data.pic_order_cnt = poc;
        pic.data.needed_for_output = true;
        pic.set_reference(Reference::ShortTerm, false);
        Rc::new(RefCell::new(pic))
    }

    fn make_long_ref(long_term_pic_num: i32, poc: i32) -> PictureHandle<()> {
        let mut pic: H264Picture<()> = H264Picture::new();
        pic.data.long_term_pic_num = long_term_pic_num;
        pic.data.pic_order_cnt = poc;
        pic.data.needed_for_output = true;
        pic.set_reference(Reference::LongTerm, false);
        Rc::new(RefCell::new(pic))
    }

    fn dpb_of(pictures: Vec<PictureHandle<()>>) -> Dpb<()> {
        let mut dpb: Dpb<()> = Dpb::new();
        dpb.set_max_num_frames(16);
        for p in pictures {
            dpb.add(p);
        }
        dpb
    }

    #[test]
    fn p_list_short_term_desc_then_long_term_asc() {
        let dpb = dpb_of(vec![make_short_ref(1, 0), make_short_ref(3, 2), make_long_ref(0, 4), make_short_ref(2, 6)]);
        let current: H264Picture<()> = H264Picture::new();
        let list = RefListBuilder::new().build_ref_pic_list_p(&dpb, &current);
        let keys: Vec<(bool, i32)> = list
            .iter()
            .map(|p| {
                let p = p.borrow();
                (p.reference() == Reference::LongTerm, if p.reference() == Reference::LongTerm { p.data.long_term_pic_num } else { p.data.pic_num })
            })
            .collect();
        assert_eq!(keys, vec![(false, 3), (false, 2), (false, 1), (true, 0)]);
    }

    #[test]
    fn b_lists_split_around_current_poc() {
        let dpb = dpb_of(vec![make_short_ref(0, 0), make_short_ref(1, 4), make_short_ref(2, 8)]);
        let mut current: H264Picture<()> = H264Picture::new();
        current.data.pic_order_cnt = 6;

        let (list0, list1) = RefListBuilder::new().build_ref_pic_lists_b(&dpb, &current);
        let pocs0: Vec<i32> = list0.iter().map(|p| p.borrow().data.pic_order_cnt).collect();
        let pocs1: Vec<i32> = list1.iter().map(|p| p.borrow().data.pic_order_cnt).collect();
        assert_eq!(pocs0, vec![4, 0, 8]);
        assert_eq!(pocs1, vec![8, 4, 0]);
    }

    #[test]
    fn identical_b_lists_swap_first_two_entries_of_list1() {
        let dpb = dpb_of(vec![make_short_ref(0, 0), make_short_ref(1, 2)]);
        let mut current: H264Picture<()> = H264Picture::new();
        current.data.pic_order_cnt = 6;

        let (list0, list1) = RefListBuilder::new().build_ref_pic_lists_b(&dpb, &current);
        assert!(Rc::ptr_eq(&list0[0], &list1[1]));
        assert!(Rc::ptr_eq(&list0[1], &list1[0]));
    }

    #[test]
    fn modification_moves_short_term_to_front_and_dedups() {
        let p1 = make_short_ref(1, 0);
        let p2 = make_short_ref(2, 2);
        let p3 = make_short_ref(3, 4);
        let dpb = dpb_of(vec![p1.clone(), p2.clone(), p3.clone()]);

        let mut current: H264Picture<()> = H264Picture::new();
        current.data.pic_num = 4;

        // Initial P list is [3, 2, 1]; move pic_num 1 to the front.
        let initial = RefListBuilder::new().build_ref_pic_list_p(&dpb, &current);
        let modified = RefListBuilder::new().apply_modifications(
            &dpb,
            &current,
            &initial,
            true,
            &[RefPicListModification::ShortTermSubtract { abs_diff_pic_num_minus1: 2 }],
            2,
            16,
            -1,
        );

        let pic_nums: Vec<i32> = modified.iter().map(|p| p.as_ref().unwrap().borrow().data.pic_num).collect();
        assert_eq!(pic_nums, vec![1, 3, 2]);
    }

    #[test]
    fn unmodified_list_is_trimmed_to_active_count() {
        let dpb = dpb_of(vec![make_short_ref(1, 0), make_short_ref(2, 2), make_short_ref(3, 4)]);
        let mut current: H264Picture<()> = H264Picture::new();
        current.data.pic_num = 4;

        let initial = RefListBuilder::new().build_ref_pic_list_p(&dpb, &current);
        let list = RefListBuilder::new().apply_modifications(&dpb, &current, &initial, false, &[], 0, 16, -1);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].as_ref().unwrap().borrow().data.pic_num, 3);
    }

    #[test]
    fn field_interleave_alternates_parities() {
        use crate::decoders::h264::picture::Field;

        let mut top1: H264Picture<()> = H264Picture::new();
        top1.data.field = Field::Top;
        let mut bottom1: H264Picture<()> = H264Picture::new();
        bottom1.data.field = Field::Bottom;
        let mut top2: H264Picture<()> = H264Picture::new();
        top2.data.field = Field::Top;

        let frame_list = vec![
            Rc::new(RefCell::new(top1)),
            Rc::new(RefCell::new(bottom1)),
            Rc::new(RefCell::new(top2)),
        ];

        let mut out = Vec::new();
        interleave_fields(Field::Top, &frame_list, &mut out);
        let fields: Vec<Field> = out.iter().map(|p| p.borrow().data.field).collect();
        assert_eq!(fields, vec![Field::Top, Field::Bottom, Field::Top]);
    }
}
