// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoded picture buffer: insertion-ordered store, bump policy and the
//! six memory-management-control operations (8.2.5 and C.4 of the standard).

use std::rc::Rc;

use log::debug;
use log::error;
use log::trace;
use log::warn;

use crate::decoders::h264::picture::Field;
use crate::decoders::h264::picture::PictureHandle;
use crate::decoders::h264::picture::Reference;
use crate::parser::Mmco;

/// Selects how aggressively the Dpb bumps pictures to output. `Normal` is
/// the letter of C.4.5.3; the two lower-latency levels trade standard
/// conformance margins for earlier output on streams that allow it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BumpLevel {
    NormalLatency,
    LowLatency,
    VeryLowLatency,
}

pub struct Dpb<BackendHandle> {
    /// Insertion-ordered. Order is load-bearing: bump scans use position as
    /// the tie-break and `needs_bump` counts entries preceding the lowest
    /// pending picture.
    pictures: Vec<PictureHandle<BackendHandle>>,
    max_num_frames: usize,
    max_num_reorder_frames: usize,
    interlaced: bool,
    num_output_needed: usize,
    last_output_poc: i32,
    last_output_non_ref: bool,
}

impl<BackendHandle> Dpb<BackendHandle> {
    pub fn new() -> Self {
        Self {
            pictures: Vec::new(),
            max_num_frames: 0,
            max_num_reorder_frames: 0,
            interlaced: false,
            num_output_needed: 0,
            last_output_poc: i32::MIN,
            last_output_non_ref: false,
        }
    }

    pub fn set_max_num_frames(&mut self, n: usize) {
        self.max_num_frames = n;
    }

    pub fn max_num_frames(&self) -> usize {
        self.max_num_frames
    }

    pub fn set_max_num_reorder_frames(&mut self, n: usize) {
        self.max_num_reorder_frames = n;
    }

    pub fn max_num_reorder_frames(&self) -> usize {
        self.max_num_reorder_frames
    }

    pub fn set_interlaced(&mut self, interlaced: bool) {
        self.interlaced = interlaced;
    }

    pub fn interlaced(&self) -> bool {
        self.interlaced
    }

    pub fn len(&self) -> usize {
        self.pictures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pictures.is_empty()
    }

    pub fn pictures(&self) -> &[PictureHandle<BackendHandle>] {
        &self.pictures
    }

    pub fn num_output_needed(&self) -> usize {
        self.num_output_needed
    }

    pub fn last_output_poc(&self) -> i32 {
        self.last_output_poc
    }

    /// Insert a decoded picture. A non-existing gap filler occupies a frame
    /// buffer but is never output (C.4.2); a real picture is marked needed
    /// for output, counting once per frame (a lone first field does not
    /// count until its pair completes it).
    pub fn add(&mut self, picture: PictureHandle<BackendHandle>) {
        {
            let mut pic = picture.borrow_mut();
            if pic.data.nonexisting {
                pic.data.needed_for_output = false;
            } else {
                pic.data.needed_for_output = true;
                if pic.data.field == Field::Frame || pic.is_second_field() {
                    self.num_output_needed += 1;
                }
            }
        }

        debug!(
            "dpb: inserting frame_num={} poc={} field={:?}",
            picture.borrow().data.frame_num,
            picture.borrow().data.pic_order_cnt,
            picture.borrow().data.field
        );

        let poc_is_zero = picture.borrow().data.pic_order_cnt == 0;
        self.pictures.push(picture);

        let cap = self.max_num_frames * (1 + self.interlaced as usize);
        if cap != 0 && self.pictures.len() > cap {
            error!("dpb size {} exceeds the maximum {}", self.pictures.len(), cap);
        }

        // An IDR or a picture that carried MMCO-5 restarts the POC sequence.
        if poc_is_zero {
            trace!("last_output_poc reset");
            self.last_output_poc = i32::MIN;
            self.last_output_non_ref = false;
        }
    }

    /// Remove every picture that is neither needed for output nor a
    /// reference, preserving relative order. A swap-remove would reorder the
    /// tail, and the most recently inserted picture is still consulted by
    /// the bumping decision.
    pub fn delete_unused(&mut self) {
        self.pictures.retain(|p| {
            let p = p.borrow();
            p.data.needed_for_output || p.is_ref()
        });
    }

    pub fn get_short_ref_by_pic_num(&self, pic_num: i32) -> Option<PictureHandle<BackendHandle>> {
        self.pictures
            .iter()
            .find(|p| {
                let p = p.borrow();
                p.reference() == Reference::ShortTerm && p.data.pic_num == pic_num
            })
            .cloned()
    }

    pub fn get_long_ref_by_long_term_pic_num(&self, long_term_pic_num: i32) -> Option<PictureHandle<BackendHandle>> {
        self.pictures
            .iter()
            .find(|p| {
                let p = p.borrow();
                p.reference() == Reference::LongTerm && p.data.long_term_pic_num == long_term_pic_num
            })
            .cloned()
    }

    pub fn get_lowest_frame_num_short_ref(&self) -> Option<PictureHandle<BackendHandle>> {
        self.pictures
            .iter()
            .filter(|p| p.borrow().reference() == Reference::ShortTerm)
            .min_by_key(|p| p.borrow().data.frame_num_wrap)
            .cloned()
    }

    pub fn get_short_term_ref(
        &self,
        include_nonexisting: bool,
        include_second_field: bool,
        out: &mut Vec<PictureHandle<BackendHandle>>,
    ) {
        for p in &self.pictures {
            let keep = {
                let pic = p.borrow();
                pic.reference() == Reference::ShortTerm
                    && (include_nonexisting || !pic.data.nonexisting)
                    && (include_second_field || !pic.is_second_field())
            };
            if keep {
                out.push(p.clone());
            }
        }
    }

    pub fn get_long_term_ref(&self, include_second_field: bool, out: &mut Vec<PictureHandle<BackendHandle>>) {
        for p in &self.pictures {
            let keep = {
                let pic = p.borrow();
                pic.reference() == Reference::LongTerm && (include_second_field || !pic.is_second_field())
            };
            if keep {
                out.push(p.clone());
            }
        }
    }

    /// Whether any picture marked as reference and not non-existing remains;
    /// 8.2.4.2 requires at least one before list construction makes sense.
    pub fn has_usable_ref(&self) -> bool {
        self.pictures.iter().any(|p| {
            let p = p.borrow();
            p.is_ref() && !p.data.nonexisting
        })
    }

    /// The number of reference frames, counting a complementary field pair
    /// as one frame.
    pub fn num_ref_frames(&self) -> usize {
        self.pictures
            .iter()
            .filter(|p| {
                let p = p.borrow();
                p.is_ref() && !p.is_second_field()
            })
            .count()
    }

    pub fn mark_all_non_ref(&mut self) {
        for p in &self.pictures {
            p.borrow_mut().set_reference(Reference::None, false);
        }
    }

    /// C.4.4 fullness: for progressive streams, any free slot; for
    /// interlaced, a frame buffer is occupied by a frame picture or a
    /// complete complementary pair, counted once.
    pub fn has_empty_frame_buffer(&self) -> bool {
        if !self.interlaced {
            return self.pictures.len() < self.max_num_frames;
        }
        let occupied = self
            .pictures
            .iter()
            .filter(|p| {
                let p = p.borrow();
                if p.is_second_field() {
                    return false;
                }
                p.data.field == Field::Frame || p.other_field().is_some()
            })
            .count();
        occupied < self.max_num_frames
    }

    /// Finds the lowest-POC picture eligible for output: needed-for-output
    /// (unless `force`), and either a frame or the first field of a complete
    /// pair — a lone field cannot be delivered. Returns its position.
    fn lowest_output_needed(&self, force: bool) -> Option<(usize, PictureHandle<BackendHandle>)> {
        let mut lowest: Option<(usize, PictureHandle<BackendHandle>)> = None;
        for (i, p) in self.pictures.iter().enumerate() {
            let pic = p.borrow();
            if !force && !pic.data.needed_for_output {
                continue;
            }
            if pic.data.field != Field::Frame && (pic.other_field().is_none() || pic.is_second_field()) {
                continue;
            }
            match &lowest {
                Some((_, l)) if pic.data.pic_order_cnt >= l.borrow().data.pic_order_cnt => {}
                _ => lowest = Some((i, p.clone())),
            }
        }
        lowest
    }

    /// Whether a picture must be bumped before `to_insert` (or, with `None`,
    /// as a standalone check after insertion in the low-latency modes).
    pub fn needs_bump(&self, to_insert: Option<&PictureHandle<BackendHandle>>, level: BumpLevel) -> bool {
        let lowest = self.lowest_output_needed(false);

        if let Some((lowest_index, lowest_pic)) = &lowest {
            if level >= BumpLevel::LowLatency {
                let lowest_poc = lowest_pic.borrow().data.pic_order_cnt;
                let lowest_is_ref_pic = lowest_pic.borrow().data.ref_pic;

                // The relaxed checks below have not been validated against
                // interlaced streams; fall through to the normal policy.
                if !self.interlaced && self.has_empty_frame_buffer() {
                    // POC type 2: decoding order equals output order.
                    if lowest_pic.borrow().data.pic_order_cnt_type == 2 {
                        trace!("poc type 2, bumping");
                        return true;
                    }

                    // 7.4.1.2.2: POC of consecutive non-reference pictures is
                    // non-decreasing.
                    if self.last_output_non_ref && !lowest_is_ref_pic {
                        trace!("consecutive non-reference pictures {} -> {}, bumping", self.last_output_poc, lowest_poc);
                        return true;
                    }

                    // Enough pictures precede the pending one to satisfy the
                    // stream's own declared reorder window.
                    if *lowest_index >= self.max_num_reorder_frames {
                        let need_output = self.pictures[..*lowest_index]
                            .iter()
                            .filter(|p| p.borrow().data.needed_for_output)
                            .count();
                        if need_output >= self.max_num_reorder_frames {
                            trace!("{} pictures precede poc {}, bumping", lowest_index, lowest_poc);
                            return true;
                        }
                    }

                    // A positive POC can no longer be preceded by another
                    // negative-POC leading picture.
                    if let Some(pic) = to_insert {
                        if pic.borrow().data.pic_order_cnt > 0 && lowest_poc < 0 {
                            trace!("negative poc {}, bumping", lowest_poc);
                            return true;
                        }
                    }

                    if lowest_poc == 0 && self.pictures.len() <= 1 {
                        if let Some(pic) = to_insert {
                            if pic.borrow().data.pic_order_cnt > lowest_poc {
                                trace!("lone IDR or POC reset picture, bumping");
                                return true;
                            }
                        }
                    } else {
                        if !lowest_is_ref_pic {
                            trace!("non-reference picture has the lowest poc {}, bumping", lowest_poc);
                            return true;
                        }

                        if let Some(pic) = to_insert {
                            if !pic.borrow().data.ref_pic && lowest_poc < pic.borrow().data.pic_order_cnt {
                                trace!("pending poc {} precedes incoming non-reference picture, bumping", lowest_poc);
                                return true;
                            }
                        }

                        if level >= BumpLevel::VeryLowLatency {
                            // Assumes the common increment-by-2 POC pattern;
                            // streams using increment-by-1 may be mis-ordered,
                            // which is why this level is opt-in.
                            if lowest_poc > self.last_output_poc
                                && lowest_poc as i64 - self.last_output_poc as i64 <= 2
                            {
                                trace!("poc {} within 2 of last output {}, bumping", lowest_poc, self.last_output_poc);
                                return true;
                            }
                        }
                    }
                }
            }
        }

        // C.4.5.3: bumping is mandatory only when no empty frame buffer
        // remains and the incoming picture either is a reference or follows
        // the pending output in display order.
        if self.has_empty_frame_buffer() {
            return false;
        }

        let Some(pic) = to_insert else {
            return false;
        };

        if pic.borrow().data.ref_pic {
            return true;
        }

        let lowest_poc = lowest.map(|(_, p)| p.borrow().data.pic_order_cnt).unwrap_or(i32::MAX);
        pic.borrow().data.pic_order_cnt > lowest_poc
    }

    /// Output one picture: the lowest-POC needed-for-output picture, or
    /// (when not draining) the lowest-POC picture overall as an emergency
    /// bump. Emergency bumps do not consume a `num_output_needed` credit but
    /// always leave the store. Combines complete field pairs, stamping the
    /// interlaced buffer flags on the first field.
    pub fn bump(&mut self, drain: bool) -> Option<PictureHandle<BackendHandle>> {
        let mut output_needed = true;
        let (index, picture) = match self.lowest_output_needed(false) {
            Some(found) => found,
            None if !drain => {
                output_needed = false;
                self.lowest_output_needed(true)?
            }
            None => return None,
        };

        picture.borrow_mut().data.needed_for_output = false;
        if output_needed {
            self.num_output_needed = self.num_output_needed.saturating_sub(1);
        }

        if !picture.borrow().is_ref() || drain || !output_needed {
            self.pictures.remove(index);
        }

        let other = picture.borrow().other_field().and_then(|w| w.upgrade());
        if let Some(other) = &other {
            other.borrow_mut().data.needed_for_output = false;

            {
                let other_poc = other.borrow().data.pic_order_cnt;
                let mut pic = picture.borrow_mut();
                pic.data.buffer_flags.interlaced = true;
                let top_poc_is_lower = if pic.data.field == Field::Top {
                    pic.data.pic_order_cnt < other_poc
                } else {
                    other_poc < pic.data.pic_order_cnt
                };
                pic.data.buffer_flags.top_field_first = top_poc_is_lower;
            }

            if !other.borrow().is_ref() {
                self.pictures.retain(|p| !Rc::ptr_eq(p, other));
            }
        }

        self.last_output_poc = picture.borrow().data.pic_order_cnt;
        self.last_output_non_ref = !picture.borrow().data.ref_pic;

        Some(picture)
    }

    /// Records a picture delivered to output without passing through the
    /// store (the direct-output path for non-reference pictures).
    pub fn set_last_output(&mut self, picture: &PictureHandle<BackendHandle>) {
        self.last_output_poc = picture.borrow().data.pic_order_cnt;
        self.last_output_non_ref = !picture.borrow().data.ref_pic;
    }

    pub fn clear(&mut self) {
        self.pictures.clear();
        self.num_output_needed = 0;
    }

    /// 8.2.5.3 sliding-window marking: while the reference frame count is at
    /// the stream's cap, unmark the short-term reference with the smallest
    /// `frame_num_wrap` (both fields of a pair at once).
    pub fn sliding_window_marking(&mut self, max_num_ref_frames: u32) {
        let max_num_ref_frames = max_num_ref_frames.max(1) as usize;
        let mut num_ref = self.num_ref_frames();

        if num_ref > max_num_ref_frames {
            warn!("{} reference frames exceeds the allowed maximum {}", num_ref, max_num_ref_frames);
        }

        while num_ref >= max_num_ref_frames {
            let Some(to_unmark) = self.get_lowest_frame_num_short_ref() else {
                warn!("no short-term reference picture left to unmark");
                return;
            };
            trace!(
                "sliding window: unmarking frame_num={} poc={}",
                to_unmark.borrow().data.frame_num,
                to_unmark.borrow().data.pic_order_cnt
            );
            to_unmark.borrow_mut().set_reference(Reference::None, true);
            num_ref -= 1;
        }
    }

    /// 8.2.5.4: execute one memory-management control operation against the
    /// store, with `current` being the picture carrying the operation.
    /// Returns false when the operand picture could not be found; the caller
    /// proceeds with the remaining operations either way.
    pub fn perform_mmco(&mut self, op: &Mmco, current: &PictureHandle<BackendHandle>) -> bool {
        match *op {
            Mmco::UnmarkShortTerm { difference_of_pic_nums_minus1 } => {
                let pic_num = current.borrow().data.pic_num - (difference_of_pic_nums_minus1 as i32 + 1);
                match self.get_short_ref_by_pic_num(pic_num) {
                    Some(p) => {
                        let apply_to_pair = current.borrow().data.field == Field::Frame;
                        p.borrow_mut().set_reference(Reference::None, apply_to_pair);
                        true
                    }
                    None => {
                        warn!("mmco 1: no short-term picture with pic_num {}", pic_num);
                        false
                    }
                }
            }
            Mmco::UnmarkLongTerm { long_term_pic_num } => {
                match self.get_long_ref_by_long_term_pic_num(long_term_pic_num as i32) {
                    Some(p) => {
                        p.borrow_mut().set_reference(Reference::None, false);
                        true
                    }
                    None => {
                        warn!("mmco 2: no long-term picture with long_term_pic_num {}", long_term_pic_num);
                        false
                    }
                }
            }
            Mmco::MarkLongTerm { difference_of_pic_nums_minus1, long_term_frame_idx } => {
                let pic_num = current.borrow().data.pic_num - (difference_of_pic_nums_minus1 as i32 + 1);
                let Some(target) = self.get_short_ref_by_pic_num(pic_num) else {
                    warn!("mmco 3: no short-term picture with pic_num {}", pic_num);
                    return false;
                };

                self.unmark_long_term_frame_idx(long_term_frame_idx as i32, &target);

                let apply_to_pair = current.borrow().data.field == Field::Frame;
                target.borrow_mut().set_reference(Reference::LongTerm, apply_to_pair);
                target.borrow_mut().data.long_term_frame_idx = long_term_frame_idx as i32;

                if let Some(other) = target.borrow().other_field().and_then(|w| w.upgrade()) {
                    if other.borrow().reference() == Reference::LongTerm {
                        other.borrow_mut().data.long_term_frame_idx = long_term_frame_idx as i32;
                    }
                }
                true
            }
            Mmco::SetMaxLongTermFrameIdx { max_long_term_frame_idx_plus1 } => {
                let max_idx = max_long_term_frame_idx_plus1 as i32 - 1;
                for p in &self.pictures {
                    let unmark = {
                        let b = p.borrow();
                        b.reference() == Reference::LongTerm && b.data.long_term_frame_idx > max_idx
                    };
                    if unmark {
                        p.borrow_mut().set_reference(Reference::None, false);
                    }
                }
                true
            }
            Mmco::ResetAll => {
                for p in &self.pictures {
                    p.borrow_mut().set_reference(Reference::None, false);
                }
                let mut pic = current.borrow_mut();
                pic.data.mem_mgmt_5 = true;
                pic.data.frame_num = 0;
                // 8.2.5.4.5: subtract tempPicOrderCnt from the field order
                // counts the current picture actually has.
                match pic.data.field {
                    Field::Top => {
                        pic.data.top_field_order_cnt = 0;
                        pic.data.pic_order_cnt = 0;
                    }
                    Field::Bottom => {
                        pic.data.bottom_field_order_cnt = 0;
                        pic.data.pic_order_cnt = 0;
                    }
                    Field::Frame => {
                        pic.data.top_field_order_cnt -= pic.data.pic_order_cnt;
                        pic.data.bottom_field_order_cnt -= pic.data.pic_order_cnt;
                        pic.data.pic_order_cnt = pic.data.top_field_order_cnt.min(pic.data.bottom_field_order_cnt);
                    }
                }
                true
            }
            Mmco::MarkCurrentLongTerm { long_term_frame_idx } => {
                for p in &self.pictures {
                    let unmark = {
                        let b = p.borrow();
                        b.reference() == Reference::LongTerm
                            && b.data.long_term_frame_idx == long_term_frame_idx as i32
                            && !Rc::ptr_eq(p, current)
                    };
                    if unmark {
                        p.borrow_mut().set_reference(Reference::None, true);
                        break;
                    }
                }

                let second_field = current.borrow().is_second_field();
                current.borrow_mut().set_reference(Reference::LongTerm, second_field);
                current.borrow_mut().data.long_term_frame_idx = long_term_frame_idx as i32;

                if let Some(other) = current.borrow().other_field().and_then(|w| w.upgrade()) {
                    if other.borrow().reference() == Reference::LongTerm {
                        other.borrow_mut().data.long_term_frame_idx = long_term_frame_idx as i32;
                    }
                }
                true
            }
        }
    }

    /// 8.2.5.4.3's displacement step: unmark whatever long-term picture
    /// currently holds `frame_idx`, unless it is part of the complementary
    /// field pair that includes `target`. The case ordering matters: it has
    /// been validated against streams carrying both field-pair and lone
    /// field long-term holders.
    fn unmark_long_term_frame_idx(&mut self, frame_idx: i32, target: &PictureHandle<BackendHandle>) {
        for p in &self.pictures {
            let is_holder = {
                let b = p.borrow();
                b.reference() == Reference::LongTerm && b.data.long_term_frame_idx == frame_idx
            };
            if !is_holder {
                continue;
            }

            if p.borrow().data.field == Field::Frame {
                // A long-term frame holding the index is unmarked outright.
                p.borrow_mut().set_reference(Reference::None, true);
            } else {
                let other = p.borrow().other_field().and_then(|w| w.upgrade());
                let pair_holds_idx = other
                    .as_ref()
                    .map(|o| {
                        let o = o.borrow();
                        o.reference() == Reference::LongTerm && o.data.long_term_frame_idx == frame_idx
                    })
                    .unwrap_or(false);

                if pair_holds_idx {
                    // A complete long-term field pair: both fields drop.
                    p.borrow_mut().set_reference(Reference::None, true);
                } else {
                    // A lone long-term field: unmark it only when it is not
                    // part of the complementary pair that includes the
                    // picture being promoted.
                    match &other {
                        None => p.borrow_mut().set_reference(Reference::None, false),
                        Some(o) => {
                            let target_other = target.borrow().other_field().and_then(|w| w.upgrade());
                            let part_of_target_pair = Rc::ptr_eq(o, target)
                                || target_other.map(|t| Rc::ptr_eq(&t, p)).unwrap_or(false);
                            if !part_of_target_pair {
                                p.borrow_mut().set_reference(Reference::None, false);
                            }
                        }
                    }
                }
            }
            break;
        }
    }
}

impl<BackendHandle> Default for Dpb<BackendHandle> {
    fn default() -> Self {
        Self::new()
    }
}
