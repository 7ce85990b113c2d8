// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-picture record shared by the Dpb, the reference-list builder, the
//! output queue and the driver. The outer `Picture<T, Handle>` wrapper is
//! generic over codec-specific data and an opaque backend handle so that
//! backends can hang their own per-picture state off the record without the
//! core knowing its type.

use std::cell::RefCell;
use std::ops::Deref;
use std::ops::DerefMut;
use std::rc::Rc;
use std::rc::Weak;

use log::debug;

use crate::parser::RefPicMarking;
use crate::parser::SliceHeader;
use crate::parser::SliceType;
use crate::parser::Sps;
use crate::resolution::Resolution;

/// Generic picture wrapper: codec-specific data plus an opaque, backend-owned
/// payload released via `Drop` when the last handle disappears.
pub struct Picture<T, BackendHandle> {
    pub data: T,
    pub backend_handle: Option<BackendHandle>,
}

pub type H264Picture<BackendHandle> = Picture<PictureData<BackendHandle>, BackendHandle>;

pub type PictureHandle<BackendHandle> = Rc<RefCell<H264Picture<BackendHandle>>>;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// Buffer flags carried through to output, set when a field pair is bumped
/// together.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferFlags {
    pub interlaced: bool,
    pub top_field_first: bool,
}

/// The sentinel used for an unset field-order-count before it has been
/// computed by the `PocCalculator`.
pub const POC_UNSET: i32 = i32::MAX;

pub struct PictureData<BackendHandle> {
    pub system_frame_number: u64,
    pub reorder_frame_number: u64,

    pub pic_order_cnt_type: u8,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub pic_order_cnt: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],

    pub pic_num: i32,
    pub long_term_pic_num: i32,
    pub frame_num: i32,
    pub frame_num_offset: i32,
    pub frame_num_wrap: i32,
    pub long_term_frame_idx: i32,

    pub coded_resolution: Resolution,
    pub display_resolution: Resolution,

    pub type_: SliceType,
    pub nal_ref_idc: u8,
    pub idr: bool,
    pub idr_pic_id: u16,
    pub field_pic_flag: bool,
    reference: Reference,
    /// Latched once the picture has ever been a reference; used by the
    /// low-latency bump policy to bias against pictures that were never refs.
    pub ref_pic: bool,

    pub needed_for_output: bool,
    pub nonexisting: bool,
    /// This picture carried memory-management-control-operation 5.
    pub mem_mgmt_5: bool,
    /// First picture after the input configuration changed; back ends use
    /// this to re-negotiate their output state.
    pub discontinuity: bool,

    pub field: Field,
    pub second_field: bool,
    other_field: Option<Weak<RefCell<H264Picture<BackendHandle>>>>,

    pub dec_ref_pic_marking: RefPicMarking,

    pub buffer_flags: BufferFlags,
}

impl<BackendHandle> Default for PictureData<BackendHandle> {
    fn default() -> Self {
        Self {
            system_frame_number: 0,
            reorder_frame_number: 0,
            pic_order_cnt_type: 0,
            top_field_order_cnt: POC_UNSET,
            bottom_field_order_cnt: POC_UNSET,
            pic_order_cnt: POC_UNSET,
            pic_order_cnt_msb: 0,
            pic_order_cnt_lsb: 0,
            delta_pic_order_cnt_bottom: 0,
            delta_pic_order_cnt: [0, 0],
            pic_num: 0,
            long_term_pic_num: 0,
            frame_num: 0,
            frame_num_offset: 0,
            frame_num_wrap: 0,
            long_term_frame_idx: -1,
            coded_resolution: Default::default(),
            display_resolution: Default::default(),
            type_: Default::default(),
            nal_ref_idc: 0,
            idr: false,
            idr_pic_id: 0,
            field_pic_flag: false,
            reference: Reference::None,
            ref_pic: false,
            needed_for_output: false,
            nonexisting: false,
            mem_mgmt_5: false,
            discontinuity: false,
            field: Field::Frame,
            second_field: false,
            other_field: None,
            dec_ref_pic_marking: Default::default(),
            buffer_flags: Default::default(),
        }
    }
}

impl<BackendHandle> H264Picture<BackendHandle> {
    pub fn new() -> Self {
        Self { data: PictureData::default(), backend_handle: None }
    }

    pub fn new_non_existing(frame_num: i32) -> Self {
        let mut pic = Self::new();
        pic.data.frame_num = frame_num;
        pic.data.nonexisting = true;
        pic.data.nal_ref_idc = 1;
        pic.data.pic_num = frame_num;
        pic.data.reference = Reference::ShortTerm;
        pic.data.ref_pic = true;
        pic
    }

    pub fn new_from_slice_header(hdr: &SliceHeader, nal_ref_idc: u8, idr: bool, sps: &Sps) -> Self {
        let field = if hdr.field_pic_flag {
            if hdr.bottom_field_flag {
                Field::Bottom
            } else {
                Field::Top
            }
        } else {
            Field::Frame
        };

        let reference = if nal_ref_idc != 0 { Reference::ShortTerm } else { Reference::None };

        let pic_num = if !hdr.field_pic_flag { hdr.frame_num } else { 2 * hdr.frame_num + 1 };

        let visible_rect = sps.visible_rectangle();
        let display_resolution = Resolution::new(visible_rect.width(), visible_rect.height());

        let mut pic = Self::new();
        pic.data = PictureData {
            pic_order_cnt_type: sps.pic_order_cnt_type,
            pic_order_cnt_lsb: hdr.pic_order_cnt_lsb as i32,
            delta_pic_order_cnt_bottom: hdr.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt: hdr.delta_pic_order_cnt,
            pic_num,
            frame_num: hdr.frame_num,
            nal_ref_idc,
            idr,
            idr_pic_id: hdr.idr_pic_id,
            field_pic_flag: hdr.field_pic_flag,
            reference,
            ref_pic: reference != Reference::None,
            field,
            type_: hdr.slice_type,
            dec_ref_pic_marking: hdr.dec_ref_pic_marking.clone(),
            coded_resolution: sps.coded_resolution(),
            display_resolution,
            ..Default::default()
        };
        pic
    }

    pub fn reference(&self) -> Reference {
        self.data.reference
    }

    pub fn is_ref(&self) -> bool {
        !matches!(self.data.reference, Reference::None)
    }

    /// Mark the picture as a reference picture, optionally propagating the
    /// same status to its paired field. Setting anything but `None` latches
    /// `ref_pic` permanently.
    pub fn set_reference(&mut self, reference: Reference, apply_to_other_field: bool) {
        debug!("set reference of frame_num={} to {:?}", self.data.frame_num, reference);
        self.data.reference = reference;
        if reference != Reference::None {
            self.data.ref_pic = true;
        }

        if apply_to_other_field {
            if let Some(other) = self.data.other_field.as_ref().and_then(Weak::upgrade) {
                let mut other = other.borrow_mut();
                other.data.reference = reference;
                if reference != Reference::None {
                    other.data.ref_pic = true;
                }
            }
        }
    }

    pub fn is_second_field(&self) -> bool {
        self.data.second_field
    }

    pub fn other_field(&self) -> Option<&Weak<RefCell<H264Picture<BackendHandle>>>> {
        self.data.other_field.as_ref()
    }

    pub fn other_field_unchecked(&self) -> PictureHandle<BackendHandle> {
        self.data.other_field.as_ref().unwrap().upgrade().unwrap()
    }

    /// Whether the current picture is the second field of a complementary
    /// reference pair (both fields are references).
    pub fn is_second_field_of_complementary_ref_pair(&self) -> bool {
        self.is_ref()
            && self.data.second_field
            && self.data.other_field.as_ref().and_then(Weak::upgrade).map(|o| o.borrow().is_ref()).unwrap_or(false)
    }

    /// Split a frame picture into two complementary field pictures sharing
    /// the same `frame_num`, with POCs and parity assigned from the already
    /// computed frame-level field order counts.
    pub fn split_frame(pic_rc: &PictureHandle<BackendHandle>) -> PictureHandle<BackendHandle> {
        let mut pic = pic_rc.borrow_mut();
        assert_eq!(pic.data.field, Field::Frame);
        assert!(pic.data.other_field.is_none());

        debug!("splitting frame_num={} poc={}", pic.data.frame_num, pic.data.pic_order_cnt);

        let (this_field, this_poc, other_field, other_poc) =
            if pic.data.top_field_order_cnt < pic.data.bottom_field_order_cnt {
                (Field::Top, pic.data.top_field_order_cnt, Field::Bottom, pic.data.bottom_field_order_cnt)
            } else {
                (Field::Bottom, pic.data.bottom_field_order_cnt, Field::Top, pic.data.top_field_order_cnt)
            };
        pic.data.field = this_field;
        pic.data.pic_order_cnt = this_poc;

        let mut companion = H264Picture::new();
        companion.data = PictureData {
            top_field_order_cnt: pic.data.top_field_order_cnt,
            bottom_field_order_cnt: pic.data.bottom_field_order_cnt,
            frame_num: pic.data.frame_num,
            system_frame_number: pic.data.system_frame_number,
            reorder_frame_number: pic.data.reorder_frame_number,
            reference: pic.data.reference,
            ref_pic: pic.data.ref_pic,
            nonexisting: pic.data.nonexisting,
            field_pic_flag: pic.data.field_pic_flag,
            pic_order_cnt: other_poc,
            field: other_field,
            second_field: true,
            ..Default::default()
        };

        let companion_rc = Rc::new(RefCell::new(companion));
        companion_rc.borrow_mut().data.other_field = Some(Rc::downgrade(pic_rc));
        pic.data.other_field = Some(Rc::downgrade(&companion_rc));
        drop(pic);
        companion_rc
    }

    /// Pair `self` (the first field already in the Dpb) with `second_field`,
    /// the complementary field just decoded.
    pub fn set_second_field_to(pic_rc: &PictureHandle<BackendHandle>, second_field: &PictureHandle<BackendHandle>) {
        pic_rc.borrow_mut().data.other_field = Some(Rc::downgrade(second_field));
        second_field.borrow_mut().data.other_field = Some(Rc::downgrade(pic_rc));
        second_field.borrow_mut().data.second_field = true;
    }
}

impl<BackendHandle> Default for H264Picture<BackendHandle> {
    fn default() -> Self {
        Self::new()
    }
}

impl<BackendHandle> std::fmt::Debug for H264Picture<BackendHandle> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Picture")
            .field("system_frame_number", &self.data.system_frame_number)
            .field("reorder_frame_number", &self.data.reorder_frame_number)
            .field("frame_num", &self.data.frame_num)
            .field("pic_num", &self.data.pic_num)
            .field("pic_order_cnt", &self.data.pic_order_cnt)
            .field("field", &self.data.field)
            .field("reference", &self.data.reference)
            .field("ref_pic", &self.data.ref_pic)
            .field("needed_for_output", &self.data.needed_for_output)
            .field("nonexisting", &self.data.nonexisting)
            .field("mem_mgmt_5", &self.data.mem_mgmt_5)
            .field("backend_handle", if self.backend_handle.is_some() { &"Some" } else { &"None" })
            .finish()
    }
}

impl<BackendHandle> Deref for H264Picture<BackendHandle> {
    type Target = PictureData<BackendHandle>;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<BackendHandle> DerefMut for H264Picture<BackendHandle> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sps_for_test() -> Sps {
        Sps {
            sps_id: 0,
            profile_idc: 66,
            constraint_set3_flag: false,
            level_idc: 30,
            chroma_format_idc: 1,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            delta_pic_order_always_zero_flag: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            offset_for_ref_frame: Vec::new(),
            max_num_ref_frames: 2,
            gaps_in_frame_num_value_allowed_flag: false,
            pic_width_in_mbs_minus1: 10,
            pic_height_in_map_units_minus1: 8,
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
    fn set_reference_latches_ref_pic() {
        let mut pic: H264Picture<()> = H264Picture::new();
        assert!(!pic.data.ref_pic);
        pic.set_reference(Reference::ShortTerm, false);
        assert!(pic.data.ref_pic);
        pic.set_reference(Reference::None, false);
        assert!(!pic.is_ref());
        assert!(pic.data.ref_pic, "ref_pic must stay latched once set");
    }

    #[test]
    fn split_frame_produces_symmetric_pairing() {
        let sps = sps_for_test();
        let hdr = SliceHeader {
            first_mb_in_slice: 0,
            slice_type: SliceType::I,
            pps_id: 0,
            frame_num: 4,
            field_pic_flag: false,
            bottom_field_flag: false,
            idr_pic_id: 0,
            pic_order_cnt_lsb: 0,
            delta_pic_order_cnt_bottom: 0,
            delta_pic_order_cnt: [0, 0],
            num_ref_idx_active_override_flag: false,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            ref_pic_list_modification_flag_l0: false,
            ref_pic_list_modification_l0: Vec::new(),
            ref_pic_list_modification_flag_l1: false,
            ref_pic_list_modification_l1: Vec::new(),
            dec_ref_pic_marking: Default::default(),
        };
        let mut pic: H264Picture<()> = H264Picture::new_from_slice_header(&hdr, 1, false, &sps);
        pic.data.top_field_order_cnt = 4;
        pic.data.bottom_field_order_cnt = 6;
        let pic_rc = Rc::new(RefCell::new(pic));

        let companion = H264Picture::split_frame(&pic_rc);

        assert_eq!(pic_rc.borrow().data.field, Field::Top);
        assert_eq!(pic_rc.borrow().data.pic_order_cnt, 4);
        assert_eq!(companion.borrow().data.field, Field::Bottom);
        assert_eq!(companion.borrow().data.pic_order_cnt, 6);
        assert!(companion.borrow().is_second_field());
        assert!(!pic_rc.borrow().is_second_field());
        assert!(Rc::ptr_eq(&pic_rc.borrow().other_field_unchecked(), &companion));
        assert!(Rc::ptr_eq(&companion.borrow().other_field_unchecked(), &pic_rc));
    }
}
