// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A no-op `Backend` used by this crate's own tests and available to
//! integration tests that want to drive the `Driver` without a real
//! hardware or software decode path: every call records that it happened
//! and returns success (or an injected failure).

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::decoders::h264::backend::Backend;
use crate::decoders::h264::backend::Slice;
use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::picture::PictureHandle;
use crate::decoders::h264::ref_list::RefList;
use crate::error::FlowStatus;
use crate::parser::Sps;

#[derive(Debug, Error)]
#[error("dummy backend failure")]
pub struct DummyError;

/// Released when the last `Picture` handle holding it drops; the dummy
/// backend has nothing to free but records the drop for test assertions.
pub struct DummyUserData {
    pub released: Rc<RefCell<bool>>,
}

impl Drop for DummyUserData {
    fn drop(&mut self) {
        *self.released.borrow_mut() = true;
    }
}

#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct DummyFrame(pub u64);

#[derive(Default)]
pub struct DummyBackend {
    pub new_sequence_calls: usize,
    pub new_picture_calls: usize,
    pub new_field_picture_calls: usize,
    pub start_picture_calls: usize,
    pub decode_slice_calls: usize,
    pub end_picture_calls: usize,
    /// POC of each picture in the order `output_picture` received them.
    pub output_order: Vec<i32>,
    /// The routing frame delivered alongside each output picture.
    pub output_frames: Vec<DummyFrame>,
    /// Sizes of (list0, list1) seen by each `decode_slice` call.
    pub slice_ref_list_sizes: Vec<(usize, usize)>,
    /// POC of each list-0 slot per `decode_slice` call (`None` for an empty
    /// slot).
    pub slice_list0_pocs: Vec<Vec<Option<i32>>>,

    pub interlaced_capable: bool,
    pub fail_end_picture: bool,
    pub preferred_output_delay: u32,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interlaced() -> Self {
        Self { interlaced_capable: true, ..Self::default() }
    }
}

impl Backend for DummyBackend {
    type UserData = DummyUserData;
    type Frame = DummyFrame;
    type Error = DummyError;

    fn new_sequence(&mut self, _sps: &Sps, _max_dpb_size: usize) -> Result<(), Self::Error> {
        self.new_sequence_calls += 1;
        Ok(())
    }

    fn new_picture(&mut self, _frame: &Self::Frame, picture: &PictureHandle<Self::UserData>) -> Result<(), Self::Error> {
        self.new_picture_calls += 1;
        picture.borrow_mut().backend_handle = Some(DummyUserData { released: Rc::new(RefCell::new(false)) });
        Ok(())
    }

    fn supports_field_pictures(&self) -> bool {
        self.interlaced_capable
    }

    fn new_field_picture(
        &mut self,
        _first_field: &PictureHandle<Self::UserData>,
        second_field: &PictureHandle<Self::UserData>,
    ) -> Result<(), Self::Error> {
        self.new_field_picture_calls += 1;
        second_field.borrow_mut().backend_handle = Some(DummyUserData { released: Rc::new(RefCell::new(false)) });
        Ok(())
    }

    fn start_picture(
        &mut self,
        _picture: &PictureHandle<Self::UserData>,
        _slice: &Slice,
        _dpb: &Dpb<Self::UserData>,
    ) -> Result<(), Self::Error> {
        self.start_picture_calls += 1;
        Ok(())
    }

    fn decode_slice(
        &mut self,
        _picture: &PictureHandle<Self::UserData>,
        _slice: &Slice,
        list0: &RefList<Self::UserData>,
        list1: &RefList<Self::UserData>,
    ) -> Result<(), Self::Error> {
        self.decode_slice_calls += 1;
        self.slice_ref_list_sizes.push((list0.len(), list1.len()));
        self.slice_list0_pocs
            .push(list0.iter().map(|p| p.as_ref().map(|p| p.borrow().data.pic_order_cnt)).collect());
        Ok(())
    }

    fn end_picture(&mut self, _picture: &PictureHandle<Self::UserData>) -> Result<(), Self::Error> {
        self.end_picture_calls += 1;
        if self.fail_end_picture {
            return Err(DummyError);
        }
        Ok(())
    }

    fn output_picture(&mut self, frame: Self::Frame, picture: &PictureHandle<Self::UserData>) -> FlowStatus {
        self.output_order.push(picture.borrow().data.pic_order_cnt);
        self.output_frames.push(frame);
        FlowStatus::Ok
    }

    fn get_preferred_output_delay(&self, _is_live: bool) -> u32 {
        self.preferred_output_delay
    }
}
