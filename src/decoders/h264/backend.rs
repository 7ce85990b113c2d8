// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The back-end trait boundary. The driver is generic over one concrete
//! `Backend` implementation (static dispatch), which keeps the hot
//! per-slice calls monomorphized.

use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::picture::PictureHandle;
use crate::decoders::h264::ref_list::RefList;
use crate::error::FlowStatus;
use crate::parser::SliceHeader;
use crate::parser::Sps;

/// One coded slice plus its raw RBSP span, as handed to the back end for
/// entropy decoding. The core never interprets slice-data bytes itself.
pub struct Slice<'a> {
    pub header: &'a SliceHeader,
    pub rbsp: &'a [u8],
}

/// Capability slots a back end implements. `UserData` is the opaque,
/// backend-owned per-picture payload; its `Drop` impl runs when the last
/// `Picture` handle referencing it disappears, which is where a back end
/// frees whatever it allocated in `new_picture`.
///
/// `new_field_picture` and `get_preferred_output_delay` are optional
/// capabilities: the driver consults [`Backend::supports_field_pictures`]
/// before negotiating an interlaced sequence.
pub trait Backend {
    type UserData;
    type Frame;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Called after a drain whenever the active SPS materially changes.
    /// `max_dpb_size` already includes the backend's preferred output delay.
    fn new_sequence(&mut self, sps: &Sps, max_dpb_size: usize) -> Result<(), Self::Error>;

    /// A fresh frame-level picture; the backend may allocate output storage
    /// and stash it in the picture's `backend_handle` slot.
    fn new_picture(&mut self, frame: &Self::Frame, picture: &PictureHandle<Self::UserData>) -> Result<(), Self::Error>;

    /// Whether this back end can decode field pictures. Interlaced SPS
    /// negotiation fails when this returns false.
    fn supports_field_pictures(&self) -> bool {
        false
    }

    /// The second field of a complementary pair. Only invoked when
    /// `supports_field_pictures` returns true.
    fn new_field_picture(
        &mut self,
        _first_field: &PictureHandle<Self::UserData>,
        _second_field: &PictureHandle<Self::UserData>,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    fn start_picture(
        &mut self,
        picture: &PictureHandle<Self::UserData>,
        slice: &Slice,
        dpb: &Dpb<Self::UserData>,
    ) -> Result<(), Self::Error>;

    /// `list1` is empty for non-B slices.
    fn decode_slice(
        &mut self,
        picture: &PictureHandle<Self::UserData>,
        slice: &Slice,
        list0: &RefList<Self::UserData>,
        list1: &RefList<Self::UserData>,
    ) -> Result<(), Self::Error>;

    fn end_picture(&mut self, picture: &PictureHandle<Self::UserData>) -> Result<(), Self::Error>;

    /// Consumes the routing frame and the finished picture, in output
    /// order.
    fn output_picture(&mut self, frame: Self::Frame, picture: &PictureHandle<Self::UserData>) -> FlowStatus;

    /// Extra frames of DPB headroom this back end wants before it starts
    /// returning finished pictures (e.g. for hardware pipelining).
    fn get_preferred_output_delay(&self, _is_live: bool) -> u32 {
        0
    }
}
