// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A backend-agnostic H.264/AVC decoded-picture-buffer, picture-order-count,
//! reference-list and decode-driver core. This crate does not decode pixels:
//! it owns everything the standard mandates *around* entropy/transform/motion
//! decoding (DPB bookkeeping, POC, reference lists, NAL/slice-level state
//! machine) and calls out to a caller-supplied [`decoders::h264::Backend`]
//! for the parts that actually touch sample data.

pub mod decoders;
pub mod error;
pub mod nal;
pub mod parser;
pub mod resolution;

pub use error::DecoderError;
pub use error::DecoderResult;
pub use error::FlowStatus;
pub use resolution::Point;
pub use resolution::Rect;
pub use resolution::Resolution;
