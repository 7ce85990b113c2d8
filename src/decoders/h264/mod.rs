// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 decoded-picture-buffer, POC, reference-list and decode-driver
//! core. Backend- and entropy-decoder-agnostic: callers supply a
//! [`backend::Backend`] implementation and, optionally, their own
//! [`crate::parser::Parser`].

pub mod backend;
pub mod dpb;
pub mod driver;
pub mod dummy;
pub mod level_limits;
pub mod output_queue;
pub mod picture;
pub mod poc;
pub mod ref_list;

pub use backend::Backend;
pub use dpb::BumpLevel;
pub use dpb::Dpb;
pub use driver::Compliance;
pub use driver::DecoderConfig;
pub use driver::Driver;
pub use picture::Field;
pub use picture::H264Picture;
pub use picture::Reference;
