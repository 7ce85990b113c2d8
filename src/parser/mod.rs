// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The `Parser` boundary: turns RBSP bytes into the typed records the rest
//! of the crate consumes. A real bit-level implementation is provided
//! ([`bitstream::DefaultParser`]) but the boundary is a trait so a caller
//! with a different (possibly more complete, possibly hardware-assisted)
//! parser can supply their own.

pub mod bitstream;
pub mod types;

pub use bitstream::DefaultParser;
pub use types::*;

use crate::nal::NalHeader;
use crate::nal::ParseError;

/// A parser owns the active parameter-set state: SPS and PPS are cached by
/// id as they are parsed, and slice headers are resolved against those
/// caches (a slice header cannot even be framed without the PPS/SPS it
/// names).
pub trait Parser {
    /// Parses and caches an SPS, returning a copy of the parsed record.
    fn parse_sps(&mut self, rbsp: &[u8]) -> Result<Sps, ParseError>;

    /// Parses and caches a PPS. Fails if the PPS names an unknown SPS.
    fn parse_pps(&mut self, rbsp: &[u8]) -> Result<Pps, ParseError>;

    /// Parses a slice header, resolving `pps_id` against the cached
    /// parameter sets.
    fn parse_slice_header(&mut self, rbsp: &[u8], nalu: NalHeader) -> Result<SliceHeader, ParseError>;

    fn get_sps(&self, sps_id: u8) -> Option<&Sps>;

    fn get_pps(&self, pps_id: u8) -> Option<&Pps>;
}
