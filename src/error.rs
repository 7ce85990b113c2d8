// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The error taxonomy and flow-status propagation type shared by every
//! subsystem in this crate.

use thiserror::Error;

/// Every distinct failure mode the core can produce. Kept as one enum
/// because the core has a single external boundary (the
/// [`crate::decoders::h264::driver::Driver`]); sub-boundaries (a
/// [`crate::parser::Parser`] impl, a
/// [`crate::decoders::h264::backend::Backend`] impl) wrap their own error
/// into the matching variant.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// Bytes did not yield a valid SPS/PPS/slice header; the access unit is dropped.
    #[error("failed to parse bitstream: {0}")]
    Parse(#[from] crate::nal::ParseError),

    /// The SPS requests features the backend did not opt into (interlaced
    /// without field-picture support, FMO, ...). Negotiation fails permanently
    /// until a new, compatible SPS arrives.
    #[error("stream requires unsupported feature: {0}")]
    UnsupportedStream(String),

    /// An MMCO or list-modification command referenced a pic_num /
    /// long_term_pic_num that does not exist in the DPB. Logged and skipped;
    /// decoding continues.
    #[error("reference picture not found: {0}")]
    InvalidReference(String),

    /// The backend rejected a new sequence (`Backend::new_sequence`).
    #[error("backend rejected new sequence: {0}")]
    BackendNewSequence(#[source] anyhow::Error),

    /// `new_picture` / `new_field_picture` / `start_picture` / `decode_slice` /
    /// `end_picture` failed. The current picture is discarded; subsequent
    /// access units are still attempted.
    #[error("backend picture operation failed: {0}")]
    BackendPicture(#[source] anyhow::Error),

    /// `Backend::output_picture` failed. Propagated to the caller; driver
    /// state remains consistent (the picture has already left the DPB).
    #[error("backend failed to output picture: {0}")]
    Output(#[source] anyhow::Error),

    /// A logical precondition was violated by the stream itself (duplicate
    /// field parity within a coded frame, a first field missing
    /// `first_mb_in_slice == 0`, ...). The current picture is discarded.
    #[error("stream inconsistency: {0}")]
    StreamInconsistency(String),
}

pub type DecoderResult<T> = Result<T, DecoderError>;

/// The steady-state/terminal signal threaded through the driver. Kept
/// distinct from [`DecoderError`] because `NotNegotiated` and `Flushing` are
/// not failures a caller needs to propagate with `?` — they are states the
/// caller polls and reacts to.
#[derive(Debug)]
pub enum FlowStatus {
    Ok,
    Error(DecoderError),
    NotNegotiated,
    Flushing,
}

impl FlowStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, FlowStatus::Ok)
    }

    /// Folds a fallible step into a running flow status: `Ok` results
    /// cascade; the first non-`Ok` outcome wins and later `Ok` results do
    /// not erase it.
    pub fn update(&mut self, next: FlowStatus) {
        if self.is_ok() {
            *self = next;
        }
    }
}

impl From<DecoderError> for FlowStatus {
    fn from(err: DecoderError) -> Self {
        match err {
            // Both are negotiation failures: the stream as configured cannot
            // be decoded until a compatible sequence arrives.
            DecoderError::BackendNewSequence(_) => FlowStatus::NotNegotiated,
            DecoderError::UnsupportedStream(_) => FlowStatus::NotNegotiated,
            other => FlowStatus::Error(other),
        }
    }
}
