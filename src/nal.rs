// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NAL unit extraction from the two packagings named in the external
//! interface: Annex B byte-stream (start codes) and AVC (length-prefixed,
//! `avcC`-configured). This is transport framing, not bitstream semantics,
//! and is explicitly in scope even though full bitstream parsing is not.

use std::borrow::Cow;

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("NAL unit is empty")]
    EmptyNalUnit,
    #[error("forbidden_zero_bit is set")]
    ForbiddenZeroBit,
    #[error("length-prefixed NAL unit length {0} exceeds remaining buffer of {1} bytes")]
    TruncatedLengthPrefixedNal(usize, usize),
    #[error("avcC record is truncated")]
    TruncatedAvcConfig,
    #[error("unsupported avcC configurationVersion {0}")]
    UnsupportedAvcConfigVersion(u8),
    #[error("exp-golomb read ran past the end of the RBSP")]
    BitstreamExhausted,
    #[error("unsupported pic_order_cnt_type {0}")]
    UnsupportedPicOrderCntType(u8),
    #[error("PPS references unknown sps_id {0}")]
    UnknownSpsId(u8),
    #[error("slice references unknown pps_id {0}")]
    UnknownPpsId(u8),
    #[error("PPS requests FMO (num_slice_groups_minus1 > 0), which is out of scope")]
    FmoUnsupported,
}

/// The two NAL packagings a caller can select between, per the external
/// interface (upstream caps decide which one applies to a given stream).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamFormat {
    /// 0x000001 / 0x00000001 start-code delimited byte stream.
    AnnexB,
    /// ISO/IEC 14496-15 length-prefixed NAL units.
    Avc { nal_length_size: u8 },
}

/// Whether the caller delivers one access unit per buffer, or raw NAL units
/// that may span multiple buffers. AVC packaging always implies `AccessUnit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alignment {
    AccessUnit,
    Nal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, enumn::N)]
#[repr(u8)]
pub enum NalUnitType {
    Unspecified = 0,
    SliceNonIdr = 1,
    SliceDataPartitionA = 2,
    SliceDataPartitionB = 3,
    SliceDataPartitionC = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AccessUnitDelimiter = 9,
    EndOfSeq = 10,
    EndOfStream = 11,
    FillerData = 12,
    SpsExtension = 13,
}

impl NalUnitType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::n(value)
    }
}

/// A decoded NAL unit header (first byte of the NAL unit).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NalHeader {
    pub nal_ref_idc: u8,
    pub nal_unit_type_raw: u8,
}

impl NalHeader {
    pub fn parse(byte: u8) -> Result<Self, ParseError> {
        if byte & 0x80 != 0 {
            return Err(ParseError::ForbiddenZeroBit);
        }
        Ok(Self {
            nal_ref_idc: (byte >> 5) & 0x3,
            nal_unit_type_raw: byte & 0x1f,
        })
    }

    pub fn nal_unit_type(&self) -> Option<NalUnitType> {
        NalUnitType::from_u8(self.nal_unit_type_raw)
    }

    pub fn is_idr(&self) -> bool {
        self.nal_unit_type_raw == NalUnitType::SliceIdr as u8
    }
}

/// A NAL unit: its header plus the full unit payload (header byte included),
/// sliced out of the original input buffer with no copy.
#[derive(Clone, Debug)]
pub struct NalUnit {
    pub header: NalHeader,
    data: Bytes,
}

impl NalUnit {
    /// Wraps a complete NAL unit (header byte included), e.g. one lifted out
    /// of an `avcC` configuration record.
    pub fn from_bytes(data: Bytes) -> Result<Self, ParseError> {
        if data.is_empty() {
            return Err(ParseError::EmptyNalUnit);
        }
        let header = NalHeader::parse(data[0])?;
        Ok(Self { header, data })
    }

    /// The full NAL unit, header byte included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The Raw Byte Sequence Payload: the NAL unit body (header byte
    /// excluded) with emulation-prevention `0x03` bytes removed. Returned as
    /// a `Cow` so the common case (no `0x03 00 00` sequence present) avoids
    /// an allocation.
    pub fn rbsp_bytes(&self) -> Cow<'_, [u8]> {
        let body = &self.data[1..];
        if !has_emulation_prevention(body) {
            return Cow::Borrowed(body);
        }
        let mut out = Vec::with_capacity(body.len());
        let mut zero_run = 0u32;
        for &byte in body {
            if zero_run >= 2 && byte == 0x03 {
                zero_run = 0;
                continue;
            }
            out.push(byte);
            zero_run = if byte == 0 { zero_run + 1 } else { 0 };
        }
        Cow::Owned(out)
    }
}

fn has_emulation_prevention(body: &[u8]) -> bool {
    let mut zero_run = 0u32;
    for &byte in body {
        if zero_run >= 2 && byte == 0x03 {
            return true;
        }
        zero_run = if byte == 0 { zero_run + 1 } else { 0 };
    }
    false
}

/// Scans `bytes` for `0x000001`/`0x00000001`-delimited NAL units.
pub fn split_annex_b(bytes: Bytes) -> Result<Vec<NalUnit>, ParseError> {
    // Each entry is (start_code_offset, nal_data_offset): the position the
    // start code begins at, and the position right after it where the NAL
    // unit itself begins.
    let marks = find_start_codes(&bytes);
    let mut units = Vec::with_capacity(marks.len());
    for (i, &(_, nal_start)) in marks.iter().enumerate() {
        let end = match marks.get(i + 1) {
            Some(&(next_start_code, _)) => next_start_code,
            None => trim_trailing_zeros(&bytes, bytes.len()),
        };
        if end > nal_start {
            units.push(NalUnit::from_bytes(bytes.slice(nal_start..end))?);
        }
    }
    Ok(units)
}

fn trim_trailing_zeros(bytes: &[u8], mut end: usize) -> usize {
    while end > 0 && bytes[end - 1] == 0 {
        end -= 1;
    }
    end
}

/// Returns `(start_code_offset, nal_data_offset)` for every start code found
/// in `bytes`.
fn find_start_codes(bytes: &[u8]) -> Vec<(usize, usize)> {
    let mut result = Vec::new();
    let mut i = 0;
    while i + 2 < bytes.len() {
        if bytes[i] == 0 && bytes[i + 1] == 0 {
            if bytes[i + 2] == 1 {
                result.push((i, i + 3));
                i += 3;
                continue;
            }
            if i + 3 < bytes.len() && bytes[i + 2] == 0 && bytes[i + 3] == 1 {
                result.push((i, i + 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }
    result
}

/// Reads `nal_length_size`-byte big-endian length prefixes followed by that
/// many bytes of NAL unit, per ISO/IEC 14496-15.
pub fn split_avc(bytes: Bytes, nal_length_size: u8) -> Result<Vec<NalUnit>, ParseError> {
    let nal_length_size = nal_length_size as usize;
    let mut units = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        if offset + nal_length_size > bytes.len() {
            return Err(ParseError::TruncatedLengthPrefixedNal(0, bytes.len() - offset));
        }
        let mut length = 0usize;
        for i in 0..nal_length_size {
            length = (length << 8) | bytes[offset + i] as usize;
        }
        offset += nal_length_size;
        if offset + length > bytes.len() {
            return Err(ParseError::TruncatedLengthPrefixedNal(length, bytes.len() - offset));
        }
        units.push(NalUnit::from_bytes(bytes.slice(offset..offset + length))?);
        offset += length;
    }
    Ok(units)
}

/// The parsed `avcC` box (ISO/IEC 14496-15 `AVCDecoderConfigurationRecord`).
#[derive(Clone, Debug)]
pub struct AvcDecoderConfigurationRecord {
    pub configuration_version: u8,
    pub profile_indication: u8,
    pub profile_compatibility: u8,
    pub level_indication: u8,
    pub nal_length_size: u8,
    pub sps_list: Vec<Bytes>,
    pub pps_list: Vec<Bytes>,
}

impl AvcDecoderConfigurationRecord {
    pub fn parse(bytes: Bytes) -> Result<Self, ParseError> {
        let b = &bytes[..];
        if b.len() < 6 {
            return Err(ParseError::TruncatedAvcConfig);
        }
        let configuration_version = b[0];
        if configuration_version != 1 {
            return Err(ParseError::UnsupportedAvcConfigVersion(configuration_version));
        }
        let profile_indication = b[1];
        let profile_compatibility = b[2];
        let level_indication = b[3];
        let nal_length_size = (b[4] & 0x3) + 1;

        let mut offset = 5;
        let num_sps = (b[offset] & 0x1f) as usize;
        offset += 1;
        let mut sps_list = Vec::with_capacity(num_sps);
        for _ in 0..num_sps {
            if offset + 2 > b.len() {
                return Err(ParseError::TruncatedAvcConfig);
            }
            let len = u16::from_be_bytes([b[offset], b[offset + 1]]) as usize;
            offset += 2;
            if offset + len > b.len() {
                return Err(ParseError::TruncatedAvcConfig);
            }
            sps_list.push(bytes.slice(offset..offset + len));
            offset += len;
        }

        if offset >= b.len() {
            return Err(ParseError::TruncatedAvcConfig);
        }
        let num_pps = b[offset] as usize;
        offset += 1;
        let mut pps_list = Vec::with_capacity(num_pps);
        for _ in 0..num_pps {
            if offset + 2 > b.len() {
                return Err(ParseError::TruncatedAvcConfig);
            }
            let len = u16::from_be_bytes([b[offset], b[offset + 1]]) as usize;
            offset += 2;
            if offset + len > b.len() {
                return Err(ParseError::TruncatedAvcConfig);
            }
            pps_list.push(bytes.slice(offset..offset + len));
            offset += len;
        }

        Ok(Self {
            configuration_version,
            profile_indication,
            profile_compatibility,
            level_indication,
            nal_length_size,
            sps_list,
            pps_list,
        })
    }
}
