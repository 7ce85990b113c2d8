// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end driver scenarios against the dummy backend. Slice headers are
//! fed through a scripted parser so the scenarios are written at the level
//! of parsed records instead of hand-encoded bitstreams.

use std::collections::HashMap;
use std::collections::VecDeque;

use bytes::Bytes;

use h264_dpb_core::decoders::h264::dummy::DummyBackend;
use h264_dpb_core::decoders::h264::dummy::DummyFrame;
use h264_dpb_core::decoders::h264::Compliance;
use h264_dpb_core::decoders::h264::DecoderConfig;
use h264_dpb_core::decoders::h264::Driver;
use h264_dpb_core::nal::NalHeader;
use h264_dpb_core::nal::NalUnit;
use h264_dpb_core::nal::ParseError;
use h264_dpb_core::parser::Mmco;
use h264_dpb_core::parser::Parser;
use h264_dpb_core::parser::Pps;
use h264_dpb_core::parser::RefPicMarking;
use h264_dpb_core::parser::SliceHeader;
use h264_dpb_core::parser::SliceType;
use h264_dpb_core::parser::Sps;
use h264_dpb_core::FlowStatus;

/// Returns pre-programmed records in order instead of decoding bits; the
/// driver only ever sees the typed side of the parser boundary.
#[derive(Default)]
struct ScriptedParser {
    sps_sets: HashMap<u8, Sps>,
    pps_sets: HashMap<u8, Pps>,
    pending_sps: VecDeque<Sps>,
    pending_pps: VecDeque<Pps>,
    pending_slices: VecDeque<SliceHeader>,
}

impl Parser for ScriptedParser {
    fn parse_sps(&mut self, _rbsp: &[u8]) -> Result<Sps, ParseError> {
        let sps = self.pending_sps.pop_front().ok_or(ParseError::BitstreamExhausted)?;
        self.sps_sets.insert(sps.sps_id, sps.clone());
        Ok(sps)
    }

    fn parse_pps(&mut self, _rbsp: &[u8]) -> Result<Pps, ParseError> {
        let pps = self.pending_pps.pop_front().ok_or(ParseError::BitstreamExhausted)?;
        self.pps_sets.insert(pps.pps_id, pps.clone());
        Ok(pps)
    }

    fn parse_slice_header(&mut self, _rbsp: &[u8], _nalu: NalHeader) -> Result<SliceHeader, ParseError> {
        self.pending_slices.pop_front().ok_or(ParseError::BitstreamExhausted)
    }

    fn get_sps(&self, sps_id: u8) -> Option<&Sps> {
        self.sps_sets.get(&sps_id)
    }

    fn get_pps(&self, pps_id: u8) -> Option<&Pps> {
        self.pps_sets.get(&pps_id)
    }
}

const NAL_SLICE_NON_IDR: u8 = 1;
const NAL_SLICE_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

fn nal(unit_type: u8, nal_ref_idc: u8) -> NalUnit {
    NalUnit::from_bytes(Bytes::copy_from_slice(&[(nal_ref_idc << 5) | unit_type, 0x00])).unwrap()
}

/// A 176x144 SPS: 11x9 macroblocks, max_frame_num 16, POC type 0 with
/// max_pic_order_cnt_lsb 16.
fn test_sps(profile_idc: u8, level_idc: u8, max_num_ref_frames: u32) -> Sps {
    Sps {
        profile_idc,
        level_idc,
        chroma_format_idc: 1,
        max_num_ref_frames,
        pic_width_in_mbs_minus1: 10,
        pic_height_in_map_units_minus1: 8,
        frame_mbs_only_flag: true,
        ..Default::default()
    }
}

fn slice(slice_type: SliceType, frame_num: i32, pic_order_cnt_lsb: u16) -> SliceHeader {
    SliceHeader { slice_type, frame_num, pic_order_cnt_lsb, ..Default::default() }
}

fn field_slice(slice_type: SliceType, frame_num: i32, pic_order_cnt_lsb: u16, bottom: bool) -> SliceHeader {
    SliceHeader {
        slice_type,
        frame_num,
        pic_order_cnt_lsb,
        field_pic_flag: true,
        bottom_field_flag: bottom,
        ..Default::default()
    }
}

struct Fixture {
    driver: Driver<DummyBackend, ScriptedParser>,
    next_frame: u64,
}

impl Fixture {
    fn new(backend: DummyBackend, compliance: Compliance, sps: Sps, slices: Vec<SliceHeader>) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut parser = ScriptedParser::default();
        parser.pending_sps.push_back(sps);
        parser.pending_pps.push_back(Pps::default());
        parser.pending_slices = slices.into();

        let config = DecoderConfig { compliance, ..Default::default() };
        let driver = Driver::with_parser(parser, backend, config).unwrap();
        Self { driver, next_frame: 0 }
    }

    /// Decodes one access unit made of the given NAL units, asserting the
    /// driver accepted it.
    fn decode_au(&mut self, nal_units: &[NalUnit]) {
        let status = self.try_decode_au(nal_units);
        assert!(status.is_ok(), "access unit rejected: {:?}", status);
    }

    fn try_decode_au(&mut self, nal_units: &[NalUnit]) -> FlowStatus {
        let frame = DummyFrame(self.next_frame);
        self.next_frame += 1;
        self.driver.decode_access_unit(frame, nal_units)
    }

    fn check_dpb_invariants(&self) {
        let dpb = self.driver.dpb();
        let needed = dpb.pictures().iter().filter(|p| p.borrow().data.needed_for_output).count();
        if !dpb.interlaced() {
            assert_eq!(needed, dpb.num_output_needed(), "needed-for-output count out of sync");
        }
        let cap = dpb.max_num_frames() * (1 + dpb.interlaced() as usize);
        assert!(dpb.len() <= cap, "DPB holds {} pictures, cap is {}", dpb.len(), cap);
    }

    fn outputs(&self) -> &[i32] {
        &self.driver.backend().output_order
    }
}

// A hand-assembled 176x144 baseline bitstream with pic_order_cnt_type 2:
// SPS (profile 66, level 30), PPS, one IDR slice.
const RAW_SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e, 0xda, 0x0b, 0x13, 0x80];
const RAW_PPS: &[u8] = &[0x68, 0xce];
const RAW_IDR: &[u8] = &[0x65, 0xb8, 0x40];

#[test]
fn annex_b_bytes_decode_through_the_default_parser() {
    let mut stream = Vec::new();
    stream.extend_from_slice(&[0, 0, 0, 1]);
    stream.extend_from_slice(RAW_SPS);
    stream.extend_from_slice(&[0, 0, 1]);
    stream.extend_from_slice(RAW_PPS);
    stream.extend_from_slice(&[0, 0, 1]);
    stream.extend_from_slice(RAW_IDR);

    let config = DecoderConfig { compliance: Compliance::Strict, ..Default::default() };
    let mut driver = Driver::new(DummyBackend::new(), config).unwrap();

    let status = driver.decode(DummyFrame(0), Bytes::from(stream));
    assert!(status.is_ok(), "decode failed: {:?}", status);
    driver.drain().unwrap();
    assert_eq!(driver.backend().output_order, vec![0]);
}

#[test]
fn avc_packaged_bytes_decode_after_codec_data() {
    // avcC: version 1, profile/compat/level, 4-byte NAL lengths, one SPS and
    // one PPS.
    let mut codec_data = vec![1, 0x42, 0x00, 0x1e, 0xff, 0xe1];
    codec_data.extend_from_slice(&(RAW_SPS.len() as u16).to_be_bytes());
    codec_data.extend_from_slice(RAW_SPS);
    codec_data.push(1);
    codec_data.extend_from_slice(&(RAW_PPS.len() as u16).to_be_bytes());
    codec_data.extend_from_slice(RAW_PPS);

    let config = DecoderConfig {
        stream_format: h264_dpb_core::nal::StreamFormat::Avc { nal_length_size: 4 },
        compliance: Compliance::Strict,
        ..Default::default()
    };
    let mut driver = Driver::new(DummyBackend::new(), config).unwrap();
    driver.set_codec_data(Bytes::from(codec_data)).unwrap();

    let mut au = (RAW_IDR.len() as u32).to_be_bytes().to_vec();
    au.extend_from_slice(RAW_IDR);
    let status = driver.decode(DummyFrame(0), Bytes::from(au));
    assert!(status.is_ok(), "decode failed: {:?}", status);

    driver.drain().unwrap();
    assert_eq!(driver.backend().output_order, vec![0]);
}

#[test]
fn idr_only_stream_outputs_in_input_order() {
    let slices = (0..4).map(|_| slice(SliceType::I, 0, 0)).collect();
    let mut fx = Fixture::new(DummyBackend::new(), Compliance::Strict, test_sps(66, 30, 1), slices);

    fx.decode_au(&[nal(NAL_SPS, 3), nal(NAL_PPS, 3), nal(NAL_SLICE_IDR, 1)]);
    for _ in 0..3 {
        fx.decode_au(&[nal(NAL_SLICE_IDR, 1)]);
        fx.check_dpb_invariants();
    }
    fx.driver.drain().unwrap();

    assert_eq!(fx.outputs(), &[0, 0, 0, 0]);
    assert!(fx.driver.dpb().is_empty());
    assert_eq!(fx.driver.backend().new_picture_calls, 4);
    assert_eq!(fx.driver.backend().end_picture_calls, 4);
}

#[test]
fn ippp_stream_outputs_pocs_in_order() {
    let slices = vec![
        slice(SliceType::I, 0, 0),
        slice(SliceType::P, 1, 2),
        slice(SliceType::P, 2, 4),
        slice(SliceType::P, 3, 6),
    ];
    let mut fx = Fixture::new(DummyBackend::new(), Compliance::Strict, test_sps(77, 30, 2), slices);

    fx.decode_au(&[nal(NAL_SPS, 3), nal(NAL_PPS, 3), nal(NAL_SLICE_IDR, 1)]);
    for _ in 0..3 {
        fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
        fx.check_dpb_invariants();
    }
    fx.driver.drain().unwrap();

    assert_eq!(fx.outputs(), &[0, 2, 4, 6]);
    // P slices saw one active reference each.
    assert_eq!(fx.driver.backend().slice_ref_list_sizes[1..], [(1, 0), (1, 0), (1, 0)]);
}

#[test]
fn b_reordering_defers_output_until_the_b_frame_arrives() {
    // I0 P2 B1 P4 B3 in decode order; POCs 0, 4, 2, 8, 6.
    let mut b1 = slice(SliceType::B, 2, 2);
    b1.num_ref_idx_l1_active_minus1 = 0;
    let mut b3 = slice(SliceType::B, 4, 6);
    b3.num_ref_idx_l1_active_minus1 = 0;
    let slices = vec![
        slice(SliceType::I, 0, 0),
        slice(SliceType::P, 1, 4),
        b1,
        slice(SliceType::P, 3, 8),
        b3,
    ];
    let mut sps = test_sps(77, 30, 2);
    sps.bitstream_restriction =
        Some(h264_dpb_core::parser::BitstreamRestriction { max_dec_frame_buffering: 4, num_reorder_frames: 1 });
    let mut fx = Fixture::new(DummyBackend::new(), Compliance::Normal, sps, slices);

    fx.decode_au(&[nal(NAL_SPS, 3), nal(NAL_PPS, 3), nal(NAL_SLICE_IDR, 1)]);
    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    // P2 (poc 4) must not be delivered before B1 (poc 2) has been decoded.
    assert_eq!(fx.outputs(), &[0]);

    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 0)]);
    assert_eq!(fx.outputs(), &[0, 2]);

    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 0)]);
    fx.driver.drain().unwrap();

    assert_eq!(fx.outputs(), &[0, 2, 4, 6, 8]);
}

#[test]
fn mmco_5_resets_poc_state_mid_stream() {
    let mut mmco5 = slice(SliceType::P, 2, 4);
    mmco5.dec_ref_pic_marking = RefPicMarking {
        adaptive_ref_pic_marking_mode_flag: true,
        operations: vec![Mmco::ResetAll],
        ..Default::default()
    };
    let slices = vec![
        slice(SliceType::I, 0, 0),
        slice(SliceType::P, 1, 2),
        mmco5,
        // After the reset, frame_num restarts from the reset picture's 0 and
        // the POC must come out as 2, not a wrap-around value.
        slice(SliceType::P, 1, 2),
    ];
    let mut fx = Fixture::new(DummyBackend::new(), Compliance::Strict, test_sps(77, 30, 2), slices);

    fx.decode_au(&[nal(NAL_SPS, 3), nal(NAL_PPS, 3), nal(NAL_SLICE_IDR, 1)]);
    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    // The MMCO-5 drained everything decoded before it.
    assert_eq!(fx.outputs(), &[0, 2]);

    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    fx.driver.drain().unwrap();

    assert_eq!(fx.outputs(), &[0, 2, 0, 2]);
}

#[test]
fn frame_num_gap_synthesises_non_existing_references() {
    let mut sps = test_sps(77, 30, 3);
    sps.gaps_in_frame_num_value_allowed_flag = true;
    let slices = vec![slice(SliceType::I, 0, 0), slice(SliceType::P, 3, 6)];
    let mut fx = Fixture::new(DummyBackend::new(), Compliance::Strict, sps, slices);

    fx.decode_au(&[nal(NAL_SPS, 3), nal(NAL_PPS, 3), nal(NAL_SLICE_IDR, 1)]);
    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    fx.check_dpb_invariants();

    let dpb = fx.driver.dpb();
    let fillers: Vec<i32> = dpb
        .pictures()
        .iter()
        .filter(|p| p.borrow().data.nonexisting)
        .map(|p| p.borrow().data.frame_num)
        .collect();
    assert_eq!(fillers, vec![1, 2]);
    // Sliding-window marking ran with the fillers counting as references:
    // at max_num_ref_frames = 3 the window is full, so the IDR lost its
    // reference status when the P picture was marked.
    let idr_still_ref = dpb
        .pictures()
        .iter()
        .any(|p| p.borrow().data.frame_num == 0 && p.borrow().is_ref());
    assert!(!idr_still_ref, "sliding window should have evicted the IDR");

    fx.driver.drain().unwrap();
    // The fillers are never output.
    assert_eq!(fx.outputs(), &[0, 6]);
}

#[test]
fn field_pair_with_mmco_3_promotes_the_pair_to_long_term() {
    let mut sps = test_sps(77, 30, 2);
    sps.frame_mbs_only_flag = false;

    let mut mmco3 = slice(SliceType::P, 1, 2);
    mmco3.dec_ref_pic_marking = RefPicMarking {
        adaptive_ref_pic_marking_mode_flag: true,
        operations: vec![Mmco::MarkLongTerm { difference_of_pic_nums_minus1: 0, long_term_frame_idx: 0 }],
        ..Default::default()
    };
    let mut p4 = slice(SliceType::P, 2, 4);
    p4.num_ref_idx_l0_active_minus1 = 1;

    let slices = vec![
        field_slice(SliceType::I, 0, 0, false),
        field_slice(SliceType::I, 0, 1, true),
        mmco3,
        p4,
    ];
    let mut fx = Fixture::new(DummyBackend::interlaced(), Compliance::Strict, sps, slices);

    fx.decode_au(&[nal(NAL_SPS, 3), nal(NAL_PPS, 3), nal(NAL_SLICE_IDR, 1)]);
    fx.decode_au(&[nal(NAL_SLICE_IDR, 1)]);
    assert_eq!(fx.driver.backend().new_field_picture_calls, 1);
    fx.check_dpb_invariants();

    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    // Both fields of the IDR pair are long-term now.
    {
        let dpb = fx.driver.dpb();
        let long_term: Vec<i32> = dpb
            .pictures()
            .iter()
            .filter(|p| {
                p.borrow().reference() == h264_dpb_core::decoders::h264::Reference::LongTerm
            })
            .map(|p| p.borrow().data.long_term_frame_idx)
            .collect();
        assert_eq!(long_term, vec![0, 0]);
    }

    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    // The long-term pair sits at the end of list 0, after the short-term
    // reference.
    let last_list = fx.driver.backend().slice_list0_pocs.last().unwrap().clone();
    assert_eq!(last_list, vec![Some(2), Some(0)]);

    fx.driver.drain().unwrap();
    assert_eq!(fx.outputs(), &[0, 2, 4]);
    // The second field's own routing frame was released: the pair went out
    // through the first field's frame.
    assert_eq!(fx.driver.backend().output_frames[0], DummyFrame(0));
}

#[test]
fn full_dpb_round_trip_outputs_every_picture() {
    // Level 1.0 with a 176x144 picture: 396 / 99 = 4 frame buffers.
    let mut slices = vec![slice(SliceType::I, 0, 0)];
    for i in 1..8 {
        slices.push(slice(SliceType::P, i, (2 * i) as u16));
    }
    let mut fx = Fixture::new(DummyBackend::new(), Compliance::Strict, test_sps(77, 10, 1), slices);

    fx.decode_au(&[nal(NAL_SPS, 3), nal(NAL_PPS, 3), nal(NAL_SLICE_IDR, 1)]);
    for _ in 0..7 {
        fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
        fx.check_dpb_invariants();
    }
    fx.driver.drain().unwrap();

    assert_eq!(fx.outputs(), &[0, 2, 4, 6, 8, 10, 12, 14]);
}

#[test]
fn drain_is_idempotent() {
    let slices = vec![slice(SliceType::I, 0, 0), slice(SliceType::P, 1, 2)];
    let mut fx = Fixture::new(DummyBackend::new(), Compliance::Strict, test_sps(77, 30, 2), slices);

    fx.decode_au(&[nal(NAL_SPS, 3), nal(NAL_PPS, 3), nal(NAL_SLICE_IDR, 1)]);
    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);

    fx.driver.drain().unwrap();
    assert_eq!(fx.outputs(), &[0, 2]);
    assert!(fx.driver.dpb().is_empty());

    fx.driver.drain().unwrap();
    assert_eq!(fx.outputs(), &[0, 2], "second drain must not output anything");
    assert!(fx.driver.dpb().is_empty());
}

#[test]
fn flush_discards_pending_pictures() {
    let slices = vec![slice(SliceType::I, 0, 0), slice(SliceType::P, 1, 2)];
    let mut fx = Fixture::new(DummyBackend::new(), Compliance::Strict, test_sps(77, 30, 2), slices);

    fx.decode_au(&[nal(NAL_SPS, 3), nal(NAL_PPS, 3), nal(NAL_SLICE_IDR, 1)]);
    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    assert!(fx.outputs().is_empty());

    fx.driver.flush();
    fx.driver.drain().unwrap();
    assert!(fx.outputs().is_empty(), "flushed pictures must not reach output");
}

#[test]
fn end_picture_failure_suppresses_output_but_decoding_continues() {
    let slices = vec![
        slice(SliceType::I, 0, 0),
        slice(SliceType::P, 1, 2),
        slice(SliceType::P, 2, 4),
    ];
    let mut fx = Fixture::new(DummyBackend::new(), Compliance::Strict, test_sps(77, 30, 2), slices);

    fx.decode_au(&[nal(NAL_SPS, 3), nal(NAL_PPS, 3), nal(NAL_SLICE_IDR, 1)]);

    fx.driver.backend_mut().fail_end_picture = true;
    let status = fx.try_decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    assert!(!status.is_ok(), "end_picture failure must surface");
    fx.driver.backend_mut().fail_end_picture = false;

    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    fx.driver.drain().unwrap();

    // The failed picture (poc 2) is suppressed; POC bookkeeping still
    // advanced so the following picture decodes to poc 4.
    assert_eq!(fx.outputs(), &[0, 4]);
}

#[test]
fn interlaced_stream_without_field_backend_fails_negotiation() {
    let mut sps = test_sps(77, 30, 2);
    sps.frame_mbs_only_flag = false;
    let mut fx = Fixture::new(DummyBackend::new(), Compliance::Strict, sps, Vec::new());

    let status = fx.try_decode_au(&[nal(NAL_SPS, 3)]);
    assert!(matches!(status, FlowStatus::NotNegotiated));
}

#[test]
fn output_delay_holds_back_pictures_until_drain() {
    let mut backend = DummyBackend::new();
    backend.preferred_output_delay = 2;
    let slices = (0..3)
        .map(|i| if i == 0 { slice(SliceType::I, 0, 0) } else { slice(SliceType::P, i, (2 * i) as u16) })
        .collect();
    let mut fx = Fixture::new(backend, Compliance::Normal, test_sps(66, 30, 1), slices);

    fx.decode_au(&[nal(NAL_SPS, 3), nal(NAL_PPS, 3), nal(NAL_SLICE_IDR, 1)]);
    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    fx.decode_au(&[nal(NAL_SLICE_NON_IDR, 1)]);
    // Baseline at low latency bumps every picture immediately, but the
    // output queue still holds the configured two back.
    assert!(fx.outputs().len() <= 1, "queue must hold back {} pictures", 2);

    fx.driver.drain().unwrap();
    assert_eq!(fx.outputs(), &[0, 2, 4]);
}
