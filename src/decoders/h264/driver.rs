// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode-driver state machine: turns a stream of NAL units into
//! backend calls and an ordered stream of output pictures, owning the Dpb,
//! the POC calculator, the reference-list builder and the output queue.

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use log::error;
use log::trace;
use log::warn;

use crate::decoders::h264::backend::Backend;
use crate::decoders::h264::backend::Slice as BackendSlice;
use crate::decoders::h264::dpb::BumpLevel;
use crate::decoders::h264::dpb::Dpb;
use crate::decoders::h264::level_limits::derive_dpb_sizing;
use crate::decoders::h264::output_queue::OutputQueue;
use crate::decoders::h264::picture::Field;
use crate::decoders::h264::picture::H264Picture;
use crate::decoders::h264::picture::PictureHandle;
use crate::decoders::h264::picture::Reference;
use crate::decoders::h264::poc::PocCalculator;
use crate::decoders::h264::ref_list::RefList;
use crate::decoders::h264::ref_list::RefListBuilder;
use crate::error::DecoderError;
use crate::error::DecoderResult;
use crate::error::FlowStatus;
use crate::nal;
use crate::nal::Alignment;
use crate::nal::AvcDecoderConfigurationRecord;
use crate::nal::NalUnit;
use crate::nal::NalUnitType;
use crate::nal::StreamFormat;
use crate::parser::DefaultParser;
use crate::parser::Mmco;
use crate::parser::Parser;
use crate::parser::SliceHeader;
use crate::parser::SliceType;
use crate::parser::Sps;

/// How closely the decoder sticks to the letter of the output-timing model.
/// Strict keeps the full C.4.5.3 reorder window; the laxer settings bump
/// pictures out earlier on streams whose structure allows it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Compliance {
    /// Pick per stream: baseline live streams get the lowest latency, other
    /// live streams a moderate one, file playback the strict window.
    Auto,
    Strict,
    Normal,
    Flexible,
}

pub struct DecoderConfig {
    pub stream_format: StreamFormat,
    pub alignment: Alignment,
    pub compliance: Compliance,
    pub is_live: Option<bool>,
    /// Frame rate used for latency reporting, as (numerator, denominator).
    pub fps: (u32, u32),
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            stream_format: StreamFormat::AnnexB,
            alignment: Alignment::AccessUnit,
            compliance: Compliance::Auto,
            is_live: None,
            fps: (25, 1),
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> DecoderResult<()> {
        if matches!(self.stream_format, StreamFormat::Avc { .. }) && self.alignment == Alignment::Nal {
            return Err(DecoderError::UnsupportedStream(
                "AVC packaging requires access-unit alignment".into(),
            ));
        }
        if self.fps.1 == 0 {
            return Err(DecoderError::UnsupportedStream("fps denominator must be non-zero".into()));
        }
        Ok(())
    }
}

pub struct Driver<B: Backend, P: Parser = DefaultParser> {
    parser: P,
    backend: B,
    config: DecoderConfig,
    nal_length_size: u8,
    is_live: bool,

    dpb: Dpb<B::UserData>,
    output_queue: OutputQueue<B::Frame, B::UserData>,
    poc: PocCalculator,
    ref_list_builder: RefListBuilder,

    active_sps: Option<Sps>,

    current_picture: Option<PictureHandle<B::UserData>>,
    /// An unpaired first field held outside the Dpb until its complement
    /// arrives (the direct-output path for non-reference field pictures).
    last_field: Option<PictureHandle<B::UserData>>,

    // Initial reference lists built once per picture; each slice derives its
    // own modified copies from these.
    ref_pic_list_p0: Vec<PictureHandle<B::UserData>>,
    ref_pic_list_b0: Vec<PictureHandle<B::UserData>>,
    ref_pic_list_b1: Vec<PictureHandle<B::UserData>>,

    /// The frame router: maps a picture's `system_frame_number` back to the
    /// caller-owned routing handle of the access unit it was decoded from,
    /// so a picture bumped out of the Dpb long after its access unit was
    /// processed can still be delivered through `Backend::output_picture`.
    frame_pool: HashMap<u64, B::Frame>,
    current_frame_number: u64,
    next_frame_number: u64,
    current_frame_consumed: bool,

    prev_ref_frame_num: i32,
    max_frame_num: i32,
    max_long_term_frame_idx: i32,

    last_reorder_frame_number: u64,
    max_reorder_count: u64,
    preferred_output_delay: u32,
    latency: Option<Duration>,
    last_emitted_poc: i32,
    input_state_changed: bool,

    last_flow: FlowStatus,
}

impl<B: Backend> Driver<B, DefaultParser> {
    /// A driver using the built-in bit-level parser.
    pub fn new(backend: B, config: DecoderConfig) -> DecoderResult<Self> {
        Self::with_parser(DefaultParser::new(), backend, config)
    }
}

impl<B: Backend, P: Parser> Driver<B, P> {
    pub fn with_parser(parser: P, backend: B, config: DecoderConfig) -> DecoderResult<Self> {
        config.validate()?;
        let is_live = config.is_live.unwrap_or(false);
        let nal_length_size = match config.stream_format {
            StreamFormat::Avc { nal_length_size } => nal_length_size,
            StreamFormat::AnnexB => 4,
        };
        Ok(Self {
            parser,
            backend,
            config,
            nal_length_size,
            is_live,
            dpb: Dpb::new(),
            output_queue: OutputQueue::new(),
            poc: PocCalculator::new(),
            ref_list_builder: RefListBuilder::new(),
            active_sps: None,
            current_picture: None,
            last_field: None,
            ref_pic_list_p0: Vec::new(),
            ref_pic_list_b0: Vec::new(),
            ref_pic_list_b1: Vec::new(),
            frame_pool: HashMap::new(),
            current_frame_number: 0,
            next_frame_number: 0,
            current_frame_consumed: false,
            prev_ref_frame_num: 0,
            max_frame_num: 0,
            max_long_term_frame_idx: -1,
            last_reorder_frame_number: 0,
            max_reorder_count: 0,
            preferred_output_delay: 0,
            latency: None,
            last_emitted_poc: i32::MIN,
            input_state_changed: true,
            last_flow: FlowStatus::Ok,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn dpb(&self) -> &Dpb<B::UserData> {
        &self.dpb
    }

    /// The latency the caller should report upstream, recomputed whenever
    /// the observed reorder distance grows.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Applies an `avcC` decoder configuration record: adopts its NAL length
    /// size and processes the embedded SPS/PPS sets.
    pub fn set_codec_data(&mut self, data: Bytes) -> DecoderResult<()> {
        let config = AvcDecoderConfigurationRecord::parse(data)?;
        self.nal_length_size = config.nal_length_size;

        for raw in config.sps_list.iter().chain(config.pps_list.iter()) {
            let nalu = NalUnit::from_bytes(raw.clone())?;
            self.handle_nal(&nalu)?;
        }
        Ok(())
    }

    /// Splits one input buffer according to the configured stream format and
    /// decodes it as a single access unit.
    pub fn decode(&mut self, frame: B::Frame, bitstream: Bytes) -> FlowStatus {
        let units = match self.config.stream_format {
            StreamFormat::AnnexB => nal::split_annex_b(bitstream),
            StreamFormat::Avc { .. } => nal::split_avc(bitstream, self.nal_length_size),
        };
        match units {
            Ok(units) => self.decode_access_unit(frame, &units),
            Err(err) => DecoderError::Parse(err).into(),
        }
    }

    /// Decodes one access unit. `frame` is the caller's routing handle,
    /// delivered back through `Backend::output_picture` once a picture
    /// belonging to it is ready for display.
    pub fn decode_access_unit(&mut self, frame: B::Frame, nal_units: &[NalUnit]) -> FlowStatus {
        let frame_number = self.next_frame_number;
        self.next_frame_number += 1;
        self.current_frame_number = frame_number;
        self.current_frame_consumed = false;
        self.frame_pool.insert(frame_number, frame);
        self.last_flow = FlowStatus::Ok;

        let mut status = FlowStatus::Ok;
        for nalu in nal_units {
            if let Err(err) = self.handle_nal(nalu) {
                warn!("dropping access unit: {}", err);
                status.update(err.into());
                break;
            }
        }

        if status.is_ok() {
            if let Err(err) = self.finish_current_picture() {
                status.update(err.into());
            }
        } else {
            // The picture cannot be completed; its routing frame is released
            // below with the unconsumed entry.
            self.current_picture = None;
        }

        if !self.current_frame_consumed || !status.is_ok() {
            self.frame_pool.remove(&frame_number);
        }

        status.update(mem::replace(&mut self.last_flow, FlowStatus::Ok));
        status
    }

    /// Upstream flush: discard all pending state without outputting.
    pub fn flush(&mut self) {
        self.current_picture = None;
        self.output_queue.clear();
        self.clear_ref_pic_lists();
        self.last_field = None;
        self.dpb.clear();
        self.frame_pool.clear();
    }

    /// End of stream: finish the pending picture, then output everything
    /// still held back, in bump order.
    pub fn drain(&mut self) -> DecoderResult<()> {
        self.finish_current_picture()?;
        self.drain_internal();
        Ok(())
    }

    fn handle_nal(&mut self, nalu: &NalUnit) -> DecoderResult<()> {
        let Some(unit_type) = nalu.header.nal_unit_type() else {
            trace!("skipping unknown NAL unit type {}", nalu.header.nal_unit_type_raw);
            return Ok(());
        };

        match unit_type {
            NalUnitType::Sps => {
                let sps = self.parser.parse_sps(&nalu.rbsp_bytes())?;
                self.process_sps(sps)
            }
            NalUnitType::Pps => {
                self.parser.parse_pps(&nalu.rbsp_bytes())?;
                Ok(())
            }
            NalUnitType::SliceIdr | NalUnitType::SliceNonIdr => self.handle_slice(nalu),
            NalUnitType::SliceDataPartitionA
            | NalUnitType::SliceDataPartitionB
            | NalUnitType::SliceDataPartitionC => {
                Err(DecoderError::UnsupportedStream("slice data partitioning is out of scope".into()))
            }
            _ => Ok(()),
        }
    }

    fn bump_level(&self) -> BumpLevel {
        match self.config.compliance {
            Compliance::Strict => BumpLevel::NormalLatency,
            Compliance::Normal => BumpLevel::LowLatency,
            Compliance::Flexible => BumpLevel::VeryLowLatency,
            Compliance::Auto => {
                if self.is_live {
                    // Baseline-family profiles carry no B frames and never
                    // reorder.
                    let baseline =
                        self.active_sps.as_ref().map(|s| matches!(s.profile_idc, 66 | 83)).unwrap_or(false);
                    if baseline {
                        BumpLevel::VeryLowLatency
                    } else {
                        BumpLevel::LowLatency
                    }
                } else {
                    BumpLevel::NormalLatency
                }
            }
        }
    }

    fn process_sps(&mut self, sps: Sps) -> DecoderResult<()> {
        if sps.interlaced() && !self.backend.supports_field_pictures() {
            return Err(DecoderError::UnsupportedStream(
                "interlaced stream, but the backend does not implement field pictures".into(),
            ));
        }

        let strict = self.config.compliance == Compliance::Strict;
        let sizing = derive_dpb_sizing(&sps, strict);

        let changed = match &self.active_sps {
            None => true,
            Some(active) => {
                active.coded_resolution() != sps.coded_resolution()
                    || self.dpb.max_num_frames() != sizing.max_dpb_size
                    || self.dpb.interlaced() != sps.interlaced()
                    || self.dpb.max_num_reorder_frames() != sizing.max_num_reorder_frames
            }
        };

        if changed {
            debug!(
                "new sequence: {}x{}, dpb size {}, reorder {} (interlaced: {})",
                sps.coded_resolution().width,
                sps.coded_resolution().height,
                sizing.max_dpb_size,
                sizing.max_num_reorder_frames,
                sps.interlaced()
            );

            self.drain_internal();

            self.max_reorder_count = 0;
            self.last_reorder_frame_number = 0;
            self.preferred_output_delay = self.backend.get_preferred_output_delay(self.is_live);

            self.backend
                .new_sequence(&sps, sizing.max_dpb_size + self.preferred_output_delay as usize)
                .map_err(|e| DecoderError::BackendNewSequence(e.into()))?;

            self.dpb.set_max_num_frames(sizing.max_dpb_size);
            self.dpb.set_max_num_reorder_frames(sizing.max_num_reorder_frames);
            self.dpb.set_interlaced(sps.interlaced());
            self.input_state_changed = true;

            // Initial latency assumes the whole reorder window will be
            // needed; the low-latency modes instead start from zero and grow
            // as actual reordering is observed.
            let frames_delay =
                if self.bump_level() == BumpLevel::NormalLatency { sizing.max_dpb_size as u64 } else { 0 };
            self.max_reorder_count = frames_delay;
            self.latency = latency_duration(
                frames_delay + self.preferred_output_delay as u64,
                self.config.fps.0,
                self.config.fps.1,
            );
        }

        self.active_sps = Some(sps);
        Ok(())
    }

    fn handle_slice(&mut self, nalu: &NalUnit) -> DecoderResult<()> {
        let rbsp = nalu.rbsp_bytes();
        let hdr = self.parser.parse_slice_header(&rbsp, nalu.header)?;

        if self.current_picture.is_none() && hdr.first_mb_in_slice != 0 {
            return Err(DecoderError::StreamInconsistency(format!(
                "picture starts with first_mb_in_slice {}",
                hdr.first_mb_in_slice
            )));
        }

        let sps = self.active_sps.clone().ok_or_else(|| {
            DecoderError::UnsupportedStream("slice before a successfully negotiated SPS".into())
        })?;

        // A field boundary inside one input buffer: the buffer carried a
        // whole frame's worth of NAL units, but the stream coded it as two
        // field pictures. Finish the first field before starting the second.
        if self.dpb.interlaced() {
            let boundary = self.current_picture.as_ref().map(|p| {
                let p = p.borrow();
                p.data.field != Field::Frame && !p.is_second_field() && p.data.field != field_of(&hdr)
            });
            if boundary == Some(true) {
                debug!("new field within the access unit, finishing the first field");
                self.finish_current_picture()?;
            }
        }

        if self.current_picture.is_none() {
            let first_field = self.find_first_field(&hdr)?;
            self.start_new_picture(&sps, &hdr, nalu, first_field)?;
        }

        let (list0, list1) = self.build_slice_ref_lists(&sps, &hdr);
        let picture = self.current_picture.clone().unwrap();
        let slice = BackendSlice { header: &hdr, rbsp: &rbsp };
        self.backend
            .decode_slice(&picture, &slice, &list0, &list1)
            .map_err(|e| DecoderError::BackendPicture(e.into()))?;
        Ok(())
    }

    /// 8.2.4.3: every slice re-derives its reference lists from the
    /// picture-level initial lists plus its own modification commands.
    fn build_slice_ref_lists(&self, sps: &Sps, hdr: &SliceHeader) -> (RefList<B::UserData>, RefList<B::UserData>) {
        let current = self.current_picture.as_ref().unwrap().borrow();
        let max_pic_num = hdr.max_pic_num(sps);

        match hdr.slice_type {
            SliceType::P | SliceType::Sp => {
                let list0 = self.ref_list_builder.apply_modifications(
                    &self.dpb,
                    &current,
                    &self.ref_pic_list_p0,
                    hdr.ref_pic_list_modification_flag_l0,
                    &hdr.ref_pic_list_modification_l0,
                    hdr.num_ref_idx_l0_active_minus1 as usize,
                    max_pic_num,
                    self.max_long_term_frame_idx,
                );
                (list0, Vec::new())
            }
            SliceType::B => {
                let list0 = self.ref_list_builder.apply_modifications(
                    &self.dpb,
                    &current,
                    &self.ref_pic_list_b0,
                    hdr.ref_pic_list_modification_flag_l0,
                    &hdr.ref_pic_list_modification_l0,
                    hdr.num_ref_idx_l0_active_minus1 as usize,
                    max_pic_num,
                    self.max_long_term_frame_idx,
                );
                let list1 = self.ref_list_builder.apply_modifications(
                    &self.dpb,
                    &current,
                    &self.ref_pic_list_b1,
                    hdr.ref_pic_list_modification_flag_l1,
                    &hdr.ref_pic_list_modification_l1,
                    hdr.num_ref_idx_l1_active_minus1 as usize,
                    max_pic_num,
                    self.max_long_term_frame_idx,
                );
                (list0, list1)
            }
            SliceType::I | SliceType::Si => (Vec::new(), Vec::new()),
        }
    }

    /// Locates the pending first field the current slice completes, if any:
    /// either the `last_field` slot or an unpaired field at the tail of the
    /// Dpb. Returns an error (and drops a stale `last_field`) when the slice
    /// does not pair with the pending field.
    fn find_first_field(&mut self, hdr: &SliceHeader) -> DecoderResult<Option<PictureHandle<B::UserData>>> {
        let mut prev_field: Option<PictureHandle<B::UserData>> = None;
        let mut in_dpb = false;

        if self.dpb.interlaced() {
            if let Some(last) = &self.last_field {
                prev_field = Some(last.clone());
            } else if let Some(tail) = self.dpb.pictures().last() {
                let unpaired = {
                    let p = tail.borrow();
                    p.data.field != Field::Frame && p.other_field().and_then(|w| w.upgrade()).is_none()
                };
                if unpaired {
                    prev_field = Some(tail.clone());
                    in_dpb = true;
                }
            }
        }

        let Some(prev) = prev_field else {
            return Ok(None);
        };

        if !hdr.field_pic_flag {
            if !in_dpb {
                self.last_field = None;
            }
            return Err(DecoderError::StreamInconsistency(format!(
                "frame picture while the first field (poc {}) is still pending",
                prev.borrow().data.pic_order_cnt
            )));
        }

        let pairs = {
            let p = prev.borrow();
            p.data.frame_num == hdr.frame_num && p.data.field != field_of(hdr)
        };
        if !pairs {
            if !in_dpb {
                self.last_field = None;
            }
            return Err(DecoderError::StreamInconsistency(format!(
                "field (frame_num {}) does not complete the pending first field (frame_num {})",
                hdr.frame_num,
                prev.borrow().data.frame_num
            )));
        }

        Ok(Some(prev))
    }

    fn start_new_picture(
        &mut self,
        sps: &Sps,
        hdr: &SliceHeader,
        nalu: &NalUnit,
        first_field: Option<PictureHandle<B::UserData>>,
    ) -> DecoderResult<()> {
        let idr = nalu.header.is_idr();
        let nal_ref_idc = nalu.header.nal_ref_idc;

        self.max_frame_num = sps.max_frame_num();
        if idr {
            self.prev_ref_frame_num = 0;
        }
        self.handle_frame_num_gap(sps, hdr.frame_num)?;

        let picture: H264Picture<B::UserData> = H264Picture::new_from_slice_header(hdr, nal_ref_idc, idr, sps);
        let picture_rc = Rc::new(RefCell::new(picture));

        if let Some(first_field) = &first_field {
            H264Picture::set_second_field_to(first_field, &picture_rc);
            // Gap fillers have no backend state to pair up.
            if !first_field.borrow().data.nonexisting {
                self.backend
                    .new_field_picture(first_field, &picture_rc)
                    .map_err(|e| DecoderError::BackendPicture(e.into()))?;
            }
        } else {
            self.last_reorder_frame_number += 1;
            picture_rc.borrow_mut().data.reorder_frame_number = self.last_reorder_frame_number;

            let frame = self
                .frame_pool
                .get(&self.current_frame_number)
                .ok_or_else(|| DecoderError::StreamInconsistency("no routing frame for this access unit".into()))?;
            self.backend
                .new_picture(frame, &picture_rc)
                .map_err(|e| DecoderError::BackendPicture(e.into()))?;
        }

        picture_rc.borrow_mut().data.system_frame_number = self.current_frame_number;
        self.current_frame_consumed = true;

        if self.input_state_changed {
            picture_rc.borrow_mut().data.discontinuity = true;
            self.input_state_changed = false;
        }

        self.poc.compute(&mut picture_rc.borrow_mut(), sps)?;

        // C.4.4: an IDR empties the DPB, with or without outputting what it
        // holds. The second field of an IDR pair must not flush its own
        // first field, so this runs only at the start of the pair.
        if idr && first_field.is_none() {
            if hdr.dec_ref_pic_marking.no_output_of_prior_pics_flag {
                self.dpb.clear();
            } else {
                self.drain_internal();
            }
        }

        self.update_pic_nums(hdr.frame_num, field_of(hdr));
        self.prepare_ref_pic_lists(&picture_rc);

        let rbsp = nalu.rbsp_bytes();
        let slice = BackendSlice { header: hdr, rbsp: &rbsp };
        self.backend
            .start_picture(&picture_rc, &slice, &self.dpb)
            .map_err(|e| DecoderError::BackendPicture(e.into()))?;

        self.current_picture = Some(picture_rc);
        Ok(())
    }

    /// 7.4.3: synthesise the "non-existing" short-term references a
    /// frame_num jump implies, running each through sliding-window marking
    /// and insertion as if it had been decoded.
    fn handle_frame_num_gap(&mut self, sps: &Sps, frame_num: i32) -> DecoderResult<()> {
        if self.prev_ref_frame_num == frame_num
            || (self.prev_ref_frame_num + 1) % self.max_frame_num == frame_num
            || self.dpb.is_empty()
        {
            return Ok(());
        }

        if !sps.gaps_in_frame_num_value_allowed_flag {
            warn!("unexpected frame_num {} (previous {}), maybe dropped frames", frame_num, self.prev_ref_frame_num);
            return Ok(());
        }

        debug!("frame_num gap {} -> {}", self.prev_ref_frame_num, frame_num);

        let mut unused_frame_num = (self.prev_ref_frame_num + 1) % self.max_frame_num;
        while unused_frame_num != frame_num {
            let mut filler: H264Picture<B::UserData> = H264Picture::new_non_existing(unused_frame_num);
            self.poc.compute(&mut filler, sps)?;
            let filler_rc = Rc::new(RefCell::new(filler));

            self.update_pic_nums(unused_frame_num, Field::Frame);
            self.dpb.sliding_window_marking(sps.max_num_ref_frames);
            self.dpb.delete_unused();
            self.bump_dpb(BumpLevel::NormalLatency, Some(&filler_rc));

            if self.dpb.interlaced() {
                let companion = H264Picture::split_frame(&filler_rc);
                self.add_picture_to_dpb(filler_rc);
                self.add_picture_to_dpb(companion);
            } else {
                self.add_picture_to_dpb(filler_rc);
            }

            unused_frame_num = (unused_frame_num + 1) % self.max_frame_num;
        }

        Ok(())
    }

    /// 8.2.4.1: recomputes every reference picture's pic_num /
    /// long_term_pic_num relative to the current picture's frame_num and
    /// field parity.
    fn update_pic_nums(&mut self, frame_num: i32, current_field: Field) {
        for p in self.dpb.pictures() {
            let mut pic = p.borrow_mut();
            if !pic.is_ref() {
                continue;
            }

            if pic.reference() == Reference::LongTerm {
                pic.data.long_term_pic_num = match current_field {
                    Field::Frame => pic.data.long_term_frame_idx,
                    f if pic.data.field == f => 2 * pic.data.long_term_frame_idx + 1,
                    _ => 2 * pic.data.long_term_frame_idx,
                };
            } else {
                pic.data.frame_num_wrap = if pic.data.frame_num > frame_num {
                    pic.data.frame_num - self.max_frame_num
                } else {
                    pic.data.frame_num
                };
                pic.data.pic_num = match current_field {
                    Field::Frame => pic.data.frame_num_wrap,
                    f if pic.data.field == f => 2 * pic.data.frame_num_wrap + 1,
                    _ => 2 * pic.data.frame_num_wrap,
                };
            }
        }
    }

    fn prepare_ref_pic_lists(&mut self, current: &PictureHandle<B::UserData>) {
        // 8.2.4.2 only applies when at least one usable reference exists.
        if !self.dpb.has_usable_ref() {
            self.clear_ref_pic_lists();
            return;
        }

        let current = current.borrow();
        self.ref_pic_list_p0 = self.ref_list_builder.build_ref_pic_list_p(&self.dpb, &current);
        let (b0, b1) = self.ref_list_builder.build_ref_pic_lists_b(&self.dpb, &current);
        self.ref_pic_list_b0 = b0;
        self.ref_pic_list_b1 = b1;
    }

    fn clear_ref_pic_lists(&mut self) {
        self.ref_pic_list_p0.clear();
        self.ref_pic_list_b0.clear();
        self.ref_pic_list_b1.clear();
    }

    fn finish_current_picture(&mut self) -> DecoderResult<()> {
        let Some(picture) = self.current_picture.take() else {
            return Ok(());
        };

        let mut end_picture_error = None;
        if let Err(e) = self.backend.end_picture(&picture) {
            // Suppress output for this picture but keep the POC bookkeeping
            // moving, or every subsequent picture would come out wrong.
            warn!(
                "end_picture failed for frame_num {} (poc {}), marking non-existing",
                picture.borrow().data.frame_num,
                picture.borrow().data.pic_order_cnt
            );
            picture.borrow_mut().data.nonexisting = true;
            let sfn = picture.borrow().data.system_frame_number;
            self.frame_pool.remove(&sfn);
            end_picture_error = Some(DecoderError::BackendPicture(e.into()));
        }

        self.clear_ref_pic_lists();
        self.finish_picture(picture)?;

        match end_picture_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn finish_picture(&mut self, picture: PictureHandle<B::UserData>) -> DecoderResult<()> {
        let sps = self
            .active_sps
            .clone()
            .ok_or_else(|| DecoderError::UnsupportedStream("no active SPS at end of picture".into()))?;
        let level = self.bump_level();

        if picture.borrow().is_ref() {
            self.reference_picture_marking(&picture, &sps);
            self.prev_ref_frame_num = picture.borrow().data.frame_num;
        }
        self.poc.update_from_finished(&picture.borrow());

        self.dpb.delete_unused();

        // When the two fields of a pair arrived in different access units,
        // only the first field's routing frame delivers the combined output;
        // the second field's own frame is surplus.
        let surplus_frame = {
            let p = picture.borrow();
            if p.is_second_field() {
                p.other_field()
                    .and_then(|w| w.upgrade())
                    .map(|o| o.borrow().data.system_frame_number)
                    .filter(|other_sfn| *other_sfn != p.data.system_frame_number)
                    .map(|_| p.data.system_frame_number)
            } else {
                None
            }
        };
        if let Some(sfn) = surplus_frame {
            self.frame_pool.remove(&sfn);
        }

        // C.4.4
        if picture.borrow().data.mem_mgmt_5 {
            trace!("memory management operation 5, draining the DPB");
            self.drain_internal();
        }

        self.bump_dpb(level, Some(&picture));

        // C.4.5.1, C.4.5.2: references (and the second field of a reference
        // pair) always enter the DPB; a non-reference picture enters only
        // while a frame buffer is free, otherwise it is output directly.
        let insert = {
            let p = picture.borrow();
            p.is_second_field_of_complementary_ref_pair() || p.is_ref() || self.dpb.has_empty_frame_buffer()
        };

        if insert {
            // A frame in an interlaced sequence splits into a complementary
            // field pair so that later field pictures can reference each
            // field under its own pic_num.
            if self.dpb.interlaced() && picture.borrow().data.field == Field::Frame {
                let companion = H264Picture::split_frame(&picture);
                if !picture.borrow().data.nonexisting {
                    if let Err(e) = self.backend.new_field_picture(&picture, &companion) {
                        warn!("backend rejected the split field pair: {}", e);
                    }
                }
                self.add_picture_to_dpb(picture);
                self.add_picture_to_dpb(companion);
            } else {
                self.add_picture_to_dpb(picture);
            }
        } else {
            self.output_picture_directly(picture);
        }

        // Try to publish one more picture now instead of waiting for the
        // next access unit.
        if level != BumpLevel::NormalLatency {
            self.bump_dpb(level, None);
        }

        Ok(())
    }

    /// 8.2.5.1: IDR marking, adaptive MMCO marking, or the sliding-window
    /// default, in that order of precedence.
    fn reference_picture_marking(&mut self, picture: &PictureHandle<B::UserData>, sps: &Sps) {
        let marking = picture.borrow().data.dec_ref_pic_marking.clone();
        let second_of_ref_pair = picture.borrow().is_second_field_of_complementary_ref_pair();

        if picture.borrow().data.idr && !second_of_ref_pair {
            // The first field of the pair already ran the IDR marking;
            // repeating it would strip that field's own reference status.
            self.dpb.mark_all_non_ref();

            if marking.long_term_reference_flag {
                picture.borrow_mut().set_reference(Reference::LongTerm, false);
                picture.borrow_mut().data.long_term_frame_idx = 0;
                self.max_long_term_frame_idx = 0;
            } else {
                picture.borrow_mut().set_reference(Reference::ShortTerm, false);
                self.max_long_term_frame_idx = -1;
            }
            return;
        }

        if marking.adaptive_ref_pic_marking_mode_flag {
            if picture.borrow().data.nonexisting {
                warn!(
                    "memory management operations on a non-existing picture (frame_num {})",
                    picture.borrow().data.frame_num
                );
            }
            for op in &marking.operations {
                match *op {
                    Mmco::SetMaxLongTermFrameIdx { max_long_term_frame_idx_plus1 } => {
                        self.max_long_term_frame_idx = max_long_term_frame_idx_plus1 as i32 - 1;
                    }
                    Mmco::ResetAll => self.max_long_term_frame_idx = -1,
                    _ => {}
                }
                if !self.dpb.perform_mmco(op, picture) {
                    warn!("memory management operation failed, continuing with the next one");
                }
            }
            return;
        }

        // The sliding window counts frames; it runs once per pair.
        if !picture.borrow().is_second_field() {
            self.dpb.sliding_window_marking(sps.max_num_ref_frames);
        }
    }

    fn bump_dpb(&mut self, level: BumpLevel, current: Option<&PictureHandle<B::UserData>>) {
        while self.dpb.needs_bump(current, level) {
            let Some(to_output) = self.dpb.bump(false) else {
                warn!("bumping is needed but no picture can be output");
                break;
            };
            self.do_output_picture(to_output);
        }
    }

    fn add_picture_to_dpb(&mut self, picture: PictureHandle<B::UserData>) {
        if !self.dpb.interlaced() {
            debug_assert!(self.last_field.is_none());
            self.dpb.add(picture);
            return;
        }

        // A non-reference first field waits outside the DPB; if its second
        // field does enter, both of them must.
        let completes_last_field = match (&self.last_field, picture.borrow().other_field()) {
            (Some(last), Some(other)) => other.upgrade().map(|o| Rc::ptr_eq(&o, last)).unwrap_or(false),
            _ => false,
        };
        if completes_last_field {
            let first = self.last_field.take().unwrap();
            self.dpb.add(first);
        }

        self.dpb.add(picture);
    }

    /// C.4.5.2's "output directly" path. Frames go straight out; a first
    /// field waits in `last_field` for its complement, and a second field
    /// releases the pair.
    fn output_picture_directly(&mut self, picture: PictureHandle<B::UserData>) {
        if picture.borrow().data.field == Field::Frame {
            debug_assert!(self.last_field.is_none());
            self.dpb.set_last_output(&picture);
            self.do_output_picture(picture);
            return;
        }

        match self.last_field.take() {
            None => {
                if picture.borrow().is_second_field() {
                    error!(
                        "second field (poc {}) arrived without its first field pending",
                        picture.borrow().data.pic_order_cnt
                    );
                    self.last_flow.update(FlowStatus::Error(DecoderError::StreamInconsistency(
                        "second field without its first field pending".into(),
                    )));
                    return;
                }
                self.last_field = Some(picture);
            }
            Some(first) => {
                let pairs = picture
                    .borrow()
                    .other_field()
                    .and_then(|w| w.upgrade())
                    .map(|o| Rc::ptr_eq(&o, &first))
                    .unwrap_or(false);
                if !picture.borrow().is_second_field() || !pairs {
                    error!(
                        "pending first field (poc {}) is not the pair of field (poc {})",
                        first.borrow().data.pic_order_cnt,
                        picture.borrow().data.pic_order_cnt
                    );
                    self.last_flow.update(FlowStatus::Error(DecoderError::StreamInconsistency(
                        "pending first field does not pair with the current field".into(),
                    )));
                    return;
                }
                self.dpb.set_last_output(&first);
                self.do_output_picture(first);
            }
        }
    }

    fn do_output_picture(&mut self, picture: PictureHandle<B::UserData>) {
        let (poc, reorder_number, sfn, nonexisting) = {
            let p = picture.borrow();
            (p.data.pic_order_cnt, p.data.reorder_frame_number, p.data.system_frame_number, p.data.nonexisting)
        };

        debug!("outputting picture frame_num={} poc={}", picture.borrow().data.frame_num, poc);

        // POC 0 starts a new coded video sequence; within one, output order
        // must be non-decreasing.
        if poc == 0 {
            self.last_emitted_poc = i32::MIN;
        } else if poc < self.last_emitted_poc {
            warn!("outputting out of order ({} after {}), likely a broken stream", poc, self.last_emitted_poc);
        }
        self.last_emitted_poc = self.last_emitted_poc.max(poc);

        if self.last_reorder_frame_number > reorder_number {
            let diff = self.last_reorder_frame_number - reorder_number;
            if diff > self.max_reorder_count {
                self.max_reorder_count = diff;
                let total = diff + self.preferred_output_delay as u64;
                self.latency = latency_duration(total, self.config.fps.0, self.config.fps.1);
                debug!("reorder distance grew to {}, latency now {:?}", diff, self.latency);
            }
        }

        let Some(frame) = self.frame_pool.remove(&sfn) else {
            if nonexisting {
                // end_picture failed earlier and the frame was already
                // released; the picture only served as POC bookkeeping.
                debug!("dropping non-existing picture (frame {})", sfn);
            } else {
                error!("no routing frame for system frame number {}", sfn);
                self.last_flow.update(FlowStatus::Error(DecoderError::StreamInconsistency(format!(
                    "no routing frame for system frame number {}",
                    sfn
                ))));
            }
            return;
        };

        self.output_queue.push(frame, picture);
        self.drain_output_queue(self.preferred_output_delay as usize);
    }

    fn drain_output_queue(&mut self, holdback: usize) {
        while let Some(routed) = self.output_queue.pop_over(holdback) {
            let status = self.backend.output_picture(routed.frame, &routed.picture);
            if !status.is_ok() {
                warn!("output_picture returned {:?}", status);
                self.last_flow.update(status);
            }
        }
    }

    fn drain_internal(&mut self) {
        while let Some(picture) = self.dpb.bump(true) {
            self.do_output_picture(picture);
        }
        self.drain_output_queue(0);
        self.last_field = None;
        self.dpb.clear();
    }
}

fn field_of(hdr: &SliceHeader) -> Field {
    if !hdr.field_pic_flag {
        Field::Frame
    } else if hdr.bottom_field_flag {
        Field::Bottom
    } else {
        Field::Top
    }
}

fn latency_duration(frames: u64, fps_n: u32, fps_d: u32) -> Option<Duration> {
    if fps_n == 0 {
        return None;
    }
    let nanos = frames.saturating_mul(fps_d as u64).saturating_mul(1_000_000_000) / fps_n as u64;
    Some(Duration::from_nanos(nanos))
}
