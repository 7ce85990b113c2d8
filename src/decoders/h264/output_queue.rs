// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The output side of the driver: a small FIFO that decouples the Dpb's
//! bump order from the rate at which the back end is asked to deliver
//! buffers. Holding `preferred_output_delay` pictures back gives a
//! pipelining back end time to finish them before delivery is demanded.

use std::collections::VecDeque;

use crate::decoders::h264::picture::PictureHandle;

/// A picture paired with the routing frame it must be delivered through.
pub struct RoutedPicture<F, B> {
    pub frame: F,
    pub picture: PictureHandle<B>,
}

pub struct OutputQueue<F, B> {
    queue: VecDeque<RoutedPicture<F, B>>,
}

impl<F, B> OutputQueue<F, B> {
    pub fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push(&mut self, frame: F, picture: PictureHandle<B>) {
        self.queue.push_back(RoutedPicture { frame, picture });
    }

    /// Pops the next picture while the queue holds more than `delay`
    /// entries. The driver calls this in a loop after each push (steady
    /// state) and with `delay == 0` when draining.
    pub fn pop_over(&mut self, delay: usize) -> Option<RoutedPicture<F, B>> {
        if self.queue.len() > delay {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// Discards every queued picture without delivering it (flush).
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl<F, B> Default for OutputQueue<F, B> {
    fn default() -> Self {
        Self::new()
    }
}
