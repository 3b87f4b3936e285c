// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::time::Duration;

/// Decoder node exposed by the Raspberry Pi stateful decoder driver.
pub const DEFAULT_DECODER_DEVICE: &str = "/dev/video10";

/// Construction-time parameters of a [`crate::Decoder`].
///
/// The frame size is fixed for the whole session: streams which resolution changes midway are not
/// supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Width of the encoded frames.
    pub width: u32,
    /// Height of the encoded frames.
    pub height: u32,
    /// Resident memory budget of the process, in KiB. If `None`, the free memory of the system is
    /// checked against `low_memory_watermark` instead.
    pub memory_budget_kib: Option<u64>,
    /// Path to the decoder device node.
    pub device_path: PathBuf,
    /// Number of buffers to request for each queue.
    pub num_buffers: u32,
    /// How long a single wait for a queue to become ready lasts.
    pub poll_timeout: Duration,
    /// Number of consecutive waits without progress before a decode call gives up.
    pub max_poll_retries: u32,
    /// Minimum amount of free RAM plus swap, in bytes, required to keep decoding when no memory
    /// budget is set.
    pub low_memory_watermark: u64,
}

impl DecoderConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_memory_budget_kib(mut self, budget: u64) -> Self {
        self.memory_budget_kib = Some(budget);
        self
    }

    pub fn with_device_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.device_path = path.into();
        self
    }

    pub fn with_num_buffers(mut self, num_buffers: u32) -> Self {
        self.num_buffers = num_buffers;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_max_poll_retries(mut self, retries: u32) -> Self {
        self.max_poll_retries = retries;
        self
    }

    pub fn with_low_memory_watermark(mut self, bytes: u64) -> Self {
        self.low_memory_watermark = bytes;
        self
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            memory_budget_kib: None,
            device_path: PathBuf::from(DEFAULT_DECODER_DEVICE),
            num_buffers: 4,
            poll_timeout: Duration::from_millis(100),
            max_poll_retries: 50,
            low_memory_watermark: 128 * 1024 * 1024,
        }
    }
}
