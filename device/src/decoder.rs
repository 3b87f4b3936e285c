// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding engine driving a stateful memory-to-memory decoder.
//!
//! A [`Decoder`] goes through the states of [`StreamState`]: [`Decoder::initialize`] opens the
//! device, negotiates the formats and allocates the buffers of both queues, the first call to
//! [`Decoder::decode`] starts streaming, [`Decoder::stop`] stops it and [`Decoder::unload`]
//! releases everything.
//!
//! Every decode call is synchronous: the input bytes are copied into free input buffers, then all
//! the decoded frames the device can produce are collected, before returning. Memory pressure is
//! checked before feeding and before every drain iteration so a long flush cannot accumulate
//! more output than the system can afford.

use std::path::Path;

use v4l2r::PixelFormat;

use crate::config::DecoderConfig;
use crate::device::retry_on_eintr;
use crate::device::DequeueError;
use crate::device::DequeuedBuffer;
use crate::device::Direction;
use crate::device::FormatRequest;
use crate::device::M2mDevice;
use crate::error::DecodeError;
use crate::error::InitError;
use crate::memory::MemoryGuard;
use crate::memory::MemoryProbe;
use crate::memory::SystemMemoryProbe;
use crate::pool::BufferPool;
use crate::pool::PoolError;
use crate::pool::SlotOwnership;
use crate::state::StreamState;
use crate::v4l2::DeviceOpener;
use crate::v4l2::V4l2DeviceOpener;

const INPUT_FORMAT: &[u8; 4] = b"H264";
const OUTPUT_FORMAT: &[u8; 4] = b"YU12";
/// Both formats keep all their data in a single plane.
const NUM_PLANES: usize = 1;

/// Output of a single decode call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Planar 4:2:0 data of all the frames decoded during the call, back to back.
    pub output: Vec<u8>,
    /// Width of the frames, as rounded by the hardware.
    pub width: u32,
    /// Height of the frames, as rounded by the hardware.
    pub height: u32,
}

impl From<PoolError> for DecodeError {
    fn from(e: PoolError) -> Self {
        log::error!("buffer bookkeeping error: {}", e);
        match e {
            PoolError::Device(e) => DecodeError::Failed(e),
            _ => DecodeError::Failed(libc::EINVAL),
        }
    }
}

/// Dequeue a buffer of `direction`, retrying if interrupted.
fn dequeue<D: M2mDevice>(
    device: &mut D,
    direction: Direction,
) -> Result<DequeuedBuffer, DequeueError> {
    loop {
        match device.dequeue_buffer(direction) {
            Err(DequeueError::Device(libc::EINTR)) => continue,
            res => return res,
        }
    }
}

/// Device and buffers of an initialized decoder.
struct Session<D: M2mDevice> {
    device: D,
    input: BufferPool<D::Mapping>,
    output: BufferPool<D::Mapping>,
    /// The caller signaled that no more input will come.
    input_ended: bool,
    /// The device delivered its last decoded buffer.
    end_of_stream: bool,
}

impl<D: M2mDevice> Session<D> {
    /// Release everything in teardown order: unmap every buffer, free the buffers, then close
    /// the device.
    fn release(self) {
        let Session {
            mut device,
            input,
            output,
            ..
        } = self;

        drop(input);
        drop(output);
        for direction in [Direction::Input, Direction::Output] {
            if let Err(e) = retry_on_eintr(|| device.request_buffers(direction, 0)) {
                log::warn!("failed to free {:?} buffers: {}", direction, e);
            }
        }
        drop(device);
    }

    /// Return the index of an input buffer that can be filled, or `None` if the device still
    /// holds all of them.
    fn acquire_input_slot(&mut self) -> Result<Option<usize>, DecodeError> {
        if let Some(index) = self.input.acquire_free() {
            return Ok(Some(index));
        }

        match dequeue(&mut self.device, Direction::Input) {
            Ok(buffer) => {
                self.input.take_from_hardware(&buffer)?;
                Ok(Some(buffer.index))
            }
            Err(DequeueError::NotReady) | Err(DequeueError::EndOfStream) => Ok(None),
            Err(DequeueError::Device(e)) => {
                log::error!("failed to dequeue input buffer: {}", e);
                Err(DecodeError::Failed(e))
            }
        }
    }

    /// Copy all of `data` into input buffers and queue them.
    ///
    /// While waiting for an input buffer, decoded frames that are ready are collected into
    /// `output` so the device never stalls on a full output queue. The memory guard is not
    /// consulted here: once feeding has started, the whole chunk is handed to the device.
    fn feed(
        &mut self,
        data: &[u8],
        is_last: bool,
        config: &DecoderConfig,
        output: &mut Vec<u8>,
    ) -> Result<(), DecodeError> {
        let mut cursor = 0;
        let mut retries = 0;

        while cursor < data.len() {
            let index = match self.acquire_input_slot()? {
                Some(index) => index,
                None => {
                    let ready = retry_on_eintr(|| {
                        self.device.wait_ready(Direction::Input, config.poll_timeout)
                    })
                    .map_err(DecodeError::Failed)?;
                    if !ready {
                        self.collect_ready_output(output)?;
                    }

                    // Only a filled buffer counts as progress, a readiness event may be spurious.
                    retries += 1;
                    if retries > config.max_poll_retries {
                        log::error!(
                            "no input buffer released after {} attempts, giving up",
                            retries
                        );
                        return Err(DecodeError::Failed(libc::ETIMEDOUT));
                    }
                    continue;
                }
            };
            retries = 0;

            let copied = self.input.fill(index, &data[cursor..])?;
            cursor += copied;
            let last = is_last && cursor == data.len();
            self.input
                .give_to_hardware(&mut self.device, index, last)?;
            log::trace!("queued input buffer {} with {} bytes", index, copied);
        }

        if is_last && !self.input_ended {
            self.input_ended = true;
            // Stateful decoders only flush their pipeline once asked to.
            if let Err(e) = retry_on_eintr(|| self.device.start_drain()) {
                log::warn!("failed to send stop command to the decoder: {}", e);
            }
        }

        Ok(())
    }

    /// Collect one decoded buffer into `output` and give it back to the device.
    fn collect(
        &mut self,
        buffer: &DequeuedBuffer,
        output: &mut Vec<u8>,
    ) -> Result<(), DecodeError> {
        self.output.take_from_hardware(buffer)?;

        if buffer.is_error {
            log::warn!("decoded buffer {} is corrupted, skipping it", buffer.index);
            self.output.discard(buffer.index)?;
        } else {
            let len = self.output.consume(buffer.index, output)?;
            log::trace!("collected {} bytes from output buffer {}", len, buffer.index);
        }

        self.output
            .give_to_hardware(&mut self.device, buffer.index, false)
            .map_err(|e| {
                log::error!(
                    "failed to give output buffer {} back to the device: {}",
                    buffer.index,
                    e
                );
                match e {
                    PoolError::Device(e) => DecodeError::FreeingFailed(e),
                    _ => DecodeError::FreeingFailed(libc::EINVAL),
                }
            })?;

        if buffer.is_last {
            log::debug!("last decoded buffer received");
            self.end_of_stream = true;
        }

        Ok(())
    }

    /// Collect the decoded buffers that are already available, without waiting.
    fn collect_ready_output(&mut self, output: &mut Vec<u8>) -> Result<(), DecodeError> {
        while !self.end_of_stream {
            match dequeue(&mut self.device, Direction::Output) {
                Ok(buffer) => self.collect(&buffer, output)?,
                Err(DequeueError::NotReady) => break,
                Err(DequeueError::EndOfStream) => self.end_of_stream = true,
                Err(DequeueError::Device(e)) => {
                    log::error!("failed to dequeue output buffer: {}", e);
                    return Err(DecodeError::Failed(e));
                }
            }
        }

        Ok(())
    }

    /// Collect decoded buffers into `output` until the device needs more input, or until the
    /// last buffer once the input has ended.
    fn drain(
        &mut self,
        config: &DecoderConfig,
        guard: &MemoryGuard,
        output: &mut Vec<u8>,
    ) -> Result<(), DecodeError> {
        let mut retries = 0;

        while !self.end_of_stream {
            if !guard.available() {
                return Err(DecodeError::InsufficientMemory);
            }

            match dequeue(&mut self.device, Direction::Output) {
                Ok(buffer) => {
                    retries = 0;
                    self.collect(&buffer, output)?;
                }
                Err(DequeueError::EndOfStream) => {
                    log::debug!("output queue already delivered its last buffer");
                    self.end_of_stream = true;
                }
                Err(DequeueError::NotReady) => {
                    let ready = retry_on_eintr(|| {
                        self.device
                            .wait_ready(Direction::Output, config.poll_timeout)
                    })
                    .map_err(DecodeError::Failed)?;
                    if !ready && !self.input_ended {
                        // The device holds its output until it gets more input.
                        break;
                    }

                    retries += 1;
                    if retries > config.max_poll_retries {
                        log::error!("device did not finish flushing after {} attempts", retries);
                        return Err(DecodeError::Failed(libc::ETIMEDOUT));
                    }
                }
                Err(DequeueError::Device(e)) => {
                    log::error!("failed to dequeue output buffer: {}", e);
                    return Err(DecodeError::Failed(e));
                }
            }
        }

        Ok(())
    }
}

/// Hardware H.264 decoder.
///
/// Dropping the decoder unloads it.
pub struct Decoder<O: DeviceOpener = V4l2DeviceOpener> {
    config: DecoderConfig,
    opener: O,
    guard: MemoryGuard,
    state: StreamState,
    session: Option<Session<O::Device>>,
    /// Output dimensions negotiated with the device.
    output_size: Option<(u32, u32)>,
}

impl Decoder {
    /// Create a decoder using the V4L2 device at `config.device_path`.
    pub fn new(config: DecoderConfig) -> Self {
        Self::with_opener(config, V4l2DeviceOpener, Box::new(SystemMemoryProbe))
    }
}

impl<O: DeviceOpener> Decoder<O> {
    /// Create a decoder obtaining its device from `opener` and checking memory pressure with
    /// `probe`.
    pub fn with_opener(
        config: DecoderConfig,
        opener: O,
        probe: Box<dyn MemoryProbe + Send>,
    ) -> Self {
        let guard = MemoryGuard::from_budget(
            config.memory_budget_kib,
            config.low_memory_watermark,
            probe,
        );

        Self {
            config,
            opener,
            guard,
            state: Default::default(),
            session: None,
            output_size: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Output dimensions negotiated with the device, once initialized.
    pub fn output_size(&self) -> Option<(u32, u32)> {
        self.output_size
    }

    /// Whether the device has delivered the last frame of the stream.
    pub fn is_end_of_stream(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| session.end_of_stream)
            .unwrap_or(false)
    }

    /// Open the device, negotiate the formats and allocate the buffers of both queues.
    ///
    /// Does nothing if the decoder is already initialized. A stopped decoder is unloaded and set
    /// up again.
    pub fn initialize(&mut self) -> Result<(), InitError> {
        match self.state {
            StreamState::Initialized | StreamState::Streaming => return Ok(()),
            StreamState::Stopped => self.unload(),
            StreamState::Uninitialized | StreamState::Unloaded => (),
        }

        let (session, output_size) = self.open_session()?;
        log::info!(
            "decoder initialized on {}: {}x{} frames, {} input and {} output buffers",
            self.config.device_path.display(),
            output_size.0,
            output_size.1,
            session.input.len(),
            session.output.len(),
        );

        self.session = Some(session);
        self.output_size = Some(output_size);
        self.state.initialized();

        Ok(())
    }

    fn open_session(&mut self) -> Result<(Session<O::Device>, (u32, u32)), InitError> {
        let path: &Path = &self.config.device_path;
        let mut device = self.opener.open(path).map_err(|e| {
            log::error!("failed to open decoder device {}: {}", path.display(), e);
            InitError::DeviceNotFound
        })?;

        let input_format = retry_on_eintr(|| {
            device.set_format(
                Direction::Input,
                FormatRequest {
                    pixel_format: PixelFormat::from_fourcc(INPUT_FORMAT),
                    width: self.config.width,
                    height: self.config.height,
                    num_planes: NUM_PLANES,
                },
            )
        })
        .map_err(|e| {
            log::error!("input format rejected: {}", e);
            InitError::from_setup_errno(e)
        })?;

        let output_format = retry_on_eintr(|| {
            device.set_format(
                Direction::Output,
                FormatRequest {
                    pixel_format: PixelFormat::from_fourcc(OUTPUT_FORMAT),
                    width: self.config.width,
                    height: self.config.height,
                    num_planes: NUM_PLANES,
                },
            )
        })
        .map_err(|e| {
            log::error!("output format rejected: {}", e);
            InitError::from_setup_errno(e)
        })?;

        // Buffers are queued and dequeued with the size of their first plane only.
        for (direction, format) in [
            (Direction::Input, &input_format),
            (Direction::Output, &output_format),
        ] {
            if format.num_planes != NUM_PLANES {
                log::error!(
                    "{:?} format uses {} planes, only single-plane formats are supported",
                    direction,
                    format.num_planes
                );
                return Err(InitError::IncompatibleHardware);
            }
        }

        let num_buffers = self.config.num_buffers;
        let input = BufferPool::allocate(&mut device, Direction::Input, NUM_PLANES, num_buffers)?;
        let output = BufferPool::allocate(&mut device, Direction::Output, NUM_PLANES, num_buffers)?;

        Ok((
            Session {
                device,
                input,
                output,
                input_ended: false,
                end_of_stream: false,
            },
            (output_format.width, output_format.height),
        ))
    }

    /// Start both queues if they are not streaming yet.
    fn ensure_streaming(&mut self) -> Result<(), DecodeError> {
        if !self.state.needs_streamon() {
            return Ok(());
        }
        let session = self.session.as_mut().ok_or(DecodeError::NotInitialized)?;
        let device = &mut session.device;

        retry_on_eintr(|| device.stream_on(Direction::Input)).map_err(|e| {
            log::error!("failed to start input queue: {}", e);
            DecodeError::Failed(e)
        })?;
        if let Err(e) = retry_on_eintr(|| device.stream_on(Direction::Output)) {
            log::error!("failed to start output queue: {}", e);
            if let Err(e) = retry_on_eintr(|| device.stream_off(Direction::Input)) {
                log::warn!("failed to stop input queue again: {}", e);
            }
            return Err(DecodeError::Failed(e));
        }

        log::debug!("streaming started");
        self.state.streamon();

        Ok(())
    }

    /// Decode `input`, which is the last chunk of the stream if `is_last` is set.
    ///
    /// Returns every frame that could be decoded so far. Empty input is valid and only collects
    /// the frames that are ready. Frames the device flags as corrupted are skipped.
    ///
    /// If `InsufficientMemory` is returned before feeding, none of `input` was consumed. If it is
    /// returned while collecting frames, all of `input` was handed to the device and the frames
    /// still held by the device are returned by the next call, which should pass empty input.
    pub fn decode(&mut self, input: &[u8], is_last: bool) -> Result<DecodedFrame, DecodeError> {
        if !self.state.can_decode() {
            return Err(DecodeError::NotInitialized);
        }
        let (width, height) = self.output_size.ok_or(DecodeError::NotInitialized)?;

        if let Some(session) = &self.session {
            if !input.is_empty() && session.input_ended {
                log::error!("received {} bytes of input after the end of stream", input.len());
                return Err(DecodeError::InvalidData);
            }
        }
        if !self.guard.available() {
            return Err(DecodeError::InsufficientMemory);
        }

        self.ensure_streaming()?;

        let session = self.session.as_mut().ok_or(DecodeError::NotInitialized)?;

        let mut output = Vec::new();
        session.feed(input, is_last, &self.config, &mut output)?;
        session.drain(&self.config, &self.guard, &mut output)?;

        Ok(DecodedFrame {
            output,
            width,
            height,
        })
    }

    /// Stop both queues. Does nothing unless the decoder is streaming.
    ///
    /// A stopped decoder cannot decode anymore and can only be unloaded.
    pub fn stop(&mut self) -> Result<(), DecodeError> {
        if !self.state.needs_streamoff() {
            return Ok(());
        }
        let session = self.session.as_mut().ok_or(DecodeError::NotInitialized)?;

        let mut res = Ok(());
        for direction in [Direction::Input, Direction::Output] {
            if let Err(e) = retry_on_eintr(|| session.device.stream_off(direction)) {
                log::error!("failed to stop {:?} queue: {}", direction, e);
                res = Err(DecodeError::Failed(e));
            }
        }
        // Stopping a queue returns all its buffers.
        log::debug!(
            "reclaiming {} input and {} output buffers from the device",
            session.input.count_owned_by(SlotOwnership::WithHardware),
            session.output.count_owned_by(SlotOwnership::WithHardware)
        );
        session.input.reclaim_all();
        session.output.reclaim_all();

        log::debug!("streaming stopped");
        self.state.streamoff();

        res
    }

    /// Stop streaming, unmap all buffers and close the device. Can be called any number of
    /// times.
    pub fn unload(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("error while stopping decoder: {}", e);
        }
        if let Some(session) = self.session.take() {
            session.release();
            log::debug!("decoder unloaded");
        }
        self.output_size = None;
        self.state.unloaded();
    }
}

impl<O: DeviceOpener> Drop for Decoder<O> {
    fn drop(&mut self) {
        self.unload();
    }
}
