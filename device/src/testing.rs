// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory decoder device used to exercise the decoding engine without hardware.
//!
//! Buffer planes are backed by `memfd`s and mapped with [`PlaneMapping`], so the engine accesses
//! them exactly like it would access the planes of a real device. The "hardware" turns every
//! `bytes_per_frame` bytes of input into one frame filled with the frame's sequence number.

use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;

use crate::device::DequeueError;
use crate::device::DequeuedBuffer;
use crate::device::DeviceResult;
use crate::device::Direction;
use crate::device::FormatRequest;
use crate::device::M2mDevice;
use crate::device::NegotiatedFormat;
use crate::device::PlaneLayout;
use crate::mmap::PlaneMapping;

/// Every interaction with the fake device, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    SetFormat(Direction),
    RequestBuffers(Direction, u32),
    Map(Direction, usize),
    Unmap(Direction, usize),
    Queue(Direction, usize, Vec<u32>, bool),
    Dequeue(Direction, usize),
    StreamOn(Direction),
    StreamOff(Direction),
    Drain,
    Wait(Direction),
    Close,
}

#[derive(Default)]
pub struct FakeLog {
    pub events: Vec<FakeEvent>,
    /// All the input bytes the device received, in order.
    pub fed: Vec<u8>,
}

/// Observes a [`FakeDevice`] after it has been moved into a decoder.
#[derive(Clone, Default)]
pub struct FakeHandle(Arc<Mutex<FakeLog>>);

impl FakeHandle {
    pub fn events(&self) -> Vec<FakeEvent> {
        self.0.lock().unwrap().events.clone()
    }

    pub fn fed(&self) -> Vec<u8> {
        self.0.lock().unwrap().fed.clone()
    }

    pub fn count(&self, predicate: impl Fn(&FakeEvent) -> bool) -> usize {
        self.0
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| predicate(e))
            .count()
    }

    /// Index of the first event matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&FakeEvent) -> bool) -> Option<usize> {
        self.0.lock().unwrap().events.iter().position(predicate)
    }

    fn push(&self, event: FakeEvent) {
        self.0.lock().unwrap().events.push(event);
    }
}

/// Behavior of a [`FakeDevice`].
#[derive(Clone)]
pub struct FakeDeviceConfig {
    /// Output dimensions are rounded up to a multiple of this value.
    pub step: u32,
    pub reject_input_format: bool,
    pub reject_output_format: bool,
    /// Number of buffers granted, regardless of the number requested.
    pub input_grant: Option<u32>,
    pub output_grant: Option<u32>,
    pub reqbufs_error: Option<(Direction, i32)>,
    /// Capacity of each input buffer.
    pub input_plane_size: u32,
    /// Mapping of this buffer fails.
    pub fail_map: Option<(Direction, usize)>,
    /// Amount of input producing one decoded frame.
    pub bytes_per_frame: usize,
    pub streamon_error: Option<Direction>,
    /// Returning decoded buffers to the device fails once streaming.
    pub fail_capture_requeue: bool,
    /// Input buffers are never released by the device.
    pub hold_input: bool,
    /// Input buffers are only released once a decoded frame has been dequeued.
    pub release_input_with_output: bool,
    /// The input queue reports readiness even when no buffer can be dequeued.
    pub spurious_input_ready: bool,
    /// Frame with this sequence number is flagged as corrupted.
    pub corrupt_frame: Option<u32>,
    /// The device never delivers a buffer with the LAST flag.
    pub never_last: bool,
    /// The final frame is not flagged LAST, the end of stream is only signaled by `EPIPE`.
    pub eos_without_last: bool,
    /// Number of planes reported for the output format.
    pub output_num_planes: Option<usize>,
}

impl Default for FakeDeviceConfig {
    fn default() -> Self {
        Self {
            step: 16,
            reject_input_format: false,
            reject_output_format: false,
            input_grant: None,
            output_grant: None,
            reqbufs_error: None,
            input_plane_size: 64,
            fail_map: None,
            bytes_per_frame: 100,
            streamon_error: None,
            fail_capture_requeue: false,
            hold_input: false,
            release_input_with_output: false,
            spurious_input_ready: false,
            corrupt_frame: None,
            never_last: false,
            eos_without_last: false,
            output_num_planes: None,
        }
    }
}

pub struct FakeMapping {
    mapping: PlaneMapping,
    direction: Direction,
    index: usize,
    handle: FakeHandle,
}

impl Drop for FakeMapping {
    fn drop(&mut self) {
        self.handle.push(FakeEvent::Unmap(self.direction, self.index));
    }
}

impl AsRef<[u8]> for FakeMapping {
    fn as_ref(&self) -> &[u8] {
        self.mapping.as_ref()
    }
}

impl AsMut<[u8]> for FakeMapping {
    fn as_mut(&mut self) -> &mut [u8] {
        self.mapping.as_mut()
    }
}

pub struct FakeDevice {
    config: FakeDeviceConfig,
    handle: FakeHandle,

    output_size: (u32, u32),
    input_planes: Vec<File>,
    output_planes: Vec<File>,
    streaming: [bool; 2],

    input_done: VecDeque<usize>,
    input_held: VecDeque<usize>,
    capture_queued: VecDeque<usize>,
    pending_bytes: usize,
    frames_emitted: u32,
    draining: bool,
    last_sent: bool,
}

fn dir_index(direction: Direction) -> usize {
    match direction {
        Direction::Input => 0,
        Direction::Output => 1,
    }
}

fn new_plane(size: u32) -> File {
    let fd = memfd_create(c"fake-plane", MemFdCreateFlag::empty()).unwrap();
    let file: File = fd.into();
    file.set_len(size as u64).unwrap();
    file
}

impl FakeDevice {
    pub fn new(config: FakeDeviceConfig) -> (Self, FakeHandle) {
        let handle = FakeHandle::default();

        (
            Self {
                config,
                handle: handle.clone(),
                output_size: (0, 0),
                input_planes: Vec::new(),
                output_planes: Vec::new(),
                streaming: [false; 2],
                input_done: Default::default(),
                input_held: Default::default(),
                capture_queued: Default::default(),
                pending_bytes: 0,
                frames_emitted: 0,
                draining: false,
                last_sent: false,
            },
            handle,
        )
    }

    fn frame_size(&self) -> u32 {
        self.output_size.0 * self.output_size.1 * 3 / 2
    }

    fn planes(&self, direction: Direction) -> &Vec<File> {
        match direction {
            Direction::Input => &self.input_planes,
            Direction::Output => &self.output_planes,
        }
    }

    fn output_ready(&self) -> bool {
        let flushing = self.draining && (self.pending_bytes > 0 || !self.config.never_last);

        self.last_sent
            || (!self.capture_queued.is_empty()
                && (self.pending_bytes >= self.config.bytes_per_frame || flushing))
    }
}

impl M2mDevice for FakeDevice {
    type Mapping = FakeMapping;

    fn set_format(
        &mut self,
        direction: Direction,
        format: FormatRequest,
    ) -> DeviceResult<NegotiatedFormat> {
        self.handle.push(FakeEvent::SetFormat(direction));

        match direction {
            Direction::Input if self.config.reject_input_format => Err(libc::EINVAL),
            Direction::Output if self.config.reject_output_format => Err(libc::EINVAL),
            Direction::Input => Ok(NegotiatedFormat {
                width: format.width,
                height: format.height,
                num_planes: format.num_planes,
            }),
            Direction::Output => {
                let step = self.config.step;
                self.output_size = (
                    format.width.next_multiple_of(step),
                    format.height.next_multiple_of(step),
                );
                Ok(NegotiatedFormat {
                    width: self.output_size.0,
                    height: self.output_size.1,
                    num_planes: self.config.output_num_planes.unwrap_or(format.num_planes),
                })
            }
        }
    }

    fn request_buffers(&mut self, direction: Direction, count: u32) -> DeviceResult<u32> {
        self.handle.push(FakeEvent::RequestBuffers(direction, count));

        if let Some((dir, errno)) = self.config.reqbufs_error {
            if dir == direction {
                return Err(errno);
            }
        }

        let (granted, size) = match direction {
            Direction::Input => (
                self.config.input_grant.unwrap_or(count),
                self.config.input_plane_size,
            ),
            Direction::Output => (
                self.config.output_grant.unwrap_or(count),
                self.frame_size().max(1),
            ),
        };

        let planes = (0..granted).map(|_| new_plane(size)).collect();
        match direction {
            Direction::Input => self.input_planes = planes,
            Direction::Output => self.output_planes = planes,
        }

        Ok(granted)
    }

    fn query_buffer(
        &mut self,
        direction: Direction,
        index: usize,
    ) -> DeviceResult<Vec<PlaneLayout>> {
        let file = self.planes(direction).get(index).ok_or(libc::EINVAL)?;
        let length = file.metadata().map_err(|_| libc::EIO)?.len() as u32;

        Ok(vec![PlaneLayout {
            length,
            mem_offset: (index as u32) << 12,
        }])
    }

    fn map_plane(
        &mut self,
        direction: Direction,
        index: usize,
        plane: PlaneLayout,
    ) -> DeviceResult<Self::Mapping> {
        if self.config.fail_map == Some((direction, index)) {
            return Err(libc::ENOMEM);
        }

        let file = self.planes(direction).get(index).ok_or(libc::EINVAL)?;
        let mapping = PlaneMapping::new(file, 0, plane.length).map_err(|_| libc::EIO)?;
        self.handle.push(FakeEvent::Map(direction, index));

        Ok(FakeMapping {
            mapping,
            direction,
            index,
            handle: self.handle.clone(),
        })
    }

    fn queue_buffer(
        &mut self,
        direction: Direction,
        index: usize,
        bytes_used: &[u32],
        is_last: bool,
    ) -> DeviceResult<()> {
        if direction == Direction::Output
            && self.config.fail_capture_requeue
            && self.streaming[dir_index(Direction::Output)]
        {
            return Err(libc::EINVAL);
        }

        self.handle.push(FakeEvent::Queue(
            direction,
            index,
            bytes_used.to_vec(),
            is_last,
        ));

        match direction {
            Direction::Input => {
                let len = bytes_used.first().copied().unwrap_or(0) as usize;
                let mut data = vec![0u8; len];
                self.input_planes[index]
                    .read_exact_at(&mut data, 0)
                    .map_err(|_| libc::EIO)?;
                self.handle.0.lock().unwrap().fed.extend_from_slice(&data);

                self.pending_bytes += len;
                if is_last {
                    self.draining = true;
                }
                if self.config.hold_input || self.config.release_input_with_output {
                    self.input_held.push_back(index);
                } else {
                    self.input_done.push_back(index);
                }
            }
            Direction::Output => self.capture_queued.push_back(index),
        }

        Ok(())
    }

    fn dequeue_buffer(&mut self, direction: Direction) -> Result<DequeuedBuffer, DequeueError> {
        if !self.streaming[dir_index(direction)] {
            return Err(DequeueError::Device(libc::EINVAL));
        }

        match direction {
            Direction::Input => {
                let index = self.input_done.pop_front().ok_or(DequeueError::NotReady)?;
                self.handle.push(FakeEvent::Dequeue(direction, index));

                Ok(DequeuedBuffer {
                    index,
                    bytes_used: vec![0],
                    is_last: false,
                    is_error: false,
                })
            }
            Direction::Output => {
                if self.last_sent {
                    return Err(DequeueError::EndOfStream);
                }
                if !self.output_ready() {
                    return Err(DequeueError::NotReady);
                }
                // `output_ready` guarantees a queued buffer.
                let index = self.capture_queued.pop_front().unwrap();
                self.handle.push(FakeEvent::Dequeue(direction, index));

                let consumed = self.pending_bytes.min(self.config.bytes_per_frame);
                let frame_number = self.frames_emitted;
                let bytes_used = if consumed > 0 {
                    let frame = vec![self.frames_emitted as u8; self.frame_size() as usize];
                    self.output_planes[index]
                        .write_all_at(&frame, 0)
                        .map_err(|_| DequeueError::Device(libc::EIO))?;
                    self.pending_bytes -= consumed;
                    self.frames_emitted += 1;
                    if self.config.release_input_with_output {
                        self.input_done.extend(self.input_held.drain(..));
                    }
                    self.frame_size()
                } else {
                    0
                };

                let is_last =
                    self.draining && self.pending_bytes == 0 && !self.config.never_last;
                self.last_sent = is_last;

                Ok(DequeuedBuffer {
                    index,
                    bytes_used: vec![bytes_used],
                    is_last: is_last && !self.config.eos_without_last,
                    is_error: bytes_used > 0 && self.config.corrupt_frame == Some(frame_number),
                })
            }
        }
    }

    fn stream_on(&mut self, direction: Direction) -> DeviceResult<()> {
        if self.config.streamon_error == Some(direction) {
            return Err(libc::EIO);
        }
        self.handle.push(FakeEvent::StreamOn(direction));
        self.streaming[dir_index(direction)] = true;

        Ok(())
    }

    fn stream_off(&mut self, direction: Direction) -> DeviceResult<()> {
        self.handle.push(FakeEvent::StreamOff(direction));
        self.streaming[dir_index(direction)] = false;
        match direction {
            Direction::Input => {
                self.input_done.clear();
                self.input_held.clear();
            }
            Direction::Output => self.capture_queued.clear(),
        }

        Ok(())
    }

    fn start_drain(&mut self) -> DeviceResult<()> {
        self.handle.push(FakeEvent::Drain);
        self.draining = true;

        Ok(())
    }

    fn wait_ready(&mut self, direction: Direction, _timeout: Duration) -> DeviceResult<bool> {
        self.handle.push(FakeEvent::Wait(direction));

        Ok(match direction {
            Direction::Input => !self.input_done.is_empty() || self.config.spurious_input_ready,
            Direction::Output => self.output_ready(),
        })
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.handle.push(FakeEvent::Close);
    }
}
