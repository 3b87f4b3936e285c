// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Abstraction over the memory-to-memory decoder endpoint.
//!
//! The decoding engine never talks to V4L2 directly. Instead it drives an implementation of
//! [`M2mDevice`], which exposes the small set of operations a stateful decoder needs: format
//! negotiation, buffer allocation and mapping, buffer exchange, streaming control and readiness
//! waits. [`crate::v4l2::V4l2M2mDevice`] is the implementation backed by a real `/dev/videoX`
//! node.

use std::time::Duration;

use v4l2r::PixelFormat;
use v4l2r::QueueType;

/// Result of a device operation. The error value is a `libc` error code.
pub type DeviceResult<T> = Result<T, i32>;

/// One of the two queues of a memory-to-memory device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Compressed bitstream going into the device (V4L2 `OUTPUT` queue).
    Input,
    /// Decoded frames coming out of the device (V4L2 `CAPTURE` queue).
    Output,
}

impl Direction {
    /// Multi-planar V4L2 queue type backing this direction.
    pub fn queue_type(self) -> QueueType {
        match self {
            Direction::Input => QueueType::VideoOutputMplane,
            Direction::Output => QueueType::VideoCaptureMplane,
        }
    }
}

/// Format requested for one direction of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub num_planes: usize,
}

/// Format actually applied by the device, which may differ from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub num_planes: usize,
}

/// Size and location of one plane of a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub length: u32,
    pub mem_offset: u32,
}

/// A buffer returned by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Index of the buffer in its queue.
    pub index: usize,
    /// Number of valid bytes in each plane.
    pub bytes_used: Vec<u32>,
    /// The buffer is the last one the device will produce for this stream.
    pub is_last: bool,
    /// The device flagged the content of this buffer as corrupted.
    pub is_error: bool,
}

/// Reasons a dequeue attempt did not return a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueError {
    /// No buffer is ready yet.
    NotReady,
    /// The queue has already returned its last buffer and will not produce more.
    EndOfStream,
    /// Any other error reported by the device.
    Device(i32),
}

/// Operations the decoding engine needs from a memory-to-memory decoder device.
///
/// Dropping the implementor closes the device.
pub trait M2mDevice {
    /// CPU mapping of a single buffer plane. The plane is unmapped when the mapping is dropped.
    type Mapping: AsRef<[u8]> + AsMut<[u8]>;

    /// Apply `format` to the queue of `direction` and return what the device settled on.
    fn set_format(
        &mut self,
        direction: Direction,
        format: FormatRequest,
    ) -> DeviceResult<NegotiatedFormat>;

    /// Request `count` MMAP buffers for `direction`. Returns the number actually granted.
    fn request_buffers(&mut self, direction: Direction, count: u32) -> DeviceResult<u32>;

    /// Return the layout of every plane of buffer `index` of `direction`.
    fn query_buffer(&mut self, direction: Direction, index: usize)
        -> DeviceResult<Vec<PlaneLayout>>;

    /// Map `plane` of buffer `index` into the address space of the process.
    fn map_plane(
        &mut self,
        direction: Direction,
        index: usize,
        plane: PlaneLayout,
    ) -> DeviceResult<Self::Mapping>;

    /// Give buffer `index` to the device. `bytes_used` contains one entry per plane, and
    /// `is_last` marks the buffer as the end of the stream.
    fn queue_buffer(
        &mut self,
        direction: Direction,
        index: usize,
        bytes_used: &[u32],
        is_last: bool,
    ) -> DeviceResult<()>;

    /// Take back a buffer the device is done with, without blocking.
    fn dequeue_buffer(&mut self, direction: Direction) -> Result<DequeuedBuffer, DequeueError>;

    fn stream_on(&mut self, direction: Direction) -> DeviceResult<()>;

    fn stream_off(&mut self, direction: Direction) -> DeviceResult<()>;

    /// Ask the device to flush all the input it has received so far. The last decoded buffer
    /// will then carry the end-of-stream marker.
    fn start_drain(&mut self) -> DeviceResult<()>;

    /// Block until a buffer of `direction` can be dequeued, or until `timeout` expires.
    ///
    /// Returns `true` if the queue became ready, `false` on timeout.
    fn wait_ready(&mut self, direction: Direction, timeout: Duration) -> DeviceResult<bool>;
}

/// Run `f` again for as long as it fails with `EINTR`.
pub fn retry_on_eintr<T, F>(mut f: F) -> DeviceResult<T>
where
    F: FnMut() -> DeviceResult<T>,
{
    loop {
        match f() {
            Err(libc::EINTR) => continue,
            res => return res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::retry_on_eintr;
    use super::Direction;

    use v4l2r::QueueType;

    #[test]
    fn retry_on_eintr_retries_until_result() {
        let mut attempts = 0;
        let res = retry_on_eintr(|| {
            attempts += 1;
            if attempts < 3 {
                Err(libc::EINTR)
            } else {
                Ok(attempts)
            }
        });

        assert_eq!(res, Ok(3));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn retry_on_eintr_returns_other_errors() {
        let mut attempts = 0;
        let res: Result<(), i32> = retry_on_eintr(|| {
            attempts += 1;
            Err(libc::EAGAIN)
        });

        assert_eq!(res, Err(libc::EAGAIN));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn direction_queue_types() {
        assert_eq!(Direction::Input.queue_type(), QueueType::VideoOutputMplane);
        assert_eq!(Direction::Output.queue_type(), QueueType::VideoCaptureMplane);
    }
}
