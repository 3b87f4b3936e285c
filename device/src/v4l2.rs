// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`M2mDevice`] implementation backed by a V4L2 stateful decoder node.

use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use v4l2r::bindings;
use v4l2r::bindings::v4l2_decoder_cmd;
use v4l2r::bindings::v4l2_format;
use v4l2r::bindings::v4l2_pix_format_mplane;
use v4l2r::bindings::v4l2_requestbuffers;
use v4l2r::device::poller::DeviceEvent;
use v4l2r::device::poller::PollEvent;
use v4l2r::device::poller::Poller;
use v4l2r::device::Device as V4l2Device;
use v4l2r::device::DeviceConfig;
use v4l2r::device::DeviceOpenError;
use v4l2r::ioctl::BufferFlags;
use v4l2r::ioctl::DqBufError;
use v4l2r::ioctl::DqBufIoctlError;
use v4l2r::ioctl::IntoErrno;
use v4l2r::ioctl::QueryCapError;
use v4l2r::ioctl::V4l2Buffer;
use v4l2r::ioctl::V4l2PlanesWithBacking;
use v4l2r::memory::MemoryType;

use crate::device::DequeueError;
use crate::device::DequeuedBuffer;
use crate::device::DeviceResult;
use crate::device::Direction;
use crate::device::FormatRequest;
use crate::device::M2mDevice;
use crate::device::NegotiatedFormat;
use crate::device::PlaneLayout;
use crate::mmap::PlaneMapping;

fn device_event(direction: Direction) -> DeviceEvent {
    match direction {
        Direction::Input => DeviceEvent::OutputReady,
        Direction::Output => DeviceEvent::CaptureReady,
    }
}

/// Whether `event` signals that a buffer of `direction` can be dequeued.
fn signals_ready(direction: Direction, event: &PollEvent) -> bool {
    matches!(
        (direction, event),
        (
            Direction::Input,
            PollEvent::Device(DeviceEvent::OutputReady)
        ) | (
            Direction::Output,
            PollEvent::Device(DeviceEvent::CaptureReady)
        )
    )
}

/// A V4L2 memory-to-memory decoder opened in non-blocking mode.
pub struct V4l2M2mDevice {
    device: Arc<V4l2Device>,
    poller: Poller,
    /// Direction the poller is currently listening to.
    polled: Option<Direction>,
}

impl V4l2M2mDevice {
    pub fn open(path: &Path) -> DeviceResult<Self> {
        let device =
            match V4l2Device::open(path, DeviceConfig::new().non_blocking_dqbuf()) {
                Ok(device) => Arc::new(device),
                Err(DeviceOpenError::OpenError(e)) => return Err(e as i32),
                Err(DeviceOpenError::QueryCapError(QueryCapError::IoctlError(e))) => {
                    return Err(e as i32)
                }
            };
        let poller = Poller::new(Arc::clone(&device)).map_err(|e| {
            log::error!("cannot create poller for {}: {:?}", path.display(), e);
            libc::EIO
        })?;

        log::debug!("opened decoder device {}", path.display());

        Ok(Self {
            device,
            poller,
            polled: None,
        })
    }

    /// Make the poller listen to the readiness of `direction` only.
    fn poll_direction(&mut self, direction: Direction) -> DeviceResult<()> {
        if self.polled == Some(direction) {
            return Ok(());
        }

        if let Some(previous) = self.polled.take() {
            self.poller
                .disable_event(device_event(previous))
                .map_err(|e| {
                    log::error!("cannot stop polling {:?} queue: {}", previous, e);
                    libc::EIO
                })?;
        }
        self.poller
            .enable_event(device_event(direction))
            .map_err(|e| {
                log::error!("cannot poll {:?} queue: {}", direction, e);
                libc::EIO
            })?;
        self.polled = Some(direction);

        Ok(())
    }
}

impl M2mDevice for V4l2M2mDevice {
    type Mapping = PlaneMapping;

    fn set_format(
        &mut self,
        direction: Direction,
        format: FormatRequest,
    ) -> DeviceResult<NegotiatedFormat> {
        // SAFETY: `v4l2_format` is a plain C structure for which all-zeroes is a valid value.
        let mut v4l2_format: v4l2_format = unsafe { std::mem::zeroed() };
        v4l2_format.type_ = direction.queue_type() as u32;
        v4l2_format.fmt.pix_mp = v4l2_pix_format_mplane {
            width: format.width,
            height: format.height,
            pixelformat: format.pixel_format.into(),
            field: bindings::v4l2_field_V4L2_FIELD_NONE,
            num_planes: format.num_planes as u8,
            // SAFETY: all-zeroes is a valid value for the remaining members.
            ..unsafe { std::mem::zeroed() }
        };

        let applied: v4l2_format =
            v4l2r::ioctl::s_fmt(&mut self.device, v4l2_format).map_err(IntoErrno::into_errno)?;
        // SAFETY: multi-planar queues always use the `pix_mp` member.
        let pix_mp = unsafe { applied.fmt.pix_mp };

        let negotiated = NegotiatedFormat {
            width: pix_mp.width,
            height: pix_mp.height,
            num_planes: pix_mp.num_planes as usize,
        };
        log::debug!(
            "{:?} format: requested {}x{}, got {}x{} with {} plane(s)",
            direction,
            format.width,
            format.height,
            negotiated.width,
            negotiated.height,
            negotiated.num_planes
        );

        Ok(negotiated)
    }

    fn request_buffers(&mut self, direction: Direction, count: u32) -> DeviceResult<u32> {
        let reqbufs: v4l2_requestbuffers = v4l2r::ioctl::reqbufs(
            &self.device,
            direction.queue_type(),
            MemoryType::Mmap,
            count,
        )
        .map_err(IntoErrno::into_errno)?;

        Ok(reqbufs.count)
    }

    fn query_buffer(
        &mut self,
        direction: Direction,
        index: usize,
    ) -> DeviceResult<Vec<PlaneLayout>> {
        let buffer: V4l2Buffer =
            v4l2r::ioctl::querybuf(&self.device, direction.queue_type(), index)
                .map_err(IntoErrno::into_errno)?;

        match buffer.planes_with_backing_iter() {
            V4l2PlanesWithBacking::Mmap(planes) => Ok(planes
                .map(|plane| PlaneLayout {
                    length: *plane.length,
                    mem_offset: plane.mem_offset(),
                })
                .collect()),
            _ => {
                log::error!("{:?} buffer {} is not backed by MMAP", direction, index);
                Err(libc::EINVAL)
            }
        }
    }

    fn map_plane(
        &mut self,
        direction: Direction,
        index: usize,
        plane: PlaneLayout,
    ) -> DeviceResult<Self::Mapping> {
        // SAFETY: the descriptor stays open for as long as `self.device` lives, which is longer
        // than the duration of the `mmap` call.
        let fd = unsafe { BorrowedFd::borrow_raw(self.device.as_raw_fd()) };

        PlaneMapping::new(fd, plane.mem_offset, plane.length).map_err(|e| {
            log::error!(
                "failed to map plane of {:?} buffer {}: {}",
                direction,
                index,
                e
            );
            libc::ENOMEM
        })
    }

    fn queue_buffer(
        &mut self,
        direction: Direction,
        index: usize,
        bytes_used: &[u32],
        is_last: bool,
    ) -> DeviceResult<()> {
        let mut buffer = V4l2Buffer::new(direction.queue_type(), index as u32, MemoryType::Mmap);
        // Only single-planar formats are negotiated.
        *buffer.get_first_plane_mut().bytesused = bytes_used.first().copied().unwrap_or(0);
        if is_last {
            buffer.add_flags(BufferFlags::LAST);
        }

        let _: V4l2Buffer =
            v4l2r::ioctl::qbuf(&self.device, buffer).map_err(IntoErrno::into_errno)?;

        Ok(())
    }

    fn dequeue_buffer(&mut self, direction: Direction) -> Result<DequeuedBuffer, DequeueError> {
        let buffer = match v4l2r::ioctl::dqbuf::<V4l2Buffer>(&self.device, direction.queue_type())
        {
            Ok(buffer) => buffer,
            Err(DqBufError::IoctlError(DqBufIoctlError::NotReady)) => {
                return Err(DequeueError::NotReady)
            }
            Err(DqBufError::IoctlError(DqBufIoctlError::Eos)) => {
                return Err(DequeueError::EndOfStream)
            }
            Err(e) => return Err(DequeueError::Device(e.into_errno())),
        };

        let flags = buffer.flags();

        Ok(DequeuedBuffer {
            index: buffer.index() as usize,
            bytes_used: vec![*buffer.get_first_plane().bytesused],
            is_last: flags.contains(BufferFlags::LAST),
            is_error: flags.contains(BufferFlags::ERROR),
        })
    }

    fn stream_on(&mut self, direction: Direction) -> DeviceResult<()> {
        v4l2r::ioctl::streamon(&self.device, direction.queue_type())
            .map_err(IntoErrno::into_errno)
    }

    fn stream_off(&mut self, direction: Direction) -> DeviceResult<()> {
        if self.polled == Some(direction) {
            if let Err(e) = self.poller.disable_event(device_event(direction)) {
                log::warn!("cannot stop polling {:?} queue: {}", direction, e);
            }
            self.polled = None;
        }

        v4l2r::ioctl::streamoff(&self.device, direction.queue_type())
            .map_err(IntoErrno::into_errno)
    }

    fn start_drain(&mut self) -> DeviceResult<()> {
        // SAFETY: `v4l2_decoder_cmd` is a plain C structure for which all-zeroes is a valid value.
        let mut cmd: v4l2_decoder_cmd = unsafe { std::mem::zeroed() };
        cmd.cmd = bindings::V4L2_DEC_CMD_STOP;

        let _: v4l2_decoder_cmd =
            v4l2r::ioctl::decoder_cmd(&self.device, cmd).map_err(|e| e.into_errno())?;

        Ok(())
    }

    fn wait_ready(&mut self, direction: Direction, timeout: Duration) -> DeviceResult<bool> {
        self.poll_direction(direction)?;

        let events = self
            .poller
            .poll(Some(timeout))
            .map_err(|_| libc::EIO)?;

        let mut ready = false;
        for event in events {
            ready |= signals_ready(direction, &event);
        }

        Ok(ready)
    }
}

/// Opens decoder devices.
///
/// Lets tests substitute another [`M2mDevice`] for the V4L2 one. Any
/// `FnMut(&Path) -> DeviceResult<D>` closure is an opener.
pub trait DeviceOpener {
    type Device: M2mDevice;

    fn open(&mut self, path: &Path) -> DeviceResult<Self::Device>;
}

impl<D, F> DeviceOpener for F
where
    D: M2mDevice,
    F: FnMut(&Path) -> DeviceResult<D>,
{
    type Device = D;

    fn open(&mut self, path: &Path) -> DeviceResult<D> {
        self(path)
    }
}

/// Opener of [`V4l2M2mDevice`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2DeviceOpener;

impl DeviceOpener for V4l2DeviceOpener {
    type Device = V4l2M2mDevice;

    fn open(&mut self, path: &Path) -> DeviceResult<V4l2M2mDevice> {
        V4l2M2mDevice::open(path)
    }
}
