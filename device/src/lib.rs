// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate decodes H.264 elementary streams using the hardware decoders exposed by Linux as
//! V4L2 stateful memory-to-memory devices.
//!
//! The compressed stream is pushed in chunks of any size through [`Decoder::decode`], which
//! returns the planar YU12 bytes of all the frames the hardware produced in the meantime. The
//! last chunk is flagged so the device flushes its pipeline and delivers its remaining frames.
//!
//! # Anatomy of the decoder
//!
//! * [`M2mDevice`] is the small set of operations the decoder needs from the device.
//!   [`v4l2::V4l2M2mDevice`] implements it on top of a `/dev/videoX` node.
//! * [`pool::BufferPool`] keeps track of the memory-mapped buffers of each queue and of who
//!   currently owns each of them.
//! * [`StreamState`] is the streaming state machine shared by both queues.
//! * [`MemoryGuard`] stops a decode call before the accumulated output puts the system under
//!   memory pressure.
//!
//! The decoder never parses the stream itself: all the bitstream handling is done by the
//! hardware.
//!
//! ```no_run
//! use v4l2_m2m_decoder::Decoder;
//! use v4l2_m2m_decoder::DecoderConfig;
//!
//! let mut decoder = Decoder::new(DecoderConfig::new(1920, 1080));
//! decoder.initialize().unwrap();
//! let frame = decoder.decode(&std::fs::read("stream.h264").unwrap(), true).unwrap();
//! println!("{}x{}: {} bytes", frame.width, frame.height, frame.output.len());
//! ```

pub mod config;
pub mod decoder;
pub mod device;
pub mod error;
pub mod memory;
pub mod mmap;
pub mod pool;
pub mod state;
#[cfg(test)]
mod testing;
pub mod v4l2;

pub use v4l2r;

pub use config::DecoderConfig;
pub use config::DEFAULT_DECODER_DEVICE;
pub use decoder::DecodedFrame;
pub use decoder::Decoder;
pub use device::Direction;
pub use device::M2mDevice;
pub use error::DecodeError;
pub use error::InitError;
pub use error::StatusCode;
pub use memory::MemoryGuard;
pub use memory::MemoryPolicy;
pub use memory::MemoryProbe;
pub use state::StreamState;
pub use v4l2::DeviceOpener;
