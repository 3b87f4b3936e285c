// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// Lifecycle state of a decoding session.
///
/// Both queues of the device always change streaming state together, so a single state covers
/// them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No device is open.
    #[default]
    Uninitialized,
    /// Device is open, formats are set and buffers allocated, but the queues are not streaming.
    Initialized,
    /// Both queues are streaming.
    Streaming,
    /// Both queues have been stopped. The session can only be unloaded from here.
    Stopped,
    /// All resources have been released.
    Unloaded,
}

impl StreamState {
    /// Whether a decode call is allowed in this state.
    pub fn can_decode(self) -> bool {
        matches!(self, Self::Initialized | Self::Streaming)
    }

    /// Whether the device queues need to be started before decoding.
    pub fn needs_streamon(self) -> bool {
        matches!(self, Self::Initialized)
    }

    /// Whether the device queues need to be stopped.
    pub fn needs_streamoff(self) -> bool {
        matches!(self, Self::Streaming)
    }

    pub(crate) fn initialized(&mut self) {
        if matches!(self, Self::Uninitialized | Self::Unloaded) {
            *self = Self::Initialized;
        }
    }

    pub(crate) fn streamon(&mut self) {
        if matches!(self, Self::Initialized) {
            *self = Self::Streaming;
        }
    }

    pub(crate) fn streamoff(&mut self) {
        if matches!(self, Self::Streaming) {
            *self = Self::Stopped;
        }
    }

    pub(crate) fn unloaded(&mut self) {
        *self = Self::Unloaded;
    }
}
