// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

/// Numeric status codes, stable across releases so front-ends can report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    DeviceNotFound = 1,
    IncompatibleHardware = 2,
    InsufficientMemory = 3,
    NotInitialized = 4,
    InvalidData = 5,
    Failed = 6,
    FreeingFailed = 7,
}

/// Errors that can occur while setting up a decoding session.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    #[error("decoder device could not be opened")]
    DeviceNotFound,
    #[error("requested configuration is not supported by the hardware")]
    IncompatibleHardware,
    #[error("device did not grant any buffer")]
    InsufficientMemory,
    #[error("device error while initializing: {0}")]
    Failed(i32),
}

impl InitError {
    pub fn status(&self) -> StatusCode {
        match self {
            InitError::DeviceNotFound => StatusCode::DeviceNotFound,
            InitError::IncompatibleHardware => StatusCode::IncompatibleHardware,
            InitError::InsufficientMemory => StatusCode::InsufficientMemory,
            InitError::Failed(_) => StatusCode::Failed,
        }
    }

    /// Numeric value of [`Self::status`].
    pub fn code(&self) -> u32 {
        self.status() as u32
    }

    /// Maps the error of a setup ioctl: `EINVAL` means the device does not accept the requested
    /// parameters.
    pub(crate) fn from_setup_errno(errno: i32) -> Self {
        match errno {
            libc::EINVAL => InitError::IncompatibleHardware,
            e => InitError::Failed(e),
        }
    }
}

/// Errors that can occur during a decode call.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("decoder is not initialized")]
    NotInitialized,
    #[error("not enough memory available to keep decoding")]
    InsufficientMemory,
    #[error("invalid data provided to the decoder")]
    InvalidData,
    #[error("device error while decoding: {0}")]
    Failed(i32),
    #[error("cannot return buffer to the device: {0}")]
    FreeingFailed(i32),
}

impl DecodeError {
    pub fn status(&self) -> StatusCode {
        match self {
            DecodeError::NotInitialized => StatusCode::NotInitialized,
            DecodeError::InsufficientMemory => StatusCode::InsufficientMemory,
            DecodeError::InvalidData => StatusCode::InvalidData,
            DecodeError::Failed(_) => StatusCode::Failed,
            DecodeError::FreeingFailed(_) => StatusCode::FreeingFailed,
        }
    }

    pub fn code(&self) -> u32 {
        self.status() as u32
    }
}
