// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Memory pressure checks.
//!
//! Decoded frames are accumulated in memory until a decode call returns. With large resolutions
//! and long flushes this can grow quickly, so the decoder checks the memory situation before
//! feeding and before collecting every decoded buffer, and bails out before the system gets into
//! out-of-memory territory.

use std::io;
use std::mem::MaybeUninit;

/// Source of memory statistics.
pub trait MemoryProbe {
    /// Free RAM plus free swap of the system, in bytes.
    fn free_system_memory(&self) -> io::Result<u64>;
    /// Resident set size of the current process, in bytes.
    fn resident_memory(&self) -> io::Result<u64>;
}

/// [`MemoryProbe`] reading the statistics of the running system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    fn free_system_memory(&self) -> io::Result<u64> {
        let mut info = MaybeUninit::<libc::sysinfo>::zeroed();
        // SAFETY: `info` is a valid, writable `sysinfo` structure.
        if unsafe { libc::sysinfo(info.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `sysinfo` succeeded and filled the structure.
        let info = unsafe { info.assume_init() };

        Ok((info.freeram as u64 + info.freeswap as u64) * info.mem_unit as u64)
    }

    fn resident_memory(&self) -> io::Result<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm")?;
        let pages = parse_statm_resident(&statm).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "malformed /proc/self/statm")
        })?;

        // SAFETY: `sysconf` has no memory safety requirements.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(pages * page_size as u64)
    }
}

/// Returns the number of resident pages from the content of `/proc/<pid>/statm`.
fn parse_statm_resident(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

/// Policy used to decide whether enough memory is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPolicy {
    /// Free system memory (RAM and swap) must stay above `low_watermark` bytes.
    Automatic { low_watermark: u64 },
    /// Resident memory of the process must stay below `budget` bytes.
    Managed { budget: u64 },
}

pub struct MemoryGuard {
    policy: MemoryPolicy,
    probe: Box<dyn MemoryProbe + Send>,
}

impl MemoryGuard {
    pub fn new(policy: MemoryPolicy, probe: Box<dyn MemoryProbe + Send>) -> Self {
        Self { policy, probe }
    }

    /// Build the guard for a process budget of `budget_kib` KiB, or the automatic policy with
    /// `low_watermark` if no budget is given.
    pub fn from_budget(
        budget_kib: Option<u64>,
        low_watermark: u64,
        probe: Box<dyn MemoryProbe + Send>,
    ) -> Self {
        let policy = match budget_kib {
            Some(kib) => MemoryPolicy::Managed {
                budget: kib.saturating_mul(1024),
            },
            None => MemoryPolicy::Automatic { low_watermark },
        };

        Self::new(policy, probe)
    }

    pub fn policy(&self) -> MemoryPolicy {
        self.policy
    }

    /// Returns `true` if decoding can go on without endangering the system.
    ///
    /// Statistics that cannot be read are not considered a reason to stop decoding.
    pub fn available(&self) -> bool {
        let res = match self.policy {
            MemoryPolicy::Automatic { low_watermark } => self
                .probe
                .free_system_memory()
                .map(|free| (free >= low_watermark, free)),
            MemoryPolicy::Managed { budget } => self
                .probe
                .resident_memory()
                .map(|resident| (resident < budget, resident)),
        };

        match res {
            Ok((true, _)) => true,
            Ok((false, value)) => {
                log::warn!(
                    "memory guard tripped ({:?}, current value {} bytes)",
                    self.policy,
                    value
                );
                false
            }
            Err(e) => {
                log::warn!("cannot read memory statistics, assuming available: {}", e);
                true
            }
        }
    }
}
