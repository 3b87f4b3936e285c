// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffers of one device queue and who currently owns them.
//!
//! Every buffer slot is at any time owned by exactly one party: the process (free to be filled),
//! the hardware (queued), or the consumer (holding decoded data not yet collected). Slots only
//! move between owners through the methods of [`BufferPool`], which check the current owner so a
//! buffer can never be queued twice or read while the device writes into it.

use thiserror::Error;

use crate::device::retry_on_eintr;
use crate::device::DequeuedBuffer;
use crate::device::Direction;
use crate::device::M2mDevice;
use crate::error::InitError;

/// Current owner of a buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOwnership {
    /// Owned by the process and available to be filled.
    Free,
    /// Queued to the device.
    WithHardware,
    /// Returned by the device with decoded data that has not been collected yet.
    ReadyForConsumer,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("no buffer with index {0}")]
    InvalidIndex(usize),
    #[error("buffer {0} is not queued to the device")]
    NotWithHardware(usize),
    #[error("buffer {0} is not owned by the process")]
    NotOwnedByProcess(usize),
    #[error("buffer {0} holds no decoded data")]
    NothingToConsume(usize),
    #[error("device error: {0}")]
    Device(i32),
}

struct Plane<M> {
    mapping: M,
    bytes_used: u32,
}

struct BufferSlot<M> {
    planes: Vec<Plane<M>>,
    ownership: SlotOwnership,
}

/// All the buffers allocated for one direction of the device, with their CPU mappings.
///
/// Dropping the pool unmaps every plane.
pub struct BufferPool<M> {
    direction: Direction,
    slots: Vec<BufferSlot<M>>,
}

impl<M: AsRef<[u8]> + AsMut<[u8]>> BufferPool<M> {
    /// Request `count` buffers of `num_planes` planes from `device` and map all of them.
    ///
    /// Input buffers start owned by the process. Output buffers are queued to the device right
    /// away so it can decode into them as soon as streaming starts.
    ///
    /// If anything fails, the planes mapped so far are unmapped before returning.
    pub fn allocate<D>(
        device: &mut D,
        direction: Direction,
        num_planes: usize,
        count: u32,
    ) -> Result<Self, InitError>
    where
        D: M2mDevice<Mapping = M>,
    {
        let granted = retry_on_eintr(|| device.request_buffers(direction, count))
            .map_err(InitError::from_setup_errno)?;
        if granted == 0 {
            log::error!("device granted no {:?} buffer", direction);
            return Err(InitError::InsufficientMemory);
        }
        if granted != count {
            log::debug!(
                "requested {} {:?} buffers, device granted {}",
                count,
                direction,
                granted
            );
        }

        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted as usize {
            let layouts = retry_on_eintr(|| device.query_buffer(direction, index))
                .map_err(InitError::Failed)?;
            if layouts.len() < num_planes {
                log::error!(
                    "{:?} buffer {} has {} planes, expected {}",
                    direction,
                    index,
                    layouts.len(),
                    num_planes
                );
                return Err(InitError::Failed(libc::EINVAL));
            }

            let planes = layouts
                .into_iter()
                .take(num_planes)
                .map(|layout| {
                    device
                        .map_plane(direction, index, layout)
                        .map(|mapping| Plane {
                            mapping,
                            bytes_used: 0,
                        })
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    log::error!("failed to map {:?} buffer {}: {}", direction, index, e);
                    InitError::Failed(e)
                })?;

            slots.push(BufferSlot {
                planes,
                ownership: SlotOwnership::Free,
            });
        }

        let mut pool = Self { direction, slots };
        if direction == Direction::Output {
            for index in 0..pool.len() {
                pool.give_to_hardware(device, index, false)
                    .map_err(|e| match e {
                        PoolError::Device(e) => InitError::Failed(e),
                        _ => InitError::Failed(libc::EINVAL),
                    })?;
            }
        }

        Ok(pool)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently owned by `owner`.
    pub fn count_owned_by(&self, owner: SlotOwnership) -> usize {
        self.slots.iter().filter(|s| s.ownership == owner).count()
    }

    /// Index of a slot owned by the process, if any.
    pub fn acquire_free(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.ownership == SlotOwnership::Free)
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut BufferSlot<M>, PoolError> {
        self.slots
            .get_mut(index)
            .ok_or(PoolError::InvalidIndex(index))
    }

    /// Copy as much of `data` as fits into the first plane of free slot `index`.
    ///
    /// Returns the number of bytes copied.
    pub fn fill(&mut self, index: usize, data: &[u8]) -> Result<usize, PoolError> {
        let slot = self.slot_mut(index)?;
        if slot.ownership != SlotOwnership::Free {
            return Err(PoolError::NotOwnedByProcess(index));
        }
        let plane = slot
            .planes
            .first_mut()
            .ok_or(PoolError::InvalidIndex(index))?;

        let mapping = plane.mapping.as_mut();
        let copied = data.len().min(mapping.len());
        mapping[..copied].copy_from_slice(&data[..copied]);
        plane.bytes_used = copied as u32;

        Ok(copied)
    }

    /// Queue free slot `index` to `device`. `is_last` marks the end of the input stream.
    pub fn give_to_hardware<D>(
        &mut self,
        device: &mut D,
        index: usize,
        is_last: bool,
    ) -> Result<(), PoolError>
    where
        D: M2mDevice<Mapping = M>,
    {
        let direction = self.direction;
        let slot = self.slot_mut(index)?;
        if slot.ownership != SlotOwnership::Free {
            return Err(PoolError::NotOwnedByProcess(index));
        }

        let bytes_used = slot
            .planes
            .iter()
            .map(|plane| plane.bytes_used)
            .collect::<Vec<_>>();
        retry_on_eintr(|| device.queue_buffer(direction, index, &bytes_used, is_last))
            .map_err(PoolError::Device)?;

        slot.ownership = SlotOwnership::WithHardware;

        Ok(())
    }

    /// Take back a buffer the device returned.
    ///
    /// Input slots become free again, while output slots keep their decoded data until it is
    /// consumed.
    pub fn take_from_hardware(&mut self, buffer: &DequeuedBuffer) -> Result<(), PoolError> {
        let direction = self.direction;
        let slot = self.slot_mut(buffer.index)?;
        if slot.ownership != SlotOwnership::WithHardware {
            return Err(PoolError::NotWithHardware(buffer.index));
        }

        match direction {
            Direction::Input => {
                for plane in slot.planes.iter_mut() {
                    plane.bytes_used = 0;
                }
                slot.ownership = SlotOwnership::Free;
            }
            Direction::Output => {
                for (plane, bytes_used) in slot.planes.iter_mut().zip(buffer.bytes_used.iter()) {
                    plane.bytes_used = *bytes_used;
                }
                slot.ownership = SlotOwnership::ReadyForConsumer;
            }
        }

        Ok(())
    }

    /// Append the decoded data of slot `index` to `out` and hand the slot back to the process.
    ///
    /// Returns the number of bytes appended.
    pub fn consume(&mut self, index: usize, out: &mut Vec<u8>) -> Result<usize, PoolError> {
        let slot = self.slot_mut(index)?;
        if slot.ownership != SlotOwnership::ReadyForConsumer {
            return Err(PoolError::NothingToConsume(index));
        }

        let mut appended = 0;
        for plane in slot.planes.iter_mut() {
            let data = plane.mapping.as_ref();
            let len = (plane.bytes_used as usize).min(data.len());
            out.extend_from_slice(&data[..len]);
            appended += len;
            plane.bytes_used = 0;
        }
        slot.ownership = SlotOwnership::Free;

        Ok(appended)
    }

    /// Drop the decoded data of slot `index` without collecting it.
    pub fn discard(&mut self, index: usize) -> Result<(), PoolError> {
        let slot = self.slot_mut(index)?;
        if slot.ownership != SlotOwnership::ReadyForConsumer {
            return Err(PoolError::NothingToConsume(index));
        }
        for plane in slot.planes.iter_mut() {
            plane.bytes_used = 0;
        }
        slot.ownership = SlotOwnership::Free;

        Ok(())
    }

    /// Mark every slot as owned by the process. Only valid once the queue has been stopped, as
    /// stopping a queue returns all its buffers.
    pub fn reclaim_all(&mut self) {
        for slot in self.slots.iter_mut() {
            for plane in slot.planes.iter_mut() {
                plane.bytes_used = 0;
            }
            slot.ownership = SlotOwnership::Free;
        }
    }
}
