// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc(hidden)]

//! The device side of the protocol, scripted: consumes available chains,
//! writes completions (well-formed or deliberately corrupt), and toggles the
//! suppression flags a real peer would. Drives both ring layouts so unit
//! tests and benches can exercise full round trips without a device.

use std::num::Wrapping;
use std::sync::atomic::{AtomicBool, Ordering};

use log::error;
use vmm_sys_util::eventfd::{EFD_NONBLOCK, EventFd};

use crate::barrier;
use crate::packed::{
    self, RING_EVENT_FLAGS_DISABLE, RING_EVENT_FLAGS_ENABLE, VIRTQ_DESC_F_AVAIL,
    VIRTQ_DESC_F_USED,
};
use crate::queue::{QueueTransport, Ring, VIRTQ_DESC_F_NEXT, Virtqueue};
use crate::split::{UsedElement, VIRTQ_AVAIL_F_NO_INTERRUPT, VIRTQ_USED_F_NO_NOTIFY};

/// One chain as the device read it off the ring: the buffer id it will
/// report back, and `(addr, len, flags)` per descriptor, ownership bits
/// stripped.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceChain {
    pub head: u16,
    pub segments: Vec<(u64, u32, u16)>,
}

/// A scripted peer. Consumes in order and completes one buffer at a time.
#[derive(Debug)]
pub struct FakeDevice {
    // Split: how far into the avail ring we have consumed.
    last_avail: Wrapping<u16>,
    // Packed: ring position and wrap counter of the next slot to look at.
    pos: u16,
    wrap: bool,
}

impl Default for FakeDevice {
    fn default() -> FakeDevice {
        FakeDevice::new()
    }
}

impl FakeDevice {
    pub fn new() -> FakeDevice {
        FakeDevice { last_avail: Wrapping(0), pos: 0, wrap: true }
    }

    /// Chains the driver has published that this device has not consumed yet.
    pub fn pending<C>(&self, vq: &Virtqueue<C>) -> u16 {
        let size = vq.size();
        match vq.ring() {
            Ring::Split(ring) => {
                let avail_idx = ring.avail_idx_get();
                barrier::acquire(true);
                (Wrapping(avail_idx) - self.last_avail).0
            }
            Ring::Packed(st) => {
                let mut count = 0;
                let mut pos = self.pos;
                let mut wrap = self.wrap;
                let mut budget = size;
                while budget > 0 {
                    // SAFETY: pos stays below the ring size.
                    let flags = unsafe { st.ring.desc_flags_fetch(pos, true) };
                    if !packed::is_avail(flags, wrap) {
                        break;
                    }
                    loop {
                        // SAFETY: pos stays below the ring size.
                        let desc = unsafe { st.ring.desc_get(pos) };
                        budget -= 1;
                        pos += 1;
                        if pos == size {
                            pos = 0;
                            wrap = !wrap;
                        }
                        if desc.flags & VIRTQ_DESC_F_NEXT == 0 || budget == 0 {
                            break;
                        }
                    }
                    count += 1;
                }
                count
            }
        }
    }

    /// Consumes the next available chain and completes it, reporting `len`
    /// bytes written. Returns what was read off the ring, or `None` when the
    /// driver has published nothing new.
    pub fn complete_next<C>(&mut self, vq: &mut Virtqueue<C>, len: u32) -> Option<DeviceChain> {
        let size = vq.size();
        match vq.ring_mut() {
            Ring::Split(ring) => {
                let avail_idx = ring.avail_idx_get();
                barrier::acquire(true);
                if self.last_avail.0 == avail_idx {
                    return None;
                }
                let slot = self.last_avail.0 % size;
                // SAFETY: slot is reduced modulo the ring size.
                let head = unsafe { ring.avail_ring_get(slot) };
                assert!(head < size, "avail ring entry {head} out of bounds");

                let mut segments = Vec::new();
                let mut idx = head;
                let mut ttl = size;
                loop {
                    assert!(idx < size, "descriptor link {idx} out of bounds");
                    assert!(ttl > 0, "descriptor chain loops");
                    ttl -= 1;
                    // SAFETY: idx is checked against the ring size above.
                    let desc = unsafe { ring.desc_get(idx) };
                    segments.push((desc.addr, desc.len, desc.flags));
                    if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                        break;
                    }
                    idx = desc.next;
                }

                let used_idx = ring.used_idx_get();
                let used_slot = used_idx % size;
                // SAFETY: used_slot is reduced modulo the ring size.
                unsafe { ring.used_ring_set(used_slot, UsedElement { id: u32::from(head), len }) };
                barrier::release(true);
                ring.used_idx_set(used_idx.wrapping_add(1));
                self.last_avail += Wrapping(1);
                Some(DeviceChain { head, segments })
            }
            Ring::Packed(st) => {
                let head_pos = self.pos;
                let head_wrap = self.wrap;
                // SAFETY: the cursor stays below the ring size.
                let flags = unsafe { st.ring.desc_flags_fetch(head_pos, true) };
                if !packed::is_avail(flags, head_wrap) {
                    return None;
                }
                // SAFETY: as above.
                let head = unsafe { st.ring.desc_get(head_pos) }.id;

                let mut segments = Vec::new();
                let mut ttl = size;
                loop {
                    assert!(ttl > 0, "descriptor chain loops");
                    ttl -= 1;
                    // SAFETY: the cursor stays below the ring size.
                    let desc = unsafe { st.ring.desc_get(self.pos) };
                    segments.push((
                        desc.addr,
                        desc.len,
                        desc.flags & !(VIRTQ_DESC_F_AVAIL | VIRTQ_DESC_F_USED),
                    ));
                    self.pos += 1;
                    if self.pos == size {
                        self.pos = 0;
                        self.wrap = !self.wrap;
                    }
                    if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                        break;
                    }
                }

                // One used descriptor per buffer, written back at the head
                // position with the buffer id and the written length.
                // SAFETY: head_pos is below the ring size.
                unsafe { st.ring.desc_body_set(head_pos, 0, len, head) };
                // SAFETY: as above.
                unsafe { st.ring.desc_flags_store(head_pos, packed::used_bits(head_wrap), true) };
                Some(DeviceChain { head, segments })
            }
        }
    }

    /// Writes a completion naming an arbitrary buffer id without consuming
    /// anything available. For driving the corrupt-completion paths.
    pub fn complete_raw<C>(&self, vq: &mut Virtqueue<C>, id: u16, len: u32) {
        let size = vq.size();
        match vq.ring_mut() {
            Ring::Split(ring) => {
                let used_idx = ring.used_idx_get();
                let used_slot = used_idx % size;
                // SAFETY: used_slot is reduced modulo the ring size.
                unsafe { ring.used_ring_set(used_slot, UsedElement { id: u32::from(id), len }) };
                barrier::release(true);
                ring.used_idx_set(used_idx.wrapping_add(1));
            }
            Ring::Packed(st) => {
                // SAFETY: the cursor stays below the ring size.
                unsafe { st.ring.desc_body_set(self.pos, 0, len, id) };
                // SAFETY: as above.
                unsafe { st.ring.desc_flags_store(self.pos, packed::used_bits(self.wrap), true) };
            }
        }
    }

    /// Raises the device's kick-suppression signal.
    pub fn suppress_notifications<C>(&self, vq: &mut Virtqueue<C>) {
        match vq.ring_mut() {
            Ring::Split(ring) => {
                let flags = ring.used_flags_get();
                ring.used_flags_set(flags | VIRTQ_USED_F_NO_NOTIFY);
            }
            Ring::Packed(st) => st.ring.device_event_flags_set(RING_EVENT_FLAGS_DISABLE),
        }
    }

    /// Clears the device's kick-suppression signal.
    pub fn allow_notifications<C>(&self, vq: &mut Virtqueue<C>) {
        match vq.ring_mut() {
            Ring::Split(ring) => {
                let flags = ring.used_flags_get();
                ring.used_flags_set(flags & !VIRTQ_USED_F_NO_NOTIFY);
            }
            Ring::Packed(st) => st.ring.device_event_flags_set(RING_EVENT_FLAGS_ENABLE),
        }
    }

    /// What the driver's interrupt-suppression signal currently reads as.
    pub fn interrupts_suppressed<C>(&self, vq: &Virtqueue<C>) -> bool {
        match vq.ring() {
            Ring::Split(ring) => ring.avail_flags_get() & VIRTQ_AVAIL_F_NO_INTERRUPT != 0,
            Ring::Packed(st) => st.ring.driver_event_flags_get() == RING_EVENT_FLAGS_DISABLE,
        }
    }
}

/// Reference [`QueueTransport`]: an eventfd doorbell plus an enable latch.
#[derive(Debug)]
pub struct EventFdTransport {
    doorbell: EventFd,
    enabled: AtomicBool,
}

impl EventFdTransport {
    pub fn new() -> std::io::Result<EventFdTransport> {
        Ok(EventFdTransport {
            doorbell: EventFd::new(EFD_NONBLOCK)?,
            enabled: AtomicBool::new(true),
        })
    }

    /// Flips what `queue_enabled` reports.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Drains the doorbell, returning how many kicks arrived since the last
    /// call.
    pub fn take_kicks(&self) -> u64 {
        self.doorbell.read().unwrap_or(0)
    }
}

impl QueueTransport for EventFdTransport {
    fn notify_queue(&self, queue_index: u16) {
        if let Err(err) = self.doorbell.write(1) {
            error!("failed to ring doorbell for queue {}: {:?}", queue_index, err);
        }
    }

    fn queue_enabled(&self, _queue_index: u16) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}
