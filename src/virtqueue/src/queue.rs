// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The virtqueue: one uniform queue object over either ring layout.
//!
//! A [`Virtqueue`] owns its ring memory, the free-descriptor allocator and the
//! publish/consume cursors. The peer (device, hypervisor or vDPA backend) runs
//! on an independent schedule and communicates only through the ring memory;
//! there is no lock and no blocking call anywhere in this module. Allocation
//! failure and "nothing used yet" are ordinary results.
//!
//! One queue is driven by one thread. The only cross-thread (in fact
//! cross-domain) synchronization is the barrier discipline: a release fence
//! between writing payload and exposing it through an index or flag, an
//! acquire fence between observing an index or flag and reading the payload
//! it guards, and a full fence before reading the peer's notification
//! suppression signal.

use std::num::Wrapping;

use log::{error, warn};

use crate::barrier;
use crate::packed::{
    self, PackedRing, RING_EVENT_FLAGS_DISABLE, RING_EVENT_FLAGS_ENABLE, VIRTQ_DESC_F_AVAIL,
    VIRTQ_DESC_F_USED,
};
use crate::split::{
    Descriptor, SplitRing, VIRTQ_AVAIL_F_NO_INTERRUPT, VIRTQ_USED_F_NO_NOTIFY,
};

/// Descriptor continues into the entry named by its `next` field.
pub const VIRTQ_DESC_F_NEXT: u16 = 0x1;
/// Descriptor is device-writable (the device fills it, the driver reads it).
pub const VIRTQ_DESC_F_WRITE: u16 = 0x2;
/// Descriptor refers to a table of descriptors in buffer memory.
pub const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

/// The maximum virtqueue size is 2^15.
pub const MAX_QUEUE_SIZE: u16 = 1 << 15;

/// End-of-chain marker for the free list. Equal to the maximum queue size, so
/// it can never be a valid descriptor index; this also makes free-count
/// mismatches fail loudly in debug builds rather than silently walking off.
pub const CHAIN_END: u16 = MAX_QUEUE_SIZE;

/// Virtqueue protocol and allocator errors.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum VirtqueueError {
    /// Invalid queue size {0}: must be a nonzero power of two no larger than 32768
    InvalidSize(u16),
    /// Free threshold {0} exceeds queue size {1}
    InvalidFreeThreshold(u16, u16),
    /// Descriptor chain must contain at least one segment
    EmptyChain,
    /// Not enough free descriptors: requested {requested}, available {available}
    OutOfDescriptors {
        /// Descriptors the caller asked for.
        requested: u16,
        /// Descriptors currently on the free list.
        available: u16,
    },
    /// No free descriptors left in the queue
    QueueFull,
    /// Completion references descriptor {0} which is not outstanding
    InconsistentCompletion(u16),
    /// Queue {0} is still enabled by the device; cannot reset
    ResetWhileActive(u16),
}

/// The transport capability the surrounding driver injects: how the peer is
/// signalled and whether it still holds the queue enabled. The core never
/// cares what the doorbell is (MMIO write, hypercall, eventfd), only whether
/// it must be rung.
pub trait QueueTransport {
    /// Ring the doorbell for `queue_index`.
    fn notify_queue(&self, queue_index: u16);
    /// Whether the device currently reports `queue_index` enabled.
    fn queue_enabled(&self, queue_index: u16) -> bool;
}

/// Which ring layout a queue uses, fixed at creation from the negotiated
/// feature set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingLayout {
    /// Separate descriptor table, avail ring and used ring.
    Split,
    /// Single interleaved descriptor array with ownership flag bits.
    Packed,
}

/// Construction-time queue parameters. Everything here is immutable for the
/// queue's lifetime (reset restores state, it does not renegotiate).
#[derive(Debug, Clone, Copy)]
pub struct VirtqueueConfig {
    /// Identity among sibling queues; passed through to the transport.
    pub queue_index: u16,
    /// Ring depth in descriptors; nonzero power of two, at most 2^15.
    pub size: u16,
    /// Negotiated ring layout.
    pub layout: RingLayout,
    /// Whether the peer shares our cache-coherence domain.
    pub weak_barriers: bool,
    /// Below this many free descriptors, callers should reclaim used entries
    /// before enqueuing more.
    pub free_threshold: u16,
}

/// One segment of a buffer to expose to the device.
#[derive(Debug, Clone, Copy)]
pub struct BufferSegment {
    /// Segment address as the device sees it.
    pub addr: u64,
    /// Segment length in bytes.
    pub len: u32,
    /// Whether the device writes this segment (receive) or reads it
    /// (transmit).
    pub device_writable: bool,
}

/// A completed buffer handed back by the device.
#[derive(Debug, PartialEq, Eq)]
pub struct UsedBuffer<C> {
    /// The cookie supplied at enqueue time.
    pub cookie: C,
    /// Bytes the device wrote into the chain.
    pub len: u32,
}

/// Driver-private side table entry, one per descriptor. Exists so the
/// allocator's bookkeeping never aliases wire fields whose layout the
/// protocol dictates (the packed layout has no spare field for a free-list
/// link anyway).
#[derive(Debug)]
struct DescExtra<C> {
    cookie: Option<C>,
    ndescs: u16,
    next: u16,
}

#[derive(Debug)]
pub(crate) enum Ring {
    Split(SplitRing),
    Packed(PackedState),
}

/// Packed-ring driver state that lives next to the wire ring: the producer
/// side's current AVAIL/USED bit pattern, the consumer side's wrap counter,
/// and a shadow of the last event-flags value written so unchanged values are
/// never stored again.
#[derive(Debug)]
pub(crate) struct PackedState {
    pub(crate) ring: PackedRing,
    pub(crate) cached_flags: u16,
    pub(crate) used_wrap_counter: bool,
    pub(crate) event_flags_shadow: u16,
}

/// A driver-side virtqueue over either ring layout.
///
/// Generic over the opaque per-buffer cookie `C`: ownership of the cookie
/// moves into the queue on enqueue and back out on completion, flush or
/// reset, so the buffer pool hand-off needs no callback capability.
#[derive(Debug)]
pub struct Virtqueue<C> {
    ring: Ring,
    size: u16,
    queue_index: u16,
    weak_barriers: bool,

    free_count: u16,
    free_threshold: u16,
    /// Head of the free chain through the side table; `CHAIN_END` iff
    /// `free_count == 0`.
    desc_head: u16,
    desc_tail: u16,

    /// Count of work published to the peer (split: chains; packed:
    /// descriptors, which is also the ring position). Monotonic between
    /// resets; the public avail index (split) is synced from it.
    avail_idx: Wrapping<u16>,
    /// Count of used entries consumed (split: chains; packed: descriptors).
    /// Monotonic between resets.
    used_cons_idx: Wrapping<u16>,

    desc_extra: Box<[DescExtra<C>]>,
}

impl<C> Virtqueue<C> {
    /// Creates a queue with zeroed ring memory and the free chain pre-linked
    /// 0 → 1 → … → (size-1) → END.
    pub fn new(config: VirtqueueConfig) -> Result<Virtqueue<C>, VirtqueueError> {
        let size = config.size;
        if size == 0 || size > MAX_QUEUE_SIZE || !size.is_power_of_two() {
            return Err(VirtqueueError::InvalidSize(size));
        }
        if config.free_threshold > size {
            return Err(VirtqueueError::InvalidFreeThreshold(config.free_threshold, size));
        }

        let ring = match config.layout {
            RingLayout::Split => Ring::Split(SplitRing::new(size)),
            RingLayout::Packed => Ring::Packed(PackedState {
                ring: PackedRing::new(size),
                cached_flags: packed::avail_bits(true),
                used_wrap_counter: true,
                event_flags_shadow: RING_EVENT_FLAGS_ENABLE,
            }),
        };

        let desc_extra = (0..size)
            .map(|_| DescExtra { cookie: None, ndescs: 0, next: 0 })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let mut queue = Virtqueue {
            ring,
            size,
            queue_index: config.queue_index,
            weak_barriers: config.weak_barriers,
            free_count: 0,
            free_threshold: config.free_threshold,
            desc_head: CHAIN_END,
            desc_tail: CHAIN_END,
            avail_idx: Wrapping(0),
            used_cons_idx: Wrapping(0),
            desc_extra,
        };
        queue.init_ring_state();
        Ok(queue)
    }

    /// Ring depth in descriptors.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Identity among sibling queues.
    pub fn queue_index(&self) -> u16 {
        self.queue_index
    }

    /// Which layout this queue was created with.
    pub fn layout(&self) -> RingLayout {
        match self.ring {
            Ring::Split(_) => RingLayout::Split,
            Ring::Packed(_) => RingLayout::Packed,
        }
    }

    /// Descriptors currently on the free list.
    pub fn free_count(&self) -> u16 {
        self.free_count
    }

    /// Whether no chain of any length can currently be allocated.
    pub fn is_full(&self) -> bool {
        self.free_count == 0
    }

    /// Whether callers should reclaim used entries before enqueuing more.
    pub fn below_free_threshold(&self) -> bool {
        self.free_count < self.free_threshold
    }

    /// Exposes a buffer made of `segments` to the device as one descriptor
    /// chain and records `cookie` against it.
    ///
    /// The publication is batched: the peer cannot observe the new chain
    /// until [`Self::sync_avail_index`] (called by [`Self::kick`]) runs. On
    /// the packed layout the head flag store itself publishes the chain, and
    /// the sync is a no-op.
    pub fn enqueue(&mut self, segments: &[BufferSegment], cookie: C) -> Result<(), VirtqueueError> {
        if segments.is_empty() {
            return Err(VirtqueueError::EmptyChain);
        }
        if segments.len() > usize::from(self.free_count) {
            return Err(if self.free_count == 0 {
                VirtqueueError::QueueFull
            } else {
                VirtqueueError::OutOfDescriptors {
                    requested: u16::try_from(segments.len()).unwrap_or(u16::MAX),
                    available: self.free_count,
                }
            });
        }
        // Length fits in u16: it is no larger than free_count <= 2^15.
        let n = segments.len() as u16;

        let head = self.alloc_chain(n)?;
        self.desc_extra[usize::from(head)].cookie = Some(cookie);
        self.publish_parts(
            head,
            n,
            segments.iter().map(|seg| {
                (seg.addr, seg.len, if seg.device_writable { VIRTQ_DESC_F_WRITE } else { 0 })
            }),
        );
        Ok(())
    }

    /// Exposes a single INDIRECT descriptor referencing a caller-built
    /// descriptor table of `table_len` bytes at `table_addr`.
    pub fn enqueue_indirect(
        &mut self,
        table_addr: u64,
        table_len: u32,
        cookie: C,
    ) -> Result<(), VirtqueueError> {
        let head = self.alloc_chain(1)?;
        self.desc_extra[usize::from(head)].cookie = Some(cookie);
        self.publish_parts(
            head,
            1,
            std::iter::once((table_addr, table_len, VIRTQ_DESC_F_INDIRECT)),
        );
        Ok(())
    }

    /// Release-fences and stores the public avail index the peer polls. The
    /// single point where the split-layout peer is permitted to observe new
    /// work; must run before any notification. No-op for packed, where each
    /// head flag store already publishes with release ordering.
    pub fn sync_avail_index(&mut self) {
        match &mut self.ring {
            Ring::Split(ring) => {
                barrier::release(self.weak_barriers);
                ring.avail_idx_set(self.avail_idx.0);
            }
            Ring::Packed(_) => {}
        }
    }

    /// How many completed buffers are waiting to be popped. The only polling
    /// primitive; the peer never pushes.
    pub fn used_count(&self) -> u16 {
        match &self.ring {
            Ring::Split(ring) => {
                let used_idx = ring.used_idx_get();
                barrier::acquire(self.weak_barriers);
                (Wrapping(used_idx) - self.used_cons_idx).0
            }
            Ring::Packed(st) => {
                // The packed layout has no used index to subtract; classify
                // slots forward from the consumption cursor. Bounded by the
                // number of outstanding descriptors, and purely read-only.
                let mut count = 0;
                let mut pos = self.used_cons_idx.0 % self.size;
                let mut wrap = st.used_wrap_counter;
                let mut budget = self.size - self.free_count;
                while budget > 0 {
                    // SAFETY: pos is reduced modulo the ring size.
                    let flags = unsafe { st.ring.desc_flags_fetch(pos, self.weak_barriers) };
                    if !packed::is_used(flags, wrap) {
                        break;
                    }
                    // SAFETY: pos is in bounds as above.
                    let id = unsafe { st.ring.desc_get(pos) }.id;
                    if id >= self.size {
                        break;
                    }
                    let ndescs = self.desc_extra[usize::from(id)].ndescs;
                    if ndescs == 0 || ndescs > budget {
                        // Corrupt completion; pop_used will surface it.
                        break;
                    }
                    count += 1;
                    budget -= ndescs;
                    let next = u32::from(pos) + u32::from(ndescs);
                    if next >= u32::from(self.size) {
                        wrap = !wrap;
                    }
                    pos = (next % u32::from(self.size)) as u16;
                }
                count
            }
        }
    }

    /// Pops one completed buffer, returning its cookie and the length the
    /// device reported, and returns the chain's descriptors to the free
    /// list. `Ok(None)` when nothing is used yet.
    ///
    /// A completion referencing a descriptor that is not currently
    /// outstanding means the peer (or memory) is corrupt; it is surfaced as
    /// [`VirtqueueError::InconsistentCompletion`] and the owning device
    /// should stop the queue rather than keep consuming it.
    pub fn pop_used(&mut self) -> Result<Option<UsedBuffer<C>>, VirtqueueError> {
        match &self.ring {
            Ring::Split(ring) => {
                if self.used_count() == 0 {
                    return Ok(None);
                }
                let slot = self.used_cons_idx.0 % self.size;
                // SAFETY: slot is reduced modulo the ring size.
                let elem = unsafe { ring.used_ring_get(slot) };
                let id = self.check_outstanding_u32(elem.id)?;
                let Some(cookie) = self.free_chain(id) else {
                    return Err(VirtqueueError::InconsistentCompletion(id));
                };
                self.used_cons_idx += Wrapping(1);
                Ok(Some(UsedBuffer { cookie, len: elem.len }))
            }
            Ring::Packed(st) => {
                let pos = self.used_cons_idx.0 % self.size;
                // SAFETY: pos is reduced modulo the ring size.
                let flags = unsafe { st.ring.desc_flags_fetch(pos, self.weak_barriers) };
                if !packed::is_used(flags, st.used_wrap_counter) {
                    return Ok(None);
                }
                // SAFETY: pos is in bounds as above.
                let desc = unsafe { st.ring.desc_get(pos) };
                let id = self.check_outstanding_u32(u32::from(desc.id))?;
                let ndescs = self.desc_extra[usize::from(id)].ndescs;
                if ndescs == 0 {
                    error!("used descriptor {} does not head an outstanding chain", id);
                    return Err(VirtqueueError::InconsistentCompletion(id));
                }

                if u32::from(pos) + u32::from(ndescs) >= u32::from(self.size) {
                    // Consumption passed the ring end; the next pass uses the
                    // opposite wrap value.
                    let Ring::Packed(st) = &mut self.ring else { unreachable!() };
                    st.used_wrap_counter = !st.used_wrap_counter;
                }
                self.used_cons_idx += Wrapping(ndescs);
                let Some(cookie) = self.free_chain(id) else {
                    return Err(VirtqueueError::InconsistentCompletion(id));
                };
                Ok(Some(UsedBuffer { cookie, len: desc.len }))
            }
        }
    }

    /// Drains every currently-used entry without re-enabling anything,
    /// returning the completed buffers so their cookies are not stranded.
    /// Meant for shutdown paths.
    pub fn flush_used(&mut self) -> Result<Vec<UsedBuffer<C>>, VirtqueueError> {
        let mut drained = Vec::new();
        while let Some(buf) = self.pop_used()? {
            drained.push(buf);
        }
        Ok(drained)
    }

    /// Returns the `num`-descriptor run ending at `desc_idx` (inclusive,
    /// wrapping modulo the ring size) to the free list in one step, yielding
    /// any cookies recorded on heads within the run.
    ///
    /// For devices that complete buffers in ring order, this replaces
    /// per-chain reclamation; the caller remains responsible for consuming
    /// the corresponding used entries.
    pub fn free_inorder(&mut self, desc_idx: u16, num: u16) -> Result<Vec<C>, VirtqueueError> {
        if num == 0 {
            return Ok(Vec::new());
        }
        if desc_idx >= self.size || num > self.size - self.free_count {
            error!(
                "in-order free of {} descriptors at {} exceeds the {} outstanding",
                num,
                desc_idx,
                self.size - self.free_count
            );
            return Err(VirtqueueError::InconsistentCompletion(desc_idx));
        }

        let size = u32::from(self.size);
        let start = ((u32::from(desc_idx) + size - u32::from(num) + 1) % size) as u16;

        let mut cookies = Vec::new();
        for i in 0..num {
            let idx = ((u32::from(start) + u32::from(i)) % size) as u16;
            let extra = &mut self.desc_extra[usize::from(idx)];
            if let Some(cookie) = extra.cookie.take() {
                cookies.push(cookie);
            }
            extra.ndescs = 0;
            extra.next = if i + 1 < num {
                ((u32::from(start) + u32::from(i) + 1) % size) as u16
            } else {
                CHAIN_END
            };
        }

        if self.desc_tail == CHAIN_END {
            self.desc_head = start;
        } else {
            self.desc_extra[usize::from(self.desc_tail)].next = start;
        }
        self.desc_tail = desc_idx;
        self.free_count += num;
        Ok(cookies)
    }

    /// Asks the device not to interrupt on used buffers. Advisory: the
    /// device may still interrupt.
    pub fn disable_interrupts(&mut self) {
        match &mut self.ring {
            Ring::Split(ring) => {
                let flags = ring.avail_flags_get();
                ring.avail_flags_set(flags | VIRTQ_AVAIL_F_NO_INTERRUPT);
            }
            Ring::Packed(st) => {
                // Write only on change; the shadow saves the store.
                if st.event_flags_shadow != RING_EVENT_FLAGS_DISABLE {
                    st.event_flags_shadow = RING_EVENT_FLAGS_DISABLE;
                    st.ring.driver_event_flags_set(RING_EVENT_FLAGS_DISABLE);
                }
            }
        }
    }

    /// Asks the device to interrupt on used buffers again.
    pub fn enable_interrupts(&mut self) {
        match &mut self.ring {
            Ring::Split(ring) => {
                let flags = ring.avail_flags_get();
                ring.avail_flags_set(flags & !VIRTQ_AVAIL_F_NO_INTERRUPT);
            }
            Ring::Packed(st) => {
                if st.event_flags_shadow == RING_EVENT_FLAGS_DISABLE {
                    st.event_flags_shadow = RING_EVENT_FLAGS_ENABLE;
                    st.ring.driver_event_flags_set(RING_EVENT_FLAGS_ENABLE);
                }
            }
        }
    }

    /// Whether the peer must be notified about work published since the last
    /// kick. Full-fences first so the peer's suppression flag is read only
    /// after it can have seen the just-published avail index or head flags.
    pub fn kick_prepare(&self) -> bool {
        barrier::full(self.weak_barriers);
        match &self.ring {
            Ring::Split(ring) => ring.used_flags_get() & VIRTQ_USED_F_NO_NOTIFY == 0,
            Ring::Packed(st) => st.ring.device_event_flags_get() != RING_EVENT_FLAGS_DISABLE,
        }
    }

    /// Publishes the batched avail index, then notifies the peer through the
    /// injected transport if (and only if) the peer asks for it. Returns
    /// whether the doorbell was rung.
    pub fn kick<T: QueueTransport + ?Sized>(&mut self, transport: &T) -> bool {
        self.sync_avail_index();
        if self.kick_prepare() {
            transport.notify_queue(self.queue_index);
            true
        } else {
            false
        }
    }

    /// Restores the queue to its just-created state without reallocating:
    /// re-zeroes the ring, re-links the free chain and zeroes every cursor
    /// and wrap counter. Outstanding cookies are returned so the caller can
    /// release the buffers.
    ///
    /// Fails with [`VirtqueueError::ResetWhileActive`] while the device still
    /// reports the queue enabled.
    pub fn reset<T: QueueTransport + ?Sized>(
        &mut self,
        transport: &T,
    ) -> Result<Vec<C>, VirtqueueError> {
        if transport.queue_enabled(self.queue_index) {
            warn!("reset of queue {} refused: device still reports it enabled", self.queue_index);
            return Err(VirtqueueError::ResetWhileActive(self.queue_index));
        }
        let cookies = self.desc_extra.iter_mut().filter_map(|extra| extra.cookie.take()).collect();
        self.init_ring_state();
        Ok(cookies)
    }

    pub(crate) fn ring(&self) -> &Ring {
        &self.ring
    }

    pub(crate) fn ring_mut(&mut self) -> &mut Ring {
        &mut self.ring
    }

    /// Pops `n` linked entries off the free list without touching the wire.
    /// Fails without side effects when the free list is too short.
    fn alloc_chain(&mut self, n: u16) -> Result<u16, VirtqueueError> {
        if n == 0 {
            return Err(VirtqueueError::EmptyChain);
        }
        if self.free_count == 0 {
            return Err(VirtqueueError::QueueFull);
        }
        if self.free_count < n {
            return Err(VirtqueueError::OutOfDescriptors {
                requested: n,
                available: self.free_count,
            });
        }

        let head = self.desc_head;
        let mut tail = head;
        for _ in 1..n {
            tail = self.desc_extra[usize::from(tail)].next;
        }
        self.desc_head = self.desc_extra[usize::from(tail)].next;
        if self.desc_head == CHAIN_END {
            self.desc_tail = CHAIN_END;
        }
        self.free_count -= n;
        self.desc_extra[usize::from(head)].ndescs = n;
        Ok(head)
    }

    /// Splices the chain headed by `head` back onto the free-list tail and
    /// hands back its cookie. The chain's internal links are still intact
    /// from allocation time; only the tail link and the list cursors change.
    fn free_chain(&mut self, head: u16) -> Option<C> {
        let extra = &mut self.desc_extra[usize::from(head)];
        let ndescs = extra.ndescs;
        let cookie = extra.cookie.take();
        extra.ndescs = 0;

        let mut tail = head;
        for _ in 1..ndescs {
            tail = self.desc_extra[usize::from(tail)].next;
        }

        if self.desc_tail == CHAIN_END {
            self.desc_head = head;
        } else {
            self.desc_extra[usize::from(self.desc_tail)].next = head;
        }
        self.desc_tail = tail;
        self.desc_extra[usize::from(tail)].next = CHAIN_END;
        self.free_count += ndescs;
        cookie
    }

    /// Writes descriptors for an allocated chain and makes it available.
    /// `parts` yields `(addr, len, flags)` per segment, flags excluding NEXT
    /// and the packed ownership bits, which are applied here.
    fn publish_parts<I>(&mut self, head: u16, n: u16, parts: I)
    where
        I: Iterator<Item = (u64, u32, u16)>,
    {
        match &mut self.ring {
            Ring::Split(ring) => {
                let mut idx = head;
                for (k, (addr, len, mut flags)) in parts.enumerate() {
                    let link = self.desc_extra[usize::from(idx)].next;
                    let last = k + 1 == usize::from(n);
                    if !last {
                        flags |= VIRTQ_DESC_F_NEXT;
                    }
                    let desc =
                        Descriptor { addr, len, flags, next: if last { 0 } else { link } };
                    // SAFETY: idx came off the free list, so it is in bounds.
                    unsafe { ring.desc_set(idx, desc) };
                    idx = link;
                }

                // Place the head into the next avail slot, skipping the store
                // if the slot already holds that value (saves cache-line
                // traffic on rings that recycle heads in order). The public
                // index is only synced later, so nothing is exposed yet.
                let slot = self.avail_idx.0 % self.size;
                // SAFETY: slot is reduced modulo the ring size.
                unsafe {
                    if ring.avail_ring_get(slot) != head {
                        ring.avail_ring_set(slot, head);
                    }
                }
                self.avail_idx += Wrapping(1);
            }
            Ring::Packed(st) => {
                let head_pos = self.avail_idx.0 % self.size;
                let mut head_flags = 0;
                let mut pos = head_pos;
                for (k, (addr, len, mut flags)) in parts.enumerate() {
                    if k + 1 < usize::from(n) {
                        flags |= VIRTQ_DESC_F_NEXT;
                    }
                    // Every slot carries the head's buffer id, so the
                    // completion resolves no matter which descriptor of the
                    // chain the device reports it from.
                    // SAFETY: pos is reduced modulo the ring size.
                    unsafe { st.ring.desc_body_set(pos, addr, len, head) };
                    if k == 0 {
                        // The head's flag store is what publishes the chain;
                        // it is deferred until every other slot is written.
                        head_flags = flags | st.cached_flags;
                    } else {
                        // SAFETY: pos is in bounds as above.
                        unsafe { st.ring.desc_flags_set_plain(pos, flags | st.cached_flags) };
                    }
                    pos += 1;
                    if pos == self.size {
                        // Passing the ring end starts a new pass: descriptors
                        // written from here on carry the flipped ownership
                        // pattern, even mid-chain.
                        pos = 0;
                        st.cached_flags ^= VIRTQ_DESC_F_AVAIL | VIRTQ_DESC_F_USED;
                    }
                }
                // SAFETY: head_pos is reduced modulo the ring size.
                unsafe { st.ring.desc_flags_store(head_pos, head_flags, self.weak_barriers) };
                self.avail_idx += Wrapping(n);
            }
        }
    }

    /// Validates a device-reported completion id: in range and currently
    /// outstanding. Logs and errors otherwise; continuing to consume a ring
    /// whose invariants are broken risks a descriptor double-free.
    fn check_outstanding_u32(&self, id: u32) -> Result<u16, VirtqueueError> {
        if id >= u32::from(self.size) {
            error!("completion id {} out of bounds for queue of size {}", id, self.size);
            return Err(VirtqueueError::InconsistentCompletion(
                u16::try_from(id).unwrap_or(u16::MAX),
            ));
        }
        let id = id as u16;
        if self.desc_extra[usize::from(id)].cookie.is_none() {
            error!("completion references descriptor {} which is not outstanding", id);
            return Err(VirtqueueError::InconsistentCompletion(id));
        }
        Ok(id)
    }

    /// (Re-)initializes ring memory, free chain and cursors. Shared between
    /// construction and reset.
    fn init_ring_state(&mut self) {
        match &mut self.ring {
            Ring::Split(ring) => ring.clear(),
            Ring::Packed(st) => {
                st.ring.clear();
                // Descriptor identity is positional: ids are fixed to the
                // slot index so a completion resolves in O(1).
                for i in 0..self.size {
                    // SAFETY: i is in 0..size bounds.
                    unsafe { st.ring.desc_body_set(i, 0, 0, i) };
                }
                st.cached_flags = packed::avail_bits(true);
                st.used_wrap_counter = true;
                st.event_flags_shadow = RING_EVENT_FLAGS_ENABLE;
            }
        }

        for i in 0..self.size {
            let extra = &mut self.desc_extra[usize::from(i)];
            extra.cookie = None;
            extra.ndescs = 0;
            extra.next = if i + 1 == self.size { CHAIN_END } else { i + 1 };
        }
        self.desc_head = 0;
        self.desc_tail = self.size - 1;
        self.free_count = self.size;
        self.avail_idx = Wrapping(0);
        self.used_cons_idx = Wrapping(0);
    }
}

#[cfg(test)]
impl<C> Virtqueue<C> {
    /// Number of entries reachable from `desc_head` before the end sentinel.
    pub(crate) fn free_list_len(&self) -> u16 {
        let mut len = 0;
        let mut idx = self.desc_head;
        while idx != CHAIN_END {
            assert!(idx < self.size, "free list walked out of bounds");
            assert!(len <= self.size, "free list longer than the ring");
            len += 1;
            idx = self.desc_extra[usize::from(idx)].next;
        }
        len
    }

    pub(crate) fn avail_idx(&self) -> u16 {
        self.avail_idx.0
    }

    pub(crate) fn used_cons_idx(&self) -> u16 {
        self.used_cons_idx.0
    }
}

/// Links a caller-built split-layout indirect table: each entry points to the
/// next, the last carries no NEXT flag. Address, length and WRITE bits are
/// the caller's.
pub fn link_indirect_table(descs: &mut [Descriptor]) {
    let n = descs.len();
    debug_assert!(n <= usize::from(MAX_QUEUE_SIZE));
    for (i, desc) in descs.iter_mut().enumerate() {
        if i + 1 < n {
            desc.next = (i + 1) as u16;
            desc.flags |= VIRTQ_DESC_F_NEXT;
        } else {
            desc.next = 0;
            desc.flags &= !VIRTQ_DESC_F_NEXT;
        }
    }
}

/// Initializes a caller-built packed-layout indirect table: positional ids
/// and device-writable entries, the shape receive paths hand out.
pub fn init_indirect_table_packed(descs: &mut [packed::PackedDescriptor]) {
    debug_assert!(descs.len() <= usize::from(MAX_QUEUE_SIZE));
    for (i, desc) in descs.iter_mut().enumerate() {
        desc.id = i as u16;
        desc.flags = VIRTQ_DESC_F_WRITE;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::packed::PackedDescriptor;
    use crate::test_utils::{EventFdTransport, FakeDevice};

    fn config(layout: RingLayout, size: u16) -> VirtqueueConfig {
        VirtqueueConfig {
            queue_index: 0,
            size,
            layout,
            weak_barriers: true,
            free_threshold: 0,
        }
    }

    fn segs(n: usize) -> Vec<BufferSegment> {
        (0..n)
            .map(|i| BufferSegment {
                addr: 0x1000 * (i as u64 + 1),
                len: 0x100,
                device_writable: false,
            })
            .collect()
    }

    #[test]
    fn test_invalid_config() {
        for size in [0, 6, 12, 100] {
            assert_eq!(
                Virtqueue::<u32>::new(config(RingLayout::Split, size)).unwrap_err(),
                VirtqueueError::InvalidSize(size)
            );
        }
        let mut cfg = config(RingLayout::Packed, 8);
        cfg.free_threshold = 9;
        assert_eq!(
            Virtqueue::<u32>::new(cfg).unwrap_err(),
            VirtqueueError::InvalidFreeThreshold(9, 8)
        );
    }

    #[test]
    fn test_allocation_scenario() {
        // entries=8: a chain of 3 leaves 5 free; a chain of 6 must fail
        // without side effects; reclaiming the 3 restores all 8.
        let mut vq = Virtqueue::new(config(RingLayout::Split, 8)).unwrap();
        let mut dev = FakeDevice::new();

        vq.enqueue(&segs(3), 7_u32).unwrap();
        assert_eq!(vq.free_count(), 5);
        assert_eq!(vq.free_list_len(), 5);

        assert_eq!(
            vq.enqueue(&segs(6), 8_u32).unwrap_err(),
            VirtqueueError::OutOfDescriptors { requested: 6, available: 5 }
        );
        assert_eq!(vq.free_count(), 5);
        assert_eq!(vq.free_list_len(), 5);

        vq.sync_avail_index();
        let chain = dev.complete_next(&mut vq, 0x300).unwrap();
        assert_eq!(chain.segments.len(), 3);
        let used = vq.pop_used().unwrap().unwrap();
        assert_eq!(used, UsedBuffer { cookie: 7, len: 0x300 });
        assert_eq!(vq.free_count(), 8);
        assert_eq!(vq.free_list_len(), 8);
    }

    #[test]
    fn test_queue_full_and_empty_chain() {
        let mut vq = Virtqueue::new(config(RingLayout::Split, 8)).unwrap();
        for i in 0..8_u32 {
            vq.enqueue(&segs(1), i).unwrap();
        }
        assert!(vq.is_full());
        assert_eq!(vq.enqueue(&segs(1), 9_u32).unwrap_err(), VirtqueueError::QueueFull);
        assert_eq!(vq.enqueue(&[], 9_u32).unwrap_err(), VirtqueueError::EmptyChain);

        // Asking for more than the whole ring reports what was available.
        let mut vq = Virtqueue::new(config(RingLayout::Split, 8)).unwrap();
        assert_eq!(
            vq.enqueue(&segs(10), 0_u32).unwrap_err(),
            VirtqueueError::OutOfDescriptors { requested: 10, available: 8 }
        );
    }

    #[test]
    fn test_split_round_trip() {
        let mut vq = Virtqueue::new(config(RingLayout::Split, 8)).unwrap();
        let mut dev = FakeDevice::new();
        let transport = EventFdTransport::new().unwrap();

        let segments = [
            BufferSegment { addr: 0x1000, len: 0x100, device_writable: false },
            BufferSegment { addr: 0x2000, len: 0x200, device_writable: true },
        ];
        vq.enqueue(&segments, 42_u32).unwrap();
        assert!(vq.kick(&transport));
        assert_eq!(transport.take_kicks(), 1);

        let chain = dev.complete_next(&mut vq, 0x180).unwrap();
        assert_eq!(
            chain.segments,
            vec![
                (0x1000, 0x100, VIRTQ_DESC_F_NEXT),
                (0x2000, 0x200, VIRTQ_DESC_F_WRITE),
            ]
        );

        assert_eq!(vq.used_count(), 1);
        let used = vq.pop_used().unwrap().unwrap();
        assert_eq!(used, UsedBuffer { cookie: 42, len: 0x180 });
        assert_eq!(vq.used_count(), 0);
        assert!(vq.pop_used().unwrap().is_none());
        assert_eq!(vq.free_count(), 8);
    }

    #[test]
    fn test_split_publish_is_batched() {
        let mut vq = Virtqueue::new(config(RingLayout::Split, 8)).unwrap();
        let dev = FakeDevice::new();

        vq.enqueue(&segs(1), 1_u32).unwrap();
        vq.enqueue(&segs(1), 2_u32).unwrap();
        vq.enqueue(&segs(1), 3_u32).unwrap();
        // Nothing is visible until the avail index is synced.
        assert_eq!(dev.pending(&vq), 0);
        vq.sync_avail_index();
        assert_eq!(dev.pending(&vq), 3);
    }

    #[test]
    fn test_packed_round_trip_across_wrap() {
        let mut vq = Virtqueue::new(config(RingLayout::Packed, 4)).unwrap();
        let mut dev = FakeDevice::new();

        // Nothing used before the peer acts.
        vq.enqueue(&segs(3), 30_u32).unwrap();
        assert_eq!(vq.used_count(), 0);
        assert!(vq.pop_used().unwrap().is_none());

        let chain = dev.complete_next(&mut vq, 0x30).unwrap();
        assert_eq!(chain.segments.len(), 3);
        assert_eq!(vq.used_count(), 1);
        let used = vq.pop_used().unwrap().unwrap();
        assert_eq!(used, UsedBuffer { cookie: 30, len: 0x30 });
        assert_eq!(vq.free_count(), 4);

        // Second pass: two 2-descriptor chains; the second crosses the ring
        // end mid-chain, so its descriptors span both wrap values.
        vq.enqueue(&segs(2), 31_u32).unwrap();
        vq.enqueue(&segs(2), 32_u32).unwrap();
        assert!(vq.is_full());

        assert!(dev.complete_next(&mut vq, 0x10).is_some());
        assert!(dev.complete_next(&mut vq, 0x20).is_some());
        assert!(dev.complete_next(&mut vq, 0).is_none());

        let first = vq.pop_used().unwrap().unwrap();
        let second = vq.pop_used().unwrap().unwrap();
        assert_eq!(first, UsedBuffer { cookie: 31, len: 0x10 });
        assert_eq!(second, UsedBuffer { cookie: 32, len: 0x20 });
        assert!(vq.pop_used().unwrap().is_none());
        assert_eq!(vq.free_count(), 4);
        assert_eq!(vq.free_list_len(), 4);
    }

    fn check_suppression_script(layout: RingLayout) {
        let mut vq = Virtqueue::new(config(layout, 8)).unwrap();
        let dev = FakeDevice::new();
        let transport = EventFdTransport::new().unwrap();

        // Peer suppresses, then three publishes arrive: no doorbell.
        dev.suppress_notifications(&mut vq);
        for i in 0..3_u32 {
            vq.enqueue(&segs(1), i).unwrap();
        }
        assert!(!vq.kick(&transport));
        assert_eq!(transport.take_kicks(), 0);

        // Peer re-enables: the next publish rings it.
        dev.allow_notifications(&mut vq);
        vq.enqueue(&segs(1), 3_u32).unwrap();
        assert!(vq.kick(&transport));
        assert_eq!(transport.take_kicks(), 1);
    }

    #[test]
    fn test_notification_suppression_split() {
        check_suppression_script(RingLayout::Split);
    }

    #[test]
    fn test_notification_suppression_packed() {
        check_suppression_script(RingLayout::Packed);
    }

    fn check_interrupt_flags(layout: RingLayout) {
        let mut vq = Virtqueue::<u32>::new(config(layout, 8)).unwrap();
        let dev = FakeDevice::new();

        assert!(!dev.interrupts_suppressed(&vq));
        vq.disable_interrupts();
        assert!(dev.interrupts_suppressed(&vq));
        // Idempotent in both directions.
        vq.disable_interrupts();
        assert!(dev.interrupts_suppressed(&vq));
        vq.enable_interrupts();
        assert!(!dev.interrupts_suppressed(&vq));
        vq.enable_interrupts();
        assert!(!dev.interrupts_suppressed(&vq));
    }

    #[test]
    fn test_interrupt_suppression_split() {
        check_interrupt_flags(RingLayout::Split);
    }

    #[test]
    fn test_interrupt_suppression_packed() {
        check_interrupt_flags(RingLayout::Packed);
    }

    fn check_inconsistent_completion(layout: RingLayout) {
        let mut vq = Virtqueue::new(config(layout, 8)).unwrap();
        let dev = FakeDevice::new();

        vq.enqueue(&segs(1), 1_u32).unwrap();
        vq.sync_avail_index();

        // Descriptor 5 was never handed out.
        dev.complete_raw(&mut vq, 5, 0x10);
        assert_eq!(vq.pop_used().unwrap_err(), VirtqueueError::InconsistentCompletion(5));
    }

    #[test]
    fn test_inconsistent_completion_split() {
        check_inconsistent_completion(RingLayout::Split);
    }

    #[test]
    fn test_inconsistent_completion_packed() {
        check_inconsistent_completion(RingLayout::Packed);
    }

    #[test]
    fn test_out_of_bounds_completion_id() {
        let mut vq = Virtqueue::new(config(RingLayout::Split, 8)).unwrap();
        let dev = FakeDevice::new();
        vq.enqueue(&segs(1), 1_u32).unwrap();
        vq.sync_avail_index();
        dev.complete_raw(&mut vq, 100, 0);
        assert_eq!(vq.pop_used().unwrap_err(), VirtqueueError::InconsistentCompletion(100));
    }

    fn check_reset(layout: RingLayout) {
        let mut vq = Virtqueue::new(config(layout, 8)).unwrap();
        let transport = EventFdTransport::new().unwrap();

        vq.enqueue(&segs(2), 1_u32).unwrap();
        vq.enqueue(&segs(1), 2_u32).unwrap();
        vq.sync_avail_index();

        // The device still holds the queue enabled.
        assert_eq!(vq.reset(&transport).unwrap_err(), VirtqueueError::ResetWhileActive(0));
        assert_eq!(vq.free_count(), 5);

        transport.set_enabled(false);
        let mut stranded = vq.reset(&transport).unwrap();
        stranded.sort_unstable();
        assert_eq!(stranded, vec![1, 2]);
        assert_eq!(vq.free_count(), 8);
        assert_eq!(vq.free_list_len(), 8);
        assert_eq!(vq.avail_idx(), 0);
        assert_eq!(vq.used_cons_idx(), 0);

        // The queue works from scratch against a fresh peer.
        let mut dev = FakeDevice::new();
        vq.enqueue(&segs(1), 3_u32).unwrap();
        vq.sync_avail_index();
        assert!(dev.complete_next(&mut vq, 1).is_some());
        assert_eq!(vq.pop_used().unwrap().unwrap().cookie, 3);
    }

    #[test]
    fn test_reset_split() {
        check_reset(RingLayout::Split);
    }

    #[test]
    fn test_reset_packed() {
        check_reset(RingLayout::Packed);
    }

    #[test]
    fn test_flush_used() {
        let mut vq = Virtqueue::new(config(RingLayout::Split, 8)).unwrap();
        let mut dev = FakeDevice::new();

        for i in 0..3_u32 {
            vq.enqueue(&segs(1), i).unwrap();
        }
        vq.sync_avail_index();
        dev.complete_next(&mut vq, 1).unwrap();
        dev.complete_next(&mut vq, 2).unwrap();

        let drained = vq.flush_used().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].cookie, 0);
        assert_eq!(drained[1].cookie, 1);
        // The third chain is still outstanding, not stranded in the queue's
        // used path.
        assert_eq!(vq.free_count(), 7);
    }

    #[test]
    fn test_free_inorder() {
        let mut vq = Virtqueue::new(config(RingLayout::Split, 8)).unwrap();

        // Nothing outstanding: a claimed run is a protocol violation.
        assert_eq!(
            vq.free_inorder(0, 1).unwrap_err(),
            VirtqueueError::InconsistentCompletion(0)
        );

        // Three single-descriptor chains occupy entries 0..3 in order.
        for i in 0..3_u32 {
            vq.enqueue(&segs(1), 10 + i).unwrap();
        }
        assert_eq!(vq.free_count(), 5);

        let cookies = vq.free_inorder(2, 3).unwrap();
        assert_eq!(cookies, vec![10, 11, 12]);
        assert_eq!(vq.free_count(), 8);
        assert_eq!(vq.free_list_len(), 8);

        // The relinked list still hands out every entry.
        for i in 0..8_u32 {
            vq.enqueue(&segs(1), i).unwrap();
        }
        assert!(vq.is_full());
    }

    fn check_enqueue_indirect(layout: RingLayout) {
        let mut vq = Virtqueue::new(config(layout, 8)).unwrap();
        let mut dev = FakeDevice::new();

        vq.enqueue_indirect(0x4000, 64, 9_u32).unwrap();
        assert_eq!(vq.free_count(), 7);
        vq.sync_avail_index();

        let chain = dev.complete_next(&mut vq, 0x40).unwrap();
        assert_eq!(chain.segments, vec![(0x4000, 64, VIRTQ_DESC_F_INDIRECT)]);
        assert_eq!(vq.pop_used().unwrap().unwrap(), UsedBuffer { cookie: 9, len: 0x40 });
    }

    #[test]
    fn test_enqueue_indirect_split() {
        check_enqueue_indirect(RingLayout::Split);
    }

    #[test]
    fn test_enqueue_indirect_packed() {
        check_enqueue_indirect(RingLayout::Packed);
    }

    #[test]
    fn test_indirect_table_helpers() {
        let mut table = [Descriptor::default(); 3];
        link_indirect_table(&mut table);
        assert_eq!(table[0].next, 1);
        assert_eq!(table[1].next, 2);
        assert_eq!(table[0].flags & VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_NEXT);
        assert_eq!(table[1].flags & VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_NEXT);
        assert_eq!(table[2].flags & VIRTQ_DESC_F_NEXT, 0);
        assert_eq!(table[2].next, 0);

        let mut table = [PackedDescriptor::default(); 3];
        init_indirect_table_packed(&mut table);
        for (i, desc) in table.iter().enumerate() {
            assert_eq!(desc.id, i as u16);
            assert_eq!(desc.flags, VIRTQ_DESC_F_WRITE);
        }
    }

    #[test]
    fn test_below_free_threshold() {
        let mut cfg = config(RingLayout::Split, 8);
        cfg.free_threshold = 4;
        let mut vq = Virtqueue::new(cfg).unwrap();

        for i in 0..4_u32 {
            vq.enqueue(&segs(1), i).unwrap();
            assert!(!vq.below_free_threshold());
        }
        vq.enqueue(&segs(1), 4_u32).unwrap();
        assert!(vq.below_free_threshold());
    }

    fn check_monotonic_counters(layout: RingLayout) {
        let mut vq = Virtqueue::new(config(layout, 4)).unwrap();
        let mut dev = FakeDevice::new();

        let mut last_avail = 0;
        let mut last_used = 0;
        for i in 0..20_u32 {
            vq.enqueue(&segs(2), i).unwrap();
            vq.sync_avail_index();
            assert!(vq.avail_idx() > last_avail);
            last_avail = vq.avail_idx();

            dev.complete_next(&mut vq, 1).unwrap();
            vq.pop_used().unwrap().unwrap();
            assert!(vq.used_cons_idx() > last_used);
            last_used = vq.used_cons_idx();

            // Outstanding work never exceeds the ring.
            assert!(vq.avail_idx() - vq.used_cons_idx() <= vq.size());
        }
    }

    #[test]
    fn test_monotonic_counters_split() {
        check_monotonic_counters(RingLayout::Split);
    }

    #[test]
    fn test_monotonic_counters_packed() {
        check_monotonic_counters(RingLayout::Packed);
    }

    fn run_conservation_ops(layout: RingLayout, ops: &[u8]) {
        let mut vq = Virtqueue::new(config(layout, 8)).unwrap();
        let mut dev = FakeDevice::new();

        for &op in ops {
            match op % 4 {
                0 | 1 => {
                    let n = usize::from(op % 3) + 1;
                    let _ = vq.enqueue(&segs(n), u32::from(op));
                    vq.sync_avail_index();
                }
                2 => {
                    let _ = dev.complete_next(&mut vq, 1);
                }
                _ => {
                    let _ = vq.pop_used().unwrap();
                }
            }
            // Closure: the free list visits exactly free_count entries.
            assert_eq!(vq.free_list_len(), vq.free_count());
        }

        // Conservation: once the peer completes everything and the driver
        // drains it, every descriptor is back on the free list.
        while dev.complete_next(&mut vq, 1).is_some() {}
        vq.flush_used().unwrap();
        assert_eq!(vq.free_count(), vq.size());
        assert_eq!(vq.free_list_len(), vq.size());
    }

    proptest! {
        #[test]
        fn proptest_conservation_split(ops in proptest::collection::vec(any::<u8>(), 1..128)) {
            run_conservation_ops(RingLayout::Split, &ops);
        }

        #[test]
        fn proptest_conservation_packed(ops in proptest::collection::vec(any::<u8>(), 1..128)) {
            run_conservation_ops(RingLayout::Packed, &ops);
        }
    }
}
