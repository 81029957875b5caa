// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory-ordering primitives for the shared rings.
//!
//! Every access to memory the peer also reads or writes goes through one of
//! these fences. The `weak_barriers` mode is fixed per queue at construction:
//! `true` assumes the peer shares our cache-coherence domain (a hypervisor or
//! vhost backend on the same machine), so the matching thread fence suffices;
//! `false` assumes a genuinely external peer (vDPA, real hardware), for which
//! every fence is promoted to the strongest portable ordering.

use std::sync::atomic::{Ordering, fence};

/// Full barrier. Required between publishing new work and reading the peer's
/// suppression signal, so neither side misses the other's last update.
#[inline(always)]
pub fn full(_weak_barriers: bool) {
    // Sequential consistency is the strongest portable ordering, so both
    // modes collapse to the same fence here.
    fence(Ordering::SeqCst);
}

/// Read barrier. Must separate observing a peer-written index or flag from
/// reading the payload it guards.
#[inline(always)]
pub fn acquire(weak_barriers: bool) {
    if weak_barriers {
        fence(Ordering::Acquire);
    } else {
        fence(Ordering::SeqCst);
    }
}

/// Write barrier. Must separate writing payload from writing the index or
/// flag that exposes it to the peer.
#[inline(always)]
pub fn release(weak_barriers: bool) {
    if weak_barriers {
        fence(Ordering::Release);
    } else {
        fence(Ordering::SeqCst);
    }
}
