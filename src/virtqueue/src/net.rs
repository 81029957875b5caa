// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Payload formats carried over virtio-net queues.
//!
//! The queue core transports these as ordinary buffers and never interprets
//! them; they are defined here because their layouts are part of the device's
//! external interface and every user of the queues needs them. A control
//! command is a [`CtrlHdr`], a class-specific body, and a trailing one-byte
//! ack the device fills in.

use vm_memory::ByteValued;

/// Flag in [`VirtioNetHdr::flags`]: checksum from `csum_start`/`csum_offset`.
pub const VIRTIO_NET_HDR_F_NEEDS_CSUM: u8 = 1;
/// Flag in [`VirtioNetHdr::flags`]: the checksum is already valid.
pub const VIRTIO_NET_HDR_F_DATA_VALID: u8 = 2;

/// Not a GSO frame.
pub const VIRTIO_NET_HDR_GSO_NONE: u8 = 0;
/// GSO frame, IPv4 TCP (TSO).
pub const VIRTIO_NET_HDR_GSO_TCPV4: u8 = 1;
/// GSO frame, IPv4 UDP (UFO).
pub const VIRTIO_NET_HDR_GSO_UDP: u8 = 3;
/// GSO frame, IPv6 TCP.
pub const VIRTIO_NET_HDR_GSO_TCPV6: u8 = 4;
/// TCP has ECN set.
pub const VIRTIO_NET_HDR_GSO_ECN: u8 = 0x80;

/// The per-packet header, first element of every data-queue buffer. Without
/// checksum or GSO offload negotiated it is simply zeroed.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VirtioNetHdr {
    /// NEEDS_CSUM / DATA_VALID bits.
    pub flags: u8,
    /// One of the GSO type values.
    pub gso_type: u8,
    /// Length of the Ethernet + IP + transport headers.
    pub hdr_len: u16,
    /// Bytes to append to `hdr_len` per frame.
    pub gso_size: u16,
    /// Position to start checksumming from.
    pub csum_start: u16,
    /// Offset after `csum_start` to place the checksum at.
    pub csum_offset: u16,
}

// SAFETY: `VirtioNetHdr` is a POD and contains no padding.
unsafe impl ByteValued for VirtioNetHdr {}

/// The header variant used once mergeable receive buffers are negotiated.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VirtioNetHdrMrgRxbuf {
    /// The plain header.
    pub hdr: VirtioNetHdr,
    /// Number of merged receive buffers this packet spans.
    pub num_buffers: u16,
}

// SAFETY: `VirtioNetHdrMrgRxbuf` is a POD and contains no padding.
unsafe impl ByteValued for VirtioNetHdrMrgRxbuf {}

/// Control command header: a class and a command within it.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CtrlHdr {
    /// Command class.
    pub class: u8,
    /// Command within the class.
    pub cmd: u8,
}

// SAFETY: `CtrlHdr` is a POD and contains no padding.
unsafe impl ByteValued for CtrlHdr {}

/// Ack byte the device writes: command succeeded.
pub const VIRTIO_NET_OK: u8 = 0;
/// Ack byte the device writes: command failed.
pub const VIRTIO_NET_ERR: u8 = 1;

/// Upper bound on a control command body.
pub const VIRTIO_MAX_CTRL_DATA: usize = 2048;

/// Receive-mode class: one-byte bodies, zero = disable, nonzero = enable.
pub const VIRTIO_NET_CTRL_RX: u8 = 0;
/// Receive everything.
pub const VIRTIO_NET_CTRL_RX_PROMISC: u8 = 0;
/// Receive all multicast.
pub const VIRTIO_NET_CTRL_RX_ALLMULTI: u8 = 1;
/// Receive all unicast.
pub const VIRTIO_NET_CTRL_RX_ALLUNI: u8 = 2;
/// Suppress multicast.
pub const VIRTIO_NET_CTRL_RX_NOMULTI: u8 = 3;
/// Suppress unicast.
pub const VIRTIO_NET_CTRL_RX_NOUNI: u8 = 4;
/// Suppress broadcast.
pub const VIRTIO_NET_CTRL_RX_NOBCAST: u8 = 5;

/// MAC filtering class.
pub const VIRTIO_NET_CTRL_MAC: u8 = 1;
/// Replace the MAC filter tables (unicast then multicast).
pub const VIRTIO_NET_CTRL_MAC_TABLE_SET: u8 = 0;
/// Set the primary MAC address (6-byte body).
pub const VIRTIO_NET_CTRL_MAC_ADDR_SET: u8 = 1;

/// Length of a MAC address in the tables and the ADDR_SET body.
pub const MAC_ADDR_LEN: usize = 6;

/// Header of one MAC filter table: an entry count followed by that many
/// consecutive 6-byte addresses. Filtering is best-effort on the device side;
/// the table size should be treated as unbounded.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MacTableHeader {
    /// Number of addresses that follow.
    pub entries: u32,
}

// SAFETY: `MacTableHeader` is a POD and contains no padding.
unsafe impl ByteValued for MacTableHeader {}

/// VLAN filtering class: two-byte VLAN id bodies.
pub const VIRTIO_NET_CTRL_VLAN: u8 = 2;
/// Add a VLAN id to the filter.
pub const VIRTIO_NET_CTRL_VLAN_ADD: u8 = 0;
/// Remove a VLAN id from the filter.
pub const VIRTIO_NET_CTRL_VLAN_DEL: u8 = 1;

/// Link-announce class.
pub const VIRTIO_NET_CTRL_ANNOUNCE: u8 = 3;
/// Acknowledge a link announcement so the device clears its status bit.
pub const VIRTIO_NET_CTRL_ANNOUNCE_ACK: u8 = 0;

/// Multiqueue class.
pub const VIRTIO_NET_CTRL_MQ: u8 = 4;
/// Set the number of active queue pairs (u16 body).
pub const VIRTIO_NET_CTRL_MQ_VQ_PAIRS_SET: u8 = 0;
/// Configure receive-side scaling ([`RssConfig`] body).
pub const VIRTIO_NET_CTRL_MQ_RSS_CONFIG: u8 = 1;
/// Minimum queue-pair count a VQ_PAIRS_SET may carry.
pub const VIRTIO_NET_CTRL_MQ_VQ_PAIRS_MIN: u16 = 1;
/// Maximum queue-pair count a VQ_PAIRS_SET may carry.
pub const VIRTIO_NET_CTRL_MQ_VQ_PAIRS_MAX: u16 = 0x8000;

/// RSS indirection table length this driver format supports.
pub const VIRTIO_NET_RSS_RETA_SIZE: usize = 128;
/// RSS hash key length this driver format supports.
pub const VIRTIO_NET_RSS_KEY_SIZE: usize = 40;

/// Body of an RSS_CONFIG command: fixed 40-byte key and 128-entry
/// indirection table.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssConfig {
    /// Hash types the device should compute, as feature-defined bits.
    pub hash_types: u32,
    /// Mask applied to the hash before indexing the indirection table.
    pub indirection_table_mask: u16,
    /// Queue receiving packets no hash type matched.
    pub unclassified_queue: u16,
    /// Hash-to-receive-queue mapping.
    pub indirection_table: [u16; VIRTIO_NET_RSS_RETA_SIZE],
    /// Highest transmit queue the driver will use.
    pub max_tx_vq: u16,
    /// Length of the key that follows; always [`VIRTIO_NET_RSS_KEY_SIZE`].
    pub hash_key_length: u8,
    /// The hash key.
    pub hash_key_data: [u8; VIRTIO_NET_RSS_KEY_SIZE],
}

// SAFETY: `RssConfig` is `repr(C, packed)`, so it is a POD without padding.
unsafe impl ByteValued for RssConfig {}

impl Default for RssConfig {
    fn default() -> RssConfig {
        RssConfig {
            hash_types: 0,
            indirection_table_mask: 0,
            unclassified_queue: 0,
            indirection_table: [0; VIRTIO_NET_RSS_RETA_SIZE],
            max_tx_vq: 0,
            hash_key_length: VIRTIO_NET_RSS_KEY_SIZE as u8,
            hash_key_data: [0; VIRTIO_NET_RSS_KEY_SIZE],
        }
    }
}

/// Role of a queue within a virtio-net device's queue numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Receive queue (even indexes).
    Rx,
    /// Transmit queue (odd indexes).
    Tx,
    /// Control queue (index `2 * max_queue_pairs`).
    Ctrl,
}

/// Classifies `queue_index` within a device offering `max_queue_pairs`
/// receive/transmit pairs.
pub fn queue_kind(queue_index: u16, max_queue_pairs: u16) -> QueueKind {
    if queue_index == max_queue_pairs * 2 {
        QueueKind::Ctrl
    } else if queue_index % 2 == 0 {
        QueueKind::Rx
    } else {
        QueueKind::Tx
    }
}
