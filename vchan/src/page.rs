// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Typed accessors over the fixed binary layout of the control page (§3 of the wire format).
//!
//! Every multi-byte field is little-endian. This module never interprets field values — decoding
//! an order or liveness byte into an enum, and deciding what to do about it, belongs to the
//! callers in this crate (`server`, `client`, `handle`). What this module does own is making sure
//! every access to a header byte goes through an atomic of the right width, since the same bytes
//! are read and written concurrently by both peers sharing the page.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8};

/// Size in bytes of the fixed header preceding the grant-ref array.
pub const HEADER_LEN: usize = 24;
/// Size of the control page itself.
pub const CONTROL_PAGE_LEN: usize = 4096;

pub const OFF_LEFT_CONS: usize = 0;
pub const OFF_LEFT_PROD: usize = 4;
pub const OFF_RIGHT_CONS: usize = 8;
pub const OFF_RIGHT_PROD: usize = 12;
pub const OFF_LEFT_ORDER: usize = 16;
pub const OFF_RIGHT_ORDER: usize = 18;
pub const OFF_CLI_LIVE: usize = 20;
pub const OFF_SRV_LIVE: usize = 21;
pub const OFF_CLI_NOTIFY: usize = 22;
pub const OFF_SRV_NOTIFY: usize = 23;

/// A view over a control page's bytes, wherever they physically live (locally shared, or mapped
/// from a peer). Does not own the memory; the `Share`/`Mapping` that produced the pointer does.
pub struct ControlView {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: every access below goes through an atomic of the exact field width at a fixed, documented
// offset, so concurrent access from the "other domain" (in this reference substrate, another
// thread holding the same pointer) is race-free at the byte level. Higher-level invariants (who is
// allowed to write which field) are enforced by the channel core, not by this view.
unsafe impl Send for ControlView {}
unsafe impl Sync for ControlView {}

impl ControlView {
    /// # Safety
    /// `ptr` must point to at least `len` valid, properly aligned bytes for the lifetime of this
    /// view, and `len` must be at least [`HEADER_LEN`].
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        assert!(len >= HEADER_LEN, "control view shorter than the header");
        assert_eq!(ptr as usize % 4, 0, "control page must be 4-byte aligned");
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset + 4 <= self.len);
        unsafe { AtomicU32::from_ptr(self.ptr.add(offset) as *mut u32) }
    }

    fn atomic_u16(&self, offset: usize) -> &AtomicU16 {
        debug_assert!(offset + 2 <= self.len);
        unsafe { AtomicU16::from_ptr(self.ptr.add(offset) as *mut u16) }
    }

    fn atomic_u8(&self, offset: usize) -> &AtomicU8 {
        debug_assert!(offset + 1 <= self.len);
        unsafe { AtomicU8::from_ptr(self.ptr.add(offset)) }
    }

    pub fn left_cons(&self) -> &AtomicU32 {
        self.atomic_u32(OFF_LEFT_CONS)
    }
    pub fn left_prod(&self) -> &AtomicU32 {
        self.atomic_u32(OFF_LEFT_PROD)
    }
    pub fn right_cons(&self) -> &AtomicU32 {
        self.atomic_u32(OFF_RIGHT_CONS)
    }
    pub fn right_prod(&self) -> &AtomicU32 {
        self.atomic_u32(OFF_RIGHT_PROD)
    }

    pub fn left_order(&self) -> &AtomicU16 {
        self.atomic_u16(OFF_LEFT_ORDER)
    }
    pub fn right_order(&self) -> &AtomicU16 {
        self.atomic_u16(OFF_RIGHT_ORDER)
    }

    pub fn cli_live(&self) -> &AtomicU8 {
        self.atomic_u8(OFF_CLI_LIVE)
    }
    pub fn srv_live(&self) -> &AtomicU8 {
        self.atomic_u8(OFF_SRV_LIVE)
    }

    pub fn cli_notify(&self) -> &AtomicU8 {
        self.atomic_u8(OFF_CLI_NOTIFY)
    }
    pub fn srv_notify(&self) -> &AtomicU8 {
        self.atomic_u8(OFF_SRV_NOTIFY)
    }

    /// Reads the `index`-th little-endian u32 grant ref following the header. `base` selects
    /// where the array for this ring side starts (left refs are written first, then right).
    pub fn grant_ref(&self, base: usize, index: usize) -> u32 {
        let off = HEADER_LEN + (base + index) * 4;
        debug_assert!(off + 4 <= self.len);
        let bytes = unsafe { *(self.ptr.add(off) as *const [u8; 4]) };
        u32::from_le_bytes(bytes)
    }

    pub fn set_grant_ref(&self, base: usize, index: usize, value: u32) {
        let off = HEADER_LEN + (base + index) * 4;
        debug_assert!(off + 4 <= self.len);
        unsafe {
            *(self.ptr.add(off) as *mut [u8; 4]) = value.to_le_bytes();
        }
    }
}

/// Liveness state of one side of the channel (§3, §4.5.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Live {
    Exited = 0,
    Connected = 1,
    WaitingForConnection = 2,
}

impl Live {
    pub fn encode(self) -> u8 {
        self as u8
    }

    pub fn decode(v: u8) -> Result<Self, u8> {
        match v {
            0 => Ok(Live::Exited),
            1 => Ok(Live::Connected),
            2 => Ok(Live::WaitingForConnection),
            other => Err(other),
        }
    }
}

/// Which ring a control-page accessor refers to: left = client writes, server reads; right =
/// server writes, client reads (§3 "Left/right roles").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl ControlView {
    pub fn cons(&self, side: Side) -> &AtomicU32 {
        match side {
            Side::Left => self.left_cons(),
            Side::Right => self.right_cons(),
        }
    }

    pub fn prod(&self, side: Side) -> &AtomicU32 {
        match side {
            Side::Left => self.left_prod(),
            Side::Right => self.right_prod(),
        }
    }

    pub fn order(&self, side: Side) -> &AtomicU16 {
        match side {
            Side::Left => self.left_order(),
            Side::Right => self.right_order(),
        }
    }
}

/// Which half of a read/write operation a notify-bit request is about (§4.5.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Write = 1,
    Read = 2,
}

impl Direction {
    pub fn bit(self) -> u8 {
        self as u8
    }
}

/// Where a ring's bytes physically live (§4.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLocation {
    Offset1024,
    Offset2048,
    /// `2^n` granted pages, `0 <= n <= 8`.
    External(u8),
}

impl BufferLocation {
    pub const MAX_EXTERNAL_ORDER: u8 = 8;

    pub fn capacity(self) -> usize {
        match self {
            BufferLocation::Offset1024 => 1024,
            BufferLocation::Offset2048 => 2048,
            BufferLocation::External(n) => 1usize << (n as u32 + 12),
        }
    }

    pub fn npages(self) -> usize {
        match self {
            BufferLocation::External(n) => 1usize << n,
            _ => 0,
        }
    }

    pub fn encode(self) -> u16 {
        match self {
            BufferLocation::Offset1024 => 10,
            BufferLocation::Offset2048 => 11,
            BufferLocation::External(n) => n as u16 + 12,
        }
    }

    pub fn decode(v: u16) -> Result<Self, u16> {
        match v {
            10 => Ok(BufferLocation::Offset1024),
            11 => Ok(BufferLocation::Offset2048),
            12..=20 => Ok(BufferLocation::External((v - 12) as u8)),
            other => Err(other),
        }
    }

    /// Smallest location whose capacity covers `requested` bytes, or the largest legal location
    /// if none does.
    pub fn smallest_fitting(requested: usize) -> Self {
        const CANDIDATES: [BufferLocation; 11] = [
            BufferLocation::Offset1024,
            BufferLocation::Offset2048,
            BufferLocation::External(0),
            BufferLocation::External(1),
            BufferLocation::External(2),
            BufferLocation::External(3),
            BufferLocation::External(4),
            BufferLocation::External(5),
            BufferLocation::External(6),
            BufferLocation::External(7),
            BufferLocation::External(8),
        ];
        CANDIDATES
            .into_iter()
            .find(|loc| loc.capacity() >= requested)
            .unwrap_or(BufferLocation::External(Self::MAX_EXTERNAL_ORDER))
    }
}
