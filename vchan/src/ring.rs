// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A power-of-two-sized byte ring with wrap-around producer/consumer counters (§3, §5).
//!
//! A `Ring` borrows its counter pair out of a [`crate::page::ControlView`] and owns no memory of
//! its own; the data bytes it copies into/out of live wherever the negotiated buffer location put
//! them (in-page or on externally granted pages). Counters never wrap their arithmetic: the
//! buffer index is always `counter & (size - 1)`.

use std::sync::atomic::{AtomicU32, Ordering};

pub struct Ring<'a> {
    data: *mut u8,
    size: usize,
    cons: &'a AtomicU32,
    prod: &'a AtomicU32,
}

// SAFETY: `data` points at a region whose single-writer-per-side discipline is upheld by the
// channel core (only the producer ever touches bytes ahead of `cons`, only the consumer ever
// reads bytes behind `prod`), and all index bookkeeping goes through the atomics above.
unsafe impl Send for Ring<'_> {}
unsafe impl Sync for Ring<'_> {}

impl<'a> Ring<'a> {
    /// # Safety
    /// `data` must point to `size` valid bytes for the lifetime of this ring, and `size` must be
    /// a power of two.
    pub unsafe fn new(data: *mut u8, size: usize, cons: &'a AtomicU32, prod: &'a AtomicU32) -> Self {
        assert!(size.is_power_of_two(), "ring size must be a power of two");
        Self { data, size, cons, prod }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn cons_value(&self) -> u32 {
        self.cons.load(Ordering::Relaxed)
    }

    pub fn prod_value(&self) -> u32 {
        self.prod.load(Ordering::Relaxed)
    }

    /// Bytes currently available to read: the peer's producer position (acquired, so a
    /// subsequent read of ring bytes observes everything written up to it) minus our own
    /// consumer position.
    pub fn avail_to_read(&self) -> u32 {
        let prod = self.prod.load(Ordering::Acquire);
        let cons = self.cons.load(Ordering::Relaxed);
        prod.wrapping_sub(cons)
    }

    /// Bytes of free space available to write: the ring size minus our own producer position
    /// relative to the peer's consumer position (acquired, so we never overwrite bytes the peer
    /// hasn't consumed yet).
    pub fn space_to_write(&self) -> u32 {
        let cons = self.cons.load(Ordering::Acquire);
        let prod = self.prod.load(Ordering::Relaxed);
        self.size as u32 - prod.wrapping_sub(cons)
    }

    /// Publishes a new consumer index. Must be release so that the peer's subsequent
    /// acquire-load of `space_to_write` cannot observe the new index before the bytes it frees
    /// have finished being read.
    pub fn publish_cons(&self, value: u32) {
        self.cons.store(value, Ordering::Release);
    }

    /// Publishes a new producer index. Must be release so that the peer's subsequent
    /// acquire-load of `avail_to_read` cannot observe the new index before the bytes it
    /// describes have finished being written.
    pub fn publish_prod(&self, value: u32) {
        self.prod.store(value, Ordering::Release);
    }

    /// Copies up to `dst.len()` bytes starting at the current consumer position, stopping at the
    /// end of the buffer rather than wrapping. Returns the number of bytes copied. The caller is
    /// responsible for advancing the consumer index (via [`Self::publish_cons`]) once it has
    /// actually consumed the bytes.
    pub fn copy_out(&self, dst: &mut [u8]) -> usize {
        let cons = self.cons_value();
        let idx = (cons as usize) & (self.size - 1);
        let contiguous = self.size - idx;
        let n = dst.len().min(contiguous);
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.add(idx), dst.as_mut_ptr(), n);
        }
        n
    }

    /// Copies all of `src` into the ring starting at the current producer position, wrapping
    /// around to offset 0 if it runs past the end of the buffer. `src.len()` must not exceed the
    /// ring size. Does not advance the producer index.
    pub fn copy_in_wrapping(&self, src: &[u8]) {
        assert!(src.len() <= self.size, "write larger than the ring itself");
        let prod = self.prod_value();
        let idx = (prod as usize) & (self.size - 1);
        let first = (self.size - idx).min(src.len());
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data.add(idx), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first),
                    self.data,
                    src.len() - first,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_around_write_then_read() {
        let mut buf = [0u8; 1024];
        let cons = AtomicU32::new(800);
        let prod = AtomicU32::new(800);
        let ring = unsafe { Ring::new(buf.as_mut_ptr(), 1024, &cons, &prod) };

        let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        assert!(ring.space_to_write() as usize >= payload.len());
        ring.copy_in_wrapping(&payload);
        ring.publish_prod(800 + 600);

        assert_eq!(ring.avail_to_read(), 600);

        let mut out = vec![0u8; 600];
        let mut got = 0;
        while got < out.len() {
            let n = ring.copy_out(&mut out[got..]);
            assert!(n > 0);
            got += n;
            ring.publish_cons(cons.load(Ordering::Relaxed) + n as u32);
        }
        assert_eq!(out, payload);
    }
}
