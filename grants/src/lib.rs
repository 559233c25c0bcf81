// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! In-memory reference implementation of a grants substrate: share/unshare/map/unmap of
//! fixed-size pages across domains.
//!
//! A real hypervisor backend would hand out physical page grants and ask the other domain's
//! kernel to map them into its address space. There is only one address space here, so "sharing"
//! a page means handing out a raw pointer into a buffer that both the `Share` and any `Mapping`s
//! derived from it are allowed to touch concurrently. Soundness of concurrent access to the bytes
//! themselves is the responsibility of the caller (the vchan ring protocol's own atomics and
//! single-writer discipline), not of this crate.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

pub const PAGE_SIZE: usize = 4096;

pub type Domid = u16;
pub type GrantRef = u32;

#[derive(Debug)]
pub enum Error {
    /// Tried to `map` or `mapv` a grant ref that is already mapped.
    DoubleMap,
    /// Tried to `unmap` a mapping that was not outstanding.
    UnmapNotMapped,
    /// Tried to `unshare` a share that was not outstanding.
    UnshareNotShared,
    /// `assert_cleaned_up` found leftover shares or mappings.
    StaleResources,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::DoubleMap => "grant is already mapped",
                Self::UnmapNotMapped => "unmap of a grant that is not mapped",
                Self::UnshareNotShared => "unshare of a share that is not shared",
                Self::StaleResources => "grant substrate has leftover shares or mappings",
            }
        )
    }
}

impl std::error::Error for Error {}

/// Backing storage for a granted page. Aligned to the page size so that byte offsets within it
/// can be soundly reinterpreted as properly-aligned atomic words by callers (the vchan codec).
#[repr(align(4096))]
struct PageCell(std::cell::UnsafeCell<[u8; PAGE_SIZE]>);

// SAFETY: access to the bytes is only ever performed through raw pointers and explicit atomics
// by the vchan ring protocol, which upholds the single-writer-per-region invariant documented in
// the channel core.
unsafe impl Sync for PageCell {}

impl PageCell {
    fn zeroed() -> Self {
        Self(std::cell::UnsafeCell::new([0u8; PAGE_SIZE]))
    }

    fn as_ptr(&self) -> *mut u8 {
        self.0.get() as *mut u8
    }
}

/// A contiguous allocation of one or more granted pages, owned by the domain that called
/// `share`.
struct PageBlock {
    domid: Domid,
    npages: usize,
    /// Pages are allocated as a single contiguous run so that a `mapv` of the whole share can
    /// hand back one pointer instead of a scatter list.
    pages: Arc<Vec<PageCell>>,
}

impl PageBlock {
    fn ptr(&self) -> *mut u8 {
        self.pages[0].as_ptr()
    }

    fn len(&self) -> usize {
        self.npages * PAGE_SIZE
    }
}

struct GrantTable {
    next_ref: GrantRef,
    /// Every page of every outstanding share, keyed by its own grant ref, so `map()` can find any
    /// individual page.
    pages: HashMap<GrantRef, (PageBlock, usize)>,
    /// Multi-page shares keyed by their first grant ref, so `mapv()` can hand back a contiguous
    /// view without walking `pages` one ref at a time.
    shares: HashMap<GrantRef, Vec<GrantRef>>,
    /// Grant refs with an outstanding single-page `map()`.
    mapped_single: HashSet<GrantRef>,
    /// First-refs of shares with an outstanding `mapv()`.
    mapped_multi: HashSet<GrantRef>,
}

impl GrantTable {
    fn new() -> Self {
        Self {
            next_ref: 1,
            pages: HashMap::new(),
            shares: HashMap::new(),
            mapped_single: HashSet::new(),
            mapped_multi: HashSet::new(),
        }
    }
}

/// Handle to the grants substrate, shared between both ends of a test (or, in a real deployment,
/// a thin wrapper around hypervisor calls).
#[derive(Clone)]
pub struct Grants {
    inner: Arc<Mutex<GrantTable>>,
}

impl Default for Grants {
    fn default() -> Self {
        Self::new()
    }
}

impl Grants {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(GrantTable::new())),
        }
    }

    /// Shares `npages` fresh pages owned by `domid`. Returns the `Share` handle; the caller is
    /// responsible for calling `unshare` on it.
    pub fn share(&self, domid: Domid, npages: usize, _rw: bool) -> Share {
        assert!(npages >= 1);
        let pages = Arc::new((0..npages).map(|_| PageCell::zeroed()).collect::<Vec<_>>());
        let mut table = self.inner.lock().unwrap();

        let first_ref = table.next_ref;
        let mut refs = Vec::with_capacity(npages);
        for i in 0..npages {
            let r = table.next_ref;
            table.next_ref += 1;
            refs.push(r);
            table.pages.insert(
                r,
                (
                    PageBlock {
                        domid,
                        npages,
                        pages: pages.clone(),
                    },
                    i,
                ),
            );
        }
        if npages > 1 {
            table.shares.insert(first_ref, refs.clone());
        }

        log::trace!("share: domid={domid} npages={npages} refs={refs:?}");

        Share {
            refs,
            ptr: pages[0].as_ptr(),
            len: npages * PAGE_SIZE,
        }
    }

    pub fn unshare(&self, share: Share) -> Result<(), Error> {
        let mut table = self.inner.lock().unwrap();
        let first_ref = share.refs[0];

        if share.refs.len() > 1 {
            if table.shares.remove(&first_ref).is_none() {
                return Err(Error::UnshareNotShared);
            }
        } else if !table.pages.contains_key(&first_ref) {
            return Err(Error::UnshareNotShared);
        }

        for r in &share.refs {
            table.pages.remove(r);
        }

        log::trace!("unshare: refs={:?}", share.refs);
        Ok(())
    }

    /// Maps a single grant ref into a `Mapping`.
    pub fn map(&self, _domid: Domid, grant: GrantRef, _rw: bool) -> Result<Mapping, Error> {
        let mut table = self.inner.lock().unwrap();

        if !table.mapped_single.insert(grant) {
            return Err(Error::DoubleMap);
        }

        let (block, index) = table
            .pages
            .get(&grant)
            .expect("map() called with a grant ref that was never shared");

        let ptr = unsafe { block.ptr().add(index * PAGE_SIZE) };
        log::trace!("map: grant={grant}");

        Ok(Mapping {
            kind: MappingKind::Single(grant),
            ptr,
            len: PAGE_SIZE,
        })
    }

    /// Maps a contiguous run of grant refs (as returned together by one `share` call) into a
    /// single `Mapping`. The refs must be exactly the refs of one share, in order; this mirrors
    /// how the vchan channel core always calls `mapv` (never with grants drawn from more than
    /// one share).
    pub fn mapv(&self, grants: &[(Domid, GrantRef)], _rw: bool) -> Result<Mapping, Error> {
        assert!(!grants.is_empty());
        let mut table = self.inner.lock().unwrap();
        let first_ref = grants[0].1;

        if !table.mapped_multi.insert(first_ref) {
            return Err(Error::DoubleMap);
        }

        let refs = table
            .shares
            .get(&first_ref)
            .expect("mapv() called with a grant ref that is not the first ref of a share")
            .clone();
        debug_assert_eq!(
            refs,
            grants.iter().map(|(_, r)| *r).collect::<Vec<_>>(),
            "mapv must be called with exactly the refs of one share, in order"
        );

        let (block, _) = &table.pages[&first_ref];
        let ptr = block.ptr();
        let len = block.len();
        log::trace!("mapv: first_ref={first_ref} npages={}", refs.len());

        Ok(Mapping {
            kind: MappingKind::Multi(first_ref),
            ptr,
            len,
        })
    }

    pub fn unmap(&self, mapping: Mapping) -> Result<(), Error> {
        let mut table = self.inner.lock().unwrap();
        let removed = match mapping.kind {
            MappingKind::Single(r) => table.mapped_single.remove(&r),
            MappingKind::Multi(r) => table.mapped_multi.remove(&r),
        };
        if !removed {
            return Err(Error::UnmapNotMapped);
        }
        log::trace!("unmap");
        Ok(())
    }

    /// Fails if any share or mapping has not been released. Intended for end-of-test assertions.
    pub fn assert_cleaned_up(&self) -> Result<(), Error> {
        let table = self.inner.lock().unwrap();
        if !table.pages.is_empty()
            || !table.shares.is_empty()
            || !table.mapped_single.is_empty()
            || !table.mapped_multi.is_empty()
        {
            return Err(Error::StaleResources);
        }
        Ok(())
    }
}

/// The owner-side handle to a shared block of pages.
pub struct Share {
    refs: Vec<GrantRef>,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the pointed-to pages outlive the `Share` (they are kept alive by the `Arc<Vec<PageCell>>`
// held in the grant table until `unshare`), and all concurrent byte-level access goes through the
// vchan protocol's own atomics.
unsafe impl Send for Share {}
unsafe impl Sync for Share {}

impl Share {
    pub fn grants(&self) -> &[GrantRef] {
        &self.refs
    }

    /// Raw pointer to the start of the shared pages.
    ///
    /// # Safety
    /// The caller must only perform byte-level accesses that respect the vchan ring protocol's
    /// single-writer-per-region and atomic-header-field invariants.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

enum MappingKind {
    Single(GrantRef),
    Multi(GrantRef),
}

/// The mapper-side handle to a mapped block of pages.
pub struct Mapping {
    kind: MappingKind,
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Raw pointer to the start of the mapped pages.
    ///
    /// # Safety
    /// Same requirements as [`Share::as_ptr`].
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_and_map_single_page() {
        let g = Grants::new();
        let share = g.share(1, 1, true);
        let refs = share.grants().to_vec();
        assert_eq!(refs.len(), 1);

        let mapping = g.map(2, refs[0], true).unwrap();
        assert_eq!(mapping.len(), PAGE_SIZE);

        g.unmap(mapping).unwrap();
        g.unshare(share).unwrap();
        g.assert_cleaned_up().unwrap();
    }

    #[test]
    fn double_map_fails() {
        let g = Grants::new();
        let share = g.share(1, 1, true);
        let refs = share.grants().to_vec();

        let m1 = g.map(2, refs[0], true).unwrap();
        let err = g.map(2, refs[0], true).unwrap_err();
        assert!(matches!(err, Error::DoubleMap));

        g.unmap(m1).unwrap();
        g.unshare(share).unwrap();
    }

    #[test]
    fn unmap_not_mapped_fails() {
        let g = Grants::new();
        let share = g.share(1, 1, true);
        let refs = share.grants().to_vec();

        let mapping = g.map(2, refs[0], true).unwrap();
        g.unmap(mapping).unwrap();

        // unmapping again (same ref, never re-mapped) must fail:
        let probe = Mapping {
            kind: MappingKind::Single(refs[0]),
            ptr: std::ptr::null_mut(),
            len: 0,
        };
        let err = g.unmap(probe).unwrap_err();
        assert!(matches!(err, Error::UnmapNotMapped));

        g.unshare(share).unwrap();
    }

    #[test]
    fn double_unshare_fails() {
        let g = Grants::new();
        let share = g.share(1, 1, true);
        let refs = share.grants().to_vec();
        g.unshare(share).unwrap();

        // a second unshare of the same refs is detected via a fresh Share-shaped probe:
        let probe = Share {
            refs,
            ptr: std::ptr::null_mut(),
            len: 0,
        };
        let err = g.unshare(probe).unwrap_err();
        assert!(matches!(err, Error::UnshareNotShared));
    }

    #[test]
    fn mapv_contiguous_share() {
        let g = Grants::new();
        let share = g.share(1, 4, true);
        let refs = share.grants().to_vec();
        assert_eq!(refs.len(), 4);

        let grants: Vec<_> = refs.iter().map(|r| (2u16, *r)).collect();
        let mapping = g.mapv(&grants, true).unwrap();
        assert_eq!(mapping.len(), 4 * PAGE_SIZE);

        g.unmap(mapping).unwrap();
        g.unshare(share).unwrap();
        g.assert_cleaned_up().unwrap();
    }

    #[test]
    fn assert_cleaned_up_fails_with_leftovers() {
        let g = Grants::new();
        let _share = g.share(1, 1, true);
        assert!(g.assert_cleaned_up().is_err());
    }
}
