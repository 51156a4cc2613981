//! # Physical page-frame allocator
//!
//! Hands out and reclaims 4 KiB page frames for user process page tables,
//! kernel stacks, page-table pages and pipe buffers, and tracks per frame
//! how many owners currently reference it. A shared frame (forked address
//! spaces, shared mappings) only returns to the free pool when its last
//! owner releases it.
//!
//! ## Frame life cycle
//!
//! ```text
//!            init                  alloc
//! untracked ------> free (count 0) ------> allocated (count 1)
//!                     ^                      |      ^
//!                     |   free (count == 0)  |      | add_reference /
//!                     +----------------------+      | drop_reference /
//!                                                   | free (count > 0)
//!                                                   v
//!                                            shared (count n)
//! ```
//!
//! Bootstrap populates the free list through the ordinary release path:
//! every usable frame is marked with a single pretend owner and then
//! `free`d, so the decrement-to-zero logic is the one and only transition
//! into the free state.
//!
//! ## Locking
//!
//! Two independent spin locks: `pmm.free` guards the free-list head and
//! links, `pmm.refcount` guards the owner counts. No operation ever holds
//! both at once, so refcount bookkeeping never serializes behind free-list
//! traffic. `free` decrements under the refcount lock, releases it, and
//! only then takes the free-list lock for the push. In the window between
//! the two the frame is owned by nobody and linked nowhere. This is sound
//! under the ownership protocol: `add_reference` may only be called by a
//! context that already owns a reference, and a count that has reached
//! zero has no surviving owner. It does mean a stray late
//! `add_reference` is a protocol violation, not something a lock will
//! catch.

use kernel_sync::SpinLock;

use crate::addr::{PAGE_SIZE, PhysAddr, PhysRegion};
use crate::free_list::FreeList;
use crate::layout::{FrameTableLayout, RegionError};
use crate::phys_mapper::{PhysMapper, fill_frame};
use crate::refcount::RefCounts;

/// Junk byte covering a frame as it is handed out, so reads of
/// uninitialized frame memory fail loudly and deterministically.
pub const POISON_ALLOC: u8 = 5;

/// Junk byte covering a frame as its last reference goes away, so dangling
/// accesses observe garbage instead of stale data.
pub const POISON_FREE: u8 = 1;

/// Whether frames are junk-filled on allocate and on final release.
/// Always on in debug builds; the `poison` feature opts release builds in.
const fn poison_enabled() -> bool {
    cfg!(any(debug_assertions, feature = "poison"))
}

/// The physical page-frame allocator.
///
/// One instance manages the flat region `[region.start, region.end)`. The
/// instance is explicitly constructed via [`init`](Self::init) and passed
/// to its call sites; there is no ambient global.
pub struct FrameAllocator<M> {
    region: PhysRegion,
    layout: FrameTableLayout,
    mapper: M,
    free: SpinLock<FreeList>,
    counts: SpinLock<RefCounts>,
}

impl<M: PhysMapper> FrameAllocator<M> {
    /// Bootstrap the allocator over `region`.
    ///
    /// Carves the frame tables out of the start of the region, pins the
    /// frames they occupy (count 1, owned by the allocator itself, never
    /// allocatable), then releases every remaining frame through [`free`]
    /// to populate the free list.
    ///
    /// Called exactly once at startup, before any other operation.
    ///
    /// # Errors
    ///
    /// [`RegionError`] when the region is unaligned or cannot hold the
    /// tables plus at least one usable frame.
    ///
    /// # Safety
    ///
    /// - `region` must be backed by RAM that is exclusively owned by the
    ///   returned allocator for its whole lifetime.
    /// - `mapper` must cover `region` per the [`PhysMapper`] contract.
    ///
    /// [`free`]: Self::free
    pub unsafe fn init(region: PhysRegion, mapper: M) -> Result<Self, RegionError> {
        let layout = FrameTableLayout::compute(region)?;

        // SAFETY: the table ranges lie inside `region`, which the caller
        // hands over exclusively; the layout keeps them disjoint and the
        // link arena 4-byte aligned, and the mapper preserves alignment.
        let (counts, free) = unsafe {
            let counts_len = layout.frame_count as usize;
            let counts = RefCounts::from_raw(mapper.phys_to_ptr(layout.counts_base), counts_len);
            let links = mapper.phys_to_ptr(layout.links_base).cast::<u32>();
            (counts, FreeList::from_raw(links, counts_len))
        };

        let allocator = Self {
            region,
            layout,
            mapper,
            free: SpinLock::new("pmm.free", free),
            counts: SpinLock::new("pmm.refcount", counts),
        };

        // Pin the frames backing the tables: permanently one owner (the
        // allocator), so `free ⇔ count == 0` holds for every frame in the
        // region and these can never reach the free list.
        allocator.counts.with_lock(|counts| {
            for slot in 0..allocator.layout.reserved_frames as usize {
                counts.set(slot, 1);
            }
        });

        // Populate the free list through the ordinary release path: one
        // pretend owner per frame, then release it. The decrement-to-zero
        // logic in `free` is the only code that pushes.
        let mut pa = allocator.layout.frames_base;
        while pa < region.end {
            let slot = region.slot_of(pa) as usize;
            allocator.counts.lock().set(slot, 1);
            allocator.free(pa);
            pa += PAGE_SIZE;
        }

        log::info!(
            "pmm: {} usable frames at {}..{}, {} reserved for frame tables",
            allocator.layout.usable_frames,
            allocator.layout.frames_base,
            region.end,
            allocator.layout.reserved_frames,
        );

        Ok(allocator)
    }

    /// Allocate one page frame.
    ///
    /// Returns the frame's physical address with its owner count at 1, or
    /// `None` when memory is exhausted; the caller decides whether to
    /// reclaim and retry or to fail the requesting operation. In poisoned
    /// builds the frame arrives filled with [`POISON_ALLOC`].
    pub fn alloc(&self) -> Option<PhysAddr> {
        let slot = self.free.lock().pop()?;
        let pa = self.region.frame_at(u64::from(slot));

        if poison_enabled() {
            // SAFETY: just popped, so this context is the frame's only
            // owner; the mapper covers the region per `init`.
            unsafe { fill_frame(&self.mapper, pa, POISON_ALLOC) };
        }

        let count = self.counts.lock().increment(slot as usize);
        debug_assert_eq!(count, 1, "freshly popped frame had surviving owners");

        Some(pa)
    }

    /// Allocate one page frame and zero it (page tables, fresh mappings).
    ///
    /// Same contract as [`alloc`](Self::alloc), but the frame arrives
    /// zero-filled instead of poisoned.
    pub fn alloc_zeroed(&self) -> Option<PhysAddr> {
        let pa = self.alloc()?;
        // SAFETY: freshly allocated, exclusively owned by this context.
        unsafe { fill_frame(&self.mapper, pa, 0) };
        Some(pa)
    }

    /// Release one reference to the frame at `pa`.
    ///
    /// While other owners remain the frame stays allocated. When the last
    /// reference goes away the frame is junk-filled (poisoned builds) and
    /// pushed onto the free list.
    ///
    /// # Panics
    ///
    /// When `pa` is not page-aligned, lies outside the allocatable range
    /// (frame-table pages included), or has no owner. All of these are
    /// caller invariant violations that cannot be safely continued past.
    pub fn free(&self, pa: PhysAddr) {
        let slot = self.checked_slot(pa);

        let remaining = self.counts.lock().decrement(slot);
        if remaining > 0 {
            // Frame is still shared; the caller's reference is gone but
            // other owners keep it allocated.
            return;
        }

        if poison_enabled() {
            // SAFETY: the count reached zero, so the calling context held
            // the last reference and nobody else can touch the frame.
            unsafe { fill_frame(&self.mapper, pa, POISON_FREE) };
        }

        self.free.lock().push(slot as u32);
    }

    /// Add an owner to an already-allocated frame (copy-on-write fork,
    /// shared mapping) without going through [`alloc`](Self::alloc).
    ///
    /// The caller must itself own a reference to `pa`; raising a count
    /// that already reached zero violates the ownership protocol (see the
    /// module docs on locking).
    ///
    /// # Panics
    ///
    /// Same address validation as [`free`](Self::free); also when the
    /// count would overflow its `u8`.
    pub fn add_reference(&self, pa: PhysAddr) {
        let slot = self.checked_slot(pa);
        let count = self.counts.lock().increment(slot);
        debug_assert!(count > 1, "add_reference on a frame with no owner");
    }

    /// Remove an owner from a shared frame without touching the free
    /// list.
    ///
    /// This never transitions a frame to the free state: the last owner
    /// must release through [`free`](Self::free), which is the only path
    /// that pushes. Dropping the final reference here strands the frame.
    ///
    /// # Panics
    ///
    /// Same address validation as [`free`](Self::free); also on a frame
    /// with no owner.
    pub fn drop_reference(&self, pa: PhysAddr) {
        let slot = self.checked_slot(pa);
        self.counts.lock().decrement(slot);
    }

    /// Current owner count of the frame at `pa`.
    #[must_use]
    pub fn ref_count(&self, pa: PhysAddr) -> u8 {
        let slot = self.checked_slot(pa);
        self.counts.lock().get(slot)
    }

    /// Frames available to callers after the tables took their share.
    #[must_use]
    pub const fn usable_frames(&self) -> u64 {
        self.layout.usable_frames
    }

    /// Frames currently sitting on the free list.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.free.lock().len()
    }

    /// First allocatable address; everything below (down to
    /// `region.start`) backs the frame tables.
    #[must_use]
    pub const fn frames_base(&self) -> PhysAddr {
        self.layout.frames_base
    }

    /// The managed region this allocator was constructed over.
    #[must_use]
    pub const fn region(&self) -> PhysRegion {
        self.region
    }

    /// Validate an externally supplied frame address and map it to its
    /// table slot. Violations are fatal: they indicate a corrupted caller,
    /// and continuing would corrupt the frame tables too.
    fn checked_slot(&self, pa: PhysAddr) -> usize {
        assert!(pa.is_page_aligned(), "pmm: unaligned frame address {pa:?}");
        assert!(
            self.layout.frames_base <= pa && self.region.contains(pa),
            "pmm: frame address {pa:?} outside the allocatable range"
        );
        self.region.slot_of(pa) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phys_mapper::IdentityPhysMapper;
    use std::alloc::{Layout, alloc, dealloc};
    use std::collections::HashSet;
    use std::thread;

    /// Owned, page-aligned buffer standing in for physical RAM.
    ///
    /// The allocator runs over it with an identity mapping, so the frame
    /// addresses it hands out are real pointers into this buffer and tests
    /// can inspect frame contents directly. Only for tests.
    struct TestRam {
        base: *mut u8,
        layout: Layout,
    }

    impl TestRam {
        fn new(pages: u64) -> Self {
            let layout =
                Layout::from_size_align((pages * PAGE_SIZE) as usize, PAGE_SIZE as usize).unwrap();
            // SAFETY: the layout has a non-zero size.
            let base = unsafe { alloc(layout) };
            assert!(!base.is_null());
            Self { base, layout }
        }

        fn region(&self) -> PhysRegion {
            let start = self.base as u64;
            PhysRegion::new(
                PhysAddr::new(start),
                PhysAddr::new(start + self.layout.size() as u64),
            )
        }

        fn allocator(&self) -> FrameAllocator<IdentityPhysMapper> {
            // SAFETY: the buffer is page-aligned, exclusively owned by the
            // test, and outlives the allocator it backs.
            unsafe { FrameAllocator::init(self.region(), IdentityPhysMapper) }.unwrap()
        }
    }

    impl Drop for TestRam {
        fn drop(&mut self) {
            // SAFETY: allocated in `new` with this very layout.
            unsafe { dealloc(self.base, self.layout) };
        }
    }

    fn frame_bytes(pa: PhysAddr) -> &'static [u8] {
        // SAFETY: test frames point into a live TestRam buffer.
        unsafe { std::slice::from_raw_parts(pa.as_u64() as usize as *const u8, PAGE_SIZE as usize) }
    }

    /// 11 pages: one goes to the frame tables, ten are usable.
    const SCENARIO_PAGES: u64 = 11;

    #[test]
    fn init_rejects_unusable_regions() {
        let ram = TestRam::new(1);
        // SAFETY: same backing contract as TestRam::allocator.
        let result = unsafe { FrameAllocator::init(ram.region(), IdentityPhysMapper) };
        assert_eq!(result.err(), Some(RegionError::TooSmall));
    }

    #[test]
    fn exhaustion_scenario_over_ten_frames() {
        let ram = TestRam::new(SCENARIO_PAGES);
        let pmm = ram.allocator();
        assert_eq!(pmm.usable_frames(), 10);
        assert_eq!(pmm.free_frames(), 10);

        // Drain the allocator dry: exactly ten distinct, aligned frames.
        let mut seen = HashSet::new();
        for _ in 0..10 {
            let pa = pmm.alloc().expect("allocator exhausted early");
            assert!(pa.is_page_aligned());
            assert!(pmm.frames_base() <= pa && pa < ram.region().end);
            assert!(seen.insert(pa), "frame {pa:?} handed out twice");
        }
        assert_eq!(pmm.alloc(), None);
        assert_eq!(pmm.free_frames(), 0);

        // One release makes the very next allocation succeed with the
        // released frame.
        let released = *seen.iter().next().unwrap();
        pmm.free(released);
        assert_eq!(pmm.alloc(), Some(released));
    }

    #[test]
    fn round_trip_returns_the_frame_to_circulation() {
        let ram = TestRam::new(SCENARIO_PAGES);
        let pmm = ram.allocator();

        let pa = pmm.alloc().unwrap();
        assert_eq!(pmm.ref_count(pa), 1);
        assert_eq!(pmm.free_frames(), 9);

        pmm.free(pa);
        assert_eq!(pmm.ref_count(pa), 0);
        assert_eq!(pmm.free_frames(), 10);

        assert_eq!(pmm.alloc(), Some(pa));
    }

    #[test]
    fn shared_ownership_releases_on_the_last_owner() {
        let ram = TestRam::new(SCENARIO_PAGES);
        let pmm = ram.allocator();

        let pa = pmm.alloc().unwrap();
        pmm.add_reference(pa);
        assert_eq!(pmm.ref_count(pa), 2);

        // First release: still owned, never poisoned, never on the list.
        pmm.free(pa);
        assert_eq!(pmm.ref_count(pa), 1);
        assert_eq!(pmm.free_frames(), 9);
        assert_ne!(frame_bytes(pa)[0], POISON_FREE);

        // Last release frees for real.
        pmm.free(pa);
        assert_eq!(pmm.ref_count(pa), 0);
        assert_eq!(pmm.free_frames(), 10);
        assert_eq!(pmm.alloc(), Some(pa));
    }

    #[test]
    fn drop_reference_adjusts_sharing_without_freeing() {
        let ram = TestRam::new(SCENARIO_PAGES);
        let pmm = ram.allocator();

        let pa = pmm.alloc().unwrap();
        pmm.add_reference(pa);
        pmm.drop_reference(pa);
        assert_eq!(pmm.ref_count(pa), 1);
        assert_eq!(pmm.free_frames(), 9);

        pmm.free(pa);
        assert_eq!(pmm.free_frames(), 10);
    }

    #[test]
    fn poison_patterns_are_observable() {
        let ram = TestRam::new(SCENARIO_PAGES);
        let pmm = ram.allocator();

        let pa = pmm.alloc().unwrap();
        assert!(frame_bytes(pa).iter().all(|&b| b == POISON_ALLOC));

        // Scribble over the frame, then release it: the free poison must
        // cover every byte again.
        // SAFETY: the frame is exclusively ours until the free below.
        unsafe {
            std::ptr::write_bytes(pa.as_u64() as usize as *mut u8, 0xCC, PAGE_SIZE as usize);
        }
        pmm.free(pa);
        assert!(frame_bytes(pa).iter().all(|&b| b == POISON_FREE));
    }

    #[test]
    fn alloc_zeroed_clears_the_frame() {
        let ram = TestRam::new(SCENARIO_PAGES);
        let pmm = ram.allocator();

        let pa = pmm.alloc_zeroed().unwrap();
        assert!(frame_bytes(pa).iter().all(|&b| b == 0));
        assert_eq!(pmm.ref_count(pa), 1);
    }

    #[test]
    #[should_panic(expected = "unaligned frame address")]
    fn freeing_an_unaligned_address_is_fatal() {
        let ram = TestRam::new(SCENARIO_PAGES);
        let pmm = ram.allocator();
        pmm.free(pmm.frames_base() + 1);
    }

    #[test]
    #[should_panic(expected = "outside the allocatable range")]
    fn freeing_past_the_region_is_fatal() {
        let ram = TestRam::new(SCENARIO_PAGES);
        let pmm = ram.allocator();
        pmm.free(ram.region().end);
    }

    #[test]
    #[should_panic(expected = "outside the allocatable range")]
    fn freeing_a_frame_table_page_is_fatal() {
        let ram = TestRam::new(SCENARIO_PAGES);
        let pmm = ram.allocator();
        // region.start is page-aligned but backs the tables.
        pmm.free(ram.region().start);
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn double_free_is_fatal() {
        let ram = TestRam::new(SCENARIO_PAGES);
        let pmm = ram.allocator();
        let pa = pmm.alloc().unwrap();
        pmm.free(pa);
        pmm.free(pa);
    }

    #[test]
    fn concurrent_alloc_free_is_exclusive_and_conserving() {
        const THREADS: usize = 8;
        const ITERS: usize = 300;

        // 35 pages: one table page, 34 usable. Few enough to force both
        // contention and transient exhaustion.
        let ram = TestRam::new(35);
        let pmm = ram.allocator();
        let usable = pmm.free_frames();

        thread::scope(|s| {
            for t in 0..THREADS {
                let pmm = &pmm;
                s.spawn(move || {
                    let tag = t as u8 + 1;
                    let mut held = 0;
                    while held < ITERS {
                        let Some(pa) = pmm.alloc() else {
                            thread::yield_now();
                            continue;
                        };
                        held += 1;
                        let ptr = pa.as_u64() as usize as *mut u8;
                        // SAFETY: the frame is exclusively ours between
                        // alloc and free; a second owner writing here
                        // would trip the assert below.
                        unsafe {
                            std::ptr::write_bytes(ptr, tag, PAGE_SIZE as usize);
                        }
                        thread::yield_now();
                        let bytes =
                            // SAFETY: as above.
                            unsafe { std::slice::from_raw_parts(ptr, PAGE_SIZE as usize) };
                        assert!(
                            bytes.iter().all(|&b| b == tag),
                            "frame {pa:?} was co-owned by two contexts"
                        );
                        pmm.free(pa);
                    }
                });
            }
        });

        // Every frame came home and nobody owns anything.
        assert_eq!(pmm.free_frames(), usable);
        let region = ram.region();
        let mut pa = pmm.frames_base();
        while pa < region.end {
            assert_eq!(pmm.ref_count(pa), 0);
            pa += PAGE_SIZE;
        }
    }

    #[test]
    fn concurrent_shared_release_frees_exactly_once() {
        let ram = TestRam::new(SCENARIO_PAGES);
        let pmm = ram.allocator();

        let pa = pmm.alloc().unwrap();
        pmm.add_reference(pa);
        let before = pmm.free_frames();

        // Two owners race their final releases; the frame must reach the
        // free list exactly once.
        thread::scope(|s| {
            for _ in 0..2 {
                let pmm = &pmm;
                s.spawn(move || pmm.free(pa));
            }
        });

        assert_eq!(pmm.ref_count(pa), 0);
        assert_eq!(pmm.free_frames(), before + 1);
        assert_eq!(pmm.alloc(), Some(pa));
    }
}
