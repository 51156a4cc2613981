//! # Bookkeeping placement
//!
//! The allocator's frame tables live **in band**, at the very start of the
//! region they describe:
//!
//! ```text
//! region.start                                              region.end
//! v                                                                  v
//! +----------------+------------------+---~~~---+--------------------+
//! | refcounts      | free links       | padding | usable frames ...  |
//! | u8 * frames    | u32 * frames     | to page |                    |
//! +----------------+------------------+---~~~---+--------------------+
//! ^ counts_base    ^ links_base                 ^ frames_base
//! ```
//!
//! Both arrays are sized for **every** frame in the region, including the
//! frames they occupy themselves. That makes their size a function of the
//! fixed region bounds alone, so no fixpoint iteration is needed before
//! the first frame can be handed out.

use crate::addr::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, PhysRegion, align_up};

/// Free-link entries are `u32` slot indices.
const LINK_SIZE: u64 = size_of::<u32>() as u64;

/// A managed region cannot be carved into frame tables plus usable frames.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("region bounds are not page-aligned")]
    Unaligned,
    #[error("region cannot hold the frame tables and at least one page")]
    TooSmall,
    #[error("region holds more frames than the free-link arena can index")]
    TooLarge,
}

/// Where the in-band frame tables and the first usable frame ended up.
///
/// Produced once by [`compute`](Self::compute) and immutable afterwards;
/// all facade bounds checks read from here.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameTableLayout {
    /// Frames in the whole region, bookkeeping included.
    pub frame_count: u64,
    /// Reference-count array base (`== region.start`).
    pub counts_base: PhysAddr,
    /// Free-link arena base, 4-byte aligned.
    pub links_base: PhysAddr,
    /// First page boundary past the tables; the first allocatable frame.
    pub frames_base: PhysAddr,
    /// Frames consumed by the tables (pinned, never allocatable).
    pub reserved_frames: u64,
    /// Frames available to callers: `(region.end - frames_base) / PAGE_SIZE`.
    pub usable_frames: u64,
}

impl FrameTableLayout {
    /// Carve the frame tables out of `region`.
    ///
    /// # Errors
    ///
    /// [`RegionError::Unaligned`] when a bound is not on a page boundary,
    /// [`RegionError::TooSmall`] when no usable frame would remain,
    /// [`RegionError::TooLarge`] when a slot index would not fit the link
    /// arena's `u32` entries.
    pub fn compute(region: PhysRegion) -> Result<Self, RegionError> {
        if !region.start.is_page_aligned() || !region.end.is_page_aligned() {
            return Err(RegionError::Unaligned);
        }

        let frame_count = region.page_count();
        if frame_count == 0 {
            return Err(RegionError::TooSmall);
        }
        if frame_count > u64::from(u32::MAX) {
            return Err(RegionError::TooLarge);
        }

        let counts_base = region.start;
        let counts_end = counts_base.as_u64() + frame_count;
        let links_base = align_up(counts_end, LINK_SIZE);
        let links_end = links_base + frame_count * LINK_SIZE;
        let frames_base = align_up(links_end, PAGE_SIZE);

        if frames_base >= region.end.as_u64() {
            return Err(RegionError::TooSmall);
        }

        Ok(Self {
            frame_count,
            counts_base,
            links_base: PhysAddr::new(links_base),
            frames_base: PhysAddr::new(frames_base),
            reserved_frames: (frames_base - region.start.as_u64()) >> PAGE_SHIFT,
            usable_frames: (region.end.as_u64() - frames_base) >> PAGE_SHIFT,
        })
    }
}
