//! # Physical Memory Manager
//!
//! Fixed-size (4 KiB) page-frame allocation with per-frame reference
//! counting for a flat, statically bounded region of physical memory. The
//! allocator backs user process page tables, kernel stacks, page-table
//! pages and pipe buffers; reference counts let forked address spaces and
//! shared mappings co-own a frame until the last owner lets go.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Frame Allocator Facade                 │
//! │    • init bootstrap / alloc / free                  │
//! │    • add_reference / drop_reference sharing         │
//! │    • alignment + bounds enforcement (fatal)         │
//! └─────────┬──────────────────────────────┬────────────┘
//!           │ "pmm.refcount" lock          │ "pmm.free" lock
//! ┌─────────▼────────────────┐  ┌──────────▼────────────┐
//! │  Reference-Count Table   │  │       Free List       │
//! │  one u8 owner count per  │  │  intrusive list of    │
//! │  frame, in band at the   │  │  slot indices in an   │
//! │  start of the region     │  │  external link arena  │
//! └──────────────────────────┘  └───────────────────────┘
//! ```
//!
//! The bookkeeping arrays live **inside** the managed region, at its very
//! start; their size depends only on the fixed region bounds, so the
//! placement is computable before the first frame is handed out (see
//! [`FrameTableLayout`]). Physical memory is reached through an injected
//! [`PhysMapper`], never by casting physical addresses directly.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kernel_pmm::{FrameAllocator, OffsetPhysMapper, PhysAddr, PhysRegion};
//!
//! // Layout constants come from the platform: the first page boundary
//! // past the kernel image and the top of physical memory.
//! let region = PhysRegion::new(PhysAddr::new(kernel_end), PhysAddr::new(phys_top));
//! let mapper = OffsetPhysMapper::new(hhdm_base);
//!
//! let pmm = unsafe { FrameAllocator::init(region, mapper) }?;
//! let frame = pmm.alloc().ok_or(Error::OutOfMemory)?;
//! // ... map it, use it ...
//! pmm.free(frame);
//! ```
//!
//! ## Error model
//!
//! Exhaustion is the *only* recoverable failure: [`FrameAllocator::alloc`]
//! returns `None` and the caller decides. Everything else (unaligned or
//! out-of-range addresses, releasing an unowned frame) is a caller
//! invariant violation and panics immediately; continuing past it would
//! corrupt the frame tables.
//!
//! ## Debug junk fills
//!
//! In debug builds (and in release builds with the `poison` feature)
//! frames are filled with [`POISON_ALLOC`] when handed out and
//! [`POISON_FREE`] when the last reference is released, making
//! use-before-initialize and use-after-free bugs deterministic instead of
//! heisenbugs.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod addr;
mod frame_alloc;
mod free_list;
mod layout;
mod phys_mapper;
mod refcount;

pub use addr::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, PhysRegion, align_down, align_up};
pub use frame_alloc::{FrameAllocator, POISON_ALLOC, POISON_FREE};
pub use layout::{FrameTableLayout, RegionError};
pub use phys_mapper::{IdentityPhysMapper, OffsetPhysMapper, PhysMapper};
