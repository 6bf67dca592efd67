// =============================================================================
// CoralOS — Physical and Virtual Address Types
// =============================================================================
//
// Confusing a physical address with a virtual address is one of the most
// common and catastrophic kernel bugs, so the two get separate newtypes.
// The compiler prevents using one where the other is expected; converting
// between them requires explicit calls that document the relationship.
//
// Both types store `usize`, which is 32 bits on the target. A virtual
// address splits 10/10/12 for the two-level page table:
//
//   31        22 21        12 11         0
//   ┌───────────┬────────────┬───────────┐
//   │ directory │   table    │  offset   │
//   │ (10 bit)  │  (10 bit)  │ (12 bit)  │
//   └───────────┴────────────┴───────────┘
//
// DIRECT MAP:
//   The low physical memory the core manages is reachable at a fixed
//   virtual offset. On the machine that offset is 0 — the boot layer
//   identity-maps low memory before the core runs. Hosted test builds
//   point the offset into an in-process arena instead, so the exact same
//   pool and page-table code manipulates test memory.
//
// =============================================================================

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Size of a page frame (4 KiB). Pages are the same size.
pub const PAGE_SIZE: usize = 4096;

/// Bit shift converting between frame numbers and addresses (4 K = 2^12).
pub const PAGE_SHIFT: usize = 12;

/// Entries per page directory or page table (1024 four-byte words).
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Offset added to a physical address to reach its direct mapping.
///
/// 0 on the machine; hosted tests aim it at an arena.
static DIRECT_MAP_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Sets the direct-map offset.
///
/// # Safety
///
/// Must be called before any `PhysAddr::to_virt()` use, and the window
/// `[offset + base, offset + limit)` must stay readable and writable for
/// as long as pools and page tables reference memory through it.
pub unsafe fn init_direct_map(offset: usize) {
    DIRECT_MAP_OFFSET.store(offset, Ordering::SeqCst);
}

#[inline]
fn direct_map_offset() -> usize {
    DIRECT_MAP_OFFSET.load(Ordering::Relaxed)
}

// =============================================================================
// PhysAddr — a physical memory address
// =============================================================================

/// A physical memory address: what goes on the memory bus after the MMU
/// has translated.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// The physical address of frame `frame`.
    #[inline]
    pub const fn from_frame(frame: usize) -> Self {
        Self(frame << PAGE_SHIFT)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// The dense frame index covering this address.
    #[inline]
    pub const fn frame(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Converts this physical address to its direct-map virtual address.
    #[inline]
    pub fn to_virt(self) -> VirtAddr {
        VirtAddr::new(self.0.wrapping_add(direct_map_offset()))
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }
}

/// `P:` prefix distinguishes physical from virtual addresses in log output.
impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

// =============================================================================
// VirtAddr — a virtual memory address
// =============================================================================

/// A virtual memory address: what the CPU uses for every access, routed
/// through the two-level page table once paging is on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Converts this virtual address to a raw pointer. The bridge between
    /// the type-safe address world and actual memory access.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// The 10-bit page-directory index (bits 31..22).
    #[inline]
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) & 0x3FF
    }

    /// The 10-bit page-table index (bits 21..12).
    #[inline]
    pub const fn table_index(self) -> usize {
        (self.0 >> 12) & 0x3FF
    }

    /// The 12-bit offset within the page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// The virtual page number (address with the offset bits dropped).
    #[inline]
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Adds a byte offset.
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

/// `V:` prefix distinguishes virtual from physical addresses in log output.
impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#010X}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#010X}", self.0)
    }
}

/// Rounds a byte count up to a whole number of frames.
#[inline]
pub const fn round_up_to_page(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
