// =============================================================================
// CoralOS — Virtual Memory Pool
// =============================================================================
//
// A VM pool owns a contiguous virtual window [base, base + size) inside
// one address space and tracks which ranges of it are reserved. It hands
// out addresses only; no mapping exists until a touch faults and the
// page-table handler installs one. Release is the symmetric path: the
// pool walks the region page by page and asks the page table to tear the
// mappings down.
//
// REGION TABLE:
//   The bookkeeping lives inside the window itself: one frame at `base`
//   holds an array of RegionInfo records sorted by start address.
//   Record 0 always describes that frame. The very first write to the
//   table faults like any other touch, which is why the legitimacy check
//   special-cases the list's own frame while the pool is still empty.
//
// =============================================================================

use core::mem::size_of;

use crate::memory::address::{round_up_to_page, VirtAddr, PAGE_SIZE};
use crate::memory::frame_pool::FramePool;
use crate::memory::page_table::PageTable;

/// One reserved region: `size` is always a whole number of frames and
/// `start` is frame-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RegionInfo {
    pub start: VirtAddr,
    pub size: usize,
}

impl RegionInfo {
    fn end(&self) -> usize {
        self.start.as_usize() + self.size
    }

    fn contains(&self, addr: VirtAddr) -> bool {
        addr.as_usize() >= self.start.as_usize() && addr.as_usize() < self.end()
    }
}

/// Reserved-region tracking for one virtual window.
pub struct VmPool {
    /// Start of the window; also the address of the region table.
    base: VirtAddr,
    /// Window length in bytes, a whole number of frames.
    size: usize,
    /// Pool that ultimately backs this window's pages. The fault handler
    /// draws from the process pool directly, so the handle is kept for
    /// the constructor's contract only.
    #[allow(dead_code)]
    frame_pool: *const FramePool,
    /// Page table of the owning address space, for release teardown.
    page_table: *mut PageTable,
    /// The in-window record array.
    regions: *mut RegionInfo,
    /// Live records, self-descriptor included once installed.
    count: usize,
}

impl VmPool {
    /// Records the window `[base, base + size)` (size rounded up to a
    /// frame multiple). The pool is inert until the owning address
    /// space registers it with [`PageTable::register_pool`]; the
    /// self-descriptor is written on first use, after that registration
    /// has made the write legitimate.
    ///
    /// # Panics
    ///
    /// If `base` is not frame-aligned.
    pub fn new(
        base: VirtAddr,
        size: usize,
        frame_pool: &FramePool,
        page_table: &mut PageTable,
    ) -> VmPool {
        assert!(base.is_page_aligned(), "VM pool base {} not frame-aligned", base);
        let size = round_up_to_page(size);
        klog::info!("constructed VM pool [{}, {:#010x})", base, base.as_usize() + size);
        VmPool {
            base,
            size,
            frame_pool,
            page_table,
            regions: base.as_mut_ptr(),
            count: 0,
        }
    }

    /// Start of the window.
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Most records the one-frame table holds.
    const fn capacity() -> usize {
        PAGE_SIZE / size_of::<RegionInfo>()
    }

    /// Reserves `size` bytes (rounded up to a frame multiple) and
    /// returns the start address. First fit: the lowest interior gap
    /// between neighbouring records wins, then the tail gap against the
    /// window end. No mapping is installed; the first touch faults one
    /// in.
    ///
    /// # Panics
    ///
    /// If `size` is zero or no gap fits.
    pub fn allocate(&mut self, size: usize) -> VirtAddr {
        assert!(size > 0, "zero-sized VM allocation");
        let size = round_up_to_page(size);
        self.ensure_descriptor();

        // The space before record 0 never exists: the table itself sits
        // at the window base.
        let mut placed = None;
        for i in 0..self.count - 1 {
            let gap_start = self.record(i).end();
            if self.record(i + 1).start.as_usize() - gap_start >= size {
                placed = Some((i + 1, gap_start));
                break;
            }
        }
        if placed.is_none() {
            let gap_start = self.record(self.count - 1).end();
            if self.base.as_usize() + self.size - gap_start >= size {
                placed = Some((self.count, gap_start));
            }
        }

        let Some((index, start)) = placed else {
            panic!(
                "VM pool [{}, {:#010x}): no gap fits {} bytes",
                self.base,
                self.base.as_usize() + self.size,
                size
            );
        };

        let start = VirtAddr::new(start);
        self.insert_record(index, RegionInfo { start, size });
        klog::debug!("reserved [{}, {:#010x})", start, start.as_usize() + size);
        start
    }

    /// Releases the region previously returned from [`allocate`] at
    /// `start`: tears down every page mapping in it, then drops the
    /// record. An unknown start address logs an error and returns; the
    /// caller handing back a bad handle is an expected soft condition.
    ///
    /// [`allocate`]: VmPool::allocate
    pub fn release(&mut self, start: VirtAddr) {
        let mut found = None;
        for i in 1..self.count {
            if self.record(i).start == start {
                found = Some(i);
                break;
            }
        }
        let Some(index) = found else {
            klog::error!("release of unknown region {}", start);
            return;
        };

        let region = self.record(index);
        let first_page = region.start.page_number();
        let pages = region.size / PAGE_SIZE;
        for page in first_page..first_page + pages {
            // SAFETY: the owning page table outlives its pools and is
            // only reached from the single cooperative CPU.
            unsafe { (*self.page_table).free_page(page) };
        }

        self.remove_record(index);
        klog::debug!("released [{}, {:#010x})", start, region.end());
    }

    /// Whether `addr` falls inside a reserved region. While the pool has
    /// no records yet, only the region table's own frame is legitimate,
    /// so the table's first write can fault its mapping in.
    pub fn is_legitimate(&self, addr: VirtAddr) -> bool {
        if self.count == 0 {
            return addr.as_usize() >= self.base.as_usize()
                && addr.as_usize() < self.base.as_usize() + PAGE_SIZE;
        }
        (0..self.count).any(|i| self.record(i).contains(addr))
    }

    /// Writes the self-descriptor if this is the pool's first use.
    fn ensure_descriptor(&mut self) {
        if self.count == 0 {
            // This store is the pool's first touch of its own window; in
            // a live address space it faults and the bootstrap rule in
            // is_legitimate admits it.
            // SAFETY: record 0 lies in the window's first frame, which
            // the owning address space maps on demand.
            unsafe {
                *self.regions = RegionInfo {
                    start: self.base,
                    size: PAGE_SIZE,
                };
            }
            self.count = 1;
        }
    }

    fn record(&self, index: usize) -> RegionInfo {
        debug_assert!(index < self.count);
        // SAFETY: index is bounded by count, which never exceeds the
        // one-frame capacity.
        unsafe { *self.regions.add(index) }
    }

    /// Inserts `region` at `index`, shifting `[index, count)` right.
    fn insert_record(&mut self, index: usize, region: RegionInfo) {
        assert!(self.count < Self::capacity(), "VM pool region table full");
        // SAFETY: all touched slots are within the one-frame table.
        unsafe {
            let mut i = self.count;
            while i > index {
                *self.regions.add(i) = *self.regions.add(i - 1);
                i -= 1;
            }
            *self.regions.add(index) = region;
        }
        self.count += 1;
    }

    /// Removes the record at `index`, shifting `(index, count)` left and
    /// clearing the freed slot.
    fn remove_record(&mut self, index: usize) {
        // SAFETY: as in insert_record.
        unsafe {
            for i in index..self.count - 1 {
                *self.regions.add(i) = *self.regions.add(i + 1);
            }
            *self.regions.add(self.count - 1) = RegionInfo {
                start: VirtAddr::new(0),
                size: 0,
            };
        }
        self.count -= 1;
    }
}
