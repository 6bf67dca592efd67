// =============================================================================
// CoralOS — Two-Level Page Tables and the Page-Fault Handler
// =============================================================================
//
// One PageTable per address space. The hardware structure is a page
// directory of 1024 32-bit entries, each pointing at an inner page table
// of 1024 entries, each pointing at a 4 KiB data page. An entry's low
// 12 bits carry flags (present, read/write, user/supervisor), the upper
// 20 bits the pointed-to frame.
//
// MAPPING STRATEGY:
//   Construction only maps the low "shared" region: the first inner
//   table identity-maps [0, 4 MiB) and PDE 0 points at it. Everything
//   above that is populated on demand by the page-fault handler, one
//   inner table and one data frame at a time, drawn from the process
//   frame pool. Inner tables are never torn down once built.
//
// RECURSIVE SELF-MAP:
//   The last PDE points at the directory itself. Once paging is on, the
//   running address space can then reach its own paging structures
//   through fixed virtual addresses:
//
//     0xFFFFF000 | D << 2          the word for PDE D
//     0xFFC00000 | D << 12 | T<<2  the word for PTE T of directory slot D
//
//   Without this trick the kernel would need a physical-address alias to
//   edit inner tables after paging is enabled.
//
// ENTRY ACCESS PATHS:
//   Before paging is enabled (boot, hosted tests) the same words are
//   reached by walking the physical structure through the direct map.
//   The process-wide paging flag selects the path, so identical fault
//   and free logic runs in both worlds.
//
// =============================================================================

use arrayvec::ArrayVec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use khal::cpu::TrapFrame;

use crate::memory::address::{PhysAddr, VirtAddr, ENTRIES_PER_TABLE, PAGE_SHIFT};
use crate::memory::frame_pool::FramePool;
use crate::memory::vm_pool::VmPool;
use crate::sync::spinlock::SpinLock;

/// Virtual address of the PDE window opened by the recursive self-map.
const DIRECTORY_WINDOW: usize = 0xFFFF_F000;

/// Virtual address of the PTE window opened by the recursive self-map.
const TABLE_WINDOW: usize = 0xFFC0_0000;

/// CR0 bit 31 enables paging.
const CR0_PAGING: usize = 0x8000_0000;

/// Most VM pools one address space registers.
const MAX_VM_POOLS: usize = 8;

bitflags! {
    /// Flag bits shared by page-directory and page-table entries.
    ///
    /// Supervisor access is the absence of `USER`; the core maps
    /// everything supervisor-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        /// Entry is valid; if clear, any access faults.
        const PRESENT  = 1 << 0;
        /// Page (or the whole table behind a PDE) is writable.
        const WRITABLE = 1 << 1;
        /// Page is reachable from user mode.
        const USER     = 1 << 2;
    }
}

/// One 32-bit page-directory or page-table word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u32);

impl Entry {
    /// An entry pointing at `frame` with the given flags.
    #[inline]
    pub fn new(frame: usize, flags: EntryFlags) -> Entry {
        Entry(((frame as u32) << PAGE_SHIFT) | flags.bits())
    }

    /// The canonical not-present entry: attribute bits kept, present
    /// bit clear.
    #[inline]
    pub const fn not_present() -> Entry {
        Entry(EntryFlags::WRITABLE.bits())
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    /// The frame number in the address bits.
    #[inline]
    pub fn frame(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }

    #[inline]
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }
}

// =============================================================================
// Process-wide paging state
// =============================================================================

/// Pools and boundaries shared by every page table, set once by
/// [`PageTable::init`] during boot.
#[derive(Clone, Copy)]
struct PagingConfig {
    /// Pool for the shared low mapping structures.
    kernel_pool: *mut FramePool,
    /// Pool for per-address-space data pages and inner tables.
    process_pool: *mut FramePool,
    /// Byte length of the direct-mapped low region that never faults.
    shared_size: usize,
}

// SAFETY: the raw pool pointers are only dereferenced from the single
// cooperative CPU.
unsafe impl Send for PagingConfig {}

static CONFIG: SpinLock<Option<PagingConfig>> = SpinLock::new(None);

/// The table most recently loaded into CR3.
static CURRENT_TABLE: AtomicPtr<PageTable> = AtomicPtr::new(core::ptr::null_mut());

/// Latched by [`PageTable::enable_paging`]; selects the entry access path.
static PAGING_ENABLED: AtomicBool = AtomicBool::new(false);

fn config() -> PagingConfig {
    CONFIG.lock().expect("paging system not initialized")
}

/// Whether paging has been turned on.
pub fn paging_enabled() -> bool {
    PAGING_ENABLED.load(Ordering::SeqCst)
}

#[cfg(test)]
pub(crate) fn reset_paging_state() {
    *CONFIG.lock() = None;
    CURRENT_TABLE.store(core::ptr::null_mut(), Ordering::SeqCst);
    PAGING_ENABLED.store(false, Ordering::SeqCst);
}

// =============================================================================
// PageTable
// =============================================================================

/// The paging structures of one address space.
pub struct PageTable {
    /// Physical address of the page directory frame.
    directory: PhysAddr,
    /// Virtual pools registered against this address space; consulted by
    /// the fault handler for legitimacy.
    pools: ArrayVec<*mut VmPool, MAX_VM_POOLS>,
}

impl PageTable {
    /// Stores the frame pools and the shared-region size every page
    /// table draws on. Call once during boot, before the first
    /// [`PageTable::new`].
    ///
    /// # Safety
    ///
    /// Both pools must outlive every page table and must stay at their
    /// given addresses.
    pub unsafe fn init(
        kernel_pool: &mut FramePool,
        process_pool: &mut FramePool,
        shared_size: usize,
    ) {
        let mut cfg = CONFIG.lock();
        assert!(cfg.is_none(), "paging system initialized twice");
        *cfg = Some(PagingConfig {
            kernel_pool,
            process_pool,
            shared_size,
        });
        klog::info!(
            "paging system initialized, shared region {} KiB",
            shared_size >> 10
        );
    }

    /// Builds the paging structures for a fresh address space: a
    /// directory and one inner table identity-mapping the shared low
    /// region, with the last PDE looped back onto the directory.
    ///
    /// Construction writes go through the direct map, so the frames
    /// backing the new structures must be reachable through it (true at
    /// boot, before paging moves the kernel behind translations).
    ///
    /// # Panics
    ///
    /// If [`PageTable::init`] has not run or the pools are out of frames.
    pub fn new() -> PageTable {
        let cfg = config();
        // SAFETY: init's contract keeps the pools alive and unaliased on
        // the single cooperative CPU.
        let (kernel_pool, process_pool) =
            unsafe { (&mut *cfg.kernel_pool, &mut *cfg.process_pool) };

        let directory_frame = process_pool
            .allocate(1)
            .expect("out of frames for a page directory");
        let shared_table_frame = kernel_pool
            .allocate(1)
            .expect("out of frames for the shared page table");

        let directory = PhysAddr::from_frame(directory_frame);
        let shared_table = PhysAddr::from_frame(shared_table_frame);

        // SAFETY: both frames were just allocated from pools the direct
        // map covers; nothing else references them yet.
        unsafe {
            // Identity-map [0, 4 MiB): entry i points at frame i.
            let table = shared_table.to_virt().as_mut_ptr::<Entry>();
            for i in 0..ENTRIES_PER_TABLE {
                *table.add(i) = Entry::new(i, EntryFlags::PRESENT | EntryFlags::WRITABLE);
            }

            let dir = directory.to_virt().as_mut_ptr::<Entry>();
            *dir = Entry::new(
                shared_table_frame,
                EntryFlags::PRESENT | EntryFlags::WRITABLE,
            );
            for i in 1..ENTRIES_PER_TABLE - 1 {
                *dir.add(i) = Entry::not_present();
            }
            // Recursive self-map: the last PDE points at the directory,
            // exposing every paging structure through the fixed windows.
            *dir.add(ENTRIES_PER_TABLE - 1) = Entry::new(
                directory_frame,
                EntryFlags::PRESENT | EntryFlags::WRITABLE,
            );
        }

        klog::info!("constructed page table, directory {}", directory);
        PageTable {
            directory,
            pools: ArrayVec::new(),
        }
    }

    /// Physical address of this table's page directory.
    pub fn directory_phys(&self) -> PhysAddr {
        self.directory
    }

    /// A table whose directory has no present entries at all, so every
    /// walk lands on the not-present soft path regardless of which slot
    /// an address decomposes into. Test scaffolding only.
    #[cfg(test)]
    pub(crate) fn new_unmapped() -> PageTable {
        let cfg = config();
        // SAFETY: as in `new`.
        let process_pool = unsafe { &mut *cfg.process_pool };
        let frame = process_pool
            .allocate(1)
            .expect("out of frames for a page directory");
        let directory = PhysAddr::from_frame(frame);
        unsafe {
            let dir = directory.to_virt().as_mut_ptr::<Entry>();
            for i in 0..ENTRIES_PER_TABLE {
                *dir.add(i) = Entry::not_present();
            }
        }
        PageTable {
            directory,
            pools: ArrayVec::new(),
        }
    }

    /// Installs this table in CR3 and records it as current.
    ///
    /// Must be called from the thread that owns the new address space;
    /// every translation after the write goes through this table.
    pub fn load(&mut self) {
        // SAFETY: the directory was built by `new` and maps the shared
        // low region the kernel runs in.
        unsafe { khal::cpu::write_cr3(self.directory.as_usize()) };
        CURRENT_TABLE.store(self as *mut PageTable, Ordering::SeqCst);
        klog::debug!("loaded page table, directory {}", self.directory);
    }

    /// Sets the paging-enable bit in CR0 and latches the process-wide
    /// flag. A table must have been loaded first.
    pub fn enable_paging() {
        // SAFETY: callers load a valid directory before enabling; the
        // shared low region the kernel executes in is identity-mapped.
        unsafe { khal::cpu::write_cr0(khal::cpu::read_cr0() | CR0_PAGING) };
        PAGING_ENABLED.store(true, Ordering::SeqCst);
        klog::info!("paging enabled");
    }

    /// The page-fault handler, installed on vector 14 by the interrupt
    /// plumbing. Reads the faulting address from CR2 and installs the
    /// missing inner table and/or data page in the current address
    /// space; the CPU then restarts the faulting instruction.
    ///
    /// # Panics
    ///
    /// If no table is loaded, or the address is neither inside the
    /// shared region nor covered by a registered VM pool.
    pub fn handle_fault(_frame: &TrapFrame) {
        let fault_addr = VirtAddr::new(khal::cpu::read_cr2());
        let current = CURRENT_TABLE.load(Ordering::SeqCst);
        assert!(!current.is_null(), "page fault with no page table loaded");
        // SAFETY: fault handling runs with interrupts off and is
        // non-reentrant for a given table (single cooperative CPU).
        let current = unsafe { &mut *current };
        current.install_mapping(fault_addr);
    }

    fn install_mapping(&mut self, fault_addr: VirtAddr) {
        let cfg = config();
        if !self.is_legitimate_address(fault_addr, cfg.shared_size) {
            klog::error!(
                "page fault at {:#010x}: address outside every registered pool",
                fault_addr.as_usize()
            );
            panic!("illegitimate page fault at {:#010x}", fault_addr.as_usize());
        }

        // SAFETY: see init's contract; single cooperative CPU.
        let process_pool = unsafe { &mut *cfg.process_pool };

        let dir_index = fault_addr.directory_index();
        let table_index = fault_addr.table_index();

        // SAFETY: slot pointers come from the recursive window of the
        // loaded table or from the direct map; both alias the live
        // structures exclusively while the fault is serviced.
        unsafe {
            let pde = self.pde_slot(dir_index);
            if !(*pde).is_present() {
                let frame = process_pool
                    .allocate(1)
                    .expect("out of frames for an inner page table");
                *pde = Entry::new(frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
                // A fresh inner table starts with every entry
                // not-present.
                for i in 0..ENTRIES_PER_TABLE {
                    *self.pte_slot(dir_index, i) = Entry::not_present();
                }
            }

            let pte = self.pte_slot(dir_index, table_index);
            if !(*pte).is_present() {
                let frame = process_pool
                    .allocate(1)
                    .expect("out of frames for a data page");
                *pte = Entry::new(frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
            }
        }
    }

    /// Adds a VM pool to the set consulted for fault legitimacy.
    ///
    /// # Safety
    ///
    /// The pool must stay at this address and outlive the table (kernel
    /// objects never move or drop; see the ownership notes in the
    /// memory module).
    ///
    /// # Panics
    ///
    /// If the pool list is full.
    pub unsafe fn register_pool(&mut self, pool: &mut VmPool) {
        let base = pool.base();
        assert!(
            self.pools.try_push(pool).is_ok(),
            "VM pool list full ({} pools)",
            MAX_VM_POOLS
        );
        klog::info!("registered VM pool at {}", base);
    }

    /// Unmaps virtual page `page_number` and returns its frame to the
    /// owning pool. A page without a live mapping only logs a warning;
    /// tearing down an already-empty slot is an expected soft condition.
    pub fn free_page(&mut self, page_number: usize) {
        let dir_index = (page_number >> 10) & 0x3FF;
        let table_index = page_number & 0x3FF;

        // SAFETY: as in install_mapping.
        unsafe {
            let pde = self.pde_slot(dir_index);
            if (*pde).is_present() {
                let pte = self.pte_slot(dir_index, table_index);
                if (*pte).is_present() {
                    FramePool::release((*pte).frame());
                    *pte = Entry::not_present();
                    // Reload CR3 to drop the stale translation from the
                    // TLB.
                    khal::cpu::write_cr3(khal::cpu::read_cr3());
                    klog::debug!("freed page {:#07x}", page_number);
                    return;
                }
            }
        }
        klog::warn!("free_page: page {:#07x} has no mapping", page_number);
    }

    fn is_legitimate_address(&self, addr: VirtAddr, shared_size: usize) -> bool {
        if addr.as_usize() < shared_size {
            return true;
        }
        self.pools.iter().any(|&pool| {
            // SAFETY: registered pools outlive the table per
            // register_pool's contract.
            unsafe { (*pool).is_legitimate(addr) }
        })
    }

    // =========================================================================
    // Entry word access
    // =========================================================================

    fn is_current(&self) -> bool {
        core::ptr::eq(CURRENT_TABLE.load(Ordering::SeqCst), self)
    }

    /// Virtual address of the word for PDE `dir_index` in the recursive
    /// window.
    fn directory_window_slot(dir_index: usize) -> VirtAddr {
        VirtAddr::new(DIRECTORY_WINDOW | (dir_index << 2))
    }

    /// Virtual address of the word for PTE `table_index` of directory
    /// slot `dir_index` in the recursive window.
    fn table_window_slot(dir_index: usize, table_index: usize) -> VirtAddr {
        VirtAddr::new(TABLE_WINDOW | (dir_index << 12) | (table_index << 2))
    }

    /// Pointer to the word for PDE `dir_index`.
    ///
    /// # Safety
    ///
    /// With paging live the table must be current; otherwise the
    /// directory frame must be reachable through the direct map.
    unsafe fn pde_slot(&self, dir_index: usize) -> *mut Entry {
        if paging_enabled() && self.is_current() {
            Self::directory_window_slot(dir_index).as_mut_ptr()
        } else {
            self.directory
                .to_virt()
                .as_mut_ptr::<Entry>()
                .add(dir_index)
        }
    }

    /// Pointer to the word for PTE `table_index` under PDE `dir_index`,
    /// which must be present.
    ///
    /// # Safety
    ///
    /// As [`Self::pde_slot`]; additionally the PDE must hold a valid
    /// inner-table frame.
    unsafe fn pte_slot(&self, dir_index: usize, table_index: usize) -> *mut Entry {
        if paging_enabled() && self.is_current() {
            Self::table_window_slot(dir_index, table_index).as_mut_ptr()
        } else {
            let table = PhysAddr::from_frame((*self.pde_slot(dir_index)).frame());
            table.to_virt().as_mut_ptr::<Entry>().add(table_index)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::address::PAGE_SIZE;
    use crate::testutil::{machine, trap_frame, Arena};

    const ARENA_BASE: usize = 512;
    const ARENA_FRAMES: usize = 1024;

    const KERNEL_BASE: usize = 512;
    const KERNEL_FRAMES: usize = 256;
    const PROCESS_BASE: usize = 768;
    const PROCESS_FRAMES: usize = 768;

    const SHARED_4MIB: usize = 4 * 1024 * 1024;

    struct Setup {
        _arena: Arena,
        kernel_pool: Box<FramePool>,
        process_pool: Box<FramePool>,
    }

    fn setup(shared_size: usize) -> Setup {
        let arena = Arena::new(ARENA_BASE, ARENA_FRAMES);
        let mut kernel_pool =
            Box::new(unsafe { FramePool::new(KERNEL_BASE, KERNEL_FRAMES, 0, 0) });
        let mut process_pool =
            Box::new(unsafe { FramePool::new(PROCESS_BASE, PROCESS_FRAMES, 0, 0) });
        unsafe {
            kernel_pool.register();
            process_pool.register();
            PageTable::init(&mut kernel_pool, &mut process_pool, shared_size);
        }
        Setup {
            _arena: arena,
            kernel_pool,
            process_pool,
        }
    }

    fn read_entry(base: PhysAddr, index: usize) -> Entry {
        unsafe { *base.to_virt().as_ptr::<Entry>().add(index) }
    }

    #[test]
    fn construction_layout() {
        let _m = machine();
        let setup = setup(SHARED_4MIB);
        let pt = PageTable::new();

        let dir = pt.directory_phys();

        // PDE 0 points at a table identity-mapping the low 4 MiB.
        let pde0 = read_entry(dir, 0);
        assert!(pde0.is_present());
        let shared_table = PhysAddr::from_frame(pde0.frame());
        for i in [0usize, 1, 511, 1023] {
            let pte = read_entry(shared_table, i);
            assert!(pte.is_present());
            assert_eq!(pte.frame(), i);
            assert!(pte.flags().contains(EntryFlags::WRITABLE));
            assert!(!pte.flags().contains(EntryFlags::USER));
        }

        // Middle PDEs are not present but keep the r/w attribute.
        for i in [1usize, 2, 512, 1022] {
            let pde = read_entry(dir, i);
            assert!(!pde.is_present());
            assert!(pde.flags().contains(EntryFlags::WRITABLE));
        }

        // The last PDE loops back onto the directory.
        let last = read_entry(dir, ENTRIES_PER_TABLE - 1);
        assert!(last.is_present());
        assert_eq!(last.frame(), dir.frame());

        // Directory came from the process pool, shared table from the
        // kernel pool.
        assert_eq!(setup.process_pool.free_count(), PROCESS_FRAMES - 1 - 1);
        assert_eq!(setup.kernel_pool.free_count(), KERNEL_FRAMES - 1 - 1);
    }

    #[test]
    fn fault_installs_table_and_page_once() {
        let _m = machine();
        let setup = setup(8 * 1024 * 1024);
        let mut pt = PageTable::new();
        pt.load();

        let free_before = setup.process_pool.free_count();

        // First touch of [4 MiB, 8 MiB): a fresh inner table plus a data
        // frame, both from the process pool.
        khal::sim::set_cr2(0x0040_0000);
        PageTable::handle_fault(&trap_frame());
        assert_eq!(setup.process_pool.free_count(), free_before - 2);

        let dir = pt.directory_phys();
        let pde1 = read_entry(dir, 1);
        assert!(pde1.is_present());
        let inner = PhysAddr::from_frame(pde1.frame());
        let pte0 = read_entry(inner, 0);
        assert!(pte0.is_present());
        assert!(!pte0.flags().contains(EntryFlags::USER));

        // Re-touching the same page allocates nothing further.
        khal::sim::set_cr2(0x0040_0800);
        PageTable::handle_fault(&trap_frame());
        assert_eq!(setup.process_pool.free_count(), free_before - 2);

        // A neighbouring page reuses the inner table: one data frame.
        khal::sim::set_cr2(0x0040_1000);
        PageTable::handle_fault(&trap_frame());
        assert_eq!(setup.process_pool.free_count(), free_before - 3);
        assert!(read_entry(inner, 1).is_present());

        // Untouched slots of the fresh inner table are not present.
        assert!(!read_entry(inner, 2).is_present());
        assert!(!read_entry(inner, 1023).is_present());
    }

    #[test]
    #[should_panic(expected = "illegitimate page fault")]
    fn fault_outside_every_pool_panics() {
        let _m = machine();
        let _setup = setup(SHARED_4MIB);
        let mut pt = PageTable::new();
        pt.load();

        khal::sim::set_cr2(0x0100_0000);
        PageTable::handle_fault(&trap_frame());
    }

    #[test]
    fn free_page_returns_frame_and_clears_entry() {
        let _m = machine();
        let setup = setup(8 * 1024 * 1024);
        let mut pt = PageTable::new();
        pt.load();

        khal::sim::set_cr2(0x0040_0000);
        PageTable::handle_fault(&trap_frame());
        let free_after_fault = setup.process_pool.free_count();

        let page = 0x0040_0000 / PAGE_SIZE;
        pt.free_page(page);

        // Data frame returned through the registry; PTE cleared but the
        // inner table stays installed.
        assert_eq!(setup.process_pool.free_count(), free_after_fault + 1);
        let dir = pt.directory_phys();
        let pde1 = read_entry(dir, 1);
        assert!(pde1.is_present());
        let pte0 = read_entry(PhysAddr::from_frame(pde1.frame()), 0);
        assert!(!pte0.is_present());

        // Freeing it again is a warning, not an error.
        pt.free_page(page);
        assert_eq!(setup.process_pool.free_count(), free_after_fault + 1);

        // So is freeing a page whose directory slot was never built.
        pt.free_page((16 * 1024 * 1024) / PAGE_SIZE);
        assert_eq!(setup.process_pool.free_count(), free_after_fault + 1);
    }

    #[test]
    fn load_and_enable_paging_program_the_cpu() {
        let _m = machine();
        let _setup = setup(SHARED_4MIB);
        let mut pt = PageTable::new();

        pt.load();
        assert_eq!(khal::cpu::read_cr3(), pt.directory_phys().as_usize());

        assert!(!paging_enabled());
        PageTable::enable_paging();
        assert!(paging_enabled());
        assert_ne!(khal::cpu::read_cr0() & CR0_PAGING, 0);
    }

    #[test]
    fn recursive_window_addresses() {
        assert_eq!(
            PageTable::directory_window_slot(0).as_usize(),
            0xFFFF_F000
        );
        assert_eq!(
            PageTable::directory_window_slot(1023).as_usize(),
            0xFFFF_FFFC
        );
        assert_eq!(
            PageTable::table_window_slot(0, 0).as_usize(),
            0xFFC0_0000
        );
        assert_eq!(
            PageTable::table_window_slot(1, 2).as_usize(),
            0xFFC0_1008
        );
        // The last 4 KiB of the PTE window is the directory window
        // itself, so the highest true PTE word sits at (1022, 1023).
        assert_eq!(
            PageTable::table_window_slot(1022, 1023).as_usize(),
            0xFFFF_EFFC
        );
    }
}
