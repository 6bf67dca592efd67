// =============================================================================
// CoralOS — Memory Subsystem
// =============================================================================
//
// The memory subsystem owns all physical and virtual memory:
//
//   address.rs    — PhysAddr/VirtAddr newtypes, frame arithmetic, the
//                   direct-map offset
//   frame_pool.rs — contiguous frame pools over a 2-bit state bitmap,
//                   plus the process-wide pool registry
//   page_table.rs — two-level page tables, the page-fault handler, the
//                   recursive self-map
//   vm_pool.rs    — reserved virtual-address regions per address space
//
// Data flow: a VM pool reserves a range; a touch into that range faults;
// the fault handler asks the process frame pool for a frame and installs
// a page-table entry pointing at it. On release the VM pool tears the
// mappings down page by page and the frames go back to their pool.
// =============================================================================

pub mod address;
pub mod frame_pool;
pub mod page_table;
pub mod vm_pool;
