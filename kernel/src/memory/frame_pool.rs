// =============================================================================
// CoralOS — Contiguous Physical Frame Pool
// =============================================================================
//
// A frame pool owns the frame range [base_frame, base_frame + n_frames)
// and hands out contiguous runs of frames. Tracking single free frames
// is not enough for that: the pool must know where each allocated run
// begins, so a release given nothing but the first frame number can find
// the run's end.
//
// STATE MAP LAYOUT:
//   Two bits per frame, four frames per byte, high bits first:
//   slot k of a byte occupies bits [7-2k, 6-2k].
//
//     0b11  FREE          eligible for allocation
//     0b10  HEAD          first frame of an allocated run
//     0b00  USED          run member that is not the head
//     0b01  INACCESSIBLE  first frame of a hole; never returned by the
//                         search, otherwise behaves like HEAD
//
//   A byte of 0x00 therefore means "all four frames allocated", which the
//   scan uses to skip whole bytes.
//
// BITMAP PLACEMENT:
//   With info_frame == 0 the state map lives in the first frames of the
//   pool itself; those frames are pre-marked HEAD + USED so a regular
//   release cannot reclaim them. Otherwise the caller supplies the frames
//   and the pool only checks they are large enough.
//
// RELEASE DISPATCH:
//   At release time the caller knows a frame number, not the pool it came
//   from. Pools register themselves in a process-wide registry during
//   boot, and the associated function `FramePool::release` looks up the
//   owner by range and delegates.
//
// =============================================================================

use arrayvec::ArrayVec;

use crate::memory::address::{PhysAddr, PAGE_SIZE};
use crate::sync::spinlock::SpinLock;

/// Most pools a single machine configuration declares (kernel pool,
/// process pool, and room for device-reserved ranges).
const MAX_POOLS: usize = 8;

/// Allocation state of one frame, as encoded in the pool's 2-bit map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Free,
    Head,
    Used,
    Inaccessible,
}

impl FrameState {
    const fn bits(self) -> u8 {
        match self {
            FrameState::Free => 0b11,
            FrameState::Head => 0b10,
            FrameState::Inaccessible => 0b01,
            FrameState::Used => 0b00,
        }
    }

    const fn from_bits(bits: u8) -> FrameState {
        match bits & 0b11 {
            0b11 => FrameState::Free,
            0b10 => FrameState::Head,
            0b01 => FrameState::Inaccessible,
            _ => FrameState::Used,
        }
    }
}

// =============================================================================
// Pool registry
// =============================================================================

struct Registry {
    pools: ArrayVec<*mut FramePool, MAX_POOLS>,
}

// SAFETY: the registry only stores pool addresses. They are dereferenced
// from the single cooperative CPU, never concurrently.
unsafe impl Send for Registry {}

static REGISTRY: SpinLock<Registry> = SpinLock::new(Registry {
    pools: ArrayVec::new_const(),
});

#[cfg(test)]
pub(crate) fn reset_registry() {
    REGISTRY.lock().pools.clear();
}

// =============================================================================
// FramePool
// =============================================================================

/// A pool of physically contiguous frames with run-aware allocation.
pub struct FramePool {
    /// First frame owned by this pool.
    base_frame: usize,
    /// Number of frames owned by this pool.
    n_frames: usize,
    /// Frames currently FREE. Invariant: equals the number of FREE slots
    /// in the state map.
    free_count: usize,
    /// The 2-bit state map, reached through the direct map.
    bitmap: *mut u8,
}

// SAFETY: the bitmap pointer is only dereferenced from the single
// cooperative CPU; pool methods take &mut self.
unsafe impl Send for FramePool {}

impl FramePool {
    /// Creates a pool over `[base_frame, base_frame + n_frames)`.
    ///
    /// `info_frame == 0` places the state map in the pool's own first
    /// frames and pre-marks them allocated; otherwise the map lives in
    /// the `n_info_frames` frames starting at `info_frame`.
    ///
    /// # Safety
    ///
    /// The caller must own the frame range (and the info frames, if
    /// external), and the direct map must cover it for as long as the
    /// pool is in use. Exactly one pool may claim any given frame.
    ///
    /// # Panics
    ///
    /// If an external state map is too small for `n_frames`, or an
    /// internal one would consume the whole pool.
    pub unsafe fn new(
        base_frame: usize,
        n_frames: usize,
        info_frame: usize,
        n_info_frames: usize,
    ) -> FramePool {
        assert!(n_frames > 0, "frame pool with no frames");

        let bitmap_frame = if info_frame == 0 { base_frame } else { info_frame };
        let bitmap = PhysAddr::from_frame(bitmap_frame).to_virt().as_mut_ptr::<u8>();

        let mut pool = FramePool {
            base_frame,
            n_frames,
            free_count: n_frames,
            bitmap,
        };

        // Every managed frame starts FREE.
        let bitmap_bytes = (n_frames + 3) / 4;
        core::ptr::write_bytes(bitmap, 0xFF, bitmap_bytes);

        // Slots of the final byte past n_frames do not correspond to
        // owned frames; mark them non-free so the scan never builds a
        // run that crosses the pool end.
        for slot in n_frames..bitmap_bytes * 4 {
            pool.set_state(slot, FrameState::Used);
        }

        if info_frame == 0 {
            // The map occupies the head of the pool. One HEAD plus USED
            // tail keeps release_frames from ever reclaiming it.
            let meta_frames = Self::needed_info_frames(n_frames);
            assert!(
                meta_frames < n_frames,
                "frame pool too small to hold its own state map"
            );
            pool.set_state(0, FrameState::Head);
            for frame in 1..meta_frames {
                pool.set_state(frame, FrameState::Used);
            }
            pool.free_count -= meta_frames;
        } else {
            // 4 frame states per byte.
            assert!(
                n_info_frames * PAGE_SIZE * 4 >= n_frames,
                "info frames hold {} states, pool has {} frames",
                n_info_frames * PAGE_SIZE * 4,
                n_frames
            );
        }

        klog::info!(
            "frame pool [{}..{}) initialized, {} frames free",
            base_frame,
            base_frame + n_frames,
            pool.free_count
        );
        pool
    }

    /// Enters this pool into the process-wide registry so that
    /// [`FramePool::release`] can dispatch raw frame numbers to it.
    ///
    /// # Safety
    ///
    /// The pool must not move or be dropped afterwards; the registry
    /// keeps its address for the lifetime of the kernel.
    ///
    /// # Panics
    ///
    /// If the registry is full.
    pub unsafe fn register(&mut self) {
        let mut registry = REGISTRY.lock();
        assert!(
            registry.pools.try_push(self as *mut FramePool).is_ok(),
            "frame pool registry full"
        );
    }

    /// Number of frames required to hold a state map for `n_frames`
    /// frames at two bits per frame.
    pub const fn needed_info_frames(n_frames: usize) -> usize {
        (n_frames + 4 * PAGE_SIZE - 1) / (4 * PAGE_SIZE)
    }

    /// Frames currently free in this pool.
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Allocates `n` contiguous frames and returns the absolute number
    /// of the first, or `None` if no window of `n` FREE frames exists.
    /// The lowest-numbered fitting window wins. `n == 0` is rejected.
    ///
    /// # Panics
    ///
    /// If the pool has no free frames at all on entry.
    pub fn allocate(&mut self, n: usize) -> Option<usize> {
        assert!(self.free_count > 0, "allocate on an exhausted frame pool");
        if n == 0 {
            return None;
        }

        let mut run = 0usize;
        let mut frame = 0usize;
        let start = loop {
            if frame >= self.n_frames {
                return None;
            }
            // Byte fast path: 0x00 means all four slots allocated. The
            // run cannot continue across the byte, so reset it first.
            if frame % 4 == 0 && unsafe { *self.bitmap.add(frame / 4) } == 0x00 {
                run = 0;
                frame += 4;
                continue;
            }
            if self.state(frame) == FrameState::Free {
                run += 1;
                if run == n {
                    break frame + 1 - n;
                }
            } else {
                run = 0;
            }
            frame += 1;
        };

        self.set_state(start, FrameState::Head);
        for frame in start + 1..start + n {
            self.set_state(frame, FrameState::Used);
        }
        self.free_count -= n;
        Some(self.base_frame + start)
    }

    /// Marks `[base, base + n)` as a hole the allocator must never hand
    /// out. The first frame becomes INACCESSIBLE (so the search skips it
    /// and release rejects it), the rest USED.
    ///
    /// # Panics
    ///
    /// If the range leaves the pool or any frame in it is not FREE.
    pub fn mark_inaccessible(&mut self, base: usize, n: usize) {
        assert!(
            base >= self.base_frame && base + n <= self.base_frame + self.n_frames,
            "inaccessible range [{}, {}) outside pool [{}, {})",
            base,
            base + n,
            self.base_frame,
            self.base_frame + self.n_frames
        );

        let first = base - self.base_frame;
        for frame in first..first + n {
            assert!(
                self.state(frame) == FrameState::Free,
                "frame {} is not free",
                self.base_frame + frame
            );
            let state = if frame == first {
                FrameState::Inaccessible
            } else {
                FrameState::Used
            };
            self.set_state(frame, state);
            self.free_count -= 1;
        }
    }

    /// Releases the run starting at `first_frame`, wherever it lives:
    /// looks up the owning pool in the registry and delegates. A frame
    /// no pool owns is silently ignored.
    pub fn release(first_frame: usize) {
        let owner = {
            let registry = REGISTRY.lock();
            registry.pools.iter().copied().find(|&pool| {
                // SAFETY: registered pools live for the kernel lifetime;
                // only their bounds are read here.
                let pool = unsafe { &*pool };
                first_frame >= pool.base_frame
                    && first_frame < pool.base_frame + pool.n_frames
            })
        };
        if let Some(pool) = owner {
            // SAFETY: single cooperative CPU; no other reference to the
            // pool is live while the release runs. The registry lock is
            // already dropped.
            unsafe { (*pool).release_frames(first_frame) };
        }
    }

    /// Releases the run whose HEAD is `first_frame`: frees the head,
    /// then walks forward freeing USED frames until the next run or a
    /// FREE frame.
    ///
    /// # Panics
    ///
    /// If `first_frame` is outside the pool or is not a HEAD frame.
    pub fn release_frames(&mut self, first_frame: usize) {
        assert!(
            first_frame >= self.base_frame && first_frame < self.base_frame + self.n_frames,
            "frame {} outside pool [{}, {})",
            first_frame,
            self.base_frame,
            self.base_frame + self.n_frames
        );

        let head = first_frame - self.base_frame;
        assert!(
            self.state(head) == FrameState::Head,
            "released frame {} is not the head of an allocation",
            first_frame
        );

        self.set_state(head, FrameState::Free);
        self.free_count += 1;
        for frame in head + 1..self.n_frames {
            if self.state(frame) != FrameState::Used {
                break;
            }
            self.set_state(frame, FrameState::Free);
            self.free_count += 1;
        }
    }

    // =========================================================================
    // State map access
    // =========================================================================

    fn state(&self, frame: usize) -> FrameState {
        let shift = 6 - 2 * (frame % 4);
        // SAFETY: constructor sized the map for every frame index used
        // by pool methods.
        let byte = unsafe { *self.bitmap.add(frame / 4) };
        FrameState::from_bits(byte >> shift)
    }

    fn set_state(&mut self, frame: usize, state: FrameState) {
        let shift = 6 - 2 * (frame % 4);
        // SAFETY: as in `state`.
        unsafe {
            let byte = &mut *self.bitmap.add(frame / 4);
            *byte = (*byte & !(0b11 << shift)) | (state.bits() << shift);
        }
    }

    /// State of an absolute frame number, for diagnostics and tests.
    pub fn frame_state(&self, frame: usize) -> FrameState {
        assert!(frame >= self.base_frame && frame < self.base_frame + self.n_frames);
        self.state(frame - self.base_frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{machine, Arena};

    const BASE: usize = 512;
    const FRAMES: usize = 1024;

    fn pool(arena_frames: usize) -> (Arena, FramePool) {
        let arena = Arena::new(BASE, arena_frames);
        let pool = unsafe { FramePool::new(BASE, FRAMES, 0, 0) };
        (arena, pool)
    }

    #[test]
    fn bitmap_geometry() {
        let _m = machine();
        let (_arena, pool) = pool(FRAMES);

        // 1024 frames need 256 map bytes, which fit in one frame: the
        // pool loses exactly its first frame to the map.
        assert_eq!(FramePool::needed_info_frames(FRAMES), 1);
        assert_eq!(pool.free_count(), FRAMES - 1);
        assert_eq!(pool.frame_state(BASE), FrameState::Head);
        for frame in BASE + 1..BASE + FRAMES {
            assert_eq!(pool.frame_state(frame), FrameState::Free);
        }
    }

    #[test]
    fn allocation_marks_head_and_members() {
        let _m = machine();
        let (_arena, mut pool) = pool(FRAMES);

        let run = pool.allocate(13).unwrap();
        assert_eq!(run, BASE + 1);
        assert_eq!(pool.frame_state(run), FrameState::Head);
        for frame in run + 1..run + 13 {
            assert_eq!(pool.frame_state(frame), FrameState::Used);
        }
        assert_eq!(pool.frame_state(run + 13), FrameState::Free);
        assert_eq!(pool.free_count(), FRAMES - 1 - 13);
    }

    #[test]
    fn contiguous_reuse_after_release() {
        let _m = machine();
        let arena = Arena::new(BASE, FRAMES);
        let mut pool = unsafe { FramePool::new(BASE, FRAMES, 0, 0) };
        unsafe { pool.register() };

        let a = pool.allocate(13).unwrap();
        let b = pool.allocate(10).unwrap();
        assert_eq!(a, BASE + 1);
        assert_eq!(b, BASE + 14);

        // 1000 free frames remain, in one run behind b: exactly 1000
        // still fit, one more cannot.
        assert_eq!(pool.allocate(1001), None);

        FramePool::release(a);
        FramePool::release(b);
        assert_eq!(pool.free_count(), FRAMES - 1);

        // After both releases the low window is whole again and the
        // lowest fitting start wins.
        assert_eq!(pool.allocate(1001), Some(BASE + 1));
        drop(arena);
    }

    #[test]
    fn checkerboard() {
        let _m = machine();
        let (_arena, mut pool) = pool(FRAMES);

        let usable = FRAMES - 1;
        let mut frames = Vec::with_capacity(usable);
        for _ in 0..usable {
            frames.push(pool.allocate(1).unwrap());
        }
        assert_eq!(pool.free_count(), 0);

        for (i, &frame) in frames.iter().enumerate() {
            if i % 2 == 0 {
                pool.release_frames(frame);
            }
        }
        for (i, &frame) in frames.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(pool.allocate(1), Some(frame));
            }
        }
        for &frame in &frames {
            pool.release_frames(frame);
        }

        assert_eq!(pool.free_count(), usable);
        for frame in BASE + 1..BASE + FRAMES {
            assert_eq!(pool.frame_state(frame), FrameState::Free);
        }
    }

    #[test]
    fn allocate_then_release_restores_pool() {
        let _m = machine();
        let (_arena, mut pool) = pool(FRAMES);

        let free_before = pool.free_count();
        let states_before: Vec<_> =
            (BASE..BASE + FRAMES).map(|f| pool.frame_state(f)).collect();

        let run = pool.allocate(5).unwrap();
        pool.release_frames(run);

        assert_eq!(pool.free_count(), free_before);
        let states_after: Vec<_> =
            (BASE..BASE + FRAMES).map(|f| pool.frame_state(f)).collect();
        assert_eq!(states_before, states_after);
    }

    #[test]
    fn inaccessible_hole_is_never_allocated() {
        let _m = machine();
        let (_arena, mut pool) = pool(FRAMES);

        pool.mark_inaccessible(BASE + 100, 16);
        assert_eq!(pool.free_count(), FRAMES - 1 - 16);
        assert_eq!(pool.frame_state(BASE + 100), FrameState::Inaccessible);

        // Drain the pool one run at a time; no run may intersect the hole.
        while let Some(run) = pool.allocate(8) {
            assert!(run + 8 <= BASE + 100 || run >= BASE + 116);
        }
    }

    #[test]
    fn run_never_crosses_pool_end() {
        let _m = machine();
        let arena = Arena::new(BASE, 8);
        let mut pool = unsafe { FramePool::new(BASE, 8, 0, 0) };

        // 7 usable frames: a request for all 8 cannot fit.
        assert_eq!(pool.allocate(8), None);
        assert_eq!(pool.allocate(7), Some(BASE + 1));
        drop(arena);
    }

    #[test]
    fn zero_frames_rejected() {
        let _m = machine();
        let (_arena, mut pool) = pool(FRAMES);
        assert_eq!(pool.allocate(0), None);
    }

    #[test]
    fn external_state_map_leaves_pool_intact() {
        let _m = machine();
        // One arena covering the info frame (512) and the pool (513..).
        let _arena = Arena::new(BASE, 1 + 64);
        let mut pool = unsafe { FramePool::new(BASE + 1, 64, BASE, 1) };

        assert_eq!(pool.free_count(), 64);
        // Nothing is pre-marked: the very first frame is allocatable.
        assert_eq!(pool.allocate(1), Some(BASE + 1));
    }

    #[test]
    #[should_panic(expected = "info frames hold")]
    fn undersized_external_map_is_rejected() {
        let _m = machine();
        let _arena = Arena::new(BASE, 2);
        // One info frame tracks at most 4 * PAGE_SIZE frames.
        unsafe { FramePool::new(BASE + 1, 4 * PAGE_SIZE + 1, BASE, 1) };
    }

    #[test]
    #[should_panic(expected = "not the head")]
    fn releasing_non_head_panics() {
        let _m = machine();
        let (_arena, mut pool) = pool(FRAMES);
        let run = pool.allocate(4).unwrap();
        pool.release_frames(run + 1);
    }

    #[test]
    #[should_panic(expected = "is not free")]
    fn marking_allocated_frames_inaccessible_panics() {
        let _m = machine();
        let (_arena, mut pool) = pool(FRAMES);
        let run = pool.allocate(4).unwrap();
        pool.mark_inaccessible(run, 2);
    }

    #[test]
    fn release_of_unowned_frame_is_ignored() {
        let _m = machine();
        let arena = Arena::new(BASE, FRAMES);
        let mut pool = unsafe { FramePool::new(BASE, FRAMES, 0, 0) };
        unsafe { pool.register() };

        // Far outside every registered pool: dispatcher does nothing.
        FramePool::release(1_000_000);
        assert_eq!(pool.free_count(), FRAMES - 1);
        drop(arena);
    }

    #[test]
    fn needed_info_frames_laws() {
        let per_frame = 4 * PAGE_SIZE;
        for k in 0..4 {
            assert_eq!(FramePool::needed_info_frames(per_frame * k), k);
            assert_eq!(FramePool::needed_info_frames(per_frame * k + 1), k + 1);
        }
    }
}
