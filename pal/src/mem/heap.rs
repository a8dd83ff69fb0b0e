//! The enclave heap allocator.
//!
//! The heap is the contiguous `[heap_bottom, heap_top)` slice of ELRANGE.
//! Used ranges are VMAs in a descending list; allocation without a fixed
//! address takes the highest gap that fits, merging into any neighbor of
//! the same tag, and freeing splits or removes the overlapped VMAs. All
//! mutation happens under one spin lock, which is also held across EDMM
//! round-trips so driver calls stay serialized per enclave.

use core::sync::atomic::{AtomicUsize, Ordering};

use config::mm::{self, MAX_HEAP_VMAS, PAGE_SIZE};
use mutex::SpinLock;
use paltype::{PalError, PalResult};

use super::edmm::{self, EdmmBackend, HeapRangeList};
use super::vma::{SlotIndex, Vma, VmaArena};

struct HeapState {
    vmas: VmaArena,
    pal_internal_mem_used: usize,
}

pub struct EnclaveHeap<E: EdmmBackend> {
    heap_bottom: usize,
    heap_top: usize,
    /// Budget for PAL-internal allocations; they share the heap with the
    /// application and must not starve it.
    pal_internal_mem_size: usize,
    edmm: Option<E>,
    allocated_pages: AtomicUsize,
    state: SpinLock<HeapState>,
}

impl<E: EdmmBackend> EnclaveHeap<E> {
    /// Sets up an allocator over `[heap_bottom, heap_top)`.
    ///
    /// Both bounds must be granule-aligned. With `edmm` present, every
    /// allocated page is accepted from the host driver and every freed page
    /// trimmed back to it.
    pub fn new(
        heap_bottom: usize,
        heap_top: usize,
        pal_internal_mem_size: usize,
        edmm: Option<E>,
    ) -> PalResult<Self> {
        Self::with_pool_capacity(heap_bottom, heap_top, pal_internal_mem_size, edmm, MAX_HEAP_VMAS)
    }

    pub(super) fn with_pool_capacity(
        heap_bottom: usize,
        heap_top: usize,
        pal_internal_mem_size: usize,
        edmm: Option<E>,
        pool_capacity: usize,
    ) -> PalResult<Self> {
        if heap_bottom >= heap_top
            || !mm::is_page_aligned(heap_bottom)
            || !mm::is_page_aligned(heap_top)
        {
            return Err(PalError::Inval);
        }
        Ok(Self {
            heap_bottom,
            heap_top,
            pal_internal_mem_size,
            edmm,
            allocated_pages: AtomicUsize::new(0),
            state: SpinLock::new(HeapState {
                vmas: VmaArena::new(pool_capacity),
                pal_internal_mem_used: 0,
            }),
        })
    }

    /// Total pages currently covered by VMAs.
    pub fn allocated_pages(&self) -> usize {
        self.allocated_pages.load(Ordering::SeqCst)
    }

    /// Allocates `size` bytes at `addr`, or anywhere if `addr` is zero.
    ///
    /// The request is widened to granule boundaries. Without a fixed
    /// address the heap is scanned from the top down and the first gap that
    /// fits is taken, so successive allocations stack downward from
    /// `heap_top`. Returns the effective address.
    ///
    /// # Errors
    /// [`PalError::Inval`] for an empty or out-of-range request or one that
    /// would mix PAL-internal and application areas;
    /// [`PalError::NoMem`] when the VMA pool, the heap, or the internal
    /// budget is exhausted.
    pub fn allocate(&self, addr: usize, size: usize, is_pal_internal: bool) -> PalResult<usize> {
        if size == 0 {
            return Err(PalError::Inval);
        }
        let size = mm::page_align_up(size);
        let addr = mm::page_align_down(addr);

        let mut gaps = HeapRangeList::new();
        let mut st = self.state.lock();

        if is_pal_internal && size > self.pal_internal_mem_size - st.pal_internal_mem_used {
            // The allocation would exceed the PAL-internal limit.
            return Err(PalError::NoMem);
        }

        let chosen = if addr != 0 {
            if addr < self.heap_bottom || addr + size > self.heap_top {
                return Err(PalError::Inval);
            }
            // Find the VMA right above `addr`.
            let mut vma_above = None;
            for (idx, vma) in st.vmas.iter() {
                if vma.bottom < addr {
                    break;
                }
                vma_above = Some(idx);
            }
            self.create_vma_and_merge(&mut st, addr, size, is_pal_internal, vma_above, &mut gaps)?
        } else {
            self.allocate_descending(&mut st, size, is_pal_internal, &mut gaps)?
        };

        if gaps.dropped() > 0 {
            log::warn!(
                "[allocate] {} EDMM gap(s) beyond the {}-entry scratch list were not recorded",
                gaps.dropped(),
                mm::EDMM_HEAP_RANGE_CNT
            );
        }

        // Only the sub-ranges no existing VMA covered need an accept;
        // re-accepting an already backed page would fault.
        if let Some(backend) = &self.edmm {
            for range in gaps.iter() {
                edmm::get_edmm_page_range(backend, range.addr, range.size, true)?;
            }
        }

        Ok(chosen)
    }

    /// Picks the highest-address gap that fits `size` and creates the VMA
    /// there.
    fn allocate_descending(
        &self,
        st: &mut HeapState,
        size: usize,
        is_pal_internal: bool,
        gaps: &mut HeapRangeList,
    ) -> PalResult<usize> {
        let mut vma_above: Option<SlotIndex> = None;
        let mut above_bottom = self.heap_top;

        let mut cur = st.vmas.head();
        while let Some(idx) = cur {
            let vma = st.vmas.get(idx);
            if let Some(candidate) = above_bottom.checked_sub(size)
                && vma.top <= candidate
            {
                return self.create_vma_and_merge(
                    st,
                    candidate,
                    size,
                    is_pal_internal,
                    vma_above,
                    gaps,
                );
            }
            vma_above = Some(idx);
            above_bottom = vma.bottom;
            cur = st.vmas.below(idx);
        }

        // There may still be enough space between the heap bottom and the
        // lowest VMA.
        if let Some(candidate) = above_bottom.checked_sub(size)
            && self.heap_bottom <= candidate
        {
            return self.create_vma_and_merge(st, candidate, size, is_pal_internal, vma_above, gaps);
        }

        Err(PalError::NoMem)
    }

    /// Creates the VMA `[addr, addr + size)` and merges every adjacent or
    /// overlapping same-tag neighbor into it, like `mmap(MAP_FIXED)` over
    /// existing mappings. `vma_above` is the VMA right above `addr` (the
    /// insertion point). Records the sub-ranges no previous VMA covered
    /// into `gaps`.
    fn create_vma_and_merge(
        &self,
        st: &mut HeapState,
        addr: usize,
        size: usize,
        is_pal_internal: bool,
        vma_above: Option<SlotIndex>,
        gaps: &mut HeapRangeList,
    ) -> PalResult<usize> {
        debug_assert!(size > 0);
        if addr < self.heap_bottom {
            return Err(PalError::Inval);
        }

        let vma_below = match vma_above {
            Some(above) => st.vmas.below(above),
            // No VMA above `addr`: the VMA right below it must be the
            // highest in the list.
            None => st.vmas.head(),
        };

        // The two tag classes must never interleave: reject the request if
        // it touches any area of the other tag.
        let mut check = vma_above;
        while let Some(idx) = check {
            let vma = st.vmas.get(idx);
            if addr + size <= vma.bottom {
                break;
            }
            if vma.is_pal_internal != is_pal_internal {
                return Err(PalError::Inval);
            }
            check = st.vmas.above(idx);
        }
        let mut check = vma_below;
        while let Some(idx) = check {
            let vma = st.vmas.get(idx);
            if addr >= vma.top {
                break;
            }
            if vma.is_pal_internal != is_pal_internal {
                return Err(PalError::Inval);
            }
            check = st.vmas.below(idx);
        }

        if self.edmm.is_some() {
            Self::record_uncovered_gaps(st, addr, size, vma_above, vma_below, gaps);
        }

        // Grab the slot before touching the list so that pool exhaustion
        // leaves the VMA set unchanged.
        let new_idx = st
            .vmas
            .alloc_unlinked(Vma {
                bottom: addr,
                top: addr + size,
                is_pal_internal,
            })
            .ok_or(PalError::NoMem)?;
        let mut merged = st.vmas.get(new_idx);

        // How much memory the request overlapped with existing VMAs.
        let mut freed = 0;

        let mut above = vma_above;
        while let Some(idx) = above {
            let vma = st.vmas.get(idx);
            if vma.bottom > merged.top || vma.is_pal_internal != merged.is_pal_internal {
                break;
            }
            // The new VMA grows into the above VMA; swallow it.
            freed += vma.len();
            merged.bottom = merged.bottom.min(vma.bottom);
            merged.top = merged.top.max(vma.top);
            let next = st.vmas.above(idx);
            st.vmas.remove(idx);
            above = next;
        }

        let mut below = vma_below;
        while let Some(idx) = below {
            let vma = st.vmas.get(idx);
            if vma.top < merged.bottom || vma.is_pal_internal != merged.is_pal_internal {
                break;
            }
            freed += vma.len();
            merged.bottom = merged.bottom.min(vma.bottom);
            merged.top = merged.top.max(vma.top);
            let next = st.vmas.below(idx);
            st.vmas.remove(idx);
            below = next;
        }

        st.vmas.set_bottom(new_idx, merged.bottom);
        st.vmas.set_top(new_idx, merged.top);
        st.vmas.link_below(above, new_idx);

        if merged.bottom >= merged.top {
            log::error!(
                "[create_vma_and_merge] bad memory bookkeeping: {:#x} - {:#x}",
                merged.bottom,
                merged.top
            );
            crate::host::syscall::exit_group(1);
        }

        debug_assert!(merged.len() >= freed);
        let allocated = merged.len() - freed;
        self.allocated_pages
            .fetch_add(allocated / PAGE_SIZE, Ordering::SeqCst);

        if is_pal_internal {
            debug_assert!(
                allocated <= self.pal_internal_mem_size - st.pal_internal_mem_used
            );
            st.pal_internal_mem_used += allocated;
        }

        Ok(addr)
    }

    /// Walks the VMAs overlapping `[addr, addr + size)` from the top down
    /// and records the complement of their union: the sub-ranges that still
    /// need an EDMM accept.
    fn record_uncovered_gaps(
        st: &HeapState,
        addr: usize,
        size: usize,
        vma_above: Option<SlotIndex>,
        vma_below: Option<SlotIndex>,
        gaps: &mut HeapRangeList,
    ) {
        // The overlapping VMAs are contiguous in the list; find the topmost
        // one by walking up from the insertion point.
        let mut topmost = None;
        let mut cur = vma_above;
        while let Some(idx) = cur {
            let vma = st.vmas.get(idx);
            if vma.bottom >= addr + size {
                break;
            }
            if vma.top > addr {
                topmost = Some(idx);
            }
            cur = st.vmas.above(idx);
        }
        if topmost.is_none() {
            topmost = vma_below;
        }

        let mut cursor = addr + size;
        let mut cur = topmost;
        while let Some(idx) = cur {
            let vma = st.vmas.get(idx);
            if vma.top <= addr {
                break;
            }
            let covered_top = vma.top.min(addr + size);
            let covered_bottom = vma.bottom.max(addr);
            if covered_top < cursor {
                gaps.push(covered_top, cursor - covered_top);
            }
            cursor = covered_bottom;
            cur = st.vmas.below(idx);
        }
        if cursor > addr {
            gaps.push(addr, cursor - addr);
        }
    }

    /// Frees `[addr, addr + size)`. The range may cover any mix of used
    /// and unused memory, but every used part must carry the same tag.
    ///
    /// # Errors
    /// [`PalError::NoMem`] for an empty request; [`PalError::Inval`] for a
    /// misaligned or out-of-range one, or one overlapping both normal and
    /// PAL-internal areas.
    pub fn free(&self, addr: usize, size: usize) -> PalResult<()> {
        if size == 0 {
            return Err(PalError::NoMem);
        }
        let size = mm::page_align_up(size);

        if !mm::is_page_aligned(addr) || addr < self.heap_bottom || addr + size > self.heap_top {
            return Err(PalError::Inval);
        }

        let mut st = self.state.lock();

        // It is impossible to free an area overlapping with VMAs of both
        // tags at the same time.
        let mut is_pal_internal = None;

        // How much memory is actually freed, since the range can cover
        // unused gaps.
        let mut freed = 0;
        let mut trim_ranges = HeapRangeList::new();

        let mut cur = st.vmas.head();
        while let Some(idx) = cur {
            let next = st.vmas.below(idx);
            let vma = st.vmas.get(idx);

            if vma.bottom >= addr + size {
                cur = next;
                continue;
            }
            if vma.top <= addr {
                break;
            }

            match is_pal_internal {
                None => is_pal_internal = Some(vma.is_pal_internal),
                Some(tag) if tag != vma.is_pal_internal => {
                    log::error!(
                        "[free] area (address {:#x}, size {:#x}) overlaps both normal and \
                         pal-internal VMAs",
                        addr,
                        size
                    );
                    return Err(PalError::Inval);
                }
                Some(_) => {}
            }

            let covered_bottom = vma.bottom.max(addr);
            let covered_top = vma.top.min(addr + size);
            freed += covered_top - covered_bottom;
            if self.edmm.is_some() {
                trim_ranges.push_coalesced(covered_bottom, covered_top - covered_bottom);
            }

            if vma.bottom < addr {
                // Split off the residual `[vma.bottom, addr)`; the part
                // above `addr + size`, if any, stays in the current slot.
                st.vmas
                    .insert_below(
                        Some(idx),
                        Vma {
                            bottom: vma.bottom,
                            top: addr,
                            is_pal_internal: vma.is_pal_internal,
                        },
                    )
                    .ok_or_else(|| {
                        log::error!("[free] cannot split VMA while freeing {:#x}", addr);
                        PalError::NoMem
                    })?;
            }

            // Compress the overlapped VMA to `[addr + size, vma.top)`.
            st.vmas.set_bottom(idx, addr + size);
            if vma.top <= addr + size {
                // The freed area covers the rest of the VMA.
                st.vmas.remove(idx);
            }

            cur = next;
        }

        self.allocated_pages
            .fetch_sub(freed / PAGE_SIZE, Ordering::SeqCst);

        if is_pal_internal == Some(true) {
            debug_assert!(st.pal_internal_mem_used >= freed);
            st.pal_internal_mem_used -= freed;
        }

        if trim_ranges.dropped() > 0 {
            log::warn!(
                "[free] {} trim range(s) beyond the {}-entry scratch list were not recorded",
                trim_ranges.dropped(),
                mm::EDMM_HEAP_RANGE_CNT
            );
        }

        if let Some(backend) = &self.edmm {
            for range in trim_ranges.iter() {
                edmm::free_edmm_page_range(backend, range.addr, range.size)?;
            }
        }

        Ok(())
    }

    /// The current highest address not covered by any VMA; the loader uses
    /// it to place reserved regions.
    pub fn heap_top(&self) -> usize {
        let st = self.state.lock();
        let mut addr = self.heap_top;
        for (_, vma) in st.vmas.iter() {
            if vma.top < addr {
                break;
            }
            addr = vma.bottom;
        }
        addr
    }

    /// Snapshot of the VMA set for assertions; the lock is released before
    /// returning, so this is only meaningful at quiescent points.
    #[cfg(test)]
    pub(super) fn vma_snapshot(&self) -> alloc::vec::Vec<Vma> {
        self.state.lock().vmas.iter().map(|(_, vma)| vma).collect()
    }

    #[cfg(test)]
    pub(super) fn edmm_backend(&self) -> Option<&E> {
        self.edmm.as_ref()
    }
}
