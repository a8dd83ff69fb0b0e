//! Enclave heap management.
//!
//! [`init_enclave_pages`] establishes the process-wide heap over the
//! ELRANGE slice the loader measured; afterwards the LibOS drives the
//! [`get_enclave_pages`] / [`free_enclave_pages`] pair for every memory
//! mapping it emulates. Internal runtime allocations pass
//! `is_pal_internal` and stay within their own budget, stacked at the top
//! of the heap thanks to the descending placement.

use paltype::{PalError, PalResult};
use spin::Once;

pub mod edmm;
pub mod heap;
pub mod vma;

pub use edmm::{EdmmBackend, SecinfoFlags, Sgx2Backend};
pub use heap::EnclaveHeap;
pub use vma::Vma;

static ENCLAVE_HEAP: Once<EnclaveHeap<Sgx2Backend>> = Once::new();

/// Sets up the global enclave heap over `[heap_bottom, heap_top)`.
///
/// Must be called once before any allocation; later calls are ignored.
pub fn init_enclave_pages(
    heap_bottom: usize,
    heap_top: usize,
    pal_internal_mem_size: usize,
    edmm: Option<Sgx2Backend>,
) -> PalResult<()> {
    let heap = EnclaveHeap::new(heap_bottom, heap_top, pal_internal_mem_size, edmm)?;
    ENCLAVE_HEAP.call_once(|| heap);
    log::info!(
        "[init_enclave_pages] enclave heap initialized: {:#x} - {:#x}",
        heap_bottom,
        heap_top
    );
    Ok(())
}

fn heap() -> PalResult<&'static EnclaveHeap<Sgx2Backend>> {
    ENCLAVE_HEAP.get().ok_or(PalError::Inconsist)
}

/// Allocates `size` bytes of enclave heap at `addr` (anywhere when zero);
/// returns the effective address. See [`EnclaveHeap::allocate`].
pub fn get_enclave_pages(addr: usize, size: usize, is_pal_internal: bool) -> PalResult<usize> {
    heap()?.allocate(addr, size, is_pal_internal)
}

/// Returns `[addr, addr + size)` to the enclave heap. See
/// [`EnclaveHeap::free`].
pub fn free_enclave_pages(addr: usize, size: usize) -> PalResult<()> {
    heap()?.free(addr, size)
}

/// Returns the current highest available address on the enclave heap.
pub fn get_enclave_heap_top() -> PalResult<usize> {
    Ok(heap()?.heap_top())
}

/// Pages currently allocated, for the LibOS memory-info emulation.
pub fn allocated_pages() -> usize {
    ENCLAVE_HEAP.get().map_or(0, EnclaveHeap::allocated_pages)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use config::mm::PAGE_SIZE;
    use paltype::PalError;

    use super::edmm::{EdmmBackend, SecinfoFlags};
    use super::heap::EnclaveHeap;
    use super::vma::Vma;

    const HEAP_BOTTOM: usize = 0x1000_0000;
    const HEAP_TOP: usize = 0x2000_0000;
    const INTERNAL_SIZE: usize = 0x10_0000;

    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    enum DriverOp {
        Accept(SecinfoFlags, usize),
        Modpe(usize),
        Trim(usize, usize),
        Notify(usize, usize),
    }

    /// Records every EDMM round-trip instead of touching hardware.
    #[derive(Default)]
    struct MockEdmm {
        ops: Mutex<Vec<DriverOp>>,
    }

    impl MockEdmm {
        fn take_ops(&self) -> Vec<DriverOp> {
            core::mem::take(&mut *self.ops.lock().unwrap())
        }
    }

    impl EdmmBackend for MockEdmm {
        fn accept(&self, flags: SecinfoFlags, addr: usize) -> paltype::PalResult<()> {
            self.ops.lock().unwrap().push(DriverOp::Accept(flags, addr));
            Ok(())
        }

        fn extend_permissions(&self, _flags: SecinfoFlags, addr: usize) {
            self.ops.lock().unwrap().push(DriverOp::Modpe(addr));
        }

        fn trim_epc_pages(&self, addr: usize, count: usize) -> paltype::PalResult<()> {
            self.ops.lock().unwrap().push(DriverOp::Trim(addr, count));
            Ok(())
        }

        fn notify_accept(&self, addr: usize, count: usize) -> paltype::PalResult<()> {
            self.ops.lock().unwrap().push(DriverOp::Notify(addr, count));
            Ok(())
        }
    }

    fn plain_heap() -> EnclaveHeap<MockEdmm> {
        EnclaveHeap::new(HEAP_BOTTOM, HEAP_TOP, INTERNAL_SIZE, None).unwrap()
    }

    fn edmm_heap() -> EnclaveHeap<MockEdmm> {
        EnclaveHeap::new(HEAP_BOTTOM, HEAP_TOP, INTERNAL_SIZE, Some(MockEdmm::default())).unwrap()
    }

    /// The list is sorted by descending bottom, free of overlaps, and no
    /// two adjacent same-tag VMAs are left unmerged.
    fn assert_well_formed(vmas: &[Vma]) {
        for window in vmas.windows(2) {
            let (higher, lower) = (window[0], window[1]);
            assert!(higher.bottom > lower.bottom, "not descending: {:x?}", vmas);
            assert!(higher.bottom >= lower.top, "overlap: {:x?}", vmas);
            if higher.bottom == lower.top {
                assert_ne!(
                    higher.is_pal_internal, lower.is_pal_internal,
                    "unmerged same-tag neighbors: {:x?}",
                    vmas
                );
            }
        }
        for vma in vmas {
            assert!(vma.bottom < vma.top);
        }
    }

    #[test]
    fn descending_placement_and_merge() {
        let heap = plain_heap();

        let first = heap.allocate(0, 0x1000, false).unwrap();
        assert_eq!(first, HEAP_TOP - 0x1000);

        let second = heap.allocate(0, 0x2000, false).unwrap();
        assert_eq!(second, HEAP_TOP - 0x3000);

        let vmas = heap.vma_snapshot();
        assert_eq!(
            vmas,
            [Vma {
                bottom: HEAP_TOP - 0x3000,
                top: HEAP_TOP,
                is_pal_internal: false,
            }]
        );
        assert_eq!(heap.allocated_pages(), 3);
    }

    #[test]
    fn fixed_address_allocation() {
        let heap = plain_heap();
        let addr = heap.allocate(HEAP_BOTTOM + 0x4000, 0x2000, false).unwrap();
        assert_eq!(addr, HEAP_BOTTOM + 0x4000);

        // Unaligned requests widen to the surrounding granules.
        let addr = heap
            .allocate(HEAP_BOTTOM + 0x1800, 0x900, false)
            .unwrap();
        assert_eq!(addr, HEAP_BOTTOM + 0x1000);
        let vmas = heap.vma_snapshot();
        assert_well_formed(&vmas);
        assert_eq!(vmas.len(), 2);
        // Widening rounds `addr` down and `size` up independently.
        assert_eq!(vmas[1].top - vmas[1].bottom, 0x1000);
    }

    #[test]
    fn out_of_range_requests_fail() {
        let heap = plain_heap();
        assert_eq!(heap.allocate(HEAP_TOP - 0x1000, 0x2000, false), Err(PalError::Inval));
        assert_eq!(heap.allocate(HEAP_BOTTOM - 0x1000, 0x1000, false), Err(PalError::Inval));
        assert_eq!(heap.allocate(0, 0, false), Err(PalError::Inval));
        assert_eq!(heap.free(HEAP_TOP, 0x1000), Err(PalError::Inval));
        assert_eq!(heap.free(HEAP_BOTTOM + 0x123, 0x1000), Err(PalError::Inval));
        assert_eq!(heap.free(HEAP_BOTTOM, 0), Err(PalError::NoMem));
        assert!(heap.vma_snapshot().is_empty());
    }

    #[test]
    fn mixed_tag_overlap_is_rejected() {
        let heap = plain_heap();
        let internal = heap.allocate(0, 0x1000, true).unwrap();

        let err = heap.allocate(internal, 0x1000, false);
        assert_eq!(err, Err(PalError::Inval));

        // The failed call left the single internal VMA untouched.
        let vmas = heap.vma_snapshot();
        assert_eq!(
            vmas,
            [Vma {
                bottom: internal,
                top: internal + 0x1000,
                is_pal_internal: true,
            }]
        );

        // Freeing across both tags is rejected as well.
        heap.allocate(internal - 0x1000, 0x1000, false).unwrap();
        assert_eq!(heap.free(internal - 0x1000, 0x2000), Err(PalError::Inval));
    }

    #[test]
    fn adjacent_mixed_tags_do_not_merge() {
        let heap = plain_heap();
        let internal = heap.allocate(0, 0x1000, true).unwrap();
        let normal = heap.allocate(0, 0x1000, false).unwrap();
        assert_eq!(normal, internal - 0x1000);

        let vmas = heap.vma_snapshot();
        assert_eq!(vmas.len(), 2);
        assert_well_formed(&vmas);
    }

    #[test]
    fn fragmented_free_splits_vma() {
        let heap = plain_heap();
        let addr = heap.allocate(0, 0x4000, false).unwrap();
        let pages_before = heap.allocated_pages();

        heap.free(addr + 0x1000, 0x2000).unwrap();

        let vmas = heap.vma_snapshot();
        assert_eq!(
            vmas,
            [
                Vma {
                    bottom: addr + 0x3000,
                    top: addr + 0x4000,
                    is_pal_internal: false,
                },
                Vma {
                    bottom: addr,
                    top: addr + 0x1000,
                    is_pal_internal: false,
                },
            ]
        );
        assert_eq!(heap.allocated_pages(), pages_before - 2);
    }

    #[test]
    fn allocate_free_restores_counters() {
        let heap = plain_heap();
        let addr = heap.allocate(0, 0x5000, false).unwrap();
        assert_eq!(heap.allocated_pages(), 5);

        heap.free(addr, 0x5000).unwrap();
        assert_eq!(heap.allocated_pages(), 0);
        assert!(heap.vma_snapshot().is_empty());

        // Freeing an already-free region changes nothing.
        heap.free(addr, 0x5000).unwrap();
        assert_eq!(heap.allocated_pages(), 0);
    }

    #[test]
    fn free_spanning_gap_frees_both_sides() {
        let heap = plain_heap();
        let high = heap.allocate(HEAP_BOTTOM + 0x3000, 0x1000, false).unwrap();
        let low = heap.allocate(HEAP_BOTTOM + 0x1000, 0x1000, false).unwrap();

        heap.free(low, 0x3000).unwrap();
        assert!(heap.vma_snapshot().is_empty());
        assert_eq!(heap.allocated_pages(), 0);
        let _ = high;
    }

    #[test]
    fn exact_fit_gap_is_taken_and_merges() {
        let heap = plain_heap();
        // Two fixed areas leaving exactly 0x2000 free between them.
        heap.allocate(HEAP_TOP - 0x1000, 0x1000, false).unwrap();
        heap.allocate(HEAP_TOP - 0x4000, 0x1000, false).unwrap();

        // The free-choice scan must take the hole even though it has no
        // slack, and the new area merges with both neighbors it touches.
        let addr = heap.allocate(0, 0x2000, false).unwrap();
        assert_eq!(addr, HEAP_TOP - 0x3000);
        assert_eq!(
            heap.vma_snapshot(),
            [Vma {
                bottom: HEAP_TOP - 0x4000,
                top: HEAP_TOP,
                is_pal_internal: false,
            }]
        );
        assert_eq!(heap.allocated_pages(), 4);
    }

    #[test]
    fn top_granule_boundary() {
        let heap = plain_heap();
        let top_page = heap.allocate(HEAP_TOP - PAGE_SIZE, PAGE_SIZE, false).unwrap();
        assert_eq!(top_page, HEAP_TOP - PAGE_SIZE);

        // Occupied now; the next descending allocation lands below.
        let next = heap.allocate(0, PAGE_SIZE, false).unwrap();
        assert_eq!(next, HEAP_TOP - 2 * PAGE_SIZE);
    }

    #[test]
    fn internal_budget_is_enforced() {
        let heap = plain_heap();
        assert_eq!(
            heap.allocate(0, INTERNAL_SIZE + PAGE_SIZE, true),
            Err(PalError::NoMem)
        );

        heap.allocate(0, INTERNAL_SIZE, true).unwrap();
        assert_eq!(heap.allocate(0, PAGE_SIZE, true), Err(PalError::NoMem));

        // Freeing internal memory replenishes the budget.
        heap.free(HEAP_TOP - INTERNAL_SIZE, INTERNAL_SIZE).unwrap();
        heap.allocate(0, PAGE_SIZE, true).unwrap();
    }

    #[test]
    fn heap_top_tracks_highest_free_address() {
        let heap = plain_heap();
        assert_eq!(heap.heap_top(), HEAP_TOP);

        let addr = heap.allocate(0, 0x2000, false).unwrap();
        assert_eq!(heap.heap_top(), addr);

        // A hole below an occupied top does not raise the heap top.
        heap.allocate(addr - 0x3000, 0x1000, false).unwrap();
        assert_eq!(heap.heap_top(), addr);
    }

    #[test]
    fn edmm_accepts_only_uncovered_gaps() {
        let heap = edmm_heap();

        let addr = heap.allocate(HEAP_BOTTOM + 0x2000, 0x1000, false).unwrap();
        let ops = heap_backend(&heap).take_ops();
        // One page accepted top-down, extended to RWX.
        assert_eq!(
            ops,
            [
                DriverOp::Accept(accept_flags(), addr),
                DriverOp::Modpe(addr),
            ]
        );

        // Growing over the existing VMA re-accepts only the two new pages.
        heap.allocate(HEAP_BOTTOM + 0x1000, 0x3000, false).unwrap();
        let ops = heap_backend(&heap).take_ops();
        assert_eq!(
            ops,
            [
                DriverOp::Accept(accept_flags(), HEAP_BOTTOM + 0x3000),
                DriverOp::Modpe(HEAP_BOTTOM + 0x3000),
                DriverOp::Accept(accept_flags(), HEAP_BOTTOM + 0x1000),
                DriverOp::Modpe(HEAP_BOTTOM + 0x1000),
            ]
        );
    }

    #[test]
    fn edmm_trim_is_coalesced() {
        let heap = edmm_heap();
        let addr = heap.allocate(0, 0x3000, false).unwrap();
        heap_backend(&heap).take_ops();

        heap.free(addr, 0x3000).unwrap();
        let ops = heap_backend(&heap).take_ops();
        let trim = SecinfoFlags::TRIM | SecinfoFlags::MODIFIED;
        assert_eq!(
            ops,
            [
                DriverOp::Trim(addr, 3),
                DriverOp::Accept(trim, addr),
                DriverOp::Accept(trim, addr + 0x1000),
                DriverOp::Accept(trim, addr + 0x2000),
                DriverOp::Notify(addr, 3),
            ]
        );
    }

    #[test]
    fn pool_exhaustion_reports_nomem_without_state_change() {
        let heap = EnclaveHeap::with_pool_capacity(
            HEAP_BOTTOM,
            HEAP_TOP,
            INTERNAL_SIZE,
            None::<MockEdmm>,
            2,
        )
        .unwrap();

        heap.allocate(HEAP_BOTTOM + 0x1000, 0x1000, false).unwrap();
        heap.allocate(HEAP_BOTTOM + 0x3000, 0x1000, false).unwrap();

        let before = heap.vma_snapshot();
        let pages = heap.allocated_pages();
        assert_eq!(
            heap.allocate(HEAP_BOTTOM + 0x5000, 0x1000, false),
            Err(PalError::NoMem)
        );
        assert_eq!(heap.vma_snapshot(), before);
        assert_eq!(heap.allocated_pages(), pages);
    }

    #[test]
    fn quiescent_invariants_over_mixed_workload() {
        let heap = plain_heap();
        let base = HEAP_BOTTOM + 0x10_0000;

        heap.allocate(base, 0x4000, false).unwrap();
        heap.allocate(base + 0x6000, 0x2000, false).unwrap();
        heap.allocate(base + 0x4000, 0x2000, false).unwrap();
        assert_well_formed(&heap.vma_snapshot());
        // Everything is adjacent now and must have merged into one VMA.
        assert_eq!(heap.vma_snapshot().len(), 1);

        heap.free(base + 0x2000, 0x1000).unwrap();
        heap.free(base + 0x5000, 0x1000).unwrap();
        let vmas = heap.vma_snapshot();
        assert_well_formed(&vmas);
        assert_eq!(vmas.len(), 3);
    }

    fn accept_flags() -> SecinfoFlags {
        SecinfoFlags::R | SecinfoFlags::W | SecinfoFlags::REG | SecinfoFlags::PENDING
    }

    fn heap_backend(heap: &EnclaveHeap<MockEdmm>) -> &MockEdmm {
        heap.edmm_backend().expect("test heap has an EDMM backend")
    }
}
