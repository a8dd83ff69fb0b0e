//! EDMM round-trips with the host SGX driver.
//!
//! SGX2 lets an enclave grow and shrink its committed memory at runtime,
//! but every change is a two-party protocol: the untrusted driver EAUGs or
//! EREMOVEs the EPC page, and the enclave must confirm with EACCEPT from
//! inside. The allocator performs these round-trips while holding the heap
//! lock, so driver calls are serialized per enclave.

use bitflags::bitflags;
use config::mm::{EDMM_HEAP_RANGE_CNT, PAGE_SIZE};
use paltype::{PalError, PalResult};

use crate::host::syscall;

bitflags! {
    /// EPCM `SECINFO.FLAGS` bits: permissions in the low byte, the page
    /// type in bits 15:8.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SecinfoFlags: u64 {
        const R        = 1 << 0;
        const W        = 1 << 1;
        const X        = 1 << 2;
        const PENDING  = 1 << 3;
        const MODIFIED = 1 << 4;
        const PR       = 1 << 5;
        /// Page type PT_REG
        const REG      = 2 << 8;
        /// Page type PT_TRIM
        const TRIM     = 4 << 8;
    }
}

/// `SECINFO` as consumed by EACCEPT/EMODPE; must be 64-byte aligned.
#[repr(C, align(64))]
pub struct Secinfo {
    pub flags: u64,
    _reserved: [u8; 56],
}

impl Secinfo {
    pub fn new(flags: SecinfoFlags) -> Self {
        Self {
            flags: flags.bits(),
            _reserved: [0; 56],
        }
    }
}

/// A `(addr, size)` sub-range needing an EDMM round-trip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapRange {
    pub addr: usize,
    pub size: usize,
}

/// Bounded scratch list of [`HeapRange`]s, filled while the allocator walks
/// VMAs and drained after the bookkeeping settles.
pub struct HeapRangeList {
    entries: [HeapRange; EDMM_HEAP_RANGE_CNT],
    len: usize,
    dropped: usize,
}

impl HeapRangeList {
    pub const fn new() -> Self {
        Self {
            entries: [HeapRange { addr: 0, size: 0 }; EDMM_HEAP_RANGE_CNT],
            len: 0,
            dropped: 0,
        }
    }

    /// Records a range; once the scratch list is full further ranges are
    /// counted but dropped, and the caller reports them in one warning.
    pub fn push(&mut self, addr: usize, size: usize) {
        if size == 0 {
            return;
        }
        if self.len == EDMM_HEAP_RANGE_CNT {
            self.dropped += 1;
            return;
        }
        self.entries[self.len] = HeapRange { addr, size };
        self.len += 1;
    }

    /// Records a range, merging it into the previous entry when the two are
    /// contiguous. Frees walk VMAs downward, so a range extends the last
    /// entry from below.
    pub fn push_coalesced(&mut self, addr: usize, size: usize) {
        if size == 0 {
            return;
        }
        if self.len > 0 && addr + size == self.entries[self.len - 1].addr {
            self.entries[self.len - 1].addr = addr;
            self.entries[self.len - 1].size += size;
            return;
        }
        self.push(addr, size);
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapRange> {
        self.entries[..self.len].iter()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// The enclave side of the EDMM protocol.
///
/// The production backend executes ENCLU leaves and talks to the driver;
/// tests substitute a recording double.
pub trait EdmmBackend {
    /// EACCEPT one page with the given `SECINFO`.
    fn accept(&self, flags: SecinfoFlags, addr: usize) -> PalResult<()>;

    /// EMODPE: extend the permissions of a valid page. Supplying a value
    /// that does not extend the permissions has no effect.
    fn extend_permissions(&self, flags: SecinfoFlags, addr: usize);

    /// Ask the driver to change `count` pages at `addr` to PT_TRIM; the
    /// driver ETRACKs the range and IPIs stale TLB entries.
    fn trim_epc_pages(&self, addr: usize, count: usize) -> PalResult<()>;

    /// Tell the driver the trimmed pages were EACCEPTed so it can EREMOVE
    /// them.
    fn notify_accept(&self, addr: usize, count: usize) -> PalResult<()>;
}

/// This function allocates new pages at an address in ELRANGE of an
/// enclave. If the pages contain executable code, the page permissions are
/// extended once the page is in a valid state. The allocation sequence is
/// described below:
/// 1. The enclave invokes EACCEPT on a new page request which triggers a
///    page fault (#PF) as the page is not available yet.
/// 2. The driver catches this #PF and issues EAUG for the page. The control
///    returns back to the enclave.
/// 3. The enclave continues the same EACCEPT and the instruction succeeds
///    this time.
pub fn get_edmm_page_range<E: EdmmBackend>(
    edmm: &E,
    start: usize,
    size: usize,
    executable: bool,
) -> PalResult<()> {
    log::debug!(
        "[get_edmm_page_range] start = {:#x}, size = {:#x}, is_executable = {}",
        start,
        size,
        executable
    );

    let pending = SecinfoFlags::R | SecinfoFlags::W | SecinfoFlags::REG | SecinfoFlags::PENDING;

    // Accept from the top down, matching the descending placement of the
    // allocator above.
    let mut addr = start + size;
    while addr > start {
        addr -= PAGE_SIZE;
        edmm.accept(pending, addr).inspect_err(|e| {
            log::debug!("[get_edmm_page_range] EDMM accept page failed: {:#x} {:?}", addr, e);
        })?;

        // New pages come up RW; a valid executable page additionally gets X
        // through EMODPE (the page is valid only after the EAUG done as
        // part of the accept above).
        if executable {
            edmm.extend_permissions(pending | SecinfoFlags::X, addr);
        }
    }

    Ok(())
}

/// This function trims EPC pages on the enclave's request. The sequence is
/// as below:
/// 1. The enclave calls the SGX driver to change the pages' type to
///    PT_TRIM.
/// 2. In turn the driver invokes ETRACK to track the pages' addresses on
///    all processors and issues IPIs to flush stale TLB entries.
/// 3. The enclave issues an EACCEPT to accept the changes to each EPC page.
/// 4. The enclave notifies the driver to remove the EPC pages, which issues
///    the EREMOVE instruction to complete the request.
pub fn free_edmm_page_range<E: EdmmBackend>(edmm: &E, start: usize, size: usize) -> PalResult<()> {
    let addr = config::mm::page_align_down(start);
    let end = addr + size;
    log::debug!("[free_edmm_page_range] start = {:#x}, size = {:#x}", start, size);

    let count = size / PAGE_SIZE;
    edmm.trim_epc_pages(addr, count).inspect_err(|e| {
        log::debug!(
            "[free_edmm_page_range] EPC trim on [{:#x}, {:#x}) failed ({:?})",
            addr,
            end,
            e
        );
    })?;

    let trim = SecinfoFlags::TRIM | SecinfoFlags::MODIFIED;
    let mut page = addr;
    while page < end {
        edmm.accept(trim, page).inspect_err(|e| {
            log::debug!(
                "[free_edmm_page_range] EDMM accept page failed while trimming: {:#x} {:?}",
                page,
                e
            );
        })?;
        page += PAGE_SIZE;
    }

    edmm.notify_accept(addr, count).inspect_err(|e| {
        log::debug!(
            "[free_edmm_page_range] EPC notify_accept on [{:#x}, {:#x}), {} pages failed ({:?})",
            addr,
            end,
            count,
            e
        );
    })?;

    Ok(())
}

/// EDMM backend for real SGX2 hardware: ENCLU leaves in-enclave, ioctls on
/// the SGX driver for the host half (routed through the ocall layer in a
/// full deployment).
pub struct Sgx2Backend {
    driver_fd: i32,
}

/// ENCLU leaf numbers.
const ENCLU_EACCEPT: u32 = 0x05;
const ENCLU_EMODPE: u32 = 0x06;

/// Driver ioctl requests for the trim protocol.
const SGX_IOC_PAGE_TRIM: usize = 0xc010a407;
const SGX_IOC_PAGE_NOTIFY_ACCEPT: usize = 0xc010a408;

#[repr(C)]
struct SgxRangeParam {
    addr: u64,
    nr_pages: u64,
}

impl Sgx2Backend {
    pub fn new(driver_fd: i32) -> Self {
        Self { driver_fd }
    }

    #[cfg(target_arch = "x86_64")]
    fn enclu(leaf: u32, secinfo: &Secinfo, addr: usize) -> u32 {
        let ret: u32;
        // rbx is reserved by the compiler, so shuffle it manually.
        unsafe {
            core::arch::asm!(
                "xchg {secinfo}, rbx",
                "enclu",
                "xchg {secinfo}, rbx",
                secinfo = inout(reg) secinfo as *const Secinfo => _,
                inout("eax") leaf => ret,
                in("rcx") addr,
                options(nostack),
            );
        }
        ret
    }

    fn driver_request(&self, request: usize, addr: usize, count: usize) -> PalResult<()> {
        let param = SgxRangeParam {
            addr: addr as u64,
            nr_pages: count as u64,
        };
        syscall::ioctl(self.driver_fd, request, &param as *const _ as usize)
            .map_err(PalError::from_unix)?;
        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
impl EdmmBackend for Sgx2Backend {
    fn accept(&self, flags: SecinfoFlags, addr: usize) -> PalResult<()> {
        let secinfo = Secinfo::new(flags);
        match Self::enclu(ENCLU_EACCEPT, &secinfo, addr) {
            0 => Ok(()),
            _ => Err(PalError::Denied),
        }
    }

    fn extend_permissions(&self, flags: SecinfoFlags, addr: usize) {
        let secinfo = Secinfo::new(flags);
        Self::enclu(ENCLU_EMODPE, &secinfo, addr);
    }

    fn trim_epc_pages(&self, addr: usize, count: usize) -> PalResult<()> {
        self.driver_request(SGX_IOC_PAGE_TRIM, addr, count)
    }

    fn notify_accept(&self, addr: usize, count: usize) -> PalResult<()> {
        self.driver_request(SGX_IOC_PAGE_NOTIFY_ACCEPT, addr, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_list_coalesces_downward_neighbors() {
        let mut list = HeapRangeList::new();
        list.push_coalesced(0x3000, 0x1000);
        list.push_coalesced(0x2000, 0x1000);
        list.push_coalesced(0x8000, 0x1000);

        let got: Vec<_> = list.iter().copied().collect();
        assert_eq!(
            got,
            [
                HeapRange { addr: 0x2000, size: 0x2000 },
                HeapRange { addr: 0x8000, size: 0x1000 },
            ]
        );
    }

    #[test]
    fn range_list_drops_beyond_capacity() {
        let mut list = HeapRangeList::new();
        for i in 0..EDMM_HEAP_RANGE_CNT + 3 {
            // Non-contiguous on purpose.
            list.push(i * 2 * PAGE_SIZE, PAGE_SIZE);
        }
        assert_eq!(list.iter().count(), EDMM_HEAP_RANGE_CNT);
        assert_eq!(list.dropped(), 3);
    }
}
