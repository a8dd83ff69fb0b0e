//! Shared fixtures for the unit tests: the platform-oracle implementation
//! the dispatcher consults, recording event upcalls, and an aligned
//! extended-state buffer.

use std::cell::RefCell;

use paltype::kinterface::PalPlatform;
use paltype::{PalError, PalEvent, PalResult};

use crate::exception::context::XregsState;
use crate::exception::{set_event_upcall, PalContext};

/// Time the fake oracle reports; spans more than 32 bits so the EDX:EAX
/// split is observable.
pub const TEST_TIME_US: u64 = 0x0001_2345_6789_abcd;

/// Leaf the fake CPUID oracle refuses to answer.
pub const UNSUPPORTED_CPUID_LEAF: u32 = 0x7fff_ffff;

/// Value the QUIT recorder writes into the marshalled context, to observe
/// whether handler modifications survive a given dispatch path.
pub const QUIT_HANDLER_RAX: u64 = 0x5151_5151;

pub fn expected_cpuid(leaf: u32, subleaf: u32) -> [u32; 4] {
    [leaf ^ 0xa5a5_a5a5, subleaf.wrapping_add(1), 0xdead, 0xbeef]
}

struct PlatformImpl;

#[crate_interface::impl_interface]
impl PalPlatform for PlatformImpl {
    fn cpuid(leaf: u32, subleaf: u32) -> PalResult<[u32; 4]> {
        if leaf == UNSUPPORTED_CPUID_LEAF {
            return Err(PalError::Denied);
        }
        Ok(expected_cpuid(leaf, subleaf))
    }

    fn system_time_us() -> PalResult<u64> {
        Ok(TEST_TIME_US)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpcallRecord {
    pub event: PalEvent,
    pub is_in_pal: bool,
    pub arg: u64,
    pub had_ctx: bool,
}

thread_local! {
    static UPCALL_LOG: RefCell<Vec<UpcallRecord>> = const { RefCell::new(Vec::new()) };
}

pub fn drain_upcall_log() -> Vec<UpcallRecord> {
    UPCALL_LOG.with(|log| log.borrow_mut().drain(..).collect())
}

fn record(event: PalEvent, is_in_pal: bool, arg: u64, had_ctx: bool) {
    UPCALL_LOG.with(|log| {
        log.borrow_mut().push(UpcallRecord {
            event,
            is_in_pal,
            arg,
            had_ctx,
        })
    });
}

macro_rules! recorder {
    ($name:ident, $event:expr) => {
        fn $name(is_in_pal: bool, arg: u64, ctx: Option<&mut PalContext>) {
            record($event, is_in_pal, arg, ctx.is_some());
        }
    };
}

recorder!(on_arithmetic_error, PalEvent::ArithmeticError);
recorder!(on_memfault, PalEvent::MemFault);
recorder!(on_illegal, PalEvent::Illegal);
recorder!(on_suspend, PalEvent::Suspend);
recorder!(on_interrupted, PalEvent::Interrupted);
recorder!(on_failure, PalEvent::Failure);

/// The QUIT recorder additionally modifies the context so tests can check
/// which dispatch paths keep handler modifications.
fn on_quit(is_in_pal: bool, arg: u64, ctx: Option<&mut PalContext>) {
    record(PalEvent::Quit, is_in_pal, arg, ctx.is_some());
    if let Some(ctx) = ctx {
        ctx.rax = QUIT_HANDLER_RAX;
    }
}

/// Registers the recording upcalls for every event. The table is global
/// and write-once, so every test shares these handlers.
pub fn install_recording_upcalls() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        set_event_upcall(PalEvent::ArithmeticError, on_arithmetic_error);
        set_event_upcall(PalEvent::MemFault, on_memfault);
        set_event_upcall(PalEvent::Illegal, on_illegal);
        set_event_upcall(PalEvent::Quit, on_quit);
        set_event_upcall(PalEvent::Suspend, on_suspend);
        set_event_upcall(PalEvent::Interrupted, on_interrupted);
        set_event_upcall(PalEvent::Failure, on_failure);
    });
}

/// Extended-state area with the alignment XSAVE requires, large enough for
/// the legacy region, the header and some component data.
#[repr(C, align(64))]
pub struct XsaveBuf(pub [u8; 1024]);

impl XsaveBuf {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Box<Self> {
        Box::new(XsaveBuf([0; 1024]))
    }

    pub fn as_xregs(&mut self) -> *mut XregsState {
        core::ptr::from_mut(self).cast()
    }
}
