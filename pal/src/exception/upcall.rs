//! Registered event upcalls.
//!
//! One slot per PAL event, written once while the LibOS brings itself up
//! and read-only afterwards, so the dispatcher can consult the table from
//! exception context without taking a lock.

use paltype::event::PAL_EVENT_NUM_BOUND;
use paltype::PalEvent;
use spin::Once;

use super::context::PalContext;

/// Upcall ABI: `(in-PAL?, per-event argument, marshalled context)`.
///
/// The argument is the faulting rip for ILLEGAL and zero otherwise
/// (SGX1 hardware does not expose the fault address for MEMFAULT).
/// Handlers for asynchronous events must not rely on context
/// modifications surviving the return, see
/// [`handle_external_event`](super::handle_external_event).
pub type EventUpcall = fn(is_in_pal: bool, arg: u64, ctx: Option<&mut PalContext>);

struct UpcallSlot(Once<EventUpcall>);

const EMPTY_SLOT: UpcallSlot = UpcallSlot(Once::new());

static UPCALLS: [UpcallSlot; PAL_EVENT_NUM_BOUND] = [EMPTY_SLOT; PAL_EVENT_NUM_BOUND];

/// Registers `upcall` for `event`. The first registration wins; the table
/// is write-once by design and later calls are ignored.
pub fn set_event_upcall(event: PalEvent, upcall: EventUpcall) {
    UPCALLS[event.code() as usize].0.call_once(|| upcall);
}

pub fn event_upcall(event: PalEvent) -> Option<EventUpcall> {
    UPCALLS[event.code() as usize].0.get().copied()
}
