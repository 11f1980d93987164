//! Error taxonomy for the recompilation core
//!
//! Reservation failures are scoped to one CPU role and downgrade that role to
//! its interpreter; cache exhaustion is recovered by the emergency response
//! and only escalates when the shrink itself fails.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// No contiguous host address range could be obtained for a reservation.
    #[error("{name}: could not reserve host address space: {detail}")]
    ReservationFailed { name: &'static str, detail: String },

    /// A reserve could not be committed (or re-committed after a shrink).
    /// `fatal` distinguishes "this recompiler is unusable, fall back to the
    /// interpreter" from a session-level failure.
    #[error("{name}: recompiled code cache could not be mapped (fatal: {fatal})")]
    OutOfMemory { name: &'static str, fatal: bool },

    /// A sub-reserve window does not fit inside its manager's span.
    #[error("{name}: reserve window out of range")]
    BadWindow { name: &'static str },

    /// A lifecycle call was made out of order (e.g. commit before reserve).
    #[error("lifecycle ordering violated: {0}")]
    Lifecycle(&'static str),
}

/// Guest-visible memory fault raised by the TLB or the access trampolines.
/// These are delivered to the guest as exceptions, never to the host caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestFault {
    /// Access to an unmapped guest address.
    BusError { addr: u32 },
}
