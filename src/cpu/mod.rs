//! Guest CPU engines
//!
//! Three guest processors, each available as an interpreter and as a
//! recompiler: the 64-bit main CPU, the 32-bit I/O CPU, and the vector unit
//! running its own microprogram format. Engines share the lifecycle contract
//! in [`CpuEngine`]; execution entry points stay on the concrete types since
//! each role drives different state.

pub mod iop;
pub mod main;
pub mod mips;
pub mod vu;

use crate::error::{CoreError, GuestFault};

/// Uniform lifecycle every engine implements, interpreter or recompiler.
/// Interpreters have no cache reserve; their implementations of the cache
/// operations are no-ops.
pub trait CpuEngine {
    fn name(&self) -> &'static str;

    /// Obtain whatever host resources the engine needs (the code reserve for
    /// recompilers). Failure leaves the engine unusable but must not disturb
    /// other engines.
    fn reserve(&mut self) -> Result<(), CoreError>;

    /// Release host resources. Safe to call on a never-reserved engine.
    fn shutdown(&mut self);

    /// Drop all cached translations without touching guest state.
    fn reset(&mut self) -> Result<(), CoreError>;

    /// Release the cache's physical backing while keeping its address window
    /// (resident blocks die with the pages). `reset()` brings it back.
    fn decommit_cache(&mut self) {}

    fn cache_reserve_size(&self) -> usize {
        0
    }

    /// Resize the code cache (only shrinks take effect mid-session). The
    /// caller is expected to `reset()` afterwards.
    fn set_cache_reserve_size(&mut self, _bytes: usize) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Which engine a role currently executes on. Chosen by
/// `CpuProviderPack::apply_config` and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Interpreter,
    Recompiler,
}

/// Result of one execute call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOutcome {
    /// Guest instructions retired.
    pub cycles: u32,
    /// The code reserve filled up during this slice; the caller should run
    /// the out-of-memory emergency response.
    pub cache_full: bool,
}

/// Guest-visible exception, latched in CPU state and delivered at the next
/// block boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestException {
    Interrupt,
    Syscall,
    Break,
    ReservedInstruction,
    Overflow,
    BusError(u32),
}

impl GuestException {
    /// Cause code written to the guest's cause register on delivery.
    pub fn cause_code(&self) -> u32 {
        match self {
            GuestException::Interrupt => 0,
            GuestException::BusError(_) => 7,
            GuestException::Syscall => 8,
            GuestException::Break => 9,
            GuestException::ReservedInstruction => 10,
            GuestException::Overflow => 12,
        }
    }
}

impl From<GuestFault> for GuestException {
    fn from(fault: GuestFault) -> Self {
        match fault {
            GuestFault::BusError { addr } => GuestException::BusError(addr),
        }
    }
}

/// General exception vector inside guest RAM.
pub const EXCEPTION_VECTOR: u32 = 0x180;
