//! Dynamic-recompilation core for a multi-processor console emulator
//!
//! Emulates three guest processors — a 64-bit MIPS-like main CPU, a 32-bit
//! MIPS-like I/O processor, and a 128-bit vector co-processor with its own
//! microprogram format — each as an interpreter plus a just-in-time
//! translator emitting host x86-64 code. Around them sit the pieces that
//! make that safe and fast:
//!
//! - one large host address-space reservation subdivided at fixed offsets
//!   ([`vmem`]), with staged commit/decommit and RWX code reserves,
//! - a software TLB per scalar CPU mapping guest pages to host pointers or
//!   I/O handlers, rebuilt synchronously on mapping changes ([`vtlb`]),
//! - per-CPU block caches with write-watch invalidation for self-modifying
//!   guest code ([`rec`]),
//! - a provider pack that constructs every engine eagerly, keeps reservation
//!   failures as diagnostics, and owns the out-of-memory emergency response
//!   ([`providers`]),
//! - an optional worker thread running vector-unit microprograms
//!   concurrently with the main CPU ([`vu_thread`]).
//!
//! [`System`] ties it together behind the staged lifecycle
//! `reserve_all → commit_all → reset_all … decommit_all → release_all`.

pub mod config;
pub mod cpu;
pub mod error;
pub mod providers;
pub mod rec;
pub mod system;
pub mod vmem;
pub mod vtlb;
pub mod vu_thread;

pub use config::CoreConfig;
pub use cpu::{CpuEngine, EngineKind, ExecOutcome, GuestException};
pub use error::{CoreError, GuestFault};
pub use providers::{CpuInitializer, CpuProviderPack, CpuRole};
pub use system::{guest_map, System};
pub use vmem::{
    host_map, sys_reserve_main_memory, PageProtection, RecompiledCodeReserve,
    VirtualMemoryManager, VirtualMemoryReserve,
};
pub use vtlb::{AccessKind, HwEffect, IoHandler, MappedRegion, RegionTarget, Vtlb};
pub use vu_thread::VuThread;
