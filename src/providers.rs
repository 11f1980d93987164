//! CPU provider pack
//!
//! Constructs every engine eagerly, capturing per-engine reservation
//! failures as deferred errors so one broken recompiler never blocks the
//! others. `apply_config` re-selects interpreter vs recompiler per role and
//! must be re-run whenever the selection could be stale; nothing else caches
//! the choice.
//!
//! The out-of-memory emergency response shrinks every selected recompiler's
//! cache to two thirds of its size and resets it, trading hit rate for
//! continued operation. It may run repeatedly and only escalates when a
//! shrink itself fails.

use std::sync::Arc;

use tracing::{error, warn};

use crate::config::CoreConfig;
use crate::cpu::iop::rec::IopRec;
use crate::cpu::iop::{IopInterpreter, IopState};
use crate::cpu::main::rec::MainRec;
use crate::cpu::main::{MainInterpreter, MainState};
use crate::cpu::vu::rec::VuRec;
use crate::cpu::vu::{VuInterpreter, VuMemView, VuState};
use crate::cpu::{CpuEngine, EngineKind, ExecOutcome};
use crate::error::CoreError;
use crate::vmem::VirtualMemoryManager;
use crate::vtlb::Vtlb;

/// Wires construction and teardown uniformly across unrelated engine types:
/// the engine reserves its resources at construction, and a failure is kept
/// as a diagnostic instead of propagating.
pub struct CpuInitializer<E: CpuEngine> {
    engine: Option<E>,
    error: Option<CoreError>,
}

impl<E: CpuEngine> CpuInitializer<E> {
    pub fn new(mut engine: E) -> Self {
        match engine.reserve() {
            Ok(()) => CpuInitializer {
                engine: Some(engine),
                error: None,
            },
            Err(e) => {
                error!(engine = engine.name(), %e, "cpu provider unavailable");
                engine.shutdown();
                CpuInitializer {
                    engine: None,
                    error: Some(e),
                }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.engine.is_some()
    }

    pub fn error(&self) -> Option<&CoreError> {
        self.error.as_ref()
    }

    pub fn get(&self) -> Option<&E> {
        self.engine.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut E> {
        self.engine.as_mut()
    }
}

impl<E: CpuEngine> Drop for CpuInitializer<E> {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.shutdown();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuRole {
    Main,
    Iop,
    Vu,
}

pub struct CpuProviderPack {
    main_int: CpuInitializer<MainInterpreter>,
    main_rec: CpuInitializer<MainRec>,
    iop_int: CpuInitializer<IopInterpreter>,
    iop_rec: CpuInitializer<IopRec>,
    vu_int: CpuInitializer<VuInterpreter>,
    vu_rec: CpuInitializer<VuRec>,
    main_sel: EngineKind,
    iop_sel: EngineKind,
    vu_sel: EngineKind,
}

impl CpuProviderPack {
    /// Build every provider up front. Recompiler reservation failures are
    /// captured per engine; interpreters cannot fail.
    pub fn new(manager: &Arc<VirtualMemoryManager>) -> Self {
        tracing::info!("reserving memory for recompilers");
        CpuProviderPack {
            main_int: CpuInitializer::new(MainInterpreter::new()),
            main_rec: CpuInitializer::new(MainRec::new(manager.clone())),
            iop_int: CpuInitializer::new(IopInterpreter::new()),
            iop_rec: CpuInitializer::new(IopRec::new(manager.clone())),
            vu_int: CpuInitializer::new(VuInterpreter::new()),
            vu_rec: CpuInitializer::new(VuRec::new(manager.clone())),
            main_sel: EngineKind::Interpreter,
            iop_sel: EngineKind::Interpreter,
            vu_sel: EngineKind::Interpreter,
        }
    }

    /// Re-select the engine for each role from the current configuration.
    /// A role configured for recompilation falls back to its interpreter when
    /// the reservation failed.
    pub fn apply_config(&mut self, config: &CoreConfig) {
        self.main_sel = if config.enable_rec_main && self.main_rec.is_available() {
            EngineKind::Recompiler
        } else {
            EngineKind::Interpreter
        };
        self.iop_sel = if config.enable_rec_iop && self.iop_rec.is_available() {
            EngineKind::Recompiler
        } else {
            EngineKind::Interpreter
        };
        self.vu_sel = if config.enable_rec_vu && self.vu_rec.is_available() {
            EngineKind::Recompiler
        } else {
            EngineKind::Interpreter
        };
    }

    pub fn engine_kind(&self, role: CpuRole) -> EngineKind {
        match role {
            CpuRole::Main => self.main_sel,
            CpuRole::Iop => self.iop_sel,
            CpuRole::Vu => self.vu_sel,
        }
    }

    /// The reservation failure retained for a role's recompiler, if any.
    pub fn rec_error(&self, role: CpuRole) -> Option<&CoreError> {
        match role {
            CpuRole::Main => self.main_rec.error(),
            CpuRole::Iop => self.iop_rec.error(),
            CpuRole::Vu => self.vu_rec.error(),
        }
    }

    /// Whether any role the configuration wants recompiled is unavailable.
    pub fn had_failures(&self, config: &CoreConfig) -> bool {
        (config.enable_rec_main && !self.main_rec.is_available())
            || (config.enable_rec_iop && !self.iop_rec.is_available())
            || (config.enable_rec_vu && !self.vu_rec.is_available())
    }

    pub fn main_rec(&self) -> Option<&MainRec> {
        self.main_rec.get()
    }

    pub fn main_rec_mut(&mut self) -> Option<&mut MainRec> {
        self.main_rec.get_mut()
    }

    pub fn execute_main(
        &mut self,
        st: &mut MainState,
        vtlb: &mut Vtlb,
        max_cycles: u32,
    ) -> ExecOutcome {
        if self.main_sel == EngineKind::Recompiler {
            if let Some(rec) = self.main_rec.get_mut() {
                return rec.execute(st, vtlb, max_cycles);
            }
        }
        match self.main_int.get_mut() {
            Some(int) => int.execute(st, vtlb, max_cycles),
            None => ExecOutcome::default(),
        }
    }

    pub fn execute_iop(
        &mut self,
        st: &mut IopState,
        vtlb: &mut Vtlb,
        max_cycles: u32,
    ) -> ExecOutcome {
        if self.iop_sel == EngineKind::Recompiler {
            if let Some(rec) = self.iop_rec.get_mut() {
                return rec.execute(st, vtlb, max_cycles);
            }
        }
        match self.iop_int.get_mut() {
            Some(int) => int.execute(st, vtlb, max_cycles),
            None => ExecOutcome::default(),
        }
    }

    pub fn execute_vu(
        &mut self,
        st: &mut VuState,
        mem: &VuMemView,
        addr: u32,
        max_pairs: u32,
    ) -> ExecOutcome {
        if self.vu_sel == EngineKind::Recompiler {
            if let Some(rec) = self.vu_rec.get_mut() {
                return rec.execute_micro(st, mem, addr, max_pairs);
            }
        }
        match self.vu_int.get_mut() {
            Some(int) => int.execute_micro(st, mem, addr, max_pairs),
            None => ExecOutcome::default(),
        }
    }

    /// A microprogram upload wrote `[start, end)` of micro memory.
    pub fn notify_vu_micro_write(&mut self, start: u32, end: u32) {
        if let Some(rec) = self.vu_rec.get_mut() {
            rec.notify_micro_write_range(start, end);
        }
    }

    /// Reset every available engine's execution caches. Guest state is
    /// untouched; recompilers slow down briefly while blocks refill.
    pub fn reset_engines(&mut self) -> Result<(), CoreError> {
        if let Some(e) = self.main_rec.get_mut() {
            e.reset()?;
        }
        if let Some(e) = self.iop_rec.get_mut() {
            e.reset()?;
        }
        if let Some(e) = self.vu_rec.get_mut() {
            e.reset()?;
        }
        if let Some(e) = self.main_int.get_mut() {
            e.reset()?;
        }
        if let Some(e) = self.iop_int.get_mut() {
            e.reset()?;
        }
        if let Some(e) = self.vu_int.get_mut() {
            e.reset()?;
        }
        Ok(())
    }

    /// Release physical backing for every code cache. `reset_engines`
    /// recommits on the way back up.
    pub fn decommit_code(&mut self) {
        if let Some(e) = self.main_rec.get_mut() {
            e.decommit_cache();
        }
        if let Some(e) = self.iop_rec.get_mut() {
            e.decommit_cache();
        }
        if let Some(e) = self.vu_rec.get_mut() {
            e.decommit_cache();
        }
    }

    /// Host allocation failed somewhere: shrink every available recompiler's
    /// cache reserve to two thirds and reset it. Deliberately approximate;
    /// safe to invoke repeatedly. Escalates as fatal only when a shrink
    /// cannot re-commit.
    pub fn oom_emergency_response(&mut self) -> Result<(), CoreError> {
        warn!("host memory exhausted; shrinking recompiler caches");
        Self::shrink_one(&mut self.main_rec)?;
        Self::shrink_one(&mut self.iop_rec)?;
        Self::shrink_one(&mut self.vu_rec)?;
        Ok(())
    }

    fn shrink_one<E: CpuEngine>(init: &mut CpuInitializer<E>) -> Result<(), CoreError> {
        let Some(engine) = init.get_mut() else {
            return Ok(());
        };
        let target = engine.cache_reserve_size() * 2 / 3;
        tracing::info!(engine = engine.name(), size = target, "emergency cache shrink");
        engine.set_cache_reserve_size(target).map_err(|_| {
            CoreError::OutOfMemory {
                name: engine.name(),
                fatal: true,
            }
        })?;
        engine.reset().map_err(|_| CoreError::OutOfMemory {
            name: engine.name(),
            fatal: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmem::{host_map, sys_reserve_main_memory};

    fn pack() -> CpuProviderPack {
        let mgr = sys_reserve_main_memory(host_map::TOTAL_SIZE).unwrap();
        CpuProviderPack::new(&mgr)
    }

    #[test]
    fn test_all_engines_available() {
        let pack = pack();
        assert!(pack.rec_error(CpuRole::Main).is_none());
        assert!(pack.rec_error(CpuRole::Iop).is_none());
        assert!(pack.rec_error(CpuRole::Vu).is_none());
        assert!(!pack.had_failures(&CoreConfig::default()));
    }

    #[test]
    fn test_apply_config_selects_engines() {
        let mut pack = pack();
        let mut config = CoreConfig::default();
        pack.apply_config(&config);
        assert_eq!(pack.engine_kind(CpuRole::Main), EngineKind::Recompiler);
        assert_eq!(pack.engine_kind(CpuRole::Iop), EngineKind::Recompiler);

        config.enable_rec_iop = false;
        pack.apply_config(&config);
        assert_eq!(pack.engine_kind(CpuRole::Iop), EngineKind::Interpreter);
        assert_eq!(pack.engine_kind(CpuRole::Main), EngineKind::Recompiler);
    }

    #[test]
    fn test_emergency_shrink_is_monotonic() {
        let mut pack = pack();
        pack.apply_config(&CoreConfig::default());
        let mut prev = pack.main_rec().unwrap().cache_reserve_size();
        for _ in 0..4 {
            pack.oom_emergency_response().unwrap();
            let now = pack.main_rec().unwrap().cache_reserve_size();
            assert!(now <= prev * 2 / 3 + crate::vmem::HOST_PAGE_SIZE);
            assert!(now < prev);
            prev = now;
        }
    }
}
