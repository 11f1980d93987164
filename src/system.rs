//! System orchestrator
//!
//! Owns the memory reservation, the per-CPU translation tables, the CPU
//! provider pack, and the optional cross-thread vector-unit bridge, and
//! exposes the staged lifecycle to the embedding application:
//!
//! `reserve_all → commit_all → reset_all … decommit_all → release_all`
//!
//! Each level implies the ones before it; callers must not skip levels.
//! Teardown always quiesces the vector-unit worker before shared memory is
//! touched.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::config::CoreConfig;
use crate::cpu::iop::IopState;
use crate::cpu::main::MainState;
use crate::cpu::vu::{VuMemView, VuState, MICRO_MEM_SIZE};
use crate::error::CoreError;
use crate::providers::CpuProviderPack;
use crate::vmem::{
    host_map, sys_reserve_main_memory, PageProtection, VirtualMemoryManager,
    VirtualMemoryReserve,
};
use crate::vtlb::{HwEffect, IoHandler, MappedRegion, RegionTarget, Vtlb};
use crate::vu_thread::VuThread;

/// Guest-visible addresses on the main bus.
pub mod guest_map {
    /// Main RAM, identity-mapped at the bottom of the address space.
    pub const MAIN_RAM_BASE: u32 = 0x0000_0000;
    /// Memory-control register bank.
    pub const MAIN_HW_BASE: u32 = 0x1000_0000;
    /// Optional RAM mirror, enabled through the memory-control register.
    pub const MAIN_RAM_MIRROR_BASE: u32 = 0x2000_0000;
    /// I/O-CPU RAM on its own bus.
    pub const IOP_RAM_BASE: u32 = 0x0000_0000;
}

/// RAM reserves carved out of the one big reservation.
struct SysMemory {
    manager: Arc<VirtualMemoryManager>,
    main_ram: Option<VirtualMemoryReserve>,
    iop_ram: Option<VirtualMemoryReserve>,
    vu_mem: Option<VirtualMemoryReserve>,
}

impl SysMemory {
    fn new() -> Result<SysMemory, CoreError> {
        Ok(SysMemory {
            manager: sys_reserve_main_memory(host_map::TOTAL_SIZE)?,
            main_ram: None,
            iop_ram: None,
            vu_mem: None,
        })
    }

    fn reserve_all(&mut self) -> Result<(), CoreError> {
        if self.main_ram.is_some() {
            return Ok(());
        }
        debug!("mapping host memory for virtual systems");
        self.main_ram = Some(VirtualMemoryReserve::assign(
            "main ram",
            self.manager.clone(),
            host_map::MAIN_RAM_OFFSET,
            host_map::MAIN_RAM_SIZE,
            PageProtection::rw(),
        )?);
        self.iop_ram = Some(VirtualMemoryReserve::assign(
            "iop ram",
            self.manager.clone(),
            host_map::IOP_RAM_OFFSET,
            host_map::IOP_RAM_SIZE,
            PageProtection::rw(),
        )?);
        self.vu_mem = Some(VirtualMemoryReserve::assign(
            "vu memory",
            self.manager.clone(),
            host_map::VU_MEM_OFFSET,
            host_map::VU_MEM_SIZE,
            PageProtection::rw(),
        )?);
        Ok(())
    }

    fn commit_all(&mut self) -> Result<(), CoreError> {
        let (Some(main), Some(iop), Some(vu)) = (
            self.main_ram.as_mut(),
            self.iop_ram.as_mut(),
            self.vu_mem.as_mut(),
        ) else {
            return Err(CoreError::Lifecycle("commit_all before reserve_all"));
        };
        if main.is_committed() && iop.is_committed() && vu.is_committed() {
            return Ok(());
        }
        debug!("allocating host memory for virtual systems");
        main.commit()?;
        iop.commit()?;
        vu.commit()?;
        Ok(())
    }

    fn reset_all(&mut self) -> Result<(), CoreError> {
        self.commit_all()?;
        debug!("resetting host memory for virtual systems");
        if let Some(r) = self.main_ram.as_mut() {
            r.reset()?;
        }
        if let Some(r) = self.iop_ram.as_mut() {
            r.reset()?;
        }
        if let Some(r) = self.vu_mem.as_mut() {
            r.reset()?;
        }
        Ok(())
    }

    fn decommit_all(&mut self) {
        info!("decommitting host memory for virtual systems");
        if let Some(r) = self.main_ram.as_mut() {
            r.decommit();
        }
        if let Some(r) = self.iop_ram.as_mut() {
            r.decommit();
        }
        if let Some(r) = self.vu_mem.as_mut() {
            r.decommit();
        }
    }

    fn is_committed(&self) -> bool {
        self.main_ram
            .as_ref()
            .map(|r| r.is_committed())
            .unwrap_or(false)
    }
}

/// Memory-control register bank. Writing bit 0 of register 0 toggles the
/// RAM mirror; the remap takes effect before the guest write completes.
struct MemControl {
    ram: *mut u8,
    self_index: usize,
    mirror: bool,
}

impl IoHandler for MemControl {
    fn read32(&mut self, offset: u32) -> u32 {
        match offset {
            0 => self.mirror as u32,
            _ => 0,
        }
    }

    fn write32(&mut self, offset: u32, value: u32) -> HwEffect {
        if offset != 0 {
            return HwEffect::None;
        }
        self.mirror = value & 1 != 0;
        HwEffect::Remap(main_bus_layout(self.ram, self.self_index, self.mirror))
    }
}

fn main_bus_layout(ram: *mut u8, handler_index: usize, mirror: bool) -> Vec<MappedRegion> {
    let mut layout = vec![
        MappedRegion {
            start: guest_map::MAIN_RAM_BASE,
            len: host_map::MAIN_RAM_SIZE as u32,
            target: RegionTarget::Direct { ptr: ram },
        },
        MappedRegion {
            start: guest_map::MAIN_HW_BASE,
            len: crate::vtlb::PAGE_SIZE,
            target: RegionTarget::Handler {
                index: handler_index,
            },
        },
    ];
    if mirror {
        layout.push(MappedRegion {
            start: guest_map::MAIN_RAM_MIRROR_BASE,
            len: host_map::MAIN_RAM_SIZE as u32,
            target: RegionTarget::Direct { ptr: ram },
        });
    }
    layout
}

pub struct System {
    config: CoreConfig,
    memory: SysMemory,
    main_tlb: Vtlb,
    iop_tlb: Vtlb,
    mem_control: Option<usize>,
    pub main: MainState,
    pub iop: IopState,
    vu: Arc<Mutex<VuState>>,
    providers: CpuProviderPack,
    vu_thread: Option<VuThread>,
}

impl System {
    /// Build the reservation, the provider pack (engines reserve eagerly and
    /// keep their failures as diagnostics), and empty translation tables.
    pub fn new(config: CoreConfig) -> Result<System, CoreError> {
        let memory = SysMemory::new()?;
        let mut providers = CpuProviderPack::new(&memory.manager);
        providers.apply_config(&config);
        Ok(System {
            config,
            memory,
            main_tlb: Vtlb::new(),
            iop_tlb: Vtlb::new(),
            mem_control: None,
            main: MainState::new(),
            iop: IopState::new(),
            vu: Arc::new(Mutex::new(VuState::new())),
            providers,
            vu_thread: None,
        })
    }

    /// Address-space reservation for the guest memory regions.
    pub fn reserve_all(&mut self) -> Result<(), CoreError> {
        self.memory.reserve_all()
    }

    /// Commit guest RAM, build the translation tables, and start the
    /// vector-unit worker if configured. Implies a successful reserve.
    pub fn commit_all(&mut self) -> Result<(), CoreError> {
        self.memory.commit_all()?;
        self.rebuild_memory_map()?;
        if self.config.thread_vu && self.vu_thread.is_none() {
            let view = self.vu_mem_view()?;
            self.vu_thread = Some(VuThread::start(self.vu.clone(), view)?);
        }
        Ok(())
    }

    /// Drop all guest memory contents and every cached translation. Implies
    /// commit. Guest register state restarts from power-on.
    pub fn reset_all(&mut self) -> Result<(), CoreError> {
        self.commit_all()?;
        if let Some(bridge) = &self.vu_thread {
            bridge.wait_idle();
            bridge.reset();
        }
        self.memory.reset_all()?;
        self.rebuild_memory_map()?;
        self.main.reset();
        self.iop.reset();
        self.vu
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.clear_execution_caches()
    }

    /// Release physical backing while keeping every address range reserved.
    /// The vector-unit worker is quiesced first; translations die with the
    /// pages.
    pub fn decommit_all(&mut self) {
        if let Some(bridge) = &self.vu_thread {
            bridge.wait_idle();
            bridge.reset();
        }
        self.providers.decommit_code();
        self.memory.decommit_all();
    }

    /// Decommit and stop the worker thread. The address space itself is
    /// released when the `System` drops.
    pub fn release_all(&mut self) {
        self.decommit_all();
        info!("releasing host memory maps for virtual systems");
        if let Some(mut bridge) = self.vu_thread.take() {
            bridge.shutdown();
        }
    }

    /// Re-select engines from the configuration and reset their caches.
    /// Must be called whenever the active-engine choice could be stale.
    pub fn clear_execution_caches(&mut self) -> Result<(), CoreError> {
        self.providers.apply_config(&self.config);
        self.providers.reset_engines()
    }

    /// Swap in a new configuration. Engine selection is revisited
    /// immediately; the worker thread starts or stops at the next commit.
    pub fn set_config(&mut self, config: CoreConfig) -> Result<(), CoreError> {
        self.config = config;
        if !self.config.thread_vu {
            if let Some(mut bridge) = self.vu_thread.take() {
                bridge.shutdown();
            }
        }
        self.clear_execution_caches()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn providers(&self) -> &CpuProviderPack {
        &self.providers
    }

    pub fn providers_mut(&mut self) -> &mut CpuProviderPack {
        &mut self.providers
    }

    /// Base address of the single host reservation. Stable for the lifetime
    /// of this `System`.
    pub fn memory_base(&self) -> usize {
        self.memory.manager.base() as usize
    }

    pub fn vu_state(&self) -> &Arc<Mutex<VuState>> {
        &self.vu
    }

    /// Run the main CPU for `cycles` guest instructions and the I/O CPU at
    /// its usual one-eighth ratio. Cache exhaustion triggers the emergency
    /// response instead of failing the slice.
    pub fn run(&mut self, cycles: u32) -> Result<u32, CoreError> {
        let main_out = self
            .providers
            .execute_main(&mut self.main, &mut self.main_tlb, cycles);
        if main_out.cache_full {
            self.providers.oom_emergency_response()?;
        }
        let iop_out = self
            .providers
            .execute_iop(&mut self.iop, &mut self.iop_tlb, cycles / 8 + 1);
        if iop_out.cache_full {
            self.providers.oom_emergency_response()?;
        }
        Ok(main_out.cycles)
    }

    /// Kick a microprogram. Routed to the worker thread when the bridge is
    /// up, otherwise executed inline on the active vector-unit engine.
    pub fn vu_exec_micro(&mut self, addr: u32) -> Result<(), CoreError> {
        if let Some(bridge) = &self.vu_thread {
            bridge.execute_micro(addr);
            return Ok(());
        }
        let view = self.vu_mem_view()?;
        let budget = (MICRO_MEM_SIZE as u32 / 8) * 4;
        let out = {
            let mut st = self.vu.lock().unwrap_or_else(PoisonError::into_inner);
            self.providers.execute_vu(&mut st, &view, addr, budget)
        };
        if out.cache_full {
            self.providers.oom_emergency_response()?;
        }
        Ok(())
    }

    /// Block until the vector unit is idle (no-op without the bridge).
    pub fn wait_vu(&self) {
        if let Some(bridge) = &self.vu_thread {
            bridge.wait_idle();
        }
    }

    /// Copy a microprogram into micro memory. Quiesces the worker first and
    /// queues invalidation for any translated blocks the upload overlaps.
    pub fn upload_vu_micro(&mut self, addr: u32, data: &[u8]) -> Result<(), CoreError> {
        if let Some(bridge) = &self.vu_thread {
            bridge.wait_idle();
        }
        let view = self.vu_mem_view()?;
        let addr = addr as usize % MICRO_MEM_SIZE;
        let len = data.len().min(MICRO_MEM_SIZE - addr);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), view.micro.add(addr), len);
        }
        self.providers
            .notify_vu_micro_write(addr as u32, (addr + len) as u32);
        Ok(())
    }

    /// Main-bus accessors, mostly for the embedding layer and tests.
    pub fn write_main_ram(&mut self, addr: u32, data: &[u8]) -> Result<(), CoreError> {
        for (i, b) in data.iter().enumerate() {
            self.main_tlb
                .write8(addr + i as u32, *b)
                .map_err(|_| CoreError::Lifecycle("write outside mapped guest memory"))?;
        }
        Ok(())
    }

    pub fn read_main_ram(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(
                self.main_tlb
                    .read8(addr + i as u32)
                    .map_err(|_| CoreError::Lifecycle("read outside mapped guest memory"))?,
            );
        }
        Ok(out)
    }

    pub fn main_tlb(&self) -> &Vtlb {
        &self.main_tlb
    }

    pub fn main_tlb_mut(&mut self) -> &mut Vtlb {
        &mut self.main_tlb
    }

    fn vu_mem_view(&self) -> Result<VuMemView, CoreError> {
        let Some(vu) = self.memory.vu_mem.as_ref() else {
            return Err(CoreError::Lifecycle("vu memory not reserved"));
        };
        if !self.memory.is_committed() {
            return Err(CoreError::Lifecycle("vu memory not committed"));
        }
        let base = vu.base_ptr();
        Ok(VuMemView {
            micro: base,
            data: unsafe { base.add(MICRO_MEM_SIZE) },
        })
    }

    /// Rebuild both translation tables from the committed reserves. Runs on
    /// every commit/reset; mapping-control writes rebuild synchronously on
    /// their own through the handler effect.
    fn rebuild_memory_map(&mut self) -> Result<(), CoreError> {
        let Some(main_ram) = self.memory.main_ram.as_ref() else {
            return Err(CoreError::Lifecycle("memory map before reserve_all"));
        };
        let ram = main_ram.base_ptr();

        // Fresh control bank on every rebuild: a hardware reset clears the
        // mirror bit along with the mapping.
        let index = match self.mem_control {
            Some(index) => {
                let bank = MemControl {
                    ram,
                    self_index: index,
                    mirror: false,
                };
                self.main_tlb.replace_handler(index, Box::new(bank));
                index
            }
            None => {
                let index = self.main_tlb.handler_count();
                let bank = MemControl {
                    ram,
                    self_index: index,
                    mirror: false,
                };
                let registered = self.main_tlb.register_handler(Box::new(bank));
                debug_assert_eq!(registered, index);
                self.mem_control = Some(index);
                index
            }
        };
        self.main_tlb
            .set_layout(main_bus_layout(ram, index, false));

        let Some(iop_ram) = self.memory.iop_ram.as_ref() else {
            return Err(CoreError::Lifecycle("memory map before reserve_all"));
        };
        self.iop_tlb.set_layout(vec![MappedRegion {
            start: guest_map::IOP_RAM_BASE,
            len: host_map::IOP_RAM_SIZE as u32,
            target: RegionTarget::Direct {
                ptr: iop_ram.base_ptr(),
            },
        }]);
        Ok(())
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_ordering_enforced() {
        let mut sys = System::new(CoreConfig::default()).unwrap();
        // Commit before reserve is a caller error.
        assert!(matches!(
            sys.commit_all(),
            Err(CoreError::Lifecycle(_))
        ));
        sys.reserve_all().unwrap();
        sys.commit_all().unwrap();
        sys.reset_all().unwrap();
        sys.decommit_all();
        sys.release_all();
    }

    #[test]
    fn test_memory_control_remaps_synchronously() {
        let mut sys = System::new(CoreConfig::default()).unwrap();
        sys.reserve_all().unwrap();
        sys.commit_all().unwrap();

        sys.write_main_ram(0x100, &[1, 2, 3, 4]).unwrap();
        // Mirror disabled: the aliased address is unmapped.
        assert!(sys.main_tlb_mut().read32(guest_map::MAIN_RAM_MIRROR_BASE + 0x100).is_err());

        // One guest write to the control register; the new mapping must be
        // visible to the very next access.
        sys.main_tlb_mut()
            .write32(guest_map::MAIN_HW_BASE, 1)
            .unwrap();
        assert_eq!(
            sys.main_tlb_mut()
                .read32(guest_map::MAIN_RAM_MIRROR_BASE + 0x100)
                .unwrap(),
            u32::from_le_bytes([1, 2, 3, 4])
        );

        // And back off again.
        sys.main_tlb_mut()
            .write32(guest_map::MAIN_HW_BASE, 0)
            .unwrap();
        assert!(sys.main_tlb_mut().read32(guest_map::MAIN_RAM_MIRROR_BASE + 0x100).is_err());
    }
}
