//! I/O CPU (32-bit MIPS-like)
//!
//! Shares the instruction decode with the main CPU but runs a 32-bit
//! register file and none of the doubleword forms.

pub mod rec;

use crate::cpu::mips::{funct, op, regimm, MipsInst};
use crate::cpu::{CpuEngine, ExecOutcome, GuestException, EXCEPTION_VECTOR};
use crate::error::CoreError;
use crate::rec::WriteWatch;
use crate::vtlb::Vtlb;

/// Architectural state, laid out for constant-offset access from generated
/// code.
#[repr(C)]
pub struct IopState {
    pub gpr: [u32; 32],
    pub lo: u32,
    pub hi: u32,
    pub pc: u32,
    pub next_pc: u32,
    pub epc: u32,
    pub cause: u32,
    pub cycle: u64,
    pub pending: Option<GuestException>,
}

impl Default for IopState {
    fn default() -> Self {
        IopState::new()
    }
}

impl IopState {
    pub fn new() -> Self {
        IopState {
            gpr: [0; 32],
            lo: 0,
            hi: 0,
            pc: 0,
            next_pc: 4,
            epc: 0,
            cause: 0,
            cycle: 0,
            pending: None,
        }
    }

    pub fn reset(&mut self) {
        *self = IopState::new();
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
        self.next_pc = pc.wrapping_add(4);
    }

    #[inline(always)]
    pub fn read_gpr(&self, r: u8) -> u32 {
        self.gpr[r as usize]
    }

    #[inline(always)]
    pub fn write_gpr(&mut self, r: u8, v: u32) {
        if r != 0 {
            self.gpr[r as usize] = v;
        }
    }

    #[inline(always)]
    pub fn raise(&mut self, e: GuestException) {
        if self.pending.is_none() {
            self.pending = Some(e);
        }
    }

    pub fn deliver_exception(&mut self) {
        if let Some(e) = self.pending.take() {
            self.cause = e.cause_code();
            self.epc = self.pc;
            self.pc = EXCEPTION_VECTOR;
            self.next_pc = EXCEPTION_VECTOR.wrapping_add(4);
        }
    }
}

pub(crate) fn step_one(
    st: &mut IopState,
    inst: MipsInst,
    vtlb: &mut Vtlb,
    watch: Option<&mut WriteWatch>,
) -> Result<(), GuestException> {
    let pc = st.pc;
    st.pc = st.next_pc;
    st.next_pc = st.next_pc.wrapping_add(4);

    match inst.op {
        op::SPECIAL => match inst.funct {
            funct::SLL => st.write_gpr(inst.rd, st.read_gpr(inst.rt) << inst.shamt),
            funct::SRL => st.write_gpr(inst.rd, st.read_gpr(inst.rt) >> inst.shamt),
            funct::SRA => {
                st.write_gpr(inst.rd, ((st.read_gpr(inst.rt) as i32) >> inst.shamt) as u32)
            }
            funct::SLLV => {
                st.write_gpr(inst.rd, st.read_gpr(inst.rt) << (st.read_gpr(inst.rs) & 31))
            }
            funct::SRLV => {
                st.write_gpr(inst.rd, st.read_gpr(inst.rt) >> (st.read_gpr(inst.rs) & 31))
            }
            funct::SRAV => st.write_gpr(
                inst.rd,
                ((st.read_gpr(inst.rt) as i32) >> (st.read_gpr(inst.rs) & 31)) as u32,
            ),
            funct::JR => st.next_pc = st.read_gpr(inst.rs),
            funct::JALR => {
                let target = st.read_gpr(inst.rs);
                st.write_gpr(inst.rd, pc + 8);
                st.next_pc = target;
            }
            funct::SYSCALL => return Err(GuestException::Syscall),
            funct::BREAK => return Err(GuestException::Break),
            funct::MFHI => st.write_gpr(inst.rd, st.hi),
            funct::MTHI => st.hi = st.read_gpr(inst.rs),
            funct::MFLO => st.write_gpr(inst.rd, st.lo),
            funct::MTLO => st.lo = st.read_gpr(inst.rs),
            funct::MULT => {
                let prod = (st.read_gpr(inst.rs) as i32 as i64) * (st.read_gpr(inst.rt) as i32 as i64);
                st.lo = prod as u32;
                st.hi = (prod >> 32) as u32;
            }
            funct::MULTU => {
                let prod = (st.read_gpr(inst.rs) as u64) * (st.read_gpr(inst.rt) as u64);
                st.lo = prod as u32;
                st.hi = (prod >> 32) as u32;
            }
            funct::DIV => {
                let n = st.read_gpr(inst.rs) as i32;
                let d = st.read_gpr(inst.rt) as i32;
                if d == 0 {
                    st.lo = if n >= 0 { u32::MAX } else { 1 };
                    st.hi = n as u32;
                } else {
                    st.lo = n.wrapping_div(d) as u32;
                    st.hi = n.wrapping_rem(d) as u32;
                }
            }
            funct::DIVU => {
                let n = st.read_gpr(inst.rs);
                let d = st.read_gpr(inst.rt);
                if d == 0 {
                    st.lo = u32::MAX;
                    st.hi = n;
                } else {
                    st.lo = n / d;
                    st.hi = n % d;
                }
            }
            funct::ADD => {
                let a = st.read_gpr(inst.rs) as i32;
                let b = st.read_gpr(inst.rt) as i32;
                match a.checked_add(b) {
                    Some(v) => st.write_gpr(inst.rd, v as u32),
                    None => return Err(GuestException::Overflow),
                }
            }
            funct::ADDU => st.write_gpr(
                inst.rd,
                st.read_gpr(inst.rs).wrapping_add(st.read_gpr(inst.rt)),
            ),
            funct::SUB => {
                let a = st.read_gpr(inst.rs) as i32;
                let b = st.read_gpr(inst.rt) as i32;
                match a.checked_sub(b) {
                    Some(v) => st.write_gpr(inst.rd, v as u32),
                    None => return Err(GuestException::Overflow),
                }
            }
            funct::SUBU => st.write_gpr(
                inst.rd,
                st.read_gpr(inst.rs).wrapping_sub(st.read_gpr(inst.rt)),
            ),
            funct::AND => st.write_gpr(inst.rd, st.read_gpr(inst.rs) & st.read_gpr(inst.rt)),
            funct::OR => st.write_gpr(inst.rd, st.read_gpr(inst.rs) | st.read_gpr(inst.rt)),
            funct::XOR => st.write_gpr(inst.rd, st.read_gpr(inst.rs) ^ st.read_gpr(inst.rt)),
            funct::NOR => st.write_gpr(inst.rd, !(st.read_gpr(inst.rs) | st.read_gpr(inst.rt))),
            funct::SLT => st.write_gpr(
                inst.rd,
                ((st.read_gpr(inst.rs) as i32) < (st.read_gpr(inst.rt) as i32)) as u32,
            ),
            funct::SLTU => {
                st.write_gpr(inst.rd, (st.read_gpr(inst.rs) < st.read_gpr(inst.rt)) as u32)
            }
            _ => return Err(GuestException::ReservedInstruction),
        },
        op::REGIMM => match inst.rt {
            regimm::BLTZ => {
                if (st.read_gpr(inst.rs) as i32) < 0 {
                    st.next_pc = inst.branch_target(pc);
                }
            }
            regimm::BGEZ => {
                if (st.read_gpr(inst.rs) as i32) >= 0 {
                    st.next_pc = inst.branch_target(pc);
                }
            }
            _ => return Err(GuestException::ReservedInstruction),
        },
        op::J => st.next_pc = inst.jump_target(pc),
        op::JAL => {
            st.write_gpr(31, pc + 8);
            st.next_pc = inst.jump_target(pc);
        }
        op::BEQ => {
            if st.read_gpr(inst.rs) == st.read_gpr(inst.rt) {
                st.next_pc = inst.branch_target(pc);
            }
        }
        op::BNE => {
            if st.read_gpr(inst.rs) != st.read_gpr(inst.rt) {
                st.next_pc = inst.branch_target(pc);
            }
        }
        op::BLEZ => {
            if (st.read_gpr(inst.rs) as i32) <= 0 {
                st.next_pc = inst.branch_target(pc);
            }
        }
        op::BGTZ => {
            if (st.read_gpr(inst.rs) as i32) > 0 {
                st.next_pc = inst.branch_target(pc);
            }
        }
        op::ADDI => {
            let a = st.read_gpr(inst.rs) as i32;
            match a.checked_add(inst.simm16() as i32) {
                Some(v) => st.write_gpr(inst.rt, v as u32),
                None => return Err(GuestException::Overflow),
            }
        }
        op::ADDIU => st.write_gpr(
            inst.rt,
            st.read_gpr(inst.rs).wrapping_add(inst.simm16() as i32 as u32),
        ),
        op::SLTI => st.write_gpr(
            inst.rt,
            ((st.read_gpr(inst.rs) as i32) < inst.simm16() as i32) as u32,
        ),
        op::SLTIU => st.write_gpr(
            inst.rt,
            (st.read_gpr(inst.rs) < inst.simm16() as i32 as u32) as u32,
        ),
        op::ANDI => st.write_gpr(inst.rt, st.read_gpr(inst.rs) & inst.imm16() as u32),
        op::ORI => st.write_gpr(inst.rt, st.read_gpr(inst.rs) | inst.imm16() as u32),
        op::XORI => st.write_gpr(inst.rt, st.read_gpr(inst.rs) ^ inst.imm16() as u32),
        op::LUI => st.write_gpr(inst.rt, (inst.imm16() as u32) << 16),
        op::LB => {
            let addr = mem_addr(st, inst);
            let v = vtlb.read8(addr)?;
            st.write_gpr(inst.rt, v as i8 as i32 as u32);
        }
        op::LBU => {
            let addr = mem_addr(st, inst);
            let v = vtlb.read8(addr)?;
            st.write_gpr(inst.rt, v as u32);
        }
        op::LH => {
            let addr = mem_addr(st, inst);
            let v = vtlb.read16(addr)?;
            st.write_gpr(inst.rt, v as i16 as i32 as u32);
        }
        op::LHU => {
            let addr = mem_addr(st, inst);
            let v = vtlb.read16(addr)?;
            st.write_gpr(inst.rt, v as u32);
        }
        op::LW => {
            let addr = mem_addr(st, inst);
            let v = vtlb.read32(addr)?;
            st.write_gpr(inst.rt, v);
        }
        op::SB => {
            let addr = mem_addr(st, inst);
            vtlb.write8(addr, st.read_gpr(inst.rt) as u8)?;
            notify(watch, addr);
        }
        op::SH => {
            let addr = mem_addr(st, inst);
            vtlb.write16(addr, st.read_gpr(inst.rt) as u16)?;
            notify(watch, addr);
        }
        op::SW => {
            let addr = mem_addr(st, inst);
            vtlb.write32(addr, st.read_gpr(inst.rt))?;
            notify(watch, addr);
        }
        _ => return Err(GuestException::ReservedInstruction),
    }
    Ok(())
}

#[inline(always)]
fn mem_addr(st: &IopState, inst: MipsInst) -> u32 {
    st.read_gpr(inst.rs).wrapping_add(inst.simm16() as i32 as u32)
}

#[inline(always)]
fn notify(watch: Option<&mut WriteWatch>, addr: u32) {
    if let Some(w) = watch {
        w.notify_write(addr);
    }
}

pub(crate) fn exec_decoded(
    st: &mut IopState,
    vtlb: &mut Vtlb,
    mut watch: Option<&mut WriteWatch>,
    insts: &[MipsInst],
    start: u32,
) -> u32 {
    let end = start + (insts.len() as u32) * 4;
    let mut retired = 0u32;
    while retired < insts.len() as u32 && st.pending.is_none() {
        let pc = st.pc;
        if pc < start || pc >= end {
            break;
        }
        let inst = insts[((pc - start) >> 2) as usize];
        if let Err(e) = step_one(st, inst, vtlb, watch.as_deref_mut()) {
            st.raise(e);
        }
        retired += 1;
    }
    st.cycle = st.cycle.wrapping_add(retired as u64);
    retired
}

#[derive(Default)]
pub struct IopInterpreter;

impl IopInterpreter {
    pub fn new() -> Self {
        IopInterpreter
    }

    pub fn execute(&mut self, st: &mut IopState, vtlb: &mut Vtlb, max_cycles: u32) -> ExecOutcome {
        let mut retired = 0u32;
        let mut fetch_faults = 0u32;
        while retired < max_cycles {
            if st.pending.is_some() {
                st.deliver_exception();
            }
            let raw = match vtlb.read_exec32(st.pc) {
                Ok(raw) => raw,
                Err(fault) => {
                    fetch_faults += 1;
                    if fetch_faults > 1 {
                        break;
                    }
                    st.raise(fault.into());
                    continue;
                }
            };
            fetch_faults = 0;
            let inst = MipsInst::decode(raw);
            if let Err(e) = step_one(st, inst, vtlb, None) {
                st.raise(e);
            }
            retired += 1;
        }
        st.cycle = st.cycle.wrapping_add(retired as u64);
        ExecOutcome {
            cycles: retired,
            cache_full: false,
        }
    }
}

impl CpuEngine for IopInterpreter {
    fn name(&self) -> &'static str {
        "iop interpreter"
    }

    fn reserve(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    fn shutdown(&mut self) {}

    fn reset(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::mips::asm;
    use crate::vtlb::{MappedRegion, RegionTarget, PAGE_SIZE};

    #[repr(align(4096))]
    struct Ram([u8; 2 * PAGE_SIZE as usize]);

    fn setup() -> (Box<Ram>, Vtlb) {
        let mut ram = Box::new(Ram([0; 2 * PAGE_SIZE as usize]));
        let mut tlb = Vtlb::new();
        tlb.set_layout(vec![MappedRegion {
            start: 0,
            len: 2 * PAGE_SIZE,
            target: RegionTarget::Direct {
                ptr: ram.0.as_mut_ptr(),
            },
        }]);
        (ram, tlb)
    }

    #[test]
    fn test_no_sign_extension_past_32_bits() {
        let (_ram, mut tlb) = setup();
        let mut st = IopState::new();
        tlb.write32(0, asm::i_type(op::ADDIU, 0, 1, 0xFFFF)).unwrap();
        let mut interp = IopInterpreter::new();
        interp.execute(&mut st, &mut tlb, 1);
        assert_eq!(st.gpr[1], 0xFFFF_FFFF);
    }

    #[test]
    fn test_doubleword_forms_are_reserved() {
        let (_ram, mut tlb) = setup();
        let mut st = IopState::new();
        tlb.write32(0, asm::i_type(op::DADDIU, 0, 1, 1)).unwrap();
        let mut interp = IopInterpreter::new();
        interp.execute(&mut st, &mut tlb, 1);
        assert_eq!(st.pending, Some(GuestException::ReservedInstruction));
    }

    #[test]
    fn test_jal_links_return_address() {
        let (_ram, mut tlb) = setup();
        let mut st = IopState::new();
        tlb.write32(0, asm::j_type(op::JAL, 0x100)).unwrap();
        let mut interp = IopInterpreter::new();
        interp.execute(&mut st, &mut tlb, 2);
        assert_eq!(st.gpr[31], 8);
        assert_eq!(st.pc, 0x100);
    }
}
