//! I/O-CPU recompiler
//!
//! Same pipeline shape as the main CPU's recompiler with a leaner native
//! subset: ALU, shifts, and control flow compile to host code; memory
//! accesses and everything else run through the decoded path. The generated
//! blocks make no calls, so the whole block runs out of two scratch
//! registers with no stack traffic.

use std::sync::Arc;

use tracing::{error, info};

use crate::cpu::iop::{exec_decoded, IopState};
use crate::cpu::mips::{self, MipsInst};
use crate::cpu::{CpuEngine, ExecOutcome};
use crate::error::{CoreError, GuestFault};
use crate::rec::{BlockCache, NativeCode, RecBlock, WriteWatch, MAX_BLOCK_INSTS};
use crate::vmem::{host_map, RecompiledCodeReserve, VirtualMemoryManager};
use crate::vtlb::Vtlb;

#[repr(C)]
pub(crate) struct IopCtx {
    state: *mut IopState,
    taken: u8,
    jump_target: u32,
}

pub struct IopRec {
    manager: Arc<VirtualMemoryManager>,
    reserve: Option<RecompiledCodeReserve>,
    reserve_bytes: usize,
    cache: BlockCache<MipsInst>,
    watch: WriteWatch,
}

impl IopRec {
    pub fn new(manager: Arc<VirtualMemoryManager>) -> Self {
        IopRec {
            manager,
            reserve: None,
            reserve_bytes: host_map::IOP_REC_SIZE,
            cache: BlockCache::new(),
            watch: WriteWatch::new(),
        }
    }

    pub fn block_count(&self) -> usize {
        self.cache.len()
    }

    pub fn is_resident(&self, pc: u32) -> bool {
        self.cache.get(pc).is_some()
    }

    pub fn execute(&mut self, st: &mut IopState, vtlb: &mut Vtlb, max_cycles: u32) -> ExecOutcome {
        let mut retired = 0u32;
        let mut cache_full = false;
        let mut fetch_faults = 0u32;

        while retired < max_cycles {
            self.cache.process_writes(&mut self.watch);
            if st.pending.is_some() {
                st.deliver_exception();
            }
            let pc = st.pc;

            if self.cache.get(pc).is_none() {
                match self.translate(pc, vtlb) {
                    Ok((block, full)) => {
                        cache_full |= full;
                        self.cache.insert(block, &mut self.watch);
                    }
                    Err(fault) => {
                        fetch_faults += 1;
                        if fetch_faults > 1 {
                            break;
                        }
                        st.raise(fault.into());
                        continue;
                    }
                }
            }
            fetch_faults = 0;

            let Some(block) = self.cache.get(pc) else {
                break;
            };
            let len = block.instructions.len() as u32;
            if let Some(native) = block.native {
                let mut ctx = IopCtx {
                    state: st,
                    taken: 0,
                    jump_target: 0,
                };
                let next = unsafe { native.call(&mut ctx) };
                st.set_pc(next);
                st.cycle = st.cycle.wrapping_add(len as u64);
                retired += len;
            } else {
                retired += exec_decoded(
                    st,
                    vtlb,
                    Some(&mut self.watch),
                    &block.instructions,
                    block.start,
                );
            }
        }

        ExecOutcome {
            cycles: retired,
            cache_full,
        }
    }

    fn translate(
        &mut self,
        pc: u32,
        vtlb: &Vtlb,
    ) -> Result<(RecBlock<MipsInst>, bool), GuestFault> {
        let mut insts: Vec<MipsInst> = Vec::with_capacity(16);
        let mut addr = pc;
        loop {
            let raw = match vtlb.read_exec32(addr) {
                Ok(raw) => raw,
                Err(fault) if insts.is_empty() => return Err(fault),
                Err(_) => break,
            };
            let inst = MipsInst::decode(raw);
            insts.push(inst);
            addr = addr.wrapping_add(4);
            if mips::ends_block(&inst) {
                if mips::has_delay_slot(&inst) {
                    if let Ok(raw) = vtlb.read_exec32(addr) {
                        insts.push(MipsInst::decode(raw));
                        addr = addr.wrapping_add(4);
                    }
                }
                break;
            }
            if insts.len() >= MAX_BLOCK_INSTS {
                break;
            }
        }

        let mut cache_full = false;
        let native = match (emit::compile_block(&insts, pc), self.reserve.as_mut()) {
            (Some(bytes), Some(reserve)) => match reserve.alloc(bytes.len()) {
                Some(dst) => {
                    unsafe {
                        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
                    }
                    Some(NativeCode::new(dst, bytes.len()))
                }
                None => {
                    cache_full = true;
                    None
                }
            },
            _ => None,
        };

        Ok((
            RecBlock {
                start: pc,
                end: addr,
                instructions: insts,
                native,
            },
            cache_full,
        ))
    }
}

impl CpuEngine for IopRec {
    fn name(&self) -> &'static str {
        "iop recompiler"
    }

    fn reserve(&mut self) -> Result<(), CoreError> {
        let reserve = RecompiledCodeReserve::assign(
            "iop recompiler cache",
            self.manager.clone(),
            host_map::IOP_REC_OFFSET,
            self.reserve_bytes,
        )
        .map_err(|e| {
            error!(engine = self.name(), %e, "code cache reservation failed");
            e
        })?;
        info!(
            engine = self.name(),
            size = reserve.size(),
            "code cache reserved"
        );
        self.reserve = Some(reserve);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.cache.clear();
        self.watch.clear();
        if let Some(mut reserve) = self.reserve.take() {
            reserve.decommit();
        }
    }

    fn reset(&mut self) -> Result<(), CoreError> {
        self.cache.clear();
        self.watch.clear();
        match self.reserve.as_mut() {
            Some(reserve) => reserve.reset(),
            None => Ok(()),
        }
    }

    fn decommit_cache(&mut self) {
        self.cache.clear();
        self.watch.clear();
        if let Some(reserve) = self.reserve.as_mut() {
            reserve.decommit();
        }
    }

    fn cache_reserve_size(&self) -> usize {
        self.reserve
            .as_ref()
            .map(|r| r.size())
            .unwrap_or(self.reserve_bytes)
    }

    fn set_cache_reserve_size(&mut self, bytes: usize) -> Result<(), CoreError> {
        self.reserve_bytes = bytes;
        self.cache.clear();
        self.watch.clear();
        match self.reserve.as_mut() {
            Some(reserve) => reserve.shrink_to(bytes),
            None => Ok(()),
        }
    }
}

#[cfg(all(feature = "jit-dynasm", target_arch = "x86_64"))]
mod emit {
    use dynasm::dynasm;
    use dynasmrt::{x64::Assembler, DynasmApi, DynasmLabelApi};
    use std::mem::offset_of;

    use super::IopCtx;
    use crate::cpu::iop::IopState;
    use crate::cpu::mips::{funct, op, regimm, MipsInst};

    const OFF_STATE: i32 = offset_of!(IopCtx, state) as i32;
    const OFF_TAKEN: i32 = offset_of!(IopCtx, taken) as i32;
    const OFF_JUMP: i32 = offset_of!(IopCtx, jump_target) as i32;

    fn gpr(r: u8) -> i32 {
        (offset_of!(IopState, gpr) + 4 * r as usize) as i32
    }

    enum Term {
        Fallthrough,
        Jump { target: u32 },
        Jal { target: u32, link: u32 },
        Jr { rs: u8 },
        Jalr { rs: u8, rd: u8, link: u32 },
        Branch { inst: MipsInst, pc: u32 },
    }

    fn simple_supported(inst: &MipsInst) -> bool {
        match inst.op {
            op::SPECIAL => matches!(
                inst.funct,
                funct::SLL
                    | funct::SRL
                    | funct::SRA
                    | funct::SLLV
                    | funct::SRLV
                    | funct::SRAV
                    | funct::ADDU
                    | funct::SUBU
                    | funct::AND
                    | funct::OR
                    | funct::XOR
                    | funct::NOR
                    | funct::SLT
                    | funct::SLTU
            ),
            op::ADDIU | op::SLTI | op::SLTIU | op::ANDI | op::ORI | op::XORI | op::LUI => true,
            _ => false,
        }
    }

    fn branch_supported(inst: &MipsInst) -> bool {
        match inst.op {
            op::BEQ | op::BNE | op::BLEZ | op::BGTZ => true,
            op::REGIMM => matches!(inst.rt, regimm::BLTZ | regimm::BGEZ),
            _ => false,
        }
    }

    fn classify(insts: &[MipsInst], start: u32) -> Option<(usize, Term, Option<MipsInst>)> {
        let n = insts.len();
        if n == 0 {
            return None;
        }
        if n >= 2 && crate::cpu::mips::ends_block(&insts[n - 2]) {
            let term_inst = insts[n - 2];
            let delay = insts[n - 1];
            if crate::cpu::mips::ends_block(&delay) || !simple_supported(&delay) {
                return None;
            }
            let pc = start + ((n - 2) as u32) * 4;
            let term = match term_inst.op {
                op::J => Term::Jump {
                    target: term_inst.jump_target(pc),
                },
                op::JAL => Term::Jal {
                    target: term_inst.jump_target(pc),
                    link: pc + 8,
                },
                op::SPECIAL if term_inst.funct == funct::JR => Term::Jr { rs: term_inst.rs },
                op::SPECIAL if term_inst.funct == funct::JALR => Term::Jalr {
                    rs: term_inst.rs,
                    rd: term_inst.rd,
                    link: pc + 8,
                },
                _ if branch_supported(&term_inst) => Term::Branch {
                    inst: term_inst,
                    pc,
                },
                _ => return None,
            };
            for inst in &insts[..n - 2] {
                if !simple_supported(inst) {
                    return None;
                }
            }
            return Some((n - 2, term, Some(delay)));
        }
        if crate::cpu::mips::ends_block(&insts[n - 1]) {
            return None;
        }
        for inst in insts {
            if !simple_supported(inst) {
                return None;
            }
        }
        Some((n, Term::Fallthrough, None))
    }

    pub(super) fn compile_block(insts: &[MipsInst], start: u32) -> Option<Vec<u8>> {
        let (body_len, term, delay) = classify(insts, start)?;
        let mut ops = Assembler::new().ok()?;

        // rdi carries the context, rsi the state, for the whole block.
        dynasm!(ops
            ; mov rsi, [rdi + OFF_STATE]
        );

        for inst in &insts[..body_len] {
            emit_simple(&mut ops, inst);
        }

        match term {
            Term::Fallthrough => {
                let next = (start + (insts.len() as u32) * 4) as i32;
                dynasm!(ops
                    ; mov eax, next
                );
            }
            Term::Jump { target } => {
                emit_delay(&mut ops, delay);
                let target = target as i32;
                dynasm!(ops
                    ; mov eax, target
                );
            }
            Term::Jal { target, link } => {
                let ra = gpr(31);
                let link = link as i32;
                dynasm!(ops
                    ; mov DWORD [rsi + ra], link
                );
                emit_delay(&mut ops, delay);
                let target = target as i32;
                dynasm!(ops
                    ; mov eax, target
                );
            }
            Term::Jr { rs } => {
                let rs = gpr(rs);
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; mov [rdi + OFF_JUMP], eax
                );
                emit_delay(&mut ops, delay);
                dynasm!(ops
                    ; mov eax, [rdi + OFF_JUMP]
                );
            }
            Term::Jalr { rs, rd, link } => {
                let rs = gpr(rs);
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; mov [rdi + OFF_JUMP], eax
                );
                if rd != 0 {
                    let rd = gpr(rd);
                    let link = link as i32;
                    dynasm!(ops
                        ; mov DWORD [rsi + rd], link
                    );
                }
                emit_delay(&mut ops, delay);
                dynasm!(ops
                    ; mov eax, [rdi + OFF_JUMP]
                );
            }
            Term::Branch { inst, pc } => {
                emit_condition(&mut ops, &inst);
                emit_delay(&mut ops, delay);
                let taken = inst.branch_target(pc) as i32;
                let fall = (pc + 8) as i32;
                dynasm!(ops
                    ; movzx eax, BYTE [rdi + OFF_TAKEN]
                    ; test eax, eax
                    ; jz >skip
                    ; mov eax, taken
                    ; jmp >done
                    ; skip:
                    ; mov eax, fall
                    ; done:
                );
            }
        }

        dynasm!(ops
            ; ret
        );

        let buf = ops.finalize().ok()?;
        Some(buf.to_vec())
    }

    fn emit_delay(ops: &mut Assembler, delay: Option<MipsInst>) {
        if let Some(inst) = delay {
            emit_simple(ops, &inst);
        }
    }

    fn emit_condition(ops: &mut Assembler, inst: &MipsInst) {
        let rs = gpr(inst.rs);
        let rt = gpr(inst.rt);
        dynasm!(ops
            ; mov eax, [rsi + rs]
        );
        match inst.op {
            op::BEQ => {
                dynasm!(ops
                    ; cmp eax, [rsi + rt]
                    ; sete al
                );
            }
            op::BNE => {
                dynasm!(ops
                    ; cmp eax, [rsi + rt]
                    ; setne al
                );
            }
            op::BLEZ => {
                dynasm!(ops
                    ; cmp eax, 0
                    ; setle al
                );
            }
            op::BGTZ => {
                dynasm!(ops
                    ; cmp eax, 0
                    ; setg al
                );
            }
            op::REGIMM => {
                if inst.rt == regimm::BLTZ {
                    dynasm!(ops
                        ; cmp eax, 0
                        ; setl al
                    );
                } else {
                    dynasm!(ops
                        ; cmp eax, 0
                        ; setge al
                    );
                }
            }
            _ => unreachable!("unsupported branch reached the emitter"),
        }
        dynasm!(ops
            ; mov [rdi + OFF_TAKEN], al
        );
    }

    fn emit_simple(ops: &mut Assembler, inst: &MipsInst) {
        let rs = gpr(inst.rs);
        let rt = gpr(inst.rt);
        match inst.op {
            op::SPECIAL => emit_special(ops, inst),
            op::ADDIU => {
                if inst.rt == 0 {
                    return;
                }
                let imm = inst.simm16() as i32;
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; add eax, imm
                    ; mov [rsi + rt], eax
                );
            }
            op::SLTI => {
                if inst.rt == 0 {
                    return;
                }
                let imm = inst.simm16() as i32;
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; cmp eax, imm
                    ; setl al
                    ; movzx eax, al
                    ; mov [rsi + rt], eax
                );
            }
            op::SLTIU => {
                if inst.rt == 0 {
                    return;
                }
                let imm = inst.simm16() as i32;
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; cmp eax, imm
                    ; setb al
                    ; movzx eax, al
                    ; mov [rsi + rt], eax
                );
            }
            op::ANDI => {
                if inst.rt == 0 {
                    return;
                }
                let imm = inst.imm16() as i32;
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; and eax, imm
                    ; mov [rsi + rt], eax
                );
            }
            op::ORI => {
                if inst.rt == 0 {
                    return;
                }
                let imm = inst.imm16() as i32;
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; or eax, imm
                    ; mov [rsi + rt], eax
                );
            }
            op::XORI => {
                if inst.rt == 0 {
                    return;
                }
                let imm = inst.imm16() as i32;
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; xor eax, imm
                    ; mov [rsi + rt], eax
                );
            }
            op::LUI => {
                if inst.rt == 0 {
                    return;
                }
                let v = ((inst.imm16() as u32) << 16) as i32;
                dynasm!(ops
                    ; mov DWORD [rsi + rt], v
                );
            }
            _ => unreachable!("unsupported opcode reached the emitter"),
        }
    }

    fn emit_special(ops: &mut Assembler, inst: &MipsInst) {
        if inst.rd == 0 {
            return;
        }
        let rs = gpr(inst.rs);
        let rt = gpr(inst.rt);
        let rd = gpr(inst.rd);
        let shamt = inst.shamt as i8;
        match inst.funct {
            funct::SLL => {
                dynasm!(ops
                    ; mov eax, [rsi + rt]
                    ; shl eax, shamt
                    ; mov [rsi + rd], eax
                );
            }
            funct::SRL => {
                dynasm!(ops
                    ; mov eax, [rsi + rt]
                    ; shr eax, shamt
                    ; mov [rsi + rd], eax
                );
            }
            funct::SRA => {
                dynasm!(ops
                    ; mov eax, [rsi + rt]
                    ; sar eax, shamt
                    ; mov [rsi + rd], eax
                );
            }
            funct::SLLV => {
                dynasm!(ops
                    ; mov ecx, [rsi + rs]
                    ; mov eax, [rsi + rt]
                    ; shl eax, cl
                    ; mov [rsi + rd], eax
                );
            }
            funct::SRLV => {
                dynasm!(ops
                    ; mov ecx, [rsi + rs]
                    ; mov eax, [rsi + rt]
                    ; shr eax, cl
                    ; mov [rsi + rd], eax
                );
            }
            funct::SRAV => {
                dynasm!(ops
                    ; mov ecx, [rsi + rs]
                    ; mov eax, [rsi + rt]
                    ; sar eax, cl
                    ; mov [rsi + rd], eax
                );
            }
            funct::ADDU => {
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; add eax, [rsi + rt]
                    ; mov [rsi + rd], eax
                );
            }
            funct::SUBU => {
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; sub eax, [rsi + rt]
                    ; mov [rsi + rd], eax
                );
            }
            funct::AND => {
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; and eax, [rsi + rt]
                    ; mov [rsi + rd], eax
                );
            }
            funct::OR => {
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; or eax, [rsi + rt]
                    ; mov [rsi + rd], eax
                );
            }
            funct::XOR => {
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; xor eax, [rsi + rt]
                    ; mov [rsi + rd], eax
                );
            }
            funct::NOR => {
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; or eax, [rsi + rt]
                    ; not eax
                    ; mov [rsi + rd], eax
                );
            }
            funct::SLT => {
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; cmp eax, [rsi + rt]
                    ; setl al
                    ; movzx eax, al
                    ; mov [rsi + rd], eax
                );
            }
            funct::SLTU => {
                dynasm!(ops
                    ; mov eax, [rsi + rs]
                    ; cmp eax, [rsi + rt]
                    ; setb al
                    ; movzx eax, al
                    ; mov [rsi + rd], eax
                );
            }
            _ => unreachable!("unsupported funct reached the emitter"),
        }
    }
}

#[cfg(not(all(feature = "jit-dynasm", target_arch = "x86_64")))]
mod emit {
    use crate::cpu::mips::MipsInst;

    pub(super) fn compile_block(_insts: &[MipsInst], _start: u32) -> Option<Vec<u8>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::iop::IopInterpreter;
    use crate::cpu::mips::{asm, op};
    use crate::vmem::sys_reserve_main_memory;
    use crate::vtlb::{MappedRegion, RegionTarget};

    fn setup() -> (IopRec, IopState, Vtlb, Arc<VirtualMemoryManager>) {
        let mgr = sys_reserve_main_memory(host_map::TOTAL_SIZE).unwrap();
        let mut rec = IopRec::new(mgr.clone());
        rec.reserve().unwrap();
        mgr.commit_pages(
            host_map::IOP_RAM_OFFSET,
            host_map::IOP_RAM_SIZE,
            crate::vmem::PageProtection::rw(),
        )
        .unwrap();
        let ram = unsafe { mgr.base().add(host_map::IOP_RAM_OFFSET) };
        let mut tlb = Vtlb::new();
        tlb.set_layout(vec![MappedRegion {
            start: 0,
            len: host_map::IOP_RAM_SIZE as u32,
            target: RegionTarget::Direct { ptr: ram },
        }]);
        (rec, IopState::new(), tlb, mgr)
    }

    #[test]
    fn test_rec_matches_interpreter() {
        let (mut rec, mut st, mut tlb, _mgr) = setup();
        let program = [
            asm::i_type(op::ORI, 0, 1, 0x1234),
            asm::i_type(op::ADDIU, 1, 2, 0xFFFF),
            asm::r_type(crate::cpu::mips::funct::SLTU, 2, 1, 3, 0),
            asm::j_type(op::J, 0x200),
            asm::i_type(op::ADDIU, 0, 4, 1),
        ];
        for (i, w) in program.iter().enumerate() {
            tlb.write32((i as u32) * 4, *w).unwrap();
        }

        st.set_pc(0);
        rec.execute(&mut st, &mut tlb, program.len() as u32);
        assert!(rec.is_resident(0));

        let mut st2 = IopState::new();
        st2.set_pc(0);
        let mut interp = IopInterpreter::new();
        interp.execute(&mut st2, &mut tlb, program.len() as u32);

        assert_eq!(st.gpr, st2.gpr);
        assert_eq!(st.pc, st2.pc);
    }

    #[test]
    fn test_memory_blocks_take_decoded_path() {
        let (mut rec, mut st, mut tlb, _mgr) = setup();
        let program = [
            asm::i_type(op::ADDIU, 0, 1, 0x80),
            asm::i_type(op::SW, 0, 1, 0x100),
            asm::i_type(op::LW, 0, 2, 0x100),
            asm::j_type(op::J, 0x1000),
            asm::nop(),
        ];
        for (i, w) in program.iter().enumerate() {
            tlb.write32((i as u32) * 4, *w).unwrap();
        }
        st.set_pc(0);
        rec.execute(&mut st, &mut tlb, program.len() as u32);
        assert_eq!(st.gpr[2], 0x80);
        let block = rec.cache.get(0).unwrap();
        assert!(block.native.is_none());
    }
}
