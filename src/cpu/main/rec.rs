//! Main-CPU recompiler
//!
//! Translates guest basic blocks into x86-64 and caches them in the CPU's
//! executable reserve. The frontend decodes until a control-flow terminator
//! (folding the branch delay slot into the block) or the block size bound.
//! Blocks whose body stays inside the native subset get host code; everything
//! else keeps `native: None` and runs through the decoded path, with
//! identical observable semantics.
//!
//! Generated code keeps all guest state in memory: the only live host
//! register across a trampoline call is the context pointer, so exception
//! delivery at block exit needs no register flush.

use std::sync::Arc;

use tracing::{error, info};

use crate::cpu::main::{exec_decoded, MainState};
use crate::cpu::mips::{self, MipsInst};
use crate::cpu::{CpuEngine, ExecOutcome};
use crate::error::{CoreError, GuestFault};
use crate::rec::{BlockCache, NativeCode, RecBlock, WriteWatch, MAX_BLOCK_INSTS};
use crate::vmem::{host_map, RecompiledCodeReserve, VirtualMemoryManager};
use crate::vtlb::Vtlb;

/// Context handed to generated code. Layout is fixed; generated code reaches
/// guest state through `state` and stashes branch decisions in the scratch
/// fields.
#[repr(C)]
pub(crate) struct RecCtx {
    state: *mut MainState,
    vtlb: *mut Vtlb,
    watch: *mut WriteWatch,
    taken: u8,
    jump_target: u32,
}

impl RecCtx {
    fn new(state: &mut MainState, vtlb: &mut Vtlb, watch: &mut WriteWatch) -> Self {
        RecCtx {
            state,
            vtlb,
            watch,
            taken: 0,
            jump_target: 0,
        }
    }
}

pub struct MainRec {
    manager: Arc<VirtualMemoryManager>,
    reserve: Option<RecompiledCodeReserve>,
    reserve_bytes: usize,
    cache: BlockCache<MipsInst>,
    watch: WriteWatch,
}

impl MainRec {
    pub fn new(manager: Arc<VirtualMemoryManager>) -> Self {
        MainRec {
            manager,
            reserve: None,
            reserve_bytes: host_map::MAIN_REC_SIZE,
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

    pub fn cache_used(&self) -> usize {
        self.reserve.as_ref().map(|r| r.used()).unwrap_or(0)
    }

    /// Consume reserve space without recording a block. Exercises the
    /// exhaustion path in integration tests.
    pub fn consume_reserve(&mut self, bytes: usize) -> bool {
        match self.reserve.as_mut() {
            Some(r) => r.alloc(bytes).is_some(),
            None => false,
        }
    }

    /// Run translated code starting at `st.pc` for up to `max_cycles` guest
    /// instructions. Pending guest writes are drained before every lookup, so
    /// an invalidation is always observed before the affected block can be
    /// entered again.
    pub fn execute(&mut self, st: &mut MainState, vtlb: &mut Vtlb, max_cycles: u32) -> ExecOutcome {
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
                let mut ctx = RecCtx::new(st, vtlb, &mut self.watch);
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

    /// Decode one basic block and, when it stays inside the native subset,
    /// emit host code for it. A full reserve fails only this block.
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

impl CpuEngine for MainRec {
    fn name(&self) -> &'static str {
        "main recompiler"
    }

    fn reserve(&mut self) -> Result<(), CoreError> {
        let reserve = RecompiledCodeReserve::assign(
            "main recompiler cache",
            self.manager.clone(),
            host_map::MAIN_REC_OFFSET,
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

    use super::RecCtx;
    use crate::cpu::main::MainState;
    use crate::cpu::mips::{funct, op, regimm, MipsInst};

    const OFF_STATE: i32 = offset_of!(RecCtx, state) as i32;
    const OFF_TAKEN: i32 = offset_of!(RecCtx, taken) as i32;
    const OFF_JUMP: i32 = offset_of!(RecCtx, jump_target) as i32;
    const OFF_LO: i32 = offset_of!(MainState, lo) as i32;
    const OFF_HI: i32 = offset_of!(MainState, hi) as i32;

    fn gpr(r: u8) -> i32 {
        (offset_of!(MainState, gpr) + 8 * r as usize) as i32
    }

    // ---------------------------------------------------------------------
    // Memory trampolines. Generated loads and stores funnel through these;
    // a faulting access latches the guest exception and yields zero, and the
    // store path feeds the write watch exactly like the decoded path does.
    // ---------------------------------------------------------------------

    unsafe extern "sysv64" fn tramp_read8(ctx: *mut RecCtx, addr: u32) -> u8 {
        let ctx = &mut *ctx;
        match (*ctx.vtlb).read8(addr) {
            Ok(v) => v,
            Err(f) => {
                (*ctx.state).raise(f.into());
                0
            }
        }
    }

    unsafe extern "sysv64" fn tramp_read16(ctx: *mut RecCtx, addr: u32) -> u16 {
        let ctx = &mut *ctx;
        match (*ctx.vtlb).read16(addr) {
            Ok(v) => v,
            Err(f) => {
                (*ctx.state).raise(f.into());
                0
            }
        }
    }

    unsafe extern "sysv64" fn tramp_read32(ctx: *mut RecCtx, addr: u32) -> u32 {
        let ctx = &mut *ctx;
        match (*ctx.vtlb).read32(addr) {
            Ok(v) => v,
            Err(f) => {
                (*ctx.state).raise(f.into());
                0
            }
        }
    }

    unsafe extern "sysv64" fn tramp_read64(ctx: *mut RecCtx, addr: u32) -> u64 {
        let ctx = &mut *ctx;
        match (*ctx.vtlb).read64(addr) {
            Ok(v) => v,
            Err(f) => {
                (*ctx.state).raise(f.into());
                0
            }
        }
    }

    unsafe extern "sysv64" fn tramp_write8(ctx: *mut RecCtx, addr: u32, value: u8) {
        let ctx = &mut *ctx;
        match (*ctx.vtlb).write8(addr, value) {
            Ok(()) => (*ctx.watch).notify_write(addr),
            Err(f) => (*ctx.state).raise(f.into()),
        }
    }

    unsafe extern "sysv64" fn tramp_write16(ctx: *mut RecCtx, addr: u32, value: u16) {
        let ctx = &mut *ctx;
        match (*ctx.vtlb).write16(addr, value) {
            Ok(()) => (*ctx.watch).notify_write(addr),
            Err(f) => (*ctx.state).raise(f.into()),
        }
    }

    unsafe extern "sysv64" fn tramp_write32(ctx: *mut RecCtx, addr: u32, value: u32) {
        let ctx = &mut *ctx;
        match (*ctx.vtlb).write32(addr, value) {
            Ok(()) => (*ctx.watch).notify_write(addr),
            Err(f) => (*ctx.state).raise(f.into()),
        }
    }

    unsafe extern "sysv64" fn tramp_write64(ctx: *mut RecCtx, addr: u32, value: u64) {
        let ctx = &mut *ctx;
        match (*ctx.vtlb).write64(addr, value) {
            Ok(()) => (*ctx.watch).notify_write(addr),
            Err(f) => (*ctx.state).raise(f.into()),
        }
    }

    /// Block terminator shapes the emitter understands.
    enum Term {
        /// Size-capped block; falls through to the next sequential address.
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
                    | funct::DSLL
                    | funct::DSRL
                    | funct::DSRA
                    | funct::ADDU
                    | funct::SUBU
                    | funct::AND
                    | funct::OR
                    | funct::XOR
                    | funct::NOR
                    | funct::SLT
                    | funct::SLTU
                    | funct::DADDU
                    | funct::DSUBU
                    | funct::MFHI
                    | funct::MTHI
                    | funct::MFLO
                    | funct::MTLO
            ),
            op::ADDIU
            | op::SLTI
            | op::SLTIU
            | op::ANDI
            | op::ORI
            | op::XORI
            | op::LUI
            | op::DADDIU => true,
            op::LB | op::LBU | op::LH | op::LHU | op::LW | op::LWU | op::LD => true,
            op::SB | op::SH | op::SW | op::SD => true,
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

    /// Split the decoded list into body/terminator/delay-slot and verify that
    /// every piece is inside the native subset.
    fn classify(insts: &[MipsInst], start: u32) -> Option<(usize, Term, Option<MipsInst>)> {
        let n = insts.len();
        if n == 0 {
            return None;
        }

        // Terminator with its delay slot folded in as the final instruction.
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

        // No terminator at all: size-capped straight-line block.
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

    /// Compile a block to position-independent host code. Returns `None` when
    /// any instruction falls outside the native subset.
    pub(super) fn compile_block(insts: &[MipsInst], start: u32) -> Option<Vec<u8>> {
        let (body_len, term, delay) = classify(insts, start)?;
        let mut ops = Assembler::new().ok()?;

        // Entry: rbx pins the context across the whole block. A single push
        // keeps the stack 16-byte aligned at every trampoline call site.
        dynasm!(ops
            ; push rbx
            ; mov rbx, rdi
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
                let link = link as i32;
                let ra = gpr(31);
                dynasm!(ops
                    ; mov r8, [rbx + OFF_STATE]
                    ; mov eax, link
                    ; mov [r8 + ra], rax
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
                    ; mov r8, [rbx + OFF_STATE]
                    ; mov eax, [r8 + rs]
                    ; mov [rbx + OFF_JUMP], eax
                );
                emit_delay(&mut ops, delay);
                dynasm!(ops
                    ; mov eax, [rbx + OFF_JUMP]
                );
            }
            Term::Jalr { rs, rd, link } => {
                let rs = gpr(rs);
                dynasm!(ops
                    ; mov r8, [rbx + OFF_STATE]
                    ; mov eax, [r8 + rs]
                    ; mov [rbx + OFF_JUMP], eax
                );
                if rd != 0 {
                    let rd = gpr(rd);
                    let link = link as i32;
                    dynasm!(ops
                        ; mov ecx, link
                        ; mov [r8 + rd], rcx
                    );
                }
                emit_delay(&mut ops, delay);
                dynasm!(ops
                    ; mov eax, [rbx + OFF_JUMP]
                );
            }
            Term::Branch { inst, pc } => {
                emit_condition(&mut ops, &inst);
                emit_delay(&mut ops, delay);
                let taken = inst.branch_target(pc) as i32;
                let fall = (pc + 8) as i32;
                dynasm!(ops
                    ; movzx eax, BYTE [rbx + OFF_TAKEN]
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
            ; pop rbx
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

    /// Evaluate a branch condition against pre-delay-slot register values and
    /// park the result in the context.
    fn emit_condition(ops: &mut Assembler, inst: &MipsInst) {
        let rs = gpr(inst.rs);
        let rt = gpr(inst.rt);
        dynasm!(ops
            ; mov r8, [rbx + OFF_STATE]
            ; mov rax, [r8 + rs]
        );
        match inst.op {
            op::BEQ => {
                dynasm!(ops
                    ; cmp rax, [r8 + rt]
                    ; sete al
                );
            }
            op::BNE => {
                dynasm!(ops
                    ; cmp rax, [r8 + rt]
                    ; setne al
                );
            }
            op::BLEZ => {
                dynasm!(ops
                    ; cmp rax, 0
                    ; setle al
                );
            }
            op::BGTZ => {
                dynasm!(ops
                    ; cmp rax, 0
                    ; setg al
                );
            }
            op::REGIMM => {
                if inst.rt == regimm::BLTZ {
                    dynasm!(ops
                        ; cmp rax, 0
                        ; setl al
                    );
                } else {
                    dynasm!(ops
                        ; cmp rax, 0
                        ; setge al
                    );
                }
            }
            _ => unreachable!("unsupported branch reached the emitter"),
        }
        dynasm!(ops
            ; mov [rbx + OFF_TAKEN], al
        );
    }

    /// Emit one straight-line instruction. `classify` guarantees support.
    fn emit_simple(ops: &mut Assembler, inst: &MipsInst) {
        dynasm!(ops
            ; mov r8, [rbx + OFF_STATE]
        );
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
                    ; mov eax, [r8 + rs]
                    ; add eax, imm
                    ; movsxd rax, eax
                    ; mov [r8 + rt], rax
                );
            }
            op::DADDIU => {
                if inst.rt == 0 {
                    return;
                }
                let imm = inst.simm16() as i32;
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; add rax, imm
                    ; mov [r8 + rt], rax
                );
            }
            op::SLTI => {
                if inst.rt == 0 {
                    return;
                }
                let imm = inst.simm16() as i32;
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; cmp rax, imm
                    ; setl al
                    ; movzx eax, al
                    ; mov [r8 + rt], rax
                );
            }
            op::SLTIU => {
                if inst.rt == 0 {
                    return;
                }
                let imm = inst.simm16() as i32;
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; cmp rax, imm
                    ; setb al
                    ; movzx eax, al
                    ; mov [r8 + rt], rax
                );
            }
            op::ANDI => {
                if inst.rt == 0 {
                    return;
                }
                let imm = inst.imm16() as i32;
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; and rax, imm
                    ; mov [r8 + rt], rax
                );
            }
            op::ORI => {
                if inst.rt == 0 {
                    return;
                }
                let imm = inst.imm16() as i32;
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; or rax, imm
                    ; mov [r8 + rt], rax
                );
            }
            op::XORI => {
                if inst.rt == 0 {
                    return;
                }
                let imm = inst.imm16() as i32;
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; xor rax, imm
                    ; mov [r8 + rt], rax
                );
            }
            op::LUI => {
                if inst.rt == 0 {
                    return;
                }
                let v = ((inst.imm16() as u32) << 16) as i32;
                dynasm!(ops
                    ; mov rax, v
                    ; mov [r8 + rt], rax
                );
            }
            op::LB | op::LBU | op::LH | op::LHU | op::LW | op::LWU | op::LD => {
                emit_load(ops, inst);
            }
            op::SB | op::SH | op::SW | op::SD => emit_store(ops, inst),
            _ => unreachable!("unsupported opcode reached the emitter"),
        }
    }

    fn emit_special(ops: &mut Assembler, inst: &MipsInst) {
        let rs = gpr(inst.rs);
        let rt = gpr(inst.rt);
        let rd = gpr(inst.rd);
        let shamt = inst.shamt as i8;

        match inst.funct {
            funct::MTHI => {
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; mov [r8 + OFF_HI], rax
                );
                return;
            }
            funct::MTLO => {
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; mov [r8 + OFF_LO], rax
                );
                return;
            }
            _ => {}
        }
        // $zero writes are dropped, like the decoded path.
        if inst.rd == 0 {
            return;
        }
        match inst.funct {
            funct::SLL => {
                dynasm!(ops
                    ; mov eax, [r8 + rt]
                    ; shl eax, shamt
                    ; movsxd rax, eax
                    ; mov [r8 + rd], rax
                );
            }
            funct::SRL => {
                dynasm!(ops
                    ; mov eax, [r8 + rt]
                    ; shr eax, shamt
                    ; movsxd rax, eax
                    ; mov [r8 + rd], rax
                );
            }
            funct::SRA => {
                dynasm!(ops
                    ; mov eax, [r8 + rt]
                    ; sar eax, shamt
                    ; movsxd rax, eax
                    ; mov [r8 + rd], rax
                );
            }
            funct::SLLV => {
                dynasm!(ops
                    ; mov rcx, [r8 + rs]
                    ; mov eax, [r8 + rt]
                    ; shl eax, cl
                    ; movsxd rax, eax
                    ; mov [r8 + rd], rax
                );
            }
            funct::SRLV => {
                dynasm!(ops
                    ; mov rcx, [r8 + rs]
                    ; mov eax, [r8 + rt]
                    ; shr eax, cl
                    ; movsxd rax, eax
                    ; mov [r8 + rd], rax
                );
            }
            funct::SRAV => {
                dynasm!(ops
                    ; mov rcx, [r8 + rs]
                    ; mov eax, [r8 + rt]
                    ; sar eax, cl
                    ; movsxd rax, eax
                    ; mov [r8 + rd], rax
                );
            }
            funct::DSLL => {
                dynasm!(ops
                    ; mov rax, [r8 + rt]
                    ; shl rax, shamt
                    ; mov [r8 + rd], rax
                );
            }
            funct::DSRL => {
                dynasm!(ops
                    ; mov rax, [r8 + rt]
                    ; shr rax, shamt
                    ; mov [r8 + rd], rax
                );
            }
            funct::DSRA => {
                dynasm!(ops
                    ; mov rax, [r8 + rt]
                    ; sar rax, shamt
                    ; mov [r8 + rd], rax
                );
            }
            funct::ADDU => {
                dynasm!(ops
                    ; mov eax, [r8 + rs]
                    ; add eax, [r8 + rt]
                    ; movsxd rax, eax
                    ; mov [r8 + rd], rax
                );
            }
            funct::SUBU => {
                dynasm!(ops
                    ; mov eax, [r8 + rs]
                    ; sub eax, [r8 + rt]
                    ; movsxd rax, eax
                    ; mov [r8 + rd], rax
                );
            }
            funct::DADDU => {
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; add rax, [r8 + rt]
                    ; mov [r8 + rd], rax
                );
            }
            funct::DSUBU => {
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; sub rax, [r8 + rt]
                    ; mov [r8 + rd], rax
                );
            }
            funct::AND => {
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; and rax, [r8 + rt]
                    ; mov [r8 + rd], rax
                );
            }
            funct::OR => {
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; or rax, [r8 + rt]
                    ; mov [r8 + rd], rax
                );
            }
            funct::XOR => {
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; xor rax, [r8 + rt]
                    ; mov [r8 + rd], rax
                );
            }
            funct::NOR => {
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; or rax, [r8 + rt]
                    ; not rax
                    ; mov [r8 + rd], rax
                );
            }
            funct::SLT => {
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; cmp rax, [r8 + rt]
                    ; setl al
                    ; movzx eax, al
                    ; mov [r8 + rd], rax
                );
            }
            funct::SLTU => {
                dynasm!(ops
                    ; mov rax, [r8 + rs]
                    ; cmp rax, [r8 + rt]
                    ; setb al
                    ; movzx eax, al
                    ; mov [r8 + rd], rax
                );
            }
            funct::MFHI => {
                dynasm!(ops
                    ; mov rax, [r8 + OFF_HI]
                    ; mov [r8 + rd], rax
                );
            }
            funct::MFLO => {
                dynasm!(ops
                    ; mov rax, [r8 + OFF_LO]
                    ; mov [r8 + rd], rax
                );
            }
            _ => unreachable!("unsupported funct reached the emitter"),
        }
    }

    fn emit_addr(ops: &mut Assembler, inst: &MipsInst) {
        let base = gpr(inst.rs);
        let imm = inst.simm16() as i32;
        dynasm!(ops
            ; mov eax, [r8 + base]
            ; add eax, imm
            ; mov esi, eax
        );
    }

    fn emit_load(ops: &mut Assembler, inst: &MipsInst) {
        emit_addr(ops, inst);
        let helper: i64 = match inst.op {
            op::LB | op::LBU => tramp_read8 as usize as i64,
            op::LH | op::LHU => tramp_read16 as usize as i64,
            op::LW | op::LWU => tramp_read32 as usize as i64,
            _ => tramp_read64 as usize as i64,
        };
        dynasm!(ops
            ; mov rdi, rbx
            ; mov rax, QWORD helper
            ; call rax
        );
        // Width-correct extension of the returned value.
        match inst.op {
            op::LB => dynasm!(ops
                ; movsx rax, al
            ),
            op::LBU => dynasm!(ops
                ; movzx eax, al
            ),
            op::LH => dynasm!(ops
                ; movsx rax, ax
            ),
            op::LHU => dynasm!(ops
                ; movzx eax, ax
            ),
            op::LW => dynasm!(ops
                ; movsxd rax, eax
            ),
            op::LWU => dynasm!(ops
                ; mov eax, eax
            ),
            _ => {}
        }
        if inst.rt != 0 {
            let rt = gpr(inst.rt);
            dynasm!(ops
                ; mov r8, [rbx + OFF_STATE]
                ; mov [r8 + rt], rax
            );
        }
    }

    fn emit_store(ops: &mut Assembler, inst: &MipsInst) {
        emit_addr(ops, inst);
        let rt = gpr(inst.rt);
        match inst.op {
            op::SB => {
                dynasm!(ops
                    ; movzx edx, BYTE [r8 + rt]
                );
            }
            op::SH => {
                dynasm!(ops
                    ; movzx edx, WORD [r8 + rt]
                );
            }
            op::SW => {
                dynasm!(ops
                    ; mov edx, [r8 + rt]
                );
            }
            _ => {
                dynasm!(ops
                    ; mov rdx, [r8 + rt]
                );
            }
        }
        let helper: i64 = match inst.op {
            op::SB => tramp_write8 as usize as i64,
            op::SH => tramp_write16 as usize as i64,
            op::SW => tramp_write32 as usize as i64,
            _ => tramp_write64 as usize as i64,
        };
        dynasm!(ops
            ; mov rdi, rbx
            ; mov rax, QWORD helper
            ; call rax
        );
    }
}

#[cfg(not(all(feature = "jit-dynasm", target_arch = "x86_64")))]
mod emit {
    use crate::cpu::mips::MipsInst;

    /// No native backend on this host; every block runs the decoded path.
    pub(super) fn compile_block(_insts: &[MipsInst], _start: u32) -> Option<Vec<u8>> {
        None
    }
}
