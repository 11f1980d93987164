//! Vector-unit micro recompiler
//!
//! Same block pipeline as the scalar CPUs, keyed by micro-memory address.
//! Microprograms in our subset are straight-line, so a block is simply the
//! pair run up to (and including) the end-flag delay pair. Full-mask upper
//! ALU ops and the integer immediate ops compile to SSE; data-memory moves
//! take the decoded path.
//!
//! Invalidation is driven by microprogram uploads: the owner notifies the
//! written range and affected blocks are evicted before the next dispatch.

use std::sync::Arc;

use tracing::{error, info};

use crate::cpu::vu::{exec_pair, VuInstPair, VuMemView, VuState, MICRO_PC_MASK};
use crate::cpu::{CpuEngine, ExecOutcome};
use crate::error::CoreError;
use crate::rec::{BlockCache, NativeCode, RecBlock, WriteWatch};
use crate::vmem::{host_map, RecompiledCodeReserve, VirtualMemoryManager};

const MAX_BLOCK_PAIRS: usize = 32;

fn has_end(pairs: &[VuInstPair]) -> bool {
    pairs.len() >= 2 && pairs[pairs.len() - 2].end_flag()
}

pub struct VuRec {
    manager: Arc<VirtualMemoryManager>,
    reserve: Option<RecompiledCodeReserve>,
    reserve_bytes: usize,
    cache: BlockCache<VuInstPair>,
    watch: WriteWatch,
}

impl VuRec {
    pub fn new(manager: Arc<VirtualMemoryManager>) -> Self {
        VuRec {
            manager,
            reserve: None,
            reserve_bytes: host_map::VU_REC_SIZE,
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

    /// A microprogram upload landed in `[start, end)` of micro memory.
    pub fn notify_micro_write_range(&mut self, start: u32, end: u32) {
        self.watch.notify_range(start, end);
    }

    /// Dispatch the microprogram at `addr`, running translated pair blocks
    /// until the end-flag delay pair retires or `max_pairs` is reached.
    pub fn execute_micro(
        &mut self,
        st: &mut VuState,
        mem: &VuMemView,
        addr: u32,
        max_pairs: u32,
    ) -> ExecOutcome {
        st.pc = addr & MICRO_PC_MASK;
        st.running = true;
        let mut executed = 0u32;
        let mut cache_full = false;

        while st.running && executed < max_pairs {
            self.cache.process_writes(&mut self.watch);
            let pc = st.pc;

            if self.cache.get(pc).is_none() {
                let (block, full) = self.translate(pc, mem);
                cache_full |= full;
                self.cache.insert(block, &mut self.watch);
            }
            let Some(block) = self.cache.get(pc) else {
                break;
            };

            let len = block.instructions.len() as u32;
            let ends = has_end(&block.instructions);
            if let Some(native) = block.native {
                let next = unsafe { native.call(st as *mut VuState) };
                st.pc = next & MICRO_PC_MASK;
                st.pairs_executed = st.pairs_executed.wrapping_add(len as u64);
            } else {
                for pair in &block.instructions {
                    exec_pair(st, mem, *pair);
                }
                st.pc = (block.start + 8 * len) & MICRO_PC_MASK;
            }
            executed += len;
            if ends {
                st.running = false;
            }
        }

        ExecOutcome {
            cycles: executed,
            cache_full,
        }
    }

    fn translate(&mut self, pc: u32, mem: &VuMemView) -> (RecBlock<VuInstPair>, bool) {
        let mut pairs: Vec<VuInstPair> = Vec::with_capacity(8);
        let mut addr = pc;
        let mut end_seen = false;
        loop {
            let pair = mem.read_pair(addr);
            pairs.push(pair);
            addr = addr.wrapping_add(8);
            if end_seen {
                break;
            }
            if pair.end_flag() {
                // Always pull in the delay pair, even past the size bound.
                end_seen = true;
                continue;
            }
            if pairs.len() >= MAX_BLOCK_PAIRS {
                break;
            }
        }

        let mut cache_full = false;
        let native = match (emit::compile_block(&pairs, addr), self.reserve.as_mut()) {
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

        (
            RecBlock {
                start: pc,
                end: addr,
                instructions: pairs,
                native,
            },
            cache_full,
        )
    }
}

impl CpuEngine for VuRec {
    fn name(&self) -> &'static str {
        "vu recompiler"
    }

    fn reserve(&mut self) -> Result<(), CoreError> {
        let reserve = RecompiledCodeReserve::assign(
            "vu recompiler cache",
            self.manager.clone(),
            host_map::VU_REC_OFFSET,
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
    use dynasmrt::{x64::Assembler, DynasmApi};
    use std::mem::offset_of;

    use crate::cpu::vu::{lower_op, upper_op, VuInstPair, VuState};

    fn vf(r: usize) -> i32 {
        (offset_of!(VuState, vf) + 16 * r) as i32
    }

    fn vi(r: usize) -> i32 {
        (offset_of!(VuState, vi) + 2 * r) as i32
    }

    fn pair_supported(pair: &VuInstPair) -> bool {
        let upper_ok = match pair.upper_op() {
            upper_op::NOP => true,
            upper_op::ADD | upper_op::SUB | upper_op::MUL | upper_op::MAX | upper_op::MIN => {
                // Partial destination masks need lane merging; leave them to
                // the decoded path.
                pair.dest() == 0xF
            }
            _ => false,
        };
        let lower_ok = matches!(
            pair.lower_op(),
            lower_op::NOP | lower_op::IADDIU | lower_op::ISUBIU
        );
        upper_ok && lower_ok
    }

    /// Compile a pair run. `end_pc` is the micro address after the block.
    pub(super) fn compile_block(pairs: &[VuInstPair], end_pc: u32) -> Option<Vec<u8>> {
        if pairs.is_empty() || !pairs.iter().all(pair_supported) {
            return None;
        }
        let mut ops = Assembler::new().ok()?;

        // rdi = vector-unit state for the whole block; no calls are made.
        for pair in pairs {
            emit_upper(&mut ops, pair);
            emit_lower(&mut ops, pair);
        }
        let end_pc = end_pc as i32;
        dynasm!(ops
            ; mov eax, end_pc
            ; ret
        );

        let buf = ops.finalize().ok()?;
        Some(buf.to_vec())
    }

    fn emit_upper(ops: &mut Assembler, pair: &VuInstPair) {
        let op = pair.upper_op();
        if op == upper_op::NOP {
            return;
        }
        let src_a = vf(pair.fs());
        let src_b = vf(pair.ft());
        let dst = vf(pair.fd());
        dynasm!(ops
            ; movups xmm0, [rdi + src_a]
            ; movups xmm1, [rdi + src_b]
        );
        match op {
            upper_op::ADD => dynasm!(ops
                ; addps xmm0, xmm1
            ),
            upper_op::SUB => dynasm!(ops
                ; subps xmm0, xmm1
            ),
            upper_op::MUL => dynasm!(ops
                ; mulps xmm0, xmm1
            ),
            upper_op::MAX => dynasm!(ops
                ; maxps xmm0, xmm1
            ),
            upper_op::MIN => dynasm!(ops
                ; minps xmm0, xmm1
            ),
            _ => unreachable!("unsupported upper op reached the emitter"),
        }
        dynasm!(ops
            ; movups [rdi + dst], xmm0
        );
    }

    fn emit_lower(ops: &mut Assembler, pair: &VuInstPair) {
        match pair.lower_op() {
            lower_op::NOP => {}
            lower_op::IADDIU | lower_op::ISUBIU => {
                if pair.vi_t() == 0 {
                    return;
                }
                let is = vi(pair.vi_s());
                let it = vi(pair.vi_t());
                let imm = pair.imm15() as i32;
                dynasm!(ops
                    ; movzx eax, WORD [rdi + is]
                );
                if pair.lower_op() == lower_op::IADDIU {
                    dynasm!(ops
                        ; add eax, imm
                    );
                } else {
                    dynasm!(ops
                        ; sub eax, imm
                    );
                }
                dynasm!(ops
                    ; mov [rdi + it], ax
                );
            }
            _ => unreachable!("unsupported lower op reached the emitter"),
        }
    }
}

#[cfg(not(all(feature = "jit-dynasm", target_arch = "x86_64")))]
mod emit {
    use crate::cpu::vu::VuInstPair;

    pub(super) fn compile_block(_pairs: &[VuInstPair], _end_pc: u32) -> Option<Vec<u8>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::vu::{uasm, upper_op, VuInterpreter, DATA_MEM_SIZE, MICRO_MEM_SIZE};
    use crate::vmem::sys_reserve_main_memory;

    struct Mem {
        micro: Vec<u8>,
        data: Vec<u8>,
    }

    impl Mem {
        fn new() -> Self {
            Mem {
                micro: vec![0; MICRO_MEM_SIZE],
                data: vec![0; DATA_MEM_SIZE],
            }
        }

        fn view(&mut self) -> VuMemView {
            VuMemView {
                micro: self.micro.as_mut_ptr(),
                data: self.data.as_mut_ptr(),
            }
        }

        fn load(&mut self, addr: usize, pairs: &[u64]) {
            for (i, p) in pairs.iter().enumerate() {
                let off = addr + i * 8;
                self.micro[off..off + 8].copy_from_slice(&p.to_le_bytes());
            }
        }
    }

    fn rec() -> VuRec {
        let mgr = sys_reserve_main_memory(host_map::TOTAL_SIZE).unwrap();
        let mut rec = VuRec::new(mgr);
        rec.reserve().unwrap();
        rec
    }

    #[test]
    fn test_rec_matches_interpreter() {
        let mut mem = Mem::new();
        mem.load(
            0,
            &[
                uasm::pair(
                    uasm::upper(upper_op::MUL, 3, 1, 2, 0xF),
                    uasm::iaddiu(1, 0, 5),
                ),
                uasm::pair(uasm::upper_e(upper_op::ADD, 4, 3, 3, 0xF), 0),
                uasm::pair(0, uasm::iaddiu(2, 1, 1)),
            ],
        );
        let view = mem.view();

        let mut rec = rec();
        let mut st = VuState::new();
        st.vf[1] = [1.0, 2.0, 3.0, 4.0];
        st.vf[2] = [2.0, 2.0, 2.0, 2.0];
        rec.execute_micro(&mut st, &view, 0, 64);

        let mut st2 = VuState::new();
        st2.vf[1] = [1.0, 2.0, 3.0, 4.0];
        st2.vf[2] = [2.0, 2.0, 2.0, 2.0];
        VuInterpreter::new().execute_micro(&mut st2, &view, 0, 64);

        assert_eq!(st.vf[3], st2.vf[3]);
        assert_eq!(st.vf[4], st2.vf[4]);
        assert_eq!(st.vi[1], st2.vi[1]);
        assert_eq!(st.vi[2], st2.vi[2]);
        assert_eq!(st.running, st2.running);
        assert!(rec.is_resident(0));
    }

    #[test]
    fn test_upload_invalidates_resident_block() {
        let mut mem = Mem::new();
        mem.load(
            0,
            &[
                uasm::pair(uasm::upper_e(upper_op::NOP, 0, 0, 0, 0), uasm::iaddiu(1, 0, 1)),
                uasm::nop_pair(),
            ],
        );
        let view = mem.view();
        let mut rec = rec();
        let mut st = VuState::new();
        rec.execute_micro(&mut st, &view, 0, 16);
        assert_eq!(st.vi[1], 1);
        assert!(rec.is_resident(0));

        // New upload over the same range.
        mem.load(
            0,
            &[
                uasm::pair(uasm::upper_e(upper_op::NOP, 0, 0, 0, 0), uasm::iaddiu(1, 0, 9)),
                uasm::nop_pair(),
            ],
        );
        rec.notify_micro_write_range(0, 16);
        let view = mem.view();
        let mut st2 = VuState::new();
        rec.execute_micro(&mut st2, &view, 0, 16);
        assert_eq!(st2.vi[1], 9);
    }

    #[test]
    fn test_lq_blocks_fall_back_to_decoded() {
        let mut mem = Mem::new();
        mem.load(
            0,
            &[
                uasm::pair(1 << 30, uasm::lq(2, 0, 0)),
                uasm::nop_pair(),
            ],
        );
        let view = mem.view();
        let mut rec = rec();
        let mut st = VuState::new();
        rec.execute_micro(&mut st, &view, 0, 8);
        let block = rec.cache.get(0).unwrap();
        assert!(block.native.is_none());
    }
}
