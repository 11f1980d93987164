//! Cross-thread vector-unit execution bridge
//!
//! When enabled, microprogram execution is delegated to one worker thread:
//! the controlling thread enqueues "execute microprogram at address A" and
//! either proceeds asynchronously or blocks in [`VuThread::wait_idle`] at a
//! synchronization point (reading vector registers the main CPU depends on,
//! or any full-system reset/decommit).
//!
//! The worker touches only the memory view it was handed. [`VuThread::reset`]
//! waits for in-flight work before discarding state; system teardown calls
//! `wait_idle` + `reset` before decommitting shared regions, which is the
//! ordering that makes handing raw memory views across threads sound.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use tracing::debug;

use crate::cpu::vu::{VuInterpreter, VuMemView, VuState, MICRO_MEM_SIZE};
use crate::error::CoreError;

/// Pair budget for one enqueued microprogram run.
const RUN_PAIRS: u32 = (MICRO_MEM_SIZE as u32 / 8) * 4;

enum VuCmd {
    Execute { addr: u32 },
    Reset,
    Shutdown,
}

pub struct VuThread {
    tx: Sender<VuCmd>,
    inflight: Arc<(Mutex<u32>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl VuThread {
    /// Spawn the worker. It owns its own interpreter; the register state is
    /// shared so the controlling thread can read results after `wait_idle`.
    pub fn start(state: Arc<Mutex<VuState>>, mem: VuMemView) -> Result<VuThread, CoreError> {
        let (tx, rx) = mpsc::channel::<VuCmd>();
        let inflight = Arc::new((Mutex::new(0u32), Condvar::new()));
        let worker_inflight = inflight.clone();

        let handle = std::thread::Builder::new()
            .name("vu-worker".into())
            .spawn(move || {
                let mut interp = VuInterpreter::new();
                for cmd in rx {
                    match cmd {
                        VuCmd::Execute { addr } => {
                            let mut st = state
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner);
                            interp.execute_micro(&mut st, &mem, addr, RUN_PAIRS);
                        }
                        VuCmd::Reset => {
                            state
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .reset();
                        }
                        VuCmd::Shutdown => break,
                    }
                    let (count, cvar) = &*worker_inflight;
                    let mut n = count.lock().unwrap_or_else(PoisonError::into_inner);
                    *n -= 1;
                    cvar.notify_all();
                }
            })
            .map_err(|e| CoreError::ReservationFailed {
                name: "vu worker thread",
                detail: e.to_string(),
            })?;

        debug!("vu worker thread started");
        Ok(VuThread {
            tx,
            inflight,
            handle: Some(handle),
        })
    }

    fn enqueue(&self, cmd: VuCmd) {
        let (count, cvar) = &*self.inflight;
        {
            let mut n = count.lock().unwrap_or_else(PoisonError::into_inner);
            *n += 1;
        }
        if self.tx.send(cmd).is_err() {
            // Worker is gone; undo the count so waiters cannot hang.
            let mut n = count.lock().unwrap_or_else(PoisonError::into_inner);
            *n -= 1;
            cvar.notify_all();
        }
    }

    /// Queue a microprogram run and return immediately.
    pub fn execute_micro(&self, addr: u32) {
        self.enqueue(VuCmd::Execute { addr });
    }

    /// Block until the worker has drained every queued command. The only
    /// routine blocking wait in the hot path.
    pub fn wait_idle(&self) {
        let (count, cvar) = &*self.inflight;
        let mut n = count.lock().unwrap_or_else(PoisonError::into_inner);
        while *n > 0 {
            n = cvar.wait(n).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait for in-flight execution, then discard the worker-side state.
    pub fn reset(&self) {
        self.wait_idle();
        self.enqueue(VuCmd::Reset);
        self.wait_idle();
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.wait_idle();
            let _ = self.tx.send(VuCmd::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for VuThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::vu::{uasm, upper_op, DATA_MEM_SIZE};

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

    #[test]
    fn test_execute_and_wait() {
        let mut mem = Mem::new();
        mem.load(
            0,
            &[
                uasm::pair(uasm::upper_e(upper_op::ADD, 3, 1, 2, 0xF), 0),
                uasm::nop_pair(),
            ],
        );
        let state = Arc::new(Mutex::new(VuState::new()));
        {
            let mut st = state.lock().unwrap();
            st.vf[1] = [1.0, 1.0, 1.0, 1.0];
            st.vf[2] = [2.0, 2.0, 2.0, 2.0];
        }
        let mut bridge = VuThread::start(state.clone(), mem.view()).unwrap();
        bridge.execute_micro(0);
        bridge.wait_idle();
        assert_eq!(state.lock().unwrap().vf[3], [3.0, 3.0, 3.0, 3.0]);
        assert!(!state.lock().unwrap().running);
        bridge.shutdown();
    }

    #[test]
    fn test_reset_waits_then_clears() {
        let mut mem = Mem::new();
        mem.load(
            0,
            &[
                uasm::pair(0, uasm::iaddiu(1, 0, 3)),
                uasm::pair(uasm::upper_e(upper_op::NOP, 0, 0, 0, 0), 0),
                uasm::nop_pair(),
            ],
        );
        let state = Arc::new(Mutex::new(VuState::new()));
        let mut bridge = VuThread::start(state.clone(), mem.view()).unwrap();
        bridge.execute_micro(0);
        bridge.reset();
        // Reset observed the completed run, then cleared everything.
        let st = state.lock().unwrap();
        assert_eq!(st.vi[1], 0);
        assert_eq!(st.pairs_executed, 0);
        drop(st);
        bridge.shutdown();
    }

    #[test]
    fn test_many_queued_commands_drain() {
        let mut mem = Mem::new();
        mem.load(
            0,
            &[
                uasm::pair(uasm::upper_e(upper_op::NOP, 0, 0, 0, 0), uasm::iaddiu(1, 1, 1)),
                uasm::nop_pair(),
            ],
        );
        let state = Arc::new(Mutex::new(VuState::new()));
        let mut bridge = VuThread::start(state.clone(), mem.view()).unwrap();
        for _ in 0..32 {
            bridge.execute_micro(0);
        }
        bridge.wait_idle();
        assert_eq!(state.lock().unwrap().vi[1], 32);
        bridge.shutdown();
    }
}
