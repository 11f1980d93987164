//! Vector-unit execution through the `System` facade, threaded and inline,
//! including the quiesce-before-teardown ordering.

use recast::cpu::vu::{uasm, upper_op};
use recast::{CoreConfig, System};

fn boot(thread_vu: bool) -> System {
    let mut sys = System::new(CoreConfig {
        thread_vu,
        ..CoreConfig::default()
    })
    .unwrap();
    sys.reserve_all().unwrap();
    sys.commit_all().unwrap();
    sys
}

fn micro_add_program() -> Vec<u8> {
    let pairs = [
        uasm::pair(uasm::upper_e(upper_op::ADD, 3, 1, 2, 0xF), 0),
        uasm::pair(0, uasm::iaddiu(1, 0, 5)),
    ];
    pairs.iter().flat_map(|p| p.to_le_bytes()).collect()
}

#[test]
fn test_inline_execution() {
    let mut sys = boot(false);
    sys.upload_vu_micro(0, &micro_add_program()).unwrap();
    {
        let mut vu = sys.vu_state().lock().unwrap();
        vu.vf[1] = [1.0, 2.0, 3.0, 4.0];
        vu.vf[2] = [4.0, 3.0, 2.0, 1.0];
    }
    sys.vu_exec_micro(0).unwrap();
    let vu = sys.vu_state().lock().unwrap();
    assert_eq!(vu.vf[3], [5.0, 5.0, 5.0, 5.0]);
    assert_eq!(vu.vi[1], 5);
    assert!(!vu.running);
}

#[test]
fn test_threaded_execution_with_wait() {
    let mut sys = boot(true);
    sys.upload_vu_micro(0, &micro_add_program()).unwrap();
    {
        let mut vu = sys.vu_state().lock().unwrap();
        vu.vf[1] = [10.0, 20.0, 30.0, 40.0];
        vu.vf[2] = [1.0, 1.0, 1.0, 1.0];
    }
    sys.vu_exec_micro(0).unwrap();
    // Synchronization point before the main CPU reads vector registers.
    sys.wait_vu();
    let vu = sys.vu_state().lock().unwrap();
    assert_eq!(vu.vf[3], [11.0, 21.0, 31.0, 41.0]);
}

#[test]
fn test_upload_quiesces_and_invalidates() {
    let mut sys = boot(true);
    sys.upload_vu_micro(0, &micro_add_program()).unwrap();
    sys.vu_exec_micro(0).unwrap();

    // Immediately replace the program while a run may still be in flight;
    // the upload must wait for the worker before touching micro memory.
    let pairs = [
        uasm::pair(uasm::upper_e(upper_op::NOP, 0, 0, 0, 0), uasm::iaddiu(2, 0, 9)),
        uasm::pair(0, 0),
    ];
    let bytes: Vec<u8> = pairs.iter().flat_map(|p| p.to_le_bytes()).collect();
    sys.upload_vu_micro(0, &bytes).unwrap();

    sys.vu_exec_micro(0).unwrap();
    sys.wait_vu();
    assert_eq!(sys.vu_state().lock().unwrap().vi[2], 9);
}

#[test]
fn test_teardown_quiesces_worker() {
    let mut sys = boot(true);
    sys.upload_vu_micro(0, &micro_add_program()).unwrap();
    for _ in 0..8 {
        sys.vu_exec_micro(0).unwrap();
    }
    // Decommit must wait out the queue and reset the worker state before the
    // pages go away; afterwards the lifecycle comes back up cleanly.
    sys.decommit_all();
    assert_eq!(sys.vu_state().lock().unwrap().pairs_executed, 0);

    sys.commit_all().unwrap();
    sys.upload_vu_micro(0, &micro_add_program()).unwrap();
    sys.vu_exec_micro(0).unwrap();
    sys.wait_vu();
    assert!(sys.vu_state().lock().unwrap().pairs_executed > 0);
    sys.release_all();
}

#[test]
fn test_reset_all_with_worker_running() {
    let mut sys = boot(true);
    sys.upload_vu_micro(0, &micro_add_program()).unwrap();
    sys.vu_exec_micro(0).unwrap();
    sys.reset_all().unwrap();
    let vu = sys.vu_state().lock().unwrap();
    assert_eq!(vu.pairs_executed, 0);
    assert_eq!(vu.vf[3], [0.0; 4]);
}
