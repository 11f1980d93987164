//! End-to-end recompiler behavior through the `System` facade: engine
//! equivalence, self-modifying-code invalidation, and the out-of-memory
//! emergency response.

use recast::cpu::mips::{asm, funct, op};
use recast::{CoreConfig, CpuEngine, CpuRole, EngineKind, System};

fn boot(config: CoreConfig) -> System {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut sys = System::new(config).unwrap();
    sys.reserve_all().unwrap();
    sys.commit_all().unwrap();
    sys
}

fn load_words(sys: &mut System, addr: u32, words: &[u32]) {
    for (i, w) in words.iter().enumerate() {
        sys.write_main_ram(addr + (i as u32) * 4, &w.to_le_bytes())
            .unwrap();
    }
}

fn demo_program() -> Vec<u32> {
    vec![
        asm::i_type(op::ADDIU, 0, 1, 1000),
        asm::i_type(op::ADDIU, 0, 2, 0xFFFE), // -2
        asm::r_type(funct::ADDU, 1, 2, 3, 0),
        asm::r_type(funct::AND, 1, 3, 4, 0),
        asm::r_type(funct::SLT, 2, 1, 5, 0),
        asm::i_type(op::SW, 0, 3, 0x4000),
        asm::i_type(op::LW, 0, 6, 0x4000),
        asm::j_type(op::J, 0x3000),
        asm::i_type(op::ORI, 0, 7, 0x7777),
    ]
}

#[test]
fn test_recompiler_matches_interpreter_end_to_end() {
    let program = demo_program();

    let mut rec_sys = boot(CoreConfig::default());
    assert_eq!(
        rec_sys.providers().engine_kind(CpuRole::Main),
        EngineKind::Recompiler
    );
    load_words(&mut rec_sys, 0x1000, &program);
    rec_sys.main.set_pc(0x1000);
    rec_sys.run(program.len() as u32).unwrap();

    let int_config = CoreConfig {
        enable_rec_main: false,
        enable_rec_iop: false,
        enable_rec_vu: false,
        thread_vu: false,
    };
    let mut int_sys = boot(int_config);
    assert_eq!(
        int_sys.providers().engine_kind(CpuRole::Main),
        EngineKind::Interpreter
    );
    load_words(&mut int_sys, 0x1000, &program);
    int_sys.main.set_pc(0x1000);
    int_sys.run(program.len() as u32).unwrap();

    assert_eq!(rec_sys.main.gpr, int_sys.main.gpr);
    assert_eq!(rec_sys.main.pc, int_sys.main.pc);
}

#[test]
fn test_guest_store_invalidates_resident_block() {
    let mut sys = boot(CoreConfig::default());

    // Block A computes $2, block B patches A's first instruction twice in
    // quick succession, then control returns to A.
    load_words(
        &mut sys,
        0x1000,
        &[
            asm::i_type(op::ADDIU, 0, 2, 1),
            asm::j_type(op::J, 0x1100),
            asm::nop(),
        ],
    );
    load_words(
        &mut sys,
        0x1100,
        &[
            asm::i_type(op::SW, 9, 8, 0),
            asm::i_type(op::SW, 9, 10, 0),
            asm::j_type(op::J, 0x2000),
            asm::nop(),
        ],
    );

    sys.main.set_pc(0x1000);
    sys.run(3).unwrap();
    assert_eq!(sys.main.gpr[2], 1);
    assert!(sys
        .providers()
        .main_rec()
        .map(|r| r.is_resident(0x1000))
        .unwrap_or(false));

    sys.main.gpr[8] = asm::i_type(op::ADDIU, 0, 2, 7) as u64;
    sys.main.gpr[10] = asm::i_type(op::ADDIU, 0, 2, 9) as u64;
    sys.main.gpr[9] = 0x1000;
    sys.main.set_pc(0x1100);
    sys.run(4).unwrap();

    // Both writes landed in A's covered range; the second invalidation hits
    // an already-evicted block and must be harmless. A re-fetch at A's start
    // retranslates from the patched bytes.
    sys.main.set_pc(0x1000);
    sys.run(3).unwrap();
    assert_eq!(sys.main.gpr[2], 9);
}

#[test]
fn test_emergency_response_shrinks_and_resets() {
    let mut sys = boot(CoreConfig::default());
    let start_size = {
        let rec = sys.providers().main_rec().unwrap();
        rec.cache_reserve_size()
    };
    assert_eq!(start_size, 64 * 1024 * 1024);

    // Translate real blocks, then burn reserve space up past 50 MiB the way
    // a long session would.
    load_words(&mut sys, 0x1000, &demo_program());
    sys.main.set_pc(0x1000);
    sys.run(8).unwrap();
    {
        let rec = sys.providers_mut().main_rec_mut().unwrap();
        assert!(rec.block_count() > 0);
        let target = 50 * 1024 * 1024;
        let used = rec.cache_used();
        assert!(rec.consume_reserve(target - used));
        assert!(rec.cache_used() >= target);
    }

    sys.providers_mut().oom_emergency_response().unwrap();

    let rec = sys.providers().main_rec().unwrap();
    // Two thirds of 64 MiB, give or take page rounding.
    assert!(rec.cache_reserve_size() <= 43 * 1024 * 1024);
    // Reset dropped every previously resident block.
    assert_eq!(rec.block_count(), 0);
    assert_eq!(rec.cache_used(), 0);

    // The system keeps executing afterwards.
    sys.main = Default::default();
    sys.main.set_pc(0x1000);
    sys.run(8).unwrap();
    assert!(sys.providers().main_rec().unwrap().block_count() > 0);
}

#[test]
fn test_emergency_response_is_monotonic() {
    let mut sys = boot(CoreConfig::default());
    let mut prev = sys.providers().main_rec().unwrap().cache_reserve_size();
    for _ in 0..5 {
        sys.providers_mut().oom_emergency_response().unwrap();
        let now = sys.providers().main_rec().unwrap().cache_reserve_size();
        assert!(now <= prev * 2 / 3 + 4096);
        assert!(now < prev);
        prev = now;

        // Still usable after every shrink.
        load_words(&mut sys, 0x1000, &demo_program());
        sys.main.set_pc(0x1000);
        sys.run(8).unwrap();
    }
}

#[test]
fn test_reconfiguration_switches_engines() {
    let mut sys = boot(CoreConfig::default());
    load_words(&mut sys, 0x1000, &demo_program());
    sys.main.set_pc(0x1000);
    sys.run(8).unwrap();
    let rec_result = sys.main.gpr;

    let mut config = sys.config().clone();
    config.enable_rec_main = false;
    sys.set_config(config).unwrap();
    assert_eq!(
        sys.providers().engine_kind(CpuRole::Main),
        EngineKind::Interpreter
    );

    sys.main = Default::default();
    sys.main.set_pc(0x1000);
    sys.run(8).unwrap();
    assert_eq!(sys.main.gpr, rec_result);
}
