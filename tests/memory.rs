//! Reservation-layer behavior: staged lifecycle, base stability, and the
//! commit/decommit round trip on both plain and executable reserves.

use recast::{
    host_map, sys_reserve_main_memory, CoreConfig, PageProtection, RecompiledCodeReserve,
    System, VirtualMemoryReserve,
};

#[test]
fn test_commit_decommit_commit_round_trip() {
    let mgr = sys_reserve_main_memory(host_map::TOTAL_SIZE).unwrap();
    let mut reserve = VirtualMemoryReserve::assign(
        "round trip",
        mgr,
        host_map::MAIN_RAM_OFFSET,
        256 * 1024,
        PageProtection::rw(),
    )
    .unwrap();

    reserve.commit().unwrap();
    let committed = reserve.committed();
    let prot = reserve.protection();
    unsafe { reserve.as_mut_slice()[100] = 0x42 };

    reserve.decommit();
    reserve.commit().unwrap();

    // Behaviorally identical to a fresh commit: same committed size, same
    // protection, zeroed contents.
    assert_eq!(reserve.committed(), committed);
    assert_eq!(reserve.protection(), prot);
    assert_eq!(unsafe { reserve.as_slice()[100] }, 0);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_code_reserve_stays_executable_across_reset() {
    let mgr = sys_reserve_main_memory(host_map::TOTAL_SIZE).unwrap();
    let mut code =
        RecompiledCodeReserve::assign("exec check", mgr, host_map::MAIN_REC_OFFSET, 64 * 1024)
            .unwrap();

    // A bare `ret` is the smallest possible function.
    let call_ret = |code: &mut RecompiledCodeReserve| {
        let ptr = code.alloc(16).unwrap();
        unsafe {
            *ptr = 0xC3;
            let f: extern "C" fn() = std::mem::transmute(ptr);
            f();
        }
    };

    call_ret(&mut code);
    code.reset().unwrap();
    call_ret(&mut code);

    code.shrink_to(16 * 1024).unwrap();
    call_ret(&mut code);
}

#[test]
fn test_base_address_stable_across_lifecycle() {
    let mut sys = System::new(CoreConfig::default()).unwrap();
    sys.reserve_all().unwrap();
    let base = sys.memory_base();
    assert_ne!(base, 0);

    sys.commit_all().unwrap();
    assert_eq!(sys.memory_base(), base);

    sys.reset_all().unwrap();
    assert_eq!(sys.memory_base(), base);

    sys.decommit_all();
    assert_eq!(sys.memory_base(), base);

    sys.commit_all().unwrap();
    assert_eq!(sys.memory_base(), base);

    sys.release_all();
    assert_eq!(sys.memory_base(), base);
}

#[test]
fn test_decommit_drops_guest_memory_contents() {
    let mut sys = System::new(CoreConfig::default()).unwrap();
    sys.reserve_all().unwrap();
    sys.commit_all().unwrap();

    sys.write_main_ram(0x40, &[0xAA; 16]).unwrap();
    assert_eq!(sys.read_main_ram(0x40, 16).unwrap(), vec![0xAA; 16]);

    sys.decommit_all();
    sys.commit_all().unwrap();
    assert_eq!(sys.read_main_ram(0x40, 16).unwrap(), vec![0u8; 16]);
}
