//! End-to-end coverage of the scenarios from the spec's testable-properties
//! section, driven through `fault::dispatch` with a [`PlainRegisterFile`]
//! standing in for a real signal frame (see the `test-util` feature).

use mmiotrap_engine::context::{GpReg, RegisterFile};
use mmiotrap_engine::registry::Registry;
use mmiotrap_engine::test_util::PlainRegisterFile;
use mmiotrap_engine::transport::Transport;
use mmiotrap_engine::{fault, FaultFatal};

fn transport() -> Transport {
    // Points at a socket that will never exist; every exchange falls back to
    // the synthetic oracle, which is exactly what these scenarios rely on.
    Transport::new("/tmp/mmiotrap-tests-no-model.sock".into())
}

#[test]
fn scenario_scalar_store_masks_value_and_advances_rip() {
    let registry = Registry::new();
    registry.register(1, 0x4100_0000, 0x1000).unwrap();
    let transport = transport();

    // mov dword [rax], 0x12345678 => C7 00 78 56 34 12
    let bytes = [0xC7u8, 0x00, 0x78, 0x56, 0x34, 0x12];
    let mut regs = PlainRegisterFile::with_fault(0x4100_0004, 0x2000_0000);

    fault::dispatch(&mut regs, &bytes, &registry, &transport).unwrap();
    assert_eq!(regs.rip(), 0x2000_0000 + bytes.len() as u64);

    registry.unregister(1).unwrap();
}

#[test]
fn scenario_scalar_load_zero_extends_upper_32_bits() {
    let registry = Registry::new();
    registry.register(1, 0x4200_0000, 0x1000).unwrap();
    let transport = transport();

    // mov eax, [rcx] => 8B 01, at the conventional status offset (+4)
    let bytes = [0x8Bu8, 0x01];
    let mut regs = PlainRegisterFile::with_fault(0x4200_0004, 0x1000);
    regs.set(GpReg::Rax, 0xFFFF_FFFF_FFFF_FFFF);

    fault::dispatch(&mut regs, &bytes, &registry, &transport).unwrap();
    assert_eq!(regs.get(GpReg::Rax), 0x0000_0000_0000_0001);

    registry.unregister(1).unwrap();
}

#[test]
fn scenario_8bit_load_preserves_high_bits() {
    let registry = Registry::new();
    registry.register(1, 0x4300_0000, 0x1000).unwrap();
    let transport = transport();

    // mov al, [rcx] => 8A 01
    let bytes = [0x8Au8, 0x01];
    let mut regs = PlainRegisterFile::with_fault(0x4300_0000, 0x1000);
    regs.set(GpReg::Rax, 0x1122_3344_5566_7788);

    fault::dispatch(&mut regs, &bytes, &registry, &transport).unwrap();
    // Synthetic oracle returns 0xDEADBEEF; the low byte is 0xEF.
    assert_eq!(regs.get(GpReg::Rax), 0x1122_3344_5566_77EF);

    registry.unregister(1).unwrap();
}

#[test]
fn scenario_rep_stosb_emits_bounded_writes_and_updates_registers() {
    let registry = Registry::new();
    registry.register(1, 0x4400_0000, 32).unwrap();
    let transport = transport();

    let bytes = [0xF3u8, 0xAA]; // rep stosb
    let mut regs = PlainRegisterFile::with_fault(0x4400_0000, 0x1000);
    regs.set(GpReg::Rdi, 0x4400_0000);
    regs.set(GpReg::Rcx, 32);
    regs.set(GpReg::Rax, 0xAA);

    fault::dispatch(&mut regs, &bytes, &registry, &transport).unwrap();

    assert_eq!(regs.get(GpReg::Rdi), 0x4400_0020);
    assert_eq!(regs.get(GpReg::Rcx), 0);

    registry.unregister(1).unwrap();
}

#[test]
fn scenario_rep_stosb_truncates_when_count_exceeds_window() {
    let registry = Registry::new();
    registry.register(1, 0x4500_0000, 16).unwrap(); // window smaller than count
    let transport = transport();

    let bytes = [0xF3u8, 0xAA];
    let mut regs = PlainRegisterFile::with_fault(0x4500_0000, 0x1000);
    regs.set(GpReg::Rdi, 0x4500_0000);
    regs.set(GpReg::Rcx, 64);
    regs.set(GpReg::Rax, 0x41);

    fault::dispatch(&mut regs, &bytes, &registry, &transport).unwrap();

    // Truncated to the 16-byte window: destination index lands exactly at
    // window_end; count is zeroed per the architectural REP STOS end-state
    // regardless of truncation.
    assert_eq!(regs.get(GpReg::Rdi), 0x4500_0010);
    assert_eq!(regs.get(GpReg::Rcx), 0);

    registry.unregister(1).unwrap();
}

#[test]
fn scenario_rep_stosb_rerun_at_boundary_emits_nothing() {
    let registry = Registry::new();
    registry.register(1, 0x4600_0000, 16).unwrap();
    let transport = transport();

    let bytes = [0xF3u8, 0xAA];
    let mut regs = PlainRegisterFile::with_fault(0x4600_0010, 0x1000);
    regs.set(GpReg::Rdi, 0x4600_0010); // already at window_end
    regs.set(GpReg::Rcx, 8);
    regs.set(GpReg::Rax, 0x41);

    fault::dispatch(&mut regs, &bytes, &registry, &transport).unwrap();

    assert_eq!(regs.get(GpReg::Rdi), 0x4600_0010);
    assert_eq!(regs.get(GpReg::Rcx), 0);

    registry.unregister(1).unwrap();
}

#[test]
fn scenario_unknown_opcode_is_reported() {
    let registry = Registry::new();
    registry.register(1, 0x4700_0000, 0x1000).unwrap();
    let transport = transport();

    let bytes = [0x0Fu8, 0x05]; // syscall, outside the recognized set
    let mut regs = PlainRegisterFile::with_fault(0x4700_0000, 0x1000);

    let err = fault::dispatch(&mut regs, &bytes, &registry, &transport).unwrap_err();
    assert!(matches!(err, FaultFatal::UnknownOpcode(_)));

    registry.unregister(1).unwrap();
}

#[test]
fn scenario_device_miss_is_reported() {
    let registry = Registry::new();
    registry.register(1, 0x4800_0000, 0x1000).unwrap();
    let transport = transport();

    let bytes = [0xC6u8, 0x00, 0x01]; // mov byte [rax], 1
    let mut regs = PlainRegisterFile::with_fault(0x4900_0000, 0x1000); // different window entirely

    let err = fault::dispatch(&mut regs, &bytes, &registry, &transport).unwrap_err();
    assert!(matches!(err, FaultFatal::DeviceNotFound(0x4900_0000)));

    registry.unregister(1).unwrap();
}
