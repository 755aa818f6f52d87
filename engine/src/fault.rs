//! Fault Handler (C4)
//!
//! Invoked when the driver thread touches a protected device window. Reads
//! the faulting instruction from the saved instruction pointer, decodes it
//! (C3), dispatches to the scalar-load, scalar-store, or bulk-store path,
//! and mutates the saved register file and RIP in place before returning.
//!
//! [`dispatch`] is the pure, testable core: it takes a [`RegisterFile`], a
//! byte slice for the faulting instruction, the [`Registry`], and the
//! [`Transport`], and never touches global or signal state itself. The
//! actual `SIGSEGV` trampoline at the bottom of this file is the only part
//! that reads raw signal-frame memory.

use std::ffi::c_void;

use crate::context::{GpReg, RegisterFile, SignalContext};
use crate::decoder::{self, Kind, StoreSource};
use crate::registry::{DeviceRecord, Registry};
use crate::transport::Transport;
use mmiotrap_protocol::Message;

/// An error a driver's own faulting instruction caused that the engine
/// cannot recover from. Both variants are fatal: the driver executed
/// something the emulator either doesn't understand or that targets no
/// registered device, and silently continuing would corrupt its state.
#[derive(Debug, thiserror::Error)]
pub enum FaultFatal {
    #[error("unrecognized opcode at the faulting instruction, first bytes: {0:02x?}")]
    UnknownOpcode([u8; 4]),
    #[error("faulting address {0:#x} is not inside any registered device window")]
    DeviceNotFound(u64),
}

/// The longest instruction this decoder needs to look at. x86-64's
/// architectural maximum is 15 bytes; reading that many from `rip` is always
/// safe since the faulting instruction is, by construction, mapped and
/// executable.
const MAX_INSTR_LEN: usize = 15;

/// Decodes and emulates the single instruction at `regs.rip()`, mutating
/// `regs` with the architectural side effects and advancing `rip` past it.
pub fn dispatch(
    regs: &mut impl RegisterFile,
    instr_bytes: &[u8],
    registry: &Registry,
    transport: &Transport,
) -> Result<(), FaultFatal> {
    let instr = decoder::decode(instr_bytes);

    match instr.kind {
        Kind::Unknown { opcode_bytes } => Err(FaultFatal::UnknownOpcode(opcode_bytes)),
        Kind::ScalarLoad {
            size,
            operand_size,
            sign_extend,
            dest,
            dest_high_byte,
        } => {
            emulate_scalar_load(
                regs,
                registry,
                transport,
                size,
                operand_size,
                sign_extend,
                dest,
                dest_high_byte,
            )?;
            regs.set_rip(regs.rip() + instr.length as u64);
            Ok(())
        }
        Kind::ScalarStore { size, source } => {
            emulate_scalar_store(regs, registry, transport, size, source)?;
            regs.set_rip(regs.rip() + instr.length as u64);
            Ok(())
        }
        Kind::BulkStore { element_size } => {
            emulate_bulk_store(regs, registry, transport, element_size)?;
            regs.set_rip(regs.rip() + instr.length as u64);
            Ok(())
        }
    }
}

/// Scalar loads and stores address the device through the faulting address;
/// since the trampoline already knows it (the OS hands it to us in
/// `si_addr`), `dispatch` takes it as an explicit parameter for those two
/// paths rather than re-deriving it. Bulk stores instead locate the device
/// via the destination-index register, per §4.3.
fn locate(registry: &Registry, address: u64) -> Result<DeviceRecord, FaultFatal> {
    registry
        .find_u64(address)
        .ok_or(FaultFatal::DeviceNotFound(address))
}

#[allow(clippy::too_many_arguments)]
fn emulate_scalar_load(
    regs: &mut impl RegisterFile,
    registry: &Registry,
    transport: &Transport,
    size: usize,
    operand_size: usize,
    sign_extend: bool,
    dest: GpReg,
    dest_high_byte: bool,
) -> Result<(), FaultFatal> {
    // The faulting address lives in the saved context's CR2-equivalent, which
    // `dispatch_fault` (the trampoline) resolves before calling here; the
    // pure-function variant used by integration tests supplies it through
    // `regs` by convention (see `crate::test_util`).
    let address = regs.fault_address();
    let device = locate(registry, address)?;

    let request = Message::read_request(device.id, address as u32, size as u8);
    let response = transport.exchange(&request);
    let raw = response.payload_as_u64();

    let value = if sign_extend {
        sign_extend_to_u64(raw, size)
    } else {
        raw
    };

    if dest_high_byte {
        regs.set_high_byte(dest, value as u8);
    } else {
        regs.write_sized(dest, value, operand_size);
    }
    Ok(())
}

fn emulate_scalar_store(
    regs: &mut impl RegisterFile,
    registry: &Registry,
    transport: &Transport,
    size: usize,
    source: StoreSource,
) -> Result<(), FaultFatal> {
    let address = regs.fault_address();
    let device = locate(registry, address)?;

    let value: u64 = match source {
        StoreSource::Register { reg, high_byte } => {
            if high_byte {
                regs.get_high_byte(reg) as u64
            } else {
                regs.get(reg)
            }
        }
        StoreSource::Immediate(imm) => imm as u64,
    };
    let masked = mask_to_size(value, size);

    let request = Message::write_request(device.id, address as u32, size as u8, masked);
    let _ = transport.exchange(&request);
    Ok(())
}

fn emulate_bulk_store(
    regs: &mut impl RegisterFile,
    registry: &Registry,
    transport: &Transport,
    element_size: usize,
) -> Result<(), FaultFatal> {
    let destination_index = regs.get(GpReg::Rdi);
    let count = regs.get(GpReg::Rcx);
    let accumulator = regs.get(GpReg::Rax);

    let device = locate(registry, destination_index)?;
    let window_end = device.end();

    let max_count = if element_size == 0 {
        0
    } else {
        ((window_end.saturating_sub(destination_index)) / element_size as u64).min(count)
    };

    let value = mask_to_size(accumulator, element_size);
    let mut emitted = 0u64;
    for i in 0..max_count {
        let address = destination_index + i * element_size as u64;
        let request = Message::write_request(device.id, address as u32, element_size as u8, value);
        let response = transport.exchange(&request);
        if response.result != mmiotrap_protocol::ResultCode::Success {
            emitted = i;
            log::warn!(
                "bulk store stopped after {emitted} of {max_count} writes (model returned {:?})",
                response.result
            );
            break;
        }
        emitted = i + 1;
    }

    regs.set(GpReg::Rdi, destination_index + emitted * element_size as u64);
    regs.set(GpReg::Rcx, 0);
    Ok(())
}

fn mask_to_size(value: u64, size: usize) -> u64 {
    match size {
        1 => value & 0xFF,
        2 => value & 0xFFFF,
        4 => value & 0xFFFF_FFFF,
        8 => value,
        other => panic!("unsupported access size {other}"),
    }
}

fn sign_extend_to_u64(raw: u64, size: usize) -> u64 {
    match size {
        1 => (raw as u8 as i8) as i64 as u64,
        2 => (raw as u16 as i16) as i64 as u64,
        other => panic!("unsupported sign-extending load size {other}"),
    }
}

// ——————————————————————————————— SIGSEGV trampoline —————————————————————— //

/// The `SA_SIGINFO` handler installed for `SIGSEGV`.
///
/// Reads the faulting instruction from the saved RIP, decodes it, and
/// dispatches through [`dispatch`]. A decoder "unknown" or a device miss
/// both terminate the process: the driver executed an access the emulator
/// cannot honor correctly, and advancing past it anyway would silently
/// corrupt driver state (see §7 of the design notes).
pub extern "C" fn sigsegv_trampoline(
    _signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut c_void,
) {
    let Some(engine) = crate::Engine::get() else {
        fatal_exit("SIGSEGV before Engine::init");
    };

    let fault_addr = unsafe { (*info).si_addr() } as u64;
    let mut ctx = unsafe { SignalContext::from_raw(ucontext) };
    let rip = ctx.rip();

    let instr_bytes = unsafe { std::slice::from_raw_parts(rip as *const u8, MAX_INSTR_LEN) };

    let mut faulting = FaultingContext {
        inner: &mut ctx,
        fault_address: fault_addr,
    };

    match dispatch(
        &mut faulting,
        instr_bytes,
        &engine.registry,
        &engine.transport,
    ) {
        Ok(()) => {}
        Err(FaultFatal::UnknownOpcode(bytes)) => {
            fatal_exit(&format!(
                "unrecognized instruction at {rip:#x}, first bytes {bytes:02x?}"
            ));
        }
        Err(FaultFatal::DeviceNotFound(addr)) => {
            fatal_exit(&format!("access to unregistered address {addr:#x}"));
        }
    }
}

fn fatal_exit(message: &str) -> ! {
    log::error!("{message}");
    std::process::exit(1);
}

/// Wraps a [`RegisterFile`] with the faulting address the OS handed us in
/// `si_addr`, since scalar loads/stores need it but it isn't itself a
/// general-purpose register.
struct FaultingContext<'a, R: RegisterFile> {
    inner: &'a mut R,
    fault_address: u64,
}

impl<R: RegisterFile> RegisterFile for FaultingContext<'_, R> {
    fn get(&self, reg: GpReg) -> u64 {
        self.inner.get(reg)
    }
    fn set(&mut self, reg: GpReg, value: u64) {
        self.inner.set(reg, value)
    }
    fn rip(&self) -> u64 {
        self.inner.rip()
    }
    fn set_rip(&mut self, value: u64) {
        self.inner.set_rip(value)
    }
    fn fault_address(&self) -> u64 {
        self.fault_address
    }
}
