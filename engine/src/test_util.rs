//! Test doubles for exercising the fault-dispatch logic without a real signal.

use crate::context::{GpReg, RegisterFile};

/// A plain-array register file used by tests in place of [`crate::context::SignalContext`].
#[derive(Debug, Clone)]
pub struct PlainRegisterFile {
    regs: [u64; 16],
    rip: u64,
    fault_address: u64,
}

impl PlainRegisterFile {
    pub fn new() -> PlainRegisterFile {
        PlainRegisterFile {
            regs: [0; 16],
            rip: 0,
            fault_address: 0,
        }
    }

    pub fn with_rip(rip: u64) -> PlainRegisterFile {
        PlainRegisterFile {
            regs: [0; 16],
            rip,
            fault_address: 0,
        }
    }

    /// Builds a register file as it would look right after a fault: the
    /// instruction pointer at `rip`, and `fault_address` available through
    /// [`RegisterFile::fault_address`] the way the real `si_addr` would be.
    pub fn with_fault(fault_address: u64, rip: u64) -> PlainRegisterFile {
        PlainRegisterFile {
            regs: [0; 16],
            rip,
            fault_address,
        }
    }
}

impl Default for PlainRegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile for PlainRegisterFile {
    fn get(&self, reg: GpReg) -> u64 {
        self.regs[reg.index() as usize]
    }

    fn set(&mut self, reg: GpReg, value: u64) {
        self.regs[reg.index() as usize] = value;
    }

    fn rip(&self) -> u64 {
        self.rip
    }

    fn set_rip(&mut self, value: u64) {
        self.rip = value;
    }

    fn fault_address(&self) -> u64 {
        self.fault_address
    }
}
