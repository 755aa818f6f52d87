//! mmiotrap
//!
//! Transparent emulation of memory-mapped device registers for unmodified
//! driver code running as a normal user-space process.
//!
//! A driver dereferences absolute addresses inside a pre-declared *device
//! window* as if they were real hardware. The engine reserves that window
//! with no access permissions, catches the resulting `SIGSEGV`, decodes the
//! faulting instruction, forwards the access to a behavioral device model
//! hosted in a separate process, and resumes the driver with the correct
//! architectural side effects. Interrupts travel the other way: the model
//! wakes the driver process, which dispatches to a registered callback.
//!
//! This library exposes two entry points: [`Engine::init`] and the
//! lifecycle/registration calls on [`Engine`] itself.

pub mod context;
pub mod decoder;
pub mod fault;
pub mod interrupt;
pub mod logger;
pub mod registry;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

use std::io;
use std::sync::OnceLock;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::context::SignalContext;
use crate::interrupt::InterruptTable;
use crate::registry::{Registry, RegistryError};
use crate::transport::Transport;
use mmiotrap_protocol::Message;

pub use context::GpReg;
pub use decoder::DecodedInstr;
pub use fault::FaultFatal;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no device is registered at address {0:#x}")]
    DeviceNotFound(u32),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("unsupported access size {0}")]
    InvalidSize(u8),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] nix::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Process-wide engine state: the device registry, the interrupt table, and
/// the transport used to reach the model. Created once by [`Engine::init`]
/// and torn down by [`Engine::deinit`]; both signal-context readers (the
/// fault and interrupt handlers) and user-context writers (registration
/// calls) reach it through this single static instance.
pub struct Engine {
    pub(crate) registry: Registry,
    pub(crate) interrupts: InterruptTable,
    pub(crate) transport: Transport,
}

static ENGINE: OnceLock<Engine> = OnceLock::new();

impl Engine {
    /// Installs the `SIGSEGV` and interrupt signal handlers, writes the PID
    /// rendezvous file, and binds the interrupt listening socket.
    ///
    /// # Panics
    ///
    /// Panics if called more than once in a process; the engine is meant to
    /// be a single, process-wide instance.
    pub fn init() -> Result<&'static Engine, EngineError> {
        logger::init();

        let engine = Engine {
            registry: Registry::new(),
            interrupts: InterruptTable::new(),
            transport: Transport::new(mmiotrap_config::model_socket_path()),
        };

        ENGINE
            .set(engine)
            .unwrap_or_else(|_| panic!("Engine::init called twice"));
        let engine = ENGINE.get().unwrap();

        install_handlers()?;
        interrupt::write_pid_file()?;
        engine.interrupts.bind_listener()?;

        Ok(engine)
    }

    /// Returns the process-wide engine instance, if [`Engine::init`] has run.
    pub fn get() -> Option<&'static Engine> {
        ENGINE.get()
    }

    /// Restores default signal dispositions and removes rendezvous files.
    ///
    /// This does not reset the `OnceLock`; a process that deinits is expected
    /// to exit or never touch devices again, matching the single process /
    /// single lifecycle model described for this engine.
    pub fn deinit(&self) -> Result<(), EngineError> {
        uninstall_handlers()?;
        interrupt::remove_pid_file();
        self.interrupts.unbind_listener();
        Ok(())
    }

    /// Reserves `[base, base+length)` for `id` and arms it for trapping.
    pub fn register_device(&self, id: u32, base: u32, length: u32) -> Result<(), EngineError> {
        self.registry.register(id, base, length)?;
        Ok(())
    }

    /// Releases the window previously reserved for `id`.
    pub fn unregister_device(&self, id: u32) -> Result<(), EngineError> {
        self.registry.unregister(id)?;
        Ok(())
    }

    /// Reads `size` bytes at `address` directly through the model, without
    /// going through the fault handler.
    pub fn register_read(&self, address: u32, size: u8) -> Result<u64, EngineError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(EngineError::InvalidSize(size));
        }
        let device = self
            .registry
            .find(address)
            .ok_or(EngineError::DeviceNotFound(address))?;
        let request = Message::read_request(device.id, address, size);
        let response = self.transport.exchange(&request);
        Ok(response.payload_as_u64())
    }

    /// Writes `size` low bytes of `value` to `address` directly through the model.
    pub fn register_write(&self, address: u32, value: u64, size: u8) -> Result<(), EngineError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(EngineError::InvalidSize(size));
        }
        let device = self
            .registry
            .find(address)
            .ok_or(EngineError::DeviceNotFound(address))?;
        let request = Message::write_request(device.id, address, size, value);
        let _ = self.transport.exchange(&request);
        Ok(())
    }

    /// Registers `callback` to be invoked when the model delivers `interrupt_id`.
    pub fn interrupt_handler_register(
        &self,
        interrupt_id: u32,
        callback: fn(u32),
    ) -> Result<(), EngineError> {
        self.interrupts.register(interrupt_id, callback)?;
        Ok(())
    }

    /// Runs one non-blocking accept-and-dispatch cycle on the interrupt
    /// listening socket. Returns promptly whether or not an interrupt arrived.
    pub fn poll_model_interrupts(&self) -> bool {
        self.interrupts.poll()
    }
}

// ——————————————————————————————— Signal setup —————————————————————————————— //

fn install_handlers() -> Result<(), EngineError> {
    let fault_action = SigAction::new(
        SigHandler::SigAction(fault::sigsegv_trampoline),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    let interrupt_action = SigAction::new(
        SigHandler::Handler(interrupt::sigusr1_trampoline),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    unsafe {
        signal::sigaction(Signal::SIGSEGV, &fault_action).map_err(EngineError::Signal)?;
        signal::sigaction(
            Signal::from_c_int(mmiotrap_config::INTERRUPT_SIGNAL).unwrap(),
            &interrupt_action,
        )
        .map_err(EngineError::Signal)?;
    }
    Ok(())
}

fn uninstall_handlers() -> Result<(), EngineError> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe {
        signal::sigaction(Signal::SIGSEGV, &default).map_err(EngineError::Signal)?;
        signal::sigaction(
            Signal::from_c_int(mmiotrap_config::INTERRUPT_SIGNAL).unwrap(),
            &default,
        )
        .map_err(EngineError::Signal)?;
    }
    Ok(())
}

/// Blocks the two asynchronous signals the engine relies on for the duration
/// of `f`, so registry/interrupt-table mutations are never observed torn by
/// a handler running on the same thread.
pub(crate) fn with_signals_blocked<T>(f: impl FnOnce() -> T) -> T {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGSEGV);
    mask.add(Signal::from_c_int(mmiotrap_config::INTERRUPT_SIGNAL).unwrap());
    let mut old = SigSet::empty();
    let _ = signal::pthread_sigmask(signal::SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut old));
    let result = f();
    let _ = signal::pthread_sigmask(signal::SigmaskHow::SIG_SETMASK, Some(&old), None);
    result
}

// Re-exported so downstream code can name the saved-context type without
// reaching into `context` directly.
pub type Context = SignalContext;
