//! Interrupt Delivery (C5)
//!
//! A model wakes the driver process asynchronously, through a primitive and
//! signal-safe protocol:
//!
//! 1. At init, the engine writes its own pid to a well-known rendezvous file.
//! 2. To deliver an interrupt, the model writes `"D,I"` to a parameter file
//!    named after the driver's pid, then sends [`mmiotrap_config::INTERRUPT_SIGNAL`].
//! 3. The driver's signal handler opens that file, parses the pair, invokes
//!    the callback registered for `I`, and unlinks the file.
//!
//! A synchronous alternative exists for test fixtures where signal delivery
//! is inconvenient: [`InterruptTable::poll`] accepts one inbound connection
//! on the interrupt listening socket and dispatches an `INTERRUPT` message
//! the same way.
//!
//! Callback arity: the reference taken here is the single-argument form,
//! `fn(interrupt_id: u32)`. Some variants of this engine seen elsewhere carry
//! the device id too; this rewrite standardizes on interrupt id alone (see
//! the open question in the design notes).

use std::io::Read;
use std::os::unix::net::UnixListener;
use std::sync::Mutex;
use std::time::Instant;

use mmiotrap_config::MAX_INTERRUPT_HANDLERS;
use mmiotrap_protocol::{Command, Message, WIRE_SIZE};

use crate::with_signals_blocked;

#[derive(Debug, thiserror::Error)]
pub enum InterruptError {
    #[error("interrupt handler table is full ({MAX_INTERRUPT_HANDLERS} handlers)")]
    Full,
}

/// The fixed-capacity `interrupt id -> callback` table (C5's "Interrupt
/// handler table"), plus the listening socket used for the synchronous
/// polling path.
pub struct InterruptTable {
    handlers: Mutex<Vec<(u32, fn(u32))>>,
    listener: Mutex<Option<UnixListener>>,
}

impl InterruptTable {
    pub fn new() -> InterruptTable {
        InterruptTable {
            handlers: Mutex::new(Vec::with_capacity(MAX_INTERRUPT_HANDLERS)),
            listener: Mutex::new(None),
        }
    }

    pub fn register(&self, interrupt_id: u32, callback: fn(u32)) -> Result<(), InterruptError> {
        with_signals_blocked(|| {
            let mut handlers = self.handlers.lock().unwrap();
            if let Some(slot) = handlers.iter_mut().find(|(id, _)| *id == interrupt_id) {
                slot.1 = callback;
                return Ok(());
            }
            if handlers.len() >= MAX_INTERRUPT_HANDLERS {
                return Err(InterruptError::Full);
            }
            handlers.push((interrupt_id, callback));
            Ok(())
        })
    }

    /// Invokes the callback registered for `interrupt_id`, if any. An
    /// unregistered id is silently dropped (and logged), never a crash.
    fn dispatch(&self, interrupt_id: u32) {
        let callback = {
            let handlers = self.handlers.lock().unwrap();
            handlers
                .iter()
                .find(|(id, _)| *id == interrupt_id)
                .map(|(_, cb)| *cb)
        };
        match callback {
            Some(cb) => cb(interrupt_id),
            None => log::warn!("interrupt {interrupt_id} delivered with no registered handler"),
        }
    }

    pub fn bind_listener(&self) -> std::io::Result<()> {
        let path = mmiotrap_config::interrupt_socket_path();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        *self.listener.lock().unwrap() = Some(listener);
        Ok(())
    }

    pub fn unbind_listener(&self) {
        if let Some(listener) = self.listener.lock().unwrap().take() {
            drop(listener);
        }
        let _ = std::fs::remove_file(mmiotrap_config::interrupt_socket_path());
    }

    /// Runs one non-blocking accept-and-dispatch cycle, bounded by
    /// [`mmiotrap_config::POLL_INTERRUPT_TIMEOUT`]. Returns whether an
    /// interrupt was dispatched.
    pub fn poll(&self) -> bool {
        let deadline = Instant::now() + mmiotrap_config::POLL_INTERRUPT_TIMEOUT;
        let guard = self.listener.lock().unwrap();
        let Some(listener) = guard.as_ref() else {
            return false;
        };

        loop {
            match listener.accept() {
                Ok((mut stream, _)) => {
                    let mut buf = [0u8; WIRE_SIZE];
                    if stream.read_exact(&mut buf).is_err() {
                        return false;
                    }
                    let Ok(message) = Message::decode(&buf) else {
                        return false;
                    };
                    if message.command == Command::Interrupt {
                        self.dispatch(message.length);
                        return true;
                    }
                    return false;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(_) => return false,
            }
        }
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the engine's own pid to the well-known rendezvous file so a model
/// can discover where to send parameter drops and signals.
pub fn write_pid_file() -> std::io::Result<()> {
    let pid = std::process::id();
    std::fs::write(mmiotrap_config::pid_file_path(), pid.to_string())
}

pub fn remove_pid_file() {
    let _ = std::fs::remove_file(mmiotrap_config::pid_file_path());
}

/// The `SA_SIGINFO`-free trampoline installed for [`mmiotrap_config::INTERRUPT_SIGNAL`].
///
/// Opens this process's parameter drop file, parses the `"device,interrupt"`
/// pair the model wrote, dispatches to the registered callback, and unlinks
/// the file. Per the callback contract (see crate docs), registered
/// callbacks themselves must not allocate or block; this trampoline does the
/// unavoidable file I/O itself, outside user code.
pub extern "C" fn sigusr1_trampoline(_signum: libc::c_int) {
    let Some(engine) = crate::Engine::get() else {
        return;
    };

    let path = mmiotrap_config::interrupt_param_path(std::process::id());
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return;
    };
    let _ = std::fs::remove_file(&path);

    if let Some((_device, interrupt_id)) = parse_param(&contents) {
        engine.interrupts.dispatch(interrupt_id);
    }
}

/// Parses the `"D,I"` ASCII record the model drops before signalling us.
fn parse_param(contents: &str) -> Option<(u32, u32)> {
    let trimmed = contents.trim();
    let (device, interrupt) = trimmed.split_once(',')?;
    Some((device.trim().parse().ok()?, interrupt.trim().parse().ok()?))
}
