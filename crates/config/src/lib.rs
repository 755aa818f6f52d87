//! Runtime configuration
//!
//! Hosts the environment variables that steer the trap engine, the chosen
//! defaults, and small helpers to read them. Everything here is read at
//! runtime (unlike the compile-time `option_env!` knobs of a bare-metal
//! build) since the engine is an ordinary Linux process.

use std::path::PathBuf;
use std::time::Duration;

// ——————————————————————————————— Capacity ————————————————————————————————— //

/// Upper bound on the number of simultaneously registered devices.
pub const MAX_DEVICES: usize = 16;

/// Upper bound on the number of distinct interrupt ids with a registered handler.
pub const MAX_INTERRUPT_HANDLERS: usize = 16;

// ———————————————————————————————— Logging ————————————————————————————————— //

/// The desired log level, e.g. `trace`, `debug`, `info`, `warn`, `error`, `off`.
pub const LOG_LEVEL_ENV: &str = "MMIOTRAP_LOG";

// ———————————————————————————————— Signals ————————————————————————————————— //

/// The process signal used to deliver interrupts to the driver.
///
/// `SIGSEGV` is reserved for the memory-access violation path (C4) and is not
/// configurable; this is the one free channel the model uses to wake us up.
pub const INTERRUPT_SIGNAL: libc::c_int = libc::SIGUSR1;

// ————————————————————————————— Rendezvous paths ———————————————————————————— //

const MODEL_SOCKET_ENV: &str = "MMIOTRAP_MODEL_SOCKET";
const DEFAULT_MODEL_SOCKET: &str = "/tmp/mmiotrap-model.sock";

const INTERRUPT_SOCKET_ENV: &str = "MMIOTRAP_INTERRUPT_SOCKET";
const DEFAULT_INTERRUPT_SOCKET: &str = "/tmp/mmiotrap-interrupt.sock";

const PID_FILE_ENV: &str = "MMIOTRAP_PID_FILE";
const DEFAULT_PID_FILE: &str = "/tmp/mmiotrap-engine.pid";

const PARAM_DIR_ENV: &str = "MMIOTRAP_PARAM_DIR";
const DEFAULT_PARAM_DIR: &str = "/tmp";

/// Path of the local stream socket the device model listens on for READ/WRITE requests.
pub fn model_socket_path() -> PathBuf {
    env_or(MODEL_SOCKET_ENV, DEFAULT_MODEL_SOCKET)
}

/// Path of the local stream socket the engine listens on for the synchronous interrupt path.
pub fn interrupt_socket_path() -> PathBuf {
    env_or(INTERRUPT_SOCKET_ENV, DEFAULT_INTERRUPT_SOCKET)
}

/// Path of the PID rendezvous file written at init so a model can find the driver process.
pub fn pid_file_path() -> PathBuf {
    env_or(PID_FILE_ENV, DEFAULT_PID_FILE)
}

/// Path of the parameter drop file a model writes before signalling the given pid.
pub fn interrupt_param_path(pid: u32) -> PathBuf {
    let mut dir = env_or(PARAM_DIR_ENV, DEFAULT_PARAM_DIR);
    dir.push(format!("mmiotrap-interrupt-{pid}.param"));
    dir
}

/// Timeout budget for one [`poll_model_interrupts`](#) cycle.
pub const POLL_INTERRUPT_TIMEOUT: Duration = Duration::from_millis(100);

fn env_or(var: &str, default: &str) -> PathBuf {
    std::env::var_os(var).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(default))
}
