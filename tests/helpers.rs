//! Shared setup for the integration tests in `test.rs`, mirroring the
//! teacher's own `tests/helpers.rs` + `tests/test.rs` split: this file holds
//! fixture/mock plumbing, `test.rs` holds scenario bodies.
//!
//! None of these tests need a real QEMU: `Machine::start` binds the
//! `monitor`/`shell` sockets itself and waits for its start command to
//! connect to them, so any process that connects and speaks the wire
//! protocol in §4.5.3/§4.5.4 of the spec works. `mock_qemu_peer` (a
//! `src/bin/` helper in this crate) is that process, scripted entirely
//! through environment variables.

use std::env;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use vmdrive::logger::Logger;
use vmdrive::machine::Machine;

/// Serializes tests that script `mock_qemu_peer` via `std::env::set_var`.
/// `Command::spawn` inherits the whole process environment, and `cargo test`
/// runs tests on multiple threads by default, so two tests racing to set
/// different `MOCK_*` vars around their own `spawn` call could otherwise
/// bleed into each other.
pub fn lock_env() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}

/// RAII guard that sets an environment variable and removes it on drop.
/// Must be constructed while holding `lock_env()`.
pub struct EnvVar(&'static str);

impl EnvVar {
    pub fn set(key: &'static str, value: &str) -> Self {
        env::set_var(key, value);
        Self(key)
    }
}

impl Drop for EnvVar {
    fn drop(&mut self) {
        env::remove_var(self.0);
    }
}

/// Path to the `mock_qemu_peer` binary Cargo builds alongside the tests.
pub fn mock_peer_script() -> String {
    env!("CARGO_BIN_EXE_mock_qemu_peer").to_string()
}

/// Opens a [`Logger`] writing into `dir/log.xml`, the way `Driver::new` does.
pub fn open_logger(dir: &Path) -> Arc<Logger> {
    Arc::new(Logger::open(&dir.join("log.xml")).expect("Failed to open logger"))
}

/// Builds a quiescent [`Machine`] whose start command is `mock_qemu_peer`.
pub fn mock_machine(name: &str, tmpdir: &Path, logger: Arc<Logger>) -> Machine {
    Machine::new(
        mock_peer_script(),
        Some(name.to_string()),
        tmpdir,
        true,
        logger,
    )
    .expect("Failed to construct Machine")
}
