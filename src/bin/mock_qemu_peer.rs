//! Test-only helper: stands in for the QEMU process a [`Machine`] spawns.
//!
//! [`Machine::start`](vmdrive::machine::Machine::start) binds the `monitor`
//! and `shell` unix sockets itself and then runs the VM's start command,
//! which is expected to connect to both. Real QEMU does that; this binary
//! does the same thing against a scripted reply table so integration tests
//! can drive the real socket/framing code in `machine.rs` without a real
//! QEMU or guest. It is driven entirely by environment variables (inherited
//! from the test process, see `tests/helpers.rs::mock_peer_script`) so no
//! command-line parsing is needed:
//!
//! - `MOCK_MONITOR_PROMPT` — written once right after the monitor connects
//!   (default `"(qemu) "`).
//! - `MOCK_MONITOR_REPLY_<n>` — written after the `n`-th line read from the
//!   monitor (default: the prompt again, so repeated `sendkey`-style
//!   commands keep working without being scripted individually).
//! - `MOCK_NO_SHELL` — if set, never connects the shell socket at all
//!   (exercises the monitor-only path).
//! - `MOCK_BANNER` — written once right after the shell connects, consumed
//!   by [`Machine::connect`](vmdrive::machine::Machine::connect) as the root
//!   shell banner (default `"booted\n"`).
//! - `MOCK_SHELL_REPLY_<n>` — written after the `n`-th command read from the
//!   shell (default `"|!EOF 0\n"`).
//!
//! To model real QEMU's exit behavior for [`Machine::crash`] and
//! [`Machine::shutdown`], a bare `quit` line on the monitor or a bare
//! `poweroff` line on the shell (i.e. not wrapped in the `execute` sentinel)
//! exits the whole process, the way `(qemu) quit` and an in-guest
//! `poweroff` actually terminate QEMU.

use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

fn reply_for(prefix: &str, idx: usize, default: &str) -> String {
    env::var(format!("{prefix}_{idx}")).unwrap_or_else(|_| default.to_string())
}

fn drive_monitor(mut monitor: UnixStream) {
    let prompt = env::var("MOCK_MONITOR_PROMPT").unwrap_or_else(|_| "(qemu) ".to_string());
    monitor
        .write_all(prompt.as_bytes())
        .expect("write initial monitor prompt");

    let mut buf = [0u8; 1024];
    let mut idx = 0usize;
    loop {
        let n = match monitor.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if buf[..n].starts_with(b"quit") {
            std::process::exit(0);
        }
        let reply = reply_for("MOCK_MONITOR_REPLY", idx, &prompt);
        if monitor.write_all(reply.as_bytes()).is_err() {
            return;
        }
        idx += 1;
    }
}

fn drive_shell(mut shell: UnixStream) {
    let banner = env::var("MOCK_BANNER").unwrap_or_else(|_| "booted\n".to_string());
    shell.write_all(banner.as_bytes()).expect("write shell banner");

    let mut buf = [0u8; 4096];
    let mut idx = 0usize;
    loop {
        let n = match shell.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if buf[..n].starts_with(b"poweroff") {
            std::process::exit(0);
        }
        let reply = reply_for("MOCK_SHELL_REPLY", idx, "|!EOF 0\n");
        if shell.write_all(reply.as_bytes()).is_err() {
            return;
        }
        idx += 1;
    }
}

fn main() {
    let monitor = UnixStream::connect("monitor").expect("connect monitor socket");

    if env::var_os("MOCK_NO_SHELL").is_some() {
        drive_monitor(monitor);
        return;
    }

    let shell_thread = std::thread::spawn(|| {
        let shell = UnixStream::connect("shell").expect("connect shell socket");
        drive_shell(shell);
    });

    drive_monitor(monitor);
    let _ = shell_thread.join();
}
