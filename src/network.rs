//! Network Fabric: one VDE switch per VLAN, brought up before any VM starts.

use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::debug;
use nix::pty::openpty;

use crate::logger::Logger;

/// How long to wait for `vde_switch`'s handshake line before giving up.
///
/// The original driver writes `"version\n"` to the switch's control pty and
/// blocks forever on the read; that is a known defect (§9 Open Question 1).
/// This rewrite bounds the wait instead of reproducing the hang, turning a
/// misbehaving switch into a `Setup failure` (§7) rather than a wedged
/// process.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// One VDE switch backing a VLAN.
pub struct Vlan {
    id: String,
    ctl: PathBuf,
    process: Child,
    /// Keeps the pty master end open for the lifetime of the switch; if this
    /// is dropped before the switch exits, the slave side sees EOF.
    _pty_master: File,
}

impl Vlan {
    /// Parse `VLANS`-style input (whitespace-separated ids) into an
    /// insertion-deduplicated order.
    pub fn parse_ids(raw: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for id in raw.split_whitespace() {
            if !seen.iter().any(|s: &String| s == id) {
                seen.push(id.to_string());
            }
        }
        seen
    }

    /// Launch the switch for VLAN `id` inside `cwd`, and export
    /// `QEMU_VDE_SOCKET_<id>` so subsequently spawned QEMUs pick it up.
    pub fn start(id: &str, cwd: &std::path::Path, logger: &Logger) -> Result<Self> {
        logger.log(&format!("starting VDE switch for network {id}"), &[]);

        let ctl = cwd.join(format!("vde{id}.ctl"));

        let pty = openpty(None, None).context("Failed to allocate pty for vde_switch")?;
        let master_fd: OwnedFd = pty.master;
        let slave_fd: OwnedFd = pty.slave;

        let mut process = Command::new("vde_switch")
            .arg("-s")
            .arg(&ctl)
            .arg("--dirmode")
            .arg("0777")
            .stdin(Stdio::from(File::from(slave_fd)))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn vde_switch")?;

        let mut master = File::from(master_fd);
        master
            .write_all(b"version\n")
            .context("Failed to write handshake to vde_switch")?;

        let stdout = process.stdout.take().expect("stdout is piped");
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            let _ = reader.read_line(&mut line);
            let _ = tx.send(line);
        });

        match rx.recv_timeout(HANDSHAKE_TIMEOUT) {
            Ok(line) => debug!("vde_switch {id} handshake: {}", line.trim_end()),
            Err(_) => {
                let _ = process.kill();
                let _ = process.wait();
                bail!("cannot start vde_switch: no handshake within {HANDSHAKE_TIMEOUT:?}");
            }
        }

        if !ctl.join("ctl").exists() {
            let _ = process.kill();
            let _ = process.wait();
            bail!("cannot start vde_switch");
        }

        env::set_var(format!("QEMU_VDE_SOCKET_{id}"), &ctl);

        Ok(Self {
            id: id.to_string(),
            ctl,
            process,
            _pty_master: master,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ctl_socket(&self) -> &std::path::Path {
        &self.ctl
    }

    /// Kill the switch process. Safe to call more than once.
    pub fn kill(&mut self) {
        if let Ok(None) = self.process.try_wait() {
            let _ = self.process.kill();
            let _ = self.process.wait();
        }
    }
}

impl Drop for Vlan {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ids_dedup_preserves_order() {
        assert_eq!(
            Vlan::parse_ids("3 1 2 1 3"),
            vec!["3".to_string(), "1".to_string(), "2".to_string()]
        );
    }

    #[test]
    fn test_parse_ids_empty() {
        assert_eq!(Vlan::parse_ids("   "), Vec::<String>::new());
    }
}
