//! Machine Controller: owns one guest's lifecycle, multiplexes the monitor,
//! shell, and serial streams, and exposes the verb surface scripts drive.

use std::cell::RefCell;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use regex::Regex;

use crate::key_map;
use crate::logger::{Attrs, Logger};
use crate::retry::retry;

/// Exact text QEMU's HMP writes once it is ready to accept commands.
const MONITOR_PROMPT: &str = "(qemu) ";

/// Sentinel appended to every shell command so the driver can recover both
/// the command's merged output and its exit status from an otherwise
/// promptless shell (§4.5.4).
fn command_wrapper(cmd: &str) -> String {
    format!("( {cmd} ); echo '|!EOF' $?\n")
}

fn status_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^(.*)\|!EOF\s+(\d+)").expect("static regex is valid"))
}

fn unit_line_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([^=]+)=(.*)$").expect("static regex is valid"))
}

/// Bind a unix listening socket at `path`, unlinking any stale socket file
/// first. Only ever one peer (QEMU) connects, so the OS's default backlog is
/// never actually exercised.
fn create_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed to unlink stale {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))
}

/// Accept exactly one connection on a listener created by [`create_socket`].
fn accept_one(listener: &UnixListener) -> Result<UnixStream> {
    let (stream, _) = listener.accept().context("Failed to accept connection")?;
    Ok(stream)
}

/// Whether a binary is reachable via `$PATH` (used to gate OCR on
/// `tesseract`'s availability, matching `shutil.which` in the source).
fn binary_exists(name: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {name} >/dev/null 2>&1"))
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Drains the guest's merged stdout/stderr pipe line-by-line into the
/// logger's serial queue, mirroring each line to stderr as it arrives. Reads
/// raw bytes and decodes permissively (§4.5.1 step 5 — the Python source
/// uses `decode("unicode_escape")`), so a guest that writes non-UTF-8 bytes
/// does not kill the drain loop; only EOF or a real I/O error stops it.
fn spawn_drain_thread(name: String, logger: Arc<Logger>, stream: impl Read + Send + 'static) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        loop {
            let mut raw = Vec::new();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    eprintln!("{name} # {line}");
                    logger.enqueue(&name, line);
                }
                Err(e) => {
                    debug!("serial drain for {name} stopped: {e}");
                    break;
                }
            }
        }
    });
}

struct Inner {
    child: Option<Child>,
    monitor: Option<UnixStream>,
    shell: Option<UnixStream>,
    pid: Option<u32>,
    booted: bool,
    connected: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            child: None,
            monitor: None,
            shell: None,
            pid: None,
            booted: false,
            connected: false,
        }
    }
}

/// Structured launch parameters for a machine whose QEMU command line is
/// synthesized rather than supplied verbatim (§3 "Launch"). Mirrors the
/// `args` dict `Machine.__init__`/`create_startcommand` take in the source
/// (test-driver.py:196-277): when `start_command` is left unset the command
/// is assembled from these fields by [`create_start_command`] instead.
#[derive(Debug, Clone, Default)]
pub struct MachineArgs {
    pub name: Option<String>,
    pub start_command: Option<String>,
    pub net_backend_args: Option<String>,
    pub net_frontend_args: Option<String>,
    pub hda: Option<String>,
    pub hda_interface: Option<String>,
    pub cdrom: Option<String>,
    pub usb: Option<String>,
    pub bios: Option<String>,
    pub qemu_flags: Option<String>,
    pub allow_reboot: bool,
}

/// Join `path` with the current directory if it is relative, the way
/// Python's `os.path.abspath` does (test-driver.py:246) — unlike
/// `fs::canonicalize`, this does not require the path to exist or resolve
/// symlinks.
fn abspath(path: &str) -> String {
    let p = Path::new(path);
    if p.is_absolute() {
        return p.to_string_lossy().into_owned();
    }
    env::current_dir()
        .map(|cwd| cwd.join(p).to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Synthesize a QEMU command line from structured args, byte-for-byte
/// following `create_startcommand` in the source (test-driver.py:230-277):
/// a user-net backend/frontend pair, optionally extended by
/// `net_backend_args`/`net_frontend_args`; an `hda` drive (SCSI if
/// `hda_interface` is `"scsi"`, else attached via `hda_interface` directly);
/// an optional `cdrom`, `usb` disk, and `bios`; finally any raw
/// `qemu_flags` appended verbatim.
fn create_start_command(args: &MachineArgs) -> String {
    let mut net_backend = "-netdev user,id=net0".to_string();
    if let Some(extra) = &args.net_backend_args {
        net_backend.push(',');
        net_backend.push_str(extra);
    }

    let mut net_frontend = "-device virtio-net-pci,netdev=net0".to_string();
    if let Some(extra) = &args.net_frontend_args {
        net_frontend.push(',');
        net_frontend.push_str(extra);
    }

    let mut cmd = format!("qemu-kvm -m 384 {net_backend} {net_frontend} $QEMU_OPTS ");

    if let Some(hda) = &args.hda {
        let hda_path = abspath(hda);
        if args.hda_interface.as_deref() == Some("scsi") {
            cmd.push_str(&format!(
                "-drive id=hda,file={hda_path},werror=report,if=none -device scsi-hd,drive=hda "
            ));
        } else {
            let iface = args.hda_interface.as_deref().unwrap_or("");
            cmd.push_str(&format!("-drive file={hda_path},if={iface},werror=report "));
        }
    }

    if let Some(cdrom) = &args.cdrom {
        cmd.push_str(&format!("-cdrom {cdrom} "));
    }

    if let Some(usb) = &args.usb {
        cmd.push_str(&format!(
            "-device piix3-usb-uhci -drive id=usbdisk,file={usb},if=none,readonly \
             -device usb-storage,drive=usbdisk "
        ));
    }

    if let Some(bios) = &args.bios {
        cmd.push_str(&format!("-bios {bios} "));
    }

    if let Some(flags) = &args.qemu_flags {
        cmd.push_str(flags);
    }

    cmd
}

/// Owns one guest's lifecycle.
pub struct Machine {
    name: String,
    script: String,
    state_dir: PathBuf,
    shared_dir: PathBuf,
    allow_reboot: bool,
    logger: Arc<Logger>,
    inner: RefCell<Inner>,
}

impl Machine {
    /// Construct a quiescent machine. Does not start QEMU.
    ///
    /// `start_command` is used both as the shell command to launch QEMU and,
    /// when `name` is `None`, to derive the machine's name from a
    /// `run-(.+)-vm` suffix (falling back to `"machine"`).
    pub fn new(
        start_command: String,
        name: Option<String>,
        tmpdir: &Path,
        allow_reboot: bool,
        logger: Arc<Logger>,
    ) -> Result<Self> {
        let name = name.unwrap_or_else(|| derive_name(&start_command));

        let state_dir = tmpdir.join(format!("vm-state-{name}"));
        fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create {}", state_dir.display()))?;
        fs::set_permissions(&state_dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to chmod {}", state_dir.display()))?;

        let shared_dir = tmpdir.join("xchg-shared");
        fs::create_dir_all(&shared_dir)
            .with_context(|| format!("Failed to create {}", shared_dir.display()))?;

        Ok(Self {
            name,
            script: start_command,
            state_dir,
            shared_dir,
            allow_reboot,
            logger,
            inner: RefCell::new(Inner::default()),
        })
    }

    /// Construct a quiescent machine from structured launch parameters
    /// (§3 "Launch"), synthesizing its start command via
    /// [`create_start_command`] when `args.start_command` is unset.
    pub fn from_args(args: MachineArgs, tmpdir: &Path, logger: Arc<Logger>) -> Result<Self> {
        let allow_reboot = args.allow_reboot;
        let name = args.name.clone();
        let start_command = args
            .start_command
            .clone()
            .unwrap_or_else(|| create_start_command(&args));
        Self::new(start_command, name, tmpdir, allow_reboot, logger)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// `booted && connected` (§3).
    pub fn is_up(&self) -> bool {
        let inner = self.inner.borrow();
        inner.booted && inner.connected
    }

    fn machine_attrs<'b>(&'b self, extra: Attrs<'b>) -> Vec<(&'b str, &'b str)> {
        let mut attrs = vec![("machine", self.name.as_str())];
        attrs.extend_from_slice(extra);
        attrs
    }

    pub fn log(&self, msg: &str) {
        self.logger.log(msg, &self.machine_attrs(&[]));
    }

    fn nested<'b>(&'b self, msg: &str, extra: Attrs<'b>) -> crate::logger::NestGuard<'b> {
        let attrs = self.machine_attrs(extra);
        self.logger.nested(msg, &attrs)
    }

    // -- startup / shutdown -------------------------------------------------

    /// Idempotent: spawns QEMU, accepts the monitor and shell connections,
    /// and blocks until the monitor prompt appears (§4.5.1).
    pub fn start(&self) -> Result<()> {
        if self.inner.borrow().booted {
            return Ok(());
        }

        self.log("starting vm");

        let monitor_path = self.state_dir.join("monitor");
        let shell_path = self.state_dir.join("shell");
        let monitor_listener = create_socket(&monitor_path)?;
        let shell_listener = create_socket(&shell_path)?;

        let mut opts: Vec<String> = Vec::new();
        if !self.allow_reboot {
            opts.push("-no-reboot".to_string());
        }
        opts.push(format!("-monitor unix:{}", monitor_path.display()));
        opts.push(format!(
            "-chardev socket,id=shell,path={}",
            shell_path.display()
        ));
        opts.push("-device virtio-serial".to_string());
        opts.push("-device virtconsole,chardev=shell".to_string());
        opts.push("-device virtio-rng-pci".to_string());
        opts.push(if env::var_os("DISPLAY").is_some() {
            "-serial stdio".to_string()
        } else {
            "-nographic".to_string()
        });
        let mut qemu_opts = opts.join(" ");
        if let Ok(existing) = env::var("QEMU_OPTS") {
            qemu_opts.push(' ');
            qemu_opts.push_str(&existing);
        }

        // A single real pipe, duped onto both fd 1 and fd 2 of the child, so
        // stdout and stderr land in one merged stream the way the Python
        // source's `stderr=subprocess.STDOUT` does (§4.5.1 step 3). Using two
        // independently-piped streams would let two drain threads race and
        // reorder interleaved guest output, violating the single-worker
        // concurrency model (§5).
        let (read_end, write_end) =
            nix::unistd::pipe().context("Failed to create output pipe")?;
        let stdout_write = fs::File::from(write_end);
        let stderr_write = stdout_write
            .try_clone()
            .context("Failed to duplicate output pipe write end")?;
        let output_read = fs::File::from(read_end);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.script)
            .current_dir(&self.state_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_write))
            .stderr(Stdio::from(stderr_write))
            .env("QEMU_OPTS", &qemu_opts)
            .env("SHARED_DIR", &self.shared_dir)
            .env("USE_TMPDIR", "1")
            .spawn()
            .context("Failed to spawn VM start command")?;

        // Guard the child so a failure anywhere between spawn and `booted`
        // (accept timeout, monitor prompt never arriving) still kills the
        // QEMU process instead of leaking it; `ScopeGuard::into_inner`
        // defuses the guard once we commit to `inner.child`.
        let mut child = scopeguard::guard(child, |mut child| {
            debug!("start() bailed before boot completed, killing child");
            let _ = child.kill();
            let _ = child.wait();
        });

        let monitor = accept_one(&monitor_listener).context("Failed to accept monitor connection")?;
        let shell = accept_one(&shell_listener).context("Failed to accept shell connection")?;

        spawn_drain_thread(self.name.clone(), self.logger.clone(), output_read);

        {
            let mut inner = self.inner.borrow_mut();
            inner.monitor = Some(monitor);
            inner.shell = Some(shell);
        }

        self.wait_for_monitor_prompt()
            .context("QEMU monitor prompt never arrived")?;

        let pid = child.id();
        let child = scopeguard::ScopeGuard::into_inner(child);
        {
            let mut inner = self.inner.borrow_mut();
            inner.child = Some(child);
            inner.pid = Some(pid);
            inner.booted = true;
        }

        self.log(&format!("QEMU running (pid {pid})"));
        Ok(())
    }

    /// Lazily connects the shell channel: starts the VM if needed, consumes
    /// the root-shell banner, and marks the machine connected.
    pub fn connect(&self) -> Result<()> {
        if self.inner.borrow().connected {
            return Ok(());
        }

        let _scope = self.nested("waiting for the VM to finish booting", &[]);
        self.start()?;

        let tic = Instant::now();
        let mut buf = [0u8; 1024];
        {
            let inner = self.inner.borrow();
            let shell = inner.shell.as_ref().expect("booted implies shell is set");
            let _ = (&*shell).read(&mut buf).context("Failed to read shell banner")?;
        }
        let elapsed = tic.elapsed().as_secs_f64();

        self.log("connected to guest root shell");
        self.log(&format!("(connecting took {elapsed:.2} seconds)"));
        self.inner.borrow_mut().connected = true;
        Ok(())
    }

    /// Sends `poweroff` over the shell and waits for QEMU to exit.
    pub fn shutdown(&self) -> Result<()> {
        if !self.inner.borrow().booted {
            return Ok(());
        }
        {
            let inner = self.inner.borrow();
            let shell = inner.shell.as_ref().expect("booted implies shell is set");
            (&*shell)
                .write_all(b"poweroff\n")
                .context("Failed to send poweroff")?;
        }
        self.wait_for_shutdown()
    }

    /// Sends `quit` over the monitor and waits for QEMU to exit.
    pub fn crash(&self) -> Result<()> {
        if !self.inner.borrow().booted {
            return Ok(());
        }
        self.log("forced crash");
        self.send_monitor_command("quit")?;
        self.wait_for_shutdown()
    }

    /// Blocks on process exit, then clears `pid`/`booted`/`connected`.
    pub fn wait_for_shutdown(&self) -> Result<()> {
        if !self.inner.borrow().booted {
            return Ok(());
        }

        let _scope = self.nested("waiting for the VM to power off", &[]);
        let mut child = {
            let mut inner = self.inner.borrow_mut();
            inner.child.take()
        };
        if let Some(child) = child.as_mut() {
            child.wait().context("Failed to wait on VM process")?;
        }

        let mut inner = self.inner.borrow_mut();
        inner.pid = None;
        inner.booted = false;
        inner.connected = false;
        Ok(())
    }

    /// SIGKILLs the VM process if one is running. Used only by the driver's
    /// at-exit cleanup hook; safe to call more than once.
    pub fn force_kill(&self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(pid) = inner.pid {
            self.logger
                .log(&format!("killing {} (pid {pid})", self.name), &[]);
        }
        if let Some(child) = inner.child.as_mut() {
            let _ = child.kill();
        }
        inner.pid = None;
    }

    // -- monitor framing ------------------------------------------------

    fn wait_for_monitor_prompt(&self) -> Result<String> {
        let mut acc = String::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = {
                let inner = self.inner.borrow();
                let monitor = inner.monitor.as_ref().expect("monitor is connected by start()");
                (&*monitor).read(&mut buf).context("Failed to read from monitor")?
            };
            if n == 0 {
                bail!("monitor socket closed before prompt appeared");
            }
            acc.push_str(&String::from_utf8_lossy(&buf[..n]));
            if acc.ends_with(MONITOR_PROMPT) {
                return Ok(acc);
            }
        }
    }

    /// Writes `cmd + "\n"` to the monitor and returns the next prompted
    /// response. Exactly one command may be in flight at a time.
    pub fn send_monitor_command(&self, cmd: &str) -> Result<String> {
        self.log(&format!("sending monitor command: {cmd}"));
        {
            let inner = self.inner.borrow();
            let monitor = inner.monitor.as_ref().expect("monitor is connected by start()");
            (&*monitor)
                .write_all(format!("{cmd}\n").as_bytes())
                .context("Failed to write monitor command")?;
        }
        self.wait_for_monitor_prompt()
    }

    // -- shell framing ----------------------------------------------------

    /// Runs `cmd` inside the guest and returns its exit status plus merged
    /// stdout/stderr (§4.5.4). Connects lazily.
    pub fn execute(&self, cmd: &str) -> Result<(i32, String)> {
        self.connect()?;

        {
            let inner = self.inner.borrow();
            let shell = inner.shell.as_ref().expect("connect() ensures shell is set");
            (&*shell)
                .write_all(command_wrapper(cmd).as_bytes())
                .context("Failed to write shell command")?;
        }

        let mut buffer = String::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = {
                let inner = self.inner.borrow();
                let shell = inner.shell.as_ref().expect("connect() ensures shell is set");
                (&*shell).read(&mut buf).context("Failed to read from shell")?
            };
            if n == 0 {
                bail!("shell socket closed before command completed");
            }
            buffer.push_str(&String::from_utf8_lossy(&buf[..n]));

            if let Some(caps) = status_pattern().captures(&buffer) {
                let output = caps[1].to_string();
                let status: i32 = caps[2].parse().context("Non-numeric exit status")?;
                return Ok((status, output));
            }
        }
    }

    /// Runs each command and requires exit status 0, concatenating outputs.
    pub fn succeed(&self, commands: &[&str]) -> Result<String> {
        let mut output = String::new();
        for command in commands {
            let _scope = self.nested(&format!("must succeed: {command}"), &[]);
            let (status, out) = self.execute(command)?;
            if status != 0 {
                self.log(&format!("output: {out}"));
                bail!("command `{command}` failed (exit code {status})");
            }
            output.push_str(&out);
        }
        Ok(output)
    }

    /// Runs each command and requires a non-zero exit status.
    pub fn fail(&self, commands: &[&str]) -> Result<()> {
        for command in commands {
            let _scope = self.nested(&format!("must fail: {command}"), &[]);
            let (status, _) = self.execute(command)?;
            if status == 0 {
                bail!("command `{command}` unexpectedly succeeded");
            }
        }
        Ok(())
    }

    pub fn wait_until_succeeds(&self, command: &str) -> Result<String> {
        let _scope = self.nested(&format!("waiting for success: {command}"), &[]);
        loop {
            let (status, output) = self.execute(command)?;
            if status == 0 {
                return Ok(output);
            }
        }
    }

    pub fn wait_until_fails(&self, command: &str) -> Result<String> {
        let _scope = self.nested(&format!("waiting for failure: {command}"), &[]);
        loop {
            let (status, output) = self.execute(command)?;
            if status != 0 {
                return Ok(output);
            }
        }
    }

    pub fn systemctl(&self, query: &str, user: Option<&str>) -> Result<(i32, String)> {
        match user {
            Some(user) => {
                let escaped = query.replace('\'', "\\'");
                self.execute(&format!(
                    "su -l {user} -c $'XDG_RUNTIME_DIR=/run/user/`id -u` systemctl --user {escaped}'"
                ))
            }
            None => self.execute(&format!("systemctl {query}")),
        }
    }

    pub fn get_unit_info(&self, unit: &str, user: Option<&str>) -> Result<HashMap<String, String>> {
        let (status, lines) = self.systemctl(&format!("--no-pager show \"{unit}\""), user)?;
        if status != 0 {
            bail!(
                "retrieving systemctl info for unit \"{unit}\"{} failed with exit code {status}",
                user.map(|u| format!(" under user \"{u}\"")).unwrap_or_default()
            );
        }

        let pattern = unit_line_pattern();
        Ok(lines
            .lines()
            .filter_map(|line| {
                pattern
                    .captures(line)
                    .map(|c| (c[1].to_string(), c[2].to_string()))
            })
            .collect())
    }

    pub fn wait_for_unit(&self, unit: &str, user: Option<&str>) -> Result<()> {
        loop {
            let info = self.get_unit_info(unit, user)?;
            let state = info
                .get("ActiveState")
                .ok_or_else(|| anyhow!("unit \"{unit}\" has no ActiveState"))?
                .clone();

            if state == "failed" {
                bail!("unit \"{unit}\" reached state \"{state}\"");
            }

            if state == "inactive" {
                let (_, jobs) = self.systemctl("list-jobs --full 2>&1", user)?;
                if jobs.contains("No jobs") {
                    let info = self.get_unit_info(unit, user)?;
                    if info.get("ActiveState") == Some(&state) {
                        bail!("unit \"{unit}\" is inactive and there are no pending jobs");
                    }
                }
            }

            if state == "active" {
                return Ok(());
            }
        }
    }

    pub fn require_unit_state(&self, unit: &str, require_state: &str) -> Result<()> {
        let _scope = self.nested(
            &format!("checking if unit '{unit}' has reached state '{require_state}'"),
            &[],
        );
        let info = self.get_unit_info(unit, None)?;
        let state = info
            .get("ActiveState")
            .ok_or_else(|| anyhow!("unit \"{unit}\" has no ActiveState"))?;
        if state != require_state {
            bail!("Expected unit '{unit}' to be in state 'active' but it is in state '{state}'");
        }
        Ok(())
    }

    pub fn start_job(&self, jobname: &str, user: Option<&str>) -> Result<(i32, String)> {
        self.systemctl(&format!("start {jobname}"), user)
    }

    pub fn stop_job(&self, jobname: &str, user: Option<&str>) -> Result<(i32, String)> {
        self.systemctl(&format!("stop {jobname}"), user)
    }

    pub fn wait_for_job(&self, jobname: &str) -> Result<()> {
        self.wait_for_unit(jobname, None)
    }

    pub fn wait_for_file(&self, filename: &str) -> Result<()> {
        let _scope = self.nested(&format!("waiting for file '{filename}'"), &[]);
        loop {
            let (status, _) = self.execute(&format!("test -e {filename}"))?;
            if status == 0 {
                return Ok(());
            }
        }
    }

    pub fn wait_for_open_port(&self, port: u16) -> Result<()> {
        let _scope = self.nested(&format!("waiting for TCP port {port}"), &[]);
        retry(|_last| {
            matches!(self.execute(&format!("nc -z localhost {port}")), Ok((0, _)))
        })
    }

    pub fn wait_for_closed_port(&self, port: u16) -> Result<()> {
        retry(|_last| {
            !matches!(self.execute(&format!("nc -z localhost {port}")), Ok((0, _)))
        })
    }

    pub fn get_tty_text(&self, tty: &str) -> Result<String> {
        let (_, output) = self.execute(&format!(
            "fold -w$(stty -F /dev/tty{tty} size | awk '{{print $2}}') /dev/vcs{tty}"
        ))?;
        Ok(output)
    }

    pub fn wait_until_tty_matches(&self, tty: &str, regexp: &str) -> Result<()> {
        let matcher = Regex::new(regexp).context("Invalid tty-match regex")?;
        let _scope = self.nested(&format!("waiting for {regexp} to appear on tty {tty}"), &[]);
        loop {
            let text = self.get_tty_text(tty)?;
            if matcher.is_match(&text) {
                return Ok(());
            }
        }
    }

    pub fn dump_tty_contents(&self, tty: &str) -> Result<()> {
        self.execute(&format!("fold -w 80 /dev/vcs{tty} | systemd-cat"))?;
        Ok(())
    }

    // -- graphical subsystem ----------------------------------------------

    pub fn send_key(&self, key: &str) -> Result<()> {
        let token = key_map::translate(key);
        self.send_monitor_command(&format!("sendkey {token}"))?;
        Ok(())
    }

    pub fn send_chars(&self, chars: &[&str]) -> Result<()> {
        let _scope = self.nested(&format!("sending keys '{}'", chars.join("")), &[]);
        for c in chars {
            self.send_key(c)?;
        }
        Ok(())
    }

    pub fn screenshot(&self, name: &str) -> Result<PathBuf> {
        let out_dir = env::var("out")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::current_dir().unwrap_or_default());
        let word_pattern = Regex::new(r"^\w+$").unwrap();

        let filename = if word_pattern.is_match(name) {
            out_dir.join(format!("{name}.png"))
        } else {
            PathBuf::from(name)
        };
        let tmp = filename.with_extension("ppm");

        let image_attr = filename
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let _scope = self.nested(
            &format!("making screenshot {}", filename.display()),
            &[("image", image_attr.as_str())],
        );

        self.send_monitor_command(&format!("screendump {}", tmp.display()))?;
        let tmp = scopeguard::guard(tmp, |tmp| {
            let _ = fs::remove_file(&tmp);
        });
        let status = Command::new("sh")
            .arg("-c")
            .arg(format!("pnmtopng {} > {}", tmp.display(), filename.display()))
            .status()
            .context("Failed to run pnmtopng")?;
        if !status.success() {
            bail!("Cannot convert screenshot");
        }

        Ok(filename)
    }

    /// Screendumps the framebuffer and runs it through the fixed ImageMagick
    /// + tesseract pipeline. The exact flags are part of the external
    /// contract (§4.5.6): changing them changes recognition rates.
    pub fn get_screen_text(&self) -> Result<String> {
        if !binary_exists("tesseract") {
            bail!("get_screen_text used but tesseract is not on PATH");
        }

        const MAGICK_ARGS: &str = "-filter Catrom -density 72 -resample 300 \
            -contrast -normalize -despeckle -type grayscale \
            -sharpen 1 -posterize 3 -negate -gamma 100 -blur 1x65535";
        const TESS_ARGS: &str = "-c debug_file=/dev/null --psm 11 --oem 2";

        let _scope = self.nested("performing optical character recognition", &[]);
        let tmpin = tempfile::Builder::new()
            .prefix("vmdrive-screendump")
            .tempfile()
            .context("Failed to create OCR temp file")?;

        self.send_monitor_command(&format!("screendump {}", tmpin.path().display()))?;

        let cmd = format!(
            "convert {MAGICK_ARGS} {} tiff:- | tesseract - - {TESS_ARGS}",
            tmpin.path().display()
        );
        let output = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .output()
            .context("Failed to run OCR pipeline")?;
        if !output.status.success() {
            bail!("OCR failed with exit code {:?}", output.status.code());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub fn wait_for_text(&self, regex: &str) -> Result<()> {
        let matcher = Regex::new(regex).context("Invalid screen-text regex")?;
        let _scope = self.nested(&format!("waiting for {regex} to appear on screen"), &[]);
        retry(|last| match self.get_screen_text() {
            Ok(text) => {
                let matches = matcher.is_match(&text);
                if last && !matches {
                    self.log(&format!("Last OCR attempt failed. Text was: {text}"));
                }
                matches
            }
            Err(e) => {
                if last {
                    self.log(&format!("Last OCR attempt errored: {e:#}"));
                }
                false
            }
        })
    }

    pub fn wait_for_x(&self) -> Result<()> {
        let _scope = self.nested("waiting for the X11 server", &[]);
        loop {
            let (status, _) = self.execute(
                "journalctl -b SYSLOG_IDENTIFIER=systemd | grep \"Reached target Current graphical\"",
            )?;
            if status != 0 {
                continue;
            }
            let (status, _) = self.execute("[ -e /tmp/.X11-unix/X0 ]")?;
            if status == 0 {
                return Ok(());
            }
        }
    }

    pub fn get_window_names(&self) -> Result<Vec<String>> {
        let out = self.succeed(&[
            r#"xwininfo -root -tree | sed 's/.*0x[0-9a-f]* "\([^"]*\)".*/\1/; t; d'"#,
        ])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub fn wait_for_window(&self, regexp: &str) -> Result<()> {
        let pattern = Regex::new(regexp).context("Invalid window-name regex")?;
        let _scope = self.nested("Waiting for a window to appear", &[]);
        retry(|last_try| {
            let names = match self.get_window_names() {
                Ok(n) => n,
                Err(_) => return false,
            };
            if last_try {
                self.log(&format!(
                    "Last chance to match {regexp} on the window list, which currently contains: {}",
                    names.join(", ")
                ));
            }
            names.iter().any(|n| pattern.is_match(n))
        })
    }

    // -- network-link -------------------------------------------------------

    pub fn forward_port(&self, host_port: u16, guest_port: u16) -> Result<()> {
        self.send_monitor_command(&format!("hostfwd_add tcp::{host_port}-:{guest_port}"))?;
        Ok(())
    }

    pub fn block(&self) -> Result<()> {
        self.send_monitor_command("set_link virtio-net-pci.1 off")?;
        Ok(())
    }

    pub fn unblock(&self) -> Result<()> {
        self.send_monitor_command("set_link virtio-net-pci.1 on")?;
        Ok(())
    }
}

/// Derive a machine's name from a `run-(.+)-vm` suffix in its start
/// command, falling back to `"machine"` (§4.6).
fn derive_name(start_command: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"run-(.+)-vm$").expect("static regex is valid"));
    re.captures(start_command)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "machine".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/nix/store/abc-run-foo-vm", "foo")]
    #[case("/nix/store/abc-run-my-cool-service-vm", "my-cool-service")]
    #[case("/bin/true", "machine")]
    #[case("", "machine")]
    fn test_derive_name(#[case] command: &str, #[case] expected: &str) {
        assert_eq!(derive_name(command), expected);
    }

    #[test]
    fn test_command_wrapper() {
        assert_eq!(command_wrapper("echo hello"), "( echo hello ); echo '|!EOF' $?\n");
    }

    #[test]
    fn test_create_start_command_minimal() {
        let cmd = create_start_command(&MachineArgs::default());
        assert_eq!(
            cmd,
            "qemu-kvm -m 384 -netdev user,id=net0 -device virtio-net-pci,netdev=net0 $QEMU_OPTS "
        );
    }

    #[test]
    fn test_create_start_command_hda_default_interface() {
        let args = MachineArgs {
            hda: Some("/tmp/disk.qcow2".to_string()),
            hda_interface: Some("virtio".to_string()),
            ..Default::default()
        };
        let cmd = create_start_command(&args);
        assert!(cmd.contains("-drive file=/tmp/disk.qcow2,if=virtio,werror=report "));
    }

    #[test]
    fn test_create_start_command_hda_scsi_interface() {
        let args = MachineArgs {
            hda: Some("/tmp/disk.qcow2".to_string()),
            hda_interface: Some("scsi".to_string()),
            ..Default::default()
        };
        let cmd = create_start_command(&args);
        assert!(cmd.contains(
            "-drive id=hda,file=/tmp/disk.qcow2,werror=report,if=none -device scsi-hd,drive=hda "
        ));
    }

    #[test]
    fn test_create_start_command_cdrom_usb_bios_and_flags() {
        let args = MachineArgs {
            cdrom: Some("/tmp/disk.iso".to_string()),
            usb: Some("/tmp/usb.img".to_string()),
            bios: Some("/tmp/bios.bin".to_string()),
            qemu_flags: Some("-smp 2".to_string()),
            ..Default::default()
        };
        let cmd = create_start_command(&args);
        assert!(cmd.contains("-cdrom /tmp/disk.iso "));
        assert!(cmd.contains("-device piix3-usb-uhci -drive id=usbdisk,file=/tmp/usb.img,if=none,readonly -device usb-storage,drive=usbdisk "));
        assert!(cmd.contains("-bios /tmp/bios.bin "));
        assert!(cmd.ends_with("-smp 2"));
    }

    #[test]
    fn test_create_start_command_net_args_appended() {
        let args = MachineArgs {
            net_backend_args: Some("hostfwd=tcp::2222-:22".to_string()),
            net_frontend_args: Some("mac=52:54:00:00:00:01".to_string()),
            ..Default::default()
        };
        let cmd = create_start_command(&args);
        assert!(cmd.contains("-netdev user,id=net0,hostfwd=tcp::2222-:22 "));
        assert!(cmd.contains("-device virtio-net-pci,netdev=net0,mac=52:54:00:00:00:01 "));
    }

    #[test]
    fn test_abspath_passes_through_absolute_paths() {
        assert_eq!(abspath("/already/absolute"), "/already/absolute");
    }

    #[test]
    fn test_status_pattern_basic() {
        let caps = status_pattern().captures("hello\n|!EOF 0\n").unwrap();
        assert_eq!(&caps[1], "hello\n");
        assert_eq!(&caps[2], "0");
    }

    #[test]
    fn test_status_pattern_nonzero() {
        let caps = status_pattern().captures("oops\n|!EOF 2\n").unwrap();
        assert_eq!(&caps[1], "oops\n");
        assert_eq!(&caps[2], "2");
    }

    #[test]
    fn test_status_pattern_no_sentinel_in_output() {
        // Outputs that merely mention "EOF" without the exact sentinel must
        // not be mistaken for the terminator.
        assert!(status_pattern().captures("note: reached EOF\n").is_none());
    }
}
