//! Driver Top-Level: builds the network fabric and machines, exposes them to
//! a test script via [`TestEnv`], and guarantees cleanup on every exit path.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use console::style;
use log::warn;

use crate::config::DriverConfig;
use crate::logger::Logger;
use crate::machine::Machine;
use crate::network::Vlan;

/// Owns the Logger, the VLANs, and the machines for one test run.
///
/// Dropping a `Driver` is the at-exit cleanup hook (§4.5.2): every machine
/// process is SIGKILLed, then every VDE switch, then the logger is closed.
/// This runs on every exit path including an unwinding panic from the test
/// script, since `run` catches script panics before they can propagate past
/// this struct's owner.
pub struct Driver {
    logger: Arc<Logger>,
    vlans: Vec<Vlan>,
    machines: Vec<Machine>,
    nr_tests: Cell<u32>,
    nr_succeeded: Cell<u32>,
}

impl Driver {
    /// Boot order: open the logger, bring up the network fabric, then
    /// construct one quiescent [`Machine`] per configured VM script.
    pub fn new(config: &DriverConfig, cwd: &Path) -> Result<Self> {
        let logger = Arc::new(Logger::open(&config.logfile)?);

        let mut vlans = Vec::with_capacity(config.vlans.len());
        for id in &config.vlans {
            vlans.push(Vlan::start(id, cwd, &logger)?);
        }

        let mut machines = Vec::with_capacity(config.vm_scripts.len());
        for script in &config.vm_scripts {
            machines.push(Machine::new(
                script.clone(),
                None,
                &config.tmpdir,
                true,
                logger.clone(),
            )?);
        }

        Ok(Self {
            logger,
            vlans,
            machines,
            nr_tests: Cell::new(0),
            nr_succeeded: Cell::new(0),
        })
    }

    pub fn machine(&self, name: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.name() == name)
    }

    pub fn vlan(&self, id: &str) -> Option<&Vlan> {
        self.vlans.iter().find(|v| v.id() == id)
    }

    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    /// Runs `script` against a [`TestEnv`] borrowing this driver, catching
    /// both `Result::Err` and unwinding panics at the top level. Returns the
    /// process exit code: `0` on clean completion (regardless of subtest
    /// pass/fail counts), `1` if the script failed outside any `subtest`
    /// scope (§6, §7).
    pub fn run(&self, script: impl FnOnce(&TestEnv) -> Result<()>) -> i32 {
        let env = TestEnv { driver: self };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| script(&env)));

        let exit_code = match outcome {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                self.logger.log(&format!("test script failed: {e:?}"), &[]);
                eprintln!("test script failed: {e:?}");
                1
            }
            Err(payload) => {
                let msg = panic_message(&payload);
                self.logger.log(&format!("test script panicked: {msg}"), &[]);
                eprintln!("test script panicked: {msg}");
                1
            }
        };

        for machine in &self.machines {
            if machine.is_up() {
                if let Err(e) = machine.execute("sync") {
                    warn!("final sync on {} failed: {e:#}", machine.name());
                }
            }
        }

        self.print_summary();
        exit_code
    }

    fn print_summary(&self) {
        let total = self.nr_tests.get();
        let succeeded = self.nr_succeeded.get();
        let line = format!("{succeeded} out of {total} tests succeeded");
        if succeeded == total {
            println!("{}", style(line).green());
        } else {
            println!("{}", style(line).red());
        }
    }

    fn clean_up(&mut self) {
        {
            let _scope = self.logger.nested("cleaning up", &[]);
            for machine in &self.machines {
                machine.force_kill();
            }
            for vlan in &mut self.vlans {
                vlan.kill();
            }
        }
        self.logger.close();
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.clean_up();
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The binding environment exposed to a compiled test script (§4.7): the
/// driver's machines and VLANs by name, plus the `subtest` scope. Replaces
/// the source's dynamic `exec` with a closure linked against this crate.
pub struct TestEnv<'a> {
    driver: &'a Driver,
}

impl<'a> TestEnv<'a> {
    pub fn machine(&self, name: &str) -> Option<&'a Machine> {
        self.driver.machine(name)
    }

    pub fn vlan(&self, id: &str) -> Option<&'a Vlan> {
        self.driver.vlan(id)
    }

    pub fn machines(&self) -> &'a [Machine] {
        self.driver.machines()
    }

    /// A named scope that counts one success/failure independently of the
    /// script's overall status (§4.6). Increments `nr_tests` on entry; an
    /// `Err` or panic from `body` is logged and swallowed — the subtest
    /// fails but the script continues — otherwise `nr_succeeded` increments.
    pub fn subtest(&self, name: &str, body: impl FnOnce() -> Result<()>) {
        let _scope = self.driver.logger.nested(&format!("subtest: {name}"), &[]);
        self.driver.nr_tests.set(self.driver.nr_tests.get() + 1);

        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => {
                self.driver.nr_succeeded.set(self.driver.nr_succeeded.get() + 1);
            }
            Ok(Err(e)) => {
                self.driver.logger.log(&format!("subtest '{name}' failed: {e:#}"), &[]);
            }
            Err(payload) => {
                let msg = panic_message(&payload);
                self.driver
                    .logger
                    .log(&format!("subtest '{name}' panicked: {msg}"), &[]);
            }
        }
    }
}
