use std::collections::HashMap;
use std::env;
use std::process::exit;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Builder;

use vmdrive::config::{Args, DriverConfig};
use vmdrive::driver::{Driver, TestEnv};

/// Initialize `log`-crate diagnostics (§4.2, ambient), configurable via
/// `RUST_LOG`. Distinct from the XML test log the `Driver` itself writes.
fn init_logging() -> Result<()> {
    Builder::from_default_env()
        .try_init()
        .context("Failed to init env_logger")
}

/// A compiled scenario over the verb surface in §4.5, registered by name and
/// selected via `--tests`/`tests`/`testScript` (§4.7). This is the
/// necessarily small, fixed set of scenarios this binary ships with; a
/// downstream crate linking against `vmdrive` as a library is expected to
/// define its own and call [`Driver::run`] directly instead of going through
/// this registry.
fn registered_scripts() -> HashMap<&'static str, fn(&TestEnv) -> Result<()>> {
    let mut scripts: HashMap<&'static str, fn(&TestEnv) -> Result<()>> = HashMap::new();
    scripts.insert("smoke", smoke_script);
    scripts
}

/// Asserts every configured machine's shell is reachable and runs `true`.
fn smoke_script(env: &TestEnv) -> Result<()> {
    env.subtest("all machines respond", || {
        for machine in env.machines() {
            machine.succeed(&["true"])?;
        }
        Ok(())
    });
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging() {
        eprintln!("{e:?}");
        exit(2);
    }

    let config = match DriverConfig::from_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e:?}");
            exit(2);
        }
    };

    let cwd = match env::current_dir() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to get current directory: {e}");
            exit(2);
        }
    };

    let driver = match Driver::new(&config, &cwd) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Setup failure: {e:?}");
            exit(2);
        }
    };

    let code = match &config.script_source {
        None => {
            driver.logger().log(
                "no test script configured (testScript/tests unset); exiting after boot",
                &[],
            );
            0
        }
        Some(name) => match registered_scripts().get(name.as_str()) {
            Some(script) => driver.run(*script),
            None => {
                eprintln!("unknown test script '{name}'");
                2
            }
        },
    };

    // Dropping `driver` here (end of scope, before `exit`) runs the at-exit
    // cleanup hook; `process::exit` does not run destructors.
    drop(driver);
    exit(code);
}
