//! CLI & Config (G, ambient): parses process arguments and environment into
//! a single validated [`DriverConfig`], the way the teacher's `main.rs`
//! builds a `Vmtest` from `clap`-parsed `Args`.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::network::Vlan;

/// Command-line surface. Flags mirror the environment variables in §6 and
/// take precedence over them when both are set, so the driver is scriptable
/// either way.
#[derive(Parser, Debug)]
#[clap(version, about = "Orchestrates QEMU/KVM guests and runs a test script against them")]
pub struct Args {
    /// Path to write the structured XML test log to. Overrides `LOGFILE`.
    #[clap(short, long)]
    pub logfile: Option<PathBuf>,

    /// Whitespace-separated VLAN ids to bring up before any VM starts.
    /// Overrides `VLANS`.
    #[clap(long)]
    pub vlans: Option<String>,

    /// Name of the compiled test script to run. Overrides `tests`/`testScript`.
    #[clap(long)]
    pub tests: Option<String>,

    /// One shell command per VM to launch.
    pub vm_scripts: Vec<String>,
}

/// The typed, validated projection of the external interface (§6) consumed
/// by [`crate::driver::Driver`]. Nothing downstream re-reads `std::env`
/// directly except QEMU argument construction, which inherits the process
/// environment by design (§4.5.1).
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub vm_scripts: Vec<String>,
    pub vlans: Vec<String>,
    pub script_source: Option<String>,
    pub logfile: PathBuf,
    pub tmpdir: PathBuf,
    pub out_dir: PathBuf,
    pub display: bool,
    pub use_serial: bool,
    pub qemu_opts: String,
}

impl DriverConfig {
    /// Merge `args` over the process environment. CLI flags win when both a
    /// flag and its corresponding environment variable are set.
    pub fn from_args(args: &Args) -> Result<Self> {
        let vlans_raw = args
            .vlans
            .clone()
            .or_else(|| env::var("VLANS").ok())
            .unwrap_or_default();
        let vlans = Vlan::parse_ids(&vlans_raw);

        let script_source = args
            .tests
            .clone()
            .or_else(|| env::var("tests").ok())
            .or_else(|| env::var("testScript").ok());

        let logfile = args
            .logfile
            .clone()
            .or_else(|| env::var_os("LOGFILE").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/dev/null"));

        let tmpdir = env::var_os("TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);
        std::fs::create_dir_all(&tmpdir)
            .with_context(|| format!("Failed to create TMPDIR {}", tmpdir.display()))?;

        let out_dir = env::var_os("out")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::current_dir().unwrap_or_default());

        let display = env::var_os("DISPLAY").is_some();
        let use_serial = env::var("USE_SERIAL").map(|v| v != "0" && !v.is_empty()).unwrap_or(false);
        let qemu_opts = env::var("QEMU_OPTS").unwrap_or_default();

        if args.vm_scripts.is_empty() {
            anyhow::bail!("at least one VM script must be given");
        }

        Ok(Self {
            vm_scripts: args.vm_scripts.clone(),
            vlans,
            script_source,
            logfile,
            tmpdir,
            out_dir,
            display,
            use_serial,
            qemu_opts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flag_overrides_env() {
        std::env::set_var("VLANS", "9");
        let args = Args::parse_from(["vmdrive", "--vlans", "1 2", "/bin/true"]);
        let config = DriverConfig::from_args(&args).unwrap();
        std::env::remove_var("VLANS");
        assert_eq!(config.vlans, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_requires_at_least_one_vm_script() {
        let args = Args::parse_from(["vmdrive"]);
        assert!(DriverConfig::from_args(&args).is_err());
    }

    #[test]
    fn test_defaults_logfile_to_dev_null() {
        std::env::remove_var("LOGFILE");
        let args = Args::parse_from(["vmdrive", "/bin/true"]);
        let config = DriverConfig::from_args(&args).unwrap();
        assert_eq!(config.logfile, PathBuf::from("/dev/null"));
    }
}
