//! Boot configuration.
//!
//! Every location has a fixed default matching the standard image layout.
//! The kernel hands unrecognised boot parameters to PID 1 as arguments, so
//! the defaults can be overridden from the kernel command line.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;

use crate::pid1::TerminalAction;

/// Where the Erlang runtime (`erts-*`) is installed.
pub const DEFAULT_ERLANG_ROOT: &str = "/usr/lib/erlang";

/// Root of the release payload. Releases live in `<root>/releases`.
pub const DEFAULT_RELEASE_ROOT: &str = "/srv/erlang";

/// Optional `KEY=VALUE` environment overrides.
pub const DEFAULT_ENV_FILE: &str = "/etc/erlinit.conf";

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "beam-init", version, about, ignore_errors = true)]
pub struct Config {
    /// Directory containing exactly one `erts-*` runtime installation
    #[arg(long, default_value = DEFAULT_ERLANG_ROOT)]
    pub erlang_root: PathBuf,

    /// Directory whose `releases/` subdirectory holds the release payload
    #[arg(long, default_value = DEFAULT_RELEASE_ROOT)]
    pub release_root: PathBuf,

    /// Line-oriented `KEY=VALUE` environment override file
    #[arg(long, default_value = DEFAULT_ENV_FILE)]
    pub env_file: PathBuf,

    /// Extra `KEY=VALUE` entries separated by `;`, applied after the env file
    #[arg(short = 'e', long = "env")]
    pub extra_env: Option<String>,

    /// Boot file to use instead of the one named after the release.
    /// Relative paths are taken from the release directory.
    #[arg(long)]
    pub boot: Option<PathBuf>,

    /// Directory the VM starts in. Falls back to the root directory if unusable
    #[arg(long)]
    pub working_directory: Option<PathBuf>,

    /// Command run (and waited for) just before the VM is started
    #[arg(long)]
    pub pre_run_exec: Option<String>,

    /// Command run when the VM exits unexpectedly, before the reset
    #[arg(long)]
    pub run_on_exit: Option<String>,

    /// Wrapper that runs erlexec, e.g. "/usr/bin/strace -f"
    #[arg(long)]
    pub alternate_exec: Option<String>,

    /// Run the VM as this user id
    #[arg(long)]
    pub uid: Option<u32>,

    /// Run the VM as this group id
    #[arg(long)]
    pub gid: Option<u32>,

    /// Hang instead of rebooting when the VM exits unexpectedly
    #[arg(long)]
    pub hang_on_exit: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Kernel parameters that are not ours
    #[arg(hide = true)]
    pub kernel_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            erlang_root: PathBuf::from(DEFAULT_ERLANG_ROOT),
            release_root: PathBuf::from(DEFAULT_RELEASE_ROOT),
            env_file: PathBuf::from(DEFAULT_ENV_FILE),
            extra_env: None,
            boot: None,
            working_directory: None,
            pre_run_exec: None,
            run_on_exit: None,
            alternate_exec: None,
            uid: None,
            gid: None,
            hang_on_exit: false,
            verbose: false,
            kernel_args: Vec::new(),
        }
    }
}

impl Config {
    /// Parse the arguments PID 1 was started with (`argv[0]` included).
    pub fn from_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(args)
    }

    /// Directory scanned for `<name>-<version>` release directories.
    pub fn releases_dir(&self) -> PathBuf {
        self.release_root.join("releases")
    }

    /// Library directory passed to the VM as `ERTS_LIB_DIR` when present.
    pub fn erts_lib_dir(&self) -> PathBuf {
        self.erlang_root.join("lib")
    }

    /// What to do when the VM exits without anyone asking it to.
    pub fn unexpected_exit_action(&self) -> TerminalAction {
        if self.hang_on_exit {
            TerminalAction::Hang
        } else {
            TerminalAction::Reboot
        }
    }
}
