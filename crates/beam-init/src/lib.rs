//! PID 1 for embedded Linux images whose only job is to run the Erlang VM.
//!
//! Boot sequence:
//! 1. PID 1 installs shutdown signal handlers and forks a worker
//! 2. Worker: locate ERTS and the release ([`resolver`]), build the VM
//!    environment ([`env`]), mount `/proc` and `/sys`, bring up loopback,
//!    take over the console ([`system`]), and exec `erlexec` ([`launch`])
//! 3. PID 1 reaps zombies until the VM exits, then reboots ([`supervisor`])
//!
//! A setup failure never reboots: the worker reports it and hangs.

pub mod config;
pub mod env;
pub mod error;
pub mod launch;
pub mod logging;
pub mod pid1;
pub mod resolver;
pub mod supervisor;
pub mod system;

pub use config::Config;
pub use error::{InitError, Result};
