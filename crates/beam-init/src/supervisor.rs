//! Boot state machine and post-mortem policy.
//!
//! PID 1 forks a worker and then only waits. The worker walks
//! `Resolving -> Preparing -> Launching` and replaces itself with the VM,
//! which is then `Running` until it exits.
//!
//! Two ways to end:
//! - setup failure (ambiguous or missing install, exec failure): report and
//!   hang forever in the worker. A reboot would not fix a broken image, and a
//!   hung device keeps the console attachable.
//! - the VM exits: report, run the on-exit command if the exit was not
//!   requested, tear everything down, and reboot (or whatever a shutdown
//!   signal asked for). If the kernel refuses, hang.

use std::convert::Infallible;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::env::build_environment;
use crate::error::{InitError, Result};
use crate::launch::LaunchCommand;
use crate::pid1::{self, ChildExit, TerminalAction};
use crate::{resolver, system};

/// How often PID 1 checks for the worker's exit and shutdown requests.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the VM gets to exit on its own after a shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Where the boot is. Used to label setup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolving,
    Preparing,
    Launching,
    Running,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolving => "resolving",
            Self::Preparing => "preparing",
            Self::Launching => "launching",
            Self::Running => "running",
        })
    }
}

/// Why PID 1 stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The VM ended without being asked to.
    Exited(ChildExit),
    /// A shutdown signal asked for `action`; the VM has been stopped.
    Requested {
        action: TerminalAction,
        exit: Option<ChildExit>,
    },
}

/// Decide how PID 1 ends after the wait.
///
/// Requested shutdowns get what they asked for. Anything else is unexpected
/// for a system built to run the VM forever and gets `on_unexpected_exit`.
pub fn post_mortem(
    termination: &Termination,
    on_unexpected_exit: TerminalAction,
) -> TerminalAction {
    match termination {
        Termination::Exited(_) => on_unexpected_exit,
        Termination::Requested { action, .. } => *action,
    }
}

/// Resolve, prepare and exec. Only returns on failure, tagged with the
/// phase it failed in.
pub fn boot(config: &Config) -> std::result::Result<Infallible, (Phase, InitError)> {
    let launch = resolver::resolve(config).map_err(|e| (Phase::Resolving, e))?;
    let env = build_environment(&launch, config);

    debug!(phase = %Phase::Preparing, "entering phase");
    system::prepare();

    debug!(phase = %Phase::Launching, "entering phase");
    let mut command = LaunchCommand::new(&launch, env)
        .in_directory(config.working_directory.as_deref())
        .run_as(config.uid, config.gid);
    if let Some(wrapper) = &config.alternate_exec {
        command = command.wrapped_in(wrapper);
    }

    if let Some(pre_run) = &config.pre_run_exec {
        info!("Running pre-run command '{pre_run}'");
        system::run_command_line(pre_run, Some(command.working_dir()));
    }

    for (key, value) in command.env().iter() {
        debug!("Env: '{key}={value}'");
    }
    for arg in command.argv() {
        debug!("Arg: '{}'", arg.to_string_lossy());
    }
    info!("Launching erl...");

    Err((Phase::Launching, command.exec()))
}

/// Fatal-and-halt: report and block forever.
fn fatal_halt(phase: Phase, err: &InitError) -> ! {
    error!("FATAL ERROR while {phase}: {err}");
    error!("CANNOT CONTINUE.");
    pid1::hang()
}

/// Body of the forked worker. Never returns.
fn boot_worker(config: &Config) -> ! {
    pid1::reset_signal_handlers();
    match boot(config) {
        Ok(never) => match never {},
        Err((phase, e)) => fatal_halt(phase, &e),
    }
}

fn fork_worker(config: &Config) -> Result<libc::pid_t> {
    // SAFETY: fork() is called before any threads are spawned.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(InitError::Fork(std::io::Error::last_os_error()));
    }
    if pid == 0 {
        boot_worker(config);
    }
    Ok(pid)
}

/// Give the VM [`SHUTDOWN_GRACE`] to exit, then kill it.
fn stop_worker(pid: libc::pid_t) -> Option<ChildExit> {
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while Instant::now() < deadline {
        if let Some(exit) = pid1::reap_zombies(pid) {
            return Some(exit);
        }
        thread::sleep(POLL_INTERVAL);
    }

    warn!("Wait for Erlang VM to exit gracefully expired. Killing...");
    // SAFETY: pid is our child from fork().
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    pid1::wait_blocking(pid)
}

/// Wait for the worker to end, reaping orphans meanwhile.
fn supervise(pid: libc::pid_t) -> Termination {
    loop {
        if let Some(exit) = pid1::reap_zombies(pid) {
            return Termination::Exited(exit);
        }

        if let Some(action) = pid1::take_shutdown_request() {
            info!("{action} requested, waiting for the VM to exit");
            return Termination::Requested {
                action,
                exit: stop_worker(pid),
            };
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// PID 1 entry point. Never returns.
pub fn run(config: &Config) -> ! {
    info!("Loading runtime...");

    pid1::setup_signal_handlers();

    let pid = match fork_worker(config) {
        Ok(pid) => pid,
        Err(e) => fatal_halt(Phase::Launching, &e),
    };
    debug!(pid, phase = %Phase::Running, "worker forked");

    let termination = supervise(pid);
    let action = post_mortem(&termination, config.unexpected_exit_action());
    match termination {
        Termination::Exited(exit) => {
            error!("Unexpected exit: Erlang VM {exit}. Going to {action}.");
            if let Some(cmd) = &config.run_on_exit {
                info!("Running on-exit command '{cmd}'");
                system::run_command_line(cmd, None);
            }
        }
        Termination::Requested { exit, .. } => match exit {
            Some(exit) => info!("Erlang VM {exit}. Going to {action}."),
            None => warn!("Erlang VM could not be reaped. Going to {action}."),
        },
    }

    pid1::perform(action)
}
