//! PID 1 responsibilities: shutdown signals, zombie reaping, and the final
//! teardown before a reboot, halt or power-off.
//!
//! Uses `sigaction` (not `signal`) for reliable, non-resetting handlers.
//! The handler only records which action was requested; the supervisor
//! loop picks it up.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::Duration;

use nix::sys::reboot::{RebootMode, reboot};
use tracing::{error, warn};

/// How PID 1 ends. `Hang` blocks forever; the others reset the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalAction {
    Reboot,
    Halt,
    PowerOff,
    Hang,
}

impl TerminalAction {
    /// The action requested by a signal sent to PID 1, as the usual
    /// `reboot`, `halt` and `poweroff` utilities do.
    pub fn for_signal(sig: libc::c_int) -> Option<Self> {
        match sig {
            libc::SIGTERM => Some(Self::Reboot),
            libc::SIGUSR1 | libc::SIGPWR => Some(Self::Halt),
            libc::SIGUSR2 => Some(Self::PowerOff),
            _ => None,
        }
    }

    fn reboot_mode(self) -> Option<RebootMode> {
        match self {
            Self::Reboot => Some(RebootMode::RB_AUTOBOOT),
            Self::Halt => Some(RebootMode::RB_HALT_SYSTEM),
            Self::PowerOff => Some(RebootMode::RB_POWER_OFF),
            Self::Hang => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::Reboot => 1,
            Self::Halt => 2,
            Self::PowerOff => 3,
            Self::Hang => 4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Reboot),
            2 => Some(Self::Halt),
            3 => Some(Self::PowerOff),
            4 => Some(Self::Hang),
            _ => None,
        }
    }
}

impl fmt::Display for TerminalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reboot => "reboot",
            Self::Halt => "halt",
            Self::PowerOff => "power off",
            Self::Hang => "hang",
        })
    }
}

/// How the watched child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(i32),
}

impl ChildExit {
    /// Decode a `waitpid` status. Stops are not reported without `WUNTRACED`.
    pub fn from_wait_status(status: libc::c_int) -> Self {
        if libc::WIFSIGNALED(status) {
            Self::Signaled(libc::WTERMSIG(status))
        } else {
            Self::Exited(libc::WEXITSTATUS(status))
        }
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(sig) => write!(f, "terminated by signal {sig}"),
        }
    }
}

/// Whether this process is the init process.
pub fn is_pid1() -> bool {
    std::process::id() == 1
}

/// Action requested by the last shutdown signal (0 = none).
static REQUESTED: AtomicU8 = AtomicU8::new(0);

const SHUTDOWN_SIGNALS: [libc::c_int; 4] =
    [libc::SIGTERM, libc::SIGUSR1, libc::SIGUSR2, libc::SIGPWR];

/// Take the pending shutdown request, if any.
pub fn take_shutdown_request() -> Option<TerminalAction> {
    TerminalAction::from_code(REQUESTED.swap(0, Ordering::SeqCst))
}

fn set_handler(sig: libc::c_int, handler: libc::sighandler_t) {
    // SAFETY: zeroed sigaction is valid; we fill sa_handler and sa_flags.
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = handler;
    sa.sa_flags = libc::SA_RESTART;
    // SAFETY: sa is properly initialized, sig is a valid signal number.
    unsafe {
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

/// Install the shutdown handlers for PID 1.
pub fn setup_signal_handlers() {
    for sig in SHUTDOWN_SIGNALS {
        set_handler(
            sig,
            handle_shutdown_signal as *const () as libc::sighandler_t,
        );
    }
}

/// Restore default dispositions. Called in the forked worker before exec.
pub fn reset_signal_handlers() {
    for sig in SHUTDOWN_SIGNALS {
        set_handler(sig, libc::SIG_DFL);
    }
}

extern "C" fn handle_shutdown_signal(sig: libc::c_int) {
    if let Some(action) = TerminalAction::for_signal(sig) {
        REQUESTED.store(action.code(), Ordering::SeqCst);
    }
}

/// Block until `pid` exits. Retries on `EINTR`; `None` on other errors.
pub fn wait_blocking(pid: libc::pid_t) -> Option<ChildExit> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: pid is a valid child PID; status is written on success.
        let result = unsafe { libc::waitpid(pid, &mut status, 0) };
        if result == pid {
            return Some(ChildExit::from_wait_status(status));
        }
        if std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
            return None;
        }
    }
}

/// Reap zombie children (non-blocking) and detect the watched child's exit.
///
/// As PID 1 we inherit every orphan; those are reaped and discarded.
pub fn reap_zombies(watched: libc::pid_t) -> Option<ChildExit> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: waitpid(-1) is valid; status is only read on success.
        let result = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        // 0: nothing ready, <0: no children left
        if result <= 0 {
            return None;
        }
        if result == watched {
            return Some(ChildExit::from_wait_status(status));
        }
    }
}

fn sync_disks() {
    // SAFETY: sync() has no preconditions.
    unsafe { libc::sync() };
}

/// Ask everything to exit, then make sure it has.
pub fn kill_all() {
    warn!("Sending SIGTERM to all processes");
    // SAFETY: -1 targets every process we may signal, PID 1 excluded.
    unsafe {
        libc::kill(-1, libc::SIGTERM);
    }
    sync_disks();

    thread::sleep(Duration::from_secs(1));

    warn!("Sending SIGKILL to all processes");
    // SAFETY: as above.
    unsafe {
        libc::kill(-1, libc::SIGKILL);
    }
    sync_disks();
}

/// Block forever. PID 1 must never return, and keeps collecting orphans
/// while it waits.
pub fn hang() -> ! {
    loop {
        reap_zombies(-1);
        thread::sleep(Duration::from_secs(1));
    }
}

/// Carry out `action`. Falls back to [`hang`] if the kernel refuses.
pub fn perform(action: TerminalAction) -> ! {
    let Some(mode) = action.reboot_mode() else {
        hang()
    };

    kill_all();
    crate::system::unmount_all();
    sync_disks();
    match reboot(mode) {
        Ok(never) => match never {},
        Err(e) => {
            error!("{action} failed: {e}. Hanging.");
            hang()
        }
    }
}
