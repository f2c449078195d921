//! Minimal OS setup before the VM starts: pseudo filesystems, loopback
//! networking, and the controlling terminal.
//!
//! Every step here is best effort. A failure is logged and the boot goes on;
//! the VM can start without any of them.

use std::fs::OpenOptions;
use std::os::fd::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use tracing::{debug, warn};

/// A virtual filesystem mounted at boot.
pub struct PseudoFs {
    pub fstype: &'static str,
    pub target: &'static str,
}

pub const PSEUDO_FILESYSTEMS: [PseudoFs; 2] = [
    PseudoFs {
        fstype: "proc",
        target: "/proc",
    },
    PseudoFs {
        fstype: "sysfs",
        target: "/sys",
    },
];

/// Network configuration helper.
pub const IP_HELPER: &str = "/sbin/ip";

/// Helper invocations that bring up loopback, in order.
pub const LOOPBACK_SETUP: [&[&str]; 2] = [
    &["link", "set", "lo", "up"],
    &["addr", "add", "127.0.0.1", "dev", "lo"],
];

/// Names the console device(s) the kernel is currently writing to.
pub const CONSOLE_ACTIVE: &str = "/sys/class/tty/console/active";

/// Kernel table of current mounts, oldest first.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Filesystem types left alone at teardown. They hold no data.
const VOLATILE_FSTYPES: [&str; 5] = ["proc", "sysfs", "devtmpfs", "devpts", "tmpfs"];

/// Mount `/proc` and `/sys`. Failures are logged, never fatal.
pub fn mount_pseudo_filesystems() {
    for fs in &PSEUDO_FILESYSTEMS {
        if let Err(e) = mount(
            Some(fs.fstype),
            fs.target,
            Some(fs.fstype),
            MsFlags::empty(),
            None::<&str>,
        ) {
            warn!("mount {} on {} failed: {e}", fs.fstype, fs.target);
        }
    }
}

/// Run a helper to completion and discard its outcome.
///
/// Used for steps whose failure must not stop the boot. Waiting keeps the
/// steps ordered; the exit status is only logged.
pub fn run_and_discard(program: &str, args: &[&str]) {
    debug!(program, ?args, "run_and_discard");
    discard_status(program, Command::new(program).args(args));
}

/// Split a user command line at whitespace into program and arguments.
pub fn split_command_line(cmdline: &str) -> Option<(&str, Vec<&str>)> {
    let mut words = cmdline.split_whitespace();
    let program = words.next()?;
    Some((program, words.collect()))
}

/// Run a user-configured command line (e.g. `--pre-run-exec`) and wait for it.
/// Failures are logged and otherwise ignored.
pub fn run_command_line(cmdline: &str, dir: Option<&Path>) {
    let Some((program, args)) = split_command_line(cmdline) else {
        return;
    };
    debug!(program, ?args, "run_command_line");

    let mut command = Command::new(program);
    command.args(&args);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    discard_status(program, &mut command);
}

fn discard_status(program: &str, command: &mut Command) {
    match command.stdin(Stdio::null()).status() {
        Ok(status) if !status.success() => {
            debug!(program, %status, "helper failed (ignored)");
        }
        Err(e) => {
            debug!(program, error = %e, "helper failed to spawn (ignored)");
        }
        _ => {}
    }
}

/// Bring up `lo` with 127.0.0.1. Needed when the VM runs distributed.
pub fn bring_up_loopback() {
    for args in LOOPBACK_SETUP {
        run_and_discard(IP_HELPER, args);
    }
}

/// Read a sysfs attribute, trimmed. Empty or unreadable yields `None`.
pub fn read_sysfs(path: &Path) -> Option<String> {
    let value = std::fs::read_to_string(path).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Device node for the console named in a `console/active` attribute.
///
/// The attribute may list several consoles; the last one is `/dev/console`.
pub fn console_device(active: &str) -> Option<PathBuf> {
    active
        .split_whitespace()
        .last()
        .map(|name| Path::new("/dev").join(name))
}

/// Give the VM a controlling terminal so the shell's job control and
/// Ctrl-keys work: new session, then the active console on fds 0, 1 and 2.
pub fn rebind_console() {
    // SAFETY: setsid() takes no arguments and only fails if we already lead
    // a process group, in which case we keep the current session.
    if unsafe { libc::setsid() } < 0 {
        debug!("setsid: {}", std::io::Error::last_os_error());
    }

    let Some(tty) = read_sysfs(Path::new(CONSOLE_ACTIVE)).and_then(|a| console_device(&a))
    else {
        warn!("Error setting controlling terminal: cannot read {CONSOLE_ACTIVE}");
        return;
    };

    let file = match OpenOptions::new().read(true).write(true).open(&tty) {
        Ok(file) => file,
        Err(e) => {
            warn!("Error setting controlling terminal: {}: {e}", tty.display());
            return;
        }
    };

    let fd: RawFd = file.into_raw_fd();
    for target in 0..=2 {
        // SAFETY: fd is an open descriptor we own; 0-2 are the standard streams.
        if unsafe { libc::dup2(fd, target) } < 0 {
            warn!("dup2 onto fd {target}: {}", std::io::Error::last_os_error());
        }
    }
    if fd > 2 {
        // SAFETY: fd came from into_raw_fd() and is not used afterwards.
        unsafe {
            libc::close(fd);
        }
    }
}

/// A line of `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub target: PathBuf,
    pub fstype: String,
}

/// Undo the octal escapes (`\040` for space) used in `/proc/mounts` fields.
fn unescape_mount_field(field: &str) -> String {
    let mut out = Vec::with_capacity(field.len());
    let mut bytes = field.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let digits: Vec<u8> = bytes.clone().take(3).collect();
        let code = std::str::from_utf8(&digits)
            .ok()
            .filter(|d| d.len() == 3)
            .and_then(|d| u8::from_str_radix(d, 8).ok());
        match code {
            Some(code) => {
                out.push(code);
                let _ = bytes.nth(2);
            }
            None => out.push(b),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `/proc/mounts` contents, keeping kernel order.
pub fn parse_mounts(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                target: PathBuf::from(unescape_mount_field(target)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Mounts to detach at teardown, newest first so children go before parents.
/// Pseudo and RAM filesystems are skipped; `/` is kept for a read-only remount.
pub fn teardown_order(mounts: &[MountEntry]) -> Vec<&MountEntry> {
    mounts
        .iter()
        .rev()
        .filter(|m| !VOLATILE_FSTYPES.contains(&m.fstype.as_str()))
        .collect()
}

fn remount_read_only(target: &Path) -> nix::Result<()> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
}

/// Detach every data filesystem before a reset. What cannot be unmounted
/// (including `/`) is remounted read-only so nothing is left dirty.
pub fn unmount_all() {
    let contents = match std::fs::read_to_string(PROC_MOUNTS) {
        Ok(contents) => contents,
        Err(e) => {
            warn!("cannot read {PROC_MOUNTS}: {e}");
            return;
        }
    };

    let mounts = parse_mounts(&contents);
    for entry in teardown_order(&mounts) {
        let target = entry.target.as_path();
        if target != Path::new("/") && umount2(target, MntFlags::empty()).is_ok() {
            debug!("unmounted {}", target.display());
            continue;
        }
        if let Err(e) = remount_read_only(target) {
            warn!("cannot unmount or remount {} read-only: {e}", target.display());
        }
    }
}

/// Everything the VM needs from the OS, in order.
pub fn prepare() {
    mount_pseudo_filesystems();
    bring_up_loopback();
    rebind_console();
}
