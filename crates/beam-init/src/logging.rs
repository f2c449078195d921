//! Log output: stderr only, stamped with time since kernel boot.
//!
//! Stamps use the kernel's own format (`[    1.234567]`) so init's lines sort
//! in with kernel messages on a shared console.
//!
//! No background writer: the supervisor forks, and a writer thread would not
//! survive in the child. Since everything goes to fd 2, logs follow the
//! console once the worker rebinds its standard streams.

use std::fmt;
use std::time::Duration;

use nix::time::{ClockId, clock_gettime};
use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

/// Seconds since boot, including time spent suspended.
struct Uptime;

fn uptime() -> Option<Duration> {
    let ts = clock_gettime(ClockId::CLOCK_BOOTTIME).ok()?;
    let secs = u64::try_from(ts.tv_sec()).ok()?;
    let nanos = u32::try_from(ts.tv_nsec()).ok()?;
    Some(Duration::new(secs, nanos))
}

fn write_stamp(w: &mut impl fmt::Write, uptime: Duration) -> fmt::Result {
    write!(w, "[{:5}.{:06}]", uptime.as_secs(), uptime.subsec_micros())
}

impl FormatTime for Uptime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        match uptime() {
            Some(t) => write_stamp(w, t),
            None => write!(w, "[     ?.??????]"),
        }
    }
}

/// Install the global subscriber. `verbose` enables debug output.
pub fn init(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_timer(Uptime)
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();
}
