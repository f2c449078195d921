//! Environment for the Erlang VM.
//!
//! The environment is built as a value, layer by layer, and only handed to
//! the OS at exec time (see [`crate::launch`]). Layers, later wins:
//! 1. baseline (`HOME`, `PATH`, `TERM`)
//! 2. values derived from the resolved layout (`ROOTDIR`, `BINDIR`) and the
//!    VM identity (`EMU`, `PROGNAME`)
//! 3. the override file, then `--env` entries

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

use crate::config::Config;
use crate::resolver::LaunchConfig;

const BASELINE: [(&str, &str); 3] = [
    ("HOME", "/root"),
    // Only needed for os:cmd/1 convenience.
    ("PATH", "/usr/sbin:/usr/bin:/sbin:/bin"),
    ("TERM", "vt100"),
];

const EMULATOR: (&str, &str) = ("EMU", "beam");
const PROGRAM_NAME: (&str, &str) = ("PROGNAME", "erl");

/// A line of the override file that could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    /// 1-based.
    pub line: usize,
    pub text: String,
}

/// Key-unique variable set, iterated in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEnvironment {
    vars: BTreeMap<String, String>,
}

impl ProcessEnvironment {
    /// The fixed baseline every boot starts from.
    pub fn baseline() -> Self {
        let mut env = Self::default();
        for (key, value) in BASELINE {
            env.set(key, value);
        }
        env
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Apply `KEY=VALUE` lines. Blank lines and `#` comments are skipped;
    /// lines without a key and `=` are returned, not applied.
    pub fn apply_overrides(&mut self, contents: &str) -> Vec<MalformedLine> {
        let mut malformed = Vec::new();
        for (index, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match split_assignment(line) {
                Some((key, value)) => self.set(key, value),
                None => malformed.push(MalformedLine {
                    line: index + 1,
                    text: line.to_string(),
                }),
            }
        }
        malformed
    }

    /// Apply `;`-separated `KEY=VALUE` entries from the command line.
    pub fn apply_extra(&mut self, entries: &str) {
        for entry in entries.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            match split_assignment(entry) {
                Some((key, value)) => self.set(key, value),
                None => warn!("--env: ignoring '{entry}' (expected KEY=VALUE)"),
            }
        }
    }
}

fn split_assignment(line: &str) -> Option<(&str, &str)> {
    line.split_once('=').filter(|(key, _)| !key.is_empty())
}

/// Read the override file. A missing file is normal and yields `None`.
fn read_override_file(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("no override file at {}", path.display());
            None
        }
        Err(e) => {
            warn!("cannot read {}: {e}", path.display());
            None
        }
    }
}

/// Build the VM's environment from the resolved layout and the user overrides.
pub fn build_environment(launch: &LaunchConfig, config: &Config) -> ProcessEnvironment {
    let mut env = ProcessEnvironment::baseline();

    env.set("ROOTDIR", launch.root_dir.to_string_lossy());
    env.set("BINDIR", launch.runtime.bin_dir().to_string_lossy());
    env.set(EMULATOR.0, EMULATOR.1);
    env.set(PROGRAM_NAME.0, PROGRAM_NAME.1);

    // Each malformed line is reported here; callers of `apply_overrides`
    // get the same lines back as values.
    if let Some(contents) = read_override_file(&config.env_file) {
        let file_name = config.env_file.display();
        for bad in env.apply_overrides(&contents) {
            warn!("{file_name}[{}]: syntax error in '{}'", bad.line, bad.text);
        }
    }

    if let Some(extra) = &config.extra_env {
        env.apply_extra(extra);
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    fn launch_config(erlang: &Path) -> LaunchConfig {
        std::fs::create_dir_all(erlang.join("erts-5.0")).unwrap();
        LaunchConfig {
            runtime: crate::resolver::locate_runtime_installation(erlang).unwrap(),
            release: None,
            root_dir: erlang.to_path_buf(),
            sys_config: None,
            boot_path: None,
            vm_args: None,
            erts_lib_dir: None,
        }
    }

    fn config(env_file: PathBuf) -> Config {
        Config {
            env_file,
            ..Config::default()
        }
    }

    #[test]
    fn overrides_skip_comments_and_report_malformed_lines() {
        let mut env = ProcessEnvironment::default();
        let malformed = env.apply_overrides("FOO=bar\n# comment\n\nBADLINE\n");

        assert_eq!(env.get("FOO"), Some("bar"));
        assert_eq!(env.get("BADLINE"), None);
        assert_eq!(env.len(), 1);
        assert_eq!(
            malformed,
            vec![MalformedLine {
                line: 4,
                text: "BADLINE".into()
            }]
        );
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn malformed_override_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("erlinit.conf");
        std::fs::write(&env_file, "GOOD=1\nBADLINE\n").unwrap();
        let launch = launch_config(dir.path());
        let config = config(env_file.clone());

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let env = tracing::subscriber::with_default(subscriber, || {
            build_environment(&launch, &config)
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let expected = format!("{}[2]: syntax error in 'BADLINE'", env_file.display());
        assert!(output.contains("WARN"), "{output}");
        assert!(output.contains(&expected), "{output}");
        assert_eq!(env.get("GOOD"), Some("1"));
    }

    #[test]
    fn override_value_keeps_everything_after_first_equals() {
        let mut env = ProcessEnvironment::default();
        env.apply_overrides("  ERL_FLAGS=-kernel inet_dist_listen_min=9100  \n");
        assert_eq!(env.get("ERL_FLAGS"), Some("-kernel inet_dist_listen_min=9100"));
    }

    #[test]
    fn override_without_key_is_malformed() {
        let mut env = ProcessEnvironment::default();
        let malformed = env.apply_overrides("=value\n");
        assert!(env.is_empty());
        assert_eq!(malformed.len(), 1);
        assert_eq!(malformed.first().map(|m| m.line), Some(1));
    }

    #[test]
    fn override_file_wins_over_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("erlinit.conf");
        std::fs::write(&env_file, "HOME=/data\nROOTDIR=/elsewhere\n").unwrap();

        let env = build_environment(&launch_config(dir.path()), &config(env_file));
        assert_eq!(env.get("HOME"), Some("/data"));
        assert_eq!(env.get("ROOTDIR"), Some("/elsewhere"));
        assert_eq!(env.get("TERM"), Some("vt100"));
    }

    #[test]
    fn missing_override_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let launch = launch_config(dir.path());
        let env = build_environment(&launch, &config(dir.path().join("missing.conf")));

        assert_eq!(env.get("HOME"), Some("/root"));
        assert_eq!(env.get("PATH"), Some("/usr/sbin:/usr/bin:/sbin:/bin"));
        assert_eq!(env.get("EMU"), Some("beam"));
        assert_eq!(env.get("PROGNAME"), Some("erl"));
        assert_eq!(
            env.get("ROOTDIR").map(PathBuf::from),
            Some(dir.path().to_path_buf())
        );
        assert_eq!(
            env.get("BINDIR").map(PathBuf::from),
            Some(dir.path().join("erts-5.0/bin"))
        );
    }

    #[test]
    fn extra_entries_apply_after_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("erlinit.conf");
        std::fs::write(&env_file, "MODE=file\nLANG=C\n").unwrap();

        let config = Config {
            extra_env: Some("MODE=cmdline; junk ;EXTRA=1".into()),
            ..config(env_file)
        };
        let env = build_environment(&launch_config(dir.path()), &config);
        assert_eq!(env.get("MODE"), Some("cmdline"));
        assert_eq!(env.get("LANG"), Some("C"));
        assert_eq!(env.get("EXTRA"), Some("1"));
        assert_eq!(env.get("junk"), None);
    }

    #[test]
    fn building_twice_gives_identical_environment() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("erlinit.conf");
        std::fs::write(&env_file, "A=1\nB=2\n").unwrap();
        let launch = launch_config(dir.path());
        let config = config(env_file);

        let first = build_environment(&launch, &config);
        let second = build_environment(&launch, &config);
        assert_eq!(first, second);
        assert!(first.iter().eq(second.iter()));
    }
}
