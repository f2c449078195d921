//! Turning a resolved layout into the `erlexec` invocation.

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::warn;

use crate::env::ProcessEnvironment;
use crate::error::InitError;
use crate::resolver::LaunchConfig;

/// Launcher binary inside `<erts>/bin`, and the `argv[0]` it expects.
pub const LAUNCHER: &str = "erlexec";

/// A fully assembled VM invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    launcher: PathBuf,
    /// Program and leading arguments that run the launcher, e.g. `strace -f`.
    wrapper: Vec<String>,
    args: Vec<OsString>,
    env: ProcessEnvironment,
    working_dir: PathBuf,
    uid: Option<u32>,
    gid: Option<u32>,
}

/// `requested` if it is a usable directory, otherwise `root_dir`.
pub fn choose_working_dir(requested: Option<&Path>, root_dir: &Path) -> PathBuf {
    match requested {
        Some(dir) if dir.is_dir() => dir.to_path_buf(),
        Some(dir) => {
            warn!(
                "Cannot use {} as working directory, using {}",
                dir.display(),
                root_dir.display()
            );
            root_dir.to_path_buf()
        }
        None => root_dir.to_path_buf(),
    }
}

impl LaunchCommand {
    pub fn new(launch: &LaunchConfig, env: ProcessEnvironment) -> Self {
        let mut args: Vec<OsString> = Vec::new();
        let mut flag = |name: &str, value: &Path| {
            args.push(name.into());
            args.push(value.into());
        };

        if let Some(sys_config) = &launch.sys_config {
            flag("-config", sys_config);
        }
        if let Some(boot_path) = &launch.boot_path {
            flag("-boot", boot_path);
        }
        if let Some(vm_args) = &launch.vm_args {
            flag("-args_file", vm_args);
        }
        if let Some(lib_dir) = &launch.erts_lib_dir {
            args.push("-boot_var".into());
            args.push("ERTS_LIB_DIR".into());
            args.push(lib_dir.into());
        }

        Self {
            launcher: launch.runtime.bin_dir().join(LAUNCHER),
            wrapper: Vec::new(),
            args,
            env,
            working_dir: launch.root_dir.clone(),
            uid: None,
            gid: None,
        }
    }

    /// Run the launcher through `cmdline` (whitespace separated). A blank
    /// command line leaves the launcher in charge.
    pub fn wrapped_in(mut self, cmdline: &str) -> Self {
        self.wrapper = cmdline.split_whitespace().map(str::to_string).collect();
        self
    }

    /// Start in `dir` if usable, otherwise stay in the root directory.
    pub fn in_directory(mut self, dir: Option<&Path>) -> Self {
        self.working_dir = choose_working_dir(dir, &self.working_dir);
        self
    }

    /// Switch to `uid`/`gid` just before exec. Zero or `None` keeps root.
    pub fn run_as(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid.filter(|&id| id > 0);
        self.gid = gid.filter(|&id| id > 0);
        self
    }

    /// The binary that is exec'd: the wrapper if any, else the launcher.
    pub fn program(&self) -> &Path {
        self.wrapper
            .first()
            .map_or(self.launcher.as_path(), Path::new)
    }

    pub fn launcher(&self) -> &Path {
        &self.launcher
    }

    /// Arguments after `argv[0]`.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// The full argument vector as the exec'd program will see it.
    ///
    /// Unwrapped, `argv[0]` is the bare launcher name. Wrapped, the wrapper's
    /// own words come first and the launcher follows by full path.
    pub fn argv(&self) -> Vec<OsString> {
        let head: Vec<OsString> = if self.wrapper.is_empty() {
            vec![OsString::from(LAUNCHER)]
        } else {
            self.wrapper
                .iter()
                .map(OsString::from)
                .chain(std::iter::once(self.launcher.clone().into_os_string()))
                .collect()
        };
        head.into_iter().chain(self.args.iter().cloned()).collect()
    }

    pub fn env(&self) -> &ProcessEnvironment {
        &self.env
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn credentials(&self) -> (Option<u32>, Option<u32>) {
        (self.uid, self.gid)
    }

    /// Replace this process with the VM.
    ///
    /// The environment is applied to the inherited one in a single step, the
    /// working directory is changed and privileges are dropped, just before
    /// `execve`. Only returns on failure.
    pub fn exec(self) -> InitError {
        let program = self.program().to_path_buf();
        let mut argv = self.argv().into_iter();
        let mut command = Command::new(&program);
        if let Some(arg0) = argv.next() {
            command.arg0(arg0);
        }
        command
            .args(argv)
            .envs(self.env.iter())
            .current_dir(&self.working_dir);
        if let Some(gid) = self.gid {
            command.gid(gid);
        }
        if let Some(uid) = self.uid {
            command.uid(uid);
        }

        let source = command.exec();
        InitError::Exec { program, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::locate_runtime_installation;

    fn launch_config(erlang: &Path) -> LaunchConfig {
        std::fs::create_dir_all(erlang.join("erts-5.0")).unwrap();
        LaunchConfig {
            runtime: locate_runtime_installation(erlang).unwrap(),
            release: None,
            root_dir: erlang.to_path_buf(),
            sys_config: None,
            boot_path: None,
            vm_args: None,
            erts_lib_dir: None,
        }
    }

    #[test]
    fn bare_runtime_has_only_identity() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = LaunchCommand::new(&launch_config(dir.path()), ProcessEnvironment::default());

        assert_eq!(cmd.argv(), vec![OsString::from("erlexec")]);
        assert!(cmd.args().is_empty());
        assert_eq!(cmd.program(), dir.path().join("erts-5.0/bin/erlexec"));
        assert_eq!(cmd.working_dir(), dir.path());
        assert_eq!(cmd.credentials(), (None, None));
    }

    #[test]
    fn wrapper_runs_launcher_by_full_path() {
        let dir = tempfile::tempdir().unwrap();
        let launch = LaunchConfig {
            boot_path: Some(PathBuf::from("/r/app-1.0/app")),
            ..launch_config(dir.path())
        };
        let cmd = LaunchCommand::new(&launch, ProcessEnvironment::default())
            .wrapped_in("/usr/bin/strace  -f -o /tmp/trace");

        let launcher = dir.path().join("erts-5.0/bin/erlexec");
        let expected: Vec<OsString> = vec![
            "/usr/bin/strace".into(),
            "-f".into(),
            "-o".into(),
            "/tmp/trace".into(),
            launcher.clone().into_os_string(),
            "-boot".into(),
            "/r/app-1.0/app".into(),
        ];
        assert_eq!(cmd.program(), Path::new("/usr/bin/strace"));
        assert_eq!(cmd.launcher(), launcher);
        assert_eq!(cmd.argv(), expected);
    }

    #[test]
    fn blank_wrapper_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cmd =
            LaunchCommand::new(&launch_config(dir.path()), ProcessEnvironment::default())
                .wrapped_in("   ");
        assert_eq!(cmd.argv(), vec![OsString::from("erlexec")]);
        assert_eq!(cmd.program(), dir.path().join("erts-5.0/bin/erlexec"));
    }

    #[test]
    fn working_dir_override_when_usable() {
        let root = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();

        assert_eq!(
            choose_working_dir(Some(data.path()), root.path()),
            data.path()
        );
        assert_eq!(
            choose_working_dir(Some(&data.path().join("missing")), root.path()),
            root.path()
        );
        assert_eq!(choose_working_dir(None, root.path()), root.path());

        let cmd = LaunchCommand::new(&launch_config(root.path()), ProcessEnvironment::default())
            .in_directory(Some(data.path()));
        assert_eq!(cmd.working_dir(), data.path());
    }

    #[test]
    fn root_ids_are_not_switched_to() {
        let dir = tempfile::tempdir().unwrap();
        let launch = launch_config(dir.path());

        let cmd = LaunchCommand::new(&launch, ProcessEnvironment::default())
            .run_as(Some(100), Some(0));
        assert_eq!(cmd.credentials(), (Some(100), None));

        let cmd = LaunchCommand::new(&launch, ProcessEnvironment::default()).run_as(None, Some(50));
        assert_eq!(cmd.credentials(), (None, Some(50)));
    }

    #[test]
    fn flags_follow_identity_in_fixed_order() {
        let dir = tempfile::tempdir().unwrap();
        let launch = LaunchConfig {
            sys_config: Some(PathBuf::from("/r/app-1.0/sys.config")),
            boot_path: Some(PathBuf::from("/r/app-1.0/app")),
            vm_args: Some(PathBuf::from("/r/app-1.0/vm.args")),
            erts_lib_dir: Some(PathBuf::from("/usr/lib/erlang/lib")),
            ..launch_config(dir.path())
        };
        let cmd = LaunchCommand::new(&launch, ProcessEnvironment::default());

        let expected: Vec<OsString> = [
            "erlexec",
            "-config",
            "/r/app-1.0/sys.config",
            "-boot",
            "/r/app-1.0/app",
            "-args_file",
            "/r/app-1.0/vm.args",
            "-boot_var",
            "ERTS_LIB_DIR",
            "/usr/lib/erlang/lib",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        assert_eq!(cmd.argv(), expected);
    }

    #[test]
    fn boot_without_config() {
        let dir = tempfile::tempdir().unwrap();
        let launch = LaunchConfig {
            boot_path: Some(PathBuf::from("/r/app-1.0/app")),
            ..launch_config(dir.path())
        };
        let cmd = LaunchCommand::new(&launch, ProcessEnvironment::default());
        assert_eq!(
            cmd.args(),
            &[OsString::from("-boot"), OsString::from("/r/app-1.0/app")]
        );
    }

    #[test]
    fn exec_of_missing_launcher_fails() {
        let dir = tempfile::tempdir().unwrap();
        // exec() changes directory before execve; stay where the test runner is.
        let launch = LaunchConfig {
            root_dir: std::env::current_dir().unwrap(),
            ..launch_config(dir.path())
        };
        let cmd = LaunchCommand::new(&launch, ProcessEnvironment::baseline());

        let err = cmd.exec();
        assert!(matches!(err, InitError::Exec { .. }), "{err}");
        assert!(err.to_string().contains("erlexec"), "{err}");
    }
}
