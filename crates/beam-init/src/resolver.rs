//! Locates the Erlang runtime and the release payload on disk.
//!
//! Ambiguity is always an error: if two `erts-*` directories or two
//! releases are present, nothing is picked.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{InitError, Result};

/// Directory name prefix of an ERTS installation (`erts-<version>`).
pub const ERTS_PREFIX: &str = "erts-";

/// Release configuration file looked up inside the release directory.
pub const SYS_CONFIG: &str = "sys.config";

/// VM arguments file looked up inside the release directory.
pub const VM_ARGS: &str = "vm.args";

/// The `erts-<version>` directory the VM runs from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInstallation(PathBuf);

impl RuntimeInstallation {
    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.0.join("bin")
    }
}

/// A `<name>-<version>` release directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasePayload(PathBuf);

impl ReleasePayload {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Everything the launcher needs to know about the on-disk layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub runtime: RuntimeInstallation,
    pub release: Option<ReleasePayload>,
    /// `ROOTDIR`: the release root, or the Erlang root when there is no release.
    pub root_dir: PathBuf,
    pub sys_config: Option<PathBuf>,
    pub boot_path: Option<PathBuf>,
    pub vm_args: Option<PathBuf>,
    pub erts_lib_dir: Option<PathBuf>,
}

/// Immediate children of `dir` whose name satisfies `filter`, sorted by name.
fn scan_dir(dir: &Path, filter: impl Fn(&[u8]) -> bool) -> std::io::Result<Vec<PathBuf>> {
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if filter(entry.file_name().as_bytes()) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Find the single `erts-*` directory directly under `install_root`.
pub fn locate_runtime_installation(install_root: &Path) -> Result<RuntimeInstallation> {
    let mut found = scan_dir(install_root, |name| name.starts_with(ERTS_PREFIX.as_bytes()))
        .map_err(|source| InitError::InstallRootUnreadable {
            root: install_root.to_path_buf(),
            source,
        })?;

    if found.len() > 1 {
        return Err(InitError::MultipleRuntimes {
            root: install_root.to_path_buf(),
            count: found.len(),
        });
    }
    found
        .pop()
        .map(RuntimeInstallation)
        .ok_or_else(|| InitError::RuntimeNotFound {
            root: install_root.to_path_buf(),
        })
}

/// Find the release under `releases_root`.
///
/// Returns `Ok(None)` when there is no release (including when the releases
/// directory itself is missing); the caller falls back to the bare runtime.
pub fn locate_release(releases_root: &Path) -> Result<Option<ReleasePayload>> {
    let mut found = match scan_dir(releases_root, |name| name.contains(&b'-')) {
        Ok(found) => found,
        Err(e) => {
            debug!("cannot scan {}: {e}", releases_root.display());
            Vec::new()
        }
    };

    if found.len() > 1 {
        return Err(InitError::MultipleReleases {
            root: releases_root.to_path_buf(),
            count: found.len(),
        });
    }
    Ok(found.pop().map(ReleasePayload))
}

/// `<release_dir>/sys.config` if it exists.
pub fn derive_config_path(release_dir: &Path) -> Option<PathBuf> {
    existing(release_dir.join(SYS_CONFIG))
}

/// `<release_dir>/vm.args` if it exists.
pub fn derive_vm_args_path(release_dir: &Path) -> Option<PathBuf> {
    existing(release_dir.join(VM_ARGS))
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.exists().then_some(path)
}

/// Boot file base name derived from a `<name>-<version>` release directory.
///
/// `/srv/erlang/releases/myapp-1.0.0` yields `/srv/erlang/releases/myapp-1.0.0/myapp`.
/// Splits at the last `-`, which must come after the last `/`; anything else
/// yields `None`, which only means no boot file is passed.
pub fn derive_boot_path(release_dir: &Path) -> Option<PathBuf> {
    let full = release_dir.as_os_str().as_bytes();
    let name_start = full.iter().rposition(|&b| b == b'/')? + 1;
    let name_end = full.iter().rposition(|&b| b == b'-')?;
    if name_end <= name_start {
        return None;
    }
    let name = full.get(name_start..name_end)?;
    Some(release_dir.join(OsStr::from_bytes(name)))
}

/// A boot file chosen by the user, resolved against `release_dir` when
/// relative.
///
/// Accepted if the path exists as given or with the `.boot` extension the VM
/// appends. Otherwise `None`, and the derived boot path is used instead.
pub fn derive_user_boot_path(release_dir: &Path, requested: &Path) -> Option<PathBuf> {
    let boot_path = release_dir.join(requested);
    let mut with_ext = boot_path.clone().into_os_string();
    with_ext.push(".boot");

    if boot_path.exists() || Path::new(&with_ext).exists() {
        Some(boot_path)
    } else {
        warn!(
            "Specified boot file '{}' not found. Auto-detecting.",
            requested.display()
        );
        None
    }
}

/// Run the whole resolution: runtime, release, and the paths derived from them.
pub fn resolve(config: &Config) -> Result<LaunchConfig> {
    let runtime = locate_runtime_installation(&config.erlang_root)?;
    debug!("using runtime in {}", runtime.path().display());

    let releases_dir = config.releases_dir();
    let release = locate_release(&releases_dir)?;

    let (root_dir, sys_config, boot_path, vm_args) = match &release {
        Some(release) => {
            debug!("using release in {}", release.path().display());
            let sys_config = derive_config_path(release.path());
            if sys_config.is_none() {
                warn!("{} not found in {}", SYS_CONFIG, release.path().display());
            }
            let boot_path = config
                .boot
                .as_deref()
                .and_then(|requested| derive_user_boot_path(release.path(), requested))
                .or_else(|| derive_boot_path(release.path()));
            (
                config.release_root.clone(),
                sys_config,
                boot_path,
                derive_vm_args_path(release.path()),
            )
        }
        None => {
            warn!("No release found in {}.", releases_dir.display());
            (config.erlang_root.clone(), None, None, None)
        }
    };

    let erts_lib_dir = Some(config.erts_lib_dir()).filter(|dir| dir.is_dir());

    Ok(LaunchConfig {
        runtime,
        release,
        root_dir,
        sys_config,
        boot_path,
        vm_args,
        erts_lib_dir,
    })
}
