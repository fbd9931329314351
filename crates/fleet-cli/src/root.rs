use fleet_core::paths;
use std::path::{Path, PathBuf};

/// Where a command finds its workspace.
///
/// An explicit `--root` (or `FLEET_ROOT`) is taken as given. Otherwise the
/// nearest ancestor of the working directory that holds a fleet config
/// wins, and `init` always starts a new workspace in the working directory.
pub fn resolve_root(explicit: Option<&Path>, init: bool) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if init {
        return cwd;
    }
    find_workspace(&cwd).unwrap_or(cwd)
}

/// Nearest directory at or above `start` with `.fleet/config.yaml`. A bare
/// `.fleet/` left behind by a failed init does not count.
pub fn find_workspace(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| paths::config_path(dir).is_file())
        .map(Path::to_path_buf)
}
