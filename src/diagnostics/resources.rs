//! Resource Probes
//!
//! Blocking filesystem and /proc inspection used by the resources check and by
//! emergency cleanup. Callers run these inside `spawn_blocking`.

use fd_lock::RwLock;
use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Extension of in-flight writes that should not outlive the process
pub const TEMP_EXTENSION: &str = "tmp";

/// Prefix of the writability probe files created by the state_files check
pub const PROBE_PREFIX: &str = ".agent-bus-probe";

/// Files under `root` that someone else holds an exclusive lock on
pub fn find_locked_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut locked = Vec::new();
    if !root.exists() {
        return Ok(locked);
    }

    for path in walk_files(root)? {
        let file = match File::open(&path) {
            Ok(file) => file,
            // Removed between listing and opening
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        let mut lock = RwLock::new(file);
        let attempt = lock.try_write().map(drop);
        match attempt {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!(path = %path.display(), "State file is locked");
                locked.push(path);
            }
            Err(e) => return Err(e),
        }
    }

    locked.sort();
    Ok(locked)
}

/// Leftover `*.tmp` files directly inside `dir`
pub fn find_stale_temp_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut stale = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
            stale.push(path);
        }
    }
    stale.sort();
    Ok(stale)
}

/// Number of descriptors this process has open, when the platform exposes it
#[cfg(target_os = "linux")]
pub fn count_open_handles() -> Option<usize> {
    fs::read_dir("/proc/self/fd").ok().map(|entries| entries.count())
}

#[cfg(not(target_os = "linux"))]
pub fn count_open_handles() -> Option<usize> {
    None
}

/// Pids of child processes of this process that have exited but were never reaped
#[cfg(target_os = "linux")]
pub fn find_zombie_children() -> io::Result<Vec<u32>> {
    let own_pid = std::process::id();
    let mut zombies = Vec::new();

    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };

        // Processes come and go while we scan
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some((state, parent)) = parse_stat(&stat) {
            if state == 'Z' && parent == own_pid {
                zombies.push(pid);
            }
        }
    }

    zombies.sort_unstable();
    Ok(zombies)
}

#[cfg(not(target_os = "linux"))]
pub fn find_zombie_children() -> io::Result<Vec<u32>> {
    Ok(Vec::new())
}

/// State and parent pid from a /proc/<pid>/stat line
///
/// The command name may contain spaces and parentheses, so fields are read after
/// the last closing parenthesis.
pub fn parse_stat(stat: &str) -> Option<(char, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let parent = fields.next()?.parse().ok()?;
    Some((state, parent))
}

/// Remove stale temp files and leftover probe files from `dir`
///
/// Best effort: failures are logged and the remaining files are still attempted.
/// Returns the files that were removed.
pub fn force_cleanup(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "Cannot list directory for cleanup");
            }
            return Vec::new();
        }
    };

    let mut removed = Vec::new();
    for path in entries.filter_map(|entry| entry.ok().map(|entry| entry.path())) {
        if !path.is_file() || !is_disposable(&path) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
        }
    }
    removed
}

fn is_disposable(path: &Path) -> bool {
    let is_temp = path.extension().is_some_and(|ext| ext == TEMP_EXTENSION);
    let is_probe = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(PROBE_PREFIX));
    is_temp || is_probe
}

fn walk_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_stat_handles_odd_command_names() {
        assert_eq!(parse_stat("42 (bash) S 1 42 42 0"), Some(('S', 1)));
        assert_eq!(parse_stat("77 (my (weird) proc) Z 12 77"), Some(('Z', 12)));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn test_unlocked_files_are_not_reported() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a1")).unwrap();
        fs::write(dir.path().join("a1/mailbox.json"), "{}").unwrap();
        assert!(find_locked_files(dir.path()).unwrap().is_empty());
        assert!(find_locked_files(&dir.path().join("missing")).unwrap().is_empty());

        // Scanning releases its own lock before returning
        let mut holder = RwLock::new(File::open(dir.path().join("a1/mailbox.json")).unwrap());
        assert!(holder.try_write().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_locked_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, "[]").unwrap();

        let mut holder = RwLock::new(File::open(&path).unwrap());
        let _guard = holder.try_write().unwrap();

        assert_eq!(find_locked_files(dir.path()).unwrap(), vec![path]);
    }

    #[test]
    fn test_stale_temp_files_and_cleanup() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("write.tmp"), "").unwrap();
        fs::write(dir.path().join(format!("{PROBE_PREFIX}-1")), "").unwrap();
        fs::write(dir.path().join("keep.json"), "").unwrap();

        let stale = find_stale_temp_files(dir.path()).unwrap();
        assert_eq!(stale, vec![dir.path().join("write.tmp")]);

        let removed = force_cleanup(dir.path());
        assert_eq!(removed.len(), 2);
        assert!(dir.path().join("keep.json").exists());
        assert!(find_stale_temp_files(dir.path()).unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_handles_are_counted() {
        assert!(count_open_handles().unwrap_or(0) > 0);
    }
}
