use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};
use thiserror::Error;
use tracing::debug;

/// Errors from command-name resolution, each carrying the shell's
/// conventional exit status (126 found-but-not-runnable, 127 not found).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{0}: command not found")]
    NotFound(String),
    #[error("{0}: permission denied")]
    NotExecutable(String),
    #[error("{0}: is a directory")]
    IsDirectory(String),
}

impl ResolveError {
    pub fn exit_status(&self) -> i32 {
        match self {
            ResolveError::NotFound(_) => 127,
            ResolveError::NotExecutable(_) | ResolveError::IsDirectory(_) => 126,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub hits: u32,
}

/// Looks up command names to executable paths: names containing a path
/// separator bypass the search, everything else goes through a hit-counting
/// cache in front of a PATH scan.
#[derive(Debug, Default)]
pub struct Resolver {
    cache: HashMap<String, CacheEntry>,
}

impl Resolver {
    pub fn new() -> Self {
        Resolver { cache: HashMap::new() }
    }

    /// Resolves `name` against the current `PATH` variable.
    pub fn resolve(&mut self, name: &str) -> Result<PathBuf, ResolveError> {
        let path_var = std::env::var("PATH").unwrap_or_default();
        self.resolve_in(name, &path_var)
    }

    /// Resolution against an explicit colon-delimited search path.
    pub fn resolve_in(&mut self, name: &str, path_var: &str) -> Result<PathBuf, ResolveError> {
        if name.contains('/') {
            let path = PathBuf::from(name);
            let abs = if path.is_absolute() {
                path
            } else {
                std::env::current_dir().map_err(|_| ResolveError::NotFound(name.to_string()))?.join(path)
            };
            return check_executable(&abs, name).map(|_| abs);
        }

        if let Some(entry) = self.cache.get_mut(name) {
            if check_executable(&entry.path, name).is_ok() {
                entry.hits += 1;
                return Ok(entry.path.clone());
            }
            eprintln!("psh: hash: {}: stale entry evicted", name);
            self.cache.remove(name);
        }

        for dir in path_var.split(':').filter(|d| !d.is_empty()) {
            let candidate = Path::new(dir).join(name);
            if check_executable(&candidate, name).is_ok() {
                debug!(name, path = %candidate.display(), "cached binary path");
                self.cache.insert(
                    name.to_string(),
                    CacheEntry { path: candidate.clone(), hits: 1 },
                );
                return Ok(candidate);
            }
        }
        Err(ResolveError::NotFound(name.to_string()))
    }

    /// Cache entries sorted by name, for the `hash` builtin.
    pub fn entries(&self) -> Vec<(&str, &CacheEntry)> {
        let mut entries: Vec<(&str, &CacheEntry)> =
            self.cache.iter().map(|(k, v)| (k.as_str(), v)).collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Existence + regular-file + execute-permission check, classified into the
/// 126/127 error families.
fn check_executable(path: &Path, name: &str) -> Result<(), ResolveError> {
    let meta = match path.metadata() {
        Ok(m) => m,
        Err(_) => return Err(ResolveError::NotFound(name.to_string())),
    };
    if meta.is_dir() {
        return Err(ResolveError::IsDirectory(name.to_string()));
    }
    if !meta.is_file() {
        return Err(ResolveError::NotFound(name.to_string()));
    }
    if access(path, AccessFlags::X_OK).is_err() {
        return Err(ResolveError::NotExecutable(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn make_exe(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_path_scan_order() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        make_exe(a.path(), "tool");
        make_exe(b.path(), "tool");
        let search = format!("{}:{}", a.path().display(), b.path().display());

        let mut r = Resolver::new();
        let found = r.resolve_in("tool", &search).unwrap();
        assert_eq!(found, a.path().join("tool"));
    }

    #[test]
    fn test_not_found_is_127() {
        let mut r = Resolver::new();
        let err = r.resolve_in("no-such-command", "/nonexistent-dir").unwrap_err();
        assert_eq!(err, ResolveError::NotFound("no-such-command".into()));
        assert_eq!(err.exit_status(), 127);
    }

    #[test]
    fn test_non_executable_is_126() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, "not a program").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let mut r = Resolver::new();
        let err = r.resolve_in(path.to_str().unwrap(), "").unwrap_err();
        assert!(matches!(err, ResolveError::NotExecutable(_)));
        assert_eq!(err.exit_status(), 126);
    }

    #[test]
    fn test_directory_is_126() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = Resolver::new();
        let err = r.resolve_in(dir.path().to_str().unwrap(), "").unwrap_err();
        assert!(matches!(err, ResolveError::IsDirectory(_)));
        assert_eq!(err.exit_status(), 126);
    }

    #[test]
    fn test_slash_bypasses_search() {
        let dir = tempfile::tempdir().unwrap();
        let exe = make_exe(dir.path(), "tool");
        let mut r = Resolver::new();
        // empty search path; the explicit path must still resolve
        let found = r.resolve_in(exe.to_str().unwrap(), "").unwrap();
        assert_eq!(found, exe);
        assert!(r.entries().is_empty());
    }

    #[test]
    fn test_cache_hits_counted() {
        let dir = tempfile::tempdir().unwrap();
        make_exe(dir.path(), "tool");
        let search = dir.path().display().to_string();

        let mut r = Resolver::new();
        r.resolve_in("tool", &search).unwrap();
        r.resolve_in("tool", &search).unwrap();
        r.resolve_in("tool", &search).unwrap();
        let entries = r.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "tool");
        assert_eq!(entries[0].1.hits, 3);
    }

    #[test]
    fn test_stale_cache_entry_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let exe = make_exe(dir.path(), "tool");
        let search = dir.path().display().to_string();

        let mut r = Resolver::new();
        r.resolve_in("tool", &search).unwrap();
        std::fs::remove_file(&exe).unwrap();
        assert!(r.resolve_in("tool", &search).is_err());
        assert!(r.entries().is_empty());
    }
}
