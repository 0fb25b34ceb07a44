use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::jobs::{JobStatus, JobTable, Pgid};

/// Directory holding one job-state file per running shell session.
static STATE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    dirs_next::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("psh-sessions")
});

/// Snapshot of one job, as published for other sessions to read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionJob {
    pub id: u32,
    pub pgid: i32,
    pub status: JobStatus,
    pub command: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    shell_pid: i32,
    jobs: Vec<SessionJob>,
}

/// Publishes this shell's job table to a per-session file and reads the
/// files of other live sessions, so `jobs` can show — and `kill` can
/// address — work started elsewhere. Files of dead shells are pruned on
/// read; our own file is removed on drop.
#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
    shell_pid: i32,
}

impl SessionStore {
    pub fn new() -> Result<Self> {
        Self::new_in(STATE_DIR.clone())
    }

    pub fn new_in(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
        Ok(SessionStore { dir, shell_pid: std::process::id() as i32 })
    }

    fn own_file(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.shell_pid))
    }

    /// Writes the live jobs of this session out. Failures are downgraded
    /// to a debug note; cross-session visibility is best-effort.
    pub fn publish(&self, table: &JobTable) {
        let jobs: Vec<SessionJob> = table
            .iter()
            .filter(|j| j.status.is_live())
            .map(|j| SessionJob {
                id: j.id.as_raw(),
                pgid: j.pgid.as_raw(),
                status: j.status,
                command: j.command.clone(),
            })
            .collect();
        let file = SessionFile { shell_pid: self.shell_pid, jobs };
        let result = serde_json::to_vec(&file)
            .map_err(anyhow::Error::from)
            .and_then(|data| std::fs::write(self.own_file(), data).map_err(Into::into));
        if let Err(err) = result {
            debug!(%err, "failed to publish session jobs");
        }
    }

    /// Jobs of every other live psh session, keyed by the owning shell's
    /// pid. Stale files (owner no longer running) are deleted here.
    pub fn load_others(&self) -> Vec<(i32, Vec<SessionJob>)> {
        let mut sessions = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return sessions,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(owner) = owner_pid(&path) else { continue };
            if owner == self.shell_pid {
                continue;
            }
            // EPERM still means the owner exists; only ESRCH is dead.
            if let Err(nix::errno::Errno::ESRCH) = kill(Pid::from_raw(owner), None) {
                debug!(owner, "pruning session file of dead shell");
                let _ = std::fs::remove_file(&path);
                continue;
            }
            let Ok(data) = std::fs::read(&path) else { continue };
            let Ok(file) = serde_json::from_slice::<SessionFile>(&data) else {
                let _ = std::fs::remove_file(&path);
                continue;
            };
            if !file.jobs.is_empty() {
                sessions.push((file.shell_pid, file.jobs));
            }
        }
        sessions.sort_by_key(|(pid, _)| *pid);
        sessions
    }

    /// Cross-session jobspec fallback: a substring match over other
    /// sessions' job commands, with the same no-match/ambiguity rules as
    /// the local table.
    pub fn resolve_elsewhere(&self, spec: &str) -> Result<Pgid> {
        let body = spec.strip_prefix('%').unwrap_or(spec);
        let mut matches = Vec::new();
        for (_, jobs) in self.load_others() {
            for job in jobs {
                if job.command.contains(body) {
                    matches.push(job);
                }
            }
        }
        match matches.len() {
            0 => anyhow::bail!("%{}: no such job", body),
            1 => Ok(Pgid::new(matches[0].pgid)),
            _ => anyhow::bail!("%{}: ambiguous job spec", body),
        }
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.own_file());
    }
}

fn owner_pid(path: &Path) -> Option<i32> {
    path.file_stem()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobTable;

    fn sample_table() -> JobTable {
        let mut t = JobTable::new();
        t.add(Pgid::new(9100), vec![Pid::from_raw(9100)], "sleep 100".into(), JobStatus::Running);
        t.add(Pgid::new(9200), vec![Pid::from_raw(9200)], "vim notes".into(), JobStatus::Stopped);
        t
    }

    #[test]
    fn test_publish_and_own_file_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let store = SessionStore::new_in(dir.path().to_path_buf()).unwrap();
            store.publish(&sample_table());
            path = store.own_file();
            assert!(path.exists());
            let data = std::fs::read(&path).unwrap();
            let file: SessionFile = serde_json::from_slice(&data).unwrap();
            assert_eq!(file.jobs.len(), 2);
            assert_eq!(file.jobs[0].command, "sleep 100");
        }
        // dropped stores leave no file behind
        assert!(!path.exists());
    }

    #[test]
    fn test_load_others_skips_self_and_dead_shells() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new_in(dir.path().to_path_buf()).unwrap();
        store.publish(&sample_table());

        // a file owned by a pid that cannot exist
        let dead = SessionFile {
            shell_pid: i32::MAX - 1,
            jobs: vec![SessionJob {
                id: 1,
                pgid: 4242,
                status: JobStatus::Running,
                command: "ghost".into(),
            }],
        };
        let dead_path = dir.path().join(format!("{}.json", dead.shell_pid));
        std::fs::write(&dead_path, serde_json::to_vec(&dead).unwrap()).unwrap();

        let others = store.load_others();
        assert!(others.is_empty());
        assert!(!dead_path.exists());
    }

    #[test]
    fn test_resolve_elsewhere_reads_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new_in(dir.path().to_path_buf()).unwrap();

        // fake another session owned by a live pid (our own test process
        // works; resolve_elsewhere only skips files named for *this* store)
        let other = SessionFile {
            shell_pid: 1, // init: always alive
            jobs: vec![SessionJob {
                id: 3,
                pgid: 7777,
                status: JobStatus::Running,
                command: "make -j8".into(),
            }],
        };
        std::fs::write(
            dir.path().join("1.json"),
            serde_json::to_vec(&other).unwrap(),
        )
        .unwrap();

        let pgid = store.resolve_elsewhere("%make").unwrap();
        assert_eq!(pgid.as_raw(), 7777);
        assert!(store.resolve_elsewhere("%nothing").is_err());
    }
}
