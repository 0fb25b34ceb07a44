use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// A POSIX process-group id. Kept distinct from [`Pid`] so a group id is
/// never accidentally used where a single process id is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pgid(i32);

impl Pgid {
    pub fn new(raw: i32) -> Self {
        Pgid(raw)
    }

    pub fn from_pid(pid: Pid) -> Self {
        Pgid(pid.as_raw())
    }

    pub fn as_raw(self) -> i32 {
        self.0
    }

    pub fn as_pid(self) -> Pid {
        Pid::from_raw(self.0)
    }

    /// Whether the process group still exists (signal 0 probe). EPERM
    /// still means it exists.
    pub fn exists(self) -> bool {
        !matches!(kill(Pid::from_raw(-self.0), None), Err(nix::errno::Errno::ESRCH))
    }
}

impl fmt::Display for Pgid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `%N` integer the user addresses a job by. Assigned monotonically
/// from 1 and never reused while the job is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(u32);

impl JobId {
    pub fn new(raw: u32) -> Self {
        JobId(raw)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle states. `Done` is a clean zero exit, `Exited` a nonzero
/// one, `Signaled` a death by signal; the three are the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Stopped,
    Done,
    Exited,
    Signaled,
    Unknown,
}

impl JobStatus {
    pub fn is_live(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Stopped)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Exited | JobStatus::Signaled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Running => "Running",
            JobStatus::Stopped => "Stopped",
            JobStatus::Done => "Done",
            JobStatus::Exited => "Exited",
            JobStatus::Signaled => "Signaled",
            JobStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// One pipeline the user can address as `%N`.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub pgid: Pgid,
    pub command: String,
    pub status: JobStatus,
    /// Exit code or signal number; meaningful only in `Exited`/`Signaled`.
    pub term_status: Option<i32>,
    /// Accumulated user+system CPU time of reaped members.
    pub usage: Duration,
    pub started: Instant,
    /// Member pids not yet reaped, in pipeline order.
    pub pids: Vec<Pid>,
    /// Pid of the final stage; its exit status is the pipeline's.
    pub last_pid: Pid,
    /// Whether the final stage died to a signal rather than exiting.
    pub last_signaled: bool,
    /// Set by the reaper on every state transition, cleared once the
    /// transition has been reported to the user.
    pub changed: bool,
}

impl Job {
    /// Human label for status lines, e.g. `Exit 2` or `Terminated (SIGTERM)`.
    pub fn status_label(&self) -> String {
        match self.status {
            JobStatus::Exited => match self.term_status {
                Some(code) => format!("Exit {}", code),
                None => "Exited".to_string(),
            },
            JobStatus::Signaled => match self.term_status.and_then(|n| Signal::try_from(n).ok()) {
                Some(sig) => format!("Terminated ({})", sig.as_str()),
                None => "Terminated".to_string(),
            },
            other => other.to_string(),
        }
    }

    /// CPU share of the job since it started. For live members the CPU
    /// time comes from /proc; for reaped ones from the accumulated rusage.
    pub fn cpu_percent(&self) -> f64 {
        let wall = self.started.elapsed();
        if wall.is_zero() {
            return 0.0;
        }
        let mut cpu = self.usage;
        for pid in &self.pids {
            if let Some(t) = proc_cpu_time(*pid) {
                cpu += t;
            }
        }
        100.0 * cpu.as_secs_f64() / wall.as_secs_f64()
    }
}

/// user+system CPU time of a live process, from /proc/<pid>/stat.
fn proc_cpu_time(pid: Pid) -> Option<Duration> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid.as_raw())).ok()?;
    // comm may contain spaces; fields resume after the closing paren
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz <= 0 {
        return None;
    }
    Some(Duration::from_secs_f64((utime + stime) as f64 / hz as f64))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobspecError {
    #[error("no current job")]
    NoCurrent,
    #[error("no previous job")]
    NoPrevious,
    #[error("%{0}: no such job")]
    NoSuchJob(String),
    #[error("%{0}: ambiguous job spec")]
    Ambiguous(String),
}

/// The authoritative map from job id to job state, shared between the main
/// loop and the reaper thread behind a mutex.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: BTreeMap<JobId, Job>,
    next_id: u32,
    current: Option<JobId>,
    previous: Option<JobId>,
}

pub type Jobs = Arc<Mutex<JobTable>>;

pub fn shared() -> Jobs {
    Arc::new(Mutex::new(JobTable::new()))
}

impl JobTable {
    pub fn new() -> Self {
        JobTable { jobs: BTreeMap::new(), next_id: 1, current: None, previous: None }
    }

    /// Registers a freshly launched (or freshly stopped) pipeline and makes
    /// it the current job.
    pub fn add(&mut self, pgid: Pgid, pids: Vec<Pid>, command: String, status: JobStatus) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;
        let last_pid = pids.last().copied().unwrap_or_else(|| pgid.as_pid());
        debug!(%id, %pgid, command = %command, "job registered");
        self.jobs.insert(
            id,
            Job {
                id,
                pgid,
                command,
                status,
                term_status: None,
                usage: Duration::ZERO,
                started: Instant::now(),
                pids,
                last_pid,
                last_signaled: false,
                changed: false,
            },
        );
        self.previous = self.current;
        self.current = Some(id);
        id
    }

    /// Puts a job taken out for `fg` back, keeping its id, and promotes it.
    pub fn reinsert(&mut self, job: Job) {
        let id = job.id;
        self.jobs.insert(id, job);
        self.promote(id);
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&id);
        if job.is_some() {
            self.recompute_current_previous();
        }
        job
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn current(&self) -> Option<JobId> {
        self.current
    }

    pub fn previous(&self) -> Option<JobId> {
        self.previous
    }

    /// `+` for the current job, `-` for the previous, space otherwise.
    pub fn mark(&self, id: JobId) -> char {
        if self.current == Some(id) {
            '+'
        } else if self.previous == Some(id) {
            '-'
        } else {
            ' '
        }
    }

    /// Makes `id` the current job, demoting the old current to previous.
    /// Idempotent when `id` already is current.
    pub fn promote(&mut self, id: JobId) {
        if self.current != Some(id) {
            self.previous = self.current;
            self.current = Some(id);
        }
    }

    /// Deterministic baseline for the `%%`/`%-` pointers: current is the
    /// live job with the highest id, previous the second-highest.
    pub fn recompute_current_previous(&mut self) {
        let mut live: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| j.status.is_live())
            .map(|j| j.id)
            .collect();
        live.sort_unstable_by(|a, b| b.cmp(a));
        self.current = live.first().copied();
        self.previous = live.get(1).copied();
    }

    fn current_is_stale(&self) -> bool {
        match self.current {
            Some(id) => !self.jobs.get(&id).map(|j| j.status.is_live()).unwrap_or(false),
            None => true,
        }
    }

    /// Resolves a jobspec (`%N`, `%%`/`%+`, `%-`, `%string`) to a job id.
    /// The only mutation is the lazy recomputation of the current/previous
    /// pointers when they have gone stale.
    pub fn resolve(&mut self, spec: &str) -> Result<JobId, JobspecError> {
        let body = spec.strip_prefix('%').unwrap_or(spec);
        match body {
            "" | "%" | "+" => {
                if self.current_is_stale() {
                    self.recompute_current_previous();
                }
                self.current.ok_or(JobspecError::NoCurrent)
            }
            "-" => {
                if self.current_is_stale() {
                    self.recompute_current_previous();
                }
                self.previous.ok_or(JobspecError::NoPrevious)
            }
            _ => {
                if let Ok(n) = body.parse::<u32>() {
                    let id = JobId(n);
                    return if self.jobs.contains_key(&id) {
                        Ok(id)
                    } else {
                        Err(JobspecError::NoSuchJob(body.to_string()))
                    };
                }
                let matches: Vec<JobId> = self
                    .jobs
                    .values()
                    .filter(|j| j.status.is_live() && j.command.contains(body))
                    .map(|j| j.id)
                    .collect();
                match matches.len() {
                    0 => Err(JobspecError::NoSuchJob(body.to_string())),
                    1 => Ok(matches[0]),
                    _ => Err(JobspecError::Ambiguous(body.to_string())),
                }
            }
        }
    }

    /// Drops live entries whose process group no longer exists. Terminal
    /// entries are kept; they still owe the user a completion notice.
    pub fn prune_stale(&mut self) {
        let stale: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| j.status.is_live() && !j.pgid.exists())
            .map(|j| j.id)
            .collect();
        for id in stale {
            debug!(%id, "pruning stale job");
            self.jobs.remove(&id);
        }
        if self.current_is_stale() {
            self.recompute_current_previous();
        }
    }

    /// Formats and consumes pending state-change notices. Terminal jobs are
    /// removed here, after being reported exactly once; stop/continue
    /// transitions only clear their flag.
    pub fn drain_notifications(&mut self) -> Vec<String> {
        let changed: Vec<JobId> =
            self.jobs.values().filter(|j| j.changed).map(|j| j.id).collect();
        let mut notes = Vec::new();
        let mut finished = Vec::new();
        for id in changed {
            let line = {
                let job = &self.jobs[&id];
                format!("[{}]{}  {:<24}{}", job.id, self.mark(id), job.status_label(), job.command)
            };
            notes.push(line);
            let job = self.jobs.get_mut(&id).expect("changed job present");
            job.changed = false;
            // Unknown means the group vanished under us; report and drop it
            // along with the terminal states.
            if !job.status.is_live() {
                finished.push(id);
            }
        }
        for id in finished {
            self.jobs.remove(&id);
        }
        if self.current_is_stale() {
            self.recompute_current_previous();
        }
        notes
    }

    /// A `jobs` listing counts as reporting the entries it showed: their
    /// change flags are cleared and terminal ones removed. Jobs a status
    /// filter hid are untouched; they still owe their notice through
    /// [`Self::drain_notifications`].
    pub fn mark_reported(&mut self, ids: &[JobId]) {
        for id in ids {
            let live = match self.jobs.get_mut(id) {
                Some(job) => {
                    job.changed = false;
                    job.status.is_live()
                }
                None => continue,
            };
            if !live {
                self.jobs.remove(id);
            }
        }
        if self.current_is_stale() {
            self.recompute_current_previous();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(n: u32) -> JobTable {
        let mut t = JobTable::new();
        for i in 0..n {
            t.add(
                Pgid::new(1000 + i as i32),
                vec![Pid::from_raw(1000 + i as i32)],
                format!("cmd{}", i),
                JobStatus::Running,
            );
        }
        t
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let mut t = JobTable::new();
        let a = t.add(Pgid::new(10), vec![Pid::from_raw(10)], "a".into(), JobStatus::Running);
        let b = t.add(Pgid::new(20), vec![Pid::from_raw(20)], "b".into(), JobStatus::Running);
        assert_eq!(a, JobId::new(1));
        assert_eq!(b, JobId::new(2));
        t.remove(a);
        let c = t.add(Pgid::new(30), vec![Pid::from_raw(30)], "c".into(), JobStatus::Running);
        assert_eq!(c, JobId::new(3));
    }

    #[test]
    fn test_add_shifts_current_previous() {
        let t = table_with(3);
        assert_eq!(t.current(), Some(JobId::new(3)));
        assert_eq!(t.previous(), Some(JobId::new(2)));
    }

    #[test]
    fn test_remove_recomputes_pointers() {
        let mut t = table_with(3);
        t.remove(JobId::new(3));
        assert_eq!(t.current(), Some(JobId::new(2)));
        assert_eq!(t.previous(), Some(JobId::new(1)));
        t.remove(JobId::new(2));
        assert_eq!(t.current(), Some(JobId::new(1)));
        assert_eq!(t.previous(), None);
        t.remove(JobId::new(1));
        assert_eq!(t.current(), None);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let mut t = table_with(3);
        t.recompute_current_previous();
        let (c, p) = (t.current(), t.previous());
        t.recompute_current_previous();
        assert_eq!((c, p), (t.current(), t.previous()));
    }

    #[test]
    fn test_current_ignores_terminal_jobs() {
        let mut t = table_with(2);
        t.get_mut(JobId::new(2)).unwrap().status = JobStatus::Done;
        t.recompute_current_previous();
        assert_eq!(t.current(), Some(JobId::new(1)));
        assert_eq!(t.previous(), None);
    }

    #[test]
    fn test_resolve_current_and_previous() {
        let mut t = table_with(2);
        assert_eq!(t.resolve("%%"), Ok(JobId::new(2)));
        assert_eq!(t.resolve("%+"), Ok(JobId::new(2)));
        assert_eq!(t.resolve("%-"), Ok(JobId::new(1)));
    }

    #[test]
    fn test_resolve_recomputes_stale_current() {
        let mut t = table_with(2);
        t.get_mut(JobId::new(2)).unwrap().status = JobStatus::Done;
        assert_eq!(t.resolve("%%"), Ok(JobId::new(1)));
    }

    #[test]
    fn test_resolve_numeric() {
        let mut t = table_with(2);
        assert_eq!(t.resolve("%1"), Ok(JobId::new(1)));
        assert_eq!(t.resolve("2"), Ok(JobId::new(2)));
        assert_eq!(t.resolve("%7"), Err(JobspecError::NoSuchJob("7".into())));
    }

    #[test]
    fn test_resolve_substring() {
        let mut t = JobTable::new();
        t.add(Pgid::new(1), vec![Pid::from_raw(1)], "sleep 100".into(), JobStatus::Running);
        t.add(Pgid::new(2), vec![Pid::from_raw(2)], "vim notes.txt".into(), JobStatus::Stopped);
        assert_eq!(t.resolve("%vim"), Ok(JobId::new(2)));
        assert_eq!(t.resolve("%notes"), Ok(JobId::new(2)));
        assert_eq!(t.resolve("%nothing"), Err(JobspecError::NoSuchJob("nothing".into())));
    }

    #[test]
    fn test_resolve_ambiguous_is_an_error() {
        let mut t = JobTable::new();
        t.add(Pgid::new(1), vec![Pid::from_raw(1)], "sleep 100".into(), JobStatus::Running);
        t.add(Pgid::new(2), vec![Pid::from_raw(2)], "sleep 200".into(), JobStatus::Running);
        assert_eq!(t.resolve("%sleep"), Err(JobspecError::Ambiguous("sleep".into())));
    }

    #[test]
    fn test_resolve_empty_table() {
        let mut t = JobTable::new();
        assert_eq!(t.resolve("%%"), Err(JobspecError::NoCurrent));
        assert_eq!(t.resolve("%-"), Err(JobspecError::NoPrevious));
    }

    #[test]
    fn test_drain_reports_terminal_exactly_once() {
        let mut t = table_with(1);
        {
            let job = t.get_mut(JobId::new(1)).unwrap();
            job.status = JobStatus::Done;
            job.changed = true;
        }
        let notes = t.drain_notifications();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].starts_with("[1]"));
        assert!(notes[0].contains("Done"));
        assert!(notes[0].contains("cmd0"));
        // reported once, then gone
        assert!(t.drain_notifications().is_empty());
        assert!(t.is_empty());
    }

    #[test]
    fn test_drain_labels_exit_and_signal() {
        let mut t = table_with(2);
        {
            let job = t.get_mut(JobId::new(1)).unwrap();
            job.status = JobStatus::Exited;
            job.term_status = Some(2);
            job.changed = true;
        }
        {
            let job = t.get_mut(JobId::new(2)).unwrap();
            job.status = JobStatus::Signaled;
            job.term_status = Some(libc::SIGTERM);
            job.changed = true;
        }
        let notes = t.drain_notifications();
        assert_eq!(notes.len(), 2);
        assert!(notes[0].contains("Exit 2"));
        assert!(notes[1].contains("Terminated (SIGTERM)"));
    }

    #[test]
    fn test_reinsert_keeps_id_and_promotes() {
        let mut t = table_with(2);
        let job = t.remove(JobId::new(1)).unwrap();
        assert_eq!(t.current(), Some(JobId::new(2)));
        t.reinsert(job);
        assert_eq!(t.current(), Some(JobId::new(1)));
        assert_eq!(t.previous(), Some(JobId::new(2)));
    }

    #[test]
    fn test_marks() {
        let t = table_with(3);
        assert_eq!(t.mark(JobId::new(3)), '+');
        assert_eq!(t.mark(JobId::new(2)), '-');
        assert_eq!(t.mark(JobId::new(1)), ' ');
    }

    #[test]
    fn test_status_label() {
        let mut t = table_with(1);
        let job = t.get_mut(JobId::new(1)).unwrap();
        assert_eq!(job.status_label(), "Running");
        job.status = JobStatus::Exited;
        job.term_status = Some(127);
        assert_eq!(job.status_label(), "Exit 127");
    }
}
