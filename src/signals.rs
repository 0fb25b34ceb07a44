use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use signal_hook::consts::signal::SIGCHLD;
use signal_hook::iterator::Signals;
use tracing::{debug, warn};

use crate::jobs::{JobId, JobStatus, JobTable, Jobs, Pgid};

/// The keyboard and job-control signals the shell must not react to while
/// it owns the terminal; the foreground job receives them instead, via
/// terminal ownership.
const SHELL_IGNORED: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
];

/// Ignores the interactive signals in the shell itself. Children restore
/// the defaults after fork (see [`restore_child_defaults`]).
pub fn install_shell_dispositions() {
    for sig in SHELL_IGNORED {
        if let Err(err) = unsafe { signal(sig, SigHandler::SigIgn) } {
            warn!(%sig, %err, "failed to ignore signal");
        }
    }
}

/// Resets signal dispositions in a forked child so it does not inherit the
/// shell's ignores. Must run before exec.
pub fn restore_child_defaults() {
    for sig in SHELL_IGNORED.iter().chain(std::iter::once(&Signal::SIGCHLD)) {
        let _ = unsafe { signal(*sig, SigHandler::SigDfl) };
    }
}

/// Spawns the reaper thread. signal-hook delivers SIGCHLD to an ordinary
/// thread, so all Job Table mutation happens under the mutex on a normal
/// stack, never inside an async signal handler.
pub fn spawn_reaper(jobs: Jobs) {
    let mut signals =
        Signals::new([SIGCHLD]).expect("unable to register SIGCHLD handler");
    thread::spawn(move || {
        for _ in signals.forever() {
            let mut table = jobs.lock().unwrap();
            reap(&mut table);
        }
    });
}

/// One observed child state change, with the CPU time the kernel accounted
/// to the reaped process.
pub enum WaitEvent {
    Changed { pid: Pid, status: WaitStatus, usage: Duration },
    /// Children exist in the group but none changed state.
    None,
    /// No waitable children remain in the group.
    Gone,
}

fn rusage_cpu(ru: &libc::rusage) -> Duration {
    let tv = |t: &libc::timeval| {
        Duration::new(t.tv_sec.max(0) as u64, (t.tv_usec.max(0) as u32) * 1000)
    };
    tv(&ru.ru_utime) + tv(&ru.ru_stime)
}

/// Non-blocking wait covering exits, stops and continues for one process
/// group. Uses wait4 directly because nix 0.26 has no rusage-reporting
/// wait wrapper.
pub fn wait_group_nohang(pgid: Pgid) -> WaitEvent {
    let mut status: libc::c_int = 0;
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    let flags = libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED;
    let rc = unsafe { libc::wait4(-pgid.as_raw(), &mut status, flags, &mut ru) };
    match rc {
        0 => WaitEvent::None,
        -1 => {
            let errno = Errno::last();
            if errno != Errno::ECHILD {
                warn!(%pgid, %errno, "wait4 failed");
            }
            WaitEvent::Gone
        }
        pid => match WaitStatus::from_raw(Pid::from_raw(pid), status) {
            Ok(ws) => WaitEvent::Changed {
                pid: Pid::from_raw(pid),
                status: ws,
                usage: rusage_cpu(&ru),
            },
            Err(err) => {
                warn!(%pid, %err, "undecodable wait status");
                WaitEvent::None
            }
        },
    }
}

/// Blocking wait for one specific child, tolerating signal interruption.
/// Returns the status and the child's CPU usage, or `None` on ECHILD.
pub fn wait_pid_blocking(pid: Pid) -> Option<(WaitStatus, Duration)> {
    loop {
        let mut status: libc::c_int = 0;
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, libc::WUNTRACED, &mut ru) };
        if rc == -1 {
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ECHILD => return None,
                errno => {
                    warn!(%pid, %errno, "wait4 failed");
                    return None;
                }
            }
        }
        match WaitStatus::from_raw(Pid::from_raw(rc), status) {
            Ok(ws) => return Some((ws, rusage_cpu(&ru))),
            Err(err) => {
                warn!(%pid, %err, "undecodable wait status");
                return None;
            }
        }
    }
}

/// Collects every pending state change for every job in the table. Safe to
/// call both from the prompt-time poll and from the SIGCHLD thread; the
/// caller holds the table lock either way. Foreground children are never
/// in the table, so their statuses are left for the foreground waiter.
pub fn reap(table: &mut JobTable) {
    let ids: Vec<JobId> = table
        .iter()
        .filter(|j| j.status.is_live())
        .map(|j| j.id)
        .collect();
    for id in ids {
        reap_job(table, id);
    }
}

fn reap_job(table: &mut JobTable, id: JobId) {
    loop {
        let pgid = match table.get(id) {
            Some(job) => job.pgid,
            None => return,
        };
        match wait_group_nohang(pgid) {
            WaitEvent::None => return,
            WaitEvent::Gone => {
                // The group's children vanished without us seeing their
                // exits; the entry can no longer transition normally.
                if let Some(job) = table.get_mut(id) {
                    if job.status.is_live() && !job.pids.is_empty() {
                        debug!(%id, "job lost its children, marking unknown");
                        job.status = JobStatus::Unknown;
                        job.changed = true;
                    }
                }
                return;
            }
            WaitEvent::Changed { pid, status, usage } => {
                apply_wait_event(table, id, pid, status, usage);
                if table.get(id).is_none() {
                    return;
                }
            }
        }
    }
}

/// Applies one wait notification to the owning job, per the state machine:
/// exit/signal accumulate toward the terminal status once every member is
/// reaped, stop/continue flip the state and promote the job to current.
pub fn apply_wait_event(
    table: &mut JobTable,
    id: JobId,
    pid: Pid,
    status: WaitStatus,
    usage: Duration,
) {
    let mut promote = false;
    if let Some(job) = table.get_mut(id) {
        match status {
            WaitStatus::Exited(_, code) => {
                job.usage += usage;
                job.pids.retain(|p| *p != pid);
                if pid == job.last_pid {
                    job.term_status = Some(code);
                    job.last_signaled = false;
                }
                if job.pids.is_empty() {
                    job.status = match (job.last_signaled, job.term_status) {
                        (true, _) => JobStatus::Signaled,
                        (false, Some(0)) | (false, None) => JobStatus::Done,
                        (false, Some(_)) => JobStatus::Exited,
                    };
                    job.changed = true;
                    debug!(%id, status = %job.status, "job finished");
                }
            }
            WaitStatus::Signaled(_, sig, _) => {
                job.usage += usage;
                job.pids.retain(|p| *p != pid);
                if pid == job.last_pid {
                    job.term_status = Some(sig as i32);
                    job.last_signaled = true;
                }
                if job.pids.is_empty() {
                    job.status = if job.last_signaled {
                        JobStatus::Signaled
                    } else {
                        match job.term_status {
                            Some(0) | None => JobStatus::Done,
                            Some(_) => JobStatus::Exited,
                        }
                    };
                    job.changed = true;
                    debug!(%id, status = %job.status, "job killed");
                }
            }
            WaitStatus::Stopped(_, _) => {
                if job.status != JobStatus::Stopped {
                    job.status = JobStatus::Stopped;
                    job.changed = true;
                    promote = true;
                    debug!(%id, "job stopped");
                }
            }
            WaitStatus::Continued(_) => {
                if job.status != JobStatus::Running {
                    job.status = JobStatus::Running;
                    job.changed = true;
                    promote = true;
                    debug!(%id, "job continued");
                }
            }
            _ => {}
        }
    }
    if promote {
        table.promote(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;

    fn running_job(table: &mut JobTable, pgid: i32, pids: &[i32], command: &str) -> JobId {
        table.add(
            Pgid::new(pgid),
            pids.iter().map(|p| Pid::from_raw(*p)).collect(),
            command.to_string(),
            JobStatus::Running,
        )
    }

    #[test]
    fn test_rusage_cpu_conversion() {
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        ru.ru_utime.tv_sec = 1;
        ru.ru_utime.tv_usec = 500_000;
        ru.ru_stime.tv_sec = 2;
        assert_eq!(rusage_cpu(&ru), Duration::from_millis(3500));
    }

    #[test]
    fn test_pipeline_status_comes_from_last_stage() {
        let mut t = JobTable::new();
        let id = running_job(&mut t, 100, &[100, 101, 102], "a | b | c");
        // middle stage fails; pipeline status must still be the tail's
        apply_wait_event(&mut t, id, Pid::from_raw(101), WaitStatus::Exited(Pid::from_raw(101), 1), Duration::ZERO);
        assert_eq!(t.get(id).unwrap().status, JobStatus::Running);
        apply_wait_event(&mut t, id, Pid::from_raw(100), WaitStatus::Exited(Pid::from_raw(100), 0), Duration::ZERO);
        apply_wait_event(&mut t, id, Pid::from_raw(102), WaitStatus::Exited(Pid::from_raw(102), 0), Duration::ZERO);
        let job = t.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.term_status, Some(0));
        assert!(job.changed);
    }

    #[test]
    fn test_nonzero_tail_exit_is_exited() {
        let mut t = JobTable::new();
        let id = running_job(&mut t, 200, &[200], "false");
        apply_wait_event(&mut t, id, Pid::from_raw(200), WaitStatus::Exited(Pid::from_raw(200), 2), Duration::ZERO);
        let job = t.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Exited);
        assert_eq!(job.term_status, Some(2));
    }

    #[test]
    fn test_signal_death_records_signal_number() {
        let mut t = JobTable::new();
        let id = running_job(&mut t, 300, &[300], "sleep 100");
        apply_wait_event(
            &mut t,
            id,
            Pid::from_raw(300),
            WaitStatus::Signaled(Pid::from_raw(300), Signal::SIGTERM, false),
            Duration::ZERO,
        );
        let job = t.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Signaled);
        assert_eq!(job.term_status, Some(Signal::SIGTERM as i32));
    }

    #[test]
    fn test_stop_promotes_to_current() {
        let mut t = JobTable::new();
        let stopped = running_job(&mut t, 400, &[400], "vim");
        let _newer = running_job(&mut t, 500, &[500], "sleep 100");
        assert_ne!(t.current(), Some(stopped));
        apply_wait_event(
            &mut t,
            stopped,
            Pid::from_raw(400),
            WaitStatus::Stopped(Pid::from_raw(400), Signal::SIGTSTP),
            Duration::ZERO,
        );
        assert_eq!(t.get(stopped).unwrap().status, JobStatus::Stopped);
        assert_eq!(t.current(), Some(stopped));
    }

    #[test]
    fn test_continue_resumes_running() {
        let mut t = JobTable::new();
        let id = running_job(&mut t, 600, &[600], "vim");
        apply_wait_event(
            &mut t,
            id,
            Pid::from_raw(600),
            WaitStatus::Stopped(Pid::from_raw(600), Signal::SIGTSTP),
            Duration::ZERO,
        );
        apply_wait_event(&mut t, id, Pid::from_raw(600), WaitStatus::Continued(Pid::from_raw(600)), Duration::ZERO);
        assert_eq!(t.get(id).unwrap().status, JobStatus::Running);
    }

    #[test]
    fn test_usage_accumulates_across_members() {
        let mut t = JobTable::new();
        let id = running_job(&mut t, 700, &[700, 701], "a | b");
        apply_wait_event(
            &mut t,
            id,
            Pid::from_raw(700),
            WaitStatus::Exited(Pid::from_raw(700), 0),
            Duration::from_millis(250),
        );
        apply_wait_event(
            &mut t,
            id,
            Pid::from_raw(701),
            WaitStatus::Exited(Pid::from_raw(701), 0),
            Duration::from_millis(750),
        );
        assert_eq!(t.get(id).unwrap().usage, Duration::from_secs(1));
    }

    #[test]
    fn test_reap_on_empty_table_is_a_noop() {
        let mut t = JobTable::new();
        reap(&mut t);
        assert!(t.is_empty());
    }
}
