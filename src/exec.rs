use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{killpg, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup, dup2, execv, fork, getpid, pipe, read, setpgid, write, ForkResult, Pid};
use tracing::debug;

use crate::builtins;
use crate::jobs::{Job, JobStatus, Pgid};
use crate::parser::{InputRedirect, OutputRedirect, Pipeline, SimpleCommand};
use crate::shell::Shell;
use crate::signals;
use crate::terminal::ForegroundGuard;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
pub const EXIT_NOT_FOUND: i32 = 127;

/// Shell encoding of a wait status: the exit code for normal exits,
/// 128+signal for deaths and stops.
pub fn status_from_wait(ws: &WaitStatus) -> i32 {
    match ws {
        WaitStatus::Exited(_, code) => *code,
        WaitStatus::Signaled(_, sig, _) => 128 + *sig as i32,
        WaitStatus::Stopped(_, sig) => 128 + *sig as i32,
        _ => EXIT_SUCCESS,
    }
}

/// Exit status and diagnostic for an exec that came back with an errno.
pub fn exec_failure(errno: Errno) -> (i32, &'static str) {
    match errno {
        Errno::ENOENT => (EXIT_NOT_FOUND, "command not found"),
        Errno::EACCES => (EXIT_NOT_EXECUTABLE, "permission denied"),
        Errno::ENOEXEC => (EXIT_NOT_EXECUTABLE, "exec format error"),
        Errno::EISDIR => (EXIT_NOT_EXECUTABLE, "is a directory"),
        _ => (EXIT_NOT_EXECUTABLE, "cannot execute"),
    }
}

/// Per-stage launch plan, fixed before any fork so resolution failures
/// abort the pipeline with nothing started. Builtin stages are already
/// fully evaluated: the child only replays captured bytes.
enum StagePlan {
    Builtin { output: Vec<u8>, status: i32 },
    External { path: CString, argv: Vec<CString> },
}

/// Executes one pipeline and returns its status. A single-stage builtin
/// runs in-process so its side effects (cwd, aliases, environment) stick;
/// everything else forks.
pub fn run_pipeline(shell: &mut Shell, pipeline: &Pipeline) -> i32 {
    // A bare NAME=value line assigns into the shell itself.
    if pipeline.stages.len() == 1 && pipeline.stages[0].argv.is_empty() {
        for (name, value) in &pipeline.stages[0].assignments {
            std::env::set_var(name, value);
        }
        return EXIT_SUCCESS;
    }
    if pipeline.stages.len() == 1
        && !pipeline.background
        && builtins::is_builtin(command_name(&pipeline.stages[0]))
    {
        return run_builtin_stage(shell, &pipeline.stages[0]);
    }
    match spawn_pipeline(shell, pipeline) {
        Ok(status) => status,
        Err(err) => {
            eprintln!("psh: {:#}", err);
            EXIT_FAILURE
        }
    }
}

fn command_name(stage: &SimpleCommand) -> &str {
    stage.argv.first().map(String::as_str).unwrap_or("")
}

/// Builtin in a single-stage pipeline: apply its redirections to the
/// shell's own descriptors (restored on scope exit) and call it directly.
fn run_builtin_stage(shell: &mut Shell, stage: &SimpleCommand) -> i32 {
    let _redirs = match RedirGuard::apply(stage) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("psh: {:#}", err);
            return EXIT_FAILURE;
        }
    };
    let _env = EnvGuard::apply(&stage.assignments);
    builtins::run(shell, &stage.argv)
}

/// Evaluates a builtin destined for a forked pipeline stage in the
/// parent, before any fork, capturing its stdout and status. Running the
/// builtin after fork could hang on a lock another thread held at fork
/// time, so the child only replays the captured bytes. The stage's
/// assignments apply for the duration; shell-global effects (cwd, exit
/// request, aliases, bookmarks) are rolled back, so a builtin inside a
/// pipeline behaves like a subshell.
fn render_builtin(shell: &mut Shell, stage: &SimpleCommand) -> Result<(Vec<u8>, i32)> {
    let (r, w) = pipe().context("cannot create capture pipe")?;
    let saved_stdout = match dup(1) {
        Ok(fd) => fd,
        Err(err) => {
            let _ = close(r);
            let _ = close(w);
            return Err(err).context("cannot save stdout");
        }
    };
    if let Err(err) = dup2(w, 1) {
        let _ = close(r);
        let _ = close(w);
        let _ = close(saved_stdout);
        return Err(err).context("cannot capture stdout");
    }
    let _ = close(w);

    // Drained concurrently so a chatty builtin never fills the pipe.
    let collector = thread::spawn(move || {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match read(r, &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        let _ = close(r);
        out
    });

    let saved_cwd = std::env::current_dir().ok();
    let saved_exit = shell.exit.take();
    let saved_aliases = shell.aliases.clone();
    let saved_bookmarks = shell.bookmarks.clone();
    let saved_prev_dir = shell.prev_dir.clone();

    let status = {
        let _env = EnvGuard::apply(&stage.assignments);
        builtins::run(shell, &stage.argv)
    };
    {
        use std::io::Write as _;
        let _ = std::io::stdout().flush();
    }
    let _ = dup2(saved_stdout, 1);
    let _ = close(saved_stdout);

    shell.exit = saved_exit;
    shell.aliases = saved_aliases;
    shell.bookmarks = saved_bookmarks;
    shell.prev_dir = saved_prev_dir;
    if let Some(dir) = saved_cwd {
        let _ = std::env::set_current_dir(dir);
    }

    let output = collector.join().unwrap_or_default();
    Ok((output, status))
}

fn spawn_pipeline(shell: &mut Shell, pipeline: &Pipeline) -> Result<i32> {
    // Resolve every stage up front; a missing command aborts the whole
    // pipeline before a single process is started.
    let mut plans = Vec::with_capacity(pipeline.stages.len());
    for stage in &pipeline.stages {
        if builtins::is_builtin(command_name(stage)) {
            let (output, status) = render_builtin(shell, stage)?;
            plans.push(StagePlan::Builtin { output, status });
            continue;
        }
        match shell.resolver.resolve(command_name(stage)) {
            Ok(path) => {
                let path = CString::new(path.into_os_string().into_string().unwrap_or_default())
                    .context("path contains NUL")?;
                let argv = stage
                    .argv
                    .iter()
                    .map(|a| CString::new(a.as_str()))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .context("argument contains NUL")?;
                plans.push(StagePlan::External { path, argv });
            }
            Err(err) => {
                eprintln!("psh: {}", err);
                return Ok(err.exit_status());
            }
        }
    }

    let mut pgid: Option<Pgid> = None;
    let mut pids: Vec<Pid> = Vec::new();
    match fork_stages(pipeline, &plans, &mut pgid, &mut pids) {
        Ok(()) => {}
        Err(err) => {
            // Kill anything already forked so no half-built pipeline leaks.
            if let Some(pgid) = pgid {
                let _ = killpg(pgid.as_pid(), Signal::SIGKILL);
                for pid in &pids {
                    let _ = waitpid(*pid, None);
                }
            }
            return Err(err);
        }
    }

    let pgid = pgid.expect("non-empty pipeline");
    let command = pipeline.display();
    if pipeline.background {
        let mut table = shell.jobs.lock().unwrap();
        let id = table.add(pgid, pids, command, JobStatus::Running);
        println!("[{}] {}", id, pgid);
        Ok(EXIT_SUCCESS)
    } else {
        Ok(foreground_wait(shell, pgid, pids, command))
    }
}

fn fork_stages(
    pipeline: &Pipeline,
    plans: &[StagePlan],
    pgid: &mut Option<Pgid>,
    pids: &mut Vec<Pid>,
) -> Result<()> {
    let n = pipeline.stages.len();
    let mut prev_read: Option<RawFd> = None;

    for (i, (stage, plan)) in pipeline.stages.iter().zip(plans).enumerate() {
        let pipe_pair = if i + 1 < n {
            Some(pipe().context("cannot create pipe")?)
        } else {
            None
        };
        let heredoc_fd = prepare_heredoc(stage)?;

        match unsafe { fork() }.context("cannot fork")? {
            ForkResult::Child => {
                let pid = getpid();
                let group = pgid.map(Pgid::as_pid).unwrap_or(pid);
                let _ = setpgid(pid, group);
                if !pipeline.background {
                    crate::terminal::give(Pgid::from_pid(group));
                }
                signals::restore_child_defaults();

                if let Some(fd) = prev_read {
                    let _ = dup2(fd, 0);
                    let _ = close(fd);
                }
                if let Some((r, w)) = pipe_pair {
                    let _ = close(r);
                    let _ = dup2(w, 1);
                    let _ = close(w);
                }
                // Stage redirections take precedence over pipe wiring.
                child_apply_redirects(stage, heredoc_fd);

                match plan {
                    // Plain writes and exit only; the parent is
                    // multithreaded, so the child must not touch locks.
                    StagePlan::Builtin { output, status } => {
                        let mut buf = output.as_slice();
                        while !buf.is_empty() {
                            match write(1, buf) {
                                Ok(0) => break,
                                Ok(n) => buf = &buf[n..],
                                Err(Errno::EINTR) => continue,
                                Err(_) => break,
                            }
                        }
                        std::process::exit(*status);
                    }
                    StagePlan::External { path, argv } => exec_child(path, argv, stage),
                }
            }
            ForkResult::Parent { child } => {
                let group = *pgid.get_or_insert(Pgid::from_pid(child));
                // Both sides call setpgid to close the race; EACCES after
                // the child already exec'd is expected.
                let _ = setpgid(child, group.as_pid());
                debug!(pid = %child, pgid = %group, stage = i, "forked stage");
                pids.push(child);

                if let Some(fd) = prev_read {
                    let _ = close(fd);
                }
                if let Some(fd) = heredoc_fd {
                    let _ = close(fd);
                }
                prev_read = match pipe_pair {
                    Some((r, w)) => {
                        let _ = close(w);
                        Some(r)
                    }
                    None => None,
                };
            }
        }
    }
    Ok(())
}

/// Blocks on every stage of a foreground pipeline. The tail stage's status
/// is the pipeline's. A stop notification turns the remainder of the
/// pipeline into a `Stopped` background-manageable job.
fn foreground_wait(shell: &mut Shell, pgid: Pgid, pids: Vec<Pid>, command: String) -> i32 {
    let _guard = ForegroundGuard::new(pgid, shell.shell_pgid);
    let last = *pids.last().expect("non-empty pipeline");
    let mut remaining = pids.clone();
    let mut usage = Duration::ZERO;
    let mut tail_result: Option<(bool, i32)> = None;
    let mut status = EXIT_SUCCESS;

    for pid in &pids {
        let Some((ws, ru)) = signals::wait_pid_blocking(*pid) else {
            remaining.retain(|p| p != pid);
            continue;
        };
        usage += ru;
        match ws {
            WaitStatus::Exited(_, code) => {
                remaining.retain(|p| p != pid);
                if *pid == last {
                    tail_result = Some((false, code));
                    status = status_from_wait(&ws);
                }
            }
            WaitStatus::Signaled(_, sig, _) => {
                remaining.retain(|p| p != pid);
                if *pid == last {
                    tail_result = Some((true, sig as i32));
                    status = status_from_wait(&ws);
                    match sig {
                        Signal::SIGINT => println!(),
                        Signal::SIGPIPE => {}
                        other => eprintln!("{}", other.as_str()),
                    }
                }
            }
            WaitStatus::Stopped(_, _) => {
                // The whole group got the stop signal; register what is
                // left as a stopped job the user can bg/fg later.
                let mut table = shell.jobs.lock().unwrap();
                let id = table.add(pgid, remaining.clone(), command.clone(), JobStatus::Stopped);
                if let Some(job) = table.get_mut(id) {
                    job.usage = usage;
                    job.last_pid = last;
                    if let Some((signaled, value)) = tail_result {
                        job.last_signaled = signaled;
                        job.term_status = Some(value);
                    }
                }
                println!("\n[{}]+  {:<24}{}", id, "Stopped", command);
                return status_from_wait(&ws);
            }
            _ => {}
        }
    }
    status
}

/// Here-documents and here-strings get a pipe filled from a short-lived
/// writer thread; the write end is CLOEXEC so the child cannot hold its
/// own stdin open.
fn prepare_heredoc(stage: &SimpleCommand) -> Result<Option<RawFd>> {
    let body = match &stage.stdin {
        Some(InputRedirect::HereDoc { body, .. }) => body.clone(),
        Some(InputRedirect::HereString(word)) => format!("{}\n", word),
        _ => return Ok(None),
    };
    let (r, w) = pipe().context("cannot create here-document pipe")?;
    fcntl(w, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).context("cannot set CLOEXEC")?;
    thread::spawn(move || {
        let mut buf = body.as_bytes();
        while !buf.is_empty() {
            match write(w, buf) {
                Ok(n) => buf = &buf[n..],
                Err(_) => break,
            }
        }
        let _ = close(w);
    });
    Ok(Some(r))
}

/// Child-side redirection wiring; diagnoses and exits on failure since
/// there is no shell to return to.
fn child_apply_redirects(stage: &SimpleCommand, heredoc_fd: Option<RawFd>) {
    if let Some(fd) = heredoc_fd {
        let _ = dup2(fd, 0);
        let _ = close(fd);
    } else if let Some(InputRedirect::File(path)) = &stage.stdin {
        match open(path.as_str(), OFlag::O_RDONLY, Mode::empty()) {
            Ok(fd) => {
                let _ = dup2(fd, 0);
                let _ = close(fd);
            }
            Err(errno) => {
                eprintln!("psh: {}: {}", path, errno.desc());
                std::process::exit(EXIT_FAILURE);
            }
        }
    }
    if let Some(OutputRedirect { path, append }) = &stage.stdout {
        let mut flags = OFlag::O_WRONLY | OFlag::O_CREAT;
        flags |= if *append { OFlag::O_APPEND } else { OFlag::O_TRUNC };
        match open(path.as_str(), flags, Mode::from_bits_truncate(0o644)) {
            Ok(fd) => {
                let _ = dup2(fd, 1);
                let _ = close(fd);
            }
            Err(errno) => {
                eprintln!("psh: {}: {}", path, errno.desc());
                std::process::exit(EXIT_FAILURE);
            }
        }
    }
}

/// Final step in a forked stage: export the stage's environment overrides
/// and exec the resolved binary. Never returns.
fn exec_child(path: &CString, argv: &[CString], stage: &SimpleCommand) -> ! {
    for name in &stage.exported {
        if let Some((_, value)) = stage.assignments.iter().find(|(n, _)| n == name) {
            std::env::set_var(name, value);
        }
    }
    let err = execv(path, argv).unwrap_err();
    let (code, msg) = exec_failure(err);
    eprintln!("psh: {}: {}", command_name(stage), msg);
    std::process::exit(code);
}

/// Saves the shell's stdin/stdout across a builtin's redirections and puts
/// them back on drop, whatever path the builtin exits through.
struct RedirGuard {
    saved: Vec<(RawFd, RawFd)>,
}

impl RedirGuard {
    fn apply(stage: &SimpleCommand) -> Result<Self> {
        let mut guard = RedirGuard { saved: Vec::new() };
        if stage.stdin.is_some() {
            let fd = match &stage.stdin {
                Some(InputRedirect::File(path)) => open(path.as_str(), OFlag::O_RDONLY, Mode::empty())
                    .with_context(|| format!("{}: cannot open", path))?,
                _ => prepare_heredoc(stage)?.expect("heredoc stdin"),
            };
            guard.saved.push((0, dup(0).context("cannot save stdin")?));
            dup2(fd, 0).context("cannot redirect stdin")?;
            let _ = close(fd);
        }
        if let Some(OutputRedirect { path, append }) = &stage.stdout {
            let mut flags = OFlag::O_WRONLY | OFlag::O_CREAT;
            flags |= if *append { OFlag::O_APPEND } else { OFlag::O_TRUNC };
            let fd = open(path.as_str(), flags, Mode::from_bits_truncate(0o644))
                .with_context(|| format!("{}: cannot open", path))?;
            guard.saved.push((1, dup(1).context("cannot save stdout")?));
            dup2(fd, 1).context("cannot redirect stdout")?;
            let _ = close(fd);
        }
        Ok(guard)
    }
}

impl Drop for RedirGuard {
    fn drop(&mut self) {
        for (fd, saved) in self.saved.drain(..).rev() {
            let _ = dup2(saved, fd);
            let _ = close(saved);
        }
    }
}

/// Applies `NAME=value` pairs to the shell's environment for the duration
/// of an in-process builtin call, restoring the prior values on drop.
struct EnvGuard {
    saved: Vec<(String, Option<String>)>,
}

impl EnvGuard {
    fn apply(assignments: &[(String, String)]) -> Self {
        let mut saved = Vec::new();
        for (name, value) in assignments {
            saved.push((name.clone(), std::env::var(name).ok()));
            std::env::set_var(name, value);
        }
        EnvGuard { saved }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (name, old) in self.saved.drain(..).rev() {
            match old {
                Some(value) => std::env::set_var(&name, value),
                None => std::env::remove_var(&name),
            }
        }
    }
}

/// Resumes a job in the foreground, as `fg` requires. The caller has
/// removed the job from the table so the reaper cannot consume the wait
/// statuses this function blocks on; if the job stops again it goes back
/// in under its old id.
pub fn continue_foreground(shell: &mut Shell, mut job: Job) -> i32 {
    let pgid = job.pgid;
    let _guard = ForegroundGuard::new(pgid, shell.shell_pgid);
    if let Err(errno) = killpg(pgid.as_pid(), Signal::SIGCONT) {
        eprintln!("psh: fg: {}", errno.desc());
        shell.jobs.lock().unwrap().reinsert(job);
        return EXIT_FAILURE;
    }
    job.status = JobStatus::Running;

    let last = job.last_pid;
    let pids = job.pids.clone();
    let mut remaining = pids.clone();
    // The tail stage may have finished before the job was stopped; its
    // recorded outcome is the fallback status.
    let mut status = match (job.last_signaled, job.term_status) {
        (true, Some(sig)) => 128 + sig,
        (false, Some(code)) => code,
        _ => EXIT_SUCCESS,
    };

    for pid in &pids {
        let Some((ws, ru)) = signals::wait_pid_blocking(*pid) else {
            remaining.retain(|p| p != pid);
            continue;
        };
        job.usage += ru;
        match ws {
            WaitStatus::Exited(_, code) => {
                remaining.retain(|p| p != pid);
                if *pid == last {
                    job.last_signaled = false;
                    job.term_status = Some(code);
                    status = status_from_wait(&ws);
                }
            }
            WaitStatus::Signaled(_, sig, _) => {
                remaining.retain(|p| p != pid);
                if *pid == last {
                    job.last_signaled = true;
                    job.term_status = Some(sig as i32);
                    status = status_from_wait(&ws);
                    match sig {
                        Signal::SIGINT => println!(),
                        Signal::SIGPIPE => {}
                        other => eprintln!("{}", other.as_str()),
                    }
                }
            }
            WaitStatus::Stopped(_, _) => {
                job.pids = remaining;
                job.status = JobStatus::Stopped;
                job.changed = false;
                let id = job.id;
                let command = job.command.clone();
                shell.jobs.lock().unwrap().reinsert(job);
                println!("\n[{}]+  {:<24}{}", id, "Stopped", command);
                return status_from_wait(&ws);
            }
            _ => {}
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_encoding() {
        let pid = Pid::from_raw(42);
        assert_eq!(status_from_wait(&WaitStatus::Exited(pid, 0)), 0);
        assert_eq!(status_from_wait(&WaitStatus::Exited(pid, 2)), 2);
        assert_eq!(
            status_from_wait(&WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            128 + 9
        );
        assert_eq!(
            status_from_wait(&WaitStatus::Stopped(pid, Signal::SIGTSTP)),
            128 + 20
        );
    }

    #[test]
    fn test_exec_failure_mapping() {
        assert_eq!(exec_failure(Errno::ENOENT), (EXIT_NOT_FOUND, "command not found"));
        assert_eq!(exec_failure(Errno::EACCES).0, EXIT_NOT_EXECUTABLE);
        assert_eq!(exec_failure(Errno::ENOEXEC).0, EXIT_NOT_EXECUTABLE);
        assert_eq!(exec_failure(Errno::EISDIR).0, EXIT_NOT_EXECUTABLE);
    }

    fn test_shell() -> Shell {
        Shell::new(
            crate::jobs::shared(),
            Pgid::from_pid(nix::unistd::getpgrp()),
            false,
        )
    }

    fn only_stage(line: &str) -> crate::parser::SimpleCommand {
        crate::parser::parse_line(line).unwrap().remove(0).stages.remove(0)
    }

    #[test]
    fn test_render_builtin_returns_status_without_exiting_shell() {
        let mut shell = test_shell();
        let (output, status) = render_builtin(&mut shell, &only_stage("exit 3")).unwrap();
        assert_eq!(status, 3);
        assert!(output.is_empty());
        // the exit request belongs to the pipeline stage, not the shell
        assert!(shell.exit.is_none());
    }

    #[test]
    fn test_render_builtin_rolls_back_alias_changes() {
        let mut shell = test_shell();
        let (_, status) = render_builtin(&mut shell, &only_stage("alias ll=ls")).unwrap();
        assert_eq!(status, 0);
        assert!(shell.aliases.is_empty());
    }

    #[test]
    fn test_render_builtin_applies_stage_assignments() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("onlyhere");
        std::fs::write(&tool, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        // `type` resolves through PATH, so it only succeeds if the
        // stage's PATH override is in effect while the builtin runs
        let mut shell = test_shell();
        let line = format!("PATH={} type onlyhere", dir.path().display());
        let (_, status) = render_builtin(&mut shell, &only_stage(&line)).unwrap();
        assert_eq!(status, EXIT_SUCCESS);
        assert_ne!(std::env::var("PATH").ok().as_deref(), dir.path().to_str());
    }

    #[test]
    fn test_env_guard_restores() {
        std::env::set_var("PSH_TEST_KEEP", "old");
        std::env::remove_var("PSH_TEST_FRESH");
        {
            let _g = EnvGuard::apply(&[
                ("PSH_TEST_KEEP".into(), "new".into()),
                ("PSH_TEST_FRESH".into(), "x".into()),
            ]);
            assert_eq!(std::env::var("PSH_TEST_KEEP").unwrap(), "new");
            assert_eq!(std::env::var("PSH_TEST_FRESH").unwrap(), "x");
        }
        assert_eq!(std::env::var("PSH_TEST_KEEP").unwrap(), "old");
        assert!(std::env::var("PSH_TEST_FRESH").is_err());
    }
}
