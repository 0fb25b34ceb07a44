use std::path::PathBuf;
use std::str::FromStr;

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

use crate::exec::{self, EXIT_FAILURE, EXIT_SUCCESS, EXIT_USAGE};
use crate::jobs::{JobId, JobStatus, JobTable, JobspecError, Pgid};
use crate::shell::Shell;
use crate::signals;

const BUILTINS: &[&str] = &[
    "exit", "cd", "pwd", "alias", "unalias", "history", "export", "exec", "unset",
    "bookmark", "hash", "type", "jobs", "kill", "bg", "fg",
];

/// Whether `name` dispatches in-shell instead of through fork/exec.
pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

/// Runs a builtin and returns its exit status. The caller has already
/// arranged redirections and per-invocation environment.
pub fn run(shell: &mut Shell, argv: &[String]) -> i32 {
    let name = argv.first().map(String::as_str).unwrap_or("");
    let args = &argv[1.min(argv.len())..];
    match name {
        "exit" => exit(shell, args),
        "cd" => cd(shell, args),
        "pwd" => pwd(),
        "alias" => alias(shell, args),
        "unalias" => unalias(shell, args),
        "history" => history(shell),
        "export" => export(args),
        "exec" => exec_builtin(shell, args),
        "unset" => unset(args),
        "bookmark" => bookmark(shell, args),
        "hash" => hash(shell, args),
        "type" => type_builtin(shell, args),
        "jobs" => jobs(shell, args),
        "kill" => kill_builtin(shell, args),
        "bg" => bg(shell, args),
        "fg" => fg(shell, args),
        _ => {
            eprintln!("psh: {}: not a shell builtin", name);
            EXIT_FAILURE
        }
    }
}

fn exit(shell: &mut Shell, args: &[String]) -> i32 {
    let code = match args.first() {
        Some(arg) => match arg.parse::<i32>() {
            Ok(code) => code & 0xff,
            Err(_) => {
                eprintln!("psh: exit: {}: numeric argument required", arg);
                EXIT_USAGE
            }
        },
        None => shell.last_status,
    };
    shell.exit = Some(code);
    code
}

fn cd(shell: &mut Shell, args: &[String]) -> i32 {
    let target = match args.first().map(String::as_str) {
        None => match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home),
            Err(_) => {
                eprintln!("psh: cd: HOME not set");
                return EXIT_FAILURE;
            }
        },
        Some("-") => match shell.prev_dir.clone() {
            Some(prev) => {
                println!("{}", prev.display());
                prev
            }
            None => {
                eprintln!("psh: cd: no previous directory");
                return EXIT_FAILURE;
            }
        },
        Some(arg) => {
            let path = PathBuf::from(arg);
            if !path.is_dir() {
                if let Some(saved) = shell.bookmarks.get(arg) {
                    saved.clone()
                } else {
                    path
                }
            } else {
                path
            }
        }
    };
    let old = std::env::current_dir().ok();
    match std::env::set_current_dir(&target) {
        Ok(()) => {
            shell.prev_dir = old;
            EXIT_SUCCESS
        }
        Err(err) => {
            eprintln!("psh: cd: {}: {}", target.display(), err);
            EXIT_FAILURE
        }
    }
}

fn pwd() -> i32 {
    match std::env::current_dir() {
        Ok(dir) => {
            println!("{}", dir.display());
            EXIT_SUCCESS
        }
        Err(err) => {
            eprintln!("psh: pwd: {}", err);
            EXIT_FAILURE
        }
    }
}

fn alias(shell: &mut Shell, args: &[String]) -> i32 {
    if args.is_empty() {
        let mut names: Vec<&String> = shell.aliases.keys().collect();
        names.sort();
        for name in names {
            println!("alias {}='{}'", name, shell.aliases[name]);
        }
        return EXIT_SUCCESS;
    }
    let mut status = EXIT_SUCCESS;
    for arg in args {
        match arg.split_once('=') {
            Some((name, value)) => {
                shell.aliases.insert(name.to_string(), value.to_string());
            }
            None => match shell.aliases.get(arg) {
                Some(value) => println!("alias {}='{}'", arg, value),
                None => {
                    eprintln!("psh: alias: {}: not found", arg);
                    status = EXIT_FAILURE;
                }
            },
        }
    }
    status
}

fn unalias(shell: &mut Shell, args: &[String]) -> i32 {
    if args.first().map(String::as_str) == Some("-a") {
        shell.aliases.clear();
        return EXIT_SUCCESS;
    }
    let mut status = EXIT_SUCCESS;
    for name in args {
        if shell.aliases.remove(name).is_none() {
            eprintln!("psh: unalias: {}: not found", name);
            status = EXIT_FAILURE;
        }
    }
    status
}

fn history(shell: &Shell) -> i32 {
    for (i, line) in shell.history.iter().enumerate() {
        println!("{:5}  {}", i + 1, line);
    }
    EXIT_SUCCESS
}

fn export(args: &[String]) -> i32 {
    if args.is_empty() {
        let mut vars: Vec<(String, String)> = std::env::vars().collect();
        vars.sort();
        for (name, value) in vars {
            println!("{}={}", name, value);
        }
        return EXIT_SUCCESS;
    }
    for arg in args {
        if let Some((name, value)) = arg.split_once('=') {
            std::env::set_var(name, value);
        }
        // a bare name is already in the environment or nothing to do
    }
    EXIT_SUCCESS
}

/// Replaces the shell image with the given command; on success it never
/// returns.
fn exec_builtin(shell: &mut Shell, args: &[String]) -> i32 {
    let Some(name) = args.first() else {
        return EXIT_SUCCESS;
    };
    let path = match shell.resolver.resolve(name) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("psh: exec: {}", err);
            return err.exit_status();
        }
    };
    let Ok(path_c) = std::ffi::CString::new(path.to_string_lossy().into_owned()) else {
        return EXIT_FAILURE;
    };
    let argv: Vec<std::ffi::CString> = args
        .iter()
        .filter_map(|a| std::ffi::CString::new(a.as_str()).ok())
        .collect();
    signals::restore_child_defaults();
    let err = nix::unistd::execv(&path_c, &argv).unwrap_err();
    let (code, msg) = exec::exec_failure(err);
    eprintln!("psh: exec: {}: {}", name, msg);
    code
}

fn unset(args: &[String]) -> i32 {
    for name in args {
        std::env::remove_var(name);
    }
    EXIT_SUCCESS
}

fn bookmark(shell: &mut Shell, args: &[String]) -> i32 {
    match args.len() {
        0 => {
            let mut names: Vec<&String> = shell.bookmarks.keys().collect();
            names.sort();
            for name in names {
                println!("{}  {}", name, shell.bookmarks[name].display());
            }
            EXIT_SUCCESS
        }
        1 => match std::env::current_dir() {
            Ok(dir) => {
                shell.bookmarks.insert(args[0].clone(), dir);
                EXIT_SUCCESS
            }
            Err(err) => {
                eprintln!("psh: bookmark: {}", err);
                EXIT_FAILURE
            }
        },
        _ => {
            shell.bookmarks.insert(args[0].clone(), PathBuf::from(&args[1]));
            EXIT_SUCCESS
        }
    }
}

fn hash(shell: &mut Shell, args: &[String]) -> i32 {
    if args.first().map(String::as_str) == Some("-r") {
        shell.resolver.clear();
        return EXIT_SUCCESS;
    }
    if args.is_empty() {
        let entries = shell.resolver.entries();
        if !entries.is_empty() {
            println!("hits\tcommand");
            for (name, entry) in entries {
                println!("{:4}\t{} ({})", entry.hits, name, entry.path.display());
            }
        }
        return EXIT_SUCCESS;
    }
    let mut status = EXIT_SUCCESS;
    for name in args {
        if let Err(err) = shell.resolver.resolve(name) {
            eprintln!("psh: hash: {}", err);
            status = EXIT_FAILURE;
        }
    }
    status
}

fn type_builtin(shell: &mut Shell, args: &[String]) -> i32 {
    let mut status = EXIT_SUCCESS;
    for name in args {
        if is_builtin(name) {
            println!("{} is a shell builtin", name);
        } else if let Some(value) = shell.aliases.get(name) {
            println!("{} is aliased to `{}'", name, value);
        } else {
            match shell.resolver.resolve(name) {
                Ok(path) => println!("{} is {}", name, path.display()),
                Err(_) => {
                    eprintln!("psh: type: {}: not found", name);
                    status = EXIT_FAILURE;
                }
            }
        }
    }
    status
}

#[derive(Debug, Default, PartialEq, Eq)]
struct JobsFlags {
    long: bool,
    pgid_only: bool,
    running_only: bool,
    stopped_only: bool,
}

impl JobsFlags {
    fn parse(args: &[String]) -> Result<Self, String> {
        let mut flags = JobsFlags::default();
        for arg in args {
            let Some(body) = arg.strip_prefix('-') else {
                return Err(format!("jobs: {}: unexpected argument", arg));
            };
            for c in body.chars() {
                match c {
                    'l' => flags.long = true,
                    'p' => flags.pgid_only = true,
                    'r' => flags.running_only = true,
                    's' => flags.stopped_only = true,
                    _ => return Err(format!("jobs: -{}: invalid option", c)),
                }
            }
        }
        Ok(flags)
    }

    fn admits(&self, status: JobStatus) -> bool {
        match (self.running_only, self.stopped_only) {
            (true, false) => status == JobStatus::Running,
            (false, true) => status == JobStatus::Stopped,
            _ => true,
        }
    }
}

/// The jobs a listing with these flags shows, in table order.
fn admitted_ids(table: &JobTable, flags: &JobsFlags) -> Vec<JobId> {
    table.iter().filter(|j| flags.admits(j.status)).map(|j| j.id).collect()
}

/// Listing lines for the local table; pure so it is testable without
/// touching the OS.
fn format_jobs(table: &JobTable, flags: &JobsFlags) -> Vec<String> {
    let mut lines = Vec::new();
    for job in table.iter() {
        if !flags.admits(job.status) {
            continue;
        }
        if flags.pgid_only {
            lines.push(format!("{}", job.pgid));
        } else if flags.long {
            lines.push(format!(
                "[{}]{} {:>7}  {:<12}{:>5.1}%  {}",
                job.id,
                table.mark(job.id),
                job.pgid,
                job.status_label(),
                job.cpu_percent(),
                job.command
            ));
        } else {
            lines.push(format!(
                "[{}]{}  {:<24}{}",
                job.id,
                table.mark(job.id),
                job.status_label(),
                job.command
            ));
        }
    }
    lines
}

fn jobs(shell: &mut Shell, args: &[String]) -> i32 {
    let flags = match JobsFlags::parse(args) {
        Ok(flags) => flags,
        Err(msg) => {
            eprintln!("psh: {}", msg);
            return EXIT_USAGE;
        }
    };
    {
        let mut table = shell.jobs.lock().unwrap();
        signals::reap(&mut table);
        table.prune_stale();
        let listed = admitted_ids(&table, &flags);
        for line in format_jobs(&table, &flags) {
            println!("{}", line);
        }
        table.mark_reported(&listed);
    }
    // Jobs owned by other live psh sessions, read from their state files.
    if let Some(session) = &shell.session {
        for (owner, jobs) in session.load_others() {
            for job in jobs {
                if !flags.admits(job.status) {
                    continue;
                }
                if flags.pgid_only {
                    println!("{}", job.pgid);
                } else {
                    println!(
                        "[{}]   {:<24}{}   (psh {})",
                        job.id, job.status, job.command, owner
                    );
                }
            }
        }
    }
    EXIT_SUCCESS
}

/// `kill [-s sig | -n num | -sig] target...` argument parsing, separated
/// out for tests. Targets may be pids, negated pgids, or jobspecs.
fn parse_kill_args(args: &[String]) -> Result<(Signal, Vec<String>), String> {
    let mut signal = Signal::SIGTERM;
    let mut targets = Vec::new();
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        if !targets.is_empty() || !arg.starts_with('-') {
            targets.push(arg.clone());
            continue;
        }
        match arg.as_str() {
            "--" => {
                targets.extend(iter.cloned());
                break;
            }
            "-s" => {
                let name = iter.next().ok_or("kill: -s requires an argument")?;
                signal = parse_signal_name(name)?;
            }
            "-n" => {
                let num = iter.next().ok_or("kill: -n requires an argument")?;
                signal = parse_signal_number(num)?;
            }
            _ => {
                let body = &arg[1..];
                // `-15` style numbers and `-TERM` style names are signals;
                // anything else (a negative pgid comes after options) is a
                // target.
                if let Ok(sig) = parse_signal_spec(body) {
                    signal = sig;
                } else {
                    targets.push(arg.clone());
                }
            }
        }
    }
    if targets.is_empty() {
        return Err("kill: usage: kill [-s sigspec | -n signum | -sigspec] pid | jobspec ...".into());
    }
    Ok((signal, targets))
}

fn parse_signal_name(name: &str) -> Result<Signal, String> {
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") { upper.clone() } else { format!("SIG{}", upper) };
    Signal::from_str(&full).map_err(|_| format!("kill: {}: invalid signal specification", name))
}

fn parse_signal_number(num: &str) -> Result<Signal, String> {
    num.parse::<i32>()
        .ok()
        .and_then(|n| Signal::try_from(n).ok())
        .ok_or_else(|| format!("kill: {}: invalid signal specification", num))
}

fn parse_signal_spec(spec: &str) -> Result<Signal, String> {
    if spec.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        parse_signal_number(spec)
    } else {
        parse_signal_name(spec)
    }
}

fn kill_builtin(shell: &mut Shell, args: &[String]) -> i32 {
    let (signal, targets) = match parse_kill_args(args) {
        Ok(parsed) => parsed,
        Err(msg) => {
            eprintln!("psh: {}", msg);
            return EXIT_USAGE;
        }
    };
    let mut status = EXIT_SUCCESS;
    for target in &targets {
        if let Err(msg) = kill_one(shell, target, signal) {
            eprintln!("psh: kill: {}", msg);
            status = EXIT_FAILURE;
        }
    }
    status
}

fn kill_one(shell: &mut Shell, target: &str, signal: Signal) -> Result<(), String> {
    if target.starts_with('%') {
        let pgid = resolve_target_pgid(shell, target)?;
        return killpg(pgid.as_pid(), signal)
            .map_err(|err| format!("{}: {}", target, err.desc()));
    }
    // Parsing as i32 rejects numbers the kernel could never name.
    let n: i32 = target
        .parse()
        .map_err(|_| format!("{}: arguments must be process or job IDs", target))?;
    let result = if n < 0 {
        let pgid = n
            .checked_neg()
            .ok_or_else(|| format!("{}: arguments must be process or job IDs", target))?;
        killpg(Pid::from_raw(pgid), signal)
    } else {
        kill(Pid::from_raw(n), signal)
    };
    result.map_err(|err| format!("({}) - {}", target, err.desc()))
}

/// Local jobspec resolution, falling back to other sessions' published
/// jobs for `kill`.
fn resolve_target_pgid(shell: &mut Shell, spec: &str) -> Result<Pgid, String> {
    let local = {
        let mut table = shell.jobs.lock().unwrap();
        match table.resolve(spec) {
            Ok(id) => Ok(table.get(id).map(|j| j.pgid).expect("resolved job present")),
            Err(err) => Err(err),
        }
    };
    match local {
        Ok(pgid) => Ok(pgid),
        Err(JobspecError::NoSuchJob(_)) => match &shell.session {
            Some(session) => session.resolve_elsewhere(spec).map_err(|e| e.to_string()),
            None => Err(JobspecError::NoSuchJob(
                spec.trim_start_matches('%').to_string(),
            )
            .to_string()),
        },
        Err(err) => Err(err.to_string()),
    }
}

fn bg(shell: &mut Shell, args: &[String]) -> i32 {
    let spec = args.first().map(String::as_str).unwrap_or("%+");
    let mut table = shell.jobs.lock().unwrap();
    signals::reap(&mut table);
    let id = match table.resolve(spec) {
        Ok(id) => id,
        Err(err) => {
            eprintln!("psh: bg: {}", err);
            return EXIT_FAILURE;
        }
    };
    let job = table.get_mut(id).expect("resolved job present");
    if job.status == JobStatus::Running {
        eprintln!("psh: bg: job {} already in background", id);
        return EXIT_SUCCESS;
    }
    let pgid = job.pgid;
    if let Err(err) = killpg(pgid.as_pid(), Signal::SIGCONT) {
        eprintln!("psh: bg: {}: {}", spec, err.desc());
        return EXIT_FAILURE;
    }
    let job = table.get_mut(id).expect("resolved job present");
    job.status = JobStatus::Running;
    job.changed = false;
    let command = table.get(id).expect("resolved job present").command.clone();
    println!("[{}]{} {} &", id, table.mark(id), command);
    EXIT_SUCCESS
}

fn fg(shell: &mut Shell, args: &[String]) -> i32 {
    let spec = args.first().map(String::as_str).unwrap_or("%+");
    let job = {
        let mut table = shell.jobs.lock().unwrap();
        signals::reap(&mut table);
        table.prune_stale();
        let id = match table.resolve(spec) {
            Ok(id) => id,
            Err(err) => {
                eprintln!("psh: fg: {}", err);
                return EXIT_FAILURE;
            }
        };
        // Taken out of the table for the duration: the reaper must not
        // consume the wait statuses the foreground wait is blocking on.
        table.remove(id).expect("resolved job present")
    };
    println!("{}", job.command);
    exec::continue_foreground(shell, job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobId, JobTable};

    fn table() -> JobTable {
        let mut t = JobTable::new();
        t.add(Pgid::new(100), vec![Pid::from_raw(100)], "sleep 100".into(), JobStatus::Running);
        t.add(Pgid::new(200), vec![Pid::from_raw(200)], "vim notes".into(), JobStatus::Stopped);
        t.add(Pgid::new(300), vec![Pid::from_raw(300)], "make -j8".into(), JobStatus::Running);
        t
    }

    #[test]
    fn test_builtin_names() {
        for name in ["jobs", "kill", "bg", "fg", "cd", "exit", "hash", "bookmark"] {
            assert!(is_builtin(name));
        }
        assert!(!is_builtin("ls"));
        assert!(!is_builtin(""));
    }

    #[test]
    fn test_jobs_flags_parse() {
        let args: Vec<String> = vec!["-l".into(), "-r".into()];
        let flags = JobsFlags::parse(&args).unwrap();
        assert!(flags.long && flags.running_only && !flags.stopped_only);
        let args: Vec<String> = vec!["-ps".into()];
        let flags = JobsFlags::parse(&args).unwrap();
        assert!(flags.pgid_only && flags.stopped_only);
        assert!(JobsFlags::parse(&["-x".to_string()]).is_err());
        assert!(JobsFlags::parse(&["foo".to_string()]).is_err());
    }

    #[test]
    fn test_jobs_pgid_only_output() {
        let t = table();
        let flags = JobsFlags { pgid_only: true, ..Default::default() };
        assert_eq!(format_jobs(&t, &flags), vec!["100", "200", "300"]);
    }

    #[test]
    fn test_jobs_filters() {
        let t = table();
        let flags = JobsFlags { pgid_only: true, running_only: true, ..Default::default() };
        assert_eq!(format_jobs(&t, &flags), vec!["100", "300"]);
        let flags = JobsFlags { pgid_only: true, stopped_only: true, ..Default::default() };
        assert_eq!(format_jobs(&t, &flags), vec!["200"]);
    }

    #[test]
    fn test_jobs_listing_shows_marks() {
        let t = table();
        let lines = format_jobs(&t, &JobsFlags::default());
        assert!(lines[2].starts_with("[3]+"));
        assert!(lines[1].starts_with("[2]-") || lines[1].starts_with("[2] "));
        assert!(lines[0].contains("sleep 100"));
    }

    #[test]
    fn test_jobs_long_has_pgid_column() {
        let t = table();
        let lines = format_jobs(&t, &JobsFlags { long: true, ..Default::default() });
        assert!(lines[0].contains("100"));
        assert!(lines[0].contains('%'));
    }

    #[test]
    fn test_parse_kill_defaults_to_term() {
        let args: Vec<String> = vec!["1234".into()];
        let (sig, targets) = parse_kill_args(&args).unwrap();
        assert_eq!(sig, Signal::SIGTERM);
        assert_eq!(targets, vec!["1234"]);
    }

    #[test]
    fn test_parse_kill_signal_forms() {
        for form in [vec!["-s", "KILL", "%1"], vec!["-s", "SIGKILL", "%1"], vec!["-n", "9", "%1"], vec!["-KILL", "%1"], vec!["-9", "%1"]] {
            let args: Vec<String> = form.iter().map(|s| s.to_string()).collect();
            let (sig, targets) = parse_kill_args(&args).unwrap();
            assert_eq!(sig, Signal::SIGKILL, "form {:?}", args);
            assert_eq!(targets, vec!["%1"]);
        }
    }

    #[test]
    fn test_parse_kill_negative_pgid_after_options() {
        let args: Vec<String> = vec!["-s".into(), "TERM".into(), "--".into(), "-1234".into()];
        let (sig, targets) = parse_kill_args(&args).unwrap();
        assert_eq!(sig, Signal::SIGTERM);
        assert_eq!(targets, vec!["-1234"]);
    }

    #[test]
    fn test_parse_kill_requires_targets() {
        assert!(parse_kill_args(&["-9".to_string()]).is_err());
        assert!(parse_kill_args(&[]).is_err());
    }

    #[test]
    fn test_parse_kill_rejects_bad_signal() {
        let args: Vec<String> = vec!["-s".into(), "NOPE".into(), "%1".into()];
        assert!(parse_kill_args(&args).is_err());
    }

    #[test]
    fn test_listed_terminal_jobs_are_retired() {
        let mut t = table();
        t.get_mut(JobId::new(1)).unwrap().status = JobStatus::Done;
        let all: Vec<JobId> = t.iter().map(|j| j.id).collect();
        t.mark_reported(&all);
        assert!(t.get(JobId::new(1)).is_none());
        assert!(t.get(JobId::new(2)).is_some());
    }

    #[test]
    fn test_filtered_listing_keeps_completion_notice() {
        let mut t = table();
        {
            let job = t.get_mut(JobId::new(1)).unwrap();
            job.status = JobStatus::Done;
            job.changed = true;
        }
        // a running-only listing hides the finished job entirely
        let flags = JobsFlags { pgid_only: true, running_only: true, ..Default::default() };
        let listed = admitted_ids(&t, &flags);
        assert!(!listed.contains(&JobId::new(1)));
        t.mark_reported(&listed);
        // it still owes the user exactly one completion notice
        let notes = t.drain_notifications();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("Done"));
        assert!(t.drain_notifications().is_empty());
    }

    #[test]
    fn test_kill_rejects_out_of_range_targets() {
        let mut shell = test_shell();
        let err = kill_one(&mut shell, "99999999999", Signal::SIGTERM).unwrap_err();
        assert!(err.contains("process or job IDs"));
        // negating i32::MIN cannot name a process group
        let err = kill_one(&mut shell, "-2147483648", Signal::SIGTERM).unwrap_err();
        assert!(err.contains("process or job IDs"));
    }

    fn test_shell() -> Shell {
        Shell::new(
            crate::jobs::shared(),
            Pgid::from_pid(nix::unistd::getpgrp()),
            false,
        )
    }
}
