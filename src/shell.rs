use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use nix::unistd::isatty;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::debug;

use crate::exec;
use crate::jobs::{self, Jobs, Pgid};
use crate::parser::{self, InputRedirect, Pipeline, SimpleCommand};
use crate::resolver::Resolver;
use crate::sequencer;
use crate::session::SessionStore;
use crate::signals;
use crate::terminal;

/// Global prompt string.
pub static PROMPT: &str = "psh> ";

/// Continuation prompt while a here-document body is being read.
static PROMPT_MORE: &str = "> ";

/// All per-session shell state: the shared job table, the binary cache,
/// aliases and bookmarks, and the status of the last pipeline.
pub struct Shell {
    pub jobs: Jobs,
    pub resolver: Resolver,
    pub aliases: HashMap<String, String>,
    pub bookmarks: HashMap<String, PathBuf>,
    pub history: Vec<String>,
    pub last_status: i32,
    pub shell_pgid: Pgid,
    pub interactive: bool,
    /// Cross-session job visibility; absent in batch mode or when the
    /// state directory cannot be created.
    pub session: Option<SessionStore>,
    /// Set by the `exit` builtin; the main loop stops when it appears.
    pub exit: Option<i32>,
    pub prev_dir: Option<PathBuf>,
}

impl Shell {
    pub fn new(jobs: Jobs, shell_pgid: Pgid, interactive: bool) -> Self {
        let session = if interactive {
            match SessionStore::new() {
                Ok(store) => Some(store),
                Err(err) => {
                    debug!(%err, "session store unavailable");
                    None
                }
            }
        } else {
            None
        };
        Shell {
            jobs,
            resolver: Resolver::new(),
            aliases: HashMap::new(),
            bookmarks: HashMap::new(),
            history: Vec::new(),
            last_status: exec::EXIT_SUCCESS,
            shell_pgid,
            interactive,
            session,
            exit: None,
            prev_dir: None,
        }
    }

    /// Single-level alias expansion on the head word of a stage. The
    /// replacement is tokenized so `alias ll='ls -l'` yields two argv
    /// entries, not one.
    pub fn expand_alias(&self, stage: &mut SimpleCommand) {
        let Some(name) = stage.argv.first() else { return };
        let Some(replacement) = self.aliases.get(name) else { return };
        match parser::tokenize(replacement) {
            Ok(tokens) if !tokens.is_empty() => {
                let mut argv: Vec<String> = tokens.into_iter().map(|t| t.text).collect();
                argv.extend(stage.argv.drain(1..));
                stage.argv = argv;
            }
            _ => {}
        }
    }
}

/// Where command lines come from: the line editor when on a terminal, a
/// plain buffered reader otherwise.
enum Input {
    Interactive(DefaultEditor),
    Batch(std::io::Lines<std::io::StdinLock<'static>>),
}

impl Input {
    fn open(interactive: bool) -> Self {
        if interactive {
            match DefaultEditor::new() {
                Ok(editor) => return Input::Interactive(editor),
                Err(err) => debug!(%err, "line editor unavailable, reading stdin"),
            }
        }
        Input::Batch(std::io::stdin().lines())
    }

    /// Reads one command line. `None` means end of input; Ctrl-C at the
    /// prompt yields an empty line.
    fn read_line(&mut self, emit_prompt: bool) -> Option<String> {
        match self {
            Input::Interactive(editor) => match editor.readline(PROMPT) {
                Ok(line) => Some(line),
                Err(ReadlineError::Interrupted) => Some(String::new()),
                Err(_) => None,
            },
            Input::Batch(lines) => {
                if emit_prompt {
                    print!("{}", PROMPT);
                    let _ = std::io::stdout().flush();
                }
                lines.next().and_then(|r| r.ok())
            }
        }
    }

    fn read_continuation(&mut self) -> Option<String> {
        match self {
            Input::Interactive(editor) => editor.readline(PROMPT_MORE).ok(),
            Input::Batch(lines) => lines.next().and_then(|r| r.ok()),
        }
    }
}

/// Runs the main shell loop: job housekeeping, prompt, read, parse,
/// evaluate. Returns the shell's final exit status.
pub fn run(emit_prompt: bool) -> i32 {
    let jobs = jobs::shared();
    signals::spawn_reaper(jobs.clone());
    let shell_pgid = terminal::claim_for_shell();
    let interactive = emit_prompt && isatty(libc::STDIN_FILENO).unwrap_or(false);
    let mut shell = Shell::new(jobs, shell_pgid, interactive);

    let mut input = Input::open(interactive);
    let history_path = dirs_next::home_dir().map(|h| h.join(".psh_history"));
    if let (Input::Interactive(editor), Some(path)) = (&mut input, &history_path) {
        let _ = editor.load_history(path);
    }

    loop {
        poll_jobs(&mut shell);

        let Some(line) = input.read_line(emit_prompt) else { break };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if let Input::Interactive(editor) = &mut input {
            let _ = editor.add_history_entry(&line);
        }
        shell.history.push(line.clone());

        match parser::parse_line(&line) {
            Ok(mut pipelines) => {
                fill_heredocs(&mut pipelines, || input.read_continuation());
                sequencer::run_list(&mut shell, &pipelines);
            }
            Err(err) => {
                eprintln!("psh: {}", err);
                shell.last_status = exec::EXIT_USAGE;
            }
        }
        if shell.exit.is_some() {
            break;
        }
    }

    if let (Input::Interactive(editor), Some(path)) = (&mut input, &history_path) {
        let _ = editor.save_history(path);
    }
    shell.exit.unwrap_or(shell.last_status)
}

/// Pre-prompt housekeeping: poll for finished children, drop jobs whose
/// groups vanished, print pending notices, and publish the table for
/// other sessions.
fn poll_jobs(shell: &mut Shell) {
    let notes = {
        let mut table = shell.jobs.lock().unwrap();
        signals::reap(&mut table);
        table.prune_stale();
        let notes = table.drain_notifications();
        if let Some(session) = &shell.session {
            session.publish(&table);
        }
        notes
    };
    for note in notes {
        println!("{}", note);
    }
}

/// Reads here-document bodies for every stage that declared one, line by
/// line until the delimiter (or end of input).
fn fill_heredocs(pipelines: &mut [Pipeline], mut next_line: impl FnMut() -> Option<String>) {
    for pipeline in pipelines {
        for stage in &mut pipeline.stages {
            let Some(InputRedirect::HereDoc { delimiter, body }) = &mut stage.stdin else {
                continue;
            };
            loop {
                match next_line() {
                    Some(line) if line == *delimiter => break,
                    Some(line) => {
                        body.push_str(&line);
                        body.push('\n');
                    }
                    None => break,
                }
            }
        }
    }
}
