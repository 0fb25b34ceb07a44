mod builtins;
mod exec;
mod jobs;
mod parser;
mod resolver;
mod sequencer;
mod session;
mod shell;
mod signals;
mod terminal;
mod utils;

use std::env;

fn main() {
    // Parse command-line arguments.
    let args: Vec<String> = env::args().collect();
    let mut emit_prompt = true;
    let mut verbose = false;
    for arg in &args[1..] {
        match arg.as_str() {
            "-h" => utils::print_usage(),
            "-v" => verbose = true,
            "-p" => emit_prompt = false,
            _ => {}
        }
    }

    init_tracing(verbose);

    // The shell ignores the keyboard signals; its children restore the
    // defaults after fork.
    signals::install_shell_dispositions();

    let code = shell::run(emit_prompt);
    std::process::exit(code);
}

/// Diagnostics go to stderr so they never mix with command output.
/// RUST_LOG overrides the defaults.
fn init_tracing(verbose: bool) {
    let default = if verbose { "psh=debug" } else { "psh=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
