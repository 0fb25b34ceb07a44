// selfint <secs>
//
// Sleeps, then sends SIGINT to its own process group, simulating a
// Ctrl-C arriving while it runs in the foreground.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::getpgrp;
use std::env;
use std::process;
use std::thread;
use std::time::Duration;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("usage: {} <secs>", args[0]);
        process::exit(2);
    }
    let secs: u64 = args[1].parse().unwrap_or_else(|_| {
        eprintln!("{}: <secs> must be a non-negative integer", args[0]);
        process::exit(2);
    });

    thread::sleep(Duration::from_secs(secs));

    if let Err(err) = killpg(getpgrp(), Signal::SIGINT) {
        eprintln!("{}: killpg: {}", args[0], err);
        process::exit(1);
    }
    process::exit(0);
}
