// split <secs>
//
// Forks a child that spins for <secs> seconds and waits for it, giving a
// two-process group to test group-wide signaling and reaping against.

use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};
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

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            for _ in 0..secs {
                thread::sleep(Duration::from_secs(1));
            }
            process::exit(0);
        }
        Ok(ForkResult::Parent { child }) => {
            if let Err(err) = waitpid(child, None) {
                eprintln!("{}: waitpid: {}", args[0], err);
                process::exit(1);
            }
            process::exit(0);
        }
        Err(err) => {
            eprintln!("{}: fork: {}", args[0], err);
            process::exit(1);
        }
    }
}
