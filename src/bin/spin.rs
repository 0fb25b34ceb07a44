// spin <secs> [exit-code]
//
// Sleeps in one-second steps, then exits with the given code. Handy for
// exercising background jobs and nonzero pipeline statuses.

use std::env;
use std::process;
use std::thread;
use std::time::Duration;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("usage: {} <secs> [exit-code]", args[0]);
        process::exit(2);
    }

    let secs: u64 = args[1].parse().unwrap_or_else(|_| {
        eprintln!("{}: <secs> must be a non-negative integer", args[0]);
        process::exit(2);
    });
    let code: i32 = match args.get(2) {
        Some(arg) => arg.parse().unwrap_or_else(|_| {
            eprintln!("{}: [exit-code] must be an integer", args[0]);
            process::exit(2);
        }),
        None => 0,
    };

    for _ in 0..secs {
        thread::sleep(Duration::from_secs(1));
    }
    process::exit(code);
}
