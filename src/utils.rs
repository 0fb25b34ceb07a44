use std::process;

pub fn print_usage() -> ! {
    println!("Usage: psh [-hvp]");
    println!("   -h   Print this help message");
    println!("   -v   Enable verbose logging");
    println!("   -p   Do not print a command prompt");
    process::exit(1);
}
