//! Boot WeensyOS.
//!
//! Without a program, the default programs run. Without a tick limit, the
//! kernel runs until no process is runnable.

use clap::Parser;

/// Boot the WeensyOS kernel on the simulated machine.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Program to run in process 1. Unknown names load the default programs.
    program: Option<String>,

    /// Stop after this many timer interrupts.
    #[arg(short, long)]
    ticks: Option<usize>,
}

fn main() {
    let args = Args::parse();
    weensyos::run(args.program.as_deref(), args.ticks);
}
