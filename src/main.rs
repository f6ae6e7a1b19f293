//! nestedtx - nested transaction shell
//!
//! This is the main entry point for the nestedtx command-line interface.

use std::process::ExitCode;

use nestedtx::connection::{MemoryConfig, MemoryDatabase};
use nestedtx::repl::Repl;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // Parse simple command line args.
    let mut verbose = false;
    let mut read_only = false;
    let mut execute: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-v" | "--verbose" => {
                verbose = true;
            }
            "--read-only" => {
                read_only = true;
            }
            "-e" | "--execute" => {
                i += 1;
                if i < args.len() {
                    execute = Some(args[i].clone());
                } else {
                    eprintln!("Missing value for {}", args[i - 1]);
                    return ExitCode::FAILURE;
                }
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("nestedtx v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            arg => {
                eprintln!("Unknown option: {}", arg);
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    init_logging(verbose);

    let db = MemoryDatabase::new(MemoryConfig::new("shell").read_only(read_only));
    let mut repl = Repl::new(db);

    let result = match execute {
        Some(script) => repl.run_batch(&script, &mut std::io::stdout()),
        None => repl.run(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "nestedtx=debug" } else { "nestedtx=warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_help() {
    println!("nestedtx - nested transaction scopes over one connection");
    println!();
    println!("Usage: nestedtx [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -e, --execute SCRIPT   Run ';'-separated commands and exit");
    println!("  -v, --verbose          Log transaction events to stderr");
    println!("  --read-only            Refuse writes");
    println!("  -h, --help             Show this help message");
    println!("  --version              Show version");
    println!();
    println!("Examples:");
    println!("  nestedtx                                       Start the shell");
    println!("  nestedtx -e 'BEGIN; PUT a 1; BEGIN; COMMIT; COMMIT'");
    println!();
    println!("Set RUST_LOG to override the log filter.");
}
