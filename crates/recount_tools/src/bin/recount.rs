#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;

use recount_tools::journal_cli::{execute_journal_command, USAGE};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let subcommand = args.first().ok_or_else(|| USAGE.to_string())?;
    let journal_path = args
        .get(1)
        .map(PathBuf::from)
        .ok_or_else(|| USAGE.to_string())?;
    let record_id = args.get(2).map(String::as_str);

    let output = execute_journal_command(subcommand, &journal_path, record_id)?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
