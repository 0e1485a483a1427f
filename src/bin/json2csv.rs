use clap::Parser;
use dotenv::dotenv;
use egress_audit::run_record;
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use tracing::info;

#[derive(Parser)]
#[command(name = "json2csv")]
#[command(about = "Flatten verifier batch-run JSON into CSV", long_about = None)]
struct Cli {
    /// JSON file written by the verifier batch-run tool
    json_path: PathBuf,
}

fn is_empty_document(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

fn main() {
    dotenv().ok();
    egress_audit::init_tracing("json2csv");
    let cli = Cli::parse();

    let text = match fs::read_to_string(&cli.json_path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("ERR: cannot read {}: {}", cli.json_path.display(), e);
            process::exit(1);
        }
    };
    let document: Value = if text.trim().is_empty() {
        Value::Null
    } else {
        match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                eprintln!("ERR: invalid JSON: {}", e);
                process::exit(1);
            }
        }
    };

    if is_empty_document(&document) {
        eprintln!("ERR: JSON file empty");
        process::exit(1);
    }
    let runs = match run_record::parse_runs(&document) {
        Ok(runs) => runs,
        Err(e) => {
            eprintln!("ERR: {}", e);
            process::exit(2);
        }
    };
    info!(runs = runs.len(), "parsed verifier runs");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = run_record::write_csv(&runs, &mut out).and_then(|_| out.flush().map_err(Into::into)) {
        eprintln!("ERR: {}", e);
        process::exit(1);
    }
}
