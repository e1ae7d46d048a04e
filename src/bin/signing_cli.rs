//! Run one pipeline command.
//!
//! Reads a JSON command from the file named on the command line, or from stdin, and prints
//! the JSON result. Settings come from `SOLARSIGN_*` environment variables, or from a JSON
//! file passed with `--config`.
//!
//! Usage:
//!   signing_cli command.json
//!   signing_cli --config pipeline.json < command.json
//!   RUST_LOG=debug signing_cli command.json

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use solarsign_core::{PipelineConfig, Router, SigningWorkflow};

struct CliArgs {
    command_file: Option<PathBuf>,
    config_file: Option<PathBuf>,
}

impl CliArgs {
    fn from_args() -> Result<Self, String> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let mut parsed = CliArgs {
            command_file: None,
            config_file: None,
        };
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--config" | "-c" => {
                    i += 1;
                    let path = args.get(i).ok_or("--config needs a path")?;
                    parsed.config_file = Some(PathBuf::from(path));
                }
                "-" => parsed.command_file = None,
                other if other.starts_with('-') => return Err(format!("unknown option '{other}'")),
                other => parsed.command_file = Some(PathBuf::from(other)),
            }
            i += 1;
        }
        Ok(parsed)
    }
}

fn read_command(args: &CliArgs) -> std::io::Result<String> {
    match &args.command_file {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            Ok(input)
        }
    }
}

fn run() -> Result<bool, String> {
    let args = CliArgs::from_args()?;
    let config = match &args.config_file {
        Some(path) => PipelineConfig::from_json_file(path),
        None => PipelineConfig::from_env(),
    }
    .map_err(|e| format!("configuration: {e}"))?;
    let workflow = SigningWorkflow::new(config).map_err(|e| format!("startup: {e}"))?;
    let router = Router::new(workflow);

    let input = read_command(&args).map_err(|e| format!("reading command: {e}"))?;
    let output = router.dispatch_json(&input);
    println!("{output}");

    let success = serde_json::from_str::<serde_json::Value>(&output)
        .ok()
        .and_then(|v| v.get("success").and_then(serde_json::Value::as_bool))
        .unwrap_or(false);
    Ok(success)
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(message) => {
            log::error!("{message}");
            eprintln!("signing_cli: {message}");
            ExitCode::FAILURE
        }
    }
}
