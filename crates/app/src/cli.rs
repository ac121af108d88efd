use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use face_core::ReplayScript;
use serde::Serialize;

use crate::monitor::{self, FacewatchCliArgs, FacewatchConfig};

#[derive(Debug, Parser)]
#[command(name = "facewatch", version, about = "Face monitoring with offloaded network sends")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the monitor against a replay script.
    Run(FacewatchCliArgs),
    /// Validate a replay script and print a JSON summary.
    CheckScript {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

#[derive(Serialize)]
struct ScriptSummary {
    entries: usize,
    with_faces: usize,
    identities: usize,
    duration_ms: u64,
}

pub fn handle_commands(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => monitor::run(FacewatchConfig::try_from(args)?),
        Command::CheckScript { path } => {
            let script = ReplayScript::from_path(&path)
                .with_context(|| format!("Failed to load script {}", path.display()))?;
            let entries = script.entries();
            let summary = ScriptSummary {
                entries: entries.len(),
                with_faces: entries.iter().filter(|e| !e.faces.is_empty()).count(),
                identities: entries.iter().filter(|e| e.identity.is_some()).count(),
                duration_ms: script.duration().as_millis() as u64,
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_subcommand() {
        let cli = Cli::try_parse_from(["facewatch", "run", "--script", "demo.jsonl", "--no-display"])
            .unwrap();
        assert!(matches!(cli.command, Command::Run(ref args) if args.no_display));
    }

    #[test]
    fn script_is_required_for_run() {
        assert!(Cli::try_parse_from(["facewatch", "run"]).is_err());
    }
}
