//! Interface de linha de comando do cadenza baseada em clap.
//!
//! Define a struct [`Cli`] com flags globais (`--config`, `--max-concurrency`,
//! `--verbose`) e um subcomando [`Command`]: `run`, `plan` ou `tools`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::task::Task;

/// Cadenza: dependency-aware orchestration of AI audio tools.
#[derive(Debug, Parser)]
#[command(name = "cadenza", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./cadenza.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Maximum external tool calls in flight.
    #[arg(long, global = true)]
    pub max_concurrency: Option<usize>,

    /// Debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs one job and follows it to completion.
    Run {
        /// Input reference handed to the planner (an upload id, a prompt, ...).
        request: String,

        /// JSON or TOML file holding the workflow configuration.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Workflow preset name, or `auto`.
        #[arg(long, conflicts_with = "file")]
        workflow: Option<String>,

        /// Use simulated tools instead of calling external services.
        #[arg(long, default_value_t = false)]
        simulate: bool,

        /// Owning user recorded on the job.
        #[arg(long, default_value = "local")]
        user: String,
    },

    /// Validates a task file and prints the execution plan without running it.
    Plan {
        /// JSON array of tasks, or TOML with `[[tasks]]` tables.
        #[arg(long)]
        file: PathBuf,
    },

    /// Lists the tool catalog.
    Tools,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskFile {
    tasks: Vec<Task>,
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}

/// Reads a task list from JSON (`[...]` or `{"tasks": [...]}`) or TOML.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    if is_toml(path) {
        let file: TaskFile = toml::from_str(&contents)
            .with_context(|| format!("invalid task file {}", path.display()))?;
        return Ok(file.tasks);
    }

    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    let tasks = match value {
        Value::Array(_) => serde_json::from_value(value)?,
        Value::Object(_) => serde_json::from_value::<TaskFile>(value)?.tasks,
        _ => bail!("{} must hold a task array", path.display()),
    };
    Ok(tasks)
}

/// Builds the workflow configuration for `run` from `--file` or `--workflow`.
/// Neither flag means `auto`.
pub fn workflow_config(file: Option<&Path>, workflow: Option<&str>) -> Result<Map<String, Value>> {
    if let Some(path) = file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value: Value = if is_toml(path) {
            toml::from_str(&contents)
                .with_context(|| format!("invalid workflow file {}", path.display()))?
        } else {
            serde_json::from_str(&contents)
                .with_context(|| format!("invalid JSON in {}", path.display()))?
        };
        let Value::Object(map) = value else {
            bail!("{} must hold a table/object", path.display());
        };
        return Ok(map);
    }

    let mut map = Map::new();
    match workflow {
        None | Some("auto") => {
            map.insert("type".into(), json!("auto"));
        }
        Some(preset) => {
            map.insert("type".into(), json!("preset"));
            map.insert("preset".into(), json!(preset));
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["cadenza", "run", "upload-42", "--simulate"]);
        match cli.command {
            Command::Run {
                request,
                file,
                workflow,
                simulate,
                user,
            } => {
                assert_eq!(request, "upload-42");
                assert!(file.is_none());
                assert!(workflow.is_none());
                assert!(simulate);
                assert_eq!(user, "local");
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "cadenza",
            "--config",
            "alt.toml",
            "--max-concurrency",
            "4",
            "--verbose",
            "tools",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.max_concurrency, Some(4));
        assert_eq!(cli.config, Some(PathBuf::from("alt.toml")));
        assert!(matches!(cli.command, Command::Tools));
    }

    #[test]
    fn file_and_workflow_conflict() {
        let res = Cli::try_parse_from([
            "cadenza", "run", "x", "--file", "w.json", "--workflow", "vocal_enhancement",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn workflow_from_flag() {
        let cfg = workflow_config(None, Some("vocal_enhancement")).unwrap();
        assert_eq!(cfg["type"], json!("preset"));
        assert_eq!(cfg["preset"], json!("vocal_enhancement"));
        assert_eq!(workflow_config(None, None).unwrap()["type"], json!("auto"));
    }

    #[test]
    fn workflow_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "type = \"auto\"\ngenre = \"rock\"\ncreativity = \"high\"").unwrap();
        let cfg = workflow_config(Some(file.path()), None).unwrap();
        assert_eq!(cfg["genre"], json!("rock"));
    }

    #[test]
    fn tasks_from_json_and_toml() {
        let mut json_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            json_file,
            r#"[{{"id": "gen", "name": "Generate", "input_format": "text", "output_format": "audio/wav"}}]"#
        )
        .unwrap();
        assert_eq!(load_tasks(json_file.path()).unwrap().len(), 1);

        let mut toml_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            toml_file,
            r#"
[[tasks]]
id = "gen"
name = "Generate"
input_format = "text"
output_format = "audio/wav"

[[tasks]]
id = "master"
name = "Master"
dependencies = ["gen"]
input_format = "audio/wav"
output_format = "audio/wav"
required = false
"#
        )
        .unwrap();
        let tasks = load_tasks(toml_file.path()).unwrap();
        assert_eq!(tasks[1].dependencies, vec!["gen"]);
        assert!(!tasks[1].required);
    }
}
