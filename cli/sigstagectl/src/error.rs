//! Error handling and display for the CLI.

use colored::Colorize;
use sigstage_pipeline::{Operation, PipelineError};
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("{operation}: {failed} of {total} records failed")]
    RecordsFailed {
        operation: Operation,
        failed: usize,
        total: usize,
    },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    let hint = match err.downcast_ref::<CliError>() {
        Some(CliError::Pipeline(pipeline)) => pipeline_hint(pipeline),
        Some(CliError::Config(_)) => {
            Some("Hint: Check config.json and SIGSTAGE_* variables; `sigstage config` shows the effective values.".to_string())
        }
        Some(CliError::RecordsFailed { operation, .. }) => Some(format!(
            "Hint: Failed records were left in place. Fix the cause and re-run `sigstage {operation}`."
        )),
        _ => err.downcast_ref::<PipelineError>().and_then(pipeline_hint),
    };

    if let Some(hint) = hint {
        eprintln!("\n{}", hint.yellow());
    }
}

fn pipeline_hint(err: &PipelineError) -> Option<String> {
    match err {
        PipelineError::NotInstalled { tool, .. } => Some(format!(
            "Hint: Install {tool} or point --{tool} / SIGSTAGE_{} at it.",
            tool.to_uppercase()
        )),
        PipelineError::Configuration(_) => {
            Some("Hint: Pass exactly one of --key <path> or --sk.".to_string())
        }
        PipelineError::Staging(_) => Some(
            "Hint: Is another process using the staging address? Set --staging-address to a free loopback port."
                .to_string(),
        ),
        PipelineError::UnsupportedManifestShape { .. } => Some(
            "Hint: Nested manifest lists are not supported. Use --no-recursive to sign only the root."
                .to_string(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_tool_hint_names_the_override() {
        let err = PipelineError::NotInstalled {
            tool: "crane".to_string(),
            path: PathBuf::from("assets/crane/crane"),
        };
        let hint = pipeline_hint(&err).unwrap();
        assert!(hint.contains("--crane"));
        assert!(hint.contains("SIGSTAGE_CRANE"));
    }

    #[test]
    fn record_failures_summarize_counts() {
        let err = CliError::RecordsFailed {
            operation: Operation::Publish,
            failed: 2,
            total: 5,
        };
        assert_eq!(err.to_string(), "publish: 2 of 5 records failed");
    }

    #[test]
    fn per_record_errors_have_no_hint() {
        let err = PipelineError::SigningFailed {
            image: "registry.example/app@sha256:00".to_string(),
            diagnostics: "denied".to_string(),
        };
        assert!(pipeline_hint(&err).is_none());
    }
}
