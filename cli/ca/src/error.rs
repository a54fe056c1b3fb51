//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("API error: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn api(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);
    for cause in err.chain().skip(1) {
        eprintln!("  {} {}", "caused by:".dimmed(), cause);
    }

    if let Some(hint) = hint(err) {
        eprintln!("\n{}", hint.yellow());
    }
}

fn hint(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Network(_) => Some(
                "Hint: Is the control plane running? Point CA_API_URL or --api-url at it.",
            ),
            CliError::Api { status: 409, .. } => {
                Some("Hint: The task has already finished or the name is taken.")
            }
            CliError::Api { status: 502, .. } => {
                Some("Hint: The control plane could not reach a cloud provider.")
            }
            _ => None,
        };
    }

    let message = err.to_string();
    if message.contains("Failed to read fleet config") {
        return Some("Hint: Run `ca init` to create a fleet config.");
    }
    None
}
