//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

impl OutputFormat {
    /// Unknown names fall back to tables.
    pub fn parse(name: &str) -> Self {
        match name {
            "json" => Self::Json,
            _ => Self::Table,
        }
    }
}

/// Print data in the specified format.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => println!("{}", format_json(data, "[]")),
    }
}

/// Print a single item as JSON, whatever the format.
pub fn print_single<T: Serialize + ?Sized>(data: &T) {
    println!("{}", format_json(data, "{}"));
}

pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "Warning:".yellow().bold(), message);
}

pub fn display_option(opt: &Option<String>) -> String {
    opt.as_deref().unwrap_or("-").to_string()
}

fn format_json<T: Serialize + ?Sized>(data: &T, fallback: &str) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| fallback.to_string())
}
