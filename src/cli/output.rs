//! Shared output formatting utilities for CLI commands
//!
//! JSON, YAML, and table output for the command results.

use anyhow::{Context, Result};
use serde::Serialize;
use std::str::FromStr;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Yaml,
    Table,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "yaml" => Ok(OutputFormat::Yaml),
            "table" => Ok(OutputFormat::Table),
            _ => anyhow::bail!(
                "Unsupported output format: '{}'. Use 'json', 'yaml', or 'table'.",
                s
            ),
        }
    }
}

/// Render data as pretty JSON
pub fn render_json<T: Serialize>(data: &T) -> Result<String> {
    serde_json::to_string_pretty(data).context("Failed to serialize to JSON")
}

/// Render data as YAML
pub fn render_yaml<T: Serialize>(data: &T) -> Result<String> {
    serde_yaml::to_string(data).context("Failed to serialize to YAML")
}

/// Render rows as a fixed-width table; cells longer than their column are truncated
pub fn render_table(columns: &[(&str, usize)], rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    let line = |cells: Vec<String>| -> String {
        let mut line = String::new();
        for (cell, (_, width)) in cells.iter().zip(columns) {
            line.push_str(&format!("{:<width$} ", truncate(cell, *width), width = width));
        }
        line.trim_end().to_string()
    };

    out.push_str(&line(columns.iter().map(|(name, _)| name.to_string()).collect()));
    out.push('\n');
    let total_width: usize = columns.iter().map(|(_, w)| w + 1).sum();
    out.push_str(&"-".repeat(total_width.saturating_sub(1)));
    out.push('\n');
    for row in rows {
        out.push_str(&line(row.clone()));
        out.push('\n');
    }
    out
}

/// Print data as JSON or YAML; table output is rendered by each command
pub fn print_structured<T: Serialize>(data: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", render_json(data)?),
        OutputFormat::Yaml => print!("{}", render_yaml(data)?),
        OutputFormat::Table => {
            anyhow::bail!("Table format requires custom implementation per data type")
        }
    }
    Ok(())
}

/// Truncate string to maximum length with ellipsis
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
