use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Print a command report.
///
/// JSON serializes `report` whole; table and pretty render `rows` under
/// `header`.
pub fn print_report<T: Serialize>(
    report: &T,
    header: &[&str],
    rows: &[Vec<String>],
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => println!("{}", render_table(header, rows)),
        OutputFormat::Pretty => {
            for row in rows {
                println!("{}", render_pretty(header, row));
            }
        }
    }
}

fn render_table(header: &[&str], rows: &[Vec<String>]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    for row in rows {
        table.add_row(row.clone());
    }
    table
}

fn render_pretty(header: &[&str], row: &[String]) -> String {
    header
        .iter()
        .zip(row)
        .map(|(name, value)| format!("{}={value}", name.to_lowercase()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_rows_are_key_value_pairs() {
        let line = render_pretty(&["BYTES", "INTACT"], &["42".to_string(), "true".to_string()]);
        assert_eq!(line, "bytes=42 intact=true");
    }

    #[test]
    fn table_contains_every_cell() {
        let rendered = render_table(&["INDEX", "STREAM"], &[vec!["0".into(), "abc".into()]]).to_string();
        assert!(rendered.contains("INDEX"));
        assert!(rendered.contains("abc"));
    }
}
