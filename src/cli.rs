use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Migrate CSV rows into persisted object graphs",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Migrate every row of a CSV file through the configured mapping
    Migrate(MigrateArgs),
    /// Validate a mapping and print the compiled column-to-path plan
    Plan(PlanArgs),
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Input CSV file ('-' reads stdin)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Migration configuration (YAML)
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,
    /// Domain model describing classes and attributes (YAML)
    #[arg(short = 'M', long = "model")]
    pub model: PathBuf,
    /// Destination for persisted objects as JSON lines (defaults to stdout)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// File receiving rejected rows followed by the rejection reason
    #[arg(long = "rejects")]
    pub rejects: Option<PathBuf>,
    /// Build and validate every row without persisting anything
    #[arg(long = "dry-run")]
    pub dry_run: bool,
    /// Rewrite configured key attributes so repeated runs never collide
    #[arg(long)]
    pub unique: bool,
    /// Stop after this many rows
    #[arg(long)]
    pub limit: Option<usize>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Migration configuration (YAML)
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,
    /// Domain model describing classes and attributes (YAML)
    #[arg(short = 'M', long = "model")]
    pub model: PathBuf,
    /// CSV file whose header row the columns are checked against
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}
