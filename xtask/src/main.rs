//! Build automation tasks for ODI Ingest
//!
//! Currently generates the CLI reference from the clap definitions.

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for ODI Ingest", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in Markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    // Generate markdown from clap definitions
    let markdown = clap_markdown::help_markdown::<odi_ingest::Cli>();

    let content = format!(
        r#"# odi-ingest CLI Reference

This documentation is generated from the CLI source code. Last updated: {}.

## Overview

`odi-ingest` turns NHTSA ODI complaint release archives into validated, typed
tables. One run parses the field dictionary, extracts the release archives,
ingests and validates every tabular member, writes per-source and combined
outputs, and records a run manifest.

## Quick Start

```bash
# Place release archives in data/raw and the dictionary in docs/CMPL.txt
odi-ingest

# Write CSV instead of Parquet and skip the combined table
odi-ingest --output-format text --no-combine

# Ingest two input directories in order
odi-ingest --input-dir releases/2020 --input-dir releases/2025
```

## Exit Status

| Code | Meaning |
|------|---------|
| 0 | Succeeded with no data-quality violations |
| 2 | Completed with data-quality violations |
| 1 | Fatal or partial failure |
| 130 | Interrupted |

## Commands

{}

## Environment Variables

Flags override these; each falls back to the default shown in the command help.

- `ODI_DATASET`, `ODI_DATA_DIR`, `ODI_SCHEMA_DOC`
- `ODI_OUTPUT_FORMAT` (`columnar`/`parquet` or `text`/`csv`)
- `ODI_OVERWRITE_EXTRACTED`, `ODI_COMBINE_PROCESSED`, `ODI_BLANK_AS_NULL`
- `ODI_HEADER_ROW` (`absent` or `skip`), `ODI_DELIMITER`, `ODI_WORKERS`
- `ODI_LOG_LEVEL`, `ODI_LOG_OUTPUT`, `ODI_LOG_FORMAT`, `ODI_LOG_DIR`, `ODI_LOG_FILE_PREFIX`, `ODI_LOG_FILTER`

---

*This documentation is automatically generated from the CLI source code. To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());
    Ok(())
}
