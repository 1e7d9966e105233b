// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Post-run helpers invoked by the dispatcher.
//!
//! ```text
//! sapporo-run-helper download-attachments <run_dir>
//! sapporo-run-helper dump-outputs <run_dir>
//! sapporo-run-helper generate-ro-crate <run_dir>
//! ```
//!
//! Each command works exclusively inside the given run directory.

mod attachments;
mod outputs;
mod ro_crate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "sapporo-run-helper",
    about = "Post-run helpers for sapporo-wes run directories",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download workflow_attachment_obj files into exe/.
    DownloadAttachments { run_dir: PathBuf },
    /// Write the outputs.json manifest from the outputs/ tree.
    DumpOutputs { run_dir: PathBuf },
    /// Write ro-crate-metadata.json for a finished run.
    GenerateRoCrate { run_dir: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sapporo_run_helper=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::DownloadAttachments { run_dir } => {
            attachments::download_attachments(&run_dir.canonicalize()?).await
        }
        Command::DumpOutputs { run_dir } => outputs::dump_outputs(&run_dir.canonicalize()?).await,
        Command::GenerateRoCrate { run_dir } => ro_crate::generate(&run_dir.canonicalize()?).await,
    }
}
