// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use swarmseed::catalog::listing::RemoteFile;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Also log to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon.
    Serve,
    /// Run the daemon and start seeding a local file.
    Seed {
        path: PathBuf,
        #[arg(long)]
        topic: Option<String>,
    },
    /// Run the daemon and fetch a file from the given seeders.
    Fetch {
        #[arg(long)]
        hash: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        size: u64,
        #[arg(long = "seeder", required = true)]
        seeders: Vec<String>,
        #[arg(long)]
        topic: Option<String>,
    },
    /// Print the last status snapshot written by the daemon.
    Status,
}

impl Commands {
    /// The remote listing entry described by a `fetch` invocation.
    pub fn remote_file(&self, default_topic: &str) -> Option<RemoteFile> {
        match self {
            Commands::Fetch {
                hash,
                name,
                size,
                seeders,
                topic,
            } => Some(RemoteFile {
                file_hash: hash.clone(),
                file_name: name.clone(),
                file_size: *size,
                topic: topic.clone().unwrap_or_else(|| default_topic.to_string()),
                seeders: seeders.iter().cloned().collect(),
            }),
            _ => None,
        }
    }
}
