//! CLI argument parsing for the revisjon-import binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "revisjon-import", about = "Shareholder-register bulk import")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the session endpoint (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Import a shareholder register file (.csv, .xlsx, .xls, .xlsm, .ods)
    Import {
        /// Register file
        file: PathBuf,
        /// Register year
        #[arg(long)]
        year: i32,
        /// Owner of the imported rows (defaults to the nil user)
        #[arg(long)]
        user: Option<Uuid>,
        /// Write rows to the global scope instead of the user's
        #[arg(long)]
        global: bool,
    },
    /// Show the server-side state of an import session
    CheckSession {
        session_id: Uuid,
    },
}
