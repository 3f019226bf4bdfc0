//! Souq CLI - Database migrations and management tools.
//!
//! # Usage
//!
//! ```bash
//! # Run database migrations (schema and session store)
//! souq-cli migrate
//!
//! # Release expired reservations and purge old sessions once
//! souq-cli sweep
//!
//! # Grant admin access to an existing account
//! souq-cli admin promote -e owner@souq.bh
//! ```
//!
//! # Commands
//!
//! - `migrate` - Run database migrations
//! - `sweep` - One reservation sweeper pass
//! - `admin promote` / `admin demote` - Manage admin accounts

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "souq-cli")]
#[command(author, version, about = "Souq CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Reconcile pending payments, release expired reservations and purge
    /// old checkout sessions
    Sweep {
        /// Sessions handled per pass
        #[arg(short, long, default_value_t = souq_storefront::services::checkout::DEFAULT_SWEEP_BATCH)]
        batch: i64,
    },
    /// Manage admin accounts
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand)]
enum AdminAction {
    /// Grant admin access to an existing account
    Promote {
        /// Account email address
        #[arg(short, long)]
        email: String,
    },
    /// Revoke admin access
    Demote {
        /// Account email address
        #[arg(short, long)]
        email: String,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Sweep { batch } => commands::sweep::run(batch).await?,
        Commands::Admin { action } => match action {
            AdminAction::Promote { email } => {
                commands::admin::set_role(&email, souq_core::UserRole::Admin).await?;
            }
            AdminAction::Demote { email } => {
                commands::admin::set_role(&email, souq_core::UserRole::Customer).await?;
            }
        },
    }
    Ok(())
}
