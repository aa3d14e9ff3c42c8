//! CLI tool for managing the domain database
//!
//! Usage:
//!   mulch-proxy-domains add <domain> <backend> [--create]
//!   mulch-proxy-domains remove <domain>
//!   mulch-proxy-domains list [--json]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mulch_proxy::config::DOMAINS_DB_FILE;
use mulch_proxy::database::DbError;
use mulch_proxy::{DomainDatabase, DomainRecord, Owner};
use std::path::PathBuf;

/// Manage the domains served by mulch-proxy
#[derive(Parser, Debug)]
#[command(name = "mulch-proxy-domains")]
#[command(version = "1.0.0")]
#[command(about = "Manage the domains served by mulch-proxy")]
struct Args {
    /// Data path of the proxy
    #[arg(long, env = "MULCH_PROXY_DATA_PATH", default_value = "./data")]
    data_path: PathBuf,

    /// Create the domain database if it does not exist
    #[arg(long)]
    create: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add or update a domain
    Add {
        /// Domain name (e.g., app.example.com)
        domain: String,

        /// Backend URL or host:port (e.g., 127.0.0.1:3000)
        backend: String,
    },

    /// Remove a domain
    Remove {
        /// Domain name
        domain: String,
    },

    /// List all domains
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let db_path = args.data_path.join(DOMAINS_DB_FILE);

    let db = DomainDatabase::open(&db_path, args.create)
        .with_context(|| format!("opening {}", db_path.display()))?;

    match args.command {
        Commands::Add { domain, backend } => {
            let record = match db.upsert(&domain, &backend, Owner::Local) {
                Ok(record) => record,
                Err(e @ DbError::Conflict { .. }) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            };

            println!("Saved domain:");
            print_record(&record);
            print_reload_hint(&args.data_path);
        }

        Commands::Remove { domain } => {
            if db.remove(&domain)? {
                println!("Removed {}", domain);
                print_reload_hint(&args.data_path);
            } else {
                eprintln!("No such domain: {}", domain);
                std::process::exit(1);
            }
        }

        Commands::List { json } => {
            let records = db.snapshot();

            if json {
                let json_output: Vec<serde_json::Value> = records
                    .values()
                    .map(|r| {
                        serde_json::json!({
                            "domain": r.domain,
                            "backend": r.backend.as_str(),
                            "owner": r.owner.as_str(),
                            "updatedAt": r.updated_at,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&json_output)?);
                return Ok(());
            }

            if records.is_empty() {
                println!("No domains found");
                return Ok(());
            }

            println!("{:<40} {:<35} {:<30}", "DOMAIN", "BACKEND", "OWNER");
            println!("{}", "-".repeat(105));
            for record in records.values() {
                println!(
                    "{:<40} {:<35} {:<30}",
                    record.domain,
                    record.backend.as_str(),
                    record.owner.as_str()
                );
            }
            println!("\nTotal: {} domain(s)", records.len());
        }
    }

    Ok(())
}

fn print_record(record: &DomainRecord) {
    println!("  Domain:   {}", record.domain);
    println!("  Backend:  {}", record.backend);
    println!("  Owner:    {}", record.owner);
    println!("  Updated:  {}", record.updated_at);
}

fn print_reload_hint(data_path: &std::path::Path) {
    println!(
        "Send SIGHUP to the running proxy to apply (pid in {}).",
        data_path.join("mulch-proxy-last.pid").display()
    );
}
