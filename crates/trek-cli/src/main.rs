use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trek_core::{DuplicatePolicy, JobCategory};
use trek_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "trek")]
#[command(about = "Talent Trek listing reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one listings export into the database.
    Ingest {
        #[arg(long)]
        file: PathBuf,
        /// Category label, e.g. "Data Analyst".
        #[arg(long)]
        category: JobCategory,
        /// Overrides TREK_DUPLICATE_POLICY.
        #[arg(long)]
        policy: Option<DuplicatePolicy>,
        #[arg(long)]
        json: bool,
    },
    /// Process the newest export of every category, then audit.
    Collect {
        #[arg(long)]
        json: bool,
    },
    /// Run the data-integrity checks.
    Audit {
        #[arg(long)]
        json: bool,
    },
    Migrate,
    /// Collect now and then hourly until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Collect { json: false }) {
        Commands::Ingest {
            file,
            category,
            policy,
            json,
        } => {
            if let Some(policy) = policy {
                config.duplicate_policy = policy;
            }
            let outcome = trek_sync::process_csv_file(&config, &file, category).await?;
            if json {
                print_json(&outcome)?;
            } else {
                let stats = outcome.stats;
                println!(
                    "ingest complete: file={} category={} processed={} inserted={} updated={} skipped={} errors={} history={}",
                    outcome.source_name,
                    outcome.category,
                    stats.processed,
                    stats.inserted,
                    stats.updated,
                    stats.skipped,
                    stats.errors,
                    if outcome.history_recorded { "recorded" } else { "failed" },
                );
            }
            Ok(exit_code(outcome.succeeded()))
        }
        Commands::Collect { json } => {
            let summary = trek_sync::run_collection_once(&config).await?;
            if json {
                print_json(&summary)?;
            } else {
                for run in &summary.categories {
                    let counts = run
                        .stats
                        .map(|s| format!("inserted={} skipped={} errors={}", s.inserted, s.skipped, s.errors))
                        .unwrap_or_else(|| "no export".to_string());
                    println!("{:<24} {}", run.category.as_str(), counts);
                }
                println!(
                    "collection complete: run_id={} succeeded={}/{} integrity={}",
                    summary.run_id,
                    summary.succeeded_categories(),
                    summary.categories.len(),
                    if summary.integrity_clean { "clean" } else { "issues" },
                );
            }
            Ok(exit_code(summary.succeeded_categories() > 0))
        }
        Commands::Audit { json } => {
            let report = trek_sync::audit_database(&config).await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "audit complete: duplicate_groups={} missing_required={} stale_active={}",
                    report.duplicate_groups.len(),
                    report.missing_required.len(),
                    report.stale_active,
                );
            }
            Ok(exit_code(report.is_clean()))
        }
        Commands::Migrate => {
            trek_sync::migrate_database(&config).await?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            info!(cron = %config.sync_cron, "starting collection scheduler");
            trek_sync::run_scheduler(config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("serializing summary")?;
    println!("{rendered}");
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ingest_parses_category_label_and_policy() {
        let cli = Cli::try_parse_from([
            "trek",
            "ingest",
            "--file",
            "data/cybersecurity_jobs_0501.csv",
            "--category",
            "Cybersecurity",
            "--policy",
            "update-on-change",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Ingest { category, policy, json, .. }) => {
                assert_eq!(category, JobCategory::Cybersecurity);
                assert_eq!(policy, Some(DuplicatePolicy::UpdateOnFingerprintChange));
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_category_is_a_usage_error() {
        let err = Cli::try_parse_from(["trek", "ingest", "--file", "x.csv", "--category", "Astronaut"]).unwrap_err();
        assert!(err.to_string().contains("Astronaut"));
    }
}
