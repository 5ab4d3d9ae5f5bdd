use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use memsync_match::{MatchOutcome, SuggestedDecision};
use memsync_remote::HttpTransport;
use memsync_roster::JsonFileRoster;
use memsync_sync::{
    load_decisions, report_markdown, write_report, Decision, MatchReview, OrphanDisposition,
    Reconciler, SyncConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "memsync")]
#[command(about = "Synchronise a local member roster into the remote member directory")]
struct Cli {
    /// Roster export to read instead of MEMSYNC_ROSTER_PATH.
    #[arg(long, global = true)]
    roster: Option<PathBuf>,
    /// Build every patch but send no writes.
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, match, review and apply.
    Sync {
        /// YAML list of `{local_id, confirmed}` answers for ambiguous candidates.
        #[arg(long)]
        decisions: Option<PathBuf>,
        /// What to do with remote entries no local member matched.
        #[arg(long)]
        orphans: Option<OrphanDisposition>,
        /// Accept every suggestion without prompting.
        #[arg(long)]
        yes: bool,
    },
    /// Fetch and match only; prints what a sync would do.
    Plan,
    /// Summarise the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(roster) = cli.roster {
        config.roster_path = roster;
    }
    config.dry_run |= cli.dry_run;

    match cli.command.unwrap_or(Commands::Plan) {
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs, &config.reports_dir)?);
        }
        Commands::Plan => {
            let transport = HttpTransport::new(config.http_client_config())?;
            let roster = JsonFileRoster::new(&config.roster_path);
            let reconciler = Reconciler::new(config.clone(), &transport, &roster)?;
            let review = reconciler.plan().await?;
            print_plan(&review);
        }
        Commands::Sync {
            decisions,
            orphans,
            yes,
        } => {
            let transport = HttpTransport::new(config.http_client_config())?;
            let roster = JsonFileRoster::new(&config.roster_path);
            let reconciler = Reconciler::new(config.clone(), &transport, &roster)?;
            let review = reconciler.plan().await?;
            print_plan(&review);

            let answers = match (decisions, yes) {
                (Some(path), _) => load_decisions(path)?,
                (None, true) => review.suggested_decisions(),
                (None, false) => match ask_decisions(&review)? {
                    Some(answers) => answers,
                    None => return Err(review.cancel().into()),
                },
            };

            let orphan_review = review.resolve(&answers);
            let disposition = match (orphans, yes) {
                (Some(disposition), _) => disposition,
                (None, true) => OrphanDisposition::Ignore,
                (None, false) => {
                    let names: Vec<String> =
                        orphan_review.orphans().iter().map(|o| o.full_name()).collect();
                    if names.is_empty() {
                        OrphanDisposition::Ignore
                    } else {
                        match ask_disposition(&names)? {
                            Some(disposition) => disposition,
                            None => return Err(orphan_review.cancel().into()),
                        }
                    }
                }
            };

            let report = orphan_review
                .resolve(disposition)
                .execute(|label, fraction| eprintln!("[{:>3.0}%] {label}", fraction * 100.0))
                .await;
            let run_dir = write_report(&report, &config.reports_dir).await?;
            let counts = report.counts();
            info!(run_dir = %run_dir.display(), "report written");
            println!(
                "sync complete: run_id={} synced={} created={} deleted={} errors={} report={}",
                report.run_id,
                counts.synced,
                counts.created,
                counts.deleted,
                counts.errors,
                run_dir.display()
            );
        }
    }

    Ok(())
}

fn print_plan(review: &MatchReview<'_>) {
    let outcomes = review.outcomes();
    let matched = outcomes
        .iter()
        .filter(|o| matches!(o, MatchOutcome::Matched { .. }))
        .count();
    let new = outcomes
        .iter()
        .filter(|o| matches!(o, MatchOutcome::NewMember { .. }))
        .count();
    let candidates = review.candidates();
    println!(
        "group {} ({}): {} local members, {} remote entries",
        review.group().name,
        review.group().number,
        review.members().len(),
        review.remote_entries().len()
    );
    println!(
        "matched={matched} new={new} to review={}",
        candidates.len()
    );
    for candidate in candidates {
        println!(
            "  {} ({}) ~ {} ({}) [{:?}, suggested {:?}]",
            candidate.member.full_name(),
            candidate
                .member
                .birth_date
                .map(|d| d.to_string())
                .unwrap_or_default(),
            candidate.remote.full_name(),
            candidate
                .remote
                .birth_date
                .map(|d| d.to_string())
                .unwrap_or_default(),
            candidate.tier,
            candidate.suggested,
        );
    }
}

fn prompt(question: &str) -> Result<String> {
    print!("{question} ");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        bail!("stdin closed while waiting for an answer");
    }
    Ok(line.trim().to_ascii_lowercase())
}

/// `None` when the operator cancels.
fn ask_decisions(review: &MatchReview<'_>) -> Result<Option<Vec<Decision>>> {
    let mut answers = Vec::new();
    for candidate in review.candidates() {
        let default_yes = candidate.suggested == SuggestedDecision::Confirm;
        let hint = if default_yes { "[Y/n/c]" } else { "[y/N/c]" };
        let question = format!(
            "Is {} the same person as remote {}? {hint}",
            candidate.member.full_name(),
            candidate.remote.full_name()
        );
        let confirmed = loop {
            match prompt(&question)?.as_str() {
                "" => break default_yes,
                "y" | "yes" => break true,
                "n" | "no" => break false,
                "c" | "cancel" => return Ok(None),
                _ => continue,
            }
        };
        answers.push(Decision {
            local_id: candidate.member.id,
            confirmed,
        });
    }
    Ok(Some(answers))
}

fn ask_disposition(names: &[String]) -> Result<Option<OrphanDisposition>> {
    println!("{} remote entries have no local counterpart:", names.len());
    for name in names {
        println!("  {name}");
    }
    loop {
        let answer = prompt("Remove them from their sections, import them, or ignore? [delete/import/ignore/cancel]")?;
        if answer == "cancel" || answer == "c" {
            return Ok(None);
        }
        match answer.parse() {
            Ok(disposition) => return Ok(Some(disposition)),
            Err(message) => eprintln!("{message}"),
        }
    }
}
