use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use newsletter_digest::{
    load_raw_emails, save_digest_files, Config, DigestRenderer, DigestStore, Pipeline,
    PipelineError, SqliteDigestStore, TimeWindow,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "run-digest")]
#[command(about = "Summarize and cluster a batch of newsletters into a single digest")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a digest from a JSON file of received emails
    Run {
        /// JSON array of email records
        #[arg(short, long)]
        input: PathBuf,

        /// User the digest is for
        #[arg(short, long)]
        user: String,

        /// Number of hours to look back, ending now
        #[arg(long, default_value = "24")]
        hours: i64,

        /// Write the digest to files without recording it as delivered
        #[arg(long)]
        dry_run: bool,

        /// Where digest files are written (defaults to the local data directory)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// List recently delivered digests
    History {
        #[arg(short, long)]
        user: String,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the progress lines
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,newsletter_digest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::debug!(db = %config.db_path.display(), model = %config.model, "Configuration loaded");

    let store = SqliteDigestStore::open(&config.db_path)
        .with_context(|| format!("Failed to open digest store at {}", config.db_path.display()))?;

    match args.command {
        Command::Run {
            input,
            user,
            hours,
            dry_run,
            output_dir,
        } => run(&config, Arc::new(store), input, user, hours, dry_run, output_dir).await,
        Command::History { user, limit } => history(&store, &user, limit),
    }
}

async fn run(
    config: &Config,
    store: Arc<SqliteDigestStore>,
    input: PathBuf,
    user: String,
    hours: i64,
    dry_run: bool,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    if hours <= 0 {
        anyhow::bail!("--hours must be positive, got {}", hours);
    }

    let window = TimeWindow::last_hours(Utc::now(), hours);

    println!("\n📬 Loading newsletters from {}...", input.display());
    let records = load_raw_emails(&input)?;
    println!("✓ Found {} email records", records.len());

    let model = config.model_client()?;

    println!("\n🤖 Summarizing and clustering with Claude AI...");
    println!("  (This may take a minute...)");
    let pipeline = Pipeline::new(config.pipeline.clone(), Arc::new(model), store.clone());

    let outcome = match pipeline.run_loaded(&user, window, records).await {
        Ok(outcome) => outcome,
        Err(PipelineError::NoInput { rejected }) => {
            println!("\n⚠ No usable newsletters in the input.");
            for reason in &rejected {
                println!("  ✗ {}", reason);
            }
            anyhow::bail!("No usable newsletters in {}", input.display());
        }
        Err(e) => return Err(e).context("Digest run failed"),
    };

    let digest = &outcome.digest;
    let report = &outcome.report;

    println!(
        "✓ Summarized {}/{} newsletters",
        report.items - report.failures.len(),
        report.items
    );
    if report.duplicates > 0 {
        println!("  ({} duplicate emails skipped)", report.duplicates);
    }
    if !report.rejected.is_empty() {
        println!("\n⚠ Skipped {} malformed records:", report.rejected.len());
        for reason in &report.rejected {
            println!("  ✗ {}", reason);
        }
    }
    if !report.failures.is_empty() {
        println!("\n⚠ Failed to summarize {} newsletters:", report.failures.len());
        for failure in &report.failures {
            println!("  ✗ item {}: {}", failure.item_id, failure.reason);
        }
    }
    if !report.excluded_hashes.is_empty() {
        println!(
            "  ({} newsletters already sent in an earlier digest)",
            report.excluded_hashes.len()
        );
    }

    println!(
        "✓ Organized into {} themes and {} entries",
        digest.theme_count(),
        digest.entries.len()
    );

    let dir = match output_dir {
        Some(dir) => dir,
        None => newsletter_digest::get_default_digests_dir()?,
    };
    let (json_path, text_path) = save_digest_files(digest, &dir)?;

    if dry_run {
        println!("\n🔍 Dry run, digest not recorded as delivered.");
        println!("\n{}", DigestRenderer::subject(digest));
        println!("{}", DigestRenderer::plain_text(digest));
    } else {
        let id = store.save_digest(digest).context("Failed to record digest")?;
        println!("\n💾 Recorded digest #{} for {}", id, user);
    }

    println!("\n✅ Digest saved to: {}", text_path.display());
    println!("   JSON: {}", json_path.display());

    Ok(())
}

fn history(store: &dyn DigestStore, user: &str, limit: usize) -> Result<()> {
    let digests = store
        .recent_digests(user, limit)
        .context("Failed to read digest history")?;

    if digests.is_empty() {
        println!("No digests recorded for {}.", user);
        return Ok(());
    }

    println!("Recent digests for {}:\n", user);
    for stored in digests {
        println!(
            "  #{:<4} {} .. {}  {} newsletters, {} themes",
            stored.id,
            stored.window_start.format("%Y-%m-%d %H:%M"),
            stored.window_end.format("%Y-%m-%d %H:%M"),
            stored.item_count,
            stored.theme_count
        );
    }

    Ok(())
}
