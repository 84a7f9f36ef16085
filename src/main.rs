mod config;
mod convert;
mod github;
mod localize;
mod markdown;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use config::{Config, ConvertArgs, RepoArgs};
use convert::Converter;
use github::{GitHub, IssueReporter};
use localize::{HttpFetcher, Localizer};

#[derive(Parser)]
#[command(name = "issue_press", about = "Turn labelled issues into static-site posts")]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert every open issue carrying the publish label
    Convert {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        args: ConvertArgs,
    },
    /// Show open issues and whether they would be converted
    List {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        args: ConvertArgs,
    },
    /// Run the text stages over a local markdown file (no network, no writes)
    Preview {
        /// Markdown file to read
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let t0 = Instant::now();

    let result = match cli.command {
        Commands::Convert { repo, args } => {
            let Some(token) = repo.token.clone() else {
                bail!("A token is required: pass --token or set GITHUB_TOKEN");
            };
            let gh = GitHub::new(&repo.api_url, &repo.repo, Some(token.clone()))?;
            let config = Config::from_args(args, Some(token));

            tokio::fs::create_dir_all(&config.output)
                .await
                .with_context(|| format!("Failed to create {}", config.output.display()))?;
            info!("Output directory: {}", config.output.display());

            let issues = gh.list_open_issues().await?;
            let docs: Vec<_> = issues
                .into_iter()
                .filter(|i| i.is_eligible(&config.publish_label))
                .map(|i| i.into_document())
                .collect();
            if docs.is_empty() {
                println!("No open issues labelled {:?}.", config.publish_label);
                return Ok(());
            }
            println!("Converting {} issues...", docs.len());

            let fetcher = HttpFetcher::new(config.fetch_timeout, config.token.clone())?;
            let localizer = Localizer::new(Arc::new(fetcher), config.fetch_concurrency);
            let reporter = IssueReporter::new(gh, config.error_label.clone());
            let converter = Converter::new(config, localizer);

            let stats = converter.run_batch(docs, &reporter).await;
            println!(
                "Done: {} issues ({} converted, {} skipped, {} failed).",
                stats.total, stats.converted, stats.skipped, stats.failed
            );
            Ok(())
        }
        Commands::List { repo, args } => {
            if repo.token.is_none() {
                warn!("No token given; unauthenticated requests are heavily rate limited");
            }
            let gh = GitHub::new(&repo.api_url, &repo.repo, repo.token.clone())?;
            let config = Config::from_args(args, repo.token);
            let issues = gh.list_open_issues().await?;
            if issues.is_empty() {
                println!("No open issues.");
                return Ok(());
            }

            println!(
                "{:>5} | {:<32} | {:<8} | {:<14} | {:<14} | {:<9}",
                "#", "Title", "Publish", "Category", "Slug", "Converted"
            );
            println!("{}", "-".repeat(96));

            let mut eligible = 0usize;
            for issue in &issues {
                let publish = issue.is_eligible(&config.publish_label);
                eligible += publish as usize;
                let doc = issue.clone().into_document();
                let converted = config.output.join(doc.slug()).exists();
                println!(
                    "{:>5} | {:<32} | {:<8} | {:<14} | {:<14} | {:<9}",
                    doc.id,
                    truncate(&doc.title, 32),
                    if publish { "yes" } else { "-" },
                    truncate(&config.category_for(&doc.labels), 14),
                    doc.slug(),
                    if converted { "yes" } else { "-" },
                );
            }

            println!("\n{} open issues, {} eligible", issues.len(), eligible);
            Ok(())
        }
        Commands::Preview { file } => {
            let body = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let prepared = markdown::prepare(&body);
            println!("Cover: {}", prepared.cover_url.as_deref().unwrap_or("-"));
            println!("Tags:  {}", serde_json::to_string(&prepared.tags)?);
            println!("{}", "-".repeat(40));
            println!("{}", prepared.body);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
