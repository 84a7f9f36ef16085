use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

pub const DEFAULT_CATEGORIES: &[&str] = &["life", "tech", "study", "thoughts", "projects"];
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Repository access, shared by every command that talks to the tracker.
#[derive(Args, Debug, Clone)]
pub struct RepoArgs {
    /// Repository as owner/name
    #[arg(long, env = "GITHUB_REPOSITORY")]
    pub repo: String,

    /// API token (sent as a bearer credential, also to image hosts)
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// API base URL
    #[arg(long, env = "GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,
}

#[derive(Args, Debug, Clone)]
pub struct ConvertArgs {
    /// Output root; one directory per converted issue
    #[arg(short, long, default_value = "content/posts")]
    pub output: PathBuf,

    /// Recognised category label, in priority order (repeatable)
    #[arg(long = "category", default_values = DEFAULT_CATEGORIES.iter().copied())]
    pub categories: Vec<String>,

    /// Category when no label matches
    #[arg(long, default_value = "uncategorized")]
    pub default_category: String,

    /// Label that marks an issue for publishing
    #[arg(long, default_value = "publish")]
    pub publish_label: String,

    /// Label applied to issues that failed to convert
    #[arg(long, default_value = "conversion-error")]
    pub error_label: String,

    /// Issues converted concurrently
    #[arg(short = 'j', long, default_value = "4")]
    pub jobs: usize,

    /// Image downloads in flight across all issues
    #[arg(long, default_value = "8")]
    pub fetch_concurrency: usize,

    /// Per-download timeout in seconds
    #[arg(long, default_value = "30")]
    pub fetch_timeout: u64,
}

/// Everything the conversion core needs; built once per run.
#[derive(Debug, Clone)]
pub struct Config {
    pub output: PathBuf,
    pub categories: Vec<String>,
    pub default_category: String,
    pub publish_label: String,
    pub error_label: String,
    pub token: Option<String>,
    pub jobs: usize,
    pub fetch_concurrency: usize,
    pub fetch_timeout: Duration,
}

impl Config {
    pub fn from_args(args: ConvertArgs, token: Option<String>) -> Self {
        Self {
            output: args.output,
            categories: args.categories,
            default_category: args.default_category,
            publish_label: args.publish_label,
            error_label: args.error_label,
            token,
            jobs: args.jobs.max(1),
            fetch_concurrency: args.fetch_concurrency.max(1),
            fetch_timeout: Duration::from_secs(args.fetch_timeout),
        }
    }

    /// First label, in label order, that names a known category.
    pub fn category_for(&self, labels: &[String]) -> String {
        labels
            .iter()
            .find(|l| self.categories.contains(l))
            .cloned()
            .unwrap_or_else(|| self.default_category.clone())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: PathBuf::from("content/posts"),
            categories: DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect(),
            default_category: "uncategorized".to_string(),
            publish_label: "publish".to_string(),
            error_label: "conversion-error".to_string(),
            token: None,
            jobs: 4,
            fetch_concurrency: 8,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}
