use std::any::Any;
use std::io::ErrorKind;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::config::Config;
use crate::localize::Localizer;
use crate::markdown::images::local_filename;
use crate::markdown::{self, Prepared};

/// Bound on the failure text handed back to callers.
pub const MAX_FAILURE_MESSAGE: usize = 4096;

const CONTENT_FILE: &str = "index.md";
const COVER_PREFIX: &str = "cover_";

/// One source issue, as handed over by the tracker client.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: u64,
    pub title: String,
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub labels: Vec<String>,
}

impl Document {
    /// `{YYYYMMDD}_{id}`.
    pub fn slug(&self) -> String {
        format!("{}_{}", self.created_at.format("%Y%m%d"), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionFailure {
    pub id: u64,
    pub message: String,
}

#[derive(Debug)]
pub enum Outcome {
    Converted(PathBuf),
    Skipped,
    Failed(ConversionFailure),
}

/// Where per-document failures go once recorded locally.
#[async_trait]
pub trait FailureReporter: Send + Sync {
    async fn report(&self, failure: &ConversionFailure) -> Result<()>;
}

/// Text stages done; what is left needs the network and the disk.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub doc: Document,
    pub slug: String,
    pub dir: PathBuf,
    pub category: String,
    pub text: Prepared,
}

/// A document whose text stages blew up before any I/O happened.
#[derive(Debug)]
struct StageFailure {
    id: u64,
    dir: PathBuf,
    message: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub total: usize,
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Converter {
    config: Arc<Config>,
    localizer: Localizer,
}

impl Converter {
    pub fn new(config: Config, localizer: Localizer) -> Self {
        Self {
            config: Arc::new(config),
            localizer,
        }
    }

    pub fn target_dir(&self, doc: &Document) -> PathBuf {
        self.config.output.join(doc.slug())
    }

    pub fn is_converted(&self, doc: &Document) -> bool {
        self.target_dir(doc).exists()
    }

    /// The pure part: cover, tags, sanitize, plus category and slug.
    pub fn prepare(&self, doc: Document) -> PreparedDocument {
        let slug = doc.slug();
        let dir = self.config.output.join(&slug);
        let category = self.config.category_for(&doc.labels);
        let text = markdown::prepare(doc.body.as_deref().unwrap_or_default());
        PreparedDocument {
            doc,
            slug,
            dir,
            category,
            text,
        }
    }

    /// `prepare` inside the document's span, with a panic turned into a failure.
    fn prepare_guarded(&self, doc: Document) -> Result<PreparedDocument, StageFailure> {
        self.prepare_guarded_with(doc, Self::prepare)
    }

    fn prepare_guarded_with<F>(&self, doc: Document, stage: F) -> Result<PreparedDocument, StageFailure>
    where
        F: FnOnce(&Self, Document) -> PreparedDocument,
    {
        let id = doc.id;
        let dir = self.target_dir(&doc);
        let span = issue_span(id);
        let result = span.in_scope(|| {
            std::panic::catch_unwind(AssertUnwindSafe(|| stage(self, doc)))
        });
        result.map_err(|payload| {
            let message = bounded_message(&panic_message(payload.as_ref()));
            span.in_scope(|| error!("Text stages of issue #{} panicked: {}", id, message));
            StageFailure { id, dir, message }
        })
    }

    /// Convert one document end to end. An existing output directory means it
    /// was converted before and nothing is done.
    pub async fn convert(&self, doc: Document) -> Outcome {
        if self.is_converted(&doc) {
            info!("Skipping issue #{} - already converted", doc.id);
            return Outcome::Skipped;
        }
        match self.prepare_guarded(doc) {
            Ok(prepared) => self.finish(prepared).await,
            Err(f) => Outcome::Failed(self.record_failure(f.id, &f.dir, f.message).await),
        }
    }

    /// Localize images, fetch the cover, write the content unit. Failures are
    /// recorded and returned, never raised.
    pub async fn finish(&self, prepared: PreparedDocument) -> Outcome {
        let id = prepared.doc.id;
        let dir = prepared.dir.clone();
        let span = issue_span(id);

        let result = AssertUnwindSafe(self.write_unit(&prepared).instrument(span.clone()))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(Some(path))) => {
                span.in_scope(|| info!("Converted issue #{} -> {}", id, path.display()));
                Outcome::Converted(path)
            }
            Ok(Ok(None)) => Outcome::Skipped,
            Ok(Err(e)) => {
                let message = bounded_message(&format!("{e:#}"));
                span.in_scope(|| error!("Conversion of issue #{} failed: {}", id, message));
                Outcome::Failed(self.record_failure(id, &dir, message).await)
            }
            Err(payload) => {
                let message = bounded_message(&panic_message(payload.as_ref()));
                span.in_scope(|| error!("Conversion of issue #{} panicked: {}", id, message));
                Outcome::Failed(self.record_failure(id, &dir, message).await)
            }
        }
    }

    /// `Ok(None)` when the directory appeared since the skip check.
    async fn write_unit(&self, p: &PreparedDocument) -> Result<Option<PathBuf>> {
        tokio::fs::create_dir_all(&self.config.output)
            .await
            .with_context(|| format!("Failed to create {}", self.config.output.display()))?;
        match tokio::fs::create_dir(&p.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create {}", p.dir.display()))
            }
        }

        let body = self
            .localizer
            .localize_images(&p.text.body, p.doc.id, &p.dir)
            .await;

        let cover = match &p.text.cover_url {
            Some(url) => {
                let filename = local_filename(COVER_PREFIX, url);
                match self.localizer.download(url, &p.dir, &filename).await {
                    Ok(name) => {
                        info!("Cover image downloaded: {}", url);
                        Some(name)
                    }
                    Err(e) => {
                        warn!("Cover image {} not downloaded: {}", url, e);
                        None
                    }
                }
            }
            None => None,
        };

        let content = format!(
            "{}{}",
            front_matter(p, cover.as_deref())?,
            body
        );
        let path = p.dir.join(CONTENT_FILE);
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(Some(path))
    }

    /// Leave `ERROR_{id}.tmp` in the output root and drop the half-made
    /// document directory so the next run tries again.
    async fn record_failure(&self, id: u64, dir: &Path, message: String) -> ConversionFailure {
        if dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                warn!("Could not remove {}: {}", dir.display(), e);
            }
        }
        let artifact = self.config.output.join(format!("ERROR_{id}.tmp"));
        if let Err(e) = tokio::fs::write(&artifact, format!("conversion error: {message}")).await {
            warn!("Could not write {}: {}", artifact.display(), e);
        }
        ConversionFailure { id, message }
    }

    /// Convert many documents. Text stages run in parallel on the rayon pool,
    /// the rest as bounded tokio tasks; each failure is handed to `reporter`
    /// as soon as it comes back.
    pub async fn run_batch(&self, docs: Vec<Document>, reporter: &dyn FailureReporter) -> BatchStats {
        let mut stats = BatchStats {
            total: docs.len(),
            ..BatchStats::default()
        };

        let (done, pending): (Vec<_>, Vec<_>) = docs.into_iter().partition(|d| self.is_converted(d));
        for doc in &done {
            info!("Skipping issue #{} - already converted", doc.id);
        }
        stats.skipped += done.len();
        if pending.is_empty() {
            return stats;
        }

        let pb = ProgressBar::new(pending.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
        {
            pb.set_style(style.progress_chars("=> "));
        }

        // rayon blocks its caller; keep it off the runtime's worker threads
        let n_pending = pending.len();
        let this = self.clone();
        let staged = tokio::task::spawn_blocking(move || {
            pending
                .into_par_iter()
                .map(|doc| this.prepare_guarded(doc))
                .collect::<Vec<_>>()
        })
        .await;
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                error!("Text stages aborted: {}", e);
                stats.failed += n_pending;
                pb.finish_and_clear();
                return stats;
            }
        };

        let mut prepared = Vec::with_capacity(staged.len());
        for item in staged {
            match item {
                Ok(p) => prepared.push(p),
                Err(f) => {
                    let failure = self.record_failure(f.id, &f.dir, f.message).await;
                    stats.failed += 1;
                    if let Err(e) = reporter.report(&failure).await {
                        error!("Could not report failure of issue #{}: {:#}", failure.id, e);
                    }
                    pb.inc(1);
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.jobs.max(1)));
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Outcome>(self.config.jobs.max(1) * 2);

        for p in prepared {
            let this = self.clone();
            let sem = Arc::clone(&semaphore);
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return;
                };
                let outcome = this.finish(p).await;
                let _ = tx.send(outcome).await;
            });
        }

        // rx closes once every task has sent its outcome
        drop(tx);

        while let Some(outcome) = rx.recv().await {
            match outcome {
                Outcome::Converted(_) => stats.converted += 1,
                Outcome::Skipped => stats.skipped += 1,
                Outcome::Failed(failure) => {
                    stats.failed += 1;
                    if let Err(e) = reporter.report(&failure).await {
                        error!("Could not report failure of issue #{}: {:#}", failure.id, e);
                    }
                }
            }
            pb.inc(1);
        }

        pb.finish_and_clear();
        info!(
            "Batch done: {} converted, {} skipped, {} failed",
            stats.converted, stats.skipped, stats.failed
        );
        stats
    }
}

/// Metadata header. Strings go through JSON encoding, which YAML reads as
/// double-quoted scalars.
fn front_matter(p: &PreparedDocument, cover: Option<&str>) -> Result<String> {
    let mut lines = vec![
        "---".to_string(),
        format!("title: {}", serde_json::to_string(&p.doc.title)?),
        format!("date: \"{}\"", p.doc.created_at.format("%Y-%m-%d")),
        format!("slug: \"{}\"", p.slug),
        format!("categories: [{}]", serde_json::to_string(&p.category)?),
        format!("tags: {}", serde_json::to_string(&p.text.tags)?),
    ];
    if let Some(cover) = cover {
        lines.push(format!("image: {}", serde_json::to_string(cover)?));
    }
    lines.push("---\n".to_string());
    Ok(lines.join("\n"))
}

fn issue_span(id: u64) -> Span {
    info_span!("issue", number = id)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str));
    match detail {
        Some(detail) => format!("conversion panicked: {detail}"),
        None => "conversion panicked".to_string(),
    }
}

fn bounded_message(message: &str) -> String {
    if message.chars().count() <= MAX_FAILURE_MESSAGE {
        return message.to_string();
    }
    let head: String = message.chars().take(MAX_FAILURE_MESSAGE - 3).collect();
    format!("{head}...")
}
