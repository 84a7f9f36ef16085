use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::{Captures, Regex};
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::markdown::code::CodeMap;
use crate::markdown::images::{
    accepted_extension, extension_for_content_type, html_alt, local_filename,
    HTML_IMAGE_RE, MD_IMAGE_ANY_CASE_RE,
};

const USER_AGENT: &str = concat!("issue_press/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(reqwest::Error),

    #[error("request timed out: {0}")]
    Timeout(reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch budget closed")]
    BudgetClosed(#[from] tokio::sync::AcquireError),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(e)
        } else {
            FetchError::Request(e)
        }
    }
}

/// A fetched resource: body plus lower-cased content type ("" if absent).
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError>;
}

/// Single-attempt HTTP fetcher. Non-2xx is an error; nothing is retried.
pub struct HttpFetcher {
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, token: Option<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, token })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let bytes = resp.bytes().await?.to_vec();
        Ok(Fetched {
            bytes,
            content_type,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum ImageSyntax {
    Markdown,
    Html,
}

impl ImageSyntax {
    fn regex(self) -> &'static Regex {
        match self {
            ImageSyntax::Markdown => &MD_IMAGE_ANY_CASE_RE,
            ImageSyntax::Html => &HTML_IMAGE_RE,
        }
    }

    /// (alt, url) of one match.
    fn parts(self, caps: &Captures) -> (String, String) {
        match self {
            ImageSyntax::Markdown => (caps[1].to_string(), caps[2].to_string()),
            ImageSyntax::Html => (html_alt(&caps[0]), caps[1].to_string()),
        }
    }
}

struct ImageRef {
    span: Range<usize>,
    alt: String,
    url: String,
}

/// Downloads remote images into a document directory and points the body at
/// the local copies. Fetches from every document share one budget.
#[derive(Clone)]
pub struct Localizer {
    fetcher: Arc<dyn Fetcher>,
    budget: Arc<Semaphore>,
}

impl Localizer {
    pub fn new(fetcher: Arc<dyn Fetcher>, max_concurrent_fetches: usize) -> Self {
        Self {
            fetcher,
            budget: Arc::new(Semaphore::new(max_concurrent_fetches.max(1))),
        }
    }

    /// Fetch `url` into `dir` as `filename`, returning the name actually written.
    ///
    /// A name without an accepted image extension gets one from the response
    /// content type.
    pub async fn download(&self, url: &str, dir: &Path, filename: &str) -> Result<String, FetchError> {
        let fetched = {
            let _permit = self.budget.acquire().await?;
            self.fetcher.fetch(url).await?
        };

        let name = match accepted_extension(filename) {
            Some(_) => filename.to_string(),
            None => format!(
                "{}.{}",
                filename,
                extension_for_content_type(&fetched.content_type)
            ),
        };
        tokio::fs::write(dir.join(&name), &fetched.bytes).await?;
        info!(url, file = %name, "downloaded image");
        Ok(name)
    }

    /// Rewrite remote images outside code to local files named
    /// `{document_id}_{basename}`: markdown syntax first, then `<img>` tags.
    /// An image that cannot be fetched keeps its original reference.
    pub async fn localize_images(&self, body: &str, document_id: u64, dir: &Path) -> String {
        let prefix = format!("{document_id}_");
        let body = self
            .rewrite_pass(body, ImageSyntax::Markdown, &prefix, dir)
            .await;
        self.rewrite_pass(&body, ImageSyntax::Html, &prefix, dir)
            .await
    }

    /// One left-to-right pass. Code regions are judged against `body` as it was
    /// when the pass started.
    async fn rewrite_pass(&self, body: &str, syntax: ImageSyntax, prefix: &str, dir: &Path) -> String {
        let code = CodeMap::new(body);
        let refs: Vec<ImageRef> = syntax
            .regex()
            .captures_iter(body)
            .filter_map(|caps| {
                let m = caps.get(0)?;
                if code.contains(m.start()) {
                    debug!(syntax = ?syntax, "image inside code left alone");
                    return None;
                }
                let (alt, url) = syntax.parts(&caps);
                Some(ImageRef {
                    span: m.range(),
                    alt,
                    url,
                })
            })
            .collect();

        if refs.is_empty() {
            return body.to_string();
        }

        let mut seen = HashSet::new();
        let unique: Vec<&str> = refs
            .iter()
            .map(|r| r.url.as_str())
            .filter(|url| seen.insert(*url))
            .collect();

        let results = futures::future::join_all(unique.iter().map(|&url| async move {
            let filename = local_filename(prefix, url);
            let result = self.download(url, dir, &filename).await;
            (url, result)
        }))
        .await;

        let mut local: HashMap<&str, String> = HashMap::new();
        for (url, result) in results {
            match result {
                Ok(name) => {
                    local.insert(url, name);
                }
                Err(e) => warn!(url, error = %e, "image not localized, keeping remote reference"),
            }
        }

        let mut out = String::with_capacity(body.len());
        let mut cursor = 0;
        for r in &refs {
            out.push_str(&body[cursor..r.span.start]);
            match local.get(r.url.as_str()) {
                Some(name) => out.push_str(&format!("![{}]({})", r.alt, name)),
                None => out.push_str(&body[r.span.clone()]),
            }
            cursor = r.span.end;
        }
        out.push_str(&body[cursor..]);
        out
    }
}
