use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::convert::{ConversionFailure, Document, FailureReporter};

const PER_PAGE: usize = 100;
const USER_AGENT: &str = concat!("issue_press/", env!("CARGO_PKG_VERSION"));
const ERROR_LABEL_COLOR: &str = "ff0000";

// Unreserved URL characters stay as they are in a label path segment.
const LABEL_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Largest comment body the API accepts.
pub const MAX_COMMENT_LEN: usize = 65536;
const TRUNCATED_COMMENT_LEN: usize = 65000;

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

impl Issue {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }

    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }

    /// Open, and carries the publish label.
    pub fn is_eligible(&self, publish_label: &str) -> bool {
        self.state == "open" && self.labels.iter().any(|l| l.name == publish_label)
    }

    pub fn into_document(self) -> Document {
        let labels = self.label_names();
        Document {
            id: self.number,
            title: self.title,
            body: self.body,
            created_at: self.created_at,
            labels,
        }
    }
}

pub struct GitHub {
    client: reqwest::Client,
    api: String,
    repo: String,
    token: Option<String>,
}

impl GitHub {
    pub fn new(api_url: &str, repo: &str, token: Option<String>) -> Result<Self> {
        if repo.split('/').filter(|p| !p.is_empty()).count() != 2 {
            bail!("repository must be owner/name, got {repo:?}");
        }
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api: api_url.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}{}", self.api, self.repo, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// All open issues, pull requests excluded.
    pub async fn list_open_issues(&self) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();
        for page in 1.. {
            let batch: Vec<Issue> = self
                .authed(self.client.get(self.url("/issues")))
                .query(&[
                    ("state", "open".to_string()),
                    ("per_page", PER_PAGE.to_string()),
                    ("page", page.to_string()),
                ])
                .send()
                .await?
                .error_for_status()
                .with_context(|| format!("Failed to list issues of {}", self.repo))?
                .json()
                .await
                .context("Failed to decode issue list")?;

            let n = batch.len();
            issues.extend(batch.into_iter().filter(|i| !i.is_pull_request()));
            if n < PER_PAGE {
                break;
            }
        }
        info!("Fetched {} open issues from {}", issues.len(), self.repo);
        Ok(issues)
    }

    pub async fn create_comment(&self, number: u64, body: &str) -> Result<()> {
        self.authed(self.client.post(self.url(&format!("/issues/{number}/comments"))))
            .json(&json!({ "body": body }))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("Failed to comment on #{number}"))?;
        Ok(())
    }

    /// Make sure the label exists, creating it if the repository lacks it.
    pub async fn ensure_label(&self, name: &str, color: &str) -> Result<()> {
        let encoded = utf8_percent_encode(name, LABEL_SEGMENT).to_string();
        let resp = self
            .authed(self.client.get(self.url(&format!("/labels/{encoded}"))))
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                self.authed(self.client.post(self.url("/labels")))
                    .json(&json!({ "name": name, "color": color }))
                    .send()
                    .await?
                    .error_for_status()
                    .with_context(|| format!("Failed to create label {name:?}"))?;
                info!("Created label {:?}", name);
                Ok(())
            }
            s => bail!("Failed to look up label {name:?}: {s}"),
        }
    }

    pub async fn add_label(&self, number: u64, name: &str) -> Result<()> {
        self.authed(self.client.post(self.url(&format!("/issues/{number}/labels"))))
            .json(&json!({ "labels": [name] }))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("Failed to label #{number}"))?;
        Ok(())
    }
}

/// Comment text for a failed conversion, cut to fit the API limit.
pub fn failure_comment(message: &str) -> String {
    let comment = format!("⚠️ Conversion failed, please check the issue format:\n\n```\n{message}\n```");
    if comment.chars().count() <= MAX_COMMENT_LEN {
        return comment;
    }
    let head: String = comment.chars().take(TRUNCATED_COMMENT_LEN).collect();
    format!("{head}\n```\n...(truncated)")
}

/// Reports failures back on the issue: a comment, then the error label.
pub struct IssueReporter {
    github: GitHub,
    label: String,
}

impl IssueReporter {
    pub fn new(github: GitHub, label: impl Into<String>) -> Self {
        Self {
            github,
            label: label.into(),
        }
    }
}

#[async_trait]
impl FailureReporter for IssueReporter {
    async fn report(&self, failure: &ConversionFailure) -> Result<()> {
        self.github
            .create_comment(failure.id, &failure_comment(&failure.message))
            .await?;
        if let Err(e) = self.github.ensure_label(&self.label, ERROR_LABEL_COLOR).await {
            warn!("Could not ensure label {:?}: {:#}", self.label, e);
        }
        self.github.add_label(failure.id, &self.label).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn issue_json(number: u64, labels: &[&str], pr: bool) -> serde_json::Value {
        let mut v = json!({
            "number": number,
            "title": format!("Issue {number}"),
            "body": "hello",
            "state": "open",
            "created_at": "2024-03-05T10:20:30Z",
            "labels": labels.iter().map(|l| json!({ "name": l })).collect::<Vec<_>>(),
        });
        if pr {
            v["pull_request"] = json!({ "url": "x" });
        }
        v
    }

    #[tokio::test]
    async fn lists_issues_across_pages_without_prs() {
        let server = MockServer::start().await;
        let first: Vec<_> = (1..=PER_PAGE as u64)
            .map(|n| issue_json(n, &["publish"], n == 2))
            .collect();
        Mock::given(method("GET"))
            .and(path("/repos/o/r/issues"))
            .and(query_param("page", "1"))
            .and(query_param("state", "open"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(first))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/issues"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![issue_json(500, &[], false)]))
            .mount(&server)
            .await;

        let gh = GitHub::new(&server.uri(), "o/r", Some("tok".into())).unwrap();
        let issues = gh.list_open_issues().await.unwrap();

        assert_eq!(issues.len(), PER_PAGE);
        assert!(issues.iter().all(|i| i.number != 2));
        assert_eq!(issues.last().unwrap().number, 500);
    }

    #[tokio::test]
    async fn list_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let gh = GitHub::new(&server.uri(), "o/r", None).unwrap();
        assert!(gh.list_open_issues().await.is_err());
    }

    #[tokio::test]
    async fn reporter_comments_then_labels() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r/issues/9/comments"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/labels/conversion-error"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r/labels"))
            .and(body_json(json!({ "name": "conversion-error", "color": "ff0000" })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r/issues/9/labels"))
            .and(body_json(json!({ "labels": ["conversion-error"] })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let gh = GitHub::new(&server.uri(), "o/r", Some("t".into())).unwrap();
        let reporter = IssueReporter::new(gh, "conversion-error");
        reporter
            .report(&ConversionFailure {
                id: 9,
                message: "boom".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn existing_label_is_not_recreated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/labels/%E9%94%99%E8%AF%AF"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r/labels"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let gh = GitHub::new(&server.uri(), "o/r", None).unwrap();
        gh.ensure_label("错误", "ff0000").await.unwrap();
    }

    #[test]
    fn eligibility() {
        let issue: Issue = serde_json::from_value(issue_json(1, &["publish", "tech"], false)).unwrap();
        assert!(issue.is_eligible("publish"));
        assert!(!issue.is_eligible("draft"));

        let mut closed = issue.clone();
        closed.state = "closed".into();
        assert!(!closed.is_eligible("publish"));
    }

    #[test]
    fn issue_to_document() {
        let issue: Issue = serde_json::from_value(issue_json(42, &["publish", "tech"], false)).unwrap();
        let doc = issue.into_document();
        assert_eq!(doc.id, 42);
        assert_eq!(doc.labels, vec!["publish", "tech"]);
        assert_eq!(doc.body.as_deref(), Some("hello"));
    }

    #[test]
    fn null_body_is_none() {
        let mut v = issue_json(1, &[], false);
        v["body"] = serde_json::Value::Null;
        let issue: Issue = serde_json::from_value(v).unwrap();
        assert!(issue.body.is_none());
    }

    #[test]
    fn long_comment_is_truncated() {
        let short = failure_comment("bad");
        assert!(short.contains("```\nbad\n```"));

        let long = failure_comment(&"x".repeat(70_000));
        assert!(long.chars().count() <= MAX_COMMENT_LEN);
        assert!(long.ends_with("...(truncated)"));
    }

    #[test]
    fn repo_must_have_owner_and_name() {
        assert!(GitHub::new(DEFAULT_API, "justname", None).is_err());
        assert!(GitHub::new(DEFAULT_API, "o/r", None).is_ok());
    }

    const DEFAULT_API: &str = crate::config::DEFAULT_API_URL;
}
