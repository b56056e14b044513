//! Scraper output adapters: turn saved listing pages and scraper JSON dumps into
//! [`Candidate`] batches for reconciliation.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use optrack_core::{Candidate, Details};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "optrack-adapters";

/// Route InfoReady uses for a competition's detail view.
pub const DETAIL_ROUTE: &str = "#competitionDetail";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub source: String,
    /// Site root used to absolutise relative links.
    pub base_url: Option<String>,
}

impl AdapterContext {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(clean_base(&base_url.into()));
        self
    }

    /// Default base for an InfoReady tenant named after the source code.
    pub fn infoready(source: impl Into<String>) -> Self {
        let source = source.into();
        let base = format!("https://{source}.infoready4.com");
        Self::new(source).with_base_url(base)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("malformed scraper JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchFormat {
    /// Records dumped by the scraper: a JSON array, an `{id: record}` map, a
    /// `{"grants": ...}` document, or JSON lines.
    ScraperJson,
    /// A saved InfoReady listing page.
    ListingHtml,
}

impl BatchFormat {
    /// Guess from a file extension; anything that is not HTML is treated as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm") => {
                BatchFormat::ListingHtml
            }
            _ => BatchFormat::ScraperJson,
        }
    }
}

impl fmt::Display for BatchFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchFormat::ScraperJson => f.write_str("json"),
            BatchFormat::ListingHtml => f.write_str("html"),
        }
    }
}

impl FromStr for BatchFormat {
    type Err = AdapterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" | "jsonl" | "scraper-json" => Ok(BatchFormat::ScraperJson),
            "html" | "listing-html" => Ok(BatchFormat::ListingHtml),
            other => Err(AdapterError::Message(format!(
                "unknown batch format {other:?} (expected json or html)"
            ))),
        }
    }
}

pub trait CandidateAdapter: Send + Sync {
    fn format(&self) -> BatchFormat;

    fn parse(&self, ctx: &AdapterContext, raw: &str) -> Result<Vec<Candidate>, AdapterError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScraperJsonAdapter;

#[derive(Debug, Clone, Copy, Default)]
pub struct ListingHtmlAdapter;

pub fn adapter_for_format(format: BatchFormat) -> Box<dyn CandidateAdapter> {
    match format {
        BatchFormat::ScraperJson => Box::new(ScraperJsonAdapter),
        BatchFormat::ListingHtml => Box::new(ListingHtmlAdapter),
    }
}

/// Read a scraper output file and convert it with the adapter for `format`.
pub fn load_candidate_batch(
    path: impl AsRef<Path>,
    format: BatchFormat,
    ctx: &AdapterContext,
) -> Result<Vec<Candidate>> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let candidates = adapter_for_format(format)
        .parse(ctx, &raw)
        .with_context(|| format!("parsing {} as {format}", path.display()))?;
    debug!(path = %path.display(), %format, candidates = candidates.len(), "loaded candidate batch");
    Ok(candidates)
}

impl CandidateAdapter for ScraperJsonAdapter {
    fn format(&self) -> BatchFormat {
        BatchFormat::ScraperJson
    }

    fn parse(&self, ctx: &AdapterContext, raw: &str) -> Result<Vec<Candidate>, AdapterError> {
        let entries = match serde_json::from_str::<JsonValue>(raw) {
            Ok(document) => entries_from_document(document)?,
            Err(whole_err) => entries_from_lines(raw).map_err(|line_err| {
                AdapterError::Message(format!(
                    "not a JSON document ({whole_err}) nor JSON lines ({line_err})"
                ))
            })?,
        };
        Ok(entries
            .iter()
            .map(|(key, value)| candidate_from_json(ctx, key.as_deref(), value))
            .collect())
    }
}

type Entry = (Option<String>, JsonValue);

fn entries_from_document(document: JsonValue) -> Result<Vec<Entry>, AdapterError> {
    match document {
        JsonValue::Array(items) => Ok(items.into_iter().map(|item| (None, item)).collect()),
        JsonValue::Object(mut map) => match map.remove("grants") {
            Some(grants) => entries_from_document(grants),
            None if map.values().all(JsonValue::is_object) => {
                Ok(map.into_iter().map(|(key, item)| (Some(key), item)).collect())
            }
            None => Ok(vec![(None, JsonValue::Object(map))]),
        },
        other => Err(AdapterError::Message(format!(
            "expected a list or map of records, found {}",
            json_kind(&other)
        ))),
    }
}

fn entries_from_lines(raw: &str) -> Result<Vec<Entry>, serde_json::Error> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map(|item| (None, item)))
        .collect()
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Field names differ between scraper generations; the first non-empty alias wins.
fn json_text(value: &JsonValue, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|name| match value.get(*name)? {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn candidate_from_json(ctx: &AdapterContext, key: Option<&str>, value: &JsonValue) -> Candidate {
    let identifier = json_text(value, &["competition_id", "id"])
        .or_else(|| key.and_then(|k| text_or_none(k.to_string())))
        .unwrap_or_default();
    let source = json_text(value, &["site", "source"]).unwrap_or_else(|| ctx.source.clone());
    let link = json_text(value, &["link", "url"])
        .map(|href| absolutise(ctx.base_url.as_deref(), &href))
        .unwrap_or_default();

    let mut details: Option<Details> = match value.get("details") {
        Some(JsonValue::Object(map)) => Some(object_to_details(map)),
        _ => None,
    };
    if let (Some(details), Some(deadline)) = (details.as_mut(), json_text(value, &["deadline"])) {
        details.entry("Deadline".to_string()).or_insert(JsonValue::String(deadline));
    }

    Candidate {
        source,
        identifier,
        title: json_text(value, &["title"]).unwrap_or_default(),
        link,
        description: json_text(value, &["description_full", "description", "synopsis"])
            .unwrap_or_default(),
        details,
    }
}

fn object_to_details(map: &Map<String, JsonValue>) -> Details {
    map.iter()
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim().to_string(), value.clone()))
        .collect()
}

impl CandidateAdapter for ListingHtmlAdapter {
    fn format(&self) -> BatchFormat {
        BatchFormat::ListingHtml
    }

    fn parse(&self, ctx: &AdapterContext, raw: &str) -> Result<Vec<Candidate>, AdapterError> {
        let document = Html::parse_document(raw);
        let anchors = selector("a[competitionid]")?;
        let mut candidates = Vec::new();
        for anchor in document.select(&anchors) {
            let Some(identifier) = anchor
                .value()
                .attr("competitionid")
                .and_then(|id| text_or_none(id.to_string()))
            else {
                warn!(source = %ctx.source, "listing anchor without competition id");
                continue;
            };
            let title = anchor.text().collect::<Vec<_>>().join(" ");
            let link = match anchor.value().attr("href").and_then(|h| text_or_none(h.to_string())) {
                Some(href) => absolutise(ctx.base_url.as_deref(), &href),
                None => detail_link(ctx.base_url.as_deref(), &identifier),
            };
            candidates.push(Candidate {
                source: ctx.source.clone(),
                identifier,
                title: collapse_whitespace(&title),
                link,
                description: String::new(),
                details: None,
            });
        }
        Ok(candidates)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip query string, fragment and trailing slashes from a site root.
pub fn clean_base(url: &str) -> String {
    let end = url.find(['#', '?']).unwrap_or(url.len());
    url[..end].trim_end_matches('/').to_string()
}

fn absolutise(base: Option<&str>, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    match base {
        Some(base) if href.starts_with('/') => format!("{base}{href}"),
        Some(base) => format!("{base}/{href}"),
        None => href.to_string(),
    }
}

/// Link to a competition's detail view when the listing gives none.
pub fn detail_link(base: Option<&str>, identifier: &str) -> String {
    format!("{}{DETAIL_ROUTE}/{identifier}", base.unwrap_or_default())
}
