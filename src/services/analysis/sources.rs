use chrono::NaiveDateTime;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::time::parse_timestamp;

const MAX_FETCH_BACKOFF: Duration = Duration::from_secs(30);

/// A tabular incident source plus the mapping of its columns onto event fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub data_url: String,
    pub timestamp_col: String,
    #[serde(default)]
    pub lat_col: Option<String>,
    #[serde(default)]
    pub lon_col: Option<String>,
    #[serde(default)]
    pub primary_group_col: Option<String>,
    #[serde(default, alias = "secondary_group")]
    pub secondary_group_col: Option<String>,
    #[serde(default)]
    pub drop_invalid_timestamps: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("data source {url} is unreachable: {message}")]
    Unreachable {
        url: String,
        message: String,
        transient: bool,
    },
    #[error("data source locator {url} is invalid: {message}")]
    InvalidLocator { url: String, message: String },
    #[error("data source {url} is malformed: {message}")]
    Malformed { url: String, message: String },
    #[error("column '{column}' is missing from data source {url}")]
    MissingColumn { column: String, url: String },
    #[error("unparseable timestamp '{value}' at row {row} of {url}")]
    InvalidTimestamp {
        url: String,
        row: usize,
        value: String,
    },
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unreachable { transient: true, .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            SourceError::Unreachable { .. } => "data_source_unreachable",
            SourceError::InvalidLocator { .. } | SourceError::Malformed { .. } => {
                "invalid_data_source"
            }
            SourceError::MissingColumn { .. } => "missing_column",
            SourceError::InvalidTimestamp { .. } => "invalid_timestamp",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceHeaders {
    pub data_url: String,
    pub headers: Vec<String>,
    index: HashMap<String, usize>,
}

impl SourceHeaders {
    fn new(data_url: &str, headers: Vec<String>) -> Self {
        let mut index = HashMap::with_capacity(headers.len());
        for (idx, name) in headers.iter().enumerate() {
            index.entry(name.clone()).or_insert(idx);
        }
        Self {
            data_url: data_url.to_string(),
            headers,
            index,
        }
    }

    fn position(&self, column: &str) -> Result<usize, SourceError> {
        self.index
            .get(column)
            .copied()
            .ok_or_else(|| SourceError::MissingColumn {
                column: column.to_string(),
                url: self.data_url.clone(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub timestamp: NaiveDateTime,
    /// Parsed `(lat, lon)` when the source maps coordinates and both cells parse.
    pub coords: Option<(f64, f64)>,
    pub source: usize,
    pub fields: Vec<String>,
}

/// A column resolved against every source of an [`EventTable`].
#[derive(Debug, Clone)]
pub struct ColumnRef {
    pub name: String,
    positions: Vec<usize>,
}

/// Rows of all data sources of a job, concatenated in source order.
#[derive(Debug, Clone, Default)]
pub struct EventTable {
    pub sources: Vec<SourceHeaders>,
    pub rows: Vec<EventRow>,
    pub dropped_rows: usize,
}

impl EventTable {
    pub fn parse(sources: &[DataSource], payloads: &[Vec<u8>]) -> Result<Self, SourceError> {
        let mut table = EventTable::default();
        for (idx, (source, bytes)) in sources.iter().zip(payloads.iter()).enumerate() {
            let (headers, rows, dropped) = parse_csv(source, idx, bytes)?;
            table.sources.push(headers);
            table.rows.extend(rows);
            table.dropped_rows += dropped;
        }
        Ok(table)
    }

    /// Resolves a column by name in every source; a source lacking it is an input error.
    pub fn column(&self, name: &str) -> Result<ColumnRef, SourceError> {
        let positions = self
            .sources
            .iter()
            .map(|source| source.position(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ColumnRef {
            name: name.to_string(),
            positions,
        })
    }

    pub fn value<'a>(&self, row: &'a EventRow, column: &ColumnRef) -> &'a str {
        column
            .positions
            .get(row.source)
            .and_then(|pos| row.fields.get(*pos))
            .map(|value| value.trim())
            .unwrap_or("")
    }

    pub fn max_timestamp(&self) -> Option<NaiveDateTime> {
        self.rows.iter().map(|row| row.timestamp).max()
    }

    pub fn min_timestamp(&self) -> Option<NaiveDateTime> {
        self.rows.iter().map(|row| row.timestamp).min()
    }
}

fn parse_csv(
    source: &DataSource,
    source_idx: usize,
    bytes: &[u8],
) -> Result<(SourceHeaders, Vec<EventRow>, usize), SourceError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let malformed = |err: csv::Error| SourceError::Malformed {
        url: source.data_url.clone(),
        message: err.to_string(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let header_names: Vec<String> = reader
        .headers()
        .map_err(malformed)?
        .iter()
        .map(|name| name.trim().to_string())
        .collect();
    let headers = SourceHeaders::new(&source.data_url, header_names);

    let ts_pos = headers.position(&source.timestamp_col)?;
    let coord_pos = match (source.lat_col.as_deref(), source.lon_col.as_deref()) {
        (Some(lat), Some(lon)) => Some((headers.position(lat)?, headers.position(lon)?)),
        _ => None,
    };
    let width = headers.headers.len();

    let mut rows = Vec::new();
    let mut dropped = 0usize;
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(malformed)?;
        let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
        if fields.len() < width {
            fields.resize(width, String::new());
        }

        let raw_ts = fields[ts_pos].as_str();
        let Some(timestamp) = parse_timestamp(raw_ts) else {
            if source.drop_invalid_timestamps {
                dropped += 1;
                continue;
            }
            return Err(SourceError::InvalidTimestamp {
                url: source.data_url.clone(),
                // 1-based data row, header excluded.
                row: line + 1,
                value: raw_ts.to_string(),
            });
        };

        let coords = coord_pos.and_then(|(lat_pos, lon_pos)| {
            let lat = fields[lat_pos].trim().parse::<f64>().ok()?;
            let lon = fields[lon_pos].trim().parse::<f64>().ok()?;
            Some((lat, lon))
        });

        rows.push(EventRow {
            timestamp,
            coords,
            source: source_idx,
            fields,
        });
    }

    if dropped > 0 {
        tracing::warn!(
            data_url = %source.data_url,
            dropped,
            "dropped rows with unparseable timestamps"
        );
    }
    Ok((headers, rows, dropped))
}

enum Locator {
    Http(url::Url),
    Path(PathBuf),
}

fn parse_locator(data_url: &str) -> Result<Locator, SourceError> {
    let trimmed = data_url.trim();
    if trimmed.is_empty() {
        return Err(SourceError::InvalidLocator {
            url: data_url.to_string(),
            message: "empty locator".to_string(),
        });
    }
    match url::Url::parse(trimmed) {
        Ok(parsed) => match parsed.scheme() {
            "http" | "https" => Ok(Locator::Http(parsed)),
            "file" => parsed
                .to_file_path()
                .map(Locator::Path)
                .map_err(|_| SourceError::InvalidLocator {
                    url: data_url.to_string(),
                    message: "file URL does not name a local path".to_string(),
                }),
            // Windows drive letters parse as one-letter schemes.
            scheme if scheme.len() == 1 => Ok(Locator::Path(PathBuf::from(trimmed))),
            other => Err(SourceError::InvalidLocator {
                url: data_url.to_string(),
                message: format!("unsupported scheme '{other}'"),
            }),
        },
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Locator::Path(PathBuf::from(trimmed))),
        Err(err) => Err(SourceError::InvalidLocator {
            url: data_url.to_string(),
            message: err.to_string(),
        }),
    }
}

/// Fetches and parses data sources with bounded retry of transient failures.
#[derive(Clone)]
pub struct SourceResolver {
    http: reqwest::Client,
    retries: u32,
    backoff: Duration,
}

impl SourceResolver {
    pub fn new(http: reqwest::Client, retries: u32, backoff: Duration) -> Self {
        Self {
            http,
            retries: retries.max(1),
            backoff,
        }
    }

    pub async fn resolve_all(&self, sources: &[DataSource]) -> Result<EventTable, SourceError> {
        let payloads =
            futures::future::try_join_all(sources.iter().map(|source| self.fetch(source))).await?;
        let owned = sources.to_vec();
        tokio::task::spawn_blocking(move || EventTable::parse(&owned, &payloads))
            .await
            .map_err(|err| SourceError::Malformed {
                url: sources
                    .first()
                    .map(|source| source.data_url.clone())
                    .unwrap_or_default(),
                message: format!("parser task failed: {err}"),
            })?
    }

    pub async fn fetch(&self, source: &DataSource) -> Result<Vec<u8>, SourceError> {
        let locator = parse_locator(&source.data_url)?;
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            let outcome = match &locator {
                Locator::Http(url) => self.fetch_http(&source.data_url, url).await,
                Locator::Path(path) => fetch_path(&source.data_url, path).await,
            };
            match outcome {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_transient() && attempt < self.retries => {
                    tracing::warn!(
                        data_url = %source.data_url,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "data source fetch failed (will retry)"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, MAX_FETCH_BACKOFF);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_http(&self, data_url: &str, url: &url::Url) -> Result<Vec<u8>, SourceError> {
        let unreachable = |message: String, transient: bool| SourceError::Unreachable {
            url: data_url.to_string(),
            message,
            transient,
        };
        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|err| unreachable(err.to_string(), true))?;
        let status = resp.status();
        if !status.is_success() {
            let transient = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err(unreachable(format!("HTTP {status}"), transient));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|err| unreachable(err.to_string(), true))?;
        Ok(body.to_vec())
    }
}

async fn fetch_path(data_url: &str, path: &Path) -> Result<Vec<u8>, SourceError> {
    tokio::fs::read(path).await.map_err(|err| {
        let transient = !matches!(
            err.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
        );
        SourceError::Unreachable {
            url: data_url.to_string(),
            message: format!("{}: {err}", path.display()),
            transient,
        }
    })
}
