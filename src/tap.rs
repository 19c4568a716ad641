//! Table Access Protocol client.
//!
//! Records are fetched with synchronous ADQL queries, one page at a time,
//! ordered by modification date. A failed page fetch is retried forever:
//! callers must be prepared for [`TapRecordStream::next`] to block under a
//! persistent outage.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::RawValue;
use crate::votable::{parse_votable, TapRecord, VoTable, VoTableError};

pub const DEFAULT_FORMAT: &str = "votable/td";

#[derive(Debug, Error)]
pub enum TapError {
    #[error("invalid TAP service URL \"{0}\"")]
    InvalidUrl(String),
    #[error("TAP request failed: {0}")]
    Transport(String),
    #[error("TAP service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    VoTable(#[from] VoTableError),
}

/// Something that can run an ADQL query and return a decoded table.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn run_query(&self, adql: &str) -> Result<VoTable, TapError>;
}

/// Client for the synchronous endpoint of a TAP service.
#[derive(Debug, Clone)]
pub struct TapClient {
    client: reqwest::Client,
    sync_url: Url,
    format: String,
}

impl TapClient {
    pub fn new(client: reqwest::Client, service_url: &str) -> Result<Self, TapError> {
        let base = service_url.trim_end_matches('/');
        let sync_url = Url::parse(&format!("{}/sync", base))
            .map_err(|_| TapError::InvalidUrl(service_url.to_string()))?;
        Ok(Self {
            client,
            sync_url,
            format: DEFAULT_FORMAT.to_string(),
        })
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    /// Names and descriptions of the tables the service publishes.
    pub async fn list_tables(&self) -> Result<Vec<(String, Option<String>)>, TapError> {
        let table = self
            .run_query("SELECT table_name, description FROM TAP_SCHEMA.tables")
            .await?;
        Ok(table
            .rows
            .iter()
            .filter_map(|row| {
                let name = match row.get("table_name") {
                    Some(RawValue::Text(name)) => name.clone(),
                    _ => return None,
                };
                let description = match row.get("description") {
                    Some(RawValue::Text(d)) if !d.trim().is_empty() => Some(d.trim().to_string()),
                    _ => None,
                };
                Some((name, description))
            })
            .collect())
    }

    /// Column definitions of a table and its first row, if any.
    pub async fn sample(&self, table: &str) -> Result<(VoTable, Option<TapRecord>), TapError> {
        let mut result = self
            .run_query(&format!("SELECT TOP 1 * FROM {}", table))
            .await?;
        let first = if result.rows.is_empty() {
            None
        } else {
            Some(result.rows.remove(0))
        };
        Ok((result, first))
    }
}

#[async_trait]
impl QueryRunner for TapClient {
    async fn run_query(&self, adql: &str) -> Result<VoTable, TapError> {
        debug!(query = adql, "executing TAP query");
        let params = [
            ("REQUEST", "doQuery"),
            ("LANG", "ADQL"),
            ("FORMAT", self.format.as_str()),
            ("QUERY", adql),
        ];
        let response = self
            .client
            .post(self.sync_url.clone())
            .form(&params)
            .send()
            .await
            .map_err(|e| TapError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TapError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(TapError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).to_string(),
            });
        }
        Ok(parse_votable(&body)?)
    }
}

/// ADQL for one page of records, oldest modification first.
pub fn page_query(
    table: &str,
    page_size: usize,
    offset: usize,
    since: Option<&NaiveDateTime>,
) -> String {
    let mut query = format!("SELECT TOP {} * FROM {}", page_size, table);
    if let Some(since) = since {
        query.push_str(&format!(
            " WHERE modification_date > '{}'",
            since.format("%Y-%m-%dT%H:%M:%S")
        ));
    }
    query.push_str(" ORDER BY modification_date");
    if offset > 0 {
        query.push_str(&format!(" OFFSET {}", offset));
    }
    query
}

/// Lazily paginated sequence of records from one table.
pub struct TapRecordStream<'a> {
    runner: &'a dyn QueryRunner,
    table: String,
    page_size: usize,
    since: Option<NaiveDateTime>,
    retry_delay: Duration,
    offset: usize,
    buffer: VecDeque<TapRecord>,
    exhausted: bool,
}

impl<'a> TapRecordStream<'a> {
    pub fn new(
        runner: &'a dyn QueryRunner,
        table: impl Into<String>,
        page_size: usize,
        since: Option<NaiveDateTime>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            runner,
            table: table.into(),
            page_size: page_size.max(1),
            since,
            retry_delay,
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// The next record, or `None` once the table is exhausted.
    pub async fn next(&mut self) -> Option<TapRecord> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await;
        }
        self.buffer.pop_front()
    }

    async fn fetch_page(&mut self) {
        let query = page_query(
            &self.table,
            self.page_size,
            self.offset,
            self.since.as_ref(),
        );
        let table = loop {
            match self.runner.run_query(&query).await {
                Ok(table) => break table,
                Err(e) => {
                    warn!(
                        "Fetching records {}..{} of {} failed, retrying in {:?}: {}",
                        self.offset,
                        self.offset + self.page_size,
                        self.table,
                        self.retry_delay,
                        e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        };
        let count = table.rows.len();
        debug!(table = %self.table, offset = self.offset, count, "fetched TAP page");
        self.offset += count;
        if count < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(table.rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::NaiveDate;

    struct FakeRunner {
        pages: Mutex<VecDeque<Result<VoTable, TapError>>>,
        queries: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn new(pages: Vec<Result<VoTable, TapError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QueryRunner for FakeRunner {
        async fn run_query(&self, adql: &str) -> Result<VoTable, TapError> {
            self.queries.lock().unwrap().push(adql.to_string());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(VoTable::default()))
        }
    }

    fn page(ids: &[&str]) -> VoTable {
        VoTable {
            fields: Vec::new(),
            rows: ids
                .iter()
                .map(|id| TapRecord::from_pairs([("granule_uid", RawValue::Text(id.to_string()))]))
                .collect(),
        }
    }

    #[test]
    fn page_query_shape() {
        assert_eq!(
            page_query("lars.epn_core", 100, 0, None),
            "SELECT TOP 100 * FROM lars.epn_core ORDER BY modification_date"
        );
        let since = NaiveDate::from_ymd_opt(2021, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(
            page_query("t", 10, 20, Some(&since)),
            "SELECT TOP 10 * FROM t WHERE modification_date > '2021-01-02T03:04:05' \
             ORDER BY modification_date OFFSET 20"
        );
    }

    #[tokio::test]
    async fn stream_pages_lazily_and_retries_failures() {
        let runner = FakeRunner::new(vec![
            Ok(page(&["a", "b"])),
            Err(TapError::Transport("connection reset".into())),
            Ok(page(&["c"])),
        ]);
        let mut stream = TapRecordStream::new(&runner, "t", 2, None, Duration::ZERO);

        assert_eq!(stream.next().await.unwrap().label(), "a");
        assert_eq!(runner.queries.lock().unwrap().len(), 1);
        assert_eq!(stream.next().await.unwrap().label(), "b");
        assert_eq!(stream.next().await.unwrap().label(), "c");
        assert!(stream.next().await.is_none());

        let queries = runner.queries.lock().unwrap();
        assert_eq!(queries.len(), 3);
        assert!(queries[1].ends_with("OFFSET 2"));
        assert_eq!(queries[1], queries[2]);
    }

    #[tokio::test]
    async fn empty_table_ends_immediately() {
        let runner = FakeRunner::new(vec![Ok(page(&[]))]);
        let mut stream = TapRecordStream::new(&runner, "t", 5, None, Duration::ZERO);
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
        assert_eq!(runner.queries.lock().unwrap().len(), 1);
    }

    #[test]
    fn client_builds_sync_url() {
        let client = TapClient::new(reqwest::Client::new(), "http://dachs.example.org/tap/").unwrap();
        assert_eq!(client.sync_url.as_str(), "http://dachs.example.org/tap/sync");
        assert!(TapClient::new(reqwest::Client::new(), "not a url").is_err());
    }
}
