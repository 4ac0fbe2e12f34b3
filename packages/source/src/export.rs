//! HTTP client for the raw event export API.
//!
//! `GET {base_url}/export?from_date=..&to_date=..` answers with one JSON
//! event per line. The body is parsed incrementally as it arrives, so a
//! chunk's memory is bounded by the events it contains rather than by an
//! intermediate copy of the whole response.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use eventsync_source_models::{FetchFilters, RawEvent};
use futures::{Stream, StreamExt as _};

use crate::config::SourceConfig;
use crate::{EventSource, EventStream, SourceError, retry};

/// Date format the export API expects for `from_date`/`to_date`.
const DATE_FORMAT: &str = "%Y-%m-%d";

/// [`EventSource`] backed by the HTTP export API.
pub struct HttpExportSource {
    client: reqwest::Client,
    config: SourceConfig,
}

impl HttpExportSource {
    /// Builds a client from `config`. The per-request timeout comes from
    /// [`SourceConfig::timeout_secs`].
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Http`] if the HTTP client cannot be built.
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent("eventsync/1.0")
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn export_url(&self) -> String {
        format!("{}/export", self.config.base_url.trim_end_matches('/'))
    }

    fn build_request(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        filters: &FetchFilters,
    ) -> reqwest::RequestBuilder {
        self.client
            .get(self.export_url())
            .basic_auth(&self.config.username, Some(&self.config.secret))
            .query(&query_params(
                from,
                to,
                filters,
                self.config.project_id.as_deref(),
            ))
    }
}

#[async_trait]
impl EventSource for HttpExportSource {
    fn name(&self) -> &str {
        &self.config.base_url
    }

    async fn preflight(&self) -> Result<(), SourceError> {
        self.config.validate()
    }

    fn stream<'a>(
        &'a self,
        from: NaiveDate,
        to: NaiveDate,
        filters: &'a FetchFilters,
    ) -> EventStream<'a> {
        Box::pin(async_stream::stream! {
            log::debug!("[export] Requesting {from}..{to}");

            let response = match retry::send_with_retry(
                || self.build_request(from, to, filters),
                retry::MAX_RETRIES,
            )
            .await
            {
                Ok(response) => response,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut events = ndjson_events(response.bytes_stream());
            let mut count: u64 = 0;
            while let Some(event) = events.next().await {
                if event.is_ok() {
                    count += 1;
                }
                yield event;
            }

            log::debug!("[export] {from}..{to}: {count} events");
        })
    }
}

/// Frames a newline-delimited JSON body into events as its chunks arrive.
///
/// Lines may be split anywhere across chunks, including between `\r` and
/// `\n`. A final line without a trailing newline is still parsed. The
/// stream ends after the first error.
pub fn ndjson_events<'a, S, B, E>(body: S) -> EventStream<'a>
where
    S: Stream<Item = Result<B, E>> + Send + 'a,
    B: AsRef<[u8]> + Send + 'a,
    E: Into<SourceError> + Send + 'a,
{
    Box::pin(async_stream::stream! {
        let mut body = std::pin::pin!(body);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let e: SourceError = e.into();
                    yield Err(e);
                    return;
                }
            };

            // Bytes already in the buffer hold no newline.
            let mut scanned = buffer.len();
            buffer.extend_from_slice(chunk.as_ref());

            let mut line_start = 0;
            while let Some(offset) = buffer[scanned..].iter().position(|b| *b == b'\n') {
                let line_end = scanned + offset;
                match parse_line(&buffer[line_start..line_end]) {
                    Ok(Some(event)) => {
                        yield Ok(event);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
                line_start = line_end + 1;
                scanned = line_start;
            }
            buffer.drain(..line_start);
        }

        match parse_line(&buffer) {
            Ok(Some(event)) => {
                yield Ok(event);
            }
            Ok(None) => {}
            Err(e) => {
                yield Err(e);
            }
        }
    })
}

/// Builds the export query string parameters.
#[must_use]
pub fn query_params(
    from: NaiveDate,
    to: NaiveDate,
    filters: &FetchFilters,
    project_id: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("from_date", from.format(DATE_FORMAT).to_string()),
        ("to_date", to.format(DATE_FORMAT).to_string()),
    ];
    if let Some(project_id) = project_id {
        params.push(("project_id", project_id.to_string()));
    }
    if !filters.events.is_empty() {
        // The API takes a JSON array of event names.
        params.push((
            "event",
            serde_json::Value::from(filters.events.clone()).to_string(),
        ));
    }
    if let Some(expression) = &filters.where_clause {
        params.push(("where", expression.clone()));
    }
    params
}

/// Parses one line of the export body. Blank lines yield `None`.
///
/// # Errors
///
/// Returns [`SourceError::Json`] if the line is not a valid event object.
pub fn parse_line(line: &[u8]) -> Result<Option<RawEvent>, SourceError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(line)?))
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;

    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    #[test]
    fn builds_minimal_query() {
        let params = query_params(
            date("2024-01-01"),
            date("2024-01-07"),
            &FetchFilters::default(),
            None,
        );
        assert_eq!(
            params,
            vec![
                ("from_date", "2024-01-01".to_string()),
                ("to_date", "2024-01-07".to_string()),
            ]
        );
    }

    #[test]
    fn encodes_event_filter_as_json_array() {
        let filters = FetchFilters::default()
            .with_events(vec!["Signup".to_string(), "Login".to_string()])
            .with_where("properties[\"plan\"] == \"pro\"");
        let params = query_params(date("2024-01-01"), date("2024-01-01"), &filters, Some("7"));

        assert!(params.contains(&("project_id", "7".to_string())));
        assert!(params.contains(&("event", r#"["Signup","Login"]"#.to_string())));
        assert!(params.contains(&("where", "properties[\"plan\"] == \"pro\"".to_string())));
    }

    #[test]
    fn parses_event_lines() {
        let event = parse_line(b"{\"event\":\"Signup\",\"properties\":{\"time\":1}}\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(event.event, "Signup");
        assert_eq!(event.properties["time"], 1);

        assert!(parse_line(b"   \n").unwrap().is_none());
        assert!(matches!(parse_line(b"{\"event\":"), Err(SourceError::Json(_))));
    }

    async fn frame(chunks: &[&str]) -> Vec<Result<RawEvent, SourceError>> {
        let body = futures::stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok::<_, SourceError>(chunk.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        );
        ndjson_events(body).collect().await
    }

    fn names(events: &[Result<RawEvent, SourceError>]) -> Vec<&str> {
        events
            .iter()
            .map(|e| e.as_ref().unwrap().event.as_str())
            .collect()
    }

    #[tokio::test]
    async fn joins_lines_split_across_chunks() {
        let events = frame(&[
            "{\"event\":\"A\",\"properties\":{}}\n{\"event\":\"B\",\"prop",
            "erties\":{\"time\":2}}\n",
        ])
        .await;

        assert_eq!(names(&events), vec!["A", "B"]);
        assert_eq!(events[1].as_ref().unwrap().properties["time"], 2);
    }

    #[tokio::test]
    async fn parses_final_line_without_newline() {
        let events = frame(&[
            "{\"event\":\"A\",\"properties\":{}}\n\n",
            "{\"event\":\"B\",\"properties\":{}}",
        ])
        .await;

        assert_eq!(names(&events), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn handles_crlf_split_across_chunks() {
        let events = frame(&[
            "{\"event\":\"A\",\"properties\":{}}\r",
            "\n{\"event\":\"B\",\"properties\":{}}\r\n",
            "{\"event\":\"C\",",
            "\"properties\":{}}\r",
            "\n",
        ])
        .await;

        assert_eq!(names(&events), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn stops_at_first_malformed_line() {
        let events = frame(&[
            "{\"event\":\"A\",\"properties\":{}}\n{\"event\":\n",
            "{\"event\":\"C\",\"properties\":{}}\n",
        ])
        .await;

        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(SourceError::Json(_))));
    }

    #[tokio::test]
    async fn body_error_ends_the_stream() {
        let body = futures::stream::iter(vec![
            Ok(b"{\"event\":\"A\",\"properties\":{}}\n{\"ev".to_vec()),
            Err(SourceError::Status {
                status: 502,
                message: "connection reset".to_string(),
            }),
            Ok(b"ent\":\"B\",\"properties\":{}}\n".to_vec()),
        ]);
        let events: Vec<_> = ndjson_events(body).collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().event, "A");
        assert!(matches!(events[1], Err(SourceError::Status { status: 502, .. })));
    }

    #[tokio::test]
    async fn preflight_rejects_missing_credentials() {
        let source = HttpExportSource::new(SourceConfig {
            base_url: "https://export.example.com".to_string(),
            ..SourceConfig::default()
        })
        .unwrap();
        assert!(matches!(
            source.preflight().await,
            Err(SourceError::Auth { .. })
        ));
    }

    #[test]
    fn export_url_strips_trailing_slash() {
        let source = HttpExportSource::new(SourceConfig {
            base_url: "https://export.example.com/api/2.0/".to_string(),
            ..SourceConfig::default()
        })
        .unwrap();
        assert_eq!(source.export_url(), "https://export.example.com/api/2.0/export");
    }
}
