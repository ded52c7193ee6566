//! Blocking InfluxDB 1.x client for pulling bulk load history.
//!
//! - Uses `ureq` (no async) against the `/query` endpoint with InfluxQL.
//! - Only the single-field time series needed for reanalysis is supported.
//! - Credentials, when set, are passed as `u`/`p` query parameters.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::Deserialize;

use crate::config::InfluxConfig;
use crate::nilm::replay::{HistoryPoint, HistorySource};

/// Longest response body excerpt kept in an error.
const ERROR_BODY_LIMIT: usize = 300;

#[derive(Debug)]
pub enum SourceError {
    Transport(String),
    Http { status: u16, message: String },
    Json(String),
    /// The server answered but reported an InfluxQL error.
    Query(String),
}

impl core::fmt::Display for SourceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SourceError::Transport(s) => write!(f, "transport error: {}", s),
            SourceError::Http { status, message } => write!(f, "http {}: {}", status, message),
            SourceError::Json(e) => write!(f, "json error: {}", e),
            SourceError::Query(e) => write!(f, "query error: {}", e),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<ureq::Error> for SourceError {
    fn from(value: ureq::Error) -> Self {
        SourceError::Transport(value.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

pub struct InfluxClient {
    agent: ureq::Agent,
    config: InfluxConfig,
}

impl InfluxClient {
    pub fn new(config: InfluxConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout))
            .http_status_as_error(false)
            .build()
            .into();
        InfluxClient { agent, config }
    }

    /// InfluxQL for the configured load series over the lookback period.
    pub fn history_query(&self) -> String {
        format!(
            "SELECT \"{}\" FROM \"{}\" WHERE time > now() - {}d ORDER BY time ASC",
            self.config.field.replace('"', "\\\""),
            self.config.measurement.replace('"', "\\\""),
            self.config.lookback_days
        )
    }

    fn query(&self, q: &str) -> Result<String, SourceError> {
        let url = format!("{}/query", self.config.url);
        let mut req = self
            .agent
            .get(&url)
            .header("Accept", "application/json")
            .query("db", &self.config.database)
            .query("q", q);
        if let Some(user) = &self.config.username {
            req = req.query("u", user);
        }
        if let Some(password) = &self.config.password {
            req = req.query("p", password);
        }

        let mut resp = req.call()?;
        let status = resp.status();
        let body = resp.body_mut().read_to_string()?;
        if status != StatusCode::OK {
            return Err(SourceError::Http {
                status: status.as_u16(),
                message: excerpt(&body),
            });
        }
        Ok(body)
    }

    pub fn fetch_history(&self) -> Result<Vec<HistoryPoint>, SourceError> {
        let body = self.query(&self.history_query())?;
        parse_series(&body)
    }
}

impl HistorySource for InfluxClient {
    fn describe(&self) -> String {
        format!(
            "InfluxDB {} ({}.\"{}\".{}, last {}d)",
            self.config.url, self.config.database, self.config.measurement, self.config.field, self.config.lookback_days
        )
    }

    fn fetch_load_history(&self) -> Result<Vec<HistoryPoint>, SourceError> {
        self.fetch_history()
    }
}

/// Flatten every `[time, value]` row of every series. Rows with a null value or an
/// unreadable timestamp are skipped.
pub fn parse_series(body: &str) -> Result<Vec<HistoryPoint>, SourceError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    let parsed: QueryResponse = serde_path_to_error::deserialize(de)
        .map_err(|e| SourceError::Json(format!("{} at {}", e.inner(), e.path())))?;

    if let Some(err) = parsed.error {
        return Err(SourceError::Query(err));
    }

    let mut points = Vec::new();
    for result in parsed.results {
        if let Some(err) = result.error {
            return Err(SourceError::Query(err));
        }
        for series in result.series {
            for row in series.values {
                let (Some(time), Some(watts)) = (row.first(), row.get(1)) else {
                    continue;
                };
                let Some(watts) = watts.as_f64() else {
                    continue;
                };
                let Some(time) = time
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc))
                else {
                    continue;
                };
                points.push(HistoryPoint { time, watts });
            }
        }
    }
    Ok(points)
}

fn excerpt(body: &str) -> String {
    if body.is_empty() {
        return String::from("<no body>");
    }
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn client() -> InfluxClient {
        InfluxClient::new(InfluxConfig {
            url: "http://localhost:8086".to_string(),
            database: "solar_assistant".to_string(),
            username: None,
            password: None,
            measurement: "Load power".to_string(),
            field: "combined".to_string(),
            lookback_days: 10,
            timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn builds_history_query() {
        assert_eq!(
            client().history_query(),
            "SELECT \"combined\" FROM \"Load power\" WHERE time > now() - 10d ORDER BY time ASC"
        );
    }

    #[test]
    fn parses_rows_and_skips_gaps() {
        let body = r#"{"results":[{"statement_id":0,"series":[{"name":"Load power","columns":["time","combined"],
            "values":[["2024-05-01T00:00:00Z",312],["2024-05-01T00:00:10Z",null],["garbage",1.0],
                      ["2024-05-01T00:00:20.5+00:00",455.5]]}]}]}"#;
        let points = parse_series(body).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].time, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(points[0].watts, 312.0);
        assert_eq!(points[1].watts, 455.5);
    }

    #[test]
    fn empty_result_is_no_points() {
        assert!(parse_series(r#"{"results":[{"statement_id":0}]}"#).unwrap().is_empty());
    }

    #[test]
    fn reports_query_errors() {
        let err = parse_series(r#"{"results":[{"statement_id":0,"error":"database not found: x"}]}"#).unwrap_err();
        assert!(matches!(err, SourceError::Query(ref m) if m.contains("database not found")));
    }

    #[test]
    fn json_errors_carry_the_path() {
        let err = parse_series(r#"{"results":[{"series":[{"values":"nope"}]}]}"#).unwrap_err();
        match err {
            SourceError::Json(msg) => assert!(msg.contains("results[0].series[0].values"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn long_bodies_are_cut() {
        let long = "x".repeat(1000);
        assert_eq!(excerpt(&long).len(), ERROR_BODY_LIMIT + 3);
        assert_eq!(excerpt(""), "<no body>");
    }
}
