//! HTTP competitor data client.
//!
//! Fetches competitor price bands from the backend API. Errors are
//! split into transient (retried by the gateway) and permanent
//! (treated as missing data).

use super::{CompetitorBand, CompetitorSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("rejected: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

#[derive(Debug, Deserialize)]
struct CompetitorDataResponse {
    #[serde(default)]
    success: bool,
    data: Option<CompetitorData>,
}

#[derive(Debug, Deserialize)]
struct CompetitorData {
    #[serde(rename = "priceP10")]
    price_p10: Option<f64>,
    #[serde(rename = "priceP50")]
    price_p50: Option<f64>,
    #[serde(rename = "priceP90")]
    price_p90: Option<f64>,
    #[serde(rename = "competitorCount", default)]
    competitor_count: u32,
    source: Option<String>,
}

#[derive(Clone)]
pub struct HttpCompetitorSource {
    client: Client,
    base_url: String,
}

impl HttpCompetitorSource {
    pub fn new(base_url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                if let Some(key) = api_key {
                    headers.insert(
                        "X-API-Key",
                        key.parse().context("Invalid backend API key")?,
                    );
                }
                headers
            })
            .build()
            .context("Failed to build HttpCompetitorSource")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CompetitorSource for HttpCompetitorSource {
    async fn fetch_band(
        &self,
        property_id: &str,
        stay_date: NaiveDate,
    ) -> Result<Option<CompetitorBand>, FetchError> {
        let url = format!(
            "{}/api/competitor-data/{}/{}",
            self.base_url, property_id, stay_date
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("GET {url}: {e}")))?;

        let status = resp.status();
        match status {
            StatusCode::NOT_FOUND => {
                debug!(property_id, %stay_date, "No competitor data available");
                return Ok(None);
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(FetchError::Transient(format!("GET {url}: 429")));
            }
            s if s.is_server_error() => {
                return Err(FetchError::Transient(format!("GET {url}: {s}")));
            }
            s if s.is_client_error() => {
                return Err(FetchError::Permanent(format!("GET {url}: {s}")));
            }
            _ => {}
        }

        let body: CompetitorDataResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("parse {url}: {e}")))?;

        if !body.success {
            return Ok(None);
        }

        let Some(data) = body.data else {
            return Ok(None);
        };
        let Some(p50) = data.price_p50.filter(|p| p.is_finite() && *p > 0.0) else {
            return Ok(None);
        };

        Ok(Some(CompetitorBand {
            p10: data.price_p10.filter(|p| p.is_finite() && *p > 0.0),
            p50,
            p90: data.price_p90.filter(|p| p.is_finite() && *p > 0.0),
            count: data.competitor_count,
            source: data.source.unwrap_or_else(|| "database".to_string()),
        }))
    }
}
