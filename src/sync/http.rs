use super::fetcher::{FetchBatch, FetchRequest, ProviderFetcher, RemoteRecord};
use crate::error::{Error, Result};
use crate::model::{AuthType, FeedFormat, SyncType};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, StatusCode};
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

/// Fetches provider feeds over HTTP(S).
///
/// Query parameters `sync` (`full` / `incremental`) and `token` are appended
/// to the provider's base URL. JSON feeds return one [`FetchBatch`] per
/// request; line feeds are streamed and always form a single page, with the
/// continuation token taken from the `X-Next-Token` response header.
pub struct HttpFetcher {
    client: Client,
    /// Earliest instant each provider may be called again.
    next_slot: Mutex<FxHashMap<String, Instant>>,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("no-call/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::internal(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            next_slot: Mutex::new(FxHashMap::default()),
        })
    }

    /// One line of a line feed: a number, or `-number` for a tombstone.
    /// Blank lines and `#` comments are skipped.
    fn parse_line(line: &str) -> Option<RemoteRecord> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        match line.strip_prefix('-') {
            Some(number) => Some(RemoteRecord::tombstone(number.trim())),
            None => Some(RemoteRecord::number(line)),
        }
    }

    #[cfg(test)]
    fn parse_feed_content(text: &str) -> Vec<RemoteRecord> {
        text.lines().filter_map(Self::parse_line).collect()
    }

    /// Spaces requests to at most `rate_limit_per_min` per provider.
    async fn pace(&self, provider_id: &str, rate_limit_per_min: u32) {
        if rate_limit_per_min == 0 {
            return;
        }
        let interval = Duration::from_secs(60) / rate_limit_per_min;
        let wait_until = {
            let mut slots = self.next_slot.lock();
            let now = Instant::now();
            let slot = slots.entry(provider_id.to_string()).or_insert(now);
            let start = (*slot).max(now);
            *slot = start + interval;
            start
        };
        if wait_until > Instant::now() {
            debug!(provider = provider_id, "Rate limit pacing request");
            tokio::time::sleep_until(wait_until).await;
        }
    }

    fn authorize(builder: RequestBuilder, request: &FetchRequest) -> Result<RequestBuilder> {
        let provider = &request.provider;
        if provider.auth_type == AuthType::None {
            return Ok(builder);
        }
        let credential = request.credential.as_deref().ok_or_else(|| {
            Error::policy(format!("provider '{}' has no resolvable credential", provider.id))
        })?;
        Ok(match provider.auth_type {
            AuthType::None => builder,
            AuthType::ApiKey => builder.header("X-API-Key", credential),
            AuthType::Oauth => builder.bearer_auth(credential),
            AuthType::Basic => {
                let (user, pass) = credential.split_once(':').unwrap_or((credential, ""));
                builder.basic_auth(user, Some(pass))
            }
        })
    }

    fn classify_status(provider_id: &str, status: StatusCode) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::upstream(provider_id, format!("HTTP {}", status)));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::policy(format!(
                "provider '{}' rejected credentials (HTTP {})",
                provider_id, status
            )));
        }
        Err(Error::validation(format!(
            "provider '{}' rejected request (HTTP {})",
            provider_id, status
        )))
    }

    fn request_url(request: &FetchRequest) -> Result<url::Url> {
        let provider = &request.provider;
        let base = provider
            .base_url
            .as_deref()
            .ok_or_else(|| Error::validation(format!("provider '{}' has no base_url", provider.id)))?;
        let mut url = url::Url::parse(base)
            .map_err(|e| Error::validation(format!("provider '{}': {}", provider.id, e)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(
                "sync",
                match request.sync_type {
                    SyncType::Full => "full",
                    SyncType::Incremental => "incremental",
                },
            );
            if let Some(token) = &request.token {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }
}

#[async_trait::async_trait]
impl ProviderFetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchBatch> {
        let provider = &request.provider;
        let url = Self::request_url(request)?;
        self.pace(&provider.id, provider.rate_limit_per_min).await;

        info!("Fetching feed for provider '{}' from {}", provider.id, url);
        let builder = self.client.get(url).timeout(provider.timeout());
        let resp = Self::authorize(builder, request)?
            .send()
            .await
            .map_err(|e| Error::upstream(&provider.id, e.to_string()))?;
        Self::classify_status(&provider.id, resp.status())?;

        match provider.feed_format {
            FeedFormat::Json => {
                let batch: FetchBatch = resp.json().await.map_err(|e| {
                    if e.is_decode() {
                        Error::validation(format!("provider '{}': malformed feed: {}", provider.id, e))
                    } else {
                        Error::upstream(&provider.id, e.to_string())
                    }
                })?;
                debug!(
                    "Parsed {} records from '{}' (complete: {})",
                    batch.records.len(),
                    provider.id,
                    batch.complete
                );
                Ok(batch)
            }
            FeedFormat::Lines => {
                let next_token = resp
                    .headers()
                    .get("x-next-token")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let stream = resp
                    .bytes_stream()
                    .map(|result| result.map_err(std::io::Error::other));
                let reader = StreamReader::new(stream);
                let mut lines = BufReader::new(reader).lines();
                let mut records = Vec::new();

                while let Some(line) = lines
                    .next_line()
                    .await
                    .map_err(|e| Error::upstream(&provider.id, e.to_string()))?
                {
                    if let Some(record) = Self::parse_line(&line) {
                        records.push(record);
                    }
                }

                debug!("Parsed {} records from '{}'", records.len(), provider.id);
                Ok(FetchBatch {
                    records,
                    next_token,
                    complete: true,
                })
            }
        }
    }
}
