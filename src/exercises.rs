//! Remote exercise lookups.

use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;

use crate::config::{ExerciseServiceConfig, RetryPolicy};
use crate::error::AssembleError;
use crate::formats::{Exercise, ExerciseSearch};

/// Anything that can answer an exercise search for an item code
/// (`tag:<code>` or `nickname:<nick>`).
#[async_trait]
pub trait ExerciseSource: Send + Sync {
    async fn search(&self, item_code: &str) -> anyhow::Result<ExerciseSearch>;
}

pub struct HttpExerciseSource {
    client: reqwest::Client,
    config: ExerciseServiceConfig,
}

impl HttpExerciseSource {
    pub fn new(config: ExerciseServiceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build exercise HTTP client")?;
        Ok(Self { client, config })
    }

    pub fn url_for(&self, item_code: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(item_code.as_bytes()).collect();
        self.config.url_template.replace("{itemCode}", &encoded)
    }

    async fn attempt(&self, url: &str) -> Result<ExerciseSearch, Attempt> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return Err(Attempt::Retry(err.to_string())),
        };
        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Attempt::Retry(format!("status {status}")));
        }
        let raw = match response.text().await {
            Ok(raw) => raw,
            Err(err) => return Err(Attempt::Retry(err.to_string())),
        };
        if !status.is_success() {
            return Err(Attempt::Fail(anyhow::anyhow!(
                "exercise service error ({status}) for {url}: {raw}"
            )));
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("parse exercise search from {url}"))
            .map_err(Attempt::Fail)
    }
}

enum Attempt {
    Retry(String),
    Fail(anyhow::Error),
}

#[async_trait]
impl ExerciseSource for HttpExerciseSource {
    async fn search(&self, item_code: &str) -> anyhow::Result<ExerciseSearch> {
        let url = self.url_for(item_code);
        let retry = &self.config.retry;
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            match self.attempt(&url).await {
                Ok(search) => return Ok(search),
                Err(Attempt::Fail(err)) => return Err(err),
                Err(Attempt::Retry(detail)) => {
                    let delay = backoff_delay(retry, attempt);
                    if started.elapsed() + delay > retry.max_elapsed {
                        return Err(AssembleError::TransientHttp { url, detail }.into());
                    }
                    tracing::warn!(
                        url = %url,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        detail = %detail,
                        "exercise fetch failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

/// Full jitter: uniform in `[0, min(max_delay, base_delay * 2^attempt)]`.
pub fn backoff_delay(retry: &RetryPolicy, attempt: u32) -> Duration {
    let exp = retry
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt.min(30)));
    let cap = exp.min(retry.max_delay);
    let fraction = (uuid::Uuid::new_v4().as_u128() as u64) as f64 / u64::MAX as f64;
    cap.mul_f64(fraction)
}

/// The single exercise of a search, `None` for no hits. More than one hit is an
/// error: an embed names exactly one exercise.
pub fn single_item(search: ExerciseSearch, item_code: &str) -> anyhow::Result<Option<Exercise>> {
    if search.total_count == 0 || search.items.is_empty() {
        return Ok(None);
    }
    let count = search.items.len();
    let mut items = search.items.into_iter();
    match (items.next(), count) {
        (Some(item), 1) => Ok(Some(item)),
        _ => anyhow::bail!("exercise search for `{item_code}` returned {count} items; expected one"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_under_the_cap() {
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            max_elapsed: Duration::from_secs(1),
        };
        for attempt in 0..40 {
            let delay = backoff_delay(&retry, attempt);
            let cap = Duration::from_millis(100 * 2u64.pow(attempt.min(3))).min(retry.max_delay);
            assert!(delay <= cap, "attempt {attempt}: {delay:?} > {cap:?}");
        }
    }

    #[test]
    fn url_template_takes_the_item_code() -> anyhow::Result<()> {
        let source = HttpExerciseSource::new(ExerciseServiceConfig {
            url_template: "http://localhost/api/exercises?q={itemCode}".to_owned(),
            ..ExerciseServiceConfig::default()
        })?;
        assert_eq!(
            source.url_for("tag:FOO"),
            "http://localhost/api/exercises?q=tag%3AFOO"
        );
        Ok(())
    }

    #[test]
    fn single_item_rules() -> anyhow::Result<()> {
        let item = |uid: &str| Exercise {
            uid: Some(uid.to_owned()),
            ..Exercise::default()
        };
        assert!(single_item(ExerciseSearch::default(), "tag:x")?.is_none());
        let one = single_item(
            ExerciseSearch {
                total_count: 1,
                items: vec![item("1@1")],
            },
            "tag:x",
        )?;
        assert_eq!(one.and_then(|e| e.uid), Some("1@1".to_owned()));
        assert!(
            single_item(
                ExerciseSearch {
                    total_count: 2,
                    items: vec![item("1@1"), item("2@1")],
                },
                "tag:x",
            )
            .is_err()
        );
        Ok(())
    }
}
