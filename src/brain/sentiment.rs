//! # brain::sentiment — ดึง market sentiment ให้ AI ประกอบการตัดสินใจ
//!
//! Optional feed: when `SENTIMENT_API_URL` is unset the prompt simply says
//! there is no sentiment data. The feed is read once per cycle and a failure
//! never blocks the cycle.
//!
//! ```text
//! POST {url}  { endpoints: [CO-A-02-01, CO-A-02-02], last 4h, 15m buckets }
//!     │
//!     ▼
//! data[0].timePeriods ─▶ first bucket with both values ─▶ SentimentReading
//!     │ (no usable bucket for the symbol's token)
//!     ▼
//! retry once with the fallback token (BTC), marked as a reference reading
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Env;
use crate::error::SentimentError;

const POSITIVE: &str = "CO-A-02-01";
const NEGATIVE: &str = "CO-A-02-02";
const FEED_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const LOOKBACK_HOURS: i64 = 4;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SentimentConfig {
    pub url:            String,
    pub api_key:        String,
    pub timeout:        Duration,
    /// Token asked for when the symbol's own token has no usable bucket
    pub fallback_token: String,
}

impl std::fmt::Debug for SentimentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentimentConfig")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .field("fallback_token", &self.fallback_token)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl SentimentConfig {
    /// `None` when the feed is not configured.
    pub fn from_env(env: &Env) -> anyhow::Result<Option<Self>> {
        let Some(url) = env.get("SENTIMENT_API_URL") else {
            return Ok(None);
        };
        let Some(api_key) = env.get("SENTIMENT_API_KEY") else {
            anyhow::bail!("SENTIMENT_API_KEY is required when SENTIMENT_API_URL is set");
        };
        Ok(Some(Self {
            url,
            api_key,
            timeout:        env.secs_or("SENTIMENT_TIMEOUT_SECS", 10)?,
            fallback_token: env.string_or("SENTIMENT_FALLBACK_TOKEN", "BTC").to_ascii_uppercase(),
        }))
    }
}

// ─── Reading ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading {
    pub token:          String,
    pub positive_ratio: f64,
    pub negative_ratio: f64,
    pub net_sentiment:  f64,
    pub data_time:      DateTime<Utc>,
    pub delay_minutes:  i64,
    /// Read for the fallback token, not the symbol's own
    pub reference:      bool,
}

/// `BTC-USDT-SWAP` → `BTC`
pub fn token_of(symbol: &str) -> &str {
    symbol.split('-').next().unwrap_or(symbol)
}

#[async_trait]
pub trait Sentiment: Send + Sync {
    /// `Ok(None)` when the feed answered but had no usable bucket.
    async fn reading(&self, token: &str) -> Result<Option<SentimentReading>, SentimentError>;

    fn fallback_token(&self) -> &str;
}

/// Reading for `symbol`, falling back to the reference token. Errors are
/// logged and turned into `None`.
pub async fn read_for(source: &dyn Sentiment, symbol: &str) -> Option<SentimentReading> {
    let token = token_of(symbol);
    match source.reading(token).await {
        Ok(Some(r)) => return Some(r),
        Ok(None) => debug!(%symbol, token, "📭 No sentiment bucket for token"),
        Err(e) => warn!(%symbol, token, error = %e, "⚠️ Sentiment read failed"),
    }

    let fallback = source.fallback_token();
    if fallback.eq_ignore_ascii_case(token) {
        return None;
    }
    match source.reading(fallback).await {
        Ok(r) => r.map(|r| SentimentReading { reference: true, ..r }),
        Err(e) => {
            warn!(%symbol, token = fallback, error = %e, "⚠️ Fallback sentiment read failed");
            None
        }
    }
}

// ─── HTTP feed ────────────────────────────────────────────────────────────────

pub struct HttpSentiment {
    http:   reqwest::Client,
    config: SentimentConfig,
}

impl HttpSentiment {
    pub fn new(http: reqwest::Client, config: SentimentConfig) -> Self {
        Self { http, config }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedRequest<'a> {
    api_key:    &'a str,
    endpoints:  [&'a str; 2],
    start_time: String,
    end_time:   String,
    time_type:  &'a str,
    token:      [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    code: i64,
    #[serde(default)]
    data: Vec<FeedToken>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedToken {
    #[serde(default)]
    time_periods: Vec<FeedPeriod>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedPeriod {
    start_time: String,
    #[serde(default)]
    data:       Vec<FeedValue>,
}

#[derive(Debug, Deserialize)]
struct FeedValue {
    endpoint: String,
    #[serde(default)]
    value:    String,
}

#[async_trait]
impl Sentiment for HttpSentiment {
    async fn reading(&self, token: &str) -> Result<Option<SentimentReading>, SentimentError> {
        let now  = Utc::now();
        let body = FeedRequest {
            api_key:    &self.config.api_key,
            endpoints:  [POSITIVE, NEGATIVE],
            start_time: (now - chrono::Duration::hours(LOOKBACK_HOURS)).format(FEED_TIME_FORMAT).to_string(),
            end_time:   now.format(FEED_TIME_FORMAT).to_string(),
            time_type:  "15m",
            token:      [token],
        };

        debug!(token, "Calling sentiment feed...");

        let resp = self
            .http
            .post(&self.config.url)
            .header("X-API-KEY", &self.config.api_key)
            .json(&body)
            .timeout(self.config.timeout)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body   = resp.text().await.unwrap_or_default();
            return Err(SentimentError::Api { status, body });
        }

        let feed: FeedResponse = resp.json().await?;
        interpret(token, feed, now)
    }

    fn fallback_token(&self) -> &str {
        &self.config.fallback_token
    }
}

/// First bucket where both ratios parse wins. Feed times are UTC.
fn interpret(
    token: &str,
    feed:  FeedResponse,
    now:   DateTime<Utc>,
) -> Result<Option<SentimentReading>, SentimentError> {
    if feed.code != 200 {
        return Err(SentimentError::Feed(feed.code));
    }
    let Some(first) = feed.data.into_iter().next() else {
        return Ok(None);
    };

    for period in first.time_periods {
        let value_of = |endpoint: &str| {
            period
                .data
                .iter()
                .find(|v| v.endpoint == endpoint)
                .and_then(|v| v.value.trim().parse::<f64>().ok())
        };
        let (Some(positive), Some(negative)) = (value_of(POSITIVE), value_of(NEGATIVE)) else {
            continue;
        };
        let Ok(at) = NaiveDateTime::parse_from_str(&period.start_time, FEED_TIME_FORMAT) else {
            continue;
        };
        let data_time = at.and_utc();

        return Ok(Some(SentimentReading {
            token:          token.to_string(),
            positive_ratio: positive,
            negative_ratio: negative,
            net_sentiment:  positive - negative,
            data_time,
            delay_minutes:  (now - data_time).num_minutes(),
            reference:      false,
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn feed(json: &str) -> FeedResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn first_complete_bucket_wins() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 40, 0).unwrap();
        let f = feed(r#"{
            "code": 200,
            "data": [{ "timePeriods": [
                { "startTime": "2024-05-01 12:30:00", "data": [
                    { "endpoint": "CO-A-02-01", "value": "" },
                    { "endpoint": "CO-A-02-02", "value": "0.31" } ] },
                { "startTime": "2024-05-01 12:15:00", "data": [
                    { "endpoint": "CO-A-02-01", "value": " 0.62 " },
                    { "endpoint": "CO-A-02-02", "value": "0.28" } ] }
            ]}]
        }"#);

        let r = interpret("ETH", f, now).unwrap().unwrap();
        assert_eq!(r.token, "ETH");
        assert!((r.positive_ratio - 0.62).abs() < 1e-12);
        assert!((r.net_sentiment - 0.34).abs() < 1e-9);
        assert_eq!(r.delay_minutes, 25);
        assert!(!r.reference);
    }

    #[test]
    fn empty_buckets_mean_no_reading() {
        let f = feed(r#"{ "code": 200, "data": [{ "timePeriods": [
            { "startTime": "2024-05-01 12:30:00", "data": [] } ] }] }"#);
        assert_eq!(interpret("SOL", f, Utc::now()).unwrap(), None);

        let f = feed(r#"{ "code": 200, "data": [] }"#);
        assert_eq!(interpret("SOL", f, Utc::now()).unwrap(), None);
    }

    #[test]
    fn non_200_feed_code_is_an_error() {
        let f = feed(r#"{ "code": 401 }"#);
        assert!(matches!(interpret("BTC", f, Utc::now()), Err(SentimentError::Feed(401))));
    }

    #[test]
    fn token_comes_from_the_instrument_id() {
        assert_eq!(token_of("ETH-USDT-SWAP"), "ETH");
        assert_eq!(token_of("BTC"), "BTC");
    }

    #[test]
    fn config_is_optional_but_needs_a_key_when_set() {
        assert!(SentimentConfig::from_env(&Env::from_pairs(&[])).unwrap().is_none());
        assert!(SentimentConfig::from_env(&Env::from_pairs(&[("SENTIMENT_API_URL", "http://feed")])).is_err());

        let cfg = SentimentConfig::from_env(&Env::from_pairs(&[
            ("SENTIMENT_API_URL", "http://feed"),
            ("SENTIMENT_API_KEY", "k"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(cfg.fallback_token, "BTC");
        assert_eq!(cfg.timeout, Duration::from_secs(10));
    }

    // ── Fallback ──────────────────────────────────────────────────────────────

    struct Scripted {
        asked:   Mutex<Vec<String>>,
        answers: Mutex<Vec<Result<Option<SentimentReading>, SentimentError>>>,
    }

    #[async_trait]
    impl Sentiment for Scripted {
        async fn reading(&self, token: &str) -> Result<Option<SentimentReading>, SentimentError> {
            self.asked.lock().unwrap().push(token.to_string());
            self.answers.lock().unwrap().remove(0)
        }

        fn fallback_token(&self) -> &str {
            "BTC"
        }
    }

    fn reading(token: &str) -> SentimentReading {
        SentimentReading {
            token:          token.into(),
            positive_ratio: 0.5,
            negative_ratio: 0.3,
            net_sentiment:  0.2,
            data_time:      Utc::now(),
            delay_minutes:  10,
            reference:      false,
        }
    }

    #[tokio::test]
    async fn missing_token_falls_back_to_reference() {
        let src = Scripted {
            asked:   Mutex::new(vec![]),
            answers: Mutex::new(vec![Err(SentimentError::Feed(500)), Ok(Some(reading("BTC")))]),
        };
        let r = read_for(&src, "DOGE-USDT-SWAP").await.unwrap();
        assert!(r.reference);
        assert_eq!(r.token, "BTC");
        assert_eq!(*src.asked.lock().unwrap(), vec!["DOGE".to_string(), "BTC".to_string()]);
    }

    #[tokio::test]
    async fn fallback_token_is_not_asked_twice() {
        let src = Scripted {
            asked:   Mutex::new(vec![]),
            answers: Mutex::new(vec![Ok(None)]),
        };
        assert_eq!(read_for(&src, "BTC-USDT-SWAP").await, None);
        assert_eq!(src.asked.lock().unwrap().len(), 1);
    }
}
