//! Commodity name normalization: the external lookup contract, an HTTP lookup against
//! the Gemini `generateContent` API, call pacing, and the cache-first mapper.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mandi_storage::CommodityNameCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-pro";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("lookup request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("lookup returned http status {status}")]
    HttpStatus { status: u16 },
    #[error("lookup returned no usable name")]
    Empty,
}

/// Maps a base commodity label to its common English name.
#[async_trait]
pub trait NameNormalizer: Send + Sync {
    fn id(&self) -> &'static str;

    async fn canonical_name(&self, label: &str) -> Result<String, NormalizeError>;
}

/// Uses the base label itself as the canonical name.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughNormalizer;

#[async_trait]
impl NameNormalizer for PassthroughNormalizer {
    fn id(&self) -> &'static str {
        "passthrough"
    }

    async fn canonical_name(&self, label: &str) -> Result<String, NormalizeError> {
        Ok(label.to_string())
    }
}

impl NormalizeError {
    /// Throttling, server errors, timeouts and refused connections are worth another try.
    pub fn is_transient(&self) -> bool {
        match self {
            NormalizeError::Request(err) => err.is_timeout() || err.is_connect(),
            NormalizeError::HttpStatus { status } => *status == 429 || (500..600).contains(status),
            NormalizeError::Empty => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub first_pause: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            first_pause: Duration::from_millis(500),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Pause before retry number `retry` (zero-based), or `None` once retries are spent.
    pub fn pause_before(&self, retry: u32) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        let doubled = self.first_pause.saturating_mul(2u32.saturating_pow(retry));
        Some(doubled.min(self.ceiling))
    }
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub endpoint: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            endpoint: DEFAULT_GEMINI_ENDPOINT.to_string(),
            timeout: Duration::from_secs(20),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: [RequestContent<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: [RequestPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    fn first_text(&self) -> Option<&str> {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
            .find_map(|p| p.text.as_deref())
    }
}

pub fn lookup_prompt(label: &str) -> String {
    format!(
        "Translate the Indian agricultural commodity name '{label}' into its most common English name used in India. \
         Do not include local names, Hindi, or brackets. Just return the common English name."
    )
}

/// First non-empty line of a model answer without quoting, emphasis or a trailing period.
pub fn clean_model_answer(answer: &str) -> Option<String> {
    let line = answer.lines().map(str::trim).find(|l| !l.is_empty())?;
    let cleaned = line
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '*' | '`'))
        .trim_end_matches('.')
        .trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[derive(Debug)]
pub struct GeminiNormalizer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl GeminiNormalizer {
    pub fn new(config: GeminiConfig) -> Result<Self, NormalizeError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        let url = format!(
            "{}/models/{}:generateContent",
            config.endpoint.trim_end_matches('/'),
            config.model
        );
        Ok(Self {
            client,
            url,
            api_key: config.api_key,
            retry: config.retry,
        })
    }

    async fn generate(&self, prompt: &str) -> Result<GenerateContentResponse, NormalizeError> {
        let body = GenerateContentRequest {
            contents: [RequestContent {
                parts: [RequestPart { text: prompt }],
            }],
        };

        let mut retry = 0;
        loop {
            let err = match self.send_once(&body).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            match self.retry.pause_before(retry) {
                Some(pause) if err.is_transient() => {
                    debug!(retry, ?pause, error = %err, "retrying name lookup");
                    tokio::time::sleep(pause).await;
                    retry += 1;
                }
                _ => return Err(err),
            }
        }
    }

    async fn send_once(
        &self,
        body: &GenerateContentRequest<'_>,
    ) -> Result<GenerateContentResponse, NormalizeError> {
        let resp = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NormalizeError::HttpStatus {
                status: status.as_u16(),
            });
        }
        Ok(resp.json::<GenerateContentResponse>().await?)
    }
}

#[async_trait]
impl NameNormalizer for GeminiNormalizer {
    fn id(&self) -> &'static str {
        "gemini"
    }

    async fn canonical_name(&self, label: &str) -> Result<String, NormalizeError> {
        let response = self.generate(&lookup_prompt(label)).await?;
        response
            .first_text()
            .and_then(clean_model_answer)
            .ok_or(NormalizeError::Empty)
    }
}

/// Enforces a fixed minimum delay between consecutive external calls.
#[derive(Debug)]
pub struct CallPacer {
    delay: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl CallPacer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_call: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(last) = *last_call {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MappingStats {
    pub cached: usize,
    pub looked_up: usize,
    pub fallbacks: usize,
}

/// Resolves base commodity labels to canonical names, consulting the cache before
/// the external normalizer. Fallbacks are used for the current batch only and are not
/// written to the cache.
pub struct CommodityNameMapper {
    normalizer: Arc<dyn NameNormalizer>,
    pacer: CallPacer,
}

impl CommodityNameMapper {
    pub fn new(normalizer: Arc<dyn NameNormalizer>, delay: Duration) -> Self {
        Self {
            normalizer,
            pacer: CallPacer::new(delay),
        }
    }

    pub fn normalizer_id(&self) -> &'static str {
        self.normalizer.id()
    }

    pub async fn canonical_names<I>(
        &self,
        cache: &mut CommodityNameCache,
        labels: I,
    ) -> (HashMap<String, String>, MappingStats)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let distinct = labels.into_iter().map(Into::into).collect::<BTreeSet<String>>();
        let mut names = HashMap::with_capacity(distinct.len());
        let mut stats = MappingStats::default();

        for label in distinct {
            if let Some(known) = cache.get(&label) {
                stats.cached += 1;
                names.insert(label.clone(), known.to_string());
                continue;
            }

            self.pacer.wait_turn().await;
            match self.normalizer.canonical_name(&label).await {
                Ok(canonical) => {
                    stats.looked_up += 1;
                    debug!(label = %label, canonical = %canonical, normalizer = self.normalizer.id(), "commodity name resolved");
                    cache.insert_if_absent(label.clone(), canonical.clone());
                    names.insert(label, canonical);
                }
                Err(err) => {
                    stats.fallbacks += 1;
                    warn!(label = %label, error = %err, "commodity name lookup failed; using base label");
                    names.insert(label.clone(), label);
                }
            }
        }

        (names, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct ScriptedNormalizer {
        answers: HashMap<&'static str, &'static str>,
        calls: AtomicUsize,
    }

    impl ScriptedNormalizer {
        fn new(answers: &[(&'static str, &'static str)]) -> Self {
            Self {
                answers: answers.iter().copied().collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NameNormalizer for ScriptedNormalizer {
        fn id(&self) -> &'static str {
            "scripted"
        }

        async fn canonical_name(&self, label: &str) -> Result<String, NormalizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .get(label)
                .map(|s| s.to_string())
                .ok_or(NormalizeError::Empty)
        }
    }

    #[test]
    fn default_retry_policy_doubles_twice_then_gives_up() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.pause_before(0), Some(Duration::from_millis(500)));
        assert_eq!(policy.pause_before(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.pause_before(2), None);

        let long = RetryPolicy {
            retries: 10,
            ..RetryPolicy::default()
        };
        assert_eq!(long.pause_before(9), Some(Duration::from_secs(5)));
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(NormalizeError::HttpStatus { status: 429 }.is_transient());
        assert!(NormalizeError::HttpStatus { status: 503 }.is_transient());
        assert!(!NormalizeError::HttpStatus { status: 403 }.is_transient());
        assert!(!NormalizeError::Empty.is_transient());
    }

    #[test]
    fn model_answers_are_reduced_to_a_bare_name() {
        assert_eq!(clean_model_answer("  **Okra**.\n\nAlso called bhindi"), Some("Okra".into()));
        assert_eq!(clean_model_answer("\"Pigeon Pea\""), Some("Pigeon Pea".into()));
        assert_eq!(clean_model_answer("\n  \n"), None);
    }

    #[test]
    fn response_text_is_taken_from_first_candidate_part() {
        let response: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Okra\n"}],"role":"model"}}]}"#,
        )
        .unwrap();
        assert_eq!(response.first_text(), Some("Okra\n"));

        let empty: GenerateContentResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.first_text(), None);
    }

    #[test]
    fn prompt_names_the_label() {
        assert!(lookup_prompt("Bhindi").contains("'Bhindi'"));
    }

    #[tokio::test]
    async fn mapper_prefers_cache_and_does_not_persist_fallbacks() {
        let dir = tempdir().expect("tempdir");
        let mut cache = CommodityNameCache::load(dir.path().join("names.json")).await.unwrap();
        cache.insert_if_absent("Arhar", "Pigeon Pea");

        let normalizer = Arc::new(ScriptedNormalizer::new(&[("Bhindi", "Okra"), ("Arhar", "Toor")]));
        let mapper = CommodityNameMapper::new(normalizer.clone(), Duration::ZERO);

        let (names, stats) = mapper
            .canonical_names(&mut cache, ["Arhar", "Bhindi", "Bhindi", "Kulthi"])
            .await;

        assert_eq!(names["Arhar"], "Pigeon Pea");
        assert_eq!(names["Bhindi"], "Okra");
        assert_eq!(names["Kulthi"], "Kulthi");
        assert_eq!(
            stats,
            MappingStats {
                cached: 1,
                looked_up: 1,
                fallbacks: 1
            }
        );
        assert_eq!(normalizer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get("Bhindi"), Some("Okra"));
        assert_eq!(cache.get("Kulthi"), None);

        let (_, again) = mapper.canonical_names(&mut cache, ["Bhindi"]).await;
        assert_eq!(again.cached, 1);
        assert_eq!(normalizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_consecutive_calls() {
        let pacer = CallPacer::new(Duration::from_secs(1));
        let start = Instant::now();
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn passthrough_returns_the_label() {
        let name = PassthroughNormalizer.canonical_name("Tomato").await.unwrap();
        assert_eq!(name, "Tomato");
    }
}
