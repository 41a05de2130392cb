//! Text encoding and generation backends.
//!
//! Talks to an OpenAI-compatible API for embeddings and chat completions.
//! All external calls carry a 30 s timeout and up to 3 exponential-backoff
//! retries. [`HashingEncoder`] is a deterministic offline fallback used by
//! the test suite and air-gapped deployments.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::MemoryError;

const ENCODER_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: usize = 3;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 256,
        }
    }
}

/// External encoder/generator capability. Production injects the HTTP
/// client; tests substitute [`HashingEncoder`].
#[async_trait]
pub trait TextEncoder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError>;

    /// One-shot text generation, used for cluster summaries.
    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String, MemoryError>;
}

// ---------------------------------------------------------------------------
// HTTP encoder (OpenAI-compatible wire format)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EncoderConfig {
    pub embed_url: String,
    pub embed_model: String,
    pub chat_url: String,
    pub chat_model: String,
    pub api_key: String,
}

impl EncoderConfig {
    /// Returns `None` if `STRATA_EMBED_URL` is not set.
    pub fn from_env() -> Option<Self> {
        let embed_url = std::env::var("STRATA_EMBED_URL").ok()?;
        let chat_url = std::env::var("STRATA_CHAT_URL").unwrap_or_else(|_| {
            if embed_url.contains("/embeddings") {
                embed_url.replace("/embeddings", "/chat/completions")
            } else {
                format!("{}/chat/completions", embed_url.trim_end_matches('/'))
            }
        });
        Some(Self {
            embed_url,
            embed_model: std::env::var("STRATA_EMBED_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".into()),
            chat_url,
            chat_model: std::env::var("STRATA_CHAT_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".into()),
            api_key: std::env::var("STRATA_API_KEY").unwrap_or_default(),
        })
    }
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct HttpEncoder {
    cfg: EncoderConfig,
    client: reqwest::Client,
}

impl HttpEncoder {
    pub fn new(cfg: EncoderConfig) -> Result<Self, MemoryError> {
        let client = reqwest::Client::builder()
            .timeout(ENCODER_TIMEOUT)
            .build()
            .map_err(|e| MemoryError::Encoder(format!("http client: {e}")))?;
        Ok(Self { cfg, client })
    }

    fn retry_policy() -> ExponentialBuilder {
        // 1 s, 2 s, 4 s between attempts.
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_times(MAX_RETRIES)
    }

    async fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        let req = EmbedRequest {
            model: self.cfg.embed_model.clone(),
            input: texts.to_vec(),
        };
        let mut builder = self.client.post(&self.cfg.embed_url).json(&req);
        if !self.cfg.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.cfg.api_key));
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| MemoryError::Encoder(format!("embedding request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(MemoryError::Encoder(format!(
                "embedding API returned {status}: {body}"
            )));
        }
        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| MemoryError::Encoder(format!("embedding response parse failed: {e}")))?;
        let embeddings: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        if embeddings.len() != texts.len() {
            return Err(MemoryError::Encoder(format!(
                "embedding count mismatch: sent {} texts, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }
}

#[async_trait]
impl TextEncoder for HttpEncoder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let out = self.embed_batch(&[text.to_string()]).await?;
        out.into_iter()
            .next()
            .ok_or_else(|| MemoryError::Encoder("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        (|| self.embed_once(texts))
            .retry(Self::retry_policy())
            .when(MemoryError::is_retryable)
            .notify(|err, dur| {
                warn!(error = %err, retry_after = ?dur, "embedding call failed, retrying");
            })
            .await
    }

    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String, MemoryError> {
        let call = || async {
            let req = ChatRequest {
                model: self.cfg.chat_model.clone(),
                messages: vec![ChatMessage {
                    role: "user".into(),
                    content: prompt.to_string(),
                }],
                temperature: opts.temperature,
                max_tokens: opts.max_tokens,
            };
            let mut builder = self.client.post(&self.cfg.chat_url).json(&req);
            if !self.cfg.api_key.is_empty() {
                builder = builder.header("Authorization", format!("Bearer {}", self.cfg.api_key));
            }
            let resp = builder
                .send()
                .await
                .map_err(|e| MemoryError::Encoder(format!("generation request failed: {e}")))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(MemoryError::Encoder(format!(
                    "generation API returned {status}: {body}"
                )));
            }
            let parsed: ChatResponse = resp.json().await.map_err(|e| {
                MemoryError::Encoder(format!("generation response parse failed: {e}"))
            })?;
            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| MemoryError::Encoder("empty generation response".into()))
        };
        call.retry(Self::retry_policy())
            .when(MemoryError::is_retryable)
            .notify(|err, dur| {
                warn!(error = %err, retry_after = ?dur, "generation call failed, retrying");
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Query embedding cache
// ---------------------------------------------------------------------------

/// LRU cache for query embeddings: repeated searches for the same text skip
/// the network round trip entirely.
pub struct EmbedCache {
    inner: Mutex<EmbedCacheInner>,
}

struct EmbedCacheInner {
    cache: LruCache<String, Vec<f32>>,
    hits: u64,
    misses: u64,
}

impl EmbedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(EmbedCacheInner {
                cache: LruCache::new(
                    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(128).unwrap()),
                ),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock();
        let val = inner.cache.get(key).cloned();
        if val.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        val
    }

    pub fn insert(&self, key: String, value: Vec<f32>) {
        self.inner.lock().cache.put(key, value);
    }

    pub fn clear(&self) {
        self.inner.lock().cache.clear();
    }

    /// (len, capacity, hits, misses)
    pub fn stats(&self) -> (usize, usize, u64, u64) {
        let inner = self.inner.lock();
        (
            inner.cache.len(),
            inner.cache.cap().get(),
            inner.hits,
            inner.misses,
        )
    }
}

// ---------------------------------------------------------------------------
// Deterministic offline encoder
// ---------------------------------------------------------------------------

/// Embeds text by hashing word unigrams and bigrams into a fixed-dimension
/// vector, L2-normalized. Identical texts embed identically; texts sharing
/// words land close together. Not a semantic model, but deterministic and
/// dependency-free, which is exactly what tests and offline mode need.
pub struct HashingEncoder {
    dim: usize,
    reply: Option<String>,
}

impl HashingEncoder {
    pub fn new(dim: usize) -> Self {
        Self { dim, reply: None }
    }

    /// Fix the `generate` output, for callers that need a known summary.
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    fn token_slot(&self, token: &str) -> (usize, f32) {
        // FNV-1a; the low bits pick the slot, one hash bit picks the sign.
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in token.as_bytes() {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        let slot = (hash % self.dim as u64) as usize;
        let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
        (slot, sign)
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        let words: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        for w in &words {
            let (slot, sign) = self.token_slot(w);
            v[slot] += sign;
        }
        for pair in words.windows(2) {
            let (slot, sign) = self.token_slot(&format!("{} {}", pair[0], pair[1]));
            v[slot] += sign * 0.5;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl TextEncoder for HashingEncoder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        if text.trim().is_empty() {
            return Err(MemoryError::EmptyText);
        }
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        texts
            .iter()
            .map(|t| {
                if t.trim().is_empty() {
                    Err(MemoryError::EmptyText)
                } else {
                    Ok(self.embed_sync(t))
                }
            })
            .collect()
    }

    async fn generate(&self, prompt: &str, _opts: &GenerateOptions) -> Result<String, MemoryError> {
        if let Some(ref reply) = self.reply {
            return Ok(reply.clone());
        }
        let summary: String = prompt.split_whitespace().take(12).collect::<Vec<_>>().join(" ");
        debug!(len = summary.len(), "offline summary generated");
        Ok(summary)
    }
}

/// Shared handle used throughout the engine.
pub type SharedEncoder = Arc<dyn TextEncoder>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashing_encoder_is_deterministic() {
        let enc = HashingEncoder::new(128);
        let a = enc.embed("Paris is the capital of France").await.unwrap();
        let b = enc.embed("Paris is the capital of France").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
    }

    #[tokio::test]
    async fn similar_texts_are_closer_than_unrelated() {
        let enc = HashingEncoder::new(256);
        let base = enc.embed("the capital of France is Paris").await.unwrap();
        let close = enc.embed("capital of France").await.unwrap();
        let far = enc.embed("quantum flux harmonics").await.unwrap();
        let sim_close = crate::codec::cosine_similarity(&base, &close).unwrap();
        let sim_far = crate::codec::cosine_similarity(&base, &far).unwrap();
        assert!(sim_close > sim_far, "{sim_close} vs {sim_far}");
    }

    #[tokio::test]
    async fn empty_text_rejected() {
        let enc = HashingEncoder::new(64);
        assert!(matches!(enc.embed("   ").await, Err(MemoryError::EmptyText)));
    }

    #[tokio::test]
    async fn fixed_reply_generation() {
        let enc = HashingEncoder::new(64).with_reply("SUMMARY");
        let out = enc
            .generate("summarize all of this", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "SUMMARY");
    }

    #[test]
    fn embed_cache_tracks_hits_and_misses() {
        let cache = EmbedCache::new(2);
        assert!(cache.get("q").is_none());
        cache.insert("q".into(), vec![1.0]);
        assert_eq!(cache.get("q"), Some(vec![1.0]));
        let (len, cap, hits, misses) = cache.stats();
        assert_eq!((len, cap, hits, misses), (1, 2, 1, 1));
    }
}
