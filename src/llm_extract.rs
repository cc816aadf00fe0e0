// src/llm_extract.rs

use crate::cache::JsonCache;
use crate::config::{LlmBackend, LlmSection};
use crate::error::BoxError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const SUMMARY_PROMPT: &str = "You are an expert editorial assistant. Your task is to analyze the \
provided text and generate a concise, professional summary. The summary should be two sentences \
long at most, capturing the main points and keeping an impersonal and objective tone. Use the \
passive voice. Start the summary directly with the main action or purpose of the \
proposal/application. Do not add any commentary, just provide the summary. Do not use any em \
dashes or other complicated formatting, in fact remove any extraneous formatting or punctuation, \
return a cleanly edited text. You are a professional providing a summary of the technical text \
provided";

const ADDRESS_PROMPT: &str = "Extract the street address from the provided text. Return only the \
address. Do not include extra information, formatting, or conversational responses.";

/// Shorten a notice description. Implementations must be idempotent per `id`.
#[async_trait]
pub trait Summarize: Send + Sync {
    async fn summarize(&self, text: &str, id: &str) -> Result<String, BoxError>;
}

/// Pull a street address out of free text (e.g. an email subject line).
#[async_trait]
pub trait ExtractAddress: Send + Sync {
    async fn extract_address(&self, text: &str, id: &str) -> Result<String, BoxError>;
}

/// One system + user prompt round trip to a language model.
#[async_trait]
pub trait Complete: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, BoxError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatEndpoint {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl ChatEndpoint {
    /// Resolve the configured backend; `None` when LLM calls are disabled.
    pub async fn from_config(llm: &LlmSection) -> Result<Option<Self>, BoxError> {
        let client = Client::new();
        let endpoint = match llm.backend {
            LlmBackend::None => {
                info!("LLM backend disabled, descriptions are not summarized");
                return Ok(None);
            }
            LlmBackend::Ollama => {
                info!(url = %llm.ollama.base_url, model = %llm.ollama.model, "Using Ollama (local) backend");
                if !check_ollama_health(&client, &llm.ollama.base_url).await {
                    return Err(format!(
                        "Ollama is not running at {}. Start it with: ollama serve",
                        llm.ollama.base_url
                    )
                    .into());
                }
                Self {
                    client,
                    base_url: llm.ollama.base_url.clone(),
                    model: llm.ollama.model.clone(),
                    api_key: "ollama".to_string(), // required by API but ignored
                }
            }
            LlmBackend::Remote => {
                let api_key = std::env::var(&llm.remote.api_key_env).map_err(|_| {
                    format!("{} env var required for remote backend", llm.remote.api_key_env)
                })?;
                info!(url = %llm.remote.base_url, model = %llm.remote.model, "Using remote API backend");
                Self {
                    client,
                    base_url: llm.remote.base_url.clone(),
                    model: llm.remote.model.clone(),
                    api_key,
                }
            }
        };
        Ok(Some(endpoint))
    }
}

/// Check if the Ollama server is reachable.
async fn check_ollama_health(client: &Client, base_url: &str) -> bool {
    // Ollama's health endpoint is at the root (not under /v1)
    let health_url = base_url.trim_end_matches('/').trim_end_matches("/v1");

    match client
        .get(health_url)
        .timeout(std::time::Duration::from_secs(3))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) => {
            warn!(status = %resp.status(), "Ollama server returned non-OK status");
            false
        }
        Err(e) => {
            warn!(error = %e, "Ollama server not reachable");
            false
        }
    }
}

#[async_trait]
impl Complete for ChatEndpoint {
    async fn complete(&self, system: &str, user: &str) -> Result<String, BoxError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: 0.0,
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("LLM API error {status}: {body}").into());
        }

        let chat_response: ChatResponse = response.json().await?;
        let content = chat_response
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or("Empty response from LLM")?;

        Ok(strip_reasoning(content).to_string())
    }
}

/// Drop markdown fences and `<think>` blocks some models emit anyway.
fn strip_reasoning(content: &str) -> &str {
    let content = match content.rfind("</think>") {
        Some(end) => &content[end + "</think>".len()..],
        None => content,
    };
    content
        .trim()
        .trim_start_matches("```text")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Look `id` up in `cache`, otherwise ask the model once and remember the answer.
async fn cached_completion(
    completion: &dyn Complete,
    cache: &JsonCache,
    system: &str,
    user: &str,
    id: &str,
) -> Result<String, BoxError> {
    if let Some(hit) = cache.get(id) {
        return Ok(hit);
    }

    let answer = completion.complete(system, user).await?.trim().to_string();
    if let Err(e) = cache.insert(id, &answer) {
        warn!(id = %id, cache = %cache.path().display(), error = %e, "Could not persist cache entry");
    }
    Ok(answer)
}

/// Description summarizer memoized in `summaries.json`.
pub struct Summarizer {
    completion: Option<Arc<dyn Complete>>,
    cache: JsonCache,
}

impl Summarizer {
    /// Without a completion backend the cleaned text is returned unchanged.
    pub fn new(completion: Option<Arc<dyn Complete>>, cache: JsonCache) -> Self {
        Self { completion, cache }
    }
}

#[async_trait]
impl Summarize for Summarizer {
    async fn summarize(&self, text: &str, id: &str) -> Result<String, BoxError> {
        let Some(completion) = &self.completion else {
            return Ok(text.to_string());
        };
        let user = format!("Please summarize the following text:\n\n---\n{text}\n---");
        cached_completion(completion.as_ref(), &self.cache, SUMMARY_PROMPT, &user, id).await
    }
}

/// Street-address extractor memoized in `addresses.json`.
pub struct AddressExtractor {
    completion: Option<Arc<dyn Complete>>,
    cache: JsonCache,
}

impl AddressExtractor {
    pub fn new(completion: Option<Arc<dyn Complete>>, cache: JsonCache) -> Self {
        Self { completion, cache }
    }
}

#[async_trait]
impl ExtractAddress for AddressExtractor {
    async fn extract_address(&self, text: &str, id: &str) -> Result<String, BoxError> {
        let Some(completion) = &self.completion else {
            return Ok(String::new());
        };
        let user = format!(
            "Please extract the street address - if no address exists, return absolutely \
             nothing - from the following text:\n\n---\n{text}\n---"
        );
        cached_completion(completion.as_ref(), &self.cache, ADDRESS_PROMPT, &user, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Complete for Counting {
        async fn complete(&self, system: &str, user: &str) -> Result<String, BoxError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(!system.is_empty());
            Ok(format!("  answer {n} for {} chars \n", user.len()))
        }
    }

    struct Offline;

    #[async_trait]
    impl Complete for Offline {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, BoxError> {
            Err("connection refused".into())
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_summary_is_computed_once_per_id() {
        let dir = tempfile::tempdir().unwrap();
        let backend = counting();
        let summarizer = Summarizer::new(
            Some(backend.clone()),
            JsonCache::new(dir.path().join("summaries.json")),
        );

        let first = summarizer.summarize("Rezoning of erf 12", "email-1").await.unwrap();
        let second = summarizer.summarize("different text", "email-1").await.unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("answer 0"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        summarizer.summarize("Rezoning of erf 12", "email-2").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_address_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addresses.json");
        let backend = counting();

        let extractor = AddressExtractor::new(Some(backend.clone()), JsonCache::new(&path));
        let first = extractor.extract_address("Erf 1 at 3 Bree Street", "s-1").await.unwrap();

        let restarted = AddressExtractor::new(Some(backend.clone()), JsonCache::new(&path));
        let second = restarted.extract_address("Erf 1 at 3 Bree Street", "s-1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = JsonCache::new(dir.path().join("summaries.json"));
        let summarizer = Summarizer::new(Some(Arc::new(Offline)), cache.clone());

        assert!(summarizer.summarize("text", "email-9").await.is_err());
        assert_eq!(cache.get("email-9"), None);
    }

    #[tokio::test]
    async fn test_disabled_backend() {
        let dir = tempfile::tempdir().unwrap();
        let cache = JsonCache::new(dir.path().join("summaries.json"));

        let summarizer = Summarizer::new(None, cache.clone());
        assert_eq!(summarizer.summarize("as is", "id").await.unwrap(), "as is");
        let extractor = AddressExtractor::new(None, cache.clone());
        assert_eq!(extractor.extract_address("1 Long St", "id").await.unwrap(), "");
        assert!(!cache.path().exists());
    }

    #[test]
    fn test_strip_reasoning() {
        assert_eq!(strip_reasoning("<think>hmm</think>\n Summary. "), "Summary.");
        assert_eq!(strip_reasoning("```\nSummary.\n```"), "Summary.");
    }
}
