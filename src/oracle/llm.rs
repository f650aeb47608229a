//! LLM-backed [`RuleOracle`] using edgequake-llm providers.
//!
//! ## Retry Strategy
//!
//! Provider errors (429 / 503) and unparseable answers are both retried
//! with exponential backoff (`retry_backoff_ms * 2^(attempt-1)`): with the
//! 500 ms default and 3 retries the waits are 500 ms, 1 s and 2 s. The
//! per-call deadline is enforced by the [`super::Synthesizer`], not here.

use super::response::parse_proposal;
use super::{OracleError, ProposalRequest, RuleOracle, RuleProposal};
use crate::error::DoctreeError;
use crate::prompts::{proposal_request, DEFAULT_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::fmt;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Settings for [`LlmRuleOracle`].
#[derive(Clone)]
pub struct LlmOracleConfig {
    /// Model identifier. If None, uses `gpt-4.1-nano` for named providers.
    pub model: Option<String>,
    /// Provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,
    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,
    /// Default: 0.0. Rules should be reproducible.
    pub temperature: f32,
    /// Default: 2048.
    pub max_tokens: usize,
    /// Default: 3.
    pub max_retries: u32,
    /// Initial retry delay in milliseconds. Default: 500.
    pub retry_backoff_ms: u64,
    /// Custom system prompt. If None, uses [`DEFAULT_SYSTEM_PROMPT`].
    pub system_prompt: Option<String>,
}

impl Default for LlmOracleConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 2048,
            max_retries: 3,
            retry_backoff_ms: 500,
            system_prompt: None,
        }
    }
}

impl fmt::Debug for LlmOracleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmOracleConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish()
    }
}

/// Proposes rules by prompting a chat model.
pub struct LlmRuleOracle {
    provider: Arc<dyn LLMProvider>,
    config: LlmOracleConfig,
}

impl LlmRuleOracle {
    pub fn new(provider: Arc<dyn LLMProvider>, config: LlmOracleConfig) -> Self {
        Self { provider, config }
    }

    /// Build an oracle, resolving the provider from `config` and the environment.
    pub fn from_config(config: LlmOracleConfig) -> Result<Self, DoctreeError> {
        let provider = resolve_provider(&config)?;
        Ok(Self::new(provider, config))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RuleOracle for LlmRuleOracle {
    async fn propose(&self, request: &ProposalRequest) -> Result<RuleProposal, OracleError> {
        let system_prompt = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let user = proposal_request(request);
        let messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(&user)];
        let options = self.options();

        let mut last_err = String::from("no attempt made");
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = self.config.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Oracle for {}: retry {}/{} after {}ms",
                    request.unit.kind, attempt, self.config.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "Oracle: {} input tokens, {} output tokens",
                        response.prompt_tokens, response.completion_tokens
                    );
                    match parse_proposal(&response.content) {
                        Ok(proposal) => return Ok(proposal),
                        Err(e) => {
                            warn!("Oracle attempt {} unusable: {}", attempt + 1, e);
                            last_err = e.to_string();
                        }
                    }
                }
                Err(e) => {
                    warn!("Oracle attempt {} failed: {}", attempt + 1, e);
                    last_err = OracleError::Provider(e.to_string()).to_string();
                }
            }
        }

        Err(OracleError::Exhausted {
            attempts: self.config.max_retries + 1,
            last: last_err,
        })
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, DoctreeError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        DoctreeError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider + model** (`config.provider_name`).
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`),
///    honoured before auto-detection so the model choice sticks when several
///    API keys are present.
/// 4. **OpenAI** when `OPENAI_API_KEY` is set.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &LlmOracleConfig) -> Result<Arc<dyn LLMProvider>, DoctreeError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| DoctreeError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::UnitFeatures;
    use crate::rules::tests::unit;
    use crate::schema::tests::fixture;
    use edgequake_llm::{ChatRole, LLMResponse, LlmError};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const VALID: &str = r#"{"description": "Captions are paragraphs",
        "predicate": {"kind": "caption"}, "action": {"target": "paragraph"}}"#;

    /// Answers from a fixed queue and records every conversation it was sent.
    #[derive(Default)]
    struct Scripted {
        answers: Mutex<VecDeque<Result<String, String>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl Scripted {
        fn new<I: IntoIterator<Item = Result<&'static str, &'static str>>>(answers: I) -> Arc<Self> {
            let answers = answers
                .into_iter()
                .map(|a| a.map(str::to_string).map_err(str::to_string))
                .collect();
            Arc::new(Self {
                answers: Mutex::new(answers),
                seen: Mutex::default(),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LLMProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted-1"
        }

        fn max_context_length(&self) -> usize {
            8192
        }

        async fn complete(&self, prompt: &str) -> edgequake_llm::Result<LLMResponse> {
            self.chat(&[ChatMessage::user(prompt)], None).await
        }

        async fn complete_with_options(
            &self,
            prompt: &str,
            options: &CompletionOptions,
        ) -> edgequake_llm::Result<LLMResponse> {
            self.chat(&[ChatMessage::user(prompt)], Some(options)).await
        }

        async fn chat(
            &self,
            messages: &[ChatMessage],
            _options: Option<&CompletionOptions>,
        ) -> edgequake_llm::Result<LLMResponse> {
            self.seen.lock().unwrap().push(messages.to_vec());
            match self.answers.lock().unwrap().pop_front() {
                Some(Ok(content)) => Ok(LLMResponse::new(content, "scripted-1")),
                Some(Err(e)) => Err(LlmError::ApiError(e)),
                None => Err(LlmError::ApiError("script exhausted".to_string())),
            }
        }
    }

    fn oracle(provider: Arc<Scripted>, max_retries: u32) -> LlmRuleOracle {
        LlmRuleOracle::new(
            provider,
            LlmOracleConfig {
                max_retries,
                retry_backoff_ms: 1,
                ..Default::default()
            },
        )
    }

    fn request() -> ProposalRequest {
        ProposalRequest {
            unit: UnitFeatures::from_unit(&unit("caption", "Figure 3: throughput")),
            neighbors: Vec::new(),
            available_types: fixture().summaries(),
        }
    }

    #[tokio::test]
    async fn fenced_answer_is_decoded_and_prompt_forwarded() {
        let provider = Scripted::new([Ok("```json\n{\"predicate\": {\"kind\": \"caption\"}, \"action\": {\"target\": \"paragraph\"}}\n```")]);
        let req = request();

        let proposal = oracle(provider.clone(), 0).propose(&req).await.unwrap();

        assert_eq!(proposal.action.target, "paragraph");
        assert_eq!(provider.calls(), 1);
        let sent = &provider.seen.lock().unwrap()[0];
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].role, ChatRole::System);
        assert_eq!(sent[0].content, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(sent[1].role, ChatRole::User);
        assert_eq!(sent[1].content, proposal_request(&req));
    }

    #[tokio::test]
    async fn malformed_answer_is_retried() {
        let provider = Scripted::new([Ok("I think this is a caption."), Ok(VALID)]);

        let proposal = oracle(provider.clone(), 2).propose(&request()).await.unwrap();

        assert_eq!(proposal.description, "Captions are paragraphs");
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn provider_errors_are_retried_too() {
        let provider = Scripted::new([Err("503 overloaded"), Ok(VALID)]);
        assert!(oracle(provider.clone(), 1).propose(&request()).await.is_ok());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_every_attempt_fails() {
        let provider = Scripted::new([Ok("nope"), Ok("{not json}"), Ok("still nope")]);

        let err = oracle(provider.clone(), 2).propose(&request()).await.unwrap_err();

        assert_eq!(provider.calls(), 3);
        match err {
            OracleError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.contains("no JSON object"), "got: {last}");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn custom_system_prompt_replaces_default() {
        let provider = Scripted::new([Ok(VALID)]);
        let oracle = LlmRuleOracle::new(
            provider.clone(),
            LlmOracleConfig {
                system_prompt: Some("Answer with JSON.".to_string()),
                ..Default::default()
            },
        );
        oracle.propose(&request()).await.unwrap();
        assert_eq!(provider.seen.lock().unwrap()[0][0].content, "Answer with JSON.");
    }

    #[test]
    fn prebuilt_provider_wins_resolution() {
        let provider: Arc<dyn LLMProvider> = Scripted::new([]);
        let config = LlmOracleConfig {
            provider: Some(Arc::clone(&provider)),
            provider_name: Some("openai".to_string()),
            ..Default::default()
        };
        let resolved = resolve_provider(&config).unwrap();
        assert_eq!(resolved.name(), "scripted");
    }

    #[test]
    fn config_defaults() {
        let c = LlmOracleConfig::default();
        assert_eq!(c.temperature, 0.0);
        assert_eq!(c.max_tokens, 2048);
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.retry_backoff_ms, 500);
        assert!(format!("{c:?}").contains("LlmOracleConfig"));
    }
}
