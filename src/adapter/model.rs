//! Model reviewer adapters.
//!
//! A reviewer sends one prompt per requested analysis kind to a hosted
//! model, pulls the JSON payload out of the free-form answer and validates
//! it against the expected schema. Backend calls go through
//! [`retry_with_backoff`].

use super::retry::{retry_with_backoff, ClientError, RetryPolicy};
use super::{AdapterOutcome, AdapterReport, AnalysisKind, Analyzer, RawFinding, RawRisk};
use crate::config::ModelSettings;
use crate::error::AdapterError;
use crate::models::{AdapterId, Contract};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// System prompt shared by both backends.
pub const SYSTEM_PROMPT: &str = "You are a world-class smart contract security expert. \
Analyze the provided contract and return detailed, actionable findings in JSON format.";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Hosted model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelBackend {
    OpenAi,
    Anthropic,
}

impl ModelBackend {
    /// The backend behind an adapter id; `None` for process scanners.
    pub fn for_adapter(id: AdapterId) -> Option<Self> {
        match id {
            AdapterId::OpenAi => Some(ModelBackend::OpenAi),
            AdapterId::Anthropic => Some(ModelBackend::Anthropic),
            AdapterId::Slither | AdapterId::Mythril | AdapterId::Semgrep => None,
        }
    }

    pub fn adapter_id(&self) -> AdapterId {
        match self {
            ModelBackend::OpenAi => AdapterId::OpenAi,
            ModelBackend::Anthropic => AdapterId::Anthropic,
        }
    }
}

/// One completion round-trip against a model backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// False when no credentials are available.
    fn is_configured(&self) -> bool;

    /// Model name, for logs and report metadata.
    fn model_name(&self) -> &str;

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, ClientError>;
}

/// reqwest-backed client speaking the OpenAI or Anthropic wire format.
pub struct HttpModelClient {
    backend: ModelBackend,
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl HttpModelClient {
    pub fn from_settings(backend: ModelBackend, settings: &ModelSettings) -> Self {
        let api_key = std::env::var(&settings.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            backend,
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        }
    }

    fn request_body(&self, system: &str, prompt: &str) -> Value {
        match self.backend {
            ModelBackend::OpenAi => json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": prompt},
                ],
                "max_tokens": self.max_tokens,
                "temperature": self.temperature,
            }),
            ModelBackend::Anthropic => json!({
                "model": self.model,
                "max_tokens": self.max_tokens,
                "temperature": self.temperature,
                "system": system,
                "messages": [{"role": "user", "content": prompt}],
            }),
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, ClientError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ClientError::Rejected("API key not configured".to_string()))?;

        let body = self.request_body(system, prompt);
        let request = match self.backend {
            ModelBackend::OpenAi => self
                .http
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(api_key),
            ModelBackend::Anthropic => self
                .http
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
        };

        let response = request.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Transient("request timed out".to_string())
            } else if e.is_connect() {
                ClientError::Transient(format!("cannot connect to {}", self.base_url))
            } else {
                ClientError::Transient(format!("failed to send request: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ClientError::Malformed(format!("response is not JSON: {}", e)))?;

        completion_text(self.backend, &payload)
            .ok_or_else(|| ClientError::Malformed("response carries no completion text".to_string()))
    }
}

/// 429 and 5xx are worth retrying; any other failure status is final.
fn classify_status(status: StatusCode, body: &str) -> ClientError {
    let message = format!("API error {}: {}", status, body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ClientError::Transient(message)
    } else {
        ClientError::Rejected(message)
    }
}

/// Pull the assistant text out of a backend response body.
fn completion_text(backend: ModelBackend, payload: &Value) -> Option<String> {
    let text = match backend {
        ModelBackend::OpenAi => payload["choices"][0]["message"]["content"].as_str(),
        ModelBackend::Anthropic => payload["content"][0]["text"].as_str(),
    };
    text.map(str::to_string)
}

/// Extract the JSON object from a model answer.
///
/// Prefers a ```json fenced block; otherwise takes the first balanced
/// `{...}` object, skipping braces inside string literals.
pub fn extract_json_payload(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + 7..];
        if let Some(end) = body.find("```") {
            return Some(body[..end].trim());
        }
    }

    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, byte) in text.as_bytes()[start..].iter().enumerate() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escape_next = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

#[derive(Debug, Deserialize, Serialize)]
struct FindingsPayload {
    findings: Vec<RawFinding>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RisksPayload {
    risks: Vec<RawRisk>,
}

/// Parse and validate the payload for one analysis kind.
pub fn parse_payload(kind: AnalysisKind, text: &str) -> Result<AdapterReport, AdapterError> {
    let json = extract_json_payload(text)
        .ok_or_else(|| AdapterError::MalformedOutput("no JSON object in model answer".to_string()))?;

    let mut report = AdapterReport::default();
    match kind {
        AnalysisKind::Risk => {
            let payload: RisksPayload = serde_json::from_str(json)
                .map_err(|e| AdapterError::MalformedOutput(format!("invalid risks payload: {}", e)))?;
            report.risks = payload.risks;
        }
        AnalysisKind::Security | AnalysisKind::Gas => {
            let payload: FindingsPayload = serde_json::from_str(json).map_err(|e| {
                AdapterError::MalformedOutput(format!("invalid findings payload: {}", e))
            })?;
            report.findings = payload.findings;
            if kind == AnalysisKind::Gas {
                for finding in &mut report.findings {
                    finding.category = Some("gas".to_string());
                }
            }
        }
    }
    Ok(report)
}

/// Build the user prompt for one analysis kind.
pub fn build_prompt(kind: AnalysisKind, contract: &Contract) -> String {
    let header = format!(
        "Contract Address: {}\nChain ID: {}\nContract Name: {}\n\nSource Code:\n```solidity\n{}\n```\n\n",
        contract.address.as_deref().unwrap_or("unknown"),
        contract
            .chain_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        contract.display_name(),
        contract.source_code
    );

    match kind {
        AnalysisKind::Security => format!(
            "Analyze this Solidity smart contract for security vulnerabilities:\n\n{}\
Please provide a comprehensive security analysis in the following JSON format:\n\
{{\"findings\": [{{\"title\": \"Brief title\", \"description\": \"Detailed description\", \
\"severity\": \"critical|high|medium|low\", \
\"category\": \"access-control|arithmetic|reentrancy|gas|other\", \"line_number\": 123, \
\"function_name\": \"functionName\", \"recommendation\": \"How to fix\", \"confidence\": 0.95}}]}}\n\n\
Focus on reentrancy, access control, integer overflow/underflow, unchecked external calls, \
gas limit issues and logic errors. Be thorough and provide actionable recommendations.",
            header
        ),
        AnalysisKind::Risk => format!(
            "Perform a comprehensive risk assessment for this smart contract:\n\n{}\
Please provide a risk analysis in the following JSON format:\n\
{{\"risks\": [{{\"title\": \"Risk title\", \"description\": \"Detailed risk description\", \
\"category\": \"financial|operational|technical|regulatory\", \
\"risk_level\": \"critical|high|medium|low\", \"probability\": 0.8, \"impact_score\": 0.7, \
\"impact\": \"Potential impact\", \"mitigation\": \"Mitigation strategy\"}}]}}\n\n\
Consider financial, operational, technical and regulatory risks, both current and future.",
            header
        ),
        AnalysisKind::Gas => format!(
            "Analyze this smart contract for gas optimization opportunities:\n\n{}\
Report each opportunity in the following JSON format:\n\
{{\"findings\": [{{\"title\": \"Optimization title\", \"description\": \"What can be optimized\", \
\"severity\": \"low|medium\", \"category\": \"gas\", \"line_number\": 123, \
\"function_name\": \"functionName\", \"recommendation\": \"How to implement it\", \"confidence\": 0.8}}]}}\n\n\
Focus on storage layout, loops, function visibility, data types, redundant operations and batching.",
            header
        ),
    }
}

/// A hosted-model reviewer.
pub struct ModelReviewer {
    backend: ModelBackend,
    client: Arc<dyn ModelClient>,
    retry: RetryPolicy,
}

impl ModelReviewer {
    pub fn new(backend: ModelBackend, client: Arc<dyn ModelClient>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            client,
            retry,
        }
    }

    pub fn from_config(backend: ModelBackend, settings: &ModelSettings) -> Self {
        let client = HttpModelClient::from_settings(backend, settings);
        let retry = RetryPolicy::new(
            settings.max_attempts,
            Duration::from_millis(settings.base_delay_ms),
        );
        Self::new(backend, Arc::new(client), retry)
    }

    async fn review(&self, kind: AnalysisKind, contract: &Contract) -> Result<AdapterReport, AdapterError> {
        let prompt = build_prompt(kind, contract);
        let label = format!("{} {} review", self.backend.adapter_id(), kind);

        let answer = retry_with_backoff(self.retry, &label, |_| {
            self.client.complete(SYSTEM_PROMPT, &prompt)
        })
        .await?;

        debug!("{}: received {} bytes", label, answer.len());
        parse_payload(kind, &answer)
    }
}

#[async_trait]
impl Analyzer for ModelReviewer {
    fn id(&self) -> AdapterId {
        self.backend.adapter_id()
    }

    fn supports(&self, _kind: AnalysisKind) -> bool {
        true
    }

    async fn analyze(&self, contract: &Contract, kinds: &[AnalysisKind]) -> AdapterOutcome {
        if !self.client.is_configured() {
            warn!("{}: no API key configured, skipping", self.id());
            return AdapterOutcome::Failure(AdapterError::Unavailable(
                "API key not configured".to_string(),
            ));
        }

        let started = Instant::now();
        let mut report = AdapterReport::default();
        report
            .metadata
            .insert("model".to_string(), self.client.model_name().to_string());

        let mut succeeded = 0usize;
        let mut first_error = None;

        for kind in kinds.iter().copied().filter(|k| self.supports(*k)) {
            match self.review(kind, contract).await {
                Ok(part) => {
                    succeeded += 1;
                    report.extend(part);
                }
                Err(err) => {
                    warn!("{}: {} review failed: {}", self.id(), kind, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        let outcome = match first_error {
            None => AdapterOutcome::Success(report),
            Some(reason) if succeeded > 0 => AdapterOutcome::PartialFailure { report, reason },
            Some(reason) => AdapterOutcome::Failure(reason),
        };

        info!(
            "{} {} in {:.1}s",
            self.id(),
            outcome.label(),
            started.elapsed().as_secs_f64()
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted answers in order.
    struct ScriptedClient {
        configured: bool,
        answers: Mutex<VecDeque<Result<String, ClientError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(answers: Vec<Result<String, ClientError>>) -> Arc<Self> {
            Arc::new(Self {
                configured: true,
                answers: Mutex::new(answers.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn unconfigured() -> Arc<Self> {
            Arc::new(Self {
                configured: false,
                answers: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        fn is_configured(&self) -> bool {
            self.configured
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ClientError::Rejected("script exhausted".to_string())))
        }
    }

    fn reviewer(client: Arc<ScriptedClient>) -> ModelReviewer {
        ModelReviewer::new(
            ModelBackend::Anthropic,
            client,
            RetryPolicy::new(2, Duration::from_millis(1)),
        )
    }

    fn contract() -> Contract {
        Contract::new("c1", "contract Vault {}")
    }

    #[test]
    fn test_extract_fenced_block() {
        let text = "Here you go:\n```json\n{\"findings\": []}\n```\nDone.";
        assert_eq!(extract_json_payload(text), Some("{\"findings\": []}"));
    }

    #[test]
    fn test_extract_balanced_object() {
        let text = r#"Sure. {"risks": [{"title": "a } brace"}]} trailing {"x": 1}"#;
        assert_eq!(
            extract_json_payload(text),
            Some(r#"{"risks": [{"title": "a } brace"}]}"#)
        );
        assert_eq!(extract_json_payload("no json here"), None);
        assert_eq!(extract_json_payload("{\"unterminated\": "), None);
    }

    #[test]
    fn test_parse_payload_requires_top_level_key() {
        let err = parse_payload(AnalysisKind::Security, r#"{"issues": []}"#).unwrap_err();
        assert!(matches!(err, AdapterError::MalformedOutput(_)));

        let err = parse_payload(AnalysisKind::Risk, r#"{"risks": "none"}"#).unwrap_err();
        assert!(matches!(err, AdapterError::MalformedOutput(_)));
    }

    #[test]
    fn test_gas_payload_is_tagged_gas() {
        let report = parse_payload(
            AnalysisKind::Gas,
            r#"{"findings": [{"title": "Pack storage", "category": "other"}]}"#,
        )
        .unwrap();
        assert_eq!(report.findings[0].category.as_deref(), Some("gas"));
    }

    #[test]
    fn test_prompt_names_expected_schema() {
        let prompt = build_prompt(AnalysisKind::Risk, &contract());
        assert!(prompt.contains("\"risks\""));
        assert!(prompt.contains("contract Vault {}"));
        assert!(build_prompt(AnalysisKind::Security, &contract()).contains("\"findings\""));
    }

    #[test]
    fn test_for_adapter_maps_reviewers_only() {
        assert_eq!(
            ModelBackend::for_adapter(AdapterId::Anthropic),
            Some(ModelBackend::Anthropic)
        );
        assert_eq!(
            ModelBackend::for_adapter(AdapterId::OpenAi).map(|b| b.adapter_id()),
            Some(AdapterId::OpenAi)
        );
        assert_eq!(ModelBackend::for_adapter(AdapterId::Slither), None);
        assert_eq!(ModelBackend::for_adapter(AdapterId::Semgrep), None);
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ClientError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            ClientError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            ClientError::Rejected(_)
        ));
    }

    #[test]
    fn test_completion_text_per_backend() {
        let openai = json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        assert_eq!(completion_text(ModelBackend::OpenAi, &openai).as_deref(), Some("hi"));

        let anthropic = json!({"content": [{"type": "text", "text": "hello"}]});
        assert_eq!(
            completion_text(ModelBackend::Anthropic, &anthropic).as_deref(),
            Some("hello")
        );
        assert_eq!(completion_text(ModelBackend::Anthropic, &openai), None);
    }

    #[test]
    fn test_request_body_shapes() {
        let mut settings = crate::config::Config::default().models.anthropic;
        settings.api_key_env = "AUDITMESH_TEST_KEY_THAT_IS_NOT_SET".to_string();
        let client = HttpModelClient::from_settings(ModelBackend::Anthropic, &settings);
        assert!(!client.is_configured());

        let body = client.request_body("sys", "prompt");
        assert_eq!(body["system"], "sys");
        assert_eq!(body["max_tokens"], 4000);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn test_missing_key_makes_no_call() {
        let client = ScriptedClient::unconfigured();
        let outcome = reviewer(client.clone())
            .analyze(&contract(), &[AnalysisKind::Security])
            .await;

        assert!(matches!(
            outcome,
            AdapterOutcome::Failure(AdapterError::Unavailable(_))
        ));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reviews_each_kind() {
        let client = ScriptedClient::new(vec![
            Ok("```json\n{\"findings\": [{\"title\": \"Reentrancy\", \"severity\": \"high\", \"line_number\": 12}]}\n```"
                .to_string()),
            Ok(r#"{"risks": [{"title": "Drain", "risk_level": "critical", "probability": 0.4}]}"#
                .to_string()),
        ]);

        let outcome = reviewer(client.clone())
            .analyze(&contract(), &[AnalysisKind::Security, AnalysisKind::Risk])
            .await;

        let report = match outcome {
            AdapterOutcome::Success(report) => report,
            other => panic!("expected success, got {:?}", other),
        };
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].line_number, Some(12));
        assert_eq!(report.risks.len(), 1);
        assert_eq!(report.risks[0].probability, Some(0.4));
        assert_eq!(report.metadata.get("model").map(String::as_str), Some("scripted"));
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let client = ScriptedClient::new(vec![
            Err(ClientError::Transient("503".to_string())),
            Ok(r#"{"findings": []}"#.to_string()),
        ]);

        let outcome = reviewer(client.clone())
            .analyze(&contract(), &[AnalysisKind::Security])
            .await;
        assert!(matches!(outcome, AdapterOutcome::Success(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_one_failed_kind_is_partial_failure() {
        let client = ScriptedClient::new(vec![
            Ok(r#"{"findings": [{"title": "Unchecked call"}]}"#.to_string()),
            Err(ClientError::Transient("timeout".to_string())),
            Err(ClientError::Transient("timeout".to_string())),
        ]);

        let outcome = reviewer(client)
            .analyze(&contract(), &[AnalysisKind::Security, AnalysisKind::Risk])
            .await;

        match outcome {
            AdapterOutcome::PartialFailure { report, reason } => {
                assert_eq!(report.findings.len(), 1);
                assert_eq!(
                    reason,
                    AdapterError::TransientFailure {
                        attempts: 2,
                        message: "timeout".to_string()
                    }
                );
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreadable_answer_is_malformed() {
        let client = ScriptedClient::new(vec![Ok("I could not analyze this.".to_string())]);
        let outcome = reviewer(client)
            .analyze(&contract(), &[AnalysisKind::Security])
            .await;
        assert!(matches!(
            outcome,
            AdapterOutcome::Failure(AdapterError::MalformedOutput(_))
        ));
    }
}
