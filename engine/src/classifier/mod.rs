//! Activity classification
//!
//! Sends batched session context to an external completion service and
//! decodes the strict-schema response. The backend is a trait so tests can
//! run against a mock HTTP server or a canned in-process implementation.
//!
//! Transient failures (rate limit, 5xx, network, timeout) are retried with
//! exponential backoff; malformed output gets a bounded number of reformat
//! follow-ups before the batch fails. Every attempt that returns a
//! completion records its token usage, including the attempts of batches
//! that ultimately fail.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::config::ClassifierConfig;
use crate::errors::ClassifierError;
use crate::grouper::Session;
use crate::store::{Project, TokenUsageRecord, UsageRepository};

pub mod openrouter;
pub mod retry;
pub mod schema;

pub use openrouter::OpenRouterBackend;
pub use retry::RetryPolicy;
pub use schema::{ActivityDraft, ClassifierResponse, ProjectSuggestion};

/// One completion returned by a backend.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Contract for the completion service.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Backend name for logging (e.g. "openrouter")
    fn name(&self) -> &str;

    /// Model identifier reported in usage records
    fn model(&self) -> &str;

    /// One chat completion round trip. Implementations map transport and
    /// HTTP failures onto `ClassifierError` variants; they do not retry.
    async fn complete(&self, system: &str, user: &str) -> Result<Completion, ClassifierError>;
}

/// Decoded response plus the total tokens spent producing it.
#[derive(Debug)]
pub struct ClassifierOutcome {
    pub response: ClassifierResponse,
    pub tokens_used: i64,
}

pub struct Classifier {
    backend: Box<dyn CompletionBackend>,
    retry: RetryPolicy,
    max_reformat_attempts: u32,
    input_cost_per_1k: f64,
    output_cost_per_1k: f64,
    usage: UsageRepository,
}

impl Classifier {
    pub fn new(
        backend: Box<dyn CompletionBackend>,
        config: &ClassifierConfig,
        usage: UsageRepository,
    ) -> Self {
        Self {
            backend,
            retry: RetryPolicy::from_config(config),
            max_reformat_attempts: config.max_reformat_attempts,
            input_cost_per_1k: config.input_cost_per_1k,
            output_cost_per_1k: config.output_cost_per_1k,
            usage,
        }
    }

    /// Classify a batch of sessions into activities.
    ///
    /// `known_projects` steers the service toward existing names instead of
    /// inventing near-duplicates.
    pub async fn classify(
        &self,
        sessions: &[Session],
        known_projects: &[Project],
    ) -> Result<ClassifierOutcome, ClassifierError> {
        let system = build_system_prompt(known_projects);
        let user = build_user_prompt(sessions);

        let mut tokens_used = 0i64;

        let completion = self
            .complete_with_retry(&system, &user, "classify", &mut tokens_used)
            .await?;

        match decode_response(&completion.content) {
            Ok(response) => {
                return Ok(ClassifierOutcome {
                    response,
                    tokens_used,
                })
            }
            Err(first_err) => {
                let mut last_err = first_err;

                for reformat in 0..self.max_reformat_attempts {
                    warn!(
                        attempt = reformat + 1,
                        error = %last_err,
                        "classifier output malformed, requesting reformat"
                    );

                    let follow_up = format!(
                        "Your previous response could not be parsed ({}). \
                         Respond again with ONLY the JSON object, no prose and \
                         no code fences.\n\nOriginal request:\n{}",
                        last_err, user
                    );

                    let retried = self
                        .complete_with_retry(&system, &follow_up, "reformat", &mut tokens_used)
                        .await?;

                    match decode_response(&retried.content) {
                        Ok(response) => {
                            return Ok(ClassifierOutcome {
                                response,
                                tokens_used,
                            })
                        }
                        Err(e) => last_err = e,
                    }
                }

                Err(last_err)
            }
        }
    }

    /// One logical completion, retried on transient failures per the
    /// retry policy. Token usage is recorded for every completion that
    /// comes back, even when the surrounding batch later fails.
    async fn complete_with_retry(
        &self,
        system: &str,
        user: &str,
        operation: &str,
        tokens_used: &mut i64,
    ) -> Result<Completion, ClassifierError> {
        let mut attempt = 0u32;

        loop {
            match self.backend.complete(system, user).await {
                Ok(completion) => {
                    *tokens_used += completion.input_tokens + completion.output_tokens;
                    self.record_usage(operation, &completion).await;
                    return Ok(completion);
                }
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        backend = self.backend.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient completion failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record_usage(&self, operation: &str, completion: &Completion) {
        let record = TokenUsageRecord {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            model: self.backend.model().to_string(),
            tokens_input: completion.input_tokens,
            tokens_output: completion.output_tokens,
            cost_estimate: (completion.input_tokens as f64 / 1000.0) * self.input_cost_per_1k
                + (completion.output_tokens as f64 / 1000.0) * self.output_cost_per_1k,
        };

        // Usage accounting is best-effort; a write failure must not fail
        // the classification call.
        if let Err(e) = self.usage.record(&record).await {
            warn!(error = %e, "failed to record token usage");
        }
    }
}

fn build_system_prompt(known_projects: &[Project]) -> String {
    let mut prompt = String::from(
        "You are an activity classifier for a personal work journal. \
         You receive raw activity events grouped into work sessions and \
         produce a JSON object with this exact shape:\n\
         {\n\
           \"activities\": [\n\
             {\"project\": \"...\", \"description\": \"...\", \"date\": \"YYYY-MM-DD\",\n\
              \"activity_type\": \"...\", \"technologies\": [\"...\"],\n\
              \"session\": 0, \"tweet_draft\": \"...\"}\n\
           ],\n\
           \"new_projects\": [\n\
             {\"name\": \"...\", \"reason\": \"...\", \"keywords\": [\"...\"]}\n\
           ]\n\
         }\n\
         \"project\", \"description\" and \"date\" are required for every \
         activity. \"session\" is the zero-based index of the session the \
         activity came from. Suggest a tweet_draft only for notable \
         activities. Respond with the JSON object only.\n",
    );

    if known_projects.is_empty() {
        prompt.push_str("\nThere are no known projects yet.\n");
    } else {
        prompt.push_str("\nKnown projects (prefer these names over inventing variants):\n");
        for project in known_projects {
            if project.keywords.is_empty() {
                prompt.push_str(&format!("- {}\n", project.name));
            } else {
                prompt.push_str(&format!(
                    "- {} (keywords: {})\n",
                    project.name,
                    project.keywords.join(", ")
                ));
            }
        }
    }

    prompt
}

fn build_user_prompt(sessions: &[Session]) -> String {
    let mut prompt = format!(
        "Classify the activity in these {} work sessions.\n",
        sessions.len()
    );

    for (index, session) in sessions.iter().enumerate() {
        prompt.push_str(&format!(
            "\n## Session {} ({} to {}, {} events)\n",
            index,
            session.start().to_rfc3339(),
            session.end().to_rfc3339(),
            session.len()
        ));

        for event in session.events() {
            prompt.push_str(&format!(
                "[{}] {}/{}: {}\n",
                event.event_time.to_rfc3339(),
                event.source,
                event.event_type,
                event.payload
            ));
        }
    }

    prompt
}

/// Decode the completion content against the strict schema.
///
/// Accepts the object verbatim, inside a markdown fence, or embedded in
/// prose; anything that fails strict decoding is a malformed response.
fn decode_response(content: &str) -> Result<ClassifierResponse, ClassifierError> {
    let candidate = extract_json_object(content)
        .ok_or_else(|| ClassifierError::MalformedResponse("no JSON object found".to_string()))?;

    serde_json::from_str(candidate).map_err(|e| ClassifierError::MalformedResponse(e.to_string()))
}

fn extract_json_object(content: &str) -> Option<&str> {
    let trimmed = content.trim();

    if trimmed.starts_with('{') {
        if let Some(balanced) = extract_balanced_json(trimmed) {
            return Some(balanced);
        }
    }

    if let Some(inner) = extract_fenced_block(trimmed) {
        let inner = inner.trim();
        if inner.starts_with('{') {
            if let Some(balanced) = extract_balanced_json(inner) {
                return Some(balanced);
            }
        }
    }

    // Last resort: scan for the first object embedded in prose
    let pos = trimmed.find('{')?;
    extract_balanced_json(&trimmed[pos..])
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
fn extract_fenced_block(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced JSON object starting at position 0 of `s`.
///
/// Counts `{` / `}` depth, respecting string literals, to find the
/// matching close brace.
fn extract_balanced_json(s: &str) -> Option<&str> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    use crate::grouper::group_into_sessions;
    use crate::store::RawEvent;

    fn event(id: i64, minutes: i64, payload: &str) -> RawEvent {
        RawEvent {
            id,
            source: "git".to_string(),
            event_type: "commit".to_string(),
            payload: payload.to_string(),
            event_time: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
                + Duration::minutes(minutes),
            processed: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_user_prompt_lists_sessions_with_indexes() {
        let sessions = group_into_sessions(
            vec![
                event(1, 0, r#"{"message": "fix parser"}"#),
                event(2, 300, r#"{"message": "add tests"}"#),
            ],
            Duration::minutes(60),
        );
        assert_eq!(sessions.len(), 2);

        let prompt = build_user_prompt(&sessions);
        assert!(prompt.contains("## Session 0"));
        assert!(prompt.contains("## Session 1"));
        assert!(prompt.contains("fix parser"));
    }

    #[test]
    fn test_system_prompt_includes_known_projects() {
        let project = Project {
            id: 1,
            name: "data pipeline".to_string(),
            description: String::new(),
            keywords: vec!["etl".to_string()],
            active: true,
            created_at: Utc::now(),
        };

        let prompt = build_system_prompt(&[project]);
        assert!(prompt.contains("data pipeline"));
        assert!(prompt.contains("etl"));
    }

    #[test]
    fn test_decode_raw_object() {
        let raw = r#"{"activities": []}"#;
        let response = decode_response(raw).unwrap();
        assert!(response.activities.is_empty());
    }

    #[test]
    fn test_decode_fenced_object() {
        let raw = "Here you go:\n```json\n{\"activities\": []}\n```\nDone.";
        let response = decode_response(raw).unwrap();
        assert!(response.activities.is_empty());
    }

    #[test]
    fn test_decode_object_embedded_in_prose() {
        let raw = "Sure! The classification is {\"activities\": []} as requested.";
        let response = decode_response(raw).unwrap();
        assert!(response.activities.is_empty());
    }

    #[test]
    fn test_decode_rejects_prose_without_json() {
        let err = decode_response("I could not classify anything.").unwrap_err();
        assert!(matches!(err, ClassifierError::MalformedResponse(_)));
    }

    #[test]
    fn test_decode_rejects_schema_violation() {
        let err = decode_response(r#"{"activities": [{"project": "x"}]}"#).unwrap_err();
        assert!(matches!(err, ClassifierError::MalformedResponse(_)));
    }

    #[test]
    fn test_balanced_extraction_respects_strings() {
        let raw = r#"{"activities": [], "note": "brace } inside string"}"#;
        let extracted = extract_balanced_json(raw).unwrap();
        assert_eq!(extracted, raw);
    }
}
