use crate::model::{ModelClient, ModelTier};
use crate::sanitize::OutputSanitizer;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Classification input is capped to this many trailing characters.
pub const CLASSIFY_INPUT_CAP: usize = 1500;

/// Minimum sanitized length for the backend's own sample to be trusted. The
/// backend truncates aggressively and can discard completion evidence, so
/// short samples are replaced by the orchestrator's buffered tail.
pub const MIN_SAMPLE_LEN: usize = 200;

/// Outcome of a stall classification. Anything the model returns outside
/// these four states is treated as no information, not as an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StallClassification {
    TaskComplete,
    WaitingForInput {
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        suggested_response: String,
    },
    StillWorking,
    Error,
}

/// Everything the classifier needs about the stalled session. There is no
/// cross-call memory between stalls; each call stands alone.
#[derive(Debug, Clone)]
pub struct StallContext {
    pub session_id: String,
    pub agent_type: String,
    /// Recent output as reported by the backend alongside the stall signal.
    pub backend_sample: String,
    /// Tail of the orchestrator's own output buffer (raw, ~100 lines).
    pub buffer_tail: String,
    pub session_age: Duration,
}

pub struct StallClassifier {
    model: Arc<dyn ModelClient>,
    sanitizer: OutputSanitizer,
    diagnostics_dir: Option<PathBuf>,
}

impl StallClassifier {
    pub fn new(model: Arc<dyn ModelClient>, diagnostics_dir: Option<PathBuf>) -> Result<Self> {
        Ok(Self {
            model,
            sanitizer: OutputSanitizer::new()?,
            diagnostics_dir,
        })
    }

    /// Classify a stalled session. Returns `None` on any failure — a model
    /// error, no JSON in the reply, or an unknown state. The caller leaves
    /// the session untouched in that case; a later output chunk may resolve
    /// the ambiguity without a model call.
    pub async fn classify(&self, ctx: &StallContext) -> Option<StallClassification> {
        let text = self.select_text(&ctx.backend_sample, &ctx.buffer_tail);
        if text.is_empty() {
            debug!(session_id = %ctx.session_id, "no output to classify");
            return None;
        }

        let prompt = build_prompt(&ctx.agent_type, &text);
        let result = match self.model.complete(&prompt, ModelTier::Fast).await {
            Ok(reply) => parse_classification(&reply),
            Err(e) => {
                warn!(session_id = %ctx.session_id, "stall classification failed: {e:#}");
                None
            }
        };

        self.write_diagnostics(ctx, &text, result.as_ref()).await;
        result
    }

    /// Pick the text to classify: the backend sample when it is substantial
    /// after sanitization, the orchestrator's buffered tail otherwise. Either
    /// way the result is capped to the trailing [`CLASSIFY_INPUT_CAP`] chars.
    pub fn select_text(&self, backend_sample: &str, buffer_tail: &str) -> String {
        let sample = self.sanitizer.sanitize(backend_sample);
        let text = if sample.len() >= MIN_SAMPLE_LEN {
            sample
        } else {
            self.sanitizer.sanitize(buffer_tail)
        };
        tail_chars(&text, CLASSIFY_INPUT_CAP)
    }

    /// Best-effort snapshot of what was classified and why. Never interrupts
    /// classification.
    async fn write_diagnostics(
        &self,
        ctx: &StallContext,
        text: &str,
        result: Option<&StallClassification>,
    ) {
        let Some(dir) = &self.diagnostics_dir else {
            return;
        };
        let snapshot = serde_json::json!({
            "session_id": ctx.session_id,
            "agent_type": ctx.agent_type,
            "session_age_ms": ctx.session_age.as_millis() as u64,
            "classified_text": text,
            "result": result,
        });
        let path = dir.join(format!("stall-{}.json", ctx.session_id));
        let write = async {
            tokio::fs::create_dir_all(dir).await?;
            let content = serde_json::to_string_pretty(&snapshot)?;
            tokio::fs::write(&path, content).await?;
            Ok::<_, anyhow::Error>(())
        };
        if let Err(e) = write.await {
            warn!(session_id = %ctx.session_id, "failed to write stall diagnostics: {e:#}");
        }
    }
}

/// Classification prompt requiring exactly one of four states, with the
/// tie-breaks spelled out.
pub fn build_prompt(agent_type: &str, text: &str) -> String {
    format!(
        "A `{agent_type}` coding agent running in a terminal has produced no new output \
for several seconds. Classify its state from the terminal output below.\n\
\n\
Rules:\n\
- If a completion summary or timing line (\"Done\", \"Total cost\", elapsed time, \
files changed) is followed by an idle input prompt, answer \"task_complete\" — ALWAYS, \
even though the agent is technically waiting at a prompt.\n\
- If the agent is asking a mid-task question or showing a permission/confirmation \
dialog, answer \"waiting_for_input\".\n\
- If a crash, panic, or stack trace is visible, answer \"error\".\n\
- Otherwise answer \"still_working\".\n\
\n\
Respond with exactly one JSON object and nothing else:\n\
{{\"state\":\"task_complete\"}}\n\
{{\"state\":\"waiting_for_input\",\"prompt\":\"<the question shown>\",\
\"suggested_response\":\"<literal text, or keys:<key names>>\"}}\n\
{{\"state\":\"still_working\"}}\n\
{{\"state\":\"error\"}}\n\
\n\
Terminal output:\n\
{text}\n"
    )
}

/// Extract the first well-formed JSON object from free text and validate it
/// as a [`StallClassification`]. Any other shape yields `None`.
pub fn parse_classification(reply: &str) -> Option<StallClassification> {
    let value = extract_json_object(reply)?;
    serde_json::from_value(value).ok()
}

/// Scan free text for the first balanced `{...}` that parses as a JSON
/// object. Brace matching respects string literals and escapes.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = find_balanced_end(bytes, start) {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                if value.is_object() {
                    return Some(value);
                }
            }
        }
        search_from = start + 1;
    }
    None
}

fn find_balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn tail_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    text.chars()
        .rev()
        .take(cap)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CannedModel {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelClient for CannedModel {
        async fn complete(&self, prompt: &str, _tier: ModelTier) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn json_embedded_in_prose_validates() {
        let reply = "Sure! Based on the output, {\"state\":\"task_complete\"} is my answer.";
        assert_eq!(
            parse_classification(reply),
            Some(StallClassification::TaskComplete)
        );
    }

    #[test]
    fn bogus_state_yields_none() {
        assert_eq!(parse_classification("{\"state\":\"bogus\"}"), None);
    }

    #[test]
    fn no_json_yields_none() {
        assert_eq!(parse_classification("it is probably still working"), None);
        assert_eq!(parse_classification("unbalanced { brace"), None);
    }

    #[test]
    fn waiting_for_input_carries_prompt_and_response() {
        let reply = r#"{"state":"waiting_for_input","prompt":"Overwrite foo.rs?","suggested_response":"keys:Enter"}"#;
        assert_eq!(
            parse_classification(reply),
            Some(StallClassification::WaitingForInput {
                prompt: "Overwrite foo.rs?".to_string(),
                suggested_response: "keys:Enter".to_string(),
            })
        );
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_extraction() {
        let reply = r#"note: "{" is a brace. {"state":"still_working"} done"#;
        assert_eq!(
            parse_classification(reply),
            Some(StallClassification::StillWorking)
        );
    }

    #[test]
    fn first_object_wins_over_later_ones() {
        let reply = r#"{"state":"error"} but also {"state":"task_complete"}"#;
        assert_eq!(parse_classification(reply), Some(StallClassification::Error));
    }

    #[tokio::test]
    async fn short_backend_sample_falls_back_to_buffer_tail() {
        let model = Arc::new(CannedModel {
            reply: "{\"state\":\"still_working\"}".to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let classifier = StallClassifier::new(model.clone(), None).unwrap();

        let tail_line = "buffer line with plenty of text in it\n".repeat(25);
        let ctx = StallContext {
            session_id: "sess-1".to_string(),
            agent_type: "claude".to_string(),
            backend_sample: "short sample".to_string(),
            buffer_tail: tail_line.clone(),
            session_age: Duration::from_secs(10),
        };
        let result = classifier.classify(&ctx).await;
        assert_eq!(result, Some(StallClassification::StillWorking));

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("buffer line with plenty of text"));
        assert!(!prompts[0].contains("short sample"));
    }

    #[test]
    fn substantial_backend_sample_is_preferred() {
        let model = Arc::new(CannedModel {
            reply: String::new(),
            prompts: Mutex::new(Vec::new()),
        });
        let classifier = StallClassifier::new(model, None).unwrap();
        let sample = "sample text ".repeat(30);
        let selected = classifier.select_text(&sample, "tail");
        assert!(selected.contains("sample text"));
    }

    #[test]
    fn classified_text_is_capped() {
        let model = Arc::new(CannedModel {
            reply: String::new(),
            prompts: Mutex::new(Vec::new()),
        });
        let classifier = StallClassifier::new(model, None).unwrap();
        let long = "x".repeat(5000);
        assert_eq!(
            classifier.select_text(&long, "").chars().count(),
            CLASSIFY_INPUT_CAP
        );
    }

    #[tokio::test]
    async fn diagnostics_are_written_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(CannedModel {
            reply: "{\"state\":\"task_complete\"}".to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let classifier =
            StallClassifier::new(model, Some(dir.path().to_path_buf())).unwrap();
        let ctx = StallContext {
            session_id: "sess-diag".to_string(),
            agent_type: "shell".to_string(),
            backend_sample: "output ".repeat(40),
            buffer_tail: String::new(),
            session_age: Duration::from_secs(1),
        };
        let result = classifier.classify(&ctx).await;
        assert_eq!(result, Some(StallClassification::TaskComplete));
        assert!(dir.path().join("stall-sess-diag.json").exists());
    }
}
