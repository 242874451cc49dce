//! Failure classifier — maps raw provider errors onto [`FailureKind`].
//!
//! Provider errors arrive in inconsistent shapes: a status on the error
//! itself, an `error` object with `code`/`message`, a JSON `body` string, or
//! a JSON document flattened into the message text. Extraction runs an
//! ordered list of pure strategies; the first one that yields a status wins.
//! When none does, the status is inferred from message wording.
//!
//! Classification never fails: unparseable fragments are skipped.

use rendergate_types::{FailureKind, FailureRecord, GenError};
use serde_json::Value;

/// Fixed sentence shown for overload-class failures.
pub const OVERLOADED_MESSAGE: &str =
    "The AI model is currently overloaded. Please try again in a few moments.";

/// Shown when attempts ran out while the pool had no key to lease.
pub const POOL_EXHAUSTED_MESSAGE: &str =
    "All API keys are busy right now. Please try again shortly.";

const MESSAGE_PREFIX: &str = "Generation failed";

/// A raw error flattened into the fields the strategies look at.
#[derive(Debug, Clone, Default)]
pub struct RawError {
    /// Numeric status found directly on the error.
    pub status: Option<u16>,
    /// Nested `error` object, if any.
    pub error: Option<Value>,
    /// Response body text, possibly JSON.
    pub body: Option<String>,
    /// Top-level message text, possibly JSON.
    pub message: String,
}

impl RawError {
    /// Builds a view of an arbitrary JSON error object.
    ///
    /// Reads `status` (or a numeric top-level `code`), `error`, `body` and
    /// `message`. A bare string is treated as the message.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self {
                message: value
                    .as_str()
                    .map_or_else(|| value.to_string(), str::to_string),
                ..Self::default()
            };
        };
        let code = || {
            obj.get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
        };
        let status = obj.get("status").and_then(as_status).or_else(code);
        let error = obj.get("error").filter(|e| e.is_object()).cloned();
        let body = obj.get("body").map(|b| match b {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        let message = obj
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| value.to_string(), str::to_string);
        Self {
            status,
            error,
            body,
            message,
        }
    }

    /// Builds a view of a [`GenError`]. Returns `None` for errors that did
    /// not come from the provider or the transport.
    #[must_use]
    pub fn from_gen_error(err: &GenError) -> Option<Self> {
        match err {
            GenError::Upstream { status, body } => Some(Self {
                status: Some(*status),
                error: None,
                body: Some(body.clone()),
                message: body.clone(),
            }),
            GenError::Api { error, message } => Some(Self {
                status: None,
                error: Some(error.clone()),
                body: None,
                message: message.clone(),
            }),
            GenError::Message(message) | GenError::Http(message) => Some(Self {
                message: message.clone(),
                ..Self::default()
            }),
            _ => None,
        }
    }
}

/// What one strategy managed to pull out of a [`RawError`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct Extraction {
    status: Option<u16>,
    message: Option<String>,
}

type Strategy = fn(&RawError) -> Option<Extraction>;

/// Ordered extraction strategies; earlier entries take priority.
const STRATEGIES: [Strategy; 4] = [direct_status, nested_error, body_json, message_json];

fn direct_status(raw: &RawError) -> Option<Extraction> {
    raw.status.map(|s| Extraction {
        status: Some(s),
        message: None,
    })
}

fn nested_error(raw: &RawError) -> Option<Extraction> {
    raw.error.as_ref().and_then(error_fields)
}

fn body_json(raw: &RawError) -> Option<Extraction> {
    let body = raw.body.as_deref()?;
    let parsed: Value = serde_json::from_str(body).ok()?;
    envelope_fields(&parsed)
}

fn message_json(raw: &RawError) -> Option<Extraction> {
    let parsed = parse_json_text(&raw.message)
        .or_else(|| embedded_json(&raw.message).map(|(_, value)| value))?;
    envelope_fields(&parsed)
}

/// `{"error": {...}}` or a bare `{code, message}` object.
fn envelope_fields(value: &Value) -> Option<Extraction> {
    match value.get("error") {
        Some(inner) if inner.is_object() => error_fields(inner),
        _ => error_fields(value),
    }
}

fn error_fields(error: &Value) -> Option<Extraction> {
    let status = error.get("code").and_then(as_status);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string);
    if status.is_none() && message.is_none() {
        return None;
    }
    Some(Extraction { status, message })
}

/// Accepts `429` as well as `"429"`.
fn as_status(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parses text that looks like a JSON object or array.
fn parse_json_text(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let looks_json = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    if !looks_json {
        return None;
    }
    match serde_json::from_str(trimmed).ok()? {
        // Some SDKs wrap the error document in a one-element array.
        Value::Array(items) => items.into_iter().next(),
        other => Some(other),
    }
}

/// Finds the first balanced `{...}` object inside free text, e.g.
/// `got status: 404 Not Found. {"error":{...}}`. Returns the text before it
/// and the parsed object.
fn embedded_json(text: &str) -> Option<(&str, Value)> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    let value = serde_json::from_str(&text[start..end]).ok()?;
                    return Some((&text[..start], value));
                }
            }
            _ => {}
        }
    }
    None
}

/// Runs the strategies in order. The first status found wins; the message is
/// the first nested one any strategy found, else the raw message.
fn extract(raw: &RawError) -> (Option<u16>, String) {
    let found: Vec<Extraction> = STRATEGIES.iter().filter_map(|s| s(raw)).collect();
    let status = found.iter().find_map(|e| e.status);
    let message = found
        .into_iter()
        .find_map(|e| e.message)
        .unwrap_or_else(|| raw.message.clone());
    (status, message)
}

/// Infers a status from message wording when no structure carried one.
fn infer_status(message: &str) -> Option<u16> {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("quota") || lower.contains("exhausted") {
        Some(429)
    } else if lower.contains("400") || lower.contains("billing") {
        Some(400)
    } else if lower.contains("503") || lower.contains("overloaded") {
        Some(503)
    } else {
        None
    }
}

fn mentions_billing(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["billing", "billed", "credits"]
        .iter()
        .any(|w| lower.contains(w))
}

fn kind_for(status: Option<u16>, message: &str) -> FailureKind {
    match status {
        None => FailureKind::Transient,
        Some(429) => FailureKind::QuotaExceeded,
        Some(400) if mentions_billing(message) => FailureKind::BillingRejected,
        Some(500 | 503) => FailureKind::ServiceOverloaded,
        Some(_) => FailureKind::Other,
    }
}

/// Classifies a flattened raw error.
#[must_use]
pub fn classify_raw(raw: &RawError) -> FailureRecord {
    let (status, message) = extract(raw);
    let status = status.or_else(|| infer_status(&message));
    FailureRecord::new(kind_for(status, &message), status, message)
}

/// Classifies an arbitrary JSON error object.
#[must_use]
pub fn classify_value(value: &Value) -> FailureRecord {
    classify_raw(&RawError::from_value(value))
}

/// Classifies a workspace error.
///
/// [`GenError::PoolExhausted`] maps to [`FailureKind::PoolExhausted`].
/// Local errors (bad payloads, decoding, configuration) are
/// [`FailureKind::Other`]: retrying them cannot help.
#[must_use]
pub fn classify(err: &GenError) -> FailureRecord {
    if matches!(err, GenError::PoolExhausted) {
        return FailureRecord::new(FailureKind::PoolExhausted, None, err.to_string());
    }
    match RawError::from_gen_error(err) {
        Some(raw) => classify_raw(&raw),
        None => FailureRecord::new(FailureKind::Other, None, err.to_string()),
    }
}

/// Turns a failure into text that is safe to show an end user.
///
/// Overload collapses to [`OVERLOADED_MESSAGE`]. JSON-shaped messages, and
/// messages carrying a JSON object after some text, are reduced to their
/// nested `error.message`. Anything else is prefixed.
#[must_use]
pub fn sanitize(record: &FailureRecord) -> String {
    match record.kind {
        FailureKind::ServiceOverloaded => return OVERLOADED_MESSAGE.to_string(),
        FailureKind::PoolExhausted => return POOL_EXHAUSTED_MESSAGE.to_string(),
        _ => {}
    }
    let text = record.raw_message.trim();
    if let Some(parsed) = parse_json_text(text) {
        return match envelope_fields(&parsed).and_then(|e| e.message) {
            Some(inner) => format!("{MESSAGE_PREFIX}: {inner}"),
            None => format!("{MESSAGE_PREFIX}. Please try again."),
        };
    }
    if let Some((lead, parsed)) = embedded_json(text) {
        if let Some(inner) = envelope_fields(&parsed).and_then(|e| e.message) {
            return format!("{MESSAGE_PREFIX}: {inner}");
        }
        let lead = lead.trim_end_matches(|c: char| c.is_whitespace() || c == ':');
        return if lead.is_empty() {
            format!("{MESSAGE_PREFIX}. Please try again.")
        } else {
            format!("{MESSAGE_PREFIX}: {lead}")
        };
    }
    if text.is_empty() {
        format!("{MESSAGE_PREFIX}. Please try again.")
    } else {
        format!("{MESSAGE_PREFIX}: {text}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_status_wins() {
        let r = classify(&GenError::Upstream {
            status: 429,
            body: r#"{"error":{"code":503,"message":"Resource has been exhausted"}}"#.into(),
        });
        assert_eq!(r.kind, FailureKind::QuotaExceeded);
        assert_eq!(r.raw_status, Some(429));
        // the nested message is still preferred for display
        assert_eq!(r.raw_message, "Resource has been exhausted");
    }

    #[test]
    fn test_nested_error_code() {
        let r = classify_value(&json!({
            "message": "request failed",
            "error": {"code": 503, "message": "The model is overloaded."}
        }));
        assert_eq!(r.kind, FailureKind::ServiceOverloaded);
        assert_eq!(r.raw_status, Some(503));
        assert_eq!(r.raw_message, "The model is overloaded.");
    }

    #[test]
    fn test_nested_error_string_code() {
        let r = classify_value(&json!({"error": {"code": "429", "message": "slow down"}}));
        assert_eq!(r.kind, FailureKind::QuotaExceeded);
    }

    #[test]
    fn test_body_embedded_json() {
        let r = classify_value(&json!({
            "message": "bad things",
            "body": r#"{"error":{"code":400,"message":"Only accessible to billed users."}}"#
        }));
        assert_eq!(r.kind, FailureKind::BillingRejected);
        assert_eq!(r.raw_status, Some(400));
    }

    #[test]
    fn test_message_embedded_json() {
        let r = classify(&GenError::Message(
            r#"{"error":{"code":503,"message":"model overloaded"}}"#.into(),
        ));
        assert_eq!(r.kind, FailureKind::ServiceOverloaded);
        assert_eq!(r.raw_message, "model overloaded");
    }

    #[test]
    fn test_message_embedded_json_array() {
        let r = classify(&GenError::Message(
            r#"[{"error":{"code":429,"message":"quota"}}]"#.into(),
        ));
        assert_eq!(r.kind, FailureKind::QuotaExceeded);
    }

    #[test]
    fn test_api_error_from_operation() {
        let r = classify(&GenError::Api {
            error: json!({"code": 500, "message": "internal"}),
            message: "internal".into(),
        });
        assert_eq!(r.kind, FailureKind::ServiceOverloaded);
        assert_eq!(r.raw_status, Some(500));
    }

    #[test]
    fn test_substring_heuristics() {
        let cases = [
            ("HTTP 429 Too Many Requests", FailureKind::QuotaExceeded),
            ("You exceeded your current QUOTA", FailureKind::QuotaExceeded),
            ("RESOURCE_EXHAUSTED", FailureKind::QuotaExceeded),
            ("billing account disabled", FailureKind::BillingRejected),
            ("got 503 from upstream", FailureKind::ServiceOverloaded),
            ("the model is Overloaded", FailureKind::ServiceOverloaded),
            ("connection reset by peer", FailureKind::Transient),
        ];
        for (message, expected) in cases {
            let r = classify(&GenError::Message(message.into()));
            assert_eq!(r.kind, expected, "message: {message}");
        }
    }

    #[test]
    fn test_heuristic_400_without_billing_is_other() {
        let r = classify(&GenError::Message("400 invalid argument".into()));
        assert_eq!(r.raw_status, Some(400));
        assert_eq!(r.kind, FailureKind::Other);
    }

    #[test]
    fn test_billing_wording_variants_with_400() {
        for body in ["billing not enabled", "insufficient credits", "only billed users"] {
            let r = classify(&GenError::Upstream {
                status: 400,
                body: body.into(),
            });
            assert_eq!(r.kind, FailureKind::BillingRejected, "body: {body}");
        }
    }

    #[test]
    fn test_other_real_status() {
        let r = classify(&GenError::Upstream {
            status: 403,
            body: "permission denied, quota project".into(),
        });
        assert_eq!(r.kind, FailureKind::Other);
    }

    #[test]
    fn test_raw_500_is_overload() {
        let r = classify(&GenError::Upstream {
            status: 500,
            body: String::new(),
        });
        assert_eq!(r.kind, FailureKind::ServiceOverloaded);
    }

    #[test]
    fn test_transport_error_transient() {
        let r = classify(&GenError::Http("error sending request".into()));
        assert_eq!(r.kind, FailureKind::Transient);
        assert_eq!(r.raw_status, None);
    }

    #[test]
    fn test_pool_exhausted_and_local_errors() {
        assert_eq!(
            classify(&GenError::PoolExhausted).kind,
            FailureKind::PoolExhausted
        );
        assert_eq!(
            classify(&GenError::InvalidResponse("no image".into())).kind,
            FailureKind::Other
        );
        assert_eq!(
            classify(&GenError::Decode("bad base64".into())).kind,
            FailureKind::Other
        );
    }

    #[test]
    fn test_unparseable_structures_fall_through() {
        let r = classify_value(&json!({
            "body": "{not json",
            "message": "{also not json but mentions quota}"
        }));
        assert_eq!(r.kind, FailureKind::QuotaExceeded);
        assert_eq!(r.raw_status, Some(429));
    }

    #[test]
    fn test_non_object_values() {
        assert_eq!(classify_value(&json!("503 overloaded")).kind, FailureKind::ServiceOverloaded);
        assert_eq!(classify_value(&json!(null)).kind, FailureKind::Transient);
        assert_eq!(classify_value(&json!({"status": 404})).kind, FailureKind::Other);
    }

    #[test]
    fn test_classification_deterministic() {
        let fixtures = [
            json!({"error": {"code": 429, "message": "x"}}),
            json!({"body": "{\"error\":{\"code\":503}}"}),
            json!({"message": "{\"error\":{\"code\":400,\"message\":\"billing\"}}"}),
            json!({"message": "quota"}),
            json!({"message": "overloaded"}),
        ];
        for f in &fixtures {
            assert_eq!(classify_value(f), classify_value(f));
        }
    }

    #[test]
    fn test_sanitize_overload_json() {
        let r = classify(&GenError::Message(
            r#"{"error":{"code":503,"message":"model overloaded"}}"#.into(),
        ));
        let text = sanitize(&r);
        assert_eq!(text, OVERLOADED_MESSAGE);
        assert!(!text.contains('{'));
    }

    #[test]
    fn test_sanitize_extracts_nested_message() {
        let record = FailureRecord::new(
            FailureKind::QuotaExceeded,
            Some(429),
            r#"{"error":{"code":429,"message":"Quota exceeded for metric"}}"#,
        );
        assert_eq!(sanitize(&record), "Generation failed: Quota exceeded for metric");
    }

    #[test]
    fn test_sanitize_json_without_message() {
        let record = FailureRecord::new(FailureKind::Other, Some(418), r#"{"foo":1}"#);
        let text = sanitize(&record);
        assert!(!text.contains("foo"));
        assert!(text.starts_with(MESSAGE_PREFIX));
    }

    #[test]
    fn test_sanitize_plain_prefix() {
        let record = FailureRecord::new(FailureKind::Transient, None, "connection reset");
        assert_eq!(sanitize(&record), "Generation failed: connection reset");
    }

    #[test]
    fn test_embedded_json_after_text() {
        let message =
            r#"got status: 404 Not Found. {"error":{"code":404,"message":"model not found"}}"#;
        let raw = RawError {
            message: message.into(),
            ..RawError::default()
        };
        let record = classify_raw(&raw);
        assert_eq!(record.kind, FailureKind::Other);
        assert_eq!(record.raw_status, Some(404));

        let text = sanitize(&record);
        assert_eq!(text, "Generation failed: model not found");
        assert!(!text.contains('{'));
    }

    #[test]
    fn test_sanitize_embedded_json_on_unparsed_record() {
        let record = FailureRecord::new(
            FailureKind::Transient,
            None,
            r#"upstream said: {"error":{"message":"try \"later\" {soon}"}} (ref 7)"#,
        );
        assert_eq!(sanitize(&record), r#"Generation failed: try "later" {soon}"#);

        let record = FailureRecord::new(
            FailureKind::Transient,
            None,
            r#"proxy error: {"detail":"gateway"}"#,
        );
        assert_eq!(sanitize(&record), "Generation failed: proxy error");
    }

    #[test]
    fn test_sanitize_keeps_unbalanced_brace_text() {
        let record = FailureRecord::new(FailureKind::Transient, None, "bad template {name");
        assert_eq!(sanitize(&record), "Generation failed: bad template {name");
    }

    #[test]
    fn test_sanitize_pool_exhausted() {
        let record = classify(&GenError::PoolExhausted);
        assert_eq!(sanitize(&record), POOL_EXHAUSTED_MESSAGE);
    }
}
