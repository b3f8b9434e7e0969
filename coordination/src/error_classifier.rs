//! Exception-to-recovery-strategy classification.
//!
//! Maps a raw error plus an optional context hint to an [`ErrorClass`] and a
//! [`RecoveryStrategy`] by ordered pattern match, then recommends escalating
//! recovery plans as retry attempts accumulate. Grounded on
//! `app/agents/error_handler.py` in the original implementation; structured
//! error shape follows the teacher's `harness/error.rs`.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::time::Duration;

/// Taxonomy of errors the orchestrator may encounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    ContextOverflow,
    RateLimit,
    AuthError,
    Timeout,
    RoleOrdering,
    ImageError,
    ModelUnavailable,
    ToolError,
    ParseError,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::ContextOverflow => "context_overflow",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::AuthError => "auth_error",
            ErrorClass::Timeout => "timeout",
            ErrorClass::RoleOrdering => "role_ordering",
            ErrorClass::ImageError => "image_error",
            ErrorClass::ModelUnavailable => "model_unavailable",
            ErrorClass::ToolError => "tool_error",
            ErrorClass::ParseError => "parse_error",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// Maximum retry attempts before recovery escalates to `Abort`.
    fn max_retries(&self) -> u32 {
        match self {
            ErrorClass::ContextOverflow => 2,
            ErrorClass::RateLimit => 3,
            ErrorClass::AuthError => 1,
            ErrorClass::Timeout => 3,
            ErrorClass::RoleOrdering => 2,
            ErrorClass::ImageError => 1,
            ErrorClass::ModelUnavailable => 2,
            ErrorClass::ToolError => 1,
            ErrorClass::ParseError => 2,
            ErrorClass::Unknown => 2,
        }
    }
}

/// Actions the orchestrator can take to recover from an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Retry,
    CompactContext,
    RotateModel,
    ReduceContext,
    Abort,
    SkipTool,
    None,
}

/// An error enriched with classification metadata.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub original: String,
    pub class: ErrorClass,
    pub message: String,
    pub retryable: bool,
    pub strategy: RecoveryStrategy,
    pub status_code: Option<u16>,
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} (retryable={}, recovery={:?})",
            self.class.as_str(),
            self.message,
            self.retryable,
            self.strategy
        )
    }
}

struct Rule {
    pattern: &'static Lazy<Regex>,
    class: ErrorClass,
    strategy: RecoveryStrategy,
    retryable: bool,
}

static CONTEXT_OVERFLOW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)context|token|too long|max.?length").unwrap());
static RATE_LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)rate|429|quota|too many requests").unwrap());
static AUTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)auth|401|403|api.?key|permission").unwrap());
static TIMEOUT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)timeout|timed ?out|deadline").unwrap());
static ROLE_ORDERING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)role|turn|ordering|must alternate").unwrap());
static IMAGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)image|vision|media|dimension|size").unwrap());
static MODEL_UNAVAILABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)model.{0,30}(not found|unavailable|deprecated)").unwrap());
static TOOL_ERROR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)tool.{0,20}error|error.{0,20}tool").unwrap());
static PARSE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)json|parse|decode").unwrap());

/// Best-effort extraction of an HTTP status code from a raw status hint.
pub fn extract_status_code(hints: &[Option<u16>]) -> Option<u16> {
    hints.iter().find_map(|h| *h)
}

fn build_message(hint: &str, exception_display: &str, cause_display: Option<&str>) -> String {
    let mut parts = Vec::new();
    if !hint.is_empty() {
        parts.push(hint.to_string());
    }
    parts.push(exception_display.to_string());
    if let Some(cause) = cause_display {
        parts.push(cause.to_string());
    }
    parts.join(" | ")
}

/// Classify a raw error string (plus optional context hint / cause / status
/// code) into a [`ClassifiedError`].
///
/// `context_hint` is typically the tool name or API call site; `cause` is the
/// stringified source exception, if any; `status_code` is extracted from
/// known provider SDK attribute names upstream of this call.
pub fn classify_error(
    original: &str,
    context_hint: &str,
    cause: Option<&str>,
    status_code: Option<u16>,
) -> ClassifiedError {
    let msg = build_message(context_hint, original, cause);

    let rules: &[Rule] = &[
        Rule {
            pattern: &CONTEXT_OVERFLOW_RE,
            class: ErrorClass::ContextOverflow,
            strategy: RecoveryStrategy::CompactContext,
            retryable: true,
        },
        Rule {
            pattern: &AUTH_RE,
            class: ErrorClass::AuthError,
            strategy: RecoveryStrategy::RotateModel,
            retryable: false,
        },
        Rule {
            pattern: &TIMEOUT_RE,
            class: ErrorClass::Timeout,
            strategy: RecoveryStrategy::Retry,
            retryable: true,
        },
        Rule {
            pattern: &ROLE_ORDERING_RE,
            class: ErrorClass::RoleOrdering,
            strategy: RecoveryStrategy::ReduceContext,
            retryable: true,
        },
        Rule {
            pattern: &IMAGE_RE,
            class: ErrorClass::ImageError,
            strategy: RecoveryStrategy::SkipTool,
            retryable: false,
        },
        Rule {
            pattern: &MODEL_UNAVAILABLE_RE,
            class: ErrorClass::ModelUnavailable,
            strategy: RecoveryStrategy::RotateModel,
            retryable: true,
        },
        Rule {
            pattern: &TOOL_ERROR_RE,
            class: ErrorClass::ToolError,
            strategy: RecoveryStrategy::SkipTool,
            retryable: false,
        },
        Rule {
            pattern: &PARSE_RE,
            class: ErrorClass::ParseError,
            strategy: RecoveryStrategy::Retry,
            retryable: true,
        },
    ];

    // Context overflow must win over rate limit when both match (rule 1
    // before rule 2): a "maximum context length exceeded" message could also
    // contain "too many requests"-style wording downstream.
    if CONTEXT_OVERFLOW_RE.is_match(&msg) {
        let rule = &rules[0];
        return ClassifiedError {
            original: original.to_string(),
            class: rule.class,
            message: msg,
            retryable: rule.retryable,
            strategy: rule.strategy,
            status_code,
        };
    }

    // Rate limit gets special handling because status code alone can match it.
    if RATE_LIMIT_RE.is_match(&msg) || status_code == Some(429) {
        return ClassifiedError {
            original: original.to_string(),
            class: ErrorClass::RateLimit,
            message: msg,
            retryable: true,
            strategy: RecoveryStrategy::RotateModel,
            status_code,
        };
    }

    if AUTH_RE.is_match(&msg) || matches!(status_code, Some(401) | Some(403)) {
        return ClassifiedError {
            original: original.to_string(),
            class: ErrorClass::AuthError,
            message: msg,
            retryable: false,
            strategy: RecoveryStrategy::RotateModel,
            status_code,
        };
    }

    for rule in &rules[2..] {
        if rule.pattern.is_match(&msg) {
            return ClassifiedError {
                original: original.to_string(),
                class: rule.class,
                message: msg,
                retryable: rule.retryable,
                strategy: rule.strategy,
                status_code,
            };
        }
    }

    ClassifiedError {
        original: original.to_string(),
        class: ErrorClass::Unknown,
        message: msg,
        retryable: true,
        strategy: RecoveryStrategy::Retry,
        status_code,
    }
}

/// Recommend a recovery strategy given the classified error and 1-based
/// retry `attempt`. Escalates to `Abort` once `attempt > max_retries[class]`.
pub fn plan_recovery(error: &ClassifiedError, attempt: u32) -> RecoveryStrategy {
    let max_retries = error.class.max_retries();
    if attempt > max_retries {
        return RecoveryStrategy::Abort;
    }

    match error.class {
        ErrorClass::ContextOverflow => RecoveryStrategy::CompactContext,
        ErrorClass::RateLimit => RecoveryStrategy::RotateModel,
        ErrorClass::AuthError => {
            if attempt <= 1 {
                RecoveryStrategy::RotateModel
            } else {
                RecoveryStrategy::Abort
            }
        }
        ErrorClass::Timeout => RecoveryStrategy::RotateModel,
        ErrorClass::RoleOrdering => RecoveryStrategy::ReduceContext,
        ErrorClass::ImageError => RecoveryStrategy::SkipTool,
        ErrorClass::ModelUnavailable => RecoveryStrategy::RotateModel,
        ErrorClass::ToolError => {
            if attempt <= 1 {
                RecoveryStrategy::SkipTool
            } else {
                RecoveryStrategy::Abort
            }
        }
        ErrorClass::ParseError => RecoveryStrategy::Retry,
        ErrorClass::Unknown => {
            if attempt <= 2 {
                RecoveryStrategy::Retry
            } else {
                RecoveryStrategy::Abort
            }
        }
    }
}

/// Exponential backoff with multiplicative jitter in `[0.5, 1.0]`, capped at
/// `cap` seconds. `base` is 2.0s for `RateLimit`, 0.5s otherwise.
pub fn backoff_delay(attempt: u32, base: f64, cap: f64) -> Duration {
    let raw = base * 2f64.powi(attempt as i32 - 1);
    let capped = raw.min(cap);
    let jitter = rand::thread_rng().gen_range(0.5..=1.0);
    Duration::from_secs_f64(capped * jitter)
}

/// Convenience wrapper choosing the base delay per §4.1.
pub fn backoff_for_class(class: ErrorClass, attempt: u32) -> Duration {
    let base = if class == ErrorClass::RateLimit { 2.0 } else { 0.5 };
    backoff_delay(attempt, base, 30.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_by_status_code() {
        let c = classify_error("boom", "", None, Some(429));
        assert_eq!(c.class, ErrorClass::RateLimit);
        assert_eq!(c.strategy, RecoveryStrategy::RotateModel);
        assert!(c.retryable);
    }

    #[test]
    fn classifies_rate_limit_by_message() {
        let c = classify_error("429 Too Many Requests", "", None, None);
        assert_eq!(c.class, ErrorClass::RateLimit);
        assert!(c.message.contains("429"));
    }

    #[test]
    fn classifies_context_overflow() {
        let c = classify_error("maximum context length exceeded", "", None, None);
        assert_eq!(c.class, ErrorClass::ContextOverflow);
        assert_eq!(c.strategy, RecoveryStrategy::CompactContext);
    }

    #[test]
    fn classifies_auth_by_status() {
        let c = classify_error("forbidden", "", None, Some(403));
        assert_eq!(c.class, ErrorClass::AuthError);
        assert!(!c.retryable);
    }

    #[test]
    fn classification_order_context_before_rate_limit() {
        // "token" should win over a message that also mentions "quota"-style words
        let c = classify_error("token limit exceeded, quota issue", "", None, None);
        assert_eq!(c.class, ErrorClass::ContextOverflow);
    }

    #[test]
    fn classifies_timeout_role_ordering_image_model_tool_parse() {
        assert_eq!(
            classify_error("request timed out", "", None, None).class,
            ErrorClass::Timeout
        );
        assert_eq!(
            classify_error("messages must alternate roles", "", None, None).class,
            ErrorClass::RoleOrdering
        );
        assert_eq!(
            classify_error("unsupported image dimension", "", None, None).class,
            ErrorClass::ImageError
        );
        assert_eq!(
            classify_error("model gpt-9 not found", "", None, None).class,
            ErrorClass::ModelUnavailable
        );
        assert_eq!(
            classify_error("tool execution error", "", None, None).class,
            ErrorClass::ToolError
        );
        assert_eq!(
            classify_error("failed to parse json", "", None, None).class,
            ErrorClass::ParseError
        );
    }

    #[test]
    fn unknown_is_fallback() {
        let c = classify_error("something weird happened", "", None, None);
        assert_eq!(c.class, ErrorClass::Unknown);
        assert_eq!(c.strategy, RecoveryStrategy::Retry);
    }

    #[test]
    fn recovery_plan_escalates_to_abort_past_max_retries() {
        let c = classify_error("tool execution error", "", None, None);
        assert_eq!(plan_recovery(&c, 1), RecoveryStrategy::SkipTool);
        assert_eq!(plan_recovery(&c, 2), RecoveryStrategy::Abort);
    }

    #[test]
    fn recovery_plan_timeout_prefers_rotate_from_first_retry() {
        let c = classify_error("deadline exceeded", "", None, None);
        assert_eq!(plan_recovery(&c, 1), RecoveryStrategy::RotateModel);
        assert_eq!(plan_recovery(&c, 3), RecoveryStrategy::RotateModel);
        assert_eq!(plan_recovery(&c, 4), RecoveryStrategy::Abort);
    }

    #[test]
    fn backoff_is_capped_and_jittered() {
        for attempt in 1..8 {
            let d = backoff_delay(attempt, 2.0, 30.0);
            assert!(d.as_secs_f64() <= 30.0);
            assert!(d.as_secs_f64() >= 0.0);
        }
    }

    #[test]
    fn build_message_joins_hint_exception_and_cause() {
        let c = classify_error("boom", "tool:read_file", Some("OSError: no such file"), None);
        assert!(c.message.contains("tool:read_file"));
        assert!(c.message.contains("boom"));
        assert!(c.message.contains("OSError"));
    }
}
