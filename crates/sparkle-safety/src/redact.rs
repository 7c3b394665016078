use sparkle_core::config::RedactionStrategy;

use crate::pii::{PiiDetector, PiiKind, PiiReport};

/// Applies full or partial redaction to detected PII spans.
///
/// Full redaction is used everywhere a value leaves the request path (logs,
/// persisted events). Partial redaction keeps just enough for the same user
/// to recognise their own value and is never written to the store.
#[derive(Debug)]
pub struct Redactor {
    detector: PiiDetector,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Redactor {
    pub fn new() -> Self {
        Self {
            detector: PiiDetector::new(),
        }
    }

    /// Redact every finding in `text`. Returns the redacted text and the
    /// number of substitutions made.
    pub fn redact_text(&self, text: &str, strategy: RedactionStrategy) -> (String, usize) {
        let report = self.detector.scan(text);
        self.redact_with_report(text, &report, strategy)
    }

    /// Redact using a report already produced for this exact text.
    pub fn redact_with_report(
        &self,
        text: &str,
        report: &PiiReport,
        strategy: RedactionStrategy,
    ) -> (String, usize) {
        if report.findings.is_empty() {
            return (text.to_string(), 0);
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0usize;
        let mut count = 0usize;
        for finding in &report.findings {
            if finding.start < cursor {
                continue;
            }
            out.push_str(&text[cursor..finding.start]);
            let original = &text[finding.start..finding.end];
            out.push_str(&replacement(finding.kind, original, strategy));
            cursor = finding.end;
            count += 1;
        }
        out.push_str(&text[cursor..]);
        (out, count)
    }

    /// Recursively redact every string inside a JSON value. Maps and arrays
    /// are traversed; strings are replaced in place; other scalars are left
    /// untouched.
    pub fn redact_value(&self, value: &mut serde_json::Value, strategy: RedactionStrategy) -> usize {
        match value {
            serde_json::Value::String(s) => {
                let (redacted, count) = self.redact_text(s, strategy);
                if count > 0 {
                    *s = redacted;
                }
                count
            }
            serde_json::Value::Array(items) => items
                .iter_mut()
                .map(|v| self.redact_value(v, strategy))
                .sum(),
            serde_json::Value::Object(map) => map
                .values_mut()
                .map(|v| self.redact_value(v, strategy))
                .sum(),
            _ => 0,
        }
    }
}

fn replacement(kind: PiiKind, original: &str, strategy: RedactionStrategy) -> String {
    match strategy {
        RedactionStrategy::Full => kind.redaction_marker().to_string(),
        RedactionStrategy::Partial => partial_replacement(kind, original),
    }
}

fn partial_replacement(kind: PiiKind, original: &str) -> String {
    match kind {
        PiiKind::Phone => {
            let last4 = last_digits(original, 4);
            format!("***-***-{last4}")
        }
        PiiKind::CreditCard => {
            let last4 = last_digits(original, 4);
            format!("****-****-****-{last4}")
        }
        PiiKind::Email => {
            let (local, domain) = original.split_once('@').unwrap_or((original, ""));
            let first = local.chars().next().unwrap_or('*');
            if domain.is_empty() {
                format!("{first}***")
            } else {
                format!("{first}***@{domain}")
            }
        }
        // Everything else is fully masked even under the partial strategy.
        other => other.redaction_marker().to_string(),
    }
}

fn last_digits(s: &str, n: usize) -> String {
    let digits: Vec<char> = s.chars().filter(|c| c.is_ascii_digit()).collect();
    digits[digits.len().saturating_sub(n)..].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_redaction_replaces_with_markers() {
        let r = Redactor::new();
        let (out, count) =
            r.redact_text("email me at jane@example.com", RedactionStrategy::Full);
        assert_eq!(out, "email me at [EMAIL_REDACTED]");
        assert_eq!(count, 1);
    }

    #[test]
    fn partial_redaction_keeps_last_four() {
        let r = Redactor::new();
        let (out, _) = r.redact_text("call 555-123-4567", RedactionStrategy::Partial);
        assert_eq!(out, "call ***-***-4567");
        let (out, _) = r.redact_text(
            "card 4111-1111-1111-1111",
            RedactionStrategy::Partial,
        );
        assert_eq!(out, "card ****-****-****-1111");
    }

    #[test]
    fn partial_email_keeps_first_char_and_domain() {
        let r = Redactor::new();
        let (out, _) = r.redact_text("jane@example.com", RedactionStrategy::Partial);
        assert_eq!(out, "j***@example.com");
    }

    #[test]
    fn ssn_is_fully_masked_even_partially() {
        let r = Redactor::new();
        let (out, _) = r.redact_text("ssn 123-45-6789", RedactionStrategy::Partial);
        assert_eq!(out, "ssn [SSN_REDACTED]");
    }

    #[test]
    fn json_values_are_traversed_recursively() {
        let r = Redactor::new();
        let mut value = serde_json::json!({
            "customer": {
                "email": "jane@example.com",
                "nested": ["555-123-4567", 42, true],
            },
            "note": "no pii here",
        });
        let count = r.redact_value(&mut value, RedactionStrategy::Full);
        assert_eq!(count, 2);
        assert_eq!(value["customer"]["email"], "[EMAIL_REDACTED]");
        assert_eq!(value["customer"]["nested"][0], "[PHONE_REDACTED]");
        assert_eq!(value["customer"]["nested"][1], 42);
        assert_eq!(value["note"], "no pii here");
    }
}
