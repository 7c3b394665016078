use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// The PII kinds the detector recognises, with their risk weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Ssn,
    CreditCard,
    Email,
    Phone,
    Address,
    Zip,
    Ip,
    Name,
}

impl PiiKind {
    pub fn weight(&self) -> u32 {
        match self {
            PiiKind::Ssn => 10,
            PiiKind::CreditCard => 10,
            PiiKind::Email => 5,
            PiiKind::Phone => 5,
            PiiKind::Address => 3,
            PiiKind::Zip => 2,
            PiiKind::Ip => 1,
            PiiKind::Name => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PiiKind::Ssn => "ssn",
            PiiKind::CreditCard => "credit_card",
            PiiKind::Email => "email",
            PiiKind::Phone => "phone",
            PiiKind::Address => "address",
            PiiKind::Zip => "zip",
            PiiKind::Ip => "ip",
            PiiKind::Name => "name",
        }
    }

    pub fn redaction_marker(&self) -> &'static str {
        match self {
            PiiKind::Ssn => "[SSN_REDACTED]",
            PiiKind::CreditCard => "[CARD_REDACTED]",
            PiiKind::Email => "[EMAIL_REDACTED]",
            PiiKind::Phone => "[PHONE_REDACTED]",
            PiiKind::Address => "[ADDRESS_REDACTED]",
            PiiKind::Zip => "[ZIP_REDACTED]",
            PiiKind::Ip => "[IP_REDACTED]",
            PiiKind::Name => "[NAME_REDACTED]",
        }
    }
}

impl fmt::Display for PiiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0 => RiskLevel::None,
            1..=4 => RiskLevel::Low,
            5..=9 => RiskLevel::Medium,
            10..=19 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::None => "NONE",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

/// One detected PII span.
#[derive(Debug, Clone, Serialize)]
pub struct PiiFinding {
    pub kind: PiiKind,
    pub start: usize,
    pub end: usize,
}

/// Everything the detector found in one text.
#[derive(Debug, Clone, Serialize)]
pub struct PiiReport {
    pub findings: Vec<PiiFinding>,
    pub score: u32,
    pub risk: RiskLevel,
}

impl PiiReport {
    pub fn detected(&self) -> bool {
        !self.findings.is_empty()
    }

    /// CSV of distinct kinds, for the PIIEvent row. Never contains raw PII.
    pub fn types_csv(&self) -> String {
        let mut kinds: Vec<&str> = self.findings.iter().map(|f| f.kind.as_str()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        kinds.join(",")
    }
}

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap());
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\+?1[\-.\s]?)?\(?\d{3}\)?[\-.\s]?\d{3}[\-.\s]?\d{4}\b").unwrap()
});
static SSN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static CARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}[\- ]?\d{4}[\- ]?\d{4}[\- ]?\d{1,7}\b").unwrap());
static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b\d{1,5}\s+[A-Za-z][A-Za-z0-9]*(?:\s+[A-Za-z][A-Za-z0-9]*)?\s+(?:street|st|avenue|ave|road|rd|boulevard|blvd|lane|ln|drive|dr|court|ct|way|place|pl)\b",
    )
    .unwrap()
});
static ZIP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{5}(?:-\d{4})?\b").unwrap());
static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());
static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i:my name is|i am|i'm|this is)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)").unwrap()
});

/// Regex + validator based PII detector. Stateless; one instance per process.
#[derive(Debug, Default)]
pub struct PiiDetector;

impl PiiDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn scan(&self, text: &str) -> PiiReport {
        let mut findings = Vec::new();

        for m in SSN_RE.find_iter(text) {
            if is_valid_ssn(m.as_str()) {
                findings.push(PiiFinding {
                    kind: PiiKind::Ssn,
                    start: m.start(),
                    end: m.end(),
                });
            }
        }

        for m in CARD_RE.find_iter(text) {
            let digits: String = m.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
            if (13..=19).contains(&digits.len()) && luhn_check(&digits) {
                findings.push(PiiFinding {
                    kind: PiiKind::CreditCard,
                    start: m.start(),
                    end: m.end(),
                });
            }
        }

        for m in EMAIL_RE.find_iter(text) {
            findings.push(PiiFinding {
                kind: PiiKind::Email,
                start: m.start(),
                end: m.end(),
            });
        }

        for m in PHONE_RE.find_iter(text) {
            // Skip spans already claimed by SSN or card matches.
            if overlaps(&findings, m.start(), m.end()) {
                continue;
            }
            findings.push(PiiFinding {
                kind: PiiKind::Phone,
                start: m.start(),
                end: m.end(),
            });
        }

        for m in ADDRESS_RE.find_iter(text) {
            findings.push(PiiFinding {
                kind: PiiKind::Address,
                start: m.start(),
                end: m.end(),
            });
        }

        for m in ZIP_RE.find_iter(text) {
            if overlaps(&findings, m.start(), m.end()) {
                continue;
            }
            findings.push(PiiFinding {
                kind: PiiKind::Zip,
                start: m.start(),
                end: m.end(),
            });
        }

        for m in IP_RE.find_iter(text) {
            if overlaps(&findings, m.start(), m.end()) {
                continue;
            }
            findings.push(PiiFinding {
                kind: PiiKind::Ip,
                start: m.start(),
                end: m.end(),
            });
        }

        for c in NAME_RE.captures_iter(text) {
            if let Some(m) = c.get(1) {
                findings.push(PiiFinding {
                    kind: PiiKind::Name,
                    start: m.start(),
                    end: m.end(),
                });
            }
        }

        findings.sort_by_key(|f| f.start);
        let score: u32 = findings.iter().map(|f| f.kind.weight()).sum();
        PiiReport {
            risk: RiskLevel::from_score(score),
            score,
            findings,
        }
    }
}

fn overlaps(findings: &[PiiFinding], start: usize, end: usize) -> bool {
    findings.iter().any(|f| start < f.end && end > f.start)
}

/// Luhn checksum over a digit string.
pub fn luhn_check(digits: &str) -> bool {
    let mut sum = 0u32;
    let mut double = false;
    for c in digits.chars().rev() {
        let Some(d) = c.to_digit(10) else {
            return false;
        };
        let d = if double {
            let doubled = d * 2;
            if doubled > 9 {
                doubled - 9
            } else {
                doubled
            }
        } else {
            d
        };
        sum += d;
        double = !double;
    }
    sum % 10 == 0
}

/// SSN structural validation: area ≠ 000/666/9xx, group ≠ 00, serial ≠ 0000.
pub fn is_valid_ssn(ssn: &str) -> bool {
    let parts: Vec<&str> = ssn.split('-').collect();
    if parts.len() != 3 {
        return false;
    }
    let (area, group, serial) = (parts[0], parts[1], parts[2]);
    if area == "000" || area == "666" || area.starts_with('9') {
        return false;
    }
    if group == "00" || serial == "0000" {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_ssn_and_card_as_critical() {
        let d = PiiDetector::new();
        let report = d.scan("My SSN is 123-45-6789 and card 4111-1111-1111-1111");
        assert_eq!(report.score, 20);
        assert_eq!(report.risk, RiskLevel::Critical);
        assert!(report.types_csv().contains("ssn"));
        assert!(report.types_csv().contains("credit_card"));
    }

    #[test]
    fn invalid_ssn_area_is_ignored() {
        let d = PiiDetector::new();
        assert!(!d.scan("id 000-12-3456").detected());
        assert!(!d.scan("id 666-12-3456").detected());
        assert!(!d.scan("id 912-12-3456").detected());
        assert!(d.scan("ssn 123-45-6789").detected());
    }

    #[test]
    fn card_must_pass_luhn() {
        let d = PiiDetector::new();
        // 4111-1111-1111-1112 fails Luhn.
        let report = d.scan("card 4111-1111-1111-1112");
        assert!(!report.findings.iter().any(|f| f.kind == PiiKind::CreditCard));
        let report = d.scan("card 4111111111111111");
        assert!(report.findings.iter().any(|f| f.kind == PiiKind::CreditCard));
    }

    #[test]
    fn phone_and_email_are_medium_risk_each() {
        let d = PiiDetector::new();
        let report = d.scan("call me at 555-123-4567");
        assert_eq!(report.score, 5);
        assert_eq!(report.risk, RiskLevel::Medium);
        let report = d.scan("j.smith@example.com");
        assert_eq!(report.score, 5);
    }

    #[test]
    fn score_19_is_high_20_is_critical() {
        assert_eq!(RiskLevel::from_score(19), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(20), RiskLevel::Critical);
    }

    #[test]
    fn contextual_name_detection() {
        let d = PiiDetector::new();
        let report = d.scan("Hi, my name is John Smith");
        assert!(report.findings.iter().any(|f| f.kind == PiiKind::Name));
    }

    #[test]
    fn address_detection() {
        let d = PiiDetector::new();
        let report = d.scan("I live at 42 Maple Street");
        assert!(report.findings.iter().any(|f| f.kind == PiiKind::Address));
    }
}
