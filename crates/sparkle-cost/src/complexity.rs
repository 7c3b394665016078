use serde::Serialize;

/// Keywords that usually signal a query needing more reasoning.
const REASONING_KEYWORDS: [&str; 5] = ["compare", "explain", "why", "how", "multiple"];

/// History length beyond which a conversation earns a complexity point.
const LONG_HISTORY: usize = 6;
/// Token estimate above which a message counts as long.
const LONG_MESSAGE_TOKENS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
        }
    }

    fn from_score(score: u32) -> Self {
        match score {
            0..=1 => Complexity::Simple,
            2..=3 => Complexity::Medium,
            _ => Complexity::Complex,
        }
    }
}

/// Per-request signals the analyzer folds into the score.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub history_len: usize,
    pub reasoning_required: bool,
    pub previously_escalated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplexityScore {
    pub score: u32,
    pub level: Complexity,
}

/// Scores a query so the router can pick a model tier.
#[derive(Debug, Default)]
pub struct ComplexityAnalyzer;

impl ComplexityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, message: &str, ctx: &QueryContext) -> ComplexityScore {
        let mut score = 0u32;

        if estimate_tokens(message) > LONG_MESSAGE_TOKENS {
            score += 2;
        }

        let lowered = message.to_lowercase();
        for keyword in REASONING_KEYWORDS {
            if lowered.contains(keyword) {
                score += 1;
            }
        }

        if ctx.history_len > LONG_HISTORY {
            score += 1;
        }
        if ctx.reasoning_required {
            score += 2;
        }
        if ctx.previously_escalated {
            score += 3;
        }
        if message.matches('?').count() >= 2 {
            score += 1;
        }

        ComplexityScore {
            score,
            level: Complexity::from_score(score),
        }
    }
}

/// Upper-bound token estimate: one token per four characters.
pub fn estimate_tokens(text: &str) -> u32 {
    text.chars().count().div_ceil(4) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_plain_message_is_simple() {
        let a = ComplexityAnalyzer::new();
        let s = a.analyze("book a clean", &QueryContext::default());
        assert_eq!(s.level, Complexity::Simple);
    }

    #[test]
    fn keywords_and_questions_add_up() {
        let a = ComplexityAnalyzer::new();
        // "compare" +1, "why" +1, two question marks +1 = 3 -> medium.
        let s = a.analyze(
            "can you compare plans? why is one pricier?",
            &QueryContext::default(),
        );
        assert_eq!(s.score, 3);
        assert_eq!(s.level, Complexity::Medium);
    }

    #[test]
    fn escalation_history_forces_complex() {
        let a = ComplexityAnalyzer::new();
        let ctx = QueryContext {
            history_len: 8,
            reasoning_required: false,
            previously_escalated: true,
        };
        let s = a.analyze("ok", &ctx);
        // history +1, escalated +3 = 4 -> complex.
        assert_eq!(s.level, Complexity::Complex);
    }

    #[test]
    fn long_message_counts() {
        let a = ComplexityAnalyzer::new();
        let long = "word ".repeat(60);
        let s = a.analyze(&long, &QueryContext::default());
        assert!(s.score >= 2);
    }

    #[test]
    fn token_estimate_is_ceiling() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
