//! Keyword-frequency fallback sentiment scoring for call transcripts.
//!
//! This scorer is deliberately offline and deterministic: it is the cheap
//! fallback used when no hosted analysis is available, producing bounded
//! scores on the 0-25 scale the wellness tracker works in.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ceiling for each per-category score.
pub const SCORE_CAP: f64 = 25.0;

/// Bound for the derived mental-health impact value.
pub const IMPACT_BOUND: f64 = 25.0;

const POSITIVE_KEYWORDS: &[&str] = &[
    "happy", "good", "great", "better", "fine", "well", "glad", "joy",
];

const NEGATIVE_KEYWORDS: &[&str] = &[
    "sad", "bad", "depressed", "anxious", "worried", "stress", "difficult", "hard",
];

/// Sentiment category, ordered by tie-break priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sentiment::Positive => write!(f, "positive"),
            Sentiment::Neutral => write!(f, "neutral"),
            Sentiment::Negative => write!(f, "negative"),
        }
    }
}

/// The result of scoring one transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentScores {
    pub positive: f64,
    pub negative: f64,
    pub neutral: f64,
    /// Fraction of recognized keywords relative to text length, in [0, 1].
    pub confidence: f64,
    pub emotions_detected: Vec<String>,
    pub key_phrases: Vec<String>,
}

impl SentimentScores {
    /// A neutral result for empty or unscorable input.
    pub fn neutral() -> Self {
        Self {
            positive: 0.0,
            negative: 0.0,
            neutral: SCORE_CAP,
            confidence: 0.0,
            emotions_detected: Vec::new(),
            key_phrases: Vec::new(),
        }
    }

    /// The numerically largest category. Exact ties resolve in the order
    /// positive > neutral > negative.
    pub fn dominant(&self) -> Sentiment {
        if self.positive >= self.neutral && self.positive >= self.negative {
            Sentiment::Positive
        } else if self.neutral >= self.negative {
            Sentiment::Neutral
        } else {
            Sentiment::Negative
        }
    }

    /// Signed contribution to the overall wellness score, clamped to
    /// [-IMPACT_BOUND, +IMPACT_BOUND].
    pub fn mental_health_impact(&self) -> f64 {
        (self.positive - self.negative).clamp(-IMPACT_BOUND, IMPACT_BOUND)
    }
}

/// Scores a transcript by keyword frequency.
///
/// Each category score is `min(matches / words * 100, 25)`; neutral is the
/// zero-floored remainder up to the cap, so a text with no recognized
/// keywords comes out fully neutral.
pub fn analyze(text: &str) -> SentimentScores {
    let total_words = text.split_whitespace().count();
    if total_words == 0 {
        return SentimentScores::neutral();
    }

    let lowered = text.to_lowercase();
    let positive_hits = POSITIVE_KEYWORDS
        .iter()
        .filter(|kw| lowered.contains(*kw))
        .count();
    let negative_hits = NEGATIVE_KEYWORDS
        .iter()
        .filter(|kw| lowered.contains(*kw))
        .count();

    let words = total_words as f64;
    let positive = (positive_hits as f64 / words * 100.0).min(SCORE_CAP);
    let negative = (negative_hits as f64 / words * 100.0).min(SCORE_CAP);
    let neutral = (SCORE_CAP - positive - negative).max(0.0);

    let confidence =
        ((positive_hits + negative_hits) as f64 / (words / 10.0).max(1.0)).min(1.0);

    tracing::debug!(
        total_words,
        positive_hits,
        negative_hits,
        confidence,
        "Transcript scored"
    );

    SentimentScores {
        positive,
        negative,
        neutral,
        confidence,
        emotions_detected: Vec::new(),
        key_phrases: Vec::new(),
    }
}
