//! Lexicon polarity scoring for review text.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    pub const ALL: [SentimentLabel; 3] = [
        SentimentLabel::Positive,
        SentimentLabel::Neutral,
        SentimentLabel::Negative,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Negative => "negative",
        }
    }
}

pub const POSITIVE_THRESHOLD: f64 = 0.05;
pub const NEGATIVE_THRESHOLD: f64 = -0.05;

const LEXICON: &[(&str, f64)] = &[
    ("amazing", 0.6),
    ("awesome", 1.0),
    ("best", 1.0),
    ("better", 0.5),
    ("easy", 0.43),
    ("excellent", 1.0),
    ("fantastic", 0.4),
    ("fast", 0.2),
    ("fine", 0.42),
    ("fun", 0.3),
    ("good", 0.7),
    ("great", 0.8),
    ("happy", 0.8),
    ("helpful", 0.5),
    ("like", 0.2),
    ("love", 0.5),
    ("nice", 0.6),
    ("perfect", 1.0),
    ("smooth", 0.4),
    ("thanks", 0.2),
    ("useful", 0.3),
    ("wonderful", 1.0),
    ("annoying", -0.8),
    ("awful", -1.0),
    ("bad", -0.7),
    ("broken", -0.4),
    ("buggy", -0.5),
    ("crash", -0.5),
    ("crashes", -0.5),
    ("disappointing", -0.6),
    ("hate", -0.8),
    ("horrible", -1.0),
    ("poor", -0.4),
    ("slow", -0.3),
    ("terrible", -1.0),
    ("useless", -0.5),
    ("waste", -0.2),
    ("worse", -0.4),
    ("worst", -1.0),
    ("wrong", -0.5),
];

const NEGATORS: &[&str] = &["not", "no", "never", "cannot", "nothing", "nobody"];
const INTENSIFIERS: &[(&str, f64)] = &[
    ("very", 1.3),
    ("really", 1.3),
    ("so", 1.3),
    ("extremely", 1.5),
    ("super", 1.3),
    ("totally", 1.3),
];

fn word_polarity(word: &str) -> Option<f64> {
    LEXICON.iter().find(|(w, _)| *w == word).map(|(_, p)| *p)
}

fn is_negator(word: &str) -> bool {
    NEGATORS.contains(&word) || word.ends_with("n't")
}

/// Mean polarity of the lexicon words in `text`, in `[-1, 1]`; `0.0` when none match.
///
/// A negator flips and halves the next scored word; an intensifier scales it.
pub fn polarity(text: &str) -> f64 {
    let lowered = text.to_lowercase();
    let mut scores = Vec::new();
    let mut negate = false;
    let mut boost = 1.0;

    for token in lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
    {
        if is_negator(token) {
            negate = true;
            continue;
        }
        if let Some((_, factor)) = INTENSIFIERS.iter().find(|(w, _)| *w == token) {
            boost = *factor;
            continue;
        }
        if let Some(base) = word_polarity(token) {
            let mut score = (base * boost).clamp(-1.0, 1.0);
            if negate {
                score *= -0.5;
            }
            scores.push(score);
            negate = false;
            boost = 1.0;
        }
    }

    if scores.is_empty() {
        return 0.0;
    }
    (scores.iter().sum::<f64>() / scores.len() as f64).clamp(-1.0, 1.0)
}

pub fn label(text: &str) -> SentimentLabel {
    if text.trim().is_empty() {
        return SentimentLabel::Neutral;
    }
    let score = polarity(text);
    if score > POSITIVE_THRESHOLD {
        SentimentLabel::Positive
    } else if score < NEGATIVE_THRESHOLD {
        SentimentLabel::Negative
    } else {
        SentimentLabel::Neutral
    }
}
