//! Intent classification
//!
//! The reasoning service is asked first; when it is unavailable or answers
//! with something unparseable, a deterministic keyword classifier takes over.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::OrchestratorError;
use crate::reasoning::{invoke_with_backoff, BackoffPolicy, ReasoningService, INTENT_TEMPLATE};

const MAX_KEYWORDS: usize = 10;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "about", "what", "that", "this", "from", "are", "was", "you",
    "can", "please", "me", "give", "tell", "how", "of", "a", "an", "is", "to", "in", "on",
];

/// Classified purpose of a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IntentKind {
    PriceLookup,
    Comprehensive,
    Search,
    Analysis,
    Document,
    Unclear,
    Irrelevant,
    /// Registry-defined intent with no built-in meaning
    Other(String),
}

impl IntentKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PriceLookup => "price_lookup",
            Self::Comprehensive => "comprehensive",
            Self::Search => "search",
            Self::Analysis => "analysis",
            Self::Document => "document",
            Self::Unclear => "unclear",
            Self::Irrelevant => "irrelevant",
            Self::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "price_lookup" => Self::PriceLookup,
            "comprehensive" => Self::Comprehensive,
            "search" => Self::Search,
            "analysis" => Self::Analysis,
            "document" => Self::Document,
            "unclear" | "" => Self::Unclear,
            "irrelevant" => Self::Irrelevant,
            other => Self::Other(other.to_string()),
        }
    }

    /// Categories that never produce a plan
    pub fn is_non_actionable(&self) -> bool {
        matches!(self, Self::Unclear | Self::Irrelevant)
    }
}

impl From<String> for IntentKind {
    fn from(value: String) -> Self {
        Self::from_name(&value)
    }
}

impl From<IntentKind> for String {
    fn from(value: IntentKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classification. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub confidence: f32,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub entities: BTreeMap<String, Vec<String>>,
}

impl Intent {
    pub fn new(kind: IntentKind, confidence: f32) -> Self {
        Self {
            kind,
            confidence: clamp_confidence(confidence),
            keywords: Vec::new(),
            entities: BTreeMap::new(),
        }
    }

    pub fn unclear() -> Self {
        Self::new(IntentKind::Unclear, 0.0)
    }

    /// Whether a plan should be built for this intent
    pub fn is_actionable(&self, confidence_threshold: f32) -> bool {
        !self.kind.is_non_actionable() && self.confidence >= confidence_threshold
    }
}

fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// One keyword rule of the fallback classifier
#[derive(Debug, Clone)]
pub struct KeywordRule {
    pub kind: IntentKind,
    pub keywords: Vec<String>,
}

impl KeywordRule {
    pub fn new(kind: IntentKind, keywords: &[&str]) -> Self {
        Self {
            kind,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn matches(&self, lowered: &str, tokens: &[String]) -> usize {
        self.keywords
            .iter()
            .filter(|keyword| {
                if keyword.contains(' ') {
                    lowered.contains(keyword.as_str())
                } else {
                    tokens.iter().any(|t| t == *keyword)
                }
            })
            .count()
    }
}

/// Deterministic keyword classifier used when the reasoning service is out
#[derive(Debug, Clone)]
pub struct HeuristicClassifier {
    rules: Vec<KeywordRule>,
    small_talk: Vec<String>,
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self {
            rules: vec![
                KeywordRule::new(
                    IntentKind::Comprehensive,
                    &["comprehensive", "in-depth", "detailed", "full report", "everything about", "compare"],
                ),
                KeywordRule::new(
                    IntentKind::PriceLookup,
                    &["price", "prices", "cost", "costs", "how much", "quote", "rate"],
                ),
                KeywordRule::new(
                    IntentKind::Analysis,
                    &["analyze", "analyse", "analysis", "trend", "trends", "evaluate", "why"],
                ),
                KeywordRule::new(
                    IntentKind::Document,
                    &["document", "report", "draft", "write", "summary", "memo"],
                ),
                KeywordRule::new(
                    IntentKind::Search,
                    &["find", "search", "look up", "lookup", "who", "where", "latest", "news"],
                ),
            ],
            small_talk: ["hi", "hello", "hey", "thanks", "thank", "bye", "goodbye"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl HeuristicClassifier {
    pub fn with_rules(rules: Vec<KeywordRule>) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    pub fn classify(&self, text: &str) -> Intent {
        let lowered = text.to_lowercase();
        let tokens = tokenize(&lowered);

        let best = self
            .rules
            .iter()
            .map(|rule| (rule, rule.matches(&lowered, &tokens)))
            .filter(|(_, score)| *score > 0)
            // max_by_key keeps the last maximum; iterate reversed so rule order wins ties
            .rev()
            .max_by_key(|(_, score)| *score);

        let mut intent = match best {
            Some((rule, score)) => {
                Intent::new(rule.kind.clone(), (0.4 + 0.15 * score as f32).min(0.85))
            }
            None if !tokens.is_empty() && tokens.iter().all(|t| self.small_talk.contains(t)) => {
                Intent::new(IntentKind::Irrelevant, 0.6)
            }
            None => Intent::new(IntentKind::Unclear, 0.2),
        };
        intent.keywords = extract_keywords(&tokens);
        intent.entities = extract_entities(text);
        intent
    }
}

fn tokenize(lowered: &str) -> Vec<String> {
    lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn extract_keywords(tokens: &[String]) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for token in tokens {
        if token.chars().count() < 3 || STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        if !keywords.contains(token) {
            keywords.push(token.clone());
        }
        if keywords.len() == MAX_KEYWORDS {
            break;
        }
    }
    keywords
}

fn extract_entities(text: &str) -> BTreeMap<String, Vec<String>> {
    let mut entities: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (index, part) in text.split('"').enumerate() {
        if index % 2 == 1 && !part.trim().is_empty() {
            entities.entry("quoted".into()).or_default().push(part.trim().to_string());
        }
    }

    for raw in text.split_whitespace() {
        let word = raw.trim_matches(|c: char| !(c.is_alphanumeric() || c == '.' || c == '$'));
        let digits = word.trim_start_matches('$').trim_end_matches('.');
        let numeric = digits.starts_with(|c: char| c.is_ascii_digit());
        if numeric && digits.parse::<f64>().is_ok() {
            entities.entry("number".into()).or_default().push(digits.to_string());
        } else if (2..=5).contains(&word.len()) && word.chars().all(|c| c.is_ascii_uppercase()) {
            entities.entry("symbol".into()).or_default().push(word.to_string());
        }
    }

    entities
}

/// Shape the reasoning service is asked to produce
#[derive(Debug, Deserialize)]
struct RawIntent {
    intent: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    entities: Map<String, Value>,
}

impl From<RawIntent> for Intent {
    fn from(raw: RawIntent) -> Self {
        let mut intent = Intent::new(IntentKind::from_name(&raw.intent), raw.confidence);
        intent.keywords = raw.keywords.into_iter().take(MAX_KEYWORDS).collect();
        intent.entities = raw
            .entities
            .into_iter()
            .map(|(key, value)| {
                let values = match value {
                    Value::Array(items) => items.iter().map(value_to_string).collect(),
                    other => vec![value_to_string(&other)],
                };
                (key, values)
            })
            .collect();
        intent
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Text → [`Intent`], reasoning first with heuristic fallback
pub struct IntentClassifier {
    reasoning: Option<Arc<dyn ReasoningService>>,
    backoff: BackoffPolicy,
    heuristic: Option<HeuristicClassifier>,
}

impl IntentClassifier {
    pub fn new(
        reasoning: Option<Arc<dyn ReasoningService>>,
        backoff: BackoffPolicy,
        heuristic: Option<HeuristicClassifier>,
    ) -> Self {
        Self {
            reasoning,
            backoff,
            heuristic,
        }
    }

    /// Heuristic-only classifier
    pub fn heuristic() -> Self {
        Self::new(None, BackoffPolicy::default(), Some(HeuristicClassifier::default()))
    }

    #[instrument(skip(self, text), fields(text_len = text.len()))]
    pub async fn classify(&self, text: &str) -> Result<Intent, OrchestratorError> {
        if text.trim().is_empty() {
            debug!("Empty request text, classifying as unclear");
            return Ok(Intent::unclear());
        }

        let mut failure = None;
        if let Some(service) = &self.reasoning {
            let mut variables = Map::new();
            variables.insert("text".into(), Value::String(text.to_string()));

            match invoke_with_backoff(service.as_ref(), INTENT_TEMPLATE, &variables, &self.backoff).await {
                Ok(output) => match output.as_json().map(serde_json::from_value::<RawIntent>) {
                    Some(Ok(raw)) => {
                        let intent = Intent::from(raw);
                        info!(intent = %intent.kind, confidence = intent.confidence, "Classified request");
                        return Ok(intent);
                    }
                    Some(Err(e)) => failure = Some(format!("unexpected classification shape: {e}")),
                    None => failure = Some("classification was not JSON".to_string()),
                },
                Err(e) => failure = Some(e.to_string()),
            }
        }

        match &self.heuristic {
            Some(heuristic) => {
                if let Some(reason) = &failure {
                    warn!(reason = %reason, "Falling back to heuristic classification");
                }
                let intent = heuristic.classify(text);
                info!(
                    intent = %intent.kind,
                    confidence = intent.confidence,
                    "Classified request heuristically"
                );
                Ok(intent)
            }
            None => Err(OrchestratorError::ClassificationFailure(
                failure.unwrap_or_else(|| "no classifier configured".to_string()),
            )),
        }
    }
}
