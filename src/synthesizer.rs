//! Response synthesis - turns the shared context into the final answer

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::context::SharedContext;
use crate::evaluator::{Evaluation, MissingInformation};
use crate::intent::{Intent, IntentKind};
use crate::reasoning::{invoke_with_backoff, BackoffPolicy, ReasoningService, GUIDANCE_TEMPLATE, SYNTHESIS_TEMPLATE};
use crate::session::Request;

const DISCLOSURE_PREFIX: &str = "The following information could not be obtained:";

/// How the answer was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Full,
    Degraded,
    Guidance,
}

/// Answer delivered to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResponse {
    pub answer: String,
    /// Teams whose output fed the answer
    pub sources_used: Vec<String>,
    pub degraded: bool,
    #[serde(default)]
    pub missing: Vec<MissingInformation>,
    pub mode: ResponseMode,
}

pub struct ResponseSynthesizer {
    reasoning: Option<Arc<dyn ReasoningService>>,
    backoff: BackoffPolicy,
}

impl ResponseSynthesizer {
    pub fn new(reasoning: Option<Arc<dyn ReasoningService>>, backoff: BackoffPolicy) -> Self {
        Self { reasoning, backoff }
    }

    /// Rule-based only
    pub fn offline() -> Self {
        Self::new(None, BackoffPolicy::default())
    }

    /// Compose the answer from whatever the context holds.
    ///
    /// A degraded answer always ends with the list of missing outputs, whether
    /// or not the reasoning service mentioned them.
    #[instrument(skip_all, fields(complete = evaluation.complete))]
    pub async fn synthesize(
        &self,
        request: &Request,
        context: &SharedContext,
        evaluation: &Evaluation,
    ) -> FinalResponse {
        let produced = context.produced_values();
        let degraded = evaluation.degraded();

        let mut variables = Map::new();
        variables.insert("query".into(), Value::String(request.text.clone()));
        variables.insert("context".into(), Value::Object(produced.clone()));
        variables.insert(
            "missing".into(),
            Value::Array(
                evaluation
                    .missing
                    .iter()
                    .map(|m| Value::String(m.output_key.clone()))
                    .collect(),
            ),
        );
        variables.insert("degraded".into(), Value::Bool(degraded));

        let mut answer = match self.ask(SYNTHESIS_TEMPLATE, &variables).await {
            Some(text) => text,
            None => render_context(&request.text, &produced),
        };
        if degraded {
            answer.push_str("\n\n");
            answer.push_str(&disclosure(&evaluation.missing));
        }

        let sources_used = context.producers();
        info!(sources = sources_used.len(), degraded, "Response synthesized");
        FinalResponse {
            answer,
            sources_used,
            degraded,
            missing: evaluation.missing.clone(),
            mode: if degraded { ResponseMode::Degraded } else { ResponseMode::Full },
        }
    }

    /// Answer for requests that produced no plan
    #[instrument(skip_all, fields(intent = %intent.kind))]
    pub async fn guidance(&self, request: &Request, intent: &Intent) -> FinalResponse {
        let mut variables = Map::new();
        variables.insert("query".into(), Value::String(request.text.clone()));
        variables.insert("intent".into(), Value::String(intent.kind.to_string()));
        variables.insert("confidence".into(), Value::from(f64::from(intent.confidence)));

        let answer = match self.ask(GUIDANCE_TEMPLATE, &variables).await {
            Some(text) => text,
            None => default_guidance(&intent.kind).to_string(),
        };

        FinalResponse {
            answer,
            sources_used: Vec::new(),
            degraded: false,
            missing: Vec::new(),
            mode: ResponseMode::Guidance,
        }
    }

    async fn ask(&self, template_id: &str, variables: &Map<String, Value>) -> Option<String> {
        let service = self.reasoning.as_ref()?;
        match invoke_with_backoff(service.as_ref(), template_id, variables, &self.backoff).await {
            Ok(output) => {
                let text = output.into_text();
                if text.trim().is_empty() {
                    warn!(template_id, "Reasoning service returned an empty answer, using fallback");
                    None
                } else {
                    Some(text.trim().to_string())
                }
            }
            Err(e) => {
                warn!(template_id, error = %e, "Synthesis fell back to rule-based rendering");
                None
            }
        }
    }
}

fn default_guidance(kind: &IntentKind) -> &'static str {
    match kind {
        IntentKind::Irrelevant => {
            "That request is outside what I can look up. Try asking about a price, \
             a topic to search, or something you want analysed."
        }
        _ => {
            "I could not tell what you are looking for. Could you rephrase the \
             request with the item or topic you are interested in?"
        }
    }
}

/// Deterministic rendering used when no reasoning service answers
fn render_context(query: &str, produced: &Map<String, Value>) -> String {
    if produced.is_empty() {
        return format!("No information could be gathered for \"{query}\".");
    }
    let mut lines = vec![format!("Results for \"{query}\":")];
    for (key, value) in produced {
        lines.push(format!("- {}: {}", humanize(key), render_value(value)));
    }
    lines.join("\n")
}

fn humanize(key: &str) -> String {
    key.replace('_', " ")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

fn disclosure(missing: &[MissingInformation]) -> String {
    if missing.is_empty() {
        return format!("{DISCLOSURE_PREFIX} some results.");
    }
    let items: Vec<String> = missing
        .iter()
        .map(|m| format!("{} ({}: {})", humanize(&m.output_key), m.team, m.reason))
        .collect();
    format!("{DISCLOSURE_PREFIX} {}.", items.join("; "))
}
