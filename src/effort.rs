//! Reasoning effort handling: model-name suffixes, per-family normalization
//! and backend protocol selection.

use crate::config::{ReasoningConfig, RoutingConfig};
use crate::models::ModelRegistry;
use crate::protocol::{ChatCompletionRequest, ReasoningEffort};

/// Effort suffixes in priority order (most specific first so `-high` is never
/// matched inside `-thinking` or `-xhigh`)
const EFFORT_SUFFIXES: [(&str, ReasoningEffort); 7] = [
    ("-thinking", ReasoningEffort::High),
    ("-xhigh", ReasoningEffort::Xhigh),
    ("-high", ReasoningEffort::High),
    ("-medium", ReasoningEffort::Medium),
    ("-low", ReasoningEffort::Low),
    ("-minimal", ReasoningEffort::Minimal),
    ("-none", ReasoningEffort::None),
];

/// Smallest budget the budget-driven family accepts
const MIN_THINKING_BUDGET: u32 = 1024;

/// Split an effort suffix off a model name
/// (e.g., "gpt-5.1-codex-high" → ("gpt-5.1-codex", High))
pub fn split_effort_suffix(model: &str) -> Option<(&str, ReasoningEffort)> {
    EFFORT_SUFFIXES.iter().find_map(|(suffix, effort)| {
        let base = model.strip_suffix(suffix)?;
        (!base.is_empty()).then_some((base, *effort))
    })
}

/// Rewrite `request.model` to its base name and record the suffix effort.
/// Returns `false` and leaves the request untouched when no suffix matches.
pub fn apply_effort_suffix(request: &mut ChatCompletionRequest) -> bool {
    let Some((base, effort)) = split_effort_suffix(&request.model) else {
        return false;
    };
    request.model = base.to_string();
    request.reasoning_effort = Some(effort);
    true
}

/// Share of the output cap given to thinking, in tenths
fn budget_tenths(effort: ReasoningEffort) -> u64 {
    match effort {
        ReasoningEffort::None => 0,
        ReasoningEffort::Minimal => 1,
        ReasoningEffort::Low => 2,
        ReasoningEffort::Medium => 4,
        ReasoningEffort::High => 6,
        ReasoningEffort::Xhigh => 8,
    }
}

/// Token budget for `effort` given the output cap. `None` when the effort
/// maps to a zero ratio or there is no cap to derive from.
pub fn thinking_budget(effort: ReasoningEffort, max_output_tokens: Option<u32>) -> Option<u32> {
    let tenths = budget_tenths(effort);
    let max = max_output_tokens?;
    if tenths == 0 {
        return None;
    }
    let derived = u32::try_from(u64::from(max) * tenths / 10).unwrap_or(u32::MAX);
    Some(derived.max(MIN_THINKING_BUDGET))
}

fn matches_prefix(model: &str, prefixes: &[String]) -> bool {
    let model = model.to_ascii_lowercase();
    prefixes
        .iter()
        .any(|prefix| model.starts_with(&prefix.to_ascii_lowercase()))
}

/// Maps abstract effort levels onto what each model family understands
#[derive(Debug, Clone)]
pub struct ReasoningPolicy {
    budget_model_prefixes: Vec<String>,
    xhigh_model_prefixes: Vec<String>,
}

impl ReasoningPolicy {
    pub fn new(config: &ReasoningConfig) -> Self {
        Self {
            budget_model_prefixes: config.budget_model_prefixes.clone(),
            xhigh_model_prefixes: config.xhigh_model_prefixes.clone(),
        }
    }

    pub fn uses_budget(&self, model: &str) -> bool {
        matches_prefix(model, &self.budget_model_prefixes)
    }

    fn supports_xhigh(&self, model: &str) -> bool {
        matches_prefix(model, &self.xhigh_model_prefixes)
    }

    /// Reconcile `reasoning_effort` / `thinking_budget` so that exactly the
    /// control the target family understands is left on the request.
    pub fn normalize(&self, request: &mut ChatCompletionRequest, registry: &ModelRegistry) {
        if request.output_cap().is_none() {
            request.max_tokens = registry.max_output_tokens(&request.model);
        }
        let cap = request.output_cap();

        if self.uses_budget(&request.model) {
            let effort = request.reasoning_effort.take();
            if request.thinking_budget.is_none() {
                request.thinking_budget =
                    effort.and_then(|effort| thinking_budget(effort, cap));
            }
            return;
        }

        request.thinking_budget = None;
        if request.reasoning_effort == Some(ReasoningEffort::Xhigh)
            && !self.supports_xhigh(&request.model)
        {
            request.reasoning_effort = Some(ReasoningEffort::High);
        }
    }
}

/// Which protocol a request is sent with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMode {
    /// Forwarded unchanged to the Chat Completions backend
    ChatCompletions,
    /// Converted and sent to the Responses backend
    Responses,
}

#[derive(Debug, Clone)]
pub struct BackendSelector {
    models: Vec<String>,
    prefixes: Vec<String>,
}

impl BackendSelector {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            models: config
                .responses_models
                .iter()
                .map(|m| m.to_ascii_lowercase())
                .collect(),
            prefixes: config.responses_model_prefixes.clone(),
        }
    }

    /// Classify an already suffix-stripped model name
    pub fn select(&self, model: &str) -> UpstreamMode {
        let lower = model.to_ascii_lowercase();
        if self.models.contains(&lower) || matches_prefix(model, &self.prefixes) {
            UpstreamMode::Responses
        } else {
            UpstreamMode::ChatCompletions
        }
    }
}
