//! Token and API cost tracking per run.

use crate::backend::TokenUsage;
use serde::{Deserialize, Serialize};

/// USD price per 1M input/output tokens for a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Pricing per 1M tokens. Unknown models cost zero (recorded, not priced).
pub fn pricing_for(model: &str) -> ModelPricing {
    let (input, output) = match model {
        // Anthropic
        "claude-3-5-sonnet-20241022" => (3.00, 15.00),
        "claude-3-opus-20240229" => (15.00, 75.00),
        "claude-3-5-haiku-20241022" => (0.80, 4.00),
        // OpenAI
        "gpt-4o" => (2.50, 10.00),
        "gpt-4o-mini" => (0.15, 0.60),
        "gpt-4-turbo" => (10.00, 30.00),
        // Google
        "gemini-1.5-pro" => (1.25, 5.00),
        "gemini-1.5-flash" => (0.075, 0.30),
        _ => (0.0, 0.0),
    };
    ModelPricing {
        input_per_mtok: input,
        output_per_mtok: output,
    }
}

/// Cost tracking for a single model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    pub question_id: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// USD.
    pub input_cost: f64,
    /// USD.
    pub output_cost: f64,
    /// USD.
    pub total_cost: f64,
    pub latency_ms: u64,
}

impl CostEntry {
    /// Price one model call.
    pub fn new(question_id: &str, model: &str, usage: TokenUsage, latency_ms: u64) -> Self {
        let pricing = pricing_for(model);
        let input_cost = (usage.input_tokens as f64 / 1_000_000.0) * pricing.input_per_mtok;
        let output_cost = (usage.output_tokens as f64 / 1_000_000.0) * pricing.output_per_mtok;

        Self {
            question_id: question_id.to_string(),
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
            latency_ms,
        }
    }
}

/// Aggregated costs for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCosts {
    pub run_id: String,
    pub model: String,
    pub entries: Vec<CostEntry>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: f64,
    pub total_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub cost_per_question: f64,
}

impl RunCosts {
    /// Aggregate per-call entries into run totals. An empty entry list
    /// yields zeroed totals (a fully-failed run still gets a record).
    pub fn aggregate(run_id: &str, model: &str, entries: Vec<CostEntry>) -> Self {
        let total_input_tokens: u64 = entries.iter().map(|e| e.input_tokens as u64).sum();
        let total_output_tokens: u64 = entries.iter().map(|e| e.output_tokens as u64).sum();
        let total_cost: f64 = entries.iter().map(|e| e.total_cost).sum();
        let total_latency_ms: u64 = entries.iter().map(|e| e.latency_ms).sum();
        let n = entries.len();

        Self {
            run_id: run_id.to_string(),
            model: model.to_string(),
            entries,
            total_input_tokens,
            total_output_tokens,
            total_cost,
            total_latency_ms,
            avg_latency_ms: if n > 0 {
                total_latency_ms as f64 / n as f64
            } else {
                0.0
            },
            cost_per_question: if n > 0 { total_cost / n as f64 } else { 0.0 },
        }
    }

    /// Human-readable cost summary.
    pub fn format_summary(&self) -> String {
        format!(
            "## Cost Summary: {}\n\
             | Metric | Value |\n\
             |--------|-------|\n\
             | Model | {} |\n\
             | Input Tokens | {} |\n\
             | Output Tokens | {} |\n\
             | Total Cost | ${:.4} |\n\
             | Cost/Question | ${:.6} |\n\
             | Avg Latency | {:.0}ms |",
            self.run_id,
            self.model,
            self.total_input_tokens,
            self.total_output_tokens,
            self.total_cost,
            self.cost_per_question,
            self.avg_latency_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_pricing() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 500_000,
        };
        let entry = CostEntry::new("q1", "gpt-4o", usage, 1200);
        assert!((entry.input_cost - 2.50).abs() < 1e-9);
        assert!((entry.output_cost - 5.00).abs() < 1e-9);
        assert!((entry.total_cost - 7.50).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_costs_zero() {
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 1000,
        };
        let entry = CostEntry::new("q1", "local-model", usage, 10);
        assert_eq!(entry.total_cost, 0.0);
    }

    #[test]
    fn test_aggregation() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
        };
        let entries = vec![
            CostEntry::new("q1", "gpt-4o-mini", usage, 100),
            CostEntry::new("q2", "gpt-4o-mini", usage, 300),
        ];
        let costs = RunCosts::aggregate("run-1", "gpt-4o-mini", entries);

        assert_eq!(costs.total_input_tokens, 200);
        assert_eq!(costs.total_output_tokens, 100);
        assert_eq!(costs.total_latency_ms, 400);
        assert!((costs.avg_latency_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_run_zeroed() {
        let costs = RunCosts::aggregate("run-1", "gpt-4o", Vec::new());
        assert_eq!(costs.total_cost, 0.0);
        assert_eq!(costs.avg_latency_ms, 0.0);
    }
}
