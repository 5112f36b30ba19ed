use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token accounting reported by a backend for one invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    /// Read a usage object in any of the spellings providers use.
    ///
    /// Chat completions report `prompt_tokens`/`completion_tokens`, the responses
    /// API reports `input_tokens`/`output_tokens`, and remote services forward the
    /// camelCase form they received from the interface. Counts outside the `i32`
    /// range saturate rather than wrap.
    pub fn from_value(value: &Value) -> Option<Self> {
        let field = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| value.get(*name).and_then(|v| v.as_i64()))
                .map(saturate)
        };

        let input_tokens = field(&["prompt_tokens", "input_tokens", "inputTokens", "promptTokens"]);
        let output_tokens = field(&[
            "completion_tokens",
            "output_tokens",
            "outputTokens",
            "completionTokens",
        ]);
        let total_tokens = field(&["total_tokens", "totalTokens"]).or(match (
            input_tokens,
            output_tokens,
        ) {
            (Some(input), Some(output)) => Some(input.saturating_add(output)),
            _ => None,
        });

        if input_tokens.is_none() && output_tokens.is_none() && total_tokens.is_none() {
            return None;
        }
        Some(Usage::new(input_tokens, output_tokens, total_tokens))
    }
}

fn saturate(count: i64) -> i32 {
    i32::try_from(count).unwrap_or(if count < 0 { i32::MIN } else { i32::MAX })
}
