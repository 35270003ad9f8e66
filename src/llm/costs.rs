//! Per-token list prices, keyed by model family.

use rust_decimal::Decimal;

/// (input, output) USD per token. Unknown models cost zero.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let model = model.to_ascii_lowercase();
    // Per million tokens, scaled down by 10^6 via the decimal scale.
    let (input, output) = if model.contains("opus") {
        (15_000_000, 75_000_000)
    } else if model.contains("sonnet") {
        (3_000_000, 15_000_000)
    } else if model.contains("haiku") {
        (800_000, 4_000_000)
    } else if model.contains("gpt-4o-mini") {
        (150_000, 600_000)
    } else if model.contains("gpt-4o") {
        (2_500_000, 10_000_000)
    } else {
        (0, 0)
    };
    (Decimal::new(input, 12), Decimal::new(output, 12))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn sonnet_pricing() {
        let (input, output) = model_cost("claude-sonnet-4-5");
        assert_eq!(input, Decimal::from_str("0.000003").unwrap());
        assert_eq!(output, Decimal::from_str("0.000015").unwrap());
    }

    #[test]
    fn mini_is_not_priced_as_full_model() {
        let (input, _) = model_cost("gpt-4o-mini");
        assert_eq!(input, Decimal::from_str("0.00000015").unwrap());
    }

    #[test]
    fn unknown_model_is_free() {
        assert_eq!(model_cost("local-llama"), (Decimal::ZERO, Decimal::ZERO));
    }
}
