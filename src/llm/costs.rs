//! Published per-token prices for the models we expect to run against.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) USD per token for a model, matched by name prefix.
///
/// Unknown models fall back to the Sonnet tier so spend is over- rather
/// than under-reported.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let model = model.to_ascii_lowercase();
    let per_million = if model.starts_with("claude-haiku-4") {
        (dec!(1), dec!(5))
    } else if model.starts_with("claude-3-5-haiku") {
        (dec!(0.80), dec!(4))
    } else if model.starts_with("claude-3-haiku") {
        (dec!(0.25), dec!(1.25))
    } else if model.starts_with("claude-opus-4-5") {
        (dec!(5), dec!(25))
    } else if model.starts_with("claude-opus") || model.starts_with("claude-3-opus") {
        (dec!(15), dec!(75))
    } else if model.starts_with("claude") {
        (dec!(3), dec!(15))
    } else if model.starts_with("gpt-4o-mini") {
        (dec!(0.15), dec!(0.60))
    } else if model.starts_with("gpt-4o") {
        (dec!(2.50), dec!(10))
    } else if model.starts_with("gpt-4.1-mini") {
        (dec!(0.40), dec!(1.60))
    } else if model.starts_with("gpt-4.1") {
        (dec!(2), dec!(8))
    } else {
        (dec!(3), dec!(15))
    };
    let million = dec!(1_000_000);
    (per_million.0 / million, per_million.1 / million)
}
