//! Price text parsing
//!
//! Retail shops render prices in many shapes: "13,95 €", "€ 13.95",
//! "ab 2,49€", "1.299,00 €". Parsing is deliberately forgiving — text
//! that carries no recognizable amount yields `None`, never an error,
//! so an unpriced tile still counts as a successful scrape.

use once_cell::sync::Lazy;
use regex::Regex;

// First group: integer part with optional thousands separators.
// Second group: optional decimal part after comma or dot.
static PRICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,4}(?:[.\s]\d{3})*|\d+)(?:[,.](\d{1,2}))?")
        .expect("price regex is valid")
});

/// Parse a localized price string into a numeric amount.
///
/// Decimal commas and decimal dots are both accepted; thousands
/// separators (dot or thin space) are stripped. Surrounding currency
/// symbols and labels like "ab" or "UVP" are ignored.
pub fn parse_price(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let caps = PRICE_RE.captures(trimmed)?;
    let integer_part: String = caps
        .get(1)?
        .as_str()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    let decimal_part = caps.get(2).map_or("0", |m| m.as_str());

    let normalized = format!("{integer_part}.{decimal_part}");
    normalized.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1,95 €", Some(1.95))]
    #[case("13.50", Some(13.5))]
    #[case("13,95 €", Some(13.95))]
    #[case("€ 4,45", Some(4.45))]
    #[case("ab 2,49€", Some(2.49))]
    #[case("1.299,00 €", Some(1299.0))]
    #[case("UVP 9,99 €", Some(9.99))]
    #[case("7", Some(7.0))]
    #[case("0,89 € / 100 ml", Some(0.89))]
    fn parses_localized_prices(#[case] input: &str, #[case] expected: Option<f64>) {
        let parsed = parse_price(input);
        match (parsed, expected) {
            (Some(got), Some(want)) => assert!(
                (got - want).abs() < f64::EPSILON,
                "parse_price({input:?}) = {got}, want {want}"
            ),
            (got, want) => assert_eq!(got, want, "parse_price({input:?})"),
        }
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("N/A")]
    #[case("Preis auf Anfrage")]
    fn unparseable_input_yields_none(#[case] input: &str) {
        assert_eq!(parse_price(input), None);
    }
}
