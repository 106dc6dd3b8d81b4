//! Line tokenizing helpers and ordered label rules.
//!
//! Vendor tools print `Label (unit) : value` lines whose labels overlap
//! ("Memory Usage" vs "Memory Usage Rate"). A table of [`LabelRule`]s is
//! evaluated top to bottom and the first rule that accepts a line decides
//! which field the line feeds; no line feeds two fields.

/// Maps a line to a field when it contains one of `any_of` and none of
/// `none_of`. Matching is ASCII case-insensitive.
pub(crate) struct LabelRule<F> {
    pub field: F,
    pub any_of: &'static [&'static str],
    pub none_of: &'static [&'static str],
}

impl<F: Copy> LabelRule<F> {
    pub const fn new(field: F, any_of: &'static [&'static str]) -> Self {
        Self {
            field,
            any_of,
            none_of: &[],
        }
    }

    pub const fn excluding(mut self, none_of: &'static [&'static str]) -> Self {
        self.none_of = none_of;
        self
    }

    fn accepts(&self, lowered: &str) -> bool {
        self.any_of.iter().any(|label| lowered.contains(label))
            && !self.none_of.iter().any(|label| lowered.contains(label))
    }
}

/// First rule in `rules` that accepts `line`.
pub(crate) fn classify<F: Copy>(rules: &[LabelRule<F>], line: &str) -> Option<F> {
    let lowered = line.to_ascii_lowercase();
    rules
        .iter()
        .find(|rule| rule.accepts(&lowered))
        .map(|rule| rule.field)
}

/// Trimmed non-blank lines.
pub(crate) fn lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|line| !line.is_empty())
}

/// Text after the first `:`, trimmed; `None` when absent or blank.
pub(crate) fn value_after_colon(line: &str) -> Option<&str> {
    line.split_once(':')
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// Leading numeric token (`[0-9.]+`, optionally signed) of `text`.
fn leading_number(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let negative = text[..start].ends_with('-');
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value = digits.trim_end_matches('.').parse::<f64>().ok()?;
    Some(if negative { -value } else { value })
}

/// First number after the colon, or anywhere in the line when there is no colon.
pub(crate) fn label_number(line: &str) -> Option<f64> {
    match line.split_once(':') {
        Some((_, value)) => leading_number(value),
        None => leading_number(line),
    }
}

/// Physical quantity rounded to the nearest integer.
pub(crate) fn label_rounded(line: &str) -> Option<i64> {
    label_number(line).map(|v| v.round() as i64)
}

/// Counter value; fractional input is truncated, never rounded.
pub(crate) fn label_integer(line: &str) -> Option<i64> {
    label_number(line).map(|v| v.trunc() as i64)
}

/// Whitespace-split tokens.
pub(crate) fn tokens(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Parse an integer token, tolerating trailing non-digits (`45%`, `1234m`).
pub(crate) fn int_token(token: &str) -> Option<i64> {
    let end = token
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || (*i == 0 && *c == '-')))
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    token[..end].parse().ok()
}

/// Store `value` in `slot` only if nothing was stored yet.
pub(crate) fn set_once<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Field {
        Used,
        Rate,
    }

    const RULES: &[LabelRule<Field>] = &[
        LabelRule::new(Field::Used, &["memory usage"]).excluding(&["rate"]),
        LabelRule::new(Field::Rate, &["memory usage rate"]),
    ];

    #[test]
    fn test_overlapping_labels_are_exclusive() {
        assert_eq!(classify(RULES, "Memory Usage(MB)   : 3000"), Some(Field::Used));
        assert_eq!(
            classify(RULES, "Memory Usage Rate(%) : 12"),
            Some(Field::Rate)
        );
        assert_eq!(classify(RULES, "memory usage rate : 1"), Some(Field::Rate));
        assert_eq!(classify(RULES, "Temperature : 40"), None);
    }

    #[test]
    fn test_first_rule_wins() {
        const ORDERED: &[LabelRule<Field>] = &[
            LabelRule::new(Field::Rate, &["usage"]),
            LabelRule::new(Field::Used, &["memory usage"]),
        ];
        assert_eq!(classify(ORDERED, "Memory Usage : 1"), Some(Field::Rate));
    }

    #[test]
    fn test_label_numbers() {
        assert_eq!(label_number("NPU Temperature (C) : 45.6"), Some(45.6));
        assert_eq!(label_rounded("NPU Temperature (C) : 45.6"), Some(46));
        assert_eq!(label_integer("Memory Usage(MB) : 3000.9"), Some(3000));
        assert_eq!(label_integer("Aicore Usage Rate(%) 17"), Some(17));
        assert_eq!(label_number("Health : OK"), None);
        assert_eq!(label_number("Offset : -3"), Some(-3.0));
    }

    #[test]
    fn test_value_after_colon() {
        assert_eq!(value_after_colon("Health   :  OK "), Some("OK"));
        assert_eq!(value_after_colon("Version : 1.2:3"), Some("1.2:3"));
        assert_eq!(value_after_colon("Name :   "), None);
        assert_eq!(value_after_colon("no colon"), None);
    }

    #[test]
    fn test_int_token() {
        assert_eq!(int_token("45%"), Some(45));
        assert_eq!(int_token("1234m"), Some(1234));
        assert_eq!(int_token("-1"), Some(-1));
        assert_eq!(int_token("OK"), None);
        assert_eq!(int_token(""), None);
    }

    #[test]
    fn test_lines_skips_blank() {
        let collected: Vec<_> = lines("  a \n\n   \n b").collect();
        assert_eq!(collected, vec!["a", "b"]);
    }

    #[test]
    fn test_set_once() {
        let mut slot = None;
        set_once(&mut slot, None);
        set_once(&mut slot, Some(1));
        set_once(&mut slot, Some(2));
        assert_eq!(slot, Some(1));
    }
}
