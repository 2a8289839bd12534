//! Coercion of raw source strings into typed values.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;
use unicode_normalization::UnicodeNormalization;

use super::types::{SemanticType, Value};

const NULL_TOKENS: &[&str] = &["", "-", "--", "null", "none", "nil", "n/a", "na"];
const NOT_APPLICABLE: &[&str] = &["Não há", "Não se aplica"];
const DATE_FORMAT: &str = "%d/%m/%Y";

/// Coerce `raw` to `ty`. The error is a human-readable reason.
pub fn coerce(ty: SemanticType, raw: &str) -> Result<Value, String> {
    let value = raw.trim();
    if is_null(value) {
        return Ok(Value::Null);
    }
    match ty {
        SemanticType::Text => Ok(Value::Text(value.to_string())),
        SemanticType::CustomText => {
            if NOT_APPLICABLE.iter().any(|na| value.eq_ignore_ascii_case(na)) {
                Ok(Value::Null)
            } else {
                Ok(Value::Text(value.to_string()))
            }
        }
        SemanticType::Integer | SemanticType::CustomInteger => integer(value),
        SemanticType::Decimal => decimal(value),
        SemanticType::Date => NaiveDate::parse_from_str(value, DATE_FORMAT)
            .map(Value::Date)
            .map_err(|e| format!("not a dd/mm/yyyy date: {}", e)),
        SemanticType::Boolean => boolean(value),
        SemanticType::Cpf => cpf(value).map(Value::Text),
        SemanticType::Secrecy => Err("secrecy marker has no source value".to_string()),
    }
}

pub fn is_null(value: &str) -> bool {
    let value = value.trim();
    NULL_TOKENS.iter().any(|t| value.eq_ignore_ascii_case(t))
}

fn integer(value: &str) -> Result<Value, String> {
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, 'ª' | 'º' | '°') && !c.is_whitespace())
        .collect();
    let (sign, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", cleaned.as_str()),
    };
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(Value::Null);
    }
    format!("{}{}", sign, digits)
        .parse::<i64>()
        .map(Value::Integer)
        .map_err(|e| format!("not an integer: {}", e))
}

fn decimal(value: &str) -> Result<Value, String> {
    let cleaned: String = value
        .replace("R$", "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if is_zero_sentinel(&cleaned) {
        return Ok(Value::Null);
    }
    parse_brazilian_decimal(&cleaned).map(Value::Decimal)
}

/// "0", "0,00", "000.000,00" and friends mean "no value" in these exports.
fn is_zero_sentinel(value: &str) -> bool {
    value.starts_with('0')
        && value.ends_with('0')
        && value.chars().all(|c| matches!(c, '0' | ',' | '.'))
}

/// `1.234,56` → `1234.56`. A dot is always a thousands separator, so
/// `1.000` is one thousand.
pub fn parse_brazilian_decimal(value: &str) -> Result<Decimal, String> {
    let normalized = value.replace('.', "").replace(',', ".");
    Decimal::from_str(&normalized).map_err(|e| format!("not a decimal: {}", e))
}

fn boolean(value: &str) -> Result<Value, String> {
    match strip_accents(value).to_lowercase().as_str() {
        "sim" | "s" | "true" | "t" | "1" => Ok(Value::Boolean(true)),
        "nao" | "n" | "false" | "f" | "0" => Ok(Value::Boolean(false)),
        _ => Err("not a yes/no value".to_string()),
    }
}

pub(crate) fn strip_accents(value: &str) -> String {
    value.nfkd().filter(char::is_ascii).collect()
}

/// Strip punctuation from a CPF; eleven digits or `*` mask characters must remain.
pub fn normalize_cpf(value: &str) -> Option<String> {
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, '.' | '-') && !c.is_whitespace())
        .collect();
    let valid = cleaned.chars().count() == 11
        && cleaned.chars().all(|c| c.is_ascii_digit() || c == '*');
    valid.then_some(cleaned)
}

fn cpf(value: &str) -> Result<String, String> {
    normalize_cpf(value).ok_or_else(|| "not an 11-digit CPF".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Value {
        Value::Decimal(Decimal::from_str(s).unwrap())
    }

    #[test]
    fn money_reinterprets_locale_punctuation() {
        assert_eq!(coerce(SemanticType::Decimal, "89188,11"), Ok(dec("89188.11")));
        assert_eq!(coerce(SemanticType::Decimal, "1.234,56"), Ok(dec("1234.56")));
        assert_eq!(coerce(SemanticType::Decimal, "-1.234.567,8"), Ok(dec("-1234567.8")));
        assert_eq!(coerce(SemanticType::Decimal, "R$ 600,00"), Ok(dec("600")));
        assert_eq!(coerce(SemanticType::Decimal, "1.000"), Ok(dec("1000")));
        assert_eq!(coerce(SemanticType::Decimal, "2.500.000"), Ok(dec("2500000")));
    }

    #[test]
    fn money_zero_sentinel_and_empty_are_null() {
        for raw in ["0,00", "0", "000", "0.000,00", "", "  "] {
            assert_eq!(coerce(SemanticType::Decimal, raw), Ok(Value::Null), "{:?}", raw);
        }
        assert_eq!(coerce(SemanticType::Decimal, "0,50"), Ok(dec("0.50")));
        assert!(coerce(SemanticType::Decimal, "abc").is_err());
    }

    #[test]
    fn dates_are_day_month_year() {
        assert_eq!(
            coerce(SemanticType::Date, "05/03/2020"),
            Ok(Value::Date(NaiveDate::from_ymd_opt(2020, 3, 5).unwrap()))
        );
        assert_eq!(coerce(SemanticType::Date, ""), Ok(Value::Null));
        assert!(coerce(SemanticType::Date, "2020-03-05").is_err());
        assert!(coerce(SemanticType::Date, "31/02/2020").is_err());
    }

    #[test]
    fn integers_drop_padding_and_ordinals() {
        assert_eq!(coerce(SemanticType::CustomInteger, "0042"), Ok(Value::Integer(42)));
        assert_eq!(coerce(SemanticType::CustomInteger, "3ª"), Ok(Value::Integer(3)));
        assert_eq!(coerce(SemanticType::Integer, "000"), Ok(Value::Null));
        assert_eq!(coerce(SemanticType::Integer, "-07"), Ok(Value::Integer(-7)));
        assert!(coerce(SemanticType::Integer, "12a").is_err());
    }

    #[test]
    fn text_variants() {
        assert_eq!(coerce(SemanticType::Text, "  ABC "), Ok(Value::Text("ABC".into())));
        assert_eq!(coerce(SemanticType::Text, "N/A"), Ok(Value::Null));
        assert_eq!(coerce(SemanticType::Text, "Não há"), Ok(Value::Text("Não há".into())));
        assert_eq!(coerce(SemanticType::CustomText, "Não se aplica"), Ok(Value::Null));
        assert_eq!(
            coerce(SemanticType::Text, "***.***.***-**"),
            Ok(Value::Text("***.***.***-**".into()))
        );
    }

    #[test]
    fn booleans_ignore_case_and_accents() {
        assert_eq!(coerce(SemanticType::Boolean, "SIM"), Ok(Value::Boolean(true)));
        assert_eq!(coerce(SemanticType::Boolean, "Não"), Ok(Value::Boolean(false)));
        assert_eq!(coerce(SemanticType::Boolean, "NAO"), Ok(Value::Boolean(false)));
        assert!(coerce(SemanticType::Boolean, "talvez").is_err());
    }

    #[test]
    fn cpf_shapes() {
        assert_eq!(coerce(SemanticType::Cpf, "123.456.789-01"), Ok(Value::Text("12345678901".into())));
        assert_eq!(coerce(SemanticType::Cpf, "***.456.789-**"), Ok(Value::Text("***456789**".into())));
        assert!(coerce(SemanticType::Cpf, "123.456").is_err());
    }
}
