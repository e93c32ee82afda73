//! Locale-aware parsing of amounts and quantities found in order documents.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// Separator convention used by the submitting channel.
///
/// The documents carry no locale tag, so one convention is configured per
/// deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NumberLocale {
    /// `1.234.567,89`
    #[default]
    DotThousands,
    /// `1,234,567.89`
    CommaThousands,
}

impl FromStr for NumberLocale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dot-thousands" | "es" | "es-cl" => Ok(Self::DotThousands),
            "comma-thousands" | "en" | "en-us" => Ok(Self::CommaThousands),
            other => Err(format!("unknown number locale '{other}'")),
        }
    }
}

impl fmt::Display for NumberLocale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DotThousands => write!(f, "dot-thousands"),
            Self::CommaThousands => write!(f, "comma-thousands"),
        }
    }
}

/// Parse a monetary cell: currency symbols, codes and thousands separators
/// are stripped before conversion. Negative amounts are rejected.
pub fn parse_amount(raw: &str, locale: NumberLocale) -> Option<Decimal> {
    let (thousands, decimal) = match locale {
        NumberLocale::DotThousands => ('.', ','),
        NumberLocale::CommaThousands => (',', '.'),
    };

    let mut cleaned = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            cleaned.push(ch);
        } else if ch == decimal {
            cleaned.push('.');
        } else if ch == thousands || ch.is_whitespace() || ch.is_alphabetic() {
            continue;
        } else if ch == '-' {
            return None;
        } else if matches!(ch, '$' | '€' | '£') {
            continue;
        } else {
            return None;
        }
    }

    if cleaned.is_empty() || cleaned.matches('.').count() > 1 {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

/// Parse a quantity cell: a whole number of at least one unit.
pub fn parse_quantity(raw: &str, locale: NumberLocale) -> Option<u32> {
    let value = parse_amount(raw, locale)?;
    if !value.fract().is_zero() || value < Decimal::ONE {
        return None;
    }
    value.trunc().to_u32()
}
