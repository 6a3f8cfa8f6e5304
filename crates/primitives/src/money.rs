//! Monetary units and decimal parsing.

/// Amount in the chain's smallest unit.
pub type Amount = i64;

pub const DECIMALS: usize = 8;
pub const COIN: Amount = 100_000_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AmountError {
    Empty,
    Invalid(String),
    TooManyDecimals(String),
    OutOfRange(String),
}

impl std::fmt::Display for AmountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AmountError::Empty => write!(f, "amount is empty"),
            AmountError::Invalid(value) => write!(f, "invalid amount '{value}'"),
            AmountError::TooManyDecimals(value) => {
                write!(f, "amount has too many decimal places '{value}'")
            }
            AmountError::OutOfRange(value) => write!(f, "amount out of range '{value}'"),
        }
    }
}

impl std::error::Error for AmountError {}

/// Parses a chain-native decimal string ("1.5", "-0.1", "3") into
/// smallest units, scaling by [`COIN`] without going through floats.
pub fn parse_amount(value: &str) -> Result<Amount, AmountError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AmountError::Empty);
    }
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };

    let (whole, frac) = match digits.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (digits, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(AmountError::Invalid(value.to_string()));
    }
    if !whole.chars().all(|ch| ch.is_ascii_digit()) || !frac.chars().all(|ch| ch.is_ascii_digit())
    {
        return Err(AmountError::Invalid(value.to_string()));
    }

    let trimmed_frac = frac.trim_end_matches('0');
    if trimmed_frac.len() > DECIMALS {
        return Err(AmountError::TooManyDecimals(value.to_string()));
    }

    let whole_units = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<Amount>()
            .map_err(|_| AmountError::OutOfRange(value.to_string()))?
    };
    let mut frac_units: Amount = 0;
    if !trimmed_frac.is_empty() {
        let padded = format!("{trimmed_frac:0<width$}", width = DECIMALS);
        frac_units = padded
            .parse::<Amount>()
            .map_err(|_| AmountError::Invalid(value.to_string()))?;
    }

    let total = whole_units
        .checked_mul(COIN)
        .and_then(|units| units.checked_add(frac_units))
        .ok_or_else(|| AmountError::OutOfRange(value.to_string()))?;
    Ok(if negative { -total } else { total })
}

pub fn format_amount(amount: Amount) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    let coin = COIN as u64;
    format!("{sign}{}.{:08}", abs / coin, abs % coin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_decimal_strings() {
        assert_eq!(parse_amount("1.5"), Ok(150_000_000));
        assert_eq!(parse_amount("0.00000001"), Ok(1));
        assert_eq!(parse_amount("10"), Ok(10 * COIN));
        assert_eq!(parse_amount(".5"), Ok(50_000_000));
        assert_eq!(parse_amount("2."), Ok(2 * COIN));
        assert_eq!(parse_amount("-0.25"), Ok(-25_000_000));
        assert_eq!(parse_amount("1.500000000"), Ok(150_000_000));
    }

    #[test]
    fn rejects_malformed_amounts() {
        assert_eq!(parse_amount(""), Err(AmountError::Empty));
        assert!(matches!(parse_amount("."), Err(AmountError::Invalid(_))));
        assert!(matches!(parse_amount("1e8"), Err(AmountError::Invalid(_))));
        assert!(matches!(
            parse_amount("0.000000001"),
            Err(AmountError::TooManyDecimals(_))
        ));
        assert!(matches!(
            parse_amount("999999999999999999"),
            Err(AmountError::OutOfRange(_))
        ));
    }

    #[test]
    fn formats_with_eight_decimals() {
        assert_eq!(format_amount(150_000_000), "1.50000000");
        assert_eq!(format_amount(-1), "-0.00000001");
    }
}
