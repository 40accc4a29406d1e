use rust_decimal::Decimal;

/// Rounding direction applied when quantizing a value to an exchange increment.
///
/// Sizes and funds on the order path always round [`Rounding::Down`]; the probabilistic
/// sell-sizing branch is the only caller of [`Rounding::Up`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Rounding {
    Down,
    Up,
}

/// Quantize `value` to an integer multiple of `increment`.
///
/// `increment` must be positive; market metadata is validated on ingest so a non-positive
/// increment never reaches this call on the order path.
pub fn quantize(value: Decimal, increment: Decimal, rounding: Rounding) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    let steps = match rounding {
        Rounding::Down => (value / increment).floor(),
        Rounding::Up => (value / increment).ceil(),
    };
    (steps * increment).normalize()
}

/// Whether `value` is an integer multiple of `increment`.
pub fn is_multiple_of(value: Decimal, increment: Decimal) -> bool {
    if increment <= Decimal::ZERO {
        return false;
    }
    (value % increment).is_zero()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_quantize_down() {
        assert_eq!(
            quantize(dec!(1.23456789), dec!(0.01), Rounding::Down),
            dec!(1.23)
        );
        assert_eq!(quantize(dec!(0.09999), dec!(0.01), Rounding::Down), dec!(0.09));
        assert_eq!(quantize(dec!(5), dec!(0.01), Rounding::Down), dec!(5));
    }

    #[test]
    fn test_quantize_up() {
        assert_eq!(
            quantize(dec!(1.2301), dec!(0.01), Rounding::Up),
            dec!(1.24)
        );
        assert_eq!(quantize(dec!(1.23), dec!(0.01), Rounding::Up), dec!(1.23));
    }

    #[test]
    fn test_quantize_non_decimal_increment() {
        assert_eq!(quantize(dec!(12.7), dec!(2.5), Rounding::Down), dec!(10));
        assert_eq!(quantize(dec!(12.7), dec!(2.5), Rounding::Up), dec!(12.5));
    }

    #[test]
    fn test_quantized_value_is_multiple() {
        let increments = [dec!(0.00000001), dec!(0.01), dec!(0.1), dec!(1)];
        let values = [dec!(0.123456789), dec!(42.0000001), dec!(1000)];
        for increment in increments {
            for value in values {
                let down = quantize(value, increment, Rounding::Down);
                let up = quantize(value, increment, Rounding::Up);
                assert!(is_multiple_of(down, increment), "{down} % {increment}");
                assert!(is_multiple_of(up, increment), "{up} % {increment}");
                assert!(down <= value && value <= up);
            }
        }
    }
}
