//! Conversions between ledger-native values and domain values.
//!
//! Token amounts on the ledger are fixed-point integers with 18 decimals, timestamps are
//! unix seconds and tickers are `bytes32` right-padded with NUL bytes.

use chrono::{DateTime, Utc};
use ethers::types::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

pub const LEDGER_DECIMALS: u32 = 18;

/// Largest mantissa a `Decimal` can hold (96 bits)
const MAX_MANTISSA: u128 = (1 << 96) - 1;

/// Wei amount as a token amount. Values wider than a `Decimal` mantissa lose their
/// lowest fractional digits; `None` only when the integer part alone does not fit.
pub fn to_decimal(value: U256) -> Option<Decimal> {
    let mut mantissa = value;
    let mut scale = LEDGER_DECIMALS;
    while mantissa > U256::from(MAX_MANTISSA) {
        if scale == 0 {
            return None;
        }
        mantissa /= 10;
        scale -= 1;
    }
    let raw = i128::try_from(mantissa.as_u128()).ok()?;
    Decimal::try_from_i128_with_scale(raw, scale).ok().map(|d| d.normalize())
}

/// Inverse of [`to_decimal`]; digits below the ledger precision are truncated.
pub fn from_decimal(value: Decimal) -> Option<U256> {
    if value.is_sign_negative() {
        return None;
    }
    let scaled = value.checked_mul(Decimal::from(10_u64.pow(LEDGER_DECIMALS)))?;
    scaled.trunc().to_u128().map(U256::from)
}

pub fn to_integer(value: U256) -> Option<u64> {
    if value > U256::from(u64::MAX) {
        return None;
    }
    Some(value.as_u64())
}

pub fn to_timestamp(secs: U256) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(to_integer(secs)?).ok()?;
    DateTime::from_timestamp(secs, 0)
}

pub fn ticker_to_bytes32(ticker: &str) -> Option<[u8; 32]> {
    let bytes = ticker.as_bytes();
    // one byte is reserved for the terminating NUL
    if bytes.is_empty() || bytes.len() > 31 {
        return None;
    }
    let mut out = [0u8; 32];
    out[..bytes.len()].copy_from_slice(bytes);
    Some(out)
}

pub fn bytes32_to_ticker(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    if end == 0 {
        return None;
    }
    String::from_utf8(raw[..end].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_to_decimal_scales_wei() {
        let one_and_half = U256::from(1_500_000_000_000_000_000u128);
        assert_eq!(to_decimal(one_and_half), Some(Decimal::from_str("1.5").unwrap()));
        assert_eq!(to_decimal(U256::zero()), Some(Decimal::ZERO));
        assert_eq!(to_decimal(U256::MAX), None);
    }

    #[test]
    fn test_to_decimal_drops_low_digits_of_wide_amounts() {
        // 1e11 tokens plus one wei needs more than 96 bits at 18 decimals
        let wide = U256::exp10(29) + U256::one();
        assert_eq!(to_decimal(wide), Some(Decimal::from(100_000_000_000u64)));

        let max_integer = U256::from(MAX_MANTISSA) * U256::exp10(18);
        assert_eq!(to_decimal(max_integer), Some(Decimal::MAX));
        assert_eq!(to_decimal(U256::from(MAX_MANTISSA + 1) * U256::exp10(18)), None);
    }

    #[test]
    fn test_from_decimal_truncates_below_precision() {
        let amount = Decimal::from_str("2.25").unwrap();
        assert_eq!(from_decimal(amount), Some(U256::from(2_250_000_000_000_000_000u128)));
        assert_eq!(from_decimal(Decimal::from_str("-1").unwrap()), None);
    }

    #[test]
    fn test_to_timestamp() {
        let ts = to_timestamp(U256::from(1_700_000_000u64)).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(to_timestamp(U256::MAX), None);
    }

    #[test]
    fn test_ticker_bytes32() {
        let raw = ticker_to_bytes32("BAT").unwrap();
        assert_eq!(&raw[..3], b"BAT");
        assert!(raw[3..].iter().all(|b| *b == 0));
        assert_eq!(bytes32_to_ticker(&raw).as_deref(), Some("BAT"));

        assert!(ticker_to_bytes32("").is_none());
        assert!(ticker_to_bytes32(&"X".repeat(32)).is_none());
        assert!(bytes32_to_ticker(&[0u8; 32]).is_none());
    }
}
