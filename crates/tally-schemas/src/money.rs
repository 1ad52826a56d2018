//! Fixed-point money type.
//!
//! All monetary values in this workspace (configured rate, per-event
//! contribution, persisted totals) use a 1e-6 (micros) fixed-point
//! representation stored as `i64`. Decimal strings cross the boundary in both
//! directions without any floating-point step, so `rate * units` is exact for
//! integer unit counts.
//!
//! There is intentionally no `From<i64>`: callers must be deliberate about
//! when a raw integer represents a monetary amount.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Micros per whole currency unit.
pub const MICROS_SCALE: i64 = 1_000_000;

const FRAC_DIGITS: usize = 6;

// ---------------------------------------------------------------------------
// Micros newtype
// ---------------------------------------------------------------------------

/// A fixed-point monetary amount at 1e-6 scale.
///
/// 1 unit of currency = `Micros::new(1_000_000)`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Micros(i64);

impl Micros {
    pub const ZERO: Micros = Micros(0);

    #[inline]
    pub const fn new(raw: i64) -> Self {
        Micros(raw)
    }

    /// Whole currency units, e.g. `Micros::from_whole(35)` is `35`.
    ///
    /// Returns `None` if the value does not fit at micros scale.
    pub fn from_whole(units: i64) -> Option<Self> {
        units.checked_mul(MICROS_SCALE).map(Micros)
    }

    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Overflow-checked addition.
    #[inline]
    pub fn checked_add(self, rhs: Micros) -> Option<Micros> {
        self.0.checked_add(rhs.0).map(Micros)
    }

    /// Multiply a per-unit amount by an integer unit count.
    ///
    /// Returns `None` on overflow. Overflow in a total is a hard error for the
    /// caller, never a routine saturation.
    pub fn checked_mul_units(self, units: u64) -> Option<Micros> {
        let units = i64::try_from(units).ok()?;
        self.0.checked_mul(units).map(Micros)
    }

    /// Parse a decimal string (`"35"`, `"1.00"`, `"-0.5"`) into micros.
    ///
    /// Rules:
    /// - optional leading `+` or `-`
    /// - optional fractional part separated by `.`
    /// - at most 6 fractional digits (more would require rounding)
    /// - no exponent notation, no whitespace inside the number
    pub fn parse_decimal(s: &str) -> Result<Micros, DecimalError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DecimalError::Empty);
        }

        let (negative, digits) = if let Some(rest) = s.strip_prefix('-') {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix('+') {
            (false, rest)
        } else {
            (false, s)
        };

        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));

        let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty())
            || !all_digits(int_part)
            || !all_digits(frac_part)
        {
            return Err(DecimalError::Invalid { raw: s.to_string() });
        }

        if frac_part.len() > FRAC_DIGITS {
            return Err(DecimalError::TooManyDecimalPlaces { raw: s.to_string() });
        }

        let int_val: i64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse::<i64>()
                .map_err(|_| DecimalError::Overflow { raw: s.to_string() })?
        };

        let mut frac_padded = frac_part.to_string();
        while frac_padded.len() < FRAC_DIGITS {
            frac_padded.push('0');
        }
        let frac_val: i64 = frac_padded
            .parse::<i64>()
            .map_err(|_| DecimalError::Invalid { raw: s.to_string() })?;

        let micros = int_val
            .checked_mul(MICROS_SCALE)
            .and_then(|v| v.checked_add(frac_val))
            .ok_or_else(|| DecimalError::Overflow { raw: s.to_string() })?;

        Ok(Micros(if negative { -micros } else { micros }))
    }
}

// ---------------------------------------------------------------------------
// Display: minimal decimal form ("35", "35.5", "0.000001")
// ---------------------------------------------------------------------------

impl std::fmt::Display for Micros {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let abs = self.0.unsigned_abs();
        let scale = MICROS_SCALE as u64;
        let whole = abs / scale;
        let frac = abs % scale;
        if self.0 < 0 {
            f.write_str("-")?;
        }
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let frac_s = format!("{frac:06}");
        write!(f, "{whole}.{}", frac_s.trim_end_matches('0'))
    }
}

// Serialized as the decimal string so API payloads and stored values agree.
impl Serialize for Micros {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Micros {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Micros::parse_decimal(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// DecimalError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecimalError {
    Empty,
    Invalid { raw: String },
    TooManyDecimalPlaces { raw: String },
    Overflow { raw: String },
}

impl std::fmt::Display for DecimalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecimalError::Empty => write!(f, "empty decimal string"),
            DecimalError::Invalid { raw } => write!(f, "invalid decimal '{raw}'"),
            DecimalError::TooManyDecimalPlaces { raw } => {
                write!(f, "decimal '{raw}' has more than 6 fractional digits")
            }
            DecimalError::Overflow { raw } => write!(f, "decimal '{raw}' overflows i64 micros"),
        }
    }
}

impl std::error::Error for DecimalError {}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
