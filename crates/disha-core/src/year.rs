//! The academic-year key.
//!
//! Academic years are strings of the form `"YYYY-YY"` (e.g. `"2024-25"`)
//! where the suffix is the start year plus one, modulo 100. Lexicographic
//! ordering of the canonical form is consistent with chronological ordering,
//! which is what lets every LAG/RANK window order by the raw column.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A validated academic year in `"YYYY-YY"` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AcademicYear {
    start: u16,
}

impl AcademicYear {
    /// Parses and validates an academic year string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidYear`] when the input is not `"YYYY-YY"` or
    /// the suffix is not the start year plus one.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |message: &str| Error::InvalidYear {
            value: value.to_string(),
            message: message.to_string(),
        };

        let (head, tail) = value.split_once('-').ok_or_else(|| invalid("missing '-'"))?;
        if head.len() != 4 || tail.len() != 2 {
            return Err(invalid("expected YYYY-YY"));
        }
        let start: u16 = head.parse().map_err(|_| invalid("start is not a number"))?;
        let suffix: u16 = tail.parse().map_err(|_| invalid("suffix is not a number"))?;
        if (start + 1) % 100 != suffix {
            return Err(invalid("suffix must be start year + 1"));
        }
        if !(1900..=2999).contains(&start) {
            return Err(invalid("start year out of range"));
        }
        Ok(Self { start })
    }

    /// The calendar year in which this academic year starts.
    #[must_use]
    pub const fn start_year(&self) -> u16 {
        self.start
    }

    /// Returns the academic year `k` years after this one.
    ///
    /// Used to label forecast horizons: `2024-25` offset by 1 is `2025-26`.
    #[must_use]
    pub const fn offset(&self, k: u16) -> Self {
        Self {
            start: self.start + k,
        }
    }
}

impl fmt::Display for AcademicYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.start, (self.start + 1) % 100)
    }
}

impl FromStr for AcademicYear {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AcademicYear {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<AcademicYear> for String {
    fn from(year: AcademicYear) -> Self {
        year.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_form() {
        let year = AcademicYear::parse("2024-25").unwrap();
        assert_eq!(year.start_year(), 2024);
        assert_eq!(year.to_string(), "2024-25");
    }

    #[test]
    fn century_wrap_suffix() {
        let year = AcademicYear::parse("2099-00").unwrap();
        assert_eq!(year.offset(1).to_string(), "2100-01");
    }

    #[test]
    fn rejects_mismatched_suffix() {
        assert!(AcademicYear::parse("2024-26").is_err());
        assert!(AcademicYear::parse("2024-24").is_err());
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["2024", "24-25", "2024/25", "abcd-ef", ""] {
            assert!(AcademicYear::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn offset_labels_forecast_horizons() {
        let base = AcademicYear::parse("2024-25").unwrap();
        assert_eq!(base.offset(1).to_string(), "2025-26");
        assert_eq!(base.offset(2).to_string(), "2026-27");
        assert_eq!(base.offset(3).to_string(), "2027-28");
    }

    #[test]
    fn ordering_matches_chronology() {
        let a = AcademicYear::parse("2019-20").unwrap();
        let b = AcademicYear::parse("2024-25").unwrap();
        assert!(a < b);
        // Lexicographic ordering of the display form agrees.
        assert!(a.to_string() < b.to_string());
    }
}
