//! Policy norm tables.
//!
//! UDISE+ assigns every school a structure category in `1..=11` (primary,
//! upper primary, secondary, higher secondary, and composites). The category
//! determines two fixed norms:
//!
//! - the classroom norm: students per classroom
//! - the PTR norm: students per teacher
//!
//! These two mappings are the policy contract of the whole pipeline; they are
//! held in one place so the mapping can be audited (and overridden in
//! configuration) without touching engine SQL.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A validated UDISE+ school structure category code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct SchoolCategory(u8);

impl SchoolCategory {
    /// The fallback category used as a feature value when a school record
    /// carries none (the ML stage encodes category as an integer feature).
    pub const FALLBACK: Self = Self(6);

    /// Validates a raw category code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the code is outside `1..=11`.
    pub fn new(code: i64) -> Result<Self> {
        if (1..=11).contains(&code) {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let code = code as u8;
            Ok(Self(code))
        } else {
            Err(Error::config(format!(
                "school category {code} outside UDISE+ range 1..=11"
            )))
        }
    }

    /// The raw category code.
    #[must_use]
    pub const fn code(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for SchoolCategory {
    type Error = Error;

    fn try_from(code: i64) -> Result<Self> {
        Self::new(code)
    }
}

impl From<SchoolCategory> for i64 {
    fn from(category: SchoolCategory) -> Self {
        Self::from(category.0)
    }
}

/// Students-per-classroom norms by school category.
///
/// Defaults: categories 1-3 → 30, categories 4-5 → 35, everything else → 40.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClassroomNorms {
    /// Norm for categories 1, 2, 3 (primary structures).
    pub primary: u32,
    /// Norm for categories 4, 5 (upper-primary structures).
    pub upper_primary: u32,
    /// Norm for categories 6..=11 (secondary and composite structures).
    pub secondary: u32,
}

impl Default for ClassroomNorms {
    fn default() -> Self {
        Self {
            primary: 30,
            upper_primary: 35,
            secondary: 40,
        }
    }
}

impl ClassroomNorms {
    /// The classroom norm for a category.
    #[must_use]
    pub const fn for_category(&self, category: SchoolCategory) -> u32 {
        match category.code() {
            1..=3 => self.primary,
            4 | 5 => self.upper_primary,
            _ => self.secondary,
        }
    }

    /// The norm applied to rows with no category on record: the most
    /// permissive (secondary) norm.
    #[must_use]
    pub const fn fallback(&self) -> u32 {
        self.secondary
    }
}

/// Pupil-teacher-ratio norms by school category.
///
/// Defaults: categories 1, 2, 3, 5, 6 → 30; categories 4, 7..=11 → 35.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PtrNorms {
    /// PTR for categories 1, 2, 3, 5, 6.
    pub elementary: u32,
    /// PTR for categories 4, 7, 8, 9, 10, 11.
    pub secondary: u32,
}

impl Default for PtrNorms {
    fn default() -> Self {
        Self {
            elementary: 30,
            secondary: 35,
        }
    }
}

impl PtrNorms {
    /// The PTR norm for a category.
    #[must_use]
    pub const fn for_category(&self, category: SchoolCategory) -> u32 {
        match category.code() {
            1 | 2 | 3 | 5 | 6 => self.elementary,
            _ => self.secondary,
        }
    }

    /// The norm applied to rows with no category on record: the most
    /// permissive (secondary) norm.
    #[must_use]
    pub const fn fallback(&self) -> u32 {
        self.secondary
    }
}
