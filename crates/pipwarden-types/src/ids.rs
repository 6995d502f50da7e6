//! Pip identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ReportLineError;

/// Stable identifier of a single scheduled tool invocation.
///
/// Rendered as `Pip` followed by 16 upper-case hex digits. The rendering is
/// stable across runs, so it is also used to derive per-invocation file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipId(pub u64);

impl PipId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// File-name friendly form: `pip-<hex>`.
    pub fn file_stem(self) -> String {
        format!("pip-{:016x}", self.0)
    }
}

impl fmt::Display for PipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pip{:016X}", self.0)
    }
}

impl FromStr for PipId {
    type Err = ReportLineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("Pip").unwrap_or(s);
        u64::from_str_radix(hex, 16)
            .map(PipId)
            .map_err(|_| ReportLineError::InvalidField {
                field: "pip_id",
                value: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let id = PipId::new(0xABCD);
        assert_eq!(id.to_string(), "Pip000000000000ABCD");
        assert_eq!("Pip000000000000ABCD".parse::<PipId>().unwrap(), id);
        assert_eq!("abcd".parse::<PipId>().unwrap(), id);
    }

    #[test]
    fn test_file_stem_is_stable() {
        assert_eq!(PipId::new(1).file_stem(), "pip-0000000000000001");
    }

    #[test]
    fn test_invalid_id() {
        assert!("PipXYZ".parse::<PipId>().is_err());
    }
}
