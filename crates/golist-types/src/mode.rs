use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Set of package fields a caller asks `go list` to fill in.
///
/// Bit values match the go/packages `LoadMode` constants so driver requests
/// read from stdin can be stored without translation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadMode(u32);

impl LoadMode {
    pub const NEED_NAME: Self = Self(1 << 0);
    pub const NEED_FILES: Self = Self(1 << 1);
    pub const NEED_COMPILED_GO_FILES: Self = Self(1 << 2);
    pub const NEED_IMPORTS: Self = Self(1 << 3);
    pub const NEED_DEPS: Self = Self(1 << 4);
    pub const NEED_EXPORT_FILE: Self = Self(1 << 5);
    pub const NEED_TYPES: Self = Self(1 << 6);
    pub const NEED_SYNTAX: Self = Self(1 << 7);
    pub const NEED_TYPES_INFO: Self = Self(1 << 8);
    pub const NEED_TYPES_SIZES: Self = Self(1 << 9);
    pub const NEED_MODULE: Self = Self(1 << 10);

    /// Build a mode from raw go/packages bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for LoadMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LoadMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_contains() {
        let mode = LoadMode::NEED_NAME | LoadMode::NEED_DEPS;
        assert!(mode.contains(LoadMode::NEED_NAME));
        assert!(mode.contains(LoadMode::NEED_DEPS));
        assert!(!mode.contains(LoadMode::NEED_TYPES));
        assert!(!mode.is_empty());
        assert!(LoadMode::default().is_empty());
    }

    #[test]
    fn test_mode_serializes_as_bits() {
        let mode = LoadMode::NEED_NAME | LoadMode::NEED_FILES;
        assert_eq!(mode.bits(), 3);
        assert_eq!(serde_json::to_string(&mode).unwrap(), "3");

        let back: LoadMode = serde_json::from_str("3").unwrap();
        assert_eq!(back, mode);
        assert_eq!(LoadMode::from_bits(3), mode);
    }
}
