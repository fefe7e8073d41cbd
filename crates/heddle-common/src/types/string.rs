//! Parse errors for identifier strings.

use miette::Diagnostic;
use smol_str::SmolStr;

/// Error produced when a string fails identifier validation.
#[derive(Debug, Clone, thiserror::Error, Diagnostic)]
pub enum AtStrError {
    #[error("{kind} too long: {len} chars (max {max})")]
    #[diagnostic(code(heddle::types::too_long))]
    TooLong {
        kind: &'static str,
        len: usize,
        max: usize,
    },
    #[error("invalid {kind}: {value:?}")]
    #[diagnostic(
        code(heddle::types::invalid),
        help("see the AT Protocol identifier syntax for the expected shape")
    )]
    Invalid { kind: &'static str, value: SmolStr },
    #[error("{kind} uses a disallowed TLD: {value:?}")]
    #[diagnostic(code(heddle::types::disallowed_tld))]
    DisallowedTld { kind: &'static str, value: SmolStr },
}

impl AtStrError {
    pub fn too_long(kind: &'static str, len: usize, max: usize) -> Self {
        Self::TooLong { kind, len, max }
    }

    pub fn invalid(kind: &'static str, value: &str) -> Self {
        Self::Invalid {
            kind,
            value: SmolStr::new(value),
        }
    }

    pub fn disallowed_tld(kind: &'static str, value: &str) -> Self {
        Self::DisallowedTld {
            kind,
            value: SmolStr::new(value),
        }
    }
}
