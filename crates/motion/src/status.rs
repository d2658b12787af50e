//! Status codes surfaced to the command interface.
//!
//! Every failed line is answered with `error:N`; the numeric values are part
//! of the wire protocol and must stay stable.

use thiserror::Error;

/// Result of executing one command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u8)]
pub enum Status {
    #[error("expected command letter")]
    ExpectedCommandLetter = 1,
    #[error("bad number format")]
    BadNumberFormat = 2,
    #[error("invalid statement")]
    InvalidStatement = 3,
    #[error("value cannot be negative")]
    NegativeValue = 4,
    #[error("command requires idle state")]
    IdleError = 8,
    #[error("buffer overflow")]
    Overflow = 11,
    #[error("max step rate exceeded")]
    MaxStepRateExceeded = 12,
    #[error("line length exceeded")]
    LineLengthExceeded = 14,
    #[error("unsupported command")]
    UnsupportedCommand = 20,
    #[error("modal group violation")]
    ModalGroupViolation = 21,
    #[error("undefined feed rate")]
    UndefinedFeedRate = 22,
    #[error("command value not integer")]
    CommandValueNotInteger = 23,
    #[error("axis command conflict")]
    AxisCommandConflict = 24,
    #[error("word repeated")]
    WordRepeated = 25,
    #[error("no axis words")]
    NoAxisWords = 26,
    #[error("invalid line number")]
    InvalidLineNumber = 27,
    #[error("value word missing")]
    ValueWordMissing = 28,
    #[error("axis words exist")]
    AxisWordsExist = 31,
    #[error("no axis words in plane")]
    NoAxisWordsInPlane = 32,
    #[error("invalid target")]
    InvalidTarget = 33,
    #[error("arc radius error")]
    ArcRadiusError = 34,
    #[error("no offsets in plane")]
    NoOffsetsInPlane = 35,
    #[error("unused value words")]
    UnusedWords = 36,
    #[error("max value exceeded")]
    MaxValueExceeded = 38,
}

impl Status {
    /// Numeric code reported as `error:N`.
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_wire_protocol() {
        assert_eq!(Status::ExpectedCommandLetter.code(), 1);
        assert_eq!(Status::WordRepeated.code(), 25);
        assert_eq!(Status::UnusedWords.code(), 36);
        assert_eq!(Status::MaxValueExceeded.code(), 38);
    }
}
