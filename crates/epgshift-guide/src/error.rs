//! Guide error types.

/// The raw feed could not be read as an XMLTV document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ParseError {
    /// Input is not UTF-8.
    #[error("feed is not valid UTF-8 (valid up to byte {valid_up_to})")]
    Encoding {
        /// Length of the valid UTF-8 prefix.
        valid_up_to: usize,
    },
    /// XML syntax error.
    #[error("malformed XML at byte {position}: {message}")]
    Malformed {
        /// Byte offset reported by the reader.
        position: u64,
        /// Reader error message.
        message: String,
    },
    /// The document has no root element.
    #[error("document has no root element")]
    MissingRoot,
    /// The root element is not `<tv>`.
    #[error("unexpected root element <{found}>, expected <tv>")]
    UnexpectedRoot {
        /// Name of the root element found.
        found: String,
    },
    /// Input ended before `</tv>`.
    #[error("document ended before </tv>")]
    Truncated,
}

/// Shifting a programme produced an unrepresentable instant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum NormalizeError {
    /// Offset or shifted timestamp out of range.
    #[error("offset {offset_seconds}s moves a programme of channel {channel} out of range")]
    OutOfRange {
        /// Channel identifier.
        channel: String,
        /// Offset that was applied.
        offset_seconds: i64,
    },
}
