//! Decoder for the IEEE 488.2 definite-length binary block.
//!
//! ```text
//! # <N> <L, N digits> <L payload bytes> [terminator]
//! ```
//!
//! `N` is a single ASCII digit giving the width of the length field. A block
//! with `N == 0` is an indefinite-length block whose payload runs until the
//! terminator.

const BLOCK_MARKER: u8 = b'#';
const TERMINATOR: u8 = b'\n';

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("Malformed block: empty response")]
    Empty,

    #[error("Malformed block: expected '#' marker but got 0x{0:02x}")]
    MissingMarker(u8),

    #[error("Malformed block: digit count '{0}' is not an ASCII digit")]
    InvalidDigitCount(char),

    #[error("Malformed block: header truncated, need {needed} length digits but {available} bytes remain")]
    TruncatedHeader { needed: usize, available: usize },

    #[error("Malformed block: length field '{0}' is not a non-negative integer")]
    InvalidLength(String),

    #[error("Malformed block: declared {declared} payload bytes but {actual} are present")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Returns `true` if `raw` looks like the start of a binary block.
pub fn is_block(raw: &[u8]) -> bool {
    raw.first() == Some(&BLOCK_MARKER)
}

/// Parse the block header and return `(header_len, declared_len)`.
///
/// `declared_len` is `None` for indefinite-length blocks.
pub fn parse_header(raw: &[u8]) -> Result<(usize, Option<usize>), BlockError> {
    let marker = *raw.first().ok_or(BlockError::Empty)?;
    if marker != BLOCK_MARKER {
        return Err(BlockError::MissingMarker(marker));
    }

    let digit = *raw.get(1).ok_or(BlockError::TruncatedHeader {
        needed: 1,
        available: 0,
    })?;
    if !digit.is_ascii_digit() {
        return Err(BlockError::InvalidDigitCount(char::from(digit)));
    }
    let len_digits = usize::from(digit - b'0');
    if len_digits == 0 {
        return Ok((2, None));
    }

    let field = raw
        .get(2..2 + len_digits)
        .ok_or(BlockError::TruncatedHeader {
            needed: len_digits,
            available: raw.len() - 2,
        })?;
    let field = std::str::from_utf8(field)
        .map_err(|_| BlockError::InvalidLength(String::from_utf8_lossy(field).into_owned()))?;
    let declared = field
        .parse::<usize>()
        .map_err(|_| BlockError::InvalidLength(field.to_string()))?;

    Ok((2 + len_digits, Some(declared)))
}

/// Extract the payload of a binary block.
///
/// A single trailing terminator after the payload is tolerated and stripped.
pub fn decode(raw: &[u8]) -> Result<&[u8], BlockError> {
    let (header_len, declared) = parse_header(raw)?;
    let body = &raw[header_len..];

    let Some(declared) = declared else {
        return Ok(body.strip_suffix(&[TERMINATOR]).unwrap_or(body));
    };

    if body.len() == declared {
        Ok(body)
    } else if body.len() == declared + 1 && body[declared] == TERMINATOR {
        Ok(&body[..declared])
    } else {
        Err(BlockError::LengthMismatch {
            declared,
            actual: body.len(),
        })
    }
}
