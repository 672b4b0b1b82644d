//! Scalar quoting for stub documents.

use std::io::{self, Write};

/// Bytes that carry meaning in flow-style YAML.
const SYNTAX_BYTES: &[u8] = b":{}[],&*#?|-<>=!%@` ";

/// Returns true if `token` must be single-quoted to survive as a scalar.
#[inline]
pub fn needs_quotes(token: &[u8]) -> bool {
    token.iter().any(|b| SYNTAX_BYTES.contains(b))
}

/// Returns the number of columns [`write_scalar`] uses for `token`.
pub fn scalar_width(token: &[u8]) -> usize {
    if needs_quotes(token) {
        let escaped = token.iter().filter(|&&b| b == b'\'').count();
        token.len() + escaped + 2
    } else {
        token.len()
    }
}

/// Writes `token`, single-quoted when [`needs_quotes`] says so.
pub fn write_scalar<W: Write>(out: &mut W, token: &[u8]) -> io::Result<()> {
    if !needs_quotes(token) {
        return out.write_all(token);
    }

    out.write_all(b"'")?;
    // A quote inside a single-quoted scalar is written twice.
    for (index, piece) in token.split(|&b| b == b'\'').enumerate() {
        if index != 0 {
            out.write_all(b"''")?;
        }
        out.write_all(piece)?;
    }
    out.write_all(b"'")
}
