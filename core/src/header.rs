//! Response header-line parsing.
//!
//! The transfer engine hands every received header-block line to the
//! request, including the status line and the blank line that terminates
//! the block. Those two produce no pair. Everything else must be a
//! well-formed `field-name ":" OWS field-value OWS` line; malformed lines are
//! rejected explicitly rather than split at a guessed position.

use crate::error::HeaderError;

/// Parse one header line.
///
/// Returns `Ok(None)` for the status line (prefix `HTTP/`) and for the empty
/// line ending the header block, `Ok(Some((name, value)))` for a header
/// field, and an error for anything malformed.
pub fn parse_header_line(line: &[u8]) -> Result<Option<(String, String)>, HeaderError> {
    if line.starts_with(b"HTTP/") {
        return Ok(None);
    }

    let line = strip_line_ending(line);
    if line.is_empty() {
        return Ok(None);
    }

    if matches!(line[0], b' ' | b'\t') {
        return Err(HeaderError::ObsoleteFold);
    }

    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(HeaderError::MissingColon)?;
    let (name, rest) = (&line[..colon], &line[colon + 1..]);

    if name.is_empty() {
        return Err(HeaderError::EmptyName);
    }
    if !name.iter().all(|&b| is_tchar(b)) {
        return Err(HeaderError::InvalidName(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }

    let value = trim_ows(rest);
    if value
        .iter()
        .any(|&b| b == b'\r' || b == b'\n' || b == 0)
    {
        return Err(HeaderError::InvalidValue);
    }

    // tchar is a subset of ASCII, so the lossy conversion is exact for names.
    Ok(Some((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(value).into_owned(),
    )))
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

/// RFC 9110 `tchar`.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
