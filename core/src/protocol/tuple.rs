//! Tuple line parsing
//!
//! Result rows are sent as `[ cell,\tcell,\tcell\t]`. String cells are
//! double quoted with C-style escapes, `NULL` is unquoted. Lines starting
//! with `=` carry a single raw cell (plans, traces).

use crate::error::{to_protocol_error, MapiError, Result};

/// A row as received: `None` is SQL NULL
pub type RawRow = Vec<Option<String>>;

const SEPARATOR: &str = ",\t";

/// Parse one tuple line into its cells
pub fn parse_tuple(line: &str, expected_columns: usize) -> Result<RawRow> {
    let cells = if let Some(raw) = line.strip_prefix('=') {
        vec![Some(raw.to_string())]
    } else {
        let body = line
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| MapiError::Protocol(format!("malformed tuple line: {}", truncate(line))))?;
        let body = body.strip_prefix(' ').unwrap_or(body);
        let body = body.strip_suffix('\t').unwrap_or(body);
        split_cells(body)?
    };

    if cells.len() != expected_columns {
        return Err(MapiError::Protocol(format!(
            "tuple has {} cells, expected {}",
            cells.len(),
            expected_columns
        )));
    }
    Ok(cells)
}

fn split_cells(body: &str) -> Result<RawRow> {
    let mut cells = Vec::new();
    let mut rest = body;

    loop {
        let (cell, remainder) = if rest.starts_with('"') {
            let (value, consumed) = unquote(rest)?;
            (Some(value), &rest[consumed..])
        } else {
            let end = rest.find(SEPARATOR).unwrap_or(rest.len());
            let raw = &rest[..end];
            let cell = if raw == "NULL" { None } else { Some(raw.to_string()) };
            (cell, &rest[end..])
        };
        cells.push(cell);

        if remainder.is_empty() {
            break;
        }
        rest = remainder.strip_prefix(SEPARATOR).ok_or_else(|| {
            MapiError::Protocol(format!("expected cell separator before: {}", truncate(remainder)))
        })?;
    }

    Ok(cells)
}

/// Decode a quoted string starting at `input[0] == '"'`.
///
/// Returns the unescaped value and the number of bytes consumed, including
/// both quotes.
fn unquote(input: &str) -> Result<(String, usize)> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 1;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let value = String::from_utf8(out).map_err(to_protocol_error)?;
                return Ok((value, i + 1));
            }
            b'\\' => {
                let escaped = *bytes
                    .get(i + 1)
                    .ok_or_else(|| MapiError::Protocol("dangling escape in string cell".to_string()))?;
                match escaped {
                    b'n' => out.push(b'\n'),
                    b't' => out.push(b'\t'),
                    b'r' => out.push(b'\r'),
                    b'f' => out.push(0x0c),
                    b'0'..=b'7' => {
                        // up to three octal digits
                        let mut value: u32 = 0;
                        let mut len = 0;
                        while len < 3 {
                            match bytes.get(i + 1 + len).copied() {
                                Some(d @ b'0'..=b'7') => {
                                    value = value * 8 + u32::from(d - b'0');
                                    len += 1;
                                }
                                _ => break,
                            }
                        }
                        let byte = u8::try_from(value).map_err(|_| {
                            MapiError::Protocol(format!("octal escape out of range: {}", value))
                        })?;
                        out.push(byte);
                        i += 1 + len;
                        continue;
                    }
                    other => out.push(other),
                }
                i += 2;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    Err(MapiError::Protocol(format!("unterminated string cell: {}", truncate(input))))
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(64) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_tuple() {
        let cells = parse_tuple("[ \"abc\",\t1,\tNULL\t]", 3).unwrap();
        assert_eq!(
            cells,
            vec![Some("abc".to_string()), Some("1".to_string()), None]
        );
    }

    #[test]
    fn test_single_column() {
        let cells = parse_tuple("[ 42\t]", 1).unwrap();
        assert_eq!(cells, vec![Some("42".to_string())]);
    }

    #[test]
    fn test_escapes() {
        let line = "[ \"say \\\"hi\\\"\\n\",\t\"tab\\there\",\t\"back\\\\slash\",\t\"\\101\\102\"\t]";
        let cells = parse_tuple(line, 4).unwrap();
        assert_eq!(cells[0].as_deref(), Some("say \"hi\"\n"));
        assert_eq!(cells[1].as_deref(), Some("tab\there"));
        assert_eq!(cells[2].as_deref(), Some("back\\slash"));
        assert_eq!(cells[3].as_deref(), Some("AB"));
    }

    #[test]
    fn test_separator_inside_string() {
        let cells = parse_tuple("[ \"a,\\tb\",\t\"NULL\"\t]", 2).unwrap();
        assert_eq!(cells[0].as_deref(), Some("a,\tb"));
        // A quoted NULL is a string, not a null cell
        assert_eq!(cells[1].as_deref(), Some("NULL"));
    }

    #[test]
    fn test_multibyte_text() {
        let cells = parse_tuple("[ \"€¿®µ¶¹\",\t\"€¿®µ¶¹\"\t]", 2).unwrap();
        assert_eq!(cells[0].as_deref(), Some("€¿®µ¶¹"));
        assert_eq!(cells[1].as_deref(), Some("€¿®µ¶¹"));
    }

    #[test]
    fn test_raw_line() {
        let cells = parse_tuple("=X_1 := querylog.define(...);", 1).unwrap();
        assert_eq!(cells[0].as_deref(), Some("X_1 := querylog.define(...);"));
    }

    #[test]
    fn test_malformed_tuples() {
        // wrong cell count
        assert!(matches!(parse_tuple("[ 1,\t2\t]", 3), Err(MapiError::Protocol(_))));
        // missing brackets
        assert!(parse_tuple("1,\t2", 2).is_err());
        // unterminated string
        assert!(parse_tuple("[ \"abc\t]", 1).is_err());
        // garbage after a string cell
        assert!(parse_tuple("[ \"abc\"x\t]", 1).is_err());
    }
}
