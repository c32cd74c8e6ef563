//! Helpers for normalizing text cells before they enter the queue.
//!
//! Delimited files arrive from spreadsheets and shell pipelines with
//! byte-order marks, stray carriage returns and padding — these functions
//! ensure every cell is clean before it is matched or stored.

/// Strips a leading UTF-8 byte-order mark, if present.
pub fn strip_bom(s: &str) -> &str {
    s.strip_prefix('\u{feff}').unwrap_or(s)
}

/// Normalizes a single cell: strips a BOM, removes embedded carriage
/// returns, and trims surrounding whitespace and control characters.
pub fn normalize_cell(s: &str) -> String {
    let s = strip_bom(s);
    let s: String = s.chars().filter(|c| *c != '\r').collect();
    s.trim_matches(|c: char| c.is_whitespace() || c.is_control())
        .to_string()
}

/// Flattens a message to a single line: newlines (including `\r\n` pairs)
/// become single spaces, and the result is trimmed.
///
/// Used for `last_error`, which must survive a one-row-per-record file.
pub fn flatten_newlines(s: &str) -> String {
    s.replace("\r\n", " ")
        .replace(['\r', '\n'], " ")
        .trim()
        .to_string()
}

/// Normalizes a header cell or alias for matching: BOM/control stripped,
/// trimmed, lowercased. Alias matching is case/whitespace-insensitive.
pub fn norm_key(s: &str) -> String {
    normalize_cell(s).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_bom() {
        assert_eq!(strip_bom("\u{feff}id"), "id");
        assert_eq!(strip_bom("id"), "id");
    }

    #[test]
    fn test_normalize_cell_trims_whitespace() {
        assert_eq!(normalize_cell("  value \t"), "value");
    }

    #[test]
    fn test_normalize_cell_strips_carriage_returns() {
        assert_eq!(normalize_cell("va\rlue\r"), "value");
    }

    #[test]
    fn test_normalize_cell_strips_bom() {
        assert_eq!(normalize_cell("\u{feff} id "), "id");
    }

    #[test]
    fn test_normalize_cell_keeps_interior_spaces() {
        assert_eq!(normalize_cell(" two words "), "two words");
    }

    #[test]
    fn test_flatten_newlines_crlf() {
        assert_eq!(flatten_newlines("api\r\ntimeout"), "api timeout");
    }

    #[test]
    fn test_flatten_newlines_mixed() {
        assert_eq!(flatten_newlines("a\nb\rc"), "a b c");
    }

    #[test]
    fn test_flatten_newlines_no_newlines() {
        assert_eq!(flatten_newlines("api timeout"), "api timeout");
    }

    #[test]
    fn test_norm_key_case_insensitive() {
        assert_eq!(norm_key(" Order ID "), "order id");
        assert_eq!(norm_key("\u{feff}ID"), "id");
    }
}
