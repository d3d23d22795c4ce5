//! SQL text helpers for escaped identifiers and pattern values

/// Escape character used in `LIKE ... ESCAPE '^'` clauses.
pub const LIKE_ESCAPE: char = '^';

/// Double embedded double quotes so the text can sit inside a quoted
/// identifier.
pub fn sql_escape(text: &str) -> String {
    text.replace('"', "\"\"")
}

/// Quote an identifier for direct inclusion in SQL text.
pub fn quote(identifier: &str) -> String {
    format!("\"{}\"", sql_escape(identifier))
}

/// Escape a value for use inside a `LIKE` pattern with [`LIKE_ESCAPE`].
pub fn like_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '^' | '%' | '_') {
            out.push(LIKE_ESCAPE);
        }
        out.push(c);
    }
    out
}

/// `%value%` containment pattern for a `LIKE ? ESCAPE '^'` clause.
pub fn like_contains(text: &str) -> String {
    format!("%{}%", like_escape(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_doubles_embedded_quotes() {
        assert_eq!(quote("S_a\"b"), "\"S_a\"\"b\"");
    }

    #[test]
    fn test_like_escape_wildcards() {
        assert_eq!(like_escape("a%b_c^d"), "a^%b^_c^^d");
        assert_eq!(like_contains("x_"), "%x^_%");
    }
}
