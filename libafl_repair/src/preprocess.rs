//! Source preprocessing before the first proposal.
//!
//! Comments are removed so the proposer cannot lean on hints left in the
//! buggy program. Line structure is kept, so line numbers in backtraces still
//! point at the right place.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Code,
    LineComment,
    BlockComment,
    Str,
    Char,
}

/// Removes `//` and `/* */` comments from C/C++ source.
///
/// String and character literals are left untouched, and every newline inside
/// a removed comment is kept.
#[must_use]
pub fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut state = State::Code;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    // a comment separates tokens
                    out.push(' ');
                    state = State::BlockComment;
                }
                '"' => {
                    out.push(c);
                    state = State::Str;
                }
                '\'' => {
                    out.push(c);
                    state = State::Char;
                }
                _ => out.push(c),
            },
            State::LineComment => match c {
                '\n' => {
                    out.push('\n');
                    state = State::Code;
                }
                // line continuation keeps the comment going
                '\\' if chars.peek() == Some(&'\n') => {
                    chars.next();
                    out.push('\n');
                }
                _ => {}
            },
            State::BlockComment => match c {
                '*' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::Code;
                }
                '\n' => out.push('\n'),
                _ => {}
            },
            State::Str | State::Char => {
                out.push(c);
                let quote = if state == State::Str { '"' } else { '\'' };
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == quote || c == '\n' {
                    state = State::Code;
                }
            }
        }
    }

    trim_trailing_whitespace(&out)
}

fn trim_trailing_whitespace(source: &str) -> String {
    let mut out = source
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    if source.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Extracts the first block comment of the file as a plain-text description.
///
/// Sample programs usually open with a comment explaining what they do and how
/// they read input; that is the best description we have for seed generation.
#[must_use]
pub fn leading_description(source: &str) -> Option<String> {
    let start = source.find("/*")?;
    // only count it if nothing but preprocessor lines and blanks come first
    let before_is_header = source[..start]
        .lines()
        .all(|line| line.trim().is_empty() || line.trim_start().starts_with('#'));
    if !before_is_header {
        return None;
    }
    let body = &source[start + 2..];
    let end = body.find("*/")?;
    let text = body[..end]
        .lines()
        .map(|line| line.trim().trim_start_matches('*').trim())
        .collect::<Vec<_>>()
        .join("\n");
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use crate::preprocess::{leading_description, strip_comments};

    #[test]
    fn test_strip_comments_keeps_lines() {
        let src = "int a; // the answer\n/* multi\n line */int b;\nint c; /* x */ int d;\n";
        let stripped = strip_comments(src);
        assert_eq!(stripped, "int a;\n\nint b;\nint c;   int d;\n");
        assert_eq!(stripped.lines().count(), src.lines().count());
    }

    #[test]
    fn test_strip_comments_respects_literals() {
        let src = r#"printf("// not a comment /* nor this */\n"); char q = '"'; char s = '/'; // gone"#;
        let stripped = strip_comments(src);
        assert_eq!(
            stripped,
            r#"printf("// not a comment /* nor this */\n"); char q = '"'; char s = '/';"#
        );
    }

    #[test]
    fn test_strip_is_idempotent() {
        let src = "/* header */\n#include <stdio.h>\nint main() { return 0; } // done\n";
        let once = strip_comments(src);
        assert_eq!(strip_comments(&once), once);
        assert!(!once.contains("header"));
    }

    #[test]
    fn test_leading_description() {
        let src = "#include <stdio.h>\n\n/*\n * Reads commands from stdin.\n * Buggy on purpose.\n */\nint main() {}\n";
        assert_eq!(
            leading_description(src).as_deref(),
            Some("Reads commands from stdin.\nBuggy on purpose.")
        );
        assert_eq!(leading_description("int x; /* late */"), None);
    }
}
