//! Minimal shell tokenizer used to find every executable in a command line.
//!
//! This is not a shell parser. It understands quoting and the command
//! separators `&&`, `||`, `;`, `|`, `&` and newlines; anything it cannot
//! reason about (command substitution, subshells) is reported as an error
//! so the caller can deny.

use std::iter::Peekable;
use std::str::Chars;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,

    #[error("unterminated quote")]
    UnterminatedQuote,

    #[error("command substitution is not allowed")]
    Substitution,

    #[error("subshells and grouping are not allowed")]
    Subshell,

    #[error("segment has no executable")]
    MissingExecutable,
}

#[derive(Default)]
struct Splitter {
    segments: Vec<Vec<String>>,
    current: Vec<String>,
    token: String,
    in_token: bool,
}

impl Splitter {
    fn end_token(&mut self) {
        if self.in_token {
            self.current.push(std::mem::take(&mut self.token));
            self.in_token = false;
        }
    }

    fn end_segment(&mut self) {
        self.end_token();
        if !self.current.is_empty() {
            self.segments.push(std::mem::take(&mut self.current));
        }
    }

    fn push(&mut self, c: char) {
        self.token.push(c);
        self.in_token = true;
    }

    fn single_quoted(&mut self, chars: &mut Peekable<Chars<'_>>) -> Result<(), ParseError> {
        self.in_token = true;
        for c in chars.by_ref() {
            if c == '\'' {
                return Ok(());
            }
            self.token.push(c);
        }
        Err(ParseError::UnterminatedQuote)
    }

    fn double_quoted(&mut self, chars: &mut Peekable<Chars<'_>>) -> Result<(), ParseError> {
        self.in_token = true;
        while let Some(c) = chars.next() {
            match c {
                '"' => return Ok(()),
                '`' => return Err(ParseError::Substitution),
                '$' if chars.peek() == Some(&'(') => return Err(ParseError::Substitution),
                '\\' => {
                    if let Some(next) = chars.next() {
                        self.token.push(next);
                    }
                }
                _ => self.token.push(c),
            }
        }
        Err(ParseError::UnterminatedQuote)
    }
}

/// Split a command line into segments of tokens.
pub fn split_segments(line: &str) -> Result<Vec<Vec<String>>, ParseError> {
    let mut s = Splitter::default();
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => s.single_quoted(&mut chars)?,
            '"' => s.double_quoted(&mut chars)?,
            '\\' => {
                if let Some(next) = chars.next() {
                    s.push(next);
                }
            }
            '`' => return Err(ParseError::Substitution),
            '$' if chars.peek() == Some(&'(') => return Err(ParseError::Substitution),
            '(' | ')' | '{' | '}' if !s.in_token => return Err(ParseError::Subshell),
            ' ' | '\t' => s.end_token(),
            '\n' | ';' => s.end_segment(),
            '&' => {
                // `2>&1` and `&>` are redirections, not separators.
                if s.token.ends_with('>') || s.token.ends_with('<') || chars.peek() == Some(&'>') {
                    s.push(c);
                } else {
                    if chars.peek() == Some(&'&') {
                        chars.next();
                    }
                    s.end_segment();
                }
            }
            '|' => {
                if matches!(chars.peek(), Some('|' | '&')) {
                    chars.next();
                }
                s.end_segment();
            }
            _ => s.push(c),
        }
    }
    s.end_segment();

    if s.segments.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(s.segments)
}

fn is_assignment(token: &str) -> bool {
    let Some((name, _)) = token.split_once('=') else {
        return false;
    };
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// First token of a segment that is not a `NAME=value` assignment.
pub fn leading_executable(segment: &[String]) -> Option<&str> {
    segment
        .iter()
        .map(String::as_str)
        .find(|t| !is_assignment(t))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn executables(line: &str) -> Vec<String> {
        split_segments(line)
            .unwrap()
            .iter()
            .map(|seg| leading_executable(seg).unwrap().to_string())
            .collect()
    }

    #[test]
    fn splits_on_every_operator() {
        assert_eq!(
            executables("npm install && npm test || echo fail; ls | grep x & sleep 1"),
            vec!["npm", "npm", "echo", "ls", "grep", "sleep"]
        );
    }

    #[test]
    fn quotes_hide_operators() {
        assert_eq!(executables("echo 'a && b' \"c; d\""), vec!["echo"]);
        let segs = split_segments("git commit -m \"fix: a | b\"").unwrap();
        assert_eq!(segs[0], vec!["git", "commit", "-m", "fix: a | b"]);
    }

    #[test]
    fn redirections_are_not_separators() {
        assert_eq!(executables("cargo test 2>&1 | tail -n 5"), vec!["cargo", "tail"]);
        assert_eq!(executables("make &> build.log"), vec!["make"]);
    }

    #[test]
    fn skips_env_assignments() {
        assert_eq!(executables("RUST_LOG=debug FOO_1=x cargo run"), vec!["cargo"]);
        let segs = split_segments("A=1").unwrap();
        assert_eq!(leading_executable(&segs[0]), None);
    }

    #[test]
    fn rejects_substitution_and_subshells() {
        assert_eq!(split_segments("echo $(whoami)"), Err(ParseError::Substitution));
        assert_eq!(split_segments("echo `id`"), Err(ParseError::Substitution));
        assert_eq!(split_segments("echo \"$(id)\""), Err(ParseError::Substitution));
        assert_eq!(split_segments("(cd /; rm x)"), Err(ParseError::Subshell));
    }

    #[test]
    fn rejects_empty_and_unterminated() {
        assert_eq!(split_segments("   "), Err(ParseError::Empty));
        assert_eq!(split_segments(";;"), Err(ParseError::Empty));
        assert_eq!(split_segments("echo 'oops"), Err(ParseError::UnterminatedQuote));
    }

    #[test]
    fn single_quotes_keep_dollar_literal() {
        let segs = split_segments("echo '$(id)'").unwrap();
        assert_eq!(segs[0], vec!["echo", "$(id)"]);
    }
}
