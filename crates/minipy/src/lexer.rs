//! Tokenizer with Python-style indentation tracking.

use crate::error::Exception;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

/// Longest operators first so `//=` wins over `//` and `/`.
const OPERATORS: &[&str] = &[
    "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "+", "-", "*", "/",
    "%", "<", ">", "=", "(", ")", "[", "]", ",", ":", ".", ";",
];

const TAB_SIZE: usize = 8;

pub fn tokenize(source: &str) -> Result<Vec<Token>, Exception> {
    let mut tokens = Vec::new();
    let mut indents = vec![0usize];
    let mut depth = 0usize;
    let mut last_line = 1;

    for (idx, raw) in source.lines().enumerate() {
        let line = idx + 1;
        last_line = line;
        let mut chars: &str = raw;

        if depth == 0 {
            let mut width = 0;
            let mut offset = 0;
            for c in raw.chars() {
                match c {
                    ' ' => width += 1,
                    '\t' => width = (width / TAB_SIZE + 1) * TAB_SIZE,
                    '\x0c' => width = 0,
                    _ => break,
                }
                offset += c.len_utf8();
            }
            let rest = &raw[offset..];
            if rest.is_empty() || rest.starts_with('#') {
                continue;
            }

            let top = *indents.last().unwrap_or(&0);
            if width > top {
                indents.push(width);
                tokens.push(Token {
                    tok: Tok::Indent,
                    line,
                });
            } else {
                while width < *indents.last().unwrap_or(&0) {
                    indents.pop();
                    tokens.push(Token {
                        tok: Tok::Dedent,
                        line,
                    });
                }
                if width != *indents.last().unwrap_or(&0) {
                    return Err(Exception::syntax(
                        "unindent does not match any outer indentation level",
                        line,
                    ));
                }
            }
            chars = rest;
        }

        scan_line(chars, line, &mut depth, &mut tokens)?;

        if depth == 0 && !matches!(tokens.last(), Some(Token { tok: Tok::Newline, .. }) | None) {
            tokens.push(Token {
                tok: Tok::Newline,
                line,
            });
        }
    }

    if depth > 0 {
        return Err(Exception::syntax("unexpected EOF while parsing", last_line));
    }
    while indents.len() > 1 {
        indents.pop();
        tokens.push(Token {
            tok: Tok::Dedent,
            line: last_line,
        });
    }
    tokens.push(Token {
        tok: Tok::Eof,
        line: last_line,
    });
    Ok(tokens)
}

fn scan_line(
    text: &str,
    line: usize,
    depth: &mut usize,
    tokens: &mut Vec<Token>,
) -> Result<(), Exception> {
    let bytes: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c == ' ' || c == '\t' || c == '\r' {
            i += 1;
            continue;
        }
        if c == '#' {
            break;
        }

        if c.is_ascii_digit() || (c == '.' && bytes.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let (tok, next) = scan_number(&bytes, i, line)?;
            tokens.push(Token { tok, line });
            i = next;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_alphanumeric() || bytes[i] == '_') {
                i += 1;
            }
            let name: String = bytes[start..i].iter().collect();
            tokens.push(Token {
                tok: Tok::Name(name),
                line,
            });
            continue;
        }

        if c == '\'' || c == '"' {
            let (s, next) = scan_string(&bytes, i, line)?;
            tokens.push(Token {
                tok: Tok::Str(s),
                line,
            });
            i = next;
            continue;
        }

        let remaining: String = bytes[i..bytes.len().min(i + 3)].iter().collect();
        let Some(op) = OPERATORS.iter().find(|op| remaining.starts_with(**op)) else {
            return Err(Exception::syntax(
                format!("invalid character '{}'", c),
                line,
            ));
        };
        match *op {
            "(" | "[" => *depth += 1,
            ")" | "]" => {
                if *depth == 0 {
                    return Err(Exception::syntax(format!("unmatched '{}'", op), line));
                }
                *depth -= 1;
            }
            _ => {}
        }
        tokens.push(Token {
            tok: Tok::Op(*op),
            line,
        });
        i += op.len();
    }
    Ok(())
}

fn scan_number(chars: &[char], start: usize, line: usize) -> Result<(Tok, usize), Exception> {
    let mut i = start;
    let mut is_float = false;
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
        i += 1;
    }
    if i < chars.len() && chars[i] == '.' {
        is_float = true;
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            is_float = true;
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    if i < chars.len() && (chars[i].is_alphabetic() || chars[i] == '_') {
        return Err(Exception::syntax("invalid decimal literal", line));
    }

    let literal: String = chars[start..i].iter().filter(|c| **c != '_').collect();
    let tok = if is_float {
        Tok::Float(
            literal
                .parse()
                .map_err(|_| Exception::syntax("invalid decimal literal", line))?,
        )
    } else {
        Tok::Int(
            literal
                .parse()
                .map_err(|_| Exception::syntax("integer literal is too large", line))?,
        )
    };
    Ok((tok, i))
}

fn scan_string(chars: &[char], start: usize, line: usize) -> Result<(String, usize), Exception> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' {
            let Some(&esc) = chars.get(i + 1) else {
                break;
            };
            match esc {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                '"' => out.push('"'),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
            i += 2;
            continue;
        }
        out.push(c);
        i += 1;
    }
    Err(Exception::syntax("unterminated string literal", line))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_simple_call() {
        assert_eq!(
            toks("print(\"hi\")"),
            vec![
                Tok::Name("print".into()),
                Tok::Op("("),
                Tok::Str("hi".into()),
                Tok::Op(")"),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_indent_and_dedent() {
        let t = toks("while x:\n    pass\ny = 1\n");
        assert!(t.contains(&Tok::Indent));
        assert!(t.contains(&Tok::Dedent));
        let indent = t.iter().position(|t| *t == Tok::Indent).unwrap();
        let dedent = t.iter().position(|t| *t == Tok::Dedent).unwrap();
        assert!(indent < dedent);
    }

    #[test]
    fn test_blank_and_comment_lines_are_ignored() {
        assert_eq!(
            toks("# comment\n\n   \nx = 1  # trailing\n"),
            toks("x = 1\n")
        );
    }

    #[test]
    fn test_newlines_inside_brackets_continue_the_line() {
        let t = toks("print(1,\n      2)\n");
        assert_eq!(t.iter().filter(|t| **t == Tok::Newline).count(), 1);
    }

    #[test]
    fn test_longest_operator_match() {
        assert_eq!(
            toks("a //= 2 ** 3"),
            vec![
                Tok::Name("a".into()),
                Tok::Op("//="),
                Tok::Int(2),
                Tok::Op("**"),
                Tok::Int(3),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(toks("1_000")[0], Tok::Int(1000));
        assert_eq!(toks("2.5")[0], Tok::Float(2.5));
        assert_eq!(toks(".5")[0], Tok::Float(0.5));
        assert_eq!(toks("1e3")[0], Tok::Float(1000.0));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(toks(r#"'a\nb\'c'"#)[0], Tok::Str("a\nb'c".into()));
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("print('oops)").unwrap_err();
        assert_eq!(err.kind, crate::ExcKind::SyntaxError);
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn test_bad_dedent() {
        let err = tokenize("if x:\n    a = 1\n  b = 2\n").unwrap_err();
        assert_eq!(err.line, Some(3));
    }

    #[test]
    fn test_unclosed_bracket() {
        assert!(tokenize("print(1,\n").is_err());
        assert!(tokenize("print(1))").is_err());
    }

    #[test]
    fn test_dedents_flushed_at_eof() {
        let t = toks("if a:\n    if b:\n        pass");
        assert_eq!(t.iter().filter(|t| **t == Tok::Dedent).count(), 2);
        assert_eq!(t.last(), Some(&Tok::Eof));
    }
}
