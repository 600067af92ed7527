use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    /// Bare word. Keywords are bare words too; the parser matches them
    /// case-insensitively.
    Word(String),
    /// Backtick-quoted name. Never a keyword.
    Quoted(String),
    Str(String),
    Number(Value),
    Sym(&'static str),
    Eof,
}

impl Token {
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    pub fn is_sym(&self, sym: &str) -> bool {
        matches!(self, Token::Sym(s) if *s == sym)
    }
}

const SYMBOLS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "(", ")", "[", "]", "{", "}", ",", ":", ".", "?", "<",
    ">", "=", "+", "-", "*", "/", "%", "!",
];

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // comments
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i += 2;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
            continue;
        }

        if c.is_ascii_digit() {
            let (number, next) = number(&chars, i)?;
            tokens.push(Token::Number(number));
            i = next;
            continue;
        }

        if c == '"' || c == '\'' {
            let (text, next) = string(&chars, i)?;
            tokens.push(Token::Str(text));
            i = next;
            continue;
        }

        if c == '`' {
            let start = i + 1;
            let end = chars[start..]
                .iter()
                .position(|&ch| ch == '`')
                .map(|p| start + p)
                .ok_or_else(|| Error::InvalidQuery("unterminated quoted name".into()))?;
            tokens.push(Token::Quoted(chars[start..end].iter().collect()));
            i = end + 1;
            continue;
        }

        let sym = SYMBOLS.iter().find(|s| {
            s.chars()
                .enumerate()
                .all(|(k, sc)| chars.get(i + k) == Some(&sc))
        });
        match sym {
            Some(&s) => {
                tokens.push(Token::Sym(s));
                i += s.len();
            }
            None => {
                return Err(Error::InvalidQuery(format!(
                    "unexpected character '{c}' at offset {i}"
                )));
            }
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

fn number(chars: &[char], start: usize) -> Result<(Value, usize)> {
    let mut i = start;
    let mut float = false;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(char::is_ascii_digit) {
        float = true;
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if matches!(chars.get(i), Some('e' | 'E')) {
        let mut j = i + 1;
        if matches!(chars.get(j), Some('+' | '-')) {
            j += 1;
        }
        if chars.get(j).is_some_and(char::is_ascii_digit) {
            float = true;
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }

    let text: String = chars[start..i].iter().collect();
    let bad = || Error::InvalidQuery(format!("malformed number: {text}"));
    let value = if float {
        let f: f64 = text.parse().map_err(|_| bad())?;
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(bad)?
    } else {
        match text.parse::<i64>() {
            Ok(n) => Value::from(n),
            Err(_) => {
                let f: f64 = text.parse().map_err(|_| bad())?;
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(bad)?
            }
        }
    };
    Ok((value, i))
}

fn string(chars: &[char], start: usize) -> Result<(String, usize)> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    loop {
        let c = *chars
            .get(i)
            .ok_or_else(|| Error::InvalidQuery("unterminated string literal".into()))?;
        i += 1;
        if c == quote {
            return Ok((out, i));
        }
        if c != '\\' {
            out.push(c);
            continue;
        }
        let escaped = *chars
            .get(i)
            .ok_or_else(|| Error::InvalidQuery("unterminated string literal".into()))?;
        i += 1;
        match escaped {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'u' => {
                let (ch, next) = unicode_escape(chars, i)?;
                out.push(ch);
                i = next;
            }
            other => out.push(other),
        }
    }
}

fn hex4(chars: &[char], at: usize) -> Result<u32> {
    let digits: String = chars.get(at..at + 4).unwrap_or_default().iter().collect();
    u32::from_str_radix(&digits, 16)
        .map_err(|_| Error::InvalidQuery(format!("bad unicode escape: \\u{digits}")))
}

/// `\uXXXX`, including surrogate pairs. `at` points just past the `u`.
fn unicode_escape(chars: &[char], at: usize) -> Result<(char, usize)> {
    let high = hex4(chars, at)?;
    let mut next = at + 4;
    let code = if (0xD800..0xDC00).contains(&high)
        && chars.get(next) == Some(&'\\')
        && chars.get(next + 1) == Some(&'u')
    {
        let low = hex4(chars, next + 2)?;
        next += 6;
        0x10000 + ((high - 0xD800) << 10) + (low.wrapping_sub(0xDC00) & 0x3FF)
    } else {
        high
    };
    let ch = char::from_u32(code)
        .ok_or_else(|| Error::InvalidQuery(format!("bad unicode escape: {code:#x}")))?;
    Ok((ch, next))
}
