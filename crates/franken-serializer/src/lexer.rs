//! Tokenizer for the script subset.
//!
//! Produces the whole token stream up front.  `/` is always the division
//! operator (no regular-expression literals).

use crate::ast::SourceSpan;
use crate::parser::{ParseError, ParseErrorCode, ParseResult};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier or keyword; the parser decides which.
    Ident(String),
    Number(f64),
    BigInt(i128),
    Str(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: SourceSpan,
    /// A line terminator appeared between the previous token and this one.
    pub newline_before: bool,
}

/// Longest match first.
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "**=", "...", "&&=", "||=", "??=", "=>", "==", "!=", "<=", ">=", "&&", "||",
    "??", "++", "--", "+=", "-=", "*=", "/=", "%=", "**", "{", "}", "(", ")", "[", "]", ";", ",",
    "<", ">", "+", "-", "*", "/", "%", "!", "~", "?", ":", "=", ".", "&", "|", "^", "#",
];

pub fn tokenize(source: &str, source_label: &str) -> ParseResult<Vec<Token>> {
    Lexer::new(source, source_label).run()
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    label: &'a str,
    pos: usize,
    line: u32,
    line_start: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str, label: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            label,
            pos: 0,
            line: 1,
            line_start: 0,
        }
    }

    fn run(mut self) -> ParseResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let newline_before = self.skip_trivia()?;
            let start = self.pos;
            let line = self.line;
            let column = (start - self.line_start) as u32 + 1;
            let Some(ch) = self.peek_char() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    span: SourceSpan::new(start, start, line, column),
                    newline_before,
                });
                return Ok(tokens);
            };
            let kind = if is_ident_start(ch) {
                TokenKind::Ident(self.read_identifier())
            } else if ch.is_ascii_digit()
                || (ch == '.' && self.bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit))
            {
                self.read_number()?
            } else if ch == '"' || ch == '\'' {
                TokenKind::Str(self.read_string(ch)?)
            } else if ch == '`' {
                return Err(self.error(
                    ParseErrorCode::UnsupportedSyntax,
                    "template literals are not supported",
                    start,
                ));
            } else {
                let rest = &self.source[self.pos..];
                match PUNCTUATORS.iter().find(|p| rest.starts_with(**p)) {
                    Some(p) => {
                        self.pos += p.len();
                        TokenKind::Punct(p)
                    }
                    None => {
                        return Err(self.error(
                            ParseErrorCode::UnexpectedToken,
                            format!("unexpected character `{ch}`"),
                            start,
                        ));
                    }
                }
            };
            tokens.push(Token {
                kind,
                span: SourceSpan::new(start, self.pos, line, column),
                newline_before,
            });
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn error(&self, code: ParseErrorCode, message: impl Into<String>, at: usize) -> ParseError {
        let column = (at.saturating_sub(self.line_start)) as u32 + 1;
        ParseError::new(
            code,
            message,
            self.label,
            Some(SourceSpan::new(at, at, self.line, column)),
        )
    }

    /// Skips whitespace and comments; reports whether a newline was crossed.
    fn skip_trivia(&mut self) -> ParseResult<bool> {
        let mut newline = false;
        while let Some(ch) = self.peek_char() {
            if ch == '\n' {
                self.pos += 1;
                self.line += 1;
                self.line_start = self.pos;
                newline = true;
            } else if ch.is_whitespace() {
                self.pos += ch.len_utf8();
            } else if self.source[self.pos..].starts_with("//") {
                while let Some(c) = self.peek_char() {
                    if c == '\n' {
                        break;
                    }
                    self.pos += c.len_utf8();
                }
            } else if self.source[self.pos..].starts_with("/*") {
                let start = self.pos;
                self.pos += 2;
                loop {
                    if self.source[self.pos..].starts_with("*/") {
                        self.pos += 2;
                        break;
                    }
                    match self.peek_char() {
                        Some('\n') => {
                            self.pos += 1;
                            self.line += 1;
                            self.line_start = self.pos;
                            newline = true;
                        }
                        Some(c) => self.pos += c.len_utf8(),
                        None => {
                            return Err(self.error(
                                ParseErrorCode::UnterminatedComment,
                                "unterminated block comment",
                                start,
                            ));
                        }
                    }
                }
            } else {
                break;
            }
        }
        Ok(newline)
    }

    fn read_identifier(&mut self) -> String {
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if is_ident_part(ch) {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
        self.source[start..self.pos].to_string()
    }

    fn read_number(&mut self) -> ParseResult<TokenKind> {
        let start = self.pos;
        let radix = match (self.bytes.get(self.pos), self.bytes.get(self.pos + 1)) {
            (Some(b'0'), Some(b'x' | b'X')) => 16,
            (Some(b'0'), Some(b'o' | b'O')) => 8,
            (Some(b'0'), Some(b'b' | b'B')) => 2,
            _ => 10,
        };
        if radix != 10 {
            self.pos += 2;
            let digits_start = self.pos;
            while self.bytes.get(self.pos).is_some_and(|b| b.is_ascii_alphanumeric()) {
                self.pos += 1;
            }
            let mut digits = &self.source[digits_start..self.pos];
            let bigint = digits.ends_with('n');
            if bigint {
                digits = &digits[..digits.len() - 1];
            }
            let value = i128::from_str_radix(digits, radix).map_err(|_| {
                self.error(ParseErrorCode::InvalidNumber, "invalid numeric literal", start)
            })?;
            return Ok(if bigint {
                TokenKind::BigInt(value)
            } else {
                TokenKind::Number(value as f64)
            });
        }

        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        if self.bytes.get(self.pos) == Some(&b'n') {
            let digits = &self.source[start..self.pos];
            self.pos += 1;
            let value = digits.parse::<i128>().map_err(|_| {
                self.error(ParseErrorCode::InvalidNumber, "bigint literal out of range", start)
            })?;
            return Ok(TokenKind::BigInt(value));
        }
        if self.bytes.get(self.pos) == Some(&b'.') {
            self.pos += 1;
            while self.bytes.get(self.pos).is_some_and(u8::is_ascii_digit) {
                self.pos += 1;
            }
        }
        if matches!(self.bytes.get(self.pos), Some(b'e' | b'E')) {
            let save = self.pos;
            self.pos += 1;
            if matches!(self.bytes.get(self.pos), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            if self.bytes.get(self.pos).is_some_and(u8::is_ascii_digit) {
                while self.bytes.get(self.pos).is_some_and(u8::is_ascii_digit) {
                    self.pos += 1;
                }
            } else {
                self.pos = save;
            }
        }
        let text = &self.source[start..self.pos];
        let value = text.parse::<f64>().map_err(|_| {
            self.error(ParseErrorCode::InvalidNumber, "invalid numeric literal", start)
        })?;
        if self.peek_char().is_some_and(is_ident_start) {
            return Err(self.error(
                ParseErrorCode::InvalidNumber,
                "identifier directly after number",
                self.pos,
            ));
        }
        Ok(TokenKind::Number(value))
    }

    fn read_string(&mut self, quote: char) -> ParseResult<String> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(ch) = self.peek_char() else {
                return Err(self.error(
                    ParseErrorCode::UnterminatedString,
                    "unterminated string literal",
                    start,
                ));
            };
            self.pos += ch.len_utf8();
            if ch == quote {
                return Ok(out);
            }
            match ch {
                '\n' => {
                    return Err(self.error(
                        ParseErrorCode::UnterminatedString,
                        "newline in string literal",
                        start,
                    ));
                }
                '\\' => self.read_escape(&mut out, start)?,
                other => out.push(other),
            }
        }
    }

    fn read_escape(&mut self, out: &mut String, start: usize) -> ParseResult<()> {
        let Some(ch) = self.peek_char() else {
            return Err(self.error(
                ParseErrorCode::UnterminatedString,
                "unterminated string literal",
                start,
            ));
        };
        self.pos += ch.len_utf8();
        match ch {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '0' => out.push('\0'),
            '\n' => {
                self.line += 1;
                self.line_start = self.pos;
            }
            'x' => {
                let code = self.read_hex_digits(2, start)?;
                out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            'u' => {
                let code = if self.bytes.get(self.pos) == Some(&b'{') {
                    self.pos += 1;
                    let digits_start = self.pos;
                    while self.bytes.get(self.pos).is_some_and(u8::is_ascii_hexdigit) {
                        self.pos += 1;
                    }
                    let digits = &self.source[digits_start..self.pos];
                    if self.bytes.get(self.pos) != Some(&b'}') {
                        return Err(self.error(
                            ParseErrorCode::InvalidEscape,
                            "malformed unicode escape",
                            start,
                        ));
                    }
                    self.pos += 1;
                    u32::from_str_radix(digits, 16).map_err(|_| {
                        self.error(ParseErrorCode::InvalidEscape, "malformed unicode escape", start)
                    })?
                } else {
                    let high = self.read_hex_digits(4, start)?;
                    if (0xD800..0xDC00).contains(&high) && self.source[self.pos..].starts_with("\\u") {
                        let save = self.pos;
                        self.pos += 2;
                        let low = self.read_hex_digits(4, start)?;
                        if (0xDC00..0xE000).contains(&low) {
                            0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00)
                        } else {
                            self.pos = save;
                            high
                        }
                    } else {
                        high
                    }
                };
                out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            other => out.push(other),
        }
        Ok(())
    }

    fn read_hex_digits(&mut self, count: usize, start: usize) -> ParseResult<u32> {
        let digits = self.source.get(self.pos..self.pos + count).ok_or_else(|| {
            self.error(ParseErrorCode::InvalidEscape, "truncated escape sequence", start)
        })?;
        let value = u32::from_str_radix(digits, 16).map_err(|_| {
            self.error(ParseErrorCode::InvalidEscape, "invalid hex escape", start)
        })?;
        self.pos += count;
        Ok(value)
    }
}

fn is_ident_start(ch: char) -> bool {
    ch == '_' || ch == '$' || ch.is_alphabetic()
}

fn is_ident_part(ch: char) -> bool {
    is_ident_start(ch) || ch.is_ascii_digit() || ch.is_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src, "test")
            .expect("tokenize")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn punctuators_take_longest_match() {
        assert_eq!(
            kinds("a === b"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Punct("==="),
                TokenKind::Ident("b".into()),
                TokenKind::Eof
            ]
        );
        assert_eq!(kinds("=>")[0], TokenKind::Punct("=>"));
    }

    #[test]
    fn numbers_and_bigints() {
        assert_eq!(kinds("1.5e3")[0], TokenKind::Number(1500.0));
        assert_eq!(kinds("0xff")[0], TokenKind::Number(255.0));
        assert_eq!(
            kinds("123456789012345678901234567890n")[0],
            TokenKind::BigInt(123_456_789_012_345_678_901_234_567_890)
        );
    }

    #[test]
    fn json_escapes_decode() {
        assert_eq!(
            kinds(r#""a\"b\\c\nA""#)[0],
            TokenKind::Str("a\"b\\c\nA".into())
        );
    }

    #[test]
    fn newline_flag_and_comments() {
        let tokens = tokenize("a // c\n/* x\n */ b", "test").expect("tokenize");
        assert!(!tokens[0].newline_before);
        assert!(tokens[1].newline_before);
        assert_eq!(tokens[1].span.start_line, 3);
    }

    #[test]
    fn unterminated_string_is_reported() {
        let err = tokenize("'abc", "test").expect_err("must fail");
        assert_eq!(err.code, ParseErrorCode::UnterminatedString);
    }
}
