//! Tokenizer for bracketed MAPI row literals.
//!
//! A data line such as `[ 1,\t"a, b",\tNULL,\t2018-08-20 10:00:00.000000\t]`
//! is split into raw field tokens. Tokens keep their textual form: strings
//! keep their quotes and backslash escapes, so an unquoted `NULL`/`null`
//! token stays distinguishable from the string `"NULL"`.
//!
//! Numbers and dates share a path: a run of digits followed by `-` is read
//! as `YYYY-MM-DD[ HH:MM:SS[.f{1,6}]]` with fixed-width groups.

use monetdb_core::error::LexError;
use monetdb_core::{Error, Result};

/// Split the row literal between `open` and `close` into raw tokens.
pub fn parse_row(line: &str, open: char, close: char) -> Result<Vec<String>> {
    Lexer::new(line, close).tokens(open)
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    close: char,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str, close: char) -> Self {
        Self {
            input,
            pos: 0,
            close,
        }
    }

    fn tokens(mut self, open: char) -> Result<Vec<String>> {
        match self.input.find(open) {
            Some(at) => self.pos = at + open.len_utf8(),
            None => return Err(self.error("missing opening delimiter", self.input.len())),
        }

        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(self.error("missing closing delimiter", self.pos)),
                Some(c) if c == self.close => break,
                // Empty field.
                Some(',') => {
                    self.bump();
                    continue;
                }
                Some(_) => tokens.push(self.token()?),
            }

            self.skip_whitespace();
            match self.peek() {
                None => return Err(self.error("missing closing delimiter", self.pos)),
                Some(c) if c == self.close => break,
                Some(',') => self.bump(),
                Some(_) => return Err(self.error("expected field separator", self.pos)),
            }
        }
        Ok(tokens)
    }

    fn token(&mut self) -> Result<String> {
        let start = self.pos;
        match self.peek() {
            Some('t') => self.word("true"),
            Some('T') => self.word("TRUE"),
            Some('f') => self.word("false"),
            Some('F') => self.word("FALSE"),
            Some('n') => self.word("null"),
            Some('N') => self.word("NULL"),
            Some(c) if c.is_ascii_digit() || matches!(c, '.' | '-' | '+') => self.number(),
            Some('"') => self.string(),
            _ => Err(self.error("unexpected character", start)),
        }
    }

    fn word(&mut self, word: &'static str) -> Result<String> {
        let start = self.pos;
        for expected in word.chars() {
            if self.peek() != Some(expected) {
                return Err(self.error(format!("expected literal {word}"), start));
            }
            self.bump();
        }
        Ok(word.to_string())
    }

    fn number(&mut self) -> Result<String> {
        let start = self.pos;
        let mut mantissa_digits = 0usize;
        let mut exponent_digits = 0usize;
        let mut has_dot = false;
        let mut has_exponent = false;
        let mut pure_digits = true;

        match self.peek() {
            Some('.') => {
                has_dot = true;
                pure_digits = false;
            }
            Some('-' | '+') => pure_digits = false,
            _ => mantissa_digits += 1,
        }
        self.bump();

        while let Some(c) = self.peek() {
            if self.is_terminator(c) {
                break;
            }
            match c {
                '0'..='9' => {
                    if has_exponent {
                        exponent_digits += 1;
                    } else {
                        mantissa_digits += 1;
                    }
                }
                '.' if has_dot => return Err(self.error("second decimal point", self.pos)),
                '.' if has_exponent => {
                    return Err(self.error("decimal point in exponent", self.pos));
                }
                '.' => {
                    has_dot = true;
                    pure_digits = false;
                }
                'e' | 'E' if has_exponent => return Err(self.error("second exponent", self.pos)),
                'e' | 'E' if mantissa_digits == 0 => {
                    return Err(self.error("exponent without mantissa", self.pos));
                }
                'e' | 'E' => {
                    has_exponent = true;
                    pure_digits = false;
                    self.bump();
                    if matches!(self.peek(), Some('-' | '+')) {
                        self.bump();
                    }
                    continue;
                }
                '-' if pure_digits => return self.date(start),
                _ => return Err(self.error("unexpected character in number", self.pos)),
            }
            self.bump();
        }

        if mantissa_digits == 0 {
            return Err(self.error("number without digits", start));
        }
        if has_exponent && exponent_digits == 0 {
            return Err(self.error("exponent without digits", self.pos));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    /// Continue a digit run that turned out to be a year.
    fn date(&mut self, start: usize) -> Result<String> {
        self.expect('-')?;
        self.digits(2)?;
        self.expect('-')?;
        self.digits(2)?;

        if self.peek() == Some(' ') && self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
            self.digits(2)?;
            self.expect(':')?;
            self.digits(2)?;
            self.expect(':')?;
            self.digits(2)?;

            if self.peek() == Some('.') {
                self.bump();
                let fraction_start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.bump();
                }
                let fraction = self.pos - fraction_start;
                if fraction == 0 || fraction > 6 {
                    return Err(self.error(
                        "fractional seconds must have 1 to 6 digits",
                        fraction_start,
                    ));
                }
            }
        }

        match self.peek() {
            Some(c) if !self.is_terminator(c) => {
                Err(self.error("unexpected character in date", self.pos))
            }
            _ => Ok(self.input[start..self.pos].to_string()),
        }
    }

    fn string(&mut self) -> Result<String> {
        let start = self.pos;
        self.bump();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string", start)),
                Some('\\') => {
                    self.bump();
                    if self.peek().is_none() {
                        return Err(self.error("unterminated string", start));
                    }
                    self.bump();
                }
                Some('"') => {
                    self.bump();
                    return Ok(self.input[start..self.pos].to_string());
                }
                Some(_) => self.bump(),
            }
        }
    }

    fn digits(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return Err(self.error("expected digit in date", self.pos));
            }
            self.bump();
        }
        Ok(())
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        if self.peek() == Some(expected) {
            self.bump();
            Ok(())
        } else {
            Err(self.error(format!("expected '{expected}' in date"), self.pos))
        }
    }

    fn is_terminator(&self, c: char) -> bool {
        matches!(c, ',' | '\t' | ' ') || c == self.close
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.bump();
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.input[self.pos..].chars().nth(1)
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn error(&self, message: impl Into<String>, position: usize) -> Error {
        Error::Lex(LexError {
            message: message.into(),
            input: self.input.to_string(),
            position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LITERALS: &[&str] = &[
        "123",
        "2.32",
        "-5.3",
        "+2",
        "-2.007e10",
        "1E+3",
        "true",
        "TRUE",
        "false",
        "FALSE",
        "null",
        "NULL",
        "2018-08-20",
        "2018-08-20 10:00:00.000000",
    ];

    fn row(fields: &[&str], separator: &str) -> String {
        format!("[{}]", fields.join(separator))
    }

    fn parse(line: &str) -> Result<Vec<String>> {
        parse_row(line, '[', ']')
    }

    fn lex_position(line: &str) -> usize {
        match parse(line) {
            Err(Error::Lex(e)) => e.position,
            other => panic!("expected lex error for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_literal_pairs_reproduce() {
        for separator in [",", "\t,\t"] {
            for a in LITERALS {
                for b in LITERALS {
                    let line = row(&[a, b], separator);
                    assert_eq!(parse(&line).unwrap(), vec![*a, *b], "line {line:?}");
                }
            }
        }
    }

    #[test]
    fn test_full_literal_list_reproduces() {
        for separator in [",", "\t,\t", ",\t"] {
            let line = format!("[ {}\t]", LITERALS.join(separator));
            assert_eq!(parse(&line).unwrap(), LITERALS);
        }
    }

    #[test]
    fn test_empty_rows() {
        assert!(parse("[]").unwrap().is_empty());
        assert!(parse("[ \t]").unwrap().is_empty());
        assert!(parse("[,]").unwrap().is_empty());
    }

    #[test]
    fn test_trailing_comma_has_no_empty_token() {
        assert_eq!(parse("[1,2,]").unwrap(), vec!["1", "2"]);
    }

    #[test]
    fn test_tab_separated_matches_comma_separated() {
        assert_eq!(parse("[\t1\t,\t2\t]").unwrap(), parse("[1,2]").unwrap());
    }

    #[test]
    fn test_strings_keep_quotes_and_escapes() {
        let tokens = parse("[ \"a, b\",\t\"say \\\"hi\\\"\",\t\"back\\\\slash\",\t\"]\"\t]").unwrap();
        assert_eq!(tokens, vec![
            r#""a, b""#,
            r#""say \"hi\"""#,
            r#""back\\slash""#,
            r#""]""#,
        ]);
    }

    #[test]
    fn test_quoted_null_is_a_string() {
        assert_eq!(parse("[ NULL,\t\"NULL\"\t]").unwrap(), vec!["NULL", "\"NULL\""]);
    }

    #[test]
    fn test_dates_with_optional_suffixes() {
        assert_eq!(parse("[ 2018-08-20 10:00:00\t]").unwrap(), vec![
            "2018-08-20 10:00:00"
        ]);
        assert_eq!(parse("[ 2018-08-20 10:00:00.123\t]").unwrap(), vec![
            "2018-08-20 10:00:00.123"
        ]);
        assert_eq!(parse("[ 2018-08-20 ,\t1\t]").unwrap(), vec!["2018-08-20", "1"]);
    }

    #[test]
    fn test_two_decimal_points_rejected() {
        assert_eq!(lex_position("[1.2.3]"), 4);
    }

    #[test]
    fn test_unmatched_quote_rejected() {
        assert_eq!(lex_position("[\"abc]"), 1);
        assert_eq!(lex_position("[\"abc\\"), 1);
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        for line in [
            "[tru]",
            "[nul,1]",
            "[1e]",
            "[1e5e2]",
            "[-]",
            "[.]",
            "[1.5-01-01]",
            "[2018-8-20]",
            "[2018-08-2]",
            "[2018-08-20 10:00]",
            "[2018-08-20 10:00:00.1234567]",
            "[2018-08-20 10:00:00+01:00]",
            "[abc]",
            "[1 2]",
            "[1x]",
            "[1",
            "1, 2",
        ] {
            assert!(
                matches!(parse(line), Err(Error::Lex(_))),
                "expected lex error for {line:?}"
            );
        }
    }

    #[test]
    fn test_custom_delimiters() {
        assert_eq!(parse_row("(1,\"x\")", '(', ')').unwrap(), vec!["1", "\"x\""]);
    }
}
