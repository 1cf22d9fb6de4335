//! Tokenizer and reader for mlisp source text.
//!
//! The reader turns UTF-8 text into a flat sequence of top-level
//! S-expressions. Syntax is minimal:
//! - `;` starts a comment running to end of line
//! - `"` delimits string literals (no escape processing)
//! - `(` `)` and the reader macros `'` `` ` `` `,` are single-char tokens
//! - everything else made of word characters is a symbol, a number, or a
//!   `#\c` character literal

use crate::ast::SExpr;
use crate::error::CompileError;
use std::fs;
use std::path::Path;

/// A token with the line it started on, for error reporting.
#[derive(Debug, Clone)]
pub struct Token {
    pub text: String,
    pub line: usize,
}

impl Token {
    fn new(text: String, line: usize) -> Self {
        Token { text, line }
    }
}

/// Non-alphanumeric characters that may appear inside a word token.
const WORD_CHARS: &str = "?+<>!@#$%^&*:.=-_\\";

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || WORD_CHARS.contains(c)
}

/// Split source text into tokens. Comments are skipped; string tokens keep
/// their surrounding quotes so the reader can tell them apart from symbols.
pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            _ if c.is_whitespace() => {}
            ';' => {
                // comment to end of line
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '"' => {
                let start_line = line;
                let mut text = String::from('"');
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                    }
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    text.push(c);
                }
                if !closed {
                    return Err(CompileError::syntax("unclosed string literal", start_line));
                }
                text.push('"');
                tokens.push(Token::new(text, start_line));
            }
            '(' | ')' | '\'' | '`' | ',' => {
                tokens.push(Token::new(c.to_string(), line));
            }
            _ if is_word_char(c) => {
                let mut text = c.to_string();
                while let Some(&next) = chars.peek() {
                    if is_word_char(next) {
                        text.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::new(text, line));
            }
            _ => {
                // Anything else stands alone, like shlex punctuation.
                tokens.push(Token::new(c.to_string(), line));
            }
        }
    }

    Ok(tokens)
}

/// Reader over a token stream. Multiple files can be parsed into one
/// program; the runtime library is simply the first of them.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    program: Vec<SExpr>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            tokens: Vec::new(),
            pos: 0,
            program: Vec::new(),
        }
    }

    /// Read and parse one file, appending its top-level forms.
    pub fn parse_file(&mut self, path: &Path) -> Result<(), CompileError> {
        let source = fs::read_to_string(path).map_err(|e| {
            CompileError::codegen(format!("cannot read {}: {}", path.display(), e))
        })?;
        self.parse_source(&source)
    }

    /// Parse source text, appending its top-level forms.
    pub fn parse_source(&mut self, source: &str) -> Result<(), CompileError> {
        self.tokens = tokenize(source)?;
        self.pos = 0;
        while self.pos < self.tokens.len() {
            let expr = self.parse_expr()?;
            self.program.push(expr);
        }
        Ok(())
    }

    /// All top-level forms parsed so far, in order.
    pub fn into_program(self) -> Vec<SExpr> {
        self.program
    }

    fn next_token(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expr(&mut self) -> Result<SExpr, CompileError> {
        let token = match self.next_token() {
            Some(t) => t,
            None => {
                let line = self.tokens.last().map(|t| t.line).unwrap_or(1);
                return Err(CompileError::syntax("unexpected end of input", line));
            }
        };

        match token.text.as_str() {
            "'" => Ok(SExpr::list(vec![SExpr::symbol("quote"), self.parse_expr()?])),
            "`" => Ok(SExpr::list(vec![SExpr::symbol("backquote"), self.parse_expr()?])),
            "," => Ok(SExpr::list(vec![SExpr::symbol("unquote"), self.parse_expr()?])),
            "(" => self.parse_paren_list(token.line),
            ")" => Err(CompileError::syntax("unexpected ')'", token.line)),
            _ => parse_atom(&token),
        }
    }

    fn parse_paren_list(&mut self, open_line: usize) -> Result<SExpr, CompileError> {
        let mut items = Vec::new();
        loop {
            match self.tokens.get(self.pos) {
                None => return Err(CompileError::syntax("missing ')'", open_line)),
                Some(t) if t.text == ")" => {
                    self.pos += 1;
                    return Ok(SExpr::List(items));
                }
                Some(_) => items.push(self.parse_expr()?),
            }
        }
    }
}

fn parse_atom(token: &Token) -> Result<SExpr, CompileError> {
    let text = &token.text;

    if text.starts_with('"') {
        return Ok(SExpr::Str(text[1..text.len() - 1].to_string()));
    }

    if let Some(name) = text.strip_prefix("#\\") {
        return parse_char_literal(name, token.line);
    }

    // A number is all digits with an optional minus; a bare `-` is a symbol.
    let digits = text.strip_prefix('-').unwrap_or(text);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return match text.parse::<i32>() {
            Ok(v) => Ok(SExpr::Integer(v)),
            Err(_) => Err(CompileError::syntax(
                format!("number out of range: {}", text),
                token.line,
            )),
        };
    }

    Ok(SExpr::symbol(text))
}

fn parse_char_literal(name: &str, line: usize) -> Result<SExpr, CompileError> {
    match name {
        "newline" => Ok(SExpr::Integer('\n' as i32)),
        "space" => Ok(SExpr::Integer(' ' as i32)),
        _ => {
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(SExpr::Integer(c as i32)),
                _ => Err(CompileError::syntax(
                    format!("malformed character literal: #\\{}", name),
                    line,
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(source: &str) -> SExpr {
        let mut parser = Parser::new();
        parser.parse_source(source).unwrap();
        let mut program = parser.into_program();
        assert_eq!(program.len(), 1);
        program.pop().unwrap()
    }

    fn parse_all(source: &str) -> Vec<SExpr> {
        let mut parser = Parser::new();
        parser.parse_source(source).unwrap();
        parser.into_program()
    }

    #[test]
    fn test_parse_flat_list() {
        let expr = parse_one("(+ 1 2)");
        assert_eq!(
            expr,
            SExpr::list(vec![SExpr::symbol("+"), SExpr::Integer(1), SExpr::Integer(2)])
        );
    }

    #[test]
    fn test_parse_nested_list() {
        let expr = parse_one("(if (> a 1) a (- 0 a))");
        let items = expr.as_list().unwrap();
        assert_eq!(items.len(), 4);
        assert!(items[1].is_form(">"));
        assert!(items[3].is_form("-"));
    }

    #[test]
    fn test_parse_negative_number_and_bare_dash() {
        assert_eq!(parse_one("-5"), SExpr::Integer(-5));
        assert_eq!(parse_one("-"), SExpr::symbol("-"));
        // Minus followed by letters is a symbol, not a malformed number.
        assert_eq!(parse_one("-abc"), SExpr::symbol("-abc"));
    }

    #[test]
    fn test_parse_string_literal() {
        assert_eq!(parse_one("\"hello world\""), SExpr::Str("hello world".to_string()));
        assert_eq!(parse_one("\"\""), SExpr::Str(String::new()));
    }

    #[test]
    fn test_comments_are_skipped() {
        let program = parse_all("; leading comment\n(a b) ; trailing\n42");
        assert_eq!(program.len(), 2);
        assert_eq!(program[1], SExpr::Integer(42));
    }

    #[test]
    fn test_reader_shorthand() {
        assert_eq!(
            parse_one("'x"),
            SExpr::list(vec![SExpr::symbol("quote"), SExpr::symbol("x")])
        );
        assert_eq!(
            parse_one("`x"),
            SExpr::list(vec![SExpr::symbol("backquote"), SExpr::symbol("x")])
        );
        assert_eq!(
            parse_one(",x"),
            SExpr::list(vec![SExpr::symbol("unquote"), SExpr::symbol("x")])
        );
    }

    #[test]
    fn test_backquote_template() {
        // `(if ,c ,b 0) as a macro body would read it
        let expr = parse_one("`(if ,c ,b 0)");
        let items = expr.as_list().unwrap();
        assert_eq!(items[0], SExpr::symbol("backquote"));
        let template = items[1].as_list().unwrap();
        assert!(template[1].is_form("unquote"));
        assert!(template[2].is_form("unquote"));
    }

    #[test]
    fn test_char_literals() {
        assert_eq!(parse_one("#\\a"), SExpr::Integer(97));
        assert_eq!(parse_one("#\\newline"), SExpr::Integer(10));
        assert_eq!(parse_one("#\\space"), SExpr::Integer(32));
    }

    #[test]
    fn test_malformed_char_literal() {
        let mut parser = Parser::new();
        let err = parser.parse_source("#\\ab").unwrap_err();
        assert!(err.to_string().contains("character literal"));
    }

    #[test]
    fn test_symbol_word_characters() {
        assert_eq!(parse_one("set-first!"), SExpr::symbol("set-first!"));
        assert_eq!(parse_one("$heapstart"), SExpr::symbol("$heapstart"));
        assert_eq!(parse_one("<="), SExpr::symbol("<="));
    }

    #[test]
    fn test_lone_close_paren_is_error() {
        let mut parser = Parser::new();
        let err = parser.parse_source("(a b)\n)").unwrap_err();
        assert!(matches!(err, CompileError::Syntax { line: 2, .. }), "{:?}", err);
    }

    #[test]
    fn test_unterminated_list_is_error() {
        let mut parser = Parser::new();
        let err = parser.parse_source("(a (b c)").unwrap_err();
        assert!(err.to_string().contains("missing ')'"));
    }

    #[test]
    fn test_unclosed_string_is_error() {
        let mut parser = Parser::new();
        let err = parser.parse_source("\n\"oops").unwrap_err();
        assert!(matches!(err, CompileError::Syntax { line: 2, .. }), "{:?}", err);
    }

    #[test]
    fn test_dangling_quote_is_error() {
        let mut parser = Parser::new();
        assert!(parser.parse_source("'").is_err());
    }

    #[test]
    fn test_print_parse_round_trip() {
        let sources = [
            "(function fib (n) (if (< n 2) n (+ (fib (- n 1)) (fib (- n 2)))))",
            "(let ((x 1) (y ())) (begin x y))",
            "(quote (a b (c . d)))",
            "\"str\"",
            "-17",
        ];
        for source in sources {
            let first = parse_one(source);
            let second = parse_one(&first.to_string());
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_multiple_files_concatenate() {
        let mut parser = Parser::new();
        parser.parse_source("(a)").unwrap();
        parser.parse_source("(b)").unwrap();
        let program = parser.into_program();
        assert_eq!(program.len(), 2);
        assert!(program[0].is_form("a"));
        assert!(program[1].is_form("b"));
    }
}
