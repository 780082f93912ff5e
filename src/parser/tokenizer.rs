//! SQL tokenizer
//!
//! Splits SQL text into tokens. Keywords match case-insensitively;
//! single-quoted text is a string literal while double-quoted text is
//! kept distinct so name resolution can rewrite it into an identifier.

use lazy_static::lazy_static;
use std::collections::HashMap;

use crate::error::{Error, ErrorCode, Result};

// ============================================================================
// Token Kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Literals and names
    Integer,
    Float,
    /// Single-quoted string literal
    String,
    /// Double-quoted: a literal until resolution decides otherwise
    DqString,
    Id,
    /// `?` parameter
    Variable,

    // Punctuation / operators
    LParen,
    RParen,
    Comma,
    Semi,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Concat,
    BitAnd,
    BitOr,
    BitNot,
    LShift,
    RShift,

    // Keywords
    Abort,
    After,
    All,
    And,
    As,
    Asc,
    Attach,
    Before,
    Begin,
    Between,
    By,
    Cascade,
    Case,
    Check,
    Collate,
    Commit,
    Conflict,
    Constraint,
    Copy,
    Create,
    Cross,
    Database,
    Default,
    Deferrable,
    Deferred,
    Delete,
    Delimiters,
    Desc,
    Detach,
    Distinct,
    Drop,
    Each,
    Else,
    End,
    Except,
    Exists,
    Explain,
    Fail,
    For,
    Foreign,
    From,
    Full,
    Glob,
    Group,
    Having,
    Ignore,
    Immediate,
    In,
    Index,
    Initially,
    Inner,
    Insert,
    Instead,
    Intersect,
    Into,
    Is,
    IsNull,
    Join,
    Key,
    Left,
    Like,
    Limit,
    Natural,
    Not,
    NotNull,
    Null,
    Of,
    Offset,
    On,
    Or,
    Order,
    Outer,
    Pragma,
    Primary,
    References,
    Replace,
    Restrict,
    Right,
    Rollback,
    Row,
    Select,
    Set,
    Table,
    Temp,
    Then,
    Transaction,
    Trigger,
    Union,
    Unique,
    Update,
    Using,
    Values,
    View,
    When,
    Where,

    Eof,
}

lazy_static! {
    static ref KEYWORDS: HashMap<&'static str, TokenKind> = {
        use TokenKind::*;
        let mut m = HashMap::new();
        for (word, kind) in [
            ("abort", Abort),
            ("after", After),
            ("all", All),
            ("and", And),
            ("as", As),
            ("asc", Asc),
            ("attach", Attach),
            ("before", Before),
            ("begin", Begin),
            ("between", Between),
            ("by", By),
            ("cascade", Cascade),
            ("case", Case),
            ("check", Check),
            ("collate", Collate),
            ("commit", Commit),
            ("conflict", Conflict),
            ("constraint", Constraint),
            ("copy", Copy),
            ("create", Create),
            ("cross", Cross),
            ("database", Database),
            ("default", Default),
            ("deferrable", Deferrable),
            ("deferred", Deferred),
            ("delete", Delete),
            ("delimiters", Delimiters),
            ("desc", Desc),
            ("detach", Detach),
            ("distinct", Distinct),
            ("drop", Drop),
            ("each", Each),
            ("else", Else),
            ("end", End),
            ("except", Except),
            ("exists", Exists),
            ("explain", Explain),
            ("fail", Fail),
            ("for", For),
            ("foreign", Foreign),
            ("from", From),
            ("full", Full),
            ("glob", Glob),
            ("group", Group),
            ("having", Having),
            ("ignore", Ignore),
            ("immediate", Immediate),
            ("in", In),
            ("index", Index),
            ("initially", Initially),
            ("inner", Inner),
            ("insert", Insert),
            ("instead", Instead),
            ("intersect", Intersect),
            ("into", Into),
            ("is", Is),
            ("isnull", IsNull),
            ("join", Join),
            ("key", Key),
            ("left", Left),
            ("like", Like),
            ("limit", Limit),
            ("natural", Natural),
            ("not", Not),
            ("notnull", NotNull),
            ("null", Null),
            ("of", Of),
            ("offset", Offset),
            ("on", On),
            ("or", Or),
            ("order", Order),
            ("outer", Outer),
            ("pragma", Pragma),
            ("primary", Primary),
            ("references", References),
            ("replace", Replace),
            ("restrict", Restrict),
            ("right", Right),
            ("rollback", Rollback),
            ("row", Row),
            ("select", Select),
            ("set", Set),
            ("table", Table),
            ("temp", Temp),
            ("temporary", Temp),
            ("then", Then),
            ("transaction", Transaction),
            ("trigger", Trigger),
            ("union", Union),
            ("unique", Unique),
            ("update", Update),
            ("using", Using),
            ("values", Values),
            ("view", View),
            ("when", When),
            ("where", Where),
        ] {
            m.insert(word, kind);
        }
        m
    };
}

// ============================================================================
// Token
// ============================================================================

/// One token: its kind, its text (unquoted for strings/identifiers),
/// and its byte position in the source.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub pos: usize,
}

// ============================================================================
// Scanner
// ============================================================================

/// Tokenize one SQL statement's worth of text (the whole input is
/// scanned; statement splitting happens above). Returns the tokens plus
/// the byte offset just past the first terminating semicolon, for tail
/// reporting.
pub fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i];
        // Whitespace
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        // -- line comment
        if c == b'-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        // /* block comment */
        if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            let mut j = i + 2;
            while j + 1 < bytes.len() && !(bytes[j] == b'*' && bytes[j + 1] == b'/') {
                j += 1;
            }
            if j + 1 >= bytes.len() {
                return Err(Error::with_message(ErrorCode::Error, "unterminated comment"));
            }
            i = j + 2;
            continue;
        }

        let start = i;
        // Quoted strings
        if c == b'\'' || c == b'"' {
            let quote = c;
            let mut raw: Vec<u8> = Vec::new();
            i += 1;
            loop {
                if i >= bytes.len() {
                    return Err(Error::with_message(
                        ErrorCode::Error,
                        "unterminated string literal",
                    ));
                }
                if bytes[i] == quote {
                    if bytes.get(i + 1) == Some(&quote) {
                        raw.push(quote);
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                raw.push(bytes[i]);
                i += 1;
            }
            let text = String::from_utf8_lossy(&raw).into_owned();
            out.push(Token {
                kind: if quote == b'\'' {
                    TokenKind::String
                } else {
                    TokenKind::DqString
                },
                text,
                pos: start,
            });
            continue;
        }
        // Numbers
        if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            let mut is_float = false;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'.' {
                is_float = true;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                let mut j = i + 1;
                if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j].is_ascii_digit() {
                    is_float = true;
                    i = j;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            out.push(Token {
                kind: if is_float {
                    TokenKind::Float
                } else {
                    TokenKind::Integer
                },
                text: sql[start..i].to_string(),
                pos: start,
            });
            continue;
        }
        // Identifiers and keywords
        if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let word = &sql[start..i];
            let kind = KEYWORDS
                .get(word.to_ascii_lowercase().as_str())
                .copied()
                .unwrap_or(TokenKind::Id);
            out.push(Token {
                kind,
                text: word.to_string(),
                pos: start,
            });
            continue;
        }
        // Operators
        let (kind, len) = match c {
            b'(' => (TokenKind::LParen, 1),
            b')' => (TokenKind::RParen, 1),
            b',' => (TokenKind::Comma, 1),
            b';' => (TokenKind::Semi, 1),
            b'.' => (TokenKind::Dot, 1),
            b'+' => (TokenKind::Plus, 1),
            b'-' => (TokenKind::Minus, 1),
            b'*' => (TokenKind::Star, 1),
            b'/' => (TokenKind::Slash, 1),
            b'%' => (TokenKind::Percent, 1),
            b'?' => (TokenKind::Variable, 1),
            b'~' => (TokenKind::BitNot, 1),
            b'=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    (TokenKind::Eq, 2)
                } else {
                    (TokenKind::Eq, 1)
                }
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    (TokenKind::Ne, 2)
                } else {
                    return Err(Error::with_message(
                        ErrorCode::Error,
                        format!("unrecognized token: \"{}\"", c as char),
                    ));
                }
            }
            b'<' => match bytes.get(i + 1) {
                Some(&b'=') => (TokenKind::Le, 2),
                Some(&b'>') => (TokenKind::Ne, 2),
                Some(&b'<') => (TokenKind::LShift, 2),
                _ => (TokenKind::Lt, 1),
            },
            b'>' => match bytes.get(i + 1) {
                Some(&b'=') => (TokenKind::Ge, 2),
                Some(&b'>') => (TokenKind::RShift, 2),
                _ => (TokenKind::Gt, 1),
            },
            b'|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    (TokenKind::Concat, 2)
                } else {
                    (TokenKind::BitOr, 1)
                }
            }
            b'&' => (TokenKind::BitAnd, 1),
            _ => {
                return Err(Error::with_message(
                    ErrorCode::Error,
                    format!("unrecognized token: \"{}\"", c as char),
                ))
            }
        };
        out.push(Token {
            kind,
            text: sql[start..start + len].to_string(),
            pos: start,
        });
        i += len;
    }

    out.push(Token {
        kind: TokenKind::Eof,
        text: String::new(),
        pos: sql.len(),
    });
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        tokenize(sql).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_case_insensitive() {
        assert_eq!(
            kinds("select From WHERE"),
            vec![
                TokenKind::Select,
                TokenKind::From,
                TokenKind::Where,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_strings_and_quotes() {
        let toks = tokenize("'it''s' \"col name\"").unwrap();
        assert_eq!(toks[0].kind, TokenKind::String);
        assert_eq!(toks[0].text, "it's");
        assert_eq!(toks[1].kind, TokenKind::DqString);
        assert_eq!(toks[1].text, "col name");
    }

    #[test]
    fn test_numbers() {
        let toks = tokenize("12 3.5 .25 1e3").unwrap();
        assert_eq!(toks[0].kind, TokenKind::Integer);
        assert_eq!(toks[1].kind, TokenKind::Float);
        assert_eq!(toks[2].kind, TokenKind::Float);
        assert_eq!(toks[3].kind, TokenKind::Float);
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("a <> b != c == d || e"),
            vec![
                TokenKind::Id,
                TokenKind::Ne,
                TokenKind::Id,
                TokenKind::Ne,
                TokenKind::Id,
                TokenKind::Eq,
                TokenKind::Id,
                TokenKind::Concat,
                TokenKind::Id,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("select -- trailing\n 1 /* block */ ;"),
            vec![
                TokenKind::Select,
                TokenKind::Integer,
                TokenKind::Semi,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string_is_error() {
        assert!(tokenize("'oops").is_err());
    }
}
