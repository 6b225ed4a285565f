//! SQL tokenizer for the validator
//!
//! Splits SQL into words, quoted identifiers, string literals, numbers and
//! punctuation while dropping comments. Semicolons, keywords and parentheses
//! inside literals or comments never surface as tokens. Alongside the tokens
//! it builds a normalized copy of the input: comments removed and whitespace
//! runs outside literals collapsed to one space.

/// Token category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare identifier or keyword
    Word,
    /// `"ident"`, `` `ident` `` or `[ident]`
    QuotedIdent,
    /// `'text'`
    StringLit,
    Number,
    /// Any other single character
    Punct(char),
}

/// A token borrowed from the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset into the source
    pub offset: usize,
}

impl Token<'_> {
    /// Case-insensitive keyword match
    pub fn is_word(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct(c)
    }

    /// Lowercased identifier name for words and quoted identifiers
    pub fn ident_name(&self) -> Option<String> {
        match self.kind {
            TokenKind::Word => Some(self.text.to_ascii_lowercase()),
            TokenKind::QuotedIdent => {
                let quote = self.text.as_bytes()[0];
                let inner = &self.text[1..self.text.len() - 1];
                let unescaped = match quote {
                    b'"' => inner.replace("\"\"", "\""),
                    b'`' => inner.replace("``", "`"),
                    _ => inner.to_string(),
                };
                Some(unescaped.to_ascii_lowercase())
            }
            _ => None,
        }
    }
}

/// Tokenizer output
#[derive(Debug, Clone)]
pub struct Lexed<'a> {
    pub tokens: Vec<Token<'a>>,
    pub normalized: String,
}

/// Input the tokenizer could not close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexError {
    UnterminatedQuote { offset: usize },
    UnterminatedComment { offset: usize },
}

impl LexError {
    pub fn offset(&self) -> usize {
        match self {
            LexError::UnterminatedQuote { offset } | LexError::UnterminatedComment { offset } => *offset,
        }
    }
}

fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_word_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// Scan a quoted run starting at `start`; doubled closing quotes are escapes.
/// Returns the end offset (exclusive).
fn scan_quoted(bytes: &[u8], start: usize, close: u8) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == close {
            if close != b']' && bytes.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

/// Tokenize `sql`
pub fn tokenize(sql: &str) -> Result<Lexed<'_>, LexError> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut normalized = String::with_capacity(sql.len());
    let mut pending_space = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if b.is_ascii_whitespace() {
            pending_space = true;
            i += 1;
            continue;
        }

        if b == b'-' && bytes.get(i + 1) == Some(&b'-') {
            i = match sql[i..].find('\n') {
                Some(off) => i + off + 1,
                None => bytes.len(),
            };
            pending_space = true;
            continue;
        }

        if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            match sql[i + 2..].find("*/") {
                Some(off) => i += 2 + off + 2,
                None => return Err(LexError::UnterminatedComment { offset: i }),
            }
            pending_space = true;
            continue;
        }

        let start = i;
        let kind = match b {
            b'\'' => {
                i = scan_quoted(bytes, i, b'\'').ok_or(LexError::UnterminatedQuote { offset: start })?;
                TokenKind::StringLit
            }
            b'"' | b'`' => {
                i = scan_quoted(bytes, i, b).ok_or(LexError::UnterminatedQuote { offset: start })?;
                TokenKind::QuotedIdent
            }
            b'[' => {
                i = scan_quoted(bytes, i, b']').ok_or(LexError::UnterminatedQuote { offset: start })?;
                TokenKind::QuotedIdent
            }
            _ if is_word_start(b) => {
                while i < bytes.len() && is_word_char(bytes[i]) {
                    i += 1;
                }
                TokenKind::Word
            }
            _ if b.is_ascii_digit() => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.' || bytes[i] == b'_')
                {
                    i += 1;
                }
                TokenKind::Number
            }
            _ => {
                i += 1;
                TokenKind::Punct(b as char)
            }
        };

        if pending_space && !normalized.is_empty() {
            normalized.push(' ');
        }
        pending_space = false;

        let text = &sql[start..i];
        normalized.push_str(text);
        tokens.push(Token {
            kind,
            text,
            offset: start,
        });
    }

    Ok(Lexed { tokens, normalized })
}
