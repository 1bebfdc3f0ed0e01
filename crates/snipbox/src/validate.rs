//! Pre-compilation snippet validation
//!
//! A [`Validator`] decides whether a snippet may be compiled at all. The
//! default [`SourcePolicy`] lexes the snippet as Rust tokens, dropping
//! comments and literals, and checks the rest for constructs that would let
//! a snippet escape its wrapper or reach outside the namespace allow-list.

use std::str::FromStr;

use proc_macro2::{Delimiter, Spacing, TokenStream, TokenTree};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

/// Longest snippet accepted, in bytes
pub const MAX_SNIPPET_BYTES: usize = 64 * 1024;

/// Crates a snippet may only reach through allow-listed paths
const ROOT_CRATES: &[&str] = &["std", "core", "alloc"];

const FORBIDDEN_KEYWORDS: &[&str] = &["unsafe", "extern"];

/// Attributes that point the compiler at other files
const FORBIDDEN_ATTRIBUTES: &[&str] = &["path"];

const FORBIDDEN_MACROS: &[&str] = &[
    "include",
    "include_str",
    "include_bytes",
    "env",
    "option_env",
    "asm",
    "global_asm",
    "concat_idents",
];

/// Decides whether a snippet may be compiled
pub trait Validator: Send + Sync {
    fn validate(&self, snippet: &str) -> bool;
}

impl<F> Validator for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn validate(&self, snippet: &str) -> bool {
        self(snippet)
    }
}

/// Why [`SourcePolicy`] refused a snippet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("snippet is {0} bytes, limit is {max}", max = MAX_SNIPPET_BYTES)]
    TooLong(usize),

    /// The snippet does not split into Rust tokens, e.g. an unclosed `{`
    #[error("snippet does not lex: {0}")]
    Lex(String),

    #[error("`{0}` is not allowed")]
    Keyword(String),

    #[error("macro `{0}!` is not allowed")]
    Macro(String),

    #[error("inner attributes are not allowed")]
    InnerAttribute,

    #[error("path `{0}` is outside the allowed namespaces")]
    Path(String),

    /// `mod name;` or anything but an inline `mod name { .. }`
    #[error("only inline modules are allowed")]
    ModuleFile,

    #[error("attribute `{0}` is not allowed")]
    Attribute(String),
}

/// The default validator
#[derive(Debug, Clone)]
pub struct SourcePolicy {
    /// Allowed path prefixes, without any trailing `::*`
    allowed: Vec<String>,
}

impl SourcePolicy {
    pub fn new(namespaces: &[String]) -> Self {
        let allowed = namespaces
            .iter()
            .map(|namespace| {
                namespace
                    .strip_suffix("::*")
                    .unwrap_or(namespace)
                    .to_string()
            })
            .collect();
        Self { allowed }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.namespaces)
    }

    /// Check `snippet`, reporting the first violation found
    pub fn check(&self, snippet: &str) -> Result<(), Violation> {
        if snippet.len() > MAX_SNIPPET_BYTES {
            return Err(Violation::TooLong(snippet.len()));
        }

        let tokens = tokenize(snippet)?;

        let mut i = 0;
        while i < tokens.len() {
            match &tokens[i] {
                Token::Ident { name, raw } => {
                    if !raw && FORBIDDEN_KEYWORDS.contains(&name.as_str()) {
                        return Err(Violation::Keyword(name.clone()));
                    }
                    if !raw && name == "mod" && !is_inline_module(&tokens[i + 1..]) {
                        return Err(Violation::ModuleFile);
                    }
                    if FORBIDDEN_MACROS.contains(&name.as_str()) && is_invocation(&tokens[i + 1..]) {
                        return Err(Violation::Macro(name.clone()));
                    }
                    if ROOT_CRATES.contains(&name.as_str()) {
                        let (path, len) = read_path(&tokens[i..]);
                        if !self.is_allowed(&path) {
                            return Err(Violation::Path(path));
                        }
                        i += len;
                        continue;
                    }
                }
                Token::Punct('#') if tokens.get(i + 1) == Some(&Token::Punct('!')) => {
                    return Err(Violation::InnerAttribute);
                }
                Token::Punct('#') if tokens.get(i + 1) == Some(&Token::Punct('[')) => {
                    let forbidden = bracketed(&tokens[i + 1..]).iter().find_map(|token| {
                        match token {
                            Token::Ident { name, .. }
                                if FORBIDDEN_ATTRIBUTES.contains(&name.as_str()) =>
                            {
                                Some(name.clone())
                            }
                            _ => None,
                        }
                    });
                    if let Some(name) = forbidden {
                        return Err(Violation::Attribute(name));
                    }
                }
                _ => {}
            }
            i += 1;
        }

        Ok(())
    }

    fn is_allowed(&self, path: &str) -> bool {
        self.allowed.iter().any(|prefix| {
            path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with("::"))
        })
    }
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self::new(&crate::config::default_namespaces())
    }
}

impl Validator for SourcePolicy {
    fn validate(&self, snippet: &str) -> bool {
        match self.check(snippet) {
            Ok(()) => true,
            Err(violation) => {
                debug!(%violation, "snippet rejected");
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident { name: String, raw: bool },
    /// `::`
    PathSep,
    Punct(char),
}

/// Join `ident (:: ident)*` starting at `tokens[0]`; returns the path and the tokens used
fn read_path(tokens: &[Token]) -> (String, usize) {
    let mut path = String::new();
    let mut used = 0;
    while let Some(Token::Ident { name, .. }) = tokens.get(used) {
        path.push_str(name);
        used += 1;
        if tokens.get(used) == Some(&Token::PathSep)
            && matches!(tokens.get(used + 1), Some(Token::Ident { .. }))
        {
            path.push_str("::");
            used += 1;
        } else {
            break;
        }
    }
    (path, used)
}

/// Whether `tokens` start with `!` and an opening delimiter
fn is_invocation(tokens: &[Token]) -> bool {
    matches!(
        tokens,
        [Token::Punct('!'), Token::Punct('(' | '[' | '{'), ..]
    )
}

/// Whether the tokens after `mod` are a name and an opening brace
fn is_inline_module(tokens: &[Token]) -> bool {
    matches!(tokens, [Token::Ident { .. }, Token::Punct('{'), ..])
}

/// The tokens strictly inside the bracket group that `tokens` starts with
fn bracketed(tokens: &[Token]) -> &[Token] {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Punct('[') => depth += 1,
            Token::Punct(']') => {
                depth -= 1;
                if depth == 0 {
                    return &tokens[1..i];
                }
            }
            _ => {}
        }
    }
    tokens.get(1..).unwrap_or_default()
}

/// Lex `source` as Rust and flatten it into identifiers and punctuation
///
/// The lexer rejects unbalanced delimiters and unterminated literals or
/// comments. Literals and lifetimes are dropped; groups become their
/// delimiters around their contents.
fn tokenize(source: &str) -> Result<Vec<Token>, Violation> {
    let stream =
        TokenStream::from_str(source).map_err(|e| Violation::Lex(e.to_string()))?;
    let mut tokens = Vec::new();
    flatten(stream, &mut tokens);
    Ok(tokens)
}

fn flatten(stream: TokenStream, tokens: &mut Vec<Token>) {
    let mut trees = stream.into_iter().peekable();
    while let Some(tree) = trees.next() {
        match tree {
            TokenTree::Group(group) => {
                let (open, close) = match group.delimiter() {
                    Delimiter::Parenthesis => (Some('('), Some(')')),
                    Delimiter::Bracket => (Some('['), Some(']')),
                    Delimiter::Brace => (Some('{'), Some('}')),
                    Delimiter::None => (None, None),
                };
                tokens.extend(open.map(Token::Punct));
                flatten(group.stream(), tokens);
                tokens.extend(close.map(Token::Punct));
            }
            TokenTree::Ident(ident) => {
                let text = ident.to_string();
                let token = match text.strip_prefix("r#") {
                    Some(name) => Token::Ident {
                        name: name.to_string(),
                        raw: true,
                    },
                    None => Token::Ident {
                        name: text,
                        raw: false,
                    },
                };
                tokens.push(token);
            }
            TokenTree::Punct(punct) => match punct.as_char() {
                ':' if punct.spacing() == Spacing::Joint
                    && matches!(trees.peek(), Some(TokenTree::Punct(next)) if next.as_char() == ':') =>
                {
                    trees.next();
                    tokens.push(Token::PathSep);
                }
                // A lifetime or label: skip its name
                '\'' if punct.spacing() == Spacing::Joint => {
                    if matches!(trees.peek(), Some(TokenTree::Ident(_))) {
                        trees.next();
                    }
                }
                c => tokens.push(Token::Punct(c)),
            },
            TokenTree::Literal(_) => {}
        }
    }
}
