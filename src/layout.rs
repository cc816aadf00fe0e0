//! Positioned text tokens and their grouping into lines.
//!
//! ```text
//! Page (tokens in decode order)  ->  tokenize  ->  BTreeMap<LineKey, Line>
//!                                                  (top to bottom, left to right)
//! ```

use std::collections::BTreeMap;

/// A word with its position on the page.
///
/// `top` grows downwards from the top edge of the page.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub x0: f64,
    pub top: f64,
}

impl Token {
    pub fn new(text: impl Into<String>, x0: f64, top: f64) -> Self {
        Self {
            text: text.into(),
            x0,
            top,
        }
    }
}

/// One decoded page. Immutable once produced by a decoder.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub tokens: Vec<Token>,
    pub width: f64,
    pub height: f64,
}

/// Vertical coordinate rounded to one decimal, stored in tenths so it can be
/// used as an ordered map key.
pub type LineKey = i64;

pub fn line_key(top: f64) -> LineKey {
    (top * 10.0).round() as LineKey
}

/// Tokens sharing a rounded vertical coordinate, ordered by `x0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub top: f64,
    pub tokens: Vec<Token>,
}

impl Line {
    pub fn text(&self) -> String {
        self.tokens
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Group tokens into lines keyed by their rounded `top`.
pub fn tokenize<'a>(tokens: impl IntoIterator<Item = &'a Token>) -> BTreeMap<LineKey, Line> {
    let mut lines: BTreeMap<LineKey, Line> = BTreeMap::new();
    for token in tokens {
        let key = line_key(token.top);
        lines
            .entry(key)
            .or_insert_with(|| Line {
                top: key as f64 / 10.0,
                tokens: Vec::new(),
            })
            .tokens
            .push(token.clone());
    }
    for line in lines.values_mut() {
        // stable, so equal x0 keeps decode order
        line.tokens.sort_by(|a, b| a.x0.total_cmp(&b.x0));
    }
    lines
}

impl Page {
    pub fn lines(&self) -> BTreeMap<LineKey, Line> {
        tokenize(&self.tokens)
    }

    /// Tokens in reading order: line by line, left to right.
    pub fn words(&self) -> Vec<Token> {
        self.lines()
            .into_values()
            .flat_map(|line| line.tokens)
            .collect()
    }

    /// Text of the tokens starting inside the rectangle, one output line per
    /// page line.
    ///
    /// A token belongs to the region when `x0 ∈ [x0, x1)` and `top ∈ [y0, y1]`.
    pub fn region_text(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> String {
        let inside = self
            .tokens
            .iter()
            .filter(|t| t.x0 >= x0 && t.x0 < x1 && t.top >= y0 && t.top <= y1);
        tokenize(inside)
            .values()
            .map(Line::text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
