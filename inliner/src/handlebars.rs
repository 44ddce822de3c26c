//! Single-pass scanner for Handlebars tags.
//!
//! The scanner walks the text once, tracking whether it is inside a tag, inside a quoted
//! string literal within a tag, or inside a raw block. Everything it cannot close is left alone.
//!
//! Searches that run off the end of the text are remembered, so a run of unterminated tags
//! does not rescan the rest of the input for each one.

use crate::shield::TagKind;
use foldhash::{HashMap, HashMapExt};
use std::ops::Range;

const OPEN: &str = "{{";
const RAW_OPEN: &str = "{{{{";
const RAW_CLOSE: &str = "}}}}";

/// Finds every tag in `text`, in document order.
/// Escaped tags are reported with [`TagKind::EscapedLiteral`] so callers can skip them.
pub(crate) fn scan(text: &str) -> Vec<(Range<usize>, TagKind)> {
    Scanner::new(text).scan()
}

struct Scanner<'t> {
    text: &'t str,
    /// Per terminator and offset, the quote states (see [`quote_state`]) from which a search fails
    dead: HashMap<&'static str, Vec<u8>>,
    /// Smallest offsets from which no `}}` / `--}}` follows
    comment_unclosed: [usize; 2],
    /// Per raw block name, smallest offset after which no close tag for it exists
    raw_unclosed: HashMap<&'t str, usize>,
}

impl<'t> Scanner<'t> {
    fn new(text: &'t str) -> Self {
        Self {
            text,
            dead: HashMap::new(),
            comment_unclosed: [usize::MAX; 2],
            raw_unclosed: HashMap::new(),
        }
    }

    fn scan(mut self) -> Vec<(Range<usize>, TagKind)> {
        let text = self.text;
        let mut tags = Vec::new();
        let mut pos = 0;

        while let Some(offset) = text[pos..].find(OPEN) {
            let start = pos + offset;

            let Some((end, kind)) = self.read_tag(start) else {
                // Unterminated: treat the braces as literal text
                pos = start + OPEN.len();
                continue;
            };

            if is_escaped(text.as_bytes(), start) {
                tags.push((start..end, TagKind::EscapedLiteral));
                pos = end;
                continue;
            }

            tags.push((start..end, kind));
            pos = end;

            // The interior of a raw block is opaque; jump straight to its matching close tag
            if kind == TagKind::RawBlockOpen {
                let name = raw_block_name(&text[start + RAW_OPEN.len()..end - RAW_CLOSE.len()]);
                if let Some(close) = self.raw_block_end(end, name) {
                    pos = close.end;
                    tags.push((close, TagKind::RawBlockClose));
                }
            }
        }

        coalesce_block_delimiters(tags)
    }

    /// Reads the tag starting at `start` (which points at `{{`), returning its end offset and kind.
    fn read_tag(&mut self, start: usize) -> Option<(usize, TagKind)> {
        let text = self.text;
        let rest = &text[start..];

        if rest.starts_with(RAW_OPEN) {
            let end = self.find_close(start + RAW_OPEN.len(), RAW_CLOSE)?;
            let kind = if text[start + RAW_OPEN.len()..].trim_start().starts_with('/') {
                TagKind::RawBlockClose
            } else {
                TagKind::RawBlockOpen
            };
            return Some((end, kind));
        }

        if rest.starts_with("{{{") {
            let end = self.find_close(start + 3, "}}}")?;
            return Some((end, TagKind::UnescapedExpression));
        }

        // Skip whitespace control
        let mut inner = start + OPEN.len();
        if text[inner..].starts_with('~') {
            inner += 1;
        }

        let body = &text[inner..];
        let kind = match body.bytes().next()? {
            b'!' => {
                return self
                    .find_comment_close(inner + 1)
                    .map(|end| (end, TagKind::Comment))
            }
            b'#' => TagKind::BlockOpen,
            b'/' => TagKind::BlockClose,
            b'>' => TagKind::Partial,
            b'&' => TagKind::UnescapedExpression,
            b'^' => {
                let end = self.find_close(inner + 1, "}}")?;
                // A bare `{{^}}` is an inverse section separator; `{{^name}}` opens an inverted block
                let kind = if text[inner + 1..end - 2].trim_end_matches('~').trim().is_empty() {
                    TagKind::BlockInverse
                } else {
                    TagKind::BlockOpen
                };
                return Some((end, kind));
            }
            _ if is_keyword(body, "else") => TagKind::BlockInverse,
            _ => TagKind::Expression,
        };

        self.find_close(inner, "}}").map(|end| (end, kind))
    }

    /// Scans forward from `from` for `terminator`, skipping over quoted string literals.
    /// Returns the offset just past the terminator.
    ///
    /// The outcome only depends on the current offset and quote state,
    /// so every state visited by a failed search is marked as failing.
    fn find_close(&mut self, from: usize, terminator: &'static str) -> Option<usize> {
        let text = self.text;
        let bytes = text.as_bytes();
        let dead = self
            .dead
            .entry(terminator)
            .or_insert_with(|| vec![0; bytes.len()]);

        let mut visited = Vec::new();
        let mut quote = None;
        let mut i = from;

        while i < bytes.len() {
            let state = quote_state(quote);
            if dead[i] & state != 0 {
                break;
            }
            visited.push((i, state));

            let byte = bytes[i];
            match quote {
                Some(_) if byte == b'\\' => {
                    i += 2;
                    continue;
                }
                Some(q) if byte == q => quote = None,
                Some(_) => {}
                None if bytes[i..].starts_with(terminator.as_bytes()) => {
                    return Some(i + terminator.len());
                }
                None => {
                    if matches!(byte, b'"' | b'\'') && starts_token(bytes, i) {
                        quote = Some(byte);
                    }
                }
            }
            i += 1;
        }

        for (i, state) in visited {
            dead[i] |= state;
        }
        None
    }

    /// Comments are not quote-tracked. Long comments (`{{!-- --}}`) may contain `}}`.
    fn find_comment_close(&mut self, from: usize) -> Option<usize> {
        let text = self.text;
        let long = text[from..].starts_with("--");
        let unclosed = &mut self.comment_unclosed[usize::from(long)];
        if from >= *unclosed {
            return None;
        }

        let found = if long {
            find_long_comment_close(text, from + 2)
        } else {
            text[from..].find("}}").map(|i| from + i + 2)
        };

        if found.is_none() {
            *unclosed = from;
        }
        found
    }

    /// Finds the close tag of the raw block named `name`, honoring nested raw blocks of the same name.
    fn raw_block_end(&mut self, from: usize, name: &'t str) -> Option<Range<usize>> {
        if self.raw_unclosed.get(name).is_some_and(|&unclosed| from >= unclosed) {
            return None;
        }

        let text = self.text;
        let mut depth = 1_usize;
        let mut pos = from;
        let mut saw_close = false;

        while let Some(offset) = text[pos..].find(RAW_OPEN) {
            let start = pos + offset;
            let Some(end) = self.find_close(start + RAW_OPEN.len(), RAW_CLOSE) else {
                break;
            };
            let inner = text[start + RAW_OPEN.len()..end - RAW_CLOSE.len()].trim();

            match inner.strip_prefix('/') {
                Some(closing) if closing.trim() == name => {
                    saw_close = true;
                    depth -= 1;
                    if depth == 0 {
                        return Some(start..end);
                    }
                }
                Some(_) => {}
                None if raw_block_name(inner) == name => depth += 1,
                None => {}
            }

            pos = end;
        }

        if !saw_close {
            self.raw_unclosed.insert(name, from);
        }
        None
    }
}

fn find_long_comment_close(text: &str, from: usize) -> Option<usize> {
    let mut pos = from;
    while let Some(offset) = text[pos..].find("--") {
        let dashes = pos + offset;
        let after = &text[dashes + 2..];
        if after.starts_with("}}") {
            return Some(dashes + 4);
        }
        if after.starts_with("~}}") {
            return Some(dashes + 5);
        }
        pos = dashes + 1;
    }

    None
}

fn raw_block_name(inner: &str) -> &str {
    inner
        .trim()
        .split(char::is_whitespace)
        .next()
        .unwrap_or_default()
}

/// A backslash escapes the tag, unless the backslash is itself escaped.
fn is_escaped(bytes: &[u8], start: usize) -> bool {
    start >= 1 && bytes[start - 1] == b'\\' && !(start >= 2 && bytes[start - 2] == b'\\')
}

fn quote_state(quote: Option<u8>) -> u8 {
    match quote {
        None => 1,
        Some(b'"') => 2,
        Some(_) => 4,
    }
}

/// String literals only begin at the start of a token.
fn starts_token(bytes: &[u8], i: usize) -> bool {
    i > 0 && matches!(bytes[i - 1], b' ' | b'\t' | b'\n' | b'\r' | b'=' | b'(' | b'{' | b'~')
}

fn is_keyword(body: &str, keyword: &str) -> bool {
    body.strip_prefix(keyword).is_some_and(|rest| {
        rest.bytes()
            .next()
            .is_none_or(|byte| !(byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.')))
    })
}

fn is_block_delimiter(kind: TagKind) -> bool {
    matches!(
        kind,
        TagKind::BlockOpen | TagKind::BlockInverse | TagKind::BlockClose
    )
}

/// Block delimiters that directly abut each other form one span.
fn coalesce_block_delimiters(tags: Vec<(Range<usize>, TagKind)>) -> Vec<(Range<usize>, TagKind)> {
    let mut merged: Vec<(Range<usize>, TagKind)> = Vec::with_capacity(tags.len());

    for (span, kind) in tags {
        if let Some((last_span, last_kind)) = merged.last_mut() {
            if last_span.end == span.start && is_block_delimiter(*last_kind) && is_block_delimiter(kind)
            {
                last_span.end = span.end;
                continue;
            }
        }
        merged.push((span, kind));
    }

    merged
}
