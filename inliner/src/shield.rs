//! Code for protecting template tags from HTML and CSS processing.
//!
//! Every tag is swapped for a placeholder made only of lowercase letters, digits and `x`,
//! so it survives unchanged as element text, inside attribute values and inside CSS declarations.
//! The placeholder prefix is chosen per document so it never occurs in the input.

use crate::handlebars::scan as scan_handlebars;
use aho_corasick::{AhoCorasick, MatchKind};
use foldhash::{HashMap, HashMapExt};
use log::warn;
use serde::Deserialize;
use std::{fmt::Write as _, ops::Range};

/// A template language whose tags can be shielded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Template {
    Handlebars,
}

impl Template {
    fn scan(self, text: &str) -> Vec<(Range<usize>, TagKind)> {
        match self {
            Self::Handlebars => scan_handlebars(text),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagKind {
    Expression,
    UnescapedExpression,
    BlockOpen,
    BlockInverse,
    BlockClose,
    Comment,
    Partial,
    RawBlockOpen,
    RawBlockClose,
    EscapedLiteral,
}

/// One occurrence of a template tag in the original text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    /// Byte offsets of the tag in the original text
    pub span: Range<usize>,
    pub kind: TagKind,
    /// 1-based; identical tag texts share an ordinal
    pub ordinal: usize,
}

/// Everything needed to turn shielded text back into the original.
#[derive(Clone, Debug, Default)]
pub struct TagList {
    marker: String,
    texts: Vec<Box<str>>,
    tags: Vec<Tag>,
    // Matches every placeholder; `None` when there are no tags
    placeholders: Option<AhoCorasick>,
}

impl TagList {
    #[must_use]
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Returns the original text of the tag with the given ordinal.
    #[must_use]
    pub fn text(&self, ordinal: usize) -> Option<&str> {
        self.texts.get(ordinal.checked_sub(1)?).map(AsRef::as_ref)
    }

    #[must_use]
    pub fn placeholder(&self, ordinal: usize) -> String {
        let mut placeholder = String::with_capacity(self.marker.len() + 4);
        push_placeholder(&mut placeholder, &self.marker, ordinal);
        placeholder
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    fn build_automaton(&self) -> Option<AhoCorasick> {
        if self.texts.is_empty() {
            return None;
        }

        let placeholders: Vec<_> = (1..=self.texts.len())
            .map(|ordinal| self.placeholder(ordinal))
            .collect();

        AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostLongest)
            .build(&placeholders)
            .inspect_err(|err| warn!("falling back to plain placeholder replacement: {err}"))
            .ok()
    }
}

/// Replaces every non-escaped tag in `text` with a placeholder.
/// Malformed tags are left as they are.
#[must_use]
pub fn shield(text: &str, template: Template) -> (String, TagList) {
    shield_reserving(text, template, &[])
}

/// Like [`shield`], but the placeholder prefix also never occurs in any of `reserved`.
/// Callers pass text that later processing may reintroduce, such as the document
/// after character references have been decoded.
pub(crate) fn shield_reserving(
    text: &str,
    template: Template,
    reserved: &[&str],
) -> (String, TagList) {
    let marker = unused_marker(text, reserved);
    let mut ordinals = HashMap::new();
    let mut texts = Vec::new();
    let mut tags = Vec::new();

    let mut shielded = String::with_capacity(text.len());
    let mut copied = 0;

    for (span, kind) in template.scan(text) {
        if kind == TagKind::EscapedLiteral {
            continue;
        }

        let tag_text = &text[span.clone()];
        let ordinal = *ordinals.entry(tag_text).or_insert_with(|| {
            texts.push(Box::from(tag_text));
            texts.len()
        });

        shielded.push_str(&text[copied..span.start]);
        push_placeholder(&mut shielded, &marker, ordinal);
        copied = span.end;

        tags.push(Tag {
            span,
            kind,
            ordinal,
        });
    }

    shielded.push_str(&text[copied..]);

    let mut tags = TagList {
        marker,
        texts,
        tags,
        placeholders: None,
    };
    tags.placeholders = tags.build_automaton();

    (shielded, tags)
}

/// Puts the original tags back in place of their placeholders.
#[must_use]
pub fn restore(shielded: &str, tags: &TagList) -> String {
    match &tags.placeholders {
        Some(placeholders) => placeholders.replace_all(shielded, &tags.texts),
        None => (1..=tags.texts.len()).fold(shielded.to_owned(), |text, ordinal| {
            text.replace(&tags.placeholder(ordinal), &tags.texts[ordinal - 1])
        }),
    }
}

/// Returns the distinct tags `shield` would replace, in order of first appearance.
#[must_use]
pub fn extract_tags(text: &str, template: Template) -> Vec<&str> {
    let mut tags: Vec<&str> = Vec::new();

    for (span, kind) in template.scan(text) {
        let tag = &text[span];
        if kind != TagKind::EscapedLiteral && !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    tags
}

/// Extracts Handlebars tags from `text`.
#[must_use]
pub fn handlebars(text: &str) -> Vec<&str> {
    extract_tags(text, Template::Handlebars)
}

/// Picks a placeholder prefix that does not appear anywhere in `text`.
/// No proper suffix of the prefix is also a prefix of it,
/// so placeholders cannot be matched across their boundaries with neighboring text.
fn unused_marker(text: &str, reserved: &[&str]) -> String {
    let mut salt = 0_u32;
    loop {
        let marker = format!("tmpl{salt}x");
        if !text.contains(&marker) && !reserved.iter().any(|other| other.contains(&marker)) {
            return marker;
        }
        salt += 1;
    }
}

fn push_placeholder(buf: &mut String, marker: &str, ordinal: usize) {
    buf.push_str(marker);
    write!(buf, "{ordinal}x").expect("writing to a `String` should succeed");
}

#[cfg(test)]
mod test {
    use super::{extract_tags, handlebars, restore, shield, shield_reserving, TagKind, Template};

    // Replaces each extracted tag with `$n`, in extraction order
    fn replace_tags(template: &str) -> String {
        handlebars(template)
            .iter()
            .enumerate()
            .fold(template.to_owned(), |text, (i, tag)| {
                text.replace(tag, &format!("${}", i + 1))
            })
    }

    #[test]
    fn expressions() {
        assert_eq!(
            replace_tags(r#"<h1>{{message}}</h1><input value="{{time}}">"#),
            r#"<h1>$1</h1><input value="$2">"#
        );
        assert_eq!(
            replace_tags("{{#each articles.[10].[#comments]}}{{/each}}"),
            "$1"
        );
        assert_eq!(replace_tags("<h1>{{{raw}}}</h1>"), "<h1>$1</h1>");
    }

    #[test]
    fn helpers_with_quoted_args() {
        assert_eq!(
            replace_tags(r#"{{{link "See more..." href=story.url class="story"}}}"#),
            "$1"
        );
        assert_eq!(
            replace_tags(r#"{{outer-helper (inner-helper "abc") "def"}}"#),
            "$1"
        );
        assert_eq!(replace_tags(r#"{{> userMessage tagName="h1" }}"#), "$1");
    }

    #[test]
    fn raw_blocks() {
        assert_eq!(
            replace_tags("{{{{raw}}}}{{escaped}}{{{{/raw}}}}"),
            "$1{{escaped}}$2"
        );

        let (shielded, tags) = shield("{{{{raw}}}}{{escaped}}{{{{/raw}}}}", Template::Handlebars);
        assert_eq!(tags.tags().len(), 2, "only the raw block delimiters should be shielded");
        assert!(shielded.contains("{{escaped}}"));
    }

    #[test]
    fn escaped_tags() {
        let template = r#"\{{escaped "foo"}}"#;
        assert_eq!(replace_tags(template), template);

        let (shielded, tags) = shield(template, Template::Handlebars);
        assert_eq!(shielded, template, "escaped tags should be left untouched");
        assert!(tags.is_empty());
    }

    #[test]
    fn blocks() {
        assert_eq!(
            replace_tags("{{#if user}}<h1>Welcome back</h1>{{/if}}"),
            "$1<h1>Welcome back</h1>$2"
        );
        assert_eq!(
            replace_tags("{{#if user}}<h1>Welcome back</h1>{{else}}{{/if}}"),
            "$1<h1>Welcome back</h1>$2"
        );
        assert_eq!(replace_tags("{{#if user}}{{else}}Login{{/if}}"), "$1Login$2");
        assert_eq!(
            replace_tags("{{#if user}}<h1>Welcome back</h1>{{else}}Login{{/if}}"),
            "$1<h1>Welcome back</h1>$2Login$3"
        );
        assert_eq!(replace_tags("{{#if user}}{{else}}{{/if}}"), "$1");
        assert_eq!(
            replace_tags("{{#each users as |user userId|}}\nId: {{userId}} Name: {{user.name}}\n{{/each}}"),
            "$1\nId: $2 Name: $3\n$4"
        );
        assert_eq!(
            replace_tags("{{#foo}}a{{#bar}}b{{else}}c{{/bar}}d{{/foo}}e"),
            "$1a$2b$3c$4d$5e"
        );
    }

    #[test]
    fn blocks_in_attribute_values() {
        assert_eq!(
            replace_tags(r#"<input value="{{#if user}}{{user}}{{else}}Login{{/if}}">"#),
            r#"<input value="$1$2$3Login$4">"#
        );
        assert_eq!(
            replace_tags(r#"<input value="{{#if user}}{{format user "f.L"}}{{else}}Login{{/if}}">"#),
            r#"<input value="$1$2$3Login$4">"#
        );
    }

    #[test]
    fn comments() {
        assert_eq!(
            replace_tags("{{! This comment will not be in the output }}\n<!-- This comment will be in the output -->"),
            "$1\n<!-- This comment will be in the output -->"
        );
    }

    #[test]
    fn multiline_tags() {
        assert_eq!(
            replace_tags("{{userMessage\ntag=\"h1\"\nname=\"assaf\"}}"),
            "$1"
        );
    }

    #[test]
    fn quoted_braces() {
        assert_eq!(
            replace_tags(r#"{{userMessage single='}}' double="}}" }}"#),
            "$1"
        );
    }

    #[test]
    fn duplicate_tags() {
        let tag = r#"{{userMessage tag="h1"}}"#;
        let template = format!("{tag}{tag}");
        assert_eq!(replace_tags(&template), "$1$1");

        let (shielded, tags) = shield(&template, Template::Handlebars);
        assert_eq!(tags.tags().len(), 2);
        assert_eq!(tags.tags()[0].ordinal, tags.tags()[1].ordinal);
        assert_eq!(shielded, tags.placeholder(1).repeat(2));
        assert_eq!(tags.text(1), Some(tag));
    }

    #[test]
    fn ordinals_follow_document_order() {
        let (_, tags) = shield("{{a}} {{#b}}{{c}}{{/b}} {{a}}", Template::Handlebars);
        let ordinals: Vec<_> = tags.tags().iter().map(|tag| tag.ordinal).collect();
        let kinds: Vec<_> = tags.tags().iter().map(|tag| tag.kind).collect();

        assert_eq!(ordinals, [1, 2, 3, 4, 1]);
        assert_eq!(
            kinds,
            [
                TagKind::Expression,
                TagKind::BlockOpen,
                TagKind::Expression,
                TagKind::BlockClose,
                TagKind::Expression
            ]
        );
    }

    #[test]
    fn shielded_text_has_no_tags() {
        let template = r#"<p class="{{cls}}">{{#if a}}{{b "x}}"}}{{/if}}</p>"#;
        let (shielded, tags) = shield(template, Template::Handlebars);

        for tag in extract_tags(template, Template::Handlebars) {
            assert!(!shielded.contains(tag), "{tag} should have been shielded");
        }
        assert!(!shielded.contains("{{"));
        assert_eq!(restore(&shielded, &tags), template);
    }

    #[test]
    fn round_trip() {
        for template in [
            "",
            "plain text",
            "{{never closed",
            r"\{{escaped}} and {{real}}",
            "{{{{raw}}}}{{x}}{{{{/raw}}}}{{y}}",
            "héllo {{wörld}} ünïcode {{!-- {{ --}}",
            "{{a}}{{a}}{{b}}",
        ] {
            let (shielded, tags) = shield(template, Template::Handlebars);
            assert_eq!(restore(&shielded, &tags), template);
        }
    }

    #[test]
    fn round_trip_generated() {
        const PIECES: [&str; 12] = [
            "{{", "}}", "{{{{", "}}}}", "{{{{/", "\"", "'", "\\", "a", " ", "!--", "#",
        ];

        let mut checked = 0;
        for a in PIECES {
            for b in PIECES {
                for c in PIECES {
                    for d in PIECES {
                        let template = [a, b, c, d].concat();
                        let (shielded, tags) = shield(&template, Template::Handlebars);
                        assert_eq!(restore(&shielded, &tags), template, "round trip of {template:?}");

                        if !template.contains('\\') {
                            for tag in extract_tags(&template, Template::Handlebars) {
                                assert!(
                                    !shielded.contains(tag),
                                    "{tag:?} should be shielded in {template:?}"
                                );
                            }
                        }
                        checked += 1;
                    }
                }
            }
        }
        assert_eq!(checked, PIECES.len().pow(4));
    }

    #[test]
    fn reserved_text_changes_the_marker() {
        let (shielded, tags) = shield_reserving("<p>{{a}}</p>", Template::Handlebars, &["tmpl0x1x"]);

        assert_eq!(shielded, "<p>tmpl1x1x</p>");
        assert_eq!(restore(&shielded, &tags), "<p>{{a}}</p>");
    }

    #[test]
    fn placeholders_avoid_existing_text() {
        let template = "tmpl0x tmpl0x1x {{a}}";
        let (shielded, tags) = shield(template, Template::Handlebars);

        assert_eq!(tags.placeholder(1), "tmpl1x1x");
        assert_eq!(shielded, "tmpl0x tmpl0x1x tmpl1x1x");
        assert_eq!(restore(&shielded, &tags), template);
    }
}
