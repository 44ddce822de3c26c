//! Code for parsing, rewriting and serializing HTML.

use crate::select::CriticalRuleSet;
use ego_tree::NodeId;
use log::debug;
use markup5ever::{namespace_url, ns, Attribute, LocalName, QualName};
use scraper::{
    node::{Element, Node, Text},
    ElementRef, Html,
};

/// A parsed HTML document or fragment.
pub struct Document {
    html: Html,
    // Fragments are serialized without the `<html>` wrapper the parser adds
    fragment: bool,
}

/// A stylesheet referenced by the document, in document order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StyleSource {
    /// Text content of a `<style>` element
    Embedded(String),
    /// Local path from a `<link rel="stylesheet">` element
    Linked(String),
}

impl Document {
    /// Parses a full document if the input has a doctype or an `<html>`, `<head>` or `<body>` tag,
    /// and a body fragment otherwise.
    ///
    /// HTML parsing never fails; errors reported by the parser are only logged.
    #[must_use]
    pub fn parse(source: &str) -> Self {
        let fragment = !is_full_document(source);
        let html = if fragment {
            Html::parse_fragment(source)
        } else {
            Html::parse_document(source)
        };

        for err in &html.errors {
            debug!("HTML parse error: {err}");
        }

        Self { html, fragment }
    }

    #[must_use]
    pub fn html(&self) -> &Html {
        &self.html
    }

    #[must_use]
    pub fn is_fragment(&self) -> bool {
        self.fragment
    }

    /// Serializes the document tree. Fragments come back without wrapper elements.
    #[must_use]
    pub fn serialize(&self) -> String {
        if self.fragment {
            self.html.root_element().inner_html()
        } else {
            self.html.html()
        }
    }

    /// Iterates over every element in document order.
    pub fn elements(&self) -> impl Iterator<Item = ElementRef<'_>> {
        self.html.tree.root().descendants().filter_map(ElementRef::wrap)
    }

    pub(crate) fn style_sources(&self) -> Vec<StyleSource> {
        self.elements()
            .filter_map(|el| match el.value().name() {
                "style" => Some(StyleSource::Embedded(el.text().collect())),
                "link" if is_stylesheet_link(el.value()) => match el.value().attr("href") {
                    Some(href) => {
                        let path = local_href(href);
                        if path.is_none() {
                            debug!("skipping remote stylesheet {href}");
                        }
                        path.map(StyleSource::Linked)
                    }
                    None => None,
                },
                _ => None,
            })
            .collect()
    }

    /// Returns the value of the `style` attribute of the element with the given ID.
    pub(crate) fn inline_style(&self, id: NodeId) -> Option<&str> {
        self.html
            .tree
            .get(id)
            .and_then(ElementRef::wrap)
            .and_then(|el| el.value().attr("style"))
    }

    /// Sets the `style` attribute of an element, keeping the position of an existing one.
    pub(crate) fn set_inline_style(&mut self, id: NodeId, style: &str) {
        let Some(mut node) = self.html.tree.get_mut(id) else {
            return;
        };
        let Node::Element(element) = node.value() else {
            return;
        };

        let mut replaced = false;
        let mut attrs: Vec<_> = element
            .attrs()
            .map(|(name, value)| {
                if name == "style" {
                    replaced = true;
                    create_attr(name, style)
                } else {
                    create_attr(name, value)
                }
            })
            .collect();
        if !replaced {
            attrs.push(create_attr("style", style));
        }

        *element = Element::new(element.name.clone(), attrs);
    }

    /// Removes every `<style>` element.
    pub(crate) fn remove_style_elements(&mut self) {
        let ids: Vec<_> = self
            .elements()
            .filter(|el| el.value().name() == "style")
            .map(|el| el.id())
            .collect();
        self.detach_all(ids);
    }

    /// Removes every HTML comment.
    pub(crate) fn remove_comments(&mut self) {
        let ids: Vec<_> = self
            .html
            .tree
            .root()
            .descendants()
            .filter(|node| node.value().is_comment())
            .map(|node| node.id())
            .collect();
        self.detach_all(ids);
    }

    /// Inserts a `<style>` element as the first child of `<head>`.
    /// Fragments have no `<head>`, so there the element becomes the first top-level node.
    pub(crate) fn insert_style(&mut self, css: &str) {
        let target = self
            .elements()
            .find(|el| el.value().name() == "head")
            .map_or_else(|| self.html.root_element().id(), |head| head.id());

        let Some(mut target) = self.html.tree.get_mut(target) else {
            return;
        };
        let mut style = target.prepend(create_el("style"));
        if !css.is_empty() {
            style.append(Node::Text(Text { text: css.into() }));
        }
    }

    fn detach_all(&mut self, ids: Vec<NodeId>) {
        for id in ids {
            if let Some(mut node) = self.html.tree.get_mut(id) {
                node.detach();
            }
        }
    }
}

/// Replaces all embedded styles with one `<style>` element holding the critical CSS.
/// `<link>` elements are left untouched. The `<style>` element is inserted even when there is no critical CSS.
pub fn apply_critical(document: &mut Document, critical: &CriticalRuleSet) {
    document.remove_style_elements();
    document.insert_style(&critical.to_css());
}

fn is_full_document(source: &str) -> bool {
    let lower = source.to_ascii_lowercase();
    lower.contains("<!doctype") || ["html", "head", "body"].iter().any(|tag| contains_tag(&lower, tag))
}

fn contains_tag(lower: &str, tag: &str) -> bool {
    lower.match_indices('<').any(|(i, _)| {
        let rest = &lower[i + 1..];
        rest.strip_prefix(tag).is_some_and(|after| {
            after
                .bytes()
                .next()
                .is_none_or(|byte| byte == b'>' || byte == b'/' || byte.is_ascii_whitespace())
        })
    })
}

fn is_stylesheet_link(link: &Element) -> bool {
    link.attr("rel").is_some_and(|rel| {
        rel.split_ascii_whitespace()
            .any(|token| token.eq_ignore_ascii_case("stylesheet"))
    })
}

/// Turns a stylesheet `href` into a path relative to the stylesheet directory.
/// Returns `None` for remote and inline URLs.
fn local_href(href: &str) -> Option<String> {
    let href = href.trim();
    let lower = href.to_ascii_lowercase();
    if href.starts_with("//") || lower.contains("://") || lower.starts_with("data:") {
        return None;
    }

    let path = href.split(['?', '#']).next().unwrap_or_default();
    let path = path.trim_start_matches('/');
    (!path.is_empty()).then(|| path.to_owned())
}

fn create_el(name: &str) -> Node {
    Node::Element(Element::new(create_name(name, true), vec![]))
}

fn create_attr(name: &str, value: &str) -> Attribute {
    Attribute {
        name: create_name(name, false),
        value: value.into(),
    }
}

fn create_name(name: &str, element: bool) -> QualName {
    QualName {
        prefix: None,
        ns: if element { ns!(html) } else { ns!() },
        local: LocalName::from(name),
    }
}
