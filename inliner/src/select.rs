//! Code for matching stylesheet rules against a document.
//!
//! Selectors are evaluated with `scraper`, which only understands tree-structural pseudo-classes.
//! Selectors it rejects are retried with every pseudo-class and pseudo-element removed,
//! so `h1:hover` is judged by whether an `h1` exists.

use crate::{
    document::Document,
    stylesheet::{self, rules_to_css, ConditionalRule, Declaration, Rule, StyleRule, Stylesheet},
    Error, Result,
};
use ego_tree::NodeId;
use foldhash::{HashMap, HashMapExt, HashSet, HashSetExt};
use lightningcss::properties::PropertyId;
use log::{debug, warn};
use scraper::{ElementRef, Selector};

/// Rules that apply to the critical part of a document, in source order.
/// Rules nested in `@media` or `@supports` keep their wrapper.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CriticalRuleSet {
    rules: Vec<Rule>,
}

impl CriticalRuleSet {
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Appends the rules of a later stylesheet. `@import` rules are kept ahead of all others.
    pub fn extend(&mut self, other: Self) {
        self.rules.extend(other.rules);
        hoist_imports(&mut self.rules);
    }

    /// Serializes the rules as minified CSS.
    #[must_use]
    pub fn to_css(&self) -> String {
        rules_to_css(&self.rules)
    }
}

/// Finds the rules of `stylesheet` whose selectors match at least one critical element.
/// At-rules other than `@media` and `@supports` cannot be matched and are always kept.
pub fn select_critical(
    stylesheet: &Stylesheet,
    document: &Document,
    is_critical: impl Fn(&ElementRef<'_>) -> bool,
) -> CriticalRuleSet {
    CriticalRuleSet {
        rules: filter_rules(stylesheet.rules(), document, &is_critical),
    }
}

fn filter_rules(
    rules: &[Rule],
    document: &Document,
    is_critical: &dyn Fn(&ElementRef<'_>) -> bool,
) -> Vec<Rule> {
    rules
        .iter()
        .filter_map(|rule| match rule {
            Rule::Style(style) => style
                .selectors
                .iter()
                .filter_map(prepare)
                .any(|selector| {
                    document
                        .html()
                        .select(&selector.matcher)
                        .any(|el| is_critical(&el))
                })
                .then(|| rule.clone()),
            Rule::Conditional(conditional) => {
                let rules = filter_rules(&conditional.rules, document, is_critical);
                (!rules.is_empty()).then(|| {
                    Rule::Conditional(ConditionalRule {
                        kind: conditional.kind,
                        condition: conditional.condition.clone(),
                        rules,
                    })
                })
            }
            Rule::Verbatim(_) => Some(rule.clone()),
        })
        .collect()
}

/// Collects the IDs of elements matching `selector`, along with their descendants and ancestors.
///
/// # Errors
/// This function returns [`Error::InvalidSelector`] if `selector` cannot be parsed.
pub fn critical_region(document: &Document, selector: &str) -> Result<HashSet<NodeId>> {
    let matcher = Selector::parse(selector).map_err(|_| Error::InvalidSelector {
        selector: selector.to_owned(),
    })?;

    let mut region = HashSet::new();
    for el in document.html().select(&matcher) {
        region.extend(el.descendants().map(|node| node.id()));
        region.extend(el.ancestors().map(|node| node.id()));
    }

    Ok(region)
}

/// Merges the declarations of every matching rule into the `style` attribute of each element.
///
/// Declarations are ordered by importance, then specificity, then source order;
/// later stylesheets come after earlier ones. Properties already present in an element's
/// `style` attribute are never overridden.
///
/// Returns the rules that cannot be inlined: conditional and other at-rules,
/// and rules whose selectors depend on pseudo-classes or pseudo-elements.
pub fn inline_all<'s>(
    stylesheets: impl IntoIterator<Item = &'s Stylesheet>,
    document: &mut Document,
) -> Vec<Rule> {
    let mut candidates: HashMap<NodeId, Vec<Candidate<'s>>> = HashMap::new();
    let mut preserved = Vec::new();

    for (sheet, stylesheet) in stylesheets.into_iter().enumerate() {
        for rule in stylesheet.rules() {
            let Rule::Style(style) = rule else {
                preserved.push(rule.clone());
                continue;
            };

            let mut dynamic = Vec::new();
            let mut matched: HashMap<NodeId, u32> = HashMap::new();

            for selector in &style.selectors {
                match prepare(selector) {
                    Some(prepared) if !prepared.stripped => {
                        for el in document.html().select(&prepared.matcher) {
                            let specificity = matched.entry(el.id()).or_default();
                            *specificity = (*specificity).max(prepared.specificity);
                        }
                    }
                    _ => dynamic.push(selector.clone()),
                }
            }

            if !dynamic.is_empty() {
                preserved.push(Rule::Style(StyleRule {
                    selectors: dynamic,
                    declarations: style.declarations.clone(),
                    order: style.order,
                }));
            }

            for (id, specificity) in matched {
                candidates
                    .entry(id)
                    .or_default()
                    .extend(style.declarations.iter().map(|declaration| Candidate {
                        important: declaration.important,
                        specificity,
                        order: (sheet, style.order),
                        declaration,
                    }));
            }
        }
    }

    let styles: Vec<_> = candidates
        .into_iter()
        .filter_map(|(id, candidates)| {
            merge_style(document.inline_style(id), candidates).map(|style| (id, style))
        })
        .collect();

    for (id, style) in styles {
        document.set_inline_style(id, &style);
    }

    hoist_imports(&mut preserved);
    preserved
}

/// Moves `@import` rules to the front, keeping the relative order of everything else.
fn hoist_imports(rules: &mut [Rule]) {
    rules.sort_by_key(|rule| !rule.is_import());
}

struct Candidate<'s> {
    important: bool,
    specificity: u32,
    order: (usize, usize),
    declaration: &'s Declaration,
}

/// Resolves the cascade for one element and renders its new `style` attribute.
/// Returns `None` when nothing would change.
fn merge_style(existing: Option<&str>, mut candidates: Vec<Candidate<'_>>) -> Option<String> {
    let existing = existing.unwrap_or_default().trim().trim_end_matches(';');
    let mut existing_properties = HashSet::new();
    for declaration in existing.split(';') {
        if let Some((property, _)) = declaration.split_once(':') {
            existing_properties.extend(with_longhands(property.trim()));
        }
    }

    // Stable sort, so declarations of one rule keep their order
    candidates.sort_by_key(|candidate| (candidate.important, candidate.specificity, candidate.order));

    let mut resolved: Vec<&Declaration> = Vec::new();
    for Candidate { declaration, .. } in candidates {
        // The existing inline style wins, including over longhands of its shorthands and vice versa
        if with_longhands(&declaration.property)
            .iter()
            .any(|property| existing_properties.contains(property))
        {
            continue;
        }
        resolved.retain(|earlier| earlier.property != declaration.property);
        resolved.push(declaration);
    }

    if resolved.is_empty() {
        return None;
    }

    let mut style = String::from(existing);
    for declaration in resolved {
        if !style.is_empty() {
            style.push(';');
        }
        style.push_str(&declaration.to_string());
    }

    Some(style)
}

/// Returns the lowercased property name along with every longhand it expands to.
fn with_longhands(property: &str) -> Vec<String> {
    let property = property.to_ascii_lowercase();
    let mut names = Vec::new();

    if let Some(longhands) = PropertyId::from(property.as_str()).longhands() {
        for longhand in longhands {
            names.extend(with_longhands(longhand.name()));
        }
    }

    names.push(property);
    names
}

struct PreparedSelector {
    matcher: Selector,
    specificity: u32,
    /// Whether pseudo-classes or pseudo-elements had to be removed
    stripped: bool,
}

fn prepare(selector: &stylesheet::Selector) -> Option<PreparedSelector> {
    if let Ok(matcher) = Selector::parse(&selector.text) {
        return Some(PreparedSelector {
            matcher,
            specificity: selector.specificity,
            stripped: false,
        });
    }

    let base = strip_pseudos(&selector.text);
    let Ok(matcher) = Selector::parse(&base) else {
        warn!("cannot evaluate selector `{}`", selector.text);
        return None;
    };

    debug!("matching `{}` as `{base}`", selector.text);
    Some(PreparedSelector {
        matcher,
        specificity: selector.specificity,
        stripped: true,
    })
}

/// Removes every pseudo-class and pseudo-element from a selector,
/// substituting `*` where that would leave a compound selector empty.
fn strip_pseudos(selector: &str) -> String {
    let chars: Vec<char> = selector.chars().collect();
    let mut out = String::with_capacity(selector.len());
    let mut i = 0;
    let mut quote = None;
    let mut brackets = 0_usize;

    while i < chars.len() {
        let c = chars[i];

        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(&escaped) = chars.get(i + 1) {
                    out.push(escaped);
                    i += 1;
                }
            } else if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match c {
            '\\' => {
                out.push(c);
                if let Some(&escaped) = chars.get(i + 1) {
                    out.push(escaped);
                    i += 1;
                }
            }
            '"' | '\'' => {
                quote = Some(c);
                out.push(c);
            }
            '[' => {
                brackets += 1;
                out.push(c);
            }
            ']' => {
                brackets = brackets.saturating_sub(1);
                out.push(c);
            }
            ':' if brackets == 0 => {
                i = skip_pseudo(&chars, i);
                let compound_empty = out.chars().last().is_none_or(is_combinator_boundary);
                let next_starts_compound = chars.get(i).is_none_or(|&next| is_combinator_boundary(next));
                if compound_empty && next_starts_compound {
                    out.push('*');
                }
                continue;
            }
            _ => out.push(c),
        }
        i += 1;
    }

    out
}

/// Returns the index just past the pseudo-class or pseudo-element starting at `start`.
fn skip_pseudo(chars: &[char], start: usize) -> usize {
    let mut i = start + 1;
    if chars.get(i) == Some(&':') {
        i += 1;
    }
    while chars
        .get(i)
        .is_some_and(|c| c.is_alphanumeric() || matches!(c, '-' | '_'))
    {
        i += 1;
    }

    if chars.get(i) == Some(&'(') {
        let mut depth = 0_usize;
        while let Some(&c) = chars.get(i) {
            i += 1;
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    i
}

fn is_combinator_boundary(c: char) -> bool {
    c.is_whitespace() || matches!(c, '>' | '+' | '~' | ',' | '(')
}
