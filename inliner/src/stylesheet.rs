//! Code for parsing CSS into an owned rule tree and printing it back out minified.

use crate::{Error, Result};
use camino::Utf8PathBuf;
use lightningcss::{
    error::PrinterError,
    printer::PrinterOptions,
    properties::Property,
    rules::{CssRule, CssRuleList},
    stylesheet::{ParserFlags, ParserOptions, StyleSheet},
    traits::ToCss,
};
use std::fmt::{self, Display, Formatter};

/// A parsed stylesheet. Rules keep their source order.
#[derive(Debug)]
pub struct Stylesheet {
    origin: Origin,
    rules: Vec<Rule>,
}

/// Where a stylesheet's text came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    Inline,
    File(Utf8PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rule {
    Style(StyleRule),
    /// `@media` or `@supports`; the condition is kept but never evaluated
    Conditional(ConditionalRule),
    /// Any other at-rule, already serialized
    Verbatim(VerbatimRule),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StyleRule {
    pub selectors: Vec<Selector>,
    pub declarations: Vec<Declaration>,
    /// Position of the rule in the stylesheet, counting nested rules
    pub order: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    pub text: Box<str>,
    pub specificity: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Declaration {
    pub property: Box<str>,
    pub value: Box<str>,
    pub important: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionKind {
    Media,
    Supports,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionalRule {
    pub kind: ConditionKind,
    pub condition: Box<str>,
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerbatimRule {
    pub css: Box<str>,
    pub order: usize,
}

impl Stylesheet {
    /// Parses the input string as CSS.
    ///
    /// # Errors
    /// This function returns [`Error::ParseFailure`] if the input string cannot be parsed as CSS
    /// or a parsed rule cannot be serialized again.
    pub fn parse(source: &str, origin: Origin) -> Result<Self> {
        let stylesheet = StyleSheet::parse(
            source,
            ParserOptions {
                filename: origin.to_string(),
                css_modules: None,
                source_index: Default::default(),
                // The CSS parser should error instead of reporting success while emitting warnings
                error_recovery: false,
                warnings: None,
                flags: ParserFlags::empty(),
            },
        )
        .map_err(|err| Error::ParseFailure {
            origin: origin.to_string(),
            message: err.to_string(),
        })?;

        let mut order = 0;
        let rules = convert_rules(&stylesheet.rules, &mut order).map_err(|err| Error::ParseFailure {
            origin: origin.to_string(),
            message: err.to_string(),
        })?;

        Ok(Self { origin, rules })
    }

    #[must_use]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Serializes the whole stylesheet as minified CSS.
    #[must_use]
    pub fn to_css(&self) -> String {
        rules_to_css(&self.rules)
    }
}

/// Serializes rules as minified CSS.
#[must_use]
pub fn rules_to_css(rules: &[Rule]) -> String {
    let mut css = String::new();
    for rule in rules {
        rule.write_css(&mut css);
    }
    css
}

impl Rule {
    /// Whether this is an `@import` rule, which only takes effect before every other rule.
    #[must_use]
    pub fn is_import(&self) -> bool {
        matches!(self, Self::Verbatim(rule) if rule.css.starts_with("@import"))
    }

    fn write_css(&self, out: &mut String) {
        match self {
            Self::Style(rule) => rule.write_css(out),
            Self::Conditional(rule) => rule.write_css(out),
            Self::Verbatim(rule) => out.push_str(&rule.css),
        }
    }
}

impl StyleRule {
    fn selector_text(&self) -> String {
        self.selectors
            .iter()
            .map(|selector| &*selector.text)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn write_css(&self, out: &mut String) {
        out.push_str(&self.selector_text());
        out.push('{');
        for (i, declaration) in self.declarations.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            out.push_str(&declaration.to_string());
        }
        out.push('}');
    }
}

impl ConditionalRule {
    fn write_css(&self, out: &mut String) {
        out.push_str(match self.kind {
            ConditionKind::Media => "@media ",
            ConditionKind::Supports => "@supports ",
        });
        out.push_str(&self.condition);
        out.push('{');
        for rule in &self.rules {
            rule.write_css(out);
        }
        out.push('}');
    }
}

impl Display for Declaration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.property, self.value)?;
        if self.important {
            f.write_str("!important")?;
        }
        Ok(())
    }
}

impl Display for Origin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => f.write_str("inline stylesheet"),
            Self::File(path) => write!(f, "{path}"),
        }
    }
}

fn minified() -> PrinterOptions<'static> {
    PrinterOptions {
        minify: true,
        ..Default::default()
    }
}

fn convert_rules(list: &CssRuleList<'_>, order: &mut usize) -> Result<Vec<Rule>, PrinterError> {
    let mut rules = Vec::with_capacity(list.0.len());

    for rule in &list.0 {
        match rule {
            CssRule::Style(style) => {
                let selectors = style
                    .selectors
                    .0
                    .iter()
                    .map(|selector| {
                        Ok(Selector {
                            text: selector.to_css_string(minified())?.into(),
                            specificity: selector.specificity(),
                        })
                    })
                    .collect::<Result<_, PrinterError>>()?;

                let block = &style.declarations;
                let declarations = block
                    .declarations
                    .iter()
                    .map(|property| convert_declaration(property, false))
                    .chain(
                        block
                            .important_declarations
                            .iter()
                            .map(|property| convert_declaration(property, true)),
                    )
                    .collect::<Result<_, PrinterError>>()?;

                rules.push(Rule::Style(StyleRule {
                    selectors,
                    declarations,
                    order: next(order),
                }));
            }
            CssRule::Media(media) => rules.push(Rule::Conditional(ConditionalRule {
                kind: ConditionKind::Media,
                condition: media.query.to_css_string(minified())?.into(),
                rules: convert_rules(&media.rules, order)?,
            })),
            CssRule::Supports(supports) => rules.push(Rule::Conditional(ConditionalRule {
                kind: ConditionKind::Supports,
                condition: supports.condition.to_css_string(minified())?.into(),
                rules: convert_rules(&supports.rules, order)?,
            })),
            CssRule::Ignored => {}
            other => rules.push(Rule::Verbatim(VerbatimRule {
                css: other.to_css_string(minified())?.into(),
                order: next(order),
            })),
        }
    }

    Ok(rules)
}

fn convert_declaration(property: &Property<'_>, important: bool) -> Result<Declaration, PrinterError> {
    let css = property.to_css_string(false, minified())?;
    let (name, value) = css.split_once(':').unwrap_or((&css, ""));

    Ok(Declaration {
        property: name.trim().into(),
        value: value.trim().into(),
        important,
    })
}

fn next(order: &mut usize) -> usize {
    let current = *order;
    *order += 1;
    current
}
