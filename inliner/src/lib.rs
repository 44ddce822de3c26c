mod cache;
mod config;
mod document;
mod error;
mod handlebars;
mod select;
mod shield;
mod stylesheet;

pub use cache::StylesheetCache;
pub use config::{Config, Mode};
pub use document::{apply_critical, Document};
pub use error::{Error, Result};
pub use select::{critical_region, inline_all, select_critical, CriticalRuleSet};
pub use shield::{extract_tags, handlebars, restore, shield, Tag, TagKind, TagList, Template};
pub use stylesheet::{
    rules_to_css, ConditionKind, ConditionalRule, Declaration, Origin, Rule, Selector, StyleRule, Stylesheet,
    VerbatimRule,
};

use camino::Utf8PathBuf;
use document::StyleSource;
use shield::shield_reserving;
use log::debug;
use std::sync::Arc;

/// Settings shared by every document an [`Inliner`] processes.
#[derive(Clone, Debug)]
pub struct Options {
    /// Base directory for local `<link rel="stylesheet">` hrefs
    pub directory: Utf8PathBuf,
    /// Template dialect to shield from HTML and CSS processing, if any
    pub template: Option<Template>,
    /// Limits critical-path extraction to matching elements, their descendants and their ancestors
    pub critical_selector: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            directory: Utf8PathBuf::from("."),
            template: None,
            critical_selector: None,
        }
    }
}

/// Rewrites HTML documents using the stylesheets they embed or link to.
/// Compiled stylesheets are shared by every call on the same instance.
pub struct Inliner {
    options: Options,
    cache: StylesheetCache,
}

impl Inliner {
    #[must_use]
    pub fn new(options: Options) -> Self {
        let cache = StylesheetCache::new(options.directory.clone());
        Self { options, cache }
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[must_use]
    pub fn cache(&self) -> &StylesheetCache {
        &self.cache
    }

    /// Moves every rule that applies to an element into that element's `style` attribute.
    /// `<style>` elements and HTML comments are removed;
    /// rules that cannot be inlined are kept in one `<style>` element.
    ///
    /// # Errors
    /// This function returns an error if a stylesheet cannot be loaded or parsed.
    /// Nothing is rewritten in that case.
    pub async fn inline_css(&self, html: &str) -> Result<String> {
        let (shielded, tags) = self.shield(html);
        let stylesheets = self.stylesheets(&shielded).await?;

        let mut document = Document::parse(&shielded);
        document.remove_comments();
        document.remove_style_elements();

        let preserved = inline_all(stylesheets.iter().map(Arc::as_ref), &mut document);
        if !preserved.is_empty() {
            document.insert_style(&rules_to_css(&preserved));
        }

        Ok(restore(&document.serialize(), &tags))
    }

    /// Replaces the document's `<style>` elements with one holding only the rules
    /// that apply to critical elements. `<link>` elements are left in place.
    ///
    /// # Errors
    /// This function returns an error if:
    /// - a stylesheet cannot be loaded or parsed
    /// - the configured critical selector is invalid ([`Error::InvalidSelector`])
    pub async fn critical_path(&self, html: &str) -> Result<String> {
        let (shielded, tags) = self.shield(html);
        let stylesheets = self.stylesheets(&shielded).await?;

        let mut document = Document::parse(&shielded);

        let region = self
            .options
            .critical_selector
            .as_deref()
            .map(|selector| critical_region(&document, selector))
            .transpose()?;

        let mut critical = CriticalRuleSet::default();
        for stylesheet in &stylesheets {
            critical.extend(select_critical(stylesheet, &document, |el| {
                region.as_ref().is_none_or(|region| region.contains(&el.id()))
            }));
        }

        apply_critical(&mut document, &critical);

        Ok(restore(&document.serialize(), &tags))
    }

    fn shield(&self, html: &str) -> (String, TagList) {
        let Some(template) = self.options.template else {
            return shield_nothing(html);
        };

        // Character references are decoded by parsing, so placeholders must not occur there either
        let decoded = Document::parse(html).serialize();
        shield_reserving(html, template, &[&decoded])
    }

    /// Compiles or loads every stylesheet the document refers to, in document order.
    async fn stylesheets(&self, html: &str) -> Result<Vec<Arc<Stylesheet>>> {
        // The parsed document is dropped before awaiting
        let sources = Document::parse(html).style_sources();
        debug!("found {} stylesheet(s)", sources.len());

        let mut stylesheets = Vec::with_capacity(sources.len());
        for source in sources {
            stylesheets.push(match source {
                StyleSource::Embedded(css) => self.cache.compile(&css).await?,
                StyleSource::Linked(path) => self.cache.load(&path).await?,
            });
        }

        Ok(stylesheets)
    }
}

fn shield_nothing(html: &str) -> (String, TagList) {
    (html.to_owned(), TagList::default())
}
