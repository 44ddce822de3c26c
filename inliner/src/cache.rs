//! Code for compiling stylesheets at most once per input.
//!
//! Each key maps to a cell that is registered before any work starts.
//! Concurrent callers for the same key wait on that cell instead of starting their own parse,
//! and every caller receives the same `Arc`.

use crate::{
    stylesheet::{Origin, Stylesheet},
    Error, Result,
};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use foldhash::{HashMap, HashMapExt};
use log::debug;
use std::{
    borrow::Borrow,
    hash::Hash,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::{fs::read_to_string, sync::OnceCell};

type Slot = Arc<OnceCell<Arc<Stylesheet>>>;

pub struct StylesheetCache {
    directory: Utf8PathBuf,
    sources: Mutex<HashMap<Arc<str>, Slot>>,
    files: Mutex<HashMap<Utf8PathBuf, Slot>>,
    compilations: AtomicUsize,
}

impl StylesheetCache {
    /// Creates an empty cache. Relative paths given to [`StylesheetCache::load`] resolve against `directory`.
    pub fn new(directory: impl Into<Utf8PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            sources: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            compilations: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }

    /// Parses CSS text, reusing the result of any earlier or in-flight compile of identical text.
    ///
    /// # Errors
    /// This function returns [`Error::ParseFailure`] if the text is not valid CSS.
    /// Failures are not cached; a later call parses again.
    pub async fn compile(&self, css: &str) -> Result<Arc<Stylesheet>> {
        let slot = slot_for(&self.sources, css, || Arc::from(css));

        slot.get_or_try_init(|| async { self.parse(css, Origin::Inline) })
            .await
            .map(Arc::clone)
    }

    /// Reads and parses a stylesheet file. Results are keyed by resolved path,
    /// so a path that was loaded before is not read again.
    ///
    /// # Errors
    /// This function returns an error if:
    /// - the file cannot be read ([`Error::NotFound`])
    /// - the file contents are not valid CSS ([`Error::ParseFailure`])
    pub async fn load(&self, path: impl AsRef<Utf8Path>) -> Result<Arc<Stylesheet>> {
        let path = normalize(&self.directory.join(path));
        let slot = slot_for(&self.files, path.as_path(), || path.clone());

        slot.get_or_try_init(|| async {
            let source = read_to_string(&path)
                .await
                .map_err(|source| Error::NotFound {
                    path: path.clone(),
                    source,
                })?;
            self.parse(&source, Origin::File(path.clone()))
        })
        .await
        .map(Arc::clone)
    }

    /// Returns how many times CSS has actually been parsed by this cache.
    #[must_use]
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    fn parse(&self, source: &str, origin: Origin) -> Result<Arc<Stylesheet>> {
        self.compilations.fetch_add(1, Ordering::Relaxed);
        debug!("compiling {origin}");
        Stylesheet::parse(source, origin).map(Arc::new)
    }
}

/// Returns the slot for `key`, registering a new empty one if needed.
/// The lock is released before the caller awaits anything.
fn slot_for<K, Q>(map: &Mutex<HashMap<K, Slot>>, key: &Q, to_owned: impl FnOnce() -> K) -> Slot
where
    K: Borrow<Q> + Eq + Hash,
    Q: Eq + Hash + ?Sized,
{
    let mut map = map.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(slot) = map.get(key) {
        if slot.initialized() {
            debug!("stylesheet cache hit");
        }
        return Arc::clone(slot);
    }

    let slot = Slot::default();
    map.insert(to_owned(), Arc::clone(&slot));
    slot
}

/// Removes `.` components and resolves `..` lexically so equivalent spellings share a key.
fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut normalized = Utf8PathBuf::new();

    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            _ => normalized.push(component),
        }
    }

    normalized
}

#[cfg(test)]
mod test {
    use super::{normalize, StylesheetCache};
    use crate::{
        stylesheet::{Origin, Rule},
        Error,
    };
    use camino::Utf8Path;
    use std::sync::Arc;

    const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures");

    #[tokio::test]
    async fn compile_once() {
        let cache = StylesheetCache::new(FIXTURES);
        let css = "body { color: red }";

        let first = cache.compile(css).await.expect("compiling should succeed");

        let Rule::Style(body) = &first.rules()[0] else {
            panic!("first rule should be a style rule");
        };
        assert_eq!(&*body.selectors[0].text, "body");
        assert_eq!(&*body.declarations[0].property, "color");
        assert_eq!(&*body.declarations[0].value, "red");

        let second = cache.compile(css).await.expect("compiling should succeed");
        assert!(Arc::ptr_eq(&first, &second), "cached result should be reused");
        assert_eq!(cache.compilations(), 1);
    }

    #[tokio::test]
    async fn concurrent_compiles() {
        let cache = StylesheetCache::new(FIXTURES);
        let css = "h1 { margin: 0 }";

        let (first, second) = tokio::join!(cache.compile(css), cache.compile(css));
        let (first, second) = (
            first.expect("compiling should succeed"),
            second.expect("compiling should succeed"),
        );

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.compilations(), 1);
    }

    #[tokio::test]
    async fn distinct_text_compiles_separately() {
        let cache = StylesheetCache::new(FIXTURES);

        let first = cache.compile("a { margin: 0 }").await.expect("compiling should succeed");
        let second = cache.compile("b { margin: 0 }").await.expect("compiling should succeed");

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.compilations(), 2);
    }

    #[tokio::test]
    async fn load_once() {
        let cache = StylesheetCache::new(FIXTURES);

        let first = cache.load("cache.css").await.expect("loading should succeed");
        assert_eq!(
            first.origin(),
            &Origin::File(Utf8Path::new(FIXTURES).join("cache.css"))
        );

        let Rule::Style(body) = &first.rules()[0] else {
            panic!("first rule should be a style rule");
        };
        assert_eq!(&*body.selectors[0].text, "body");
        assert_eq!(&*body.declarations[0].property, "margin");

        let second = cache.load("cache.css").await.expect("loading should succeed");
        assert!(Arc::ptr_eq(&first, &second), "cached result should be reused");
        assert_eq!(cache.compilations(), 1);
    }

    #[tokio::test]
    async fn concurrent_loads() {
        let cache = StylesheetCache::new(FIXTURES);

        let (first, second) = tokio::join!(cache.load("cache.css"), cache.load("./cache.css"));
        let (first, second) = (
            first.expect("loading should succeed"),
            second.expect("loading should succeed"),
        );

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.compilations(), 1, "the file should be read and parsed once");
    }

    #[tokio::test]
    async fn load_is_keyed_by_path() {
        let cache = StylesheetCache::new(FIXTURES);

        let loaded = cache.load("cache.css").await.expect("loading should succeed");
        let source = std::fs::read_to_string(Utf8Path::new(FIXTURES).join("cache.css"))
            .expect("fixture should be readable");
        let compiled = cache.compile(&source).await.expect("compiling should succeed");

        assert!(!Arc::ptr_eq(&loaded, &compiled));
    }

    #[tokio::test]
    async fn missing_file() {
        let cache = StylesheetCache::new(FIXTURES);

        let err = cache
            .load("missing.css")
            .await
            .expect_err("loading a missing file should fail");
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(cache.compilations(), 0);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = StylesheetCache::new(FIXTURES);

        assert!(cache.compile("$$$ { color: red }").await.is_err());
        assert!(cache.compile("$$$ { color: red }").await.is_err());
        assert_eq!(cache.compilations(), 2);
    }

    #[tokio::test]
    async fn caches_are_isolated() {
        let first_cache = StylesheetCache::new(FIXTURES);
        let second_cache = StylesheetCache::new(FIXTURES);
        let css = "p { margin: 0 }";

        let first = first_cache.compile(css).await.expect("compiling should succeed");
        let second = second_cache.compile(css).await.expect("compiling should succeed");

        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn path_normalization() {
        assert_eq!(normalize(Utf8Path::new("/a/./b/../c.css")), "/a/c.css");
        assert_eq!(normalize(Utf8Path::new("a/../../c.css")), "../c.css");
    }
}
