//! Error types surfaced by stylesheet loading and the rewriting pipeline.

use camino::Utf8PathBuf;
use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// A stylesheet file could not be read.
    #[error("failed to read stylesheet at {path}")]
    NotFound {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    /// `lightningcss` rejected the stylesheet.
    #[error("failed to parse {origin} as valid CSS: {message}")]
    ParseFailure { origin: String, message: String },

    /// A caller-supplied selector could not be parsed.
    #[error("invalid selector `{selector}`")]
    InvalidSelector { selector: String },
}
