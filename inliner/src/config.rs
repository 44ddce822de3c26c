//! Code for reading app configuration from a TOML file. The configuration file path is supplied via the command line.

use crate::{Options, Template};
use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use same_file::is_same_file;
use serde::Deserialize;
use std::{env::args, fs::read_to_string};
use toml_edit::de::from_str as toml_from_str;

#[derive(Debug, Deserialize)]
pub struct Config {
    // Path to the HTML file to rewrite
    pub input: Utf8PathBuf,
    // Path to write the rewritten HTML to
    pub output: Utf8PathBuf,
    pub mode: Mode,
    // Base directory for local stylesheet links; defaults to the input file's directory
    pub directory: Option<Utf8PathBuf>,
    // Template dialect whose tags are protected during rewriting
    pub template: Option<Template>,
    // Selector for the above-the-fold container in critical mode
    pub critical_selector: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Move matching rules into `style` attributes
    Inline,
    /// Keep only the rules needed by critical elements
    Critical,
}

impl Config {
    /// Reads a config file from a path provided by command-line arguments.
    ///
    /// # Errors
    /// This function returns an error if:
    /// - not enough command-line arguments are provided
    /// - too many command-line arguments are provided
    /// - the config file cannot be read or parsed
    /// - `input` does not point to a file
    /// - `directory` does not point to a directory
    /// - `input` and `output` point to the same file
    pub fn from_env() -> Result<Self> {
        let mut args = args().skip(1);

        let config_path = args
            .next()
            .ok_or_else(|| anyhow!("configuration file path was not provided"))?;

        if args.next().is_some() {
            return Err(anyhow!("too many input arguments were provided"));
        }

        Self::from_toml(
            &read_to_string(&config_path)
                .with_context(|| format!("failed to read configuration from {config_path}"))?,
        )
    }

    /// Parses and validates configuration text.
    ///
    /// # Errors
    /// This function returns an error if the text is not a valid configuration
    /// or a configured path does not check out (see [`Config::from_env`]).
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml_from_str(text).context("failed to parse configuration file")?;

        config
            .check_paths()
            .context("configuration file is invalid")?;

        Ok(config)
    }

    /// Returns the library options described by this configuration.
    #[must_use]
    pub fn options(&self) -> Options {
        Options {
            directory: self.directory().to_owned(),
            template: self.template,
            critical_selector: self.critical_selector.clone(),
        }
    }

    fn directory(&self) -> &Utf8Path {
        self.directory
            .as_deref()
            .or_else(|| self.input.parent())
            .filter(|dir| !dir.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."))
    }

    fn check_paths(&self) -> Result<()> {
        if !self.input.is_file() {
            Err(anyhow!("`input`: {:?} does not point to a file", self.input))
        } else if !self.directory().is_dir() {
            Err(anyhow!(
                "`directory`: {:?} does not point to a directory",
                self.directory()
            ))
        } else if self.output.exists()
            && is_same_file(&self.input, &self.output)
                .context("failed to compare `input` and `output`")?
        {
            Err(anyhow!("`input` and `output` point to the same file"))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Config, Mode};
    use crate::Template;

    const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures");

    #[test]
    fn minimal_config() {
        let config = Config::from_toml(&format!(
            "input = \"{FIXTURES}/critical.html\"\noutput = \"{FIXTURES}/../target/critical.html\"\nmode = \"critical\"\n"
        ))
        .expect("parsing should succeed");

        assert_eq!(config.mode, Mode::Critical);

        let options = config.options();
        assert_eq!(options.directory, FIXTURES);
        assert_eq!(options.template, None);
        assert_eq!(options.critical_selector, None);
    }

    #[test]
    fn full_config() {
        let config = Config::from_toml(&format!(
            r#"
input = "{FIXTURES}/critical.html"
output = "out.html"
mode = "inline"
directory = "{FIXTURES}"
template = "handlebars"
critical_selector = "main"
"#
        ))
        .expect("parsing should succeed");

        assert_eq!(config.mode, Mode::Inline);

        let options = config.options();
        assert_eq!(options.template, Some(Template::Handlebars));
        assert_eq!(options.critical_selector.as_deref(), Some("main"));
    }

    #[test]
    fn input_must_be_a_file() {
        let err = Config::from_toml(&format!(
            "input = \"{FIXTURES}\"\noutput = \"out.html\"\nmode = \"inline\"\n"
        ))
        .expect_err("a directory input should be rejected");

        assert!(format!("{err:#}").contains("does not point to a file"));
    }

    #[test]
    fn output_must_differ_from_input() {
        let err = Config::from_toml(&format!(
            "input = \"{FIXTURES}/critical.html\"\noutput = \"{FIXTURES}/./critical.html\"\nmode = \"inline\"\n"
        ))
        .expect_err("overwriting the input should be rejected");

        assert!(format!("{err:#}").contains("same file"));
    }

    #[test]
    fn unknown_mode() {
        assert!(Config::from_toml(&format!(
            "input = \"{FIXTURES}/critical.html\"\noutput = \"out.html\"\nmode = \"fast\"\n"
        ))
        .is_err());
    }
}
