use anyhow::{Context, Result};
use inliner::{Config, Inliner, Mode};
use log::info;
use std::fs::{read_to_string, write};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    // Read configuration
    let config = Config::from_env().context("failed to read configuration file")?;

    // Get input HTML text
    let html = read_to_string(&config.input)
        .with_context(|| format!("failed to read HTML from {}", config.input))?;

    let inliner = Inliner::new(config.options());

    let output = match config.mode {
        Mode::Inline => inliner
            .inline_css(&html)
            .await
            .context("failed to inline CSS")?,
        Mode::Critical => inliner
            .critical_path(&html)
            .await
            .context("failed to extract critical-path CSS")?,
    };

    info!(
        "compiled {} stylesheet(s) for {}",
        inliner.cache().compilations(),
        config.input
    );

    write(&config.output, output)
        .with_context(|| format!("failed to write HTML to {}", config.output))?;

    Ok(())
}
