//! An optional on-disk configuration file supplying defaults that CLI
//! flags always override. Absence of the file is not an error;
//! malformed contents are.

use std::{fs, io};

use anyhow::{Context, Result, anyhow};
use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::similarity;

fn default_threads() -> usize {
    num_cpus::get()
}

fn default_cache_file() -> String {
    ".albumarchitect.cache".to_string()
}

fn default_similarity_threshold() -> f64 {
    similarity::DEFAULT_THRESHOLD
}

#[derive(Debug, Deserialize)]
pub struct Configuration {
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_cache_file")]
    pub default_cache_file: String,
    #[serde(default = "default_similarity_threshold")]
    pub default_similarity_threshold: f64,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            threads: default_threads(),
            default_cache_file: default_cache_file(),
            default_similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// Loads `~/.config/albumgraph.toml`. A missing file yields
/// [`Configuration::default`]; a present-but-malformed file is an
/// error so a typo doesn't silently fall back to defaults.
pub fn load() -> Result<Configuration> {
    let mut path: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("can't find home directory"))?
        .try_into()
        .context("home directory isn't UTF-8")?;
    path.extend([".config", "albumgraph.toml"]);

    let text = match fs::read_to_string(&path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found.with_context(|| format!("couldn't open {path}"))?,
    };

    toml::from_str(&text).with_context(|| format!("couldn't parse {path}"))
}
