// Which languages the API accepts, read from languages.json.
// Workers own the toolchain details; the API only needs the language tags.

use anyhow::{bail, Context, Result};
use sentinel_common::types::Language;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct LanguageEntry {
    language: Language,
}

#[derive(Debug, Deserialize)]
struct LanguagesFile {
    languages: Vec<LanguageEntry>,
}

/// Registry of configured languages
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    enabled_languages: HashSet<Language>,
}

impl LanguageRegistry {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: LanguagesFile = serde_json::from_str(content).context("Failed to parse languages.json")?;

        let enabled_languages: HashSet<Language> = config.languages.iter().map(|l| l.language).collect();
        if enabled_languages.is_empty() {
            bail!("No languages configured in languages.json");
        }
        Ok(Self { enabled_languages })
    }

    pub fn is_enabled(&self, language: Language) -> bool {
        self.enabled_languages.contains(&language)
    }

    pub fn enabled_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.enabled_languages.iter().copied().collect();
        languages.sort_by_key(|l| l.as_str());
        languages
    }
}
