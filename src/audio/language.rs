//! Transcription languages.
//!
//! The service recognizes a fixed set of language codes. Configuration may enable
//! a subset of them; sessions may only switch between enabled languages.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A language preference. `Auto` lets the engine detect the spoken language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Auto,
    /// English
    En,
    /// Yoruba
    Yo,
    /// Igbo
    Ig,
    /// Hausa
    Ha,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Auto,
        Language::En,
        Language::Yo,
        Language::Ig,
        Language::Ha,
    ];

    /// Wire code, e.g. `"yo"`.
    pub fn code(&self) -> &'static str {
        match self {
            Language::Auto => "auto",
            Language::En => "en",
            Language::Yo => "yo",
            Language::Ig => "ig",
            Language::Ha => "ha",
        }
    }

    /// Hint handed to the engine; `None` asks it to detect the language.
    pub fn engine_hint(&self) -> Option<&'static str> {
        match self {
            Language::Auto => None,
            other => Some(other.code()),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.code() == wanted)
            .ok_or_else(|| SessionError::UnsupportedLanguage(s.to_string()))
    }
}

/// The languages enabled for this deployment plus the default for new sessions.
#[derive(Debug, Clone)]
pub struct LanguageSet {
    enabled: Vec<Language>,
    default: Language,
}

impl LanguageSet {
    /// Build a set from configured codes.
    ///
    /// Fails on unknown codes, an empty list, or a default that is not enabled.
    pub fn from_codes(codes: &[String], default: &str) -> anyhow::Result<Self> {
        let mut enabled = Vec::with_capacity(codes.len());
        for code in codes {
            let lang: Language = code
                .parse()
                .map_err(|_| anyhow::anyhow!("Unknown language code in configuration: {}", code))?;
            if !enabled.contains(&lang) {
                enabled.push(lang);
            }
        }

        if enabled.is_empty() {
            return Err(anyhow::anyhow!("At least one language must be enabled"));
        }

        let default: Language = default
            .parse()
            .map_err(|_| anyhow::anyhow!("Unknown default language: {}", default))?;
        if !enabled.contains(&default) {
            return Err(anyhow::anyhow!(
                "Default language '{}' is not in the supported list",
                default
            ));
        }

        Ok(Self { enabled, default })
    }

    /// Parse a client-supplied code against the enabled set.
    pub fn parse(&self, raw: &str) -> Result<Language, SessionError> {
        let lang: Language = raw.parse()?;
        if self.enabled.contains(&lang) {
            Ok(lang)
        } else {
            Err(SessionError::UnsupportedLanguage(raw.to_string()))
        }
    }

    pub fn default_language(&self) -> Language {
        self.default
    }

    pub fn codes(&self) -> Vec<&'static str> {
        self.enabled.iter().map(Language::code).collect()
    }
}

impl Default for LanguageSet {
    fn default() -> Self {
        Self {
            enabled: Language::ALL.to_vec(),
            default: Language::Auto,
        }
    }
}
