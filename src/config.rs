use std::env;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Prefixes the compiler uses for the variables it generates. A placeholder
/// equal to one of these would be indistinguishable from generated names.
pub(crate) const RESERVED_PREFIXES: &[&str] = &["stage", "join", "local", "count", "unwind", "row"];

/// Knobs for the pipeline compiler.
///
/// Every field has a default, so a partial config (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// Token that raw expression fragments use for "the current document".
    pub placeholder: String,
    /// `$sample.chance` used when a stage omits it.
    pub sample_chance: f64,
    /// Exclusive upper bound for the random `$sample.skip` used when a stage
    /// omits it.
    pub sample_skip_bound: u64,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            placeholder: "doc".to_string(),
            sample_chance: 0.5,
            sample_skip_bound: 100,
        }
    }
}

impl CompilerOptions {
    /// Build options from `AQLPIPE_*` environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut opts = Self::default();

        if let Ok(placeholder) = env::var("AQLPIPE_PLACEHOLDER") {
            opts.placeholder = placeholder;
        }
        if let Ok(chance) = env::var("AQLPIPE_SAMPLE_CHANCE") {
            opts.sample_chance = chance.parse().map_err(|_| {
                Error::InvalidConfig(format!("AQLPIPE_SAMPLE_CHANCE is not a number: {chance}"))
            })?;
        }
        if let Ok(bound) = env::var("AQLPIPE_SAMPLE_SKIP_BOUND") {
            opts.sample_skip_bound = bound.parse().map_err(|_| {
                Error::InvalidConfig(format!(
                    "AQLPIPE_SAMPLE_SKIP_BOUND is not an integer: {bound}"
                ))
            })?;
        }

        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.placeholder;
        let mut chars = p.chars();
        let starts_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !starts_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::InvalidConfig(format!(
                "placeholder must be an identifier: {p:?}"
            )));
        }
        if RESERVED_PREFIXES.contains(&p.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "placeholder collides with a generated name: {p}"
            )));
        }
        if !(0.0..=1.0).contains(&self.sample_chance) {
            return Err(Error::InvalidConfig(format!(
                "sample_chance must be within [0, 1], got {}",
                self.sample_chance
            )));
        }
        if self.sample_skip_bound == 0 {
            return Err(Error::InvalidConfig(
                "sample_skip_bound must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
