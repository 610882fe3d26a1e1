//! Include/exclude filtering of index paths by base name

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::errors::Result;
use crate::paths::base_name;

/// Filtering rules for the index maintainer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintainerConfig {
    /// Glob patterns for the base name. A name is included when it matches
    /// at least one of them (not all); an empty list includes everything.
    #[serde(default)]
    pub includes: Vec<String>,
    /// Glob patterns that reject a base name
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl Default for MaintainerConfig {
    fn default() -> Self {
        Self {
            includes: Vec::new(),
            excludes: vec![
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                "*.tmp".to_string(),
                "*.swp".to_string(),
                "*~".to_string(),
                ".#*".to_string(),
            ],
        }
    }
}

/// Compiled include/exclude predicate
#[derive(Debug, Clone)]
pub struct PathFilter {
    includes: Option<GlobSet>,
    excludes: GlobSet,
}

impl PathFilter {
    pub fn new(config: &MaintainerConfig) -> Result<Self> {
        let includes = if config.includes.is_empty() {
            None
        } else {
            Some(build_set(&config.includes)?)
        };

        Ok(Self {
            includes,
            excludes: build_set(&config.excludes)?,
        })
    }

    /// Filter that accepts every path
    pub fn allow_all() -> Self {
        Self {
            includes: None,
            excludes: GlobSet::empty(),
        }
    }

    /// Whether the entity at `relative` should be indexed
    pub fn included(&self, relative: &str) -> bool {
        let name = base_name(relative);

        if let Some(includes) = &self.includes {
            if !includes.is_match(name) {
                trace!("Not included: {}", relative);
                return false;
            }
        }

        if self.excludes.is_match(name) {
            trace!("Excluded: {}", relative);
            return false;
        }

        true
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
