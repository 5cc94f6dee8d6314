//! Migration units.
//!
//! A unit is the smallest thing the executor applies or rolls back: a
//! version, a descriptive name, and its up and down statements.

use std::cmp::Ordering;

use crate::error::{MigrateError, Result};
use crate::planner::{MigrationPlan, MANUAL_PREFIX};

/// A versioned pair of forward and inverse statement lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    version: String,
    name: String,
    up: Vec<String>,
    down: Vec<String>,
}

impl MigrationUnit {
    /// Creates a unit, validating its version and name.
    ///
    /// The version must be non-empty ASCII alphanumerics (timestamps such as
    /// `20240101120000` sort correctly as strings); the name must be
    /// non-empty.
    pub fn new(
        version: impl Into<String>,
        name: impl Into<String>,
        up: Vec<String>,
        down: Vec<String>,
    ) -> Result<Self> {
        let version = version.into();
        let name = name.into();

        if version.is_empty() || !version.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(MigrateError::InvalidUnit(format!(
                "version '{}' must be non-empty ASCII alphanumerics",
                version
            )));
        }
        if name.trim().is_empty() {
            return Err(MigrateError::InvalidUnit(format!(
                "migration {} has an empty name",
                version
            )));
        }

        Ok(Self {
            version,
            name,
            up,
            down,
        })
    }

    /// Creates a unit from a generated plan.
    pub fn from_plan(
        version: impl Into<String>,
        name: impl Into<String>,
        plan: &MigrationPlan,
    ) -> Result<Self> {
        Self::new(version, name, plan.up.clone(), plan.down.clone())
    }

    /// Returns the version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the forward statements.
    #[must_use]
    pub fn up(&self) -> &[String] {
        &self.up
    }

    /// Returns the inverse statements.
    #[must_use]
    pub fn down(&self) -> &[String] {
        &self.down
    }

    /// Returns `<version>_<name>`.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}_{}", self.version, self.name)
    }
}

impl PartialOrd for MigrationUnit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MigrationUnit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// Returns true if `statement` contains nothing but `--` and `/* */`
/// comments and whitespace.
#[must_use]
pub fn is_comment_only(statement: &str) -> bool {
    let mut rest = statement.trim_start();
    while !rest.is_empty() {
        if rest.starts_with("--") {
            rest = rest.find('\n').map_or("", |n| &rest[n + 1..]);
        } else if let Some(body) = rest.strip_prefix("/*") {
            rest = body.find("*/").map_or("", |n| &body[n + 2..]);
        } else {
            return false;
        }
        rest = rest.trim_start();
    }
    true
}

/// Returns true if `statement` is a comment block holding a `-- MANUAL:`
/// placeholder, i.e. a step the planner could not generate.
#[must_use]
pub fn is_manual_placeholder(statement: &str) -> bool {
    is_comment_only(statement)
        && statement
            .lines()
            .any(|line| line.trim_start().starts_with(MANUAL_PREFIX))
}
