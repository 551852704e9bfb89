//! Device-selection criteria for farm reservations.
//!
//! A [`FilterSpec`] is an ordered list of attribute/value pairs. Values are
//! either literals or regular expressions written between slashes
//! (`/^SM-G9.*$/`). Job variables are expanded into names and values before
//! validation; references that cannot be resolved stay as literal text so the
//! farm sees exactly what the user typed.

use std::collections::BTreeMap;
use std::env;

use regex::{Captures, Regex};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while validating a device filter.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FilterError {
    /// Raised when no attributes remain after variable substitution.
    #[error("device filter is empty; add at least one NAME=VALUE condition")]
    Empty,
    /// Raised when an attribute name or value is blank after substitution.
    #[error("device filter condition {position} has a blank {part}")]
    BlankAttribute {
        /// One-based position of the offending condition.
        position: usize,
        /// Which half of the condition was blank (`name` or `value`).
        part: &'static str,
    },
    /// Raised when a slash-delimited value is not a valid regular expression.
    #[error("invalid regular expression for {attribute}: {message}")]
    InvalidRegex {
        /// Attribute whose value failed to compile.
        attribute: String,
        /// Compiler error message.
        message: String,
    },
    /// Raised when a raw `NAME=VALUE` argument has no `=` separator.
    #[error("malformed device condition '{raw}'; expected NAME=VALUE")]
    Malformed {
        /// Argument as supplied by the user.
        raw: String,
    },
}

/// Expected value for a single attribute.
#[derive(Clone, Debug)]
pub enum FilterValue {
    /// Compared for exact equality.
    Literal(String),
    /// Matched against the whole attribute value.
    Pattern {
        /// Source text between the slashes.
        source: String,
        /// Anchored compiled expression.
        regex: Regex,
    },
}

impl FilterValue {
    fn parse(attribute: &str, value: &str) -> Result<Self, FilterError> {
        let Some(source) = regex_body(value) else {
            return Ok(Self::Literal(value.to_owned()));
        };
        let regex = Regex::new(&format!("^(?:{source})$")).map_err(|err| {
            FilterError::InvalidRegex {
                attribute: attribute.to_owned(),
                message: err.to_string(),
            }
        })?;
        Ok(Self::Pattern {
            source: source.to_owned(),
            regex,
        })
    }

    /// Returns `true` when `candidate` satisfies this value.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::Literal(expected) => expected == candidate,
            Self::Pattern { regex, .. } => regex.is_match(candidate),
        }
    }

    /// Renders the value the way the user wrote it.
    #[must_use]
    pub fn as_written(&self) -> String {
        match self {
            Self::Literal(text) => text.clone(),
            Self::Pattern { source, .. } => format!("/{source}/"),
        }
    }
}

impl PartialEq for FilterValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Literal(lhs), Self::Literal(rhs)) => lhs == rhs,
            (Self::Pattern { source: lhs, .. }, Self::Pattern { source: rhs, .. }) => lhs == rhs,
            _ => false,
        }
    }
}

/// A single `name = value` condition.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterCondition {
    /// Device attribute name, possibly a dotted path (`display.width`).
    pub attribute: String,
    /// Expected value.
    pub value: FilterValue,
}

/// Validated, variable-expanded device-selection criteria.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterSpec {
    conditions: Vec<FilterCondition>,
}

/// Variables available for substitution into filter conditions.
///
/// Build variables take precedence over environment variables.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobVariables {
    build: BTreeMap<String, String>,
    environment: BTreeMap<String, String>,
}

impl JobVariables {
    /// Creates an empty variable set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the current process environment as the environment layer.
    #[must_use]
    pub fn from_process_env() -> Self {
        Self {
            build: BTreeMap::new(),
            environment: env::vars().collect(),
        }
    }

    /// Adds or replaces a build variable.
    #[must_use]
    pub fn with_build_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build.insert(key.into(), value.into());
        self
    }

    /// Adds or replaces an environment variable.
    #[must_use]
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    fn lookup(&self, key: &str) -> Option<&str> {
        self.build
            .get(key)
            .or_else(|| self.environment.get(key))
            .map(String::as_str)
    }

    /// Replaces `$NAME` and `${NAME}` references with their values.
    ///
    /// Unresolved references are left untouched.
    #[must_use]
    pub fn expand(&self, text: &str) -> String {
        let Ok(reference) = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        else {
            return text.to_owned();
        };
        reference
            .replace_all(text, |caps: &Captures<'_>| {
                let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str());
                name.and_then(|key| self.lookup(key)).map_or_else(
                    || caps.get(0).map_or_else(String::new, |m| m.as_str().to_owned()),
                    str::to_owned,
                )
            })
            .into_owned()
    }
}

impl FilterSpec {
    /// Expands variables into `raw` and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Empty`] when no conditions are supplied,
    /// [`FilterError::BlankAttribute`] when a name or value is blank after
    /// expansion, and [`FilterError::InvalidRegex`] when a slash-delimited
    /// value does not compile.
    pub fn validate(raw: &[(String, String)], vars: &JobVariables) -> Result<Self, FilterError> {
        if raw.is_empty() {
            return Err(FilterError::Empty);
        }

        let mut conditions = Vec::with_capacity(raw.len());
        for (index, (name, value)) in raw.iter().enumerate() {
            let position = index + 1;
            let attribute = vars.expand(name).trim().to_owned();
            if attribute.is_empty() {
                return Err(FilterError::BlankAttribute {
                    position,
                    part: "name",
                });
            }
            let expanded = vars.expand(value).trim().to_owned();
            if expanded.is_empty() {
                return Err(FilterError::BlankAttribute {
                    position,
                    part: "value",
                });
            }
            let parsed = FilterValue::parse(&attribute, &expanded)?;
            conditions.push(FilterCondition {
                attribute,
                value: parsed,
            });
        }

        Ok(Self { conditions })
    }

    /// Parses `NAME=VALUE` arguments and validates them.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Malformed`] for arguments without `=`, and any
    /// error produced by [`FilterSpec::validate`].
    pub fn from_args(args: &[String], vars: &JobVariables) -> Result<Self, FilterError> {
        let pairs = args
            .iter()
            .map(|arg| {
                arg.split_once('=')
                    .map(|(name, value)| (name.to_owned(), value.to_owned()))
                    .ok_or_else(|| FilterError::Malformed { raw: arg.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::validate(&pairs, vars)
    }

    /// Returns the validated conditions in their original order.
    #[must_use]
    pub fn conditions(&self) -> &[FilterCondition] {
        &self.conditions
    }

    /// Returns `true` when every condition holds for the device record.
    #[must_use]
    pub fn matches(&self, device: &Value) -> bool {
        self.conditions.iter().all(|condition| {
            attribute_text(device, &condition.attribute)
                .is_some_and(|actual| condition.value.matches(&actual))
        })
    }
}

fn regex_body(value: &str) -> Option<&str> {
    value
        .strip_prefix('/')
        .and_then(|rest| rest.strip_suffix('/'))
        .filter(|body| !body.is_empty())
}

/// Resolves a dotted attribute path and renders it as comparable text.
///
/// Strings compare by their contents; other JSON scalars compare by their
/// JSON rendering (`true`, `29`). Missing and null attributes never match.
fn attribute_text(device: &Value, path: &str) -> Option<String> {
    let mut current = device;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}
