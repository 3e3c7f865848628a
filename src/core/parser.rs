//! RS-005: YAML parsing and validation.
//!
//! Parses railstack.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Stack names must be valid and distinct
//! - The application secret ARN must be supplied as context
//! - Each stack's settings must satisfy its own invariants

use super::types::*;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// A fixed validation pattern, compiled on first use.
pub type Pattern = LazyLock<Option<Regex>>;

static STACK_NAME: Pattern = LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,127}$").ok());
static IMAGE_TAG: Pattern = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").ok());

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// True if `value` matches `pattern`. A pattern that failed to compile
/// never matches.
pub fn is_match(pattern: &Pattern, value: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(value))
}

/// Parse a railstack.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<RailstackConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse a railstack.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<RailstackConfig, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Apply `KEY=VALUE` context overrides from the command line.
pub fn apply_context_overrides(
    config: &mut RailstackConfig,
    overrides: &[String],
) -> Result<(), String> {
    for item in overrides {
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| format!("context override '{}' must be KEY=VALUE", item))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("context override '{}' has an empty key", item));
        }
        tracing::debug!(%key, "context override");
        config.context.insert(key.to_string(), value.to_string());
    }
    Ok(())
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &RailstackConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(ValidationError::new(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        )));
    }

    if config.name.is_empty() {
        errors.push(ValidationError::new("name must not be empty"));
    }

    // CloudFormation stack name rules
    let names = [
        ("network", &config.stacks.network),
        ("storage", &config.stacks.storage),
        ("api", &config.stacks.api),
        ("ci", &config.stacks.ci),
    ];
    for (role, name) in &names {
        if !is_match(&STACK_NAME, name) {
            errors.push(ValidationError::new(format!(
                "stacks.{}: '{}' is not a valid stack name",
                role, name
            )));
        }
    }
    for (i, (role, name)) in names.iter().enumerate() {
        if let Some((other, _)) = names[..i].iter().find(|(_, n)| n == name) {
            errors.push(ValidationError::new(format!(
                "stacks.{} and stacks.{} share the name '{}'",
                other, role, name
            )));
        }
    }

    match config.context_value(SECRET_ARN_KEY) {
        None => errors.push(ValidationError::new(format!(
            "context value '{}' is required",
            SECRET_ARN_KEY
        ))),
        Some(arn) if !arn.starts_with("arn:") => errors.push(ValidationError::new(format!(
            "context value '{}' must be a complete secret ARN, got '{}'",
            SECRET_ARN_KEY, arn
        ))),
        Some(_) => {}
    }

    if let Some(tag) = config.context_value(APP_TAG_KEY) {
        if !is_match(&IMAGE_TAG, tag) {
            errors.push(ValidationError::new(format!(
                "context value '{}' is not a valid image tag: '{}'",
                APP_TAG_KEY, tag
            )));
        }
    }

    errors.extend(crate::stacks::validate_stacks(config));
    errors
}
