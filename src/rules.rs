use regex::Regex;
use serde::{ Deserialize, Serialize };
use std::fmt;

// How the right hand side of an env rule is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
  String,
  Re2,
}

impl Default for Strategy {
  fn default() -> Self {
    Self::String
  }
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::String => write!(f, "string"),
      Self::Re2 => write!(f, "re2"),
    }
  }
}

// NAME=VALUE, or NAME=REGEX for re2 rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvRule {
  pub pattern: String,
  pub strategy: Strategy,
  #[serde(default)]
  pub required: bool,
}

impl EnvRule {
  pub fn string(name: &str, value: &str) -> Self {
    Self { pattern: format!("{}={}", name, value), strategy: Strategy::String, required: false }
  }

  pub fn re2(name: &str, value: &str) -> Self {
    Self { pattern: format!("{}={}", name, value), strategy: Strategy::Re2, required: false }
  }

  pub fn required(mut self, required: bool) -> Self {
    self.required = required;
    self
  }

  pub fn name(&self) -> &str {
    self.pattern.split('=').next().unwrap_or_default()
  }

  // Whether a concrete `NAME=VALUE` pattern is allowed by this rule. Regex
  // rules search rather than anchor, so `A=.*` also admits `XA=1`.
  pub fn admits(&self, pattern: &str) -> bool {
    match self.strategy {
      Strategy::String => self.pattern == pattern,
      Strategy::Re2 => match Regex::new(&self.pattern) {
        Ok(regex) => regex.is_match(pattern),
        Err(e) => {
          tracing::warn!("env rule {:?} is not a valid regex: {}", self.pattern, e);
          false
        }
      },
    }
  }
}

impl fmt::Display for EnvRule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({})", self.pattern, self.strategy)
  }
}

// Appends each rule of `extra` whose name is not yet present in `rules`
pub fn merge_missing(rules: &mut Vec<EnvRule>, extra: &[EnvRule]) {
  for rule in extra {
    if !rules.iter().any(|r| r.name() == rule.name()) {
      rules.push(rule.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_name() {
    assert_eq!(EnvRule::string("PATH", "/usr/bin:/bin").name(), "PATH");
    assert_eq!(EnvRule::string("EMPTY", "").name(), "EMPTY");
    assert_eq!(EnvRule::re2("ACI_MI_CLIENT_ID_.+", ".+").name(), "ACI_MI_CLIENT_ID_.+");
  }

  #[test]
  fn test_admits() {
    let exact = EnvRule::string("TEST_REGEXP_ENV", "test_regexp_env");
    assert!(exact.admits("TEST_REGEXP_ENV=test_regexp_env"));
    assert!(!exact.admits("TEST_REGEXP_ENV=test_regexp_en"));

    let wildcard = EnvRule::re2("TEST_WILDCARD_ENV", ".*");
    assert!(wildcard.admits("TEST_WILDCARD_ENV=anything at all"));
    assert!(wildcard.admits("TEST_WILDCARD_ENV="));
    assert!(!wildcard.admits("OTHER=1"));

    let broken = EnvRule::re2("BROKEN", "(");
    assert!(!broken.admits("BROKEN=("));
  }

  #[test]
  fn test_serialized_shape() {
    let rule = EnvRule::re2("TEST_WILDCARD_ENV", ".*").required(true);

    assert_eq!(
      serde_json::to_value(&rule).unwrap(),
      serde_json::json!({ "pattern": "TEST_WILDCARD_ENV=.*", "strategy": "re2", "required": true })
    );
  }

  #[test]
  fn test_merge_missing() {
    let mut rules = vec![EnvRule::string("PATH", "/customized/path/value")];
    merge_missing(&mut rules, &[
      EnvRule::string("PATH", "/usr/local/bin"),
      EnvRule::string("LANG", "C.UTF-8"),
    ]);

    assert_eq!(rules, vec![
      EnvRule::string("PATH", "/customized/path/value"),
      EnvRule::string("LANG", "C.UTF-8"),
    ]);
  }
}
