use crate::policy::{ Fragment, Policy, PolicyContainer };
use crate::rules::{ EnvRule, Strategy };
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueChange {
  pub tested_value: Value,
  pub policy_value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerDiff {
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub values_changed: BTreeMap<String, Vec<ValueChange>>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub values_added: BTreeMap<String, Vec<Value>>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub values_removed: BTreeMap<String, Vec<Value>>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub env_rules: Vec<String>,
}

impl ContainerDiff {
  pub fn is_empty(&self) -> bool {
    self.size() == 0
  }

  fn size(&self) -> usize {
    self.values_changed.values().map(Vec::len).sum::<usize>()
      + self.values_added.values().map(Vec::len).sum::<usize>()
      + self.values_removed.values().map(Vec::len).sum::<usize>()
      + self.env_rules.len()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DiffEntry {
  NotFound(String),
  Changed(ContainerDiff),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult {
  pub is_valid: bool,
  pub diff: BTreeMap<String, DiffEntry>,
}

// Fields that get their own comparison
const SKIPPED_FIELDS: &[&str] = &["id", "env_rules"];

const PAUSE_CONTAINER_LABEL: &str = "pause container";

// The pause container has no id
fn label(container: &PolicyContainer) -> String {
  if container.id.is_empty() { PAUSE_CONTAINER_LABEL.to_owned() } else { container.id.clone() }
}

fn container_value(container: &PolicyContainer) -> Value {
  match serde_json::to_value(container) {
    Ok(Value::Object(mut map)) => {
      for field in SKIPPED_FIELDS {
        map.remove(*field);
      }
      Value::Object(map)
    }
    _ => Value::Null,
  }
}

fn compare(field: &str, policy: &Value, tested: &Value, diff: &mut ContainerDiff) {
  match (policy, tested) {
    (Value::Object(old), Value::Object(new)) => {
      for (key, old_value) in old {
        match new.get(key) {
          Some(new_value) => compare(field, old_value, new_value, diff),
          None => diff.values_removed.entry(field.to_owned()).or_default().push(old_value.clone()),
        }
      }
      for (key, new_value) in new {
        if !old.contains_key(key) {
          diff.values_added.entry(field.to_owned()).or_default().push(new_value.clone());
        }
      }
    }
    (Value::Array(old), Value::Array(new)) => {
      // order is not significant, identical items cancel out first
      let mut unmatched_old: Vec<&Value> = old.iter().collect();
      let mut unmatched_new = vec![];
      for item in new {
        match unmatched_old.iter().position(|o| *o == item) {
          Some(i) => {
            unmatched_old.remove(i);
          }
          None => unmatched_new.push(item),
        }
      }

      for (old_item, new_item) in unmatched_old.iter().zip(unmatched_new.iter()) {
        compare(field, old_item, new_item, diff);
      }

      let paired = unmatched_old.len().min(unmatched_new.len());
      for item in &unmatched_old[paired..] {
        diff.values_removed.entry(field.to_owned()).or_default().push((*item).clone());
      }
      for item in &unmatched_new[paired..] {
        diff.values_added.entry(field.to_owned()).or_default().push((*item).clone());
      }
    }
    (old, new) if old != new => {
      diff.values_changed.entry(field.to_owned()).or_default().push(ValueChange {
        tested_value: new.clone(),
        policy_value: old.clone(),
      });
    }
    _ => (),
  }
}

pub fn compare_env_rules(policy: &[EnvRule], tested: &[EnvRule]) -> Vec<String> {
  let strings: Vec<&str> = policy
    .iter()
    .filter(|r| r.strategy == Strategy::String)
    .map(|r| r.pattern.as_str())
    .collect();
  let regexes: Vec<&EnvRule> = policy.iter().filter(|r| r.strategy == Strategy::Re2).collect();

  tested
    .iter()
    .filter_map(|rule| match rule.strategy {
      Strategy::String if !strings.contains(&rule.pattern.as_str())
        && !regexes.iter().any(|r| r.admits(&rule.pattern)) =>
      {
        Some(format!(
          "environment variable with rule '{}' does not match strings or regex in policy rules",
          rule.pattern
        ))
      }
      Strategy::Re2 if !regexes.iter().any(|r| r.pattern == rule.pattern) => {
        Some(format!("environment variable with rule '{}' is not in the policy", rule.pattern))
      }
      _ => None,
    })
    .collect()
}

pub fn compare_containers(policy: &PolicyContainer, tested: &PolicyContainer) -> ContainerDiff {
  let mut diff = ContainerDiff::default();

  if let (Value::Object(old), Value::Object(new)) = (container_value(policy), container_value(tested)) {
    for (field, old_value) in &old {
      match new.get(field) {
        Some(new_value) => compare(field, old_value, new_value, &mut diff),
        None => diff.values_removed.entry(field.clone()).or_default().push(old_value.clone()),
      }
    }
    for (field, new_value) in &new {
      if !old.contains_key(field) {
        diff.values_added.entry(field.clone()).or_default().push(new_value.clone());
      }
    }
  }

  diff.env_rules = compare_env_rules(&policy.env_rules, &tested.env_rules);
  diff
}

// `current` is the policy already in place, `candidate` the one being tested
pub fn diff(current: &Policy, candidate: &Policy) -> DiffResult {
  let mut result = BTreeMap::new();

  for tested in &candidate.containers {
    let diffs: Vec<ContainerDiff> = current
      .containers
      .iter()
      .filter(|c| c.id == tested.id)
      .map(|c| compare_containers(c, tested))
      .collect();

    let key = label(tested);
    if diffs.is_empty() {
      result.insert(key.clone(), DiffEntry::NotFound(format!("{} not found in policy", key)));
      continue;
    }

    // the closest container with this id is the one it is checked against
    if let Some(closest) = diffs.into_iter().min_by_key(ContainerDiff::size) {
      if !closest.is_empty() {
        result.insert(key, DiffEntry::Changed(closest));
      }
    }
  }

  DiffResult { is_valid: result.is_empty(), diff: result }
}

// True when the existing fragments are the defaults this tool would emit
pub fn fragments_match(existing: &[Fragment], defaults: &[Fragment]) -> bool {
  existing.len() == defaults.len() && existing.iter().all(|f| defaults.contains(f))
}
