pub mod azurerm;
pub mod config;
pub mod confirm;
pub mod diff;
pub mod error;
pub mod input;
pub mod parser;
pub mod policy;
pub mod populate;
pub mod registry;
pub mod rules;
pub mod security;
pub mod serialize;

use crate::config::GenerateOptions;
use crate::confirm::ConfirmationSource;
use crate::diff::DiffResult;
use crate::policy::{ ContainerGroupDefinition, Policy };
use crate::populate::ImageInspector;
use serde_json::Value;
use std::cmp::Ordering;

pub use crate::error::{ PolicyError, PolicyResult };

// A generated policy and the container group it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPolicy {
  pub group: String,
  pub policy: Policy,
}

fn generate(group: &ContainerGroupDefinition, inspector: &dyn ImageInspector) -> PolicyResult<Policy> {
  populate::populate(policy::build(group), inspector)
}

pub fn generate_from_template(
  template: &str,
  parameters: Option<&str>,
  options: &GenerateOptions,
  confirm: &dyn ConfirmationSource,
  inspector: &dyn ImageInspector,
) -> PolicyResult<Vec<GroupPolicy>> {
  check_infrastructure_svn(options.infrastructure_svn.as_deref());

  azurerm::resolve(template, parameters, options, confirm)?
    .iter()
    .map(|group| {
      tracing::info!("generating policy for container group {}", group.name);
      Ok(GroupPolicy { group: group.name.clone(), policy: generate(group, inspector)? })
    })
    .collect()
}

pub fn generate_from_input(
  input: &str,
  options: &GenerateOptions,
  inspector: &dyn ImageInspector,
) -> PolicyResult<Policy> {
  check_infrastructure_svn(options.infrastructure_svn.as_deref());

  generate(&input::parse_input(input, options)?, inspector)
}

// (group name, Rego text) for every container group
pub fn print_existing_policy(template: &str, parameters: Option<&str>) -> PolicyResult<Vec<(String, String)>> {
  let template = azurerm::Template::parse(template, parameters)?;
  let evaluator = template.evaluator();

  template
    .groups()
    .iter()
    .map(|resource| {
      let group = resource.name(&evaluator)?;
      match resource.existing_policy(&evaluator)? {
        Some(existing) => Ok((group, serialize::decode_rego(&existing)?)),
        None => Err(PolicyError::NoExistingPolicy { group }),
      }
    })
    .collect()
}

// Checks each group's embedded policy against a freshly generated one
pub fn diff_against_template(
  template: &str,
  parameters: Option<&str>,
  options: &GenerateOptions,
  confirm: &dyn ConfirmationSource,
  inspector: &dyn ImageInspector,
) -> PolicyResult<Vec<(String, DiffResult)>> {
  let groups = azurerm::resolve(template, parameters, options, confirm)?;
  let mut results = Vec::with_capacity(groups.len());

  for group in &groups {
    let existing = match &group.cce_policy {
      Some(existing) => serialize::decode_existing(existing)?,
      None => {
        tracing::info!("container group {} has no policy, so everything is allowed", group.name);
        results.push((group.name.clone(), DiffResult { is_valid: true, ..DiffResult::default() }));
        continue;
      }
    };

    let candidate = generate(group, inspector)?;

    if !diff::fragments_match(&existing.fragments, &candidate.fragments) {
      tracing::warn!("fragments of container group {} differ from the generated ones", group.name);
    }

    results.push((group.name.clone(), diff::diff(&existing, &candidate)));
  }

  Ok(results)
}

// Writes a base64 policy into the template and returns the updated text
pub fn inject_policy(template: &str, index: usize, policy: &str) -> PolicyResult<String> {
  let mut document: Value = serde_json::from_str(template).map_err(PolicyError::json("template"))?;
  azurerm::set_cce_policy(&mut document, index, policy)?;

  serde_json::to_string_pretty(&document).map_err(PolicyError::json("template"))
}

fn compare_versions(a: &str, b: &str) -> Ordering {
  let parts = |v: &str| -> Vec<u64> { v.split('.').map(|p| p.trim().parse().unwrap_or(0)).collect() };
  let (a, b) = (parts(a), parts(b));

  // missing components count as zero
  (0..a.len().max(b.len()))
    .map(|i| a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0)))
    .find(|o| *o != Ordering::Equal)
    .unwrap_or(Ordering::Equal)
}

// Returns false, with a warning, when the requested SVN is older than the default
pub fn check_infrastructure_svn(requested: Option<&str>) -> bool {
  match requested {
    Some(svn) if compare_versions(svn, config::DEFAULT_FRAGMENT_MINIMUM_SVN) == Ordering::Less => {
      tracing::warn!(
        "infrastructure svn {} is lower than the default {}",
        svn, config::DEFAULT_FRAGMENT_MINIMUM_SVN
      );
      false
    }
    _ => true,
  }
}
