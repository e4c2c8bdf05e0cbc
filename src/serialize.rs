use crate::config;
use crate::error::{ PolicyError, PolicyResult };
use crate::parser::{ extract_array, extract_flag };
use crate::policy::{ ContainerRole, Fragment, GlobalFlags, Policy, PolicyContainer };
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{ json, Map, Value };
use sha2::{ Digest, Sha256 };

const REGO_TEMPLATE: &str = include_str!("policy.rego");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
  Default,
  Raw,
  PrettyPrint,
}

fn render(value: &Value, pretty: bool) -> PolicyResult<String> {
  let rendered = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };

  rendered.map_err(PolicyError::json("policy"))
}

fn containers_value(policy: &Policy) -> PolicyResult<Value> {
  serde_json::to_value(&policy.containers).map_err(PolicyError::json("policy containers"))
}

// Arrays become {"length": n, "elements": {"0": ...}} all the way down
fn indexed(value: Value) -> Value {
  match value {
    Value::Array(items) => {
      let length = items.len();
      let elements: Map<String, Value> = items
        .into_iter()
        .enumerate()
        .map(|(i, item)| (i.to_string(), indexed(item)))
        .collect();
      json!({ "length": length, "elements": elements })
    }
    Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, indexed(v))).collect()),
    other => other,
  }
}

// Fragments are always pretty printed, containers follow the output type
fn rego(policy: &Policy, containers: &str) -> PolicyResult<String> {
  let fragments = serde_json::to_value(&policy.fragments).map_err(PolicyError::json("policy fragments"))?;

  let mut text = REGO_TEMPLATE
    .replace("{{api_svn}}", config::API_SVN)
    .replace("{{framework_svn}}", config::FRAMEWORK_SVN)
    .replace("{{fragments}}", &render(&fragments, true)?);

  for (name, flag) in policy.flags.as_pairs().iter() {
    text = text.replace(&format!("{{{{{}}}}}", name), &flag.to_string());
  }

  // last, so container content is never mistaken for a placeholder
  Ok(text.replace("{{containers}}", containers))
}

pub fn serialize(policy: &Policy, output_type: OutputType, use_json: bool, rego_boilerplate: bool) -> PolicyResult<String> {
  let pretty = output_type == OutputType::PrettyPrint;
  let containers = containers_value(policy)?;

  let text = if use_json {
    render(&json!({ "allow_all": false, "containers": indexed(containers) }), pretty)?
  } else if !rego_boilerplate {
    render(&containers, pretty)?
  } else {
    rego(policy, &render(&containers, pretty)?)?
  };

  Ok(match output_type {
    OutputType::Default => STANDARD.encode(text),
    OutputType::Raw | OutputType::PrettyPrint => text,
  })
}

pub fn sha256_hex(text: &str) -> String {
  Sha256::digest(text.as_bytes()).iter().map(|b| format!("{:02x}", b)).collect()
}

// The Rego text of a base64 ccePolicy
pub fn decode_rego(cce_policy: &str) -> PolicyResult<String> {
  let bytes = STANDARD.decode(cce_policy.trim())?;
  let text = String::from_utf8(bytes).map_err(|e| PolicyError::PolicyFormat(e.to_string()))?;

  if serde_json::from_str::<Value>(&text).is_ok() {
    return Err(PolicyError::PolicyFormat("decoded policy is JSON, not Rego".to_owned()));
  }

  Ok(text)
}

pub fn parse_rego(text: &str) -> PolicyResult<Policy> {
  let containers = extract_array(text, "containers")
    .ok_or_else(|| PolicyError::PolicyFormat("no containers binding".to_owned()))?;
  let mut containers: Vec<PolicyContainer> =
    serde_json::from_str(containers).map_err(PolicyError::json("existing policy containers"))?;

  for container in containers.iter_mut() {
    if container.id.is_empty() {
      container.role = ContainerRole::Infrastructure;
    }
  }

  let fragments: Vec<Fragment> = match extract_array(text, "fragments") {
    Some(fragments) => serde_json::from_str(fragments).map_err(PolicyError::json("existing policy fragments"))?,
    None => vec![],
  };

  let defaults = GlobalFlags::default();
  let flags = GlobalFlags {
    allow_properties_access: extract_flag(text, "allow_properties_access").unwrap_or(defaults.allow_properties_access),
    allow_dump_stacks: extract_flag(text, "allow_dump_stacks").unwrap_or(defaults.allow_dump_stacks),
    allow_runtime_logging: extract_flag(text, "allow_runtime_logging").unwrap_or(defaults.allow_runtime_logging),
    allow_environment_variable_dropping: extract_flag(text, "allow_environment_variable_dropping")
      .unwrap_or(defaults.allow_environment_variable_dropping),
    allow_unencrypted_scratch: extract_flag(text, "allow_unencrypted_scratch").unwrap_or(defaults.allow_unencrypted_scratch),
  };

  Ok(Policy { containers, fragments, flags })
}

pub fn decode_existing(cce_policy: &str) -> PolicyResult<Policy> {
  parse_rego(&decode_rego(cce_policy)?)
}
