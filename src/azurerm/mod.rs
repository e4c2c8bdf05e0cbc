pub mod expression;
pub mod parser;

use crate::config::{ self, GenerateOptions };
use crate::confirm::ConfirmationSource;
use crate::error::{ PolicyError, PolicyResult };
use crate::input::fragment_imports;
use crate::policy::{ ContainerDefinition, ContainerGroupDefinition, ExecProcess, MountDefinition, MountKind };
use crate::rules::EnvRule;
use crate::security::parse_security_context;
use expression::{ parameter_reference, EvalError, Evaluator, Parameters };
use serde_json::{ Map, Value };
use std::convert::TryFrom;

// ARM keys are case-insensitive, exact matches win
pub(crate) fn get_ci<'v>(map: &'v Map<String, Value>, key: &str) -> Option<&'v Value> {
  map
    .get(key)
    .or_else(|| map.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v))
}

pub(crate) fn field<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
  value.as_object().and_then(|map| get_ci(map, key)).filter(|v| !v.is_null())
}

fn as_text(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

// Booleans in templates are often written as strings
pub(crate) fn as_flag(value: &Value) -> Option<bool> {
  match value {
    Value::Bool(b) => Some(*b),
    Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
    Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
    _ => None,
  }
}

fn is_container_group(value: &Value) -> bool {
  field(value, "type")
    .and_then(Value::as_str)
    .map_or(false, |kind| kind.eq_ignore_ascii_case(config::CONTAINER_GROUP_TYPE))
}

// A container group resource as written in the template, unevaluated
#[derive(Clone, Debug, PartialEq)]
pub struct Resource(Value);

impl Resource {
  pub fn raw(&self) -> &Value {
    &self.0
  }

  pub fn name(&self, evaluator: &Evaluator) -> PolicyResult<String> {
    match field(&self.0, "name") {
      Some(name) => Ok(as_text(&evaluator.resolve_value(name)?).unwrap_or_default()),
      None => Ok(String::new()),
    }
  }

  fn confidential_field(&self, key: &str) -> Option<&Value> {
    field(&self.0, "properties")
      .and_then(|p| field(p, "confidentialComputeProperties"))
      .and_then(|c| field(c, key))
  }

  fn confidential_property(&self, evaluator: &Evaluator, key: &str) -> PolicyResult<Option<String>> {
    match self.confidential_field(key) {
      Some(value) => Ok(as_text(&evaluator.resolve_value(value)?).filter(|s| !s.is_empty())),
      None => Ok(None),
    }
  }

  // The base64 policy already embedded in the group, if any
  pub fn existing_policy(&self, evaluator: &Evaluator) -> PolicyResult<Option<String>> {
    self.confidential_property(evaluator, "ccePolicy")
  }

  fn standalone_fragments(&self, evaluator: &Evaluator) -> PolicyResult<Vec<Value>> {
    match self.confidential_field("standaloneFragments") {
      Some(raw) => match evaluator.resolve_value(raw)? {
        Value::Array(fragments) => Ok(fragments),
        _ => Err(PolicyError::MalformedField {
          container: self.name(evaluator)?,
          field: "standaloneFragments",
          reason: "must be a list".to_owned(),
        }),
      },
      None => Ok(vec![]),
    }
  }

  fn excludes_default_fragments(&self) -> bool {
    field(&self.0, "tags")
      .and_then(|tags| field(tags, config::ZERO_SIDECAR_TAG))
      .and_then(as_flag)
      .unwrap_or(false)
  }
}

// Not every resource in a template is a container group
impl TryFrom<Value> for Resource {
  type Error = &'static str;

  fn try_from(value: Value) -> Result<Self, Self::Error> {
    if is_container_group(&value) {
      Ok(Self(value))
    } else {
      Err("Not a container group resource")
    }
  }
}

#[derive(Clone, Debug)]
pub struct Template {
  parameters: Parameters,
  variables: Map<String, Value>,
  groups: Vec<Resource>,
}

impl Template {
  pub fn parse(template: &str, parameter_file: Option<&str>) -> PolicyResult<Self> {
    let document: Value = serde_json::from_str(template).map_err(PolicyError::json("template"))?;

    let resources = field(&document, "resources")
      .and_then(Value::as_array)
      .filter(|resources| !resources.is_empty())
      .ok_or(PolicyError::MissingResources)?;

    let groups: Vec<Resource> = resources
      .iter()
      .filter_map(|r| Resource::try_from(r.clone()).ok())
      .collect();

    if groups.is_empty() {
      return Err(PolicyError::NoContainerGroups(config::CONTAINER_GROUP_TYPE));
    }

    let mut parameters = match field(&document, "parameters").and_then(Value::as_object) {
      Some(declarations) => Parameters::from_declarations(declarations),
      None => Parameters::default(),
    };

    if let Some(text) = parameter_file {
      apply_parameter_file(&mut parameters, text)?;
    }

    let variables = field(&document, "variables")
      .and_then(Value::as_object)
      .cloned()
      .unwrap_or_default();

    tracing::debug!("template declares {} container groups", groups.len());

    Ok(Self { parameters, variables, groups })
  }

  pub fn groups(&self) -> &[Resource] {
    &self.groups
  }

  pub fn evaluator(&self) -> Evaluator<'_> {
    Evaluator::new(&self.parameters, &self.variables)
  }

  pub fn resolve(
    &self,
    options: &GenerateOptions,
    confirm: &dyn ConfirmationSource,
  ) -> PolicyResult<Vec<ContainerGroupDefinition>> {
    let evaluator = self.evaluator();

    self
      .groups
      .iter()
      .map(|group| resolve_group(&evaluator, group, options, confirm))
      .collect()
  }
}

fn apply_parameter_file(parameters: &mut Parameters, text: &str) -> PolicyResult<()> {
  let document: Value = serde_json::from_str(text).map_err(PolicyError::json("parameter file"))?;
  let values = field(&document, "parameters")
    .and_then(Value::as_object)
    .ok_or(PolicyError::MissingParameterSection)?;

  for (name, entry) in values {
    let value = field(entry, "value").or_else(|| field(entry, "secureValue")).cloned();

    let declared = match value {
      Some(value) => parameters.set_value(name, value),
      // e.g. key vault references, which stay unresolved
      None => parameters.get(name).is_some(),
    };

    if !declared {
      return Err(PolicyError::UnknownParameter(name.clone()));
    }
  }

  Ok(())
}

pub fn resolve(
  template: &str,
  parameter_file: Option<&str>,
  options: &GenerateOptions,
  confirm: &dyn ConfirmationSource,
) -> PolicyResult<Vec<ContainerGroupDefinition>> {
  Template::parse(template, parameter_file)?.resolve(options, confirm)
}

fn resolve_group(
  evaluator: &Evaluator,
  resource: &Resource,
  options: &GenerateOptions,
  confirm: &dyn ConfirmationSource,
) -> PolicyResult<ContainerGroupDefinition> {
  let name = resource.name(evaluator)?;
  let empty = Value::Object(Map::new());
  let properties = field(resource.raw(), "properties").unwrap_or(&empty);

  let volumes = match field(properties, "volumes") {
    Some(volumes) => match evaluator.resolve_value(volumes)? {
      Value::Array(volumes) => volumes,
      _ => {
        return Err(PolicyError::MalformedField {
          container: name,
          field: "volumes",
          reason: "must be a list".to_owned(),
        })
      }
    },
    None => vec![],
  };

  let containers = match field(properties, "containers").and_then(Value::as_array) {
    Some(list) if !list.is_empty() => list,
    _ => return Err(PolicyError::EmptyContainers { group: name, field: "containers" }),
  };

  let init_containers = match field(properties, "initContainers") {
    None => &[][..],
    Some(Value::Array(list)) if !list.is_empty() => &list[..],
    Some(_) => return Err(PolicyError::EmptyContainers { group: name, field: "initContainers" }),
  };

  let containers = containers
    .iter()
    .map(|c| resolve_container(evaluator, c, &volumes, confirm))
    .collect::<PolicyResult<Vec<_>>>()?;

  let init_containers = init_containers
    .iter()
    .map(|c| resolve_container(evaluator, c, &volumes, confirm))
    .collect::<PolicyResult<Vec<_>>>()?;

  let exclude_default_fragments = options.exclude_default_fragments || resource.excludes_default_fragments();
  if exclude_default_fragments {
    tracing::info!("container group {} excludes the default fragments", name);
  }

  let mut imports = options.fragment_imports.clone();
  imports.extend(fragment_imports(&resource.standalone_fragments(evaluator)?)?);

  Ok(ContainerGroupDefinition {
    isolation_type: resource.confidential_property(evaluator, "isolationType")?,
    cce_policy: resource.existing_policy(evaluator)?,
    name,
    containers,
    init_containers,
    infrastructure_svn: options.infrastructure_svn.clone(),
    disable_stdio: options.disable_stdio,
    debug_mode: options.debug_mode,
    exclude_default_fragments,
    fragment_imports: imports,
  })
}

fn resolve_container(
  evaluator: &Evaluator,
  raw: &Value,
  volumes: &[Value],
  confirm: &dyn ConfirmationSource,
) -> PolicyResult<ContainerDefinition> {
  let name = match field(raw, "name") {
    Some(name) => as_text(&evaluator.resolve_value(name)?).unwrap_or_default(),
    None => String::new(),
  };

  // env vars are handled separately so valueless parameters can become wildcards
  let mut properties = field(raw, "properties").and_then(Value::as_object).cloned().unwrap_or_default();
  let env_key = properties
    .keys()
    .find(|k| k.eq_ignore_ascii_case("environmentVariables"))
    .cloned();
  let env = match env_key.and_then(|key| properties.remove(&key)) {
    Some(Value::Array(entries)) => resolve_env(evaluator, &name, &entries, confirm)?,
    Some(Value::Null) | None => vec![],
    Some(_) => {
      return Err(PolicyError::MalformedField {
        container: name,
        field: "environmentVariables",
        reason: "must be a list".to_owned(),
      })
    }
  };

  let properties = evaluator.resolve_value(&Value::Object(properties))?;

  let image = field(&properties, "image")
    .and_then(Value::as_str)
    .filter(|image| !image.is_empty())
    .ok_or_else(|| PolicyError::EmptyImage { container: name.clone() })?
    .to_owned();

  let command = match field(&properties, "command") {
    Some(command) => string_list(command).ok_or_else(|| PolicyError::MalformedField {
      container: name.clone(),
      field: "command",
      reason: "must be a list of strings".to_owned(),
    })?,
    None => vec![],
  };

  let (privileged, security) = parse_security_context(&name, field(&properties, "securityContext"))?;

  let mut mounts = resolve_mounts(&name, &properties, volumes)?;
  if field(&properties, "configMap").is_some() {
    mounts.push(MountDefinition { kind: MountKind::ConfigMap, path: config::CONFIG_MAP_PATH.to_owned(), read_only: false });
  }
  let exec_processes = probe_exec_processes(&name, &properties)?;

  tracing::debug!("resolved container {} ({}) with {} env rules", name, image, env.len());

  Ok(ContainerDefinition {
    name,
    image,
    command,
    working_dir: None,
    env,
    mounts,
    allow_elevated: privileged.unwrap_or(true),
    exec_processes,
    signals: vec![],
    security,
  })
}

fn string_list(value: &Value) -> Option<Vec<String>> {
  value.as_array()?.iter().map(as_text).collect()
}

fn resolve_env(
  evaluator: &Evaluator,
  container: &str,
  entries: &[Value],
  confirm: &dyn ConfirmationSource,
) -> PolicyResult<Vec<EnvRule>> {
  let mut rules = Vec::with_capacity(entries.len());

  for entry in entries {
    let (raw_value, secure) = match field(entry, "value") {
      Some(value) => (Some(value), false),
      None => (field(entry, "secureValue"), true),
    };

    let name = match field(entry, "name") {
      Some(name) => as_text(&evaluator.resolve_value(name)?).unwrap_or_default(),
      None => String::new(),
    };

    if name.is_empty() {
      let value = if secure { "<secure>".to_owned() } else { raw_value.map(|v| v.to_string()).unwrap_or_default() };
      return Err(PolicyError::MissingEnvName { value });
    }

    let raw_value = raw_value.ok_or_else(|| PolicyError::MissingEnvValue { name: name.clone() })?;

    if let Some(text) = raw_value.as_str() {
      if parameter_reference(text).is_some() {
        if let Err(EvalError::UnresolvedParameter(parameter)) = evaluator.evaluate_str(text) {
          let prompt = format!("Create a wildcard policy for the environment variable {}", name);
          if confirm.confirm(&prompt) {
            tracing::info!("creating a wildcard policy for {} from parameter {}", name, parameter);
            rules.push(EnvRule::re2(&name, ".*"));
          } else {
            tracing::warn!("dropping environment variable {} of container {}, wildcard declined", name, container);
          }
          continue;
        }
      }
    }

    let value = evaluator.resolve_value(raw_value)?;
    let value = as_text(&value).ok_or_else(|| PolicyError::MalformedField {
      container: container.to_owned(),
      field: "environmentVariables",
      reason: format!("value of {} must be a string", name),
    })?;

    if secure {
      tracing::debug!("environment variable {} set from a secure value", name);
    } else {
      tracing::debug!("environment variable {}={}", name, value);
    }

    rules.push(EnvRule::string(&name, &value));
  }

  Ok(rules)
}

fn resolve_mounts(container: &str, properties: &Value, volumes: &[Value]) -> PolicyResult<Vec<MountDefinition>> {
  let mounts = match field(properties, "volumeMounts") {
    Some(Value::Array(mounts)) => mounts,
    Some(_) => {
      return Err(PolicyError::MalformedField {
        container: container.to_owned(),
        field: "volumeMounts",
        reason: "must be a list".to_owned(),
      })
    }
    None => return Ok(vec![]),
  };

  mounts
    .iter()
    .map(|mount| {
      let name = field(mount, "name").and_then(as_text).unwrap_or_default();
      let volume = volumes
        .iter()
        .find(|v| field(v, "name").and_then(Value::as_str) == Some(name.as_str()))
        .ok_or_else(|| PolicyError::VolumeNotFound { name: name.clone() })?;

      let kind = volume
        .as_object()
        .and_then(|v| v.keys().find_map(|key| MountKind::from_key(key)))
        .ok_or_else(|| PolicyError::MalformedField {
          container: container.to_owned(),
          field: "volumes",
          reason: format!("volume {} has no supported source", name),
        })?;

      let path = field(mount, "mountPath").and_then(as_text).ok_or_else(|| PolicyError::MalformedField {
        container: container.to_owned(),
        field: "volumeMounts",
        reason: format!("mount {} is missing mountPath", name),
      })?;

      let read_only = field(mount, "readOnly").and_then(as_flag).unwrap_or(false);

      Ok(MountDefinition { kind, path, read_only })
    })
    .collect()
}

fn probe_exec_processes(container: &str, properties: &Value) -> PolicyResult<Vec<ExecProcess>> {
  let mut processes = vec![];

  for probe in &["readinessProbe", "livenessProbe"] {
    if let Some(exec) = field(properties, probe).and_then(|p| field(p, "exec")) {
      let command = field(exec, "command")
        .and_then(string_list)
        .filter(|command| !command.is_empty())
        .ok_or_else(|| PolicyError::MalformedField {
          container: container.to_owned(),
          field: "exec",
          reason: format!("{} must have a command", probe),
        })?;

      processes.push(ExecProcess { command, signals: vec![] });
    }
  }

  Ok(processes)
}

// Writes `policy` into the `index`-th container group's ccePolicy field
pub fn set_cce_policy(document: &mut Value, index: usize, policy: &str) -> PolicyResult<()> {
  let resources = document
    .as_object_mut()
    .and_then(|d| {
      let key = d.keys().find(|k| k.eq_ignore_ascii_case("resources")).cloned()?;
      d.get_mut(&key)
    })
    .and_then(Value::as_array_mut)
    .ok_or(PolicyError::MissingResources)?;

  let group = resources
    .iter_mut()
    .filter(|r| is_container_group(r))
    .nth(index)
    .ok_or(PolicyError::NoContainerGroups(config::CONTAINER_GROUP_TYPE))?;

  let slot = entry_ci(group, "properties")
    .and_then(|p| entry_ci(p, "confidentialComputeProperties"))
    .and_then(|c| entry_ci(c, "ccePolicy"))
    .ok_or_else(|| PolicyError::MalformedField {
      container: format!("container group {}", index),
      field: "confidentialComputeProperties",
      reason: "must be an object".to_owned(),
    })?;
  *slot = Value::String(policy.to_owned());

  Ok(())
}

// Case-insensitive entry of an object, created when absent
fn entry_ci<'v>(value: &'v mut Value, key: &str) -> Option<&'v mut Value> {
  if value.is_null() {
    *value = Value::Object(Map::new());
  }

  let map = value.as_object_mut()?;
  let existing = map.keys().find(|k| k.eq_ignore_ascii_case(key)).cloned();

  Some(map.entry(existing.unwrap_or_else(|| key.to_owned())).or_insert(Value::Null))
}
