use crate::azurerm::field;
use crate::config::GenerateOptions;
use crate::error::{ PolicyError, PolicyResult };
use crate::policy::{ ContainerDefinition, ContainerGroupDefinition, ExecProcess, Fragment, MountDefinition, MountKind };
use crate::rules::{ EnvRule, Strategy };
use crate::security::parse_security_context;
use serde::Deserialize;
use serde_json::Value;

const INPUT_GROUP_NAME: &str = "policy-input";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InputDocument {
  version: Option<String>,
  containers: Vec<Value>,
  fragments: Vec<Value>,
  standalone_fragments: Vec<Value>,
}

// Older inputs put container fields at the top level (`containerImage`,
// `mounts`), newer ones nest them under `properties`

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InputContainer {
  name: String,
  #[serde(alias = "containerImage")]
  image: String,
  environment_variables: Vec<InputEnv>,
  command: Vec<String>,
  working_dir: Option<String>,
  #[serde(alias = "mounts")]
  volume_mounts: Vec<InputMount>,
  allow_elevated: Option<bool>,
  security_context: Option<Value>,
  exec_processes: Vec<ExecProcess>,
  signals: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InputEnv {
  name: String,
  value: String,
  strategy: Option<Strategy>,
  regex: bool,
  required: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InputMount {
  mount_type: String,
  mount_path: String,
  #[serde(alias = "readonly")]
  read_only: bool,
}

impl InputEnv {
  fn rule(&self) -> EnvRule {
    let strategy = self.strategy.unwrap_or(if self.regex { Strategy::Re2 } else { Strategy::String });
    let rule = match strategy {
      Strategy::String => EnvRule::string(&self.name, &self.value),
      Strategy::Re2 => EnvRule::re2(&self.name, &self.value),
    };

    rule.required(self.required)
  }
}

impl InputContainer {
  fn from_value(raw: &Value) -> PolicyResult<Self> {
    let fields = raw.get("properties").filter(|p| p.is_object()).unwrap_or(raw);
    let mut container: InputContainer =
      serde_json::from_value(fields.clone()).map_err(PolicyError::json("policy input container"))?;

    if container.name.is_empty() {
      container.name = raw.get("name").and_then(Value::as_str).unwrap_or_default().to_owned();
    }

    Ok(container)
  }

  fn definition(self) -> PolicyResult<ContainerDefinition> {
    if self.image.is_empty() {
      return Err(PolicyError::EmptyImage { container: self.name });
    }

    let mut env = Vec::with_capacity(self.environment_variables.len());
    for variable in &self.environment_variables {
      if variable.name.is_empty() {
        return Err(PolicyError::MissingEnvName { value: variable.value.clone() });
      }
      env.push(variable.rule());
    }

    let mounts = self
      .volume_mounts
      .iter()
      .map(|mount| {
        let kind = MountKind::from_key(&mount.mount_type).ok_or_else(|| PolicyError::MalformedField {
          container: self.name.clone(),
          field: "mountType",
          reason: format!("unsupported mount type {:?}", mount.mount_type),
        })?;

        Ok(MountDefinition { kind, path: mount.mount_path.clone(), read_only: mount.read_only })
      })
      .collect::<PolicyResult<Vec<_>>>()?;

    let (privileged, security) = parse_security_context(&self.name, self.security_context.as_ref())?;
    let allow_elevated = self.allow_elevated.or(privileged).unwrap_or(true);

    Ok(ContainerDefinition {
      name: self.name,
      image: self.image,
      command: self.command,
      working_dir: self.working_dir.filter(|dir| !dir.is_empty()),
      env,
      mounts,
      allow_elevated,
      exec_processes: self.exec_processes,
      signals: self.signals,
      security,
    })
  }
}

fn import_text(import: &Value, key: &str) -> Option<String> {
  field(import, key).and_then(Value::as_str).map(str::to_owned)
}

fn fragment_import(import: &Value) -> PolicyResult<Fragment> {
  let feed = import_text(import, "feed").ok_or_else(|| PolicyError::InvalidFragment {
    feed: import.to_string(),
    reason: "feed can only be a string value".to_owned(),
  })?;
  let invalid = |reason: &str| PolicyError::InvalidFragment { feed: feed.clone(), reason: reason.to_owned() };

  let issuer = import_text(import, "issuer").ok_or_else(|| invalid("issuer can only be a string value"))?;
  let minimum_svn = import_text(import, "minimum_svn")
    .filter(|svn| !svn.is_empty() && svn.bytes().all(|b| b.is_ascii_digit()))
    .ok_or_else(|| invalid("minimum_svn can only be a string with an integer value"))?;
  let includes = match field(import, "includes") {
    Some(Value::Array(items)) => items
      .iter()
      .map(|item| item.as_str().map(str::to_owned))
      .collect::<Option<Vec<_>>>()
      .ok_or_else(|| invalid("includes can only contain strings"))?,
    _ => return Err(invalid("includes can only be a list value")),
  };

  Ok(Fragment { feed, includes, issuer, minimum_svn })
}

// Import statements of a fragment list. Plain strings are OCI references to
// standalone fragments, which are not fetched.
pub(crate) fn fragment_imports(values: &[Value]) -> PolicyResult<Vec<Fragment>> {
  let mut imports = Vec::with_capacity(values.len());

  for value in values {
    match value {
      Value::Null => {}
      Value::Object(map) if map.is_empty() => {}
      Value::String(reference) => tracing::warn!("skipping standalone fragment {}, only imports are supported", reference),
      import => imports.push(fragment_import(import)?),
    }
  }

  Ok(imports)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FragmentsDocument {
  fragments: Vec<Value>,
  standalone_fragments: Vec<Value>,
}

// The `--fragments-json` file: `fragments` and `standaloneFragments` lists
pub fn parse_fragment_imports(text: &str) -> PolicyResult<Vec<Fragment>> {
  let document: FragmentsDocument = serde_json::from_str(text).map_err(PolicyError::json("fragments"))?;

  let mut imports = fragment_imports(&document.fragments)?;
  imports.extend(fragment_imports(&document.standalone_fragments)?);
  Ok(imports)
}

pub fn parse_input(text: &str, options: &GenerateOptions) -> PolicyResult<ContainerGroupDefinition> {
  let document: InputDocument = serde_json::from_str(text).map_err(PolicyError::json("policy input"))?;

  let mut imports = options.fragment_imports.clone();
  imports.extend(fragment_imports(&document.fragments)?);
  imports.extend(fragment_imports(&document.standalone_fragments)?);

  // a group made only of fragments is allowed
  if document.containers.is_empty() && imports.is_empty() {
    return Err(PolicyError::EmptyContainers { group: INPUT_GROUP_NAME.to_owned(), field: "containers" });
  }

  tracing::debug!(
    "policy input version {} with {} containers",
    document.version.as_deref().unwrap_or("unspecified"),
    document.containers.len()
  );

  let containers = document
    .containers
    .iter()
    .map(|raw| InputContainer::from_value(raw)?.definition())
    .collect::<PolicyResult<Vec<_>>>()?;

  Ok(ContainerGroupDefinition {
    name: INPUT_GROUP_NAME.to_owned(),
    containers,
    init_containers: vec![],
    isolation_type: None,
    cce_policy: None,
    infrastructure_svn: options.infrastructure_svn.clone(),
    disable_stdio: options.disable_stdio,
    debug_mode: options.debug_mode,
    exclude_default_fragments: options.exclude_default_fragments,
    fragment_imports: imports,
  })
}
