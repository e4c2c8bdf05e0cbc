use crate::azurerm::{ as_flag, field };
use crate::config;
use crate::error::{ PolicyError, PolicyResult };
use crate::serialize::sha256_hex;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{ Deserialize, Serialize };
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdName {
  pub pattern: String,
  // any, id or name
  pub strategy: String,
}

impl IdName {
  fn any() -> Self {
    Self { pattern: String::new(), strategy: "any".to_owned() }
  }

  fn id(id: u64) -> Self {
    Self { pattern: id.to_string(), strategy: "id".to_owned() }
  }

  // "1000" is an id, "nginx" a name
  fn parse(text: &str) -> Self {
    let strategy = if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) { "id" } else { "name" };
    Self { pattern: text.to_owned(), strategy: strategy.to_owned() }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPolicy {
  pub user_idname: IdName,
  pub group_idnames: Vec<IdName>,
  pub umask: String,
}

impl Default for UserPolicy {
  fn default() -> Self {
    Self { user_idname: IdName::any(), group_idnames: vec![IdName::any()], umask: "0022".to_owned() }
  }
}

impl UserPolicy {
  fn from_ids(user: Option<u64>, group: Option<u64>) -> Self {
    let mut policy = Self::default();
    if let Some(user) = user {
      policy.user_idname = IdName::id(user);
    }
    if let Some(group) = group {
      policy.group_idnames = vec![IdName::id(group)];
    }
    policy
  }

  // The image config's User: user, user:group, uid or uid:gid
  pub fn from_image_user(user: &str) -> Self {
    let mut policy = Self::default();
    let mut parts = user.splitn(2, ':');

    if let Some(name) = parts.next() {
      policy.user_idname = IdName::parse(name);
    }
    if let Some(group) = parts.next() {
      policy.group_idnames = vec![IdName::parse(group)];
    }
    policy
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
  pub ambient: Vec<String>,
  pub bounding: Vec<String>,
  pub effective: Vec<String>,
  pub inheritable: Vec<String>,
  pub permitted: Vec<String>,
}

impl Capabilities {
  // Ambient stays empty, and inheritable is only filled for privileged containers
  pub fn new(privileged: bool, add: &[String], drop: &[String]) -> Self {
    let defaults =
      if privileged { config::DEFAULT_PRIVILEGED_CAPABILITIES } else { config::DEFAULT_UNPRIVILEGED_CAPABILITIES };

    let mut set: Vec<String> = defaults
      .iter()
      .map(|c| (*c).to_owned())
      .chain(add.iter().cloned())
      .filter(|c| !drop.contains(c))
      .collect();
    set.sort();
    set.dedup();

    Self {
      ambient: vec![],
      bounding: set.clone(),
      effective: set.clone(),
      inheritable: if privileged { set.clone() } else { vec![] },
      permitted: set,
    }
  }
}

// securityContext settings beyond `privileged`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecurityDefinition {
  pub run_as_user: Option<u64>,
  pub run_as_group: Option<u64>,
  pub add_capabilities: Vec<String>,
  pub drop_capabilities: Vec<String>,
  pub seccomp_profile_sha256: String,
  pub allow_privilege_escalation: bool,
}

impl SecurityDefinition {
  pub fn user(&self) -> UserPolicy {
    UserPolicy::from_ids(self.run_as_user, self.run_as_group)
  }

  pub fn capabilities(&self, privileged: bool) -> Capabilities {
    Capabilities::new(privileged, &self.add_capabilities, &self.drop_capabilities)
  }
}

const SECURITY_KEYS: &[&str] = &["runAsUser", "runAsGroup", "capabilities", "seccompProfile", "allowPrivilegeEscalation"];

fn malformed(container: &str, reason: String) -> PolicyError {
  PolicyError::MalformedField { container: container.to_owned(), field: "securityContext", reason }
}

fn id_field(container: &str, context: &Value, key: &str) -> PolicyResult<Option<u64>> {
  match field(context, key) {
    None => Ok(None),
    Some(value) => value
      .as_u64()
      .map(Some)
      .ok_or_else(|| malformed(container, format!("{} must be a non-negative integer, got {}", key, value))),
  }
}

fn capability_list(container: &str, capabilities: &Value, key: &str) -> PolicyResult<Vec<String>> {
  match field(capabilities, key) {
    None => Ok(vec![]),
    Some(Value::Array(items)) => items
      .iter()
      .map(|item| {
        item
          .as_str()
          .map(str::to_owned)
          .ok_or_else(|| malformed(container, format!("capabilities.{} can only contain strings", key)))
      })
      .collect(),
    Some(_) => Err(malformed(container, format!("capabilities.{} must be a list", key))),
  }
}

// Privileged flag and the remaining settings, which are only present when the
// context names at least one of them
pub fn parse_security_context(
  container: &str,
  context: Option<&Value>,
) -> PolicyResult<(Option<bool>, Option<SecurityDefinition>)> {
  let context = match context {
    Some(context) if context.is_object() => context,
    Some(Value::Null) | None => return Ok((None, None)),
    Some(_) => return Err(malformed(container, "must be an object".to_owned())),
  };

  let privileged = match field(context, "privileged") {
    Some(value) => {
      Some(as_flag(value).ok_or_else(|| malformed(container, format!("privileged must be a boolean, got {}", value)))?)
    }
    None => None,
  };

  if !SECURITY_KEYS.iter().any(|key| field(context, key).is_some()) {
    return Ok((privileged, None));
  }

  let (add_capabilities, drop_capabilities) = match field(context, "capabilities") {
    Some(capabilities) if capabilities.is_object() => (
      capability_list(container, capabilities, "add")?,
      capability_list(container, capabilities, "drop")?,
    ),
    Some(_) => return Err(malformed(container, "capabilities must be an object".to_owned())),
    None => (vec![], vec![]),
  };

  let allow_privilege_escalation = match field(context, "allowPrivilegeEscalation") {
    Some(value) => as_flag(value)
      .ok_or_else(|| malformed(container, format!("allowPrivilegeEscalation must be a boolean, got {}", value)))?,
    None => true,
  };

  let seccomp_profile_sha256 = match field(context, "seccompProfile") {
    Some(Value::String(encoded)) => seccomp_profile_sha256(encoded)?,
    Some(profile) => {
      tracing::debug!("container {} uses seccomp profile {}, which has no digest", container, profile);
      String::new()
    }
    None => String::new(),
  };

  let security = SecurityDefinition {
    run_as_user: id_field(container, context, "runAsUser")?,
    run_as_group: id_field(container, context, "runAsGroup")?,
    add_capabilities,
    drop_capabilities,
    seccomp_profile_sha256,
    allow_privilege_escalation,
  };

  Ok((privileged, Some(security)))
}

fn empty_array() -> Value {
  Value::Array(vec![])
}

fn zero() -> Value {
  Value::from(0)
}

// Field order is the order the digest is computed over
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeccompProfile {
  #[serde(default)]
  default_action: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  default_errno_ret: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  architectures: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  flags: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  listener_path: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  listener_metadata: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  syscalls: Option<Vec<Syscall>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Syscall {
  #[serde(default = "empty_array")]
  names: Value,
  #[serde(default)]
  action: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  errno_ret: Option<Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  args: Option<Vec<SyscallArg>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyscallArg {
  #[serde(default = "zero")]
  index: Value,
  #[serde(default = "zero")]
  value: Value,
  #[serde(skip_serializing_if = "Option::is_none")]
  value_two: Option<Value>,
  #[serde(default)]
  op: String,
}

// sha256 of the base64 seccomp profile, reduced to the fields the runtime enforces
pub fn seccomp_profile_sha256(encoded: &str) -> PolicyResult<String> {
  let bytes = STANDARD.decode(encoded.trim())?;
  let profile: SeccompProfile = serde_json::from_slice(&bytes).map_err(PolicyError::json("seccomp profile"))?;
  let canonical = serde_json::to_string(&profile).map_err(PolicyError::json("seccomp profile"))?;

  Ok(sha256_hex(&canonical))
}
