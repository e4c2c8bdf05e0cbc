use crate::config;
use crate::rules::EnvRule;
use crate::security::{ Capabilities, SecurityDefinition, UserPolicy };
use serde::{ Deserialize, Serialize };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
  User,
  Init,
  Infrastructure,
}

impl Default for ContainerRole {
  fn default() -> Self {
    Self::User
  }
}

// Volume sources a container group can mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
  AzureFile,
  Secret,
  EmptyDir,
  GitRepo,
  ConfigMap,
}

impl MountKind {
  pub fn from_key(key: &str) -> Option<Self> {
    match key.to_ascii_lowercase().as_str() {
      "azurefile" => Some(Self::AzureFile),
      "secret" => Some(Self::Secret),
      "emptydir" => Some(Self::EmptyDir),
      "gitrepo" => Some(Self::GitRepo),
      "configmap" => Some(Self::ConfigMap),
      _ => None,
    }
  }

  pub fn source(&self) -> &'static str {
    match self {
      Self::AzureFile => config::AZURE_FILE_SOURCE,
      Self::Secret => config::SECRET_SOURCE,
      Self::EmptyDir => config::EMPTY_DIR_SOURCE,
      Self::GitRepo => config::GIT_REPO_SOURCE,
      Self::ConfigMap => config::CONFIG_MAP_SOURCE,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MountDefinition {
  pub kind: MountKind,
  pub path: String,
  pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDefinition {
  pub name: String,
  pub image: String,
  pub command: Vec<String>,
  pub working_dir: Option<String>,
  pub env: Vec<EnvRule>,
  pub mounts: Vec<MountDefinition>,
  pub allow_elevated: bool,
  pub exec_processes: Vec<ExecProcess>,
  pub signals: Vec<i64>,
  pub security: Option<SecurityDefinition>,
}

// One container group with every expression resolved
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerGroupDefinition {
  pub name: String,
  pub containers: Vec<ContainerDefinition>,
  pub init_containers: Vec<ContainerDefinition>,
  pub isolation_type: Option<String>,
  pub cce_policy: Option<String>,
  pub infrastructure_svn: Option<String>,
  pub disable_stdio: bool,
  pub debug_mode: bool,
  pub exclude_default_fragments: bool,
  pub fragment_imports: Vec<Fragment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
  pub source: String,
  pub destination: String,
  #[serde(rename = "type")]
  pub kind: String,
  pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecProcess {
  pub command: Vec<String>,
  #[serde(default)]
  pub signals: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
  pub feed: String,
  pub includes: Vec<String>,
  pub issuer: String,
  pub minimum_svn: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyContainer {
  #[serde(skip_serializing_if = "String::is_empty")]
  pub id: String,
  #[serde(skip)]
  pub role: ContainerRole,
  pub layers: Vec<String>,
  pub command: Vec<String>,
  pub env_rules: Vec<EnvRule>,
  pub working_dir: String,
  pub mounts: Vec<Mount>,
  pub allow_elevated: bool,
  pub allow_stdio_access: bool,
  pub exec_processes: Vec<ExecProcess>,
  pub signals: Vec<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub user: Option<UserPolicy>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub capabilities: Option<Capabilities>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub seccomp_profile_sha256: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub no_new_privileges: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalFlags {
  pub allow_properties_access: bool,
  pub allow_dump_stacks: bool,
  pub allow_runtime_logging: bool,
  pub allow_environment_variable_dropping: bool,
  pub allow_unencrypted_scratch: bool,
}

impl Default for GlobalFlags {
  fn default() -> Self {
    Self {
      allow_properties_access: false,
      allow_dump_stacks: false,
      allow_runtime_logging: false,
      allow_environment_variable_dropping: true,
      allow_unencrypted_scratch: false,
    }
  }
}

impl GlobalFlags {
  pub fn debug() -> Self {
    Self {
      allow_properties_access: true,
      allow_dump_stacks: true,
      allow_runtime_logging: true,
      allow_environment_variable_dropping: true,
      allow_unencrypted_scratch: true,
    }
  }

  pub fn as_pairs(&self) -> [(&'static str, bool); 5] {
    [
      ("allow_properties_access", self.allow_properties_access),
      ("allow_dump_stacks", self.allow_dump_stacks),
      ("allow_runtime_logging", self.allow_runtime_logging),
      ("allow_environment_variable_dropping", self.allow_environment_variable_dropping),
      ("allow_unencrypted_scratch", self.allow_unencrypted_scratch),
    ]
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Policy {
  pub containers: Vec<PolicyContainer>,
  pub fragments: Vec<Fragment>,
  pub flags: GlobalFlags,
}

impl Policy {
  pub fn container(&self, id: &str) -> Option<&PolicyContainer> {
    self.containers.iter().find(|c| c.id == id)
  }
}

fn policy_mount(mount: &MountDefinition) -> Mount {
  Mount {
    source: mount.kind.source().to_owned(),
    destination: mount.path.clone(),
    kind: config::MOUNT_TYPE_BIND.to_owned(),
    options: config::mount_options(mount.read_only),
  }
}

fn policy_container(definition: &ContainerDefinition, role: ContainerRole, group: &ContainerGroupDefinition) -> PolicyContainer {
  let mut mounts: Vec<Mount> = definition.mounts.iter().map(policy_mount).collect();
  if !mounts.iter().any(|m| m.destination == config::RESOLV_CONF_PATH) {
    mounts.push(config::resolv_conf_mount());
  }

  let mut exec_processes = definition.exec_processes.clone();
  if group.debug_mode {
    exec_processes.extend(config::debug_exec_processes());
  }

  let security = definition.security.as_ref();

  PolicyContainer {
    id: definition.image.clone(),
    role,
    layers: vec![],
    command: definition.command.clone(),
    env_rules: definition.env.clone(),
    working_dir: definition.working_dir.clone().unwrap_or_default(),
    mounts,
    allow_elevated: definition.allow_elevated,
    allow_stdio_access: !group.disable_stdio,
    exec_processes,
    signals: definition.signals.clone(),
    user: security.map(SecurityDefinition::user),
    capabilities: security.map(|s| s.capabilities(definition.allow_elevated)),
    seccomp_profile_sha256: security.map(|s| s.seccomp_profile_sha256.clone()),
    no_new_privileges: security.map(|s| !s.allow_privilege_escalation),
  }
}

fn fragments(group: &ContainerGroupDefinition) -> Vec<Fragment> {
  let mut fragments = if group.exclude_default_fragments {
    vec![]
  } else {
    vec![config::default_fragment(group.infrastructure_svn.as_deref())]
  };

  for import in &group.fragment_imports {
    if !fragments.contains(import) {
      fragments.push(import.clone());
    }
  }

  fragments
}

pub fn build(group: &ContainerGroupDefinition) -> Policy {
  let mut containers: Vec<PolicyContainer> = group
    .containers
    .iter()
    .map(|c| policy_container(c, ContainerRole::User, group))
    .chain(group.init_containers.iter().map(|c| policy_container(c, ContainerRole::Init, group)))
    .collect();

  let mut pause = config::pause_container();
  pause.allow_stdio_access = !group.disable_stdio;
  containers.push(pause);

  let fragments = fragments(group);

  let flags = if group.debug_mode { GlobalFlags::debug() } else { GlobalFlags::default() };

  tracing::debug!(
    "built policy for {} with {} containers and {} fragments",
    group.name, containers.len(), fragments.len()
  );

  Policy { containers, fragments, flags }
}
