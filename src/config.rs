use crate::policy::{ ContainerRole, ExecProcess, Fragment, Mount, PolicyContainer };
use crate::rules::EnvRule;

pub const CONTAINER_GROUP_TYPE: &str = "Microsoft.ContainerInstance/containerGroups";

pub const API_SVN: &str = "0.10.0";
pub const FRAMEWORK_SVN: &str = "0.1.0";

pub const DEFAULT_FRAGMENT_FEED: &str = "mcr.microsoft.com/aci/aci-cc-infra-fragment";
pub const DEFAULT_FRAGMENT_ISSUER: &str =
  "did:x509:0:sha256:I__iuL25oXEVFdTP_aBLx_eT1RPHbCQ_ECBQfYZpt9s::eku:1.3.6.1.4.1.311.76.59.1.3";
pub const DEFAULT_FRAGMENT_MINIMUM_SVN: &str = "1.0.0";

// Tag that opts a container group out of the default fragment
pub const ZERO_SIDECAR_TAG: &str = "Annotate-zero-sidecar";

pub const PAUSE_COMMAND: &str = "/pause";
const PAUSE_CONTAINER_LAYER: &str = "16b514057a06ad665f92c02863aca074fd5976c755d26bff16365299169e8415";

pub const MOUNT_TYPE_BIND: &str = "bind";
pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";
pub const CONFIG_MAP_PATH: &str = "/mnt/configmap";

pub const AZURE_FILE_SOURCE: &str = "sandbox:///tmp/atlas/azureFileVolume/.+";
pub const SECRET_SOURCE: &str = "sandbox:///tmp/atlas/secretsVolume/.+";
pub const EMPTY_DIR_SOURCE: &str = "sandbox:///tmp/atlas/emptydir/.+";
pub const GIT_REPO_SOURCE: &str = "sandbox:///tmp/atlas/gitRepoVolume/.+";
pub const CONFIG_MAP_SOURCE: &str = "sandbox:///tmp/atlas/configmap/.+";
pub const RESOLV_CONF_SOURCE: &str = "sandbox:///tmp/atlas/resolvconf/.+";

const DEBUG_SHELLS: &[&str] = &["/bin/sh", "/bin/bash"];

// Set by the guest agent
const OPENGCS_ENV_RULES: &[(&str, &str)] = &[("TERM", "xterm")];

// name and value regexes of variables the platform may set at runtime
const FABRIC_ENV_RULES: &[(&str, &str)] = &[
  ("((?i)FABRIC)_.+", ".+"),
  ("HOSTNAME", ".+"),
  ("T(E)?MP", ".+"),
  ("FabricPackageFileName", ".+"),
  ("HostedServiceName", ".+"),
];

const MANAGED_IDENTITY_ENV_RULES: &[(&str, &str)] = &[
  ("IDENTITY_API_VERSION", ".+"),
  ("IDENTITY_HEADER", ".+"),
  ("IDENTITY_SERVER_THUMBPRINT", ".+"),
];

const RESTART_ENV_RULES: &[(&str, &str)] = &[("azurecontainerinstance_restarted_by", ".+")];

pub const DEFAULT_UNPRIVILEGED_CAPABILITIES: &[&str] = &[
  "CAP_AUDIT_WRITE",
  "CAP_CHOWN",
  "CAP_DAC_OVERRIDE",
  "CAP_FOWNER",
  "CAP_FSETID",
  "CAP_KILL",
  "CAP_MKNOD",
  "CAP_NET_BIND_SERVICE",
  "CAP_NET_RAW",
  "CAP_SETFCAP",
  "CAP_SETGID",
  "CAP_SETPCAP",
  "CAP_SETUID",
  "CAP_SYS_CHROOT",
];

pub const DEFAULT_PRIVILEGED_CAPABILITIES: &[&str] = &[
  "CAP_AUDIT_CONTROL",
  "CAP_AUDIT_READ",
  "CAP_AUDIT_WRITE",
  "CAP_BLOCK_SUSPEND",
  "CAP_BPF",
  "CAP_CHECKPOINT_RESTORE",
  "CAP_CHOWN",
  "CAP_DAC_OVERRIDE",
  "CAP_DAC_READ_SEARCH",
  "CAP_FOWNER",
  "CAP_FSETID",
  "CAP_IPC_LOCK",
  "CAP_IPC_OWNER",
  "CAP_KILL",
  "CAP_LEASE",
  "CAP_LINUX_IMMUTABLE",
  "CAP_MAC_ADMIN",
  "CAP_MAC_OVERRIDE",
  "CAP_MKNOD",
  "CAP_NET_ADMIN",
  "CAP_NET_BIND_SERVICE",
  "CAP_NET_BROADCAST",
  "CAP_NET_RAW",
  "CAP_PERFMON",
  "CAP_SETFCAP",
  "CAP_SETGID",
  "CAP_SETPCAP",
  "CAP_SETUID",
  "CAP_SYSLOG",
  "CAP_SYS_ADMIN",
  "CAP_SYS_BOOT",
  "CAP_SYS_CHROOT",
  "CAP_SYS_MODULE",
  "CAP_SYS_NICE",
  "CAP_SYS_PACCT",
  "CAP_SYS_PTRACE",
  "CAP_SYS_RAWIO",
  "CAP_SYS_RESOURCE",
  "CAP_SYS_TIME",
  "CAP_SYS_TTY_CONFIG",
  "CAP_WAKE_ALARM",
];

const SIGNALS: &[(&str, i64)] = &[
  ("SIGHUP", 1),
  ("SIGINT", 2),
  ("SIGQUIT", 3),
  ("SIGILL", 4),
  ("SIGTRAP", 5),
  ("SIGABRT", 6),
  ("SIGIOT", 6),
  ("SIGBUS", 7),
  ("SIGFPE", 8),
  ("SIGKILL", 9),
  ("SIGUSR1", 10),
  ("SIGSEGV", 11),
  ("SIGUSR2", 12),
  ("SIGPIPE", 13),
  ("SIGALRM", 14),
  ("SIGTERM", 15),
  ("SIGSTKFLT", 16),
  ("SIGCHLD", 17),
  ("SIGCONT", 18),
  ("SIGSTOP", 19),
  ("SIGTSTP", 20),
  ("SIGTTIN", 21),
  ("SIGTTOU", 22),
  ("SIGURG", 23),
  ("SIGXCPU", 24),
  ("SIGXFSZ", 25),
  ("SIGVTALRM", 26),
  ("SIGPROF", 27),
  ("SIGWINCH", 28),
  ("SIGIO", 29),
  ("SIGPOLL", 29),
  ("SIGPWR", 30),
  ("SIGSYS", 31),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
  pub infrastructure_svn: Option<String>,
  pub disable_stdio: bool,
  pub debug_mode: bool,
  pub exclude_default_fragments: bool,
  // appended after the default fragment of every group
  pub fragment_imports: Vec<Fragment>,
}

pub fn default_fragment(minimum_svn: Option<&str>) -> Fragment {
  Fragment {
    feed: DEFAULT_FRAGMENT_FEED.to_owned(),
    includes: vec!["containers".to_owned()],
    issuer: DEFAULT_FRAGMENT_ISSUER.to_owned(),
    minimum_svn: minimum_svn.unwrap_or(DEFAULT_FRAGMENT_MINIMUM_SVN).to_owned(),
  }
}

pub fn mount_options(read_only: bool) -> Vec<String> {
  vec!["rbind".to_owned(), "rshared".to_owned(), if read_only { "ro" } else { "rw" }.to_owned()]
}

pub fn resolv_conf_mount() -> Mount {
  Mount {
    source: RESOLV_CONF_SOURCE.to_owned(),
    destination: RESOLV_CONF_PATH.to_owned(),
    kind: MOUNT_TYPE_BIND.to_owned(),
    options: mount_options(false),
  }
}

pub fn debug_exec_processes() -> Vec<ExecProcess> {
  DEBUG_SHELLS
    .iter()
    .map(|shell| ExecProcess { command: vec![(*shell).to_owned()], signals: vec![] })
    .collect()
}

// SIGQUIT, QUIT or 3
pub fn signal_number(signal: &str) -> Option<i64> {
  let upper = signal.trim().to_ascii_uppercase();
  if let Ok(number) = upper.parse() {
    return Some(number);
  }

  let name = if upper.starts_with("SIG") { upper } else { format!("SIG{}", upper) };
  SIGNALS.iter().find(|(known, _)| *known == name).map(|(_, number)| *number)
}

// Rules the platform may set on any user container at runtime
pub fn injected_env_rules() -> Vec<EnvRule> {
  let strings = OPENGCS_ENV_RULES.iter().map(|(name, value)| EnvRule::string(name, value));
  let regexes = FABRIC_ENV_RULES
    .iter()
    .chain(MANAGED_IDENTITY_ENV_RULES)
    .chain(RESTART_ENV_RULES)
    .map(|(name, value)| EnvRule::re2(name, value));

  strings.chain(regexes).collect()
}

// The sandbox housekeeping container appended to every policy, it has no id
pub fn pause_container() -> PolicyContainer {
  PolicyContainer {
    id: String::new(),
    role: ContainerRole::Infrastructure,
    layers: vec![PAUSE_CONTAINER_LAYER.to_owned()],
    command: vec![PAUSE_COMMAND.to_owned()],
    env_rules: vec![
      EnvRule::string("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin").required(true),
      EnvRule::string("TERM", "xterm"),
    ],
    working_dir: "/".to_owned(),
    mounts: vec![],
    allow_elevated: false,
    allow_stdio_access: true,
    exec_processes: vec![],
    signals: vec![],
    ..PolicyContainer::default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_fragment() {
    assert_eq!(default_fragment(None).minimum_svn, "1.0.0");
    assert_eq!(default_fragment(Some("2.0.0")).minimum_svn, "2.0.0");
    assert_eq!(default_fragment(None).includes, vec!["containers"]);
  }

  #[test]
  fn test_mount_options() {
    assert_eq!(mount_options(true), vec!["rbind", "rshared", "ro"]);
    assert_eq!(mount_options(false), vec!["rbind", "rshared", "rw"]);
  }

  #[test]
  fn test_injected_env_rules() {
    let patterns: Vec<String> = injected_env_rules().iter().map(ToString::to_string).collect();

    assert_eq!(patterns, vec![
      "TERM=xterm (string)",
      "((?i)FABRIC)_.+=.+ (re2)",
      "HOSTNAME=.+ (re2)",
      "T(E)?MP=.+ (re2)",
      "FabricPackageFileName=.+ (re2)",
      "HostedServiceName=.+ (re2)",
      "IDENTITY_API_VERSION=.+ (re2)",
      "IDENTITY_HEADER=.+ (re2)",
      "IDENTITY_SERVER_THUMBPRINT=.+ (re2)",
      "azurecontainerinstance_restarted_by=.+ (re2)",
    ]);
    assert!(injected_env_rules().iter().all(|r| !r.required));
    assert!(!injected_env_rules().iter().any(|r| r.name() == "PATH"));
  }

  #[test]
  fn test_injected_rules_admit_runtime_values() {
    let rules = injected_env_rules();
    let admitted = |pattern: &str| rules.iter().any(|r| r.admits(pattern));

    assert!(admitted("Fabric_NodeName=node-0"));
    assert!(admitted("fabric_id=1"));
    assert!(admitted("TMP=/tmp"));
    assert!(admitted("TEMP=/tmp"));
    assert!(!admitted("PATH=/usr/bin"));
  }

  #[test]
  fn test_signal_number() {
    assert_eq!(signal_number("SIGQUIT"), Some(3));
    assert_eq!(signal_number("quit"), Some(3));
    assert_eq!(signal_number("15"), Some(15));
    assert_eq!(signal_number("SIGNOPE"), None);
  }

  #[test]
  fn test_pause_container_has_no_id() {
    let pause = pause_container();

    assert!(pause.id.is_empty());
    assert_eq!(pause.command, vec![PAUSE_COMMAND]);
    assert!(pause.allow_stdio_access);
    assert!(!pause.allow_elevated);
  }
}
