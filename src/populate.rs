use crate::config;
use crate::error::PolicyResult;
use crate::policy::{ ContainerRole, Policy };
use crate::rules::{ merge_missing, EnvRule };
use crate::security::UserPolicy;
use std::collections::HashMap;

// What policy generation needs to know about an image
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageContent {
  pub layers: Vec<String>,
  pub default_env_rules: Vec<EnvRule>,
  pub command: Vec<String>,
  pub working_dir: Option<String>,
  pub stop_signal: Option<String>,
  pub user: Option<String>,
}

pub trait ImageInspector {
  fn inspect(&self, image: &str) -> PolicyResult<ImageContent>;
}

// Fills in layers and image defaults for every user and init container
pub fn populate(mut policy: Policy, inspector: &dyn ImageInspector) -> PolicyResult<Policy> {
  let injected = config::injected_env_rules();
  let mut seen: HashMap<String, ImageContent> = HashMap::new();

  for container in policy.containers.iter_mut() {
    if container.role == ContainerRole::Infrastructure {
      continue;
    }

    if !seen.contains_key(&container.id) {
      tracing::info!("inspecting image {}", container.id);
      let content = inspector.inspect(&container.id)?;
      seen.insert(container.id.clone(), content);
    }
    let image = &seen[&container.id];

    container.layers = image.layers.clone();

    if container.command.is_empty() {
      container.command = image.command.clone();
    }

    if container.working_dir.is_empty() {
      container.working_dir = image.working_dir.clone().filter(|d| !d.is_empty()).unwrap_or_else(|| "/".to_owned());
    }

    let explicit = container.env_rules.len();
    merge_missing(&mut container.env_rules, &image.default_env_rules);
    merge_missing(&mut container.env_rules, &injected);

    tracing::debug!(
      "{}: {} explicit env rules, {} merged from defaults",
      container.id, explicit, container.env_rules.len() - explicit
    );

    if let Some(signal) = &image.stop_signal {
      match config::signal_number(signal) {
        Some(number) => container.signals = vec![number],
        None => tracing::warn!("{}: unknown stop signal {}", container.id, signal),
      }
    }

    // an explicit runAsUser or runAsGroup wins over the image's user
    if let (Some(user), Some(image_user)) = (container.user.as_mut(), image.user.as_deref()) {
      if *user == UserPolicy::default() && !image_user.is_empty() {
        *user = UserPolicy::from_image_user(image_user);
      }
    }
  }

  Ok(policy)
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::error::PolicyError;
  use crate::policy::{ self, tests::{ container, group } };
  use crate::security::SecurityDefinition;

  pub(crate) struct StaticInspector(pub HashMap<String, ImageContent>);

  impl ImageInspector for StaticInspector {
    fn inspect(&self, image: &str) -> PolicyResult<ImageContent> {
      self.0.get(image).cloned().ok_or_else(|| PolicyError::ImageNotFound {
        image: image.to_owned(),
        reason: "not in fixture".to_owned(),
      })
    }
  }

  fn python() -> ImageContent {
    ImageContent {
      layers: vec!["aaaa".to_owned(), "bbbb".to_owned()],
      default_env_rules: vec![
        EnvRule::string("PATH", "/usr/local/bin:/usr/bin"),
        EnvRule::string("LANG", "C.UTF-8"),
      ],
      command: vec!["python3".to_owned()],
      working_dir: Some("/app".to_owned()),
      ..ImageContent::default()
    }
  }

  fn inspector() -> StaticInspector {
    StaticInspector(vec![("python:3.6.14-slim-buster".to_owned(), python())].into_iter().collect())
  }

  #[test]
  fn test_populate() {
    let mut web = container("web", "python:3.6.14-slim-buster");
    web.command = vec![];
    web.env.push(EnvRule::string("PATH", "/customized/path/value"));

    let policy = populate(policy::build(&group(vec![web])), &inspector()).unwrap();
    let web = &policy.containers[0];

    assert_eq!(web.layers, vec!["aaaa", "bbbb"]);
    assert_eq!(web.command, vec!["python3"]);
    assert_eq!(web.working_dir, "/app");
    assert_eq!(&web.env_rules[..3], &[
      EnvRule::string("PORT", "8080"),
      EnvRule::string("PATH", "/customized/path/value"),
      EnvRule::string("LANG", "C.UTF-8"),
    ]);
    assert_eq!(web.env_rules.iter().filter(|r| r.name() == "PATH").count(), 1);
    assert_eq!(web.env_rules[3..].to_vec(), config::injected_env_rules());
    assert!(web.signals.is_empty());

    // the pause container is left alone
    assert_eq!(policy.containers[1], config::pause_container());
  }

  #[test]
  fn test_working_dir_fallback() {
    let mut content = python();
    content.working_dir = None;
    let inspector = StaticInspector(vec![("python:3.6.14-slim-buster".to_owned(), content)].into_iter().collect());

    let policy = populate(policy::build(&group(vec![container("web", "python:3.6.14-slim-buster")])), &inspector).unwrap();

    assert_eq!(policy.containers[0].working_dir, "/");
    assert_eq!(policy.containers[0].command, vec!["python3"]);
  }

  #[test]
  fn test_stop_signal() {
    let mut content = python();
    content.stop_signal = Some("SIGQUIT".to_owned());
    let inspector = StaticInspector(vec![("nginx:1.25".to_owned(), content)].into_iter().collect());

    let policy = populate(policy::build(&group(vec![container("web", "nginx:1.25")])), &inspector).unwrap();

    assert_eq!(policy.containers[0].signals, vec![3]);
    assert!(policy.containers[1].signals.is_empty());
  }

  #[test]
  fn test_image_user() {
    let mut content = python();
    content.user = Some("nginx:101".to_owned());
    let inspector = StaticInspector(vec![("nginx:1.25".to_owned(), content)].into_iter().collect());

    let mut defaulted = container("web", "nginx:1.25");
    defaulted.security = Some(SecurityDefinition { allow_privilege_escalation: true, ..SecurityDefinition::default() });
    let mut explicit = defaulted.clone();
    explicit.security = Some(SecurityDefinition { run_as_user: Some(0), ..SecurityDefinition::default() });

    let policy = populate(policy::build(&group(vec![defaulted, explicit])), &inspector).unwrap();

    assert_eq!(policy.containers[0].user, Some(UserPolicy::from_image_user("nginx:101")));
    assert_eq!(policy.containers[1].user.as_ref().map(|u| u.user_idname.pattern.as_str()), Some("0"));
  }

  #[test]
  fn test_unknown_image() {
    let policy = policy::build(&group(vec![container("web", "missing:latest")]));

    assert!(matches!(populate(policy, &inspector()), Err(PolicyError::ImageNotFound { .. })));
  }
}
