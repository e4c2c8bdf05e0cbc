use confcom_policygen::azurerm::expression::EvalError;
use confcom_policygen::config::{ self, GenerateOptions };
use confcom_policygen::confirm::{ AutoConfirm, ScriptedConfirmation };
use confcom_policygen::diff::{ DiffEntry, ValueChange };
use confcom_policygen::parser::extract_array;
use confcom_policygen::registry::ManifestInspector;
use confcom_policygen::rules::{ EnvRule, Strategy };
use confcom_policygen::serialize::{ self, OutputType };
use confcom_policygen::{
  diff_against_template, generate_from_input, generate_from_template, inject_policy, print_existing_policy, PolicyError,
};
use indoc::indoc;
use serde_json::{ json, Value };
use similar_asserts::assert_eq;
use std::io::Write;

const MANIFEST: &str = indoc! {r#"
  {
    "python:3.6.14-slim-buster": {
      "layers": ["aaaa", "bbbb"],
      "env": ["PATH=/usr/local/bin:/usr/bin", "LANG=C.UTF-8"],
      "command": ["python3"],
      "working_dir": "/app"
    },
    "myregistry.azurecr.io/python:retagged": {
      "layers": ["aaaa", "bbbb"],
      "env": ["PATH=/usr/local/bin:/usr/bin", "LANG=C.UTF-8"],
      "command": ["python3"],
      "working_dir": "/app"
    },
    "alpine:3.16": {
      "layers": ["cccc"],
      "env": ["PATH=/bin"],
      "command": ["/bin/sh"]
    },
    "nginx:1.25": {
      "layers": ["dddd"],
      "env": ["PATH=/usr/sbin:/usr/bin"],
      "command": ["/docker-entrypoint.sh", "nginx", "-g", "daemon off;"],
      "stop_signal": "SIGQUIT"
    }
  }
"#};

const INPUT: &str = indoc! {r#"
  {
    "version": "1.0",
    "containers": [
      {
        "name": "web",
        "containerImage": "python:3.6.14-slim-buster",
        "environmentVariables": [
          { "name": "PATH", "value": "/customized/path/value", "strategy": "string" },
          { "name": "TEST_REGEXP_ENV", "value": "test_regexp_env", "strategy": "string" }
        ],
        "command": ["python3", "app.py"],
        "mounts": [{ "mountType": "azureFile", "mountPath": "/mount/azurefile", "readonly": false }],
        "allowElevated": false
      }
    ]
  }
"#};

fn inspector() -> ManifestInspector {
  ManifestInspector::from_json(MANIFEST).unwrap()
}

fn container(image: &str, env: Value, mount_path: &str) -> Value {
  json!({
    "name": "web",
    "properties": {
      "image": image,
      "command": ["python3", "app.py"],
      "environmentVariables": env,
      "volumeMounts": [{ "name": "share", "mountPath": mount_path, "readOnly": false }],
      "securityContext": { "privileged": false }
    }
  })
}

fn group(name: &str, containers: Vec<Value>, cce_policy: Option<&str>) -> Value {
  let mut confidential = json!({ "isolationType": "SevSnp" });
  if let Some(policy) = cce_policy {
    confidential["ccePolicy"] = json!(policy);
  }

  json!({
    "type": "Microsoft.ContainerInstance/containerGroups",
    "name": name,
    "properties": {
      "containers": containers,
      "volumes": [{ "name": "share", "azureFile": { "shareName": "share" } }],
      "confidentialComputeProperties": confidential
    }
  })
}

fn template(groups: Vec<Value>) -> String {
  json!({
    "parameters": {
      "image": { "type": "string", "defaultValue": "python:3.6.14-slim-buster" },
      "wildcardParamValue": { "type": "string" }
    },
    "resources": groups
  })
  .to_string()
}

fn drift_env(a: bool) -> Value {
  if a {
    json!([
      { "name": "PATH", "value": "/customized/path/value" },
      { "name": "TEST_REGEXP_ENV", "value": "test_regexp_env" }
    ])
  } else {
    json!([
      { "name": "PATH", "value": "/customized/path/value" },
      { "name": "TEST_REGEXP_ENV", "value": "test_regexp_en" },
      { "name": "ENV_VALUE", "value": "input_value" }
    ])
  }
}

fn single(env: Value, mount_path: &str, cce_policy: Option<&str>) -> String {
  template(vec![group(
    "aci-test",
    vec![container("[parameters('image')]", env, mount_path)],
    cce_policy,
  )])
}

#[test]
fn test_template_and_input_agree() {
  let options = GenerateOptions::default();
  let from_template =
    generate_from_template(&single(drift_env(true), "/mount/azurefile", None), None, &options, &AutoConfirm(false), &inspector())
      .unwrap();
  let from_input = generate_from_input(INPUT, &options, &inspector()).unwrap();

  assert_eq!(from_template.len(), 1);
  assert_eq!(from_template[0].group, "aci-test");
  assert_eq!(from_template[0].policy, from_input);
}

#[test]
fn test_generated_container() {
  let policies = generate_from_template(
    &single(drift_env(true), "/mount/azurefile", None),
    None,
    &GenerateOptions::default(),
    &AutoConfirm(false),
    &inspector(),
  )
  .unwrap();
  let policy = &policies[0].policy;
  let web = &policy.containers[0];

  assert_eq!(web.id, "python:3.6.14-slim-buster");
  assert_eq!(web.layers, vec!["aaaa", "bbbb"]);
  assert_eq!(web.command, vec!["python3", "app.py"]);
  assert_eq!(web.working_dir, "/app");
  assert_eq!(web.env_rules[..2].to_vec(), vec![
    EnvRule::string("PATH", "/customized/path/value"),
    EnvRule::string("TEST_REGEXP_ENV", "test_regexp_env"),
  ]);
  assert_eq!(web.env_rules.iter().filter(|r| r.name() == "PATH").count(), 1);
  assert!(!web.allow_elevated);
  assert!(web.allow_stdio_access);
  assert_eq!(web.mounts.len(), 2);
  assert_eq!(web.mounts[0].source, config::AZURE_FILE_SOURCE);
  assert_eq!(web.mounts[0].options, vec!["rbind", "rshared", "rw"]);
  assert_eq!(web.mounts[1].destination, config::RESOLV_CONF_PATH);

  assert!(policy.containers[1].id.is_empty());
  assert_eq!(policy.containers[1].command, vec![config::PAUSE_COMMAND]);
  assert_eq!(policy.fragments, vec![config::default_fragment(None)]);
}

#[test]
fn test_retagged_image_has_same_content() {
  let text = template(vec![group(
    "aci-test",
    vec![
      container("python:3.6.14-slim-buster", drift_env(true), "/mount/azurefile"),
      container("myregistry.azurecr.io/python:retagged", drift_env(true), "/mount/azurefile"),
    ],
    None,
  )]);

  let policies = generate_from_template(&text, None, &GenerateOptions::default(), &AutoConfirm(false), &inspector()).unwrap();
  let mut original = policies[0].policy.containers[0].clone();
  let retagged = &policies[0].policy.containers[1];

  assert_eq!(retagged.id, "myregistry.azurecr.io/python:retagged");
  original.id = retagged.id.clone();
  assert_eq!(&original, retagged);
}

#[test]
fn test_infrastructure_svn() {
  let options = GenerateOptions { infrastructure_svn: Some("2.0.0".to_owned()), ..GenerateOptions::default() };
  let policies =
    generate_from_template(&single(drift_env(true), "/m", None), None, &options, &AutoConfirm(false), &inspector()).unwrap();

  assert_eq!(policies[0].policy.fragments[0].minimum_svn, "2.0.0");

  let rego = serialize::serialize(&policies[0].policy, OutputType::Raw, false, true).unwrap();
  let fragments: Value = serde_json::from_str(extract_array(&rego, "fragments").unwrap()).unwrap();
  assert_eq!(fragments[0]["minimum_svn"], json!("2.0.0"));
  assert_eq!(fragments[0]["feed"], json!(config::DEFAULT_FRAGMENT_FEED));
}

#[test]
fn test_init_containers_come_first_in_indexed_json() {
  let mut document: Value = serde_json::from_str(&single(drift_env(true), "/m", None)).unwrap();
  document["resources"][0]["properties"]["initContainers"] =
    json!([{ "name": "init", "properties": { "image": "alpine:3.16", "command": ["echo", "hi"] } }]);

  let policies =
    generate_from_template(&document.to_string(), None, &GenerateOptions::default(), &AutoConfirm(false), &inspector())
      .unwrap();
  let json = serialize::serialize(&policies[0].policy, OutputType::Raw, true, true).unwrap();
  let value: Value = serde_json::from_str(&json).unwrap();
  let elements = &value["containers"]["elements"];

  assert_eq!(value["containers"]["length"], json!(3));
  assert_eq!(elements["0"]["id"], json!("python:3.6.14-slim-buster"));
  assert_eq!(elements["1"]["id"], json!("alpine:3.16"));
  assert_eq!(elements["1"]["layers"]["elements"]["0"], json!("cccc"));
  assert!(elements["2"].get("id").is_none());
  assert_eq!(elements["2"]["command"]["elements"]["0"], json!("/pause"));
}

#[test]
fn test_stop_signal_from_image() {
  let text = template(vec![group("aci-test", vec![container("nginx:1.25", drift_env(true), "/m")], None)]);

  let policies = generate_from_template(&text, None, &GenerateOptions::default(), &AutoConfirm(false), &inspector()).unwrap();

  assert_eq!(policies[0].policy.containers[0].signals, vec![3]);
  assert!(policies[0].policy.containers[1].signals.is_empty());
}

const PYTHON_GROUP: &str = include_str!("data/python_group.json");
const PYTHON_GROUP_REGO: &str = include_str!("data/python_group.rego");
const PYTHON_IMAGES: &str = include_str!("data/python_images.json");

fn python_images() -> ManifestInspector {
  ManifestInspector::from_json(PYTHON_IMAGES).unwrap()
}

#[test]
fn test_generated_rego_matches_deployed_policy() {
  let policies =
    generate_from_template(PYTHON_GROUP, None, &GenerateOptions::default(), &AutoConfirm(false), &python_images()).unwrap();

  assert_eq!(policies[0].group, "simple-container-group");
  assert_eq!(serialize::serialize(&policies[0].policy, OutputType::Raw, false, true).unwrap(), PYTHON_GROUP_REGO);
}

#[test]
fn test_deployed_policy_diffs_clean() {
  let results =
    diff_against_template(PYTHON_GROUP, None, &GenerateOptions::default(), &AutoConfirm(false), &python_images()).unwrap();

  assert_eq!(results.len(), 1);
  assert!(results[0].1.diff.is_empty(), "{:?}", results[0].1.diff);
  assert!(results[0].1.is_valid);
}

#[test]
fn test_print_deployed_policy() {
  let existing = print_existing_policy(PYTHON_GROUP, None).unwrap();

  assert_eq!(existing, vec![("simple-container-group".to_owned(), PYTHON_GROUP_REGO.to_owned())]);
}

#[test]
fn test_groups_are_independent() {
  let text = template(vec![
    group("first", vec![container("python:3.6.14-slim-buster", drift_env(true), "/m")], None),
    group("second", vec![container("alpine:3.16", drift_env(false), "/m")], None),
  ]);

  let policies = generate_from_template(&text, None, &GenerateOptions::default(), &AutoConfirm(false), &inspector()).unwrap();
  let names: Vec<&str> = policies.iter().map(|p| p.group.as_str()).collect();
  let rendered: Vec<String> = policies
    .iter()
    .map(|p| serialize::serialize(&p.policy, OutputType::Default, false, true).unwrap())
    .collect();

  assert_eq!(names, vec!["first", "second"]);
  assert_ne!(rendered[0], rendered[1]);
  assert_eq!(policies[1].policy.containers[0].working_dir, "/");
}

#[test]
fn test_wildcard_prompts() {
  let env = json!([{ "name": "TEST_WILDCARD_ENV", "value": "[parameters('wildcardParamValue')]" }]);
  let text = single(env, "/m", None);

  let accept = ScriptedConfirmation::new(vec![true]);
  let policies = generate_from_template(&text, None, &GenerateOptions::default(), &accept, &inspector()).unwrap();
  let rule = &policies[0].policy.containers[0].env_rules[0];

  assert_eq!(accept.prompts(), vec!["Create a wildcard policy for the environment variable TEST_WILDCARD_ENV"]);
  assert_eq!(rule.pattern, "TEST_WILDCARD_ENV=.*");
  assert_eq!(rule.strategy, Strategy::Re2);

  let decline = ScriptedConfirmation::new(vec![false]);
  let policies = generate_from_template(&text, None, &GenerateOptions::default(), &decline, &inspector()).unwrap();

  assert!(!policies[0].policy.containers[0].env_rules.iter().any(|r| r.name() == "TEST_WILDCARD_ENV"));
}

#[test]
fn test_embedded_parameter_text_is_literal() {
  let env = json!([{ "name": "PORT", "value": "parameters('abc')" }]);
  let policies =
    generate_from_template(&single(env, "/m", None), None, &GenerateOptions::default(), &AutoConfirm(false), &inspector())
      .unwrap();

  assert_eq!(policies[0].policy.containers[0].env_rules[0], EnvRule::string("PORT", "parameters('abc')"));
}

#[test]
fn test_disable_stdio() {
  let options = GenerateOptions { disable_stdio: true, ..GenerateOptions::default() };
  let policies =
    generate_from_template(&single(drift_env(true), "/m", None), None, &options, &AutoConfirm(false), &inspector()).unwrap();

  assert!(policies[0].policy.containers.iter().all(|c| !c.allow_stdio_access));
}

#[test]
fn test_debug_mode() {
  let options = GenerateOptions { debug_mode: true, ..GenerateOptions::default() };
  let policies =
    generate_from_template(&single(drift_env(true), "/m", None), None, &options, &AutoConfirm(false), &inspector()).unwrap();
  let policy = &policies[0].policy;

  assert!(policy.flags.allow_dump_stacks);
  assert!(policy.flags.allow_runtime_logging);
  assert!(policy.containers[0].exec_processes.iter().any(|p| p.command == vec!["/bin/sh"]));
}

#[test]
fn test_diff_detects_drift() {
  let options = GenerateOptions::default();
  let original = generate_from_template(
    &single(drift_env(true), "/mount/azurefile", None),
    None,
    &options,
    &AutoConfirm(false),
    &inspector(),
  )
  .unwrap();
  let embedded = serialize::serialize(&original[0].policy, OutputType::Default, false, true).unwrap();

  let changed = single(drift_env(false), "/mount/azure", Some(&embedded));
  let results = diff_against_template(&changed, None, &options, &AutoConfirm(false), &inspector()).unwrap();
  let (name, result) = &results[0];

  assert_eq!(name, "aci-test");
  assert!(!result.is_valid);

  let entry = match &result.diff["python:3.6.14-slim-buster"] {
    DiffEntry::Changed(entry) => entry,
    other => panic!("unexpected entry {:?}", other),
  };
  assert_eq!(entry.values_changed["mounts"], vec![ValueChange {
    tested_value: json!("/mount/azure"),
    policy_value: json!("/mount/azurefile"),
  }]);
  assert_eq!(entry.env_rules, vec![
    "environment variable with rule 'TEST_REGEXP_ENV=test_regexp_en' does not match strings or regex in policy rules",
    "environment variable with rule 'ENV_VALUE=input_value' does not match strings or regex in policy rules",
  ]);

  let unchanged = single(drift_env(true), "/mount/azurefile", Some(&embedded));
  let results = diff_against_template(&unchanged, None, &options, &AutoConfirm(false), &inspector()).unwrap();
  assert!(results[0].1.is_valid);
}

#[test]
fn test_diff_without_policy_is_valid() {
  let results =
    diff_against_template(&single(drift_env(true), "/m", None), None, &GenerateOptions::default(), &AutoConfirm(false), &inspector())
      .unwrap();

  assert!(results[0].1.is_valid);
  assert!(results[0].1.diff.is_empty());
}

#[test]
fn test_inject_and_print_existing() {
  let text = single(drift_env(true), "/m", None);
  let policies = generate_from_template(&text, None, &GenerateOptions::default(), &AutoConfirm(false), &inspector()).unwrap();
  let encoded = serialize::serialize(&policies[0].policy, OutputType::Default, false, true).unwrap();
  let raw = serialize::serialize(&policies[0].policy, OutputType::Raw, false, true).unwrap();

  let injected = inject_policy(&text, 0, &encoded).unwrap();
  let existing = print_existing_policy(&injected, None).unwrap();

  assert_eq!(existing, vec![("aci-test".to_owned(), raw)]);

  assert!(matches!(print_existing_policy(&text, None), Err(PolicyError::NoExistingPolicy { .. })));
}

#[test]
fn test_manifest_file_and_parameter_file() {
  let dir = tempfile::tempdir().unwrap();
  let manifest_path = dir.path().join("images.json");
  std::fs::write(&manifest_path, MANIFEST).unwrap();

  let mut parameters = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
  write!(parameters, r#"{{"parameters": {{"image": {{"value": "alpine:3.16"}}}}}}"#).unwrap();
  let parameters = std::fs::read_to_string(parameters.path()).unwrap();

  let inspector = ManifestInspector::load(&manifest_path).unwrap();
  let policies = generate_from_template(
    &single(drift_env(true), "/m", None),
    Some(&parameters),
    &GenerateOptions::default(),
    &AutoConfirm(false),
    &inspector,
  )
  .unwrap();

  assert_eq!(policies[0].policy.containers[0].id, "alpine:3.16");
  assert_eq!(policies[0].policy.containers[0].layers, vec!["cccc"]);
}

#[test]
fn test_fatal_inputs() {
  let options = GenerateOptions::default();
  let generate = |text: &str, parameters: Option<&str>| {
    generate_from_template(text, parameters, &options, &AutoConfirm(false), &inspector())
  };

  assert!(matches!(generate(r#"{"resources": []}"#, None), Err(PolicyError::MissingResources)));
  assert!(matches!(
    generate(r#"{"resources": [{"type": "Microsoft.Storage/storageAccounts"}]}"#, None),
    Err(PolicyError::NoContainerGroups(_))
  ));
  assert!(matches!(
    generate(&single(drift_env(true), "/m", None), Some(r#"{"parameters": {"nope": {"value": 1}}}"#)),
    Err(PolicyError::UnknownParameter(name)) if name == "nope"
  ));
  assert!(matches!(
    generate(&single(json!([{ "name": "PORT" }]), "/m", None), None),
    Err(PolicyError::MissingEnvValue { .. })
  ));
  assert!(matches!(
    // serde_json writes keys sorted, so the mount reads {"mountPath", "name", "readOnly"}
    generate(&single(drift_env(true), "/m", None).replace(r#""name":"share","readOnly""#, r#""name":"other","readOnly""#), None),
    Err(PolicyError::VolumeNotFound { .. })
  ));
  assert!(matches!(
    generate(&single(json!([]), "/m", None).replace("python:3.6.14-slim-buster", "missing:latest"), None),
    Err(PolicyError::ImageNotFound { .. })
  ));
  // an image parameter with neither a default nor a parameter-file value
  assert!(matches!(
    generate(&single(json!([]), "/m", None).replace(r#""defaultValue":"python:3.6.14-slim-buster","#, ""), None),
    Err(PolicyError::Eval(EvalError::UnresolvedParameter(name))) if name == "image"
  ));
}
