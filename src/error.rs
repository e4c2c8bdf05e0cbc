use crate::azurerm::expression::EvalError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
  #[error("failed to parse {what} as JSON: {source}")]
  Json {
    what: &'static str,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to read {path}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write {path}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("field [\"resources\"] is empty or cannot be found")]
  MissingResources,

  #[error("field [\"type\"] must contain one of [\"{0}\"]")]
  NoContainerGroups(&'static str),

  #[error("field [\"parameters\"] is empty or cannot be found in the parameter file")]
  MissingParameterSection,

  #[error("parameter [\"{0}\"] is set in the parameter file but not declared in the template")]
  UnknownParameter(String),

  #[error("container group {group} must declare a non-empty [\"{field}\"] list")]
  EmptyContainers { group: String, field: &'static str },

  #[error("container {container} has an empty or missing [\"image\"]")]
  EmptyImage { container: String },

  #[error("field [\"{field}\"] of container {container} is malformed: {reason}")]
  MalformedField {
    container: String,
    field: &'static str,
    reason: String,
  },

  #[error("environment variable with value {value} is missing a name")]
  MissingEnvName { value: String },

  #[error("environment variable {name} does not have a value")]
  MissingEnvValue { name: String },

  #[error("volume [\"{name}\"] not found in volume declarations")]
  VolumeNotFound { name: String },

  #[error(transparent)]
  Eval(#[from] EvalError),

  #[error("image {image} could not be resolved: {reason}")]
  ImageNotFound { image: String, reason: String },

  #[error("image {image} targets unsupported architecture {architecture}, only amd64 is supported")]
  UnsupportedArchitecture { image: String, architecture: String },

  #[error("registry request for {image} failed")]
  Registry {
    image: String,
    #[source]
    source: oci_client::errors::OciDistributionError,
  },

  #[error("failed to start the registry client runtime")]
  Runtime(#[source] std::io::Error),

  #[error("fragment import {feed} is invalid: {reason}")]
  InvalidFragment { feed: String, reason: String },

  #[error("container group {group} has no existing ccePolicy")]
  NoExistingPolicy { group: String },

  #[error("existing policy is not valid base64")]
  PolicyEncoding(#[from] base64::DecodeError),

  #[error("existing policy is not in the expected Rego format: {0}")]
  PolicyFormat(String),
}

pub type PolicyResult<T> = std::result::Result<T, PolicyError>;

impl PolicyError {
  pub fn json(what: &'static str) -> impl FnOnce(serde_json::Error) -> PolicyError {
    move |source| PolicyError::Json { what, source }
  }
}
