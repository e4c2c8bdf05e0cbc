use crate::error::{ PolicyError, PolicyResult };
use crate::populate::{ ImageContent, ImageInspector };
use crate::rules::EnvRule;
use oci_client::client::{ linux_amd64_resolver, ClientConfig, ClientProtocol };
use oci_client::errors::OciDistributionError;
use oci_client::secrets::RegistryAuth;
use oci_client::{ Client, Reference };
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

const SUPPORTED_ARCHITECTURE: &str = "amd64";

#[derive(Debug, Default, Deserialize)]
struct ContainerConfig {
  #[serde(rename = "Entrypoint")]
  entrypoint: Option<Vec<String>>,
  #[serde(rename = "Cmd")]
  cmd: Option<Vec<String>>,
  #[serde(rename = "WorkingDir")]
  working_dir: Option<String>,
  #[serde(rename = "Env")]
  env: Option<Vec<String>>,
  #[serde(rename = "StopSignal")]
  stop_signal: Option<String>,
  #[serde(rename = "User")]
  user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RootFs {
  diff_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ImageConfigBlob {
  architecture: Option<String>,
  config: Option<ContainerConfig>,
  rootfs: RootFs,
}

fn check_architecture(image: &str, architecture: Option<&str>) -> PolicyResult<()> {
  match architecture {
    Some(architecture) if architecture != SUPPORTED_ARCHITECTURE => Err(PolicyError::UnsupportedArchitecture {
      image: image.to_owned(),
      architecture: architecture.to_owned(),
    }),
    _ => Ok(()),
  }
}

// KEY=VALUE entries of an image config
pub fn image_env_rules(env: &[String]) -> Vec<EnvRule> {
  env
    .iter()
    .map(|entry| match entry.split_once('=') {
      Some((name, value)) => EnvRule::string(name, value),
      None => EnvRule::string(entry, ""),
    })
    .collect()
}

fn content_from_config(image: &str, blob: ImageConfigBlob) -> PolicyResult<ImageContent> {
  check_architecture(image, blob.architecture.as_deref())?;

  let config = blob.config.unwrap_or_default();
  let command = config
    .entrypoint
    .unwrap_or_default()
    .into_iter()
    .chain(config.cmd.unwrap_or_default())
    .collect();

  Ok(ImageContent {
    // diff ids hash the uncompressed layers, so they do not depend on where the image is stored
    layers: blob
      .rootfs
      .diff_ids
      .iter()
      .map(|id| id.trim_start_matches("sha256:").to_owned())
      .collect(),
    default_env_rules: image_env_rules(&config.env.unwrap_or_default()),
    command,
    working_dir: config.working_dir.filter(|d| !d.is_empty()),
    stop_signal: config.stop_signal.filter(|s| !s.is_empty()),
    user: config.user.filter(|u| !u.is_empty()),
  })
}

// Anonymous pulls of the manifest and config blob. Multi-platform indexes
// resolve to linux/amd64.
pub struct RegistryInspector {
  client: Client,
  runtime: tokio::runtime::Runtime,
}

impl RegistryInspector {
  pub fn new() -> PolicyResult<Self> {
    let config = ClientConfig {
      protocol: ClientProtocol::Https,
      platform_resolver: Some(Box::new(linux_amd64_resolver)),
      connect_timeout: Some(std::time::Duration::from_secs(30)),
      ..Default::default()
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .map_err(PolicyError::Runtime)?;

    Ok(Self { client: Client::new(config), runtime })
  }
}

fn registry_error(image: &str, source: OciDistributionError) -> PolicyError {
  match source {
    OciDistributionError::ImageManifestNotFoundError(reason) => {
      PolicyError::ImageNotFound { image: image.to_owned(), reason }
    }
    OciDistributionError::UnauthorizedError { url } => PolicyError::ImageNotFound {
      image: image.to_owned(),
      reason: format!("{} refused anonymous access", url),
    },
    source => PolicyError::Registry { image: image.to_owned(), source },
  }
}

impl ImageInspector for RegistryInspector {
  fn inspect(&self, image: &str) -> PolicyResult<ImageContent> {
    let reference: Reference = image.parse().map_err(|e| PolicyError::ImageNotFound {
      image: image.to_owned(),
      reason: format!("invalid image reference: {}", e),
    })?;

    tracing::debug!("pulling manifest and config of {}", reference.whole());
    let (_, digest, config) = self
      .runtime
      .block_on(self.client.pull_manifest_and_config(&reference, &RegistryAuth::Anonymous))
      .map_err(|e| registry_error(image, e))?;
    tracing::debug!("{} resolved to {}", image, digest);

    let blob: ImageConfigBlob = serde_json::from_str(&config).map_err(PolicyError::json("image config"))?;
    content_from_config(image, blob)
  }
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestEntry {
  layers: Vec<String>,
  #[serde(default)]
  env: Vec<String>,
  #[serde(default)]
  command: Vec<String>,
  working_dir: Option<String>,
  architecture: Option<String>,
  #[serde(default)]
  stop_signal: Option<String>,
  #[serde(default)]
  user: Option<String>,
}

// Offline image content keyed by image reference
#[derive(Debug, Clone)]
pub struct ManifestInspector {
  images: HashMap<String, ManifestEntry>,
}

impl ManifestInspector {
  pub fn from_json(text: &str) -> PolicyResult<Self> {
    let images = serde_json::from_str(text).map_err(PolicyError::json("image manifest"))?;

    Ok(Self { images })
  }

  pub fn load(path: &Path) -> PolicyResult<Self> {
    let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Read { path: path.to_owned(), source })?;

    Self::from_json(&text)
  }
}

impl ImageInspector for ManifestInspector {
  fn inspect(&self, image: &str) -> PolicyResult<ImageContent> {
    let entry = self.images.get(image).ok_or_else(|| PolicyError::ImageNotFound {
      image: image.to_owned(),
      reason: "not listed in the image manifest".to_owned(),
    })?;

    check_architecture(image, entry.architecture.as_deref())?;

    Ok(ImageContent {
      layers: entry.layers.clone(),
      default_env_rules: image_env_rules(&entry.env),
      command: entry.command.clone(),
      working_dir: entry.working_dir.clone(),
      stop_signal: entry.stop_signal.clone(),
      user: entry.user.clone(),
    })
  }
}
