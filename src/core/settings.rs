use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::models::RetryPolicy;

pub const ENV_CONFIG: &str = "MODEL_CACHE_CONFIG";
const ENV_CACHE_DIRS: [&str; 2] = ["MODEL_CACHE_DIR", "LLAMA_CACHE"];
const ENV_ENDPOINTS: [&str; 2] = ["MODEL_ENDPOINT", "HF_ENDPOINT"];
const ENV_TOKEN: &str = "HF_TOKEN";
const ENV_OFFLINE: &str = "MODEL_CACHE_OFFLINE";

const DEFAULT_HUB_ENDPOINT: &str = "https://huggingface.co/";
// The hub only includes `ggufFile` in manifests for this agent.
const DEFAULT_USER_AGENT: &str = "llama-cpp";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct OciSettings {
    pub auth_url: String,
    pub registry_url: String,
    pub service: String,
    pub default_namespace: String,
}

impl Default for OciSettings {
    fn default() -> Self {
        Self {
            auth_url: "https://auth.docker.io/token".into(),
            registry_url: "https://registry-1.docker.io/".into(),
            service: "registry.docker.io".into(),
            default_namespace: "ai".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_base: u32,
    pub backoff_unit_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2,
            backoff_unit_ms: 1000,
        }
    }
}

impl RetrySettings {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_base: self.backoff_base,
            backoff_unit: Duration::from_millis(self.backoff_unit_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub cache_dir: PathBuf,
    pub hub_endpoint: String,
    pub oci: OciSettings,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    pub offline: bool,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    pub retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            hub_endpoint: DEFAULT_HUB_ENDPOINT.into(),
            oci: OciSettings::default(),
            user_agent: DEFAULT_USER_AGENT.into(),
            bearer_token: None,
            offline: false,
            headers: BTreeMap::new(),
            request_timeout_secs: None,
            retry: RetrySettings::default(),
        }
    }
}

impl Settings {
    /// Reads settings from `path` (defaults when the file is missing) and
    /// applies environment overrides on top.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = load_settings(path)?;
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Same as [`Settings::load`], with the file taken from
    /// `$MODEL_CACHE_CONFIG` when set.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(ENV_CONFIG) {
            Some(path) => Self::load(Path::new(&path)),
            None => {
                let mut settings = Self::default();
                settings.apply_env(|key| std::env::var(key).ok());
                Ok(settings)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
        }
        let serialized =
            serde_json::to_vec_pretty(self).context("serialize settings to json failed")?;
        fs::write(path, serialized).with_context(|| format!("write settings to {path:?}"))?;
        Ok(())
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| lookup(key).filter(|value| !value.trim().is_empty()))
        };

        if let Some(dir) = first(&ENV_CACHE_DIRS[..]) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = first(&ENV_ENDPOINTS[..]) {
            self.hub_endpoint = endpoint;
        }
        if let Some(token) = first(&[ENV_TOKEN]) {
            self.bearer_token = Some(token);
        }
        if let Some(flag) = first(&[ENV_OFFLINE]) {
            self.offline = matches!(flag.trim(), "1" | "true" | "TRUE" | "yes");
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        ensure_trailing_slash(&mut self.hub_endpoint);
        ensure_trailing_slash(&mut self.oci.registry_url);
    }

    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn header_list(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    #[must_use]
    pub fn cache_file(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }
}

fn ensure_trailing_slash(value: &mut String) {
    if !value.ends_with('/') {
        value.push('/');
    }
}

fn default_cache_dir() -> PathBuf {
    ProjectDirs::from("com", "ModelCache", "ModelCache")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("model-cache"))
}

fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    let mut parsed: Settings =
        serde_json::from_slice(&bytes).context("config json could not be parsed")?;
    parsed.normalize();
    Ok(parsed)
}
