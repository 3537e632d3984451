use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VIDHOOK_DATA_DIR";
pub const DEFAULT_PROVIDER_NAME: &str = "vidu";
pub const DEFAULT_WEBHOOK_PATH: &str = "/webhooks/vidu";
pub const DEFAULT_SECRETS_ENV_VAR: &str = "VIDHOOK_PROVIDER_SECRETS";
pub const DEFAULT_SIGNATURE_TOLERANCE_MS: u64 = 300_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub webhook: WebhookConfig,
    pub provider: ProviderConfig,
    pub secrets: SecretsConfig,
    pub media: MediaConfig,
    pub canvas: CanvasConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebhookConfig {
    /// Route the callback handler is mounted on.
    pub path: String,
    /// Fixed path the provider signs. When set, request-path reconstruction is skipped.
    pub canonical_path: Option<String>,
    /// Leading path segments a gateway may prepend (e.g. `prod`), stripped before signing.
    pub stage_prefixes: Vec<String>,
    pub signing_tag: String,
    pub tolerance_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecretsConfig {
    pub source: SecretSourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecretSourceConfig {
    File { path: PathBuf },
    Env { var: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MediaConfig {
    pub objects_dir: PathBuf,
    pub max_bytes: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CanvasConfig {
    pub derived_offset_x: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            webhook: WebhookConfig::default(),
            provider: ProviderConfig::default(),
            secrets: SecretsConfig::default(),
            media: MediaConfig::default(),
            canvas: CanvasConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_WEBHOOK_PATH.to_string(),
            canonical_path: None,
            stage_prefixes: Vec::new(),
            signing_tag: DEFAULT_PROVIDER_NAME.to_string(),
            tolerance_ms: DEFAULT_SIGNATURE_TOLERANCE_MS,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROVIDER_NAME.to_string(),
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            source: SecretSourceConfig::File {
                path: PathBuf::from("secrets.json"),
            },
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            objects_dir: PathBuf::from("objects"),
            max_bytes: 512 * 1024 * 1024,
            connect_timeout_secs: 15,
            request_timeout_secs: 300,
        }
    }
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            derived_offset_x: 400.0,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. VIDHOOK_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir if missing
/// - Writes default config.toml only if file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        let default_cfg = AppConfig::default();
        default_cfg.save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.webhook.path, "/webhooks/vidu");
        assert_eq!(cfg.webhook.canonical_path, None);
        assert_eq!(cfg.webhook.tolerance_ms, 300_000);
        assert_eq!(cfg.webhook.signing_tag, "vidu");
        assert_eq!(cfg.provider.name, "vidu");
        assert_eq!(
            cfg.secrets.source,
            SecretSourceConfig::File {
                path: PathBuf::from("secrets.json")
            }
        );
        assert_eq!(cfg.media.objects_dir, PathBuf::from("objects"));
        assert_eq!(cfg.canvas.derived_offset_x, 400.0);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.secrets.source = SecretSourceConfig::Env {
            var: "CUSTOM_SECRETS".to_string(),
        };
        original.webhook.stage_prefixes = vec!["prod".to_string()];
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_missing_sections_with_defaults() {
        let raw = "[webhook]\ntolerance_ms = 1000\n\n[secrets.source]\nkind = \"env\"\nvar = \"X\"\n";
        let decoded: AppConfig = toml::from_str(raw).expect("deserialize partial config");

        assert_eq!(decoded.webhook.tolerance_ms, 1000);
        assert_eq!(decoded.webhook.path, DEFAULT_WEBHOOK_PATH);
        assert_eq!(
            decoded.secrets.source,
            SecretSourceConfig::Env {
                var: "X".to_string()
            }
        );
        assert_eq!(decoded.server, ServerConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let path = unique_temp_config_path();
        let loaded = AppConfig::load_from_path(&path).expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let cli_path = Path::new("/custom");
        let result = data_dir(Some(cli_path));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = unique_temp_dir();
        initialize_data_dir(&temp).expect("initialize data dir");

        assert!(temp.exists());
        assert!(temp.join("config.toml").exists());

        fs::remove_dir_all(&temp).ok();
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = unique_temp_dir();
        fs::create_dir_all(&temp).expect("create temp dir");

        let cfg_path = temp.join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(&temp).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);

        fs::remove_dir_all(&temp).ok();
    }

    #[test]
    fn resolve_relative_to_handles_absolute_and_relative_paths() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }

    fn unique_temp_config_path() -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time moved backwards")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "vidhook-config-test-{}-{timestamp}.toml",
            std::process::id()
        ))
    }

    fn unique_temp_dir() -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time moved backwards")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "vidhook-config-test-{}-{timestamp}",
            std::process::id()
        ))
    }
}
