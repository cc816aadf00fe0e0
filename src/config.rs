use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub extraction: ExtractionConfig,
    pub llm: LlmSection,
    pub drive: DriveConfig,
    pub geocoder: GeocoderConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub notice_dir: String,
    pub public_dir: String,
    pub output_dir: String,
    /// Directory holding `summaries.json`, `addresses.json` and `short_links.json`.
    pub cache_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            notice_dir: "emails".to_string(),
            public_dir: "public_part_emails".to_string(),
            output_dir: ".".to_string(),
            cache_dir: ".".to_string(),
        }
    }
}

/// Fixed offsets, labels and limits used by the field locators.
///
/// Coordinates are page units with the origin at the top-left corner.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Appended to every normalized address when missing.
    pub locality: String,
    /// Number of leading pages searched for the address label.
    pub address_pages: usize,
    pub max_description_pages: usize,
    pub page_timeout_ms: u64,
    /// Horizontal window of the description region.
    pub region_x0: f64,
    pub region_x1: f64,
    /// Distance below the "Purpose of the application" label where capture starts.
    pub capture_offset: f64,
    /// Distance above "Enquiries" where capture stops.
    pub enquiries_margin: f64,
    /// Exclusive vertical window below "Closing date" holding the date value.
    pub closing_window_min: f64,
    pub closing_window_max: f64,
    pub truncate_marker: String,
    pub reference_pattern: String,
    /// Tagline remnants stripped from descriptions.
    pub boilerplate: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            locality: "Cape Town".to_string(),
            address_pages: 2,
            max_description_pages: 6,
            page_timeout_ms: 30_000,
            region_x0: 50.0,
            region_x1: 500.0,
            capture_offset: 10.0,
            enquiries_margin: 5.0,
            closing_window_min: 15.0,
            closing_window_max: 35.0,
            truncate_marker: "Viewing of Application Documents".to_string(),
            reference_pattern: r"No\.T\d+/\d+".to_string(),
            boilerplate: vec![
                ". progress possible. T".to_string(),
                ". Making progress possible. T".to_string(),
            ],
        }
    }
}

impl ExtractionConfig {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    #[default]
    Remote,
    Ollama,
    None,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub backend: LlmBackend,
    pub ollama: OllamaConfig,
    pub remote: RemoteConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "qwen3:8b".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub enabled: bool,
    /// Folder under which per-notice folders are created.
    pub parent_folder_id: Option<String>,
    pub credentials: String,
    pub token_cache: String,
    pub shortener_token_env: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            parent_folder_id: None,
            credentials: "credentials.json".to_string(),
            token_cache: "token.json".to_string(),
            shortener_token_env: "TINY_URL_TOKEN".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GeocoderConfig {
    pub enabled: bool,
    pub base_url: String,
    pub user_agent: String,
    pub delay_ms: u64,
    pub locality_suffix: String,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: "cibra-app".to_string(),
            delay_ms: 1000,
            locality_suffix: "Cape Town".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load `path` when it exists, otherwise fall back to the built-in defaults.
    pub fn load_or_default(
        path: impl AsRef<Path>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.as_ref().display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn cache_path(&self, file_name: &str) -> std::path::PathBuf {
        Path::new(&self.paths.cache_dir).join(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [extraction]
            locality = "Stellenbosch"

            [llm]
            backend = "ollama"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.extraction.locality, "Stellenbosch");
        assert_eq!(cfg.extraction.max_description_pages, 6);
        assert_eq!(cfg.extraction.closing_window_min, 15.0);
        assert_eq!(cfg.llm.backend, LlmBackend::Ollama);
        assert_eq!(cfg.paths.notice_dir, "emails");
        assert!(!cfg.drive.enabled);
    }

    #[test]
    fn test_page_timeout() {
        let cfg = ExtractionConfig {
            page_timeout_ms: 1500,
            ..Default::default()
        };
        assert_eq!(cfg.page_timeout(), Duration::from_millis(1500));
    }
}
