use serde::{Deserialize, Serialize};

/// Closed set of upstream streaming dialects. New providers are added here and
/// in [`crate::adapter`], never at call sites.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    ChatCompletion,
    Gemini,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PlatformKind,
    pub base_url: String,
    pub api_key_env: String,
    pub supported_models: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl PlatformConfig {
    /// First supported model, used when the request names none.
    pub fn default_model(&self) -> &str {
        self.supported_models
            .first()
            .map(String::as_str)
            .unwrap_or("qwen-flash")
    }

    /// Credential lookup from the process environment. Blank values count as unset.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformRegistry {
    pub platforms: Vec<PlatformConfig>,
    #[serde(default = "default_platform_id")]
    pub default_platform: String,
}

impl PlatformRegistry {
    pub fn builtin() -> Self {
        Self {
            platforms: vec![
                PlatformConfig {
                    id: "dashscope".to_string(),
                    name: "Aliyun DashScope".to_string(),
                    kind: PlatformKind::ChatCompletion,
                    base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
                    api_key_env: "DASHSCOPE_API_KEY".to_string(),
                    supported_models: vec![
                        "qwen-flash".to_string(),
                        "qwen-plus".to_string(),
                        "qwen-turbo".to_string(),
                        "qwen-max".to_string(),
                        "qwen3-30b-a3b-instruct-2507".to_string(),
                        "qwen3-235b-a22b-instruct-2507".to_string(),
                        "qwen3-14b".to_string(),
                        "qwen3-8b".to_string(),
                        "qwen3-4b".to_string(),
                        "qwen3-1.7b".to_string(),
                    ],
                    description: Some("Aliyun DashScope Qwen models".to_string()),
                },
                PlatformConfig {
                    id: "gemini".to_string(),
                    name: "Google Gemini".to_string(),
                    kind: PlatformKind::Gemini,
                    base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                    api_key_env: "GEMINI_API_KEY".to_string(),
                    supported_models: vec![
                        "gemini-2.5-flash".to_string(),
                        "gemini-2.5-pro".to_string(),
                    ],
                    description: Some("Google Gemini models".to_string()),
                },
            ],
            default_platform: default_platform_id(),
        }
    }

    pub fn load(path: &str) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| format!("platforms_read_failed: {err}"))?;
        let registry: Self = serde_json::from_str(&raw)
            .map_err(|err| format!("platforms_parse_failed: {err}"))?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<(), String> {
        if self.platforms.is_empty() {
            return Err("platforms_empty".to_string());
        }
        if self.get(&self.default_platform).is_none() {
            return Err(format!(
                "default_platform_unknown: {}",
                self.default_platform
            ));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&PlatformConfig> {
        self.platforms.iter().find(|p| p.id == id)
    }

    pub fn default_platform(&self) -> &str {
        &self.default_platform
    }
}

fn default_platform_id() -> String {
    "dashscope".to_string()
}
