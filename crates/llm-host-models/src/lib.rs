//! Structured settings, session configuration and response types shared by the
//! host core and its bindings. Field names follow the host object shapes
//! (`modelPath`, `maxNumTokens`, `topK`, ...).

use serde::{Deserialize, Serialize};

/// Token budget used when the host leaves `maxNumTokens` unset.
pub const DEFAULT_MAX_NUM_TOKENS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferredBackend {
    #[default]
    Default,
    Gpu,
    Cpu,
}

impl PreferredBackend {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Default => 0,
            Self::Gpu => 1,
            Self::Cpu => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationDataType {
    #[default]
    Default,
    Float32,
    Float16,
    Int16,
    Int8,
}

impl ActivationDataType {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Default => 0,
            Self::Float32 => 1,
            Self::Float16 => 2,
            Self::Int16 => 3,
            Self::Int8 => 4,
        }
    }
}

/// Engine settings. Immutable once the engine exists.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSettings {
    pub model_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_encoder_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_adapter_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_images: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_data_type: Option<ActivationDataType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_backend: Option<PreferredBackend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_audio_modality: Option<bool>,
}

impl ModelSettings {
    pub fn new(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    pub fn with_max_num_tokens(mut self, max_num_tokens: usize) -> Self {
        self.max_num_tokens = Some(max_num_tokens);
        self
    }

    pub fn effective_max_num_tokens(&self) -> usize {
        self.max_num_tokens.unwrap_or(DEFAULT_MAX_NUM_TOKENS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
}

/// Sampling and modality configuration of a session. Unset fields are left
/// to the native defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_templates: Option<PromptTemplates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_vision_modality: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_audio_modality: Option<bool>,
}

impl SessionConfig {
    /// Overlays every field set in `update`; unset fields keep their value.
    pub fn merged(&self, update: &RuntimeConfig) -> Self {
        let mut next = self.clone();
        if update.top_k.is_some() {
            next.top_k = update.top_k;
        }
        if update.top_p.is_some() {
            next.top_p = update.top_p;
        }
        if update.temperature.is_some() {
            next.temperature = update.temperature;
        }
        if update.prompt_templates.is_some() {
            next.prompt_templates = update.prompt_templates.clone();
        }
        next
    }
}

/// Partial update accepted while a session is idle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_templates: Option<PromptTemplates>,
}

impl RuntimeConfig {
    pub fn is_empty(&self) -> bool {
        self.top_k.is_none()
            && self.top_p.is_none()
            && self.temperature.is_none()
            && self.prompt_templates.is_none()
    }
}

/// Result of a prediction, or one streamed chunk of it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Response {
    pub candidates: Vec<String>,
    pub done: bool,
}

impl Response {
    pub fn new(candidates: Vec<String>, done: bool) -> Self {
        Self { candidates, done }
    }

    pub fn first(&self) -> Option<&str> {
        self.candidates.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ActivationDataType, ModelSettings, PreferredBackend, PromptTemplates, RuntimeConfig,
        SessionConfig, DEFAULT_MAX_NUM_TOKENS,
    };

    #[test]
    fn model_settings_parse_host_shape() {
        let settings: ModelSettings = serde_json::from_str(
            r#"{"modelPath":"m.bin","maxNumTokens":512,"preferredBackend":"gpu","activationDataType":"float16"}"#,
        )
        .expect("parse settings");

        assert_eq!(settings.model_path, "m.bin");
        assert_eq!(settings.effective_max_num_tokens(), 512);
        assert_eq!(settings.preferred_backend, Some(PreferredBackend::Gpu));
        assert_eq!(settings.activation_data_type.map(|a| a.as_raw()), Some(2));
        assert!(settings.max_num_images.is_none());
    }

    #[test]
    fn unset_token_budget_falls_back_to_default() {
        let settings = ModelSettings::new("m.bin");
        assert_eq!(settings.effective_max_num_tokens(), DEFAULT_MAX_NUM_TOKENS);
        assert_eq!(ActivationDataType::default().as_raw(), 0);
    }

    #[test]
    fn runtime_update_only_touches_set_fields() {
        let base = SessionConfig {
            top_k: Some(40),
            temperature: Some(0.8),
            random_seed: Some(7),
            ..SessionConfig::default()
        };
        let update = RuntimeConfig {
            temperature: Some(0.2),
            prompt_templates: Some(PromptTemplates {
                system_instruction: Some("be brief".to_string()),
                ..PromptTemplates::default()
            }),
            ..RuntimeConfig::default()
        };

        let merged = base.merged(&update);
        assert_eq!(merged.top_k, Some(40));
        assert_eq!(merged.temperature, Some(0.2));
        assert_eq!(merged.random_seed, Some(7));
        assert_eq!(
            merged
                .prompt_templates
                .and_then(|t| t.system_instruction)
                .as_deref(),
            Some("be brief")
        );
        assert!(RuntimeConfig::default().is_empty());
    }
}
