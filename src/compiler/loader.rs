use std::fs;
use std::path::Path;

use anyhow::{Context as AnyhowContext, Result};

use crate::config::Settings;
use crate::dsl::Flow;
use crate::runtime::blueprint::Blueprint;

pub fn load_settings_from_yaml(file_path: &Path) -> Result<Settings> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read settings from {}", file_path.display()))?;

    let settings: Settings = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize settings from {}", file_path.display()))?;

    settings.validate()?;
    Ok(settings)
}

/// 从 YAML 加载 Flow 定义
pub fn load_flow_from_yaml(file_path: &Path) -> Result<Flow> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path.display()))?;

    let flow: Flow = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", file_path.display()))?;

    Ok(flow)
}

pub fn load_blueprint_from_json(file_path: &Path) -> Result<Blueprint> {
    let content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read blueprint from {}", file_path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to deserialize blueprint from {}", file_path.display()))
}
