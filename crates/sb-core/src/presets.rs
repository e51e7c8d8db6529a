use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::types::{GenerationParams, MemoryPolicy};

/// File suffix that marks an agent preset inside the agents directory.
pub const PRESET_SUFFIX: &str = ".agent.json";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("agents directory not found: {0}")]
    DirMissing(PathBuf),

    #[error("failed to read {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("malformed preset {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("preset {path} is missing required field 'name'")]
    MissingName { path: PathBuf },

    #[error("duplicate agent name '{0}'")]
    Duplicate(String),

    #[error("system prompt for agent '{agent}' not found at {path}")]
    PromptMissing { agent: String, path: PathBuf },
}

// ---------------------------------------------------------------------------
// AgentPreset
// ---------------------------------------------------------------------------

/// Immutable per-agent policy, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPreset {
    pub name: String,
    pub system_prompt: String,
    pub params_override: GenerationParams,
    pub memory_policy: MemoryPolicy,
    /// When set, the full response is parsed as JSON and only this field is
    /// sent on to speech synthesis.
    pub output_field: Option<String>,
}

impl AgentPreset {
    pub fn new(name: impl Into<String>, memory_policy: MemoryPolicy) -> Self {
        Self {
            name: normalize_name(&name.into()),
            system_prompt: String::new(),
            params_override: GenerationParams::default(),
            memory_policy,
            output_field: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params_override = params;
        self
    }

    pub fn with_output_field(mut self, field: impl Into<String>) -> Self {
        self.output_field = Some(field.into());
        self
    }
}

/// On-disk shape of a `*.agent.json` file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PresetFile {
    #[serde(default)]
    name: Option<String>,
    /// Path to a prompt text file, relative to the preset file.
    #[serde(default)]
    system_prompt: Option<PathBuf>,
    #[serde(default)]
    params_override: GenerationParams,
    #[serde(default)]
    memory_policy: MemoryPolicy,
    #[serde(default)]
    output_field: Option<String>,
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// PresetTable
// ---------------------------------------------------------------------------

/// Name -> preset mapping. Read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct PresetTable {
    presets: HashMap<String, Arc<AgentPreset>>,
}

impl PresetTable {
    /// Build a table, rejecting duplicate names.
    pub fn from_presets(presets: impl IntoIterator<Item = AgentPreset>) -> Result<Self, PresetError> {
        let mut map = HashMap::new();
        for mut preset in presets {
            preset.name = normalize_name(&preset.name);
            if map.contains_key(&preset.name) {
                return Err(PresetError::Duplicate(preset.name));
            }
            map.insert(preset.name.clone(), Arc::new(preset));
        }
        Ok(Self { presets: map })
    }

    /// Load every `*.agent.json` file in `dir`, in file-name order.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, PresetError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(PresetError::DirMissing(dir.to_path_buf()));
        }

        let entries = std::fs::read_dir(dir).map_err(|e| PresetError::Io {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(PRESET_SUFFIX))
            })
            .collect();
        files.sort();

        let mut presets = Vec::with_capacity(files.len());
        for path in files {
            let preset = load_file(&path)?;
            info!(agent = %preset.name, file = %path.display(), "loaded agent preset");
            presets.push(preset);
        }
        Self::from_presets(presets)
    }

    /// Resolve an agent by name (case-insensitive, surrounding whitespace ignored).
    pub fn get(&self, name: &str) -> Option<Arc<AgentPreset>> {
        self.presets.get(&normalize_name(name)).cloned()
    }

    /// Sorted list of agent names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.presets.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AgentPreset>> {
        self.presets.values()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

fn load_file(path: &Path) -> Result<AgentPreset, PresetError> {
    let text = std::fs::read_to_string(path).map_err(|e| PresetError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let raw: PresetFile = serde_json::from_str(&text).map_err(|e| PresetError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let name = raw
        .name
        .as_deref()
        .map(normalize_name)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PresetError::MissingName {
            path: path.to_path_buf(),
        })?;

    let system_prompt = match raw.system_prompt {
        Some(prompt_path) => {
            let resolved = if prompt_path.is_relative() {
                path.parent().unwrap_or_else(|| Path::new(".")).join(prompt_path)
            } else {
                prompt_path
            };
            if !resolved.is_file() {
                return Err(PresetError::PromptMissing {
                    agent: name,
                    path: resolved,
                });
            }
            debug!(agent = %name, prompt = %resolved.display(), "reading system prompt");
            std::fs::read_to_string(&resolved)
                .map_err(|e| PresetError::Io {
                    path: resolved.clone(),
                    reason: e.to_string(),
                })?
                .trim()
                .to_string()
        }
        None => String::new(),
    };

    Ok(AgentPreset {
        name,
        system_prompt,
        params_override: raw.params_override,
        memory_policy: raw.memory_policy,
        output_field: raw.output_field.filter(|f| !f.trim().is_empty()),
    })
}
