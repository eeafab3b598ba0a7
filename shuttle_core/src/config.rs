use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that turns on tracing of normalized text.
pub const DEBUG_ENV_VAR: &str = "SHUTTLE_DEBUG";

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    StdIn,
    File {
        template: String,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CommandEngineSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    2000
}

impl Default for CommandEngineSettings {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string(), "-".to_string()],
            input_delivery: ConfigInputDelivery::StdIn,
            timeout_ms: default_timeout_ms(),
            working_dir: None,
        }
    }
}

/// File descriptors of the four pre-established protocol streams and the
/// capacity of the payload buffer.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProtocolSettings {
    #[serde(default = "default_control_read_fd")]
    pub control_read_fd: i32,
    #[serde(default = "default_control_write_fd")]
    pub control_write_fd: i32,
    #[serde(default = "default_data_read_fd")]
    pub data_read_fd: i32,
    #[serde(default = "default_data_write_fd")]
    pub data_write_fd: i32,
    #[serde(default = "default_capacity")]
    pub input_capacity: usize,
}

fn default_control_read_fd() -> i32 {
    100
}
fn default_control_write_fd() -> i32 {
    101
}
fn default_data_read_fd() -> i32 {
    102
}
fn default_data_write_fd() -> i32 {
    103
}
pub fn default_capacity() -> usize {
    0x10000
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            control_read_fd: default_control_read_fd(),
            control_write_fd: default_control_write_fd(),
            data_read_fd: default_data_read_fd(),
            data_write_fd: default_data_write_fd(),
            input_capacity: default_capacity(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TransformSettings {
    #[serde(default = "default_indent_unit")]
    pub indent_unit: String,
    #[serde(default = "default_enter_marker")]
    pub enter_marker: String,
    #[serde(default = "default_exit_marker")]
    pub exit_marker: String,
    #[serde(default = "default_capacity")]
    pub output_capacity: usize,
}

fn default_indent_unit() -> String {
    "    ".to_string()
}
fn default_enter_marker() -> String {
    "INDENT".to_string()
}
fn default_exit_marker() -> String {
    "DEDENT".to_string()
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            indent_unit: default_indent_unit(),
            enter_marker: default_enter_marker(),
            exit_marker: default_exit_marker(),
            output_capacity: default_capacity(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ShuttleConfig {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub protocol: ProtocolSettings,
    #[serde(default)]
    pub transform: TransformSettings,
    #[serde(default)]
    pub engine: CommandEngineSettings,
}

impl ShuttleConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config = Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Applies environment overrides. `lookup` is usually `std::env::var_os`
    /// wrapped to return strings; any non-empty value enables debug tracing.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if lookup(DEBUG_ENV_VAR).is_some_and(|value| !value.is_empty()) {
            self.debug = true;
        }
    }
}
