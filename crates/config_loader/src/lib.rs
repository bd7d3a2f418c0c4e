//! # Config Loader
//!
//! Loads a `TimingBlueprint` and validates it.
//!
//! - Parse TOML / JSON documents
//! - Check field ranges and course consistency
//!
//! # Example
//!
//! ```no_run
//! use config_loader::ConfigLoader;
//! use std::path::Path;
//!
//! let blueprint = ConfigLoader::load_from_path(Path::new("sprint.toml")).unwrap();
//! println!("Session: {}", blueprint.session.session_id);
//! ```

mod parser;
mod validator;

pub use contracts::TimingBlueprint;
pub use parser::ConfigFormat;

use contracts::ContractError;
use std::path::Path;
use tracing::{debug, instrument};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load a blueprint file.
    ///
    /// The format comes from the extension (.toml / .json), or from the
    /// content when the extension says nothing.
    ///
    /// # Errors
    /// - File read failure
    /// - Unsupported extension
    /// - Parse failure
    /// - Validation failure
    #[instrument(name = "config_load", skip(path), fields(path = %path.display()))]
    pub fn load_from_path(path: &Path) -> Result<TimingBlueprint, ContractError> {
        let content = std::fs::read_to_string(path)?;
        let format = Self::detect_format(path, &content)?;
        debug!(?format, "parsing blueprint");
        Self::load_from_str(&content, format)
    }

    pub fn load_from_str(
        content: &str,
        format: ConfigFormat,
    ) -> Result<TimingBlueprint, ContractError> {
        let blueprint = parser::parse(content, format)?;
        validator::validate(&blueprint)?;
        Ok(blueprint)
    }

    /// Validate a blueprint built in code.
    pub fn validate(blueprint: &TimingBlueprint) -> Result<(), ContractError> {
        validator::validate(blueprint)
    }

    pub fn to_toml(blueprint: &TimingBlueprint) -> Result<String, ContractError> {
        toml::to_string_pretty(blueprint)
            .map_err(|e| ContractError::config_parse(format!("TOML serialize error: {e}")))
    }

    pub fn to_json(blueprint: &TimingBlueprint) -> Result<String, ContractError> {
        serde_json::to_string_pretty(blueprint)
            .map_err(|e| ContractError::config_parse(format!("JSON serialize error: {e}")))
    }

    fn detect_format(path: &Path, content: &str) -> Result<ConfigFormat, ContractError> {
        match path.extension().and_then(|e| e.to_str()) {
            None => Ok(ConfigFormat::sniff(content)),
            Some(ext) => ConfigFormat::from_extension(ext).ok_or_else(|| {
                ContractError::config_parse(format!("unsupported config format: .{ext}"))
            }),
        }
    }
}
