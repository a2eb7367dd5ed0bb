use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

const CONFIG_FILE_NAME: &str = "previewgrid.conf";

#[derive(Serialize, Deserialize, Clone)]
pub struct GuiConfig {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub font_scale: Option<f32>,
    /// Preview edge length in pixels. Changing it invalidates every cached
    /// preview through the scheduler's epoch bump.
    pub preview_size: Option<u32>,
    pub generate_previews: Option<bool>,
    /// Rows requested beyond the visible viewport in both directions.
    pub prefetch_rows: Option<usize>,
    pub worker_threads: Option<usize>,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            width: Some(1280),
            height: Some(720),
            font_scale: Some(1.0),
            preview_size: Some(64),
            generate_previews: Some(true),
            prefetch_rows: Some(4),
            worker_threads: None,
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct Config {
    #[serde(default)]
    gui: GuiConfig,
}

pub struct AppContext {
    pub gui_config: GuiConfig,
}

impl AppContext {
    pub fn new() -> Result<Self> {
        let config_path = Self::config_path()?;

        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("cannot read {:?}", config_path))?;
            let cfg: Config = toml::from_str(&content)
                .context("failed to parse config; the format might have changed")?;

            // Write back defaults if the gui section is missing entirely.
            let raw: toml::Value = toml::from_str(&content).unwrap_or(toml::Value::Integer(0));
            if raw.get("gui").is_none() {
                let toml_str = toml::to_string_pretty(&cfg)?;
                fs::write(&config_path, toml_str)?;
            }
            cfg
        } else {
            debug!(path = %config_path.display(), "creating default config");
            let cfg = Config::default();
            let toml_str = toml::to_string_pretty(&cfg)?;
            fs::write(&config_path, toml_str)?;
            cfg
        };

        Ok(Self { gui_config: config.gui })
    }

    /// Save updated gui config (window size, preview settings) back to the
    /// config file.
    pub fn save_gui_config(&self, gui_config: &GuiConfig) -> Result<()> {
        let config_path = Self::config_path()?;
        let mut cfg = if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            toml::from_str::<Config>(&content).unwrap_or_default()
        } else {
            Config::default()
        };
        cfg.gui = gui_config.clone();

        let toml_str = toml::to_string_pretty(&cfg)?;
        fs::write(&config_path, toml_str)
            .with_context(|| format!("cannot write {:?}", config_path))?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("no config dir found")?;
        fs::create_dir_all(&config_dir)?;
        Ok(config_dir.join(CONFIG_FILE_NAME))
    }
}
