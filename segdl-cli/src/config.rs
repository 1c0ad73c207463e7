//! Command-line settings: layering of flags, environment and the settings file.

use std::path::PathBuf;

use segdl_engine::settings::{KEY_CONCURRENCY, KEY_DEFAULT_DOWNLOAD_PATH, KEY_MAX_RETRIES};
use segdl_engine::{
    EngineConfig, EnvSettings, LayeredSettings, SettingsSource, StaticSettings, TomlSettings,
};
use tracing::debug;

use crate::cli::Args;
use crate::error::AppError;

/// `<config dir>/segdl/settings.toml`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("segdl").join("settings.toml"))
}

/// Parses a `Name: value` header argument.
pub fn parse_header(raw: &str) -> Result<(String, String), AppError> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| AppError::InvalidInput(format!("header `{raw}` is not `Name: value`")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidInput(format!("header `{raw}` has no name")));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Flags take precedence over `SEGDL_*` variables, which take precedence over the file.
pub fn build_settings(args: &Args) -> Result<LayeredSettings, AppError> {
    let flags = StaticSettings::new();
    if let Some(concurrency) = args.concurrency {
        flags.set(KEY_CONCURRENCY, concurrency);
    }
    if let Some(retries) = args.retries {
        flags.set(KEY_MAX_RETRIES, retries);
    }

    let mut settings = LayeredSettings::new().layer(flags).layer(EnvSettings);
    match &args.config {
        Some(path) => {
            if !path.is_file() {
                return Err(AppError::InvalidInput(format!(
                    "settings file {} does not exist",
                    path.display()
                )));
            }
            settings = settings.layer(TomlSettings::new(path));
        }
        None => {
            if let Some(path) = default_settings_path() {
                debug!(path = %path.display(), "Using default settings file");
                settings = settings.layer(TomlSettings::new(path));
            }
        }
    }
    Ok(settings)
}

/// Flag, then configured default download path, then the system download directory.
pub fn output_dir(args: &Args, settings: &dyn SettingsSource) -> PathBuf {
    args.output_dir
        .clone()
        .or_else(|| settings.get(KEY_DEFAULT_DOWNLOAD_PATH).map(PathBuf::from))
        .or_else(dirs::download_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn engine_config(args: &Args) -> EngineConfig {
    let mut config = EngineConfig::default();
    if let Some(ffmpeg) = &args.ffmpeg {
        config = config.with_ffmpeg_path(ffmpeg.clone());
    }
    if let Some(work_dir) = &args.work_dir {
        config = config.with_work_root(work_dir.clone());
    }
    config
}
