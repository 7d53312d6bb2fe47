use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

/// Account configuration, persisted as JSON in the user's config
/// directory.
#[derive(Serialize, Deserialize, Clone)]
pub struct AccountConfig {
    /// Bare JID of the account.
    pub jid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path of the message database. Defaults next to the config file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

impl AccountConfig {
    pub fn new(jid: &str, password: &str) -> Self {
        AccountConfig {
            jid: jid.to_string(),
            password: Some(BASE64.encode(password)),
            db_path: None,
        }
    }

    pub fn get_password(&self) -> Option<String> {
        self.password.as_ref().map(|encoded| {
            String::from_utf8(BASE64.decode(encoded).unwrap_or_default()).unwrap_or_default()
        })
    }

    pub fn message_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_config_dir()?.join("messages.db")),
        }
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("magpie");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn save_config(config: &AccountConfig) -> Result<()> {
    let config_path = get_config_path()?;
    let file = File::create(config_path)?;
    serde_json::to_writer_pretty(file, config)?;

    info!("Configuration saved for {}", config.jid);
    Ok(())
}

pub fn load_config() -> Result<Option<AccountConfig>> {
    let config_path = get_config_path()?;

    if !config_path.exists() {
        return Ok(None);
    }

    let config_path_str = config_path.display().to_string();

    let mut file = File::open(config_path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: AccountConfig = serde_json::from_str(&contents)?;
    info!("Loaded configuration for {} from {}", config.jid, config_path_str);

    Ok(Some(config))
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

pub fn set_config_path_override(path: PathBuf) {
    let _ = CONFIG_PATH_OVERRIDE.set(path);
}

fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("account.json"))
}
