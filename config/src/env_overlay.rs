//! Env overlay sources: project `.env` and the `[env]` table of the XDG
//! `config.toml`. Parsing only; precedence is applied in `lib.rs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::LoadError;

/// Minimal .env parser: `KEY=VALUE` lines, `#` comments, surrounding quotes
/// stripped (double quotes support `\"`). No multiline values.
fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value[1..value.len() - 1].replace("\\\"", "\"")
        } else if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
            value[1..value.len() - 1].to_string()
        } else {
            value.to_string()
        };
        out.insert(key.to_string(), value);
    }
    out
}

/// Loads `.env` from `override_dir` (or the current directory) into a map.
/// A missing file is not an error; it yields an empty map.
pub fn dotenv_map(override_dir: Option<&Path>) -> Result<HashMap<String, String>, LoadError> {
    let dir = match override_dir {
        Some(d) => d.to_path_buf(),
        None => match std::env::current_dir() {
            Ok(d) => d,
            Err(_) => return Ok(HashMap::new()),
        },
    };
    let path = dir.join(".env");
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(&path).map_err(LoadError::DotenvRead)?;
    Ok(parse_dotenv(&content))
}

fn xdg_config_path(app_name: &str) -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(p) => PathBuf::from(p),
        None => dirs::config_dir()?,
    };
    let path = base.join(app_name).join("config.toml");
    path.is_file().then_some(path)
}

#[derive(serde::Deserialize, Default)]
struct EnvTable {
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Returns the `[env]` table of `$XDG_CONFIG_HOME/<app>/config.toml`.
/// Missing file or missing table yields an empty map.
pub fn xdg_env_map(app_name: &str) -> Result<HashMap<String, String>, LoadError> {
    let Some(path) = xdg_config_path(app_name) else {
        return Ok(HashMap::new());
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let table: EnvTable = toml::from_str(&content)?;
    Ok(table.env)
}
