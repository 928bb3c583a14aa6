use crate::history::DEFAULT_HISTORY_LIMIT;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfigSnapshot {
    pub source: Option<String>,
    pub shell: Option<String>,
    pub prompt: String,
    pub popup: bool,
    pub inline_scalar_responses: bool,
    pub history_limit: usize,
    pub aliases: HashMap<String, String>,
}

impl Default for RuntimeConfigSnapshot {
    fn default() -> Self {
        Self {
            source: None,
            shell: None,
            prompt: default_prompt(),
            popup: false,
            inline_scalar_responses: true,
            history_limit: DEFAULT_HISTORY_LIMIT,
            aliases: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfigWatcher {
    path: Option<PathBuf>,
    pinned: bool,
    modified: Option<SystemTime>,
}

#[derive(Debug, Clone, Deserialize)]
struct KuiConfigFile {
    #[serde(default)]
    shell: Option<String>,
    #[serde(default = "default_prompt")]
    prompt: String,
    #[serde(default)]
    popup: bool,
    #[serde(default = "default_inline", alias = "inline")]
    inline_scalar_responses: bool,
    #[serde(default = "default_history_limit", alias = "history")]
    history_limit: usize,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

impl RuntimeConfigWatcher {
    pub fn discover() -> Self {
        Self {
            path: discover_config_path(),
            pinned: false,
            modified: None,
        }
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            pinned: true,
            modified: None,
        }
    }

    pub fn load_current(&mut self) -> Result<RuntimeConfigSnapshot> {
        let Some(path) = self.path.clone() else {
            return Ok(RuntimeConfigSnapshot::default());
        };

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read runtime config {}", path.display()))?;
        let mut snapshot = parse_config(&raw)
            .with_context(|| format!("failed to parse runtime config {}", path.display()))?;
        snapshot.source = Some(path.display().to_string());
        self.modified = fs::metadata(&path)
            .ok()
            .and_then(|meta| meta.modified().ok());

        Ok(snapshot)
    }

    pub fn reload_if_changed(&mut self) -> Result<Option<RuntimeConfigSnapshot>> {
        if self.path.is_none() {
            self.path = discover_config_path();
            if self.path.is_some() {
                return self.load_current().map(Some);
            }
            return Ok(None);
        }

        let current_path = self.path.clone().unwrap_or_default();
        if !current_path.exists() {
            if !self.pinned {
                self.path = discover_config_path();
            }
            let had_config = self.modified.take().is_some();
            if !self.pinned && self.path.is_some() {
                return self.load_current().map(Some);
            }
            return Ok(had_config.then(RuntimeConfigSnapshot::default));
        }

        let modified = fs::metadata(&current_path)
            .ok()
            .and_then(|meta| meta.modified().ok());
        if modified != self.modified {
            return self.load_current().map(Some);
        }

        Ok(None)
    }
}

fn parse_config(raw: &str) -> Result<RuntimeConfigSnapshot> {
    if raw.trim().is_empty() {
        return Ok(RuntimeConfigSnapshot::default());
    }
    let parsed: KuiConfigFile = serde_yaml::from_str(raw)?;

    Ok(RuntimeConfigSnapshot {
        source: None,
        shell: parsed.shell.filter(|shell| !shell.trim().is_empty()),
        prompt: parsed.prompt,
        popup: parsed.popup,
        inline_scalar_responses: parsed.inline_scalar_responses,
        history_limit: parsed.history_limit.max(1),
        aliases: parsed.aliases.into_iter().collect(),
    })
}

fn default_prompt() -> String {
    "❯".to_string()
}

fn default_inline() -> bool {
    true
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KUI_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("kui.yaml"),
        PathBuf::from("kui.yml"),
        PathBuf::from(".kui.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/kui/config.yaml"),
            PathBuf::from(&home).join(".config/kui/config.yml"),
            PathBuf::from(&home).join(".kui.yaml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::{RuntimeConfigSnapshot, RuntimeConfigWatcher, parse_config};
    use std::fs;
    use std::path::PathBuf;

    fn scratch_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("kui-config-{}-{name}.yaml", std::process::id()))
    }

    #[test]
    fn empty_document_yields_defaults() {
        let snapshot = parse_config("").expect("empty config");
        assert_eq!(snapshot, RuntimeConfigSnapshot::default());
    }

    #[test]
    fn parses_flags_and_aliases() {
        let snapshot = parse_config(
            "shell: /bin/bash\npopup: true\ninline: false\nhistory: 20\naliases:\n  k: kubectl\n",
        )
        .expect("valid config");
        assert_eq!(snapshot.shell.as_deref(), Some("/bin/bash"));
        assert!(snapshot.popup);
        assert!(!snapshot.inline_scalar_responses);
        assert_eq!(snapshot.history_limit, 20);
        assert_eq!(snapshot.aliases.get("k").map(String::as_str), Some("kubectl"));
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(parse_config("popup: [unterminated").is_err());
    }

    #[test]
    fn pinned_watcher_reloads_only_after_change() {
        let path = scratch_file("reload");
        fs::write(&path, "prompt: '$'\n").expect("write config");

        let mut watcher = RuntimeConfigWatcher::at(path.clone());
        let first = watcher.load_current().expect("load config");
        assert_eq!(first.prompt, "$");
        assert_eq!(first.source, Some(path.display().to_string()));
        assert_eq!(watcher.reload_if_changed().expect("unchanged"), None);

        fs::remove_file(&path).expect("remove config");
        let reset = watcher.reload_if_changed().expect("removed");
        assert_eq!(reset, Some(RuntimeConfigSnapshot::default()));
        assert_eq!(watcher.reload_if_changed().expect("still removed"), None);
    }
}
