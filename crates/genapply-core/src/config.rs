use crate::{Result, runtime_dir};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub apply: ApplyConfig,
    pub policy: PolicyConfig,
    pub conversation: ConversationConfig,
    pub sandbox: SandboxConfig,
    pub observe: ObserveConfig,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".genapply/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Layers, later wins: defaults, legacy TOML, user settings, project
    /// settings, project-local settings.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));
        Self::load_layers(&Self::legacy_toml_path(workspace), &paths)
    }

    fn load_layers(legacy: &Path, json_layers: &[PathBuf]) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        for path in json_layers {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3001".to_string(),
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Google,
    Groq,
}

impl ProviderId {
    pub const ALL: [ProviderId; 2] = [ProviderId::Google, ProviderId::Groq];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "google" | "gemini" => Some(Self::Google),
            "groq" => Some(Self::Groq),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Groq => "groq",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub default_model: String,
}

impl ProviderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    /// Configured key first, then the named environment variable. Blank
    /// values count as missing.
    pub fn resolve_api_key_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                if self.api_key_env.is_empty() {
                    None
                } else {
                    lookup(&self.api_key_env)
                }
            })
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub default_provider: ProviderId,
    pub google: ProviderConfig,
    pub groq: ProviderConfig,
    /// Exact model names pinned to a provider; consulted before the name
    /// heuristics.
    pub model_aliases: BTreeMap<String, ProviderId>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub max_tool_rounds: u8,
}

impl LlmConfig {
    pub fn provider(&self, id: ProviderId) -> &ProviderConfig {
        match id {
            ProviderId::Google => &self.google,
            ProviderId::Groq => &self.groq,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_provider: ProviderId::Google,
            google: ProviderConfig {
                endpoint: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
                api_key: None,
                api_key_env: "GEMINI_API_KEY".to_string(),
                default_model: "gemini-2.5-flash".to_string(),
            },
            groq: ProviderConfig {
                endpoint: "https://api.groq.com/openai/v1/chat/completions".to_string(),
                api_key: None,
                api_key_env: "GROQ_API_KEY".to_string(),
                default_model: "moonshotai/kimi-k2-instruct".to_string(),
            },
            model_aliases: BTreeMap::new(),
            temperature: 0.7,
            max_tokens: 8192,
            timeout_seconds: 300,
            max_retries: 2,
            retry_base_ms: 500,
            max_tool_rounds: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    pub max_batch_files: usize,
    pub max_path_len: usize,
    /// Prefix given to generated paths that do not already sit under a
    /// conventional top-level directory or name a root config file.
    pub default_source_dir: String,
    pub root_dirs: Vec<String>,
    pub root_files: Vec<String>,
    /// Module specifiers never reported as packages to install.
    pub runtime_builtins: Vec<String>,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            max_batch_files: 100,
            max_path_len: 500,
            default_source_dir: "src".to_string(),
            root_dirs: strings(&[
                "src",
                "public",
                "app",
                "pages",
                "components",
                "lib",
                "styles",
                "assets",
                "tests",
                "test",
                "docs",
                "scripts",
            ]),
            root_files: strings(&[
                "package.json",
                "index.html",
                "README.md",
                "tsconfig.json",
                "tsconfig.node.json",
                "vite.config.js",
                "vite.config.ts",
                "tailwind.config.js",
                "tailwind.config.ts",
                "postcss.config.js",
                "postcss.config.cjs",
                "next.config.js",
                "next.config.mjs",
                "eslint.config.js",
            ]),
            runtime_builtins: strings(&[
                "react",
                "react-dom",
                "react/jsx-runtime",
                "fs",
                "path",
                "os",
                "url",
                "util",
                "http",
                "https",
                "crypto",
                "events",
                "stream",
                "child_process",
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Glob patterns matched against the final path segment.
    pub protected_files: Vec<String>,
    pub protected_dirs: Vec<String>,
    pub allowed_extensions: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            protected_files: strings(&[
                ".env*",
                ".git",
                ".gitignore",
                "package-lock.json",
                "yarn.lock",
                "pnpm-lock.yaml",
                "bun.lockb",
            ]),
            protected_dirs: strings(&[
                ".git",
                "node_modules",
                ".next",
                "dist",
                "build",
                ".cache",
                ".turbo",
                "coverage",
                ".genapply",
            ]),
            allowed_extensions: strings(&[
                "js", "jsx", "ts", "tsx", "mjs", "cjs", "json", "vue", "svelte", "astro", "py",
                "rs", "go", "css", "scss", "sass", "less", "html", "htm", "xml", "md", "mdx",
                "txt", "yaml", "yml", "toml", "csv", "graphql", "svg", "png", "jpg", "jpeg",
                "gif", "webp", "ico", "avif",
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub max_messages: usize,
    pub keep_messages: usize,
    pub max_edits: usize,
    pub keep_edits: usize,
    /// Number of most recent messages sent to the provider as history.
    pub history_window: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_messages: 20,
            keep_messages: 15,
            max_edits: 10,
            keep_edits: 8,
            history_window: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub allowlist: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowlist: strings(&[
                "npm install",
                "npm run",
                "npm ls",
                "npx tsc",
                "node --version",
                "ls",
                "cat",
            ]),
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserveConfig {
    pub enabled: bool,
    pub verbose: bool,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verbose: false,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}
