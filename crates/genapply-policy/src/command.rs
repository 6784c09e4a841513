use crate::PolicyError;
use genapply_core::SandboxConfig;

const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '$', '`', '<', '>', '\n'];

/// Token-prefix allowlist for commands run in the sandbox workspace.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowlist: Vec<Vec<String>>,
}

impl CommandPolicy {
    pub fn new(cfg: &SandboxConfig) -> Self {
        Self {
            allowlist: cfg
                .allowlist
                .iter()
                .map(|entry| entry.split_whitespace().map(str::to_string).collect())
                .filter(|tokens: &Vec<String>| !tokens.is_empty())
                .collect(),
        }
    }

    pub fn check_command(&self, cmd: &str) -> Result<(), PolicyError> {
        if cmd.contains(SHELL_METACHARACTERS) {
            return Err(PolicyError::CommandNotAllowed);
        }
        let cmd_tokens: Vec<&str> = cmd.split_whitespace().collect();
        if cmd_tokens.is_empty() {
            return Err(PolicyError::CommandNotAllowed);
        }
        let allowed = self.allowlist.iter().any(|allowed_tokens| {
            cmd_tokens.len() >= allowed_tokens.len()
                && cmd_tokens
                    .iter()
                    .zip(allowed_tokens)
                    .all(|(token, allowed)| *token == allowed.as_str())
        });
        if allowed {
            Ok(())
        } else {
            Err(PolicyError::CommandNotAllowed)
        }
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(&SandboxConfig::default())
    }
}
