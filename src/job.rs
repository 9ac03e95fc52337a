//! Job descriptor ("message") intake and rename rules.
//!
//! The dispatcher writes one JSON message per queued job; the worker reads
//! it, walks the matching spool directory and rewrites the message when the
//! restart list shrinks. Field aliases keep older dispatcher versions
//! readable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::protocol::{AuthMethod, Scheme, TransferMode};

/// Remote temp-naming strategy used until the final rename.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "arg")]
pub enum LockStrategy {
    /// Write under the final name directly.
    #[default]
    Off,
    /// Same, but without the unlocked-file warning on size drift.
    OffSilent,
    /// `.name` while writing, rename to `name` when done.
    Dot,
    /// VMS-style trailing dot while writing.
    DotVms,
    /// `name<postfix>` while writing.
    Postfix(String),
    /// Per-worker sequence suffix.
    Sequence,
    /// Unique per-job suffix.
    Unique,
    /// Separate remote lock file guarding the whole batch.
    LockFile(String),
}

impl LockStrategy {
    /// Whether the on-wire name differs from the final name, forcing the
    /// end-of-transfer rename.
    pub fn needs_rename(&self) -> bool {
        !matches!(self, LockStrategy::Off | LockStrategy::OffSilent | LockStrategy::LockFile(_))
    }
}

/// Which hostname toggle a rename rule applies to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    #[default]
    Both,
    PrimaryOnly,
    SecondaryOnly,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobDescriptor {
    pub job_id: u32,
    pub host_alias: String,
    pub scheme: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub proxy_login: Vec<String>,
    pub target_dir: String,
    #[serde(default)]
    pub create_target_dir: bool,
    #[serde(default = "default_dir_mode")]
    pub dir_mode: u32,
    #[serde(default)]
    pub transfer_mode: String,
    #[serde(default)]
    pub lock: LockStrategy,
    #[serde(default)]
    pub rename_rule: Option<String>,
    #[serde(default)]
    pub rename_rule_scope: RuleScope,
    #[serde(default)]
    pub wmo_framing: bool,
    #[serde(default)]
    pub ready_file_suffix: Option<String>,
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub age_limit_secs: u64,
    #[serde(default)]
    pub chmod: Option<u32>,
    #[serde(default)]
    pub site_pre: Option<String>,
    #[serde(default)]
    pub site_post: Option<String>,
    #[serde(default)]
    pub idle_time: Option<u32>,
    #[serde(default)]
    pub check_size: bool,
    #[serde(default)]
    pub keep_time_stamp: bool,
    #[serde(default)]
    pub dupcheck: bool,
    /// Files to append-resume rather than send from scratch.
    #[serde(default, alias = "restart_list")]
    pub restart_names: Vec<String>,
    #[serde(skip)]
    msg_path: PathBuf,
}

fn default_dir_mode() -> u32 {
    0o755
}

impl JobDescriptor {
    pub fn load(work_dir: &Path, msg_name: &str) -> anyhow::Result<Self> {
        let path = work_dir.join("msg").join(msg_name);
        let data = std::fs::read_to_string(&path)?;
        let mut job: JobDescriptor = serde_json::from_str(&data)?;
        job.msg_path = path;
        Ok(job)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.msg_path, data)?;
        Ok(())
    }

    pub fn scheme(&self) -> Option<Scheme> {
        Scheme::parse(&self.scheme)
    }

    pub fn transfer_mode(&self) -> TransferMode {
        match self.transfer_mode.as_str() {
            "ascii" => TransferMode::Ascii,
            "dos" => TransferMode::Dos,
            _ => TransferMode::Binary,
        }
    }

    pub fn auth_method(&self) -> AuthMethod {
        if !self.proxy_login.is_empty() {
            AuthMethod::Proxy(self.proxy_login.clone())
        } else if let Some(key) = &self.key_file {
            AuthMethod::PublicKey(key.clone())
        } else {
            AuthMethod::Password
        }
    }

    /// Spool directory holding this job's files.
    pub fn spool_dir(&self, work_dir: &Path, msg_name: &str) -> PathBuf {
        work_dir.join("outgoing").join(msg_name)
    }

    pub fn in_restart_list(&self, name: &str) -> bool {
        self.restart_names.iter().any(|n| n == name)
    }

    /// Drop a delivered file from the restart list and persist the change.
    pub fn remove_restart_name(&mut self, name: &str) -> anyhow::Result<bool> {
        let before = self.restart_names.len();
        self.restart_names.retain(|n| n != name);
        if self.restart_names.len() != before {
            self.save()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// One rename rule: first matching pattern wins, capture groups allowed in
/// the replacement.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RenameRule {
    pub pattern: String,
    pub replacement: String,
}

/// Named rule sets loaded from `<work_dir>/rename.rules.json`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RenameRules(std::collections::HashMap<String, Vec<RenameRule>>);

impl RenameRules {
    pub fn load(work_dir: &Path) -> Self {
        let path = work_dir.join("rename.rules.json");
        match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!("bad rename rules in {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn apply(&self, rule_set: &str, name: &str) -> String {
        let Some(rules) = self.0.get(rule_set) else {
            return name.to_string();
        };
        for rule in rules {
            match regex::Regex::new(&rule.pattern) {
                Ok(re) => {
                    if re.is_match(name) {
                        return re.replace(name, rule.replacement.as_str()).into_owned();
                    }
                }
                Err(e) => {
                    tracing::warn!("bad rename pattern {}: {}", rule.pattern, e);
                }
            }
        }
        name.to_string()
    }

    #[cfg(test)]
    pub fn insert(&mut self, set: &str, rules: Vec<RenameRule>) {
        self.0.insert(set.to_string(), rules);
    }
}
