use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::exam::grading::GradeBand;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub oracle: OracleConfig,
    pub progression: ProgressionConfig,
    pub exam: ExamConfig,
    pub gamification: GamificationConfig,
    pub grading: GradingConfig,
    pub legacy: LegacyConfig,
}

impl Config {
    /// Reads the TOML file, falling back to defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<Config>(&content)?
        } else {
            Config::default()
        };
        config.oracle.apply_env();
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub session_days: i64,
    /// Upper bound for a whole request, oracle call included.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            session_days: 5,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("database/kaiden.db"),
            max_connections: 8,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub model: String,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub timeout_secs: u64,
    /// A scoring claim older than this is considered abandoned.
    pub stale_claim_secs: i64,
}

impl std::fmt::Debug for OracleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleConfig")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("stale_claim_secs", &self.stale_claim_secs)
            .finish()
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            timeout_secs: 20,
            stale_claim_secs: 120,
        }
    }
}

impl OracleConfig {
    fn apply_env(&mut self) {
        let _ = dotenvy::dotenv();
        if let Ok(key) = dotenvy::var("OPENAI_API_KEY") {
            self.api_key = key;
        }
        if let Ok(model) = dotenvy::var("AI_MODEL") {
            self.model = model;
        }
        if let Ok(base_url) = dotenvy::var("OPENAI_BASE_URL") {
            self.base_url = base_url;
        }
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressionConfig {
    /// Watch rate (percent) at which the lesson counts as watched.
    pub lesson_threshold: f64,
    /// How far a reported watch rate may fall below the stored one before it is rejected.
    pub watch_regress_tolerance: f64,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            lesson_threshold: 95.0,
            watch_regress_tolerance: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExamConfig {
    pub autosave_interval_secs: u64,
    /// Submissions arriving this long after the deadline still count as the timeout submission.
    pub timeout_grace_secs: i64,
    /// Clock skew allowed when a client reports its timer reached zero.
    pub timeout_early_tolerance_secs: i64,
}

impl Default for ExamConfig {
    fn default() -> Self {
        Self {
            autosave_interval_secs: 30,
            timeout_grace_secs: 30,
            timeout_early_tolerance_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GamificationConfig {
    pub xp_per_level: i64,
    pub pass_score: i64,
    pub late_reward_ratio: f64,
}

impl Default for GamificationConfig {
    fn default() -> Self {
        Self {
            xp_per_level: 1000,
            pass_score: 60,
            late_reward_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    /// Ordered from the highest band down; anything below the last band fails.
    pub bands: Vec<GradeBand>,
    pub failing_letter: String,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            bands: vec![
                GradeBand::new("秀", 90.0),
                GradeBand::new("優", 80.0),
                GradeBand::new("良", 70.0),
                GradeBand::new("可", 60.0),
            ],
            failing_letter: "不可".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyConfig {
    /// JSON-lines export of the legacy document-store users.
    pub export_path: Option<PathBuf>,
}
