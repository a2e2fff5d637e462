use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub extraction: ExtractionConfig,
    pub parsing: ParsingConfig,
    pub matcher: MatcherConfig,
    pub outbox: OutboxConfig,
    pub accounting: AccountingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `postgres://...` 或 `memory://` (内存仓储)
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub slow_statement_secs: u64,
    pub run_migrations: bool,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory:")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub upload_dir: String,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// 文本提取服务地址；为空时只处理纯文本文档
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsingConfig {
    pub poll_interval_ms: u64,
    pub lease_secs: i64,
    pub processing_timeout_secs: u64,
    pub max_attempts: i32,
    pub default_currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    pub exact_confidence: f64,
    pub fuzzy_threshold: f64,
    /// pg_trgm 候选过滤阈值 (低于最终阈值，先多取再精排)
    pub candidate_threshold: f64,
    pub candidate_limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    pub bus_url: Option<String>,
    pub publish_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountingConfig {
    pub inventory_account: String,
    pub input_tax_account: String,
    pub payable_account: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                log_level: "info".to_string(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/purchase_recon".to_string(),
                max_connections: 20,
                acquire_timeout_secs: 10,
                slow_statement_secs: 5,
                run_migrations: true,
            },
            storage: StorageConfig {
                upload_dir: "./uploads".to_string(),
                max_upload_bytes: 20 * 1024 * 1024,
            },
            extraction: ExtractionConfig {
                endpoint: None,
                timeout_secs: 60,
            },
            parsing: ParsingConfig {
                poll_interval_ms: 1000,
                lease_secs: 300,
                processing_timeout_secs: 120,
                max_attempts: 3,
                default_currency: "INR".to_string(),
            },
            matcher: MatcherConfig {
                exact_confidence: 0.95,
                fuzzy_threshold: 0.6,
                candidate_threshold: 0.2,
                candidate_limit: 50,
            },
            outbox: OutboxConfig {
                poll_interval_ms: 1000,
                batch_size: 100,
                bus_url: None,
                publish_timeout_secs: 10,
            },
            accounting: AccountingConfig {
                inventory_account: "1300-INVENTORY".to_string(),
                input_tax_account: "1410-INPUT-TAX".to_string(),
                payable_account: "2100-ACCOUNTS-PAYABLE".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// 加载配置: 默认值 -> config/default.* -> $RECON_CONFIG -> RECON__* 环境变量
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Config::try_from(&AppConfig::default())?;

        let mut builder = Config::builder()
            .add_source(defaults)
            .add_source(File::with_name("config/default").required(false));

        if let Ok(path) = std::env::var("RECON_CONFIG") {
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("RECON")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", url)?;
        }

        builder.build()?.try_deserialize()
    }
}
