use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// q2api - OpenAI & Anthropic compatible gateway for Amazon Q
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "PORT", default_value = "4000")]
    pub port: u16,

    /// Shared secret protecting the inbound /v1 surface
    #[arg(long, env = "BEARER_TOKEN")]
    pub bearer_token: Option<String>,

    /// Amazon Q GenerateAssistantResponse endpoint URL
    #[arg(long, env = "AMAZON_Q_URL")]
    pub amazon_q_url: Option<String>,

    /// Where credentials come from (csv or api)
    #[arg(long, env = "ACCOUNT_SOURCE", default_value = "csv")]
    pub account_source: String,

    /// Path to the accounts CSV file (csv mode)
    #[arg(long, env = "ACCOUNTS_CSV_PATH")]
    pub accounts_csv_path: Option<String>,

    /// Account broker base URL (api mode)
    #[arg(long, env = "ACCOUNT_API_URL")]
    pub account_api_url: Option<String>,

    /// Account broker bearer token (api mode)
    #[arg(long, env = "ACCOUNT_API_TOKEN")]
    pub account_api_token: Option<String>,

    /// Account broker category id (api mode)
    #[arg(long, env = "ACCOUNT_CATEGORY_ID")]
    pub account_category_id: Option<String>,

    /// Size of the active credential set
    #[arg(long, env = "ACTIVE_TOKEN_COUNT", default_value = "10")]
    pub active_token_count: usize,

    /// Attempts per refresh-token exchange
    #[arg(long, env = "MAX_REFRESH_ATTEMPT", default_value = "3")]
    pub max_refresh_attempt: u32,

    /// Optional outbound proxy URL (http or socks)
    #[arg(long, env = "PROXY_URL")]
    pub proxy_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AccountSource {
    Csv,
    Api,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub host: String,
    pub port: u16,

    // Inbound authentication
    pub bearer_token: String,

    // Upstream
    pub amazon_q_url: String,
    pub proxy_url: Option<String>,

    // Credential pool
    pub account_source: AccountSource,
    pub accounts_csv_path: Option<PathBuf>,
    pub account_api_url: Option<String>,
    pub account_api_token: Option<String>,
    pub account_category_id: Option<String>,
    pub active_token_count: usize,
    pub max_refresh_attempt: u32,

    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        Self::from_args(args)
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            host: args.host,
            port: args.port,

            bearer_token: args
                .bearer_token
                .context("BEARER_TOKEN is required (auth secret for the inbound /v1 surface)")?,

            amazon_q_url: args
                .amazon_q_url
                .context("AMAZON_Q_URL is required (Amazon Q conversation endpoint)")?,

            proxy_url: args.proxy_url,

            account_source: parse_account_source(&args.account_source),
            accounts_csv_path: args.accounts_csv_path.map(PathBuf::from),
            account_api_url: args.account_api_url,
            account_api_token: args.account_api_token,
            account_category_id: args.account_category_id,
            active_token_count: args.active_token_count,
            max_refresh_attempt: args.max_refresh_attempt,

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Validate cross-field requirements
    pub fn validate(&self) -> Result<()> {
        match self.account_source {
            AccountSource::Csv => {
                if self.accounts_csv_path.is_none() {
                    anyhow::bail!("ACCOUNTS_CSV_PATH is required when ACCOUNT_SOURCE=csv");
                }
            }
            AccountSource::Api => {
                if self.account_api_url.is_none() || self.account_api_token.is_none() {
                    anyhow::bail!(
                        "ACCOUNT_API_URL and ACCOUNT_API_TOKEN are required when ACCOUNT_SOURCE=api"
                    );
                }
            }
        }
        Ok(())
    }
}

fn parse_account_source(s: &str) -> AccountSource {
    match s.to_lowercase().as_str() {
        "api" => AccountSource::Api,
        _ => AccountSource::Csv,
    }
}
