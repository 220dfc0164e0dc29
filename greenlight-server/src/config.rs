//! Server configuration and CLI argument parsing
//!
//! Every option can be given as a command-line flag or as an environment
//! variable with the `GREENLIGHT_` prefix.
//!
//! # Configuration Priority
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables
//! 3. Default values (lowest priority)
//!
//! # Example Usage
//!
//! ```bash
//! # Using CLI arguments
//! greenlight --port 4000 --limiter-rps 5 --limiter-burst 10
//!
//! # Using environment variables
//! export GREENLIGHT_DB_DSN=/var/lib/greenlight/movies.db
//! export GREENLIGHT_LIMITER_ENABLED=false
//! greenlight
//!
//! # Mixed (CLI overrides env)
//! export GREENLIGHT_PORT=8080
//! greenlight --port 9090  # Uses port 9090
//! ```

use anyhow::{Result, anyhow};
use clap::Parser;
use greenlight::ThrottleConfig;
use std::time::Duration;

/// Main configuration structure for the server
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener configuration
    pub http: HttpConfig,
    /// Deployment environment reported by the healthcheck
    pub env: Environment,
    /// Per-client rate limiting
    pub limiter: LimiterConfig,
    /// Record store configuration
    pub db: DbConfig,
    /// Upper bound on draining in-flight requests at shutdown (seconds)
    pub drain_timeout: u64,
    /// Logging level (error, warn, info, debug, trace)
    pub log_level: String,
}

/// HTTP listener configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Host address to bind to (e.g., "0.0.0.0")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Whether requests are rate limited at all
    pub enabled: bool,
    /// Tokens credited per second to each client
    pub rps: f64,
    /// Burst size of each client's bucket
    pub burst: u32,
    /// How often idle clients are swept (seconds)
    pub sweep_interval: u64,
    /// How long a client may stay silent before eviction (seconds)
    pub eviction_window: u64,
}

/// Record store configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite database path, or `:memory:`
    pub dsn: String,
    /// Deadline for a single store operation (seconds)
    pub timeout: u64,
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "development" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            _ => Err(anyhow!(
                "Invalid environment: {}. Valid options are: development, staging, production",
                s
            )),
        }
    }
}

impl LimiterConfig {
    /// Translate into the library's throttle policy
    pub fn throttle_config(&self) -> ThrottleConfig {
        ThrottleConfig {
            enabled: self.enabled,
            capacity: self.burst,
            refill_per_second: self.rps,
            sweep_interval: Duration::from_secs(self.sweep_interval),
            eviction_window: Duration::from_secs(self.eviction_window),
        }
    }
}

impl DbConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Command-line arguments for the server
///
/// All arguments can also be set via environment variables with the
/// GREENLIGHT_ prefix. CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(
    name = "greenlight",
    version,
    about = "Movie records JSON API",
    long_about = "A JSON API over a SQLite movie store with per-client rate limiting, \
versioned updates and graceful shutdown.\n\nEnvironment variables with GREENLIGHT_ prefix \
are supported. CLI arguments take precedence over environment variables."
)]
pub struct Args {
    #[arg(
        long,
        value_name = "HOST",
        help = "Host to bind to",
        default_value = "127.0.0.1",
        env = "GREENLIGHT_HOST"
    )]
    pub host: String,
    #[arg(
        long,
        value_name = "PORT",
        help = "API server port",
        default_value_t = 4000,
        env = "GREENLIGHT_PORT"
    )]
    pub port: u16,
    #[arg(
        long,
        value_name = "ENV",
        help = "Environment: development, staging, production",
        default_value = "development",
        env = "GREENLIGHT_ENV"
    )]
    pub env: Environment,

    // Store
    #[arg(
        long,
        value_name = "DSN",
        help = "SQLite database path (or :memory:)",
        default_value = "greenlight.db",
        env = "GREENLIGHT_DB_DSN"
    )]
    pub db_dsn: String,
    #[arg(
        long,
        value_name = "SECS",
        help = "Deadline for a single store operation (seconds)",
        default_value_t = 3,
        env = "GREENLIGHT_DB_TIMEOUT"
    )]
    pub db_timeout: u64,

    // Rate limiter
    #[arg(
        long,
        value_name = "BOOL",
        help = "Enable per-client rate limiting",
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "GREENLIGHT_LIMITER_ENABLED"
    )]
    pub limiter_enabled: bool,
    #[arg(
        long,
        value_name = "RPS",
        help = "Rate limiter maximum requests per second",
        default_value_t = 2.0,
        env = "GREENLIGHT_LIMITER_RPS"
    )]
    pub limiter_rps: f64,
    #[arg(
        long,
        value_name = "N",
        help = "Rate limiter maximum burst",
        default_value_t = 4,
        env = "GREENLIGHT_LIMITER_BURST"
    )]
    pub limiter_burst: u32,
    #[arg(
        long,
        value_name = "SECS",
        help = "How often idle clients are swept (seconds)",
        default_value_t = 60,
        env = "GREENLIGHT_LIMITER_SWEEP_INTERVAL"
    )]
    pub limiter_sweep_interval: u64,
    #[arg(
        long,
        value_name = "SECS",
        help = "Idle time after which a client is forgotten (seconds)",
        default_value_t = 180,
        env = "GREENLIGHT_LIMITER_EVICTION_WINDOW"
    )]
    pub limiter_eviction_window: u64,

    // Lifecycle
    #[arg(
        long,
        value_name = "SECS",
        help = "Time allowed for in-flight requests at shutdown (seconds)",
        default_value_t = 5,
        env = "GREENLIGHT_DRAIN_TIMEOUT"
    )]
    pub drain_timeout: u64,
    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level: error, warn, info, debug, trace",
        default_value = "info",
        env = "GREENLIGHT_LOG_LEVEL"
    )]
    pub log_level: String,

    // Utility options
    #[arg(
        long,
        help = "List all environment variables and exit",
        action = clap::ArgAction::SetTrue
    )]
    pub list_env_vars: bool,
}

impl Config {
    /// Build configuration from environment variables and CLI arguments
    ///
    /// # Errors
    ///
    /// Returns an error if any value fails [`Config::validate`].
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        if args.list_env_vars {
            Self::print_env_vars();
            std::process::exit(0);
        }

        let config = Self::from_args(args);
        config.validate()?;
        Ok(config)
    }

    fn from_args(args: Args) -> Self {
        Config {
            http: HttpConfig {
                host: args.host,
                port: args.port,
            },
            env: args.env,
            limiter: LimiterConfig {
                enabled: args.limiter_enabled,
                rps: args.limiter_rps,
                burst: args.limiter_burst,
                sweep_interval: args.limiter_sweep_interval,
                eviction_window: args.limiter_eviction_window,
            },
            db: DbConfig {
                dsn: args.db_dsn,
                timeout: args.db_timeout,
            },
            drain_timeout: args.drain_timeout,
            log_level: args.log_level,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.enabled {
            self.limiter
                .throttle_config()
                .validate()
                .map_err(|e| anyhow!("Invalid rate limiter configuration: {e}"))?;
        }
        if self.db.dsn.trim().is_empty() {
            return Err(anyhow!(
                "Database DSN must not be empty. Set --db-dsn or GREENLIGHT_DB_DSN"
            ));
        }
        if self.db.timeout == 0 {
            return Err(anyhow!("--db-timeout must be at least 1 second"));
        }
        if self.drain_timeout == 0 {
            return Err(anyhow!("--drain-timeout must be at least 1 second"));
        }
        Ok(())
    }

    fn print_env_vars() {
        println!("Greenlight Environment Variables");
        println!("================================");
        println!();
        println!("All environment variables use the GREENLIGHT_ prefix.");
        println!("CLI arguments take precedence over environment variables.");
        println!();

        println!("Server Configuration:");
        println!("  GREENLIGHT_HOST=<host>                   Host to bind to [default: 127.0.0.1]");
        println!("  GREENLIGHT_PORT=<port>                   API server port [default: 4000]");
        println!(
            "  GREENLIGHT_ENV=<env>                     development, staging, production [default: development]"
        );
        println!();

        println!("Store Configuration:");
        println!("  GREENLIGHT_DB_DSN=<path>                 SQLite path or :memory: [default: greenlight.db]");
        println!("  GREENLIGHT_DB_TIMEOUT=<secs>             Store operation deadline [default: 3]");
        println!();

        println!("Rate Limiter Configuration:");
        println!("  GREENLIGHT_LIMITER_ENABLED=true|false    Enable rate limiting [default: true]");
        println!("  GREENLIGHT_LIMITER_RPS=<n>               Requests per second [default: 2]");
        println!("  GREENLIGHT_LIMITER_BURST=<n>             Maximum burst [default: 4]");
        println!("  GREENLIGHT_LIMITER_SWEEP_INTERVAL=<secs> Idle client sweep interval [default: 60]");
        println!(
            "  GREENLIGHT_LIMITER_EVICTION_WINDOW=<secs> Idle time before eviction [default: 180]"
        );
        println!();

        println!("General Configuration:");
        println!("  GREENLIGHT_DRAIN_TIMEOUT=<secs>          Shutdown drain deadline [default: 5]");
        println!(
            "  GREENLIGHT_LOG_LEVEL=<level>             Log level: error, warn, info, debug, trace [default: info]"
        );
    }
}
