//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS, comma-separated, `*` for any
    pub client_origin: String,

    /// JSON file with board records to load at startup
    pub boards_path: Option<PathBuf>,
    /// JSON file with user profiles to seed the user store
    pub users_path: Option<PathBuf>,

    /// Physics loop settings shared by every world runner
    pub simulation: SimulationSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = SimulationSettings::default();
        let tick_rate: u32 = parse_var("SIM_TICK_RATE", defaults.tick_rate)?;
        if tick_rate == 0 {
            return Err(ConfigError::Invalid {
                var: "SIM_TICK_RATE",
                value: tick_rate.to_string(),
            });
        }
        let timeout_secs: u64 = parse_var("SIM_TIMEOUT_SECS", defaults.timeout.as_secs())?;

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),

            boards_path: env::var("BOARDS_PATH").ok().map(PathBuf::from),
            users_path: env::var("USERS_PATH").ok().map(PathBuf::from),

            simulation: SimulationSettings {
                tick_rate,
                timeout: Duration::from_secs(timeout_secs),
                gravity: parse_var("SIM_GRAVITY", defaults.gravity)?,
                velocity_iterations: parse_var(
                    "SIM_VELOCITY_ITERATIONS",
                    defaults.velocity_iterations,
                )?,
                position_iterations: parse_var(
                    "SIM_POSITION_ITERATIONS",
                    defaults.position_iterations,
                )?,
            },
        })
    }
}

/// Fixed-timestep loop parameters
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationSettings {
    /// Target steps per second
    pub tick_rate: u32,
    /// Hard upper bound on one simulation's wall time
    pub timeout: Duration,
    /// Vertical gravity in engine space (y up)
    pub gravity: f32,
    pub velocity_iterations: u32,
    pub position_iterations: u32,
}

impl SimulationSettings {
    /// Wall time one tick should take
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }

    /// Simulated time advanced by one step, in seconds
    pub fn tick_delta(&self) -> f32 {
        1.0 / self.tick_rate.max(1) as f32
    }
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            timeout: Duration::from_secs(50),
            gravity: -10.0,
            velocity_iterations: 10,
            position_iterations: 10,
        }
    }
}

fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}
