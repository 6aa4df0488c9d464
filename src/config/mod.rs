//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::game::motion::MotionConfig;
use crate::game::phase_machine::PhaseTiming;
use crate::game::session::SessionSettings;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS ("*" for any)
    pub client_origin: String,

    /// Interval between end-of-match checks while running
    pub phase_check_interval: Duration,
    /// Delay between game over and the return to menu
    pub game_over_delay: Duration,

    /// Fighter movement tuning
    pub motion: MotionConfig,
    /// Friction reported by the server's ground sensor
    pub ground_friction: f32,

    /// Fighters allowed per session
    pub max_peers_per_session: usize,
    /// How long a session with no fighters and no connected peers survives
    pub session_idle_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let phase_check_ms: u64 = parse_var("PHASE_CHECK_INTERVAL_MS", 1000)?;
        let game_over_ms: u64 = parse_var("GAME_OVER_DELAY_MS", 3000)?;
        if phase_check_ms == 0 {
            return Err(ConfigError::Invalid {
                var: "PHASE_CHECK_INTERVAL_MS",
                value: "0".to_string(),
            });
        }

        let defaults = MotionConfig::default();
        let motion = MotionConfig {
            max_speed: parse_non_negative("FIGHTER_MAX_SPEED", defaults.max_speed)?,
            max_ground_acceleration: parse_non_negative(
                "FIGHTER_MAX_ACCELERATION",
                defaults.max_ground_acceleration,
            )?,
            max_air_acceleration: parse_non_negative(
                "FIGHTER_MAX_AIR_ACCELERATION",
                defaults.max_air_acceleration,
            )?,
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),

            phase_check_interval: Duration::from_millis(phase_check_ms),
            game_over_delay: Duration::from_millis(game_over_ms),

            motion,
            ground_friction: parse_non_negative("GROUND_FRICTION", 0.0)?,

            max_peers_per_session: parse_var("MAX_PEERS_PER_SESSION", 2)?,
            session_idle_grace: Duration::from_millis(parse_var("SESSION_IDLE_GRACE_MS", 10_000)?),
        })
    }

    /// Settings handed to every new match session
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            motion: self.motion,
            ground_friction: self.ground_friction,
            timing: PhaseTiming {
                check_interval: self.phase_check_interval,
                game_over_delay: self.game_over_delay,
            },
            max_peers: self.max_peers_per_session,
            idle_grace: self.session_idle_grace,
        }
    }
}

/// Read `var`, falling back to `default` when unset
fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

fn parse_non_negative(var: &'static str, default: f32) -> Result<f32, ConfigError> {
    let value: f32 = parse_var(var, default)?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        });
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable names so parallel tests don't collide

    #[test]
    fn unset_var_uses_default() {
        let value: u64 = parse_var("FMS_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn set_var_is_parsed() {
        env::set_var("FMS_TEST_PARSED_VAR", " 250 ");
        let value: u64 = parse_var("FMS_TEST_PARSED_VAR", 0).unwrap();
        assert_eq!(value, 250);
    }

    #[test]
    fn garbage_is_rejected() {
        env::set_var("FMS_TEST_GARBAGE_VAR", "fast");
        let err = parse_var::<f32>("FMS_TEST_GARBAGE_VAR", 1.0).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "FMS_TEST_GARBAGE_VAR", .. }));
    }

    #[test]
    fn negative_tuning_is_rejected() {
        env::set_var("FMS_TEST_NEGATIVE_VAR", "-1.5");
        assert!(parse_non_negative("FMS_TEST_NEGATIVE_VAR", 1.0).is_err());
    }
}
