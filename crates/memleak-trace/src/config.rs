//! Runtime configuration from the environment.

use crate::error::{Error, Result};

pub const DEFAULT_SOCKNAME: &str = "memleak_sock";
pub const DEFAULT_STATS_INTERVAL: u64 = 1;
pub const DEFAULT_RESTART_MULTIPLIER: i64 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the control socket.
    pub sockname: String,
    /// Seconds between automatic reports.
    pub stats_interval: u64,
    /// Recording restarts every this many reports.
    pub restart_multiplier: i64,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let sockname = get("LIBMEMLEAK_SOCKNAME").unwrap_or_else(|| DEFAULT_SOCKNAME.to_string());
        let stats_interval = get("LIBMEMLEAK_STATS_INTERVAL")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_STATS_INTERVAL)
            .max(1);
        let restart_multiplier = match get("LIBMEMLEAK_RESTART_MULTIPLIER") {
            Some(v) => {
                let m = v.trim().parse::<i64>().unwrap_or(0);
                if m < 2 {
                    return Err(Error::InvalidConfig(
                        "LIBMEMLEAK_RESTART_MULTIPLIER: restart multiplier must be at least 2"
                            .to_string(),
                    ));
                }
                m
            }
            None => DEFAULT_RESTART_MULTIPLIER,
        };
        Ok(Config {
            sockname,
            stats_interval,
            restart_multiplier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = with(&[]).unwrap();
        assert_eq!(config.sockname, "memleak_sock");
        assert_eq!(config.stats_interval, 1);
        assert_eq!(config.restart_multiplier, 5);
    }

    #[test]
    fn all_overridden() {
        let config = with(&[
            ("LIBMEMLEAK_SOCKNAME", "/tmp/m.sock"),
            ("LIBMEMLEAK_STATS_INTERVAL", "10"),
            ("LIBMEMLEAK_RESTART_MULTIPLIER", "3"),
        ])
        .unwrap();
        assert_eq!(config.sockname, "/tmp/m.sock");
        assert_eq!(config.stats_interval, 10);
        assert_eq!(config.restart_multiplier, 3);
    }

    #[test]
    fn multiplier_below_two_is_rejected() {
        assert!(with(&[("LIBMEMLEAK_RESTART_MULTIPLIER", "1")]).is_err());
        assert!(with(&[("LIBMEMLEAK_RESTART_MULTIPLIER", "garbage")]).is_err());
    }

    #[test]
    fn bad_interval_falls_back_to_default() {
        let config = with(&[("LIBMEMLEAK_STATS_INTERVAL", "soon")]).unwrap();
        assert_eq!(config.stats_interval, 1);
        let config = with(&[("LIBMEMLEAK_STATS_INTERVAL", "0")]).unwrap();
        assert_eq!(config.stats_interval, 1);
    }
}
