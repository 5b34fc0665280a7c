//! Identity pool configuration.

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Shape of the name and port space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Prefix of generated container names.
    pub name_prefix: String,

    /// Zero-padded width of the numeric name suffix.
    pub name_width: usize,

    /// First host port handed out (inclusive).
    pub min_port: u16,

    /// Last host port handed out (inclusive).
    pub max_port: u16,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name_prefix: "srv_".to_string(),
            name_width: 6,
            min_port: 25565,
            max_port: 25599,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name_prefix.is_empty() {
            return Err(PoolError::InvalidConfig("name_prefix must not be empty".into()));
        }
        if self.name_width == 0 || self.name_width > 9 {
            return Err(PoolError::InvalidConfig(format!(
                "name_width must be between 1 and 9, got {}",
                self.name_width
            )));
        }
        if self.min_port == 0 || self.min_port > self.max_port {
            return Err(PoolError::InvalidConfig(format!(
                "invalid port range {}..={}",
                self.min_port, self.max_port
            )));
        }
        Ok(())
    }

    /// Number of ports in the range.
    pub fn capacity(&self) -> usize {
        usize::from(self.max_port) - usize::from(self.min_port) + 1
    }

    /// Largest name index representable at the configured width.
    pub fn max_name_index(&self) -> u32 {
        10u32.pow(self.name_width as u32) - 1
    }

    pub fn contains_port(&self, port: u16) -> bool {
        (self.min_port..=self.max_port).contains(&port)
    }

    pub fn render_name(&self, index: u32) -> String {
        format!("{}{:0width$}", self.name_prefix, index, width = self.name_width)
    }

    /// Inverse of [`render_name`](Self::render_name); `None` for names this
    /// pool did not generate.
    pub fn parse_name(&self, name: &str) -> Option<u32> {
        let suffix = name.strip_prefix(&self.name_prefix)?;
        if suffix.len() != self.name_width || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok().filter(|index| *index > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_rendering() {
        let config = PoolConfig::default();
        assert_eq!(config.render_name(1), "srv_000001");
        assert_eq!(config.parse_name("srv_000001"), Some(1));
        assert_eq!(config.parse_name("srv_1"), None);
        assert_eq!(config.parse_name("minecraft_server_1"), None);
        assert_eq!(config.parse_name("srv_000000"), None);
    }

    #[test]
    fn test_validation() {
        assert!(PoolConfig::default().validate().is_ok());
        let inverted = PoolConfig {
            min_port: 30000,
            max_port: 20000,
            ..PoolConfig::default()
        };
        assert!(inverted.validate().is_err());
        let wide = PoolConfig {
            name_width: 12,
            ..PoolConfig::default()
        };
        assert!(wide.validate().is_err());
    }

    #[test]
    fn test_capacity() {
        assert_eq!(PoolConfig::default().capacity(), 35);
        assert_eq!(PoolConfig::default().max_name_index(), 999_999);
    }
}
