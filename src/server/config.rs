//! Server configuration.
//!
//! Loaded from a simple `directive value` file plus CLI overrides; the
//! server itself never parses arguments.

use crate::{DEFAULT_BACKLOG_CAPACITY, DEFAULT_HZ, DEFAULT_PORT, DEFAULT_TABLE_BASE_SIZE};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Replication role of this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Accepts writes and feeds the replica
    #[default]
    Master,
    /// Applies the master's command stream
    Slave,
}

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Everything, including per-frame traces
    Debug,
    /// Operational messages
    #[default]
    Notice,
    /// Problems only
    Warning,
}

impl LogLevel {
    /// The `tracing` filter directive for this level.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Notice => "info",
            Self::Warning => "warn",
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Replication role
    pub role: Role,
    /// Bind address
    pub bind: String,
    /// Client port
    pub port: u16,
    /// Replication listener port (master role)
    pub repl_port: u16,
    /// Master host to sync from (slave role)
    pub peer_ip: String,
    /// Master replication port to sync from (slave role)
    pub peer_port: u16,
    /// Data directory for AOF and snapshot files
    pub dir: PathBuf,
    /// I/O worker threads; 0 runs everything inline on the reactor
    pub io_threads: usize,
    /// Initial (and minimum) hash table bucket count; a power of two
    pub table_base_size: usize,
    /// Replication backlog capacity in bytes
    pub backlog_capacity: usize,
    /// Background-task frequency seed
    pub hz: u32,
    /// Log level
    pub loglevel: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Master,
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            repl_port: DEFAULT_PORT + 1,
            peer_ip: "127.0.0.1".to_string(),
            peer_port: DEFAULT_PORT + 1,
            dir: PathBuf::from("."),
            io_threads: 0,
            table_base_size: DEFAULT_TABLE_BASE_SIZE,
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            hz: DEFAULT_HZ,
            loglevel: LogLevel::default(),
        }
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config file: {0}")]
    Io(String),

    /// A directive line could not be parsed
    #[error("config parse error at line {line}: {message}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// What went wrong
        message: String,
    },

    /// An unrecognized directive
    #[error("unknown directive '{directive}' at line {line}")]
    UnknownDirective {
        /// 1-based line number
        line: usize,
        /// The directive as written
        directive: String,
    },
}

impl Config {
    /// Load configuration from a directive file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (directive, value) = Self::parse_line(line).ok_or_else(|| ConfigError::Parse {
                line: line_num + 1,
                message: "invalid directive format".to_string(),
            })?;
            config.apply_directive(&directive.to_lowercase(), value, line_num + 1)?;
        }
        Ok(config)
    }

    fn parse_line(line: &str) -> Option<(&str, &str)> {
        let mut parts = line.splitn(2, |c: char| c.is_whitespace());
        let directive = parts.next()?.trim();
        let value = parts.next().map(|v| v.trim()).unwrap_or("");
        Some((directive, value))
    }

    fn apply_directive(
        &mut self,
        directive: &str,
        value: &str,
        line: usize,
    ) -> Result<(), ConfigError> {
        match directive {
            "role" => {
                self.role = match value.to_lowercase().as_str() {
                    "master" => Role::Master,
                    "slave" | "replica" => Role::Slave,
                    other => {
                        return Err(ConfigError::Parse {
                            line,
                            message: format!("invalid role '{other}'"),
                        })
                    }
                }
            }
            "bind" => self.bind = value.to_string(),
            "port" => self.port = parse_num(value, line)?,
            "repl-port" => self.repl_port = parse_num(value, line)?,
            "peer-ip" => self.peer_ip = value.to_string(),
            "peer-port" => self.peer_port = parse_num(value, line)?,
            "dir" => self.dir = PathBuf::from(value),
            "io-threads" => self.io_threads = parse_num(value, line)?,
            "table-base-size" => {
                let size: usize = parse_num(value, line)?;
                if !size.is_power_of_two() {
                    return Err(ConfigError::Parse {
                        line,
                        message: format!("table-base-size must be a power of two, got {size}"),
                    });
                }
                self.table_base_size = size;
            }
            "backlog-size" => {
                let size: usize = parse_num(value, line)?;
                if size == 0 {
                    return Err(ConfigError::Parse {
                        line,
                        message: "backlog-size must be non-zero".to_string(),
                    });
                }
                self.backlog_capacity = size;
            }
            "hz" => {
                let hz: u32 = parse_num(value, line)?;
                self.hz = hz.clamp(1, 500);
            }
            "loglevel" => {
                self.loglevel = match value.to_lowercase().as_str() {
                    "debug" => LogLevel::Debug,
                    "notice" => LogLevel::Notice,
                    "warning" => LogLevel::Warning,
                    other => {
                        return Err(ConfigError::Parse {
                            line,
                            message: format!("invalid loglevel '{other}'"),
                        })
                    }
                }
            }
            _ => {
                return Err(ConfigError::UnknownDirective {
                    line,
                    directive: directive.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Bucket-count exponent for the dict (`table_base_size = 2^exp`).
    pub fn table_base_exp(&self) -> u32 {
        self.table_base_size.trailing_zeros()
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, line: usize) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Parse {
        line,
        message: format!("invalid number '{value}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.role, Role::Master);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.io_threads, 0);
        assert!(config.table_base_size.is_power_of_two());
    }

    #[test]
    fn test_parse_directives() {
        let config = Config::parse(
            "# replication\n\
             role slave\n\
             peer-ip 10.0.0.5\n\
             peer-port 9100\n\
             \n\
             io-threads 4\n\
             table-base-size 64\n\
             loglevel debug\n",
        )
        .unwrap();
        assert_eq!(config.role, Role::Slave);
        assert_eq!(config.peer_ip, "10.0.0.5");
        assert_eq!(config.peer_port, 9100);
        assert_eq!(config.io_threads, 4);
        assert_eq!(config.table_base_size, 64);
        assert_eq!(config.table_base_exp(), 6);
        assert_eq!(config.loglevel, LogLevel::Debug);
    }

    #[test]
    fn test_rejects_non_power_of_two_table_size() {
        assert!(Config::parse("table-base-size 100\n").is_err());
    }

    #[test]
    fn test_rejects_unknown_directive() {
        let err = Config::parse("no-such-thing 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDirective { line: 1, .. }));
    }
}
