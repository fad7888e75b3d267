//! Volume migration between members or daemons
//!
//! A migration moves a custom volume and its snapshots over two channels.
//! In pull mode the source waits for the sink to dial in; in push mode the
//! source dials the sink. Both sides wait under their own operation.

pub mod session;
pub mod sink;
pub mod source;
pub mod transport;
pub mod wire;

pub use session::{dial_channels, Channels, MigrationSession};
pub use sink::{backup_name, import_backup, MigrationSink, SinkArgs, SinkRequest};
pub use source::{MigrationSource, PushTarget};
pub use transport::{memory_pair, Frame, Transport};

use crate::common::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    Pull,
    Push,
}

impl MigrationMode {
    /// Strict: anything but `pull` or `push` is refused
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pull" => Ok(MigrationMode::Pull),
            "push" => Ok(MigrationMode::Push),
            other => Err(Error::InvalidInput(format!(
                "Unsupported migration mode {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationMode::Pull => f.write_str("pull"),
            MigrationMode::Push => f.write_str("push"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_is_strict() {
        assert_eq!(MigrationMode::parse("pull").unwrap(), MigrationMode::Pull);
        assert_eq!(MigrationMode::parse("push").unwrap(), MigrationMode::Push);
        assert!(MigrationMode::parse("").is_err());
        assert!(MigrationMode::parse("relay").is_err());
    }
}
