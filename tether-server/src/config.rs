use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;

/// Command line and environment settings of the presence server.
#[derive(clap::Parser, Debug, Clone)]
#[command(name = "tether-server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Friends and presence server", long_about = None)]
pub struct ServerConfig {
    /// Port to listen on; 0 picks a free one
    #[arg(env = "TETHER_PORT", default_value_t = 8000)]
    pub port: u16,

    #[arg(long, env = "TETHER_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// sled database directory [default: sled<PORT>]
    #[arg(long, env = "TETHER_DB")]
    pub db: Option<PathBuf>,

    /// Notifications a session may have queued before it is dropped
    #[arg(long, env = "TETHER_OUTBOUND_CAPACITY", default_value_t = 64)]
    pub outbound_capacity: usize,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "TETHER_LOG", default_value = "info")]
    pub log: String,

    /// Keep the database in a temporary directory removed on exit
    #[arg(long, env = "TETHER_TEMPORARY")]
    pub temporary: bool,
}

impl ServerConfig {
    /// Free port, throwaway database. Used by tests.
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            db: None,
            outbound_capacity: 64,
            log: String::from("info"),
            temporary: true,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("sled{}", self.port)))
    }

    pub fn open_db(&self) -> anyhow::Result<sled::Db> {
        let config = match (&self.db, self.temporary) {
            (None, true) => sled::Config::new().temporary(true),
            _ => sled::Config::new()
                .path(self.db_path())
                .temporary(self.temporary),
        };
        config
            .open()
            .with_context(|| format!("opening database at {}", self.db_path().display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_follow_port() {
        let config = ServerConfig::try_parse_from(["tether-server", "9001"]).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.db_path(), PathBuf::from("sled9001"));
        assert_eq!(config.outbound_capacity, 64);
        assert_eq!(config.addr().to_string(), "127.0.0.1:9001");
    }

    #[test]
    fn flags_override_defaults() {
        let config = ServerConfig::try_parse_from([
            "tether-server",
            "--host",
            "0.0.0.0",
            "--db",
            "/tmp/friends",
            "--outbound-capacity",
            "4",
            "--temporary",
        ])
        .unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/friends"));
        assert_eq!(config.outbound_capacity, 4);
        assert!(config.temporary);
    }

    #[test]
    fn ephemeral_opens_temporary_db() {
        let db = ServerConfig::ephemeral().open_db().unwrap();
        db.insert("k", "v").unwrap();
        assert!(db.contains_key("k").unwrap());
    }
}
