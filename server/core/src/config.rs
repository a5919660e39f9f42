//! Server configuration, loaded from a TOML file at startup. Tenants are
//! declared inline; the resolver built from them is read-only for the
//! life of the process.

use serde::Deserialize;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use url::Url;

use vigild_lib::prelude::*;
use vigild_lib::tenant::Tenant;

const DEFAULT_SESSION_TTL_SECS: u64 = 300;

#[derive(Deserialize)]
pub struct ServerConfig {
    /// Address:port the https frontend binds.
    pub bindaddress: String,
    /// The canonical origin clients reach the portal on. Also the
    /// WebAuthn origin.
    pub origin: Url,
    /// Relying party id, normally the effective domain of `origin`.
    pub rp_id: String,
    pub rp_name: String,
    /// Inactivity window for in-flight authentication and registration
    /// attempts, in seconds.
    pub session_ttl_secs: Option<u64>,
    #[serde(default)]
    pub tenants: Vec<Tenant>,
}

impl ServerConfig {
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, ()> {
        let mut f = File::open(config_path).map_err(|e| {
            admin_error!(?e, "unable to open config file");
        })?;
        let mut contents = String::new();
        f.read_to_string(&mut contents).map_err(|e| {
            admin_error!(?e, "unable to read config file contents");
        })?;
        toml::from_str(contents.as_str()).map_err(|e| {
            admin_error!(?e, "unable to parse config file");
        })
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs.unwrap_or(DEFAULT_SESSION_TTL_SECS))
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bindaddress", &self.bindaddress)
            .field("origin", &self.origin)
            .field("rp_id", &self.rp_id)
            .field("rp_name", &self.rp_name)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("tenants", &self.tenants.len())
            .finish()
    }
}
