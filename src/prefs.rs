use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CONTROL_URL: &str = "https://login.lightscale.net";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetfilterMode {
    Off,
    NoDivert,
    #[default]
    On,
}

/// Long-lived node identity owned by the control client. Frontends can read
/// it back out of `Prefs` but are never allowed to overwrite it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persist {
    #[serde(default)]
    pub private_machine_key: String,
    #[serde(default)]
    pub private_node_key: String,
    #[serde(default)]
    pub login_name: String,
    #[serde(default)]
    pub refresh_token: String,
}

impl Persist {
    pub fn pretty(&self) -> String {
        format!(
            "Persist{{machine={} node={} login={:?} refresh={}}}",
            present(&self.private_machine_key),
            present(&self.private_node_key),
            self.login_name,
            present(&self.refresh_token)
        )
    }
}

fn present(key: &str) -> &'static str {
    if key.is_empty() {
        "empty"
    } else {
        "set"
    }
}

/// User-controlled configuration. Value semantics: the agent clones this on
/// every read-out of its cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prefs {
    #[serde(default)]
    pub control_url: String,
    #[serde(default)]
    pub want_running: bool,
    #[serde(default)]
    pub route_all: bool,
    #[serde(default)]
    pub allow_single_hosts: bool,
    #[serde(default)]
    pub corp_dns: bool,
    #[serde(default)]
    pub shields_up: bool,
    #[serde(default)]
    pub disable_derp: bool,
    #[serde(default)]
    pub no_snat: bool,
    #[serde(default)]
    pub netfilter_mode: NetfilterMode,
    #[serde(default)]
    pub advertise_routes: Vec<IpNet>,
    #[serde(default)]
    pub advertise_tags: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub device_model: String,
    #[serde(default)]
    pub persist: Option<Persist>,
}

impl Default for Prefs {
    fn default() -> Self {
        Prefs::new()
    }
}

impl Prefs {
    pub fn new() -> Prefs {
        Prefs {
            control_url: DEFAULT_CONTROL_URL.to_string(),
            want_running: true,
            route_all: true,
            allow_single_hosts: true,
            corp_dns: true,
            shields_up: false,
            disable_derp: false,
            no_snat: false,
            netfilter_mode: NetfilterMode::On,
            advertise_routes: Vec::new(),
            advertise_tags: Vec::new(),
            hostname: String::new(),
            os_version: String::new(),
            device_model: String::new(),
            persist: None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).expect("prefs must serialize")
    }

    /// Empty input yields defaults (a key written by an older build may be
    /// empty); anything else must parse.
    pub fn from_bytes(bytes: &[u8]) -> Result<Prefs> {
        if bytes.is_empty() {
            return Ok(Prefs::new());
        }
        serde_json::from_slice(bytes).context("parsing prefs")
    }

    /// Compact one-line summary for logs. Never includes key material.
    pub fn pretty(&self) -> String {
        let persist = match &self.persist {
            Some(p) => p.pretty(),
            None => "Persist{nil}".to_string(),
        };
        format!(
            "Prefs{{ra={} dns={} want={} shields={} routes={} tags={} url={} {}}}",
            self.route_all,
            self.corp_dns,
            self.want_running,
            self.shields_up,
            self.advertise_routes.len(),
            self.advertise_tags.len(),
            self.control_url,
            persist
        )
    }
}

pub fn load_prefs(path: &Path) -> Result<Prefs> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading prefs from {}", path.display()))?;
    Prefs::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let mut prefs = Prefs::new();
        prefs.want_running = false;
        prefs.shields_up = true;
        prefs.advertise_routes = vec!["192.168.7.0/24".parse().unwrap()];
        prefs.advertise_tags = vec!["tag:server".to_string()];
        prefs.persist = Some(Persist {
            private_machine_key: "mkey".to_string(),
            private_node_key: "nkey".to_string(),
            login_name: "dev@example.net".to_string(),
            refresh_token: "rtok".to_string(),
        });
        let decoded = Prefs::from_bytes(&prefs.to_bytes()).unwrap();
        assert_eq!(decoded, prefs);
    }

    #[test]
    fn rejects_malformed_bytes() {
        assert!(Prefs::from_bytes(b"{not json").is_err());
        assert!(Prefs::from_bytes(b"42").is_err());
    }

    #[test]
    fn empty_bytes_yield_defaults() {
        let prefs = Prefs::from_bytes(b"").unwrap();
        assert_eq!(prefs, Prefs::new());
        assert!(prefs.want_running);
        assert!(prefs.corp_dns);
        assert_eq!(prefs.control_url, DEFAULT_CONTROL_URL);
    }

    #[test]
    fn pretty_never_prints_credential_material() {
        let mut prefs = Prefs::new();
        prefs.persist = Some(Persist {
            private_machine_key: "secret-machine-key".to_string(),
            private_node_key: "secret-node-key".to_string(),
            refresh_token: "secret-refresh-token".to_string(),
            ..Default::default()
        });
        let line = prefs.pretty();
        assert!(!line.contains("secret-machine-key"));
        assert!(!line.contains("secret-node-key"));
        assert!(!line.contains("secret-refresh-token"));
        assert!(line.contains("machine=set"));
        assert!(line.contains("refresh=set"));
    }

    #[test]
    fn load_prefs_reads_legacy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.conf");
        let mut prefs = Prefs::new();
        prefs.hostname = "legacy-host".to_string();
        std::fs::write(&path, prefs.to_bytes()).unwrap();
        let loaded = load_prefs(&path).unwrap();
        assert_eq!(loaded.hostname, "legacy-host");
        assert!(load_prefs(&dir.path().join("missing.conf")).is_err());
    }
}
