use crate::engine::PeerStatus;
use crate::model::{AuthToken, NetMap, PingResult};
use crate::prefs::Prefs;
use crate::status::Status;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state of the agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    #[default]
    NoState,
    NeedsLogin,
    NeedsMachineAuth,
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::NoState => "NoState",
            State::NeedsLogin => "NeedsLogin",
            State::NeedsMachineAuth => "NeedsMachineAuth",
            State::Stopped => "Stopped",
            State::Starting => "Starting",
            State::Running => "Running",
        };
        f.write_str(name)
    }
}

/// Digest of the engine's raw status, cached by the agent and forwarded to
/// frontends.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineStatus {
    #[serde(default)]
    pub num_live: usize,
    #[serde(default)]
    pub live_derps: usize,
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub live_peers: HashMap<String, PeerStatus>,
}

/// Marker for notification fields that carry no payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

pub type NotifyFn = Arc<dyn Fn(Notify) + Send + Sync>;

/// Asynchronous notification from the backend to a frontend. Any subset of
/// the optional fields may be populated.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Notify {
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_finished: Option<Empty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefs: Option<Prefs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_map: Option<NetMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browse_to_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_log_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_result: Option<PingResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

/// Options for `Backend::start`. Either `prefs` or `state_key` must be set.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub state_key: String,
    #[serde(default)]
    pub prefs: Option<Prefs>,
    #[serde(default)]
    pub auth_key: String,
    #[serde(default)]
    pub legacy_config_path: Option<PathBuf>,
    #[serde(default)]
    pub frontend_log_id: String,
    /// Sink for notifications; installed by the command server, never sent
    /// over the wire.
    #[serde(skip)]
    pub notify: Option<NotifyFn>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("state_key", &self.state_key)
            .field("prefs", &self.prefs)
            .field("auth_key", &!self.auth_key.is_empty())
            .field("legacy_config_path", &self.legacy_config_path)
            .field("frontend_log_id", &self.frontend_log_id)
            .field("notify", &self.notify.is_some())
            .finish()
    }
}

/// The operations a frontend can drive, implemented by the agent and by test
/// fakes. All post-acceptance errors surface asynchronously as
/// notifications, so most operations return nothing.
pub trait Backend: Send + Sync {
    fn start(&self, opts: Options) -> Result<()>;
    fn start_login_interactive(&self);
    fn login(&self, token: Option<AuthToken>);
    fn logout(&self);
    fn set_prefs(&self, prefs: Prefs);
    fn request_engine_status(&self);
    fn request_status(&self);
    fn fake_expire_after(&self, after: Duration);
    fn ping(&self, ip: &str);
}
