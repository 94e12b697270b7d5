use crate::model::{AuthToken, Hostinfo, NetInfo, NetMap};
use crate::prefs::Persist;
use anyhow::Result;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginMode {
    /// Resume whatever credentials exist; never pops a browser.
    Default,
    /// The user asked to log in; an auth URL may be produced.
    Interactive,
}

/// Posted by the control client whenever anything changes upstream. Any
/// subset of the fields may be populated.
#[derive(Clone, Debug, Default)]
pub struct ControlStatus {
    pub err: Option<String>,
    pub login_finished: bool,
    pub persist: Option<Persist>,
    pub net_map: Option<NetMap>,
    pub url: String,
}

#[derive(Clone, Debug, Default)]
pub struct ControlOptions {
    pub server_url: String,
    pub auth_key: String,
    pub persist: Persist,
    pub hostinfo: Hostinfo,
    pub keep_alive: bool,
    pub disco_public_key: String,
}

pub type StatusFn = Box<dyn Fn(ControlStatus) + Send + Sync>;

/// The control-plane client surface the agent consumes. Implementations own
/// the coordination-server protocol and authentication flows.
pub trait ControlClient: Send + Sync {
    fn set_status_callback(&self, cb: StatusFn);

    fn login(&self, token: Option<&AuthToken>, mode: LoginMode);

    fn logout(&self);

    /// A paused client keeps its session but stops polling for maps.
    fn set_paused(&self, paused: bool);

    fn set_hostinfo(&self, hostinfo: &Hostinfo);

    fn set_netinfo(&self, netinfo: &NetInfo);

    fn update_endpoints(&self, endpoints: &[String]);

    /// Whether authentication is stuck waiting on a human.
    fn auth_cant_continue(&self) -> bool;

    fn shutdown(&self);
}

/// Constructs a control client for the options the agent derived. Injected
/// so embedders (and tests) pick the implementation.
pub type ControlFactory =
    Box<dyn Fn(ControlOptions) -> Result<Arc<dyn ControlClient>> + Send + Sync>;
