use crate::backend::{Backend, EngineStatus, Empty, Notify, NotifyFn, Options, State};
use crate::control::{ControlClient, ControlFactory, ControlOptions, ControlStatus, LoginMode};
use crate::dns::{self, DnsConfig};
use crate::engine::{self, Engine, EngineError};
use crate::filter::{self, Filter};
use crate::model::{AuthToken, Hostinfo, MachineStatus, NetInfo, NetMap, Service, ServiceProto};
use crate::policy;
use crate::portlist::{Poller, Port};
use crate::prefs::Prefs;
use crate::router::{self, RouterConfig};
use crate::status::{Status, StatusBuilder};
use crate::store::{StateStore, StoreError};
use crate::wgcfg::{self, WgConfig, WgConfigFlags};
use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use parking_lot::{Condvar, Mutex};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Once, Weak};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// The glue between the major pieces of a lightscale node: the control plane
/// (via a `ControlClient`), the data plane (via an `Engine`), and frontends
/// (via the `Backend` trait, usually served through a `BackendServer`).
///
/// The agent owns the overall state machine. Frontends, the control client
/// and the engine feed events in; advancing the machine pushes derived
/// configuration back out to zero or more of them.
pub struct Agent {
    me: Weak<Agent>,
    engine: Arc<dyn Engine>,
    store: Arc<dyn StateStore>,
    new_control: ControlFactory,
    backend_log_id: String,
    shutdown: AtomicBool,

    // Change-detection hash of the last installed filter's inputs.
    filter_hash: Mutex<String>,

    portpoll: Mutex<Option<Poller>>,
    portpoll_once: Once,

    // The cache. Held only over field reads and writes, never across I/O;
    // anything escaping the lock is cloned. The netmap is replaced whole and
    // never mutated in place, so snapshots stay valid after release.
    inner: Mutex<Inner>,

    // Engine status sequencing for stop_engine_and_wait. Acquired before
    // `inner` if both were ever needed; today no caller holds both.
    status_seq: Mutex<StatusSeq>,
    status_changed: Condvar,
}

#[derive(Default)]
struct Inner {
    notify: Option<NotifyFn>,
    control: Option<Arc<dyn ControlClient>>,
    state_key: String,
    prefs: Option<Prefs>,
    state: State,
    hostinfo: Option<Hostinfo>,
    net_map: Option<Arc<NetMap>>,
    engine_status: EngineStatus,
    endpoints: Vec<String>,
    blocked: bool,
    auth_url: String,
    interact: u32,
}

#[derive(Default)]
struct StatusSeq {
    seq: u64,
    closed: bool,
}

impl Agent {
    /// Returns an agent ready to run but not yet running; call `start`.
    pub fn new(
        engine: Arc<dyn Engine>,
        store: Arc<dyn StateStore>,
        new_control: ControlFactory,
        portpoll: Option<Poller>,
        backend_log_id: String,
    ) -> Arc<Agent> {
        // Block everything until start() installs a real configuration.
        engine.set_filter(Filter::allow_none());

        Arc::new_cyclic(|me| Agent {
            me: me.clone(),
            engine,
            store,
            new_control,
            backend_log_id,
            shutdown: AtomicBool::new(false),
            filter_hash: Mutex::new(String::new()),
            portpoll: Mutex::new(portpoll),
            portpoll_once: Once::new(),
            inner: Mutex::new(Inner::default()),
            status_seq: Mutex::new(StatusSeq::default()),
            status_changed: Condvar::new(),
        })
    }

    /// Halts the agent and its collaborators. The agent cannot be used
    /// afterwards.
    pub fn shutdown(&self) {
        let control = self.inner.lock().control.clone();
        if let Some(control) = control {
            control.shutdown();
        }
        self.shutdown.store(true, Ordering::SeqCst);
        {
            // Release anyone blocked in stop_engine_and_wait before the
            // engine goes away.
            let mut status = self.status_seq.lock();
            status.closed = true;
            self.status_changed.notify_all();
        }
        self.engine.close();
        self.engine.wait();
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// The latest cached network map, if any was received yet.
    pub fn net_map(&self) -> Option<Arc<NetMap>> {
        self.inner.lock().net_map.clone()
    }

    /// Aggregate status of the agent and its sub-components.
    pub fn status(&self) -> Status {
        let mut sb = StatusBuilder::default();
        self.engine.update_status(&mut sb);
        {
            let inner = self.inner.lock();
            if let Some(nm) = &inner.net_map {
                for peer in &nm.peers {
                    let tail_addr = peer
                        .addresses
                        .first()
                        .map(|a| a.addr().to_string())
                        .unwrap_or_default();
                    sb.add_peer(&peer.node_key, |entry| {
                        entry.in_network_map = true;
                        entry.user = peer.user.clone();
                        entry.tail_addr = tail_addr.clone();
                        entry.host_name = peer.hostinfo.hostname.clone();
                        entry.os = peer.hostinfo.os.clone();
                        entry.keep_alive = peer.keep_alive;
                        entry.created = peer.created;
                        entry.last_seen = peer.last_seen.unwrap_or(0);
                    });
                }
            }
        }
        sb.status()
    }

    /// Callback invoked by the control client whenever it posts a new
    /// status. This is where netmaps, packet filters, DNS and DERP maps get
    /// refreshed.
    pub fn on_control_status(&self, st: ControlStatus) {
        if let Some(err) = &st.err {
            warn!("control error: {err}");
            return;
        }
        if st.login_finished {
            // Auth completed; unblock the engine.
            self.block_engine_updates(false);
            self.auth_reconfig();
            self.send(Notify {
                login_finished: Some(Empty {}),
                ..Default::default()
            });
        }

        let had_map = st.net_map.is_some();
        let incoming_map = st.net_map;
        let mut prefs_changed = false;

        let (state_key, prefs, old_net_map, new_net_map, interact) = {
            let mut inner = self.inner.lock();
            if let Some(persist) = &st.persist {
                let current = inner.prefs.as_ref().and_then(|p| p.persist.as_ref());
                if current != Some(persist) {
                    prefs_changed = true;
                    if let Some(prefs) = inner.prefs.as_mut() {
                        prefs.persist = Some(persist.clone());
                    }
                }
            }
            let old_net_map = inner.net_map.clone();
            if let Some(nm) = incoming_map {
                inner.net_map = Some(Arc::new(nm));
            }
            if !st.url.is_empty() {
                inner.auth_url = st.url.clone();
            }
            if inner.state == State::NeedsLogin {
                if let Some(prefs) = inner.prefs.as_mut() {
                    if !prefs.want_running {
                        prefs_changed = true;
                    }
                    prefs.want_running = true;
                }
            }
            (
                inner.state_key.clone(),
                inner.prefs.clone(),
                old_net_map,
                inner.net_map.clone(),
                inner.interact,
            )
        };

        if prefs_changed {
            if let Some(prefs) = &prefs {
                if !state_key.is_empty() {
                    if let Err(err) = self.store.write_state(&state_key, &prefs.to_bytes()) {
                        warn!("failed to save new control state: {err}");
                        self.send(Notify {
                            err_message: Some(format!("saving prefs: {err}")),
                            ..Default::default()
                        });
                    }
                }
                self.send(Notify {
                    prefs: Some(prefs.clone()),
                    ..Default::default()
                });
            }
        }

        if had_map {
            if let Some(nm) = &new_net_map {
                if let Some(old) = &old_net_map {
                    let diff = nm.concise_diff_from(old);
                    if diff.trim().is_empty() {
                        info!("netmap diff: (none)");
                    } else {
                        info!("netmap diff:\n{diff}");
                    }
                }

                self.update_filter(Some(nm), prefs.as_ref());
                self.engine.set_network_map(nm);

                if !dns::dns_maps_equal(Some(nm), old_net_map.as_deref()) {
                    self.engine.set_dns_map(dns::dns_map(nm));
                }

                let disable_derp = prefs.as_ref().map(|p| p.disable_derp).unwrap_or(false);
                if disable_derp {
                    self.engine.set_derp_map(None);
                } else {
                    self.engine.set_derp_map(nm.derp_map.as_ref());
                }

                self.send(Notify {
                    net_map: Some((**nm).clone()),
                    ..Default::default()
                });
            }
        }

        if !st.url.is_empty() {
            let head: String = st.url.chars().take(20).collect();
            info!("received auth url: {head}...");
            if interact > 0 {
                self.pop_browser_auth_now();
            }
        }

        self.advance();
        // Over-invocation is acceptable here; change detection keeps the
        // engine push cheap. This is how netmap data reaches the router.
        self.auth_reconfig();
    }

    /// Callback invoked by the engine whenever it posts a new status. This
    /// keeps the cached endpoints current both here and upstream.
    pub fn on_engine_status(&self, update: Result<engine::Status, EngineError>) {
        let st = match update {
            Ok(st) => st,
            Err(err) => {
                warn!("engine status error: {err}");
                return;
            }
        };

        let es = self.parse_engine_status(&st);

        let control = {
            let mut inner = self.inner.lock();
            inner.engine_status = es.clone();
            inner.endpoints = st.local_addrs.clone();
            inner.control.clone()
        };
        if let Some(control) = control {
            control.update_endpoints(&st.local_addrs);
        }

        self.advance();

        {
            let mut status = self.status_seq.lock();
            status.seq += 1;
            self.status_changed.notify_all();
        }

        self.send(Notify {
            engine: Some(es),
            ..Default::default()
        });
    }

    fn parse_engine_status(&self, st: &engine::Status) -> EngineStatus {
        let mut ret = EngineStatus {
            live_derps: st.derps,
            ..Default::default()
        };
        let mut peer_stats = Vec::new();
        for peer in &st.peers {
            if peer.last_handshake != 0 {
                ret.num_live += 1;
                peer_stats.push(format!("{}/{}", peer.rx_bytes, peer.tx_bytes));
                ret.live_peers.insert(peer.node_key.clone(), peer.clone());
            }
            ret.rx_bytes += peer.rx_bytes;
            ret.tx_bytes += peer.tx_bytes;
        }
        if !peer_stats.is_empty() {
            debug!("live peer rx/tx: {}", peer_stats.join(" "));
        }
        ret
    }

    /// Callback invoked by the engine when path discovery learns something.
    pub fn on_net_info(&self, ni: NetInfo) {
        let control = {
            let mut inner = self.inner.lock();
            if let Some(hostinfo) = inner.hostinfo.as_mut() {
                hostinfo.net_info = Some(ni.clone());
            }
            inner.control.clone()
        };
        if let Some(control) = control {
            control.set_netinfo(&ni);
        }
    }

    /// Consumes one port-list snapshot: keeps the interesting services,
    /// refreshes hostinfo, and forwards it upstream.
    pub fn on_port_list(&self, ports: &[Port]) {
        let mut services = Vec::new();
        for port in ports {
            let Some(proto) = ServiceProto::from_portlist(&port.proto) else {
                continue;
            };
            let svc = Service {
                proto,
                port: port.port,
                description: port.process.clone(),
            };
            if policy::is_interesting_service(&svc, std::env::consts::OS) {
                services.push(svc);
            }
        }

        let hostinfo = {
            let mut inner = self.inner.lock();
            let hostinfo = inner.hostinfo.get_or_insert_with(Hostinfo::new);
            hostinfo.services = services;
            hostinfo.clone()
        };
        self.do_set_hostinfo_filter_services(hostinfo);
    }

    /// Applies the configuration in `opts` and starts the state machine.
    pub fn start(&self, opts: Options) -> Result<()> {
        if opts.prefs.is_none() && opts.state_key.is_empty() {
            bail!("no state key or prefs provided");
        }
        match &opts.prefs {
            Some(prefs) => info!("start: {}", prefs.pretty()),
            None => info!("start"),
        }

        let old_control = self.inner.lock().control.take();
        if let Some(old) = old_control {
            // A reconnecting frontend currently triggers a full relogin and
            // reconfigure cycle.
            old.shutdown();
        }

        let (prefs, state_key) = load_state(
            self.store.as_ref(),
            &opts.state_key,
            opts.prefs.clone(),
            opts.legacy_config_path.as_deref(),
        )
        .context("loading requested state")?;

        let mut hostinfo = Hostinfo::new();
        hostinfo.backend_log_id = self.backend_log_id.clone();
        hostinfo.frontend_log_id = opts.frontend_log_id.clone();
        let server_url = prefs.control_url.clone();
        hostinfo
            .routable_ips
            .extend(prefs.advertise_routes.iter().copied());
        hostinfo
            .request_tags
            .extend(prefs.advertise_tags.iter().cloned());
        apply_prefs_to_hostinfo(&mut hostinfo, &prefs);

        let (persist, endpoints);
        {
            let mut inner = self.inner.lock();
            if let Some(prev) = &inner.hostinfo {
                // Keep what earlier pollers and path discovery already found.
                hostinfo.services = prev.services.clone();
                hostinfo.net_info = prev.net_info.clone();
            }
            inner.hostinfo = Some(hostinfo.clone());
            inner.state = State::NoState;
            inner.state_key = state_key;
            inner.prefs = Some(prefs.clone());
            inner.notify = opts.notify.clone();
            inner.net_map = None;
            persist = prefs.persist.clone().unwrap_or_default();
            endpoints = inner.endpoints.clone();
        }

        self.update_filter(None, None);

        let control = (self.new_control)(ControlOptions {
            server_url,
            auth_key: opts.auth_key.clone(),
            persist,
            hostinfo: hostinfo.clone(),
            keep_alive: true,
            disco_public_key: self.engine.disco_public_key(),
        })?;

        // Hostinfo is fully assembled; the poller may start writing to it.
        self.portpoll_once.call_once(|| {
            if let Some(poller) = self.portpoll.lock().take() {
                let agent = self.me.clone();
                let spawned = thread::Builder::new()
                    .name("portlist-reader".to_string())
                    .spawn(move || read_poller(agent, poller));
                if let Err(err) = spawned {
                    warn!("skipping portlist reader: {err}");
                }
            }
        });

        self.inner.lock().control = Some(control.clone());
        if !endpoints.is_empty() {
            control.update_endpoints(&endpoints);
        }

        let agent = self.me.clone();
        control.set_status_callback(Box::new(move |st| {
            if let Some(agent) = agent.upgrade() {
                agent.on_control_status(st);
            }
        }));
        let agent = self.me.clone();
        self.engine.set_status_callback(Box::new(move |st| {
            if let Some(agent) = agent.upgrade() {
                agent.on_engine_status(st);
            }
        }));
        let agent = self.me.clone();
        self.engine.set_net_info_callback(Box::new(move |ni| {
            if let Some(agent) = agent.upgrade() {
                agent.on_net_info(ni);
            }
        }));

        let backend_log_id = self.backend_log_id.clone();
        info!(
            "backend log ids: be={backend_log_id} fe={}",
            opts.frontend_log_id
        );
        self.send(Notify {
            backend_log_id: Some(backend_log_id),
            ..Default::default()
        });
        self.send(Notify {
            prefs: Some(prefs),
            ..Default::default()
        });

        control.login(None, LoginMode::Default);
        Ok(())
    }

    /// Updates the packet filter in the engine from the given netmap and
    /// prefs. Change detection stays first in this function: returning
    /// early before the hash update is how wrong filters get installed.
    fn update_filter(&self, net_map: Option<&NetMap>, prefs: Option<&Prefs>) {
        let have_netmap = net_map.is_some();
        let mut addresses: &[IpNet] = &[];
        let mut packet_filter: &[filter::Match] = &[];
        let mut advertise_routes: &[IpNet] = &[];
        // Be conservative while prefs are not ready.
        let shields_up = prefs.map(|p| p.shields_up).unwrap_or(true);
        if let Some(nm) = net_map {
            addresses = &nm.addresses;
            packet_filter = &nm.packet_filter;
        }
        if let Some(prefs) = prefs {
            advertise_routes = &prefs.advertise_routes;
        }

        let hash = filter::inputs_hash(
            have_netmap,
            addresses,
            packet_filter,
            advertise_routes,
            shields_up,
        );
        {
            let mut last = self.filter_hash.lock();
            if *last == hash {
                return;
            }
            *last = hash;
        }

        let Some(nm) = net_map else {
            info!("packet filter: (not ready yet)");
            self.engine.set_filter(Filter::allow_none());
            return;
        };

        let local_nets = filter::local_nets(&[nm.addresses.as_slice(), advertise_routes]);
        if shields_up {
            info!("packet filter: (shields up)");
            self.engine.set_filter(Filter::new(Vec::new(), local_nets));
        } else {
            info!("packet filter: {} match rules", nm.packet_filter.len());
            self.engine
                .set_filter(Filter::new(nm.packet_filter.clone(), local_nets));
        }
    }

    /// Delivers `n` to the connected frontend, or drops it with a log line
    /// when none is connected.
    fn send(&self, mut n: Notify) {
        let notify = self.inner.lock().notify.clone();
        match notify {
            Some(notify) => {
                n.version = crate::VERSION.to_string();
                notify(n);
            }
            None => debug!("no frontend connected; dropping {n:?}"),
        }
    }

    /// Shuts the data plane down and hands the pending auth URL to the
    /// frontend. The URL is one-shot: it is cleared here.
    fn pop_browser_auth_now(&self) {
        let url = {
            let mut inner = self.inner.lock();
            inner.interact = 0;
            std::mem::take(&mut inner.auth_url)
        };
        info!("pop browser auth: have url={}", !url.is_empty());

        self.block_engine_updates(true);
        self.stop_engine_and_wait();
        self.send(Notify {
            browse_to_url: Some(url),
            ..Default::default()
        });
        if self.state() == State::Running {
            self.enter_state(State::Starting);
        }
    }

    pub fn login(&self, token: Option<AuthToken>) {
        let control = self.control_or_die();
        control.login(token.as_ref(), LoginMode::Interactive);
    }

    /// Requests a new interactive login, unless one is already in flight, in
    /// which case the pending auth URL is re-delivered.
    pub fn start_login_interactive(&self) {
        let (control, url) = {
            let mut inner = self.inner.lock();
            let control = inner
                .control
                .clone()
                .expect("agent not started: no control client");
            inner.interact += 1;
            (control, inner.auth_url.clone())
        };
        info!("start login interactive: have url={}", !url.is_empty());

        if !url.is_empty() {
            self.pop_browser_auth_now();
        } else {
            control.login(None, LoginMode::Interactive);
        }
    }

    pub fn logout(&self) {
        let control = {
            let mut inner = self.inner.lock();
            inner.net_map = None;
            inner
                .control
                .clone()
                .expect("agent not started: no control client")
        };
        control.logout();
        {
            // A status that was in flight during logout may have
            // re-installed a map.
            let mut inner = self.inner.lock();
            inner.net_map = None;
        }
        self.advance();
    }

    /// Moves the cached netmap's expiry up to `after` from now, replacing
    /// the map by full copy. Test hook for the expiry path.
    pub fn fake_expire_after(&self, after: Duration) {
        info!("fake expire after: {after:?}");
        let replaced = {
            let mut inner = self.inner.lock();
            let Some(nm) = &inner.net_map else {
                return;
            };
            let mut copy = (**nm).clone();
            let new_expiry = now_unix() + after.as_secs() as i64;
            if copy.expiry == 0 || copy.expiry > new_expiry {
                copy.expiry = new_expiry;
            }
            let copy = Arc::new(copy);
            inner.net_map = Some(copy.clone());
            (*copy).clone()
        };
        self.send(Notify {
            net_map: Some(replaced),
            ..Default::default()
        });
    }

    pub fn ping(&self, ip: &str) {
        let addr: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!("ignoring ping request to invalid ip {ip:?}");
                return;
            }
        };
        let agent = self.me.clone();
        self.engine.ping(
            addr,
            Box::new(move |result| {
                if let Some(agent) = agent.upgrade() {
                    agent.send(Notify {
                        ping_result: Some(result),
                        ..Default::default()
                    });
                }
            }),
        );
    }

    pub fn request_engine_status(&self) {
        self.engine.request_status();
    }

    pub fn request_status(&self) {
        let status = self.status();
        self.send(Notify {
            status: Some(status),
            ..Default::default()
        });
    }

    fn shields_are_up(&self) -> bool {
        let inner = self.inner.lock();
        match &inner.prefs {
            Some(prefs) => prefs.shields_up,
            // No prefs yet: assume shields up.
            None => true,
        }
    }

    /// Saves new user preferences and propagates them through the system.
    pub fn set_prefs(&self, new_prefs: Prefs) {
        let (old, new_prefs, net_map, state_key, new_hostinfo, hostinfo_changed) = {
            let mut inner = self.inner.lock();
            let old = inner.prefs.clone().expect("agent not started: no prefs");
            let mut new_prefs = new_prefs;
            // The frontend is never allowed to override identity state.
            new_prefs.persist = old.persist.clone();
            inner.prefs = Some(new_prefs.clone());

            let old_hostinfo = inner.hostinfo.clone();
            let mut hostinfo = old_hostinfo.clone().unwrap_or_else(Hostinfo::new);
            hostinfo.routable_ips = new_prefs.advertise_routes.clone();
            apply_prefs_to_hostinfo(&mut hostinfo, &new_prefs);
            inner.hostinfo = Some(hostinfo.clone());
            let hostinfo_changed = old_hostinfo.as_ref() != Some(&hostinfo);

            (
                old,
                new_prefs,
                inner.net_map.clone(),
                inner.state_key.clone(),
                hostinfo,
                hostinfo_changed,
            )
        };

        if !state_key.is_empty() {
            if let Err(err) = self.store.write_state(&state_key, &new_prefs.to_bytes()) {
                warn!("failed to save new prefs: {err}");
                self.send(Notify {
                    err_message: Some(format!("saving prefs: {err}")),
                    ..Default::default()
                });
            }
        }
        info!("set prefs: {}", new_prefs.pretty());

        if old.shields_up != new_prefs.shields_up || hostinfo_changed {
            self.do_set_hostinfo_filter_services(new_hostinfo);
        }

        self.update_filter(net_map.as_deref(), Some(&new_prefs));

        let turn_derp_off = new_prefs.disable_derp && !old.disable_derp;
        let turn_derp_on = !new_prefs.disable_derp && old.disable_derp;
        if turn_derp_off {
            self.engine.set_derp_map(None);
        } else if turn_derp_on {
            if let Some(nm) = &net_map {
                self.engine.set_derp_map(nm.derp_map.as_ref());
            }
        }

        if old.want_running != new_prefs.want_running {
            self.advance();
        } else {
            self.auth_reconfig();
        }

        self.send(Notify {
            prefs: Some(new_prefs),
            ..Default::default()
        });
    }

    /// Pushes hostinfo to the control plane, masking advertised services to
    /// empty while shields are up.
    fn do_set_hostinfo_filter_services(&self, mut hostinfo: Hostinfo) {
        if self.shields_are_up() {
            hostinfo.services = Vec::new();
        }
        let control = self.inner.lock().control.clone();
        // The control client might not be started yet.
        if let Some(control) = control {
            control.set_hostinfo(&hostinfo);
        }
    }

    /// While blocked, auth_reconfig is a no-op; nothing reaches the engine.
    fn block_engine_updates(&self, block: bool) {
        info!("block engine updates: {block}");
        self.inner.lock().blocked = block;
    }

    /// Pushes a fresh configuration into the engine from the cached netmap
    /// and prefs, unless engine updates are blocked.
    fn auth_reconfig(&self) {
        let (blocked, prefs, net_map) = {
            let inner = self.inner.lock();
            (inner.blocked, inner.prefs.clone(), inner.net_map.clone())
        };

        if blocked {
            debug!("auth reconfig: blocked, skipping");
            return;
        }
        let Some(nm) = net_map else {
            debug!("auth reconfig: netmap not yet valid, skipping");
            return;
        };
        let Some(prefs) = prefs else {
            debug!("auth reconfig: no prefs, skipping");
            return;
        };
        if !prefs.want_running {
            debug!("auth reconfig: skipping because not running");
            return;
        }

        let mut flags = WgConfigFlags {
            allow_single_hosts: prefs.allow_single_hosts,
            ..Default::default()
        };
        if prefs.route_all {
            flags.allow_default_route = true;
            flags.allow_subnet_routes = true;
            flags.hack_default_route = true;
        }

        let cfg = wgcfg::wg_config(&nm, flags);
        let mut rcfg = router::router_config(&cfg, &prefs);

        // With corp_dns off, rcfg.dns stays the zero value.
        if prefs.corp_dns {
            let mut domains = nm.dns.domains.clone();
            let mut proxied = nm.dns.proxied;
            if proxied {
                if nm.dns.nameservers.is_empty() {
                    warn!("dns proxied but no nameservers");
                    proxied = false;
                } else {
                    // Domains for proxying come first to avoid leaking
                    // queries upstream.
                    let mut all = dns::domains_for_proxying(&nm);
                    all.extend(domains);
                    domains = all;
                }
            }
            rcfg.dns = DnsConfig {
                nameservers: nm.dns.nameservers.clone(),
                domains,
                per_domain: nm.dns.per_domain,
                proxied,
            };
        }

        match self.engine.reconfig(&cfg, &rcfg) {
            Err(EngineError::NoChanges) => {}
            res => info!(
                "auth reconfig: ra={} dns={}: {:?}",
                prefs.route_all,
                prefs.corp_dns,
                res.err()
            ),
        }
    }

    /// Transitions into `new_state`, performing that state's side effects.
    /// A transition to the current state is a no-op.
    fn enter_state(&self, new_state: State) {
        let (old_state, want_running, control) = {
            let mut inner = self.inner.lock();
            let old_state = inner.state;
            inner.state = new_state;
            (
                old_state,
                inner
                    .prefs
                    .as_ref()
                    .map(|p| p.want_running)
                    .unwrap_or(false),
                inner.control.clone(),
            )
        };

        if old_state == new_state {
            return;
        }
        info!("state transition {old_state} -> {new_state} (want_running={want_running})");
        self.send(Notify {
            state: Some(new_state),
            ..Default::default()
        });

        if let Some(control) = &control {
            control.set_paused(new_state == State::Stopped);
        }

        match new_state {
            State::NeedsLogin => {
                self.block_engine_updates(true);
                // Nothing may pass until a map arrives again.
                self.engine.set_filter(Filter::allow_none());
                *self.filter_hash.lock() = String::new();
                self.reconfig_engine_down();
            }
            State::Stopped => self.reconfig_engine_down(),
            State::Starting | State::NeedsMachineAuth => {
                self.auth_reconfig();
                // A fresh status lets Starting promote to Running.
                self.engine.request_status();
            }
            State::Running => {}
            State::NoState => warn!("unexpected transition to NoState"),
        }
    }

    fn reconfig_engine_down(&self) {
        if let Err(err) = self
            .engine
            .reconfig(&WgConfig::default(), &RouterConfig::default())
        {
            if err != EngineError::NoChanges {
                warn!("reconfig(down): {err}");
            }
        }
    }

    /// Computes the state the agent should be in from its cached inputs.
    fn next_state(&self) -> State {
        let (control, net_map, state, want_running, num_live, live_derps) = {
            let inner = self.inner.lock();
            (
                inner
                    .control
                    .clone()
                    .expect("agent not started: no control client"),
                inner.net_map.clone(),
                inner.state,
                inner
                    .prefs
                    .as_ref()
                    .map(|p| p.want_running)
                    .unwrap_or(false),
                inner.engine_status.num_live,
                inner.engine_status.live_derps,
            )
        };

        let Some(nm) = net_map else {
            return if control.auth_cant_continue() {
                // Auth was interrupted or is waiting on a URL visit; it will
                // not proceed without human help.
                State::NeedsLogin
            } else {
                // Auth or the map request still needs to finish.
                state
            };
        };
        if !want_running {
            return State::Stopped;
        }
        if nm.expiry != 0 && nm.expiry <= now_unix() {
            return State::NeedsLogin;
        }
        if nm.machine_status != MachineStatus::Authorized {
            return State::NeedsMachineAuth;
        }
        if state == State::NeedsMachineAuth {
            // Authorization just arrived.
            return State::Starting;
        }
        if state == State::Starting {
            return if num_live > 0 || live_derps > 0 {
                State::Running
            } else {
                state
            };
        }
        if state == State::Running {
            return State::Running;
        }
        State::Starting
    }

    /// Sole entry point of the state machine; invoked from every callback
    /// that feeds events in.
    fn advance(&self) {
        let next = self.next_state();
        self.enter_state(next);
    }

    /// Deconfigures the data plane and waits for the engine to confirm with
    /// a status update.
    fn stop_engine_and_wait(&self) {
        info!("stop engine and wait...");
        self.reconfig_engine_down();
        self.request_engine_status_and_wait();
        info!("stop engine and wait: done");
    }

    /// Blocks until a status that postdates this request arrives, or the
    /// agent shuts down. Statuses are counted, so an update that predates
    /// the request cannot release the wait early.
    fn request_engine_status_and_wait(&self) {
        let mut status = self.status_seq.lock();
        let seen = status.seq;
        let engine = self.engine.clone();
        // Request from another thread: an engine that answers synchronously
        // must not run the callback while we hold the status lock.
        thread::spawn(move || engine.request_status());
        while status.seq <= seen && !status.closed {
            self.status_changed.wait(&mut status);
        }
    }

    fn control_or_die(&self) -> Arc<dyn ControlClient> {
        self.inner
            .lock()
            .control
            .clone()
            .expect("agent not started: no control client")
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Backend for Agent {
    fn start(&self, opts: Options) -> Result<()> {
        Agent::start(self, opts)
    }
    fn start_login_interactive(&self) {
        Agent::start_login_interactive(self)
    }
    fn login(&self, token: Option<AuthToken>) {
        Agent::login(self, token)
    }
    fn logout(&self) {
        Agent::logout(self)
    }
    fn set_prefs(&self, prefs: Prefs) {
        Agent::set_prefs(self, prefs)
    }
    fn request_engine_status(&self) {
        Agent::request_engine_status(self)
    }
    fn request_status(&self) {
        Agent::request_status(self)
    }
    fn fake_expire_after(&self, after: Duration) {
        Agent::fake_expire_after(self, after)
    }
    fn ping(&self, ip: &str) {
        Agent::ping(self, ip)
    }
}

/// Resolves prefs from the key/prefs/legacy-path combination handed to
/// `start`. Returns the prefs and the state key to persist under ("" when
/// the frontend owns the state).
fn load_state(
    store: &dyn StateStore,
    key: &str,
    prefs: Option<Prefs>,
    legacy_path: Option<&Path>,
) -> Result<(Prefs, String)> {
    if key.is_empty() {
        // The frontend fully owns the state; obey it.
        let prefs = prefs.context("neither state key nor prefs provided")?;
        info!("using frontend prefs");
        return Ok((prefs, String::new()));
    }

    if let Some(prefs) = &prefs {
        // The frontend is migrating its state into the backend store.
        info!("importing frontend prefs into backend store");
        store
            .write_state(key, &prefs.to_bytes())
            .context("store.write_state")?;
    }

    info!("using backend prefs");
    match store.read_state(key) {
        Ok(bytes) => {
            let prefs = Prefs::from_bytes(&bytes).context("parsing stored prefs")?;
            Ok((prefs, key.to_string()))
        }
        Err(StoreError::NotExist) => {
            if let Some(path) = legacy_path {
                match crate::prefs::load_prefs(path) {
                    Ok(prefs) => {
                        info!("imported state from legacy config for {key:?}");
                        return Ok((prefs, key.to_string()));
                    }
                    Err(err) => warn!("failed to load legacy prefs: {err}"),
                }
            } else {
                info!("created empty state for {key:?}");
            }
            Ok((Prefs::new(), key.to_string()))
        }
        Err(err) => Err(err).with_context(|| format!("store.read_state({key:?})")),
    }
}

fn apply_prefs_to_hostinfo(hostinfo: &mut Hostinfo, prefs: &Prefs) {
    if !prefs.hostname.is_empty() {
        hostinfo.hostname = prefs.hostname.clone();
    }
    if !prefs.os_version.is_empty() {
        hostinfo.os_version = prefs.os_version.clone();
    }
    if !prefs.device_model.is_empty() {
        hostinfo.device_model = prefs.device_model.clone();
    }
}

/// Reader thread consuming port-list snapshots until the scanner goes away
/// or the agent shuts down.
fn read_poller(agent: Weak<Agent>, poller: Poller) {
    loop {
        match poller.recv_timeout(Duration::from_secs(1)) {
            Ok(ports) => {
                let Some(agent) = agent.upgrade() else { return };
                if agent.is_shut_down() {
                    return;
                }
                agent.on_port_list(&ports);
            }
            Err(RecvTimeoutError::Timeout) => match agent.upgrade() {
                Some(agent) if !agent.is_shut_down() => continue,
                _ => return,
            },
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::StatusFn;
    use crate::engine::{NetInfoCallback, PeerStatus, PingCallback, Status as RawStatus, StatusCallback};
    use crate::model::{PingResult, Peer};
    use crate::prefs::Persist;
    use crate::store::MemStore;

    #[derive(Default)]
    struct FakeEngineState {
        filters: Vec<Filter>,
        reconfigs: Vec<(WgConfig, RouterConfig)>,
        derp_maps: Vec<bool>,
        dns_maps: usize,
        network_maps: usize,
        status_requests: usize,
        closed: bool,
    }

    struct FakeEngine {
        state: Mutex<FakeEngineState>,
        status_cb: Mutex<Option<StatusCallback>>,
        net_info_cb: Mutex<Option<NetInfoCallback>>,
        /// Answer request_status with an empty status immediately.
        auto_status: AtomicBool,
    }

    impl Default for FakeEngine {
        fn default() -> Self {
            FakeEngine {
                state: Mutex::new(FakeEngineState::default()),
                status_cb: Mutex::new(None),
                net_info_cb: Mutex::new(None),
                auto_status: AtomicBool::new(true),
            }
        }
    }

    impl FakeEngine {
        fn deliver_status(&self, st: RawStatus) {
            let cb = self.status_cb.lock().take();
            if let Some(cb) = cb {
                cb(Ok(st));
                *self.status_cb.lock() = Some(cb);
            }
        }

        fn deliver_net_info(&self, ni: NetInfo) {
            let cb = self.net_info_cb.lock().take();
            if let Some(cb) = cb {
                cb(ni);
                *self.net_info_cb.lock() = Some(cb);
            }
        }

        fn last_filter(&self) -> Option<Filter> {
            self.state.lock().filters.last().cloned()
        }

        fn filter_count(&self) -> usize {
            self.state.lock().filters.len()
        }

        fn reconfig_count(&self) -> usize {
            self.state.lock().reconfigs.len()
        }

        fn last_reconfig(&self) -> Option<(WgConfig, RouterConfig)> {
            self.state.lock().reconfigs.last().cloned()
        }
    }

    impl Engine for FakeEngine {
        fn reconfig(&self, wg: &WgConfig, router: &RouterConfig) -> Result<(), EngineError> {
            let mut state = self.state.lock();
            if state.reconfigs.last() == Some(&(wg.clone(), router.clone())) {
                return Err(EngineError::NoChanges);
            }
            state.reconfigs.push((wg.clone(), router.clone()));
            Ok(())
        }
        fn set_filter(&self, filter: Filter) {
            self.state.lock().filters.push(filter);
        }
        fn get_filter(&self) -> Option<Filter> {
            self.last_filter()
        }
        fn set_status_callback(&self, cb: StatusCallback) {
            *self.status_cb.lock() = Some(cb);
        }
        fn set_net_info_callback(&self, cb: NetInfoCallback) {
            *self.net_info_cb.lock() = Some(cb);
        }
        fn request_status(&self) {
            self.state.lock().status_requests += 1;
            if self.auto_status.load(Ordering::SeqCst) {
                self.deliver_status(RawStatus::default());
            }
        }
        fn set_network_map(&self, _nm: &NetMap) {
            self.state.lock().network_maps += 1;
        }
        fn set_derp_map(&self, map: Option<&crate::model::DerpMap>) {
            self.state.lock().derp_maps.push(map.is_some());
        }
        fn set_dns_map(&self, _map: crate::dns::DnsMap) {
            self.state.lock().dns_maps += 1;
        }
        fn ping(&self, ip: IpAddr, cb: PingCallback) {
            cb(PingResult {
                ip: ip.to_string(),
                latency_seconds: 0.001,
                ..Default::default()
            });
        }
        fn disco_public_key(&self) -> String {
            "disco-key".to_string()
        }
        fn update_status(&self, sb: &mut StatusBuilder) {
            sb.add_peer("key-engine-only", |p| p.in_engine = true);
        }
        fn close(&self) {
            self.state.lock().closed = true;
        }
        fn wait(&self) {}
    }

    #[derive(Default)]
    struct FakeControlState {
        logins: Vec<LoginMode>,
        logouts: usize,
        paused: Vec<bool>,
        hostinfos: Vec<Hostinfo>,
        netinfos: Vec<NetInfo>,
        endpoints: Vec<Vec<String>>,
        shutdowns: usize,
    }

    #[derive(Default)]
    struct FakeControl {
        state: Mutex<FakeControlState>,
        status_cb: Mutex<Option<StatusFn>>,
        auth_cant_continue: AtomicBool,
    }

    impl FakeControl {
        fn deliver(&self, st: ControlStatus) {
            let cb = self.status_cb.lock().take();
            if let Some(cb) = cb {
                cb(st);
                *self.status_cb.lock() = Some(cb);
            }
        }

        fn set_auth_cant_continue(&self, stuck: bool) {
            self.auth_cant_continue.store(stuck, Ordering::SeqCst);
        }

        fn last_hostinfo(&self) -> Option<Hostinfo> {
            self.state.lock().hostinfos.last().cloned()
        }
    }

    impl ControlClient for FakeControl {
        fn set_status_callback(&self, cb: StatusFn) {
            *self.status_cb.lock() = Some(cb);
        }
        fn login(&self, _token: Option<&AuthToken>, mode: LoginMode) {
            self.state.lock().logins.push(mode);
        }
        fn logout(&self) {
            self.state.lock().logouts += 1;
        }
        fn set_paused(&self, paused: bool) {
            self.state.lock().paused.push(paused);
        }
        fn set_hostinfo(&self, hostinfo: &Hostinfo) {
            self.state.lock().hostinfos.push(hostinfo.clone());
        }
        fn set_netinfo(&self, netinfo: &NetInfo) {
            self.state.lock().netinfos.push(netinfo.clone());
        }
        fn update_endpoints(&self, endpoints: &[String]) {
            self.state.lock().endpoints.push(endpoints.to_vec());
        }
        fn auth_cant_continue(&self) -> bool {
            self.auth_cant_continue.load(Ordering::SeqCst)
        }
        fn shutdown(&self) {
            self.state.lock().shutdowns += 1;
        }
    }

    struct Harness {
        agent: Arc<Agent>,
        engine: Arc<FakeEngine>,
        control: Arc<FakeControl>,
        store: Arc<MemStore>,
        control_options: Arc<Mutex<Vec<ControlOptions>>>,
        notifications: Arc<Mutex<Vec<Notify>>>,
    }

    impl Harness {
        fn notifications(&self) -> Vec<Notify> {
            self.notifications.lock().clone()
        }

        fn states(&self) -> Vec<State> {
            self.notifications().iter().filter_map(|n| n.state).collect()
        }
    }

    fn new_harness(poller: Option<Poller>) -> Harness {
        let engine = Arc::new(FakeEngine::default());
        let control = Arc::new(FakeControl::default());
        let store = Arc::new(MemStore::new());
        let control_options = Arc::new(Mutex::new(Vec::new()));
        let factory_control = control.clone();
        let factory_options = control_options.clone();
        let agent = Agent::new(
            engine.clone(),
            store.clone(),
            Box::new(move |opts| {
                factory_options.lock().push(opts);
                Ok(factory_control.clone() as Arc<dyn ControlClient>)
            }),
            poller,
            "log-be-1".to_string(),
        );
        Harness {
            agent,
            engine,
            control,
            store,
            control_options,
            notifications: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn start_harness(poller: Option<Poller>) -> Harness {
        let harness = new_harness(poller);
        let sink = harness.notifications.clone();
        harness
            .agent
            .start(Options {
                state_key: "user-1".to_string(),
                notify: Some(Arc::new(move |n| sink.lock().push(n))),
                ..Default::default()
            })
            .unwrap();
        harness
    }

    fn authorized_netmap() -> NetMap {
        NetMap {
            name: "self.corp.example.net".to_string(),
            node_key: "key-self0000".to_string(),
            addresses: vec!["100.64.0.1/32".parse().unwrap()],
            peers: vec![Peer {
                name: "a.corp.example.net".to_string(),
                node_key: "key-aaaaaaaa".to_string(),
                addresses: vec!["100.64.0.2/32".parse().unwrap()],
                allowed_ips: vec!["100.64.0.2/32".parse().unwrap()],
                endpoints: vec!["203.0.113.10:41641".to_string()],
                ..Default::default()
            }],
            packet_filter: vec![filter::Match {
                srcs: vec!["100.64.0.0/10".parse().unwrap()],
                dsts: vec![filter::NetPortRange {
                    net: "100.64.0.1/32".parse().unwrap(),
                    ports: filter::PortRange::ANY,
                }],
            }],
            machine_status: MachineStatus::Authorized,
            ..Default::default()
        }
    }

    /// Drives a freshly started harness through login to Running.
    fn run_to_running(harness: &Harness) {
        harness.control.deliver(ControlStatus {
            login_finished: true,
            persist: Some(Persist {
                private_machine_key: "mkey".to_string(),
                private_node_key: "nkey".to_string(),
                login_name: "dev@example.net".to_string(),
                ..Default::default()
            }),
            net_map: Some(authorized_netmap()),
            ..Default::default()
        });
        harness.engine.deliver_status(RawStatus {
            peers: vec![PeerStatus {
                node_key: "key-aaaaaaaa".to_string(),
                rx_bytes: 1,
                tx_bytes: 1,
                last_handshake: now_unix(),
            }],
            ..Default::default()
        });
        assert_eq!(harness.agent.state(), State::Running);
    }

    #[test]
    fn start_requires_prefs_or_state_key() {
        let harness = new_harness(None);
        assert!(harness.agent.start(Options::default()).is_err());
    }

    #[test]
    fn new_agent_installs_allow_none_filter() {
        let harness = new_harness(None);
        assert_eq!(harness.engine.filter_count(), 1);
        assert!(harness.engine.last_filter().unwrap().is_allow_none());
    }

    #[test]
    fn cold_start_emits_log_id_then_prefs_then_needs_login() {
        let harness = start_harness(None);

        let notifications = harness.notifications();
        assert_eq!(notifications[0].backend_log_id.as_deref(), Some("log-be-1"));
        let prefs = notifications[1].prefs.as_ref().unwrap();
        assert_eq!(*prefs, Prefs::new());
        assert!(notifications.iter().all(|n| n.version == crate::VERSION));

        // A non-interactive login was kicked off.
        assert_eq!(harness.control.state.lock().logins, vec![LoginMode::Default]);

        // First control status: auth is stuck on a human.
        harness.control.set_auth_cant_continue(true);
        harness.control.deliver(ControlStatus::default());
        assert_eq!(harness.agent.state(), State::NeedsLogin);
        assert!(harness.states().contains(&State::NeedsLogin));
    }

    #[test]
    fn interactive_login_pops_browser_when_url_arrives() {
        let harness = start_harness(None);
        harness.control.set_auth_cant_continue(true);
        harness.control.deliver(ControlStatus::default());

        harness.agent.start_login_interactive();
        assert_eq!(
            harness.control.state.lock().logins,
            vec![LoginMode::Default, LoginMode::Interactive]
        );

        harness.control.deliver(ControlStatus {
            url: "https://login.lightscale.net/a/abcdef".to_string(),
            ..Default::default()
        });

        let urls: Vec<String> = harness
            .notifications()
            .iter()
            .filter_map(|n| n.browse_to_url.clone())
            .collect();
        assert_eq!(urls, vec!["https://login.lightscale.net/a/abcdef".to_string()]);

        // The URL is one-shot; a second interactive request starts a new
        // login instead of re-delivering it.
        harness.agent.start_login_interactive();
        assert_eq!(
            harness.control.state.lock().logins,
            vec![
                LoginMode::Default,
                LoginMode::Interactive,
                LoginMode::Interactive
            ]
        );
    }

    #[test]
    fn login_finished_with_authorized_map_reaches_running() {
        let harness = start_harness(None);
        harness.control.set_auth_cant_continue(true);
        harness.control.deliver(ControlStatus::default());

        run_to_running(&harness);

        let states = harness.states();
        let starting = states.iter().position(|s| *s == State::Starting).unwrap();
        let running = states.iter().position(|s| *s == State::Running).unwrap();
        assert!(starting < running);

        let notifications = harness.notifications();
        assert!(notifications.iter().any(|n| n.login_finished.is_some()));
        assert!(notifications.iter().any(|n| n.net_map.is_some()));

        // Persist from the control plane landed in prefs and in the store.
        let saved = Prefs::from_bytes(&harness.store.read_state("user-1").unwrap()).unwrap();
        assert_eq!(
            saved.persist.as_ref().unwrap().login_name,
            "dev@example.net"
        );
        assert!(saved.want_running);

        // The engine got a real configuration.
        let (wg, router) = harness.engine.last_reconfig().unwrap();
        assert_eq!(wg.peers.len(), 1);
        assert!(router
            .routes
            .contains(&"100.100.100.100/32".parse().unwrap()));

        // The installed filter matches a non-shielded derivation of the map.
        let installed = harness.engine.last_filter().unwrap();
        assert_eq!(installed.matches.len(), 1);
        assert!(!installed.local_nets.is_empty());

        // The map, DNS map and a status request all reached the engine.
        let engine_state = harness.engine.state.lock();
        assert!(engine_state.network_maps >= 1);
        assert!(engine_state.dns_maps >= 1);
        assert!(engine_state.status_requests >= 1);
    }

    #[test]
    fn set_prefs_preserves_persist_from_the_cache() {
        let harness = start_harness(None);
        run_to_running(&harness);

        let mut attempt = Prefs::new();
        attempt.persist = Some(Persist {
            private_machine_key: "attacker-key".to_string(),
            ..Default::default()
        });
        harness.agent.set_prefs(attempt);

        let sent = harness
            .notifications()
            .iter()
            .rev()
            .find_map(|n| n.prefs.clone())
            .unwrap();
        assert_eq!(
            sent.persist.as_ref().unwrap().login_name,
            "dev@example.net"
        );
        assert_ne!(
            sent.persist.as_ref().unwrap().private_machine_key,
            "attacker-key"
        );
    }

    #[test]
    fn shields_up_masks_services_and_empties_filter_matches() {
        let harness = start_harness(None);
        run_to_running(&harness);

        harness.agent.on_port_list(&[Port {
            proto: "tcp".to_string(),
            port: 22,
            process: "sshd".to_string(),
        }]);
        let advertised = harness.control.last_hostinfo().unwrap();
        assert_eq!(advertised.services.len(), 1);

        let mut prefs = Prefs::new();
        prefs.shields_up = true;
        harness.agent.set_prefs(prefs);

        // Services masked to empty on the way to the control plane.
        let advertised = harness.control.last_hostinfo().unwrap();
        assert!(advertised.services.is_empty());

        // Filter reinstalled with no match rules but local nets preserved.
        let installed = harness.engine.get_filter().unwrap();
        assert!(installed.matches.is_empty());
        assert!(!installed.local_nets.is_empty());

        // Still running; shields do not stop the engine.
        assert_eq!(harness.agent.state(), State::Running);
    }

    #[test]
    fn expired_netmap_forces_needs_login_and_allow_none_filter() {
        let harness = start_harness(None);
        run_to_running(&harness);

        harness.agent.fake_expire_after(Duration::ZERO);
        let expiry = harness.agent.net_map().unwrap().expiry;
        assert!(expiry != 0 && expiry <= now_unix());
        assert!(harness
            .notifications()
            .iter()
            .any(|n| n.net_map.as_ref().map(|m| m.expiry) == Some(expiry)));

        // The next event drives the state machine.
        harness.engine.deliver_status(RawStatus::default());
        assert_eq!(harness.agent.state(), State::NeedsLogin);
        assert!(harness.engine.last_filter().unwrap().is_allow_none());
        let (wg, router) = harness.engine.last_reconfig().unwrap();
        assert_eq!(wg, WgConfig::default());
        assert_eq!(router, RouterConfig::default());
    }

    #[test]
    fn fake_expire_never_moves_expiry_later() {
        let harness = start_harness(None);
        let expiry = now_unix() + 5;
        let mut nm = authorized_netmap();
        nm.expiry = expiry;
        harness.control.deliver(ControlStatus {
            login_finished: true,
            net_map: Some(nm),
            ..Default::default()
        });

        harness.agent.fake_expire_after(Duration::from_secs(3600));
        assert_eq!(harness.agent.net_map().unwrap().expiry, expiry);
    }

    #[test]
    fn logout_clears_netmap_twice_and_advances() {
        let harness = start_harness(None);
        run_to_running(&harness);

        harness.control.set_auth_cant_continue(true);
        harness.agent.logout();

        assert_eq!(harness.control.state.lock().logouts, 1);
        assert!(harness.agent.net_map().is_none());
        assert_eq!(harness.agent.state(), State::NeedsLogin);
    }

    #[test]
    fn stopping_pauses_the_control_client() {
        let harness = start_harness(None);
        run_to_running(&harness);

        let mut prefs = Prefs::new();
        prefs.want_running = false;
        harness.agent.set_prefs(prefs);

        assert_eq!(harness.agent.state(), State::Stopped);
        assert_eq!(harness.control.state.lock().paused.last(), Some(&true));
        let (wg, _) = harness.engine.last_reconfig().unwrap();
        assert_eq!(wg, WgConfig::default());
    }

    #[test]
    fn next_state_is_deterministic_for_equal_inputs() {
        let harness = start_harness(None);
        run_to_running(&harness);
        assert_eq!(harness.agent.next_state(), harness.agent.next_state());
    }

    #[test]
    fn blocked_auth_reconfig_touches_nothing() {
        let harness = start_harness(None);
        run_to_running(&harness);

        harness.agent.block_engine_updates(true);
        let before = harness.engine.reconfig_count();
        harness.agent.auth_reconfig();
        assert_eq!(harness.engine.reconfig_count(), before);
    }

    #[test]
    fn filter_is_not_reinstalled_for_equal_inputs() {
        let harness = start_harness(None);
        let nm = authorized_netmap();
        let prefs = Prefs::new();

        harness.agent.update_filter(Some(&nm), Some(&prefs));
        let count = harness.engine.filter_count();
        harness.agent.update_filter(Some(&nm), Some(&prefs));
        assert_eq!(harness.engine.filter_count(), count);

        let mut shielded = prefs.clone();
        shielded.shields_up = true;
        harness.agent.update_filter(Some(&nm), Some(&shielded));
        assert_eq!(harness.engine.filter_count(), count + 1);
    }

    #[test]
    fn enter_state_side_effects_fire_once() {
        let harness = start_harness(None);
        let before = harness.engine.reconfig_count();
        harness.agent.enter_state(State::Stopped);
        harness.agent.enter_state(State::Stopped);
        assert_eq!(harness.engine.reconfig_count(), before + 1);
        let stopped: Vec<_> = harness
            .states()
            .into_iter()
            .filter(|s| *s == State::Stopped)
            .collect();
        assert_eq!(stopped.len(), 1);
    }

    #[test]
    fn ping_with_invalid_address_is_dropped() {
        let harness = start_harness(None);
        harness.agent.ping("not-an-address");
        assert!(harness
            .notifications()
            .iter()
            .all(|n| n.ping_result.is_none()));

        harness.agent.ping("100.64.0.2");
        let result = harness
            .notifications()
            .iter()
            .find_map(|n| n.ping_result.clone())
            .unwrap();
        assert_eq!(result.ip, "100.64.0.2");
    }

    #[test]
    fn request_status_merges_engine_and_netmap_views() {
        let harness = start_harness(None);
        run_to_running(&harness);

        harness.agent.request_status();
        let status = harness
            .notifications()
            .iter()
            .find_map(|n| n.status.clone())
            .unwrap();
        assert!(status.peers["key-engine-only"].in_engine);
        let mapped = &status.peers["key-aaaaaaaa"];
        assert!(mapped.in_network_map);
        assert_eq!(mapped.tail_addr, "100.64.0.2");
    }

    #[test]
    fn net_info_flows_from_engine_to_control() {
        let harness = start_harness(None);
        let ni = NetInfo {
            preferred_derp: 2,
            working_udp: Some(true),
            ..Default::default()
        };
        // Through the callback start() registered on the engine.
        harness.engine.deliver_net_info(ni.clone());
        assert_eq!(harness.control.state.lock().netinfos.last(), Some(&ni));
    }

    #[test]
    fn engine_status_error_is_ignored() {
        let harness = start_harness(None);
        let state = harness.agent.state();
        harness
            .agent
            .on_engine_status(Err(EngineError::Failed("tunnel gone".to_string())));
        assert_eq!(harness.agent.state(), state);
    }

    #[test]
    fn control_error_changes_nothing() {
        let harness = start_harness(None);
        let state = harness.agent.state();
        harness.control.deliver(ControlStatus {
            err: Some("server unreachable".to_string()),
            net_map: Some(authorized_netmap()),
            ..Default::default()
        });
        assert_eq!(harness.agent.state(), state);
        assert!(harness.agent.net_map().is_none());
    }

    #[test]
    fn derp_map_follows_disable_derp_edges() {
        let harness = start_harness(None);
        let mut nm = authorized_netmap();
        nm.derp_map = Some(crate::model::DerpMap {
            regions: vec![crate::model::DerpRegion {
                region_id: 1,
                region_code: "nyc".to_string(),
                nodes: vec![],
            }],
        });
        harness.control.deliver(ControlStatus {
            login_finished: true,
            net_map: Some(nm),
            ..Default::default()
        });
        assert_eq!(harness.engine.state.lock().derp_maps.last(), Some(&true));

        let mut prefs = Prefs::new();
        prefs.disable_derp = true;
        harness.agent.set_prefs(prefs.clone());
        assert_eq!(harness.engine.state.lock().derp_maps.last(), Some(&false));

        prefs.disable_derp = false;
        harness.agent.set_prefs(prefs);
        assert_eq!(harness.engine.state.lock().derp_maps.last(), Some(&true));
    }

    #[test]
    fn port_list_reader_feeds_hostinfo_from_the_scanner() {
        let (poller, tx) = Poller::new();
        let harness = start_harness(Some(poller));

        tx.send(vec![Port {
            proto: "tcp".to_string(),
            port: 443,
            process: "caddy".to_string(),
        }])
        .unwrap();

        let deadline = SystemTime::now() + Duration::from_secs(5);
        loop {
            if let Some(hostinfo) = harness.control.last_hostinfo() {
                if hostinfo.services.iter().any(|s| s.port == 443) {
                    break;
                }
            }
            assert!(SystemTime::now() < deadline, "portlist snapshot never arrived");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn shutdown_stops_collaborators_and_releases_waiters() {
        let harness = start_harness(None);
        harness.agent.shutdown();
        assert_eq!(harness.control.state.lock().shutdowns, 1);
        assert!(harness.engine.state.lock().closed);
        // A wait entered after shutdown returns immediately.
        harness.agent.request_engine_status_and_wait();
    }

    #[test]
    fn load_state_key_precedence() {
        let store = MemStore::new();

        // No key: the frontend owns the prefs.
        let mut frontend = Prefs::new();
        frontend.hostname = "fe".to_string();
        let (prefs, key) = load_state(&store, "", Some(frontend.clone()), None).unwrap();
        assert_eq!(prefs.hostname, "fe");
        assert_eq!(key, "");
        assert!(matches!(store.read_state("u"), Err(StoreError::NotExist)));

        // Key plus prefs: migration writes through the store.
        let (prefs, key) = load_state(&store, "u", Some(frontend), None).unwrap();
        assert_eq!(key, "u");
        assert_eq!(prefs.hostname, "fe");
        assert!(store.read_state("u").is_ok());

        // Key alone reads back what was migrated.
        let (prefs, _) = load_state(&store, "u", None, None).unwrap();
        assert_eq!(prefs.hostname, "fe");

        // Unknown key falls back to defaults.
        let (prefs, _) = load_state(&store, "fresh", None, None).unwrap();
        assert_eq!(prefs, Prefs::new());
    }

    #[test]
    fn load_state_prefers_legacy_file_for_unknown_keys() {
        let store = MemStore::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.conf");
        let mut legacy = Prefs::new();
        legacy.hostname = "legacy".to_string();
        std::fs::write(&path, legacy.to_bytes()).unwrap();

        let (prefs, key) = load_state(&store, "u", None, Some(&path)).unwrap();
        assert_eq!(prefs.hostname, "legacy");
        assert_eq!(key, "u");

        // A corrupt legacy file degrades to defaults.
        std::fs::write(&path, b"{broken").unwrap();
        let (prefs, _) = load_state(&store, "u2", None, Some(&path)).unwrap();
        assert_eq!(prefs, Prefs::new());
    }

    #[test]
    fn restart_shuts_down_old_control_and_keeps_discovered_services() {
        let harness = start_harness(None);
        assert_eq!(
            harness.control_options.lock()[0].server_url,
            crate::prefs::DEFAULT_CONTROL_URL
        );

        harness.agent.on_port_list(&[Port {
            proto: "tcp".to_string(),
            port: 22,
            process: "sshd".to_string(),
        }]);

        let sink = harness.notifications.clone();
        harness
            .agent
            .start(Options {
                state_key: "user-1".to_string(),
                notify: Some(Arc::new(move |n| sink.lock().push(n))),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(harness.control.state.lock().shutdowns, 1);
        // The new control client starts from the hostinfo the old session
        // had already discovered.
        let options = harness.control_options.lock();
        assert_eq!(options.len(), 2);
        assert!(options[1].hostinfo.services.iter().any(|s| s.port == 22));
        assert_eq!(options[1].disco_public_key, "disco-key");
    }
}
