use crate::backend::{Backend, Notify, NotifyFn, Options};
use crate::model::AuthToken;
use crate::prefs::Prefs;
use crate::VERSION;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Maximum frame payload size, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 10 << 20;

/// Reads one length-prefixed frame: a little-endian u32 byte count followed
/// by that many JSON bytes. Never returns a partial frame.
pub fn read_msg(r: &mut impl Read) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header)?;
    let n = u32::from_le_bytes(header) as usize;
    if n > MAX_MESSAGE_SIZE {
        bail!("message too large: {} bytes", n);
    }
    let mut body = vec![0u8; n];
    r.read_exact(&mut body)?;
    Ok(body)
}

/// Writes one frame: the length header followed by the body.
pub fn write_msg(w: &mut impl Write, b: &[u8]) -> Result<()> {
    if b.len() > MAX_MESSAGE_SIZE {
        bail!("message too large: {} bytes", b.len());
    }
    w.write_all(&(b.len() as u32).to_le_bytes())?;
    w.write_all(b)?;
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoArgs {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StartArgs {
    pub opts: Options,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SetPrefsArgs {
    pub new: Prefs,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct FakeExpireAfterArgs {
    pub seconds: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PingArgs {
    pub ip: String,
}

/// Command sent by a frontend to the backend. Exactly one of the operation
/// fields is populated.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Command {
    /// Binary version of the frontend.
    #[serde(default)]
    pub version: String,
    /// Whether a frontend/backend version mismatch is tolerated. Strict by
    /// default.
    #[serde(default)]
    pub allow_version_skew: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quit: Option<NoArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<StartArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_login_interactive: Option<NoArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<AuthToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logout: Option<NoArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_prefs: Option<SetPrefsArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_engine_status: Option<NoArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_status: Option<NoArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake_expire_after: Option<FakeExpireAfterArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingArgs>,
}

pub type MessageSender = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

fn send_notify(sender: &MessageSender, mut n: Notify) {
    n.version = VERSION.to_string();
    match serde_json::to_vec(&n) {
        Ok(bytes) => sender(bytes),
        Err(err) => error!("failed to encode notify: {err}"),
    }
}

/// Serves a backend over the framed command channel. The transport feeds
/// whole frames in; notifications go back out through `send_notify_msg`.
pub struct BackendServer {
    backend: Arc<dyn Backend>,
    send_notify_msg: MessageSender,
    got_quit: AtomicBool,
}

impl BackendServer {
    pub fn new(backend: Arc<dyn Backend>, send_notify_msg: MessageSender) -> BackendServer {
        BackendServer {
            backend,
            send_notify_msg,
            got_quit: AtomicBool::new(false),
        }
    }

    fn send(&self, n: Notify) {
        send_notify(&self.send_notify_msg, n);
    }

    pub fn send_error_message(&self, msg: impl Into<String>) {
        self.send(Notify {
            err_message: Some(msg.into()),
            ..Default::default()
        });
    }

    /// Whether a Quit command has been received.
    pub fn got_quit(&self) -> bool {
        self.got_quit.load(Ordering::SeqCst)
    }

    /// Parses one frame as a JSON command and dispatches it. Empty frames
    /// are ignored; malformed frames are dropped and reported back as an
    /// error notification.
    pub fn got_command_msg(&self, b: &[u8]) -> Result<()> {
        if b.is_empty() {
            return Ok(());
        }
        let cmd: Command = match serde_json::from_slice(b) {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!("dropping malformed command frame ({} bytes): {err}", b.len());
                self.send_error_message(format!("malformed command: {err}"));
                return Ok(());
            }
        };
        self.got_command(cmd)
    }

    pub fn got_command(&self, cmd: Command) -> Result<()> {
        if cmd.version != VERSION && !cmd.allow_version_skew {
            let msg = format!(
                "version mismatch: frontend={:?} backend={:?}",
                cmd.version, VERSION
            );
            warn!("{msg}");
            // Drop the command, but tell the frontend so it can notice the
            // mismatch too. Exiting here could cause a crash loop that a
            // restart would never fix.
            self.send_error_message(msg);
            return Ok(());
        }
        if cmd.quit.is_some() {
            self.got_quit.store(true, Ordering::SeqCst);
            bail!("quit command received");
        }

        if let Some(args) = cmd.start {
            let mut opts = args.opts;
            let sender = self.send_notify_msg.clone();
            opts.notify = Some(Arc::new(move |n| send_notify(&sender, n)));
            return self.backend.start(opts);
        }
        if cmd.start_login_interactive.is_some() {
            self.backend.start_login_interactive();
            return Ok(());
        }
        if let Some(token) = cmd.login {
            self.backend.login(Some(token));
            return Ok(());
        }
        if cmd.logout.is_some() {
            self.backend.logout();
            return Ok(());
        }
        if let Some(args) = cmd.set_prefs {
            self.backend.set_prefs(args.new);
            return Ok(());
        }
        if cmd.request_engine_status.is_some() {
            self.backend.request_engine_status();
            return Ok(());
        }
        if cmd.request_status.is_some() {
            self.backend.request_status();
            return Ok(());
        }
        if let Some(args) = cmd.fake_expire_after {
            self.backend.fake_expire_after(Duration::from_secs(args.seconds));
            return Ok(());
        }
        if let Some(args) = cmd.ping {
            self.backend.ping(&args.ip);
            return Ok(());
        }
        bail!("no command specified")
    }

    /// Forgets authentication state, as if the frontend had sent Logout.
    /// Transports call this when a frontend disconnects.
    pub fn reset(&self) -> Result<()> {
        self.got_command(Command {
            version: VERSION.to_string(),
            logout: Some(NoArgs {}),
            ..Default::default()
        })
    }
}

/// Frontend-side counterpart: turns method calls into framed commands and
/// decoded notifications into callback invocations.
pub struct BackendClient {
    send_command_msg: MessageSender,
    notify: Mutex<Option<NotifyFn>>,
    /// Whether to tolerate a mismatched backend version.
    pub allow_version_skew: bool,
}

impl BackendClient {
    pub fn new(send_command_msg: MessageSender) -> BackendClient {
        BackendClient {
            send_command_msg,
            notify: Mutex::new(None),
            allow_version_skew: false,
        }
    }

    pub fn set_notify_callback(&self, f: NotifyFn) {
        *self.notify.lock() = Some(f);
    }

    pub fn got_notify_msg(&self, b: &[u8]) {
        if b.is_empty() {
            return;
        }
        let mut n: Notify = match serde_json::from_slice(b) {
            Ok(n) => n,
            Err(err) => {
                error!("cannot decode notify ({} bytes): {err}", b.len());
                return;
            }
        };
        if n.version != VERSION && !self.allow_version_skew {
            let msg = format!(
                "version mismatch: frontend={:?} backend={:?}",
                VERSION, n.version
            );
            warn!("{msg}");
            // Keep only the version, so a mismatched frontend cannot act on
            // fields it may misinterpret.
            n = Notify {
                version: n.version,
                err_message: Some(msg),
                ..Default::default()
            };
        }
        let notify = self.notify.lock().clone();
        if let Some(notify) = notify {
            notify(n);
        }
    }

    fn send(&self, mut cmd: Command) {
        cmd.version = VERSION.to_string();
        match serde_json::to_vec(&cmd) {
            Ok(bytes) => (self.send_command_msg)(bytes),
            Err(err) => error!("failed to encode command: {err}"),
        }
    }

    pub fn quit(&self) {
        self.send(Command {
            quit: Some(NoArgs {}),
            ..Default::default()
        });
    }

    pub fn start(&self, mut opts: Options) {
        // The server cannot call our function pointer; it installs its own
        // sink and we keep the callback local.
        if let Some(notify) = opts.notify.take() {
            self.set_notify_callback(notify);
        }
        self.send(Command {
            start: Some(StartArgs { opts }),
            ..Default::default()
        });
    }

    pub fn start_login_interactive(&self) {
        self.send(Command {
            start_login_interactive: Some(NoArgs {}),
            ..Default::default()
        });
    }

    pub fn login(&self, token: AuthToken) {
        self.send(Command {
            login: Some(token),
            ..Default::default()
        });
    }

    pub fn logout(&self) {
        self.send(Command {
            logout: Some(NoArgs {}),
            ..Default::default()
        });
    }

    pub fn set_prefs(&self, new: Prefs) {
        self.send(Command {
            set_prefs: Some(SetPrefsArgs { new }),
            ..Default::default()
        });
    }

    pub fn request_engine_status(&self) {
        self.send(Command {
            request_engine_status: Some(NoArgs {}),
            ..Default::default()
        });
    }

    pub fn request_status(&self) {
        // Status probes are allowed across mismatched builds; the answer is
        // how a frontend finds out what it is talking to.
        self.send(Command {
            allow_version_skew: true,
            request_status: Some(NoArgs {}),
            ..Default::default()
        });
    }

    pub fn fake_expire_after(&self, after: Duration) {
        self.send(Command {
            fake_expire_after: Some(FakeExpireAfterArgs {
                seconds: after.as_secs(),
            }),
            ..Default::default()
        });
    }

    pub fn ping(&self, ip: impl Into<String>) {
        self.send(Command {
            ping: Some(PingArgs { ip: ip.into() }),
            ..Default::default()
        });
    }
}
