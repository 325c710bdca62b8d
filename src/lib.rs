use std::{
    sync::{Arc, atomic::AtomicUsize},
    time::Duration,
};

mod callbacks;
mod config;
mod droppable_handle;
mod entrypoint;
mod error;
mod remote;
mod session;
mod ssh;
mod users;

pub use callbacks::{
    AcceptAllHostKeys, BoxedConn, Conn, Dialer, HostKeyVerifier, SelectedHook, Selector,
    TcpDialer, UsernamePrompt,
};
pub use config::ApplicationConfig;
pub use entrypoint::{entrypoint, serve};
pub use error::ServerError;
pub use remote::Remote;
pub use session::Session;
pub use ssh::terminal::Terminal;
pub use users::UserPolicy;

/// Process-wide state shared by every user connection: the authentication
/// and authorization policy, plus the capability record of embedder
/// callbacks. Each callback is optional; when absent, the documented
/// default behavior applies.
pub struct SshmuxServer {
    pub(crate) session_id: AtomicUsize,
    pub(crate) users: UserPolicy,
    pub(crate) connection_timeout: Duration,
    pub(crate) dialer: Box<dyn Dialer>,
    pub(crate) selected: Option<Box<dyn SelectedHook>>,
    pub(crate) interactive: Option<Box<dyn Selector>>,
    pub(crate) username_prompt: Option<Box<dyn UsernamePrompt>>,
    pub(crate) host_keys: Arc<dyn HostKeyVerifier>,
}

impl SshmuxServer {
    pub fn new(users: UserPolicy, connection_timeout: Duration) -> Self {
        SshmuxServer {
            session_id: AtomicUsize::new(0),
            users,
            connection_timeout,
            dialer: Box::new(TcpDialer),
            selected: None,
            interactive: None,
            username_prompt: None,
            host_keys: Arc::new(AcceptAllHostKeys),
        }
    }

    pub fn with_dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Box::new(dialer);
        self
    }

    pub fn with_selected_hook(mut self, hook: impl SelectedHook + 'static) -> Self {
        self.selected = Some(Box::new(hook));
        self
    }

    pub fn with_selector(mut self, selector: impl Selector + 'static) -> Self {
        self.interactive = Some(Box::new(selector));
        self
    }

    pub fn with_username_prompt(mut self, prompt: impl UsernamePrompt + 'static) -> Self {
        self.username_prompt = Some(Box::new(prompt));
        self
    }

    pub fn with_host_key_verifier(mut self, verifier: impl HostKeyVerifier + 'static) -> Self {
        self.host_keys = Arc::new(verifier);
        self
    }
}
