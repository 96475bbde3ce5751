//! SSH session core.
//!
//! Terminates client connections, resolves the routing target during public
//! key authentication, dials the backend devbox pod, and proxies channels,
//! requests, and data in both directions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use russh::client::{self, AuthResult};
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::server::{self, Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, MethodKind, MethodSet, Pty, Sig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::{self, AuthMode, ResolvedRoute};
use crate::config::GatewayConfig;
use crate::registry::Registry;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const PUBLIC_KEY_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const AGENT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a freshly accepted session channel may go without requesting
/// agent forwarding before the session is given up on.
const AGENT_REQUEST_WINDOW: Duration = Duration::from_secs(3);

/// Cap on buffered non-agent requests during the initial-request window.
const MAX_CACHED_REQUESTS: usize = 6;

const AGENT_MISSING_DIAGNOSTIC: &str = "Failed to establish agent forwarding\r\n\
    Make sure your SSH agent is running and has the correct keys\r\n";

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<Registry>,
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    /// Shared server state.
    server: Arc<ServerState>,

    /// Client's socket address.
    peer_addr: SocketAddr,

    /// Routing state resolved during public key auth.
    route: Option<ResolvedRoute>,

    /// Backend connection, dialed lazily on first channel open
    /// (public-key mode only).
    backend: Option<client::Handle<BackendHandler>>,

    /// Per-channel proxy state.
    channels: HashMap<ChannelId, ChannelState>,
}

enum ChannelState {
    /// Transparent proxying: client-side messages flow into the pump task.
    Proxy(mpsc::UnboundedSender<ChannelMsg>),

    /// Agent-forwarding triage: buffering early requests until the agent
    /// pipe and backend connection are up.
    Triage(Arc<Mutex<TriageState>>),
}

#[derive(Default)]
struct TriageState {
    /// Messages to replay onto the backend channel, in arrival order.
    cached: Vec<ChannelMsg>,

    /// How many of `cached` are channel requests (subject to the cap).
    cached_requests: usize,

    /// The client has asked for agent forwarding.
    agent_seen: bool,

    /// The window expired or overflowed; drop everything else.
    dead: bool,

    /// Installed once the backend channel is ready; later messages bypass
    /// the cache.
    proxy: Option<mpsc::UnboundedSender<ChannelMsg>>,
}

impl TriageState {
    /// Buffer a client message for later replay. Returns false when the
    /// request cap is exhausted and the session must be abandoned.
    fn cache(&mut self, msg: ChannelMsg) -> bool {
        if is_channel_request(&msg) {
            if self.cached_requests >= MAX_CACHED_REQUESTS {
                self.dead = true;
                return false;
            }
            self.cached_requests += 1;
        }
        self.cached.push(msg);
        true
    }
}

/// Reject the current credential while keeping publickey auth enabled, so
/// the client can fall through to its other keys.
fn reject_keep_publickey() -> Auth {
    Auth::Reject {
        proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
        partial_success: false,
    }
}

fn is_channel_request(msg: &ChannelMsg) -> bool {
    matches!(
        msg,
        ChannelMsg::RequestPty { .. }
            | ChannelMsg::RequestShell { .. }
            | ChannelMsg::Exec { .. }
            | ChannelMsg::SetEnv { .. }
            | ChannelMsg::RequestSubsystem { .. }
            | ChannelMsg::WindowChange { .. }
            | ChannelMsg::Signal { .. }
            | ChannelMsg::AgentForward { .. }
    )
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            route: None,
            backend: None,
            channels: HashMap::new(),
        }
    }

    /// Dial the backend pod with the devbox's stored signer, once per
    /// connection.
    async fn ensure_backend(&mut self) -> Result<&client::Handle<BackendHandler>> {
        if self.backend.is_none() {
            let route = self
                .route
                .as_ref()
                .ok_or_else(|| anyhow!("no route resolved for connection"))?;
            let backend = dial_backend(route, &self.server.config).await?;
            info!(
                namespace = %route.info.namespace,
                devbox = %route.info.devbox_name,
                "Backend connected"
            );
            self.backend = Some(backend);
        }
        self.backend
            .as_ref()
            .ok_or_else(|| anyhow!("backend connection unavailable"))
    }

    /// Hand a client-side channel message to its proxy pump, or buffer it
    /// during the agent-forwarding triage window. Returns whether the
    /// message was taken.
    fn route_client_msg(&mut self, id: ChannelId, msg: ChannelMsg, session: &mut Session) -> bool {
        match self.channels.get(&id) {
            Some(ChannelState::Proxy(tx)) => tx.send(msg).is_ok(),
            Some(ChannelState::Triage(state)) => {
                let state = state.clone();
                let mut st = state.lock().expect("triage lock poisoned");
                if let Some(tx) = &st.proxy {
                    return tx.send(msg).is_ok();
                }
                if st.dead {
                    return false;
                }
                if st.cache(msg) {
                    return true;
                }
                drop(st);

                warn!(
                    channel = ?id,
                    "Request cap hit before agent forwarding, abandoning session"
                );
                let _ = session.data(id, CryptoVec::from_slice(AGENT_MISSING_DIAGNOSTIC.as_bytes()));
                let _ = session.close(id);
                false
            }
            None => false,
        }
    }

    /// Forward a client channel request and acknowledge it.
    fn forward_request(
        &mut self,
        id: ChannelId,
        msg: ChannelMsg,
        session: &mut Session,
    ) -> Result<()> {
        if self.route_client_msg(id, msg, session) {
            session.channel_success(id)?;
        } else {
            session.channel_failure(id)?;
        }
        Ok(())
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Public key offered by user '{}' from {}", user, self.peer_addr);

        match auth::resolve(&self.server.registry, &self.server.config, user, public_key) {
            Ok(_) => Ok(Auth::Accept),
            Err(reject) => {
                debug!(user, "Offered key would be rejected: {reject}");
                Ok(reject_keep_publickey())
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        match auth::resolve_logged(&self.server.registry, &self.server.config, user, public_key) {
            Some(route) => {
                self.route = Some(route);
                Ok(Auth::Accept)
            }
            None => Ok(reject_keep_publickey()),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        let Some(route) = self.route.clone() else {
            bail!("session channel opened before authentication");
        };

        match route.mode {
            AuthMode::PublicKey => {
                let open_result = {
                    let backend = self.ensure_backend().await.map_err(|e| {
                        warn!(
                            namespace = %route.info.namespace,
                            devbox = %route.info.devbox_name,
                            "Failed to connect to backend: {e:#}"
                        );
                        e
                    })?;
                    backend.channel_open_session().await
                };

                match open_result {
                    Ok(backend_channel) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        self.channels.insert(id, ChannelState::Proxy(tx));
                        tokio::spawn(proxy_channel(session.handle(), id, backend_channel, rx));
                        Ok(true)
                    }
                    Err(e) => {
                        warn!("Backend refused session channel: {e}");
                        Ok(false)
                    }
                }
            }
            AuthMode::AgentForwarding => {
                let state = Arc::new(Mutex::new(TriageState::default()));
                self.channels.insert(id, ChannelState::Triage(state.clone()));

                // Without an agent request inside the window the session has
                // no way to authenticate to the backend.
                let handle = session.handle();
                tokio::spawn(async move {
                    tokio::time::sleep(AGENT_REQUEST_WINDOW).await;
                    let expired = {
                        let mut st = state.lock().expect("triage lock poisoned");
                        if st.agent_seen || st.dead {
                            false
                        } else {
                            st.dead = true;
                            true
                        }
                    };
                    if expired {
                        warn!(channel = ?id, "No agent request within window, closing session");
                        let _ = handle
                            .data(id, CryptoVec::from_slice(AGENT_MISSING_DIAGNOSTIC.as_bytes()))
                            .await;
                        let _ = handle.close(id).await;
                    }
                });
                Ok(true)
            }
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        let Some(route) = self.route.clone() else {
            bail!("direct-tcpip channel opened before authentication");
        };

        if route.mode == AuthMode::AgentForwarding {
            debug!("Rejecting direct-tcpip channel in agent-forwarding mode");
            return Ok(false);
        }

        let open_result = {
            let backend = self.ensure_backend().await.map_err(|e| {
                warn!("Failed to connect to backend: {e:#}");
                e
            })?;
            backend
                .channel_open_direct_tcpip(
                    host_to_connect,
                    port_to_connect,
                    originator_address,
                    originator_port,
                )
                .await
        };

        match open_result {
            Ok(backend_channel) => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.channels.insert(id, ChannelState::Proxy(tx));
                tokio::spawn(proxy_channel(session.handle(), id, backend_channel, rx));
                Ok(true)
            }
            Err(e) => {
                warn!(
                    "Backend refused direct-tcpip channel to {}:{}: {e}",
                    host_to_connect, port_to_connect
                );
                Ok(false)
            }
        }
    }

    /// Remote port forwarding is refused in both modes: the gateway routes
    /// sessions, it does not expose listeners on behalf of devboxes.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!("Rejected remote port forwarding request for {address}:{port}");
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!("Rejected remote port forwarding cancellation for {address}:{port}");
        Ok(false)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route_client_msg(
            channel,
            ChannelMsg::Data {
                data: CryptoVec::from_slice(data),
            },
            session,
        );
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route_client_msg(
            channel,
            ChannelMsg::ExtendedData {
                data: CryptoVec::from_slice(data),
                ext: code,
            },
            session,
        );
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route_client_msg(channel, ChannelMsg::Eof, session);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route_client_msg(channel, ChannelMsg::Close, session);
        self.channels.remove(&channel);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(
            channel,
            ChannelMsg::RequestPty {
                want_reply: false,
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                terminal_modes: modes.to_vec(),
            },
            session,
        )
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, ChannelMsg::RequestShell { want_reply: false }, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(
            channel,
            ChannelMsg::Exec {
                want_reply: false,
                command: data.to_vec(),
            },
            session,
        )
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(
            channel,
            ChannelMsg::SetEnv {
                want_reply: false,
                variable_name: variable_name.to_string(),
                variable_value: variable_value.to_string(),
            },
            session,
        )
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(
            channel,
            ChannelMsg::RequestSubsystem {
                want_reply: false,
                name: name.to_string(),
            },
            session,
        )
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route_client_msg(
            channel,
            ChannelMsg::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
            session,
        );
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route_client_msg(channel, ChannelMsg::Signal { signal }, session);
        Ok(())
    }

    /// "auth-agent-req@openssh.com" arrives as a channel request per the
    /// OpenSSH convention. In agent-forwarding mode this is the trigger to
    /// open the reverse agent pipe and dial the backend.
    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(route) = self.route.clone() else {
            return Ok(false);
        };

        match route.mode {
            AuthMode::PublicKey => Ok(self.route_client_msg(
                channel,
                ChannelMsg::AgentForward { want_reply: false },
                session,
            )),
            AuthMode::AgentForwarding => {
                let Some(ChannelState::Triage(state)) = self.channels.get(&channel) else {
                    return Ok(false);
                };
                let state = state.clone();
                {
                    let mut st = state.lock().expect("triage lock poisoned");
                    if st.dead {
                        return Ok(false);
                    }
                    if st.agent_seen {
                        return Ok(true);
                    }
                    st.agent_seen = true;
                    // Replayed to the backend so it knows the user wants
                    // agent forwarding there too.
                    st.cached.push(ChannelMsg::AgentForward { want_reply: false });
                }

                info!(channel = ?channel, "Agent forwarding requested by client");
                tokio::spawn(run_agent_session(
                    session.handle(),
                    channel,
                    state,
                    route,
                    self.server.config.clone(),
                ));
                Ok(true)
            }
        }
    }
}

/// Backend-side client handler. Host keys are accepted blindly: backends are
/// pods on the cluster network reached by IP, there is nothing to pin.
struct BackendHandler;

impl client::Handler for BackendHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Dial the backend with the devbox's stored signer (public-key mode).
async fn dial_backend(
    route: &ResolvedRoute,
    config: &GatewayConfig,
) -> Result<client::Handle<BackendHandler>> {
    let info = &route.info;
    let signer = info.private_key.clone().ok_or_else(|| {
        anyhow!(
            "devbox {}/{} has no stored private key",
            info.namespace,
            info.devbox_name
        )
    })?;

    info!(
        "Connecting to backend {}:{} as user {}",
        info.pod_ip, config.backend_port, route.real_user
    );

    let mut remote = timeout(
        PUBLIC_KEY_DIAL_TIMEOUT,
        client::connect(
            Arc::new(client::Config::default()),
            (info.pod_ip.as_str(), config.backend_port),
            BackendHandler,
        ),
    )
    .await
    .map_err(|_| anyhow!("timed out connecting to {}:{}", info.pod_ip, config.backend_port))?
    .with_context(|| format!("failed to connect to {}:{}", info.pod_ip, config.backend_port))?;

    let hash_alg = remote.best_supported_rsa_hash().await.ok().flatten().flatten();
    let auth_result = remote
        .authenticate_publickey(
            route.real_user.clone(),
            PrivateKeyWithHashAlg::new(signer, hash_alg),
        )
        .await
        .context("backend authentication error")?;

    match auth_result {
        AuthResult::Success => Ok(remote),
        AuthResult::Failure { .. } => {
            bail!("devbox rejected the stored key for user {}", route.real_user)
        }
    }
}

/// The agent-forwarding dance: open the reverse agent pipe to the client,
/// dial the backend with agent-backed signatures, replay the requests cached
/// during triage, then proxy transparently.
async fn run_agent_session(
    handle: server::Handle,
    id: ChannelId,
    state: Arc<Mutex<TriageState>>,
    route: ResolvedRoute,
    config: Arc<GatewayConfig>,
) {
    let backend = match connect_backend_with_agent(&handle, &route, &config).await {
        Ok(backend) => backend,
        Err(e) => {
            warn!("Failed to connect to backend via agent: {e:#}");
            state.lock().expect("triage lock poisoned").dead = true;
            let diagnostic = format!(
                "Failed to connect to devbox: {e:#}\r\n\
                 Make sure your SSH agent has the correct key and that the key is in \
                 ~/.ssh/authorized_keys on the devbox\r\n"
            );
            let _ = handle.data(id, CryptoVec::from_slice(diagnostic.as_bytes())).await;
            let _ = handle.close(id).await;
            return;
        }
    };

    info!(
        namespace = %route.info.namespace,
        devbox = %route.info.devbox_name,
        "Backend connected via agent"
    );

    let backend_channel = match backend.channel_open_session().await {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Failed to open backend session channel: {e}");
            state.lock().expect("triage lock poisoned").dead = true;
            let _ = handle.close(id).await;
            return;
        }
    };

    // Replay cached requests in order, then flip the channel into proxy
    // mode. Messages racing in during the replay keep landing in the cache
    // and are drained before the switch.
    let (tx, rx) = mpsc::unbounded_channel();
    loop {
        let drained = {
            let mut st = state.lock().expect("triage lock poisoned");
            if st.cached.is_empty() {
                st.proxy = Some(tx.clone());
                break;
            }
            std::mem::take(&mut st.cached)
        };
        for msg in drained {
            if let Err(e) = apply_to_backend(&backend_channel, &msg).await {
                warn!("Failed to forward cached request: {e}");
            }
        }
    }
    drop(tx);

    proxy_channel(handle, id, backend_channel, rx).await;
}

/// Open the agent pipe and dial the backend, authenticating with signatures
/// from the client's agent. The pipe is closed as soon as the dial is
/// decided; it is a one-shot used only to sign the backend handshake.
async fn connect_backend_with_agent(
    handle: &server::Handle,
    route: &ResolvedRoute,
    config: &GatewayConfig,
) -> Result<client::Handle<BackendHandler>> {
    let pipe = handle
        .channel_open_agent()
        .await
        .context("failed to open agent channel to client")?;
    debug!("Agent channel to client established");

    let mut agent = AgentClient::connect(pipe.into_stream());

    let pod_ip = route.info.pod_ip.clone();
    let user = route.real_user.clone();
    let port = config.backend_port;

    let dial = async {
        let identities = agent
            .request_identities()
            .await
            .context("failed to list identities from the forwarded agent")?;
        if identities.is_empty() {
            bail!("the forwarded agent holds no keys");
        }

        let mut remote = client::connect(
            Arc::new(client::Config::default()),
            (pod_ip.as_str(), port),
            BackendHandler,
        )
        .await
        .with_context(|| format!("failed to connect to {pod_ip}:{port}"))?;

        for key in &identities {
            let hash_alg = remote.best_supported_rsa_hash().await.ok().flatten().flatten();
            match remote
                .authenticate_publickey_with(user.clone(), key.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(AuthResult::Success) => return Ok(remote),
                Ok(AuthResult::Failure { .. }) => continue,
                Err(e) => {
                    debug!("Agent signature attempt failed: {e}");
                    continue;
                }
            }
        }
        bail!("no agent identity was accepted by the devbox")
    };

    let result = timeout(AGENT_DIAL_TIMEOUT, dial).await;
    drop(agent);

    result.map_err(|_| anyhow!("timed out connecting to {}:{}", route.info.pod_ip, port))?
}

/// Bidirectional proxy between a client channel (via the server handle) and
/// a backend channel.
///
/// The pump owns the backend message stream, so exit-status and exit-signal
/// requests are relayed to the client strictly before the close that follows
/// them; a trailing exit-status is never dropped.
async fn proxy_channel(
    handle: server::Handle,
    id: ChannelId,
    mut backend: Channel<client::Msg>,
    mut rx: mpsc::UnboundedReceiver<ChannelMsg>,
) {
    loop {
        tokio::select! {
            msg = backend.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if handle.data(id, data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if handle.extended_data(id, ext, data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    if handle.exit_status_request(id, exit_status).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitSignal { signal_name, core_dumped, error_message, lang_tag }) => {
                    if handle
                        .exit_signal_request(id, signal_name, core_dumped, error_message, lang_tag)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) => {
                    // Half-close: the client write side sees EOF, the channel
                    // stays open for trailing requests.
                    let _ = handle.eof(id).await;
                }
                Some(ChannelMsg::Close) | None => {
                    let _ = handle.eof(id).await;
                    let _ = handle.close(id).await;
                    break;
                }
                Some(ChannelMsg::Success) | Some(ChannelMsg::Failure) => {
                    // Replies to forwarded requests; the client was already
                    // acknowledged when the request was accepted.
                }
                Some(msg) => debug!(?msg, "Ignoring backend channel message"),
            },
            cmd = rx.recv() => match cmd {
                Some(ChannelMsg::Close) | None => {
                    let _ = backend.close().await;
                    break;
                }
                Some(msg) => {
                    if let Err(e) = apply_to_backend(&backend, &msg).await {
                        warn!("Error forwarding to backend: {e}");
                        break;
                    }
                }
            },
        }
    }
}

/// Apply a buffered client-side message onto the backend channel.
async fn apply_to_backend(channel: &Channel<client::Msg>, msg: &ChannelMsg) -> Result<()> {
    match msg {
        ChannelMsg::Data { data } => channel.data(&data[..]).await?,
        ChannelMsg::ExtendedData { data, ext } => channel.extended_data(*ext, &data[..]).await?,
        ChannelMsg::Eof => channel.eof().await?,
        ChannelMsg::Close => channel.close().await?,
        ChannelMsg::RequestPty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            terminal_modes,
            ..
        } => {
            channel
                .request_pty(
                    false,
                    term,
                    *col_width,
                    *row_height,
                    *pix_width,
                    *pix_height,
                    terminal_modes,
                )
                .await?
        }
        ChannelMsg::RequestShell { .. } => channel.request_shell(false).await?,
        ChannelMsg::Exec { command, .. } => channel.exec(false, &command[..]).await?,
        ChannelMsg::SetEnv {
            variable_name,
            variable_value,
            ..
        } => {
            channel
                .set_env(false, variable_name.as_str(), variable_value.as_str())
                .await?
        }
        ChannelMsg::RequestSubsystem { name, .. } => {
            channel.request_subsystem(false, name.as_str()).await?
        }
        ChannelMsg::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            channel
                .window_change(*col_width, *row_height, *pix_width, *pix_height)
                .await?
        }
        ChannelMsg::Signal { signal } => channel.signal(signal.clone()).await?,
        ChannelMsg::AgentForward { .. } => channel.agent_forward(false).await?,
        other => debug!(?other, "Ignoring client channel message"),
    }
    Ok(())
}

/// Run the SSH server accept loop.
pub async fn run_server(
    config: Arc<GatewayConfig>,
    registry: Arc<Registry>,
    host_key: PrivateKey,
) -> Result<()> {
    let russh_config = Arc::new(server::Config {
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![host_key],
        nodelay: true,
        ..Default::default()
    });

    let state = Arc::new(ServerState {
        config: config.clone(),
        registry,
    });

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("SSH gateway listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Accept error: {e}");
                continue;
            }
        };

        let state = state.clone();
        let russh_config = russh_config.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(state, peer_addr);
            let session = match timeout(
                HANDSHAKE_TIMEOUT,
                server::run_stream(russh_config, stream, handler),
            )
            .await
            {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => {
                    warn!(%peer_addr, "SSH handshake failed: {e}");
                    return;
                }
                Err(_) => {
                    warn!(%peer_addr, "SSH handshake timed out");
                    return;
                }
            };

            if let Err(e) = session.await {
                warn!(%peer_addr, "SSH session error: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pty_msg() -> ChannelMsg {
        ChannelMsg::RequestPty {
            want_reply: false,
            term: "xterm".to_string(),
            col_width: 80,
            row_height: 24,
            pix_width: 0,
            pix_height: 0,
            terminal_modes: Vec::new(),
        }
    }

    #[test]
    fn test_triage_caches_requests_in_order() {
        let mut st = TriageState::default();
        assert!(st.cache(pty_msg()));
        assert!(st.cache(ChannelMsg::RequestShell { want_reply: false }));
        assert_eq!(st.cached.len(), 2);
        assert_eq!(st.cached_requests, 2);
        assert!(!st.dead);
    }

    #[test]
    fn test_triage_data_does_not_count_toward_cap() {
        let mut st = TriageState::default();
        for _ in 0..MAX_CACHED_REQUESTS {
            assert!(st.cache(ChannelMsg::Data {
                data: CryptoVec::from_slice(b"x"),
            }));
        }
        assert_eq!(st.cached_requests, 0);
        assert!(st.cache(pty_msg()));
    }

    #[test]
    fn test_triage_request_cap_abandons_session() {
        let mut st = TriageState::default();
        for _ in 0..MAX_CACHED_REQUESTS {
            assert!(st.cache(pty_msg()));
        }
        assert!(!st.cache(pty_msg()));
        assert!(st.dead);
        assert_eq!(st.cached.len(), MAX_CACHED_REQUESTS);
    }

    #[test]
    fn test_channel_request_classification() {
        assert!(is_channel_request(&pty_msg()));
        assert!(is_channel_request(&ChannelMsg::AgentForward {
            want_reply: false
        }));
        assert!(!is_channel_request(&ChannelMsg::Eof));
        assert!(!is_channel_request(&ChannelMsg::Data {
            data: CryptoVec::from_slice(b"x"),
        }));
    }
}
