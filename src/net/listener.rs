//! Per-port TCP listeners.
//!
//! # Responsibilities
//! - Bind the port on the configured IPv6 and IPv4 addresses
//! - Accept connections and hand each one to a `Request` task
//! - Enforce the session's endpoint and connection quotas
//! - Stop in two phases: no more accepts, then a bounded drain

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SslBinding;
use crate::context::Services;
use crate::error::{HttpSysError, Result};
use crate::http::request::Request;
use crate::lifecycle::Shutdown;
use crate::net::backoff::AcceptBackoff;
use crate::net::connection::{ConnectionId, ConnectionLease, ConnectionTracker};
use crate::net::stream::{PlainStream, SocketStream};
use crate::net::tls::{SecureStream, TlsAcceptor};
use crate::observability::metrics;
use crate::queue::RequestQueue;
use crate::session::ServerSession;

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub port: u16,
    pub secure: bool,
    pub tls: Option<SslBinding>,
    /// Upper bound on waiting for in-flight connections when stopping.
    pub drain_timeout: Duration,
}

/// Everything an accept loop needs to start a connection.
struct AcceptContext {
    port: u16,
    acceptor: Option<TlsAcceptor>,
    queue: Weak<RequestQueue>,
    services: Arc<Services>,
    session: Arc<ServerSession>,
    tracker: ConnectionTracker,
}

pub struct Listener {
    settings: ListenerSettings,
    local_addrs: Vec<SocketAddr>,
    shutdown: Shutdown,
    tracker: ConnectionTracker,
    tasks: Vec<JoinHandle<TcpListener>>,
    session: Arc<ServerSession>,
}

impl Listener {
    /// Bind the port and start accepting.
    pub async fn start(
        settings: ListenerSettings,
        queue: Weak<RequestQueue>,
        services: Arc<Services>,
        session: Arc<ServerSession>,
    ) -> Result<Listener> {
        let acceptor = match (&settings.tls, settings.secure) {
            (Some(binding), true) => Some(services.tls_acceptor(binding.clone())),
            (None, true) => {
                return Err(HttpSysError::InvalidConfiguration(format!(
                    "no ssl binding for port {}",
                    settings.port
                )))
            }
            (_, false) => None,
        };
        if !session.try_add_endpoint() {
            return Err(HttpSysError::ServiceUnavailable);
        }

        let sockets = match bind_all(&services, settings.port).await {
            Ok(sockets) => sockets,
            Err(e) => {
                session.remove_endpoint();
                return Err(e);
            }
        };
        let local_addrs: Vec<SocketAddr> = sockets.iter().filter_map(|s| s.local_addr().ok()).collect();

        let shutdown = Shutdown::new();
        let tracker = ConnectionTracker::new();
        let context = Arc::new(AcceptContext {
            port: settings.port,
            acceptor,
            queue,
            services,
            session: Arc::clone(&session),
            tracker: tracker.clone(),
        });
        let tasks = sockets
            .into_iter()
            .map(|socket| tokio::spawn(accept_loop(socket, Arc::clone(&context), shutdown.subscribe())))
            .collect();

        tracing::info!(
            port = settings.port,
            secure = settings.secure,
            addresses = ?local_addrs,
            "Listener started"
        );
        Ok(Listener {
            settings,
            local_addrs,
            shutdown,
            tracker,
            tasks,
            session,
        })
    }

    pub fn port(&self) -> u16 {
        self.settings.port
    }

    pub fn is_secure(&self) -> bool {
        self.settings.secure
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.active_count()
    }

    /// Stop accepting, drain connections, then release the sockets.
    pub async fn stop(mut self) {
        self.shutdown.trigger();
        let mut sockets = Vec::with_capacity(self.tasks.len());
        for task in self.tasks.drain(..) {
            if let Ok(socket) = task.await {
                sockets.push(socket);
            }
        }

        let idle = self.tracker.close_idle();
        if !self.tracker.wait_idle(self.settings.drain_timeout).await {
            let aborted = self.tracker.abort_all();
            tracing::warn!(
                port = self.settings.port,
                aborted,
                "Drain timed out, closing remaining connections"
            );
        }
        drop(sockets);
        self.session.remove_endpoint();
        tracing::info!(port = self.settings.port, idle_closed = idle, "Listener stopped");
    }
}

/// IPv6 first; on dual-stack hosts the IPv4 bind of the same port is then
/// covered by the IPv6 socket.
async fn bind_all(services: &Services, port: u16) -> Result<Vec<TcpListener>> {
    let settings = &services.settings;
    let mut sockets = Vec::new();
    let mut first_error = None;

    for ip in [settings.ipv6, settings.ipv4].into_iter().flatten() {
        let addr = SocketAddr::new(ip, port);
        match TcpListener::bind(addr).await {
            Ok(socket) => sockets.push(socket),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && covered_by_dual_stack(ip, &sockets) => {
                tracing::debug!(%addr, "IPv4 covered by dual-stack IPv6 socket");
            }
            Err(e) if ip.is_ipv6() && e.kind() != io::ErrorKind::AddrInUse => {
                tracing::debug!(%addr, error = %e, "IPv6 unavailable, continuing with IPv4");
            }
            Err(e) => {
                tracing::warn!(%addr, error = %e, "Failed to bind");
                first_error.get_or_insert(e);
            }
        }
    }

    match (sockets.is_empty(), first_error) {
        (_, Some(e)) => Err(bind_error(port, e)),
        (true, None) => Err(HttpSysError::InvalidConfiguration("no listen address configured".into())),
        (false, None) => Ok(sockets),
    }
}

fn covered_by_dual_stack(ip: IpAddr, bound: &[TcpListener]) -> bool {
    ip.is_ipv4()
        && bound
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .any(|a| a.ip().is_ipv6() && a.ip().is_unspecified())
}

fn bind_error(port: u16, e: io::Error) -> HttpSysError {
    match e.kind() {
        io::ErrorKind::AddrInUse => HttpSysError::AlreadyExists(format!("port {port} is in use")),
        io::ErrorKind::PermissionDenied => HttpSysError::AccessDenied(format!("binding port {port}")),
        _ => HttpSysError::InvalidConfiguration(format!("binding port {port}: {e}")),
    }
}

async fn accept_loop(
    socket: TcpListener,
    context: Arc<AcceptContext>,
    mut shutdown: broadcast::Receiver<()>,
) -> TcpListener {
    let mut backoff = AcceptBackoff::new();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => break,
            accepted = socket.accept() => accepted,
        };
        match accepted {
            Ok((tcp, peer)) => {
                backoff.reset();
                context.serve(tcp, peer);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    port = context.port,
                    error = %e,
                    failures = backoff.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "Accept failed"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    socket
}

impl AcceptContext {
    fn serve(&self, tcp: TcpStream, peer: SocketAddr) {
        if !self.session.try_add_connection() {
            metrics::record_connection_rejected(self.port);
            tracing::debug!(%peer, port = self.port, "Connection limit reached, dropping");
            return;
        }
        let local = match tcp.local_addr() {
            Ok(local) => local,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "Accepted socket has no local address");
                self.session.remove_connection();
                return;
            }
        };
        let _ = tcp.set_nodelay(true);
        metrics::record_connection_accepted(self.port);

        let peer = SocketAddr::new(peer.ip().to_canonical(), peer.port());
        let local = SocketAddr::new(local.ip().to_canonical(), local.port());
        let timeouts = self.session.timeouts();
        let plain = PlainStream::new(tcp, peer, local, timeouts.idle_connection)
            .with_dump_level(self.session.logging_level());
        let stream = if self.acceptor.is_some() {
            SocketStream::Secure(Box::new(SecureStream::new(plain)))
        } else {
            SocketStream::Plain(plain)
        };

        let connection = ConnectionId::new();
        tracing::debug!(connection_id = %connection, %peer, port = self.port, "Connection accepted");
        let request = Request::new(
            stream,
            connection,
            self.port,
            self.queue.clone(),
            Arc::clone(&self.services),
        );
        request.hold_lease(ConnectionLease::new(
            self.tracker.track(&request),
            Arc::clone(&self.session),
        ));
        let acceptor = self.acceptor.clone();
        tokio::spawn(request.run(acceptor));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_errors_map_to_status() {
        let in_use = bind_error(80, io::Error::from(io::ErrorKind::AddrInUse));
        assert!(matches!(in_use, HttpSysError::AlreadyExists(_)));
        let denied = bind_error(80, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(denied, HttpSysError::AccessDenied(_)));
    }
}
