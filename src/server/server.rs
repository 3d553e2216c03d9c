//! High-level CurveCP server API.
//!
//! [`CurveCpServer::bind`] spawns one task that owns the socket and a
//! [`ServerDispatcher`], and hands every accepted connection to the caller as
//! a [`CurveCpStream`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::ServerConfig;
use super::dispatcher::{ServerDispatcher, ServerEvent};
use super::session::ConnectionId;
use crate::core::{CurveCpResult, PUBLIC_KEY_SIZE, StreamError};
use crate::transport::{
    Command, CurveCpSocket, CurveCpStream, PeerIdentity, StreamCommand, StreamDriver, WriteId,
    sleep_deadline,
};

/// Commands from all stream handles.
const COMMAND_QUEUE: usize = 256;

/// A CurveCP server bound to one UDP socket.
///
/// # Example
///
/// ```ignore
/// use curvecp::server::{CurveCpServer, CurveCpServerBuilder};
///
/// let config = CurveCpServerBuilder::new()
///     .bind_addr("0.0.0.0:4433".parse()?)
///     .server_key(keypair)
///     .build();
///
/// let (server, mut incoming) = CurveCpServer::bind(config).await?;
/// while let Some(mut stream) = incoming.recv().await {
///     tokio::spawn(async move {
///         while let Some(bytes) = stream.read().await {
///             stream.write(&bytes).await?;
///         }
///         stream.close(true).await
///     });
/// }
/// ```
#[derive(Debug)]
pub struct CurveCpServer {
    local_addr: SocketAddr,
    public_key: [u8; PUBLIC_KEY_SIZE],
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CurveCpServer {
    /// Bind the socket and start serving.
    ///
    /// Returns the server and the receiver of accepted streams.
    pub async fn bind(
        config: ServerConfig,
    ) -> CurveCpResult<(Self, mpsc::Receiver<CurveCpStream>)> {
        let mut rng = config.rng();
        let key = config.key_provider(&mut rng)?;
        let dispatcher = ServerDispatcher::new(&config, key, rng);
        let public_key = dispatcher.public_key();

        let socket = CurveCpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;

        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = ServerTask {
            socket,
            dispatcher,
            local_addr,
            drivers: HashMap::new(),
            keys: HashMap::new(),
            next_key: 0,
            commands_tx,
            commands: commands_rx,
            accept: accept_tx,
        };
        let task = tokio::spawn(task.run(shutdown_rx));
        info!(%local_addr, "server listening");

        let server = Self {
            local_addr,
            public_key,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        };
        Ok((server, accept_rx))
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The server's long-term public key, for client configuration.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key
    }

    /// Stop serving and wait for the task to exit.
    ///
    /// Live connections are dropped without closing.
    pub async fn shutdown(mut self) -> CurveCpResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "server task ended abnormally");
            }
        }
        Ok(())
    }
}

impl Drop for CurveCpServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct ServerTask {
    socket: CurveCpSocket,
    dispatcher: ServerDispatcher,
    local_addr: SocketAddr,
    drivers: HashMap<ConnectionId, (u64, StreamDriver)>,
    keys: HashMap<u64, ConnectionId>,
    next_key: u64,
    commands_tx: mpsc::Sender<Command>,
    commands: mpsc::Receiver<Command>,
    accept: mpsc::Sender<CurveCpStream>,
}

impl ServerTask {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            let deadline = sleep_deadline(self.dispatcher.poll_timeout());
            let mut command = None;
            tokio::select! {
                _ = &mut shutdown => {
                    let connections = self.dispatcher.connection_count();
                    debug!(connections, "server shutting down");
                    break;
                }
                result = self.socket.recv_from() => match result {
                    Ok((datagram, source)) => {
                        self.dispatcher.handle_datagram(Instant::now(), source, datagram);
                    }
                    Err(e) => warn!(error = %e, "receive failed"),
                },
                Some(received) = self.commands.recv() => command = Some(received),
                _ = tokio::time::sleep_until(deadline) => {
                    self.dispatcher.handle_timeout(Instant::now());
                }
            }
            if let Some((key, command)) = command {
                self.on_command(key, command);
            }
            self.process_events();
            self.flush().await;
        }
    }

    fn on_command(&mut self, key: u64, command: StreamCommand) {
        let Some(id) = self.keys.get(&key).copied() else {
            command.reject(StreamError::ConnectionDone.into());
            return;
        };
        let now = Instant::now();
        match command {
            StreamCommand::Write { data, reply } => {
                let result = self.dispatcher.write(now, &id, &data);
                self.track(&id, result, reply);
            }
            StreamCommand::Close { success, reply } => {
                let result = self.dispatcher.close(now, &id, success);
                self.track(&id, result, reply);
            }
        }
    }

    fn track(
        &mut self,
        id: &ConnectionId,
        result: CurveCpResult<WriteId>,
        reply: oneshot::Sender<CurveCpResult<()>>,
    ) {
        match self.drivers.get_mut(id) {
            Some((_, driver)) => driver.track(result, reply),
            None => {
                let _ = reply.send(result.map(|_| ()));
            }
        }
    }

    fn process_events(&mut self) {
        while let Some(event) = self.dispatcher.poll_event() {
            match event {
                ServerEvent::Accepted { id, peer } => self.on_accepted(id, peer),
                ServerEvent::Stream { id, event } => {
                    if let Some((_, driver)) = self.drivers.get_mut(&id) {
                        driver.on_event(event);
                    }
                }
                ServerEvent::Closed { id } => {
                    if let Some((key, _)) = self.drivers.remove(&id) {
                        self.keys.remove(&key);
                    }
                }
            }
        }
    }

    fn on_accepted(&mut self, id: ConnectionId, peer: PeerIdentity) {
        let Some(local) = self
            .dispatcher
            .connection(&id)
            .map(|conn| conn.local(self.local_addr))
        else {
            return;
        };
        let key = self.next_key;
        self.next_key += 1;
        let (driver, stream) = StreamDriver::pair(key, self.commands_tx.clone(), peer, local);
        self.drivers.insert(id, (key, driver));
        self.keys.insert(key, id);

        // The dropped handle's own close arrives later and is refused.
        if self.accept.try_send(stream).is_err() {
            warn!(%id, "accept backlog full, rejecting connection");
            if let Err(e) = self.dispatcher.close(Instant::now(), &id, false) {
                debug!(%id, error = %e, "reject failed");
            }
        }
    }

    async fn flush(&mut self) {
        while let Some(transmit) = self.dispatcher.poll_transmit() {
            if let Err(e) = self.socket.send_transmit(&transmit).await {
                warn!(error = %e, destination = %transmit.destination, "send failed");
            }
        }
    }
}
