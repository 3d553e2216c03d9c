//! High-level CurveCP client API.
//!
//! [`CurveCpClient::connect`] runs the handshake on a spawned task and
//! resolves to a [`CurveCpStream`] once the server's first message arrives.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::config::ClientConfig;
use super::connection::{ClientConnection, ClientEvent};
use crate::core::{CurveCpResult, StreamError};
use crate::transport::{
    Command, CurveCpSocket, CurveCpStream, StreamCommand, StreamDriver, StreamEvent, WriteId,
    sleep_deadline,
};

/// How long a finished client keeps answering retransmits from the server.
pub const FINISH_LINGER: Duration = Duration::from_secs(10);

/// Commands from the stream handle.
const COMMAND_QUEUE: usize = 64;

/// Entry point for CurveCP clients.
///
/// # Example
///
/// ```ignore
/// use curvecp::client::{CurveCpClient, CurveCpClientBuilder};
///
/// let config = CurveCpClientBuilder::new()
///     .server_addr("127.0.0.1:4433".parse()?)
///     .server_public_key(server_key)
///     .domain("example.com")
///     .build();
///
/// let mut stream = CurveCpClient::connect(config).await?;
/// stream.write(b"hello").await?;
/// stream.close(true).await?;
/// while let Some(bytes) = stream.read().await {
///     println!("{}", String::from_utf8_lossy(&bytes));
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CurveCpClient;

impl CurveCpClient {
    /// Connect to the configured server.
    ///
    /// Fails with a handshake timeout when the retry schedule runs out.
    pub async fn connect(config: ClientConfig) -> CurveCpResult<CurveCpStream> {
        let mut rng = config.rng();
        let key = config.key_provider(&mut rng);
        let bind = if config.server_addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = CurveCpSocket::bind(bind).await?;
        let local_addr = socket.local_addr()?;
        let conn = ClientConnection::new(Instant::now(), &config, key, rng)?;
        debug!(%local_addr, server = %config.server_addr, "connecting");

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = ClientTask {
            socket,
            conn,
            local_addr,
            commands_tx: Some(commands_tx),
            commands: commands_rx,
            driver: None,
            ready: Some(ready_tx),
            linger_until: None,
        };
        tokio::spawn(task.run());

        ready_rx
            .await
            .unwrap_or(Err(StreamError::ConnectionDone.into()))
    }
}

struct ClientTask {
    socket: CurveCpSocket,
    conn: ClientConnection,
    local_addr: SocketAddr,
    /// Handed to the stream on establishment.
    commands_tx: Option<mpsc::Sender<Command>>,
    commands: mpsc::Receiver<Command>,
    driver: Option<StreamDriver>,
    ready: Option<oneshot::Sender<CurveCpResult<CurveCpStream>>>,
    linger_until: Option<Instant>,
}

impl ClientTask {
    async fn run(mut self) {
        self.flush().await;
        loop {
            let deadline = self
                .conn
                .poll_timeout()
                .into_iter()
                .chain(self.linger_until)
                .min();
            let deadline = sleep_deadline(deadline);
            let mut command = None;
            let mut timer = false;
            tokio::select! {
                result = self.socket.recv_from() => match result {
                    Ok((datagram, source)) => {
                        self.conn.handle_datagram(Instant::now(), source, datagram);
                    }
                    Err(e) => warn!(error = %e, "receive failed"),
                },
                Some(received) = self.commands.recv() => command = Some(received),
                _ = tokio::time::sleep_until(deadline) => timer = true,
            }

            let now = Instant::now();
            if timer {
                if self.linger_until.is_some_and(|at| at <= now) {
                    debug!("client done");
                    return;
                }
                self.conn.handle_timeout(now);
            }
            if let Some((_, command)) = command {
                self.on_command(now, command);
            }
            if !self.process_events() {
                return;
            }
            self.flush().await;
        }
    }

    fn on_command(&mut self, now: Instant, command: StreamCommand) {
        match command {
            StreamCommand::Write { data, reply } => {
                let result = self.conn.write(now, &data);
                self.track(result, reply);
            }
            StreamCommand::Close { success, reply } => {
                let result = self.conn.close(now, success);
                self.track(result, reply);
            }
        }
    }

    fn track(&mut self, result: CurveCpResult<WriteId>, reply: oneshot::Sender<CurveCpResult<()>>) {
        match self.driver.as_mut() {
            Some(driver) => driver.track(result, reply),
            None => {
                let _ = reply.send(result.map(|_| ()));
            }
        }
    }

    /// Returns false once the task has nothing left to do.
    fn process_events(&mut self) -> bool {
        while let Some(event) = self.conn.poll_event() {
            match event {
                ClientEvent::Established(peer) => {
                    let Some(commands) = self.commands_tx.take() else {
                        continue;
                    };
                    let local = self.conn.local(self.local_addr);
                    let (driver, stream) = StreamDriver::pair(0, commands, peer, local);
                    self.driver = Some(driver);
                    if let Some(ready) = self.ready.take() {
                        // An abandoned connect drops the stream, which closes it.
                        if ready.send(Ok(stream)).is_err() {
                            debug!("connect caller went away");
                        }
                    }
                }
                ClientEvent::Stream(event) => {
                    if matches!(event, StreamEvent::Finished(_)) {
                        self.linger_until = Some(Instant::now() + FINISH_LINGER);
                    }
                    if let Some(driver) = self.driver.as_mut() {
                        driver.on_event(event);
                    }
                }
                ClientEvent::HandshakeFailed(e) => {
                    if let Some(ready) = self.ready.take() {
                        let _ = ready.send(Err(e.into()));
                    }
                    return false;
                }
            }
        }
        true
    }

    async fn flush(&mut self) {
        while let Some(transmit) = self.conn.poll_transmit() {
            if let Err(e) = self.socket.send_transmit(&transmit).await {
                warn!(error = %e, destination = %transmit.destination, "send failed");
            }
        }
    }
}
