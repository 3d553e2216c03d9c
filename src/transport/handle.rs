//! Application-facing stream handle.
//!
//! A [`CurveCpStream`] talks to the endpoint task that owns the connection
//! over channels: commands go in through one `mpsc`, received bytes come back
//! through another, and the final resolution is published on a `watch`.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::trace;

use crate::core::{CurveCpError, CurveCpResult, StreamError};

use super::address::PeerIdentity;
use super::message::Resolution;
use super::stream::{StreamEvent, WriteId};

/// Reply channel for a write or close.
pub(crate) type Reply = oneshot::Sender<CurveCpResult<()>>;

/// Something the application asks of its connection.
#[derive(Debug)]
pub(crate) enum StreamCommand {
    Write { data: Vec<u8>, reply: Reply },
    Close { success: bool, reply: Reply },
}

impl StreamCommand {
    /// Answer the command without running it.
    pub(crate) fn reject(self, error: CurveCpError) {
        let (Self::Write { reply, .. } | Self::Close { reply, .. }) = self;
        let _ = reply.send(Err(error));
    }
}

/// A command tagged with the connection it targets. Client endpoints own a
/// single connection and ignore the tag.
pub(crate) type Command = (u64, StreamCommand);

/// A reliable, encrypted byte stream to one peer.
///
/// Dropping the handle closes writes with success if they are still open.
#[derive(Debug)]
pub struct CurveCpStream {
    key: u64,
    peer: PeerIdentity,
    local: PeerIdentity,
    commands: mpsc::Sender<Command>,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    finished: watch::Receiver<Option<Resolution>>,
}

impl CurveCpStream {
    /// The remote end.
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// The local end.
    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    /// Write bytes, resolving once the peer has acknowledged all of them.
    pub async fn write(&self, data: &[u8]) -> CurveCpResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(StreamCommand::Write {
            data: data.to_vec(),
            reply,
        })
        .await?;
        rx.await.unwrap_or(Err(StreamError::ConnectionDone.into()))
    }

    /// Read the next bytes delivered in order.
    ///
    /// Returns `None` once the peer has closed its direction and every byte
    /// has been read, or when the connection is gone.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    /// Close writes, resolving once the end marker is acknowledged.
    pub async fn close(&self, success: bool) -> CurveCpResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(StreamCommand::Close { success, reply }).await?;
        rx.await.unwrap_or(Err(StreamError::ConnectionDone.into()))
    }

    /// Wait until both directions are closed.
    ///
    /// Returns the peer's resolution, or `None` if the connection went away
    /// without finishing.
    pub async fn finished(&mut self) -> Option<Resolution> {
        loop {
            if let Some(resolution) = *self.finished.borrow_and_update() {
                return Some(resolution);
            }
            if self.finished.changed().await.is_err() {
                return *self.finished.borrow();
            }
        }
    }

    /// Like [`CurveCpStream::finished`], mapping a failed or missing
    /// resolution to an error.
    pub async fn join(&mut self) -> CurveCpResult<()> {
        match self.finished().await {
            Some(Resolution::Success) => Ok(()),
            Some(Resolution::Failure) => Err(CurveCpError::ConnectionFailed),
            None => Err(StreamError::ConnectionDone.into()),
        }
    }

    async fn request(&self, command: StreamCommand) -> CurveCpResult<()> {
        self.commands
            .send((self.key, command))
            .await
            .map_err(|_| StreamError::ConnectionDone.into())
    }
}

impl Drop for CurveCpStream {
    fn drop(&mut self) {
        let (reply, _) = oneshot::channel();
        let close = StreamCommand::Close {
            success: true,
            reply,
        };
        // A full queue or a finished task both mean there is nothing to close.
        let _ = self.commands.try_send((self.key, close));
    }
}

/// The endpoint-task side of a [`CurveCpStream`].
#[derive(Debug)]
pub(crate) struct StreamDriver {
    incoming: Option<mpsc::UnboundedSender<Vec<u8>>>,
    finished: watch::Sender<Option<Resolution>>,
    pending: HashMap<WriteId, Reply>,
}

impl StreamDriver {
    /// Create a driver and the handle it feeds.
    pub(crate) fn pair(
        key: u64,
        commands: mpsc::Sender<Command>,
        peer: PeerIdentity,
        local: PeerIdentity,
    ) -> (Self, CurveCpStream) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = watch::channel(None);
        let driver = Self {
            incoming: Some(incoming_tx),
            finished: finished_tx,
            pending: HashMap::new(),
        };
        let stream = CurveCpStream {
            key,
            peer,
            local,
            commands,
            incoming: incoming_rx,
            finished: finished_rx,
        };
        (driver, stream)
    }

    /// Park the reply for an accepted write or close, or fail it now.
    pub(crate) fn track(&mut self, result: CurveCpResult<WriteId>, reply: Reply) {
        match result {
            Ok(id) => {
                self.pending.insert(id, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Forward one stream event to the handle.
    pub(crate) fn on_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::DataReceived(data) => {
                if let Some(tx) = &self.incoming {
                    let _ = tx.send(data);
                }
            }
            StreamEvent::ReadClosed => self.incoming = None,
            StreamEvent::WriteAcked(id) => {
                if let Some(reply) = self.pending.remove(&id) {
                    let _ = reply.send(Ok(()));
                }
            }
            StreamEvent::Finished(resolution) => {
                trace!(?resolution, "publishing resolution");
                self.incoming = None;
                self.finished.send_replace(Some(resolution));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> PeerIdentity {
        PeerIdentity {
            client_extension: [0; 16],
            server_extension: [0; 16],
            domain: "example.com".into(),
            long_term_key: [1; 32],
            address: "127.0.0.1:9".parse().unwrap(),
        }
    }

    fn pair() -> (StreamDriver, CurveCpStream, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(8);
        let (driver, stream) = StreamDriver::pair(7, tx, identity(), identity());
        (driver, stream, rx)
    }

    #[tokio::test]
    async fn test_read_until_closed() {
        let (mut driver, mut stream, _rx) = pair();
        driver.on_event(StreamEvent::DataReceived(b"abc".to_vec()));
        driver.on_event(StreamEvent::ReadClosed);
        assert_eq!(stream.read().await, Some(b"abc".to_vec()));
        assert_eq!(stream.read().await, None);
    }

    #[tokio::test]
    async fn test_write_resolves_on_ack() {
        let (mut driver, stream, mut rx) = pair();
        let task = tokio::spawn(async move {
            let result = stream.write(b"hello").await;
            (result, stream)
        });

        let (key, command) = rx.recv().await.unwrap();
        assert_eq!(key, 7);
        let StreamCommand::Write { data, reply } = command else {
            panic!("expected a write");
        };
        assert_eq!(data, b"hello");
        driver.track(Ok(WriteId(3)), reply);
        driver.on_event(StreamEvent::WriteAcked(WriteId(3)));

        let (result, _stream) = task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_write_fails() {
        let (mut driver, stream, mut rx) = pair();
        let task = tokio::spawn(async move { stream.write(b"x").await });
        let (_, StreamCommand::Write { reply, .. }) = rx.recv().await.unwrap() else {
            panic!("expected a write");
        };
        driver.track(Err(StreamError::ConnectionClosing.into()), reply);
        assert!(matches!(
            task.await.unwrap(),
            Err(CurveCpError::Stream(StreamError::ConnectionClosing))
        ));
    }

    #[tokio::test]
    async fn test_finished_and_join() {
        let (mut driver, mut stream, _rx) = pair();
        driver.on_event(StreamEvent::Finished(Resolution::Failure));
        assert_eq!(stream.finished().await, Some(Resolution::Failure));
        assert!(matches!(stream.join().await, Err(CurveCpError::ConnectionFailed)));
    }

    #[tokio::test]
    async fn test_driver_gone() {
        let (driver, mut stream, rx) = pair();
        drop(driver);
        drop(rx);
        assert_eq!(stream.finished().await, None);
        assert!(matches!(
            stream.write(b"x").await,
            Err(CurveCpError::Stream(StreamError::ConnectionDone))
        ));
    }

    #[tokio::test]
    async fn test_drop_sends_close() {
        let (_driver, stream, mut rx) = pair();
        drop(stream);
        let (_, command) = rx.recv().await.unwrap();
        assert!(matches!(command, StreamCommand::Close { success: true, .. }));
    }
}
