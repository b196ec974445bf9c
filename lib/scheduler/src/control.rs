//! The control channel.
//!
//! A loopback TCP listener on an ephemeral port. Each connection sends
//! at most one frame of at most 1 KiB; the daemon echoes the bytes
//! back (so `cadencectl` can confirm receipt before the connection
//! drops) and pushes the decoded instruction onto the shared event
//! queue as [`Event::Control`].

use crate::event::Event;
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;

/// Maximum size of one control-channel frame.
pub const MAX_FRAME_BYTES: usize = 1024;

/// Errors standing up the control channel listener.
#[derive(Debug)]
pub enum ControlError {
    /// Failed to bind the loopback listener.
    BindFailed { reason: String },
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BindFailed { reason } => write!(f, "failed to bind control channel: {reason}"),
        }
    }
}

impl std::error::Error for ControlError {}

/// A bound control-channel listener.
pub struct ControlChannel {
    listener: TcpListener,
}

impl ControlChannel {
    /// Binds a loopback listener on an OS-assigned port.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::BindFailed`] if the bind fails.
    pub async fn bind() -> Result<Self, ControlError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| ControlError::BindFailed { reason: e.to_string() })?;
        Ok(Self { listener })
    }

    /// The port the listener is bound to, for recording in the
    /// session config.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.listener.local_addr().map(|a: SocketAddr| a.port()).unwrap_or(0)
    }

    /// Runs the accept loop until the process is shut down, pushing
    /// each received instruction onto `events`. Connection errors are
    /// logged and do not stop the loop.
    pub async fn run(self, events: UnboundedSender<Event>) {
        loop {
            let (mut socket, _) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(%error, "control channel accept failed");
                    continue;
                }
            };

            let mut buf = vec![0u8; MAX_FRAME_BYTES];
            let read = match socket.read(&mut buf).await {
                Ok(n) => n,
                Err(error) => {
                    tracing::warn!(%error, "control channel read failed");
                    continue;
                }
            };
            if read == 0 {
                continue;
            }
            buf.truncate(read);

            if let Err(error) = socket.write_all(&buf).await {
                tracing::warn!(%error, "control channel echo failed");
            }

            match String::from_utf8(buf) {
                Ok(instruction) => {
                    let _ = events.send(Event::Control(instruction));
                }
                Err(error) => tracing::warn!(%error, "control channel frame was not valid utf-8"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn round_trips_an_instruction_onto_the_event_queue() {
        let channel = ControlChannel::bind().await.unwrap();
        let port = channel.port();
        assert_ne!(port, 0);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(channel.run(tx));

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"status").await.unwrap();

        let mut echoed = [0u8; 6];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"status");

        match rx.recv().await.unwrap() {
            Event::Control(instruction) => assert_eq!(instruction, "status"),
            Event::State(_) => panic!("expected control event"),
        }
    }
}
