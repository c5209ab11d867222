//! Network listeners.
use std::{io, net::SocketAddr};

use snafu::{ResultExt as _, Snafu};
use tokio::net::{TcpListener, TcpStream};

/// A listener error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ListenerError {
    /// Failed to bind to the listen address.
    #[snafu(display("failed to bind to listen address {}: {}", address, source))]
    FailedToBind {
        /// Listen address.
        address: SocketAddr,

        /// Source of the error.
        source: io::Error,
    },

    /// Failed to configure a setting on an accepted stream.
    #[snafu(display("failed to configure {} for accepted stream: {}", setting, source))]
    FailedToConfigureStream {
        /// Name of the setting.
        setting: &'static str,

        /// Source of the error.
        source: io::Error,
    },

    /// Failed to accept a new stream from the listener.
    #[snafu(display("failed to accept new stream for listener on address {}: {}", address, source))]
    FailedToAccept {
        /// Listen address.
        address: SocketAddr,

        /// Source of the error.
        source: io::Error,
    },
}

impl ListenerError {
    /// Returns `true` if the listener can keep accepting after this error.
    ///
    /// Errors that are not transient indicate that the listener itself is no longer usable.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::FailedToBind { .. } => false,
            Self::FailedToConfigureStream { .. } => true,
            Self::FailedToAccept { source, .. } => {
                !matches!(source.kind(), io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported)
            }
        }
    }

    /// Returns `true` if the error only affects the connection that was being accepted.
    ///
    /// Transient errors that are not connection errors, such as running out of file descriptors or memory, affect every
    /// connection, and accepting should only be retried after backing off.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::FailedToBind { .. } => false,
            Self::FailedToConfigureStream { .. } => true,
            Self::FailedToAccept { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
            ),
        }
    }
}

/// A TCP listener.
pub struct Listener {
    listen_address: SocketAddr,
    inner: TcpListener,
}

impl Listener {
    /// Binds a new `Listener` to the given address.
    ///
    /// If the port of the given address is zero, an ephemeral port is chosen by the operating system. The address that
    /// was actually bound can be retrieved with [`listen_address`][Self::listen_address].
    ///
    /// ## Errors
    ///
    /// If the address cannot be bound, an error is returned.
    pub async fn bind(address: SocketAddr) -> Result<Self, ListenerError> {
        let inner = TcpListener::bind(address).await.context(FailedToBind { address })?;
        let listen_address = inner.local_addr().context(FailedToBind { address })?;

        Ok(Self { listen_address, inner })
    }

    /// Gets the address this listener is bound to.
    pub fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    /// Accepts a new connection from the listener.
    ///
    /// ## Errors
    ///
    /// If the listener fails to accept a new connection, or if the accepted connection cannot be configured correctly,
    /// an error is returned. See [`ListenerError::is_transient`] for whether or not accepting can continue.
    pub async fn accept(&mut self) -> Result<(TcpStream, SocketAddr), ListenerError> {
        let (stream, peer_addr) = self.inner.accept().await.context(FailedToAccept {
            address: self.listen_address,
        })?;

        stream
            .set_nodelay(true)
            .context(FailedToConfigureStream { setting: "TCP_NODELAY" })?;

        Ok((stream, peer_addr))
    }
}
