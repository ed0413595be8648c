//! Per-connection configuration.

use crate::error::CommandWarning;
use std::time::Duration;
use tokio::sync::mpsc;

/// Configuration applied when a connection is established.
///
/// The defaults run the full handshake and convert every recognized control
/// parameter, which is what a well-behaved client wants. Servers and
/// diagnostic tools turn individual conversions off to see the raw traffic.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Run the authentication handshake after dialing or accepting.
    pub auto_auth: bool,

    /// Convert an inbound `ERRO` parameter (with a non-zero `ERRC`) into a
    /// [`crate::CommandError`] raised at the targeted consumer.
    pub auto_erro: bool,

    /// Convert an inbound `WARN` parameter into a [`CommandWarning`] on the
    /// warning sink.
    pub auto_warn: bool,

    /// Silently drop inbound fields carrying an `ACKN` parameter.
    pub auto_ackn: bool,

    /// Label for the remote peer, used in logs. Derived from the transport
    /// when unset.
    pub remote_hostname: Option<String>,

    /// Identification string sent as `CIW` during the client handshake.
    /// Defaults to the local hostname.
    pub hostname: Option<String>,

    /// Deadline for the authentication handshake. `None` waits forever.
    pub handshake_timeout: Option<Duration>,

    /// Sink receiving converted `WARN` records. Warnings are logged when no
    /// sink is installed.
    pub warning_sink: Option<mpsc::UnboundedSender<CommandWarning>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_auth: true,
            auto_erro: true,
            auto_warn: true,
            auto_ackn: true,
            remote_hostname: None,
            hostname: None,
            handshake_timeout: None,
            warning_sink: None,
        }
    }
}
