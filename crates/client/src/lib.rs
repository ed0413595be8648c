//! # NCP Link Client
//!
//! Dials an NCP server and hands back an authenticated
//! [`Connection`].
//!
//! ## Example
//!
//! ```no_run
//! use ncplink_client::connect;
//! use ncplink_protocol::{ConnectionOptions, Params};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ncplink_protocol::NcpError> {
//!     let connection = connect("127.0.0.1", 9999, ConnectionOptions::default()).await?;
//!
//!     let mut params = Params::new();
//!     params.insert("SAMP".parse()?, 1024i32);
//!     let mut response = connection.send("DSPC", "TIME", params).await?;
//!     if let Some(field) = response.recv().await? {
//!         println!("reply: {:?}", field.params());
//!     }
//!
//!     connection.close();
//!     connection.wait_closed().await;
//!     Ok(())
//! }
//! ```

use ncplink_protocol::handshake::client_handshake;
use ncplink_protocol::{Connection, ConnectionOptions, NcpError, Result};
use tokio::net::TcpStream;

/// Connects to an NCP server.
///
/// Dials `host:port`, wraps the socket in a [`Connection`] and, unless
/// `auto_auth` is off, runs the client side of the authentication handshake
/// under the configured deadline. With `auto_auth` off the server's
/// handshake fields are left for the application to receive.
pub async fn connect(host: &str, port: u16, mut options: ConnectionOptions) -> Result<Connection> {
    let stream = TcpStream::connect((host, port)).await?;
    if options.remote_hostname.is_none() {
        options.remote_hostname = Some(format!("{host}:{port}"));
    }
    let auto_auth = options.auto_auth;
    let deadline = options.handshake_timeout;
    let hostname = options
        .hostname
        .clone()
        .unwrap_or_else(local_hostname);

    let connection = Connection::new(stream, options);
    tracing::info!(peer = %connection.remote_hostname(), "connected");

    if auto_auth {
        let handshake = client_handshake(&connection, &hostname);
        let result = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, handshake).await {
                Ok(result) => result,
                Err(_) => Err(NcpError::Authentication(
                    "handshake deadline exceeded".to_owned(),
                )),
            },
            None => handshake.await,
        };
        if let Err(err) = result {
            tracing::warn!(peer = %connection.remote_hostname(), error = %err, "handshake failed");
            connection.close();
            connection.wait_closed().await;
            return Err(err);
        }
    }
    Ok(connection)
}

/// The identification string sent as `CIW` when none is configured.
fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "ncplink".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_hostname_is_never_empty() {
        assert!(!local_hostname().is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on localhost is essentially never listening.
        let err = connect("127.0.0.1", 1, ConnectionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NcpError::Network(_)));
    }
}
