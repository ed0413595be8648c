//! # NCP Link Server
//!
//! Accepts NCP clients and runs a connection handler for each one.
//!
//! ## Example
//!
//! ```no_run
//! use ncplink_protocol::{Connection, ConnectionOptions, NcpError, Params};
//! use ncplink_server::start_server;
//!
//! async fn client_connected(connection: Connection) -> Result<(), NcpError> {
//!     while let Some(field) = connection.recv().await? {
//!         let mut params = Params::new();
//!         params.insert("ACKN".parse()?, 1i32);
//!         field.reply(params).await?;
//!     }
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), NcpError> {
//!     let server = start_server(
//!         client_connected,
//!         "0.0.0.0",
//!         9999,
//!         ConnectionOptions::default(),
//!     )
//!     .await?;
//!     server.wait_closed().await;
//!     Ok(())
//! }
//! ```

use ncplink_protocol::handshake::server_handshake;
use ncplink_protocol::{Connection, ConnectionOptions, NcpError, Params, Result};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Default listen address
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default NCP port
pub const DEFAULT_PORT: u16 = 9999;

/// A connection handler: one invocation per accepted client.
///
/// The handler owns its [`Connection`]; when it returns, the connection is
/// closed. Clients are isolated, so one handler failing does not disturb
/// the others.
pub trait ClientConnected: Clone + Send + 'static {
    /// The handler future.
    type Fut: Future<Output = Result<()>> + Send;

    /// Handles one client connection.
    fn call(&self, connection: Connection) -> Self::Fut;
}

impl<F, Fut> ClientConnected for F
where
    F: Fn(Connection) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    type Fut = Fut;

    fn call(&self, connection: Connection) -> Fut {
        self(connection)
    }
}

/// A running NCP server.
///
/// Closing the server stops accepting and closes every client connection.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// The address the server is listening on. Useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting clients and begins closing the ones connected.
    ///
    /// After calling this method, use [`wait_closed`](Self::wait_closed) to
    /// wait for the server to fully shut down. Idempotent.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Waits for the accept loop and every client to finish.
    pub async fn wait_closed(&self) {
        let task = match self.accept_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Starts an NCP server on `host:port`.
///
/// `client_connected` runs once per accepted client with that client's
/// [`Connection`]. Unless `auto_auth` is off, the server side of the
/// authentication handshake runs first and the handler only sees
/// authenticated peers.
pub async fn start_server<H: ClientConnected>(
    client_connected: H,
    host: &str,
    port: u16,
    options: ConnectionOptions,
) -> Result<Server> {
    let listener = TcpListener::bind((host, port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let accept_task = tokio::spawn(accept_loop(
        listener,
        client_connected,
        options,
        shutdown_rx,
    ));
    Ok(Server {
        local_addr,
        shutdown: shutdown_tx,
        accept_task: std::sync::Mutex::new(Some(accept_task)),
    })
}

async fn accept_loop<H: ClientConnected>(
    listener: TcpListener,
    client_connected: H,
    options: ConnectionOptions,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut clients = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    clients.spawn(serve_client(
                        stream,
                        peer,
                        client_connected.clone(),
                        options.clone(),
                        shutdown_rx.clone(),
                    ));
                }
                Err(err) => {
                    tracing::error!(error = %err, "accept failed");
                }
            },
            // Reap finished clients so the set does not grow unbounded.
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    }
    drop(listener);
    while clients.join_next().await.is_some() {}
}

async fn serve_client<H: ClientConnected>(
    stream: TcpStream,
    peer: SocketAddr,
    client_connected: H,
    mut options: ConnectionOptions,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if options.remote_hostname.is_none() {
        options.remote_hostname = Some(peer.to_string());
    }
    let auto_auth = options.auto_auth;
    let deadline = options.handshake_timeout;
    let connection = Connection::new(stream, options);
    tracing::info!(peer = %connection.remote_hostname(), "client connected");

    let result = tokio::select! {
        _ = shutdown_rx.wait_for(|closing| *closing) => Ok(()),
        result = run_client(&connection, client_connected, auto_auth, deadline) => result,
    };
    match result {
        Ok(()) => {}
        Err(NcpError::ConnectionClosed) => {}
        Err(NcpError::Authentication(err)) => {
            // The handshake already told the peer why.
            tracing::warn!(peer = %connection.remote_hostname(), error = %err, "authentication failed");
        }
        Err(err @ NcpError::Network(_)) => {
            tracing::warn!(peer = %connection.remote_hostname(), error = %err, "bad request");
            send_error(&connection, "Bad request", 400).await;
        }
        Err(err) => {
            tracing::error!(peer = %connection.remote_hostname(), error = %err, "handler error");
            send_error(&connection, "Server error", 500).await;
        }
    }
    connection.close();
    connection.wait_closed().await;
    tracing::info!(peer = %connection.remote_hostname(), "client disconnected");
}

async fn run_client<H: ClientConnected>(
    connection: &Connection,
    client_connected: H,
    auto_auth: bool,
    deadline: Option<std::time::Duration>,
) -> Result<()> {
    if auto_auth {
        let handshake = server_handshake(connection);
        match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, handshake).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(NcpError::Authentication(
                        "handshake deadline exceeded".to_owned(),
                    ))
                }
            },
            None => handshake.await?,
        }
    }
    client_connected.call(connection.clone()).await
}

async fn send_error(connection: &Connection, detail: &str, code: i32) {
    let mut params = Params::new();
    params.insert(ncplink_protocol::handshake::ERRO, detail);
    params.insert(ncplink_protocol::handshake::ERRC, code);
    if let Err(err) = connection.send("LINK", "ERRO", params).await {
        tracing::debug!(error = %err, "could not send the error reply");
    }
}
