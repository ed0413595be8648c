//! # NCP Link
//!
//! A client and server library for the Node Communication Protocol (NCP),
//! the binary request/response and publish/subscribe wire protocol spoken
//! by CRFS radio-frequency nodes.
//!
//! ## Components
//!
//! - `ncplink-protocol`: packet codec and the per-connection control plane
//! - `ncplink-client`: dials a server and authenticates
//! - `ncplink-server`: accepts clients and runs a handler per connection
//!
//! ## Example
//!
//! ```no_run
//! use ncplink::client::connect;
//! use ncplink::protocol::{ConnectionOptions, Params};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ncplink::protocol::NcpError> {
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

pub use ncplink_client as client;
pub use ncplink_protocol as protocol;
pub use ncplink_server as server;
