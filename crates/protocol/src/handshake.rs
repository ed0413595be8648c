//! The link-control vocabulary and the authentication handshake.
//!
//! Handshake sequence, client on the left:
//!
//! ```text
//!            ◄── LINK/HELO  (server identification)
//!  LINK/CCRE ──►             CIW = client id string
//!            ◄── LINK/SCAR   SIW = server challenge
//!  LINK/CARE ──►             CAR = well-known response
//!            ◄── LINK/SCON  (authenticated)
//! ```
//!
//! Either side skips the exchange with `auto_auth` off, in which case the
//! handshake fields are delivered to the application instead.

use crate::connection::Connection;
use crate::error::{NcpError, Result};
use crate::field::Params;
use crate::identifier::Identifier;
use crate::value::Value;

/// Packet type of all link-control traffic, and the name of keep-alive fields.
pub const LINK: Identifier = Identifier::from_static(*b"LINK");

/// Server hello field, opening the handshake.
pub const HELO: Identifier = Identifier::from_static(*b"HELO");

/// Client connection request field.
pub const CCRE: Identifier = Identifier::from_static(*b"CCRE");

/// Server challenge field.
pub const SCAR: Identifier = Identifier::from_static(*b"SCAR");

/// Client challenge-response field.
pub const CARE: Identifier = Identifier::from_static(*b"CARE");

/// Server confirmation field, completing the handshake.
pub const SCON: Identifier = Identifier::from_static(*b"SCON");

/// Client id string parameter, carried by `CCRE`.
pub const CIW: Identifier = Identifier::from_static(*b"CIW ");

/// Server challenge string parameter, carried by `SCAR`.
pub const SIW: Identifier = Identifier::from_static(*b"SIW ");

/// Challenge response parameter, carried by `CARE`.
pub const CAR: Identifier = Identifier::from_static(*b"CAR ");

/// Error detail parameter.
pub const ERRO: Identifier = Identifier::from_static(*b"ERRO");

/// Error code parameter.
pub const ERRC: Identifier = Identifier::from_static(*b"ERRC");

/// Warning detail parameter.
pub const WARN: Identifier = Identifier::from_static(*b"WARN");

/// Warning code parameter.
pub const WARC: Identifier = Identifier::from_static(*b"WARC");

/// Acknowledgment parameter.
pub const ACKN: Identifier = Identifier::from_static(*b"ACKN");

/// Server software version parameter, carried by `HELO`.
pub const NCPV: Identifier = Identifier::from_static(*b"NCPV");

/// Server id parameter, carried by `HELO`.
pub const SEID: Identifier = Identifier::from_static(*b"SEID");

// The challenge/response pair is fixed by the protocol rather than derived;
// authentication here identifies well-behaved peers, it is not a secret.

/// Challenge string sent as `SIW` in the `SCAR` packet.
pub const SERVER_CHALLENGE: &str = "NCPLINK";

/// Well-known response expected as `CAR` in the `CARE` packet. Exposed so
/// applications running with `auto_auth` off can drive the handshake
/// themselves.
pub const AUTH_RESPONSE: &str = "NCPLINK";

/// Runs the client side of the handshake. `hostname` is sent as the
/// client's `CIW` identification string.
///
/// Any failure, including the peer closing mid-handshake, surfaces as
/// [`NcpError::Authentication`].
pub async fn client_handshake(connection: &Connection, hostname: &str) -> Result<()> {
    run_client(connection, hostname).await.map_err(auth_err)?;
    connection.mark_authenticated();
    tracing::debug!(peer = %connection.remote_hostname(), "authenticated");
    Ok(())
}

async fn run_client(connection: &Connection, hostname: &str) -> Result<()> {
    expect_field(connection, "LINK", "HELO").await?;
    let mut params = Params::new();
    params.insert(CIW, hostname);
    connection.send("LINK", "CCRE", params).await?;
    expect_field(connection, "LINK", "SCAR").await?;
    let mut params = Params::new();
    params.insert(CAR, AUTH_RESPONSE);
    connection.send("LINK", "CARE", params).await?;
    expect_field(connection, "LINK", "SCON").await?;
    Ok(())
}

/// Runs the server side of the handshake: identify, challenge, verify the
/// canned response, confirm.
///
/// On a bad `CCRE` or challenge mismatch the peer is told why with a
/// `LINK`/`ERRO` reply before the error is returned.
pub async fn server_handshake(connection: &Connection) -> Result<()> {
    run_server(connection).await.map_err(auth_err)?;
    connection.mark_authenticated();
    tracing::debug!(peer = %connection.remote_hostname(), "peer authenticated");
    Ok(())
}

async fn run_server(connection: &Connection) -> Result<()> {
    let mut params = Params::new();
    params.insert(NCPV, concat!("ncplink ", env!("CARGO_PKG_VERSION")));
    params.insert(SEID, "ncplink");
    connection.send("LINK", "HELO", params).await?;

    let request = expect_field(connection, "LINK", "CCRE").await?;
    let Some(client_id) = request.get("CIW").and_then(Value::as_str) else {
        tracing::warn!(
            peer = %connection.remote_hostname(),
            "connection request carried no CIW"
        );
        let mut reject = Params::new();
        reject.insert(ERRO, "CIW - This field is required");
        reject.insert(ERRC, 401i32);
        let _ = request.reply(reject).await;
        return Err(NcpError::Authentication(
            "connection request carried no CIW".to_owned(),
        ));
    };
    connection.set_remote_hostname(client_id);

    let mut params = Params::new();
    params.insert(SIW, SERVER_CHALLENGE);
    connection.send("LINK", "SCAR", params).await?;

    let answer = expect_field(connection, "LINK", "CARE").await?;
    if answer.get("CAR").and_then(Value::as_str) != Some(AUTH_RESPONSE) {
        tracing::warn!(
            peer = %connection.remote_hostname(),
            "challenge response mismatch"
        );
        let mut reject = Params::new();
        reject.insert(ERRO, "CAR - Challenge response mismatch");
        reject.insert(ERRC, 401i32);
        let _ = answer.reply(reject).await;
        return Err(NcpError::Authentication(
            "challenge response mismatch".to_owned(),
        ));
    }

    connection.send("LINK", "SCON", Params::new()).await?;
    Ok(())
}

/// A handshake step cannot accept end-of-stream, whoever caused it.
async fn expect_field(
    connection: &Connection,
    packet_type: &str,
    field_name: &str,
) -> Result<crate::connection::Field> {
    connection
        .recv_field(packet_type, field_name)
        .await?
        .ok_or(NcpError::ConnectionClosed)
}

fn auth_err(err: NcpError) -> NcpError {
    match err {
        NcpError::Authentication(_) => err,
        other => NcpError::Authentication(other.to_string()),
    }
}
