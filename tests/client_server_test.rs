//! End-to-end client/server behavior over TCP: handshake, replies, error
//! surfacing, isolation and shutdown.

use ncplink::client::connect;
use ncplink::protocol::handshake::AUTH_RESPONSE;
use ncplink::protocol::{
    write_packet, CommandError, Connection, ConnectionOptions, FieldData, HandshakeState,
    NcpError, Packet, PacketReader, Params, Timestamp, Value,
};
use ncplink::server::start_server;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

fn init_tracing() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
}

/// Replies to every inbound field with an `ECHO` of its name.
async fn echo_handler(connection: Connection) -> Result<(), NcpError> {
    while let Some(field) = connection.recv().await? {
        let mut params = Params::new();
        params.insert("ECHO".parse()?, field.name().to_string());
        field.reply(params).await?;
    }
    Ok(())
}

fn packet(packet_type: &str, id: u32, fields: Vec<FieldData>) -> Packet {
    Packet {
        packet_type: packet_type.parse().unwrap(),
        id,
        timestamp: Timestamp::EPOCH,
        info: 0,
        fields,
    }
}

fn field(name: &str, id: u32, params: Params) -> FieldData {
    FieldData::new(name.parse().unwrap(), id, params)
}

#[tokio::test]
async fn test_handshake_and_reply_roundtrip() {
    init_tracing();
    let server = start_server(echo_handler, "127.0.0.1", 0, ConnectionOptions::default())
        .await
        .unwrap();

    let connection = connect(
        "127.0.0.1",
        server.local_addr().port(),
        ConnectionOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(connection.handshake_state(), HandshakeState::Authenticated);

    let mut params = Params::new();
    params.insert("SAMP".parse().unwrap(), 1024i32);
    let mut response = connection.send("DSPC", "TIME", params).await.unwrap();

    let reply = timeout(Duration::from_secs(2), response.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.packet_type(), "DSPC");
    assert_eq!(reply.name(), "TIME");
    assert_eq!(
        reply.get("ECHO"),
        Some(&Value::String("TIME".to_owned()))
    );

    connection.close();
    connection.wait_closed().await;
    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_auth_failure_when_server_never_confirms() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A server that walks the handshake up to the challenge response, then
    // closes without confirming.
    let harness = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(read_half);

        write_packet(
            &mut write_half,
            &packet("LINK", 1, vec![field("HELO", 1, Params::new())]),
        )
        .await
        .unwrap();

        let ccre = reader.read_packet().await.unwrap().unwrap();
        assert_eq!(ccre.fields[0].name, "CCRE");
        assert!(ccre.fields[0].params.get("CIW").is_some());

        let mut challenge = Params::new();
        challenge.insert("SIW".parse().unwrap(), "NCPLINK");
        write_packet(
            &mut write_half,
            &packet("LINK", 2, vec![field("SCAR", 2, challenge)]),
        )
        .await
        .unwrap();

        let care = reader.read_packet().await.unwrap().unwrap();
        assert_eq!(care.fields[0].name, "CARE");

        // Close without SCON. No packets beyond the handshake were sent.
        drop(write_half);
        assert!(reader.read_packet().await.unwrap().is_none());
    });

    let err = connect("127.0.0.1", addr.port(), ConnectionOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, NcpError::Authentication(_)),
        "expected an authentication failure, got {err:?}"
    );
    harness.await.unwrap();
}

#[tokio::test]
async fn test_manual_handshake_with_auto_auth_off() {
    init_tracing();
    let server = start_server(echo_handler, "127.0.0.1", 0, ConnectionOptions::default())
        .await
        .unwrap();

    let options = ConnectionOptions {
        auto_auth: false,
        ..ConnectionOptions::default()
    };
    let connection = connect("127.0.0.1", server.local_addr().port(), options)
        .await
        .unwrap();
    assert_eq!(
        connection.handshake_state(),
        HandshakeState::Unauthenticated
    );

    // The server's handshake fields arrive like any other traffic.
    let hello = connection.recv_field("LINK", "HELO").await.unwrap().unwrap();
    assert!(hello.get("NCPV").is_some());

    let mut request = Params::new();
    request.insert("CIW".parse().unwrap(), "manual-client");
    connection.send("LINK", "CCRE", request).await.unwrap();
    connection.recv_field("LINK", "SCAR").await.unwrap().unwrap();

    let mut answer = Params::new();
    answer.insert("CAR".parse().unwrap(), AUTH_RESPONSE);
    connection.send("LINK", "CARE", answer).await.unwrap();
    connection.recv_field("LINK", "SCON").await.unwrap().unwrap();

    // Authenticated as far as the server is concerned: commands now work.
    let mut response = connection.send("DSPC", "TIME", Params::new()).await.unwrap();
    let reply = timeout(Duration::from_secs(2), response.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.name(), "TIME");

    connection.close();
    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_clients_are_isolated() {
    init_tracing();
    let server = start_server(echo_handler, "127.0.0.1", 0, ConnectionOptions::default())
        .await
        .unwrap();
    let port = server.local_addr().port();

    let first = connect("127.0.0.1", port, ConnectionOptions::default())
        .await
        .unwrap();
    let second = connect("127.0.0.1", port, ConnectionOptions::default())
        .await
        .unwrap();

    // The first client goes away abruptly.
    first.close();
    first.wait_closed().await;

    // The second is unaffected.
    let mut response = second.send("DSPC", "TIME", Params::new()).await.unwrap();
    let reply = timeout(Duration::from_secs(2), response.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.name(), "TIME");

    second.close();
    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_handler_error_reaches_the_client() {
    init_tracing();

    async fn failing_handler(connection: Connection) -> Result<(), NcpError> {
        let Some(field) = connection.recv().await? else {
            return Ok(());
        };
        Err(NcpError::Command(CommandError {
            packet_type: field.packet_type(),
            field_name: field.name(),
            detail: "unsupported".to_owned(),
            code: 1,
        }))
    }

    let server = start_server(failing_handler, "127.0.0.1", 0, ConnectionOptions::default())
        .await
        .unwrap();

    let connection = connect(
        "127.0.0.1",
        server.local_addr().port(),
        ConnectionOptions::default(),
    )
    .await
    .unwrap();

    connection.send("DSPC", "TIME", Params::new()).await.unwrap();

    // The server's LINK/ERRO report is converted by auto_erro and surfaces
    // on the primary stream.
    let err = timeout(Duration::from_secs(2), connection.recv())
        .await
        .unwrap()
        .unwrap_err();
    match err {
        NcpError::Command(command) => {
            assert_eq!(command.code, 500);
            assert_eq!(command.detail, "Server error");
        }
        other => panic!("expected a command error, got {other:?}"),
    }

    connection.close();
    server.close();
    server.wait_closed().await;
}

#[tokio::test]
async fn test_server_close_disconnects_clients() {
    init_tracing();
    let server = start_server(echo_handler, "127.0.0.1", 0, ConnectionOptions::default())
        .await
        .unwrap();
    let port = server.local_addr().port();

    let connection = connect("127.0.0.1", port, ConnectionOptions::default())
        .await
        .unwrap();

    server.close();
    server.wait_closed().await;

    // The established connection winds down...
    timeout(Duration::from_secs(2), connection.wait_closed())
        .await
        .unwrap();
    assert!(connection.is_closed());

    // ...and nobody is listening anymore.
    assert!(
        connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_handshake_deadline() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A server that accepts and then says nothing.
    let harness = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let options = ConnectionOptions {
        handshake_timeout: Some(Duration::from_millis(200)),
        ..ConnectionOptions::default()
    };
    let started = std::time::Instant::now();
    let err = connect("127.0.0.1", addr.port(), options).await.unwrap_err();
    assert!(matches!(err, NcpError::Authentication(_)));
    assert!(started.elapsed() < Duration::from_secs(2));
    harness.abort();
}
