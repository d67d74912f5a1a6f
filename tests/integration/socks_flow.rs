//! SOCKS interop tests
//!
//! Drives the client-role handshake against the server engine over an
//! in-memory stream, so both sides of the wire format are checked against
//! each other rather than against hand-written byte strings.

use std::collections::HashMap;
use std::sync::Arc;

use relay_router::config::{Account, AuthType, SocksServerConfig};
use relay_router::session::{RequestCommand, RequestHeader, User};
use relay_router::socks::{client_handshake, ServerSession};
use relay_router::Address;

fn server(config: SocksServerConfig) -> ServerSession {
    ServerSession::new(Arc::new(config), Some("127.0.0.1:1080".parse().unwrap()))
}

fn request(command: RequestCommand, addr: &str, port: u16, user: Option<User>) -> RequestHeader {
    RequestHeader {
        version: 5,
        command,
        address: Address::parse(addr),
        port,
        user,
    }
}

#[tokio::test]
async fn no_auth_connect_interop() {
    let (mut client, mut upstream) = tokio::io::duplex(512);
    let sess = server(SocksServerConfig::default());

    let server_task = tokio::spawn(async move { sess.handshake(&mut upstream).await });

    let req = request(RequestCommand::Tcp, "example.com", 443, None);
    let relay = client_handshake(&req, None, &mut client).await.unwrap();
    assert!(relay.is_none());

    let header = server_task.await.unwrap().unwrap();
    assert_eq!(header.command, RequestCommand::Tcp);
    assert_eq!(header.address, Address::Domain("example.com".into()));
    assert_eq!(header.port, 443);
    assert!(header.user.is_none());
}

#[tokio::test]
async fn password_auth_interop_carries_identity() {
    let (mut client, mut upstream) = tokio::io::duplex(512);
    let sess = server(SocksServerConfig {
        auth: AuthType::Password,
        accounts: HashMap::from([("alice".to_string(), "secret".to_string())]),
        ..Default::default()
    });

    let server_task = tokio::spawn(async move { sess.handshake(&mut upstream).await });

    let req = request(RequestCommand::Tcp, "10.1.2.3", 8080, None);
    let account = Account::new("alice", "secret");
    client_handshake(&req, Some(&account), &mut client)
        .await
        .unwrap();

    let header = server_task.await.unwrap().unwrap();
    assert_eq!(header.user, Some(User::new("alice")));
    assert_eq!(header.address, Address::parse("10.1.2.3"));
}

#[tokio::test]
async fn bad_credentials_fail_both_sides() {
    let (mut client, mut upstream) = tokio::io::duplex(512);
    let sess = server(SocksServerConfig {
        auth: AuthType::Password,
        accounts: HashMap::from([("alice".to_string(), "secret".to_string())]),
        ..Default::default()
    });

    let server_task = tokio::spawn(async move { sess.handshake(&mut upstream).await });

    let req = request(RequestCommand::Tcp, "10.1.2.3", 8080, None);
    let account = Account::new("alice", "wrong");
    assert!(client_handshake(&req, Some(&account), &mut client)
        .await
        .is_err());
    assert!(server_task.await.unwrap().is_err());
}

#[tokio::test]
async fn udp_associate_interop_returns_relay() {
    let (mut client, mut upstream) = tokio::io::duplex(512);
    let sess = server(SocksServerConfig {
        udp_enabled: true,
        relay_address: Some("192.0.2.7".parse().unwrap()),
        ..Default::default()
    });

    let server_task = tokio::spawn(async move { sess.handshake(&mut upstream).await });

    let req = request(RequestCommand::Udp, "8.8.8.8", 53, None);
    let relay = client_handshake(&req, None, &mut client)
        .await
        .unwrap()
        .expect("UDP associate yields a relay header");

    assert_eq!(relay.command, RequestCommand::Udp);
    assert_eq!(relay.address, Address::parse("192.0.2.7"));
    assert_eq!(relay.port, 1080);

    let header = server_task.await.unwrap().unwrap();
    assert_eq!(header.command, RequestCommand::Udp);
}
