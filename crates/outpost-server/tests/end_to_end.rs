//! End-to-end tunnel scenarios: a real relay, a real client proxy, and a
//! real local service wired together over loopback listeners on port 0.

use axum::routing::{get, post};
use axum::Router;
use outpost_client::{Binding, ClientConfig, ClientProxy};
use outpost_server::auth::OpenAuthorizer;
use outpost_server::certs::StaticCertProvider;
use outpost_server::config::ServerConfig;
use outpost_server::registry::TunnelRegistry;
use outpost_server::relay::{Relay, RelayHandle};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Serve a small local app on an ephemeral port.
async fn start_local_service() -> SocketAddr {
    let app = Router::new()
        .route(
            "/ping",
            get(|| async { ([("x-local-service", "yes")], "pong") }),
        )
        .route("/echo", post(|body: axum::body::Bytes| async move { body }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start_relay() -> RelayHandle {
    let config = ServerConfig {
        http_port: 0,
        tunnel_port: 0,
        host: "relay.test".to_string(),
        cert_path: None,
        key_path: None,
        // Small chunks so bodies exercise fragmentation both ways.
        max_chunk_size: 1024,
        call_timeout: Duration::from_secs(5),
        assembly_timeout: Duration::from_secs(5),
        max_body_bytes: 10 * 1024 * 1024,
        tokens: HashMap::new(),
    };
    Relay::new(
        config,
        Arc::new(OpenAuthorizer),
        Arc::new(StaticCertProvider::plaintext()),
    )
    .start()
    .await
    .unwrap()
}

fn client_config(tunnel_addr: SocketAddr, host: &str, local_port: u16) -> ClientConfig {
    ClientConfig {
        server_url: format!("ws://127.0.0.1:{}", tunnel_addr.port()),
        token: None,
        bindings: vec![Binding {
            host: host.to_string(),
            local_port,
        }],
        ping_interval: Duration::from_secs(30),
        max_chunk_size: 1024,
    }
}

async fn wait_for_binding(registry: &Arc<TunnelRegistry>, host: &str, present: bool) {
    for _ in 0..200 {
        if registry.resolve(host).await.is_some() == present {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for binding state of {host} (present = {present})");
}

#[tokio::test]
async fn bound_host_roundtrips_to_local_service() {
    let local_addr = start_local_service().await;
    let relay = start_relay().await;

    let proxy = ClientProxy::new(client_config(
        relay.tunnel_addr,
        "a.example.com",
        local_addr.port(),
    ));
    let client_task = tokio::spawn(async move { proxy.run().await });
    wait_for_binding(&relay.registry, "a.example.com", true).await;

    let http = reqwest::Client::new();
    let response = http
        .get(format!("http://127.0.0.1:{}/ping", relay.http_addr.port()))
        .header(reqwest::header::HOST, "a.example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers().get("x-local-service").unwrap(),
        "yes",
        "local service headers must pass through the tunnel"
    );
    assert_eq!(response.text().await.unwrap(), "pong");

    client_task.abort();
}

#[tokio::test]
async fn unbound_host_gets_bad_gateway() {
    let relay = start_relay().await;

    let http = reqwest::Client::new();
    let response = http
        .get(format!("http://127.0.0.1:{}/ping", relay.http_addr.port()))
        .header(reqwest::header::HOST, "b.example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 502);
}

#[tokio::test]
async fn large_bodies_chunk_through_both_directions() {
    let local_addr = start_local_service().await;
    let relay = start_relay().await;

    let proxy = ClientProxy::new(client_config(
        relay.tunnel_addr,
        "a.example.com",
        local_addr.port(),
    ));
    let client_task = tokio::spawn(async move { proxy.run().await });
    wait_for_binding(&relay.registry, "a.example.com", true).await;

    // Far larger than the 1 KiB chunk size used in these tests.
    let body: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();

    let http = reqwest::Client::new();
    let response = http
        .post(format!("http://127.0.0.1:{}/echo", relay.http_addr.port()))
        .header(reqwest::header::HOST, "a.example.com")
        .body(body.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.bytes().await.unwrap().to_vec(), body);

    client_task.abort();
}

#[tokio::test]
async fn second_binder_is_rejected_and_drops_the_binding() {
    let local_addr = start_local_service().await;
    let relay = start_relay().await;

    let proxy_a = ClientProxy::new(client_config(
        relay.tunnel_addr,
        "a.example.com",
        local_addr.port(),
    ));
    let client_a = tokio::spawn(async move { proxy_a.run().await });
    wait_for_binding(&relay.registry, "a.example.com", true).await;
    let owner = relay.registry.resolve("a.example.com").await.unwrap();

    // Second client claims the same host; it gets alreadyBound, drops the
    // binding, and — having no bindings left — ends its session cleanly.
    let proxy_b = ClientProxy::new(client_config(
        relay.tunnel_addr,
        "a.example.com",
        local_addr.port(),
    ));
    let outcome = tokio::time::timeout(Duration::from_secs(5), proxy_b.run())
        .await
        .expect("rejected client must terminate, not hang");
    assert!(outcome.is_ok(), "orderly shutdown expected: {outcome:?}");

    // The first owner keeps serving the host.
    let still_owner = relay.registry.resolve("a.example.com").await.unwrap();
    assert_eq!(still_owner.id(), owner.id());

    client_a.abort();
}

#[tokio::test]
async fn closed_session_releases_its_hosts_for_rebinding() {
    let local_addr = start_local_service().await;
    let relay = start_relay().await;

    let proxy_a = ClientProxy::new(client_config(
        relay.tunnel_addr,
        "a.example.com",
        local_addr.port(),
    ));
    let client_a = tokio::spawn(async move { proxy_a.run().await });
    wait_for_binding(&relay.registry, "a.example.com", true).await;

    // Kill the first client; its connection drop must release the host.
    client_a.abort();
    wait_for_binding(&relay.registry, "a.example.com", false).await;

    // A fresh client can now claim the host and serve traffic.
    let proxy_c = ClientProxy::new(client_config(
        relay.tunnel_addr,
        "a.example.com",
        local_addr.port(),
    ));
    let client_c = tokio::spawn(async move { proxy_c.run().await });
    wait_for_binding(&relay.registry, "a.example.com", true).await;

    let http = reqwest::Client::new();
    let response = http
        .get(format!("http://127.0.0.1:{}/ping", relay.http_addr.port()))
        .header(reqwest::header::HOST, "a.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    client_c.abort();
}

#[tokio::test]
async fn unauthorized_client_is_turned_away() {
    use outpost_server::auth::TokenAuthorizer;

    let mut tokens = HashMap::new();
    tokens.insert("alice".to_string(), "s3cret".to_string());
    let config = ServerConfig {
        http_port: 0,
        tunnel_port: 0,
        host: "relay.test".to_string(),
        cert_path: None,
        key_path: None,
        max_chunk_size: 1024,
        call_timeout: Duration::from_secs(5),
        assembly_timeout: Duration::from_secs(5),
        max_body_bytes: 10 * 1024 * 1024,
        tokens: tokens.clone(),
    };
    let relay = Relay::new(
        config,
        Arc::new(TokenAuthorizer::new(&tokens)),
        Arc::new(StaticCertProvider::plaintext()),
    )
    .start()
    .await
    .unwrap();

    // No token: the relay closes the session before any binding lands.
    let mut config = client_config(relay.tunnel_addr, "a.example.com", 9999);
    config.token = None;
    let outcome = tokio::time::timeout(Duration::from_secs(5), ClientProxy::new(config).run())
        .await
        .expect("rejected client must terminate, not hang");
    assert!(outcome.is_err());
    assert!(relay.registry.resolve("a.example.com").await.is_none());

    // The right token gets through.
    let local_addr = start_local_service().await;
    let mut config = client_config(relay.tunnel_addr, "a.example.com", local_addr.port());
    config.token = Some("s3cret".to_string());
    let client = tokio::spawn(async move { ClientProxy::new(config).run().await });
    wait_for_binding(&relay.registry, "a.example.com", true).await;

    client.abort();
}
