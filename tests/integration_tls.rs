use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};

use native_tls::{Identity, TlsAcceptor};

use outcall::{AgentConfig, Error, HttpAgent, RequestBuilder, TransportErrorKind, TrustMode};

/// Minimal TLS server presenting a freshly generated self-signed
/// certificate for `localhost`. Serves one request per connection, up
/// to `max_connections` accepts; failed handshakes count as served
/// connections.
fn start_tls_server(max_connections: usize) -> (String, JoinHandle<()>) {
    let key_pair = rcgen::KeyPair::generate().expect("generate key pair");
    let params =
        rcgen::CertificateParams::new(vec!["localhost".to_owned()]).expect("certificate params");
    let certificate = params.self_signed(&key_pair).expect("self-sign certificate");
    let identity = Identity::from_pkcs8(
        certificate.pem().as_bytes(),
        key_pair.serialize_pem().as_bytes(),
    )
    .expect("build server identity");
    let acceptor = TlsAcceptor::new(identity).expect("build tls acceptor");

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind tls listener");
    let address = listener.local_addr().expect("tls listener address");

    let join = thread::spawn(move || {
        for _ in 0..max_connections {
            let Ok((stream, _)) = listener.accept() else {
                break;
            };
            let Ok(mut tls) = acceptor.accept(stream) else {
                // The peer rejected the self-signed chain.
                continue;
            };

            let mut head = Vec::new();
            let mut chunk = [0_u8; 4096];
            loop {
                match tls.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        head.extend_from_slice(&chunk[..read]);
                        if head.windows(4).any(|window| window == b"\r\n\r\n") {
                            break;
                        }
                    }
                }
            }
            let _ = tls
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
            let _ = tls.flush();
        }
    });

    (format!("https://localhost:{}", address.port()), join)
}

#[test]
fn trust_all_connects_to_a_self_signed_server() {
    let (base_url, server) = start_tls_server(1);

    let response = RequestBuilder::get(format!("{base_url}/v1/ping"))
        .trust_all()
        .send()
        .expect("trust-all must accept the self-signed certificate");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text(), "ok");

    server.join().expect("server thread finishes");
}

#[test]
fn standard_validation_rejects_a_self_signed_server() {
    let (base_url, server) = start_tls_server(1);

    let error = RequestBuilder::get(format!("{base_url}/v1/ping"))
        .send()
        .expect_err("standard validation must reject the self-signed certificate");
    assert_eq!(error.transport_kind(), Some(TransportErrorKind::Tls));

    server.join().expect("server thread finishes");
}

#[test]
fn agent_clients_apply_their_trust_mode() {
    let (base_url, server) = start_tls_server(2);
    let url = format!("{base_url}/v1/ping");

    let agent = HttpAgent::new(AgentConfig::new()).expect("agent builds");

    let trusting = agent
        .acquire_client(TrustMode::TrustAll)
        .expect("trust-all client builds");
    let descriptor = RequestBuilder::get(&url).build().expect("descriptor builds");
    let response = trusting.execute(&descriptor).expect("trust-all call succeeds");
    assert_eq!(response.text(), "ok");

    let strict = agent
        .acquire_client(TrustMode::None)
        .expect("standard client builds");
    let error = strict
        .execute(&descriptor)
        .expect_err("standard validation must fail against the same server");
    assert_eq!(error.transport_kind(), Some(TransportErrorKind::Tls));

    server.join().expect("server thread finishes");
}

#[test]
fn mutual_keystore_problems_are_fatal_at_client_acquisition() {
    let agent = HttpAgent::new(AgentConfig::new()).expect("agent builds");

    let missing = agent.acquire_client(TrustMode::Mutual {
        keystore_path: "/nonexistent/client.p12".into(),
        password: "secret".to_owned(),
    });
    assert!(matches!(missing, Err(Error::TlsConfig { .. })));

    let dir = std::env::temp_dir().join("outcall-tls-integration");
    std::fs::create_dir_all(&dir).expect("create temp dir");
    let keystore_path = dir.join("corrupt.p12");
    std::fs::write(&keystore_path, b"not a pkcs12 archive").expect("write junk keystore");

    let corrupt = agent.acquire_client(TrustMode::Mutual {
        keystore_path,
        password: "secret".to_owned(),
    });
    assert!(matches!(corrupt, Err(Error::TlsConfig { .. })));
}
