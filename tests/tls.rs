//! TLS listener with generated certificates: server authentication only,
//! then mutual authentication with an encrypted client key.

mod common;

use std::sync::Arc;

use pkcs8::pkcs5::pbes2;
use pkcs8::{LineEnding, PrivateKeyInfo};
use rcgen::{BasicConstraints, Certificate, CertificateParams, IsCa, KeyPair};
use warren::client::{Connection, ConnectionParams};
use warren::patterns::hello;
use warren::server::Server;
use warren::tls;

struct Authority {
    pem: String,
    cert: Certificate,
    key: KeyPair,
}

impl Authority {
    fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        Self {
            pem: cert.pem(),
            cert,
            key,
        }
    }

    /// Returns certificate and key, both PEM.
    fn issue(&self, name: &str) -> (String, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec![name.to_owned()])
            .unwrap()
            .signed_by(&key, &self.cert, &self.key)
            .unwrap();
        (cert.pem(), key)
    }
}

fn encrypt(key: &KeyPair, password: &str) -> String {
    let der = key.serialize_der();
    let info = PrivateKeyInfo::try_from(der.as_slice()).unwrap();
    let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(1_000, b"tls-test", &[3u8; 16]).unwrap();
    info.encrypt_with_params(params, password)
        .unwrap()
        .to_pem("ENCRYPTED PRIVATE KEY", LineEnding::LF)
        .unwrap()
        .to_string()
}

async fn tls_server(config: Arc<rustls::ServerConfig>) -> (warren::Broker, u16) {
    let broker = common::broker();
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), broker.clone())
        .await
        .unwrap()
        .with_tls(config);
    let port = server.local_addr().unwrap().port();
    server.spawn();
    (broker, port)
}

async fn round_trip(connection: &Connection) {
    let channel = connection.create_channel().await.unwrap();
    hello::setup(&channel).await.unwrap();
    let mut received = hello::receive(&channel, true).await.unwrap();
    hello::send_confirmed(&channel, "over tls", common::WAIT).await.unwrap();
    assert_eq!(common::recv(&mut received).await, "over tls");
}

#[tokio::test]
async fn client_verifies_the_broker() {
    let authority = Authority::new();
    let (cert, key) = authority.issue("localhost");
    let config = tls::server_config(cert.as_bytes(), key.serialize_pem().as_bytes(), None, None).unwrap();
    let (_broker, port) = tls_server(config).await;

    let client = tls::client_config(authority.pem.as_bytes()).unwrap();
    let params = ConnectionParams::new("127.0.0.1").tls(client, "localhost").port(port);
    let connection = Connection::open(&params).await.unwrap();
    round_trip(&connection).await;
    connection.close().await.unwrap();

    // a CA that did not sign the broker certificate is refused
    let stranger = Authority::new();
    let client = tls::client_config(stranger.pem.as_bytes()).unwrap();
    let params = ConnectionParams::new("127.0.0.1").tls(client, "localhost").port(port);
    assert!(Connection::open(&params).await.is_err());
}

#[tokio::test]
async fn broker_requires_a_client_certificate_when_configured() {
    let authority = Authority::new();
    let (server_cert, server_key) = authority.issue("localhost");
    let encrypted_server_key = encrypt(&server_key, "broker-pass");
    let config = tls::server_config(
        server_cert.as_bytes(),
        encrypted_server_key.as_bytes(),
        Some("broker-pass"),
        Some(authority.pem.as_bytes()),
    )
    .unwrap();
    let (broker, port) = tls_server(config).await;

    let (client_cert, client_key) = authority.issue("client");
    let client = tls::client_config_with_identity(
        authority.pem.as_bytes(),
        client_cert.as_bytes(),
        encrypt(&client_key, "client-pass").as_bytes(),
        Some("client-pass"),
    )
    .unwrap();
    let params = ConnectionParams::new("127.0.0.1").tls(client, "localhost").port(port);
    let connection = Connection::open(&params).await.unwrap();
    round_trip(&connection).await;
    assert_eq!(broker.overview().await.unwrap().connections, 1);
    connection.close().await.unwrap();

    let anonymous = tls::client_config(authority.pem.as_bytes()).unwrap();
    let params = ConnectionParams::new("127.0.0.1").tls(anonymous, "localhost").port(port);
    assert!(Connection::open(&params).await.is_err());
}

#[test]
fn wrong_key_password_is_a_tls_error() {
    let authority = Authority::new();
    let (cert, key) = authority.issue("localhost");
    let encrypted = encrypt(&key, "right");

    let result = tls::server_config(cert.as_bytes(), encrypted.as_bytes(), Some("wrong"), None);
    assert!(matches!(result, Err(warren::Error::Tls(_))));
}
