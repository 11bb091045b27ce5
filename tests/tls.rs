//! Ad-hoc certificates and HTTPS serving.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use common::{server_config, start_bound, start_server};
use devserver::config::TlsSource;
use devserver::{app_fn, generate_adhoc_pair, Body, Server, Start};
use x509_parser::pem::parse_x509_pem;

fn ok_app() -> impl devserver::App {
    app_fn(|req, res| {
        let body = format!("{} {}", req.scheme(), req.path());
        res.start(Start::ok(
            200,
            vec![("Content-Length".into(), body.len().to_string())],
        ))?;
        Ok(Body::from(body))
    })
}

fn insecure_client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap()
}

#[test]
fn adhoc_certificates_are_unique_self_signed_and_valid_for_a_year() {
    let first = generate_adhoc_pair(Some("localhost")).unwrap();
    let second = generate_adhoc_pair(Some("localhost")).unwrap();

    let (_, first_pem) = parse_x509_pem(first.cert_pem.as_bytes()).unwrap();
    let (_, second_pem) = parse_x509_pem(second.cert_pem.as_bytes()).unwrap();
    let first_cert = first_pem.parse_x509().unwrap();
    let second_cert = second_pem.parse_x509().unwrap();

    assert_ne!(first_cert.raw_serial(), second_cert.raw_serial());
    assert!(first_cert.raw_serial()[0] & 0x80 == 0, "serial must be positive");

    assert_eq!(first_cert.issuer(), first_cert.subject());
    first_cert.verify_signature(None).unwrap();

    let validity = first_cert.validity();
    let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
    assert_eq!(lifetime, 365 * 24 * 60 * 60);
    assert!(validity.is_valid());

    let subject = first_cert.subject();
    let cn = subject.iter_common_name().next().unwrap().as_str().unwrap();
    let org = subject.iter_organization().next().unwrap().as_str().unwrap();
    assert_eq!(cn, "localhost");
    assert_eq!(org, "Dummy Certificate");

    assert!(first.key_pem.contains("PRIVATE KEY"));
}

#[test]
fn default_common_name_is_a_wildcard() {
    let pair = generate_adhoc_pair(None).unwrap();
    let (_, pem) = parse_x509_pem(pair.cert_pem.as_bytes()).unwrap();
    let cert = pem.parse_x509().unwrap();
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .unwrap()
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(cn, "*");
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_https_with_an_adhoc_certificate() {
    let mut config = server_config(18421);
    config.tls = TlsSource::Adhoc {
        common_name: Some("localhost".into()),
    };
    let server = Server::bind(&config, ok_app()).unwrap();
    assert_eq!(server.scheme(), "https");
    let adhoc = server.tls().unwrap().adhoc().unwrap();
    let cert_path = adhoc.cert_path().to_path_buf();
    let key_path = adhoc.key_path().to_path_buf();
    assert!(cert_path.exists() && key_path.exists());

    let server = start_bound(server);
    let url = format!("https://localhost:{}/secure", server.addr.port());

    let text = insecure_client()
        .get(&url)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(text, "https /secure");

    // A verifying client must refuse the self-signed certificate.
    assert!(reqwest::get(&url).await.is_err());

    server.stop().await;
    assert!(!cert_path.exists());
    assert!(!key_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_https_from_certificate_files() {
    let dir = tempfile::tempdir().unwrap();
    let pair = generate_adhoc_pair(Some("localhost")).unwrap();
    let cert_path = dir.path().join("server.crt");
    let key_path = dir.path().join("server.key");
    std::fs::write(&cert_path, &pair.cert_pem).unwrap();
    std::fs::write(&key_path, &pair.key_pem).unwrap();

    let mut config = server_config(18422);
    config.tls = TlsSource::Files {
        cert_path: cert_path.clone(),
        key_path: key_path.clone(),
    };
    let server = start_server(&config, ok_app());

    let url = format!("https://localhost:{}/files", server.addr.port());
    let text = insecure_client()
        .get(&url)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(text, "https /files");

    server.stop().await;
    // Files the user supplied are never removed.
    assert!(cert_path.exists() && key_path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn plaintext_client_does_not_stop_a_tls_server() {
    let mut config = server_config(18423);
    config.tls = TlsSource::Adhoc { common_name: None };
    let server = start_server(&config, ok_app());

    let addr = server.addr;
    let out = tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let mut response = Vec::new();
        // The server may reset the connection; either way no HTTP comes back.
        let _ = stream.read_to_end(&mut response);
        String::from_utf8_lossy(&response).into_owned()
    })
    .await
    .unwrap();
    assert!(!out.contains("200 OK"));

    let url = format!("https://127.0.0.1:{}/", server.addr.port());
    let response = insecure_client().get(&url).send().await.unwrap();
    assert_eq!(response.status(), 200);

    server.stop().await;
}

#[test]
fn missing_certificate_files_fail_at_bind() {
    let mut config = server_config(18424);
    config.tls = TlsSource::Files {
        cert_path: "/nonexistent/server.crt".into(),
        key_path: "/nonexistent/server.key".into(),
    };
    let err = Server::bind(&config, ok_app()).unwrap_err();
    assert!(err.to_string().contains("/nonexistent/server.crt"));
}
