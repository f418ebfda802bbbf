// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! Tests against a local HTTP server standing in for the release mirror and
//! for a kubernetes API server

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tiny_http::{Response, Server, StatusCode};

use kuberlr::downloader::{HashAlgorithm, copy_into_place};
use kuberlr::*;

const KUBECTL_BODY: &[u8] = b"#!/bin/sh\necho pretend kubectl\n";

#[derive(Default)]
struct Routes {
    responses: HashMap<String, (u16, Vec<u8>)>,
    hits: HashMap<String, u32>,
    headers: HashMap<String, Vec<String>>,
}

/// HTTP server answering canned responses and recording what it was asked
struct TestServer {
    base_url: String,
    routes: Arc<Mutex<Routes>>,
}

impl TestServer {
    fn start() -> Self {
        let server = Server::http("127.0.0.1:0").expect("http server");
        let base_url = format!("http://{}", server.server_addr());
        let routes = Arc::new(Mutex::new(Routes::default()));

        let shared = Arc::clone(&routes);
        thread::spawn(move || {
            for req in server.incoming_requests() {
                let path = req.url().to_string();
                let headers = req
                    .headers()
                    .iter()
                    .map(|h| format!("{}: {}", h.field, h.value).to_lowercase())
                    .collect();

                let (status, body) = {
                    let mut routes = shared.lock().unwrap();
                    *routes.hits.entry(path.clone()).or_insert(0) += 1;
                    routes.headers.insert(path.clone(), headers);
                    routes
                        .responses
                        .get(&path)
                        .cloned()
                        .unwrap_or((404, b"not found".to_vec()))
                };
                let _ = req.respond(Response::from_data(body).with_status_code(StatusCode(status)));
            }
        });

        Self { base_url, routes }
    }

    fn serve(&self, path: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.routes
            .lock()
            .unwrap()
            .responses
            .insert(path.to_string(), (status, body.into()));
    }

    fn hits(&self, path: &str) -> u32 {
        self.routes
            .lock()
            .unwrap()
            .hits
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    fn request_headers(&self, path: &str) -> Vec<String> {
        self.routes
            .lock()
            .unwrap()
            .headers
            .get(path)
            .cloned()
            .unwrap_or_default()
    }
}

const BINARY_PATH: &str = "/release/v1.20.0/bin/linux/amd64/kubectl";

fn downloader(server: &TestServer, scratch: &Path) -> Downloader {
    Downloader::new(format!("{}/", server.base_url))
        .with_platform(Platform::LINUX_AMD64)
        .with_scratch_dir(scratch)
        .with_progress(false)
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            backoff_step: Duration::ZERO,
        })
}

// =============================================================================
// Downloader
// =============================================================================

#[cfg(test)]
mod downloader_tests {
    use super::*;

    #[test]
    fn test_urls() {
        let d = Downloader::new("https://mirror.example.com/")
            .with_platform(Platform::DARWIN_ARM64);
        assert_eq!(
            d.stable_version_url(),
            "https://mirror.example.com/release/stable.txt"
        );
        assert_eq!(
            d.binary_url(Version::new(1, 20, 0)),
            "https://mirror.example.com/release/v1.20.0/bin/darwin/arm64/kubectl"
        );
        let w = Downloader::new("https://mirror.example.com")
            .with_platform(Platform::WINDOWS_AMD64);
        assert!(w.binary_url(Version::new(1, 20, 0)).ends_with("/windows/amd64/kubectl.exe"));
    }

    #[test]
    fn test_upstream_stable_version() {
        let server = TestServer::start();
        server.serve("/release/stable.txt", 200, "v1.29.1\n");
        let tmp = tempfile::tempdir().unwrap();

        let version = downloader(&server, tmp.path()).upstream_stable_version().unwrap();
        assert_eq!(version, Version::new(1, 29, 1));
    }

    #[test]
    fn test_upstream_stable_version_unavailable() {
        let server = TestServer::start();
        let tmp = tempfile::tempdir().unwrap();

        let err = downloader(&server, tmp.path()).upstream_stable_version().unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 404, .. }));
    }

    #[test]
    fn test_download_installs_verified_binary() {
        let server = TestServer::start();
        let digest = HashAlgorithm::Sha512.hex_digest(KUBECTL_BODY);
        server.serve(BINARY_PATH, 200, KUBECTL_BODY);
        server.serve(
            &format!("{BINARY_PATH}.sha512"),
            200,
            format!("{}  kubectl\n", digest.to_uppercase()),
        );
        let tmp = tempfile::tempdir().unwrap();
        let destination = tmp.path().join("cache/linux-amd64/kubectl1.20.0");

        downloader(&server, tmp.path())
            .download(Version::new(1, 20, 0), &destination)
            .unwrap();

        assert_eq!(fs::read(&destination).unwrap(), KUBECTL_BODY);
        assert_eq!(server.hits(BINARY_PATH), 1);
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("kuberlr-kubectl-"))
            .collect();
        assert!(leftovers.is_empty());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&destination).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_old_releases_use_sha1() {
        let server = TestServer::start();
        let path = "/release/v1.11.3/bin/linux/amd64/kubectl";
        server.serve(path, 200, KUBECTL_BODY);
        server.serve(
            &format!("{path}.sha1"),
            200,
            HashAlgorithm::Sha1.hex_digest(KUBECTL_BODY),
        );
        let tmp = tempfile::tempdir().unwrap();
        let destination = tmp.path().join("kubectl1.11.3");

        downloader(&server, tmp.path())
            .download(Version::new(1, 11, 3), &destination)
            .unwrap();

        assert!(destination.exists());
        assert_eq!(server.hits(&format!("{path}.sha512")), 0);
        assert_eq!(server.hits(&format!("{path}.sha1")), 1);
    }

    #[test]
    fn test_checksum_mismatch_is_retried() {
        let server = TestServer::start();
        server.serve(BINARY_PATH, 200, KUBECTL_BODY);
        server.serve(
            &format!("{BINARY_PATH}.sha512"),
            200,
            HashAlgorithm::Sha512.hex_digest(b"something else"),
        );
        let tmp = tempfile::tempdir().unwrap();
        let destination = tmp.path().join("kubectl1.20.0");

        let err = downloader(&server, tmp.path())
            .download(Version::new(1, 20, 0), &destination)
            .unwrap_err();

        match &err {
            Error::ChecksumMismatch { url, expected, actual } => {
                assert!(url.ends_with(BINARY_PATH));
                assert_eq!(expected, &HashAlgorithm::Sha512.hex_digest(b"something else"));
                assert_eq!(actual, &HashAlgorithm::Sha512.hex_digest(KUBECTL_BODY));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.hits(BINARY_PATH), 3);
        assert!(!destination.exists());
    }

    #[test]
    fn test_missing_checksum_aborts_immediately() {
        let server = TestServer::start();
        server.serve(BINARY_PATH, 200, KUBECTL_BODY);
        let tmp = tempfile::tempdir().unwrap();
        let destination = tmp.path().join("kubectl1.20.0");

        let err = downloader(&server, tmp.path())
            .download(Version::new(1, 20, 0), &destination)
            .unwrap_err();

        assert!(matches!(err, Error::HttpStatus { status: 404, .. }));
        assert_eq!(server.hits(&format!("{BINARY_PATH}.sha512")), 1);
        assert_eq!(server.hits(BINARY_PATH), 0);
        assert!(!destination.exists());
    }

    fn staged_leftovers(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".kuberlr-kubectl-"))
            .count()
    }

    #[test]
    fn test_copy_into_place_replaces_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("download");
        fs::write(&source, KUBECTL_BODY).unwrap();
        let cache = tmp.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        let destination = cache.join("kubectl1.20.0");
        fs::write(&destination, "stale").unwrap();

        copy_into_place(&source, &destination).unwrap();

        assert_eq!(fs::read(&destination).unwrap(), KUBECTL_BODY);
        assert!(source.exists());
        assert_eq!(staged_leftovers(&cache), 0);
    }

    #[test]
    fn test_failed_copy_leaves_no_partial_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        let destination = cache.join("kubectl1.20.0");

        let err = copy_into_place(&tmp.path().join("vanished"), &destination).unwrap_err();

        assert!(matches!(err, Error::Io { .. }));
        assert!(!destination.exists());
        assert_eq!(staged_leftovers(&cache), 0);
        let finder = KubectlFinder::new(&cache, tmp.path().join("system"));
        assert!(finder.local_binaries().unwrap().is_empty());
    }

    #[test]
    fn test_unreachable_mirror() {
        let tmp = tempfile::tempdir().unwrap();
        let d = Downloader::new("http://127.0.0.1:1")
            .with_platform(Platform::LINUX_AMD64)
            .with_progress(false);
        let err = d
            .download(Version::new(1, 20, 0), &tmp.path().join("kubectl1.20.0"))
            .unwrap_err();
        assert!(matches!(err, Error::Http { .. }));
    }
}

// =============================================================================
// API server version
// =============================================================================

#[cfg(test)]
mod kubeapi_http_tests {
    use super::*;

    fn kubeconfig(dir: &Path, server: &str, user: &str) -> std::path::PathBuf {
        let path = dir.join("config");
        fs::write(
            &path,
            format!(
                "current-context: test\n\
                 clusters:\n\
                 - name: test\n  cluster:\n    server: {server}\n\
                 contexts:\n\
                 - name: test\n  context:\n    cluster: test\n    user: test\n\
                 users:\n\
                 - name: test\n  user:\n{user}"
            ),
        )
        .unwrap();
        path
    }

    fn scope_guard() -> RecursionGuard {
        RecursionGuard::new(PREVENT_RECURSION_ENV, false)
    }

    #[test]
    fn test_server_version_with_token() {
        let server = TestServer::start();
        server.serve(
            "/version",
            200,
            r#"{"major":"1","minor":"27","gitVersion":"v1.27.3+k3s1","platform":"linux/amd64"}"#,
        );
        let tmp = tempfile::tempdir().unwrap();
        let path = kubeconfig(tmp.path(), &server.base_url, "    token: s3cr3t\n");

        let api = KubeApi::new().with_kubeconfig(&path);
        let version = api
            .server_version(Duration::from_secs(5), &scope_guard().scope())
            .unwrap();

        assert_eq!(version, Version::new(1, 27, 3));
        assert!(
            server
                .request_headers("/version")
                .contains(&"authorization: bearer s3cr3t".to_string())
        );
    }

    #[test]
    fn test_server_version_with_token_file() {
        let server = TestServer::start();
        server.serve("/version", 200, r#"{"gitVersion":"v1.30.0"}"#);
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("token"), "from-file\n").unwrap();
        let path = kubeconfig(tmp.path(), &server.base_url, "    tokenFile: token\n");

        let version = KubeApi::new()
            .with_kubeconfig(&path)
            .server_version(Duration::from_secs(5), &scope_guard().scope())
            .unwrap();

        assert_eq!(version, Version::new(1, 30, 0));
        assert!(
            server
                .request_headers("/version")
                .contains(&"authorization: bearer from-file".to_string())
        );
    }

    #[test]
    fn test_server_error_status() {
        let server = TestServer::start();
        server.serve("/version", 403, "forbidden");
        let tmp = tempfile::tempdir().unwrap();
        let path = kubeconfig(tmp.path(), &server.base_url, "    token: nope\n");

        let err = KubeApi::new()
            .with_kubeconfig(&path)
            .server_version(Duration::from_secs(5), &scope_guard().scope())
            .unwrap_err();
        assert!(matches!(err, Error::Api(_)));
    }

    #[test]
    fn test_unreachable_server() {
        let tmp = tempfile::tempdir().unwrap();
        let path = kubeconfig(tmp.path(), "http://127.0.0.1:1", "    token: t\n");

        let err = KubeApi::new()
            .with_kubeconfig(&path)
            .server_version(Duration::from_secs(2), &scope_guard().scope())
            .unwrap_err();
        assert!(err.is_unreachable());
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_plugin_sees_resolution_marker() {
        use std::os::unix::fs::PermissionsExt;

        let server = TestServer::start();
        server.serve("/version", 200, r#"{"gitVersion":"v1.26.1"}"#);
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("marker");
        let plugin = tmp.path().join("credential-plugin");
        fs::write(
            &plugin,
            format!(
                "#!/bin/sh\nprintf '%s' \"$KUBERLR_RESOLVING_VERSION\" > '{}'\n\
                 echo '{{\"apiVersion\":\"client.authentication.k8s.io/v1beta1\",\"kind\":\"ExecCredential\",\"status\":{{\"token\":\"from-plugin\"}}}}'\n",
                marker.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&plugin, fs::Permissions::from_mode(0o755)).unwrap();

        let user = format!(
            "    exec:\n      apiVersion: client.authentication.k8s.io/v1beta1\n      command: {}\n",
            plugin.display()
        );
        let path = kubeconfig(tmp.path(), &server.base_url, &user);

        let version = KubeApi::new()
            .with_kubeconfig(&path)
            .server_version(Duration::from_secs(5), &scope_guard().scope())
            .unwrap();

        assert_eq!(version, Version::new(1, 26, 1));
        assert_eq!(fs::read_to_string(&marker).unwrap(), "1");
        assert!(
            server
                .request_headers("/version")
                .contains(&"authorization: bearer from-plugin".to_string())
        );
        assert!(std::env::var_os(PREVENT_RECURSION_ENV).is_none());
    }
}

// =============================================================================
// Client certificate authentication
// =============================================================================

#[cfg(test)]
mod client_certificate_tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use rcgen::{
        BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
        KeyPair,
    };
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::server::WebPkiClientVerifier;
    use rustls::{RootCertStore, ServerConfig, ServerConnection, StreamOwned};

    /// A throwaway CA with a server and a client certificate issued by it
    struct Pki {
        ca: Certificate,
        server: (Certificate, KeyPair),
        client: (Certificate, KeyPair),
    }

    impl Pki {
        fn generate() -> Self {
            let ca_key = KeyPair::generate().unwrap();
            let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
            ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            ca_params
                .distinguished_name
                .push(DnType::CommonName, "kuberlr test ca");
            let ca = ca_params.self_signed(&ca_key).unwrap();

            let server_key = KeyPair::generate().unwrap();
            let server = CertificateParams::new(vec!["127.0.0.1".to_string()])
                .unwrap()
                .signed_by(&server_key, &ca, &ca_key)
                .unwrap();

            let client_key = KeyPair::generate().unwrap();
            let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
            client_params
                .distinguished_name
                .push(DnType::CommonName, "kubernetes-admin");
            client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
            let client = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

            Self {
                ca,
                server: (server, server_key),
                client: (client, client_key),
            }
        }
    }

    /// TLS endpoint that only completes handshakes presenting a certificate
    /// signed by the test CA, and answers `/version` for each of them
    fn start_mtls_api_server(pki: &Pki, git_version: &str) -> String {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = RootCertStore::empty();
        roots.add(pki.ca.der().clone()).unwrap();
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .unwrap();
        let (server_cert, server_key) = &pki.server;
        let config = Arc::new(
            ServerConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_client_cert_verifier(verifier)
                .with_single_cert(
                    vec![server_cert.der().clone()],
                    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server_key.serialize_der())),
                )
                .unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("https://{}", listener.local_addr().unwrap());
        let body = format!(r#"{{"gitVersion":"{git_version}"}}"#);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let Ok(connection) = ServerConnection::new(Arc::clone(&config)) else { continue };
                let mut tls = StreamOwned::new(connection, stream);

                // Rejected handshakes surface here as read errors
                let mut reader = BufReader::new(&mut tls);
                let mut line = String::new();
                let mut complete = false;
                while let Ok(n) = reader.read_line(&mut line) {
                    if n == 0 {
                        break;
                    }
                    if line == "\r\n" {
                        complete = true;
                        break;
                    }
                    line.clear();
                }
                if !complete {
                    continue;
                }

                let _ = write!(
                    tls,
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                tls.conn.send_close_notify();
                let _ = tls.flush();
            }
        });
        url
    }

    fn kubeconfig(dir: &Path, pki: &Pki, server: &str, user: &str) -> std::path::PathBuf {
        let path = dir.join("config");
        fs::write(
            &path,
            format!(
                "current-context: kind\n\
                 clusters:\n\
                 - name: kind\n  cluster:\n    server: {server}\n    certificate-authority-data: {}\n\
                 contexts:\n\
                 - name: kind\n  context:\n    cluster: kind\n    user: kind-admin\n\
                 users:\n\
                 - name: kind-admin\n  user:\n{user}",
                BASE64.encode(pki.ca.pem())
            ),
        )
        .unwrap();
        path
    }

    fn scope_guard() -> RecursionGuard {
        RecursionGuard::new(PREVENT_RECURSION_ENV, false)
    }

    #[test]
    fn test_server_version_with_client_certificate() {
        let pki = Pki::generate();
        let server = start_mtls_api_server(&pki, "v1.31.2");
        let tmp = tempfile::tempdir().unwrap();
        let (client_cert, client_key) = &pki.client;
        fs::create_dir_all(tmp.path().join("pki")).unwrap();
        fs::write(tmp.path().join("pki/admin.crt"), client_cert.pem()).unwrap();
        let user = format!(
            "    client-certificate: pki/admin.crt\n    client-key-data: {}\n",
            BASE64.encode(client_key.serialize_pem())
        );
        let path = kubeconfig(tmp.path(), &pki, &server, &user);

        let version = KubeApi::new()
            .with_kubeconfig(&path)
            .server_version(Duration::from_secs(5), &scope_guard().scope())
            .unwrap();

        assert_eq!(version, Version::new(1, 31, 2));
    }

    #[test]
    fn test_server_requiring_certificate_rejects_token_user() {
        let pki = Pki::generate();
        let server = start_mtls_api_server(&pki, "v1.31.2");
        let tmp = tempfile::tempdir().unwrap();
        let path = kubeconfig(tmp.path(), &pki, &server, "    token: not-enough\n");

        let err = KubeApi::new()
            .with_kubeconfig(&path)
            .server_version(Duration::from_secs(5), &scope_guard().scope())
            .unwrap_err();

        assert!(err.is_unreachable(), "{err}");
    }
}
