//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use httpsys::api::{HttpSys, InitFlags, Property};
use httpsys::config::{Registry, RegistryStore};
use httpsys::context::{ServerSettings, Services};
use httpsys::handles::Handle;
use httpsys::http::{HttpRequest, HttpResponse, ReceiveFlags, SendFlags};
use httpsys::net::tls::PemDirectoryStore;
use httpsys::session::ApiVersion;

pub const CERT_ROOT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/certs");
pub const CERT_THUMBPRINT: &str = "858D59BD518CB31BDD4FCB04060E125448AD0251";

/// A running server: the API object plus the handles a test drives.
pub struct TestServer {
    pub api: Arc<HttpSys>,
    pub session: Handle,
    pub queue: Handle,
    pub group: Handle,
}

/// Loopback-only services with every listed prefix reserved.
pub fn services(registry: Registry) -> Services {
    Services::new(Arc::new(RegistryStore::new(registry)))
        .with_certificates(Arc::new(PemDirectoryStore::new(CERT_ROOT)))
        .with_settings(ServerSettings::loopback())
}

/// Session, queue and a bound group serving `prefixes` as `(url, context)`.
pub async fn start(services: Services, prefixes: &[(&str, u64)]) -> TestServer {
    let api = Arc::new(HttpSys::new(services));
    let session = api.initialize(ApiVersion::V2, InitFlags::SERVER).unwrap();
    let queue = api.create_request_queue(None).unwrap();
    let group = api.create_url_group(session).unwrap();
    api.set_url_group_property(group, Property::Binding(queue)).unwrap();
    for (url, context) in prefixes {
        api.add_url_to_url_group(group, url, *context).await.unwrap();
    }
    TestServer {
        api,
        session,
        queue,
        group,
    }
}

/// `start` with a plain registry reserving each prefix.
pub async fn start_plain(prefixes: &[(&str, u64)]) -> TestServer {
    let registry = Registry::with_acl(prefixes.iter().map(|(url, _)| *url));
    start(services(registry), prefixes).await
}

impl TestServer {
    pub async fn receive(&self) -> HttpRequest {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.api
                .receive_http_request(self.queue, Handle::NULL, ReceiveFlags::COPY_BODY, 64 * 1024, None),
        )
        .await
        .expect("no request arrived")
        .unwrap()
        .complete()
        .unwrap()
    }

    pub async fn respond(&self, request: &HttpRequest, response: HttpResponse) -> u64 {
        self.api
            .send_http_response(self.queue, request.request_id, response, SendFlags::NONE, None)
            .await
            .unwrap()
            .complete()
            .unwrap()
    }

    /// Answer requests with `200 <context>` until the queue shuts down.
    pub fn serve_context(&self) -> tokio::task::JoinHandle<()> {
        let api = Arc::clone(&self.api);
        let queue = self.queue;
        tokio::spawn(async move {
            loop {
                let Ok(outcome) = api
                    .receive_http_request(queue, Handle::NULL, ReceiveFlags::COPY_BODY, 64 * 1024, None)
                    .await
                else {
                    break;
                };
                let Some(request) = outcome.complete() else {
                    break;
                };
                let body = request.url_context.to_string();
                let response = HttpResponse::new(200).with_body(body);
                let _ = api
                    .send_http_response(queue, request.request_id, response, SendFlags::NONE, None)
                    .await;
            }
        })
    }

    pub async fn stop(&self) {
        self.api.terminate(InitFlags::SERVER).await.unwrap();
    }
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Send raw bytes and read until the peer closes.
pub async fn raw_exchange(port: u16, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(loopback(port)).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("server did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Read one response with a `Content-Length` body off a kept-alive stream.
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut data = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let text = String::from_utf8_lossy(&data).into_owned();
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= end + 4 + length {
                return text;
            }
        }
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("response timed out")
            .unwrap();
        assert!(n > 0, "connection closed mid-response");
        data.extend_from_slice(&chunk[..n]);
    }
}
