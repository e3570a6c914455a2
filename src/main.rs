//! httpsys-host
//!
//! Registers the prefixes listed in the host configuration and answers
//! every request with a JSON description of what arrived. Requests below
//! `/static` get the fragment loaded with `--fragment`, when one is given.
//!
//! ```text
//! host.toml ──► HostConfig ──► session / group / queue
//! registry.toml ──► RegistryStore ◄── watcher (reload on change)
//!
//! workers: receive_http_request → JSON echo → send_http_response
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;

use httpsys::api::{HttpSys, InitFlags, Property};
use httpsys::config::watcher::RegistryWatcher;
use httpsys::config::{load_config, HostConfig, Registry, RegistryStore};
use httpsys::context::{ServerSettings, Services};
use httpsys::error::HttpSysError;
use httpsys::handles::Handle;
use httpsys::http::{DataChunk, HttpRequest, HttpResponse, ReceiveFlags, ResponseHeader, SendFlags};
use httpsys::lifecycle::signals::wait_for_signal;
use httpsys::net::tls::PemDirectoryStore;
use httpsys::observability::{logging, metrics};
use httpsys::queue::CachePolicy;
use httpsys::security::{LocalAccounts, LogonThrottle};
use httpsys::session::{ApiVersion, Timeouts};

const STATIC_FRAGMENT: &str = "/static";
const RECEIVE_BUFFER_LEN: usize = 16 * 1024;

#[derive(Parser)]
#[command(name = "httpsys-host")]
#[command(about = "Serve registered URL prefixes with a JSON echo", long_about = None)]
struct Cli {
    /// Host configuration file.
    #[arg(short, long, default_value = "httpsys.toml")]
    config: PathBuf,

    /// Registry file; overrides `[registry] path`.
    #[arg(short, long)]
    registry: Option<PathBuf>,

    /// File served for requests below /static.
    #[arg(short, long)]
    fragment: Option<PathBuf>,

    /// Concurrent receive loops.
    #[arg(short, long, default_value_t = 4)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        HostConfig::default()
    };
    logging::init(&config.logging.level);
    tracing::info!(config = %cli.config.display(), "httpsys-host v0.1.0 starting");

    if let Some(address) = &config.observability.metrics_address {
        match address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(metrics_address = %address, "Failed to parse metrics address"),
        }
    }

    let registry_path = cli.registry.clone().or(config.registry.path.as_ref().map(PathBuf::from));
    let store = match &registry_path {
        Some(path) => Arc::new(RegistryStore::load(path)?),
        None => Arc::new(RegistryStore::new(Registry::with_acl(
            config.prefixes.iter().map(|p| p.url.as_str()),
        ))),
    };
    let _watcher = match (&registry_path, config.registry.watch) {
        (Some(path), true) => Some(RegistryWatcher::new(path, Arc::clone(&store)).run()?),
        _ => None,
    };

    let services = Services::new(store)
        .with_certificates(Arc::new(PemDirectoryStore::new(&config.tls.certificate_root)))
        .with_credentials(Arc::new(LocalAccounts::from_config(&config.auth.accounts)))
        .with_logon_throttle(LogonThrottle::new(config.auth.max_failed_logons_per_minute))
        .with_settings(ServerSettings::from_config(&config));
    let api = Arc::new(HttpSys::new(services));

    let queue = start(&api, &config, cli.fragment.as_deref()).await?;
    let has_fragment = cli.fragment.is_some();

    let mut workers = Vec::with_capacity(cli.workers.max(1));
    for _ in 0..cli.workers.max(1) {
        let api = Arc::clone(&api);
        workers.push(tokio::spawn(async move { serve(&api, queue, has_fragment).await }));
    }

    wait_for_signal().await;
    tracing::info!("Shutdown signal received");
    api.terminate(InitFlags::SERVER).await?;
    for worker in workers {
        let _ = worker.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Session, queue and URL group from the configuration.
async fn start(
    api: &HttpSys,
    config: &HostConfig,
    fragment: Option<&std::path::Path>,
) -> Result<Handle, Box<dyn std::error::Error>> {
    let session = api.initialize(ApiVersion::V2, InitFlags::SERVER)?;
    api.set_server_session_property(session, Property::Timeouts(Timeouts::from_config(&config.timeouts)))?;
    api.set_server_session_property(session, Property::Logging(config.logging.hex_dump_level))?;
    api.set_server_session_property(session, Property::ConnectionLimit(config.limits.max_connections))?;
    api.set_server_session_property(session, Property::EndpointLimit(config.limits.max_endpoints))?;

    let queue = api.create_request_queue(config.queue.name.as_deref())?;
    api.set_request_queue_property(queue, Property::QueueLength(config.limits.queue_length))?;

    if let Some(path) = fragment {
        let data = tokio::fs::read(path).await?;
        tracing::info!(path = %path.display(), bytes = data.len(), "Static fragment loaded");
        api.add_fragment_to_cache(queue, STATIC_FRAGMENT, data, CachePolicy::UserInvalidates)?;
    }

    let group = api.create_url_group(session)?;
    api.set_url_group_property(group, Property::Binding(queue))?;
    for prefix in &config.prefixes {
        api.add_url_to_url_group(group, &prefix.url, prefix.context).await?;
        tracing::info!(prefix = %prefix.url, context = prefix.context, "Prefix registered");
    }
    if config.prefixes.is_empty() {
        tracing::warn!("No prefixes configured, nothing will be served");
    }
    Ok(queue)
}

async fn serve(api: &HttpSys, queue: Handle, has_fragment: bool) {
    loop {
        let request = match receive(api, queue).await {
            Ok(request) => request,
            // Queue shut down, or its handle closed by terminate.
            Err(HttpSysError::HandleEof | HttpSysError::InvalidParameter(_)) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Receive failed");
                continue;
            }
        };

        let response = if has_fragment && request.cooked_url.abs_path.starts_with(STATIC_FRAGMENT) {
            HttpResponse::new(200).with_chunk(DataChunk::fragment(STATIC_FRAGMENT))
        } else {
            echo(&request)
        };

        if let Err(e) = api
            .send_http_response(queue, request.request_id, response, SendFlags::NONE, None)
            .await
        {
            tracing::debug!(request_id = %request.request_id, error = %e, "Send failed");
        }
    }
}

/// Receive one request, growing the buffer once if it was too small.
async fn receive(api: &HttpSys, queue: Handle) -> httpsys::Result<HttpRequest> {
    let first = api
        .receive_http_request(queue, Handle::NULL, ReceiveFlags::COPY_BODY, RECEIVE_BUFFER_LEN, None)
        .await;
    let outcome = match first {
        Err(HttpSysError::MoreData { required, request }) => {
            api.receive_http_request(queue, request, ReceiveFlags::COPY_BODY, required, None)
                .await?
        }
        other => other?,
    };
    outcome
        .complete()
        .ok_or(HttpSysError::InvalidState("blocking receive returned pending"))
}

fn echo(request: &HttpRequest) -> HttpResponse {
    let headers: serde_json::Map<String, serde_json::Value> = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_string(), json!(value)))
        .collect();
    let body = json!({
        "request_id": request.request_id.to_string(),
        "context": request.url_context,
        "verb": request.verb.as_str(),
        "url": request.cooked_url.full,
        "version": request.version.to_string(),
        "remote": request.remote_address.to_string(),
        "secure": request.ssl_info.is_some(),
        "auth": format!("{:?}", request.auth.status),
        "user": request.auth.token.as_ref().map(|t| t.user.clone()),
        "headers": headers,
        "body_bytes": request.entity_body.len(),
        "more_body": request.more_entity_body,
    });
    HttpResponse::new(200)
        .with_header(ResponseHeader::ContentType, "application/json")
        .with_body(body.to_string())
}
