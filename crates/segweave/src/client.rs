use std::sync::Once;

use reqwest::Client;
use tracing::{debug, info, warn};

use crate::proxy::{ProxyConfig, build_proxy_from_config};
use crate::{DownloadError, DownloaderConfig};

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

fn ensure_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        // Another component may have installed one first, which is fine.
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider already installed");
        }
    });
}

/// Create a reqwest Client with the provided configuration.
///
/// `proxy_override` binds the client to one proxy endpoint and takes precedence
/// over the proxy in `config`. Used to build one client per rotation endpoint.
pub fn create_client(
    config: &DownloaderConfig,
    proxy_override: Option<&ProxyConfig>,
) -> Result<Client, DownloadError> {
    ensure_crypto_provider();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(8)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    if config.danger_accept_invalid_certs {
        warn!("TLS certificate validation is disabled");
        client_builder = client_builder.danger_accept_invalid_certs(true);
    }

    if let Some(proxy_config) = proxy_override.or(config.proxy.as_ref()) {
        let proxy = build_proxy_from_config(proxy_config).map_err(DownloadError::ProxyError)?;
        client_builder = client_builder.proxy(proxy);
        debug!(proxy = %proxy_config, "Client bound to proxy");
    } else if config.use_system_proxy {
        // reqwest picks up system proxy settings unless no_proxy() is called
        info!("Using system proxy settings for downloads");
    } else {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled for downloads");
    }

    client_builder.build().map_err(DownloadError::from)
}
