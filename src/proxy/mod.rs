pub mod cache;
pub mod forward;
pub mod headers;
pub(crate) mod http;
pub mod listener;
pub mod origin;

use std::sync::Arc;

use anyhow::Result;
use rustls::client::ClientConfig;

use crate::settings::Settings;

use self::cache::CacheStore;
use self::forward::{ForwardTimeouts, Forwarder};
use self::http::upstream::OriginConnector;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub forwarder: Arc<Forwarder>,
}

impl AppContext {
    /// Wires the forwarder for the configured origin. `tls` is required for `https` origins.
    pub fn new(
        settings: Arc<Settings>,
        tls: Option<Arc<ClientConfig>>,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Result<Self> {
        let origin = Arc::new(settings.origin()?);
        let connector = OriginConnector::new(origin, tls, settings.upstream_connect_timeout());
        let timeouts = ForwardTimeouts {
            client_write: settings.client_timeout(),
            upstream_io: settings.upstream_timeout(),
        };
        let forwarder = Forwarder::new(
            connector,
            store,
            timeouts,
            settings.max_response_header_size,
        );
        Ok(Self {
            settings,
            forwarder: Arc::new(forwarder),
        })
    }
}
