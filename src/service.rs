//! Wires the capture cache, filter, queue, and stores together and starts
//! the background scheduler.

use std::sync::Arc;

use crate::capture::RequestCache;
use crate::clock::SystemClock;
use crate::context::NotarizerContext;
use crate::filter::UrlPatternFilter;
use crate::notary::{HttpNotarizer, Notarizer};
use crate::probe;
use crate::publish::{HttpPublisher, ProofCipher, ProofPublisher};
use crate::queue::NotarizeQueue;
use crate::store::{
    HistoryStore, SettingsStore, MAX_RECEIVED_KEY, MAX_SENT_KEY,
    NOTARY_API_KEY, PROXY_API_KEY, URL_PATTERNS_KEY,
};

/// Everything a connection handler needs, behind one `Arc`.
pub struct Services<S> {
    pub store: S,
    pub cache: Arc<RequestCache>,
    pub filter: Arc<UrlPatternFilter>,
    pub queue: Arc<NotarizeQueue<S>>,
    pub notarizer: Arc<dyn Notarizer>,
}

impl<S> std::fmt::Debug for Services<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish()
    }
}

/// Builds the service graph from the loaded configuration and spawns the
/// queue drain loop.
pub fn ignite<S>(
    ctx: &NotarizerContext,
    store: S,
) -> crate::Result<Arc<Services<S>>>
where
    S: SettingsStore + HistoryStore + 'static,
{
    let config = &ctx.config;
    tracing::debug!(
        target: probe::TARGET,
        kind = %probe::Kind::Lifecycle,
        "Starting the notarizer services"
    );

    // config-file overrides win over whatever the settings store holds.
    if let Some(api) = &config.notary.api {
        store.set_setting(NOTARY_API_KEY, api.as_str())?;
    }
    if let Some(proxy) = &config.notary.proxy {
        store.set_setting(PROXY_API_KEY, proxy.as_str())?;
    }
    if let Some(max_sent) = config.notary.max_sent {
        store.set_setting(MAX_SENT_KEY, &max_sent.to_string())?;
    }
    if let Some(max_received) = config.notary.max_received {
        store.set_setting(MAX_RECEIVED_KEY, &max_received.to_string())?;
    }

    let filter = Arc::new(UrlPatternFilter::new());
    if config.url_patterns.is_empty() {
        // fall back to the persisted pattern set from the last run.
        filter.set_patterns(&store.get_list(URL_PATTERNS_KEY)?)?;
    } else {
        filter.set_patterns(&config.url_patterns)?;
        store.set_list(URL_PATTERNS_KEY, &config.url_patterns)?;
    }

    let cache = Arc::new(RequestCache::new(
        config.capture.ttl(),
        config.capture.max_entries,
        Arc::new(SystemClock),
    ));

    let notarizer: Arc<dyn Notarizer> =
        Arc::new(HttpNotarizer::new(store.notary_api()?));

    let publisher = match (
        config.publish.enabled,
        &config.publish.endpoint,
        &config.publish.encryption_key,
    ) {
        (true, Some(endpoint), Some(key)) => {
            let cipher = ProofCipher::new(key);
            let publisher: Arc<dyn ProofPublisher> =
                Arc::new(HttpPublisher::new(endpoint.clone()));
            Some((cipher, publisher))
        }
        _ => None,
    };

    let queue = Arc::new(NotarizeQueue::new(
        Arc::new(SystemClock),
        notarizer.clone(),
        store.clone(),
        cache.clone(),
        publisher,
        config.queue.min_delay(),
        config.queue.tick_interval(),
    ));
    tokio::spawn(queue.clone().run(ctx.shutdown_signal()));

    Ok(Arc::new(Services {
        store,
        cache,
        filter,
        queue,
        notarizer,
    }))
}
