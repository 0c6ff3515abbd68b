use std::sync::Arc;
use std::time::Duration;

use relaypeer_transport::{RelayLink, TransportError};
use relaypeer_wire::{decode_client_list, events};
use tracing::debug;

use crate::bridge;
use crate::config::SessionConfig;
use crate::duplex::Duplex;
use crate::error::Result;
use crate::messaging::AddressedMessaging;
use crate::multiplexer::StreamMultiplexer;
use crate::shared::Core;

/// A local identity on one relay connection.
///
/// Owns the messaging layer and the stream multiplexer built on it. When the
/// link goes down every binding, subscription and stream is torn down.
pub struct Session {
    core: Arc<Core>,
    messaging: AddressedMessaging,
    multiplexer: StreamMultiplexer,
}

impl Session {
    /// Bind `client_id` to `link`.
    ///
    /// `client_id` must be the id the relay knows this link by.
    pub fn new(
        link: Arc<dyn RelayLink>,
        client_id: impl Into<String>,
        config: SessionConfig,
    ) -> Result<Self> {
        let core = Core::new(link, client_id.into(), config)?;
        if !core.link.is_connected() {
            return Err(TransportError::Disconnected.into());
        }
        let messaging = AddressedMessaging::new(core.clone());
        let multiplexer = StreamMultiplexer::new(messaging.clone());
        debug!(client_id = %core.client_id, "session created");
        Ok(Self {
            core,
            messaging,
            multiplexer,
        })
    }

    /// [`Session::new`] with [`SessionConfig::default`].
    pub fn with_default_config(
        link: Arc<dyn RelayLink>,
        client_id: impl Into<String>,
    ) -> Result<Self> {
        Self::new(link, client_id, SessionConfig::default())
    }

    pub fn client_id(&self) -> &str {
        &self.core.client_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    /// The underlying relay link.
    pub fn link(&self) -> &Arc<dyn RelayLink> {
        &self.core.link
    }

    pub fn is_connected(&self) -> bool {
        self.core.link.is_connected()
    }

    /// Peer-addressed events.
    pub fn messaging(&self) -> &AddressedMessaging {
        &self.messaging
    }

    /// Duplex streams.
    pub fn multiplexer(&self) -> &StreamMultiplexer {
        &self.multiplexer
    }

    /// Shorthand for [`AddressedMessaging::add_target`].
    pub fn add_target(&self, peer: &str) -> Result<()> {
        self.messaging.add_target(peer)
    }

    /// Async variant of [`Session::add_target`].
    #[cfg(feature = "async")]
    pub async fn add_target_async(&self, peer: &str) -> Result<()> {
        self.messaging.add_target_async(peer).await
    }

    /// Shorthand for [`StreamMultiplexer::open_stream`].
    pub fn open_stream(&self, peer: &str) -> Result<Duplex> {
        self.multiplexer.open_stream(peer)
    }

    /// Ids of every client connected to the relay.
    pub fn client_list(&self) -> Result<Vec<String>> {
        self.client_list_with_timeout(self.core.config.request_timeout)
    }

    /// [`Session::client_list`] with an explicit timeout.
    pub fn client_list_with_timeout(&self, timeout: Option<Duration>) -> Result<Vec<String>> {
        let reply = bridge::request(self.core.link.as_ref(), events::LIST_CLIENTS, vec![], timeout)?;
        Ok(decode_client_list(&reply)?)
    }

    /// Async variant of [`Session::client_list`].
    #[cfg(feature = "async")]
    pub async fn client_list_async(&self) -> Result<Vec<String>> {
        let reply = bridge::request_async(
            self.core.link.as_ref(),
            events::LIST_CLIENTS,
            vec![],
            self.core.config.request_timeout,
        )
        .await?;
        Ok(decode_client_list(&reply)?)
    }

    /// Close the relay link. Every stream and binding is torn down.
    pub fn disconnect(&self) {
        debug!(client_id = %self.core.client_id, "session disconnecting");
        self.core.link.disconnect();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.core.client_id)
            .field("connected", &self.is_connected())
            .field("config", &self.core.config)
            .finish()
    }
}
