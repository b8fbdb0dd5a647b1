use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::CommServerConfig;
use crate::error::Result;

/// Builds bare data-channel-only [`RTCPeerConnection`]s. No media engine
/// codecs beyond the defaults webrtc-rs registers are actually exercised
/// here — the mesh only ever negotiates data channels — but a
/// `MediaEngine` and interceptor registry are still required to build
/// the `API`, the same as every other webrtc-rs caller in this codebase.
pub struct PeerConnectionFactory {
    api: API,
    rtc_config: RTCConfiguration,
}

impl PeerConnectionFactory {
    pub fn new(config: &CommServerConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers(),
            ..Default::default()
        };

        Ok(Self { api, rtc_config })
    }

    pub async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let pc = self.api.new_peer_connection(self.rtc_config.clone()).await?;
        Ok(Arc::new(pc))
    }
}
