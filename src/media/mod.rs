#![forbid(unsafe_code)]

// Media module - the mediasoup worker behind a narrow, audio-only facade.
// One worker, one router, one active-speaker observer; every channel shares
// them. The rest of the server reaches media exclusively through
// `MediaWorker` and never holds a registry lock across one of these calls.

pub mod config;
pub mod observer;
pub mod transport;
pub mod types;

pub use config::MediaConfig;
pub use observer::SpeakingObserver;
pub use transport::{ClosedTransport, TransportHub};
pub use types::{
    ConsumerParams, MediaError, MediaEvent, MediaResult, ObserverEvent, TransportDirection,
    TransportParams,
};

use mediasoup::prelude::*;
use mediasoup::worker_manager::WorkerManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Receiving ends of the media notification streams, handed to the routing
/// core and the main task at startup.
pub struct MediaStreams {
    pub media_events: mpsc::UnboundedReceiver<MediaEvent>,
    pub observer_events: mpsc::UnboundedReceiver<ObserverEvent>,
    /// Fires once if the worker subprocess dies. Fatal.
    pub worker_died: mpsc::Receiver<String>,
}

pub struct MediaWorker {
    // Held to keep the worker subprocess alive for the server's lifetime.
    _worker: Worker,
    router: Router,
    hub: Arc<TransportHub>,
    observer: SpeakingObserver,
    config: MediaConfig,
    ice_timeout: Duration,
    media_events_tx: mpsc::UnboundedSender<MediaEvent>,
}

impl MediaWorker {
    /// Boots the worker subprocess, the shared router and the active-speaker
    /// observer.
    pub async fn new(
        config: MediaConfig,
        ice_timeout: Duration,
    ) -> MediaResult<(Arc<Self>, MediaStreams)> {
        info!("Initializing media worker");

        let worker_manager = WorkerManager::new();
        let worker = worker_manager
            .create_worker(config.to_worker_settings())
            .await
            .map_err(|e| MediaError::Setup(format!("failed to create worker: {e}")))?;

        let (died_tx, died_rx) = mpsc::channel::<String>(1);
        worker
            .on_dead(move |reason| {
                error!("Media worker died: {:?}", reason);
                let _ = died_tx.try_send(format!("{reason:?}"));
            })
            .detach();

        let router = worker
            .create_router(config.to_router_options())
            .await
            .map_err(|e| MediaError::Setup(format!("failed to create router: {e}")))?;

        let (observer, observer_rx) =
            SpeakingObserver::new(&router, config.speaking_threshold, config.speaking_interval_ms)
                .await?;

        let (media_events_tx, media_events_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(TransportHub::new(media_events_tx.clone()));

        info!("Media worker ready (router {})", router.id());

        Ok((
            Arc::new(Self {
                _worker: worker,
                router,
                hub,
                observer,
                config,
                ice_timeout,
                media_events_tx,
            }),
            MediaStreams {
                media_events: media_events_rx,
                observer_events: observer_rx,
                worker_died: died_rx,
            },
        ))
    }

    /// Router RTP capabilities, static once initialized.
    pub fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized {
        self.router.rtp_capabilities().clone()
    }

    /// Creates a transport and arms the ICE establishment watchdog: a
    /// transport that never connects is closed and cascaded like a DTLS
    /// failure.
    pub async fn create_transport(
        &self,
        client_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportParams> {
        let params = self
            .hub
            .create_transport(client_id, direction, &self.router, self.config.to_transport_options())
            .await?;

        let hub = Arc::clone(&self.hub);
        let events = self.media_events_tx.clone();
        let watchdog_client = client_id.to_string();
        let watchdog_transport = params.id.clone();
        let timeout = self.ice_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if hub.is_connected(&watchdog_client, &watchdog_transport).await == Some(false) {
                tracing::warn!(
                    "Transport {} for client {} never connected within the ICE timeout",
                    watchdog_transport,
                    watchdog_client
                );
                let _ = events.send(MediaEvent::TransportFailed {
                    client_id: watchdog_client,
                    transport_id: watchdog_transport,
                    direction,
                });
            }
        });

        Ok(params)
    }

    pub async fn connect_transport(
        &self,
        client_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<()> {
        self.hub
            .connect_transport(client_id, transport_id, dtls_parameters)
            .await
    }

    /// Creates an audio producer and registers it with the active-speaker
    /// observer.
    pub async fn produce(
        &self,
        client_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> MediaResult<Producer> {
        let producer = self
            .hub
            .produce(client_id, transport_id, kind, rtp_parameters)
            .await?;
        self.observer.add_producer(producer.id()).await?;
        Ok(producer)
    }

    pub fn can_consume(&self, producer_id: &ProducerId, capabilities: &RtpCapabilities) -> bool {
        self.router.can_consume(producer_id, capabilities)
    }

    pub async fn consume(
        &self,
        client_id: &str,
        transport_id: &str,
        producer_id: ProducerId,
        capabilities: RtpCapabilities,
        start_paused: bool,
    ) -> MediaResult<Consumer> {
        if !self.can_consume(&producer_id, &capabilities) {
            return Err(MediaError::CannotConsume {
                producer_id: producer_id.to_string(),
            });
        }
        self.hub
            .consume(client_id, transport_id, producer_id, capabilities, start_paused)
            .await
    }

    pub async fn pause_producer(&self, client_id: &str, producer_id: &str) -> MediaResult<()> {
        self.hub.pause_producer(client_id, producer_id).await
    }

    pub async fn resume_producer(&self, client_id: &str, producer_id: &str) -> MediaResult<()> {
        self.hub.resume_producer(client_id, producer_id).await
    }

    pub async fn pause_consumer(&self, client_id: &str, consumer_id: &str) -> MediaResult<()> {
        self.hub.pause_consumer(client_id, consumer_id).await
    }

    pub async fn resume_consumer(&self, client_id: &str, consumer_id: &str) -> MediaResult<()> {
        self.hub.resume_consumer(client_id, consumer_id).await
    }

    /// Closes a producer and drops it from the observer.
    pub async fn close_producer(&self, client_id: &str, producer_id: &str) -> MediaResult<()> {
        if let Ok(parsed) = producer_id.parse::<ProducerId>() {
            self.observer.remove_producer(parsed).await;
        }
        self.hub.close_producer(client_id, producer_id).await
    }

    pub async fn close_consumer(&self, client_id: &str, consumer_id: &str) {
        self.hub.close_consumer(client_id, consumer_id).await;
    }

    pub async fn close_transport(
        &self,
        client_id: &str,
        transport_id: &str,
    ) -> MediaResult<ClosedTransport> {
        self.hub.close_transport(client_id, transport_id).await
    }

    pub async fn producer_paused(&self, client_id: &str, producer_id: &str) -> Option<bool> {
        self.hub.producer_paused(client_id, producer_id).await
    }

    pub async fn producer_of(&self, client_id: &str) -> Option<String> {
        self.hub.producer_of(client_id).await
    }

    /// Removes a client's media state entirely. Returns closed producer ids.
    pub async fn remove_client(&self, client_id: &str) -> Vec<String> {
        let producer_ids = self.hub.remove_client(client_id).await;
        for id in &producer_ids {
            if let Ok(parsed) = id.parse::<ProducerId>() {
                self.observer.remove_producer(parsed).await;
            }
        }
        producer_ids
    }

    /// Drains all media state on shutdown. The worker subprocess exits when
    /// `MediaWorker` is dropped.
    pub async fn shutdown(&self) {
        info!("Shutting down media worker");
        self.hub.close_all().await;
    }
}
