#![forbid(unsafe_code)]

// Transport hub - per-client WebRTC transports, producers and consumers.
//
// Uses per-client locking: the outer HashMap is protected by a
// std::sync::RwLock (held only for brief lookups, never across await
// points), while each client's media state is protected by its own
// tokio::sync::Mutex (held across async operations but only blocking that
// specific client).

use crate::media::types::{
    ClientMedia, MediaError, MediaEvent, MediaResult, TransportDirection, TransportParams,
};
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

pub struct TransportHub {
    clients: Arc<StdRwLock<HashMap<String, Arc<TokioMutex<ClientMedia>>>>>,
    media_events: mpsc::UnboundedSender<MediaEvent>,
}

/// What fell off a transport when it was closed.
#[derive(Debug)]
pub struct ClosedTransport {
    pub direction: TransportDirection,
    pub producer_ids: Vec<String>,
    pub consumer_ids: Vec<String>,
}

impl TransportHub {
    pub fn new(media_events: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self {
            clients: Arc::new(StdRwLock::new(HashMap::new())),
            media_events,
        }
    }

    /// Gets or creates a client entry (brief outer lock, no await).
    fn get_or_create_client(&self, client_id: &str) -> Arc<TokioMutex<ClientMedia>> {
        {
            let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = clients.get(client_id) {
                return Arc::clone(entry);
            }
        }
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        clients
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(ClientMedia::new(client_id.to_string()))))
            .clone()
    }

    /// Gets an existing client's lock (brief outer read lock, no await).
    fn get_client_lock(&self, client_id: &str) -> MediaResult<Arc<TokioMutex<ClientMedia>>> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        clients
            .get(client_id)
            .cloned()
            .ok_or_else(|| MediaError::ClientNotFound(client_id.to_string()))
    }

    /// Creates a transport for the client in the given direction. A client
    /// holds at most one transport per direction; creating a second replaces
    /// (and closes) the first.
    pub async fn create_transport(
        &self,
        client_id: &str,
        direction: TransportDirection,
        router: &Router,
        options: WebRtcTransportOptions,
    ) -> MediaResult<TransportParams> {
        debug!("Creating {:?} transport for client {}", direction, client_id);

        // Create the transport without any lock held.
        let transport = router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| MediaError::Transport(format!("failed to create transport: {e}")))?;

        let params = TransportParams::from(&transport);
        self.setup_transport_handlers(&transport, client_id, direction);

        let client_lock = self.get_or_create_client(client_id);
        let mut client = client_lock.lock().await;
        let replaced = match direction {
            TransportDirection::Send => {
                client.send_connected = false;
                client.send_transport.replace(transport)
            }
            TransportDirection::Receive => {
                client.recv_connected = false;
                client.recv_transport.replace(transport)
            }
        };
        if let Some(old) = replaced {
            client.closed_transports.insert(old.id().to_string());
        }

        info!("Created {:?} transport {} for client {}", direction, params.id, client_id);
        Ok(params)
    }

    /// Connects a transport with the client's DTLS parameters.
    pub async fn connect_transport(
        &self,
        client_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<()> {
        let client_lock = self.get_client_lock(client_id)?;
        let mut client = client_lock.lock().await;

        let direction = Self::direction_of(&client, transport_id)?;
        let already = match direction {
            TransportDirection::Send => client.send_connected,
            TransportDirection::Receive => client.recv_connected,
        };
        if already {
            return Err(MediaError::AlreadyConnected(transport_id.to_string()));
        }

        let transport = match direction {
            TransportDirection::Send => client.send_transport.as_ref(),
            TransportDirection::Receive => client.recv_transport.as_ref(),
        }
        .ok_or_else(|| MediaError::TransportNotFound(transport_id.to_string()))?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::Transport(format!("failed to connect transport: {e}")))?;

        match direction {
            TransportDirection::Send => client.send_connected = true,
            TransportDirection::Receive => client.recv_connected = true,
        }

        info!("Connected {:?} transport {} for client {}", direction, transport_id, client_id);
        Ok(())
    }

    fn direction_of(client: &ClientMedia, transport_id: &str) -> MediaResult<TransportDirection> {
        if client
            .send_transport
            .as_ref()
            .is_some_and(|t| t.id().to_string() == transport_id)
        {
            return Ok(TransportDirection::Send);
        }
        if client
            .recv_transport
            .as_ref()
            .is_some_and(|t| t.id().to_string() == transport_id)
        {
            return Ok(TransportDirection::Receive);
        }
        if client.closed_transports.contains(transport_id) {
            return Err(MediaError::TransportClosed(transport_id.to_string()));
        }
        Err(MediaError::TransportNotFound(transport_id.to_string()))
    }

    /// Creates an audio producer on the client's send transport.
    pub async fn produce(
        &self,
        client_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> MediaResult<Producer> {
        if kind != MediaKind::Audio {
            return Err(MediaError::UnsupportedKind(format!("{kind:?}")));
        }

        let client_lock = self.get_client_lock(client_id)?;
        let mut client = client_lock.lock().await;

        match Self::direction_of(&client, transport_id)? {
            TransportDirection::Send => {}
            TransportDirection::Receive => {
                return Err(MediaError::Transport(
                    "cannot produce on a receive transport".to_string(),
                ))
            }
        }

        let transport = client
            .send_transport
            .as_ref()
            .ok_or_else(|| MediaError::TransportNotFound(transport_id.to_string()))?;

        let producer_options = ProducerOptions::new(kind, rtp_parameters);
        let producer = transport
            .produce(producer_options)
            .await
            .map_err(|e| MediaError::Producer(format!("failed to create producer: {e}")))?;

        let producer_id = producer.id().to_string();
        self.setup_producer_handlers(&producer, client_id);
        client.producers.insert(producer_id.clone(), producer.clone());

        info!("Created producer {} for client {}", producer_id, client_id);
        Ok(producer)
    }

    /// Creates a consumer on the client's receive transport.
    pub async fn consume(
        &self,
        client_id: &str,
        transport_id: &str,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        start_paused: bool,
    ) -> MediaResult<Consumer> {
        let client_lock = self.get_client_lock(client_id)?;
        let mut client = client_lock.lock().await;

        match Self::direction_of(&client, transport_id)? {
            TransportDirection::Receive => {}
            TransportDirection::Send => {
                return Err(MediaError::Transport(
                    "cannot consume on a send transport".to_string(),
                ))
            }
        }

        let transport = client
            .recv_transport
            .as_ref()
            .ok_or_else(|| MediaError::TransportNotFound(transport_id.to_string()))?;

        let mut consumer_options = ConsumerOptions::new(producer_id, rtp_capabilities);
        consumer_options.paused = start_paused;

        let consumer = transport
            .consume(consumer_options)
            .await
            .map_err(|e| MediaError::Consumer(format!("failed to create consumer: {e}")))?;

        let consumer_id = consumer.id().to_string();
        self.setup_consumer_handlers(&consumer, client_id);
        client.consumers.insert(consumer_id.clone(), consumer.clone());

        info!(
            "Created consumer {} for producer {} and client {}",
            consumer_id, producer_id, client_id
        );
        Ok(consumer)
    }

    pub async fn pause_producer(&self, client_id: &str, producer_id: &str) -> MediaResult<()> {
        let client_lock = self.get_client_lock(client_id)?;
        let client = client_lock.lock().await;
        let producer = client
            .producers
            .get(producer_id)
            .ok_or_else(|| MediaError::ProducerNotFound(producer_id.to_string()))?;
        producer
            .pause()
            .await
            .map_err(|e| MediaError::Producer(format!("failed to pause producer: {e}")))?;
        debug!("Paused producer {} for client {}", producer_id, client_id);
        Ok(())
    }

    pub async fn resume_producer(&self, client_id: &str, producer_id: &str) -> MediaResult<()> {
        let client_lock = self.get_client_lock(client_id)?;
        let client = client_lock.lock().await;
        let producer = client
            .producers
            .get(producer_id)
            .ok_or_else(|| MediaError::ProducerNotFound(producer_id.to_string()))?;
        producer
            .resume()
            .await
            .map_err(|e| MediaError::Producer(format!("failed to resume producer: {e}")))?;
        debug!("Resumed producer {} for client {}", producer_id, client_id);
        Ok(())
    }

    pub async fn pause_consumer(&self, client_id: &str, consumer_id: &str) -> MediaResult<()> {
        let client_lock = self.get_client_lock(client_id)?;
        let client = client_lock.lock().await;
        let consumer = client
            .consumers
            .get(consumer_id)
            .ok_or_else(|| MediaError::ConsumerNotFound(consumer_id.to_string()))?;
        consumer
            .pause()
            .await
            .map_err(|e| MediaError::Consumer(format!("failed to pause consumer: {e}")))?;
        Ok(())
    }

    pub async fn resume_consumer(&self, client_id: &str, consumer_id: &str) -> MediaResult<()> {
        let client_lock = self.get_client_lock(client_id)?;
        let client = client_lock.lock().await;
        let consumer = client
            .consumers
            .get(consumer_id)
            .ok_or_else(|| MediaError::ConsumerNotFound(consumer_id.to_string()))?;
        consumer
            .resume()
            .await
            .map_err(|e| MediaError::Consumer(format!("failed to resume consumer: {e}")))?;
        Ok(())
    }

    /// Closes a producer (drop closes it worker-side).
    pub async fn close_producer(&self, client_id: &str, producer_id: &str) -> MediaResult<()> {
        let client_lock = self.get_client_lock(client_id)?;
        let mut client = client_lock.lock().await;
        client
            .producers
            .remove(producer_id)
            .ok_or_else(|| MediaError::ProducerNotFound(producer_id.to_string()))?;
        info!("Closed producer {} for client {}", producer_id, client_id);
        Ok(())
    }

    /// Closes a consumer. A missing consumer is fine — close is idempotent.
    pub async fn close_consumer(&self, client_id: &str, consumer_id: &str) {
        let Ok(client_lock) = self.get_client_lock(client_id) else {
            return;
        };
        let mut client = client_lock.lock().await;
        if client.consumers.remove(consumer_id).is_some() {
            debug!("Closed consumer {} for client {}", consumer_id, client_id);
        }
    }

    pub async fn producer_paused(&self, client_id: &str, producer_id: &str) -> Option<bool> {
        let client_lock = self.get_client_lock(client_id).ok()?;
        let client = client_lock.lock().await;
        client.producers.get(producer_id).map(|p| p.paused())
    }

    /// The first producer id owned by the client, if any. Clients publish a
    /// single audio track.
    pub async fn producer_of(&self, client_id: &str) -> Option<String> {
        let client_lock = self.get_client_lock(client_id).ok()?;
        let client = client_lock.lock().await;
        client.producers.keys().next().cloned()
    }

    /// Closes a transport and everything hanging off it. Used by the DTLS
    /// failure and ICE watchdog cascades.
    pub async fn close_transport(
        &self,
        client_id: &str,
        transport_id: &str,
    ) -> MediaResult<ClosedTransport> {
        let client_lock = self.get_client_lock(client_id)?;
        let mut client = client_lock.lock().await;

        let direction = Self::direction_of(&client, transport_id)?;
        client.closed_transports.insert(transport_id.to_string());
        match direction {
            TransportDirection::Send => {
                client.send_transport = None;
                client.send_connected = false;
                let producer_ids: Vec<String> = client.producers.keys().cloned().collect();
                client.producers.clear();
                Ok(ClosedTransport {
                    direction,
                    producer_ids,
                    consumer_ids: Vec::new(),
                })
            }
            TransportDirection::Receive => {
                client.recv_transport = None;
                client.recv_connected = false;
                let consumer_ids: Vec<String> = client.consumers.keys().cloned().collect();
                client.consumers.clear();
                Ok(ClosedTransport {
                    direction,
                    producer_ids: Vec::new(),
                    consumer_ids,
                })
            }
        }
    }

    /// Whether the transport exists and has completed DTLS. `None` when the
    /// transport is unknown or already closed.
    pub async fn is_connected(&self, client_id: &str, transport_id: &str) -> Option<bool> {
        let client_lock = self.get_client_lock(client_id).ok()?;
        let client = client_lock.lock().await;
        match Self::direction_of(&client, transport_id).ok()? {
            TransportDirection::Send => Some(client.send_connected),
            TransportDirection::Receive => Some(client.recv_connected),
        }
    }

    /// Removes a client and closes all of its media resources. Returns the
    /// producer ids that were closed so the caller can cascade.
    pub async fn remove_client(&self, client_id: &str) -> Vec<String> {
        let entry = {
            let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
            clients.remove(client_id)
        };
        match entry {
            Some(lock) => {
                let mut client = lock.lock().await;
                let producer_ids = client.close_all();
                info!("Removed client {} and closed all media resources", client_id);
                producer_ids
            }
            None => Vec::new(),
        }
    }

    /// Closes all media for all clients.
    pub async fn close_all(&self) {
        let all: Vec<(String, Arc<TokioMutex<ClientMedia>>)> = {
            let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
            clients.drain().collect()
        };
        for (client_id, lock) in all {
            let mut client = lock.lock().await;
            client.close_all();
            debug!("Closed all media for client {}", client_id);
        }
    }

    /// Sets up event handlers for a transport. Handlers are detached so they
    /// persist for the transport's lifetime.
    fn setup_transport_handlers(
        &self,
        transport: &WebRtcTransport,
        client_id: &str,
        direction: TransportDirection,
    ) {
        let client_id = client_id.to_string();
        let transport_id = transport.id().to_string();

        transport
            .on_ice_state_change({
                let client_id = client_id.clone();
                let transport_id = transport_id.clone();
                move |ice_state| {
                    debug!(
                        "ICE state {:?} for transport {} (client {})",
                        ice_state, transport_id, client_id
                    );
                }
            })
            .detach();

        let media_events = self.media_events.clone();
        transport
            .on_dtls_state_change({
                move |dtls_state| {
                    debug!(
                        "DTLS state {:?} for transport {} (client {})",
                        dtls_state, transport_id, client_id
                    );
                    if dtls_state == DtlsState::Failed {
                        warn!(
                            "DTLS failed for transport {} (client {}), cascading close",
                            transport_id, client_id
                        );
                        let _ = media_events.send(MediaEvent::TransportFailed {
                            client_id: client_id.clone(),
                            transport_id: transport_id.clone(),
                            direction,
                        });
                    }
                }
            })
            .detach();
    }

    fn setup_producer_handlers(&self, producer: &Producer, client_id: &str) {
        let client_id = client_id.to_string();
        let producer_id = producer.id().to_string();
        producer
            .on_close(move || {
                debug!("Producer {} closed for client {}", producer_id, client_id);
            })
            .detach();
    }

    fn setup_consumer_handlers(&self, consumer: &Consumer, client_id: &str) {
        let client_id = client_id.to_string();
        let consumer_id = consumer.id().to_string();
        consumer
            .on_close(move || {
                debug!("Consumer {} closed for client {}", consumer_id, client_id);
            })
            .detach();
    }
}
