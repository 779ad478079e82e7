#![forbid(unsafe_code)]

// Active-speaker observer - one mediasoup AudioLevelObserver on the shared
// router, fanned into an mpsc stream for the routing core. Every producer on
// the router is registered into the same observer; channel scoping happens
// downstream.

use crate::media::types::{MediaError, MediaResult, ObserverEvent};
use mediasoup::audio_level_observer::{AudioLevelObserver, AudioLevelObserverOptions};
use mediasoup::prelude::*;
use mediasoup::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use std::num::NonZeroU16;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Producers reported per interval. Intercom channels are small; the loudest
/// handful is plenty.
const MAX_ENTRIES: u16 = 16;

pub struct SpeakingObserver {
    observer: AudioLevelObserver,
}

impl SpeakingObserver {
    /// Creates the observer on the router and returns it together with the
    /// receiving end of its event stream. Volumes arrive loudest-first, so
    /// interval ties break toward the highest volume.
    pub async fn new(
        router: &Router,
        threshold: i8,
        interval_ms: u16,
    ) -> MediaResult<(Self, mpsc::UnboundedReceiver<ObserverEvent>)> {
        let mut options = AudioLevelObserverOptions::default();
        options.max_entries = NonZeroU16::new(MAX_ENTRIES).unwrap();
        options.threshold = threshold;
        options.interval = interval_ms;

        let observer = router
            .create_audio_level_observer(options)
            .await
            .map_err(|e| MediaError::Setup(format!("failed to create audio level observer: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();

        observer
            .on_volumes({
                let tx = tx.clone();
                move |volumes| {
                    let entries: Vec<(String, i8)> = volumes
                        .iter()
                        .map(|v| (v.producer.id().to_string(), v.volume))
                        .collect();
                    let _ = tx.send(ObserverEvent::Volumes(entries));
                }
            })
            .detach();

        observer
            .on_silence(move || {
                let _ = tx.send(ObserverEvent::Silence);
            })
            .detach();

        info!(
            "Active-speaker observer running (threshold {} dBFS, interval {} ms)",
            threshold, interval_ms
        );

        Ok((Self { observer }, rx))
    }

    pub async fn add_producer(&self, producer_id: ProducerId) -> MediaResult<()> {
        self.observer
            .add_producer(RtpObserverAddProducerOptions::new(producer_id))
            .await
            .map_err(|e| MediaError::Setup(format!("failed to observe producer: {e}")))?;
        debug!("Observing producer {}", producer_id);
        Ok(())
    }

    /// Removing a producer that is already gone is not an error — the worker
    /// drops observer entries when producers close.
    pub async fn remove_producer(&self, producer_id: ProducerId) {
        if let Err(e) = self.observer.remove_producer(producer_id).await {
            debug!("Producer {} already gone from observer: {}", producer_id, e);
        }
    }
}
