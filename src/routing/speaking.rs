#![forbid(unsafe_code)]

// Speaking fan-out - translates the observer's volume stream into
// clientSpeaking / clientStoppedSpeaking events per channel. A hold-off
// keeps short dips below the threshold from flapping the state.

use crate::media::ObserverEvent;
use crate::routing::RoutingCore;
use crate::signaling::protocol::{fan_event, ServerEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Tracks which producers are currently considered speaking. Pure state
/// machine: `heard` on every volume report, `sweep` on every interval tick.
pub struct SpeakingTracker {
    hold_off: Duration,
    last_heard: HashMap<String, Instant>,
}

impl SpeakingTracker {
    pub fn new(hold_off: Duration) -> Self {
        Self {
            hold_off,
            last_heard: HashMap::new(),
        }
    }

    /// Records a volume report. Returns true when the producer was not
    /// speaking before (a clientSpeaking edge).
    pub fn heard(&mut self, producer_id: &str, now: Instant) -> bool {
        self.last_heard.insert(producer_id.to_string(), now).is_none()
    }

    /// Producers quiet for longer than the hold-off (clientStoppedSpeaking
    /// edges). They leave the speaking set.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let hold_off = self.hold_off;
        let stopped: Vec<String> = self
            .last_heard
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > hold_off)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stopped {
            self.last_heard.remove(id);
        }
        stopped
    }

    /// Drops a producer without emitting a stop edge (producer closed — its
    /// subscribers already saw producerClosed).
    pub fn forget(&mut self, producer_id: &str) {
        self.last_heard.remove(producer_id);
    }

    pub fn is_speaking(&self, producer_id: &str) -> bool {
        self.last_heard.contains_key(producer_id)
    }
}

fn fan_speaking(core: &RoutingCore, producer_id: &str, volume: i8) {
    let Some((owner, audience)) = core.speaking_audience(producer_id) else {
        return;
    };
    for (channel_id, senders) in audience {
        let event = ServerEvent::ClientSpeaking {
            channel_id,
            client_id: owner.clone(),
            volume,
        };
        fan_event(senders.iter(), &event);
    }
}

fn fan_stopped(core: &RoutingCore, producer_id: &str) {
    let Some((owner, audience)) = core.speaking_audience(producer_id) else {
        return;
    };
    for (channel_id, senders) in audience {
        let event = ServerEvent::ClientStoppedSpeaking {
            channel_id,
            client_id: owner.clone(),
        };
        fan_event(senders.iter(), &event);
    }
}

/// Drains the active-speaker observer stream for the server's lifetime.
pub async fn run(
    core: Arc<RoutingCore>,
    mut observer_events: mpsc::UnboundedReceiver<ObserverEvent>,
    interval: Duration,
    hold_off: Duration,
) {
    info!(
        "Speaking fan-out running (interval {:?}, hold-off {:?})",
        interval, hold_off
    );
    let mut tracker = SpeakingTracker::new(hold_off);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = observer_events.recv() => {
                match event {
                    Some(ObserverEvent::Volumes(entries)) => {
                        let now = Instant::now();
                        for (producer_id, volume) in entries {
                            if tracker.heard(&producer_id, now) {
                                debug!("Producer {} started speaking ({} dBFS)", producer_id, volume);
                                fan_speaking(&core, &producer_id, volume);
                            }
                        }
                    }
                    Some(ObserverEvent::Silence) => {
                        // Quiet interval; the sweep below applies the hold-off.
                    }
                    None => {
                        debug!("Observer stream ended, stopping speaking fan-out");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                for producer_id in tracker.sweep(Instant::now()) {
                    debug!("Producer {} stopped speaking", producer_id);
                    fan_stopped(&core, &producer_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_report_is_a_speaking_edge() {
        let mut tracker = SpeakingTracker::new(Duration::from_millis(800));
        let now = Instant::now();
        assert!(tracker.heard("p1", now));
        assert!(!tracker.heard("p1", now + Duration::from_millis(100)));
        assert!(tracker.is_speaking("p1"));
    }

    #[test]
    fn sweep_respects_hold_off() {
        let mut tracker = SpeakingTracker::new(Duration::from_millis(800));
        let start = Instant::now();
        tracker.heard("p1", start);

        // Within the hold-off: still speaking.
        assert!(tracker.sweep(start + Duration::from_millis(500)).is_empty());

        // Past the hold-off: stop edge exactly once.
        let stopped = tracker.sweep(start + Duration::from_millis(900));
        assert_eq!(stopped, vec!["p1".to_string()]);
        assert!(tracker.sweep(start + Duration::from_millis(2000)).is_empty());
        assert!(!tracker.is_speaking("p1"));
    }

    #[test]
    fn continued_volume_defers_the_stop_edge() {
        let mut tracker = SpeakingTracker::new(Duration::from_millis(800));
        let start = Instant::now();
        tracker.heard("p1", start);
        tracker.heard("p1", start + Duration::from_millis(700));
        assert!(tracker.sweep(start + Duration::from_millis(1200)).is_empty());
        let stopped = tracker.sweep(start + Duration::from_millis(1600));
        assert_eq!(stopped, vec!["p1".to_string()]);
    }

    #[test]
    fn forget_suppresses_the_stop_edge() {
        let mut tracker = SpeakingTracker::new(Duration::from_millis(800));
        let start = Instant::now();
        tracker.heard("p1", start);
        tracker.forget("p1");
        assert!(tracker.sweep(start + Duration::from_millis(2000)).is_empty());
    }
}
