#![forbid(unsafe_code)]

// Audio routing core - the policy layer between the registries and the media
// worker. Owns the (producer, subscriber) routing table and keeps it
// consistent with channel membership and the permission matrix: every pairing
// must have a channel in which the producer's owner may speak and the
// subscriber may listen. Consumer creation is client-driven (a consume
// request answers a producerOpened event); closure is server-driven
// reconciliation.

pub mod speaking;
pub mod table;

pub use table::RoutingTable;

use crate::media::{MediaError, MediaWorker};
use crate::metrics::ServerMetrics;
use crate::registry::channel::ChannelRegistry;
use crate::registry::client::ClientRegistry;
use crate::registry::permissions::Direction;
use crate::signaling::protocol::{fan_event, send_event, ServerEvent};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct RoutingCore {
    media: Arc<MediaWorker>,
    channels: Arc<ChannelRegistry>,
    clients: Arc<ClientRegistry>,
    table: StdRwLock<RoutingTable>,
    /// Serializes mutation+fan-out batches so events for a channel are
    /// observed in commit order. Never held across an await.
    commit: StdMutex<()>,
    metrics: ServerMetrics,
}

impl RoutingCore {
    pub fn new(
        media: Arc<MediaWorker>,
        channels: Arc<ChannelRegistry>,
        clients: Arc<ClientRegistry>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            media,
            channels,
            clients,
            table: StdRwLock::new(RoutingTable::new()),
            commit: StdMutex::new(()),
            metrics,
        }
    }

    pub fn media(&self) -> &Arc<MediaWorker> {
        &self.media
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    fn table_read(&self) -> std::sync::RwLockReadGuard<'_, RoutingTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn table_write(&self) -> std::sync::RwLockWriteGuard<'_, RoutingTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Members of the channel holding the listen right there, deduplicated by
    /// client id.
    fn listeners_of(&self, channel_id: &str) -> Vec<(String, mpsc::Sender<Arc<String>>)> {
        let members = self.channels.members_of(channel_id);
        self.clients.listeners_among(&members, channel_id)
    }

    fn fan_to_listeners(&self, channel_id: &str, event: &ServerEvent, exclude: Option<&str>) {
        let senders: Vec<_> = self
            .listeners_of(channel_id)
            .into_iter()
            .filter(|(id, _)| exclude != Some(id.as_str()))
            .map(|(_, sender)| sender)
            .collect();
        fan_event(senders.iter(), event);
    }

    /// All members of the channel (membership events are not gated on the
    /// listen right).
    fn fan_to_members(&self, channel_id: &str, event: &ServerEvent, exclude: Option<&str>) {
        let members = self.channels.members_of(channel_id);
        let senders: Vec<_> = members
            .iter()
            .filter(|id| exclude != Some(id.as_str()))
            .filter_map(|id| self.clients.sender_of(id))
            .collect();
        fan_event(senders.iter(), event);
    }

    fn send_to_client(&self, client_id: &str, event: &ServerEvent) {
        if let Some(sender) = self.clients.sender_of(client_id) {
            send_event(&sender, event);
        }
    }

    pub fn fan_to_admins(&self, event: &ServerEvent) {
        let senders = self.clients.admin_senders();
        fan_event(senders.iter(), event);
    }

    pub fn fan_to_active(&self, event: &ServerEvent) {
        let senders = self.clients.active_senders();
        fan_event(senders.iter(), event);
    }

    // === Producer lifecycle ===

    /// Registers a fresh producer into every channel its owner may speak in
    /// and announces it to potential subscribers.
    pub fn register_producer(&self, owner: &str, producer_id: &str) {
        let speak_channels: HashSet<String> =
            self.clients.speak_channels(owner).into_iter().collect();

        let _commit = self.commit.lock().unwrap_or_else(|e| e.into_inner());
        for channel_id in &speak_channels {
            self.channels.add_producer(channel_id, producer_id);
        }
        self.table_write()
            .insert_producer(producer_id, owner, speak_channels.clone());

        for channel_id in &speak_channels {
            self.fan_to_listeners(
                channel_id,
                &ServerEvent::ProducerOpened {
                    channel_id: channel_id.clone(),
                    client_id: owner.to_string(),
                    producer_id: producer_id.to_string(),
                },
                Some(owner),
            );
        }
        self.metrics.inc_producers_created();
        info!(
            "Registered producer {} for {} into {} channel(s)",
            producer_id,
            owner,
            speak_channels.len()
        );
    }

    /// Full producer cascade: close all its consumers, then the producer,
    /// then drop routing entries and notify subscribers.
    pub async fn close_producer(&self, producer_id: &str) {
        let (owner, consumers) = {
            let table = self.table_read();
            let Some(entry) = table.producer(producer_id) else {
                return;
            };
            (entry.owner.clone(), table.consumers_of_producer(producer_id))
        };

        // Close consumers before removing routing entries.
        for (consumer_id, subscriber) in &consumers {
            self.media.close_consumer(subscriber, consumer_id).await;
        }
        if let Err(e) = self.media.close_producer(&owner, producer_id).await {
            match e {
                MediaError::ProducerNotFound(_) | MediaError::ClientNotFound(_) => {}
                other => warn!("Closing producer {}: {}", producer_id, other),
            }
        }

        self.finish_producer_close(producer_id, &consumers);
    }

    /// Bookkeeping half of a producer close, used when the media side is
    /// already gone (disconnect, transport failure).
    fn finish_producer_close(&self, producer_id: &str, consumers: &[(String, String)]) {
        let _commit = self.commit.lock().unwrap_or_else(|e| e.into_inner());
        let entry = {
            let mut table = self.table_write();
            for (consumer_id, _) in consumers {
                table.remove_consumer(consumer_id);
            }
            table.remove_producer(producer_id)
        };
        let Some(entry) = entry else {
            return;
        };

        let event = ServerEvent::ProducerClosed {
            producer_id: producer_id.to_string(),
        };
        let mut notified: HashMap<String, mpsc::Sender<Arc<String>>> = HashMap::new();
        for channel_id in &entry.channels {
            self.channels.remove_producer(channel_id, producer_id);
            for (client_id, sender) in self.listeners_of(channel_id) {
                if client_id != entry.owner {
                    notified.entry(client_id).or_insert(sender);
                }
            }
        }
        // Subscribers always learn their consumer's producer went away, even
        // if their listen right was just revoked.
        for (_, subscriber) in consumers {
            if !notified.contains_key(subscriber) {
                if let Some(sender) = self.clients.sender_of(subscriber) {
                    notified.insert(subscriber.clone(), sender);
                }
            }
        }
        fan_event(notified.values(), &event);
        info!("Closed producer {} ({} consumer(s))", producer_id, consumers.len());
    }

    // === Consumer support (creation is driven by consume requests) ===

    /// Channels that permit the (producer, subscriber) pairing right now.
    pub fn permitting_channels(&self, producer_id: &str, subscriber: &str) -> Vec<String> {
        let registered: Vec<String> = {
            let table = self.table_read();
            match table.producer(producer_id) {
                Some(entry) => entry.channels.iter().cloned().collect(),
                None => return Vec::new(),
            }
        };
        registered
            .into_iter()
            .filter(|ch| self.clients.allow(subscriber, ch, Direction::Listen))
            .collect()
    }

    pub fn producer_known(&self, producer_id: &str) -> bool {
        self.table_read().producer(producer_id).is_some()
    }

    pub fn producer_owner(&self, producer_id: &str) -> Option<String> {
        self.table_read().producer(producer_id).map(|e| e.owner.clone())
    }

    pub fn has_pair(&self, producer_id: &str, subscriber: &str) -> bool {
        self.table_read().has_pair(producer_id, subscriber)
    }

    /// Records a consumer created through a consume request. Returns false on
    /// a duplicate pairing (the caller must not have created one).
    pub fn record_consumer(&self, consumer_id: &str, producer_id: &str, subscriber: &str) -> bool {
        let inserted = self
            .table_write()
            .insert_consumer(consumer_id, producer_id, subscriber);
        if inserted {
            self.metrics.inc_consumers_created();
        }
        inserted
    }

    pub fn pair_count(&self) -> usize {
        self.table_read().pair_count()
    }

    // === Membership and permission mutations ===

    /// Adds a member to a channel, announces the join, surfaces consumable
    /// producers to the joiner and registers the joiner's own producer if it
    /// may now speak there.
    pub fn join_channel(&self, client_id: &str, channel_id: &str) {
        let display_name = self
            .clients
            .display_name_of(client_id)
            .unwrap_or_else(|| client_id.to_string());

        let _commit = self.commit.lock().unwrap_or_else(|e| e.into_inner());
        self.channels
            .add_member(channel_id, client_id)
            .ok();
        self.fan_to_members(
            channel_id,
            &ServerEvent::ClientJoinedChannel {
                channel_id: channel_id.to_string(),
                client_id: client_id.to_string(),
                display_name,
            },
            Some(client_id),
        );

        // Surface existing producers to the joiner.
        if self.clients.allow(client_id, channel_id, Direction::Listen) {
            for producer_id in self.channels.producers_of(channel_id) {
                let owner = self.producer_owner(&producer_id);
                if owner.as_deref() == Some(client_id) {
                    continue;
                }
                if let Some(owner) = owner {
                    self.send_to_client(
                        client_id,
                        &ServerEvent::ProducerOpened {
                            channel_id: channel_id.to_string(),
                            client_id: owner,
                            producer_id,
                        },
                    );
                }
            }
        }

        // Register the joiner's producer into the channel if it may speak.
        if self.clients.allow(client_id, channel_id, Direction::Speak) {
            let own_producers = self.table_read().producers_of_owner(client_id);
            for producer_id in own_producers {
                let mut updated = {
                    let table = self.table_read();
                    match table.producer(&producer_id) {
                        Some(entry) => entry.channels.clone(),
                        None => continue,
                    }
                };
                if updated.insert(channel_id.to_string()) {
                    self.channels.add_producer(channel_id, &producer_id);
                    self.table_write()
                        .set_producer_channels(&producer_id, updated);
                    self.fan_to_listeners(
                        channel_id,
                        &ServerEvent::ProducerOpened {
                            channel_id: channel_id.to_string(),
                            client_id: client_id.to_string(),
                            producer_id,
                        },
                        Some(client_id),
                    );
                }
            }
        }
    }

    /// Removes a member and reconciles producers/consumers that relied on the
    /// membership.
    pub async fn leave_channel(&self, client_id: &str, channel_id: &str) {
        {
            let _commit = self.commit.lock().unwrap_or_else(|e| e.into_inner());
            self.channels.remove_member(channel_id, client_id);
            self.fan_to_members(
                channel_id,
                &ServerEvent::ClientLeftChannel {
                    channel_id: channel_id.to_string(),
                    client_id: client_id.to_string(),
                },
                None,
            );
        }
        self.reconcile().await;
    }

    /// Re-derives producer registrations and consumer permissions after any
    /// permission or membership mutation. Closes what is no longer allowed;
    /// announces producers that became reachable.
    pub async fn reconcile(&self) {
        // Phase 1: producer channel sets.
        let mut producers_to_close: Vec<String> = Vec::new();
        {
            let _commit = self.commit.lock().unwrap_or_else(|e| e.into_inner());
            let producer_ids = self.table_read().producer_ids();
            for producer_id in producer_ids {
                let (owner, current) = {
                    let table = self.table_read();
                    match table.producer(&producer_id) {
                        Some(entry) => (entry.owner.clone(), entry.channels.clone()),
                        None => continue,
                    }
                };
                let valid: HashSet<String> =
                    self.clients.speak_channels(&owner).into_iter().collect();
                if valid.is_empty() {
                    producers_to_close.push(producer_id);
                    continue;
                }
                if valid == current {
                    continue;
                }
                for added in valid.difference(&current) {
                    self.channels.add_producer(added, &producer_id);
                    self.fan_to_listeners(
                        added,
                        &ServerEvent::ProducerOpened {
                            channel_id: added.clone(),
                            client_id: owner.clone(),
                            producer_id: producer_id.clone(),
                        },
                        Some(&owner),
                    );
                }
                for removed in current.difference(&valid) {
                    self.channels.remove_producer(removed, &producer_id);
                }
                self.table_write().set_producer_channels(&producer_id, valid);
            }
        }

        for producer_id in producers_to_close {
            self.close_producer(&producer_id).await;
        }

        // Phase 2: consumers whose pairing lost every permitting channel.
        let doomed: Vec<(String, String, String)> = {
            let table = self.table_read();
            table
                .consumer_entries()
                .into_iter()
                .filter(|(_, entry)| {
                    let permitted = match table.producer(&entry.producer_id) {
                        Some(producer) => producer.channels.iter().any(|ch| {
                            self.clients.allow(&entry.subscriber, ch, Direction::Listen)
                        }),
                        None => false,
                    };
                    !permitted
                })
                .map(|(id, entry)| (id, entry.producer_id, entry.subscriber))
                .collect()
        };

        for (consumer_id, producer_id, subscriber) in doomed {
            self.media.close_consumer(&subscriber, &consumer_id).await;
            {
                let _commit = self.commit.lock().unwrap_or_else(|e| e.into_inner());
                self.table_write().remove_consumer(&consumer_id);
                self.send_to_client(
                    &subscriber,
                    &ServerEvent::ProducerClosed {
                        producer_id: producer_id.clone(),
                    },
                );
            }
            debug!(
                "Closed consumer {} (pair {} -> {} no longer permitted)",
                consumer_id, producer_id, subscriber
            );
        }
    }

    /// Applies a permission patch and reconciles, announcing producers that
    /// became listenable.
    pub async fn apply_permissions(
        &self,
        client_id: &str,
        patch: &crate::registry::permissions::PermissionPatch,
    ) -> Result<(), crate::error::ServerError> {
        let (before, after) = self.clients.update_permissions(client_id, patch)?;
        self.reconcile().await;

        // Channels where listen flipped on: surface their producers.
        for channel_id in self.clients.channels_of(client_id) {
            let had = before.allows(&channel_id, Direction::Listen);
            let has = after.allows(&channel_id, Direction::Listen);
            if !had && has {
                let _commit = self.commit.lock().unwrap_or_else(|e| e.into_inner());
                for producer_id in self.channels.producers_of(&channel_id) {
                    let owner = self.producer_owner(&producer_id);
                    if owner.as_deref() == Some(client_id) {
                        continue;
                    }
                    if let Some(owner) = owner {
                        self.send_to_client(
                            client_id,
                            &ServerEvent::ProducerOpened {
                                channel_id: channel_id.clone(),
                                client_id: owner,
                                producer_id,
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Deletes a channel: detaches members and permissions, announces the
    /// deletion and reconciles orphaned producers/consumers.
    pub async fn delete_channel(
        &self,
        channel_id: &str,
    ) -> Result<(), crate::error::ServerError> {
        let record = self.channels.delete(channel_id)?;
        {
            let _commit = self.commit.lock().unwrap_or_else(|e| e.into_inner());
            self.clients.forget_channel(channel_id);
            self.fan_to_active(&ServerEvent::ChannelDeleted {
                channel_id: channel_id.to_string(),
            });
        }
        debug!(
            "Channel {} deleted with {} member(s), {} producer(s)",
            channel_id,
            record.members.len(),
            record.producers.len()
        );
        self.reconcile().await;
        Ok(())
    }

    // === Session teardown and transport failure ===

    /// Full disconnect cascade: close the client's media, drop its routing
    /// entries, detach it from channels and notify everyone concerned.
    pub async fn client_disconnected(&self, client_id: &str) {
        debug!("Cascading disconnect for client {}", client_id);

        // Consumers other clients hold on this client's producers.
        let owned_producers = self.table_read().producers_of_owner(client_id);
        let mut producer_consumers: Vec<(String, Vec<(String, String)>)> = Vec::new();
        for producer_id in &owned_producers {
            let consumers = self.table_read().consumers_of_producer(producer_id);
            producer_consumers.push((producer_id.clone(), consumers));
        }

        // Media side: everything owned by this client goes away at once.
        self.media.remove_client(client_id).await;
        for (_, consumers) in &producer_consumers {
            for (consumer_id, subscriber) in consumers {
                self.media.close_consumer(subscriber, consumer_id).await;
            }
        }

        // Bookkeeping + events.
        for (producer_id, consumers) in &producer_consumers {
            self.finish_producer_close(producer_id, consumers);
        }
        {
            let _commit = self.commit.lock().unwrap_or_else(|e| e.into_inner());
            let orphaned = self.table_read().consumers_of_subscriber(client_id);
            {
                let mut table = self.table_write();
                for (consumer_id, _) in &orphaned {
                    table.remove_consumer(consumer_id);
                }
            }

            let memberships = self.clients.close(client_id);
            for channel_id in &memberships {
                self.channels.remove_member(channel_id, client_id);
                self.fan_to_members(
                    channel_id,
                    &ServerEvent::ClientLeftChannel {
                        channel_id: channel_id.clone(),
                        client_id: client_id.to_string(),
                    },
                    None,
                );
            }
            self.fan_to_admins(&ServerEvent::Disconnected {
                client_id: client_id.to_string(),
            });
        }
        info!("Disconnect cascade complete for client {}", client_id);
    }

    /// DTLS failure or ICE watchdog: close the transport and cascade whatever
    /// was riding on it.
    pub async fn transport_failed(&self, client_id: &str, transport_id: &str) {
        let closed = match self.media.close_transport(client_id, transport_id).await {
            Ok(closed) => closed,
            Err(MediaError::TransportClosed(_)) | Err(MediaError::TransportNotFound(_))
            | Err(MediaError::ClientNotFound(_)) => return,
            Err(e) => {
                warn!("Closing failed transport {}: {}", transport_id, e);
                return;
            }
        };

        self.send_to_client(
            client_id,
            &ServerEvent::TransportClosed {
                transport_id: transport_id.to_string(),
            },
        );

        for producer_id in &closed.producer_ids {
            let consumers = self.table_read().consumers_of_producer(producer_id);
            for (consumer_id, subscriber) in &consumers {
                self.media.close_consumer(subscriber, consumer_id).await;
            }
            self.finish_producer_close(producer_id, &consumers);
        }

        if !closed.consumer_ids.is_empty() {
            let _commit = self.commit.lock().unwrap_or_else(|e| e.into_inner());
            let mut table = self.table_write();
            for consumer_id in &closed.consumer_ids {
                table.remove_consumer(consumer_id);
            }
        }
    }

    // === Speaking fan-out support ===

    /// Fan-out targets for a speaking event: each channel the producer is
    /// registered into, with the members holding the listen right there.
    pub fn speaking_audience(
        &self,
        producer_id: &str,
    ) -> Option<(String, Vec<(String, Vec<mpsc::Sender<Arc<String>>>)>)> {
        let (owner, channels) = {
            let table = self.table_read();
            let entry = table.producer(producer_id)?;
            (
                entry.owner.clone(),
                entry.channels.iter().cloned().collect::<Vec<_>>(),
            )
        };
        let per_channel = channels
            .into_iter()
            .map(|channel_id| {
                let senders = self
                    .listeners_of(&channel_id)
                    .into_iter()
                    .map(|(_, sender)| sender)
                    .collect();
                (channel_id, senders)
            })
            .collect();
        Some((owner, per_channel))
    }
}
