//! Topic-based event broadcaster for live clients
//!
//! Clients register a transport, subscribe to named topics and receive every
//! frame broadcast on those topics. Delivery to one client never waits on or
//! fails because of another.
//!
//! The registry keeps two mirror-image indexes (`topic -> clients` and
//! `client -> topics`); a pair is in both or neither, and empty sets are
//! removed as soon as they empty. The registry lock is never held across a
//! transport write.

use super::transport::ClientTransport;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use onair_common::events::{FRAME_CONNECTED, FRAME_DISCONNECTED, FRAME_SUBSCRIBED};
use onair_common::EventFrame;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A registered client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventClient {
    pub id: Uuid,
    pub connected_at: DateTime<Utc>,
}

struct ClientEntry {
    transport: Arc<dyn ClientTransport>,
    inactivity_timer: Option<JoinHandle<()>>,
    close_watcher: Option<JoinHandle<()>>,
}

impl ClientEntry {
    fn stop_tasks(&mut self) {
        if let Some(timer) = self.inactivity_timer.take() {
            timer.abort();
        }
        if let Some(watcher) = self.close_watcher.take() {
            watcher.abort();
        }
    }
}

#[derive(Default)]
struct Registry {
    clients: HashMap<Uuid, ClientEntry>,
    topic_clients: HashMap<String, HashSet<Uuid>>,
    client_topics: HashMap<Uuid, HashSet<String>>,
}

impl Registry {
    fn transport(&self, client_id: Uuid) -> Option<Arc<dyn ClientTransport>> {
        self.clients.get(&client_id).map(|c| Arc::clone(&c.transport))
    }

    fn remove_pair(&mut self, topic: &str, client_id: Uuid) -> bool {
        let removed = match self.client_topics.get_mut(&client_id) {
            Some(topics) => {
                let removed = topics.remove(topic);
                if topics.is_empty() {
                    self.client_topics.remove(&client_id);
                }
                removed
            }
            None => false,
        };
        if let Some(clients) = self.topic_clients.get_mut(topic) {
            clients.remove(&client_id);
            if clients.is_empty() {
                self.topic_clients.remove(topic);
            }
        }
        removed
    }

    fn unsubscribe_all(&mut self, client_id: Uuid) -> Vec<String> {
        let topics: Vec<String> = self
            .client_topics
            .get(&client_id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        for topic in &topics {
            self.remove_pair(topic, client_id);
        }
        topics
    }

    /// Remove a client and every subscription it holds
    fn detach(&mut self, client_id: Uuid) -> Option<ClientEntry> {
        let entry = self.clients.remove(&client_id)?;
        self.unsubscribe_all(client_id);
        Some(entry)
    }
}

/// Why a client is leaving
enum Departure {
    /// Server-initiated, optional close frame
    Disconnect(Option<String>),
    /// Inactivity window elapsed
    Inactive,
    /// Remote side went away
    RemoteClosed,
}

struct Inner {
    known_topics: HashSet<String>,
    inactivity: Duration,
    registry: Mutex<Registry>,
}

/// Fan-out of event frames to subscribed clients
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<Inner>,
}

impl EventBroadcaster {
    pub fn new<I, S>(known_topics: I, inactivity: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let known_topics: HashSet<String> = known_topics.into_iter().map(Into::into).collect();
        info!(
            "Event broadcaster initialized with {} topics, inactivity window {:?}",
            known_topics.len(),
            inactivity
        );
        Self {
            inner: Arc::new(Inner {
                known_topics,
                inactivity,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Topics clients may subscribe to, sorted
    pub fn known_topics(&self) -> Vec<String> {
        let sorted: BTreeSet<&String> = self.inner.known_topics.iter().collect();
        sorted.into_iter().cloned().collect()
    }

    /// Register a connection and send its handshake frame
    ///
    /// The client is removed automatically when the transport reports closed or
    /// when nothing is sent to it for the inactivity window.
    pub async fn register_client(&self, transport: Arc<dyn ClientTransport>) -> Result<EventClient> {
        let client = EventClient {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
        };
        let id = client.id;

        self.inner.registry.lock().clients.insert(
            id,
            ClientEntry {
                transport: Arc::clone(&transport),
                inactivity_timer: None,
                close_watcher: None,
            },
        );
        Inner::reset_inactivity(&self.inner, id);
        Inner::watch_close(&self.inner, id, Arc::clone(&transport));
        info!("Event client {} registered", id);

        let handshake = EventFrame::now(
            FRAME_CONNECTED,
            json!({ "clientId": id, "topics": self.known_topics() }),
        );
        if let Err(e) = Inner::send_to(&self.inner, id, &transport, &handshake).await {
            warn!("Handshake to client {} failed: {}", id, e);
            Inner::depart(&self.inner, id, Departure::Disconnect(None)).await;
            return Err(e);
        }

        Ok(client)
    }

    /// Subscribe a client to topics
    ///
    /// Unknown topics are ignored. Returns the topics that were newly added and
    /// announces them to the client; re-subscribing announces nothing.
    pub async fn subscribe(&self, topic_ids: &[String], client_id: Uuid) -> Result<Vec<String>> {
        let (transport, added) = {
            let mut guard = self.inner.registry.lock();
            let registry = &mut *guard;
            let transport = registry
                .transport(client_id)
                .ok_or(Error::ClientNotFound(client_id))?;

            let mut added = Vec::new();
            for topic in topic_ids {
                if !self.inner.known_topics.contains(topic) {
                    debug!("Client {} asked for unknown topic '{}'", client_id, topic);
                    continue;
                }
                let newly = registry
                    .client_topics
                    .entry(client_id)
                    .or_default()
                    .insert(topic.clone());
                if newly {
                    registry
                        .topic_clients
                        .entry(topic.clone())
                        .or_default()
                        .insert(client_id);
                    added.push(topic.clone());
                }
            }
            (transport, added)
        };

        if !added.is_empty() {
            debug!("Client {} subscribed to {:?}", client_id, added);
            let confirmation = EventFrame::now(FRAME_SUBSCRIBED, json!({ "topics": added }));
            if let Err(e) = Inner::send_to(&self.inner, client_id, &transport, &confirmation).await {
                warn!("Subscription confirmation to {} failed: {}", client_id, e);
            }
        }

        Ok(added)
    }

    /// Remove subscriptions; returns the topics actually removed
    pub fn unsubscribe(&self, topic_ids: &[String], client_id: Uuid) -> Result<Vec<String>> {
        let mut registry = self.inner.registry.lock();
        if !registry.clients.contains_key(&client_id) {
            return Err(Error::ClientNotFound(client_id));
        }
        let removed: Vec<String> = topic_ids
            .iter()
            .filter(|topic| registry.remove_pair(topic, client_id))
            .cloned()
            .collect();
        Ok(removed)
    }

    /// Send a frame to every subscriber of `topic`
    ///
    /// The frame is stamped with the current time if it has none. A client
    /// whose write fails loses all its subscriptions; the others still receive
    /// the frame. Returns how many clients received it.
    pub async fn broadcast(&self, topic: &str, frame: EventFrame) -> usize {
        let mut frame = frame;
        frame.stamp();
        frame.topic = Some(topic.to_string());

        let targets: Vec<(Uuid, Arc<dyn ClientTransport>)> = {
            let registry = self.inner.registry.lock();
            registry
                .topic_clients
                .get(topic)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| registry.transport(*id).map(|t| (*id, t)))
                        .collect()
                })
                .unwrap_or_default()
        };

        if targets.is_empty() {
            debug!("No subscribers for {} on '{}'", frame.event_type, topic);
            return 0;
        }

        let frame = &frame;
        let results = join_all(targets.iter().map(|(id, transport)| async move {
            (*id, Inner::send_to(&self.inner, *id, transport, frame).await)
        }))
        .await;

        let mut delivered = 0;
        for (id, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Delivery to client {} failed, dropping its subscriptions: {}", id, e);
                    self.inner.registry.lock().unsubscribe_all(id);
                }
            }
        }

        debug!(
            "Broadcast {} on '{}' to {}/{} clients",
            frame.event_type,
            topic,
            delivered,
            targets.len()
        );
        delivered
    }

    /// Send a frame to one subscriber of `topic`
    pub async fn dispatch(&self, topic: &str, client_id: Uuid, frame: EventFrame) -> Result<()> {
        let transport = {
            let registry = self.inner.registry.lock();
            let subscribed = registry
                .topic_clients
                .get(topic)
                .is_some_and(|ids| ids.contains(&client_id));
            match registry.transport(client_id) {
                Some(transport) if subscribed => transport,
                _ => {
                    return Err(Error::ClientNotSubscribed {
                        topic: topic.to_string(),
                        client_id,
                    })
                }
            }
        };

        let mut frame = frame;
        frame.stamp();
        frame.topic = Some(topic.to_string());

        if let Err(e) = Inner::send_to(&self.inner, client_id, &transport, &frame).await {
            warn!("Dispatch to client {} failed, dropping its subscriptions: {}", client_id, e);
            self.inner.registry.lock().unsubscribe_all(client_id);
            return Err(e);
        }
        Ok(())
    }

    /// Close a client, optionally telling it why
    pub async fn disconnect(&self, client_id: Uuid, reason: Option<&str>) -> Result<()> {
        if !self.inner.registry.lock().clients.contains_key(&client_id) {
            return Err(Error::ClientNotFound(client_id));
        }
        Inner::depart(
            &self.inner,
            client_id,
            Departure::Disconnect(reason.map(str::to_string)),
        )
        .await;
        Ok(())
    }

    /// Disconnect every client (server shutdown)
    pub async fn disconnect_all(&self, reason: &str) {
        let ids: Vec<Uuid> = self.inner.registry.lock().clients.keys().copied().collect();
        for id in ids {
            let _ = self.disconnect(id, Some(reason)).await;
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.registry.lock().clients.len()
    }

    pub fn is_registered(&self, client_id: Uuid) -> bool {
        self.inner.registry.lock().clients.contains_key(&client_id)
    }

    /// Clients subscribed to `topic`
    pub fn subscribers(&self, topic: &str) -> Vec<Uuid> {
        self.inner
            .registry
            .lock()
            .topic_clients
            .get(topic)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Topics `client_id` is subscribed to, sorted
    pub fn topics_of(&self, client_id: Uuid) -> Vec<String> {
        let registry = self.inner.registry.lock();
        let mut topics: Vec<String> = registry
            .client_topics
            .get(&client_id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }
}

impl Inner {
    /// Write one frame and restart the client's inactivity window on success
    async fn send_to(
        inner: &Arc<Self>,
        client_id: Uuid,
        transport: &Arc<dyn ClientTransport>,
        frame: &EventFrame,
    ) -> Result<()> {
        transport.send(frame).await?;
        Self::reset_inactivity(inner, client_id);
        Ok(())
    }

    fn reset_inactivity(inner: &Arc<Self>, client_id: Uuid) {
        let mut registry = inner.registry.lock();
        let Some(entry) = registry.clients.get_mut(&client_id) else {
            return;
        };
        if let Some(previous) = entry.inactivity_timer.take() {
            previous.abort();
        }

        let weak = Arc::downgrade(inner);
        let window = inner.inactivity;
        entry.inactivity_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = weak.upgrade() {
                info!("Event client {} inactive for {:?}, evicting", client_id, window);
                Inner::depart(&inner, client_id, Departure::Inactive).await;
            }
        }));
    }

    fn watch_close(inner: &Arc<Self>, client_id: Uuid, transport: Arc<dyn ClientTransport>) {
        let weak: Weak<Self> = Arc::downgrade(inner);
        let watcher = tokio::spawn(async move {
            transport.closed().await;
            if let Some(inner) = weak.upgrade() {
                debug!("Event client {} transport closed", client_id);
                Inner::depart(&inner, client_id, Departure::RemoteClosed).await;
            }
        });

        let mut registry = inner.registry.lock();
        match registry.clients.get_mut(&client_id) {
            Some(entry) => entry.close_watcher = Some(watcher),
            None => watcher.abort(),
        }
    }

    /// Remove a client, stop its tasks, and close its transport
    ///
    /// A task never aborts itself here: the timer path drops its own handle
    /// and the watcher path drops its own handle before the rest are aborted.
    async fn depart(inner: &Arc<Self>, client_id: Uuid, departure: Departure) {
        let entry = {
            let mut registry = inner.registry.lock();
            if let Some(entry) = registry.clients.get_mut(&client_id) {
                match departure {
                    Departure::Inactive => drop(entry.inactivity_timer.take()),
                    Departure::RemoteClosed => drop(entry.close_watcher.take()),
                    Departure::Disconnect(_) => {}
                }
            }
            registry.detach(client_id)
        };
        let Some(mut entry) = entry else {
            return;
        };
        entry.stop_tasks();

        let farewell = match departure {
            Departure::Disconnect(reason) => reason,
            Departure::Inactive => Some("inactive".to_string()),
            Departure::RemoteClosed => None,
        };
        if let Some(reason) = farewell {
            let frame = EventFrame::now(FRAME_DISCONNECTED, json!({ "reason": reason }));
            if let Err(e) = entry.transport.send(&frame).await {
                debug!("Close frame to {} not delivered: {}", client_id, e);
            }
        }

        entry.transport.close().await;
        info!("Event client {} disconnected", client_id);
    }
}
