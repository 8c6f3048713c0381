use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::actions::ServerMessage;

/// Bounded queue depth per device.
///
/// When the queue is full the newest message is dropped; a slow or
/// absent consumer costs telemetry, never a stalled reader thread.
pub const QUEUE_CAPACITY: usize = 100;

/// How long the worker waits per dequeue before re-checking teardown.
const WORKER_POLL: Duration = Duration::from_secs(1);

/// Identifies one subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

type Subscribers = Arc<Mutex<HashMap<SubscriberId, mpsc::UnboundedSender<ServerMessage>>>>;

/// One device's queue, worker, and live subscribers.
struct DeviceChannel {
    queue: mpsc::Sender<ServerMessage>,
    subscribers: Subscribers,
}

/// Bridges reader threads into the async world.
///
/// Reader callbacks `publish` without ever blocking; one worker task
/// per device drains the bounded queue and pushes to every live
/// subscriber. Channels exist only while a device has subscribers;
/// tearing one down does not touch the underlying serial session.
#[derive(Default)]
pub struct BroadcastGateway {
    channels: Mutex<HashMap<usize, DeviceChannel>>,
}

impl BroadcastGateway {
    /// A gateway with no channels.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wire a subscriber into the device's channel, creating the
    /// channel and its worker if this is the first subscriber.
    pub fn subscribe(
        &self,
        index: usize,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> SubscriberId {
        let mut channels = self.channels.lock().expect("Lock should not be poisoned");

        let channel = channels
            .entry(index)
            .or_insert_with(|| spawn_channel(index, QUEUE_CAPACITY));

        let id = SubscriberId(Uuid::new_v4());
        let count = {
            let mut subscribers = channel
                .subscribers
                .lock()
                .expect("Lock should not be poisoned");
            subscribers.insert(id, sender);
            subscribers.len()
        };

        info!(%index, %count, "Subscriber added");
        id
    }

    /// Remove a subscriber. When the last one goes, the device's
    /// channel is torn down and its worker exits.
    pub fn unsubscribe(&self, index: usize, id: SubscriberId) {
        let mut channels = self.channels.lock().expect("Lock should not be poisoned");

        let Some(channel) = channels.get(&index) else {
            return;
        };

        let empty = {
            let mut subscribers = channel
                .subscribers
                .lock()
                .expect("Lock should not be poisoned");
            subscribers.remove(&id);
            subscribers.is_empty()
        };

        if empty {
            // Dropping the queue sender is what ends the worker.
            channels.remove(&index);
            info!(%index, "Last subscriber gone, tearing down broadcast channel");
        }
    }

    /// Enqueue a message for the device's subscribers.
    ///
    /// Never blocks: with no channel the message is discarded, with a
    /// full queue the newest message is dropped and a warning logged.
    pub fn publish(&self, index: usize, message: ServerMessage) {
        let channels = self.channels.lock().expect("Lock should not be poisoned");

        let Some(channel) = channels.get(&index) else {
            return;
        };

        match channel.queue.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%index, "Broadcast queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%index, "Broadcast channel closed");
            }
        }
    }

    /// Whether the device currently has a live channel.
    pub fn has_channel(&self, index: usize) -> bool {
        self.channels
            .lock()
            .expect("Lock should not be poisoned")
            .contains_key(&index)
    }

    /// How many subscribers the device currently has.
    pub fn subscriber_count(&self, index: usize) -> usize {
        self.channels
            .lock()
            .expect("Lock should not be poisoned")
            .get(&index)
            .map(|channel| {
                channel
                    .subscribers
                    .lock()
                    .expect("Lock should not be poisoned")
                    .len()
            })
            .unwrap_or(0)
    }
}

fn spawn_channel(index: usize, capacity: usize) -> DeviceChannel {
    let (queue, receiver) = mpsc::channel(capacity);
    let subscribers: Subscribers = Arc::default();

    let span = info_span!("Broadcast", %index);
    tokio::spawn(broadcast_worker(index, receiver, Arc::clone(&subscribers)).instrument(span));

    DeviceChannel { queue, subscribers }
}

/// Drains one device's queue for as long as its channel exists.
async fn broadcast_worker(
    index: usize,
    mut queue: mpsc::Receiver<ServerMessage>,
    subscribers: Subscribers,
) {
    debug!("Broadcast worker started");

    loop {
        match timeout(WORKER_POLL, queue.recv()).await {
            Ok(Some(message)) => deliver(index, &subscribers, message),
            // Channel entry removed; nothing will be queued again.
            Ok(None) => break,
            // Idle. Loop so a torn-down channel can't leave us parked.
            Err(_) => continue,
        }
    }

    debug!("Broadcast worker exited");
}

/// Push one message to every subscriber; drop the ones that fail.
fn deliver(index: usize, subscribers: &Subscribers, message: ServerMessage) {
    let targets: Vec<(SubscriberId, mpsc::UnboundedSender<ServerMessage>)> = subscribers
        .lock()
        .expect("Lock should not be poisoned")
        .iter()
        .map(|(id, sender)| (*id, sender.clone()))
        .collect();

    let mut gone = Vec::new();

    for (id, sender) in targets {
        if sender.send(message.clone()).is_err() {
            gone.push(id);
        }
    }

    if !gone.is_empty() {
        let mut subscribers = subscribers.lock().expect("Lock should not be poisoned");
        for id in gone {
            warn!(%index, "Subscriber delivery failed, removing");
            subscribers.remove(&id);
        }
    }
}
