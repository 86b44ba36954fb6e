// src/channel/topic.rs

//! Per-destination topic state.
//!
//! A topic is the unit of multiplexing: many logical subscribers share one
//! physical subscription per destination. The registry tracks subscriber
//! reference counts, the broadcast conduit flavor, and whatever physical
//! attachment currently exists.
//!
//! Invariants maintained here:
//! - a topic with zero subscribers is removed in the same step its last
//!   subscriber cancels
//! - the retained replay frame lives exactly as long as its topic

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::{Destination, Frame, RawSubscriptionId};

/// Per-subscriber inbox depth.
pub(crate) const SUBSCRIBER_INBOX_DEPTH: usize = 16;

/// Broadcast conduit flavor, decided by the first subscriber of a topic.
///
/// `ReplayLast` retains the most recent frame and redelivers it immediately
/// to late subscribers; `Broadcast` delivers only frames arriving after the
/// subscription.
pub(crate) enum Conduit {
    Broadcast,
    ReplayLast(Option<Frame>),
}

impl Conduit {
    fn retain(&mut self, frame: &Frame) {
        // ---
        if let Conduit::ReplayLast(last) = self {
            *last = Some(frame.clone());
        }
    }

    fn last(&self) -> Option<&Frame> {
        // ---
        match self {
            Conduit::Broadcast => None,
            Conduit::ReplayLast(last) => last.as_ref(),
        }
    }
}

/// Live physical subscription backing a topic.
///
/// Present if and only if a physical session currently exists. The forward
/// task pumps frames from the raw subscription inbox into the conduit; it is
/// aborted when the attachment is dropped.
pub(crate) struct PhysicalAttachment {
    pub(crate) id: RawSubscriptionId,
    pub(crate) forward: JoinHandle<()>,
}

impl Drop for PhysicalAttachment {
    fn drop(&mut self) {
        self.forward.abort();
    }
}

/// One destination's multiplexing state.
pub(crate) struct Topic {
    pub(crate) conduit: Conduit,
    pub(crate) subscribers: HashMap<u64, mpsc::Sender<Frame>>,
    pub(crate) physical: Option<PhysicalAttachment>,
}

/// Outcome of removing a subscriber from a topic.
pub(crate) struct Removal {
    /// True when the last subscriber left and the topic entry was deleted.
    pub(crate) topic_removed: bool,
    /// The physical attachment to release, when the topic was deleted while
    /// attached.
    pub(crate) physical: Option<PhysicalAttachment>,
}

/// Registry of all live topics for one endpoint.
pub(crate) struct TopicRegistry {
    topics: HashMap<Destination, Topic>,
    next_subscriber_id: u64,
}

impl TopicRegistry {
    pub(crate) fn new() -> Self {
        // ---
        Self {
            topics: HashMap::new(),
            next_subscriber_id: 0,
        }
    }

    /// Register a logical subscriber, creating the topic on first use.
    ///
    /// The conduit flavor is decided by the first subscriber; `replay` is
    /// ignored for topics that already exist. Returns the subscriber id and
    /// the retained frame to redeliver, if the conduit is replay-capable.
    pub(crate) fn add_subscriber(
        &mut self,
        destination: &Destination,
        replay: bool,
        sender: mpsc::Sender<Frame>,
    ) -> (u64, Option<Frame>) {
        // ---
        let topic = self.topics.entry(destination.clone()).or_insert_with(|| Topic {
            conduit: if replay {
                Conduit::ReplayLast(None)
            } else {
                Conduit::Broadcast
            },
            subscribers: HashMap::new(),
            physical: None,
        });

        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        topic.subscribers.insert(id, sender);

        (id, topic.conduit.last().cloned())
    }

    /// Remove a logical subscriber; deletes the topic when it was the last.
    pub(crate) fn remove_subscriber(&mut self, destination: &Destination, id: u64) -> Removal {
        // ---
        let Some(topic) = self.topics.get_mut(destination) else {
            return Removal {
                topic_removed: false,
                physical: None,
            };
        };

        topic.subscribers.remove(&id);

        if topic.subscribers.is_empty() {
            // Last subscriber: delete the entry synchronously. Dropping the
            // subscriber senders completes the conduit.
            let physical = topic.physical.take();
            self.topics.remove(destination);
            return Removal {
                topic_removed: true,
                physical,
            };
        }

        Removal {
            topic_removed: false,
            physical: None,
        }
    }

    /// Record an inbound frame: retain it for replay and hand back the
    /// subscriber senders to deliver to.
    pub(crate) fn deliver(
        &mut self,
        destination: &Destination,
        frame: &Frame,
    ) -> Vec<mpsc::Sender<Frame>> {
        // ---
        match self.topics.get_mut(destination) {
            Some(topic) => {
                topic.conduit.retain(frame);
                topic.subscribers.values().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Destinations that currently lack a physical attachment.
    pub(crate) fn unattached(&self) -> Vec<Destination> {
        // ---
        self.topics
            .iter()
            .filter(|(_, topic)| topic.physical.is_none())
            .map(|(destination, _)| destination.clone())
            .collect()
    }

    /// Store a physical attachment for a topic.
    ///
    /// Returns the attachment back when the topic no longer exists or is
    /// already attached, so the caller can release it.
    pub(crate) fn attach(
        &mut self,
        destination: &Destination,
        attachment: PhysicalAttachment,
    ) -> Option<PhysicalAttachment> {
        // ---
        match self.topics.get_mut(destination) {
            Some(topic) if topic.physical.is_none() => {
                topic.physical = Some(attachment);
                None
            }
            _ => Some(attachment),
        }
    }

    /// Drop every physical attachment, keeping topics and conduits intact.
    pub(crate) fn detach_all(&mut self) {
        // ---
        for topic in self.topics.values_mut() {
            topic.physical = None;
        }
    }

    /// Remove every topic, completing all conduits.
    pub(crate) fn clear(&mut self) {
        // ---
        self.topics.clear();
    }

    pub(crate) fn contains(&self, destination: &Destination) -> bool {
        self.topics.contains_key(destination)
    }

    /// True when the topic exists and holds a live physical attachment.
    pub(crate) fn is_attached(&self, destination: &Destination) -> bool {
        // ---
        self.topics
            .get(destination)
            .is_some_and(|topic| topic.physical.is_some())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.topics.len()
    }
}
