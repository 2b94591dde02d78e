//! Channel Registry
//!
//! Tracks, per topic, which subscribers are attached and how to deliver to
//! them. The registry owns channel -> subscriber id; each subscriber keeps its
//! own channel set, updated through the [`Subscriber`] hooks.
//!
//! A channel's lock is held only while its map is read or written. Hooks and
//! deliveries run after it is released, so a subscriber may call back into
//! the registry from either.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::bayeux::Message;
use crate::dispatch::Dispatch;

/// Delivery callback registered for one subscriber on one channel
pub type DeliveryFn = Arc<dyn Fn(Message) + Send + Sync>;

/// Something that can be attached to a channel
pub trait Subscriber: Send + Sync {
    fn id(&self) -> &str;

    /// Called after the channel has recorded the subscription
    fn on_subscribe(&self, channel: &str);

    /// Called after the channel has dropped the subscription
    fn on_unsubscribe(&self, channel: &str);
}

/// A named topic and its current subscribers
pub struct Channel {
    name: String,
    subscriptions: Mutex<HashMap<String, DeliveryFn>>,
    dispatch: Arc<dyn Dispatch>,
}

impl Channel {
    pub fn new(name: impl Into<String>, dispatch: Arc<dyn Dispatch>) -> Self {
        Self {
            name: name.into(),
            subscriptions: Mutex::new(HashMap::new()),
            dispatch,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a subscriber. Returns false if it was already attached, in
    /// which case the existing callback is kept and no hook runs.
    pub fn add_subscription(&self, subscriber: &dyn Subscriber, deliver: DeliveryFn) -> bool {
        {
            let mut subscriptions = self.subscriptions.lock();
            if subscriptions.contains_key(subscriber.id()) {
                debug!(channel = %self.name, subscriber = subscriber.id(), "already subscribed");
                return false;
            }
            subscriptions.insert(subscriber.id().to_string(), deliver);
        }

        subscriber.on_subscribe(&self.name);
        debug!(channel = %self.name, subscriber = subscriber.id(), "subscribed");
        true
    }

    /// Detach a subscriber. Returns false if it was not attached.
    pub fn remove_subscription(&self, subscriber: &dyn Subscriber) -> bool {
        if self.subscriptions.lock().remove(subscriber.id()).is_none() {
            return false;
        }

        subscriber.on_unsubscribe(&self.name);
        debug!(channel = %self.name, subscriber = subscriber.id(), "unsubscribed");
        true
    }

    pub fn is_subscribed(&self, subscriber_id: &str) -> bool {
        self.subscriptions.lock().contains_key(subscriber_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Deliver a message to every current subscriber
    ///
    /// Each delivery is its own unit of work. Returns the number of
    /// deliveries scheduled.
    pub fn publish(&self, message: Message) -> usize {
        self.fan_out(message, None)
    }

    /// Deliver to every current subscriber except `exclude`
    pub fn publish_excluding(&self, message: Message, exclude: &str) -> usize {
        self.fan_out(message, Some(exclude))
    }

    fn fan_out(&self, message: Message, exclude: Option<&str>) -> usize {
        let targets: Vec<DeliveryFn> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != exclude)
            .map(|(_, deliver)| deliver.clone())
            .collect();

        if targets.is_empty() {
            debug!(channel = %self.name, "no subscribers for publish");
            return 0;
        }

        let receivers = targets.len();
        for deliver in targets {
            let message = message.clone();
            self.dispatch.deliver(Box::pin(async move { deliver(message) }));
        }

        debug!(channel = %self.name, receivers, "publish scheduled");
        receivers
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// All channels known to the server
///
/// Channels are created on first use and live as long as the registry.
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<Channel>>,
    dispatch: Arc<dyn Dispatch>,
}

impl ChannelRegistry {
    pub fn new(dispatch: Arc<dyn Dispatch>) -> Self {
        Self {
            channels: DashMap::new(),
            dispatch,
        }
    }

    /// Get a channel by name, creating it if needed
    pub fn get_or_create(&self, name: &str) -> Arc<Channel> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(channel = name, "channel created");
                Arc::new(Channel::new(name, self.dispatch.clone()))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).map(|entry| entry.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Publish to a channel by name. Unknown channels are logged and skipped.
    pub fn publish(&self, name: &str, message: Message) -> Option<usize> {
        let Some(channel) = self.get(name) else {
            debug!(channel = name, "publish to unknown channel");
            return None;
        };
        Some(channel.publish(message))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.channels.len())
            .finish()
    }
}
