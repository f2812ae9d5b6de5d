use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::progress::ProgressMessage;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("no progress channel attached")]
    NotAttached,
    #[error("progress channel is full")]
    Full,
    #[error("progress channel receiver is gone")]
    Closed,
}

struct Attached {
    id: u64,
    sender: mpsc::Sender<ProgressMessage>,
}

/// Maps upload session ids to the progress channel currently attached to
/// them.
///
/// Sends never block: a full or missing channel drops the message. Messages
/// produced before a channel attaches are lost, not buffered.
///
/// A session is published to by at most one upload at a time, see
/// [`ProgressChannelRegistry::claim`].
pub struct ProgressChannelRegistry {
    channels: Mutex<HashMap<String, Attached>>,
    claims: Mutex<HashSet<String>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl ProgressChannelRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashSet::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Attached>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claims(&self) -> MutexGuard<'_, HashSet<String>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves the session for one in-flight upload. Returns `None` while
    /// another upload holds it.
    pub fn claim(self: &Arc<Self>, session_id: &str) -> Option<SessionClaim> {
        if !self.claims().insert(session_id.to_string()) {
            return None;
        }
        Some(SessionClaim {
            session_id: session_id.to_string(),
            registry: self.clone(),
            finished: false,
        })
    }

    pub fn is_claimed(&self, session_id: &str) -> bool {
        self.claims().contains(session_id)
    }

    /// Registers `sender` for the session, replacing any previous channel.
    /// Returns an id usable with [`Self::detach_channel`].
    pub fn attach(&self, session_id: &str, sender: mpsc::Sender<ProgressMessage>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .channels()
            .insert(session_id.to_string(), Attached { id, sender });
        if previous.is_some() {
            debug!(session_id, "replaced progress channel");
        }
        id
    }

    /// Creates a bounded channel for the session and attaches it. The
    /// channel detaches itself when the subscription is dropped.
    pub fn subscribe(self: &Arc<Self>, session_id: &str) -> ProgressSubscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.attach(session_id, tx);
        ProgressSubscription {
            session_id: session_id.to_string(),
            id,
            receiver: rx,
            registry: self.clone(),
        }
    }

    /// Removes the session's channel. Idempotent.
    pub fn detach(&self, session_id: &str) -> bool {
        self.channels().remove(session_id).is_some()
    }

    /// Removes the session's channel only if it is still the one identified
    /// by `id`, so a stale subscriber cannot detach its replacement.
    pub fn detach_channel(&self, session_id: &str, id: u64) -> bool {
        let mut channels = self.channels();
        match channels.get(session_id) {
            Some(attached) if attached.id == id => {
                channels.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_attached(&self, session_id: &str) -> bool {
        self.channels().contains_key(session_id)
    }

    fn try_deliver(&self, session_id: &str, message: ProgressMessage) -> Result<(), ChannelError> {
        let mut channels = self.channels();
        let attached = channels.get(session_id).ok_or(ChannelError::NotAttached)?;
        match attached.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ChannelError::Full),
            Err(TrySendError::Closed(_)) => {
                channels.remove(session_id);
                Err(ChannelError::Closed)
            }
        }
    }

    /// Best effort delivery. Returns whether the message was handed to an
    /// attached channel; failures are logged and never propagated.
    pub fn send(&self, session_id: &str, message: ProgressMessage) -> bool {
        match self.try_deliver(session_id, message) {
            Ok(()) => true,
            Err(ChannelError::NotAttached) => false,
            Err(e) => {
                warn!(session_id, "dropping progress message: {}", e);
                false
            }
        }
    }
}

/// An upload's exclusive hold on a session.
///
/// Dropping the claim before [`SessionClaim::finish`] reports the upload as
/// cancelled and ends the session's progress stream.
pub struct SessionClaim {
    session_id: String,
    registry: Arc<ProgressChannelRegistry>,
    finished: bool,
}

impl SessionClaim {
    pub fn send(&self, message: ProgressMessage) -> bool {
        self.registry.send(&self.session_id, message)
    }

    /// Sends the final status and detaches the session's channel.
    pub fn finish(mut self, message: ProgressMessage) {
        self.end(message);
    }

    fn end(&mut self, message: ProgressMessage) {
        self.finished = true;
        self.registry.send(&self.session_id, message);
        self.registry.detach(&self.session_id);
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        if !self.finished {
            debug!(session_id = %self.session_id, "upload cancelled");
            self.end(ProgressMessage::failed("upload cancelled"));
        }
        self.registry.claims().remove(&self.session_id);
    }
}

/// Receiving end of a session's progress channel.
pub struct ProgressSubscription {
    session_id: String,
    id: u64,
    receiver: mpsc::Receiver<ProgressMessage>,
    registry: Arc<ProgressChannelRegistry>,
}

impl ProgressSubscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next message, or `None` once the upload finished and the channel was
    /// detached.
    pub async fn recv(&mut self) -> Option<ProgressMessage> {
        self.receiver.recv().await
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        if self.registry.detach_channel(&self.session_id, self.id) {
            debug!(session_id = %self.session_id, "progress channel detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::uploads::progress;

    fn event(bytes: u64) -> ProgressMessage {
        let now = Instant::now();
        ProgressMessage::Progress(progress::compute(bytes, 100, now, now))
    }

    #[test]
    fn test_send_without_channel_is_not_delivered() {
        let registry = ProgressChannelRegistry::new(4);
        assert!(!registry.send("nobody", event(1)));
    }

    #[tokio::test]
    async fn test_attach_replaces_previous_channel() {
        let registry = Arc::new(ProgressChannelRegistry::new(4));
        let mut first = registry.subscribe("s1");
        let mut second = registry.subscribe("s1");

        assert!(registry.send("s1", event(10)));
        assert_eq!(second.recv().await, Some(event(10)));

        // the replaced channel no longer has a sender
        assert_eq!(first.recv().await, None);

        // dropping the stale subscriber does not detach the live one
        drop(first);
        assert!(registry.is_attached("s1"));
        drop(second);
        assert!(!registry.is_attached("s1"));
    }

    #[test]
    fn test_detach_is_idempotent() {
        let registry = ProgressChannelRegistry::new(4);
        let (tx, _rx) = mpsc::channel(1);
        registry.attach("s1", tx);
        assert!(registry.detach("s1"));
        assert!(!registry.detach("s1"));
        assert!(!registry.send("s1", event(1)));
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let registry = Arc::new(ProgressChannelRegistry::new(1));
        let mut sub = registry.subscribe("s1");
        assert!(registry.send("s1", event(1)));
        assert!(!registry.send("s1", event(2)));
        assert!(registry.is_attached("s1"));
        assert_eq!(sub.recv().await, Some(event(1)));
    }

    #[test]
    fn test_closed_receiver_is_detached_on_send() {
        let registry = ProgressChannelRegistry::new(4);
        let (tx, rx) = mpsc::channel(4);
        registry.attach("s1", tx);
        drop(rx);
        assert_eq!(
            registry.try_deliver("s1", event(1)),
            Err(ChannelError::Closed)
        );
        assert!(!registry.is_attached("s1"));
    }

    #[tokio::test]
    async fn test_session_is_claimed_by_one_upload_at_a_time() {
        let registry = Arc::new(ProgressChannelRegistry::new(4));
        let mut sub = registry.subscribe("s1");

        let claim = registry.claim("s1").unwrap();
        assert!(registry.claim("s1").is_none());
        assert!(registry.is_claimed("s1"));
        assert!(claim.send(event(50)));

        claim.finish(ProgressMessage::complete());
        assert!(!registry.is_claimed("s1"));
        assert!(registry.claim("s1").is_some());

        assert_eq!(sub.recv().await, Some(event(50)));
        assert_eq!(sub.recv().await, Some(ProgressMessage::complete()));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_claim_reports_cancellation() {
        let registry = Arc::new(ProgressChannelRegistry::new(4));
        let mut sub = registry.subscribe("s1");

        drop(registry.claim("s1").unwrap());
        assert!(!registry.is_claimed("s1"));
        assert!(!registry.is_attached("s1"));
        assert_eq!(
            sub.recv().await,
            Some(ProgressMessage::failed("upload cancelled"))
        );
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_detach_ends_subscription_after_buffered_messages() {
        let registry = Arc::new(ProgressChannelRegistry::new(4));
        let mut sub = registry.subscribe("s1");
        registry.send("s1", event(50));
        registry.send("s1", ProgressMessage::complete());
        registry.detach("s1");

        assert_eq!(sub.recv().await, Some(event(50)));
        assert_eq!(sub.recv().await, Some(ProgressMessage::complete()));
        assert_eq!(sub.recv().await, None);
    }
}
