// Session registry: reference-counted sharing of one engine session per content key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::engine::signal::OneShot;

/// Resolves to the bound session, or `None` if its creator gave up.
type Binding<S> = Arc<OneShot<Option<Arc<S>>>>;

struct Entry<S> {
    refcount: usize,
    /// One element per attachment; the same peer may appear several times.
    identities: Vec<String>,
    binding: Binding<S>,
    generation: u64,
}

/// Outcome of [`SessionRegistry::attach`].
pub struct Attachment<S> {
    /// Attachments on the key, including this one.
    pub count: usize,
    /// Session already bound to the key when this attach happened.
    pub prior: Option<Arc<S>>,
    /// Identifies the entry instance; pass back to [`SessionRegistry::destroy`].
    pub generation: u64,
    creator: bool,
    binding: Binding<S>,
}

impl<S> Attachment<S> {
    /// Whether this attacher must create and bind the session.
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// Wait for the creator to bind a session. `None` if it failed or `timeout` expired.
    pub async fn bound_session(&self, timeout: Duration) -> Option<Arc<S>> {
        if let Some(session) = &self.prior {
            return Some(Arc::clone(session));
        }
        self.binding.wait(timeout).await.flatten()
    }
}

/// Per-key attach/detach bookkeeping shared by all request tasks.
///
/// Every operation runs under one lock, so observing a zero refcount and
/// removing the entry happen in a single step.
pub struct SessionRegistry<S> {
    entries: Mutex<HashMap<String, Entry<S>>>,
    next_generation: AtomicU64,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn fresh_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `identity` as a consumer of `key`.
    pub fn attach(&self, key: &str, identity: &str) -> Attachment<S> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.refcount += 1;
            entry.identities.push(identity.to_string());

            // The previous creator gave up before binding: start over.
            let abandoned = matches!(entry.binding.get(), Some(None));
            if abandoned {
                entry.binding = Arc::new(OneShot::new());
            }
            debug!(key, identity, count = entry.refcount, "registry attach");
            return Attachment {
                count: entry.refcount,
                prior: entry.binding.get().flatten(),
                generation: entry.generation,
                creator: abandoned,
                binding: Arc::clone(&entry.binding),
            };
        }

        let generation = self.fresh_generation();
        let binding: Binding<S> = Arc::new(OneShot::new());
        entries.insert(
            key.to_string(),
            Entry {
                refcount: 1,
                identities: vec![identity.to_string()],
                binding: Arc::clone(&binding),
                generation,
            },
        );
        debug!(key, identity, "registry attach (creator)");
        Attachment {
            count: 1,
            prior: None,
            generation,
            creator: true,
            binding,
        }
    }

    /// Bind a freshly created session. Returns `false` if the key has no
    /// entry or a session is already bound.
    pub fn bind(&self, key: &str, session: Arc<S>) -> bool {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) => entry.binding.set(Some(session)),
            None => false,
        }
    }

    /// Record that the creator failed before binding; waiting joiners are released.
    pub fn abandon(&self, key: &str) {
        let entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            entry.binding.set(None);
        }
    }

    pub fn session(&self, key: &str) -> Option<Arc<S>> {
        let entries = self.entries.lock();
        entries.get(key).and_then(|entry| entry.binding.get().flatten())
    }

    /// Remove one attachment of `identity` and return the remaining count.
    pub fn detach(&self, key: &str, identity: &str) -> usize {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return 0;
        };
        if let Some(pos) = entry.identities.iter().position(|id| id == identity) {
            entry.identities.remove(pos);
            entry.refcount -= 1;
        }
        debug!(key, identity, count = entry.refcount, "registry detach");
        entry.refcount
    }

    /// Remove the entry if it is still the instance identified by
    /// `generation` and nobody is attached. Returns the session to tear down.
    ///
    /// Returns `None` when a late attach revived the entry, when the entry was
    /// already destroyed, or when no session was ever bound.
    pub fn destroy(&self, key: &str, generation: u64) -> Option<Arc<S>> {
        let mut entries = self.entries.lock();
        let removable = entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation && entry.refcount == 0);
        if !removable {
            return None;
        }
        let entry = entries.remove(key)?;
        debug!(key, generation, "registry entry destroyed");
        entry.binding.get().flatten()
    }

    pub fn count(&self, key: &str) -> usize {
        self.entries.lock().get(key).map_or(0, |entry| entry.refcount)
    }

    /// Attachments across all keys.
    pub fn total(&self) -> usize {
        self.entries.lock().values().map(|entry| entry.refcount).sum()
    }

    /// `(key, attachments)` for every live entry, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        let mut keys: Vec<(String, usize)> = self
            .entries
            .lock()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.refcount))
            .collect();
        keys.sort();
        keys
    }

    #[cfg(test)]
    fn is_consistent(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .map_or(true, |entry| entry.refcount == entry.identities.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Dummy(u32);

    #[test]
    fn test_first_attach_is_creator() {
        let registry: SessionRegistry<Dummy> = SessionRegistry::new();
        let first = registry.attach("k", "10.0.0.1");
        assert!(first.is_creator());
        assert_eq!(first.count, 1);
        assert!(first.prior.is_none());

        assert!(registry.bind("k", Arc::new(Dummy(7))));
        assert!(!registry.bind("k", Arc::new(Dummy(8))));

        let second = registry.attach("k", "10.0.0.2");
        assert!(!second.is_creator());
        assert_eq!(second.count, 2);
        assert_eq!(second.prior.as_ref().map(|s| s.0), Some(7));
        assert_eq!(second.generation, first.generation);
    }

    #[test]
    fn test_duplicate_identities_count_separately() {
        let registry: SessionRegistry<Dummy> = SessionRegistry::new();
        registry.attach("k", "peer");
        registry.attach("k", "peer");
        assert_eq!(registry.count("k"), 2);
        assert_eq!(registry.detach("k", "peer"), 1);
        assert_eq!(registry.detach("k", "peer"), 0);
        // Unknown identity never drives the count negative.
        assert_eq!(registry.detach("k", "peer"), 0);
        assert_eq!(registry.detach("missing", "peer"), 0);
    }

    #[test]
    fn test_destroy_requires_zero_and_matching_generation() {
        let registry: SessionRegistry<Dummy> = SessionRegistry::new();
        let a = registry.attach("k", "a");
        registry.bind("k", Arc::new(Dummy(1)));

        assert!(registry.destroy("k", a.generation).is_none());
        assert_eq!(registry.detach("k", "a"), 0);

        // A late attach during the grace period reuses the session.
        let b = registry.attach("k", "b");
        assert!(!b.is_creator());
        assert_eq!(b.prior.as_ref().map(|s| s.0), Some(1));
        assert!(registry.destroy("k", a.generation).is_none());

        assert_eq!(registry.detach("k", "b"), 0);
        let destroyed = registry.destroy("k", a.generation).unwrap();
        assert_eq!(destroyed.0, 1);
        assert!(registry.destroy("k", a.generation).is_none());
        assert!(registry.session("k").is_none());

        // A new entry for the same key is a different instance.
        let c = registry.attach("k", "c");
        assert!(c.is_creator());
        assert_ne!(c.generation, a.generation);
        assert!(registry.destroy("k", a.generation).is_none());
        assert_eq!(registry.count("k"), 1);
    }

    #[tokio::test]
    async fn test_joiner_waits_for_binding() {
        let registry: Arc<SessionRegistry<Dummy>> = Arc::new(SessionRegistry::new());
        let creator = registry.attach("k", "a");
        assert!(creator.is_creator());
        let joiner = registry.attach("k", "b");
        assert!(!joiner.is_creator());
        assert!(joiner.prior.is_none());

        let waiter = tokio::spawn(async move { joiner.bound_session(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        registry.bind("k", Arc::new(Dummy(3)));
        assert_eq!(waiter.await.unwrap().map(|s| s.0), Some(3));
    }

    #[tokio::test]
    async fn test_abandoned_binding_releases_joiners_and_elects_new_creator() {
        let registry: SessionRegistry<Dummy> = SessionRegistry::new();
        let _creator = registry.attach("k", "a");
        let joiner = registry.attach("k", "b");
        registry.abandon("k");
        assert!(joiner.bound_session(Duration::from_secs(5)).await.is_none());

        registry.detach("k", "a");
        let next = registry.attach("k", "c");
        assert!(next.is_creator());
        assert_eq!(next.count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attach_elects_one_creator() {
        let registry: Arc<SessionRegistry<Dummy>> = Arc::new(SessionRegistry::new());
        let creators = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for i in 0..64 {
            let registry = Arc::clone(&registry);
            let creators = Arc::clone(&creators);
            tasks.push(tokio::spawn(async move {
                let peer = format!("peer-{}", i % 8);
                let attachment = registry.attach("k", &peer);
                if attachment.is_creator() {
                    creators.fetch_add(1, Ordering::SeqCst);
                    registry.bind("k", Arc::new(Dummy(i)));
                }
                assert!(registry.is_consistent("k"));
                tokio::task::yield_now().await;
                registry.detach("k", &peer);
                assert!(registry.is_consistent("k"));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(creators.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count("k"), 0);
        assert_eq!(registry.total(), 0);
    }
}
