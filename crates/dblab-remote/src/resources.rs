//! Central registry of long-lived resources (tunnels, proxies) that must be
//! torn down before the process exits.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::ssh::ForwardChannel;
use crate::Result;

/// Something the [`ResourceManager`] can close.
pub trait ManagedResource: Send + Sync {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Release the resource. Must be safe to call more than once.
    fn close(&self) -> Result<()>;

    /// Whether the resource was already released and needs no tracking
    fn is_closed(&self) -> bool {
        false
    }
}

/// Shared ownership of a forward channel.
///
/// The tunnel and proxy managers and the [`ResourceManager`] all hold the same
/// handle; whichever closes first wins and later closes are no-ops.
pub struct ChannelHandle {
    description: String,
    local_port: u16,
    channel: Mutex<Option<Box<dyn ForwardChannel>>>,
}

impl ChannelHandle {
    /// Wrap an open channel
    pub fn new(description: impl Into<String>, channel: Box<dyn ForwardChannel>) -> Self {
        Self {
            description: description.into(),
            local_port: channel.local_port(),
            channel: Mutex::new(Some(channel)),
        }
    }

    /// Local listening port of the channel
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether the channel is open and its session still up
    pub fn is_alive(&self) -> bool {
        self.channel
            .lock()
            .as_mut()
            .map(|channel| channel.is_alive())
            .unwrap_or(false)
    }

}

impl ManagedResource for ChannelHandle {
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn is_closed(&self) -> bool {
        self.channel.lock().is_none()
    }

    fn close(&self) -> Result<()> {
        let Some(mut channel) = self.channel.lock().take() else {
            return Ok(());
        };
        debug!(resource = %self.description, "Closing channel");
        channel.close()
    }
}

/// Owns cleanup of every registered resource.
///
/// [`ResourceManager::close_all`] closes resources in registration order, logs
/// and skips any that fail, and leaves the manager empty so a second call does
/// nothing. It also runs when the manager is dropped.
#[derive(Default)]
pub struct ResourceManager {
    resources: Mutex<Vec<Arc<dyn ManagedResource>>>,
}

impl ResourceManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a resource for cleanup, forgetting any that were already closed
    pub fn register(&self, resource: Arc<dyn ManagedResource>) {
        debug!(resource = %resource.describe(), "Registered resource");
        let mut resources = self.resources.lock();
        resources.retain(|r| !r.is_closed());
        resources.push(resource);
    }

    /// Number of resources still tracked
    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close everything, returning how many resources failed to close
    pub fn close_all(&self) -> usize {
        // Take the list first so close() never runs under the registry lock.
        let resources: Vec<_> = std::mem::take(&mut *self.resources.lock());
        if resources.is_empty() {
            return 0;
        }

        let mut failed = 0;
        for resource in &resources {
            if let Err(e) = resource.close() {
                failed += 1;
                warn!(resource = %resource.describe(), error = %e, "Failed to close resource");
            }
        }
        info!(closed = resources.len() - failed, failed, "Closed managed resources");
        failed
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::RemoteError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory channel recording how often it was closed
    pub(crate) struct FakeChannel {
        pub port: u16,
        pub alive: Arc<AtomicBool>,
        pub closes: Arc<AtomicUsize>,
    }

    impl FakeChannel {
        pub(crate) fn new(port: u16) -> (Self, Arc<AtomicBool>, Arc<AtomicUsize>) {
            let alive = Arc::new(AtomicBool::new(true));
            let closes = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    port,
                    alive: alive.clone(),
                    closes: closes.clone(),
                },
                alive,
                closes,
            )
        }
    }

    impl ForwardChannel for FakeChannel {
        fn local_port(&self) -> u16 {
            self.port
        }

        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing {
        attempts: AtomicUsize,
    }

    impl ManagedResource for Failing {
        fn describe(&self) -> String {
            "failing".to_string()
        }

        fn close(&self) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::transport("gw", "socket already gone"))
        }
    }

    #[test]
    fn when_closing_twice_channel_is_closed_once() {
        let (channel, alive, closes) = FakeChannel::new(9000);
        let handle = ChannelHandle::new("tunnel", Box::new(channel));

        assert!(handle.is_alive());
        handle.close().unwrap();
        handle.close().unwrap();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!alive.load(Ordering::SeqCst));
        assert!(handle.is_closed());
        assert!(!handle.is_alive());
    }

    #[test]
    fn when_one_resource_fails_the_rest_still_close() {
        let manager = ResourceManager::new();
        let (first, _, first_closes) = FakeChannel::new(1);
        let (last, _, last_closes) = FakeChannel::new(2);
        let failing = Arc::new(Failing {
            attempts: AtomicUsize::new(0),
        });

        manager.register(Arc::new(ChannelHandle::new("first", Box::new(first))));
        manager.register(failing.clone());
        manager.register(Arc::new(ChannelHandle::new("last", Box::new(last))));

        assert_eq!(manager.close_all(), 1);
        assert_eq!(first_closes.load(Ordering::SeqCst), 1);
        assert_eq!(last_closes.load(Ordering::SeqCst), 1);
        assert_eq!(failing.attempts.load(Ordering::SeqCst), 1);
        assert!(manager.is_empty());

        // Second call is a no-op
        assert_eq!(manager.close_all(), 0);
        assert_eq!(failing.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn when_registering_closed_handles_are_forgotten() {
        let manager = ResourceManager::new();
        let (first, _, _) = FakeChannel::new(1);
        let (second, _, _) = FakeChannel::new(2);
        let (third, _, third_closes) = FakeChannel::new(3);

        let first = Arc::new(ChannelHandle::new("proxy via db0", Box::new(first)));
        manager.register(first.clone());
        first.close().unwrap();
        let second = Arc::new(ChannelHandle::new("proxy via db0", Box::new(second)));
        manager.register(second.clone());
        assert_eq!(manager.len(), 1);

        second.close().unwrap();
        manager.register(Arc::new(ChannelHandle::new("proxy via db1", Box::new(third))));
        assert_eq!(manager.len(), 1);

        assert_eq!(manager.close_all(), 0);
        assert_eq!(third_closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn when_manager_drops_resources_are_closed() {
        let (channel, _, closes) = FakeChannel::new(3);
        {
            let manager = ResourceManager::new();
            manager.register(Arc::new(ChannelHandle::new("proxy", Box::new(channel))));
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
