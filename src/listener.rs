use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::RwLock;
use tracing::debug;
use crate::engine_stream::PacketEngineStream;

/// Callbacks from the engine for channels opened by peers and for channels that go away
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketEngineListener: Send + Sync + 'static {
    /// A peer wants to open a channel - returning false rejects it
    async fn accept_channel(&self, peer_addr: SocketAddr, channel_id: u32) -> bool;

    /// An inbound channel was accepted and is open
    async fn on_channel_open(&self, stream: PacketEngineStream);

    async fn on_channel_closed(&self, channel_id: u32);
}


/// Holder for the engine's current listener.
///
/// Callbacks run while holding a read guard, so replacing (or removing) the listener waits
///  until all callbacks that are in progress have returned. After [ProtectedListener::set]
///  returns, the previous listener is not called any more.
#[derive(Default)]
pub struct ProtectedListener {
    inner: RwLock<Option<Arc<dyn PacketEngineListener>>>,
}

impl ProtectedListener {
    pub async fn set(&self, listener: Option<Arc<dyn PacketEngineListener>>) {
        let mut inner = self.inner.write().await;
        debug!("replacing packet engine listener (present: {} -> {})", inner.is_some(), listener.is_some());
        *inner = listener;
    }

    /// Returns `None` if no listener is registered
    pub async fn accept_channel(&self, peer_addr: SocketAddr, channel_id: u32) -> Option<bool> {
        match self.inner.read().await.as_ref() {
            Some(listener) => Some(listener.accept_channel(peer_addr, channel_id).await),
            None => None,
        }
    }

    pub async fn on_channel_open(&self, stream: PacketEngineStream) {
        if let Some(listener) = self.inner.read().await.as_ref() {
            listener.on_channel_open(stream).await;
        }
    }

    pub async fn on_channel_closed(&self, channel_id: u32) {
        if let Some(listener) = self.inner.read().await.as_ref() {
            listener.on_channel_closed(channel_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use mockall::predicate::eq;
    use tokio::sync::Notify;

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 5000))
    }

    #[tokio::test]
    async fn test_no_listener() {
        let protected = ProtectedListener::default();
        assert_eq!(protected.accept_channel(peer(), 1).await, None);
        protected.on_channel_closed(1).await;
    }

    #[tokio::test]
    async fn test_delegates_to_listener() {
        let mut listener = MockPacketEngineListener::new();
        listener.expect_accept_channel()
            .with(eq(peer()), eq(17))
            .once()
            .return_const(true);
        listener.expect_on_channel_closed()
            .with(eq(17))
            .once()
            .return_const(());

        let protected = ProtectedListener::default();
        protected.set(Some(Arc::new(listener))).await;

        assert_eq!(protected.accept_channel(peer(), 17).await, Some(true));
        protected.on_channel_closed(17).await;
    }

    struct SlowListener {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PacketEngineListener for SlowListener {
        async fn accept_channel(&self, _peer_addr: SocketAddr, _channel_id: u32) -> bool {
            self.entered.notify_one();
            self.release.notified().await;
            true
        }
        async fn on_channel_open(&self, _stream: PacketEngineStream) {}
        async fn on_channel_closed(&self, _channel_id: u32) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_waits_for_callbacks_in_progress() {
        let slow = Arc::new(SlowListener { entered: Notify::new(), release: Notify::new() });
        let protected = Arc::new(ProtectedListener::default());
        protected.set(Some(slow.clone() as Arc<dyn PacketEngineListener>)).await;

        let p2 = protected.clone();
        let callback = tokio::spawn(async move {
            p2.accept_channel(peer(), 1).await
        });
        slow.entered.notified().await;

        let p3 = protected.clone();
        let replace = tokio::spawn(async move {
            p3.set(None).await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!replace.is_finished());

        slow.release.notify_one();
        assert_eq!(callback.await.unwrap(), Some(true));
        replace.await.unwrap();
        assert_eq!(protected.accept_channel(peer(), 1).await, None);
    }
}
