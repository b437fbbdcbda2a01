use std::sync::Arc;

use tokio::sync::Notify;

/// Wakeup endpoint for out-of-thread producers.
///
/// The admin API (or any other producer) mutates the slot-map engine
/// under its lock and then signals here; the server's watcher task wakes
/// up and dispatches `PUSH` to every bank peer with pending queue work.
/// Signals coalesce, so spurious extra signals are a no-op on the wire.
/// This is the only cross-thread channel into the core.
#[derive(Clone, Default)]
pub struct Notifier(Arc<Notify>);

impl Notifier {
    pub fn signal(&self) {
        self.0.notify_one();
    }

    pub async fn notified(&self) {
        self.0.notified().await;
    }
}
