//! Change-event fan-out to subscriber pipes.

use log::warn;
use zerocopy::IntoBytes;

use crate::store::SubscriberSet;
use crate::wire::NotificationFrame;

/// Pushes fixed-width change frames to every subscriber of a mutated key.
///
/// Delivery is best-effort: a broken or closed sink is logged and skipped,
/// never propagated to the mutating operation. Per-sink ordering follows the
/// commit order on the key because update fan-out runs under the entry's
/// bucket lock and a single thread completes the fan-out for one mutation.
#[derive(Debug, Default)]
pub struct Notifier;

impl Notifier {
    /// Creates a notifier.
    pub fn new() -> Notifier {
        Notifier
    }

    /// Announces that `key` now holds `value`.
    pub fn publish_update(&self, subscribers: &SubscriberSet, key: &str, value: &str) {
        self.fan_out(subscribers, &NotificationFrame::update(key, value));
    }

    /// Announces that `key` was removed. The caller passes the subscriber set
    /// it took ownership of when it removed the entry.
    pub fn publish_delete(&self, subscribers: &SubscriberSet, key: &str) {
        self.fan_out(subscribers, &NotificationFrame::deleted(key));
    }

    fn fan_out(&self, subscribers: &SubscriberSet, frame: &NotificationFrame) {
        for sink in subscribers {
            if let Err(err) = sink.write_all(frame.as_bytes()) {
                warn!("failed to write notification to sink {}: {}", sink.id(), err);
            }
        }
    }
}
