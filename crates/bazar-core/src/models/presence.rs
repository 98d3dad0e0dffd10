/// Where a presence observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSource {
    /// Pushed over the live channel.
    Push,
    /// Periodic REST refresh.
    Poll,
}

/// Online/offline state of the other participant.
///
/// Two producers write here: push events from the live channel and the
/// periodic poller. Last writer wins by observation recency, except that
/// while the live channel is authoritative (connected), poll results are
/// ignored entirely rather than racing the push stream.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: bool,
    observed_at: i64,
    live_authoritative: bool,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_live_authoritative(&mut self, authoritative: bool) {
        self.live_authoritative = authoritative;
    }

    pub fn observe(&mut self, source: PresenceSource, online: bool, observed_at: i64) {
        if self.live_authoritative && source == PresenceSource::Poll {
            return;
        }
        if observed_at < self.observed_at {
            return;
        }
        self.online = online;
        self.observed_at = observed_at;
    }

    pub fn is_online(&self) -> bool {
        self.online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_is_ignored_while_channel_is_authoritative() {
        let mut tracker = PresenceTracker::new();
        tracker.set_live_authoritative(true);
        tracker.observe(PresenceSource::Push, true, 100);
        tracker.observe(PresenceSource::Poll, false, 200);
        assert!(tracker.is_online());
    }

    #[test]
    fn last_writer_wins_by_recency_when_not_authoritative() {
        let mut tracker = PresenceTracker::new();
        tracker.observe(PresenceSource::Poll, true, 100);
        tracker.observe(PresenceSource::Push, false, 50);
        assert!(tracker.is_online());
        tracker.observe(PresenceSource::Push, false, 150);
        assert!(!tracker.is_online());
    }
}
