//! Counters for protocol traffic, kept by the socket as messages pass
//! through it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ping,
    FindNode,
    FindValue,
    Store,
    /// Replies and error replies of any kind, in both directions.
    Response,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounters {
    /// Messages sent, counting each retransmission.
    pub sent: u64,
    /// Messages received from other nodes.
    pub received: u64,
    /// Requests that got no response after all retries.
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageCounters {
    pub ping: KindCounters,
    pub find_node: KindCounters,
    pub find_value: KindCounters,
    pub store: KindCounters,
    pub response: KindCounters,
}

impl MessageCounters {
    pub fn record_sent(&mut self, kind: MessageKind) {
        self.of_mut(kind).sent += 1;
    }

    pub fn record_received(&mut self, kind: MessageKind) {
        self.of_mut(kind).received += 1;
    }

    pub fn record_failed(&mut self, kind: MessageKind) {
        self.of_mut(kind).failed += 1;
    }

    pub fn of(&self, kind: MessageKind) -> &KindCounters {
        match kind {
            MessageKind::Ping => &self.ping,
            MessageKind::FindNode => &self.find_node,
            MessageKind::FindValue => &self.find_value,
            MessageKind::Store => &self.store,
            MessageKind::Response => &self.response,
        }
    }

    fn of_mut(&mut self, kind: MessageKind) -> &mut KindCounters {
        match kind {
            MessageKind::Ping => &mut self.ping,
            MessageKind::FindNode => &mut self.find_node,
            MessageKind::FindValue => &mut self.find_value,
            MessageKind::Store => &mut self.store,
            MessageKind::Response => &mut self.response,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_track_per_kind() {
        let mut counters = MessageCounters::default();

        counters.record_sent(MessageKind::Ping);
        counters.record_sent(MessageKind::Ping);
        counters.record_failed(MessageKind::Ping);
        counters.record_received(MessageKind::Store);
        counters.record_sent(MessageKind::Response);
        counters.record_received(MessageKind::Response);

        assert_eq!(counters.ping.sent, 2);
        assert_eq!(counters.ping.failed, 1);
        assert_eq!(counters.store.received, 1);
        assert_eq!(counters.response.sent, 1);
        assert_eq!(counters.response.received, 1);
        assert_eq!(counters.find_node, KindCounters::default());
    }
}
