//! Identifiers, sequence numbers, and callback signatures

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Site identifier, unique per participating process. Zero is a valid id.
pub type SiteId = u32;

/// Per-peer message sequence number.
///
/// A dedicated variant stands in for "nothing sent yet" rather than a
/// `u64::MAX` sentinel, keeping the comparisons exhaustive: `NeverSent`
/// orders below `Sent(0)` and `next()` makes the first sequence number `0`
/// without any wrap-around arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SeqNo {
    NeverSent,
    Sent(u64),
}

impl SeqNo {
    /// The sequence number of the next message after this one.
    pub fn next(self) -> u64 {
        match self {
            SeqNo::NeverSent => 0,
            SeqNo::Sent(n) => n + 1,
        }
    }

    /// How many messages this position has consumed past `frontier`.
    ///
    /// The send loop uses this as the peer's index into the shared buffer:
    /// a peer at the frontier has offset 0 and is due the head node. The
    /// frontier never runs ahead of a peer, so the `NeverSent` position can
    /// only pair with a `NeverSent` frontier.
    pub fn offset_from(self, frontier: SeqNo) -> u64 {
        match (self, frontier) {
            (SeqNo::NeverSent, _) => 0,
            (SeqNo::Sent(a), SeqNo::NeverSent) => a + 1,
            (SeqNo::Sent(a), SeqNo::Sent(b)) => a.saturating_sub(b),
        }
    }

    /// Encoding for an `AtomicU64` cell: 0 is `NeverSent`, n+1 is `Sent(n)`.
    pub fn to_raw(self) -> u64 {
        match self {
            SeqNo::NeverSent => 0,
            SeqNo::Sent(n) => n + 1,
        }
    }

    pub fn from_raw(raw: u64) -> Self {
        match raw {
            0 => SeqNo::NeverSent,
            n => SeqNo::Sent(n - 1),
        }
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeqNo::NeverSent => write!(f, "never-sent"),
            SeqNo::Sent(n) => write!(f, "{n}"),
        }
    }
}

/// Invoked by a server worker for every received message, synchronously,
/// before the ack is written back.
pub type RemoteMessageCallback = Arc<dyn Fn(SiteId, &[u8]) + Send + Sync>;

/// Invoked by the predicate loop with a snapshot of the per-site ack
/// counters whenever the ack vector advances.
pub type PredicateFn = Arc<dyn Fn(&HashMap<SiteId, u64>) + Send + Sync>;

/// Invoked by the ack-receive loop after each counted ack.
pub type ReportAckFn = Arc<dyn Fn() + Send + Sync>;

/// Invoked once when a core finishes its startup phase.
pub type ReadyNotifier = Arc<dyn Fn() + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_sent_orders_below_zero() {
        assert!(SeqNo::NeverSent < SeqNo::Sent(0));
        assert!(SeqNo::Sent(0) < SeqNo::Sent(1));
        assert_eq!(
            [SeqNo::Sent(3), SeqNo::NeverSent, SeqNo::Sent(0)]
                .iter()
                .min(),
            Some(&SeqNo::NeverSent)
        );
    }

    #[test]
    fn test_next_starts_at_zero() {
        assert_eq!(SeqNo::NeverSent.next(), 0);
        assert_eq!(SeqNo::Sent(0).next(), 1);
        assert_eq!(SeqNo::Sent(41).next(), 42);
    }

    #[test]
    fn test_offset_from_frontier() {
        // Bootstrap: nothing sent anywhere.
        assert_eq!(SeqNo::NeverSent.offset_from(SeqNo::NeverSent), 0);
        // Peer has consumed messages 0..=2, frontier still unset.
        assert_eq!(SeqNo::Sent(2).offset_from(SeqNo::NeverSent), 3);
        // Peer level with the frontier is due the head node.
        assert_eq!(SeqNo::Sent(5).offset_from(SeqNo::Sent(5)), 0);
        assert_eq!(SeqNo::Sent(7).offset_from(SeqNo::Sent(5)), 2);
    }

    #[test]
    fn test_raw_round_trip() {
        for seq in [SeqNo::NeverSent, SeqNo::Sent(0), SeqNo::Sent(u32::MAX as u64)] {
            assert_eq!(SeqNo::from_raw(seq.to_raw()), seq);
        }
    }
}
