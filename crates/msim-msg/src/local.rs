//! In-process transport: `size` connected endpoints, one per rank.
//!
//! ```text
//!   rank 0 ──┐                       ┌── mailbox[(from, tag)] ── try_receive
//!   rank 1 ──┼── unbounded mpsc ──► rank k
//!   rank 2 ──┘                       └── FIFO per (from, tag)
//! ```
//!
//! Each endpoint owns one inbound channel. Incoming envelopes are drained
//! into a per-(sender, tag) queue on every receive attempt, so a receive for
//! one tag never loses messages of another.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use msim_types::config::DEFAULT_POLL_INTERVAL;
use msim_types::Rank;

use crate::error::{MsgError, Result};
use crate::tags::Tag;
use crate::transport::{BroadcastScope, GroupLayout, Transport};

struct Envelope {
    from: Rank,
    tag: Tag,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Inbox {
    queues: HashMap<(Rank, Tag), VecDeque<Vec<u8>>>,
}

// ── LocalWorld ────────────────────────────────────────────────────────────────

/// Factory of connected [`LocalEndpoint`]s.
pub struct LocalWorld;

impl LocalWorld {
    /// Build `size` endpoints; element `k` is rank `k`.
    pub fn new(size: usize) -> Vec<LocalEndpoint> {
        Self::with_probe_interval(size, DEFAULT_POLL_INTERVAL)
    }

    /// Same as [`LocalWorld::new`] with a custom sleep between receive probes.
    pub fn with_probe_interval(size: usize, probe_interval: Duration) -> Vec<LocalEndpoint> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel::<Envelope>()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| LocalEndpoint {
                rank,
                peers: senders.clone(),
                rx: Mutex::new(rx),
                inbox: Mutex::new(Inbox::default()),
                groups: Mutex::new(None),
                probe_interval,
                sent: AtomicU64::new(0),
            })
            .collect()
    }
}

// ── LocalEndpoint ─────────────────────────────────────────────────────────────

pub struct LocalEndpoint {
    rank: Rank,
    peers: Vec<UnboundedSender<Envelope>>,
    rx: Mutex<UnboundedReceiver<Envelope>>,
    inbox: Mutex<Inbox>,
    groups: Mutex<Option<GroupLayout>>,
    probe_interval: Duration,
    sent: AtomicU64,
}

impl LocalEndpoint {
    /// Number of messages sent by this endpoint so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank >= self.peers.len() {
            return Err(MsgError::InvalidRank { rank, world_size: self.peers.len() });
        }
        Ok(())
    }

    fn layout(&self) -> Result<GroupLayout> {
        self.groups
            .lock()
            .map_err(|_| MsgError::Group("group layout lock poisoned".into()))?
            .ok_or(MsgError::NoGroups)
    }

    /// Move everything waiting in the channel into the per-(sender, tag) queues.
    fn drain(&self, inbox: &mut Inbox) -> Result<()> {
        let mut rx = self.rx.lock().map_err(|_| MsgError::Disconnected(self.rank))?;
        loop {
            match rx.try_recv() {
                Ok(env) => inbox.queues.entry((env.from, env.tag)).or_default().push_back(env.payload),
                // Every endpoint keeps a sender to itself, so the channel
                // only disconnects while the endpoint is being dropped.
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }
}

impl Transport for LocalEndpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.peers.len()
    }

    fn create_groups(&self, group_size: usize, group_count: usize) -> Result<()> {
        let layout = GroupLayout::new(group_size, group_count, self.world_size())?;
        *self
            .groups
            .lock()
            .map_err(|_| MsgError::Group("group layout lock poisoned".into()))? = Some(layout);
        debug!(rank = self.rank, group_size, group_count, "groups created");
        Ok(())
    }

    fn send(&self, to: Rank, tag: Tag, payload: Vec<u8>) -> Result<()> {
        self.check_rank(to)?;
        trace!(from = self.rank, to, tag, bytes = payload.len(), "send");
        self.peers[to]
            .send(Envelope { from: self.rank, tag, payload })
            .map_err(|_| MsgError::Disconnected(to))?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn wait_send_all(&self) -> Result<()> {
        // Unbounded channels complete a send as soon as it is queued.
        Ok(())
    }

    fn try_receive(&self, from: Rank, tag: Tag) -> Result<Option<Vec<u8>>> {
        self.check_rank(from)?;
        let mut inbox = self.inbox.lock().map_err(|_| MsgError::Disconnected(self.rank))?;
        self.drain(&mut inbox)?;
        Ok(inbox.queues.get_mut(&(from, tag)).and_then(VecDeque::pop_front))
    }

    fn receive(&self, from: Rank, tag: Tag) -> Result<Vec<u8>> {
        loop {
            if let Some(payload) = self.try_receive(from, tag)? {
                return Ok(payload);
            }
            std::thread::sleep(self.probe_interval);
        }
    }

    fn broadcast(&self, scope: BroadcastScope, tag: Tag, payload: Option<Vec<u8>>) -> Result<Vec<u8>> {
        match payload {
            Some(payload) if self.is_root() => {
                let ranks = match scope {
                    BroadcastScope::All if self.world_size() > 1 => self.layout()?.ranks(scope),
                    BroadcastScope::All => 0..0,
                    BroadcastScope::Group(_) => self.layout()?.ranks(scope),
                };
                for to in ranks {
                    self.send(to, tag, payload.clone())?;
                }
                Ok(payload)
            }
            None if !self.is_root() => self.receive(msim_types::ROOT_RANK, tag),
            _ => Err(MsgError::BroadcastPayload),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::MsgTag;
    use crate::transport::TransportExt;

    fn world(size: usize) -> Vec<LocalEndpoint> {
        LocalWorld::with_probe_interval(size, Duration::from_millis(1))
    }

    #[test]
    fn fifo_per_sender_and_tag() {
        let w = world(3);
        w[1].send(0, 7, vec![1]).unwrap();
        w[2].send(0, 7, vec![20]).unwrap();
        w[1].send(0, 8, vec![9]).unwrap();
        w[1].send(0, 7, vec![2]).unwrap();

        assert_eq!(w[0].try_receive(1, 7).unwrap(), Some(vec![1]));
        assert_eq!(w[0].try_receive(1, 7).unwrap(), Some(vec![2]));
        assert_eq!(w[0].try_receive(1, 7).unwrap(), None);
        assert_eq!(w[0].try_receive(1, 8).unwrap(), Some(vec![9]));
        assert_eq!(w[0].try_receive(2, 7).unwrap(), Some(vec![20]));
    }

    #[test]
    fn invalid_rank_is_rejected() {
        let w = world(2);
        assert!(matches!(w[0].send(5, 1, vec![]), Err(MsgError::InvalidRank { rank: 5, .. })));
    }

    #[test]
    fn group_broadcast_reaches_only_the_group() {
        let w = world(7);
        w[0].create_groups(3, 2).unwrap();
        w[0].broadcast_value(BroadcastScope::Group(2), MsgTag::RunAssignment, Some(42u32)).unwrap();

        for child in &w[1..4] {
            assert_eq!(child.try_receive(0, MsgTag::RunAssignment.tag()).unwrap(), None);
        }
        for child in &w[4..7] {
            let got: u32 = child.broadcast_value(BroadcastScope::Group(2), MsgTag::RunAssignment, None).unwrap();
            assert_eq!(got, 42);
        }
    }

    #[test]
    fn broadcast_requires_groups_and_payload_at_root() {
        let w = world(3);
        assert!(matches!(
            w[0].broadcast(BroadcastScope::All, 2, Some(vec![1])),
            Err(MsgError::NoGroups)
        ));
        assert!(matches!(
            w[0].broadcast(BroadcastScope::All, 2, None),
            Err(MsgError::BroadcastPayload)
        ));
        assert!(matches!(
            w[1].broadcast(BroadcastScope::All, 2, Some(vec![1])),
            Err(MsgError::BroadcastPayload)
        ));
    }

    #[test]
    fn blocking_receive_across_threads() {
        let mut w = world(2);
        let child = w.pop().unwrap();
        let root = w.pop().unwrap();

        let handle = std::thread::spawn(move || child.receive_value::<String>(0, MsgTag::Status).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        root.send_value(1, MsgTag::Status, "hello").unwrap();
        assert_eq!(handle.join().unwrap(), "hello");
    }
}
