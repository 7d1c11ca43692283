// Rooms group channels for room-scoped fan-out.
// Members form an intrusive doubly linked list keyed by channel id, newest
// member at the head. A room that loses its last member is dropped for good;
// the owning bucket removes it from its table and later joins create a new one.
use crate::channel::{Channel, ChannelId};
use crate::{HubError, Result};
use ahash::RandomState;
use courier_wire::Proto;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

#[derive(Debug)]
struct Link {
    channel: Arc<Channel>,
    prev: Option<ChannelId>,
    next: Option<ChannelId>,
}

#[derive(Debug)]
struct Members {
    head: Option<ChannelId>,
    links: HashMap<ChannelId, Link, RandomState>,
    online: i32,
    dropped: bool,
}

#[derive(Debug)]
pub struct Room {
    id: String,
    members: Mutex<Members>,
    // Cluster-wide count reported by the logic tier; zero until first refresh.
    all_online: AtomicI32,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: Mutex::new(Members {
                head: None,
                links: HashMap::with_hasher(RandomState::new()),
                online: 0,
                dropped: false,
            }),
            all_online: AtomicI32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adds a channel at the head of the member list.
    pub fn join(&self, channel: &Arc<Channel>) -> Result<()> {
        let mut members = self.members.lock();
        if members.dropped {
            return Err(HubError::RoomDropped(self.id.clone()));
        }
        let id = channel.id();
        if members.links.contains_key(&id) {
            return Ok(());
        }
        let old_head = members.head;
        if let Some(old_head) = old_head
            && let Some(link) = members.links.get_mut(&old_head)
        {
            link.prev = Some(id);
        }
        members.links.insert(
            id,
            Link {
                channel: Arc::clone(channel),
                prev: None,
                next: old_head,
            },
        );
        members.head = Some(id);
        members.online += 1;
        Ok(())
    }

    /// Unlinks a channel. Returns true when the room is now empty and dropped.
    pub fn leave(&self, channel: &Channel) -> bool {
        let mut members = self.members.lock();
        if let Some(link) = members.links.remove(&channel.id()) {
            match link.prev {
                Some(prev) => {
                    if let Some(prev_link) = members.links.get_mut(&prev) {
                        prev_link.next = link.next;
                    }
                }
                None => members.head = link.next,
            }
            if let Some(next) = link.next
                && let Some(next_link) = members.links.get_mut(&next)
            {
                next_link.prev = link.prev;
            }
            members.online -= 1;
        }
        members.dropped = members.online == 0;
        members.dropped
    }

    /// Pushes a frame to every member; returns how many queues accepted it.
    pub fn push(&self, proto: &Proto) -> usize {
        let members = self.members.lock();
        let mut delivered = 0;
        let mut cursor = members.head;
        while let Some(id) = cursor {
            let Some(link) = members.links.get(&id) else {
                break;
            };
            if link.channel.push(proto.clone()).is_ok() {
                delivered += 1;
            }
            cursor = link.next;
        }
        delivered
    }

    /// Sends the finish signal to every remaining member.
    pub fn close(&self) {
        let members = self.members.lock();
        for link in members.links.values() {
            link.channel.signal_close();
        }
    }

    /// Online count reported to clients: the cluster-wide figure when known,
    /// otherwise the local member count.
    pub fn online_count(&self) -> i32 {
        let all = self.all_online.load(Ordering::Relaxed);
        if all > 0 { all } else { self.local_online() }
    }

    pub fn local_online(&self) -> i32 {
        self.members.lock().online
    }

    pub fn set_all_online(&self, count: i32) {
        self.all_online.store(count, Ordering::Relaxed);
    }

    pub fn is_dropped(&self) -> bool {
        self.members.lock().dropped
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.members.lock().links.contains_key(&id)
    }

    /// Member ids walking the list from the head (newest first).
    pub fn member_ids(&self) -> Vec<ChannelId> {
        let members = self.members.lock();
        let mut ids = Vec::with_capacity(members.links.len());
        let mut cursor = members.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = members.links.get(&id).and_then(|link| link.next);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Identity, Signal};
    use bytes::Bytes;
    use courier_wire::op;

    fn channel(key: &str) -> (Arc<Channel>, crate::ChannelReceiver) {
        Channel::new(
            Identity {
                key: key.to_string(),
                mid: 1,
                ip: "127.0.0.1".to_string(),
            },
            4,
        )
    }

    #[test]
    fn join_links_newest_first() {
        let room = Room::new("live://1");
        let (a, _ra) = channel("a");
        let (b, _rb) = channel("b");
        let (c, _rc) = channel("c");
        room.join(&a).expect("a");
        room.join(&b).expect("b");
        room.join(&c).expect("c");
        assert_eq!(room.member_ids(), vec![c.id(), b.id(), a.id()]);
        assert_eq!(room.local_online(), 3);
    }

    #[test]
    fn joining_twice_counts_once() {
        let room = Room::new("r");
        let (a, _ra) = channel("a");
        room.join(&a).expect("first");
        room.join(&a).expect("second");
        assert_eq!(room.local_online(), 1);
        assert_eq!(room.member_ids(), vec![a.id()]);
    }

    #[test]
    fn leave_relinks_neighbours() {
        let room = Room::new("r");
        let (a, _ra) = channel("a");
        let (b, _rb) = channel("b");
        let (c, _rc) = channel("c");
        for ch in [&a, &b, &c] {
            room.join(ch).expect("join");
        }

        assert!(!room.leave(&b));
        assert_eq!(room.member_ids(), vec![c.id(), a.id()]);
        assert!(!room.leave(&c));
        assert_eq!(room.member_ids(), vec![a.id()]);
        assert!(room.leave(&a));
        assert!(room.member_ids().is_empty());
        assert!(room.is_dropped());
    }

    #[test]
    fn dropped_room_refuses_joins() {
        let room = Room::new("r");
        let (a, _ra) = channel("a");
        let (b, _rb) = channel("b");
        room.join(&a).expect("join");
        assert!(room.leave(&a));
        assert_eq!(room.join(&b), Err(HubError::RoomDropped("r".to_string())));
        assert_eq!(room.local_online(), 0);
    }

    #[test]
    fn leaving_a_non_member_keeps_count() {
        let room = Room::new("r");
        let (a, _ra) = channel("a");
        let (b, _rb) = channel("b");
        room.join(&a).expect("join");
        assert!(!room.leave(&b));
        assert_eq!(room.local_online(), 1);
    }

    #[tokio::test]
    async fn push_reaches_every_member() {
        let room = Room::new("r");
        let (a, mut ra) = channel("a");
        let (b, mut rb) = channel("b");
        room.join(&a).expect("a");
        room.join(&b).expect("b");

        let proto = Proto::new(op::RAW, 0, Bytes::from_static(b"hi"));
        assert_eq!(room.push(&proto), 2);
        assert_eq!(ra.ready().await, Signal::Proto(proto.clone()));
        assert_eq!(rb.ready().await, Signal::Proto(proto));
    }

    #[tokio::test]
    async fn close_finishes_members() {
        let room = Room::new("r");
        let (a, mut ra) = channel("a");
        room.join(&a).expect("a");
        room.close();
        assert!(a.is_closed());
        assert_eq!(ra.ready().await, Signal::Finish);
    }

    #[test]
    fn online_count_prefers_cluster_total() {
        let room = Room::new("r");
        let (a, _ra) = channel("a");
        room.join(&a).expect("a");
        assert_eq!(room.online_count(), 1);
        room.set_all_online(40);
        assert_eq!(room.online_count(), 40);
        room.set_all_online(0);
        assert_eq!(room.online_count(), 1);
    }
}
