//! The server-side room registry: a forward index (room name → channels) and
//! a reverse index (channel → room names) maintained in lockstep under a
//! single lock.
//!
//! Invariant: `C ∈ channels[r]` iff `r ∈ rooms[C]`. A room whose member set
//! becomes empty is dropped from the forward index.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::channel::Channel;

#[derive(Default)]
struct Indexes {
    channels: HashMap<String, HashSet<Arc<Channel>>>,
    rooms: HashMap<Arc<Channel>, HashSet<String>>,
}

#[derive(Default)]
pub(crate) struct Rooms {
    inner: RwLock<Indexes>,
}

impl Rooms {
    pub(crate) fn join(&self, room: &str, channel: &Arc<Channel>) {
        let mut inner = self.inner.write().unwrap();
        inner
            .channels
            .entry(room.to_owned())
            .or_default()
            .insert(channel.clone());
        inner
            .rooms
            .entry(channel.clone())
            .or_default()
            .insert(room.to_owned());
    }

    pub(crate) fn leave(&self, room: &str, channel: &Arc<Channel>) {
        let mut inner = self.inner.write().unwrap();
        let emptied = inner
            .channels
            .get_mut(room)
            .map(|members| {
                members.remove(channel.as_ref());
                members.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            inner.channels.remove(room);
        }
        if let Some(joined) = inner.rooms.get_mut(channel.as_ref()) {
            joined.remove(room);
        }
    }

    /// Disconnection cleanup: remove the channel from every room it belongs
    /// to and drop its reverse entry.
    pub(crate) fn leave_all(&self, channel: &Arc<Channel>) {
        let mut inner = self.inner.write().unwrap();
        let Some(joined) = inner.rooms.remove(channel.as_ref()) else {
            return;
        };
        for room in joined {
            let emptied = inner
                .channels
                .get_mut(&room)
                .map(|members| {
                    members.remove(channel.as_ref());
                    members.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                inner.channels.remove(&room);
            }
        }
    }

    /// Snapshot of the members of `room`.
    pub(crate) fn list(&self, room: &str) -> Vec<Arc<Channel>> {
        self.inner
            .read()
            .unwrap()
            .channels
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn amount(&self, room: &str) -> usize {
        self.inner
            .read()
            .unwrap()
            .channels
            .get(room)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Number of rooms with at least one member.
    pub(crate) fn count(&self) -> usize {
        self.inner.read().unwrap().channels.len()
    }

    #[cfg(test)]
    fn invariant_holds(&self) -> bool {
        let inner = self.inner.read().unwrap();
        let forward = inner.channels.iter().all(|(room, members)| {
            members.iter().all(|c| {
                inner
                    .rooms
                    .get(c.as_ref())
                    .is_some_and(|joined| joined.contains(room))
            })
        });
        let reverse = inner.rooms.iter().all(|(c, joined)| {
            joined.iter().all(|room| {
                inner
                    .channels
                    .get(room)
                    .is_some_and(|members| members.contains(c.as_ref()))
            })
        });
        forward && reverse
    }
}
