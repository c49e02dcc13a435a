use crate::error::RelayError;
use crate::metrics::{counters, gauges};
use crate::registry::{ClientRegistry, ClientSession};
use sharee_common::envelope::{Outbound, UserInfo};
use sharee_common::{ClientId, RoomId};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// A client left a room, explicitly or by switching rooms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// The room that was left.
    pub room_id: RoomId,
    /// `false` if the room became empty and was deleted.
    pub has_members: bool,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The room the client was in before, if any.
    pub previous: Option<Departure>,
    /// Members present before the joiner was added.
    pub existing: Vec<ClientId>,
}

/// Room → member-set table.
///
/// A single lock guards the whole table, and session `room_id` fields are
/// only written under it, so at every release each listed member's
/// `room_id` names the room it is listed in and no room is empty.
#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: Mutex<HashMap<RoomId, HashSet<ClientId>>>,
}

impl RoomTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RoomId, HashSet<ClientId>>> {
        self.rooms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Moves `client` into `room_id`, leaving its current room first.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidRoom`] for an empty room id; the table is
    /// not touched in that case.
    pub fn join(&self, client: &ClientSession, room_id: &str) -> Result<JoinOutcome, RelayError> {
        if room_id.is_empty() {
            return Err(RelayError::InvalidRoom);
        }
        let mut rooms = self.lock();
        let outcome = Self::attach(&mut rooms, client, room_id);
        gauges::set_rooms_active(rooms.len());
        Ok(outcome)
    }

    /// [`join`](Self::join), plus every notice the move produces, queued
    /// before the table lock is released: `user_left` to the old room,
    /// `existing_users` and `room_joined` to the joiner, `user_joined` to
    /// the new room.
    ///
    /// Two clients joining the same room at once therefore each see their
    /// own listing before any notice about the other, and never both.
    /// Queuing is `try_send`, so the lock never waits on a socket.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidRoom`] for an empty room id; nothing is
    /// sent in that case.
    pub fn enter(
        &self,
        registry: &ClientRegistry,
        client: &ClientSession,
        room_id: &str,
    ) -> Result<JoinOutcome, RelayError> {
        if room_id.is_empty() {
            return Err(RelayError::InvalidRoom);
        }
        let mut rooms = self.lock();
        let outcome = Self::attach(&mut rooms, client, room_id);

        if let Some(previous) = outcome.previous.as_ref().filter(|p| p.has_members) {
            if let Some(members) = rooms.get(&previous.room_id) {
                // Re-joining the same room lists the joiner here again.
                deliver(
                    registry,
                    &previous.room_id,
                    members.iter().filter(|id| id.as_str() != client.id()),
                    &Outbound::UserLeft {
                        id: client.id().to_string(),
                    },
                );
            }
        }

        let users: Vec<UserInfo> = outcome
            .existing
            .iter()
            .filter_map(|id| registry.lookup_by_identity(id))
            .map(|member| member.user_info())
            .collect();
        client.reply(&Outbound::ExistingUsers { users });
        client.reply(&Outbound::RoomJoined {
            room_id: room_id.to_string(),
            client_id: client.id().to_string(),
            id: client.id().to_string(),
            name: client.name().to_string(),
            avatar: client.avatar().to_string(),
            nat_type: client.nat_type(),
        });
        deliver(
            registry,
            room_id,
            &outcome.existing,
            &Outbound::UserJoined {
                id: client.id().to_string(),
                name: client.name().to_string(),
                avatar: client.avatar().to_string(),
            },
        );

        gauges::set_rooms_active(rooms.len());
        Ok(outcome)
    }

    /// Removes `client` from its room. `None` if it was not in one.
    pub fn leave(&self, client: &ClientSession) -> Option<Departure> {
        let mut rooms = self.lock();
        let departure = Self::detach(&mut rooms, client);
        gauges::set_rooms_active(rooms.len());
        departure
    }

    /// [`leave`](Self::leave), queuing `user_left` to the remaining members
    /// before the table lock is released.
    pub fn depart(&self, registry: &ClientRegistry, client: &ClientSession) -> Option<Departure> {
        let mut rooms = self.lock();
        let departure = Self::detach(&mut rooms, client);
        if let Some(left) = departure.as_ref().filter(|d| d.has_members) {
            if let Some(members) = rooms.get(&left.room_id) {
                deliver(
                    registry,
                    &left.room_id,
                    members,
                    &Outbound::UserLeft {
                        id: client.id().to_string(),
                    },
                );
            }
        }
        gauges::set_rooms_active(rooms.len());
        departure
    }

    fn attach(
        rooms: &mut HashMap<RoomId, HashSet<ClientId>>,
        client: &ClientSession,
        room_id: &str,
    ) -> JoinOutcome {
        let previous = Self::detach(rooms, client);
        let members = rooms.entry(room_id.to_string()).or_default();
        let existing = members.iter().cloned().collect();
        members.insert(client.id().to_string());
        client.set_room_id(Some(room_id.to_string()));
        JoinOutcome { previous, existing }
    }

    fn detach(
        rooms: &mut HashMap<RoomId, HashSet<ClientId>>,
        client: &ClientSession,
    ) -> Option<Departure> {
        let room_id = client.room_id()?;
        let has_members = match rooms.get_mut(&room_id) {
            Some(members) => {
                members.remove(client.id());
                if members.is_empty() {
                    rooms.remove(&room_id);
                    tracing::debug!(room_id = %room_id, "room is empty and removed");
                    false
                } else {
                    true
                }
            }
            None => false,
        };
        client.set_room_id(None);
        Some(Departure {
            room_id,
            has_members,
        })
    }

    /// Sends `frame` to every member of `room_id` except `exclude`.
    ///
    /// The recipient list is copied under the lock and the sends happen after
    /// it is released. A failed send is logged and skipped. Returns how many
    /// members the frame was queued for.
    pub fn broadcast(
        &self,
        registry: &ClientRegistry,
        room_id: &str,
        frame: &Outbound,
        exclude: Option<&str>,
    ) -> usize {
        let recipients: Vec<ClientId> = {
            let rooms = self.lock();
            match rooms.get(room_id) {
                Some(members) => members
                    .iter()
                    .filter(|id| Some(id.as_str()) != exclude)
                    .cloned()
                    .collect(),
                None => return 0,
            }
        };
        deliver(registry, room_id, &recipients, frame)
    }

    /// Members of `room_id`; empty if the room does not exist.
    #[must_use]
    pub fn members(&self, room_id: &str) -> Vec<ClientId> {
        self.lock()
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns `true` if the room exists.
    #[must_use]
    pub fn contains(&self, room_id: &str) -> bool {
        self.lock().contains_key(room_id)
    }

    /// Copy of the whole table.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<RoomId, HashSet<ClientId>> {
        self.lock().clone()
    }

    /// Number of rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if there are no rooms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Queues `frame` for each of `recipients`, skipping members that are gone
/// or failing. Returns how many it was queued for.
fn deliver<'a>(
    registry: &ClientRegistry,
    room_id: &str,
    recipients: impl IntoIterator<Item = &'a ClientId>,
    frame: &Outbound,
) -> usize {
    let mut recipients = recipients.into_iter().peekable();
    if recipients.peek().is_none() {
        return 0;
    }

    let text = match frame.encode() {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(kind = frame.kind(), error = %e, "failed to encode broadcast");
            return 0;
        }
    };

    let mut delivered = 0;
    for id in recipients {
        let Some(member) = registry.lookup_by_identity(id) else {
            tracing::debug!(client_id = %id, room_id, "room member no longer registered");
            continue;
        };
        if !member.is_open() {
            continue;
        }
        match member.send_text(text.clone()) {
            Ok(()) => delivered += 1,
            Err(reason) => {
                counters::delivery_failures_total(reason.as_str());
                tracing::warn!(
                    client_id = %id,
                    room_id,
                    kind = frame.kind(),
                    reason = reason.as_str(),
                    "failed to deliver broadcast to member"
                );
            }
        }
    }
    delivered
}
