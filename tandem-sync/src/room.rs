//! Room membership keyed by document id.
//!
//! Joining is deferred, not queued: while the channel is not ready nothing is
//! emitted, and the join for the *current* document is issued once the
//! channel becomes available.

use crate::protocol::ClientEvent;

#[derive(Debug, Default)]
pub struct RoomMembership {
    /// Document the editor is showing.
    document: Option<String>,
    /// Room we have actually joined on the current channel.
    joined: Option<String>,
    ready: bool,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount or switch to `document`. An empty id unmounts.
    pub fn set_document(&mut self, document: Option<&str>) -> Vec<ClientEvent> {
        let document = document.filter(|d| !d.is_empty()).map(str::to_owned);
        let mut events = Vec::new();

        if self.joined.is_some() && self.joined != document {
            if let Some(room_id) = self.joined.take() {
                log::info!("leaving room {room_id}");
                events.push(ClientEvent::LeaveRoom { room_id });
            }
        }
        self.document = document;
        events.extend(self.join_if_ready());
        events
    }

    /// Channel became usable; issue the deferred join.
    pub fn connection_ready(&mut self) -> Vec<ClientEvent> {
        self.ready = true;
        self.join_if_ready().into_iter().collect()
    }

    /// Channel went away; the server dropped our membership with it.
    pub fn connection_lost(&mut self) {
        self.ready = false;
        self.joined = None;
    }

    pub fn unmount(&mut self) -> Vec<ClientEvent> {
        self.set_document(None)
    }

    fn join_if_ready(&mut self) -> Option<ClientEvent> {
        if !self.ready || self.joined.is_some() {
            return None;
        }
        let room_id = self.document.clone()?;
        log::info!("joining room {room_id}");
        self.joined = Some(room_id.clone());
        Some(ClientEvent::JoinRoom { room_id })
    }

    pub fn document(&self) -> Option<&str> {
        self.document.as_deref()
    }

    pub fn joined(&self) -> Option<&str> {
        self.joined.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(id: &str) -> ClientEvent {
        ClientEvent::JoinRoom { room_id: id.into() }
    }

    fn leave(id: &str) -> ClientEvent {
        ClientEvent::LeaveRoom { room_id: id.into() }
    }

    #[test]
    fn test_join_on_mount_when_ready() {
        let mut room = RoomMembership::new();
        assert!(room.connection_ready().is_empty());
        assert_eq!(room.set_document(Some("doc-1")), vec![join("doc-1")]);
        assert_eq!(room.joined(), Some("doc-1"));
    }

    #[test]
    fn test_join_deferred_until_ready() {
        let mut room = RoomMembership::new();
        assert!(room.set_document(Some("doc-1")).is_empty());
        assert_eq!(room.connection_ready(), vec![join("doc-1")]);
    }

    #[test]
    fn test_deferred_join_uses_latest_document() {
        let mut room = RoomMembership::new();
        room.set_document(Some("a"));
        room.set_document(Some("b"));
        assert_eq!(room.connection_ready(), vec![join("b")]);
    }

    #[test]
    fn test_switch_leaves_before_joining() {
        let mut room = RoomMembership::new();
        room.connection_ready();
        room.set_document(Some("a"));
        assert_eq!(room.set_document(Some("b")), vec![leave("a"), join("b")]);
    }

    #[test]
    fn test_empty_id_does_not_join() {
        let mut room = RoomMembership::new();
        room.connection_ready();
        assert!(room.set_document(Some("")).is_empty());
        assert_eq!(room.document(), None);
    }

    #[test]
    fn test_unmount_leaves() {
        let mut room = RoomMembership::new();
        room.connection_ready();
        room.set_document(Some("a"));
        assert_eq!(room.unmount(), vec![leave("a")]);
        assert!(room.unmount().is_empty());
    }

    #[test]
    fn test_rejoin_after_reconnect() {
        let mut room = RoomMembership::new();
        room.connection_ready();
        room.set_document(Some("a"));
        room.connection_lost();
        assert_eq!(room.joined(), None);
        assert_eq!(room.connection_ready(), vec![join("a")]);
    }

    #[test]
    fn test_same_document_is_noop() {
        let mut room = RoomMembership::new();
        room.connection_ready();
        room.set_document(Some("a"));
        assert!(room.set_document(Some("a")).is_empty());
    }
}
