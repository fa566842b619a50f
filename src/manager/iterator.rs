use super::ConnectionManager;
use crate::connection::Connection;
use crate::ids::ConnectionId;

/// Cursor over the manager's connections.
///
/// Set the match target with [`set_match_connection_id`](Self::set_match_connection_id),
/// then call [`begin`](Self::begin):
/// - an ordinary or self ID matches that one connection,
/// - [`ConnectionId::ALL`] matches every connection,
/// - [`ConnectionId::ALL_SERVERS`] matches every server connection,
/// - [`ConnectionId::ROOT_SERVER`] matches the first server connection only.
///
/// The cursor borrows the manager, so the table cannot change under it.
/// It also implements [`Iterator`] over the matching IDs.
#[derive(Debug)]
pub struct ConnectionIterator<'a> {
    manager: &'a ConnectionManager,
    match_id: ConnectionId,
    matches: Vec<ConnectionId>,
    position: usize,
    started: bool,
}

impl<'a> ConnectionIterator<'a> {
    pub(crate) fn new(manager: &'a ConnectionManager) -> Self {
        Self {
            manager,
            match_id: ConnectionId::ALL,
            matches: Vec::new(),
            position: 0,
            started: false,
        }
    }

    pub fn set_match_connection_id(&mut self, id: ConnectionId) {
        self.match_id = id;
        self.started = false;
        self.matches.clear();
        self.position = 0;
    }

    pub fn match_connection_id(&self) -> ConnectionId {
        self.match_id
    }

    /// Moves to the first matching connection.
    pub fn begin(&mut self) {
        let manager = self.manager;
        let ids = manager.connection_ids();
        self.matches = match self.match_id {
            ConnectionId::ALL => ids.collect(),
            ConnectionId::ALL_SERVERS => ids
                .filter(|&id| manager.is_server_connection(id))
                .collect(),
            ConnectionId::ROOT_SERVER => ids
                .filter(|&id| manager.is_server_connection(id))
                .take(1)
                .collect(),
            single => ids.filter(|&id| id == single).collect(),
        };
        self.position = 0;
        self.started = true;
    }

    pub fn is_at_end(&self) -> bool {
        self.position >= self.matches.len()
    }

    /// Moves to the next matching connection.
    pub fn advance(&mut self) {
        if !self.is_at_end() {
            self.position += 1;
        }
    }

    pub fn current_connection(&self) -> Option<&'a Connection> {
        self.matches
            .get(self.position)
            .and_then(|&id| self.manager.connection(id))
    }

    /// ID of the current connection, [`ConnectionId::NULL`] at the end.
    pub fn current_connection_id(&self) -> ConnectionId {
        self.matches
            .get(self.position)
            .copied()
            .unwrap_or(ConnectionId::NULL)
    }
}

impl Iterator for ConnectionIterator<'_> {
    type Item = ConnectionId;

    fn next(&mut self) -> Option<ConnectionId> {
        if !self.started {
            self.begin();
        }
        if self.is_at_end() {
            return None;
        }
        let id = self.current_connection_id();
        self.advance();
        Some(id)
    }
}
