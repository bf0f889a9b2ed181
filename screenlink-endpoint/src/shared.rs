// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Connection bookkeeping shared by the client and server endpoints.
//!
//! All methods are pure table manipulation: they mutate state and return
//! what the caller should notify, never invoking callbacks themselves.
//! That keeps every observer and request callback outside any interior
//! borrow.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use screenlink_common::{InstanceId, ProtocolConnectionId, RequestId};
use screenlink_quic::{ConnectionId, QuicSession, StreamManager};
use tracing::debug;

use crate::RequestCallback;

/// An admitted QUIC connection and its stream table.
pub(crate) struct ServiceConnectionData {
    pub(crate) session: Rc<dyn QuicSession>,
    pub(crate) manager: Rc<RefCell<StreamManager>>,
}

impl ServiceConnectionData {
    pub(crate) fn new(session: Rc<dyn QuicSession>, instance_name: impl Into<String>) -> Self {
        Self {
            session,
            manager: Rc::new(RefCell::new(StreamManager::new(instance_name))),
        }
    }
}

/// A connection awaiting its crypto handshake plus the connect requests
/// waiting on it (client side; servers keep the list empty).
pub(crate) struct PendingConnectionData {
    pub(crate) data: ServiceConnectionData,
    pub(crate) callbacks: Vec<(RequestId, RequestCallback)>,
}

/// Where a live transport connection currently lives in the tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnKey {
    Pending(String),
    Established(InstanceId),
}

/// Everything a promotion produces; the caller resolves the waiters.
pub(crate) struct PromotedConnection {
    pub(crate) instance_name: String,
    pub(crate) instance_id: InstanceId,
    pub(crate) session: Rc<dyn QuicSession>,
    pub(crate) manager: Rc<RefCell<StreamManager>>,
    pub(crate) callbacks: Vec<(RequestId, RequestCallback)>,
}

/// EOFs to deliver after a cleanup pass.
pub(crate) struct CleanupActions {
    pub(crate) eofs: Vec<(InstanceId, ProtocolConnectionId)>,
}

/// What `stop()` tears down; the caller fails the waiters.
pub(crate) struct ClosedEndpointState {
    pub(crate) failed_waiters: Vec<(RequestId, RequestCallback)>,
}

#[derive(Default)]
pub(crate) struct ConnectionTable {
    pub(crate) pending: HashMap<String, PendingConnectionData>,
    pub(crate) connections: HashMap<InstanceId, ServiceConnectionData>,
    /// Instance name → id, filled at promotion. Callers are insulated
    /// from post-handshake identity changes by using the id from then on.
    pub(crate) instance_map: HashMap<String, InstanceId>,
    conn_keys: HashMap<ConnectionId, ConnKey>,
    next_instance_id: InstanceId,
    pub(crate) delete_connections: Vec<InstanceId>,
}

impl ConnectionTable {
    pub(crate) fn new() -> Self {
        Self {
            next_instance_id: 1,
            ..Default::default()
        }
    }

    /// Records a connection awaiting its handshake under `instance_name`.
    pub(crate) fn insert_pending(
        &mut self,
        instance_name: &str,
        connection_id: ConnectionId,
        entry: PendingConnectionData,
    ) {
        self.conn_keys
            .insert(connection_id, ConnKey::Pending(instance_name.to_string()));
        self.pending.insert(instance_name.to_string(), entry);
    }

    pub(crate) fn pending_mut(
        &mut self,
        instance_name: &str,
    ) -> Option<&mut PendingConnectionData> {
        self.pending.get_mut(instance_name)
    }

    /// Moves a pending connection into the established table under a
    /// fresh instance id. Returns `None` when the connection is unknown
    /// (e.g. every waiter cancelled first).
    pub(crate) fn promote(&mut self, connection_id: ConnectionId) -> Option<PromotedConnection> {
        let instance_name = match self.conn_keys.get(&connection_id)? {
            ConnKey::Pending(name) => name.clone(),
            ConnKey::Established(_) => return None,
        };
        let entry = self.pending.remove(&instance_name)?;

        let instance_id = self.next_instance_id;
        self.next_instance_id += 1;

        entry.data.manager.borrow_mut().set_instance_id(instance_id);
        self.instance_map.insert(instance_name.clone(), instance_id);
        self.conn_keys
            .insert(connection_id, ConnKey::Established(instance_id));

        let session = Rc::clone(&entry.data.session);
        let manager = Rc::clone(&entry.data.manager);
        self.connections.insert(instance_id, entry.data);
        debug!(instance_name, instance_id, "connection promoted");

        Some(PromotedConnection {
            instance_name,
            instance_id,
            session,
            manager,
            callbacks: entry.callbacks,
        })
    }

    /// Removes a pending connection that failed before promotion,
    /// returning its waiters.
    pub(crate) fn fail_pending(
        &mut self,
        connection_id: ConnectionId,
    ) -> Option<(String, Vec<(RequestId, RequestCallback)>)> {
        let instance_name = match self.conn_keys.get(&connection_id)? {
            ConnKey::Pending(name) => name.clone(),
            ConnKey::Established(_) => return None,
        };
        self.conn_keys.remove(&connection_id);
        let entry = self.pending.remove(&instance_name)?;
        entry.data.session.close();
        Some((instance_name, entry.callbacks))
    }

    /// Resolves an established connection for event routing.
    pub(crate) fn established(
        &self,
        connection_id: ConnectionId,
    ) -> Option<(InstanceId, Rc<RefCell<StreamManager>>)> {
        match self.conn_keys.get(&connection_id)? {
            ConnKey::Established(instance_id) => {
                let data = self.connections.get(instance_id)?;
                Some((*instance_id, Rc::clone(&data.manager)))
            }
            ConnKey::Pending(_) => None,
        }
    }

    pub(crate) fn connection(
        &self,
        instance_id: InstanceId,
    ) -> Option<(Rc<dyn QuicSession>, Rc<RefCell<StreamManager>>)> {
        self.connections
            .get(&instance_id)
            .map(|data| (Rc::clone(&data.session), Rc::clone(&data.manager)))
    }

    /// Marks an established connection for deletion at the next cleanup
    /// pass. Returns the instance id when the connection was known.
    pub(crate) fn mark_connection_closed(
        &mut self,
        connection_id: ConnectionId,
    ) -> Option<InstanceId> {
        match self.conn_keys.remove(&connection_id)? {
            ConnKey::Established(instance_id) => {
                if self.connections.contains_key(&instance_id) {
                    self.delete_connections.push(instance_id);
                    Some(instance_id)
                } else {
                    None
                }
            }
            ConnKey::Pending(name) => {
                // A pending connection died without a handshake result;
                // treat like a failed dial.
                self.pending.remove(&name);
                None
            }
        }
    }

    /// Detaches the waiter with `request_id`. When it was the last waiter
    /// on its pending connection, the connection is closed and removed.
    /// Returns true if a waiter was found.
    pub(crate) fn cancel_request(&mut self, request_id: RequestId) -> bool {
        let mut emptied = None;
        let mut found = false;
        for (name, entry) in self.pending.iter_mut() {
            let before = entry.callbacks.len();
            entry.callbacks.retain(|(id, _)| *id != request_id);
            if entry.callbacks.len() < before {
                found = true;
                if entry.callbacks.is_empty() {
                    emptied = Some(name.clone());
                }
                break;
            }
        }
        if let Some(name) = emptied {
            if let Some(entry) = self.pending.remove(&name) {
                entry.data.session.close();
            }
            self.conn_keys
                .retain(|_, key| !matches!(key, ConnKey::Pending(n) if *n == name));
        }
        found
    }

    /// Finalizes closed streams, optionally closes idle sessions
    /// (clients), and drains the delete queue.
    pub(crate) fn run_cleanup(&mut self, close_idle_sessions: bool) -> CleanupActions {
        let mut eofs = Vec::new();
        for (instance_id, data) in &self.connections {
            for pc_id in data.manager.borrow_mut().finalize_closed_streams() {
                eofs.push((*instance_id, pc_id));
            }
            if close_idle_sessions && !data.manager.borrow().has_streams() {
                data.session.close();
            }
        }

        for instance_id in std::mem::take(&mut self.delete_connections) {
            self.connections.remove(&instance_id);
            self.instance_map.retain(|_, id| *id != instance_id);
            self.conn_keys
                .retain(|_, key| !matches!(key, ConnKey::Established(id) if *id == instance_id));
        }

        CleanupActions { eofs }
    }

    /// Closes every connection and resets all identity state. The
    /// instance-id counter restarts at 1.
    pub(crate) fn close_all(&mut self) -> ClosedEndpointState {
        let mut failed_waiters = Vec::new();
        for (_, entry) in self.pending.drain() {
            entry.data.session.close();
            failed_waiters.extend(entry.callbacks);
        }
        for (_, data) in self.connections.drain() {
            data.session.close();
        }
        self.instance_map.clear();
        self.conn_keys.clear();
        self.delete_connections.clear();
        self.next_instance_id = 1;
        ClosedEndpointState { failed_waiters }
    }

    pub(crate) fn next_instance_id(&self) -> InstanceId {
        self.next_instance_id
    }
}
