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

//! Per-instance request-id generation.

use std::collections::HashMap;

use crate::{InstanceId, RequestId};

/// Which side of a connection this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn parity_bit(self) -> u64 {
        match self {
            Role::Client => 0,
            Role::Server => 1,
        }
    }
}

/// Generates monotonic request ids per instance.
///
/// Clients produce even ids and servers odd ids, so the two sides of a
/// conversation can never hand out colliding ids. Counters are dropped
/// when an instance is torn down and the generator as a whole resets when
/// the endpoint stops.
#[derive(Debug)]
pub struct InstanceRequestIds {
    role: Role,
    counters: HashMap<InstanceId, u64>,
}

impl InstanceRequestIds {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            counters: HashMap::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the next request id to use with `instance_id`.
    pub fn next_request_id(&mut self, instance_id: InstanceId) -> RequestId {
        let counter = self.counters.entry(instance_id).or_insert(0);
        let request_id = (*counter << 1) | self.role.parity_bit();
        *counter += 1;
        request_id
    }

    /// Forgets the counter for a single instance, called on instance
    /// teardown.
    pub fn reset_request_id(&mut self, instance_id: InstanceId) {
        self.counters.remove(&instance_id);
    }

    /// Forgets all counters, called when the endpoint stops.
    pub fn reset(&mut self) {
        self.counters.clear();
    }
}
