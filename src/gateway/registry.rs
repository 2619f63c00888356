// Copyright 2026 BadCompany
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

//! Live sessions of one gateway instance.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::session::Session;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry this one replaced, if any.
    pub async fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove `id` only while it still maps to `session` itself.
    pub async fn remove_if_same(&self, id: &str, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(id);
                true
            }
            _ => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
