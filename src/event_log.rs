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

//! In-memory resumable event log.
//!
//! Every message delivered on a resumable stream is appended here under the
//! stream id and receives the next integer id for that stream (1, 2, 3, ...).
//! A reconnecting client presents the last id it saw and gets everything after
//! it replayed in append order.
//!
//! Nothing is ever evicted. Long-lived or high-throughput streams grow without
//! bound for the lifetime of the process.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::jsonrpc::Message;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub stream_id: String,
    pub event_id: u64,
    pub message: Message,
}

#[derive(Debug, Default)]
pub struct EventLog {
    streams: Mutex<HashMap<String, Vec<StreamEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `message` and return its id within `stream_id`.
    pub fn append(&self, stream_id: &str, message: Message) -> u64 {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let events = streams.entry(stream_id.to_string()).or_default();
        // Ids are positional: the log is append-only, so len + 1 is gapless.
        let event_id = events.len() as u64 + 1;
        events.push(StreamEvent {
            stream_id: stream_id.to_string(),
            event_id,
            message,
        });
        event_id
    }

    /// Invoke `deliver` for every event of `stream_id` with id > `after`, in
    /// ascending order. Unknown streams deliver nothing.
    pub fn replay<F>(&self, stream_id: &str, after: u64, mut deliver: F)
    where
        F: FnMut(&StreamEvent),
    {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(events) = streams.get(stream_id) {
            let start = usize::try_from(after).unwrap_or(usize::MAX).min(events.len());
            events[start..].iter().for_each(&mut deliver);
        }
    }

    pub fn events_after(&self, stream_id: &str, after: u64) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.replay(stream_id, after, |event| out.push(event.clone()));
        out
    }

    /// Id of the newest event in `stream_id`, 0 when empty.
    pub fn last_event_id(&self, stream_id: &str) -> u64 {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.get(stream_id).map_or(0, |events| events.len() as u64)
    }
}

/// Wire form of an event position: `<stream_id>_<event_id>`.
pub fn format_event_id(stream_id: &str, event_id: u64) -> String {
    format!("{}_{}", stream_id, event_id)
}

/// Inverse of [`format_event_id`]. Splits on the last underscore so stream ids
/// may themselves contain underscores.
pub fn parse_event_id(raw: &str) -> Option<(String, u64)> {
    let (stream, id) = raw.trim().rsplit_once('_')?;
    if stream.is_empty() {
        return None;
    }
    let id = id.parse().ok()?;
    Some((stream.to_string(), id))
}
