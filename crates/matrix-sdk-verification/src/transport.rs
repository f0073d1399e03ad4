// Copyright 2024 The Matrix.org Foundation C.I.C.
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

use async_trait::async_trait;
use ruma::{OwnedDeviceId, OwnedEventId, RoomId, UserId};
use serde_json::Value;

use crate::error::TransportError;

/// Sends verification messages to the other side.
///
/// Messages are either sent into a room, related to the request event, or as
/// to-device messages to a set of devices.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send an event into a room, returning the id of the sent event.
    async fn send_in_room(
        &self,
        event_type: &str,
        room_id: &RoomId,
        content: Value,
    ) -> Result<OwnedEventId, TransportError>;

    /// Send a to-device event to the given devices of a user.
    async fn send_to_device(
        &self,
        event_type: &str,
        user_id: &UserId,
        devices: &[OwnedDeviceId],
        content: Value,
    ) -> Result<(), TransportError>;
}
