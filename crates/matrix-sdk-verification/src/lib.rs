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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod config;
mod content;
mod crypto;
mod engine;
mod error;
mod event_enums;
mod events;
mod intent;
mod qrcode;
mod registry;
mod requests;
mod sas;
#[cfg(test)]
mod testing;
mod transport;
mod trust;

pub use config::VerificationConfig;
pub use content::{CancelCode, MessageType, VerificationMethod};
pub use crypto::{CryptoPrimitives, KeyAgreement, VodozemacPrimitives};
pub use engine::VerificationEngine;
pub use error::{
    CryptoError, DecodingError, EncodingError, TransportError, TrustError, VerificationError,
    VerificationResult,
};
pub use event_enums::{
    AcceptInfo, CancelInfo, KeyInfo, MacInfo, ReadyInfo, RequestInfo, SasStartInfo, StartInfo,
    StartMethod,
};
pub use events::{VerificationEvent, VerificationTransaction};
pub use intent::{Responder, VerificationIntent};
pub use qrcode::{QrCodeData, QrState, QrVerification};
pub use requests::{PendingVerificationRequest, VerificationRequestState};
pub use sas::{Emoji, SasState, SasVerification};
pub use transport::Transport;
pub use trust::{DeviceKeys, TrustBackend};

use ruma::{EventId, OwnedEventId, OwnedRoomId, OwnedTransactionId, RoomId};

/// The identifier of a verification flow.
///
/// To-device flows are identified by the transaction id of the request, room
/// flows by the event id of the request message.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum FlowId {
    /// A flow using to-device messages.
    ToDevice(OwnedTransactionId),
    /// A flow using messages in the given room.
    InRoom(OwnedRoomId, OwnedEventId),
}

impl FlowId {
    /// The room of the flow, if it's a room flow.
    pub fn room_id(&self) -> Option<&RoomId> {
        if let FlowId::InRoom(r, _) = &self {
            Some(r)
        } else {
            None
        }
    }

    /// The flow id as a string, the transaction id or the event id of the
    /// request.
    pub fn as_str(&self) -> &str {
        match self {
            FlowId::InRoom(_, r) => r.as_str(),
            FlowId::ToDevice(t) => t.as_str(),
        }
    }
}

impl From<OwnedTransactionId> for FlowId {
    fn from(transaction_id: OwnedTransactionId) -> Self {
        FlowId::ToDevice(transaction_id)
    }
}

impl From<(OwnedRoomId, OwnedEventId)> for FlowId {
    fn from(ids: (OwnedRoomId, OwnedEventId)) -> Self {
        FlowId::InRoom(ids.0, ids.1)
    }
}

impl From<(&RoomId, &EventId)> for FlowId {
    fn from(ids: (&RoomId, &EventId)) -> Self {
        FlowId::InRoom(ids.0.to_owned(), ids.1.to_owned())
    }
}
