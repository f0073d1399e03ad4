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

//! The commands and queries understood by the verification engine.

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use tokio::sync::oneshot;

use crate::{
    error::VerificationResult,
    event_enums::{AcceptInfo, CancelInfo, KeyInfo, MacInfo, ReadyInfo, RequestInfo, StartInfo},
    events::VerificationTransaction,
    requests::PendingVerificationRequest,
    FlowId, VerificationMethod,
};

/// The completion handle of an intent that can fail.
pub type Responder<T> = oneshot::Sender<VerificationResult<T>>;

/// Everything the [`VerificationEngine`](crate::VerificationEngine) can be
/// asked to do.
///
/// `Action*` variants are user actions, `On*` variants are events that were
/// received from the network and `Get*` variants are read-only queries.
#[derive(Debug)]
pub enum VerificationIntent {
    /// Send a new verification request to a user.
    ///
    /// Any unfinished request with that user gets cancelled.
    ActionRequestVerification {
        /// The user we want to verify.
        other_user_id: OwnedUserId,
        /// The room to send an in-room request to, a to-device request is sent
        /// if this is `None`.
        room_id: Option<OwnedRoomId>,
        /// The devices a to-device request should be sent to.
        target_devices: Vec<OwnedDeviceId>,
        /// The methods we want to offer.
        methods: Vec<VerificationMethod>,
        /// Resolves with the newly created request.
        responder: Responder<PendingVerificationRequest>,
    },

    /// Another device accepted a request.
    OnReadyReceived {
        /// The sender of the event.
        sender: OwnedUserId,
        /// The room the event was received in, `None` for to-device events.
        via_room: Option<OwnedRoomId>,
        /// The content of the event.
        info: ReadyInfo,
    },

    /// The initial message of a request we created couldn't be sent.
    FailToSendRequest {
        /// The user the request was meant for.
        other_user_id: OwnedUserId,
        /// The flow id of the request.
        flow_id: String,
    },

    /// Get the in-room request with the given flow id.
    GetExistingRequestInRoom {
        /// The room of the request.
        room_id: OwnedRoomId,
        /// The event id of the request.
        flow_id: String,
        /// Resolves once the intent has been processed.
        responder: oneshot::Sender<Option<PendingVerificationRequest>>,
    },

    /// A new verification request was received.
    OnVerificationRequestReceived {
        /// The sender of the request.
        sender: OwnedUserId,
        /// The flow id of the request.
        flow_id: FlowId,
        /// The content of the request.
        info: RequestInfo,
    },

    /// Accept a request we received.
    ActionReadyRequest {
        /// The flow id of the request.
        flow_id: String,
        /// The methods we want to use.
        methods: Vec<VerificationMethod>,
        /// Resolves with the updated request.
        responder: Responder<PendingVerificationRequest>,
    },

    /// Start a SAS verification on a ready request.
    ActionStartSasVerification {
        /// The user on the other side of the request.
        other_user_id: OwnedUserId,
        /// The flow id of the request.
        flow_id: String,
        /// Resolves with the new transaction.
        responder: Responder<VerificationTransaction>,
    },

    /// Reciprocate a QR code that the user scanned.
    ActionReciprocateQrVerification {
        /// The user on the other side of the request.
        other_user_id: OwnedUserId,
        /// The flow id of the request.
        flow_id: String,
        /// The raw content of the scanned QR code.
        scanned_data: Vec<u8>,
        /// Resolves with the new transaction.
        responder: Responder<VerificationTransaction>,
    },

    /// The user confirmed that the other side scanned our QR code.
    ActionConfirmCodeWasScanned {
        /// The user on the other side of the request.
        other_user_id: OwnedUserId,
        /// The flow id of the request.
        flow_id: String,
        /// Resolves once the intent has been processed.
        responder: Responder<()>,
    },

    /// The user denied that the other side scanned our QR code.
    ActionDenyCodeWasScanned {
        /// The user on the other side of the request.
        other_user_id: OwnedUserId,
        /// The flow id of the request.
        flow_id: String,
        /// Resolves once the intent has been processed.
        responder: Responder<()>,
    },

    /// The other side started a verification method.
    OnStartReceived {
        /// The sender of the event.
        sender: OwnedUserId,
        /// The room the event was received in, `None` for to-device events.
        via_room: Option<OwnedRoomId>,
        /// The content of the event.
        info: StartInfo,
    },

    /// The other side accepted our SAS start.
    OnAcceptReceived {
        /// The sender of the event.
        sender: OwnedUserId,
        /// The room the event was received in, `None` for to-device events.
        via_room: Option<OwnedRoomId>,
        /// The content of the event.
        info: AcceptInfo,
    },

    /// The other side sent its ephemeral SAS key.
    OnKeyReceived {
        /// The sender of the event.
        sender: OwnedUserId,
        /// The room the event was received in, `None` for to-device events.
        via_room: Option<OwnedRoomId>,
        /// The content of the event.
        info: KeyInfo,
    },

    /// The user says the short auth strings differ.
    ActionSasCodeDoesNotMatch {
        /// The flow id of the request.
        flow_id: String,
        /// Resolves once the intent has been processed.
        responder: Responder<()>,
    },

    /// The user confirmed that the short auth strings match.
    ActionSasCodeMatches {
        /// The flow id of the request.
        flow_id: String,
        /// Resolves once the intent has been processed.
        responder: Responder<()>,
    },

    /// The other side sent its SAS MAC.
    OnMacReceived {
        /// The sender of the event.
        sender: OwnedUserId,
        /// The room the event was received in, `None` for to-device events.
        via_room: Option<OwnedRoomId>,
        /// The content of the event.
        info: MacInfo,
    },

    /// The other side finished the verification.
    OnDoneReceived {
        /// The sender of the event.
        sender: OwnedUserId,
        /// The room the event was received in, `None` for to-device events.
        via_room: Option<OwnedRoomId>,
        /// The flow id of the verification.
        flow_id: String,
    },

    /// Cancel a request and its transaction.
    ActionCancel {
        /// The flow id of the request.
        flow_id: String,
        /// Resolves once the intent has been processed.
        responder: Responder<()>,
    },

    /// A verification event failed to decrypt.
    OnUnableToDecryptVerificationEvent {
        /// The sender of the event.
        sender: OwnedUserId,
        /// The flow id the event relates to.
        flow_id: String,
    },

    /// Get all the requests we have with a user.
    GetExistingRequestsForUser {
        /// The other user.
        user_id: OwnedUserId,
        /// Resolves once the intent has been processed.
        responder: oneshot::Sender<Vec<PendingVerificationRequest>>,
    },

    /// Get the active transaction with the given flow id.
    GetExistingTransaction {
        /// The other user.
        user_id: OwnedUserId,
        /// The flow id of the transaction.
        flow_id: String,
        /// Resolves once the intent has been processed.
        responder: oneshot::Sender<Option<VerificationTransaction>>,
    },

    /// Get the request with the given flow id.
    GetExistingRequest {
        /// The other user.
        user_id: OwnedUserId,
        /// The flow id of the request.
        flow_id: String,
        /// Resolves once the intent has been processed.
        responder: oneshot::Sender<Option<PendingVerificationRequest>>,
    },

    /// The other side cancelled the verification.
    OnCancelReceived {
        /// The sender of the event.
        sender: OwnedUserId,
        /// The room the event was received in, `None` for to-device events.
        via_room: Option<OwnedRoomId>,
        /// The content of the event.
        info: CancelInfo,
    },

    /// Another device of our own user accepted a request.
    OnReadyByAnotherOfMySessionReceived {
        /// The room the event was received in, `None` for to-device events.
        via_room: Option<OwnedRoomId>,
        /// The flow id of the request.
        flow_id: String,
    },
}
