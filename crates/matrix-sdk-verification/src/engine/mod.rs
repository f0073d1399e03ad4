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

//! The verification engine, a single task owning all verification state.
//!
//! The [`VerificationEngine`] handle is cheap to clone, every method on it
//! submits a [`VerificationIntent`] to the task and waits for its result.
//! Intents are processed strictly in the order they were submitted.

mod actor;

use std::sync::Arc;

use ruma::{DeviceId, EventId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

use self::actor::VerificationActor;
use crate::{
    crypto::CryptoPrimitives,
    error::{VerificationError, VerificationResult},
    event_enums::AnyVerificationContent,
    events::{EventBroadcaster, VerificationEvent, VerificationTransaction},
    intent::{Responder, VerificationIntent},
    requests::PendingVerificationRequest,
    transport::Transport,
    trust::TrustBackend,
    FlowId, VerificationConfig, VerificationMethod,
};

#[derive(Debug)]
struct EngineInner {
    sender: mpsc::UnboundedSender<VerificationIntent>,
    events: Arc<EventBroadcaster>,
    own_user_id: OwnedUserId,
    own_device_id: OwnedDeviceId,
    task: JoinHandle<()>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // The task would stop by itself once the channel closes, but any
        // pending transport call would keep it alive until it returns.
        self.task.abort();
    }
}

/// Handle to a running verification engine.
///
/// The engine task is stopped once the last clone of the handle is dropped.
/// Creating an engine requires a Tokio runtime.
#[derive(Clone, Debug)]
pub struct VerificationEngine {
    inner: Arc<EngineInner>,
}

impl VerificationEngine {
    /// Spawn a new verification engine for the given device.
    pub fn new(
        own_user_id: OwnedUserId,
        own_device_id: OwnedDeviceId,
        transport: Arc<dyn Transport>,
        trust: Arc<dyn TrustBackend>,
        crypto: Arc<dyn CryptoPrimitives>,
        config: VerificationConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let events = Arc::new(EventBroadcaster::new(config.event_buffer_capacity));

        let actor = VerificationActor::new(
            own_user_id.clone(),
            own_device_id.clone(),
            transport,
            trust,
            crypto,
            config,
            events.clone(),
        );

        let task = tokio::spawn(actor.run(receiver));

        Self {
            inner: Arc::new(EngineInner { sender, events, own_user_id, own_device_id, task }),
        }
    }

    /// Our own user id.
    pub fn own_user_id(&self) -> &UserId {
        &self.inner.own_user_id
    }

    /// Our own device id.
    pub fn own_device_id(&self) -> &DeviceId {
        &self.inner.own_device_id
    }

    /// Subscribe to the changes of requests and transactions.
    ///
    /// Only changes that happen after the subscription are delivered. A slow
    /// subscriber slows down the engine once its buffer is full, dropping the
    /// stream unsubscribes.
    pub fn subscribe(&self) -> ReceiverStream<VerificationEvent> {
        self.inner.events.subscribe()
    }

    /// Submit an intent without waiting for it to be processed.
    pub fn submit(&self, intent: VerificationIntent) -> VerificationResult<()> {
        self.inner.sender.send(intent).map_err(|_| VerificationError::EngineStopped)
    }

    async fn call<T>(
        &self,
        intent: impl FnOnce(Responder<T>) -> VerificationIntent,
    ) -> VerificationResult<T> {
        let (responder, receiver) = oneshot::channel();
        self.submit(intent(responder))?;

        receiver.await.map_err(|_| VerificationError::EngineStopped)?
    }

    async fn query<T>(
        &self,
        intent: impl FnOnce(oneshot::Sender<T>) -> VerificationIntent,
    ) -> VerificationResult<T> {
        let (responder, receiver) = oneshot::channel();
        self.submit(intent(responder))?;

        receiver.await.map_err(|_| VerificationError::EngineStopped)
    }

    /// Request a verification with another user, or with another one of our
    /// own devices if `other_user_id` is our own user id.
    ///
    /// If a `room_id` is given the request is sent as a message into that
    /// room, otherwise it's sent to the `target_devices` as a to-device
    /// message. An empty list of methods uses the methods of the
    /// [`VerificationConfig`].
    pub async fn request_verification(
        &self,
        other_user_id: OwnedUserId,
        room_id: Option<OwnedRoomId>,
        target_devices: Vec<OwnedDeviceId>,
        methods: Vec<VerificationMethod>,
    ) -> VerificationResult<PendingVerificationRequest> {
        self.call(|responder| VerificationIntent::ActionRequestVerification {
            other_user_id,
            room_id,
            target_devices,
            methods,
            responder,
        })
        .await
    }

    /// Accept an incoming verification request.
    pub async fn ready_request(
        &self,
        flow_id: &str,
        methods: Vec<VerificationMethod>,
    ) -> VerificationResult<PendingVerificationRequest> {
        let flow_id = flow_id.to_owned();
        self.call(|responder| VerificationIntent::ActionReadyRequest {
            flow_id,
            methods,
            responder,
        })
        .await
    }

    /// Start a SAS verification on a ready request.
    pub async fn start_sas(
        &self,
        other_user_id: &UserId,
        flow_id: &str,
    ) -> VerificationResult<VerificationTransaction> {
        let other_user_id = other_user_id.to_owned();
        let flow_id = flow_id.to_owned();

        self.call(|responder| VerificationIntent::ActionStartSasVerification {
            other_user_id,
            flow_id,
            responder,
        })
        .await
    }

    /// Reciprocate a QR code we scanned from the device of the other side.
    pub async fn reciprocate_qr(
        &self,
        other_user_id: &UserId,
        flow_id: &str,
        scanned_data: Vec<u8>,
    ) -> VerificationResult<VerificationTransaction> {
        let other_user_id = other_user_id.to_owned();
        let flow_id = flow_id.to_owned();

        self.call(|responder| VerificationIntent::ActionReciprocateQrVerification {
            other_user_id,
            flow_id,
            scanned_data,
            responder,
        })
        .await
    }

    /// Confirm that the other side scanned the QR code we displayed.
    pub async fn confirm_qr_scanned(
        &self,
        other_user_id: &UserId,
        flow_id: &str,
    ) -> VerificationResult<()> {
        let other_user_id = other_user_id.to_owned();
        let flow_id = flow_id.to_owned();

        self.call(|responder| VerificationIntent::ActionConfirmCodeWasScanned {
            other_user_id,
            flow_id,
            responder,
        })
        .await
    }

    /// Deny that the other side scanned the QR code we displayed, this
    /// cancels the verification.
    pub async fn deny_qr_scanned(
        &self,
        other_user_id: &UserId,
        flow_id: &str,
    ) -> VerificationResult<()> {
        let other_user_id = other_user_id.to_owned();
        let flow_id = flow_id.to_owned();

        self.call(|responder| VerificationIntent::ActionDenyCodeWasScanned {
            other_user_id,
            flow_id,
            responder,
        })
        .await
    }

    /// The user confirmed that the short auth strings match.
    pub async fn sas_code_matches(&self, flow_id: &str) -> VerificationResult<()> {
        let flow_id = flow_id.to_owned();
        self.call(|responder| VerificationIntent::ActionSasCodeMatches { flow_id, responder }).await
    }

    /// The user reported that the short auth strings don't match, this
    /// cancels the verification.
    pub async fn sas_code_does_not_match(&self, flow_id: &str) -> VerificationResult<()> {
        let flow_id = flow_id.to_owned();
        self.call(|responder| VerificationIntent::ActionSasCodeDoesNotMatch { flow_id, responder })
            .await
    }

    /// Cancel a verification request and its transaction.
    pub async fn cancel(&self, flow_id: &str) -> VerificationResult<()> {
        let flow_id = flow_id.to_owned();
        self.call(|responder| VerificationIntent::ActionCancel { flow_id, responder }).await
    }

    /// Forget an outgoing request whose message couldn't be delivered.
    pub fn fail_to_send_request(
        &self,
        other_user_id: &UserId,
        flow_id: &str,
    ) -> VerificationResult<()> {
        self.submit(VerificationIntent::FailToSendRequest {
            other_user_id: other_user_id.to_owned(),
            flow_id: flow_id.to_owned(),
        })
    }

    /// Get the request with the given user and flow id.
    pub async fn get_request(
        &self,
        user_id: &UserId,
        flow_id: &str,
    ) -> VerificationResult<Option<PendingVerificationRequest>> {
        let user_id = user_id.to_owned();
        let flow_id = flow_id.to_owned();

        self.query(|responder| VerificationIntent::GetExistingRequest {
            user_id,
            flow_id,
            responder,
        })
        .await
    }

    /// Get all the requests we have with the given user.
    pub async fn get_requests_for_user(
        &self,
        user_id: &UserId,
    ) -> VerificationResult<Vec<PendingVerificationRequest>> {
        let user_id = user_id.to_owned();
        self.query(|responder| {
            VerificationIntent::GetExistingRequestsForUser { user_id, responder }
        })
        .await
    }

    /// Get the in-room request with the given flow id.
    pub async fn get_request_in_room(
        &self,
        room_id: &RoomId,
        flow_id: &str,
    ) -> VerificationResult<Option<PendingVerificationRequest>> {
        let room_id = room_id.to_owned();
        let flow_id = flow_id.to_owned();

        self.query(|responder| VerificationIntent::GetExistingRequestInRoom {
            room_id,
            flow_id,
            responder,
        })
        .await
    }

    /// Get the active transaction with the given user and flow id.
    pub async fn get_transaction(
        &self,
        user_id: &UserId,
        flow_id: &str,
    ) -> VerificationResult<Option<VerificationTransaction>> {
        let user_id = user_id.to_owned();
        let flow_id = flow_id.to_owned();

        self.query(|responder| VerificationIntent::GetExistingTransaction {
            user_id,
            flow_id,
            responder,
        })
        .await
    }

    /// A verification event of the given flow couldn't be decrypted.
    pub fn unable_to_decrypt(&self, sender: &UserId, flow_id: &str) -> VerificationResult<()> {
        self.submit(VerificationIntent::OnUnableToDecryptVerificationEvent {
            sender: sender.to_owned(),
            flow_id: flow_id.to_owned(),
        })
    }

    /// Feed a decrypted to-device event into the engine.
    ///
    /// Events that aren't verification events, or that are malformed, are
    /// ignored.
    pub fn receive_to_device_event(
        &self,
        sender: &UserId,
        event_type: &str,
        content: &Value,
    ) -> VerificationResult<()> {
        let Some(content) = AnyVerificationContent::from_to_device(event_type, content) else {
            trace!(event_type, %sender, "Ignoring an unknown or malformed to-device event");
            return Ok(());
        };

        let sender = sender.to_owned();

        let intent = match content {
            AnyVerificationContent::Request(request) => {
                let Some(transaction_id) = request.transaction_id else {
                    warn!(
                        %sender,
                        "Received a to-device verification request without a transaction id"
                    );
                    return Ok(());
                };

                VerificationIntent::OnVerificationRequestReceived {
                    sender,
                    flow_id: FlowId::ToDevice(transaction_id),
                    info: request.info,
                }
            }
            content => match Self::flow_intent(sender, None, content) {
                Some(intent) => intent,
                None => return Ok(()),
            },
        };

        self.submit(intent)
    }

    /// Feed a decrypted room event into the engine.
    ///
    /// Events that aren't verification events, or that are malformed, are
    /// ignored.
    pub fn receive_room_event(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        event_id: &EventId,
        event_type: &str,
        content: &Value,
    ) -> VerificationResult<()> {
        let Some(content) = AnyVerificationContent::from_room_event(event_type, content) else {
            trace!(event_type, %sender, %event_id, "Ignoring an unknown or malformed room event");
            return Ok(());
        };

        let own_user_id = self.own_user_id();

        let intent = match content {
            AnyVerificationContent::Request(request) => {
                if sender == own_user_id {
                    trace!(%event_id, "Ignoring our own verification request");
                    return Ok(());
                }

                if request.to.as_deref() != Some(own_user_id) {
                    debug!(
                        %event_id,
                        to = ?request.to,
                        "Ignoring a verification request for another user"
                    );
                    return Ok(());
                }

                VerificationIntent::OnVerificationRequestReceived {
                    sender: sender.to_owned(),
                    flow_id: FlowId::from((room_id, event_id)),
                    info: request.info,
                }
            }
            AnyVerificationContent::Ready(ready) if sender == own_user_id => {
                if *ready.from_device == *self.own_device_id() {
                    trace!(%event_id, "Ignoring our own ready message");
                    return Ok(());
                }

                VerificationIntent::OnReadyByAnotherOfMySessionReceived {
                    via_room: Some(room_id.to_owned()),
                    flow_id: ready.flow_id,
                }
            }
            _ if sender == own_user_id => {
                trace!(%event_id, event_type, "Ignoring the echo of our own verification message");
                return Ok(());
            }
            content => {
                let via_room = Some(room_id.to_owned());
                match Self::flow_intent(sender.to_owned(), via_room, content) {
                    Some(intent) => intent,
                    None => return Ok(()),
                }
            }
        };

        self.submit(intent)
    }

    /// Map a message of an existing flow to its intent, requests start a new
    /// flow and are handled by the caller.
    fn flow_intent(
        sender: OwnedUserId,
        via_room: Option<OwnedRoomId>,
        content: AnyVerificationContent,
    ) -> Option<VerificationIntent> {
        Some(match content {
            AnyVerificationContent::Request(_) => return None,
            AnyVerificationContent::Ready(info) => {
                VerificationIntent::OnReadyReceived { sender, via_room, info }
            }
            AnyVerificationContent::Start(info) => {
                VerificationIntent::OnStartReceived { sender, via_room, info }
            }
            AnyVerificationContent::Accept(info) => {
                VerificationIntent::OnAcceptReceived { sender, via_room, info }
            }
            AnyVerificationContent::Key(info) => {
                VerificationIntent::OnKeyReceived { sender, via_room, info }
            }
            AnyVerificationContent::Mac(info) => {
                VerificationIntent::OnMacReceived { sender, via_room, info }
            }
            AnyVerificationContent::Cancel(info) => {
                VerificationIntent::OnCancelReceived { sender, via_room, info }
            }
            AnyVerificationContent::Done(flow_id) => {
                VerificationIntent::OnDoneReceived { sender, via_room, flow_id }
            }
        })
    }
}
