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

use std::sync::Arc;

use ruma::{
    uint, DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId,
    SecondsSinceUnixEpoch, TransactionId, UInt, UserId,
};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    content::{
        CancelContent, DoneContent, MessageType, ReadyContent, RequestContent,
        RoomRequestContent, StartContent, ROOM_MESSAGE_EVENT_TYPE,
    },
    crypto::CryptoPrimitives,
    error::{TransportError, VerificationError, VerificationResult},
    event_enums::{
        AcceptInfo, CancelInfo, KeyInfo, MacInfo, OutgoingContent, ReadyInfo, RequestInfo,
        StartInfo, StartMethod,
    },
    events::{EventBroadcaster, VerificationEvent, VerificationTransaction},
    intent::VerificationIntent,
    qrcode::{
        check_scanned_code, create_qr_code_data, secrets_match, QrCodeData, QrKeys, QrState,
        QrTransaction,
    },
    registry::{Verification, VerificationRegistry},
    requests::{
        can_scan, method_agreement, request_methods, PendingVerificationRequest,
        VerificationRequest, VerificationRequestState,
    },
    sas::{MacVerification, SasIds, SasState, SasTransaction},
    transport::Transport,
    trust::TrustBackend,
    CancelCode, FlowId, VerificationConfig, VerificationMethod,
};

/// The owner of all verification state.
///
/// Every intent is processed to completion before the next one is looked at.
#[derive(Debug)]
pub(super) struct VerificationActor {
    own_user_id: OwnedUserId,
    own_device_id: OwnedDeviceId,
    registry: VerificationRegistry,
    transport: Arc<dyn Transport>,
    trust: Arc<dyn TrustBackend>,
    crypto: Arc<dyn CryptoPrimitives>,
    config: VerificationConfig,
    events: Arc<EventBroadcaster>,
}

impl VerificationActor {
    pub(super) fn new(
        own_user_id: OwnedUserId,
        own_device_id: OwnedDeviceId,
        transport: Arc<dyn Transport>,
        trust: Arc<dyn TrustBackend>,
        crypto: Arc<dyn CryptoPrimitives>,
        config: VerificationConfig,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            own_user_id,
            own_device_id,
            registry: VerificationRegistry::new(),
            transport,
            trust,
            crypto,
            config,
            events,
        }
    }

    pub(super) async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<VerificationIntent>) {
        while let Some(intent) = receiver.recv().await {
            self.handle(intent).await;
        }

        debug!("All verification engine handles were dropped, stopping");
    }

    async fn handle(&mut self, intent: VerificationIntent) {
        // A caller that went away doesn't need its answer, the result of
        // `send()` on a responder is ignored for that reason.
        match intent {
            VerificationIntent::ActionRequestVerification {
                other_user_id,
                room_id,
                target_devices,
                methods,
                responder,
            } => {
                let result = self
                    .request_verification(other_user_id, room_id, target_devices, methods)
                    .await;
                let _ = responder.send(result);
            }
            VerificationIntent::OnReadyReceived { sender, via_room, info } => {
                self.on_ready_received(&sender, via_room.as_deref(), info).await;
            }
            VerificationIntent::FailToSendRequest { other_user_id, flow_id } => {
                if self.registry.remove_request(&other_user_id, &flow_id).is_some() {
                    debug!(%flow_id, "Removed a verification request that couldn't be sent");
                }
            }
            VerificationIntent::GetExistingRequestInRoom { room_id, flow_id, responder } => {
                let request = self
                    .registry
                    .find_request(&flow_id)
                    .filter(|r| r.room_id() == Some(&*room_id))
                    .map(VerificationRequest::to_pending);
                let _ = responder.send(request);
            }
            VerificationIntent::OnVerificationRequestReceived { sender, flow_id, info } => {
                self.on_request_received(sender, flow_id, info).await;
            }
            VerificationIntent::ActionReadyRequest { flow_id, methods, responder } => {
                let result = self.ready_request(&flow_id, methods).await;
                let _ = responder.send(result);
            }
            VerificationIntent::ActionStartSasVerification {
                other_user_id,
                flow_id,
                responder,
            } => {
                let result = self.start_sas(&other_user_id, &flow_id).await;
                let _ = responder.send(result);
            }
            VerificationIntent::ActionReciprocateQrVerification {
                other_user_id,
                flow_id,
                scanned_data,
                responder,
            } => {
                let result = self.reciprocate_qr(&other_user_id, &flow_id, &scanned_data).await;
                let _ = responder.send(result);
            }
            VerificationIntent::ActionConfirmCodeWasScanned {
                other_user_id,
                flow_id,
                responder,
            } => {
                let result = self.confirm_qr_scanned(&other_user_id, &flow_id).await;
                let _ = responder.send(result);
            }
            VerificationIntent::ActionDenyCodeWasScanned { other_user_id, flow_id, responder } => {
                let result = self.deny_qr_scanned(&other_user_id, &flow_id).await;
                let _ = responder.send(result);
            }
            VerificationIntent::OnStartReceived { sender, via_room, info } => {
                self.on_start_received(&sender, via_room.as_deref(), info).await;
            }
            VerificationIntent::OnAcceptReceived { sender, via_room, info } => {
                self.on_accept_received(&sender, via_room.as_deref(), info).await;
            }
            VerificationIntent::OnKeyReceived { sender, via_room, info } => {
                self.on_key_received(&sender, via_room.as_deref(), info).await;
            }
            VerificationIntent::ActionSasCodeDoesNotMatch { flow_id, responder } => {
                let result = self.sas_code_does_not_match(&flow_id).await;
                let _ = responder.send(result);
            }
            VerificationIntent::ActionSasCodeMatches { flow_id, responder } => {
                let result = self.sas_code_matches(&flow_id).await;
                let _ = responder.send(result);
            }
            VerificationIntent::OnMacReceived { sender, via_room, info } => {
                self.on_mac_received(&sender, via_room.as_deref(), info).await;
            }
            VerificationIntent::OnDoneReceived { sender, via_room, flow_id } => {
                self.on_done_received(&sender, via_room.as_deref(), &flow_id).await;
            }
            VerificationIntent::ActionCancel { flow_id, responder } => {
                let result = self.cancel(&flow_id).await;
                let _ = responder.send(result);
            }
            VerificationIntent::OnUnableToDecryptVerificationEvent { sender, flow_id } => {
                self.on_unable_to_decrypt(&sender, &flow_id).await;
            }
            VerificationIntent::GetExistingRequestsForUser { user_id, responder } => {
                let requests = self
                    .registry
                    .requests_for_user(&user_id)
                    .iter()
                    .map(VerificationRequest::to_pending)
                    .collect();
                let _ = responder.send(requests);
            }
            VerificationIntent::GetExistingTransaction { user_id, flow_id, responder } => {
                let transaction =
                    self.registry.transaction(&user_id, &flow_id).map(Verification::to_snapshot);
                let _ = responder.send(transaction);
            }
            VerificationIntent::GetExistingRequest { user_id, flow_id, responder } => {
                let request =
                    self.registry.request(&user_id, &flow_id).map(VerificationRequest::to_pending);
                let _ = responder.send(request);
            }
            VerificationIntent::OnCancelReceived { sender, via_room, info } => {
                self.on_cancel_received(&sender, via_room.as_deref(), info).await;
            }
            VerificationIntent::OnReadyByAnotherOfMySessionReceived { via_room, flow_id } => {
                self.on_ready_by_another_session(via_room.as_deref(), &flow_id).await;
            }
        }
    }

    fn is_timestamp_valid(timestamp: MilliSecondsSinceUnixEpoch) -> bool {
        // The event should be ignored if the event is older than 10 minutes
        let old_timestamp_threshold: UInt = uint!(600);
        // The event should be ignored if the event is 5 minutes or more into the
        // future.
        let timestamp_threshold: UInt = uint!(300);

        let timestamp = timestamp.as_secs();
        let now = SecondsSinceUnixEpoch::now().get();

        !(now.saturating_sub(timestamp) > old_timestamp_threshold
            || timestamp.saturating_sub(now) > timestamp_threshold)
    }

    fn sas_ids(&self, other_user_id: &UserId, other_device_id: &DeviceId) -> SasIds {
        SasIds {
            own_user_id: self.own_user_id.clone(),
            own_device_id: self.own_device_id.clone(),
            other_user_id: other_user_id.to_owned(),
            other_device_id: other_device_id.to_owned(),
        }
    }

    async fn own_fingerprint(&self) -> Option<String> {
        self.trust.user_device(&self.own_user_id, &self.own_device_id).await.map(|d| d.fingerprint)
    }

    async fn qr_keys(&self, other_user_id: &UserId, other_device_id: &DeviceId) -> QrKeys {
        QrKeys {
            own_master_key: self.trust.user_master_key(&self.own_user_id).await,
            own_master_key_trusted: self.trust.my_trusted_master_key().await.is_some(),
            other_master_key: self.trust.user_master_key(other_user_id).await,
            own_device_key: self.own_fingerprint().await,
            other_device_key: self
                .trust
                .user_device(other_user_id, other_device_id)
                .await
                .map(|d| d.fingerprint),
        }
    }

    async fn publish(&self, event: VerificationEvent) {
        self.events.publish(event).await;
    }

    async fn publish_request(&self, user_id: &UserId, flow_id: &str) {
        if let Some(request) = self.registry.request(user_id, flow_id) {
            let pending = request.to_pending();
            self.publish(VerificationEvent::RequestUpdated(pending)).await;
        }
    }

    async fn publish_transaction(&self, user_id: &UserId, flow_id: &str, added: bool) {
        if let Some(transaction) = self.registry.transaction(user_id, flow_id) {
            let snapshot = transaction.to_snapshot();
            let event = if added {
                VerificationEvent::TransactionAdded(snapshot)
            } else {
                VerificationEvent::TransactionUpdated(snapshot)
            };

            self.publish(event).await;
        }
    }

    /// Move a request into a new state and tell our subscribers about it.
    async fn update_request(
        &mut self,
        user_id: &UserId,
        flow_id: &str,
        state: VerificationRequestState,
    ) {
        let changed =
            self.registry.request_mut(user_id, flow_id).is_some_and(|r| r.transition(state));

        if changed {
            self.publish_request(user_id, flow_id).await;
        }
    }

    /// Send a message to the other side of a request, in the room of the
    /// request or to the devices of the other user.
    async fn send_to_other(
        &self,
        request: &VerificationRequest,
        content: OutgoingContent,
    ) -> Result<(), TransportError> {
        let event_type = content.message_type.as_str();

        match &request.flow_id {
            FlowId::InRoom(room_id, _) => {
                self.transport.send_in_room(event_type, room_id, content.content).await?;
            }
            FlowId::ToDevice(_) => {
                let devices = match request.other_device_id() {
                    Some(device_id) => vec![device_id],
                    None => request.target_devices.clone(),
                };

                self.transport
                    .send_to_device(event_type, &request.other_user_id, &devices, content.content)
                    .await?;
            }
        }

        Ok(())
    }

    /// Find the request an incoming event belongs to.
    ///
    /// Events for unknown, finished or passive requests are dropped, as are
    /// events that arrived over a different transport than the request uses.
    fn matching_request(
        &self,
        sender: &UserId,
        flow_id: &str,
        via_room: Option<&RoomId>,
    ) -> Option<VerificationRequest> {
        let Some(request) = self.registry.request(sender, flow_id) else {
            debug!(flow_id, %sender, "Received a verification event for an unknown request");
            return None;
        };

        if request.is_finished()
            || request.state == VerificationRequestState::HandledByOtherSession
        {
            debug!(flow_id, state = ?request.state, "Ignoring an event for an inactive request");
            return None;
        }

        if !request.matches_transport(via_room) {
            warn!(
                flow_id,
                ?via_room,
                expected_room = ?request.room_id(),
                "Dropping a verification event that arrived over the wrong transport"
            );
            return None;
        }

        Some(request.clone())
    }

    /// Cancel a request and its transaction, and let the other side know.
    async fn cancel_request(&mut self, user_id: &UserId, flow_id: &str, code: CancelCode) {
        let Some(request) = self.registry.request_mut(user_id, flow_id) else { return };

        if !request.cancel(code) {
            return;
        }

        let request = request.clone();
        info!(flow_id, %code, "Cancelling a verification request");

        if let Some(mut verification) = self.registry.remove_transaction(user_id, flow_id) {
            match &mut verification {
                Verification::Sas(sas) => sas.set_state(SasState::Cancelled { code, by_me: true }),
                Verification::Qr(qr) => qr.set_state(QrState::Cancelled { code, by_me: true }),
            }

            self.publish(VerificationEvent::TransactionUpdated(verification.to_snapshot())).await;
            self.registry.archive_transaction(user_id, verification);
        }

        self.publish(VerificationEvent::RequestUpdated(request.to_pending())).await;

        let content =
            OutgoingContent::new(&request.flow_id, MessageType::Cancel, CancelContent::from(code));

        match content {
            Ok(content) => {
                if let Err(e) = self.send_to_other(&request, content).await {
                    warn!(flow_id, error = ?e, "Failed to send a verification cancellation");
                }
            }
            Err(e) => warn!(flow_id, error = ?e, "Failed to serialize a verification cancellation"),
        }
    }

    /// Mark the verified keys as trusted.
    ///
    /// Failures are logged but don't stop the verification.
    async fn apply_trust(
        &self,
        other_user_id: &UserId,
        devices: &[OwnedDeviceId],
        master_key: bool,
    ) {
        let is_self_verification = *other_user_id == *self.own_user_id;

        for device_id in devices {
            if let Err(e) = self.trust.locally_trust_device(other_user_id, device_id).await {
                warn!(%other_user_id, %device_id, error = ?e, "Failed to locally trust a device");
            }

            if is_self_verification && self.trust.can_cross_sign().await {
                if let Err(e) = self.trust.trust_own_device(device_id).await {
                    warn!(%device_id, error = ?e, "Failed to sign our own device");
                }
            }
        }

        if master_key {
            if is_self_verification {
                if let Err(e) = self.trust.mark_my_master_key_as_trusted().await {
                    warn!(error = ?e, "Failed to mark our own master key as trusted");
                }
            } else if self.trust.can_cross_sign().await {
                if let Err(e) = self.trust.trust_user(other_user_id).await {
                    warn!(%other_user_id, error = ?e, "Failed to sign the master key of a user");
                }
            }
        }

        info!(%other_user_id, ?devices, master_key, "Marked verified keys as trusted");
    }

    #[instrument(skip_all, fields(%other_user_id, room_id = ?room_id))]
    async fn request_verification(
        &mut self,
        other_user_id: OwnedUserId,
        room_id: Option<OwnedRoomId>,
        target_devices: Vec<OwnedDeviceId>,
        methods: Vec<VerificationMethod>,
    ) -> VerificationResult<PendingVerificationRequest> {
        // Only one request per user may be active.
        let unfinished: Vec<String> = self
            .registry
            .requests_for_user(&other_user_id)
            .iter()
            .filter(|r| !r.is_finished())
            .map(|r| r.flow_id.as_str().to_owned())
            .collect();

        for flow_id in unfinished {
            debug!(%flow_id, "Cancelling a pending request to start a new one");
            self.cancel_request(&other_user_id, &flow_id, CancelCode::User).await;
        }

        let methods =
            if methods.is_empty() { self.config.supported_methods.clone() } else { methods };
        let master_key_trusted = self.trust.my_trusted_master_key().await.is_some();
        let methods = request_methods(&methods, master_key_trusted);
        let timestamp = MilliSecondsSinceUnixEpoch::now();

        let flow_id = match room_id {
            Some(room_id) => {
                let content = RoomRequestContent {
                    msgtype: MessageType::Request.as_str().to_owned(),
                    body: format!(
                        "{} is requesting to verify your key, but your client does not support \
                         in-chat key verification. You will need to use legacy key verification \
                         to verify keys.",
                        self.own_user_id
                    ),
                    from_device: self.own_device_id.clone(),
                    methods: methods.clone(),
                    to: other_user_id.clone(),
                };

                let event_id = self
                    .transport
                    .send_in_room(ROOM_MESSAGE_EVENT_TYPE, &room_id, serde_json::to_value(content)?)
                    .await?;

                FlowId::InRoom(room_id, event_id)
            }
            None => {
                let flow_id = FlowId::ToDevice(TransactionId::new());
                let content = RequestContent {
                    from_device: self.own_device_id.clone(),
                    methods: methods.clone(),
                    timestamp,
                };
                let content = OutgoingContent::new(&flow_id, MessageType::Request, content)?;

                self.transport
                    .send_to_device(
                        MessageType::Request.as_str(),
                        &other_user_id,
                        &target_devices,
                        content.content,
                    )
                    .await?;

                flow_id
            }
        };

        let info = RequestInfo {
            from_device: self.own_device_id.clone(),
            methods,
            timestamp: Some(timestamp),
        };

        let request = VerificationRequest::outgoing(flow_id, other_user_id, info, target_devices);
        let pending = request.to_pending();

        info!(flow_id = request.flow_id.as_str(), "Sent a new verification request");

        self.registry.add_request(request);
        self.publish(VerificationEvent::RequestAdded(pending.clone())).await;

        Ok(pending)
    }

    #[instrument(skip_all, fields(%sender, flow_id = flow_id.as_str()))]
    async fn on_request_received(
        &mut self,
        sender: OwnedUserId,
        flow_id: FlowId,
        info: RequestInfo,
    ) {
        if sender == self.own_user_id && info.from_device == self.own_device_id {
            trace!("The received verification request was sent by us, ignoring it");
            return;
        }

        if let Some(timestamp) = info.timestamp {
            if !Self::is_timestamp_valid(timestamp) {
                trace!(
                    ?timestamp,
                    "The received verification request was too old or too far into the future"
                );
                return;
            }
        }

        if self.registry.request(&sender, flow_id.as_str()).is_some() {
            debug!("Ignoring known verification request");
            return;
        }

        info!(from_device = info.from_device.as_str(), "Received a new verification request");

        let request = VerificationRequest::incoming(flow_id, sender, info);
        let pending = request.to_pending();

        self.registry.add_request(request);
        self.publish(VerificationEvent::RequestAdded(pending)).await;
    }

    #[instrument(skip_all, fields(%sender, flow_id = %info.flow_id))]
    async fn on_ready_received(
        &mut self,
        sender: &UserId,
        via_room: Option<&RoomId>,
        info: ReadyInfo,
    ) {
        // Another one of our devices accepted a request we received, this
        // device won't take part in the verification.
        if *sender == *self.own_user_id && info.from_device != self.own_device_id {
            let passive = self
                .registry
                .find_request_mut(&info.flow_id)
                .filter(|r| r.incoming && r.matches_transport(via_room))
                .map(|r| {
                    let changed = r.transition(VerificationRequestState::HandledByOtherSession);
                    (changed, r.other_user_id.clone())
                });

            if let Some((changed, other_user_id)) = passive {
                debug!("The request was accepted by another one of our devices");

                if changed {
                    self.publish_request(&other_user_id, &info.flow_id).await;
                }

                return;
            }
        }

        let Some(request) = self.matching_request(sender, &info.flow_id, via_room) else { return };

        if request.state != VerificationRequestState::WaitingForReady {
            warn!(state = ?request.state, "Received a ready for a request in an unexpected state");
            self.cancel_request(sender, &info.flow_id, CancelCode::UnexpectedMessage).await;
            return;
        }

        let qr_code_data = if can_scan(&info.methods)
            && request.request_info.methods.contains(&VerificationMethod::QrCodeShowV1)
        {
            let keys = self.qr_keys(sender, &info.from_device).await;
            create_qr_code_data(&request.flow_id, *sender == *self.own_user_id, keys)
        } else {
            None
        };

        let ready_device = info.from_device.clone();

        if let Some(request) = self.registry.request_mut(sender, &info.flow_id) {
            request.ready_info = Some(info.clone());
            request.qr_code_data = qr_code_data;
            request.transition(VerificationRequestState::Ready);
        }

        self.publish_request(sender, &info.flow_id).await;

        if via_room.is_none() {
            self.notify_accepted_by_another_device(&request, &ready_device).await;
        }
    }

    /// Tell the devices that didn't answer a to-device request that they
    /// don't need to anymore.
    async fn notify_accepted_by_another_device(
        &self,
        request: &VerificationRequest,
        ready_device: &DeviceId,
    ) {
        let devices: Vec<OwnedDeviceId> = self
            .trust
            .user_devices(&request.other_user_id)
            .await
            .into_iter()
            .map(|d| d.device_id)
            .filter(|d| **d != *ready_device && *d != self.own_device_id)
            .collect();

        if devices.is_empty() {
            return;
        }

        let content = OutgoingContent::new(
            &request.flow_id,
            MessageType::Cancel,
            CancelContent::from(CancelCode::AcceptedByAnotherDevice),
        );

        let result = match content {
            Ok(content) => {
                self.transport
                    .send_to_device(
                        content.message_type.as_str(),
                        &request.other_user_id,
                        &devices,
                        content.content,
                    )
                    .await
            }
            Err(e) => Err(TransportError::new(e)),
        };

        if let Err(e) = result {
            debug!(error = ?e, "Failed to notify other devices that the request was accepted");
        }
    }

    async fn on_ready_by_another_session(&mut self, via_room: Option<&RoomId>, flow_id: &str) {
        let changed = self
            .registry
            .find_request_mut(flow_id)
            .filter(|r| r.matches_transport(via_room))
            .map(|r| {
                let changed = r.transition(VerificationRequestState::HandledByOtherSession);
                (changed, r.other_user_id.clone())
            });

        if let Some((true, other_user_id)) = changed {
            debug!(flow_id, "The request was accepted by another one of our devices");
            self.publish_request(&other_user_id, flow_id).await;
        }
    }

    #[instrument(skip_all, fields(%flow_id))]
    async fn ready_request(
        &mut self,
        flow_id: &str,
        methods: Vec<VerificationMethod>,
    ) -> VerificationResult<PendingVerificationRequest> {
        let request = self
            .registry
            .find_request(flow_id)
            .cloned()
            .ok_or_else(|| VerificationError::UnknownRequest(flow_id.to_owned()))?;

        if request.state != VerificationRequestState::Requested {
            return Err(VerificationError::InvalidState(
                "only requests that were received and not yet answered can be accepted",
            ));
        }

        let methods =
            if methods.is_empty() { self.config.supported_methods.clone() } else { methods };
        let their_methods = &request.request_info.methods;
        let common_methods = method_agreement(their_methods, &methods);

        if common_methods.is_empty() {
            debug!(?their_methods, ours = ?methods, "No common verification methods");
            return Err(VerificationError::NoCommonMethod);
        }

        let qr_code_data = if can_scan(their_methods)
            && methods.contains(&VerificationMethod::QrCodeShowV1)
        {
            let keys =
                self.qr_keys(&request.other_user_id, &request.request_info.from_device).await;
            create_qr_code_data(&request.flow_id, request.other_user_id == self.own_user_id, keys)
        } else {
            None
        };

        let content = ReadyContent {
            from_device: self.own_device_id.clone(),
            methods: common_methods.clone(),
        };
        let content = OutgoingContent::new(&request.flow_id, MessageType::Ready, content)?;
        self.send_to_other(&request, content).await?;

        let user_id = request.other_user_id.clone();
        let request = self
            .registry
            .request_mut(&user_id, flow_id)
            .ok_or_else(|| VerificationError::UnknownRequest(flow_id.to_owned()))?;

        request.ready_info = Some(ReadyInfo {
            flow_id: flow_id.to_owned(),
            from_device: self.own_device_id.clone(),
            methods: common_methods,
        });
        request.qr_code_data = qr_code_data;
        request.transition(VerificationRequestState::Ready);

        let pending = request.to_pending();
        self.publish(VerificationEvent::RequestUpdated(pending.clone())).await;

        Ok(pending)
    }

    /// Get a request that is ready for a verification method to be started.
    fn ready_request_for(
        &self,
        other_user_id: &UserId,
        flow_id: &str,
    ) -> VerificationResult<(VerificationRequest, OwnedDeviceId)> {
        let request = self
            .registry
            .request(other_user_id, flow_id)
            .cloned()
            .ok_or_else(|| VerificationError::UnknownRequest(flow_id.to_owned()))?;

        if request.state != VerificationRequestState::Ready {
            return Err(VerificationError::InvalidState(
                "a verification method can only be started on a ready request",
            ));
        }

        let other_device_id =
            request.other_device_id().ok_or(VerificationError::MissingOtherDevice)?;

        if self.registry.has_transaction(other_user_id, flow_id) {
            return Err(VerificationError::AlreadyStarted);
        }

        Ok((request, other_device_id))
    }

    #[instrument(skip_all, fields(%other_user_id, %flow_id))]
    async fn start_sas(
        &mut self,
        other_user_id: &UserId,
        flow_id: &str,
    ) -> VerificationResult<VerificationTransaction> {
        let (request, other_device_id) = self.ready_request_for(other_user_id, flow_id)?;

        let sas_agreed = request
            .ready_info
            .as_ref()
            .is_some_and(|r| r.methods.contains(&VerificationMethod::SasV1));

        if !sas_agreed {
            return Err(VerificationError::InvalidState("the SAS method wasn't agreed on"));
        }

        let own_fingerprint = self
            .own_fingerprint()
            .await
            .ok_or(VerificationError::InvalidState("the keys of our own device are unknown"))?;
        let own_master_key = self.trust.my_trusted_master_key().await;

        let (sas, content) = SasTransaction::start(
            request.flow_id.clone(),
            self.sas_ids(other_user_id, &other_device_id),
            own_fingerprint,
            own_master_key,
            self.crypto.new_key_agreement(),
        )?;

        self.send_to_other(&request, content).await?;

        self.registry
            .insert_transaction(other_user_id, sas.into())
            .map_err(|_| VerificationError::AlreadyStarted)?;

        info!(other_device_id = other_device_id.as_str(), "Started a SAS verification");

        self.publish_transaction(other_user_id, flow_id, true).await;
        self.update_request(other_user_id, flow_id, VerificationRequestState::WeStarted).await;

        self.registry
            .transaction(other_user_id, flow_id)
            .map(Verification::to_snapshot)
            .ok_or_else(|| VerificationError::UnknownTransaction(flow_id.to_owned()))
    }

    #[instrument(skip_all, fields(%other_user_id, %flow_id))]
    async fn reciprocate_qr(
        &mut self,
        other_user_id: &UserId,
        flow_id: &str,
        scanned_data: &[u8],
    ) -> VerificationResult<VerificationTransaction> {
        let (request, other_device_id) = self.ready_request_for(other_user_id, flow_id)?;
        let data = QrCodeData::from_bytes(scanned_data)?;

        if data.flow_id() != flow_id {
            warn!(scanned_flow_id = data.flow_id(), "The scanned QR code belongs to another flow");
            self.cancel_request(other_user_id, flow_id, CancelCode::MismatchedKeys).await;
            return Err(VerificationError::Cancelled(CancelCode::MismatchedKeys));
        }

        let keys = self.qr_keys(other_user_id, &other_device_id).await;

        let trust = match check_scanned_code(&data, &keys, &other_device_id) {
            Ok(trust) => trust,
            Err(code) => {
                self.cancel_request(other_user_id, flow_id, code).await;
                return Err(VerificationError::Cancelled(code));
            }
        };

        let content = StartContent {
            from_device: self.own_device_id.clone(),
            method: VerificationMethod::ReciprocateV1,
            key_agreement_protocols: Vec::new(),
            hashes: Vec::new(),
            message_authentication_codes: Vec::new(),
            short_authentication_strings: Vec::new(),
            secret: Some(data.secret().encode()),
        };
        let content = OutgoingContent::new(&request.flow_id, MessageType::Start, content)?;
        self.send_to_other(&request, content).await?;

        let transaction = QrTransaction::scanned(
            request.flow_id.clone(),
            other_user_id.to_owned(),
            other_device_id,
            trust,
        );

        self.registry
            .insert_transaction(other_user_id, transaction.into())
            .map_err(|_| VerificationError::AlreadyStarted)?;

        info!("Reciprocated a scanned QR code");

        self.publish_transaction(other_user_id, flow_id, true).await;
        self.update_request(other_user_id, flow_id, VerificationRequestState::WeStarted).await;

        self.registry
            .transaction(other_user_id, flow_id)
            .map(Verification::to_snapshot)
            .ok_or_else(|| VerificationError::UnknownTransaction(flow_id.to_owned()))
    }

    /// Get the request and the transaction of a QR code that we displayed and
    /// that is waiting for the user to confirm the scan.
    fn displayed_qr(
        &mut self,
        other_user_id: &UserId,
        flow_id: &str,
    ) -> VerificationResult<(VerificationRequest, &mut QrTransaction)> {
        let request = self
            .registry
            .request(other_user_id, flow_id)
            .cloned()
            .ok_or_else(|| VerificationError::UnknownRequest(flow_id.to_owned()))?;

        let qr = self
            .registry
            .qr_mut(other_user_id, flow_id)
            .ok_or_else(|| VerificationError::UnknownTransaction(flow_id.to_owned()))?;

        if qr.we_scanned() || qr.state() != QrState::WaitingForScanConfirmation {
            return Err(VerificationError::InvalidState(
                "the QR code verification isn't waiting for a scan confirmation",
            ));
        }

        Ok((request, qr))
    }

    #[instrument(skip_all, fields(%other_user_id, %flow_id))]
    async fn confirm_qr_scanned(
        &mut self,
        other_user_id: &UserId,
        flow_id: &str,
    ) -> VerificationResult<()> {
        let (request, qr) = self.displayed_qr(other_user_id, flow_id)?;
        let trust = qr.pending_trust().clone();

        self.apply_trust(other_user_id, &trust.devices, trust.master_key).await;

        let content =
            OutgoingContent::new(&request.flow_id, MessageType::Done, DoneContent::default())?;
        self.send_to_other(&request, content).await?;

        if let Some(qr) = self.registry.qr_mut(other_user_id, flow_id) {
            qr.set_state(QrState::WaitingForOtherDone);
        }

        self.publish_transaction(other_user_id, flow_id, false).await;
        self.update_request(other_user_id, flow_id, VerificationRequestState::WaitingForDone).await;

        Ok(())
    }

    #[instrument(skip_all, fields(%other_user_id, %flow_id))]
    async fn deny_qr_scanned(
        &mut self,
        other_user_id: &UserId,
        flow_id: &str,
    ) -> VerificationResult<()> {
        self.displayed_qr(other_user_id, flow_id)?;
        self.cancel_request(other_user_id, flow_id, CancelCode::MismatchedKeys).await;

        Ok(())
    }

    #[instrument(skip_all, fields(%sender, flow_id = %info.flow_id))]
    async fn on_start_received(
        &mut self,
        sender: &UserId,
        via_room: Option<&RoomId>,
        info: StartInfo,
    ) {
        let Some(request) = self.matching_request(sender, &info.flow_id, via_room) else { return };
        let flow_id = info.flow_id.as_str();

        if self.registry.has_transaction(sender, flow_id) {
            warn!("Received a start for a request that already has a verification in progress");
            self.cancel_request(sender, flow_id, CancelCode::UnexpectedMessage).await;
            return;
        }

        if request.state != VerificationRequestState::Ready {
            warn!(state = ?request.state, "Received a start for a request that isn't ready");
            self.cancel_request(sender, flow_id, CancelCode::UnexpectedMessage).await;
            return;
        }

        let agreed_methods =
            request.ready_info.as_ref().map(|r| r.methods.as_slice()).unwrap_or_default();

        match info.method {
            StartMethod::Sas(start) => {
                if !agreed_methods.contains(&VerificationMethod::SasV1) {
                    self.cancel_request(sender, flow_id, CancelCode::UnknownMethod).await;
                    return;
                }

                let Some(own_fingerprint) = self.own_fingerprint().await else {
                    warn!(
                        "The keys of our own device are unknown, can't accept the SAS verification"
                    );
                    self.cancel_request(sender, flow_id, CancelCode::UserError).await;
                    return;
                };
                let own_master_key = self.trust.my_trusted_master_key().await;

                let accepted = SasTransaction::from_start(
                    request.flow_id.clone(),
                    self.sas_ids(sender, &info.from_device),
                    own_fingerprint,
                    own_master_key,
                    self.crypto.new_key_agreement(),
                    &start,
                    self.crypto.as_ref(),
                );

                let (sas, accept) = match accepted {
                    Ok(accepted) => accepted,
                    Err(code) => {
                        warn!(%code, "Can't accept the SAS verification");
                        self.cancel_request(sender, flow_id, code).await;
                        return;
                    }
                };

                let content = OutgoingContent::new(&request.flow_id, MessageType::Accept, accept);
                let sent = match content {
                    Ok(content) => self.send_to_other(&request, content).await,
                    Err(e) => Err(TransportError::new(e)),
                };

                if let Err(e) = sent {
                    warn!(error = ?e, "Failed to send the SAS accept message");
                    self.cancel_request(sender, flow_id, CancelCode::UserError).await;
                    return;
                }

                if self.registry.insert_transaction(sender, sas.into()).is_err() {
                    return;
                }

                info!(from_device = info.from_device.as_str(), "Accepted a SAS verification");
            }
            StartMethod::Reciprocate { secret } => {
                let Some(data) = &request.qr_code_data else {
                    warn!("Received a QR code reciprocation, but we didn't display a QR code");
                    self.cancel_request(sender, flow_id, CancelCode::UnknownMethod).await;
                    return;
                };

                if !secrets_match(data.secret(), &secret) {
                    warn!("The shared secret of the QR code reciprocation didn't match");
                    self.cancel_request(sender, flow_id, CancelCode::MismatchedKeys).await;
                    return;
                }

                let transaction = QrTransaction::displayed(
                    request.flow_id.clone(),
                    sender.to_owned(),
                    info.from_device.clone(),
                    data,
                );

                if self.registry.insert_transaction(sender, transaction.into()).is_err() {
                    return;
                }

                info!(
                    from_device = info.from_device.as_str(),
                    "The other side scanned our QR code"
                );
            }
        }

        self.publish_transaction(sender, flow_id, true).await;
        self.update_request(sender, flow_id, VerificationRequestState::Started).await;
    }

    #[instrument(skip_all, fields(%sender, flow_id = %info.flow_id))]
    async fn on_accept_received(
        &mut self,
        sender: &UserId,
        via_room: Option<&RoomId>,
        info: AcceptInfo,
    ) {
        let Some(request) = self.matching_request(sender, &info.flow_id, via_room) else { return };
        let flow_id = info.flow_id.clone();

        let Some(sas) = self.registry.sas_mut(sender, &flow_id) else {
            debug!("Received an accept for an unknown SAS verification");
            return;
        };

        if sas.is_incoming() || sas.state() != SasState::Started {
            warn!(state = ?sas.state(), "Received an accept in an unexpected state");
            self.cancel_request(sender, &flow_id, CancelCode::UnexpectedMessage).await;
            return;
        }

        if let Err(code) = sas.receive_accept(info) {
            warn!(%code, "The accepted SAS parameters are unknown");
            self.cancel_request(sender, &flow_id, code).await;
            return;
        }

        let key = sas.key_content();

        let sent = match OutgoingContent::new(&request.flow_id, MessageType::Key, key) {
            Ok(content) => self.send_to_other(&request, content).await,
            Err(e) => Err(TransportError::new(e)),
        };

        if let Err(e) = sent {
            warn!(error = ?e, "Failed to send our SAS key");
            self.cancel_request(sender, &flow_id, CancelCode::UserError).await;
            return;
        }

        if let Some(sas) = self.registry.sas_mut(sender, &flow_id) {
            sas.set_state(SasState::KeySent);
        }

        self.publish_transaction(sender, &flow_id, false).await;
    }

    #[instrument(skip_all, fields(%sender, flow_id = %info.flow_id))]
    async fn on_key_received(&mut self, sender: &UserId, via_room: Option<&RoomId>, info: KeyInfo) {
        let Some(request) = self.matching_request(sender, &info.flow_id, via_room) else { return };
        let flow_id = info.flow_id.as_str();

        let Some(sas) = self.registry.sas_mut(sender, flow_id) else {
            debug!("Received a key for an unknown SAS verification");
            return;
        };

        let expected_state = if sas.is_incoming() { SasState::Accepted } else { SasState::KeySent };

        if sas.state() != expected_state {
            warn!(state = ?sas.state(), "Received a key in an unexpected state");
            self.cancel_request(sender, flow_id, CancelCode::UnexpectedMessage).await;
            return;
        }

        if let Err(code) = sas.receive_key(&info.key, self.crypto.as_ref()) {
            self.cancel_request(sender, flow_id, code).await;
            return;
        }

        if sas.is_incoming() {
            let key = sas.key_content();

            let sent = match OutgoingContent::new(&request.flow_id, MessageType::Key, key) {
                Ok(content) => self.send_to_other(&request, content).await,
                Err(e) => Err(TransportError::new(e)),
            };

            if let Err(e) = sent {
                warn!(error = ?e, "Failed to send our SAS key");
                self.cancel_request(sender, flow_id, CancelCode::UserError).await;
                return;
            }
        }

        if let Some(sas) = self.registry.sas_mut(sender, flow_id) {
            sas.set_state(SasState::ShortCodeReady);
        }

        debug!("The short auth string is ready to be compared");
        self.publish_transaction(sender, flow_id, false).await;
    }

    /// Get the request and the SAS transaction on which the user can compare
    /// the short auth string.
    fn sas_awaiting_confirmation(
        &mut self,
        flow_id: &str,
    ) -> VerificationResult<(VerificationRequest, &mut SasTransaction)> {
        let request = self
            .registry
            .find_request(flow_id)
            .cloned()
            .ok_or_else(|| VerificationError::UnknownRequest(flow_id.to_owned()))?;

        if !matches!(
            request.state,
            VerificationRequestState::Started | VerificationRequestState::WeStarted
        ) {
            return Err(VerificationError::InvalidState(
                "the short auth string can only be compared on a started verification",
            ));
        }

        let sas = self
            .registry
            .sas_mut(&request.other_user_id, flow_id)
            .ok_or_else(|| VerificationError::UnknownTransaction(flow_id.to_owned()))?;

        if !matches!(
            sas.state(),
            SasState::ShortCodeReady | SasState::MacReceived { code_confirmed: false }
        ) {
            return Err(VerificationError::InvalidState(
                "the SAS verification isn't waiting for the short auth string to be compared",
            ));
        }

        Ok((request, sas))
    }

    #[instrument(skip_all, fields(%flow_id))]
    async fn sas_code_does_not_match(&mut self, flow_id: &str) -> VerificationResult<()> {
        let (request, _) = self.sas_awaiting_confirmation(flow_id)?;
        self.cancel_request(&request.other_user_id, flow_id, CancelCode::MismatchedSas).await;

        Ok(())
    }

    #[instrument(skip_all, fields(%flow_id))]
    async fn sas_code_matches(&mut self, flow_id: &str) -> VerificationResult<()> {
        let (request, sas) = self.sas_awaiting_confirmation(flow_id)?;
        let mac = sas.compute_my_mac()?;
        let their_mac_received = sas.their_mac().is_some();

        let content = OutgoingContent::new(&request.flow_id, MessageType::Mac, mac)?;
        // The user can retry if sending fails, the state stays untouched.
        self.send_to_other(&request, content).await?;

        if their_mac_received {
            self.finalize_sas(&request).await;
        } else {
            if let Some(sas) = self.registry.sas_mut(&request.other_user_id, flow_id) {
                sas.set_state(SasState::MacSent);
            }

            self.publish_transaction(&request.other_user_id, flow_id, false).await;
        }

        Ok(())
    }

    #[instrument(skip_all, fields(%sender, flow_id = %info.flow_id))]
    async fn on_mac_received(&mut self, sender: &UserId, via_room: Option<&RoomId>, info: MacInfo) {
        let Some(request) = self.matching_request(sender, &info.flow_id, via_room) else { return };
        let flow_id = info.flow_id.clone();

        let Some(sas) = self.registry.sas_mut(sender, &flow_id) else {
            debug!("Received a MAC for an unknown SAS verification");
            return;
        };

        match sas.state() {
            SasState::MacSent => {
                sas.set_their_mac(info);
                self.finalize_sas(&request).await;
            }
            SasState::ShortCodeReady => {
                sas.set_their_mac(info);

                if self.config.finalize_early_mac {
                    match self.verify_their_mac(&request).await {
                        Some(MacVerification::Success { .. }) => {}
                        Some(result) => {
                            warn!(?result, "The early MAC of the other side didn't match");
                            self.cancel_request(sender, &flow_id, CancelCode::MismatchedKeys).await;
                            return;
                        }
                        None => {
                            self.cancel_request(sender, &flow_id, CancelCode::UserError).await;
                            return;
                        }
                    }
                }

                if let Some(sas) = self.registry.sas_mut(sender, &flow_id) {
                    sas.set_state(SasState::MacReceived { code_confirmed: false });
                }

                self.publish_transaction(sender, &flow_id, false).await;
            }
            state => {
                warn!(?state, "Received a MAC in an unexpected state");
                self.cancel_request(sender, &flow_id, CancelCode::UnexpectedMessage).await;
            }
        }
    }

    /// Check the MAC the other side sent us against the keys our trust backend
    /// knows.
    ///
    /// Returns `None` if the MAC couldn't be calculated.
    async fn verify_their_mac(&mut self, request: &VerificationRequest) -> Option<MacVerification> {
        let other_user_id = &request.other_user_id;
        let devices = self.trust.user_devices(other_user_id).await;
        let master_key = self.trust.user_master_key(other_user_id).await;

        let sas = self.registry.sas_mut(other_user_id, request.flow_id.as_str())?;
        let their_mac = sas.their_mac()?.clone();

        match sas.verify_macs(&their_mac, &devices, master_key.as_deref()) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(error = ?e, "Failed to calculate the SAS MAC");
                None
            }
        }
    }

    /// Both sides confirmed the short auth string, check the MAC of the other
    /// side and trust its keys.
    async fn finalize_sas(&mut self, request: &VerificationRequest) {
        let other_user_id = &request.other_user_id;
        let flow_id = request.flow_id.as_str();

        let (devices, master_key_trusted) = match self.verify_their_mac(request).await {
            Some(MacVerification::Success { devices, master_key_trusted }) => {
                (devices, master_key_trusted)
            }
            Some(result) => {
                warn!(?result, "The MAC of the other side didn't match");
                self.cancel_request(other_user_id, flow_id, CancelCode::MismatchedKeys).await;
                return;
            }
            None => {
                self.cancel_request(other_user_id, flow_id, CancelCode::UserError).await;
                return;
            }
        };

        self.apply_trust(other_user_id, &devices, master_key_trusted).await;

        let content =
            OutgoingContent::new(&request.flow_id, MessageType::Done, DoneContent::default());
        let sent = match content {
            Ok(content) => self.send_to_other(request, content).await,
            Err(e) => Err(TransportError::new(e)),
        };

        if let Err(e) = sent {
            warn!(flow_id, error = ?e, "Failed to send the done message");
        }

        if let Some(sas) = self.registry.sas_mut(other_user_id, flow_id) {
            sas.set_state(SasState::Done { other_done: false });
        }

        info!(flow_id, "The SAS verification succeeded");

        self.publish_transaction(other_user_id, flow_id, false).await;
        self.registry.finish_transaction(other_user_id, flow_id);
        self.update_request(other_user_id, flow_id, VerificationRequestState::WaitingForDone).await;
    }

    #[instrument(skip_all, fields(%sender, %flow_id))]
    async fn on_done_received(
        &mut self,
        sender: &UserId,
        via_room: Option<&RoomId>,
        flow_id: &str,
    ) {
        let Some(request) = self.matching_request(sender, flow_id, via_room) else { return };

        // A successful SAS verification was already moved out of the active
        // set on our side.
        if let Some(Verification::Sas(sas)) = self.registry.past_transaction_mut(sender, flow_id) {
            if sas.state() == (SasState::Done { other_done: false }) {
                sas.set_state(SasState::Done { other_done: true });
                let snapshot = VerificationTransaction::Sas(sas.to_snapshot());

                self.publish(VerificationEvent::TransactionUpdated(snapshot)).await;
                self.update_request(sender, flow_id, VerificationRequestState::Done).await;
            } else {
                debug!(state = ?sas.state(), "Ignoring a done message in an unexpected state");
            }

            return;
        }

        let Some(qr) = self.registry.qr_mut(sender, flow_id) else {
            debug!("Received a done message for an unknown verification");
            return;
        };

        match qr.state() {
            QrState::WaitingForOtherDone => {}
            QrState::Reciprocated => {
                // The other side confirmed our scan, now we can trust its keys.
                let trust = qr.pending_trust().clone();
                self.apply_trust(sender, &trust.devices, trust.master_key).await;

                let content = OutgoingContent::new(
                    &request.flow_id,
                    MessageType::Done,
                    DoneContent::default(),
                );
                let sent = match content {
                    Ok(content) => self.send_to_other(&request, content).await,
                    Err(e) => Err(TransportError::new(e)),
                };

                if let Err(e) = sent {
                    warn!(error = ?e, "Failed to send the done message");
                }
            }
            state => {
                debug!(?state, "Ignoring a done message in an unexpected state");
                return;
            }
        }

        if let Some(qr) = self.registry.qr_mut(sender, flow_id) {
            qr.set_state(QrState::Done);
        }

        info!("The QR code verification succeeded");

        self.publish_transaction(sender, flow_id, false).await;
        self.registry.finish_transaction(sender, flow_id);
        self.update_request(sender, flow_id, VerificationRequestState::Done).await;
    }

    #[instrument(skip_all, fields(%flow_id))]
    async fn cancel(&mut self, flow_id: &str) -> VerificationResult<()> {
        let request = self
            .registry
            .find_request(flow_id)
            .ok_or_else(|| VerificationError::UnknownRequest(flow_id.to_owned()))?;

        if request.is_finished() {
            debug!(state = ?request.state, "The request is already finished");
            return Ok(());
        }

        let other_user_id = request.other_user_id.clone();
        self.cancel_request(&other_user_id, flow_id, CancelCode::User).await;

        Ok(())
    }

    #[instrument(skip_all, fields(%sender, %flow_id))]
    async fn on_unable_to_decrypt(&mut self, sender: &UserId, flow_id: &str) {
        let Some(request) = self.registry.request(sender, flow_id) else { return };

        if request.state == VerificationRequestState::HandledByOtherSession {
            trace!("Ignoring an undecryptable event of a request handled by another session");
            return;
        }

        warn!("A verification event couldn't be decrypted");
        self.cancel_request(sender, flow_id, CancelCode::InvalidMessage).await;
    }

    #[instrument(skip_all, fields(%sender, flow_id = %info.flow_id, code = %info.code))]
    async fn on_cancel_received(
        &mut self,
        sender: &UserId,
        via_room: Option<&RoomId>,
        info: CancelInfo,
    ) {
        let flow_id = info.flow_id.as_str();

        let Some(request) = self.registry.request_mut(sender, flow_id) else {
            debug!("Received a cancellation for an unknown request");
            return;
        };

        if !request.matches_transport(via_room) {
            warn!("Dropping a cancellation that arrived over the wrong transport");
            return;
        }

        if !request.cancel(info.code) {
            return;
        }

        info!(reason = %info.reason, "The other side cancelled the verification");

        if let Some(mut verification) = self.registry.remove_transaction(sender, flow_id) {
            let code = info.code;

            match &mut verification {
                Verification::Sas(sas) => sas.set_state(SasState::Cancelled { code, by_me: false }),
                Verification::Qr(qr) => qr.set_state(QrState::Cancelled { code, by_me: false }),
            }

            self.publish(VerificationEvent::TransactionUpdated(verification.to_snapshot())).await;
            self.registry.archive_transaction(sender, verification);
        }

        self.publish_request(sender, flow_id).await;
    }
}
