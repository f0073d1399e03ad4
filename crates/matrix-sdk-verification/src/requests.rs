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

use ruma::{MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId};
use tracing::{debug, trace};

use crate::{
    event_enums::{ReadyInfo, RequestInfo},
    qrcode::QrCodeData,
    CancelCode, FlowId, VerificationMethod,
};

/// The state of a verification request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationRequestState {
    /// We sent the request and are waiting for the other side to accept it.
    WaitingForReady,
    /// The other side sent us a request.
    Requested,
    /// The request has been accepted, a verification method can be started.
    Ready,
    /// The other side started a verification method.
    Started,
    /// We started a verification method.
    WeStarted,
    /// We finished our side of the verification and are waiting for the
    /// `done` message of the other side.
    WaitingForDone,
    /// The verification succeeded.
    Done,
    /// The request got cancelled.
    Cancelled,
    /// Another device of our own user accepted the request.
    HandledByOtherSession,
}

/// Does the list of methods allow the device to scan a QR code.
pub(crate) fn can_scan(methods: &[VerificationMethod]) -> bool {
    methods.contains(&VerificationMethod::QrCodeScanV1)
        && methods.contains(&VerificationMethod::ReciprocateV1)
}

/// Does the list of methods allow the device to show a QR code.
pub(crate) fn can_show(methods: &[VerificationMethod]) -> bool {
    methods.contains(&VerificationMethod::QrCodeShowV1)
        && methods.contains(&VerificationMethod::ReciprocateV1)
}

fn can_sas(methods: &[VerificationMethod]) -> bool {
    methods.contains(&VerificationMethod::SasV1)
}

fn push_unique(methods: &mut Vec<VerificationMethod>, method: VerificationMethod) {
    if !methods.contains(&method) {
        methods.push(method);
    }
}

/// The methods we advertise in an outgoing request.
///
/// QR codes can only be exchanged if we trust our own master key, the
/// reciprocate method is added in that case. Otherwise every QR related method
/// is left out.
pub(crate) fn request_methods(
    methods: &[VerificationMethod],
    master_key_trusted: bool,
) -> Vec<VerificationMethod> {
    let is_qr = |m: &VerificationMethod| {
        matches!(
            m,
            VerificationMethod::QrCodeScanV1
                | VerificationMethod::QrCodeShowV1
                | VerificationMethod::ReciprocateV1
        )
    };

    let mut result = Vec::new();

    if master_key_trusted {
        for method in methods {
            push_unique(&mut result, method.clone());
        }

        if methods.iter().any(is_qr) {
            push_unique(&mut result, VerificationMethod::ReciprocateV1);
        }
    } else {
        for method in methods.iter().filter(|m| !is_qr(m)) {
            push_unique(&mut result, method.clone());
        }
    }

    result
}

/// The methods both sides can use, given the methods the other side offered
/// and the ones we want to use.
pub(crate) fn method_agreement(
    theirs: &[VerificationMethod],
    ours: &[VerificationMethod],
) -> Vec<VerificationMethod> {
    let mut result = Vec::new();

    if can_sas(theirs) && ours.contains(&VerificationMethod::SasV1) {
        push_unique(&mut result, VerificationMethod::SasV1);
    }

    if theirs.contains(&VerificationMethod::QrCodeScanV1)
        && ours.contains(&VerificationMethod::QrCodeShowV1)
    {
        push_unique(&mut result, VerificationMethod::QrCodeShowV1);
        push_unique(&mut result, VerificationMethod::ReciprocateV1);
    }

    if theirs.contains(&VerificationMethod::QrCodeShowV1)
        && ours.contains(&VerificationMethod::QrCodeScanV1)
    {
        push_unique(&mut result, VerificationMethod::QrCodeScanV1);
        push_unique(&mut result, VerificationMethod::ReciprocateV1);
    }

    result
}

/// A verification request, the handshake that precedes any verification method.
#[derive(Clone, Debug)]
pub(crate) struct VerificationRequest {
    pub flow_id: FlowId,
    pub other_user_id: OwnedUserId,
    /// Did the other side send the request.
    pub incoming: bool,
    pub state: VerificationRequestState,
    pub created_at: MilliSecondsSinceUnixEpoch,
    /// The content of the request, ours if we sent it.
    pub request_info: RequestInfo,
    pub ready_info: Option<ReadyInfo>,
    /// Set if the other side can scan a code that we display.
    pub qr_code_data: Option<QrCodeData>,
    /// The devices a to-device request was sent to.
    pub target_devices: Vec<OwnedDeviceId>,
    pub cancel_code: Option<CancelCode>,
}

impl VerificationRequest {
    pub fn outgoing(
        flow_id: FlowId,
        other_user_id: OwnedUserId,
        request_info: RequestInfo,
        target_devices: Vec<OwnedDeviceId>,
    ) -> Self {
        Self {
            flow_id,
            other_user_id,
            incoming: false,
            state: VerificationRequestState::WaitingForReady,
            created_at: request_info.timestamp.unwrap_or_else(MilliSecondsSinceUnixEpoch::now),
            request_info,
            ready_info: None,
            qr_code_data: None,
            target_devices,
            cancel_code: None,
        }
    }

    pub fn incoming(
        flow_id: FlowId,
        other_user_id: OwnedUserId,
        request_info: RequestInfo,
    ) -> Self {
        Self {
            flow_id,
            other_user_id,
            incoming: true,
            state: VerificationRequestState::Requested,
            created_at: MilliSecondsSinceUnixEpoch::now(),
            request_info,
            ready_info: None,
            qr_code_data: None,
            target_devices: Vec::new(),
            cancel_code: None,
        }
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.flow_id.room_id()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, VerificationRequestState::Cancelled | VerificationRequestState::Done)
    }

    /// Did the event arrive over the transport this request uses.
    pub fn matches_transport(&self, via_room: Option<&RoomId>) -> bool {
        self.room_id() == via_room
    }

    /// The device on the other side, known once the request was accepted if
    /// we sent it.
    pub fn other_device_id(&self) -> Option<OwnedDeviceId> {
        if self.incoming {
            Some(self.request_info.from_device.clone())
        } else {
            self.ready_info.as_ref().map(|r| r.from_device.clone())
        }
    }

    fn our_methods(&self) -> &[VerificationMethod] {
        if self.incoming {
            self.ready_info.as_ref().map(|r| r.methods.as_slice()).unwrap_or_default()
        } else {
            &self.request_info.methods
        }
    }

    fn their_methods(&self) -> &[VerificationMethod] {
        if self.incoming {
            &self.request_info.methods
        } else {
            self.ready_info.as_ref().map(|r| r.methods.as_slice()).unwrap_or_default()
        }
    }

    /// Move the request into a new state.
    ///
    /// Returns `false` and leaves the request untouched if it already
    /// finished.
    pub fn transition(&mut self, state: VerificationRequestState) -> bool {
        if self.is_finished() {
            debug!(
                flow_id = self.flow_id.as_str(),
                state = ?self.state,
                new_state = ?state,
                "Refusing to change the state of a finished request"
            );

            return false;
        }

        trace!(
            flow_id = self.flow_id.as_str(),
            from = ?self.state,
            to = ?state,
            "Request state change"
        );
        self.state = state;

        true
    }

    /// Move the request into the cancelled state.
    pub fn cancel(&mut self, code: CancelCode) -> bool {
        let changed = self.transition(VerificationRequestState::Cancelled);

        if changed {
            self.cancel_code = Some(code);
        }

        changed
    }

    pub fn to_pending(&self) -> PendingVerificationRequest {
        let ours = self.our_methods();
        let theirs = self.their_methods();

        PendingVerificationRequest {
            flow_id: self.flow_id.as_str().to_owned(),
            room_id: self.room_id().map(ToOwned::to_owned),
            other_user_id: self.other_user_id.clone(),
            other_device_id: self.other_device_id(),
            state: self.state,
            is_incoming: self.incoming,
            created_at: self.created_at,
            request_info: self.request_info.clone(),
            ready_info: self.ready_info.clone(),
            cancel_code: self.cancel_code,
            is_finished: self.is_finished(),
            is_sas_supported: can_sas(ours) && can_sas(theirs),
            we_should_display_qr_code: can_scan(theirs) && can_show(ours),
            we_should_show_scan_option: can_scan(ours) && can_show(theirs),
            qr_code: self.qr_code_data.as_ref().and_then(|data| data.to_bytes().ok()),
        }
    }
}

/// An immutable snapshot of a verification request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingVerificationRequest {
    /// The flow id of the request, the transaction id for to-device requests
    /// or the event id of the request for in-room requests.
    pub flow_id: String,
    /// The room of an in-room request.
    pub room_id: Option<OwnedRoomId>,
    /// The user on the other side.
    pub other_user_id: OwnedUserId,
    /// The device on the other side, if known.
    pub other_device_id: Option<OwnedDeviceId>,
    /// The state of the request.
    pub state: VerificationRequestState,
    /// Did the other side send the request.
    pub is_incoming: bool,
    /// When the request was created.
    pub created_at: MilliSecondsSinceUnixEpoch,
    /// The content of the request.
    pub request_info: RequestInfo,
    /// The content of the ready message, once the request got accepted.
    pub ready_info: Option<ReadyInfo>,
    /// Why the request got cancelled.
    pub cancel_code: Option<CancelCode>,
    /// Is the request done or cancelled.
    pub is_finished: bool,
    /// Can the SAS method be started.
    pub is_sas_supported: bool,
    /// Should we display a QR code for the other side to scan.
    pub we_should_display_qr_code: bool,
    /// Should we offer the user to scan the QR code of the other side.
    pub we_should_show_scan_option: bool,
    /// The payload of the QR code we display, if any.
    pub qr_code: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id, OwnedTransactionId};

    use super::*;

    use crate::VerificationMethod::{QrCodeScanV1, QrCodeShowV1, ReciprocateV1, SasV1};

    fn request(incoming: bool) -> VerificationRequest {
        let info = RequestInfo {
            from_device: device_id!("BOBDEVICE").to_owned(),
            methods: vec![SasV1, QrCodeShowV1, QrCodeScanV1, ReciprocateV1],
            timestamp: None,
        };
        let flow_id = FlowId::ToDevice(OwnedTransactionId::from("flow"));
        let user_id = user_id!("@bob:example.org").to_owned();

        if incoming {
            VerificationRequest::incoming(flow_id, user_id, info)
        } else {
            VerificationRequest::outgoing(flow_id, user_id, info, Vec::new())
        }
    }

    #[test]
    fn requested_methods() {
        let methods = [SasV1, QrCodeShowV1, QrCodeScanV1, SasV1];

        assert_eq!(
            request_methods(&methods, true),
            [SasV1, QrCodeShowV1, QrCodeScanV1, ReciprocateV1]
        );
        assert_eq!(request_methods(&methods, false), [SasV1]);
        assert_eq!(request_methods(&[SasV1, QrCodeShowV1, ReciprocateV1], false), [SasV1]);
        assert_eq!(request_methods(&[SasV1], true), [SasV1]);
    }

    #[test]
    fn agreement() {
        let all = [SasV1, QrCodeShowV1, QrCodeScanV1, ReciprocateV1];

        assert!(method_agreement(&[], &all).is_empty());
        assert_eq!(method_agreement(&[SasV1], &all), [SasV1]);
        assert_eq!(
            method_agreement(&[QrCodeScanV1, ReciprocateV1], &all),
            [QrCodeShowV1, ReciprocateV1]
        );
        assert_eq!(
            method_agreement(&all, &[SasV1, QrCodeScanV1]),
            [SasV1, QrCodeScanV1, ReciprocateV1]
        );
        assert!(method_agreement(&[SasV1], &[QrCodeScanV1]).is_empty());
    }

    #[test]
    fn finished_requests_are_frozen() {
        let mut request = request(true);

        assert!(request.transition(VerificationRequestState::Ready));
        assert!(request.cancel(CancelCode::User));
        assert!(!request.transition(VerificationRequestState::Started));
        assert!(!request.cancel(CancelCode::MismatchedSas));

        assert_eq!(request.state, VerificationRequestState::Cancelled);
        assert_eq!(request.cancel_code, Some(CancelCode::User));
        assert!(request.to_pending().is_finished);
    }

    #[test]
    fn derived_capabilities() {
        let mut outgoing = request(false);
        let pending = outgoing.to_pending();

        assert_eq!(pending.other_device_id, None);
        assert!(!pending.is_sas_supported);

        outgoing.ready_info = Some(ReadyInfo {
            flow_id: "flow".to_owned(),
            from_device: device_id!("OTHERDEVICE").to_owned(),
            methods: vec![SasV1, QrCodeScanV1, ReciprocateV1],
        });

        let pending = outgoing.to_pending();
        assert_eq!(pending.other_device_id.as_deref(), Some(device_id!("OTHERDEVICE")));
        assert!(pending.is_sas_supported);
        assert!(pending.we_should_display_qr_code);
        assert!(!pending.we_should_show_scan_option);

        let incoming = request(true);
        assert_eq!(incoming.to_pending().other_device_id.as_deref(), Some(device_id!("BOBDEVICE")));
        assert!(incoming.to_pending().is_incoming);
    }
}
