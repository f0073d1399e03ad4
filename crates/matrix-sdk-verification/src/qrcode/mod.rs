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

//! The QR code reciprocation verification method.

mod data;

use ruma::{serde::Base64, DeviceId, OwnedDeviceId, OwnedUserId};
use subtle::ConstantTimeEq;
use tracing::{trace, warn};
use zeroize::Zeroizing;

pub use data::QrCodeData;

use crate::{CancelCode, FlowId};

const SECRET_SIZE: usize = 16;

/// The state of a QR code verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QrState {
    /// The other side scanned our QR code, we're waiting for the user to
    /// confirm that the scan succeeded.
    WaitingForScanConfirmation,
    /// We scanned the QR code of the other side and sent the reciprocation.
    Reciprocated,
    /// We confirmed the scan and sent our `done` message.
    WaitingForOtherDone,
    /// The verification has been completed.
    Done,
    /// The verification got cancelled.
    Cancelled {
        /// The reason for the cancellation.
        code: CancelCode,
        /// Did we cancel the verification.
        by_me: bool,
    },
}

impl QrState {
    /// Is this a terminal state.
    pub fn is_final(&self) -> bool {
        matches!(self, QrState::Done | QrState::Cancelled { .. })
    }
}

/// An immutable snapshot of a QR code verification.
#[derive(Clone, Debug, PartialEq)]
pub struct QrVerification {
    /// The flow id of the verification.
    pub flow_id: String,
    /// The user we're verifying.
    pub other_user_id: OwnedUserId,
    /// The device we're verifying.
    pub other_device_id: OwnedDeviceId,
    /// Did we scan the QR code, as opposed to displaying it.
    pub we_scanned: bool,
    /// Is the verification happening over to-device messages.
    pub is_to_device: bool,
    /// The current state of the verification.
    pub state: QrState,
}

/// The keys a QR code gets created from, or checked against, as known by our
/// trust backend.
#[derive(Clone, Debug, Default)]
pub(crate) struct QrKeys {
    /// Our own master key.
    pub own_master_key: Option<String>,
    /// Do we trust our own master key.
    pub own_master_key_trusted: bool,
    /// The master key of the other user.
    pub other_master_key: Option<String>,
    /// The fingerprint of our device.
    pub own_device_key: Option<String>,
    /// The fingerprint of the other device.
    pub other_device_key: Option<String>,
}

/// The keys that will be marked as trusted once the verification completes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct PendingTrust {
    pub devices: Vec<OwnedDeviceId>,
    pub master_key: bool,
}

impl PendingTrust {
    /// What the displaying side trusts once the scan got confirmed.
    fn for_displayed(data: &QrCodeData, other_device_id: &DeviceId) -> Self {
        match data {
            QrCodeData::SelfVerifyingMasterKeyTrusted { .. } => {
                Self { devices: vec![other_device_id.to_owned()], master_key: false }
            }
            QrCodeData::VerifyingAnotherUser { .. }
            | QrCodeData::SelfVerifyingMasterKeyNotTrusted { .. } => {
                Self { devices: Vec::new(), master_key: true }
            }
        }
    }
}

/// Generate a fresh random secret for a QR code.
pub(crate) fn generate_shared_secret() -> Base64 {
    use rand::RngCore;

    let mut secret = Zeroizing::new([0u8; SECRET_SIZE]);
    rand::thread_rng().fill_bytes(&mut *secret);

    Base64::new(secret.to_vec())
}

/// Compare the secret of our QR code with the one the scanner sent back.
pub(crate) fn secrets_match(ours: &Base64, theirs: &str) -> bool {
    ours.encode().as_bytes().ct_eq(theirs.as_bytes()).into()
}

/// Create the QR code we display for the given request.
///
/// Returns `None` if a key that the code needs is unknown.
pub(crate) fn create_qr_code_data(
    flow_id: &FlowId,
    self_verification: bool,
    keys: QrKeys,
) -> Option<QrCodeData> {
    let flow_id = flow_id.as_str().to_owned();
    let shared_secret = generate_shared_secret();

    let data = if !self_verification {
        QrCodeData::VerifyingAnotherUser {
            flow_id,
            master_key: keys.own_master_key?,
            other_master_key: keys.other_master_key?,
            shared_secret,
        }
    } else if keys.own_master_key_trusted {
        QrCodeData::SelfVerifyingMasterKeyTrusted {
            flow_id,
            master_key: keys.own_master_key?,
            other_device_key: keys.other_device_key?,
            shared_secret,
        }
    } else {
        QrCodeData::SelfVerifyingMasterKeyNotTrusted {
            flow_id,
            device_key: keys.own_device_key?,
            master_key: keys.own_master_key?,
            shared_secret,
        }
    };

    Some(data)
}

/// Check a scanned QR code against the keys we know.
///
/// On success returns what we will trust once the other side confirms the
/// scan.
pub(crate) fn check_scanned_code(
    data: &QrCodeData,
    keys: &QrKeys,
    other_device_id: &DeviceId,
) -> Result<PendingTrust, CancelCode> {
    let matches = |expected: &Option<String>, key: &str| {
        expected.as_deref().is_some_and(|e| bool::from(e.as_bytes().ct_eq(key.as_bytes())))
    };

    let trust = match data {
        QrCodeData::VerifyingAnotherUser { master_key, other_master_key, .. } => {
            if !matches(&keys.own_master_key, other_master_key) {
                warn!("The scanned code contains a wrong master key for our own user");
                return Err(CancelCode::MismatchedKeys);
            }

            if !matches(&keys.other_master_key, master_key) {
                warn!("The scanned code contains a wrong master key for the other user");
                return Err(CancelCode::MismatchedKeys);
            }

            PendingTrust { devices: Vec::new(), master_key: true }
        }
        QrCodeData::SelfVerifyingMasterKeyTrusted { master_key, other_device_key, .. } => {
            if !matches(&keys.own_master_key, master_key) {
                warn!("The scanned code contains a wrong master key");
                return Err(CancelCode::MismatchedKeys);
            }

            if !matches(&keys.own_device_key, other_device_key) {
                warn!("The scanned code contains a wrong key for our own device");
                return Err(CancelCode::MismatchedKeys);
            }

            PendingTrust { devices: Vec::new(), master_key: true }
        }
        QrCodeData::SelfVerifyingMasterKeyNotTrusted { device_key, master_key, .. } => {
            if !matches(&keys.own_master_key, master_key) {
                warn!("The scanned code contains a wrong master key");
                return Err(CancelCode::MismatchedKeys);
            }

            if !matches(&keys.other_device_key, device_key) {
                warn!("The scanned code contains a wrong key for the other device");
                return Err(CancelCode::MismatchedKeys);
            }

            PendingTrust { devices: vec![other_device_id.to_owned()], master_key: false }
        }
    };

    Ok(trust)
}

/// A QR code verification in progress.
#[derive(Debug)]
pub(crate) struct QrTransaction {
    flow_id: FlowId,
    other_user_id: OwnedUserId,
    other_device_id: OwnedDeviceId,
    we_scanned: bool,
    state: QrState,
    trust: PendingTrust,
}

impl QrTransaction {
    /// The other side scanned the code we displayed.
    pub fn displayed(
        flow_id: FlowId,
        other_user_id: OwnedUserId,
        other_device_id: OwnedDeviceId,
        data: &QrCodeData,
    ) -> Self {
        let trust = PendingTrust::for_displayed(data, &other_device_id);

        Self {
            flow_id,
            other_user_id,
            other_device_id,
            we_scanned: false,
            state: QrState::WaitingForScanConfirmation,
            trust,
        }
    }

    /// We scanned the code of the other side and reciprocated it.
    pub fn scanned(
        flow_id: FlowId,
        other_user_id: OwnedUserId,
        other_device_id: OwnedDeviceId,
        trust: PendingTrust,
    ) -> Self {
        Self {
            flow_id,
            other_user_id,
            other_device_id,
            we_scanned: true,
            state: QrState::Reciprocated,
            trust,
        }
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    pub fn we_scanned(&self) -> bool {
        self.we_scanned
    }

    pub fn state(&self) -> QrState {
        self.state
    }

    pub fn set_state(&mut self, state: QrState) {
        trace!(flow_id = self.flow_id.as_str(), from = ?self.state, to = ?state, "QR state change");
        self.state = state;
    }

    pub fn pending_trust(&self) -> &PendingTrust {
        &self.trust
    }

    pub fn to_snapshot(&self) -> QrVerification {
        QrVerification {
            flow_id: self.flow_id.as_str().to_owned(),
            other_user_id: self.other_user_id.clone(),
            other_device_id: self.other_device_id.clone(),
            we_scanned: self.we_scanned,
            is_to_device: self.flow_id.room_id().is_none(),
            state: self.state,
        }
    }
}
