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

//! Wire formats of the `m.key.verification.*` messages.
//!
//! Every message body exists once and gets wrapped either into a to-device
//! envelope, carrying a `transaction_id`, or into a room envelope, carrying an
//! `m.relates_to` reference to the event that started the verification.

use std::{collections::BTreeMap, fmt};

use ruma::{
    MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedTransactionId, OwnedUserId,
};
use serde::{Deserialize, Serialize};

/// The event type of room messages, used for in-room verification requests.
pub const ROOM_MESSAGE_EVENT_TYPE: &str = "m.room.message";

/// The relation type used by in-room verification messages.
pub const REFERENCE_REL_TYPE: &str = "m.reference";

/// The different kinds of messages that make up a verification flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// `m.key.verification.request`
    Request,
    /// `m.key.verification.ready`
    Ready,
    /// `m.key.verification.start`
    Start,
    /// `m.key.verification.accept`
    Accept,
    /// `m.key.verification.key`
    Key,
    /// `m.key.verification.mac`
    Mac,
    /// `m.key.verification.cancel`
    Cancel,
    /// `m.key.verification.done`
    Done,
}

impl MessageType {
    /// The event type, or the `msgtype` for in-room requests, of this kind of
    /// message.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Request => "m.key.verification.request",
            MessageType::Ready => "m.key.verification.ready",
            MessageType::Start => "m.key.verification.start",
            MessageType::Accept => "m.key.verification.accept",
            MessageType::Key => "m.key.verification.key",
            MessageType::Mac => "m.key.verification.mac",
            MessageType::Cancel => "m.key.verification.cancel",
            MessageType::Done => "m.key.verification.done",
        }
    }

    /// Get the message kind for the given event type.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        Some(match event_type {
            "m.key.verification.request" => MessageType::Request,
            "m.key.verification.ready" => MessageType::Ready,
            "m.key.verification.start" => MessageType::Start,
            "m.key.verification.accept" => MessageType::Accept,
            "m.key.verification.key" => MessageType::Key,
            "m.key.verification.mac" => MessageType::Mac,
            "m.key.verification.cancel" => MessageType::Cancel,
            "m.key.verification.done" => MessageType::Done,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verification method, as advertised in requests and negotiated in ready
/// messages.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VerificationMethod {
    /// The `m.sas.v1` method.
    SasV1,
    /// The `m.qr_code.show.v1` method, the device can display a QR code.
    QrCodeShowV1,
    /// The `m.qr_code.scan.v1` method, the device can scan a QR code.
    QrCodeScanV1,
    /// The `m.reciprocate.v1` method, used to confirm a scanned QR code.
    ReciprocateV1,
    /// A method we don't know about.
    Custom(String),
}

impl VerificationMethod {
    /// The string representation of the method.
    pub fn as_str(&self) -> &str {
        match self {
            VerificationMethod::SasV1 => "m.sas.v1",
            VerificationMethod::QrCodeShowV1 => "m.qr_code.show.v1",
            VerificationMethod::QrCodeScanV1 => "m.qr_code.scan.v1",
            VerificationMethod::ReciprocateV1 => "m.reciprocate.v1",
            VerificationMethod::Custom(m) => m,
        }
    }
}

impl From<&str> for VerificationMethod {
    fn from(method: &str) -> Self {
        match method {
            "m.sas.v1" => VerificationMethod::SasV1,
            "m.qr_code.show.v1" => VerificationMethod::QrCodeShowV1,
            "m.qr_code.scan.v1" => VerificationMethod::QrCodeScanV1,
            "m.reciprocate.v1" => VerificationMethod::ReciprocateV1,
            m => VerificationMethod::Custom(m.to_owned()),
        }
    }
}

impl From<String> for VerificationMethod {
    fn from(method: String) -> Self {
        method.as_str().into()
    }
}

impl From<VerificationMethod> for String {
    fn from(method: VerificationMethod) -> Self {
        match method {
            VerificationMethod::Custom(m) => m,
            m => m.as_str().to_owned(),
        }
    }
}

impl fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The reason a verification got cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelCode {
    /// The user cancelled the verification.
    User,
    /// The device doesn't know how to handle the requested method.
    UnknownMethod,
    /// The device received a message it didn't expect.
    UnexpectedMessage,
    /// A local error prevented the verification from continuing.
    UserError,
    /// The keys couldn't be verified.
    MismatchedKeys,
    /// The hash commitment didn't match.
    MismatchedCommitment,
    /// The short authentication string didn't match.
    MismatchedSas,
    /// The expected user didn't match the verified user.
    MismatchedUser,
    /// The received message was invalid.
    InvalidMessage,
    /// The request was accepted by another device.
    AcceptedByAnotherDevice,
}

impl CancelCode {
    /// The code as it's sent over the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelCode::User => "m.user",
            CancelCode::UnknownMethod => "m.unknown_method",
            CancelCode::UnexpectedMessage => "m.unexpected_message",
            CancelCode::UserError => "m.user_error",
            CancelCode::MismatchedKeys => "m.key_mismatch",
            CancelCode::MismatchedCommitment => "m.mismatched_commitment",
            CancelCode::MismatchedSas => "m.mismatched_sas",
            CancelCode::MismatchedUser => "m.user_mismatch",
            CancelCode::InvalidMessage => "m.invalid_message",
            CancelCode::AcceptedByAnotherDevice => "m.accepted",
        }
    }

    /// A human readable reason for the cancellation.
    pub fn reason(&self) -> &'static str {
        match self {
            CancelCode::User => "The user cancelled the verification.",
            CancelCode::UnknownMethod => {
                "The device does not know how to handle the requested method."
            }
            CancelCode::UnexpectedMessage => "The device received an unexpected message.",
            CancelCode::UserError => "An unexpected error occurred on the device.",
            CancelCode::MismatchedKeys => "The key was not verified.",
            CancelCode::MismatchedCommitment => "The hash commitment did not match.",
            CancelCode::MismatchedSas => "The short authentication string did not match.",
            CancelCode::MismatchedUser => "The expected user did not match the user verified.",
            CancelCode::InvalidMessage => "The device received an invalid message.",
            CancelCode::AcceptedByAnotherDevice => {
                "The verification request was accepted by another device."
            }
        }
    }

    /// Parse a code received over the wire, unknown codes are treated as a
    /// user cancellation.
    pub fn from_code(code: &str) -> Self {
        match code {
            "m.unknown_method" => CancelCode::UnknownMethod,
            "m.unexpected_message" => CancelCode::UnexpectedMessage,
            "m.user_error" => CancelCode::UserError,
            "m.key_mismatch" => CancelCode::MismatchedKeys,
            "m.mismatched_commitment" => CancelCode::MismatchedCommitment,
            "m.mismatched_sas" => CancelCode::MismatchedSas,
            "m.user_mismatch" => CancelCode::MismatchedUser,
            "m.invalid_message" => CancelCode::InvalidMessage,
            "m.accepted" => CancelCode::AcceptedByAnotherDevice,
            _ => CancelCode::User,
        }
    }
}

impl fmt::Display for CancelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `m.relates_to` field of an in-room verification message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Always `m.reference`.
    pub rel_type: String,
    /// The event id of the `m.key.verification.request` message.
    pub event_id: OwnedEventId,
}

impl Reference {
    /// Create a new reference to the given request event.
    pub fn new(event_id: OwnedEventId) -> Self {
        Self { rel_type: REFERENCE_REL_TYPE.to_owned(), event_id }
    }
}

/// A message body wrapped for to-device delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceContent<C> {
    /// The id of the verification flow.
    pub transaction_id: OwnedTransactionId,
    /// The message body.
    #[serde(flatten)]
    pub content: C,
}

/// A message body wrapped for delivery inside a room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomContent<C> {
    /// The relation to the request event.
    #[serde(rename = "m.relates_to")]
    pub relates_to: Reference,
    /// The message body.
    #[serde(flatten)]
    pub content: C,
}

/// Body of a to-device `m.key.verification.request`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestContent {
    /// The device that sent the request.
    pub from_device: OwnedDeviceId,
    /// The methods the requesting device supports.
    pub methods: Vec<VerificationMethod>,
    /// When the request was created.
    pub timestamp: MilliSecondsSinceUnixEpoch,
}

/// Body of an in-room `m.room.message` carrying a verification request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomRequestContent {
    /// Always `m.key.verification.request`.
    pub msgtype: String,
    /// A fallback text for clients not supporting in-room verification.
    pub body: String,
    /// The device that sent the request.
    pub from_device: OwnedDeviceId,
    /// The methods the requesting device supports.
    pub methods: Vec<VerificationMethod>,
    /// The user the request is meant for.
    pub to: OwnedUserId,
}

/// Body of an `m.key.verification.ready` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadyContent {
    /// The device that accepted the request.
    pub from_device: OwnedDeviceId,
    /// The methods both sides can use.
    pub methods: Vec<VerificationMethod>,
}

/// Body of an `m.key.verification.start` message.
///
/// The SAS specific lists are empty, and skipped on the wire, for the
/// reciprocate method, which carries the `secret` instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartContent {
    /// The device that started the verification.
    pub from_device: OwnedDeviceId,
    /// The method that is being started.
    pub method: VerificationMethod,
    /// The key agreement protocols the sender supports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_agreement_protocols: Vec<String>,
    /// The hash methods the sender supports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashes: Vec<String>,
    /// The MAC methods the sender supports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_authentication_codes: Vec<String>,
    /// The SAS representations the sender supports.
    #[serde(
        default,
        rename = "short_authentication_string",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub short_authentication_strings: Vec<String>,
    /// The shared secret of a scanned QR code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Body of an `m.key.verification.accept` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptContent {
    /// The accepted method, always `m.sas.v1`.
    #[serde(default = "sas_method")]
    pub method: VerificationMethod,
    /// The chosen key agreement protocol.
    pub key_agreement_protocol: String,
    /// The chosen hash method.
    pub hash: String,
    /// The chosen MAC method.
    pub message_authentication_code: String,
    /// The SAS representations both sides support.
    #[serde(rename = "short_authentication_string")]
    pub short_authentication_strings: Vec<String>,
    /// The hash of the accepting side's public key and the start message.
    pub commitment: String,
}

fn sas_method() -> VerificationMethod {
    VerificationMethod::SasV1
}

/// Body of an `m.key.verification.key` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyContent {
    /// The ephemeral public key of the sender, unpadded base64.
    pub key: String,
}

/// Body of an `m.key.verification.mac` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MacContent {
    /// A map from key id to the MAC of that key.
    pub mac: BTreeMap<String, String>,
    /// The MAC of the comma separated, sorted list of key ids.
    pub keys: String,
}

/// Body of an `m.key.verification.cancel` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelContent {
    /// The machine readable cancel code.
    pub code: String,
    /// A human readable reason.
    #[serde(default)]
    pub reason: String,
}

impl From<CancelCode> for CancelContent {
    fn from(code: CancelCode) -> Self {
        Self { code: code.as_str().to_owned(), reason: code.reason().to_owned() }
    }
}

/// Body of an `m.key.verification.done` message.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DoneContent {}

#[cfg(test)]
mod tests {
    use ruma::{device_id, event_id};
    use serde_json::json;

    use super::*;

    #[test]
    fn unknown_methods_survive_a_round_trip() {
        let methods: Vec<VerificationMethod> =
            serde_json::from_value(json!(["m.sas.v1", "org.example.method"])).unwrap();

        assert_eq!(
            methods,
            [VerificationMethod::SasV1, VerificationMethod::Custom("org.example.method".to_owned())]
        );
        assert_eq!(
            serde_json::to_value(&methods).unwrap(),
            json!(["m.sas.v1", "org.example.method"])
        );
    }

    #[test]
    fn unknown_cancel_codes_are_user_cancellations() {
        assert_eq!(CancelCode::from_code("m.key_mismatch"), CancelCode::MismatchedKeys);
        assert_eq!(CancelCode::from_code("org.example.code"), CancelCode::User);
    }

    #[test]
    fn room_content_serialization() {
        let content = RoomContent {
            relates_to: Reference::new(event_id!("$request:example.org").to_owned()),
            content: ReadyContent {
                from_device: device_id!("BOBDEVICE").to_owned(),
                methods: vec![VerificationMethod::SasV1],
            },
        };

        assert_eq!(
            serde_json::to_value(content).unwrap(),
            json!({
                "m.relates_to": {
                    "rel_type": "m.reference",
                    "event_id": "$request:example.org",
                },
                "from_device": "BOBDEVICE",
                "methods": ["m.sas.v1"],
            })
        );
    }

    #[test]
    fn reciprocate_start_skips_sas_fields() {
        let content = ToDeviceContent {
            transaction_id: "flow".into(),
            content: StartContent {
                from_device: device_id!("ALICEDEVICE").to_owned(),
                method: VerificationMethod::ReciprocateV1,
                key_agreement_protocols: vec![],
                hashes: vec![],
                message_authentication_codes: vec![],
                short_authentication_strings: vec![],
                secret: Some("c2VjcmV0".to_owned()),
            },
        };

        assert_eq!(
            serde_json::to_value(content).unwrap(),
            json!({
                "transaction_id": "flow",
                "from_device": "ALICEDEVICE",
                "method": "m.reciprocate.v1",
                "secret": "c2VjcmV0",
            })
        );
    }
}
