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

use std::collections::BTreeMap;

use ruma::{
    CanonicalJsonValue, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedTransactionId,
    OwnedUserId,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    content::{
        AcceptContent, CancelContent, DoneContent, KeyContent, MacContent, MessageType,
        ReadyContent, RequestContent, RoomContent, RoomRequestContent, StartContent,
        Reference, ToDeviceContent, VerificationMethod, ROOM_MESSAGE_EVENT_TYPE,
    },
    CancelCode, FlowId,
};

/// The validated content of a verification request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestInfo {
    /// The device that sent the request.
    pub from_device: OwnedDeviceId,
    /// The methods the requesting device supports.
    pub methods: Vec<VerificationMethod>,
    /// When the request was created, if known.
    pub timestamp: Option<MilliSecondsSinceUnixEpoch>,
}

/// The validated content of an `m.key.verification.ready` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadyInfo {
    /// The flow id of the verification.
    pub flow_id: String,
    /// The device that accepted the request.
    pub from_device: OwnedDeviceId,
    /// The methods both sides can use.
    pub methods: Vec<VerificationMethod>,
}

/// The validated content of an `m.key.verification.start` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartInfo {
    /// The flow id of the verification.
    pub flow_id: String,
    /// The device that started the verification.
    pub from_device: OwnedDeviceId,
    /// The method specific part of the start message.
    pub method: StartMethod,
}

/// The method specific part of a start message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartMethod {
    /// A SAS verification is being started.
    Sas(SasStartInfo),
    /// A scanned QR code is being reciprocated.
    Reciprocate {
        /// The shared secret of the scanned QR code, unpadded base64.
        secret: String,
    },
}

/// The parameters offered by the initiator of a SAS verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SasStartInfo {
    /// The key agreement protocols the initiator supports.
    pub key_agreement_protocols: Vec<String>,
    /// The hash methods the initiator supports.
    pub hashes: Vec<String>,
    /// The MAC methods the initiator supports.
    pub message_authentication_codes: Vec<String>,
    /// The SAS representations the initiator supports.
    pub short_authentication_strings: Vec<String>,
    /// The canonical JSON of the start message, used for the commitment.
    pub canonical_json: String,
}

/// The validated content of an `m.key.verification.accept` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptInfo {
    /// The flow id of the verification.
    pub flow_id: String,
    /// The chosen key agreement protocol.
    pub key_agreement_protocol: String,
    /// The chosen hash method.
    pub hash: String,
    /// The chosen MAC method.
    pub message_authentication_code: String,
    /// The SAS representations both sides support.
    pub short_authentication_strings: Vec<String>,
    /// The commitment of the accepting side.
    pub commitment: String,
}

/// The validated content of an `m.key.verification.key` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyInfo {
    /// The flow id of the verification.
    pub flow_id: String,
    /// The ephemeral public key of the sender.
    pub key: String,
}

/// The validated content of an `m.key.verification.mac` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacInfo {
    /// The flow id of the verification.
    pub flow_id: String,
    /// A map from key id to the MAC of that key.
    pub mac: BTreeMap<String, String>,
    /// The MAC of the key id list.
    pub keys: String,
}

/// The validated content of an `m.key.verification.cancel` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelInfo {
    /// The flow id of the verification.
    pub flow_id: String,
    /// The reason for the cancellation.
    pub code: CancelCode,
    /// The human readable reason sent by the other side.
    pub reason: String,
}

/// A request as parsed from an incoming event.
#[derive(Clone, Debug)]
pub(crate) struct ParsedRequest {
    /// Only present for to-device requests, the event id is the flow id of
    /// in-room requests.
    pub transaction_id: Option<OwnedTransactionId>,
    /// Only present for in-room requests.
    pub to: Option<OwnedUserId>,
    pub info: RequestInfo,
}

/// Any verification message we know how to handle, after validation.
#[derive(Clone, Debug)]
pub(crate) enum AnyVerificationContent {
    Request(ParsedRequest),
    Ready(ReadyInfo),
    Start(StartInfo),
    Accept(AcceptInfo),
    Key(KeyInfo),
    Mac(MacInfo),
    Cancel(CancelInfo),
    Done(String),
}

impl AnyVerificationContent {
    /// Parse the content of a to-device event.
    ///
    /// Returns `None` if the event isn't a verification event or if it's
    /// malformed.
    pub fn from_to_device(event_type: &str, content: &Value) -> Option<Self> {
        let message_type = MessageType::from_event_type(event_type)?;

        let parsed = match message_type {
            MessageType::Request => {
                let c: ToDeviceContent<RequestContent> = parse(message_type, content)?;
                let info = RequestInfo {
                    from_device: c.content.from_device,
                    methods: c.content.methods,
                    timestamp: Some(c.content.timestamp),
                };

                Self::Request(ParsedRequest {
                    transaction_id: Some(c.transaction_id),
                    to: None,
                    info,
                })
            }
            MessageType::Ready => {
                let c: ToDeviceContent<ReadyContent> = parse(message_type, content)?;
                Self::Ready(ready_info(c.transaction_id.to_string(), c.content))
            }
            MessageType::Start => {
                let c: ToDeviceContent<StartContent> = parse(message_type, content)?;
                let canonical_json = canonical_json(&c)?;
                Self::Start(start_info(c.transaction_id.to_string(), c.content, canonical_json)?)
            }
            MessageType::Accept => {
                let c: ToDeviceContent<AcceptContent> = parse(message_type, content)?;
                Self::Accept(accept_info(c.transaction_id.to_string(), c.content))
            }
            MessageType::Key => {
                let c: ToDeviceContent<KeyContent> = parse(message_type, content)?;
                Self::Key(KeyInfo { flow_id: c.transaction_id.to_string(), key: c.content.key })
            }
            MessageType::Mac => {
                let c: ToDeviceContent<MacContent> = parse(message_type, content)?;
                Self::Mac(mac_info(c.transaction_id.to_string(), c.content))
            }
            MessageType::Cancel => {
                let c: ToDeviceContent<CancelContent> = parse(message_type, content)?;
                Self::Cancel(cancel_info(c.transaction_id.to_string(), c.content))
            }
            MessageType::Done => {
                let c: ToDeviceContent<DoneContent> = parse(message_type, content)?;
                Self::Done(c.transaction_id.to_string())
            }
        };

        parsed.validate()
    }

    /// Parse the content of a room event.
    ///
    /// Verification requests are sent as `m.room.message` events, every other
    /// message of the flow uses its own event type.
    pub fn from_room_event(event_type: &str, content: &Value) -> Option<Self> {
        if event_type == ROOM_MESSAGE_EVENT_TYPE {
            let msgtype = content.get("msgtype").and_then(Value::as_str)?;

            if msgtype != MessageType::Request.as_str() {
                return None;
            }

            let c: RoomRequestContent = parse(MessageType::Request, content)?;
            let info =
                RequestInfo { from_device: c.from_device, methods: c.methods, timestamp: None };

            return Self::Request(ParsedRequest { transaction_id: None, to: Some(c.to), info })
                .validate();
        }

        let message_type = MessageType::from_event_type(event_type)?;

        let parsed = match message_type {
            // Requests inside of a room are always room messages.
            MessageType::Request => return None,
            MessageType::Ready => {
                let c: RoomContent<ReadyContent> = parse(message_type, content)?;
                Self::Ready(ready_info(c.relates_to.event_id.to_string(), c.content))
            }
            MessageType::Start => {
                let c: RoomContent<StartContent> = parse(message_type, content)?;
                let canonical_json = canonical_json(&c)?;
                Self::Start(start_info(
                    c.relates_to.event_id.to_string(),
                    c.content,
                    canonical_json,
                )?)
            }
            MessageType::Accept => {
                let c: RoomContent<AcceptContent> = parse(message_type, content)?;
                Self::Accept(accept_info(c.relates_to.event_id.to_string(), c.content))
            }
            MessageType::Key => {
                let c: RoomContent<KeyContent> = parse(message_type, content)?;
                Self::Key(KeyInfo {
                    flow_id: c.relates_to.event_id.to_string(),
                    key: c.content.key,
                })
            }
            MessageType::Mac => {
                let c: RoomContent<MacContent> = parse(message_type, content)?;
                Self::Mac(mac_info(c.relates_to.event_id.to_string(), c.content))
            }
            MessageType::Cancel => {
                let c: RoomContent<CancelContent> = parse(message_type, content)?;
                Self::Cancel(cancel_info(c.relates_to.event_id.to_string(), c.content))
            }
            MessageType::Done => {
                let c: RoomContent<DoneContent> = parse(message_type, content)?;
                Self::Done(c.relates_to.event_id.to_string())
            }
        };

        parsed.validate()
    }

    /// Drop messages that deserialized fine but are missing required values.
    fn validate(self) -> Option<Self> {
        let valid = match &self {
            Self::Request(r) => {
                !r.info.methods.is_empty()
                    && !r.info.from_device.as_str().is_empty()
                    && r.transaction_id.as_ref().is_none_or(|t| !t.as_str().is_empty())
            }
            Self::Ready(r) => {
                !r.flow_id.is_empty()
                    && !r.from_device.as_str().is_empty()
                    && !r.methods.is_empty()
            }
            Self::Start(s) => !s.flow_id.is_empty() && !s.from_device.as_str().is_empty(),
            Self::Accept(a) => {
                !a.flow_id.is_empty()
                    && !a.key_agreement_protocol.is_empty()
                    && !a.hash.is_empty()
                    && !a.message_authentication_code.is_empty()
                    && !a.short_authentication_strings.is_empty()
                    && !a.commitment.is_empty()
            }
            Self::Key(k) => !k.flow_id.is_empty() && !k.key.is_empty(),
            Self::Mac(m) => !m.flow_id.is_empty() && !m.mac.is_empty() && !m.keys.is_empty(),
            Self::Cancel(c) => !c.flow_id.is_empty(),
            Self::Done(flow_id) => !flow_id.is_empty(),
        };

        if valid {
            Some(self)
        } else {
            debug!(content = ?self, "Dropping an incomplete verification message");
            None
        }
    }
}

fn parse<T: DeserializeOwned>(message_type: MessageType, content: &Value) -> Option<T> {
    match T::deserialize(content) {
        Ok(c) => Some(c),
        Err(e) => {
            debug!(%message_type, error = ?e, "Dropping a malformed verification message");
            None
        }
    }
}

fn canonical_json<T: Serialize>(content: &T) -> Option<String> {
    let value = serde_json::to_value(content).ok()?;
    let canonical: CanonicalJsonValue = value.try_into().ok()?;

    Some(canonical.to_string())
}

fn ready_info(flow_id: String, content: ReadyContent) -> ReadyInfo {
    ReadyInfo { flow_id, from_device: content.from_device, methods: content.methods }
}

fn start_info(flow_id: String, content: StartContent, canonical_json: String) -> Option<StartInfo> {
    let method = match content.method {
        VerificationMethod::SasV1 => {
            if content.key_agreement_protocols.is_empty()
                || content.hashes.is_empty()
                || content.message_authentication_codes.is_empty()
                || content.short_authentication_strings.is_empty()
            {
                return None;
            }

            StartMethod::Sas(SasStartInfo {
                key_agreement_protocols: content.key_agreement_protocols,
                hashes: content.hashes,
                message_authentication_codes: content.message_authentication_codes,
                short_authentication_strings: content.short_authentication_strings,
                canonical_json,
            })
        }
        VerificationMethod::ReciprocateV1 => {
            let secret = content.secret.filter(|s| !s.is_empty())?;
            StartMethod::Reciprocate { secret }
        }
        _ => return None,
    };

    Some(StartInfo { flow_id, from_device: content.from_device, method })
}

fn accept_info(flow_id: String, content: AcceptContent) -> AcceptInfo {
    AcceptInfo {
        flow_id,
        key_agreement_protocol: content.key_agreement_protocol,
        hash: content.hash,
        message_authentication_code: content.message_authentication_code,
        short_authentication_strings: content.short_authentication_strings,
        commitment: content.commitment,
    }
}

fn mac_info(flow_id: String, content: MacContent) -> MacInfo {
    MacInfo { flow_id, mac: content.mac, keys: content.keys }
}

fn cancel_info(flow_id: String, content: CancelContent) -> CancelInfo {
    CancelInfo { flow_id, code: CancelCode::from_code(&content.code), reason: content.reason }
}

/// A message body that is ready to be sent out over the transport of a
/// verification flow.
#[derive(Clone, Debug)]
pub(crate) struct OutgoingContent {
    pub message_type: MessageType,
    pub content: Value,
}

impl OutgoingContent {
    /// Wrap the message body into the envelope matching the flow id.
    pub fn new<C: Serialize>(
        flow_id: &FlowId,
        message_type: MessageType,
        content: C,
    ) -> Result<Self, serde_json::Error> {
        let content = match flow_id {
            FlowId::ToDevice(transaction_id) => serde_json::to_value(ToDeviceContent {
                transaction_id: transaction_id.clone(),
                content,
            })?,
            FlowId::InRoom(_, event_id) => serde_json::to_value(RoomContent {
                relates_to: Reference::new(event_id.clone()),
                content,
            })?,
        };

        Ok(Self { message_type, content })
    }

    /// The canonical JSON form of the content, as used for SAS commitments.
    pub fn canonical_json(&self) -> Result<String, ruma::CanonicalJsonError> {
        let canonical: CanonicalJsonValue = self.content.clone().try_into()?;
        Ok(canonical.to_string())
    }
}
