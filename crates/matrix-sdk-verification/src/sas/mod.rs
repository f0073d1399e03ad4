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

//! The SAS (short authentication string) verification method.

mod helpers;

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedUserId};
use subtle::ConstantTimeEq;
use tracing::{trace, warn};

pub use helpers::Emoji;
pub(crate) use helpers::SasIds;
use helpers::{
    decimals, emoji_from_index, emoji_indices, extra_info_sas_v1, extra_info_sas_v2,
    extra_mac_info_receive, extra_mac_info_send,
};

use crate::{
    content::{AcceptContent, KeyContent, MacContent, MessageType, StartContent},
    crypto::{CryptoPrimitives, KeyAgreement},
    error::{CryptoError, VerificationError},
    event_enums::{AcceptInfo, MacInfo, OutgoingContent, SasStartInfo},
    trust::DeviceKeys,
    CancelCode, FlowId, VerificationMethod,
};

const KEY_AGREEMENT_V1: &str = "curve25519";
const KEY_AGREEMENT_V2: &str = "curve25519-hkdf-sha256";
const HASH_SHA256: &str = "sha256";
const MAC_HKDF_HMAC_SHA256: &str = "hkdf-hmac-sha256";
const SAS_EMOJI: &str = "emoji";
const SAS_DECIMAL: &str = "decimal";

/// The key agreement protocols we support, in order of preference.
pub(crate) const KNOWN_AGREEMENT_PROTOCOLS: [&str; 2] = [KEY_AGREEMENT_V2, KEY_AGREEMENT_V1];
/// The hash methods we support, in order of preference.
pub(crate) const KNOWN_HASHES: [&str; 1] = [HASH_SHA256];
/// The MAC methods we support, in order of preference.
pub(crate) const KNOWN_MACS: [&str; 1] = [MAC_HKDF_HMAC_SHA256];
/// The short authentication string representations we support.
pub(crate) const KNOWN_SHORT_CODES: [&str; 2] = [SAS_EMOJI, SAS_DECIMAL];

const SHORT_CODE_LEN: usize = 6;

/// The state of a SAS verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SasState {
    /// We sent the `m.key.verification.start` message.
    Started,
    /// We received a start message and accepted it.
    Accepted,
    /// We sent our ephemeral public key.
    KeySent,
    /// Both public keys are known, the short auth string can be presented.
    ShortCodeReady,
    /// The user confirmed the short auth string and we sent our MAC.
    MacSent,
    /// The MAC of the other side arrived before we sent ours.
    MacReceived {
        /// Did the user confirm the short auth string.
        code_confirmed: bool,
    },
    /// Both MACs matched and the keys have been marked as trusted.
    Done {
        /// Did the other side tell us that it's done as well.
        other_done: bool,
    },
    /// The verification got cancelled.
    Cancelled {
        /// The reason for the cancellation.
        code: CancelCode,
        /// Did we cancel the verification.
        by_me: bool,
    },
}

impl SasState {
    /// Is this a terminal state.
    pub fn is_final(&self) -> bool {
        matches!(self, SasState::Done { .. } | SasState::Cancelled { .. })
    }
}

/// An immutable snapshot of a SAS verification.
#[derive(Clone, Debug, PartialEq)]
pub struct SasVerification {
    /// The flow id of the verification.
    pub flow_id: String,
    /// The user we're verifying.
    pub other_user_id: OwnedUserId,
    /// The device we're verifying.
    pub other_device_id: OwnedDeviceId,
    /// Was the verification started by the other side.
    pub is_incoming: bool,
    /// Is the verification happening over to-device messages.
    pub is_to_device: bool,
    /// The current state of the verification.
    pub state: SasState,
    /// The emoji representation of the short auth string, once both sides
    /// exchanged their keys and if both sides support emoji.
    pub emoji: Option<[Emoji; 7]>,
    /// The decimal representation of the short auth string, once both sides
    /// exchanged their keys and if both sides support decimals.
    pub decimals: Option<(u16, u16, u16)>,
}

/// The outcome of checking the MACs the other side sent us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MacVerification {
    /// The MAC of the key id list didn't match.
    MismatchKeys,
    /// The MAC of the given device didn't match.
    MismatchMacDevice(String),
    /// The MAC of the master key didn't match.
    MismatchMacCrossSigning,
    /// None of the keys in the MAC message are known to us.
    NoDevicesVerified,
    /// All the known keys matched.
    Success { devices: Vec<OwnedDeviceId>, master_key_trusted: bool },
}

/// Pick the parameters of a SAS verification from the ones the starting side
/// offered.
///
/// The first entry of our lists of known methods that the other side supports
/// wins.
fn agree_on(start: &SasStartInfo) -> Result<AcceptContent, CancelCode> {
    fn first_known(known: &[&str], offered: &[String]) -> Option<String> {
        known.iter().find(|k| offered.iter().any(|o| o == *k)).map(|k| (*k).to_owned())
    }

    let key_agreement_protocol =
        first_known(&KNOWN_AGREEMENT_PROTOCOLS, &start.key_agreement_protocols)
            .ok_or(CancelCode::UnknownMethod)?;
    let hash = first_known(&KNOWN_HASHES, &start.hashes).ok_or(CancelCode::UserError)?;
    let message_authentication_code =
        first_known(&KNOWN_MACS, &start.message_authentication_codes)
            .ok_or(CancelCode::UserError)?;

    let short_authentication_strings: Vec<String> = KNOWN_SHORT_CODES
        .iter()
        .filter(|k| start.short_authentication_strings.iter().any(|o| o == *k))
        .map(|k| (*k).to_owned())
        .collect();

    if short_authentication_strings.is_empty() {
        return Err(CancelCode::UserError);
    }

    Ok(AcceptContent {
        method: VerificationMethod::SasV1,
        key_agreement_protocol,
        hash,
        message_authentication_code,
        short_authentication_strings,
        commitment: String::new(),
    })
}

fn owned_list(list: &[&str]) -> Vec<String> {
    list.iter().map(|m| (*m).to_owned()).collect()
}

fn ct_eq(first: &str, second: &str) -> bool {
    first.as_bytes().ct_eq(second.as_bytes()).into()
}

/// A SAS verification in progress.
#[derive(Debug)]
pub(crate) struct SasTransaction {
    flow_id: FlowId,
    ids: SasIds,
    own_fingerprint: String,
    own_trusted_master_key: Option<String>,
    incoming: bool,
    state: SasState,
    key_agreement: Box<dyn KeyAgreement>,
    /// The canonical JSON of the start message, feeds into the commitment.
    start_canonical_json: String,
    accepted: Option<AcceptInfo>,
    short_code: Option<[u8; SHORT_CODE_LEN]>,
    their_mac: Option<MacInfo>,
}

impl SasTransaction {
    /// Create a new SAS verification that we start, together with the start
    /// message that needs to be sent out.
    pub fn start(
        flow_id: FlowId,
        ids: SasIds,
        own_fingerprint: String,
        own_trusted_master_key: Option<String>,
        key_agreement: Box<dyn KeyAgreement>,
    ) -> Result<(Self, OutgoingContent), VerificationError> {
        let content = StartContent {
            from_device: ids.own_device_id.clone(),
            method: VerificationMethod::SasV1,
            key_agreement_protocols: owned_list(&KNOWN_AGREEMENT_PROTOCOLS),
            hashes: owned_list(&KNOWN_HASHES),
            message_authentication_codes: owned_list(&KNOWN_MACS),
            short_authentication_strings: owned_list(&KNOWN_SHORT_CODES),
            secret: None,
        };

        let content = OutgoingContent::new(&flow_id, MessageType::Start, content)?;
        let start_canonical_json = content.canonical_json()?;

        let sas = Self {
            flow_id,
            ids,
            own_fingerprint,
            own_trusted_master_key,
            incoming: false,
            state: SasState::Started,
            key_agreement,
            start_canonical_json,
            accepted: None,
            short_code: None,
            their_mac: None,
        };

        Ok((sas, content))
    }

    /// Accept a SAS verification the other side started.
    ///
    /// Returns the new verification and the content of the
    /// `m.key.verification.accept` message, or the code the verification
    /// needs to be cancelled with.
    pub fn from_start(
        flow_id: FlowId,
        ids: SasIds,
        own_fingerprint: String,
        own_trusted_master_key: Option<String>,
        key_agreement: Box<dyn KeyAgreement>,
        start: &SasStartInfo,
        crypto: &dyn CryptoPrimitives,
    ) -> Result<(Self, AcceptContent), CancelCode> {
        let mut accept = agree_on(start)?;

        accept.commitment =
            crypto.sha256(&format!("{}{}", key_agreement.public_key(), start.canonical_json));

        let accepted = AcceptInfo {
            flow_id: flow_id.as_str().to_owned(),
            key_agreement_protocol: accept.key_agreement_protocol.clone(),
            hash: accept.hash.clone(),
            message_authentication_code: accept.message_authentication_code.clone(),
            short_authentication_strings: accept.short_authentication_strings.clone(),
            commitment: accept.commitment.clone(),
        };

        let sas = Self {
            flow_id,
            ids,
            own_fingerprint,
            own_trusted_master_key,
            incoming: true,
            state: SasState::Accepted,
            key_agreement,
            start_canonical_json: start.canonical_json.clone(),
            accepted: Some(accepted),
            short_code: None,
            their_mac: None,
        };

        Ok((sas, accept))
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn state(&self) -> SasState {
        self.state
    }

    pub fn set_state(&mut self, state: SasState) {
        trace!(
            flow_id = self.flow_id.as_str(),
            from = ?self.state,
            to = ?state,
            "SAS state change"
        );
        self.state = state;
    }

    pub fn their_mac(&self) -> Option<&MacInfo> {
        self.their_mac.as_ref()
    }

    pub fn set_their_mac(&mut self, mac: MacInfo) {
        self.their_mac = Some(mac);
    }

    /// Store the parameters the other side accepted our start with.
    ///
    /// Every accepted method needs to be one we offered.
    pub fn receive_accept(&mut self, accept: AcceptInfo) -> Result<(), CancelCode> {
        let known = KNOWN_AGREEMENT_PROTOCOLS.contains(&accept.key_agreement_protocol.as_str())
            && KNOWN_HASHES.contains(&accept.hash.as_str())
            && KNOWN_MACS.contains(&accept.message_authentication_code.as_str())
            && accept
                .short_authentication_strings
                .iter()
                .all(|s| KNOWN_SHORT_CODES.contains(&s.as_str()));

        if known {
            self.accepted = Some(accept);
            Ok(())
        } else {
            Err(CancelCode::UnknownMethod)
        }
    }

    /// The content of the `m.key.verification.key` message.
    pub fn key_content(&self) -> KeyContent {
        KeyContent { key: self.key_agreement.public_key().to_owned() }
    }

    /// Establish the shared secret with the public key of the other side and
    /// derive the short auth string.
    ///
    /// If we started the verification, the key needs to match the commitment
    /// the other side sent with its accept message.
    pub fn receive_key(
        &mut self,
        their_key: &str,
        crypto: &dyn CryptoPrimitives,
    ) -> Result<(), CancelCode> {
        let Some(accepted) = &self.accepted else {
            return Err(CancelCode::UnexpectedMessage);
        };

        if !self.incoming {
            let commitment = crypto.sha256(&format!("{their_key}{}", self.start_canonical_json));

            if !ct_eq(&commitment, &accepted.commitment) {
                warn!(flow_id = self.flow_id.as_str(), "The SAS commitment didn't match");
                return Err(CancelCode::MismatchedCommitment);
            }
        }

        let info = match accepted.key_agreement_protocol.as_str() {
            KEY_AGREEMENT_V1 => extra_info_sas_v1(
                &self.ids,
                self.key_agreement.public_key(),
                self.flow_id.as_str(),
                !self.incoming,
            ),
            KEY_AGREEMENT_V2 => extra_info_sas_v2(
                &self.ids,
                self.key_agreement.public_key(),
                their_key,
                self.flow_id.as_str(),
                !self.incoming,
            ),
            _ => return Err(CancelCode::UnknownMethod),
        };

        self.key_agreement.set_their_public_key(their_key).map_err(|e| {
            warn!(flow_id = self.flow_id.as_str(), error = ?e, "Invalid SAS public key");
            CancelCode::InvalidMessage
        })?;

        let bytes = self.key_agreement.generate_bytes(&info, SHORT_CODE_LEN).map_err(|e| {
            warn!(
                flow_id = self.flow_id.as_str(),
                error = ?e,
                "Couldn't generate the short auth string"
            );
            CancelCode::UserError
        })?;

        let short_code = <[u8; SHORT_CODE_LEN]>::try_from(bytes.as_slice())
            .map_err(|_| CancelCode::UserError)?;
        self.short_code = Some(short_code);

        Ok(())
    }

    fn supports(&self, representation: &str) -> bool {
        self.accepted
            .as_ref()
            .is_some_and(|a| a.short_authentication_strings.iter().any(|s| s == representation))
    }

    /// The emoji representation of the short auth string.
    pub fn emoji(&self) -> Option<[Emoji; 7]> {
        let bytes = self.short_code.as_ref().filter(|_| self.supports(SAS_EMOJI))?;
        Some(emoji_indices(bytes).map(emoji_from_index))
    }

    /// The decimal representation of the short auth string.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        let bytes = self.short_code.as_ref().filter(|_| self.supports(SAS_DECIMAL))?;
        Some(decimals(bytes))
    }

    fn calculate_mac(&self, input: &str, info: &str) -> Result<String, CryptoError> {
        let method = self
            .accepted
            .as_ref()
            .map(|a| a.message_authentication_code.as_str())
            .ok_or(CryptoError::PeerKeyMissing)?;

        match method {
            MAC_HKDF_HMAC_SHA256 => self.key_agreement.calculate_mac(input, info),
            m => Err(CryptoError::UnsupportedMac(m.to_owned())),
        }
    }

    /// Calculate the MACs of our device key and, if we trust it, our master
    /// key.
    pub fn compute_my_mac(&self) -> Result<MacContent, CryptoError> {
        let info = extra_mac_info_send(&self.ids, self.flow_id.as_str());
        let mut mac = BTreeMap::new();

        let key_id = format!("ed25519:{}", self.ids.own_device_id);
        let calculated = self.calculate_mac(&self.own_fingerprint, &format!("{info}{key_id}"))?;
        mac.insert(key_id, calculated);

        if let Some(master_key) = &self.own_trusted_master_key {
            let key_id = format!("ed25519:{master_key}");
            let calculated = self.calculate_mac(master_key, &format!("{info}{key_id}"))?;
            mac.insert(key_id, calculated);
        }

        // The map iterates in sorted order.
        let key_ids: Vec<&str> = mac.keys().map(String::as_str).collect();
        let keys = self.calculate_mac(&key_ids.join(","), &format!("{info}KEY_IDS"))?;

        Ok(MacContent { mac, keys })
    }

    /// Check the MACs the other side sent us against the keys we know of.
    pub fn verify_macs(
        &self,
        their_mac: &MacInfo,
        other_devices: &[DeviceKeys],
        other_master_key: Option<&str>,
    ) -> Result<MacVerification, CryptoError> {
        let info = extra_mac_info_receive(&self.ids, self.flow_id.as_str());

        let key_ids: Vec<&str> = their_mac.mac.keys().map(String::as_str).collect();
        let keys = self.calculate_mac(&key_ids.join(","), &format!("{info}KEY_IDS"))?;

        if !ct_eq(&keys, &their_mac.keys) {
            return Ok(MacVerification::MismatchKeys);
        }

        let mut verified_devices = Vec::new();

        for (key_id, their_key_mac) in &their_mac.mac {
            let device_id = key_id.strip_prefix("ed25519:").unwrap_or(key_id);

            let Some(device) = other_devices.iter().find(|d| d.device_id.as_str() == device_id)
            else {
                trace!(device_id, "Could not find the device to verify, ignoring the MAC");
                continue;
            };

            let calculated = self.calculate_mac(&device.fingerprint, &format!("{info}{key_id}"))?;

            if !ct_eq(&calculated, their_key_mac) {
                warn!(device_id, "The MAC of a device didn't match");
                return Ok(MacVerification::MismatchMacDevice(device_id.to_owned()));
            }

            verified_devices.push(device.device_id.clone());
        }

        let mut master_key_trusted = false;

        if let Some(master_key) = other_master_key {
            for (key_id, their_key_mac) in &their_mac.mac {
                if key_id.strip_prefix("ed25519:").unwrap_or(key_id) != master_key {
                    continue;
                }

                let calculated = self.calculate_mac(master_key, &format!("{info}{key_id}"))?;

                if !ct_eq(&calculated, their_key_mac) {
                    warn!("The MAC of the master key didn't match");
                    return Ok(MacVerification::MismatchMacCrossSigning);
                }

                master_key_trusted = true;
            }
        }

        if verified_devices.is_empty() && !master_key_trusted {
            return Ok(MacVerification::NoDevicesVerified);
        }

        Ok(MacVerification::Success { devices: verified_devices, master_key_trusted })
    }

    pub fn to_snapshot(&self) -> SasVerification {
        SasVerification {
            flow_id: self.flow_id.as_str().to_owned(),
            other_user_id: self.ids.other_user_id.clone(),
            other_device_id: self.ids.other_device_id.clone(),
            is_incoming: self.incoming,
            is_to_device: self.flow_id.room_id().is_none(),
            state: self.state,
            emoji: self.emoji(),
            decimals: self.decimals(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use assert_matches2::assert_let;
    use ruma::{device_id, user_id, OwnedTransactionId};

    use super::*;
    use crate::{crypto::VodozemacPrimitives, event_enums::StartMethod};

    fn alice_ids() -> SasIds {
        SasIds {
            own_user_id: user_id!("@alice:example.org").to_owned(),
            own_device_id: device_id!("ALICEDEVICE").to_owned(),
            other_user_id: user_id!("@bob:example.org").to_owned(),
            other_device_id: device_id!("BOBDEVICE").to_owned(),
        }
    }

    fn bob_ids() -> SasIds {
        let ids = alice_ids();

        SasIds {
            own_user_id: ids.other_user_id,
            own_device_id: ids.other_device_id,
            other_user_id: ids.own_user_id,
            other_device_id: ids.own_device_id,
        }
    }

    fn flow_id() -> FlowId {
        FlowId::ToDevice(OwnedTransactionId::from("flow"))
    }

    fn start_info(content: &OutgoingContent) -> SasStartInfo {
        let parsed = crate::event_enums::AnyVerificationContent::from_to_device(
            "m.key.verification.start",
            &content.content,
        );

        assert_let!(Some(crate::event_enums::AnyVerificationContent::Start(start)) = parsed);
        assert_let!(StartMethod::Sas(info) = start.method);

        info
    }

    fn accept_info(content: &AcceptContent) -> AcceptInfo {
        AcceptInfo {
            flow_id: "flow".to_owned(),
            key_agreement_protocol: content.key_agreement_protocol.clone(),
            hash: content.hash.clone(),
            message_authentication_code: content.message_authentication_code.clone(),
            short_authentication_strings: content.short_authentication_strings.clone(),
            commitment: content.commitment.clone(),
        }
    }

    fn devices(
        user_id: &ruma::UserId,
        device_id: &ruma::DeviceId,
        fingerprint: &str,
    ) -> Vec<DeviceKeys> {
        vec![DeviceKeys {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            fingerprint: fingerprint.to_owned(),
        }]
    }

    /// Run the key exchange between Alice, who starts, and Bob.
    fn exchange(alice_master_key: Option<String>) -> (SasTransaction, SasTransaction) {
        let crypto = VodozemacPrimitives::new();

        let (mut alice, content) = SasTransaction::start(
            flow_id(),
            alice_ids(),
            "ALICE_FINGERPRINT".to_owned(),
            alice_master_key,
            crypto.new_key_agreement(),
        )
        .unwrap();

        let (mut bob, accept) = SasTransaction::from_start(
            flow_id(),
            bob_ids(),
            "BOB_FINGERPRINT".to_owned(),
            None,
            crypto.new_key_agreement(),
            &start_info(&content),
            &crypto,
        )
        .unwrap();

        alice.receive_accept(accept_info(&accept)).unwrap();

        let alice_key = alice.key_content().key;
        let bob_key = bob.key_content().key;

        bob.receive_key(&alice_key, &crypto).unwrap();
        alice.receive_key(&bob_key, &crypto).unwrap();

        (alice, bob)
    }

    #[test]
    fn commitment_calculation() {
        let public_key = "Q/NmNFEUS1fS+YeEmiZkjjblKTitrKOAk7cPEumcMlg";
        let content = serde_json::json!({
            "from_device": "XOWLHHFSWM",
            "transaction_id": "bYxBsirjUJO9osar6ST4i2M2NjrYLA7l",
            "method": "m.sas.v1",
            "key_agreement_protocols": ["curve25519-hkdf-sha256", "curve25519"],
            "hashes": ["sha256"],
            "message_authentication_codes": ["hkdf-hmac-sha256", "hmac-sha256"],
            "short_authentication_string": ["decimal", "emoji"]
        });

        let parsed = crate::event_enums::AnyVerificationContent::from_to_device(
            "m.key.verification.start",
            &content,
        );
        assert_let!(Some(crate::event_enums::AnyVerificationContent::Start(start)) = parsed);
        assert_let!(StartMethod::Sas(info) = start.method);

        let commitment =
            VodozemacPrimitives::new().sha256(&format!("{public_key}{}", info.canonical_json));

        assert_eq!(commitment, "CCQmB4JCdB0FW21FdAnHj/Hu8+W9+Nb0vgwPEnZZQ4g");
    }

    #[test]
    fn agreement_prefers_our_order() {
        let start = SasStartInfo {
            key_agreement_protocols: vec![KEY_AGREEMENT_V1.to_owned(), KEY_AGREEMENT_V2.to_owned()],
            hashes: vec!["sha512".to_owned(), HASH_SHA256.to_owned()],
            message_authentication_codes: vec![
                "hmac-sha256".to_owned(),
                MAC_HKDF_HMAC_SHA256.to_owned(),
            ],
            short_authentication_strings: vec![SAS_DECIMAL.to_owned(), "org.example".to_owned()],
            canonical_json: String::new(),
        };

        let accept = agree_on(&start).unwrap();
        assert_eq!(accept.key_agreement_protocol, KEY_AGREEMENT_V2);
        assert_eq!(accept.hash, HASH_SHA256);
        assert_eq!(accept.message_authentication_code, MAC_HKDF_HMAC_SHA256);
        assert_eq!(accept.short_authentication_strings, [SAS_DECIMAL]);

        let unknown_protocol =
            SasStartInfo { key_agreement_protocols: vec!["x25519".to_owned()], ..start.clone() };
        assert_matches!(agree_on(&unknown_protocol), Err(CancelCode::UnknownMethod));

        let unknown_hash = SasStartInfo { hashes: vec!["sha512".to_owned()], ..start.clone() };
        assert_matches!(agree_on(&unknown_hash), Err(CancelCode::UserError));

        let long_kdf_only = SasStartInfo {
            message_authentication_codes: vec!["hmac-sha256".to_owned()],
            ..start.clone()
        };
        assert_matches!(agree_on(&long_kdf_only), Err(CancelCode::UserError));

        let unknown_sas =
            SasStartInfo { short_authentication_strings: vec!["org.example".to_owned()], ..start };
        assert_matches!(agree_on(&unknown_sas), Err(CancelCode::UserError));
    }

    #[test]
    fn accepting_an_unsupported_mac_is_refused() {
        let crypto = VodozemacPrimitives::new();

        let (mut alice, content) = SasTransaction::start(
            flow_id(),
            alice_ids(),
            "ALICE_FINGERPRINT".to_owned(),
            None,
            crypto.new_key_agreement(),
        )
        .unwrap();

        let offered = start_info(&content).message_authentication_codes;
        assert_eq!(offered, [MAC_HKDF_HMAC_SHA256]);

        let accept = AcceptInfo {
            flow_id: "flow".to_owned(),
            key_agreement_protocol: KEY_AGREEMENT_V2.to_owned(),
            hash: HASH_SHA256.to_owned(),
            message_authentication_code: "hmac-sha256".to_owned(),
            short_authentication_strings: vec![SAS_EMOJI.to_owned()],
            commitment: "COMMITMENT".to_owned(),
        };

        assert_matches!(alice.receive_accept(accept), Err(CancelCode::UnknownMethod));
    }

    #[test]
    fn both_sides_show_the_same_short_code() {
        let (alice, bob) = exchange(None);

        assert!(alice.emoji().is_some());
        assert_eq!(alice.emoji(), bob.emoji());
        assert_eq!(alice.decimals(), bob.decimals());
    }

    #[test]
    fn tampered_start_fails_the_commitment() {
        let crypto = VodozemacPrimitives::new();

        let (mut alice, content) = SasTransaction::start(
            flow_id(),
            alice_ids(),
            "ALICE_FINGERPRINT".to_owned(),
            None,
            crypto.new_key_agreement(),
        )
        .unwrap();

        // Bob sees a start that offers fewer short code representations.
        let mut start = start_info(&content);
        start.short_authentication_strings.pop();
        start.canonical_json = start.canonical_json.replace(",\"decimal\"", "");

        let (bob, accept) = SasTransaction::from_start(
            flow_id(),
            bob_ids(),
            "BOB_FINGERPRINT".to_owned(),
            None,
            crypto.new_key_agreement(),
            &start,
            &crypto,
        )
        .unwrap();

        alice.receive_accept(accept_info(&accept)).unwrap();

        assert_matches!(
            alice.receive_key(&bob.key_content().key, &crypto),
            Err(CancelCode::MismatchedCommitment)
        );
    }

    #[test]
    fn mac_round_trip() {
        let (alice, bob) = exchange(None);
        let alice_mac = alice.compute_my_mac().unwrap();
        let alice_mac =
            MacInfo { flow_id: "flow".to_owned(), mac: alice_mac.mac, keys: alice_mac.keys };

        let result = bob
            .verify_macs(
                &alice_mac,
                &devices(
                    user_id!("@alice:example.org"),
                    device_id!("ALICEDEVICE"),
                    "ALICE_FINGERPRINT",
                ),
                None,
            )
            .unwrap();

        assert_eq!(
            result,
            MacVerification::Success {
                devices: vec![device_id!("ALICEDEVICE").to_owned()],
                master_key_trusted: false
            }
        );
    }

    #[test]
    fn mac_with_a_different_fingerprint_fails() {
        let (alice, bob) = exchange(None);
        let alice_mac = alice.compute_my_mac().unwrap();
        let alice_mac =
            MacInfo { flow_id: "flow".to_owned(), mac: alice_mac.mac, keys: alice_mac.keys };

        let result = bob
            .verify_macs(
                &alice_mac,
                &devices(
                    user_id!("@alice:example.org"),
                    device_id!("ALICEDEVICE"),
                    "BLICE_FINGERPRINT",
                ),
                None,
            )
            .unwrap();

        assert_eq!(result, MacVerification::MismatchMacDevice("ALICEDEVICE".to_owned()));
    }

    #[test]
    fn mac_with_a_tampered_key_list_fails() {
        let (alice, bob) = exchange(None);
        let alice_mac = alice.compute_my_mac().unwrap();
        let alice_mac =
            MacInfo { flow_id: "flow".to_owned(), mac: alice_mac.mac, keys: "tampered".to_owned() };

        let result = bob
            .verify_macs(
                &alice_mac,
                &devices(
                    user_id!("@alice:example.org"),
                    device_id!("ALICEDEVICE"),
                    "ALICE_FINGERPRINT",
                ),
                None,
            )
            .unwrap();

        assert_eq!(result, MacVerification::MismatchKeys);
    }

    #[test]
    fn master_key_mac() {
        let master_key = "ALICE_MASTER_KEY";
        let (alice, bob) = exchange(Some(master_key.to_owned()));
        let alice_mac = alice.compute_my_mac().unwrap();
        assert_eq!(alice_mac.mac.len(), 2);
        let alice_mac =
            MacInfo { flow_id: "flow".to_owned(), mac: alice_mac.mac, keys: alice_mac.keys };

        let result = bob.verify_macs(&alice_mac, &[], Some(master_key)).unwrap();
        assert_eq!(result, MacVerification::Success { devices: vec![], master_key_trusted: true });

        let result = bob.verify_macs(&alice_mac, &[], Some("OTHER_MASTER_KEY")).unwrap();
        assert_eq!(result, MacVerification::NoDevicesVerified);
    }
}
