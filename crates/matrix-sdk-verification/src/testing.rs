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

//! Test helpers, an in-memory trust backend and a network that connects a
//! pair of verification engines.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use ruma::{
    device_id, room_id,
    serde::{base64::Standard, Base64},
    server_name, user_id, DeviceId, EventId, OwnedDeviceId, OwnedEventId, OwnedRoomId,
    OwnedUserId, RoomId, UserId,
};
use serde_json::Value;

use crate::{
    error::{TransportError, TrustError},
    DeviceKeys, Transport, TrustBackend, VerificationConfig, VerificationEngine,
    VodozemacPrimitives,
};

pub(crate) fn alice_id() -> &'static UserId {
    user_id!("@alice:example.org")
}

pub(crate) fn alice_device_id() -> &'static DeviceId {
    device_id!("ALICEDEVICE")
}

pub(crate) fn bob_id() -> &'static UserId {
    user_id!("@bob:example.org")
}

pub(crate) fn bob_device_id() -> &'static DeviceId {
    device_id!("BOBDEVICE")
}

pub(crate) fn alice_other_device_id() -> &'static DeviceId {
    device_id!("ALICEOTHERDEVICE")
}

pub(crate) fn dm_room_id() -> &'static RoomId {
    room_id!("!dm:example.org")
}

/// A random 32 byte key, unpadded base64.
pub(crate) fn random_key() -> String {
    Base64::<Standard>::new(rand::random::<[u8; 32]>().to_vec()).encode()
}

pub(crate) fn device_keys(user_id: &UserId, device_id: &DeviceId) -> DeviceKeys {
    DeviceKeys {
        user_id: user_id.to_owned(),
        device_id: device_id.to_owned(),
        fingerprint: random_key(),
    }
}

#[derive(Debug, Default)]
pub(crate) struct TrustState {
    pub devices: Vec<DeviceKeys>,
    pub master_keys: BTreeMap<OwnedUserId, String>,
    pub my_trusted_master_key: Option<String>,
    pub can_cross_sign: bool,
    pub locally_trusted: Vec<(OwnedUserId, OwnedDeviceId)>,
    pub signed_own_devices: Vec<OwnedDeviceId>,
    pub trusted_users: Vec<OwnedUserId>,
    pub master_key_marked_trusted: bool,
}

/// A [`TrustBackend`] keeping everything in memory.
#[derive(Debug)]
pub(crate) struct MemoryTrust {
    own_user_id: OwnedUserId,
    state: Mutex<TrustState>,
}

impl MemoryTrust {
    pub fn new(own_user_id: &UserId, state: TrustState) -> Self {
        Self { own_user_id: own_user_id.to_owned(), state: Mutex::new(state) }
    }

    pub fn state(&self) -> MutexGuard<'_, TrustState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl TrustBackend for MemoryTrust {
    async fn user_master_key(&self, user_id: &UserId) -> Option<String> {
        self.state().master_keys.get(user_id).cloned()
    }

    async fn my_trusted_master_key(&self) -> Option<String> {
        self.state().my_trusted_master_key.clone()
    }

    async fn can_cross_sign(&self) -> bool {
        self.state().can_cross_sign
    }

    async fn trust_user(&self, user_id: &UserId) -> Result<(), TrustError> {
        self.state().trusted_users.push(user_id.to_owned());
        Ok(())
    }

    async fn trust_own_device(&self, device_id: &DeviceId) -> Result<(), TrustError> {
        self.state().signed_own_devices.push(device_id.to_owned());
        Ok(())
    }

    async fn locally_trust_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), TrustError> {
        self.state().locally_trusted.push((user_id.to_owned(), device_id.to_owned()));
        Ok(())
    }

    async fn mark_my_master_key_as_trusted(&self) -> Result<(), TrustError> {
        let mut state = self.state();
        state.master_key_marked_trusted = true;
        state.my_trusted_master_key = state.master_keys.get(&self.own_user_id).cloned();

        Ok(())
    }

    async fn user_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceKeys> {
        self.state()
            .devices
            .iter()
            .find(|d| *d.user_id == *user_id && *d.device_id == *device_id)
            .cloned()
    }

    async fn user_devices(&self, user_id: &UserId) -> Vec<DeviceKeys> {
        self.state().devices.iter().filter(|d| *d.user_id == *user_id).cloned().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Destination {
    Room(OwnedRoomId, OwnedEventId),
    ToDevice(OwnedUserId, Vec<OwnedDeviceId>),
}

/// A message one of the engines sent.
#[derive(Clone, Debug)]
pub(crate) struct SentMessage {
    pub sender: OwnedUserId,
    pub event_type: String,
    pub destination: Destination,
    pub content: Value,
}

/// Collects the messages of all engines until the test delivers them.
#[derive(Debug, Default)]
pub(crate) struct Network {
    pending: Mutex<VecDeque<SentMessage>>,
    log: Mutex<Vec<SentMessage>>,
    failing: AtomicBool,
}

impl Network {
    pub fn transport(self: &Arc<Self>, user_id: &UserId) -> Arc<dyn Transport> {
        Arc::new(NetworkTransport { network: self.clone(), user_id: user_id.to_owned() })
    }

    /// Make every following send fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn take_pending(&self) -> Vec<SentMessage> {
        self.pending.lock().unwrap().drain(..).collect()
    }

    /// The event types of every message sent so far, in order.
    pub fn sent_event_types(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|m| m.event_type.clone()).collect()
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, message: SentMessage) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::new("the network is unreachable"));
        }

        self.log.lock().unwrap().push(message.clone());
        self.pending.lock().unwrap().push_back(message);

        Ok(())
    }
}

#[derive(Debug)]
struct NetworkTransport {
    network: Arc<Network>,
    user_id: OwnedUserId,
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn send_in_room(
        &self,
        event_type: &str,
        room_id: &RoomId,
        content: Value,
    ) -> Result<OwnedEventId, TransportError> {
        let event_id = EventId::new(server_name!("example.org"));

        self.network.push(SentMessage {
            sender: self.user_id.clone(),
            event_type: event_type.to_owned(),
            destination: Destination::Room(room_id.to_owned(), event_id.clone()),
            content,
        })?;

        Ok(event_id)
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        user_id: &UserId,
        devices: &[OwnedDeviceId],
        content: Value,
    ) -> Result<(), TransportError> {
        self.network.push(SentMessage {
            sender: self.user_id.clone(),
            event_type: event_type.to_owned(),
            destination: Destination::ToDevice(user_id.to_owned(), devices.to_vec()),
            content,
        })
    }
}

/// One side of a verification.
#[derive(Debug)]
pub(crate) struct TestDevice {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub engine: VerificationEngine,
    pub trust: Arc<MemoryTrust>,
}

impl TestDevice {
    fn new(
        user_id: &UserId,
        device_id: &DeviceId,
        trust: TrustState,
        network: &Arc<Network>,
        config: VerificationConfig,
    ) -> Self {
        let trust = Arc::new(MemoryTrust::new(user_id, trust));

        let engine = VerificationEngine::new(
            user_id.to_owned(),
            device_id.to_owned(),
            network.transport(user_id),
            trust.clone(),
            Arc::new(VodozemacPrimitives::new()),
            config,
        );

        Self { user_id: user_id.to_owned(), device_id: device_id.to_owned(), engine, trust }
    }

    fn receive(&self, message: &SentMessage) {
        let SentMessage { sender, event_type, destination, content } = message;

        let result = match destination {
            Destination::Room(room_id, event_id) => {
                self.engine.receive_room_event(room_id, sender, event_id, event_type, content)
            }
            Destination::ToDevice(user_id, devices) => {
                if *user_id != self.user_id || !devices.contains(&self.device_id) {
                    return;
                }

                self.engine.receive_to_device_event(sender, event_type, content)
            }
        };

        result.unwrap();
    }

    /// Wait until the engine processed everything that was submitted so far.
    async fn settle(&self) {
        self.engine.get_requests_for_user(&self.user_id).await.unwrap();
    }
}

/// Two engines connected by a [`Network`].
#[derive(Debug)]
pub(crate) struct TestPair {
    pub alice: TestDevice,
    pub bob: TestDevice,
    pub network: Arc<Network>,
}

impl TestPair {
    /// Alice and Bob, both with a trusted identity that the other side knows
    /// about.
    pub fn new() -> Self {
        Self::with_configs(VerificationConfig::default(), VerificationConfig::default())
    }

    pub fn with_configs(alice_config: VerificationConfig, bob_config: VerificationConfig) -> Self {
        let network = Arc::new(Network::default());

        let alice_device = device_keys(alice_id(), alice_device_id());
        let bob_device = device_keys(bob_id(), bob_device_id());
        let alice_master_key = random_key();
        let bob_master_key = random_key();

        let master_keys = BTreeMap::from([
            (alice_id().to_owned(), alice_master_key.clone()),
            (bob_id().to_owned(), bob_master_key.clone()),
        ]);

        let alice_trust = TrustState {
            devices: vec![alice_device.clone(), bob_device.clone()],
            master_keys: master_keys.clone(),
            my_trusted_master_key: Some(alice_master_key),
            can_cross_sign: true,
            ..Default::default()
        };

        let bob_trust = TrustState {
            devices: vec![alice_device, bob_device],
            master_keys,
            my_trusted_master_key: Some(bob_master_key),
            can_cross_sign: true,
            ..Default::default()
        };

        Self {
            alice: TestDevice::new(
                alice_id(),
                alice_device_id(),
                alice_trust,
                &network,
                alice_config,
            ),
            bob: TestDevice::new(bob_id(), bob_device_id(), bob_trust, &network, bob_config),
            network,
        }
    }

    /// Two devices of Alice. The first one trusts the master key, the second
    /// one, stored as `bob`, doesn't and can't cross-sign.
    pub fn self_verification() -> Self {
        let network = Arc::new(Network::default());

        let first = device_keys(alice_id(), alice_device_id());
        let second = device_keys(alice_id(), alice_other_device_id());
        let master_key = random_key();
        let master_keys = BTreeMap::from([(alice_id().to_owned(), master_key.clone())]);

        let first_trust = TrustState {
            devices: vec![first.clone(), second.clone()],
            master_keys: master_keys.clone(),
            my_trusted_master_key: Some(master_key),
            can_cross_sign: true,
            ..Default::default()
        };

        let second_trust = TrustState {
            devices: vec![first, second],
            master_keys,
            ..Default::default()
        };

        let config = VerificationConfig::default();

        Self {
            alice: TestDevice::new(
                alice_id(),
                alice_device_id(),
                first_trust,
                &network,
                config.clone(),
            ),
            bob: TestDevice::new(
                alice_id(),
                alice_other_device_id(),
                second_trust,
                &network,
                config,
            ),
            network,
        }
    }

    /// Deliver every pending message, and the ones sent in response, until the
    /// network is quiet.
    pub async fn deliver(&self) {
        loop {
            self.alice.settle().await;
            self.bob.settle().await;

            let pending = self.network.take_pending();

            if pending.is_empty() {
                break;
            }

            for message in &pending {
                self.alice.receive(message);
                self.bob.receive(message);
            }
        }
    }
}
