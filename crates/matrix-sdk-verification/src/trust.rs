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

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};

use crate::error::TrustError;

/// The public identity of a device, as known by the [`TrustBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceKeys {
    /// The owner of the device.
    pub user_id: OwnedUserId,
    /// The id of the device.
    pub device_id: OwnedDeviceId,
    /// The Ed25519 fingerprint of the device, unpadded base64.
    pub fingerprint: String,
}

/// Access to the cross-signing state and the device keys of the local client.
///
/// The engine only reads keys while a verification is in progress, trust is
/// only written once a verification succeeded.
#[async_trait]
pub trait TrustBackend: Send + Sync + std::fmt::Debug {
    /// The public master key of the given user, unpadded base64.
    async fn user_master_key(&self, user_id: &UserId) -> Option<String>;

    /// Our own public master key, if we trust it.
    async fn my_trusted_master_key(&self) -> Option<String>;

    /// Can this device sign other users and devices with its cross-signing
    /// keys.
    async fn can_cross_sign(&self) -> bool;

    /// Sign the master key of the given user with our user-signing key.
    async fn trust_user(&self, user_id: &UserId) -> Result<(), TrustError>;

    /// Sign one of our own devices with our self-signing key.
    async fn trust_own_device(&self, device_id: &DeviceId) -> Result<(), TrustError>;

    /// Mark the device as verified in the local store.
    async fn locally_trust_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), TrustError>;

    /// Mark our own master key as trusted.
    async fn mark_my_master_key_as_trusted(&self) -> Result<(), TrustError>;

    /// Get the keys of a single device.
    async fn user_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceKeys>;

    /// Get the keys of all the known devices of a user.
    async fn user_devices(&self, user_id: &UserId) -> Vec<DeviceKeys>;
}
