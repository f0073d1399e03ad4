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

use serde::{Deserialize, Serialize};

use crate::VerificationMethod;

/// Settings of a [`VerificationEngine`](crate::VerificationEngine).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// How many events every subscriber can lag behind before publishing an
    /// event waits for the subscriber to catch up.
    pub event_buffer_capacity: usize,

    /// Check the MAC of the other side of a SAS verification as soon as it
    /// arrives, cancelling right away if it doesn't match.
    ///
    /// If unset, an early MAC is only stored and checked once the user
    /// confirms the short codes. Trust is only given after the confirmation
    /// either way.
    pub finalize_early_mac: bool,

    /// The verification methods this device supports.
    pub supported_methods: Vec<VerificationMethod>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            event_buffer_capacity: 20,
            finalize_early_mac: false,
            supported_methods: vec![
                VerificationMethod::SasV1,
                VerificationMethod::QrCodeShowV1,
                VerificationMethod::QrCodeScanV1,
                VerificationMethod::ReciprocateV1,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config: VerificationConfig =
            serde_json::from_value(json!({ "supported_methods": ["m.sas.v1"] })).unwrap();

        assert_eq!(config.event_buffer_capacity, 20);
        assert!(!config.finalize_early_mac);
        assert_eq!(config.supported_methods, [VerificationMethod::SasV1]);
    }
}
