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

//! Cryptographic building blocks of the SAS method.

use std::fmt;

use ruma::serde::{base64::Standard, Base64};
use sha2::{Digest, Sha256};
use vodozemac::sas::{EstablishedSas, Sas};

use crate::error::CryptoError;

/// An ephemeral key agreement, one is created for every SAS verification.
///
/// Any secret material is released when the object is dropped.
pub trait KeyAgreement: Send + Sync + fmt::Debug {
    /// Our ephemeral public key, unpadded base64.
    fn public_key(&self) -> &str;

    /// Set the ephemeral public key of the other side, establishing the shared
    /// secret.
    fn set_their_public_key(&mut self, their_public_key: &str) -> Result<(), CryptoError>;

    /// Derive `length` bytes from the shared secret using the given info
    /// string.
    fn generate_bytes(&self, info: &str, length: usize) -> Result<Vec<u8>, CryptoError>;

    /// Calculate a MAC using the `hkdf-hmac-sha256` method.
    fn calculate_mac(&self, input: &str, info: &str) -> Result<String, CryptoError>;

    /// Calculate a MAC using the `hmac-sha256` method.
    fn calculate_mac_long_kdf(&self, input: &str, info: &str) -> Result<String, CryptoError>;
}

/// Factory for key agreements and the hash used for SAS commitments.
pub trait CryptoPrimitives: Send + Sync + fmt::Debug {
    /// Create a new ephemeral key agreement.
    fn new_key_agreement(&self) -> Box<dyn KeyAgreement>;

    /// Hash the input with SHA-256, returning unpadded base64.
    fn sha256(&self, input: &str) -> String;
}

/// [`CryptoPrimitives`] backed by vodozemac.
#[derive(Clone, Copy, Debug, Default)]
pub struct VodozemacPrimitives;

impl VodozemacPrimitives {
    /// Create a new factory.
    pub fn new() -> Self {
        Self
    }
}

impl CryptoPrimitives for VodozemacPrimitives {
    fn new_key_agreement(&self) -> Box<dyn KeyAgreement> {
        Box::new(VodozemacKeyAgreement::new())
    }

    fn sha256(&self, input: &str) -> String {
        let digest = Sha256::new().chain_update(input).finalize();
        Base64::<Standard>::new(digest.to_vec()).encode()
    }
}

enum AgreementState {
    Created(Sas),
    Established(EstablishedSas),
    /// The Diffie-Hellman step consumes the [`Sas`] object, a failed attempt
    /// leaves the agreement unusable.
    Failed,
}

struct VodozemacKeyAgreement {
    public_key: String,
    state: AgreementState,
}

impl VodozemacKeyAgreement {
    fn new() -> Self {
        let sas = Sas::new();
        let public_key = sas.public_key().to_base64();

        Self { public_key, state: AgreementState::Created(sas) }
    }

    fn established(&self) -> Result<&EstablishedSas, CryptoError> {
        match &self.state {
            AgreementState::Established(sas) => Ok(sas),
            AgreementState::Created(_) | AgreementState::Failed => Err(CryptoError::PeerKeyMissing),
        }
    }
}

impl fmt::Debug for VodozemacKeyAgreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let established = matches!(self.state, AgreementState::Established(_));

        f.debug_struct("VodozemacKeyAgreement")
            .field("public_key", &self.public_key)
            .field("established", &established)
            .finish_non_exhaustive()
    }
}

impl KeyAgreement for VodozemacKeyAgreement {
    fn public_key(&self) -> &str {
        &self.public_key
    }

    fn set_their_public_key(&mut self, their_public_key: &str) -> Result<(), CryptoError> {
        match std::mem::replace(&mut self.state, AgreementState::Failed) {
            AgreementState::Created(sas) => {
                let established = sas.diffie_hellman_with_raw(their_public_key)?;
                self.state = AgreementState::Established(established);

                Ok(())
            }
            state @ AgreementState::Established(_) => {
                self.state = state;
                Err(CryptoError::PeerKeyAlreadySet)
            }
            AgreementState::Failed => Err(CryptoError::PeerKeyAlreadySet),
        }
    }

    fn generate_bytes(&self, info: &str, length: usize) -> Result<Vec<u8>, CryptoError> {
        let sas_bytes = self.established()?.bytes(info);
        let bytes = sas_bytes.as_bytes();

        bytes.get(..length).map(<[u8]>::to_vec).ok_or(CryptoError::UnsupportedLength(length))
    }

    fn calculate_mac(&self, input: &str, info: &str) -> Result<String, CryptoError> {
        Ok(self.established()?.calculate_mac_invalid_base64(input, info))
    }

    fn calculate_mac_long_kdf(&self, _input: &str, _info: &str) -> Result<String, CryptoError> {
        self.established()?;
        Err(CryptoError::UnsupportedMac("hmac-sha256".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn key_agreement_produces_the_same_bytes_on_both_sides() {
        let primitives = VodozemacPrimitives::new();

        let mut alice = primitives.new_key_agreement();
        let mut bob = primitives.new_key_agreement();

        assert_matches!(alice.generate_bytes("info", 6), Err(CryptoError::PeerKeyMissing));

        let alice_key = alice.public_key().to_owned();
        alice.set_their_public_key(bob.public_key()).unwrap();
        bob.set_their_public_key(&alice_key).unwrap();

        assert_eq!(
            alice.generate_bytes("info", 6).unwrap(),
            bob.generate_bytes("info", 6).unwrap()
        );
        assert_ne!(
            alice.generate_bytes("info", 6).unwrap(),
            bob.generate_bytes("other", 6).unwrap()
        );
        assert_eq!(
            alice.calculate_mac("key", "info").unwrap(),
            bob.calculate_mac("key", "info").unwrap()
        );

        assert_matches!(alice.generate_bytes("info", 7), Err(CryptoError::UnsupportedLength(7)));
        assert_matches!(
            alice.set_their_public_key(&alice_key),
            Err(CryptoError::PeerKeyAlreadySet)
        );
        assert_matches!(
            alice.calculate_mac_long_kdf("key", "info"),
            Err(CryptoError::UnsupportedMac(_))
        );
    }

    #[test]
    fn invalid_public_keys_are_rejected() {
        let mut agreement = VodozemacPrimitives::new().new_key_agreement();

        assert_matches!(agreement.set_their_public_key("not a key"), Err(CryptoError::Key(_)));
    }

    #[test]
    fn sha256_is_unpadded_base64() {
        let hash = VodozemacPrimitives::new().sha256("");

        assert_eq!(hash, "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU");
    }
}
