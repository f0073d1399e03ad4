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

//! Encoding and decoding of the QR code payload.
//!
//! The payload has the following layout:
//!
//! ```text
//! "MATRIX" | version (0x02) | mode | flow id length (u16, BE) | flow id |
//! first key (32 bytes) | second key (32 bytes) | shared secret
//! ```

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use ruma::serde::Base64;

use crate::error::{DecodingError, EncodingError};

const HEADER: &[u8] = b"MATRIX";
const VERSION: u8 = 0x02;
const MAX_MODE: u8 = 0x02;
const MIN_SECRET_LEN: usize = 8;
const KEY_LEN: usize = 32;

/// The decoded content of a verification QR code.
///
/// All keys are Ed25519 keys encoded as unpadded base64.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QrCodeData {
    /// Mode `0x00`, two different users verify each other.
    VerifyingAnotherUser {
        /// The flow id of the verification.
        flow_id: String,
        /// The master key of the user displaying the code.
        master_key: String,
        /// The master key of the other user, as seen by the displaying user.
        other_master_key: String,
        /// The shared secret.
        shared_secret: Base64,
    },

    /// Mode `0x01`, a self verification where the displaying device trusts
    /// the master key.
    SelfVerifyingMasterKeyTrusted {
        /// The flow id of the verification.
        flow_id: String,
        /// Our master key.
        master_key: String,
        /// The key of the other device, as seen by the displaying device.
        other_device_key: String,
        /// The shared secret.
        shared_secret: Base64,
    },

    /// Mode `0x02`, a self verification where the displaying device doesn't
    /// trust the master key yet.
    SelfVerifyingMasterKeyNotTrusted {
        /// The flow id of the verification.
        flow_id: String,
        /// The key of the displaying device.
        device_key: String,
        /// Our master key, as seen by the displaying device.
        master_key: String,
        /// The shared secret.
        shared_secret: Base64,
    },
}

impl QrCodeData {
    /// Decode the payload of a scanned QR code.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, DecodingError> {
        let mut decoded = Cursor::new(bytes);

        let mut header = [0u8; 6];
        let mut first_key = [0u8; KEY_LEN];
        let mut second_key = [0u8; KEY_LEN];

        decoded.read_exact(&mut header)?;
        let version = decoded.read_u8()?;
        let mode = decoded.read_u8()?;

        if header != HEADER {
            return Err(DecodingError::Header);
        } else if version != VERSION {
            return Err(DecodingError::Version(version));
        } else if mode > MAX_MODE {
            return Err(DecodingError::Mode(mode));
        }

        let flow_id_len = decoded.read_u16::<BigEndian>()?;
        let mut flow_id = vec![0; flow_id_len.into()];

        decoded.read_exact(&mut flow_id)?;
        decoded.read_exact(&mut first_key)?;
        decoded.read_exact(&mut second_key)?;

        let mut shared_secret = Vec::new();
        decoded.read_to_end(&mut shared_secret)?;

        if shared_secret.len() < MIN_SECRET_LEN {
            return Err(DecodingError::SharedSecret(shared_secret.len()));
        }

        let flow_id = String::from_utf8(flow_id)?;
        let first_key = vodozemac::base64_encode(first_key);
        let second_key = vodozemac::base64_encode(second_key);
        let shared_secret = Base64::new(shared_secret);

        Ok(match mode {
            0x00 => Self::VerifyingAnotherUser {
                flow_id,
                master_key: first_key,
                other_master_key: second_key,
                shared_secret,
            },
            0x01 => Self::SelfVerifyingMasterKeyTrusted {
                flow_id,
                master_key: first_key,
                other_device_key: second_key,
                shared_secret,
            },
            _ => Self::SelfVerifyingMasterKeyNotTrusted {
                flow_id,
                device_key: first_key,
                master_key: second_key,
                shared_secret,
            },
        })
    }

    /// Encode the data into the bytes that should be rendered as a QR code.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let flow_id = self.flow_id().as_bytes();
        let flow_id_len = u16::try_from(flow_id.len())?;
        let first_key = decode_key(self.first_key())?;
        let second_key = decode_key(self.second_key())?;

        let parts: [&[u8]; 7] = [
            HEADER,
            &[VERSION, self.mode()],
            &flow_id_len.to_be_bytes(),
            flow_id,
            &first_key,
            &second_key,
            self.secret().as_bytes(),
        ];

        Ok(parts.concat())
    }

    /// The mode byte of the code.
    pub fn mode(&self) -> u8 {
        match self {
            Self::VerifyingAnotherUser { .. } => 0x00,
            Self::SelfVerifyingMasterKeyTrusted { .. } => 0x01,
            Self::SelfVerifyingMasterKeyNotTrusted { .. } => 0x02,
        }
    }

    /// The flow id of the verification the code belongs to.
    pub fn flow_id(&self) -> &str {
        match self {
            Self::VerifyingAnotherUser { flow_id, .. }
            | Self::SelfVerifyingMasterKeyTrusted { flow_id, .. }
            | Self::SelfVerifyingMasterKeyNotTrusted { flow_id, .. } => flow_id,
        }
    }

    /// The first key encoded in the code.
    pub fn first_key(&self) -> &str {
        match self {
            Self::VerifyingAnotherUser { master_key, .. }
            | Self::SelfVerifyingMasterKeyTrusted { master_key, .. } => master_key,
            Self::SelfVerifyingMasterKeyNotTrusted { device_key, .. } => device_key,
        }
    }

    /// The second key encoded in the code.
    pub fn second_key(&self) -> &str {
        match self {
            Self::VerifyingAnotherUser { other_master_key, .. } => other_master_key,
            Self::SelfVerifyingMasterKeyTrusted { other_device_key, .. } => other_device_key,
            Self::SelfVerifyingMasterKeyNotTrusted { master_key, .. } => master_key,
        }
    }

    /// The shared secret of the code.
    pub fn secret(&self) -> &Base64 {
        match self {
            Self::VerifyingAnotherUser { shared_secret, .. }
            | Self::SelfVerifyingMasterKeyTrusted { shared_secret, .. }
            | Self::SelfVerifyingMasterKeyNotTrusted { shared_secret, .. } => shared_secret,
        }
    }
}

fn decode_key(key: &str) -> Result<Vec<u8>, EncodingError> {
    let bytes = vodozemac::base64_decode(key).map_err(|_| EncodingError::Base64(key.to_owned()))?;

    if bytes.len() == KEY_LEN {
        Ok(bytes)
    } else {
        Err(EncodingError::KeyLength(bytes.len()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use assert_matches2::assert_let;

    use super::*;

    #[test]
    fn decode_invalid_header() {
        let data = b"NonMatrixCode";
        let result = QrCodeData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::Header));
    }

    #[test]
    fn decode_invalid_mode() {
        let data = b"MATRIX\x02\x03";
        let result = QrCodeData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::Mode(3)));
    }

    #[test]
    fn decode_invalid_version() {
        let data = b"MATRIX\x01\x03";
        let result = QrCodeData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::Version(1)));
    }

    #[test]
    fn decode_missing_data() {
        let data = b"MATRIX\x02\x02";
        let result = QrCodeData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::Read(_)));
    }

    #[test]
    fn decode_short_secret() {
        let data = b"MATRIX\
                   \x02\x02\x00\x07\
                   FLOW_ID\
                   AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\
                   BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB\
                   SECRET";

        let result = QrCodeData::from_bytes(data);
        assert_matches!(result, Err(DecodingError::SharedSecret(6)));
    }

    #[test]
    fn decode_self_verification() {
        let data = b"MATRIX\
                   \x02\x01\x00\x06\
                   FLOWID\
                   AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\
                   BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB\
                   SHARED_SECRET";

        let decoded = QrCodeData::from_bytes(data).unwrap();

        assert_let!(
            QrCodeData::SelfVerifyingMasterKeyTrusted { flow_id, master_key, .. } = &decoded
        );
        assert_eq!(flow_id, "FLOWID");
        assert_eq!(master_key, &vodozemac::base64_encode([b'A'; 32]));
        assert_eq!(decoded.secret().as_bytes(), b"SHARED_SECRET");
        assert_eq!(decoded.to_bytes().unwrap(), data);
    }

    #[test]
    fn encoding_rejects_invalid_keys() {
        let data = QrCodeData::VerifyingAnotherUser {
            flow_id: "FLOWID".to_owned(),
            master_key: "not base64!".to_owned(),
            other_master_key: vodozemac::base64_encode([0u8; 32]),
            shared_secret: Base64::new(b"SHARED_SECRET".to_vec()),
        };
        assert_matches!(data.to_bytes(), Err(EncodingError::Base64(_)));

        let data = QrCodeData::VerifyingAnotherUser {
            flow_id: "FLOWID".to_owned(),
            master_key: vodozemac::base64_encode([0u8; 16]),
            other_master_key: vodozemac::base64_encode([0u8; 32]),
            shared_secret: Base64::new(b"SHARED_SECRET".to_vec()),
        };
        assert_matches!(data.to_bytes(), Err(EncodingError::KeyLength(16)));
    }
}
