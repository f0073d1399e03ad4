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

use std::error::Error as StdError;

use thiserror::Error;

use crate::CancelCode;

/// Result type for operations submitted to the
/// [`VerificationEngine`](crate::VerificationEngine).
pub type VerificationResult<T> = Result<T, VerificationError>;

/// Error type describing why a locally requested verification action failed.
#[derive(Error, Debug)]
pub enum VerificationError {
    /// No verification request with the given flow id is known.
    #[error("no verification request with the flow id {0} is known")]
    UnknownRequest(String),

    /// No active verification transaction with the given flow id is known.
    #[error("no verification transaction with the flow id {0} is known")]
    UnknownTransaction(String),

    /// The request or transaction is in a state that doesn't allow the
    /// requested action.
    #[error("{0}")]
    InvalidState(&'static str),

    /// We don't share any verification method with the other side.
    #[error("no common verification method could be agreed on")]
    NoCommonMethod,

    /// A verification transaction already exists for this request.
    #[error("a verification transaction was already started for this request")]
    AlreadyStarted,

    /// The device on the other side of the request is unknown, the request
    /// hasn't been accepted yet.
    #[error("the other device of the verification request is unknown")]
    MissingOtherDevice,

    /// The verification was cancelled while processing the action.
    #[error("the verification got cancelled: {}", .0.reason())]
    Cancelled(CancelCode),

    /// The scanned QR code couldn't be decoded.
    #[error(transparent)]
    MalformedQrCode(#[from] DecodingError),

    /// The QR code for the request couldn't be encoded.
    #[error(transparent)]
    QrEncoding(#[from] EncodingError),

    /// Sending a verification message failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The key agreement failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// An outgoing message couldn't be serialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// An outgoing message couldn't be converted into canonical JSON.
    #[error(transparent)]
    CanonicalJson(#[from] ruma::CanonicalJsonError),

    /// The trust backend failed to record a verification result.
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// The verification engine isn't running anymore.
    #[error("the verification engine has been shut down")]
    EngineStopped,
}

/// Error type for the key agreement used by the SAS method.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The public key of the other side isn't a valid Curve25519 key.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// An operation required the public key of the other side, but it wasn't
    /// set yet.
    #[error("the public key of the other side hasn't been set")]
    PeerKeyMissing,

    /// The public key of the other side was already set.
    #[error("the public key of the other side was already set")]
    PeerKeyAlreadySet,

    /// The MAC method isn't supported by this implementation.
    #[error("the MAC method {0} isn't supported")]
    UnsupportedMac(String),

    /// The hash method isn't supported by this implementation.
    #[error("the hash method {0} isn't supported")]
    UnsupportedHash(String),

    /// The key agreement protocol isn't supported by this implementation.
    #[error("the key agreement protocol {0} isn't supported")]
    UnsupportedKeyAgreement(String),

    /// More short authentication string bytes were requested than the key
    /// agreement can produce.
    #[error("can't generate {0} bytes for the short authentication string")]
    UnsupportedLength(usize),
}

/// Error type describing why a QR code payload couldn't be decoded.
#[derive(Error, Debug)]
pub enum DecodingError {
    /// The QR code data is missing the `MATRIX` header.
    #[error("the decoded QR code is missing the Matrix header")]
    Header,

    /// The flow id isn't valid UTF-8.
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),

    /// The QR code data contains an unknown verification mode.
    #[error("the QR code contains an invalid verification mode: {0}")]
    Mode(u8),

    /// The QR code data ended prematurely.
    #[error(transparent)]
    Read(#[from] std::io::Error),

    /// The shared secret is shorter than the required minimum.
    #[error("the QR code contains a too short shared secret, length: {0}")]
    SharedSecret(usize),

    /// The QR code data has a version we don't understand.
    #[error("the QR code contains an invalid or unsupported version: {0}")]
    Version(u8),
}

/// Error type describing why a QR code payload couldn't be encoded.
#[derive(Error, Debug)]
pub enum EncodingError {
    /// One of the keys isn't valid unpadded base64.
    #[error("the key {0} isn't valid base64")]
    Base64(String),

    /// One of the keys doesn't decode to 32 bytes.
    #[error("a key in a QR code needs to be 32 bytes long, got {0}")]
    KeyLength(usize),

    /// The flow id is too long to have its length encoded as a u16.
    #[error("the verification flow id length can't be converted into a u16: {0}")]
    FlowId(#[from] std::num::TryFromIntError),
}

/// Error returned by a [`Transport`](crate::Transport) implementation.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct TransportError(Box<dyn StdError + Send + Sync>);

impl TransportError {
    /// Wrap the error of a transport implementation.
    pub fn new(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

/// Error returned by a [`TrustBackend`](crate::TrustBackend) implementation.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct TrustError(Box<dyn StdError + Send + Sync>);

impl TrustError {
    /// Wrap the error of a trust backend implementation.
    pub fn new(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self(error.into())
    }
}
