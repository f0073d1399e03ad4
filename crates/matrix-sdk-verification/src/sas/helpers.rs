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

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use tracing::trace;

/// The identifiers of both sides of a SAS verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SasIds {
    pub own_user_id: OwnedUserId,
    pub own_device_id: OwnedDeviceId,
    pub other_user_id: OwnedUserId,
    pub other_device_id: OwnedDeviceId,
}

impl SasIds {
    fn starter_and_acceptor(&self, we_started: bool) -> [(&UserId, &DeviceId); 2] {
        let ours = (&*self.own_user_id, &*self.own_device_id);
        let theirs = (&*self.other_user_id, &*self.other_device_id);

        if we_started { [ours, theirs] } else { [theirs, ours] }
    }
}

/// Get the info string for the HKDF of the `curve25519` key agreement
/// protocol.
///
/// The side that received the `m.key.verification.start` message appends its
/// own public key after the identifiers.
pub(crate) fn extra_info_sas_v1(
    ids: &SasIds,
    own_public_key: &str,
    flow_id: &str,
    we_started: bool,
) -> String {
    let [(first_user, first_device), (second_user, second_device)] =
        ids.starter_and_acceptor(we_started);
    let public_key = if we_started { "" } else { own_public_key };

    format!(
        "MATRIX_KEY_VERIFICATION_SAS{first_user}{first_device}{second_user}{second_device}\
         {public_key}{flow_id}"
    )
}

/// Get the info string for the HKDF of the `curve25519-hkdf-sha256` key
/// agreement protocol.
///
/// The side that sent the `m.key.verification.start` message comes first.
pub(crate) fn extra_info_sas_v2(
    ids: &SasIds,
    own_public_key: &str,
    their_public_key: &str,
    flow_id: &str,
    we_started: bool,
) -> String {
    let our_info = format!("{}|{}|{own_public_key}", ids.own_user_id, ids.own_device_id);
    let their_info =
        format!("{}|{}|{their_public_key}", ids.other_user_id, ids.other_device_id);

    let (first_info, second_info) =
        if we_started { (our_info, their_info) } else { (their_info, our_info) };

    let info = format!("MATRIX_KEY_VERIFICATION_SAS|{first_info}|{second_info}|{flow_id}");

    trace!("Generated a SAS extra info: {}", info);

    info
}

/// Get the base info for the MACs we send.
pub(crate) fn extra_mac_info_send(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = ids.own_user_id,
        first_device = ids.own_device_id,
        second_user = ids.other_user_id,
        second_device = ids.other_device_id,
        transaction_id = flow_id,
    )
}

/// Get the base info for the MACs the other side sent us.
pub(crate) fn extra_mac_info_receive(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = ids.other_user_id,
        first_device = ids.other_device_id,
        second_user = ids.own_user_id,
        second_device = ids.own_device_id,
        transaction_id = flow_id,
    )
}

/// An emoji that is used for interactive verification using a short auth
/// string.
///
/// This will contain a single emoji and description from the list of emojis
/// of the [Matrix specification].
///
/// [Matrix specification]: https://spec.matrix.org/unstable/client-server-api/#sas-method-emoji
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd)]
pub struct Emoji {
    /// The emoji symbol that represents a part of the short auth string, for
    /// example: 🐶
    pub symbol: &'static str,
    /// The description of the emoji, for example 'Dog'.
    pub description: &'static str,
}

const fn emoji(symbol: &'static str, description: &'static str) -> Emoji {
    Emoji { symbol, description }
}

const EMOJIS: [Emoji; 64] = [
    emoji("🐶", "Dog"),
    emoji("🐱", "Cat"),
    emoji("🦁", "Lion"),
    emoji("🐎", "Horse"),
    emoji("🦄", "Unicorn"),
    emoji("🐷", "Pig"),
    emoji("🐘", "Elephant"),
    emoji("🐰", "Rabbit"),
    emoji("🐼", "Panda"),
    emoji("🐓", "Rooster"),
    emoji("🐧", "Penguin"),
    emoji("🐢", "Turtle"),
    emoji("🐟", "Fish"),
    emoji("🐙", "Octopus"),
    emoji("🦋", "Butterfly"),
    emoji("🌷", "Flower"),
    emoji("🌳", "Tree"),
    emoji("🌵", "Cactus"),
    emoji("🍄", "Mushroom"),
    emoji("🌏", "Globe"),
    emoji("🌙", "Moon"),
    emoji("☁️", "Cloud"),
    emoji("🔥", "Fire"),
    emoji("🍌", "Banana"),
    emoji("🍎", "Apple"),
    emoji("🍓", "Strawberry"),
    emoji("🌽", "Corn"),
    emoji("🍕", "Pizza"),
    emoji("🎂", "Cake"),
    emoji("❤️", "Heart"),
    emoji("😀", "Smiley"),
    emoji("🤖", "Robot"),
    emoji("🎩", "Hat"),
    emoji("👓", "Glasses"),
    emoji("🔧", "Spanner"),
    emoji("🎅", "Santa"),
    emoji("👍", "Thumbs Up"),
    emoji("☂️", "Umbrella"),
    emoji("⌛", "Hourglass"),
    emoji("⏰", "Clock"),
    emoji("🎁", "Gift"),
    emoji("💡", "Light Bulb"),
    emoji("📕", "Book"),
    emoji("✏️", "Pencil"),
    emoji("📎", "Paperclip"),
    emoji("✂️", "Scissors"),
    emoji("🔒", "Lock"),
    emoji("🔑", "Key"),
    emoji("🔨", "Hammer"),
    emoji("☎️", "Telephone"),
    emoji("🏁", "Flag"),
    emoji("🚂", "Train"),
    emoji("🚲", "Bicycle"),
    emoji("✈️", "Aeroplane"),
    emoji("🚀", "Rocket"),
    emoji("🏆", "Trophy"),
    emoji("⚽", "Ball"),
    emoji("🎸", "Guitar"),
    emoji("🎺", "Trumpet"),
    emoji("🔔", "Bell"),
    emoji("⚓", "Anchor"),
    emoji("🎧", "Headphones"),
    emoji("📁", "Folder"),
    emoji("📌", "Pin"),
];

/// Get the emoji and its description for an index between 0 and 63.
pub(crate) fn emoji_from_index(index: u8) -> Emoji {
    EMOJIS[usize::from(index & 0x3f)].clone()
}

/// Split the first 42 bits of the short auth string bytes into seven 6-bit
/// emoji indices.
pub(crate) fn emoji_indices(bytes: &[u8; 6]) -> [u8; 7] {
    let mut num = [0u8; 8];
    num[2..].copy_from_slice(bytes);
    let num = u64::from_be_bytes(num);

    let mut indices = [0u8; 7];

    for (i, index) in indices.iter_mut().enumerate() {
        *index = ((num >> (48 - 6 * (i + 1))) & 0x3f) as u8;
    }

    indices
}

/// Turn the first 39 bits of the short auth string bytes into three 4 digit
/// numbers.
pub(crate) fn decimals(bytes: &[u8; 6]) -> (u16, u16, u16) {
    let [b0, b1, b2, b3, b4, _] = bytes.map(u16::from);

    let first = (b0 << 5) | (b1 >> 3);
    let second = ((b1 & 0x7) << 10) | (b2 << 2) | (b3 >> 6);
    let third = ((b3 & 0x3f) << 7) | (b4 >> 1);

    (first + 1000, second + 1000, third + 1000)
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;

    fn ids() -> SasIds {
        SasIds {
            own_user_id: user_id!("@alice:example.org").to_owned(),
            own_device_id: device_id!("ALICEDEVICE").to_owned(),
            other_user_id: user_id!("@bob:example.org").to_owned(),
            other_device_id: device_id!("BOBDEVICE").to_owned(),
        }
    }

    #[test]
    fn sas_info_puts_the_starter_first() {
        let ids = ids();

        assert_eq!(
            extra_info_sas_v2(&ids, "OWN", "THEIRS", "flow", true),
            "MATRIX_KEY_VERIFICATION_SAS|@alice:example.org|ALICEDEVICE|OWN|\
             @bob:example.org|BOBDEVICE|THEIRS|flow"
        );
        assert_eq!(
            extra_info_sas_v2(&ids, "OWN", "THEIRS", "flow", false),
            "MATRIX_KEY_VERIFICATION_SAS|@bob:example.org|BOBDEVICE|THEIRS|\
             @alice:example.org|ALICEDEVICE|OWN|flow"
        );
    }

    #[test]
    fn sas_info_v1_carries_our_key_when_we_didnt_start() {
        let ids = ids();

        assert_eq!(
            extra_info_sas_v1(&ids, "OWN", "flow", true),
            "MATRIX_KEY_VERIFICATION_SAS@alice:example.orgALICEDEVICE@bob:example.orgBOBDEVICEflow"
        );
        assert_eq!(
            extra_info_sas_v1(&ids, "OWN", "flow", false),
            "MATRIX_KEY_VERIFICATION_SAS@bob:example.orgBOBDEVICE@alice:example.orgALICEDEVICE\
             OWNflow"
        );
    }

    #[test]
    fn mac_info_is_mirrored() {
        let ids = ids();
        let mirrored = SasIds {
            own_user_id: ids.other_user_id.clone(),
            own_device_id: ids.other_device_id.clone(),
            other_user_id: ids.own_user_id.clone(),
            other_device_id: ids.own_device_id.clone(),
        };

        assert_eq!(extra_mac_info_send(&ids, "flow"), extra_mac_info_receive(&mirrored, "flow"));
        assert_eq!(
            extra_mac_info_send(&ids, "flow"),
            "MATRIX_KEY_VERIFICATION_MAC@alice:example.orgALICEDEVICE@bob:example.orgBOBDEVICEflow"
        );
    }

    #[test]
    fn emoji_generation() {
        let bytes = [0u8; 6];
        let index: Vec<Emoji> = emoji_indices(&bytes).into_iter().map(emoji_from_index).collect();

        assert_eq!(index, vec![emoji_from_index(0); 7]);

        let bytes = [0xffu8; 6];
        let index: Vec<Emoji> = emoji_indices(&bytes).into_iter().map(emoji_from_index).collect();

        assert_eq!(index, vec![emoji_from_index(63); 7]);
        assert_eq!(emoji_from_index(63).description, "Pin");
    }

    #[test]
    fn decimal_generation() {
        let bytes = [0u8; 6];
        assert_eq!(decimals(&bytes), (1000, 1000, 1000));

        let bytes = [0xffu8; 6];
        assert_eq!(decimals(&bytes), (9191, 9191, 9191));
    }
}
