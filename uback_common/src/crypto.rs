// uback_common is the core library implementing the backup-chain engine.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! X25519 key agreement and the HChaCha20 key derivation that turns a raw
//! Diffie-Hellman shared secret into the 32-byte symmetric key a container
//! is sealed with.

use chacha20::{hchacha, Key as ChaChaKey, R20};
use generic_array::{typenum::U16, GenericArray};
use rand_core::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

pub const PUBLIC_KEY_BYTES: usize = 32;
pub const PRIVATE_KEY_BYTES: usize = 32;
pub const SESSION_KEY_BYTES: usize = 32;

/// A long-term or ephemeral X25519 identity.
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Identity { secret, public }
    }

    /// Reconstruct an identity from a raw 32-byte private key.
    pub fn from_private_bytes(bytes: [u8; PRIVATE_KEY_BYTES]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Identity { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_BYTES] {
        self.public.to_bytes()
    }

    pub fn private_bytes(&self) -> [u8; PRIVATE_KEY_BYTES] {
        self.secret.to_bytes()
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Derive the 32-byte symmetric container key shared with `their_public`,
    /// per `spec.md` §4.1 step 2: raw X25519 agreement, then HChaCha20 with a
    /// zero 16-byte nonce, zeroizing the raw shared secret afterwards.
    pub fn derive_shared_key(&self, their_public: &PublicKey) -> [u8; SESSION_KEY_BYTES] {
        let shared = self.secret.diffie_hellman(their_public);
        let mut raw = *shared.as_bytes();
        let key = derive_key_from_shared_secret(&raw);
        raw.zeroize();
        key
    }

    /// True iff `candidate` is the public key matching this identity's
    /// private key, compared in constant time (the "wrong key" detector
    /// from `spec.md` §4.1 step 3 / §8 property 3).
    pub fn is_recipient(&self, candidate: &[u8; PUBLIC_KEY_BYTES]) -> bool {
        self.public.to_bytes().ct_eq(candidate).into()
    }
}

fn derive_key_from_shared_secret(shared: &[u8; 32]) -> [u8; 32] {
    let key = ChaChaKey::clone_from_slice(shared);
    let zero_nonce: GenericArray<u8, U16> = GenericArray::default();
    hchacha::<R20>(&key, &zero_nonce).into()
}

/// Parse a public key out of its raw 32-byte wire form.
pub fn public_key_from_bytes(bytes: [u8; PUBLIC_KEY_BYTES]) -> PublicKey {
    PublicKey::from(bytes)
}

/// Parse a public key out of its hex-encoded wire form (the `Key`/
/// `PublicKey` fingerprint option's format).
pub fn public_key_from_hex(s: &str) -> Result<PublicKey, hex::FromHexError> {
    let mut bytes = [0u8; PUBLIC_KEY_BYTES];
    hex::decode_to_slice(s, &mut bytes)?;
    Ok(public_key_from_bytes(bytes))
}

impl Identity {
    /// Write the raw 32-byte private key to `path` with owner-only
    /// permissions, mirroring `hbak`'s `ExportPass` discipline.
    pub fn save_private_to_file(&self, path: &std::path::Path) -> std::io::Result<()> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut f = std::fs::OpenOptions::new().create(true).write(true).truncate(true).mode(0o600).open(path)?;
        f.write_all(&self.private_bytes())
    }

    /// Load a private key written by [`Identity::save_private_to_file`].
    pub fn load_private_from_file(path: &std::path::Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        let bytes: [u8; PRIVATE_KEY_BYTES] = raw
            .try_into()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "identity file has wrong length"))?;
        Ok(Identity::from_private_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_key_agrees_both_directions() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let k1 = alice.derive_shared_key(&bob.public());
        let k2 = bob.derive_shared_key(&alice.public());
        assert_eq!(k1, k2);
    }

    #[test]
    fn recipient_check_matches_only_correct_key() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        assert!(alice.is_recipient(&alice.public_bytes()));
        assert!(!alice.is_recipient(&bob.public_bytes()));
    }

    #[test]
    fn private_bytes_roundtrip() {
        let alice = Identity::generate();
        let reloaded = Identity::from_private_bytes(alice.private_bytes());
        assert_eq!(alice.public_bytes(), reloaded.public_bytes());
    }

    #[test]
    fn save_and_load_identity_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");

        let alice = Identity::generate();
        alice.save_private_to_file(&path).unwrap();
        let reloaded = Identity::load_private_from_file(&path).unwrap();
        assert_eq!(alice.public_bytes(), reloaded.public_bytes());
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let alice = Identity::generate();
        let encoded = hex::encode(alice.public_bytes());
        let decoded = public_key_from_hex(&encoded).unwrap();
        assert_eq!(decoded.to_bytes(), alice.public_bytes());
    }
}
