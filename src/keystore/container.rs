/* Interpose (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::num::NonZeroU32;

use ring::{
    aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN},
    pbkdf2,
    rand::{SecureRandom, SystemRandom},
};

use crate::utils::CertificateError;

/// Container layout: `MAGIC | salt | nonce | AES-256-GCM(payload) | tag`.
const MAGIC: &[u8; 5] = b"IPRC1";
const SALT_LEN: usize = 16;
const PBKDF2_ROUNDS: u32 = 100_000;

fn derive_key(password: &str, salt: &[u8]) -> Result<LessSafeKey, CertificateError> {
    let rounds = NonZeroU32::new(PBKDF2_ROUNDS)
        .ok_or_else(|| CertificateError::Storage("pbkdf2 rounds must be non-zero".into()))?;
    let mut key = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        rounds,
        salt,
        password.as_bytes(),
        &mut key,
    );
    let unbound = UnboundKey::new(&aead::AES_256_GCM, &key)
        .map_err(|_| CertificateError::Storage("invalid container key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypts `payload` under a key derived from `password`.
pub fn seal_container(payload: &[u8], password: &str) -> Result<Vec<u8>, CertificateError> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut salt)
        .and_then(|_| rng.fill(&mut nonce))
        .map_err(|_| CertificateError::Storage("system randomness unavailable".into()))?;

    let key = derive_key(password, &salt)?;
    let mut sealed = payload.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce),
        Aad::from(&MAGIC[..]),
        &mut sealed,
    )
    .map_err(|_| CertificateError::Storage("container encryption failed".into()))?;

    let mut out = Vec::with_capacity(MAGIC.len() + SALT_LEN + NONCE_LEN + sealed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypts a container. A wrong password and a corrupted file are indistinguishable.
pub fn open_container(data: &[u8], password: &str) -> Result<Vec<u8>, CertificateError> {
    let header = MAGIC.len() + SALT_LEN + NONCE_LEN;
    if data.len() < header + aead::AES_256_GCM.tag_len() || !data.starts_with(MAGIC) {
        return Err(CertificateError::Storage("not a certificate container".into()));
    }
    let salt = &data[MAGIC.len()..MAGIC.len() + SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&data[MAGIC.len() + SALT_LEN..header]);

    let key = derive_key(password, salt)?;
    let mut sealed = data[header..].to_vec();
    let plain = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(&MAGIC[..]),
            &mut sealed,
        )
        .map_err(|_| CertificateError::Storage("wrong password or corrupted container".into()))?;
    Ok(plain.to_vec())
}
