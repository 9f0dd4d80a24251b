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

//! The chunked AEAD construction framing every container's payload: a
//! ChaCha20-derived per-block Poly1305 one-time key, a tag byte folded into
//! the keystream, and the resulting MAC folded into an 8-byte nonce
//! accumulator so every block's nonce depends on every prior block.

use std::io::{self, Read, Write};

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{hchacha, ChaCha20, Key as ChaChaKey, R20};
use generic_array::{typenum::U16, GenericArray};
use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::{Key as PolyKey, Poly1305};
use subtle::ConstantTimeEq;

use crate::error::ContainerError;

pub const KEY_BYTES: usize = 32;
pub const HEADER_BYTES: usize = 24;
/// 1 tag byte + 16 MAC bytes of overhead per block.
pub const ADDITIONAL_BYTES: usize = 17;
const INPUT_BYTES: usize = 16;

pub const TAG_MESSAGE: u8 = 0x00;
pub const TAG_PUSH: u8 = 0x01;
pub const TAG_REKEY: u8 = 0x02;
pub const TAG_FINAL: u8 = TAG_PUSH | TAG_REKEY;

/// Default block size used by the chunking adapter (`spec.md` §4.2).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Shared ChaCha20+Poly1305 stream state, identical on the encrypt and
/// decrypt side; only the direction of `push`/`pull` differs.
pub struct StreamState {
    key: [u8; KEY_BYTES],
    inonce: [u8; 8],
    counter: u32,
}

impl StreamState {
    /// Derive initial state from a fresh random `header` and the container's
    /// symmetric key. `header[..16]` seeds HChaCha20, `header[16..24]`
    /// becomes the initial inonce.
    pub fn new(header: &[u8; HEADER_BYTES], key: &[u8; KEY_BYTES]) -> Self {
        let chacha_key = ChaChaKey::clone_from_slice(key);
        let nonce16: GenericArray<u8, U16> = GenericArray::clone_from_slice(&header[..INPUT_BYTES]);
        let derived = hchacha::<R20>(&chacha_key, &nonce16);

        let mut inonce = [0u8; 8];
        inonce.copy_from_slice(&header[INPUT_BYTES..HEADER_BYTES]);

        StreamState {
            key: derived.into(),
            inonce,
            counter: 1,
        }
    }

    fn nonce(&self) -> [u8; 12] {
        let mut n = [0u8; 12];
        n[0..4].copy_from_slice(&self.counter.to_le_bytes());
        n[4..12].copy_from_slice(&self.inonce);
        n
    }

    /// Encrypt `message` under `additional_data`, producing
    /// `message.len() + ADDITIONAL_BYTES` bytes: tag || ciphertext || mac.
    pub fn push(&mut self, message: &[u8], additional_data: &[u8], tag: u8) -> Vec<u8> {
        let nonce = self.nonce();
        let mut cipher = ChaCha20::new(&ChaChaKey::clone_from_slice(&self.key), &nonce.into());

        let mut block = [0u8; 64];
        cipher.apply_keystream(&mut block);

        let poly_key = PolyKey::clone_from_slice(&block[..32]);
        let mut mac = Poly1305::new(&poly_key);
        mac.update_padded(additional_data);

        let mut tag_block = [0u8; 64];
        tag_block[0] = tag;
        cipher.apply_keystream(&mut tag_block);
        mac.update_padded(&tag_block);

        let mut ciphertext = message.to_vec();
        cipher.apply_keystream(&mut ciphertext);
        mac.update_padded(&ciphertext);

        let mut lens = [0u8; 16];
        lens[0..8].copy_from_slice(&(additional_data.len() as u64).to_le_bytes());
        lens[8..16].copy_from_slice(&((64 + ciphertext.len()) as u64).to_le_bytes());
        mac.update_padded(&lens);

        let mac_bytes: [u8; 16] = mac.finalize().into();

        let mut out = Vec::with_capacity(1 + ciphertext.len() + 16);
        out.push(tag_block[0]);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&mac_bytes);

        self.fold_and_advance(tag, &mac_bytes);
        out
    }

    /// Decrypt `ciphertext` (tag || body || mac) under `additional_data`,
    /// returning the plaintext and the tag byte. Fails on MAC mismatch.
    pub fn pull(&mut self, ciphertext: &[u8], additional_data: &[u8]) -> Result<(Vec<u8>, u8), ContainerError> {
        if ciphertext.len() < ADDITIONAL_BYTES {
            return Err(ContainerError::TruncatedHeader);
        }

        let nonce = self.nonce();
        let mut cipher = ChaCha20::new(&ChaChaKey::clone_from_slice(&self.key), &nonce.into());

        let mut block = [0u8; 64];
        cipher.apply_keystream(&mut block);

        let poly_key = PolyKey::clone_from_slice(&block[..32]);
        let mut mac = Poly1305::new(&poly_key);
        mac.update_padded(additional_data);

        let wire_tag_byte = ciphertext[0];
        let mut tag_block = [0u8; 64];
        tag_block[0] = wire_tag_byte;
        cipher.apply_keystream(&mut tag_block);
        let tag = tag_block[0];
        tag_block[0] = wire_tag_byte;
        mac.update_padded(&tag_block);

        let mlen = ciphertext.len() - ADDITIONAL_BYTES;
        let body = &ciphertext[1..1 + mlen];
        mac.update_padded(body);

        let mut lens = [0u8; 16];
        lens[0..8].copy_from_slice(&(additional_data.len() as u64).to_le_bytes());
        lens[8..16].copy_from_slice(&(64u64 + mlen as u64).to_le_bytes());
        mac.update_padded(&lens);

        let computed: [u8; 16] = mac.finalize().into();
        let stored = &ciphertext[1 + mlen..1 + mlen + 16];
        if computed.ct_eq(stored).unwrap_u8() != 1 {
            return Err(ContainerError::MacMismatch);
        }

        let mut plaintext = body.to_vec();
        cipher.apply_keystream(&mut plaintext);

        self.fold_and_advance(tag, stored.try_into().expect("slice is 16 bytes"));
        Ok((plaintext, tag))
    }

    fn fold_and_advance(&mut self, tag: u8, mac: &[u8; 16]) {
        for i in 0..8 {
            self.inonce[i] ^= mac[i];
        }
        self.counter = self.counter.wrapping_add(1);
        if tag & TAG_REKEY != 0 || self.counter == 0 {
            self.rekey();
        }
    }

    /// Explicit rekey: derive a fresh key and inonce from the current state
    /// without emitting any byte on the wire. Both sides must call this at
    /// the same point in the stream.
    pub fn rekey(&mut self) {
        let nonce = self.nonce();
        let mut cipher = ChaCha20::new(&ChaChaKey::clone_from_slice(&self.key), &nonce.into());

        let mut buf = [0u8; KEY_BYTES + 8];
        buf[..KEY_BYTES].copy_from_slice(&self.key);
        buf[KEY_BYTES..].copy_from_slice(&self.inonce);
        cipher.apply_keystream(&mut buf);

        self.key.copy_from_slice(&buf[..KEY_BYTES]);
        self.inonce.copy_from_slice(&buf[KEY_BYTES..]);
        self.counter = 1;
    }
}

/// Buffers arbitrary-size writes into exact `block_size` secretstream
/// blocks. Additional data is bound only to the very first block; every
/// later block (including the final one) carries no additional data.
pub struct BlockWriter<W: Write> {
    inner: W,
    state: StreamState,
    block_size: usize,
    buf: Vec<u8>,
    first_block_ad: Option<Vec<u8>>,
    closed: bool,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(inner: W, state: StreamState, block_size: usize, first_block_ad: Vec<u8>) -> Self {
        BlockWriter {
            inner,
            state,
            block_size,
            buf: Vec::with_capacity(block_size),
            first_block_ad: Some(first_block_ad),
            closed: false,
        }
    }

    fn flush_block(&mut self, tag: u8) -> io::Result<()> {
        let ad = self.first_block_ad.take().unwrap_or_default();
        let block = self.state.push(&self.buf, &ad, tag);
        self.buf.clear();
        self.inner.write_all(&block)
    }

    /// Finalize the stream, writing the trailing block tagged FINAL (which
    /// may be empty if the plaintext was an exact multiple of `block_size`).
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush_block(TAG_FINAL)
    }

}

impl<W: Write> Write for BlockWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        let mut rest = data;
        while !rest.is_empty() {
            let space = self.block_size - self.buf.len();
            let take = space.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            written += take;
            if self.buf.len() == self.block_size {
                self.flush_block(TAG_MESSAGE)?;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> Drop for BlockWriter<W> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// The dual of [`BlockWriter`]: reads one `block_size + ADDITIONAL_BYTES`
/// ciphertext chunk at a time and yields decrypted plaintext.
pub struct BlockReader<R: Read> {
    inner: R,
    state: StreamState,
    block_size: usize,
    pending: std::collections::VecDeque<u8>,
    first_block_ad: Option<Vec<u8>>,
    finished: bool,
}

impl<R: Read> BlockReader<R> {
    pub fn new(inner: R, state: StreamState, block_size: usize, first_block_ad: Vec<u8>) -> Self {
        BlockReader {
            inner,
            state,
            block_size,
            pending: std::collections::VecDeque::new(),
            first_block_ad: Some(first_block_ad),
            finished: false,
        }
    }

    fn pull_block(&mut self) -> Result<bool, ContainerError> {
        if self.finished {
            return Ok(false);
        }

        let mut wire = vec![0u8; self.block_size + ADDITIONAL_BYTES];
        let mut total = 0;
        while total < wire.len() {
            let n = self.inner.read(&mut wire[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }

        if total == 0 {
            return Err(ContainerError::UnexpectedEof);
        }
        if total < ADDITIONAL_BYTES {
            return Err(ContainerError::TruncatedHeader);
        }

        let ad = self.first_block_ad.take().unwrap_or_default();
        let (plaintext, tag) = self.state.pull(&wire[..total], &ad)?;

        if tag & TAG_FINAL == TAG_FINAL {
            self.finished = true;
        } else if total < wire.len() {
            // Short read with no FINAL tag: the stream was truncated.
            return Err(ContainerError::UnexpectedEof);
        }

        self.pending.extend(plaintext);
        Ok(true)
    }
}

impl<R: Read> Read for BlockReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() && !self.finished {
            self.pull_block()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }

        let n = self.pending.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending.pop_front().unwrap();
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> [u8; HEADER_BYTES] {
        let mut h = [0u8; HEADER_BYTES];
        for (i, b) in h.iter_mut().enumerate() {
            *b = i as u8;
        }
        h
    }

    #[test]
    fn push_pull_roundtrip() {
        let key = [7u8; KEY_BYTES];
        let h = header();
        let mut enc = StreamState::new(&h, &key);
        let mut dec = StreamState::new(&h, &key);

        let ct = enc.push(b"hello world", b"ad", TAG_MESSAGE);
        let (pt, tag) = dec.pull(&ct, b"ad").unwrap();
        assert_eq!(pt, b"hello world");
        assert_eq!(tag, TAG_MESSAGE);
    }

    #[test]
    fn tamper_detected() {
        let key = [3u8; KEY_BYTES];
        let h = header();
        let mut enc = StreamState::new(&h, &key);
        let mut dec = StreamState::new(&h, &key);

        let mut ct = enc.push(b"payload", b"", TAG_FINAL);
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(dec.pull(&ct, b"").is_err());
    }

    #[test]
    fn deterministic_given_same_inputs() {
        let key = [9u8; KEY_BYTES];
        let h = header();
        let mut e1 = StreamState::new(&h, &key);
        let mut e2 = StreamState::new(&h, &key);
        assert_eq!(e1.push(b"abc", b"x", TAG_MESSAGE), e2.push(b"abc", b"x", TAG_MESSAGE));
    }

    #[test]
    fn block_writer_reader_roundtrip() {
        let key = [5u8; KEY_BYTES];
        let h = header();

        let mut cipher_out = Vec::new();
        {
            let enc_state = StreamState::new(&h, &key);
            let mut w = BlockWriter::new(&mut cipher_out, enc_state, 16, b"hdr".to_vec());
            w.write_all(b"this is a message longer than one block").unwrap();
            w.close().unwrap();
        }

        let dec_state = StreamState::new(&h, &key);
        let mut r = BlockReader::new(&cipher_out[..], dec_state, 16, b"hdr".to_vec());
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"this is a message longer than one block");
    }
}
