//! # Packet Cipher
//!
//! AES-128-EAX with an 8-byte tag. The datagram header is the associated
//! data, the tag travels in the MAC field in front of the header.
//!
//! Keys are per packet: a key/nonce pair is derived per (direction, type,
//! generation) from the session IV, then the first two key bytes are xored
//! with the wire id. Derived pairs are cached per (direction, type) until the
//! generation changes.
//!
//! Before the handshake installs an IV every encrypted packet uses a fixed,
//! well-known key and nonce.

use aes::Aes128;
use eax::aead::consts::U8;
use eax::aead::generic_array::GenericArray;
use eax::aead::{AeadInPlace, KeyInit};
use eax::Eax;
use parking_lot::Mutex;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::CryptoError;
use crate::wire::{PacketType, MAC_SIZE};

pub type Key = [u8; 16];
pub type Nonce = [u8; 16];
pub type Mac = [u8; MAC_SIZE];

type PacketAead = Eax<Aes128, U8>;

/// Handshake key used until a shared IV exists.
pub const DEFAULT_KEY: Key = *b"c:\\windows\\syste";
/// Handshake nonce used until a shared IV exists.
pub const DEFAULT_NONCE: Nonce = *b"m\\firewall32.cpl";
/// MAC written into unencrypted packets before the handshake.
pub const DEFAULT_MAC: Mac = *b"TS3INIT1";

const LEGACY_IV_LEN: usize = 20;
const IV_LEN: usize = 64;
/// Outside the u16 generation range; forces derivation on first use.
const INVALID_GENERATION: u32 = u32::MAX;

// ─── Key Derivation ─────────────────────────────────────────────────────────

/// Derives the per-generation key/nonce pair from the session IV.
///
/// The wire id tweak is applied by [`PacketCipher`] afterwards, so
/// implementations are called at most once per generation and type. A
/// failed derivation is not cached.
pub trait KeyDerivation: Send + Sync {
    fn derive(
        &self,
        iv: &[u8],
        to_server: bool,
        packet_type: PacketType,
        generation: u16,
    ) -> Result<(Key, Nonce), CryptoError>;
}

/// SHA-256 over `[direction, type, generation BE, iv]`; the digest is split
/// into key and nonce.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256KeyDerivation;

impl KeyDerivation for Sha256KeyDerivation {
    fn derive(
        &self,
        iv: &[u8],
        to_server: bool,
        packet_type: PacketType,
        generation: u16,
    ) -> Result<(Key, Nonce), CryptoError> {
        let mut hasher = Sha256::new();
        hasher.update([if to_server { 0x31 } else { 0x30 }, packet_type.as_u8() & 0x0F]);
        hasher.update((generation as u32).to_be_bytes());
        hasher.update(iv);
        let digest = hasher.finalize();

        let mut key = [0u8; 16];
        let mut nonce = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        nonce.copy_from_slice(&digest[16..32]);
        Ok((key, nonce))
    }
}

// ─── Cipher State ───────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct KeyCacheEntry {
    generation: u32,
    key: Key,
    nonce: Nonce,
}

impl KeyCacheEntry {
    const EMPTY: KeyCacheEntry = KeyCacheEntry {
        generation: INVALID_GENERATION,
        key: [0; 16],
        nonce: [0; 16],
    };
}

struct SessionState {
    iv: Option<Vec<u8>>,
    mac: Mac,
}

/// Session crypto for one connection.
///
/// The session IV and the key cache sit behind separate locks: the decode
/// path derives keys while a control path may install or reset the secret.
pub struct PacketCipher {
    session: Mutex<SessionState>,
    /// Index 0: server → client, index 1: client → server.
    cache: Mutex<[[KeyCacheEntry; PacketType::COUNT]; 2]>,
    derivation: Box<dyn KeyDerivation>,
}

impl Default for PacketCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCipher {
    pub fn new() -> Self {
        Self::with_derivation(Box::new(Sha256KeyDerivation))
    }

    pub fn with_derivation(derivation: Box<dyn KeyDerivation>) -> Self {
        PacketCipher {
            session: Mutex::new(SessionState {
                iv: None,
                mac: DEFAULT_MAC,
            }),
            cache: Mutex::new([[KeyCacheEntry::EMPTY; PacketType::COUNT]; 2]),
            derivation,
        }
    }

    /// Whether a shared IV has been installed.
    pub fn encryption_initialized(&self) -> bool {
        self.session.lock().iv.is_some()
    }

    /// MAC for unencrypted packets: `TS3INIT1` before setup, then the first
    /// eight bytes of SHA-1(IV).
    pub fn session_mac(&self) -> Mac {
        self.session.lock().mac
    }

    /// Install an IV derived elsewhere. Accepts the 20-byte legacy and the
    /// 64-byte layout.
    pub fn install_shared_iv(&self, iv: &[u8]) -> Result<(), CryptoError> {
        if iv.len() != LEGACY_IV_LEN && iv.len() != IV_LEN {
            return Err(CryptoError::InvalidIvLength(iv.len()));
        }

        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&Sha1::digest(iv)[..MAC_SIZE]);

        {
            let mut session = self.session.lock();
            session.iv = Some(iv.to_vec());
            session.mac = mac;
        }
        self.invalidate_cache();
        tracing::debug!(iv_len = iv.len(), "session iv installed");
        Ok(())
    }

    /// IV = SHA-1(shared_key) xor (alpha || beta).
    pub fn setup_shared_secret_legacy(
        &self,
        alpha: &[u8; 10],
        beta: &[u8; 10],
        shared_key: &[u8],
    ) -> Result<(), CryptoError> {
        let mut iv = [0u8; LEGACY_IV_LEN];
        iv.copy_from_slice(&Sha1::digest(shared_key));
        xor_in_place(&mut iv[..10], alpha);
        xor_in_place(&mut iv[10..], beta);
        self.install_shared_iv(&iv)
    }

    /// IV = SHA-512(shared) xor (alpha || beta).
    pub fn setup_shared_secret(
        &self,
        alpha: &[u8; 10],
        beta: &[u8; 54],
        shared: &[u8; 32],
    ) -> Result<(), CryptoError> {
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&Sha512::digest(shared));
        xor_in_place(&mut iv[..10], alpha);
        xor_in_place(&mut iv[10..], beta);
        self.install_shared_iv(&iv)
    }

    /// Drop the session secret and every cached key.
    pub fn reset(&self) {
        {
            let mut session = self.session.lock();
            session.iv = None;
            session.mac = DEFAULT_MAC;
        }
        self.invalidate_cache();
    }

    fn invalidate_cache(&self) {
        *self.cache.lock() = [[KeyCacheEntry::EMPTY; PacketType::COUNT]; 2];
    }

    /// Key and nonce for one packet.
    ///
    /// Fails while no shared IV is installed.
    pub fn generate_key_nonce(
        &self,
        to_server: bool,
        packet_type: PacketType,
        wire_id: u16,
        generation: u16,
    ) -> Result<(Key, Nonce), CryptoError> {
        let (mut key, nonce) = {
            let mut cache = self.cache.lock();
            let entry = &mut cache[to_server as usize][packet_type.index()];
            if entry.generation != generation as u32 {
                let session = self.session.lock();
                let iv = session
                    .iv
                    .as_deref()
                    .ok_or(CryptoError::KeyGeneration(packet_type.as_u8()))?;
                let (key, nonce) =
                    self.derivation.derive(iv, to_server, packet_type, generation)?;
                *entry = KeyCacheEntry {
                    generation: generation as u32,
                    key,
                    nonce,
                };
            }
            (entry.key, entry.nonce)
        };

        key[0] ^= (wire_id >> 8) as u8;
        key[1] ^= (wire_id & 0xFF) as u8;
        Ok((key, nonce))
    }

    /// Encrypt `payload` in place and return the tag for the MAC field.
    pub fn encrypt(
        header: &[u8],
        payload: &mut [u8],
        key: &Key,
        nonce: &Nonce,
    ) -> Result<Mac, CryptoError> {
        let aead = PacketAead::new(GenericArray::from_slice(key));
        let tag = aead
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), header, payload)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&tag);
        Ok(mac)
    }

    /// Verify `mac` and decrypt `payload` in place.
    ///
    /// On failure `payload` is left in an unspecified state; callers that
    /// retry with another key decrypt a copy.
    pub fn decrypt(
        header: &[u8],
        payload: &mut [u8],
        mac: &[u8],
        key: &Key,
        nonce: &Nonce,
    ) -> Result<(), CryptoError> {
        if mac.len() != MAC_SIZE {
            return Err(CryptoError::AuthenticationFailed);
        }
        let aead = PacketAead::new(GenericArray::from_slice(key));
        aead.decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            header,
            payload,
            GenericArray::from_slice(mac),
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Check a raw client datagram against the derived keys without
    /// touching it.
    pub fn verify_encryption(&self, datagram: &[u8], wire_id: u16, generation: u16) -> bool {
        const HEADER_END: usize = MAC_SIZE + crate::wire::CLIENT_HEADER_SIZE;
        if datagram.len() < HEADER_END {
            return false;
        }
        let Ok(packet_type) = PacketType::from_u8(datagram[HEADER_END - 1] & 0x0F) else {
            return false;
        };
        let Ok((key, nonce)) = self.generate_key_nonce(true, packet_type, wire_id, generation)
        else {
            return false;
        };
        let mut scratch = datagram[HEADER_END..].to_vec();
        Self::decrypt(
            &datagram[MAC_SIZE..HEADER_END],
            &mut scratch,
            &datagram[..MAC_SIZE],
            &key,
            &nonce,
        )
        .is_ok()
    }
}

fn xor_in_place(target: &mut [u8], mask: &[u8]) {
    for (t, m) in target.iter_mut().zip(mask) {
        *t ^= m;
    }
}
