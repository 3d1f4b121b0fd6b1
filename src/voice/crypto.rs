//! XSalsa20-Poly1305 packet sealing for the three negotiated nonce modes.

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use rand::RngCore;
use std::fmt;
use std::str::FromStr;

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
const LITE_SUFFIX_LEN: usize = 4;

/// Modo de cifrado acordado en la descripción de sesión
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionMode {
    /// Nonce = cabecera RTP rellenada con ceros, no se añade nada al paquete
    Normal,
    /// Nonce aleatorio de 24 bytes añadido al final
    Suffix,
    /// Contador de 4 bytes incremental añadido al final
    Lite,
}

impl EncryptionMode {
    /// Orden de preferencia al negociar con el servidor
    pub const PREFERENCE: [EncryptionMode; 3] =
        [EncryptionMode::Lite, EncryptionMode::Suffix, EncryptionMode::Normal];

    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::Normal => "xsalsa20_poly1305",
            EncryptionMode::Suffix => "xsalsa20_poly1305_suffix",
            EncryptionMode::Lite => "xsalsa20_poly1305_lite",
        }
    }

    /// Bytes de nonce transportados al final de cada paquete
    pub fn suffix_len(&self) -> usize {
        match self {
            EncryptionMode::Normal => 0,
            EncryptionMode::Suffix => NONCE_LEN,
            EncryptionMode::Lite => LITE_SUFFIX_LEN,
        }
    }

    /// Elige el mejor modo soportado entre los que ofrece el servidor.
    pub fn negotiate<S: AsRef<str>>(offered: &[S]) -> Option<EncryptionMode> {
        Self::PREFERENCE
            .into_iter()
            .find(|mode| offered.iter().any(|o| o.as_ref() == mode.as_str()))
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionMode {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::PREFERENCE
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| CryptoError::UnsupportedMode(s.to_string()))
    }
}

/// Genera un nonce aleatorio de 24 bytes.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// AEAD wrapper bound to one session key and mode.
pub struct Cipher {
    mode: EncryptionMode,
    aead: XSalsa20Poly1305,
    lite_nonce: u32,
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("mode", &self.mode)
            .field("lite_nonce", &self.lite_nonce)
            .finish_non_exhaustive()
    }
}

impl Cipher {
    pub fn new(mode: EncryptionMode, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(key.len()));
        }
        let aead = XSalsa20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKey(key.len()))?;
        Ok(Self {
            mode,
            aead,
            lite_nonce: 0,
        })
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Cifra `payload`, devolviendo `ciphertext || sufijo de nonce`.
    ///
    /// `header` es la cabecera RTP que precede al paquete; sólo el modo
    /// `Normal` la usa como nonce.
    pub fn close(&mut self, header: &[u8], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        let suffix: Vec<u8> = match self.mode {
            EncryptionMode::Normal => {
                let n = header.len().min(NONCE_LEN);
                nonce[..n].copy_from_slice(&header[..n]);
                Vec::new()
            }
            EncryptionMode::Suffix => {
                nonce = random_nonce();
                nonce.to_vec()
            }
            EncryptionMode::Lite => {
                self.lite_nonce = self.lite_nonce.wrapping_add(1);
                let counter = self.lite_nonce.to_be_bytes();
                nonce[..LITE_SUFFIX_LEN].copy_from_slice(&counter);
                counter.to_vec()
            }
        };

        let mut sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| CryptoError::Encrypt)?;
        sealed.extend_from_slice(&suffix);
        Ok(sealed)
    }

    /// Descifra un cuerpo producido por [`Cipher::close`].
    pub fn open(&self, header: &[u8], body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let suffix_len = self.mode.suffix_len();
        if body.len() < suffix_len + TAG_LEN {
            return Err(CryptoError::PacketTooShort);
        }
        let (ciphertext, suffix) = body.split_at(body.len() - suffix_len);

        let mut nonce = [0u8; NONCE_LEN];
        match self.mode {
            EncryptionMode::Normal => {
                let n = header.len().min(NONCE_LEN);
                nonce[..n].copy_from_slice(&header[..n]);
            }
            EncryptionMode::Suffix | EncryptionMode::Lite => {
                nonce[..suffix.len()].copy_from_slice(suffix);
            }
        }

        self.aead
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn round_trip_all_modes() {
        let key = key();
        let mut rng = rand::thread_rng();
        for mode in EncryptionMode::PREFERENCE {
            let mut cipher = Cipher::new(mode, &key).unwrap();
            for _ in 0..32 {
                let len = rng.gen_range(0..1500);
                let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                let header: [u8; 12] = rng.gen();
                let sealed = cipher.close(&header, &payload).unwrap();
                assert_eq!(sealed.len(), payload.len() + TAG_LEN + mode.suffix_len());
                assert_eq!(cipher.open(&header, &sealed).unwrap(), payload, "mode {mode}");
            }
        }
    }

    #[test]
    fn lite_nonce_increments() {
        let mut cipher = Cipher::new(EncryptionMode::Lite, &key()).unwrap();
        let first = cipher.close(&[0; 12], b"a").unwrap();
        let second = cipher.close(&[0; 12], b"a").unwrap();
        assert_eq!(&first[first.len() - 4..], &1u32.to_be_bytes());
        assert_eq!(&second[second.len() - 4..], &2u32.to_be_bytes());
    }

    #[test]
    fn tampered_packet_is_rejected() {
        let mut cipher = Cipher::new(EncryptionMode::Suffix, &key()).unwrap();
        let mut sealed = cipher.close(&[0; 12], b"hello").unwrap();
        sealed[0] ^= 0xff;
        assert!(matches!(cipher.open(&[0; 12], &sealed), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn negotiation_prefers_lite() {
        let offered = ["xsalsa20_poly1305", "xsalsa20_poly1305_lite", "aead_aes256_gcm"];
        assert_eq!(EncryptionMode::negotiate(&offered), Some(EncryptionMode::Lite));
        assert_eq!(EncryptionMode::negotiate(&["aead_aes256_gcm"]), None);
        assert!("bogus".parse::<EncryptionMode>().is_err());
    }

    #[test]
    fn rejects_short_key() {
        assert!(matches!(
            Cipher::new(EncryptionMode::Normal, &[0u8; 16]),
            Err(CryptoError::InvalidKey(16))
        ));
    }
}
