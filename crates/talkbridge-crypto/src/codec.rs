use aes::Aes256;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::keys::KEY_LEN;

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// Fixed CBC initialization vector shared by every field.
pub const IV: [u8; 16] = [
    15, 8, 1, 0, 25, 71, 37, 220, 21, 245, 23, 224, 225, 21, 12, 53,
];

const BLOCK: usize = 16;

/// Result of decoding one field with one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecOutcome {
    /// Decrypted, unpadded, valid UTF-8, not garbled.
    Plaintext(String),
    /// The input cannot be a ciphertext (empty, `{}`, `[]`, or not block
    /// sized). Carries the input unchanged.
    Passthrough(String),
    /// Decryption ran but the output was rejected.
    Failed(CodecFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecFailure {
    #[error("not valid base64")]
    InvalidBase64,
    #[error("bad padding byte {0}")]
    BadPadding(u8),
    #[error("padding {pad} exceeds plaintext length {len}")]
    PaddingExceedsLength { pad: u8, len: usize },
    #[error("empty plaintext")]
    EmptyPlaintext,
    #[error("plaintext is not valid UTF-8")]
    InvalidUtf8,
    #[error("garbled plaintext ({control} control chars of {total})")]
    Garbled { control: usize, total: usize },
}

/// Decode a base64 AES-256-CBC field with `key`.
///
/// Never panics on malformed input. Padding is checked by hand: only the last
/// byte is read, and it must lie in `1..=16` and not exceed the data length.
pub fn decode_field(key: &[u8; KEY_LEN], ciphertext: &str) -> CodecOutcome {
    if ciphertext.is_empty() || ciphertext == "{}" || ciphertext == "[]" {
        return CodecOutcome::Passthrough(ciphertext.to_string());
    }

    let Ok(bytes) = BASE64.decode(ciphertext.trim()) else {
        return CodecOutcome::Failed(CodecFailure::InvalidBase64);
    };

    if bytes.is_empty() || bytes.len() % BLOCK != 0 {
        return CodecOutcome::Passthrough(ciphertext.to_string());
    }

    let Ok(mut plain) = Aes256CbcDec::new(key.into(), &IV.into())
        .decrypt_padded_vec_mut::<NoPadding>(&bytes)
    else {
        return CodecOutcome::Passthrough(ciphertext.to_string());
    };

    let Some(&pad) = plain.last() else {
        return CodecOutcome::Passthrough(ciphertext.to_string());
    };
    if pad == 0 || usize::from(pad) > BLOCK {
        return CodecOutcome::Failed(CodecFailure::BadPadding(pad));
    }
    if usize::from(pad) > plain.len() {
        return CodecOutcome::Failed(CodecFailure::PaddingExceedsLength {
            pad,
            len: plain.len(),
        });
    }

    plain.truncate(plain.len() - usize::from(pad));
    if plain.is_empty() {
        return CodecOutcome::Failed(CodecFailure::EmptyPlaintext);
    }

    let Ok(text) = String::from_utf8(plain) else {
        return CodecOutcome::Failed(CodecFailure::InvalidUtf8);
    };

    let (control, total) = control_ratio(&text);
    if control * 10 > total {
        return CodecOutcome::Failed(CodecFailure::Garbled { control, total });
    }

    CodecOutcome::Plaintext(text)
}

/// Control characters (below space, excluding tab, LF and CR) vs total chars.
fn control_ratio(text: &str) -> (usize, usize) {
    text.chars().fold((0, 0), |(control, total), c| {
        let is_control = (c as u32) < 32 && !matches!(c, '\t' | '\n' | '\r');
        (control + usize::from(is_control), total + 1)
    })
}

/// Encrypt a field the way the store does (PKCS#7, fixed IV, base64).
/// Used to build fixtures and to check the decoder.
pub fn encrypt_field(key: &[u8; KEY_LEN], plaintext: &str) -> String {
    let ciphertext = Aes256CbcEnc::new(key.into(), &IV.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    BASE64.encode(ciphertext)
}
