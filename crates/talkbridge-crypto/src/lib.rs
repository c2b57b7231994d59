/// Talkbridge Crypto Library
///
/// Reverses the per-account field encryption used by the chat store:
/// - Salt from (encoding index, account id), PKCS#12-style SHA-1 key derivation
/// - AES-256-CBC with a fixed IV and manual padding checks
/// - Ordered candidate search over (encoding index, account id) pairs
///
/// Nothing in here returns `Err` for bad ciphertext. Callers get explicit
/// outcome values instead, because encrypted and plain fields cannot always
/// be told apart up front.

pub mod candidates;
pub mod codec;
pub mod keys;

pub use candidates::{
    Candidate, CandidateDecryptor, DecryptOutcome, DecryptionContext, FALLBACK_ENCODINGS,
    FieldKind,
};
pub use codec::{CodecFailure, CodecOutcome, decode_field, encrypt_field};
pub use keys::{CryptoError, KeyDeriver, SaltMode, derive_key, derive_salt};
