use tracing::debug;

use crate::codec::{CodecFailure, CodecOutcome, decode_field};
use crate::keys::{KeyDeriver, SaltMode};

/// Encoding indices tried after the row's own hints.
pub const FALLBACK_ENCODINGS: [i64; 3] = [31, 30, 32];

/// One (encoding index, account id) pair to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub enc: i64,
    pub account_id: i64,
}

/// Which field is being decrypted. Each field has its own plausibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Body,
    RoomName,
    SenderName,
    Attachment,
}

impl FieldKind {
    /// Cheap check whether `value` could be a base64 ciphertext at all.
    pub fn looks_encrypted(self, value: &str) -> bool {
        match self {
            Self::Body | Self::RoomName => {
                value.len() > 10 && value.len() % 4 == 0 && is_base64_alphabet(value)
            }
            Self::SenderName => value.len() > 5 && is_base64_alphabet(value),
            Self::Attachment => {
                if value.len() <= 10 || value.starts_with('{') || value.starts_with('[') {
                    return false;
                }
                let head: String = value.chars().take(100).collect();
                is_base64_alphabet(&head)
            }
        }
    }
}

fn is_base64_alphabet(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}

/// Outcome of the candidate search for a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    Decrypted {
        plaintext: String,
        candidate: Candidate,
        /// Decode attempts made, including the successful one.
        attempts: usize,
    },
    /// The value is not a ciphertext and is used as-is.
    NotEncrypted,
    /// Every candidate was tried and rejected.
    Undetermined {
        attempts: Vec<Candidate>,
        last_failure: Option<CodecFailure>,
    },
}

impl DecryptOutcome {
    pub fn plaintext(&self) -> Option<&str> {
        match self {
            Self::Decrypted { plaintext, .. } => Some(plaintext),
            _ => None,
        }
    }
}

/// Own account id plus the fallback encoding list. Built once; only the
/// account id can change afterwards, through a manual override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionContext {
    pub own_account_id: Option<i64>,
    pub fallback_encodings: Vec<i64>,
}

impl Default for DecryptionContext {
    fn default() -> Self {
        Self {
            own_account_id: None,
            fallback_encodings: FALLBACK_ENCODINGS.to_vec(),
        }
    }
}

impl DecryptionContext {
    pub fn new(own_account_id: Option<i64>) -> Self {
        Self {
            own_account_id: own_account_id.filter(|id| *id > 0),
            ..Default::default()
        }
    }

    /// Ordered, deduplicated candidates.
    ///
    /// Encodings: the field's hints in order (metadata `enc` first), then the
    /// fallbacks. Accounts: own id, then the row's sender. Iteration is
    /// account-major so the own id is exhausted before the sender is tried.
    pub fn plan(&self, hints: &[Option<i64>], sender_id: Option<i64>) -> Vec<Candidate> {
        let mut encodings: Vec<i64> = Vec::new();
        for enc in hints.iter().flatten().chain(self.fallback_encodings.iter()) {
            if !encodings.contains(enc) {
                encodings.push(*enc);
            }
        }

        let mut accounts: Vec<i64> = Vec::new();
        for id in [self.own_account_id, sender_id].into_iter().flatten() {
            if id > 0 && !accounts.contains(&id) {
                accounts.push(id);
            }
        }

        accounts
            .iter()
            .flat_map(|account_id| {
                encodings.iter().map(move |enc| Candidate {
                    enc: *enc,
                    account_id: *account_id,
                })
            })
            .collect()
    }
}

/// Tries candidate keys in order and stops at the first plaintext.
#[derive(Debug)]
pub struct CandidateDecryptor {
    deriver: KeyDeriver,
    context: DecryptionContext,
}

impl CandidateDecryptor {
    pub fn new(context: DecryptionContext, mode: SaltMode) -> Self {
        Self {
            deriver: KeyDeriver::new(mode),
            context,
        }
    }

    pub fn context(&self) -> &DecryptionContext {
        &self.context
    }

    pub fn own_account_id(&self) -> Option<i64> {
        self.context.own_account_id
    }

    pub fn set_own_account_id(&mut self, account_id: i64) {
        self.context.own_account_id = Some(account_id).filter(|id| *id > 0);
    }

    /// Decrypt one field using its hints and the row's sender.
    pub fn decrypt(
        &self,
        kind: FieldKind,
        value: &str,
        hints: &[Option<i64>],
        sender_id: Option<i64>,
    ) -> DecryptOutcome {
        if !kind.looks_encrypted(value) {
            return DecryptOutcome::NotEncrypted;
        }
        let candidates = self.context.plan(hints, sender_id);
        self.search(value, &candidates)
    }

    /// Run the search over an explicit candidate list.
    pub fn search(&self, value: &str, candidates: &[Candidate]) -> DecryptOutcome {
        let mut tried = Vec::with_capacity(candidates.len());
        let mut last_failure = None;

        for candidate in candidates {
            tried.push(*candidate);

            let key = match self.deriver.key(candidate.account_id, candidate.enc) {
                Ok(key) => key,
                Err(e) => {
                    debug!("Skipping candidate {:?}: {}", candidate, e);
                    continue;
                }
            };

            match decode_field(&key, value) {
                CodecOutcome::Plaintext(plaintext) => {
                    return DecryptOutcome::Decrypted {
                        plaintext,
                        candidate: *candidate,
                        attempts: tried.len(),
                    };
                }
                // Not block-shaped: no key will change that.
                CodecOutcome::Passthrough(_) => return DecryptOutcome::NotEncrypted,
                CodecOutcome::Failed(failure) => last_failure = Some(failure),
            }
        }

        DecryptOutcome::Undetermined {
            attempts: tried,
            last_failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encrypt_field;

    const BODY: &str = "meeting moved to 3pm, bring the quarterly numbers";

    fn sealed(account_id: i64, enc: i64, text: &str) -> String {
        let deriver = KeyDeriver::new(SaltMode::Lenient);
        encrypt_field(&deriver.key(account_id, enc).unwrap(), text)
    }

    #[test]
    fn plan_order_and_dedup() {
        let ctx = DecryptionContext::new(Some(100));
        let plan = ctx.plan(&[Some(31), Some(0), Some(31)], Some(200));
        let pairs: Vec<(i64, i64)> = plan.iter().map(|c| (c.account_id, c.enc)).collect();
        assert_eq!(
            pairs,
            vec![
                (100, 31),
                (100, 0),
                (100, 30),
                (100, 32),
                (200, 31),
                (200, 0),
                (200, 30),
                (200, 32),
            ]
        );
    }

    #[test]
    fn plan_skips_sender_equal_to_own() {
        let ctx = DecryptionContext::new(Some(100));
        assert_eq!(ctx.plan(&[None], Some(100)).len(), 3);
        assert_eq!(ctx.plan(&[None], Some(-1)).len(), 3);
    }

    #[test]
    fn plan_without_accounts_is_empty() {
        let ctx = DecryptionContext::new(None);
        assert!(ctx.plan(&[Some(31)], None).is_empty());
    }

    #[test]
    fn stops_at_first_success() {
        let decryptor = CandidateDecryptor::new(DecryptionContext::default(), SaltMode::Lenient);
        let candidates: Vec<Candidate> = [31, 30, 32, 20, 21]
            .into_iter()
            .map(|enc| Candidate { enc, account_id: 77 })
            .collect();

        for (j, target) in candidates.iter().enumerate() {
            let ciphertext = sealed(target.account_id, target.enc, BODY);
            match decryptor.search(&ciphertext, &candidates) {
                DecryptOutcome::Decrypted {
                    plaintext,
                    candidate,
                    attempts,
                } => {
                    assert_eq!(plaintext, BODY);
                    assert_eq!(candidate, *target);
                    assert_eq!(attempts, j + 1);
                }
                other => panic!("expected decryption, got {other:?}"),
            }
        }
    }

    #[test]
    fn undetermined_lists_all_attempts() {
        let decryptor =
            CandidateDecryptor::new(DecryptionContext::new(Some(5)), SaltMode::Lenient);
        let ciphertext = sealed(999, 31, BODY);
        match decryptor.decrypt(FieldKind::Body, &ciphertext, &[Some(31)], Some(6)) {
            DecryptOutcome::Undetermined {
                attempts,
                last_failure,
            } => {
                assert_eq!(attempts.len(), 6);
                assert!(last_failure.is_some());
            }
            other => panic!("expected undetermined, got {other:?}"),
        }
    }

    #[test]
    fn sender_key_found_after_own() {
        let decryptor =
            CandidateDecryptor::new(DecryptionContext::new(Some(5)), SaltMode::Lenient);
        let ciphertext = sealed(6, 30, BODY);
        let outcome = decryptor.decrypt(FieldKind::Body, &ciphertext, &[None], Some(6));
        assert_eq!(outcome.plaintext(), Some(BODY));
        if let DecryptOutcome::Decrypted { attempts, .. } = outcome {
            assert_eq!(attempts, 5);
        }
    }

    #[test]
    fn strict_mode_skips_out_of_range_index() {
        let decryptor =
            CandidateDecryptor::new(DecryptionContext::new(Some(5)), SaltMode::Strict);
        let ciphertext = sealed(5, 31, BODY);
        let outcome = decryptor.decrypt(FieldKind::Body, &ciphertext, &[Some(99)], None);
        match outcome {
            DecryptOutcome::Decrypted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected decryption, got {other:?}"),
        }
    }

    #[test]
    fn plain_values_are_not_encrypted() {
        let decryptor =
            CandidateDecryptor::new(DecryptionContext::new(Some(5)), SaltMode::Lenient);
        assert_eq!(
            decryptor.decrypt(FieldKind::Body, "hello there", &[], None),
            DecryptOutcome::NotEncrypted
        );
        assert_eq!(
            decryptor.decrypt(FieldKind::Attachment, r#"{"url":"x"}"#, &[], None),
            DecryptOutcome::NotEncrypted
        );
        assert_eq!(
            decryptor.decrypt(FieldKind::SenderName, "kim", &[], None),
            DecryptOutcome::NotEncrypted
        );
    }

    #[test]
    fn short_block_input_stops_immediately() {
        let decryptor =
            CandidateDecryptor::new(DecryptionContext::new(Some(5)), SaltMode::Lenient);
        // 12 base64 chars decode to 9 bytes
        assert_eq!(
            decryptor.decrypt(FieldKind::Body, "abcdefghijkl", &[], Some(6)),
            DecryptOutcome::NotEncrypted
        );
    }

    #[test]
    fn malformed_inputs_never_panic() {
        let decryptor =
            CandidateDecryptor::new(DecryptionContext::new(Some(5)), SaltMode::Lenient);
        for input in ["", "====", "A", "////////////////", "++++++++++++++++++++++++"] {
            for kind in [
                FieldKind::Body,
                FieldKind::RoomName,
                FieldKind::SenderName,
                FieldKind::Attachment,
            ] {
                let _ = decryptor.decrypt(kind, input, &[Some(31)], Some(6));
            }
        }
    }
}
