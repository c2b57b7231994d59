use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use sha1::{Digest, Sha1};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;

/// Key-derivation password, expanded to UTF-16BE with a trailing NUL before use.
const PASSWORD: [u8; 16] = [22, 8, 9, 111, 2, 23, 43, 8, 33, 33, 10, 16, 3, 3, 7, 6];

const BLOCK_LEN: usize = 64;
const HASH_LEN: usize = 20;
const ITERATIONS: usize = 2;

/// Entry 30 of the prefix table is generated from this seed.
const SCRAMBLE_SEED: u64 = 830_819;
const SCRAMBLED_INDEX: usize = 30;

const PREFIX_TABLE: [&str; 32] = [
    "", "", "12", "24", "18", "30", "36", "12", "48", "7", "35", "40", "17", "23", "29", "isabel",
    "kale", "sulli", "van", "merry", "kyle", "james", "maddux", "tony", "hayden", "paul",
    "elijah", "dorothy", "sally", "bran", "", "veil",
];

const WORDS_A: [&str; 54] = [
    "adrp.ldrsh.ldnp", "ldpsw", "umax", "stnp.rsubhn", "sqdmlsl", "uqrshl.csel", "sqshlu",
    "umin.usubl.umlsl", "cbnz.adds", "tbnz", "usubl2", "stxr", "sbfx", "strh", "stxrb.adcs",
    "stxrh", "ands.urhadd", "subs", "sbcs", "fnmadd.ldxrb.saddl", "stur", "ldrsb", "strb", "prfm",
    "ubfiz", "ldrsw.madd.msub.sturb.ldursb", "ldrb", "b.eq", "ldur.sbfiz", "extr", "fmadd",
    "uqadd", "sshr.uzp1.sttrb", "umlsl2", "rsubhn2.ldrh.uqsub", "uqshl", "uabd", "ursra", "usubw",
    "uaddl2", "b.gt", "b.lt", "sqshl", "bics", "smin.ubfx", "smlsl2", "uabdl2", "zip2.ssubw2",
    "ccmp", "sqdmlal", "b.al", "smax.ldurh.uhsub", "fcvtxn2", "b.pl",
];

const WORDS_B: [&str; 57] = [
    "saddl", "urhadd", "ubfiz.sqdmlsl.tbnz.stnp", "smin", "strh", "ccmp", "usubl", "umlsl",
    "uzp1", "sbfx", "b.eq", "zip2.prfm.strb", "msub", "b.pl", "csel", "stxrh.ldxrb",
    "uqrshl.ldrh", "cbnz", "ursra", "sshr.ubfx.ldur.ldnp", "fcvtxn2", "usubl2", "uaddl2", "b.al",
    "ssubw2", "umax", "b.lt", "adrp.sturb", "extr", "uqshl", "smax", "uqsub.sqshlu", "ands",
    "madd", "umin", "b.gt", "uabdl2", "ldrsb.ldpsw.rsubhn", "uqadd", "sttrb", "stxr", "adds",
    "rsubhn2.umlsl2", "sbcs.fmadd", "usubw", "sqshl", "stur.ldrsh.smlsl2", "ldrsw", "fnmadd",
    "stxrb.sbfiz", "adcs", "bics.ldrb", "l1ursb", "subs.uhsub", "ldurh", "uabd", "sqdmlal",
];

static PREFIXES: LazyLock<Vec<String>> = LazyLock::new(|| {
    PREFIX_TABLE
        .iter()
        .enumerate()
        .map(|(i, p)| {
            if i == SCRAMBLED_INDEX {
                scramble(SCRAMBLE_SEED)
            } else {
                (*p).to_string()
            }
        })
        .collect()
});

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encoding index {0} is outside the prefix table")]
    EncodingIndexOutOfRange(i64),
}

/// How salt derivation treats an encoding index outside the prefix table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SaltMode {
    /// Out-of-range index yields the all-zero salt.
    #[default]
    Lenient,
    /// Out-of-range index is an error.
    Strict,
}

/// Two dictionary words joined by a dot, picked by `n`.
pub fn scramble(n: u64) -> String {
    let first = WORDS_A[(n % WORDS_A.len() as u64) as usize];
    let second = WORDS_B[((n + 31) % WORDS_B.len() as u64) as usize];
    format!("{first}.{second}")
}

/// Prefix for an encoding index, if the index is in the table.
pub fn prefix(enc: i64) -> Option<&'static str> {
    let index = usize::try_from(enc).ok()?;
    PREFIXES.get(index).map(String::as_str)
}

/// Build the 16-byte salt for (account id, encoding index).
///
/// The salt is `prefix + decimal(account_id)`, cut to 16 characters and
/// NUL-padded. A non-positive account id always gives the zero salt.
pub fn derive_salt(account_id: i64, enc: i64, mode: SaltMode) -> Result<[u8; SALT_LEN], CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    if account_id <= 0 {
        return Ok(salt);
    }

    let Some(prefix) = prefix(enc) else {
        return match mode {
            SaltMode::Lenient => Ok(salt),
            SaltMode::Strict => Err(CryptoError::EncodingIndexOutOfRange(enc)),
        };
    };

    let text: String = format!("{prefix}{account_id}").chars().take(SALT_LEN).collect();
    let bytes = text.as_bytes();
    let len = bytes.len().min(SALT_LEN);
    salt[..len].copy_from_slice(&bytes[..len]);
    Ok(salt)
}

/// PKCS#12-style derivation (SHA-1, id byte 1, two iterations) of the
/// 32-byte AES key from a salt.
pub fn derive_key(salt: &[u8; SALT_LEN]) -> [u8; KEY_LEN] {
    let diversifier = [1u8; BLOCK_LEN];
    let mut input = fill_block(salt);
    input.extend(fill_block(&password_bmp()));

    let mut key = [0u8; KEY_LEN];
    let rounds = KEY_LEN.div_ceil(HASH_LEN);

    for round in 0..rounds {
        let mut digest = Sha1::new()
            .chain_update(diversifier)
            .chain_update(&input)
            .finalize();
        for _ in 1..ITERATIONS {
            digest = Sha1::digest(digest);
        }

        let start = round * HASH_LEN;
        let len = (KEY_LEN - start).min(HASH_LEN);
        key[start..start + len].copy_from_slice(&digest[..len]);

        if round + 1 < rounds {
            let expanded: Vec<u8> = (0..BLOCK_LEN).map(|j| digest[j % HASH_LEN]).collect();
            for block in input.chunks_exact_mut(BLOCK_LEN) {
                add_with_carry(block, &expanded);
            }
        }
    }

    key
}

/// Password as UTF-16BE including the terminating NUL.
fn password_bmp() -> Vec<u8> {
    PASSWORD
        .iter()
        .chain(std::iter::once(&0u8))
        .flat_map(|b| [0u8, *b])
        .collect()
}

/// Repeat `data` to fill a whole number of 64-byte blocks.
fn fill_block(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let len = BLOCK_LEN * data.len().div_ceil(BLOCK_LEN);
    (0..len).map(|i| data[i % data.len()]).collect()
}

/// block = block + addend + 1, big-endian, carry dropped off the top.
fn add_with_carry(block: &mut [u8], addend: &[u8]) {
    let mut carry: u16 = 1;
    for (x, y) in block.iter_mut().zip(addend).rev() {
        let sum = u16::from(*x) + u16::from(*y) + carry;
        *x = (sum & 0xff) as u8;
        carry = sum >> 8;
    }
}

/// Bounded entries before the key cache is dropped and rebuilt.
const KEY_CACHE_LIMIT: usize = 256;

/// Salt + key derivation with a small memo table keyed on (enc, account id).
#[derive(Debug, Default)]
pub struct KeyDeriver {
    mode: SaltMode,
    cache: Mutex<HashMap<(i64, i64), [u8; KEY_LEN]>>,
}

impl KeyDeriver {
    pub fn new(mode: SaltMode) -> Self {
        Self {
            mode,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> SaltMode {
        self.mode
    }

    pub fn key(&self, account_id: i64, enc: i64) -> Result<[u8; KEY_LEN], CryptoError> {
        if let Ok(cache) = self.cache.lock()
            && let Some(key) = cache.get(&(enc, account_id))
        {
            return Ok(*key);
        }

        let key = derive_key(&derive_salt(account_id, enc, self.mode)?);

        if let Ok(mut cache) = self.cache.lock() {
            if cache.len() >= KEY_CACHE_LIMIT {
                cache.clear();
            }
            cache.insert((enc, account_id), key);
        }
        Ok(key)
    }
}
