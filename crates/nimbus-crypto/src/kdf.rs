//! Password → password key → master key
//!
//! Two account generations derive the password key differently:
//!
//! - **Legacy** (v1): an AES-based fixed-round hash. The password is packed
//!   into zero-padded 16-byte AES keys, and a fixed 16-byte state is
//!   encrypted under each of them in turn, 65536 times over.
//! - **Salted** (v2): PBKDF2-HMAC-SHA512 with a per-account salt. The
//!   32-byte output is split into the password key and the login hash.
//!
//! The password key only ever unwraps the account's master key; it is never
//! used on content directly.
//!
//! Ephemeral accounts skip the password entirely: both keys are random, and
//! the session is bound to the master key by a self-challenge
//! `ssc || AES(master, ssc)` that the server echoes back as `tsid`.

use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha512;
use zeroize::Zeroizing;

use nimbus_core::{CryptoConfig, CryptoError, CryptoResult};

use crate::codec::{self, BLOCK_SIZE};
use crate::encoding::{b64_decode, b64_encode};
use crate::keys::{ct_eq, AesKey, KEY_SIZE};

/// Starting state of the legacy password hash
const LEGACY_SEED: [u8; BLOCK_SIZE] = [
    0x93, 0xc4, 0x67, 0xe3, 0x7d, 0xb0, 0xc7, 0xa4, 0xd1, 0xbe, 0x3f, 0x81, 0x01, 0x52, 0xcb, 0x56,
];

/// Output length of the salted derivation: password key + login hash
const SALTED_OUTPUT: usize = 32;

/// The account's root key. Wraps every top-level node key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterKey(AesKey);

impl MasterKey {
    pub fn new(key: AesKey) -> Self {
        Self(key)
    }

    pub fn as_key(&self) -> &AesKey {
        &self.0
    }
}

/// Which derivation an account uses, as reported by the pre-login call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountVersion {
    Legacy,
    Salted,
}

impl AccountVersion {
    pub fn from_wire(version: u8) -> CryptoResult<Self> {
        match version {
            1 => Ok(AccountVersion::Legacy),
            2 => Ok(AccountVersion::Salted),
            other => Err(CryptoError::KeyDerivationFailed(format!(
                "unsupported account version {other}"
            ))),
        }
    }
}

/// Server-supplied derivation inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountParams {
    pub version: AccountVersion,
    pub salt: Option<Vec<u8>>,
    /// Overrides the configured PBKDF2 iteration count when present
    pub iterations: Option<u32>,
}

impl AccountParams {
    pub fn legacy() -> Self {
        Self {
            version: AccountVersion::Legacy,
            salt: None,
            iterations: None,
        }
    }

    pub fn salted(salt: Vec<u8>) -> Self {
        Self {
            version: AccountVersion::Salted,
            salt: Some(salt),
            iterations: None,
        }
    }

    /// Build from the pre-login response fields (`v`, `s`).
    pub fn from_prelogin(version: u8, salt_b64: Option<&str>) -> CryptoResult<Self> {
        let version = AccountVersion::from_wire(version)?;
        let salt = salt_b64.map(b64_decode).transpose()?;
        Ok(Self {
            version,
            salt,
            iterations: None,
        })
    }
}

/// Result of a password derivation.
pub struct DerivedCredentials {
    /// Unwraps the master key
    pub password_key: AesKey,
    /// Proof of password knowledge sent at login, base64url
    pub login_hash: String,
}

impl std::fmt::Debug for DerivedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedCredentials")
            .field("password_key", &self.password_key)
            .field("login_hash", &"[REDACTED]")
            .finish()
    }
}

/// A password derivation strategy for one account generation.
pub trait PasswordKdf: Send + Sync {
    fn version(&self) -> AccountVersion;

    fn derive(&self, email: &str, password: &SecretString) -> CryptoResult<DerivedCredentials>;
}

/// v1 accounts: fixed-round AES hash plus the email-based login hash.
#[derive(Debug, Clone)]
pub struct LegacyKdf {
    rounds: u32,
    hash_rounds: u32,
}

impl LegacyKdf {
    pub fn new(rounds: u32, hash_rounds: u32) -> Self {
        Self {
            rounds,
            hash_rounds,
        }
    }

    /// The password key alone.
    pub fn password_key(&self, password: &SecretString) -> CryptoResult<AesKey> {
        let password = password.expose_secret();
        if password.is_empty() {
            return Err(CryptoError::KeyDerivationFailed("empty password".into()));
        }
        if self.rounds == 0 {
            return Err(CryptoError::KeyDerivationFailed(
                "legacy round count is zero".into(),
            ));
        }

        let mut packed = Zeroizing::new(password.as_bytes().to_vec());
        let padded_len = packed.len().div_ceil(4) * 4;
        packed.resize(padded_len, 0);

        let ciphers: Vec<_> = packed
            .chunks(KEY_SIZE)
            .map(|chunk| {
                let mut block = Zeroizing::new([0u8; KEY_SIZE]);
                block[..chunk.len()].copy_from_slice(chunk);
                codec::cipher_for(&block)
            })
            .collect();

        let mut state = Zeroizing::new(LEGACY_SEED);
        for _ in 0..self.rounds {
            for cipher in &ciphers {
                codec::encrypt_block_with(cipher, &mut state);
            }
        }
        Ok(AesKey::from_bytes(*state))
    }

    /// Email folded into one block and encrypted repeatedly under the
    /// password key; words 0 and 2 of the result.
    pub fn login_hash(&self, email: &str, password_key: &AesKey) -> String {
        let mut state = [0u8; BLOCK_SIZE];
        for (i, byte) in normalize_email(email).bytes().enumerate() {
            state[i % BLOCK_SIZE] ^= byte;
        }

        let cipher = codec::cipher_for(password_key.as_bytes());
        for _ in 0..self.hash_rounds {
            codec::encrypt_block_with(&cipher, &mut state);
        }

        let mut hash = [0u8; 8];
        hash[..4].copy_from_slice(&state[..4]);
        hash[4..].copy_from_slice(&state[8..12]);
        b64_encode(&hash)
    }
}

impl PasswordKdf for LegacyKdf {
    fn version(&self) -> AccountVersion {
        AccountVersion::Legacy
    }

    fn derive(&self, email: &str, password: &SecretString) -> CryptoResult<DerivedCredentials> {
        let password_key = self.password_key(password)?;
        let login_hash = self.login_hash(email, &password_key);
        Ok(DerivedCredentials {
            password_key,
            login_hash,
        })
    }
}

/// v2 accounts: PBKDF2-HMAC-SHA512 over the server-supplied salt.
#[derive(Debug, Clone)]
pub struct SaltedKdf {
    salt: Vec<u8>,
    iterations: u32,
}

impl SaltedKdf {
    pub fn new(salt: Vec<u8>, iterations: u32) -> Self {
        Self { salt, iterations }
    }
}

impl PasswordKdf for SaltedKdf {
    fn version(&self) -> AccountVersion {
        AccountVersion::Salted
    }

    fn derive(&self, _email: &str, password: &SecretString) -> CryptoResult<DerivedCredentials> {
        let password = password.expose_secret();
        if password.is_empty() {
            return Err(CryptoError::KeyDerivationFailed("empty password".into()));
        }
        if self.salt.is_empty() {
            return Err(CryptoError::KeyDerivationFailed("empty salt".into()));
        }
        if self.iterations == 0 {
            return Err(CryptoError::KeyDerivationFailed(
                "PBKDF2 iteration count is zero".into(),
            ));
        }

        let mut derived = Zeroizing::new([0u8; SALTED_OUTPUT]);
        pbkdf2_hmac::<Sha512>(
            password.as_bytes(),
            &self.salt,
            self.iterations,
            derived.as_mut(),
        );

        let password_key = AesKey::from_slice(&derived[..KEY_SIZE])?;
        let login_hash = b64_encode(&derived[KEY_SIZE..]);
        Ok(DerivedCredentials {
            password_key,
            login_hash,
        })
    }
}

/// Pick the strategy for an account. A salted account without a salt is
/// rejected here rather than silently falling back to the legacy hash.
pub fn select_kdf(
    params: &AccountParams,
    config: &CryptoConfig,
) -> CryptoResult<Box<dyn PasswordKdf>> {
    match params.version {
        AccountVersion::Legacy => Ok(Box::new(LegacyKdf::new(
            config.legacy_rounds,
            config.legacy_hash_rounds,
        ))),
        AccountVersion::Salted => {
            let salt = params.salt.clone().ok_or_else(|| {
                CryptoError::KeyDerivationFailed("salted account without a salt".into())
            })?;
            let iterations = params.iterations.unwrap_or(config.pbkdf2_iterations);
            Ok(Box::new(SaltedKdf::new(salt, iterations)))
        }
    }
}

/// Derive the password key and login hash for an account.
pub fn derive_credentials(
    params: &AccountParams,
    config: &CryptoConfig,
    email: &str,
    password: &SecretString,
) -> CryptoResult<DerivedCredentials> {
    let kdf = select_kdf(params, config)?;
    let credentials = kdf.derive(email, password)?;
    tracing::debug!(version = ?kdf.version(), "derived password key");
    Ok(credentials)
}

/// Unwrap the master key from the login response (`k`, base64url).
pub fn decrypt_master_key(password_key: &AesKey, wrapped_b64: &str) -> CryptoResult<MasterKey> {
    let wrapped = b64_decode(wrapped_b64)?;
    if wrapped.len() != KEY_SIZE {
        return Err(CryptoError::KeyUnwrapFailed(format!(
            "master key must be {KEY_SIZE} bytes, got {}",
            wrapped.len()
        )));
    }
    let raw = codec::unwrap_key(password_key, &wrapped)?;
    Ok(MasterKey::new(AesKey::from_slice(&raw)?))
}

/// Wrap a master key under a password key, base64url. Used when creating an
/// account or changing its password.
pub fn encrypt_master_key(password_key: &AesKey, master: &MasterKey) -> CryptoResult<String> {
    let wrapped = codec::wrap_key(password_key, master.as_key().as_bytes())?;
    Ok(b64_encode(&wrapped))
}

/// Key material for a fresh ephemeral account.
#[derive(Debug, Clone)]
pub struct EphemeralAccount {
    pub master: MasterKey,
    /// Stands in for a password-derived key; keep it to log in again
    pub password_key: AesKey,
    /// Master key wrapped under `password_key` (`k`), base64url
    pub wrapped_master: String,
    /// Self-challenge (`ts`), base64url
    pub session_challenge: String,
}

/// Random master and password keys plus the session self-challenge.
pub fn ephemeral_account() -> CryptoResult<EphemeralAccount> {
    let master = MasterKey::new(codec::random_key());
    let password_key = codec::random_key();
    let wrapped_master = encrypt_master_key(&password_key, &master)?;
    let challenge = codec::random_key();
    let session_challenge = b64_encode(&session_challenge(&master, challenge.as_bytes())?);
    tracing::debug!("created ephemeral account keys");
    Ok(EphemeralAccount {
        master,
        password_key,
        wrapped_master,
        session_challenge,
    })
}

/// `challenge || AES(master, challenge)`
fn session_challenge(master: &MasterKey, challenge: &[u8; BLOCK_SIZE]) -> CryptoResult<Vec<u8>> {
    let sealed = codec::wrap_key(master.as_key(), challenge)?;
    let mut out = Vec::with_capacity(2 * BLOCK_SIZE);
    out.extend_from_slice(challenge);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Check a `tsid` returned at login against the master key. A mismatch means
/// the master key (and so the password key that unwrapped it) is wrong.
pub fn verify_session_challenge(master: &MasterKey, tsid_b64: &str) -> CryptoResult<()> {
    let tsid = b64_decode(tsid_b64)?;
    if tsid.len() != 2 * BLOCK_SIZE {
        return Err(CryptoError::InvalidEncoding(format!(
            "session id must be {} bytes, got {}",
            2 * BLOCK_SIZE,
            tsid.len()
        )));
    }
    let (challenge, sealed) = tsid.split_at(BLOCK_SIZE);
    let expected = codec::wrap_key(master.as_key(), challenge)?;
    if !ct_eq(&expected, sealed) {
        return Err(CryptoError::KeyDerivationFailed(
            "session challenge does not match the master key".into(),
        ));
    }
    Ok(())
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn password() -> SecretString {
        SecretString::from("correct horse battery")
    }

    fn fast_config() -> CryptoConfig {
        CryptoConfig {
            pbkdf2_iterations: 1000,
            legacy_rounds: 4,
            legacy_hash_rounds: 2,
        }
    }

    #[test]
    fn test_legacy_known_answer_reduced_rounds() {
        let kdf = LegacyKdf::new(4, 2);
        let creds = kdf.derive("User@Example.com", &password()).unwrap();
        assert_eq!(
            creds.password_key.as_bytes().to_vec(),
            hex("24ddaf2adf9e9f518ae2fb402ab189be")
        );
        assert_eq!(creds.login_hash, "T7K6JRbP5zc");
    }

    #[test]
    fn test_legacy_known_answer_full_rounds() {
        let config = CryptoConfig::default();
        let kdf = LegacyKdf::new(config.legacy_rounds, config.legacy_hash_rounds);
        let creds = kdf.derive("user@example.com", &password()).unwrap();
        assert_eq!(
            creds.password_key.as_bytes().to_vec(),
            hex("cc82fafc29c562b65fda51d265c0817b")
        );
        assert_eq!(creds.login_hash, "XDY5n8aOulM");
    }

    #[test]
    fn test_login_hash_ignores_email_case() {
        let kdf = LegacyKdf::new(4, 2);
        let key = kdf.password_key(&password()).unwrap();
        assert_eq!(
            kdf.login_hash("USER@example.com", &key),
            kdf.login_hash("user@example.com", &key)
        );
    }

    #[test]
    fn test_salted_known_answer() {
        let salt: Vec<u8> = (0u8..32).collect();
        let kdf = SaltedKdf::new(salt, 1000);
        let creds = kdf.derive("user@example.com", &password()).unwrap();
        assert_eq!(
            creds.password_key.as_bytes().to_vec(),
            hex("9003ca9197968bbea7e4fbec64a6fb01")
        );
        assert_eq!(creds.login_hash, "QBZR0A5dPAFzceY74NwlTQ");
    }

    #[test]
    fn test_salted_deterministic_and_salt_sensitive() {
        let a = SaltedKdf::new(vec![1u8; 32], 10).derive("", &password()).unwrap();
        let b = SaltedKdf::new(vec![1u8; 32], 10).derive("", &password()).unwrap();
        let c = SaltedKdf::new(vec![2u8; 32], 10).derive("", &password()).unwrap();
        assert_eq!(a.password_key, b.password_key);
        assert_ne!(a.password_key, c.password_key);
    }

    #[test]
    fn test_salted_without_salt_rejected() {
        let params = AccountParams {
            version: AccountVersion::Salted,
            salt: None,
            iterations: None,
        };
        let result = derive_credentials(&params, &fast_config(), "a@b.c", &password());
        assert!(matches!(result, Err(CryptoError::KeyDerivationFailed(_))));
    }

    #[test]
    fn test_degenerate_inputs_rejected() {
        let empty = SecretString::from("");
        assert!(LegacyKdf::new(4, 2).derive("a@b.c", &empty).is_err());
        assert!(SaltedKdf::new(vec![1; 16], 10).derive("a@b.c", &empty).is_err());
        assert!(SaltedKdf::new(vec![1; 16], 0).derive("a@b.c", &password()).is_err());
        assert!(SaltedKdf::new(vec![], 10).derive("a@b.c", &password()).is_err());
        assert!(LegacyKdf::new(0, 2).derive("a@b.c", &password()).is_err());
    }

    #[test]
    fn test_select_by_version() {
        let config = fast_config();
        let legacy = select_kdf(&AccountParams::legacy(), &config).unwrap();
        assert_eq!(legacy.version(), AccountVersion::Legacy);

        let salted = select_kdf(&AccountParams::salted(vec![7; 32]), &config).unwrap();
        assert_eq!(salted.version(), AccountVersion::Salted);
    }

    #[test]
    fn test_advertised_iterations_override_config() {
        let config = fast_config();
        let mut params = AccountParams::salted((0u8..32).collect());
        params.iterations = Some(1000);
        let mut config_only = config.clone();
        config_only.pbkdf2_iterations = 1;

        let advertised = derive_credentials(&params, &config_only, "", &password()).unwrap();
        assert_eq!(
            advertised.password_key.as_bytes().to_vec(),
            hex("9003ca9197968bbea7e4fbec64a6fb01")
        );
    }

    #[test]
    fn test_from_prelogin() {
        let params = AccountParams::from_prelogin(2, Some("AAECAw")).unwrap();
        assert_eq!(params.version, AccountVersion::Salted);
        assert_eq!(params.salt, Some(vec![0, 1, 2, 3]));

        assert_eq!(
            AccountParams::from_prelogin(1, None).unwrap().version,
            AccountVersion::Legacy
        );
        assert!(AccountParams::from_prelogin(3, None).is_err());
    }

    #[test]
    fn test_master_key_roundtrip() {
        let password_key = AesKey::from_bytes([5u8; KEY_SIZE]);
        let master = MasterKey::new(codec::random_key());

        let wrapped = encrypt_master_key(&password_key, &master).unwrap();
        let recovered = decrypt_master_key(&password_key, &wrapped).unwrap();
        assert_eq!(recovered, master);
    }

    #[test]
    fn test_master_key_wrong_length() {
        let password_key = AesKey::from_bytes([5u8; KEY_SIZE]);
        let result = decrypt_master_key(&password_key, &b64_encode(&[0u8; 32]));
        assert!(matches!(result, Err(CryptoError::KeyUnwrapFailed(_))));
    }

    #[test]
    fn test_session_challenge_known_answer() {
        // FIPS-197 C.1: AES-128(000102..0f, 00112233..ff)
        let master = MasterKey::new(AesKey::from_bytes(std::array::from_fn(|i| i as u8)));
        let mut tsid = hex("00112233445566778899aabbccddeeff");
        tsid.extend(hex("69c4e0d86a7b0430d8cdb78070b4c55a"));
        verify_session_challenge(&master, &b64_encode(&tsid)).unwrap();

        let challenge: [u8; BLOCK_SIZE] = tsid[..BLOCK_SIZE].try_into().unwrap();
        assert_eq!(session_challenge(&master, &challenge).unwrap(), tsid);
    }

    #[test]
    fn test_ephemeral_account_logs_back_in() {
        let account = ephemeral_account().unwrap();

        let master = decrypt_master_key(&account.password_key, &account.wrapped_master).unwrap();
        assert_eq!(master, account.master);
        verify_session_challenge(&master, &account.session_challenge).unwrap();

        // Fresh material every time
        let other = ephemeral_account().unwrap();
        assert_ne!(other.master, account.master);
        assert_ne!(other.session_challenge, account.session_challenge);
    }

    #[test]
    fn test_session_challenge_rejects_wrong_master() {
        let account = ephemeral_account().unwrap();
        let wrong = MasterKey::new(codec::random_key());
        assert!(matches!(
            verify_session_challenge(&wrong, &account.session_challenge),
            Err(CryptoError::KeyDerivationFailed(_))
        ));

        let mut tampered = b64_decode(&account.session_challenge).unwrap();
        tampered[31] ^= 1;
        assert!(verify_session_challenge(&account.master, &b64_encode(&tampered)).is_err());
    }

    #[test]
    fn test_session_challenge_wrong_length() {
        let master = MasterKey::new(codec::random_key());
        assert!(matches!(
            verify_session_challenge(&master, &b64_encode(&[0u8; 16])),
            Err(CryptoError::InvalidEncoding(_))
        ));
        assert!(matches!(
            verify_session_challenge(&master, "not base64!"),
            Err(CryptoError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = LegacyKdf::new(1, 1).derive("a@b.c", &password()).unwrap();
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains(&creds.login_hash));
        assert!(rendered.contains("REDACTED"));
    }
}
