//! Master-key lifecycle: acquisition, caching, rotation, and share escrow.
//!
//! The engine needs exactly one 32-byte root key. Sources are tried in
//! priority order: explicit argument → `VELOCITY_MASTER_KEY` environment
//! variable → `master.key` file in the DB directory → reconstruction
//! from stored shares → interactive acquisition from a human operator.
//!
//! Interactive acquisition either accepts an existing key (base64 or hex)
//! or generates a fresh one, presents it as base64, and optionally splits
//! it into `n` shares with threshold `k` (written to `key_shares/` with
//! mode 0600). On later starts with [`KeySource::UserDefined`], the
//! manager silently reconstructs the key from the first `k` valid share
//! files without prompting.
//!
//! The resolved key is cached in memory with an optional TTL and max-idle
//! window; [`MasterKeyManager::clear_cache`] drops and zeroizes it. A
//! freshly *generated* key is refused when the directory already holds
//! encrypted artifacts — a new key cannot decrypt prior data, so the open
//! must fail closed instead of silently forking the vault.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::{RngCore, rngs::OsRng};
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroize;

use super::cipher::KEY_LEN;
use super::shamir::{self, Share, ShamirError};

/// Environment variable consulted for the master key (base64 or hex).
pub const MASTER_KEY_ENV: &str = "VELOCITY_MASTER_KEY";

/// Key file name inside the DB directory.
pub const MASTER_KEY_FILE: &str = "master.key";

/// Share directory name inside the DB directory.
pub const KEY_SHARES_DIR: &str = "key_shares";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by master-key operations.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Key material was not exactly 32 bytes after decoding.
    #[error("invalid key length {0} (expected {KEY_LEN})")]
    InvalidKeyLength(usize),

    /// Key material was neither valid base64 nor hex.
    #[error("undecodable key material: {0}")]
    Decode(String),

    /// No configured source produced a key.
    #[error("no master key available from any configured source")]
    MissingKey,

    /// Secret-sharing failure (insufficient or malformed shares).
    #[error("secret sharing error: {0}")]
    Shamir(#[from] ShamirError),

    /// The vault already holds encrypted data that a freshly generated
    /// key could not decrypt.
    #[error("vault already initialized; refusing freshly generated key")]
    AlreadyInitialized,

    /// Operator interaction failed.
    #[error("prompt error: {0}")]
    Prompt(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// MasterKey
// ------------------------------------------------------------------------------------------------

/// A 32-byte root key, zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes never reach logs.
        f.write_str("MasterKey(..)")
    }
}

impl MasterKey {
    /// Wraps raw key bytes, enforcing the 32-byte length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidKeyLength(bytes.len()));
        }
        let mut arr = [0u8; KEY_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Generates 32 cryptographically random bytes.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Parses base64 or hex key material.
    pub fn parse(material: &str) -> Result<Self, KeyError> {
        let trimmed = material.trim();
        if let Ok(decoded) = BASE64.decode(trimmed) {
            return Self::from_bytes(&decoded);
        }
        if trimmed.len() == KEY_LEN * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            let mut bytes = [0u8; KEY_LEN];
            for (i, chunk) in trimmed.as_bytes().chunks(2).enumerate() {
                let hi = (chunk[0] as char)
                    .to_digit(16)
                    .ok_or_else(|| KeyError::Decode("bad hex digit".into()))?;
                let lo = (chunk[1] as char)
                    .to_digit(16)
                    .ok_or_else(|| KeyError::Decode("bad hex digit".into()))?;
                bytes[i] = ((hi << 4) | lo) as u8;
            }
            return Ok(Self { bytes });
        }
        Err(KeyError::Decode("expected base64 or 64-char hex".into()))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Base64 rendering for persistence and operator display.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

// ------------------------------------------------------------------------------------------------
// Key source / origin
// ------------------------------------------------------------------------------------------------

/// Where the manager looks for the root key.
#[derive(Debug)]
pub enum KeySource {
    /// Try env → file → share reconstruction → interactive, in that
    /// order.
    Auto,

    /// Key supplied directly by the embedding application.
    Explicit(MasterKey),

    /// `VELOCITY_MASTER_KEY` environment variable only.
    Env,

    /// `master.key` file in the DB directory only.
    File,

    /// Operator-entered key, reconstructed from shares when present.
    UserDefined,
}

/// Whether the resolved key pre-existed or was just generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOrigin {
    Loaded,
    Generated,
}

// ------------------------------------------------------------------------------------------------
// Operator prompt
// ------------------------------------------------------------------------------------------------

/// Narrow capability for talking to a human operator, so tests can stub
/// the interaction.
pub trait KeyPrompt: Send + Sync {
    /// Shows `prompt` and reads one line of input.
    fn read_line(&self, prompt: &str) -> Result<String, KeyError>;

    /// Shows an informational message.
    fn show(&self, message: &str);
}

/// Default prompt backed by stdin/stderr.
pub struct StdioPrompt;

impl KeyPrompt for StdioPrompt {
    fn read_line(&self, prompt: &str) -> Result<String, KeyError> {
        eprint!("{prompt}");
        io::stderr()
            .flush()
            .map_err(|e| KeyError::Prompt(e.to_string()))?;
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| KeyError::Prompt(e.to_string()))?;
        Ok(line.trim().to_string())
    }

    fn show(&self, message: &str) {
        eprintln!("{message}");
    }
}

// ------------------------------------------------------------------------------------------------
// Cache policy
// ------------------------------------------------------------------------------------------------

/// In-memory key retention limits. `None` disables the respective check.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyCachePolicy {
    /// Absolute lifetime of a cached key.
    pub ttl: Option<Duration>,

    /// Maximum idle time between uses.
    pub max_idle: Option<Duration>,
}

struct CachedKey {
    key: MasterKey,
    origin: KeyOrigin,
    acquired: Instant,
    last_used: Instant,
}

// ------------------------------------------------------------------------------------------------
// MasterKeyManager
// ------------------------------------------------------------------------------------------------

/// Owns master-key acquisition and in-memory caching for one vault.
pub struct MasterKeyManager {
    db_path: PathBuf,
    source: KeySource,
    policy: KeyCachePolicy,
    prompt: Box<dyn KeyPrompt>,
    cache: Mutex<Option<CachedKey>>,
}

impl std::fmt::Debug for MasterKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKeyManager")
            .field("db_path", &self.db_path)
            .field("source", &self.source)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl MasterKeyManager {
    /// Creates a manager for the vault rooted at `db_path`.
    pub fn new(db_path: impl AsRef<Path>, source: KeySource) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            source,
            policy: KeyCachePolicy::default(),
            prompt: Box::new(StdioPrompt),
            cache: Mutex::new(None),
        }
    }

    /// Sets the cache retention policy.
    pub fn with_policy(mut self, policy: KeyCachePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the operator prompt (test stubs, embedded UIs).
    pub fn with_prompt(mut self, prompt: Box<dyn KeyPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Returns the active key, acquiring it from the configured source if
    /// the cache is empty or stale.
    pub fn obtain(&self) -> Result<MasterKey, KeyError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| KeyError::Internal("key cache lock poisoned".into()))?;

        if let Some(cached) = cache.as_mut() {
            let now = Instant::now();
            let expired = self
                .policy
                .ttl
                .is_some_and(|ttl| now.duration_since(cached.acquired) > ttl);
            let idle = self
                .policy
                .max_idle
                .is_some_and(|max| now.duration_since(cached.last_used) > max);
            if !expired && !idle {
                cached.last_used = now;
                return Ok(cached.key.clone());
            }
            info!(expired, idle, "master key cache invalidated");
            *cache = None;
        }

        let (key, origin) = self.acquire()?;

        if origin == KeyOrigin::Generated && vault_initialized(&self.db_path) {
            return Err(KeyError::AlreadyInitialized);
        }

        let now = Instant::now();
        *cache = Some(CachedKey {
            key: key.clone(),
            origin,
            acquired: now,
            last_used: now,
        });
        Ok(key)
    }

    /// Replaces the cached key with an externally supplied one (rotation).
    pub fn refresh(&self, key: MasterKey) -> Result<(), KeyError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| KeyError::Internal("key cache lock poisoned".into()))?;
        let now = Instant::now();
        *cache = Some(CachedKey {
            key,
            origin: KeyOrigin::Loaded,
            acquired: now,
            last_used: now,
        });
        Ok(())
    }

    /// Drops the cached key; the key bytes are zeroized as the cache entry
    /// is destroyed.
    pub fn clear_cache(&self) {
        match self.cache.lock() {
            Ok(mut cache) => *cache = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    // --------------------------------------------------------------------
    // Acquisition
    // --------------------------------------------------------------------

    fn acquire(&self) -> Result<(MasterKey, KeyOrigin), KeyError> {
        match &self.source {
            KeySource::Explicit(key) => Ok((key.clone(), KeyOrigin::Loaded)),

            KeySource::Env => self.from_env()?.ok_or(KeyError::MissingKey),

            KeySource::File => self.from_file()?.ok_or(KeyError::MissingKey),

            KeySource::UserDefined => {
                if let Some(key) = self.from_shares()? {
                    return Ok(key);
                }
                self.interactive()
            }

            KeySource::Auto => {
                if let Some(found) = self.from_env()? {
                    return Ok(found);
                }
                if let Some(found) = self.from_file()? {
                    return Ok(found);
                }
                if let Some(found) = self.from_shares()? {
                    return Ok(found);
                }
                self.interactive()
            }
        }
    }

    fn from_env(&self) -> Result<Option<(MasterKey, KeyOrigin)>, KeyError> {
        match std::env::var(MASTER_KEY_ENV) {
            Ok(material) if !material.trim().is_empty() => {
                let key = MasterKey::parse(&material)?;
                info!("master key loaded from environment");
                Ok(Some((key, KeyOrigin::Loaded)))
            }
            _ => Ok(None),
        }
    }

    fn from_file(&self) -> Result<Option<(MasterKey, KeyOrigin)>, KeyError> {
        let path = self.db_path.join(MASTER_KEY_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let material = fs::read_to_string(&path)?;
        let key = MasterKey::parse(&material)?;
        info!(path = %path.display(), "master key loaded from file");
        Ok(Some((key, KeyOrigin::Loaded)))
    }

    fn from_shares(&self) -> Result<Option<(MasterKey, KeyOrigin)>, KeyError> {
        let dir = self.db_path.join(KEY_SHARES_DIR);
        if !dir.is_dir() {
            return Ok(None);
        }

        let mut threshold: Option<usize> = None;
        let mut shares = Vec::new();
        let mut entries: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("share_") && n.ends_with(".key"))
            })
            .collect();
        entries.sort();

        for path in entries {
            match read_share_file(&path) {
                Ok((k, share)) => {
                    let k = k as usize;
                    match threshold {
                        None => threshold = Some(k),
                        Some(prev) if prev != k => {
                            warn!(path = %path.display(), "share threshold mismatch; skipping");
                            continue;
                        }
                        Some(_) => {}
                    }
                    shares.push(share);
                    if shares.len() >= k {
                        break;
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable share file; skipping");
                }
            }
        }

        let Some(threshold) = threshold else {
            return Ok(None);
        };
        if shares.len() < threshold {
            return Err(ShamirError::InsufficientShares {
                have: shares.len(),
                need: threshold,
            }
            .into());
        }

        let secret = shamir::combine(&shares, threshold)?;
        let key = MasterKey::from_bytes(&secret)?;
        info!(threshold, "master key reconstructed from shares");
        Ok(Some((key, KeyOrigin::Loaded)))
    }

    fn interactive(&self) -> Result<(MasterKey, KeyOrigin), KeyError> {
        let entered = self
            .prompt
            .read_line("Enter master key (base64/hex), or press Enter to generate a new one: ")?;

        if !entered.is_empty() {
            let key = MasterKey::parse(&entered)?;
            return Ok((key, KeyOrigin::Loaded));
        }

        let key = MasterKey::generate();
        self.prompt
            .show(&format!("Generated master key (store it safely): {}", key.to_base64()));

        let split_answer = self
            .prompt
            .read_line("Split into shares? Enter k/n (e.g. 3/5), or press Enter to write master.key: ")?;

        if let Some((k, n)) = parse_split_params(&split_answer) {
            let shares = shamir::split(key.as_bytes(), k, n)?;
            let dir = self.db_path.join(KEY_SHARES_DIR);
            fs::create_dir_all(&dir)?;
            for share in &shares {
                write_share_file(&dir.join(format!("share_{}.key", share.index)), k, share)?;
            }
            info!(threshold = k, shares = n, "master key split into shares");
        } else {
            write_key_file(&self.db_path.join(MASTER_KEY_FILE), &key)?;
            info!("master key written to key file");
        }

        Ok((key, KeyOrigin::Generated))
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Whether the directory already holds encrypted artifacts (a non-empty
/// WAL or any SSTable segment).
pub fn vault_initialized(db_path: &Path) -> bool {
    let wal = db_path.join("wal.log");
    if wal.metadata().map(|m| m.len() > 0).unwrap_or(false) {
        return true;
    }
    let Ok(entries) = fs::read_dir(db_path) else {
        return false;
    };
    entries.filter_map(|e| e.ok()).any(|e| {
        e.file_name()
            .to_str()
            .is_some_and(|n| n.starts_with("sst_L") && n.ends_with(".db"))
    })
}

/// Writes base64 key material with mode 0600.
fn write_key_file(path: &Path, key: &MasterKey) -> Result<(), KeyError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(key.to_base64().as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

/// Share file format: base64 of `[threshold][index][data…]`, mode 0600.
fn write_share_file(path: &Path, threshold: u8, share: &Share) -> Result<(), KeyError> {
    let mut raw = Vec::with_capacity(2 + share.data.len());
    raw.push(threshold);
    raw.push(share.index);
    raw.extend_from_slice(&share.data);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(BASE64.encode(&raw).as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

fn read_share_file(path: &Path) -> Result<(u8, Share), KeyError> {
    let content = fs::read_to_string(path)?;
    let raw = BASE64
        .decode(content.trim())
        .map_err(|e| KeyError::Decode(e.to_string()))?;
    if raw.len() < 3 {
        return Err(KeyError::Decode("share file too short".into()));
    }
    Ok((
        raw[0],
        Share {
            index: raw[1],
            data: raw[2..].to_vec(),
        },
    ))
}

/// Parses `k/n` split parameters; `None` when the answer is empty or malformed.
fn parse_split_params(answer: &str) -> Option<(u8, u8)> {
    let (k, n) = answer.trim().split_once('/')?;
    let k: u8 = k.trim().parse().ok()?;
    let n: u8 = n.trim().parse().ok()?;
    if k >= 2 && k <= n { Some((k, n)) } else { None }
}
