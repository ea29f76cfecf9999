//! The password-file credential store.
//!
//! One line per user, `username:$6$<base64-salt>$<base64-digest>`, where the
//! digest is `SHA-512(password ∥ salt)`. The file is re-stat'ed on a
//! schedule and reloaded when its change time moves; the new table replaces
//! the old one atomically, so an in-flight check sees either table whole,
//! never a mix.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use base64::prelude::{Engine, BASE64_STANDARD};
use parking_lot::RwLock;
use sha2::{Digest, Sha512};

use crate::error::Result;
use crate::types::{AuthResult, HashMap};

const DIGEST_LEN: usize = 64;

pub struct PasswordEntry {
    salt: Vec<u8>,
    digest: Vec<u8>,
}

type PasswordTable = HashMap<String, PasswordEntry>;

pub struct CredentialStore {
    path: Option<PathBuf>,
    allow_anonymous: bool,
    entries: RwLock<Option<Arc<PasswordTable>>>,
    last_load: AtomicI64,
}

impl CredentialStore {
    /// An empty path disables the store: every login passes through to the
    /// rest of the auth chain.
    pub fn new(path: Option<PathBuf>, allow_anonymous: bool) -> CredentialStore {
        CredentialStore {
            path,
            allow_anonymous,
            entries: RwLock::new(None),
            last_load: AtomicI64::new(0),
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.path.is_some()
    }

    #[inline]
    fn table(&self) -> Option<Arc<PasswordTable>> {
        self.entries.read().clone()
    }

    /// Evaluates a username/password pair against the loaded table.
    ///
    /// Disabled store: success. Configured but never loaded: denied (fail
    /// closed). Unknown user: `allow_anonymous` decides. Known user: the
    /// digest decides.
    pub fn check(&self, username: &str, password: &str) -> AuthResult {
        if !self.enabled() {
            return AuthResult::Success;
        }
        let Some(table) = self.table() else {
            return AuthResult::LoginDenied;
        };

        let mut result =
            if self.allow_anonymous { AuthResult::Success } else { AuthResult::LoginDenied };

        if let Some(entry) = table.get(username) {
            result = AuthResult::LoginDenied;

            let mut ctx = Sha512::new();
            ctx.update(password.as_bytes());
            ctx.update(&entry.salt);
            if ctx.finalize().as_slice() == entry.digest.as_slice() {
                result = AuthResult::Success;
            }
        }

        result
    }

    /// Stats the file and reloads it when the change time differs from the
    /// last load. Malformed lines are dropped individually; the rest of the
    /// file still loads. Returns true when a reload happened.
    pub fn load_if_changed(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };

        let meta = std::fs::metadata(path)?;
        let ctime = change_stamp(&meta);
        if ctime == self.last_load.load(Ordering::SeqCst) {
            return Ok(false);
        }

        log::info!("change detected in '{}', reloading", path.display());

        let text = std::fs::read_to_string(path)?;
        let mut table = PasswordTable::default();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok((username, entry)) => {
                    table.insert(username, entry);
                }
                Err(e) => {
                    let cut: String = line.chars().take(20).collect();
                    log::error!("dropping invalid username/password line '{cut}...': {e}");
                }
            }
        }

        *self.entries.write() = Some(Arc::new(table));
        self.last_load.store(ctime, Ordering::SeqCst);
        Ok(true)
    }
}

/// Change time with nanosecond precision where the platform has it, so two
/// rewrites within the same second still trigger a reload.
#[cfg(unix)]
fn change_stamp(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.ctime().wrapping_mul(1_000_000_000).wrapping_add(meta.ctime_nsec())
}

#[cfg(not(unix))]
fn change_stamp(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn parse_line(line: &str) -> anyhow::Result<(String, PasswordEntry)> {
    let (username, rest) =
        line.split_once(':').ok_or_else(|| anyhow!("missing ':' separator"))?;
    if username.is_empty() || rest.is_empty() {
        return Err(anyhow!("an empty field was found"));
    }
    if rest.contains(':') {
        return Err(anyhow!("line contains more than one ':'"));
    }

    let rest = rest.strip_prefix("$6$").ok_or_else(|| anyhow!("password field must start with $6$"))?;
    let (salt_b64, digest_b64) = rest
        .split_once('$')
        .ok_or_else(|| anyhow!("expected three fields separated by '$'"))?;
    if salt_b64.is_empty() || digest_b64.is_empty() {
        return Err(anyhow!("an empty field was found"));
    }

    let salt = BASE64_STANDARD.decode(salt_b64).map_err(|e| anyhow!("bad salt base64: {e}"))?;
    let digest =
        BASE64_STANDARD.decode(digest_b64).map_err(|e| anyhow!("bad digest base64: {e}"))?;
    if digest.len() != DIGEST_LEN {
        return Err(anyhow!("digest must be {DIGEST_LEN} bytes, got {}", digest.len()));
    }

    Ok((username.to_string(), PasswordEntry { salt, digest }))
}
