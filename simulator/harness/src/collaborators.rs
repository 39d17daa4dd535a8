//! In-memory collaborators
//!
//! Fakes for the boundaries the session does not own. Each one records what
//! the session asked of it so tests can assert on the interaction.

use async_trait::async_trait;
use msgcenter_core::{
    ContactDirectory, MediaStorage, MessageCenterResult, Preferences, PushError, PushRegistrar,
    UserId,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Preferences
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryPreferences {
    status_message: Mutex<Option<String>>,
    push_enabled: AtomicBool,
    push_sender_id: Mutex<Option<String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(self, status: &str) -> Self {
        *lock(&self.status_message) = Some(status.to_owned());
        self
    }

    pub fn with_push_enabled(self, enabled: bool) -> Self {
        self.push_enabled.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn with_sender_id(self, sender_id: &str) -> Self {
        *lock(&self.push_sender_id) = Some(sender_id.to_owned());
        self
    }

    pub fn set_status(&self, status: Option<&str>) {
        *lock(&self.status_message) = status.map(str::to_owned);
    }
}

impl Preferences for MemoryPreferences {
    fn status_message(&self) -> Option<String> {
        lock(&self.status_message).clone()
    }

    fn push_enabled(&self) -> bool {
        self.push_enabled.load(Ordering::SeqCst)
    }

    fn push_sender_id(&self) -> Option<String> {
        lock(&self.push_sender_id).clone()
    }

    fn set_push_sender_id(&self, sender_id: &str) {
        *lock(&self.push_sender_id) = Some(sender_id.to_owned());
    }
}

// ----------------------------------------------------------------------------
// Push Registrar
// ----------------------------------------------------------------------------

/// Registrar that records requests; results are fed back by the test
#[derive(Debug, Default)]
pub struct FakeRegistrar {
    cached_id: Mutex<Option<String>>,
    registrations: Mutex<Vec<String>>,
    unregistrations: Mutex<usize>,
    registered_on_server: AtomicBool,
    unsupported: AtomicBool,
}

impl FakeRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registrar with a registration id cached from an earlier run
    pub fn with_cached_id(registration_id: &str) -> Self {
        let registrar = Self::new();
        *lock(&registrar.cached_id) = Some(registration_id.to_owned());
        registrar
    }

    pub fn set_unsupported(&self, unsupported: bool) {
        self.unsupported.store(unsupported, Ordering::SeqCst);
    }

    /// Sender ids passed to `register`, in order
    pub fn registrations(&self) -> Vec<String> {
        lock(&self.registrations).clone()
    }

    pub fn unregistrations(&self) -> usize {
        *lock(&self.unregistrations)
    }

    pub fn is_registered_on_server(&self) -> bool {
        self.registered_on_server.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushRegistrar for FakeRegistrar {
    fn registration_id(&self) -> Option<String> {
        lock(&self.cached_id).clone()
    }

    async fn register(&self, sender_id: &str) -> Result<(), PushError> {
        if self.unsupported.load(Ordering::SeqCst) {
            return Err(PushError::Unsupported);
        }
        lock(&self.registrations).push(sender_id.to_owned());
        Ok(())
    }

    async fn unregister(&self) -> Result<(), PushError> {
        *lock(&self.unregistrations) += 1;
        *lock(&self.cached_id) = None;
        Ok(())
    }

    fn set_registered_on_server(&self, registered: bool) {
        self.registered_on_server.store(registered, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Contact Directory
// ----------------------------------------------------------------------------

/// Status messages from users with a known key are "decrypted" by stripping
/// the `enc:` prefix
#[derive(Debug, Default)]
pub struct FakeContacts {
    keys: Mutex<HashMap<String, String>>,
    registered: Mutex<Vec<UserId>>,
}

impl FakeContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_key(&self, user_id: &str, key: &str) {
        lock(&self.keys).insert(user_id.to_ascii_lowercase(), key.to_owned());
    }

    /// Users marked registered, in order
    pub fn registered(&self) -> Vec<UserId> {
        lock(&self.registered).clone()
    }
}

#[async_trait]
impl ContactDirectory for FakeContacts {
    async fn mark_registered(&self, user_id: &UserId) -> MessageCenterResult<()> {
        lock(&self.registered).push(user_id.clone());
        Ok(())
    }

    fn decrypt_status(&self, user_id: &UserId, status: &str) -> Option<String> {
        let keys = lock(&self.keys);
        keys.get(&user_id.as_str().to_ascii_lowercase())?;
        status.strip_prefix("enc:").map(str::to_owned)
    }
}

// ----------------------------------------------------------------------------
// Media Storage
// ----------------------------------------------------------------------------

const CACHE_DIR: &str = "/cache";
const MEDIA_DIR: &str = "/media";

/// File system stand-in keyed by path
#[derive(Debug, Default)]
pub struct MemoryMediaStorage {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryMediaStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, content: Vec<u8>) {
        lock(&self.files).insert(path.into(), content);
    }

    pub fn file(&self, path: &Path) -> Option<Vec<u8>> {
        lock(&self.files).get(path).cloned()
    }

    pub fn file_count(&self) -> usize {
        lock(&self.files).len()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn write(&self, dir: &str, filename: &str, content: &[u8]) -> io::Result<PathBuf> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "storage full"));
        }
        let path = Path::new(dir).join(filename);
        lock(&self.files).insert(path.clone(), content.to_vec());
        Ok(path)
    }
}

#[async_trait]
impl MediaStorage for MemoryMediaStorage {
    async fn write_preview(&self, filename: &str, content: &[u8]) -> io::Result<PathBuf> {
        self.write(CACHE_DIR, filename, content)
    }

    async fn write_media(&self, filename: &str, content: &[u8]) -> io::Result<PathBuf> {
        self.write(MEDIA_DIR, filename, content)
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.file(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }
}
