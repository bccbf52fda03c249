// Persisted session state: last-known credential, the server's refresh cookie
// and the per-device presence session id. All survive restarts in
// `~/.workshop-sync/session.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::credential::Credential;

pub trait SessionStore: Send + Sync {
    fn load_credential(&self) -> Result<Option<Credential>>;
    fn save_credential(&self, credential: &Credential) -> Result<()>;
    /// Forget the credential and its refresh cookie. The presence session id
    /// is kept; it identifies the device, not the login.
    fn clear_credential(&self) -> Result<()>;
    /// Value of the `refresh_token` cookie last issued by the server.
    fn load_refresh_cookie(&self) -> Result<Option<String>>;
    fn save_refresh_cookie(&self, cookie: Option<&str>) -> Result<()>;
    /// Stable id for this device's presence session, created on first use.
    fn presence_session_id(&self) -> Result<String>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct SessionFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    credential: Option<Credential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_cookie: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    presence_session_id: Option<String>,
}

fn new_session_id() -> String {
    format!("cli-{}", Uuid::new_v4().simple())
}

// ── File store ──────────────────────────────────────────────────────

pub struct FileSessionStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    guard: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), guard: Mutex::new(()) }
    }

    /// `~/.workshop-sync/session.json`.
    pub fn global() -> Option<Self> {
        crate::config::global_dir().map(|dir| Self::new(dir.join("session.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<SessionFile> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("failed to parse `{}`", self.path.display())),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Ok(SessionFile::default())
            }
            Err(error) => {
                Err(error).with_context(|| format!("failed to read `{}`", self.path.display()))
            }
        }
    }

    fn write(&self, state: &SessionFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create `{}`", parent.display()))?;
            ensure_owner_only_dir(parent)?;
        }
        let contents = serde_json::to_string_pretty(state).context("failed to encode session")?;
        fs::write(&self.path, contents)
            .with_context(|| format!("failed to write `{}`", self.path.display()))?;
        ensure_owner_only_file(&self.path)
    }

    fn update<T>(&self, apply: impl FnOnce(&mut SessionFile) -> T) -> Result<T> {
        let _guard = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut state = self.read()?;
        let out = apply(&mut state);
        self.write(&state)?;
        Ok(out)
    }
}

impl SessionStore for FileSessionStore {
    fn load_credential(&self) -> Result<Option<Credential>> {
        let _guard = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(self.read()?.credential)
    }

    fn save_credential(&self, credential: &Credential) -> Result<()> {
        self.update(|state| state.credential = Some(credential.clone()))
    }

    fn clear_credential(&self) -> Result<()> {
        self.update(|state| {
            state.credential = None;
            state.refresh_cookie = None;
        })
    }

    fn load_refresh_cookie(&self) -> Result<Option<String>> {
        let _guard = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(self.read()?.refresh_cookie)
    }

    fn save_refresh_cookie(&self, cookie: Option<&str>) -> Result<()> {
        self.update(|state| state.refresh_cookie = cookie.map(str::to_string))
    }

    fn presence_session_id(&self) -> Result<String> {
        {
            let _guard = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(id) = self.read()?.presence_session_id {
                return Ok(id);
            }
        }
        self.update(|state| state.presence_session_id.get_or_insert_with(new_session_id).clone())
    }
}

// ── In-memory store ─────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<SessionFile>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            state: Mutex::new(SessionFile {
                credential: Some(credential),
                ..SessionFile::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionFile> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemorySessionStore {
    fn load_credential(&self) -> Result<Option<Credential>> {
        Ok(self.lock().credential.clone())
    }

    fn save_credential(&self, credential: &Credential) -> Result<()> {
        self.lock().credential = Some(credential.clone());
        Ok(())
    }

    fn clear_credential(&self) -> Result<()> {
        let mut state = self.lock();
        state.credential = None;
        state.refresh_cookie = None;
        Ok(())
    }

    fn load_refresh_cookie(&self) -> Result<Option<String>> {
        Ok(self.lock().refresh_cookie.clone())
    }

    fn save_refresh_cookie(&self, cookie: Option<&str>) -> Result<()> {
        self.lock().refresh_cookie = cookie.map(str::to_string);
        Ok(())
    }

    fn presence_session_id(&self) -> Result<String> {
        Ok(self.lock().presence_session_id.get_or_insert_with(new_session_id).clone())
    }
}

// ── Owner-only permissions ──────────────────────────────────────────

pub fn ensure_owner_only_file(path: &Path) -> Result<()> {
    set_mode_if_needed(path, 0o600)
}

pub fn ensure_owner_only_dir(path: &Path) -> Result<()> {
    set_mode_if_needed(path, 0o700)
}

#[cfg(unix)]
fn set_mode_if_needed(path: &Path, wanted: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if !path.exists() {
        return Ok(());
    }
    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to read metadata for `{}`", path.display()))?;
    if metadata.permissions().mode() & 0o777 != wanted {
        fs::set_permissions(path, fs::Permissions::from_mode(wanted))
            .with_context(|| format!("failed to set owner-only mode on `{}`", path.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode_if_needed(_path: &Path, _wanted: u32) -> Result<()> {
    Ok(())
}
