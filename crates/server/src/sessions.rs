use std::{
    sync::{Arc, Mutex},
    time::SystemTime,
};

use anyhow::{Context, Result, anyhow};
use mllm_shap_config::{VirtualFileSystem, VirtualPath};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Payload of a save request; settings and attributions are stored as given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSession {
    pub name: String,
    pub text_input: String,
    #[serde(default)]
    pub model_settings: Value,
    #[serde(default)]
    pub explain_settings: Value,
    #[serde(default)]
    pub attributions: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    pub name: String,
    pub text_input: String,
    pub model_settings: Value,
    pub explain_settings: Value,
    pub attributions: Value,
    /// Unix seconds.
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: u64,
    pub name: String,
    pub created_at: u64,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            name: session.name.clone(),
            created_at: session.created_at,
        }
    }
}

pub trait SessionStore: Send + Sync {
    fn create(&self, session: NewSession) -> Result<Session>;
    /// Newest first.
    fn list(&self) -> Result<Vec<SessionSummary>>;
    fn get(&self, id: u64) -> Result<Option<Session>>;
    /// Returns `false` when no session had this id.
    fn delete(&self, id: u64) -> Result<bool>;
}

/// One JSON document per session under `sessions/<id>.json`.
pub struct FileSessionStore<F> {
    fs: Arc<F>,
    // Serialises id assignment and writes.
    write_lock: Mutex<()>,
}

impl<F: VirtualFileSystem> FileSessionStore<F> {
    pub fn new(fs: Arc<F>) -> Result<Self> {
        fs.ensure_dir(&VirtualPath::sessions_dir())?;
        Ok(Self {
            fs,
            write_lock: Mutex::new(()),
        })
    }

    fn ids(&self) -> Result<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .fs
            .list(&VirtualPath::sessions_dir())?
            .iter()
            .filter_map(|name| name.strip_suffix(".json"))
            .filter_map(|stem| stem.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Counter file if present, never below the highest stored id plus one.
    fn next_id(&self) -> Result<u64> {
        let counter = VirtualPath::session_counter();
        let stored = if self.fs.exists(&counter)? {
            let bytes = self.fs.read(&counter)?;
            String::from_utf8_lossy(&bytes)
                .trim()
                .parse::<u64>()
                .context("session id counter is corrupt")?
        } else {
            1
        };
        let after_existing = self.ids()?.last().map_or(1, |id| id + 1);
        Ok(stored.max(after_existing))
    }

    fn read(&self, id: u64) -> Result<Session> {
        let bytes = self.fs.read(&VirtualPath::session_file(id))?;
        serde_json::from_slice(&bytes).with_context(|| format!("session {id} is not valid JSON"))
    }
}

impl<F: VirtualFileSystem> SessionStore for FileSessionStore<F> {
    fn create(&self, session: NewSession) -> Result<Session> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("session store lock poisoned"))?;
        let id = self.next_id()?;
        let created_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|dur| dur.as_secs())
            .unwrap_or_default();
        let stored = Session {
            id,
            name: session.name,
            text_input: session.text_input,
            model_settings: session.model_settings,
            explain_settings: session.explain_settings,
            attributions: session.attributions,
            created_at,
        };
        let serialized = serde_json::to_vec_pretty(&stored)?;
        self.fs.write(&VirtualPath::session_file(id), &serialized)?;
        self.fs
            .write(&VirtualPath::session_counter(), (id + 1).to_string().as_bytes())?;
        info!(id, name = %stored.name, "Saved session");
        Ok(stored)
    }

    fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for id in self.ids()? {
            match self.read(id) {
                Ok(session) => summaries.push(SessionSummary::from(&session)),
                Err(err) => warn!(id, error = %err, "Skipping unreadable session"),
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(summaries)
    }

    fn get(&self, id: u64) -> Result<Option<Session>> {
        if !self.fs.exists(&VirtualPath::session_file(id))? {
            return Ok(None);
        }
        self.read(id).map(Some)
    }

    fn delete(&self, id: u64) -> Result<bool> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("session store lock poisoned"))?;
        let path = VirtualPath::session_file(id);
        if !self.fs.exists(&path)? {
            return Ok(false);
        }
        self.fs.remove_file(&path)?;
        debug!(id, "Deleted session");
        Ok(true)
    }
}
