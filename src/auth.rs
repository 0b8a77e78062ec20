//! Locally stored login session and the role gate.
//!
//! The backend only authenticates; which operator surfaces a session may use
//! is decided here from the stored role.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::api::LoginResponse;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    /// Backend role strings are compared case-insensitively; anything that
    /// is not `admin` gets the least-privileged role.
    pub fn from_wire(role: &str) -> Self {
        if role.trim().eq_ignore_ascii_case("admin") {
            Role::Admin
        } else {
            Role::User
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub role: Role,
}

impl StoredSession {
    /// Build from a login reply, falling back to the name used to log in.
    pub fn from_login(username: &str, response: &LoginResponse) -> Self {
        let info = response.user_info();
        Self {
            username: info.username.unwrap_or_else(|| username.to_string()),
            email: info.email,
            role: info.role.as_deref().map(Role::from_wire).unwrap_or(Role::User),
        }
    }
}

/// Operator surfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Surface {
    Login,
    Admin,
    UserDashboard,
}

pub fn allows(session: Option<&StoredSession>, surface: Surface) -> bool {
    match surface {
        Surface::Login => true,
        Surface::UserDashboard => session.is_some(),
        Surface::Admin => matches!(session, Some(s) if s.role == Role::Admin),
    }
}

/// JSON file holding at most one session.
#[derive(Clone, Debug)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when nobody is logged in.
    pub fn load(&self) -> Result<Option<StoredSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read session file {}", self.path.display()))?;
        let session = serde_json::from_str(&raw)
            .with_context(|| format!("parse session file {}", self.path.display()))?;
        Ok(Some(session))
    }

    pub fn save(&self, session: &StoredSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let raw = serde_json::to_string_pretty(session).context("serialize session")?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("write session file {}", self.path.display()))?;
        Ok(())
    }

    /// Remove the stored session. Clearing an empty store is not an error.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("remove session file {}", self.path.display())),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
