//! Session user, roles, and the persisted current-user file
//!
//! `Session` is the explicit context handed to everything that needs the tenant
//! or the logged-in user. Logging in or out builds a new `Session`; an existing
//! one is never mutated.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::UserId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::warn;

/// Member role as stored on the user record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Member,
    Admin,
    Treasurer,
    Secretary,
    ShopAdmin,
    Other(String),
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "member" => Role::Member,
            "admin" => Role::Admin,
            "treasurer" => Role::Treasurer,
            "secretary" => Role::Secretary,
            "shop_admin" => Role::ShopAdmin,
            _ => Role::Other(s),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Member => "member".to_string(),
            Role::Admin => "admin".to_string(),
            Role::Treasurer => "treasurer".to_string(),
            Role::Secretary => "secretary".to_string(),
            Role::ShopAdmin => "shop_admin".to_string(),
            Role::Other(s) => s,
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Member
    }
}

/// The logged-in user as returned by the login webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: i64,
    #[serde(default, alias = "orgId")]
    pub org_id: Option<i64>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Role,
}

impl SessionUser {
    pub fn user_id(&self) -> UserId {
        UserId::Int(self.id)
    }

    pub fn display_name(&self) -> String {
        self.full_name
            .as_deref()
            .or(self.first_name.as_deref())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("Member")
            .to_string()
    }

    /// May open the chat admin inbox
    pub fn is_admin(&self) -> bool {
        matches!(
            self.role,
            Role::Admin | Role::Treasurer | Role::Secretary | Role::ShopAdmin
        )
    }

    pub fn can_manage_finances(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Treasurer | Role::Secretary)
    }

    pub fn can_create_broadcast(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Treasurer | Role::Secretary)
    }
}

/// Current-user file, written atomically
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.session_file.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored user; a missing or corrupt file means logged out
    pub fn load(&self) -> Result<Option<SessionUser>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&content) {
            Ok(user) => Ok(Some(user)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unparsable session file");
                Ok(None)
            }
        }
    }

    /// Save user to disk atomically
    pub fn save(&self, user: &SessionUser) -> Result<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent)?;

        // Write to temp file in same directory (for atomic rename)
        let mut temp = NamedTempFile::new_in(parent)?;
        let json = serde_json::to_string_pretty(user)?;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;

        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Logout
    pub fn clear(&self) -> Result<bool> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Tenant config plus the (optional) logged-in user
#[derive(Debug, Clone)]
pub struct Session {
    pub config: Arc<Config>,
    pub user: Option<SessionUser>,
}

impl Session {
    pub fn anonymous(config: Arc<Config>) -> Self {
        Self { config, user: None }
    }

    /// Session for whatever user the store holds
    pub fn restore(config: Arc<Config>) -> Result<Self> {
        let user = SessionStore::new(&config).load()?;
        Ok(Self { config, user })
    }

    /// Persist `user` and return the new session
    pub fn login(&self, user: SessionUser) -> Result<Self> {
        SessionStore::new(&self.config).save(&user)?;
        Ok(Self {
            config: Arc::clone(&self.config),
            user: Some(user),
        })
    }

    pub fn logout(&self) -> Result<Self> {
        SessionStore::new(&self.config).clear()?;
        Ok(Self::anonymous(Arc::clone(&self.config)))
    }

    pub fn require_user(&self) -> Result<&SessionUser> {
        self.user.as_ref().ok_or(Error::NotLoggedIn)
    }

    /// Tenant id: configuration first, then the user's own org
    pub fn org_id(&self) -> Option<i64> {
        self.config
            .org_id
            .or_else(|| self.user.as_ref().and_then(|u| u.org_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn user(role: &str) -> SessionUser {
        SessionUser {
            id: 42,
            org_id: Some(3),
            full_name: Some("Jane Wambui".to_string()),
            first_name: Some("Jane".to_string()),
            phone: Some("+254700000002".to_string()),
            role: Role::from(role.to_string()),
        }
    }

    #[test]
    fn test_roles() {
        assert!(user("admin").is_admin());
        assert!(user("treasurer").is_admin());
        assert!(user("shop_admin").is_admin());
        assert!(!user("member").is_admin());
        assert!(!user("deacon").is_admin());
        assert!(user("treasurer").can_manage_finances());
        assert!(!user("shop_admin").can_manage_finances());
        assert_eq!(Role::from("Deacon".to_string()), Role::Other("Deacon".to_string()));
    }

    #[test]
    fn test_display_name() {
        let mut u = user("member");
        assert_eq!(u.display_name(), "Jane Wambui");
        u.full_name = None;
        assert_eq!(u.display_name(), "Jane");
        u.first_name = None;
        assert_eq!(u.display_name(), "Member");
    }

    #[test]
    fn test_deserialize_login_payload() {
        let u: SessionUser =
            serde_json::from_str(r#"{"id": 9, "orgId": 2, "role": "secretary"}"#).unwrap();
        assert_eq!(u.org_id, Some(2));
        assert_eq!(u.role, Role::Secretary);
        assert!(u.full_name.is_none());

        let u: SessionUser = serde_json::from_str(r#"{"id": 9}"#).unwrap();
        assert_eq!(u.role, Role::Member);
    }

    #[test]
    fn test_store_roundtrip_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::for_test(temp_dir.path());
        let store = SessionStore::new(&config);

        assert!(store.load().unwrap().is_none());
        store.save(&user("admin")).unwrap();
        assert_eq!(store.load().unwrap(), Some(user("admin")));

        assert!(store.clear().unwrap());
        assert!(!store.clear().unwrap());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_logged_out() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::for_test(temp_dir.path());
        fs::create_dir_all(&config.state_dir).unwrap();
        fs::write(&config.session_file, "{not json").unwrap();
        assert!(SessionStore::new(&config).load().unwrap().is_none());
    }

    #[test]
    fn test_session_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::for_test(temp_dir.path());
        config.org_id = None;
        let config = Arc::new(config);

        let anon = Session::anonymous(Arc::clone(&config));
        assert!(matches!(anon.require_user(), Err(Error::NotLoggedIn)));
        assert_eq!(anon.org_id(), None);

        let logged_in = anon.login(user("member")).unwrap();
        assert!(anon.user.is_none());
        assert_eq!(logged_in.org_id(), Some(3));

        let restored = Session::restore(Arc::clone(&config)).unwrap();
        assert_eq!(restored.require_user().unwrap().id, 42);

        let out = restored.logout().unwrap();
        assert!(out.user.is_none());
        assert!(Session::restore(config).unwrap().user.is_none());
    }

    #[test]
    fn test_config_org_wins() {
        let temp_dir = TempDir::new().unwrap();
        let config = Arc::new(Config::for_test(temp_dir.path()));
        let session = Session {
            config,
            user: Some(user("member")),
        };
        assert_eq!(session.org_id(), Some(1));
    }
}
