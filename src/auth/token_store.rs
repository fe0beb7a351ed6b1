use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::types::TokenPair;

/// Persists snapshots of the live token pair. The manager owns the live pair.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Returns `None` when nothing has been persisted yet.
    async fn load(&self) -> Result<Option<TokenPair>>;
    async fn save(&self, pair: &TokenPair) -> Result<()>;
}

/// JSON file store: `{access_token, refresh_token, expires_at}`.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<TokenPair>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no token file yet");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let pair: TokenPair = serde_json::from_slice(&raw).map_err(|e| {
            AppError::Parse(format!("token file {}: {e}", self.path.display()))
        })?;
        info!(path = %self.path.display(), expires_at = %pair.expires_at, "Loaded saved tokens");
        Ok(Some(pair))
    }

    async fn save(&self, pair: &TokenPair) -> Result<()> {
        let json = serde_json::to_vec_pretty(pair)?;

        // Write-then-rename so a crash never leaves a truncated file behind.
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), "Saved tokens");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn pair() -> TokenPair {
        TokenPair {
            access_token: "at-1".to_string(),
            refresh_token: "rt-1".to_string(),
            expires_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("tokens.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_returns_same_pair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = FileTokenStore::new(&path);

        store.save(&pair()).await.unwrap();
        let loaded = store.load().await.unwrap().expect("pair persisted");
        assert_eq!(loaded, pair());

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["refresh_token"], "rt-1");
        assert_eq!(raw["expires_at"], "2030-01-01T00:00:00Z");
        assert!(!dir.path().join("tokens.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = FileTokenStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, AppError::Parse(_)), "got {err:?}");
    }
}
