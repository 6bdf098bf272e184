//! Cluster state persistence
//!
//! The state file next to the cluster file is authoritative. A copy of the
//! converged state is also kept in etcd so a lost state file can be
//! recovered from the cluster itself.

use crate::error::EngineError;
use cluster_types::{ClusterState, FullState};
use datastore_client::EtcdClusterApi;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// etcd key holding the converged `ClusterState`
pub const STATE_KEY: &str = "/rke/cluster-state";

const FILE_MODE: u32 = 0o640;
const DEFAULT_STEM: &str = "cluster";

fn state_error(path: &Path, err: impl std::fmt::Display) -> EngineError {
    EngineError::State(format!("{}: {err}", path.display()))
}

/// Write `contents` to `path` through a temporary file in the same directory
fn write_atomic(path: &Path, contents: &str) -> Result<(), EngineError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(&dir).map_err(|e| state_error(path, e))?;
    file.write_all(contents.as_bytes()).map_err(|e| state_error(path, e))?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(FILE_MODE))
        .map_err(|e| state_error(path, e))?;
    file.persist(path).map_err(|e| state_error(path, e.error))?;
    Ok(())
}

/// Files written next to a cluster file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFiles {
    /// `<stem>.rkestate`
    pub state: PathBuf,
    /// `kube_config_<stem>.yml`
    pub kubeconfig: PathBuf,
}

impl StateFiles {
    /// State and kubeconfig paths of the cluster file `config`
    #[must_use]
    pub fn for_config(config: &Path) -> Self {
        let dir = config.parent().map(Path::to_path_buf).unwrap_or_default();
        let stem = config
            .file_stem()
            .map_or_else(|| DEFAULT_STEM.to_string(), |s| s.to_string_lossy().into_owned());
        Self {
            state: dir.join(format!("{stem}.rkestate")),
            kubeconfig: dir.join(format!("kube_config_{stem}.yml")),
        }
    }

    /// Read the state file; `None` when it does not exist
    ///
    /// # Errors
    ///
    /// Returns `EngineError::State` when the file cannot be read or parsed.
    pub fn read(&self) -> Result<Option<FullState>, EngineError> {
        if !self.state.exists() {
            debug!("[state] No state file at {}", self.state.display());
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.state).map_err(|e| state_error(&self.state, e))?;
        FullState::from_json(&raw)
            .map(Some)
            .map_err(|e| state_error(&self.state, e))
    }

    /// Replace the state file
    ///
    /// # Errors
    ///
    /// Returns `EngineError::State` when the file cannot be written.
    pub fn write(&self, state: &FullState) -> Result<(), EngineError> {
        let json = state.to_json().map_err(|e| state_error(&self.state, e))?;
        write_atomic(&self.state, &json)?;
        debug!("[state] Wrote {}", self.state.display());
        Ok(())
    }

    /// Replace the admin kubeconfig
    ///
    /// # Errors
    ///
    /// Returns `EngineError::State` when the file cannot be written.
    pub fn write_kubeconfig(&self, kubeconfig: &str) -> Result<(), EngineError> {
        write_atomic(&self.kubeconfig, kubeconfig)?;
        info!("[state] Wrote kubeconfig {}", self.kubeconfig.display());
        Ok(())
    }

    /// Delete both files, ignoring those already gone
    ///
    /// # Errors
    ///
    /// Returns `EngineError::State` when an existing file cannot be removed.
    pub fn remove(&self) -> Result<(), EngineError> {
        for path in [&self.state, &self.kubeconfig] {
            match std::fs::remove_file(path) {
                Ok(()) => info!("[state] Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(state_error(path, e)),
            }
        }
        Ok(())
    }
}

/// Converged state stored in etcd, if any
///
/// # Errors
///
/// Returns `EngineError::State` when the stored value does not parse, or
/// `EngineError::Datastore` when the read fails.
pub async fn load_remote(api: &dyn EtcdClusterApi) -> Result<Option<ClusterState>, EngineError> {
    let Some(raw) = api
        .get(STATE_KEY)
        .await
        .map_err(|e| EngineError::datastore("state", e))?
    else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| EngineError::State(format!("{STATE_KEY}: {e}")))
}

/// Store `state` in etcd
///
/// # Errors
///
/// Returns `EngineError::Datastore` when the write fails.
pub async fn save_remote(api: &dyn EtcdClusterApi, state: &ClusterState) -> Result<(), EngineError> {
    let json = serde_json::to_string(state).map_err(|e| EngineError::State(e.to_string()))?;
    api.put(STATE_KEY, &json)
        .await
        .map_err(|e| EngineError::datastore("state", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datastore_client::MockEtcd;

    #[test]
    fn test_names_follow_the_cluster_file() {
        let files = StateFiles::for_config(Path::new("/srv/prod/edge.yml"));
        assert_eq!(files.state, PathBuf::from("/srv/prod/edge.rkestate"));
        assert_eq!(files.kubeconfig, PathBuf::from("/srv/prod/kube_config_edge.yml"));

        let files = StateFiles::for_config(Path::new("cluster.yml"));
        assert_eq!(files.state, PathBuf::from("cluster.rkestate"));
        assert_eq!(files.kubeconfig, PathBuf::from("kube_config_cluster.yml"));
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let files = StateFiles::for_config(&dir.path().join("cluster.yml"));
        assert!(files.read().unwrap().is_none());

        let mut state = FullState::default();
        state.current_state.revision = 7;
        files.write(&state).unwrap();
        files.write_kubeconfig("apiVersion: v1\nkind: Config\n").unwrap();

        assert_eq!(files.read().unwrap().unwrap().current_state.revision, 7);
        let mode = std::fs::metadata(&files.state).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, FILE_MODE);
        let mode = std::fs::metadata(&files.kubeconfig).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, FILE_MODE);

        files.remove().unwrap();
        assert!(!files.state.exists());
        assert!(!files.kubeconfig.exists());
        files.remove().unwrap();
    }

    #[test]
    fn test_malformed_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = StateFiles::for_config(&dir.path().join("cluster.yml"));
        std::fs::write(&files.state, "{not json").unwrap();
        assert!(matches!(files.read(), Err(EngineError::State(_))));
    }

    #[tokio::test]
    async fn test_remote_copy() {
        let etcd = MockEtcd::new();
        assert!(load_remote(&etcd).await.unwrap().is_none());

        let state = ClusterState {
            revision: 4,
            ..Default::default()
        };
        save_remote(&etcd, &state).await.unwrap();
        assert_eq!(load_remote(&etcd).await.unwrap(), Some(state));

        etcd.set_unreachable(true);
        assert!(load_remote(&etcd).await.is_err());
    }
}
