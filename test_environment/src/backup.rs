//! Crash-recovery manifests.
//!
//! While a session runs, every container and network it creates is written to
//! a backup manifest on disk. A run that dies without tearing down leaves its
//! manifest behind, and a later run reclaims the listed resources with
//! [`sweep_orphans`].
//!
//! Manifests are rewritten in full after every change. The new contents go to
//! a hidden temporary file first and are renamed over the manifest, so a crash
//! mid-write never leaves a truncated manifest.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use container_runtime_interface::{ContainerId, ContainerKind, ContainerRuntime, ImageId, NetworkId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ErrorList, Result, TestEnvError};
use crate::session::{SessionContext, BACKUP_FILE_PREFIX};

/// On-disk record of the resources one session created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Dependency containers. Their images are shared and never removed.
    #[serde(rename = "BasicContainers", default)]
    pub basic_containers: BTreeMap<ContainerId, ImageId>,
    /// Containers under test, with the image pulled for each (may be empty).
    #[serde(rename = "AppContainers", default)]
    pub app_containers: BTreeMap<ContainerId, ImageId>,
    #[serde(rename = "NetworkId", default)]
    pub network_id: NetworkId,
}

impl Manifest {
    /// Returns `true` if the container was not yet recorded.
    pub fn record_container(&mut self, kind: ContainerKind, container_id: &str, image_id: &str) -> bool {
        let entries = match kind {
            ContainerKind::Basic => &mut self.basic_containers,
            ContainerKind::App => &mut self.app_containers,
        };
        if entries.contains_key(container_id) {
            return false;
        }
        entries.insert(container_id.to_string(), image_id.to_string());
        true
    }

    pub fn is_empty(&self) -> bool {
        self.basic_containers.is_empty() && self.app_containers.is_empty() && self.network_id.is_empty()
    }

    pub fn container_count(&self) -> usize {
        self.basic_containers.len() + self.app_containers.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Keeps the current session's manifest in sync with what it has created.
#[derive(Debug)]
pub struct BackupManager {
    path: PathBuf,
    manifest: Manifest,
}

impl BackupManager {
    pub fn new(dir: impl AsRef<Path>, session: &SessionContext) -> Self {
        Self {
            path: dir.as_ref().join(session.backup_file_name()),
            manifest: Manifest::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Record a created container and rewrite the manifest.
    pub async fn record_container(
        &mut self,
        kind: ContainerKind,
        container_id: &str,
        image_id: &str,
    ) -> Result<()> {
        if self.manifest.record_container(kind, container_id, image_id) {
            debug!("Backup: Recorded {} container {}", kind, container_id);
        }
        self.write().await
    }

    pub async fn record_network(&mut self, network_id: &str) -> Result<()> {
        self.manifest.network_id = network_id.to_string();
        self.write().await
    }

    /// Delete the manifest after the session tore everything down.
    pub async fn remove_file(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Backup: Removed {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TestEnvError::manifest(self.path.display(), e.to_string())),
        }
    }

    async fn write(&self) -> Result<()> {
        write_manifest(&self.path, &self.manifest).await
    }
}

async fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    let bytes = manifest.encode()?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    // The leading dot keeps the temporary file out of the sweep's prefix match.
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

    tokio::fs::write(&temp_path, &bytes)
        .await
        .map_err(|e| TestEnvError::manifest(temp_path.display(), e.to_string()))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| TestEnvError::manifest(path.display(), e.to_string()))
}

async fn read_manifest(path: &Path) -> Result<Manifest> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| TestEnvError::manifest(path.display(), e.to_string()))?;
    Manifest::decode(&bytes).map_err(|e| TestEnvError::manifest(path.display(), e.to_string()))
}

// ==================== Sweep ====================

/// What [`sweep_orphans`] reclaimed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Manifests fully reclaimed and deleted.
    pub files_swept: usize,
    /// Manifests rewritten because some resources could not be removed.
    pub files_retained: usize,
    pub containers_removed: usize,
    pub images_removed: usize,
    pub networks_removed: usize,
}

/// Manifest files in `dir`, sorted by name.
pub async fn list_manifests(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(BACKUP_FILE_PREFIX) {
            continue;
        }
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Remove every resource listed in leftover manifests under `dir`.
///
/// App containers are removed together with their recorded image, basic
/// containers alone, and the network last. Resources the engine no longer
/// knows about count as removed. A manifest is deleted once everything in it
/// is gone; otherwise it is rewritten with only the entries that failed, so a
/// later sweep can retry them. The manifest of `active` is left alone.
///
/// Failures never stop the sweep; they are collected and returned together.
pub async fn sweep_orphans(
    runtime: &dyn ContainerRuntime,
    dir: &Path,
    active: Option<&SessionContext>,
) -> Result<SweepReport> {
    let active_file = active.map(SessionContext::backup_file_name);
    let mut report = SweepReport::default();
    let mut errors = ErrorList::new();

    for path in list_manifests(dir).await? {
        let is_active = active_file
            .as_deref()
            .map_or(false, |active| path.file_name() == Some(OsStr::new(active)));
        if is_active {
            debug!("Sweep: Skipping active session manifest {}", path.display());
            continue;
        }

        let manifest = match read_manifest(&path).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Sweep: Leaving unreadable manifest in place: {}", e);
                errors.push(e);
                continue;
            }
        };
        info!(
            "Sweep: Reclaiming {} container(s) from {}",
            manifest.container_count(),
            path.display()
        );

        let remaining = sweep_manifest(runtime, &manifest, &mut report, &mut errors).await;
        if remaining.is_empty() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.files_swept += 1,
                Err(e) => errors.push(TestEnvError::manifest(path.display(), e.to_string())),
            }
        } else {
            match write_manifest(&path, &remaining).await {
                Ok(()) => report.files_retained += 1,
                Err(e) => errors.push(e),
            }
        }
    }

    errors.into_result()?;
    Ok(report)
}

/// Remove the resources of one manifest. Returns the entries that survived.
async fn sweep_manifest(
    runtime: &dyn ContainerRuntime,
    manifest: &Manifest,
    report: &mut SweepReport,
    errors: &mut ErrorList,
) -> Manifest {
    let mut remaining = Manifest::default();

    for (container_id, image_id) in &manifest.app_containers {
        match remove_container(runtime, container_id).await {
            Ok(()) => report.containers_removed += 1,
            Err(e) => {
                errors.push(e);
                remaining.app_containers.insert(container_id.clone(), image_id.clone());
                continue;
            }
        }
        if image_id.is_empty() {
            continue;
        }
        match runtime.force_remove_image(image_id).await {
            Ok(()) => report.images_removed += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                errors.push(TestEnvError::runtime(format!("remove image {}", image_id), e));
                // The container is gone; a retry will see NotFound and move on to the image.
                remaining.app_containers.insert(container_id.clone(), image_id.clone());
            }
        }
    }

    for (container_id, image_id) in &manifest.basic_containers {
        match remove_container(runtime, container_id).await {
            Ok(()) => report.containers_removed += 1,
            Err(e) => {
                errors.push(e);
                remaining.basic_containers.insert(container_id.clone(), image_id.clone());
            }
        }
    }

    if !manifest.network_id.is_empty() {
        match runtime.remove_network(&manifest.network_id).await {
            Ok(()) => report.networks_removed += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                errors.push(TestEnvError::runtime(
                    format!("remove network {}", manifest.network_id),
                    e,
                ));
                remaining.network_id = manifest.network_id.clone();
            }
        }
    }

    remaining
}

async fn remove_container(runtime: &dyn ContainerRuntime, container_id: &str) -> Result<()> {
    match runtime.force_remove_container(container_id).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!("Sweep: Container {} was already gone", container_id);
            Ok(())
        }
        Err(e) => Err(TestEnvError::runtime(format!("remove container {}", container_id), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use container_runtime::mock::{ops, MockRuntime};

    fn session(token: &str) -> SessionContext {
        SessionContext::with_token("svc", token)
    }

    #[test]
    fn test_manifest_json_layout() {
        let mut manifest = Manifest::default();
        manifest.record_container(ContainerKind::Basic, "c-1", "");
        manifest.record_container(ContainerKind::App, "c-2", "registry/app:1");
        manifest.network_id = "n-1".to_string();

        let value: serde_json::Value = serde_json::from_slice(&manifest.encode().unwrap()).unwrap();
        assert_eq!(value["BasicContainers"]["c-1"], "");
        assert_eq!(value["AppContainers"]["c-2"], "registry/app:1");
        assert_eq!(value["NetworkId"], "n-1");
    }

    #[test]
    fn test_manifest_round_trip() {
        let mut manifest = Manifest::default();
        manifest.record_container(ContainerKind::Basic, "c-1", "postgres:alpine");
        manifest.record_container(ContainerKind::Basic, "c-2", "");
        manifest.record_container(ContainerKind::App, "c-3", "registry/app:1");
        assert!(manifest.network_id.is_empty());

        let decoded = Manifest::decode(&manifest.encode().unwrap()).unwrap();
        assert_eq!(decoded, manifest);

        manifest.network_id = "n-1".to_string();
        let decoded = Manifest::decode(&manifest.encode().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn test_record_container_is_idempotent() {
        let mut manifest = Manifest::default();
        assert!(manifest.record_container(ContainerKind::App, "c-1", "img"));
        assert!(!manifest.record_container(ContainerKind::App, "c-1", "other"));
        assert_eq!(manifest.app_containers["c-1"], "img");
    }

    #[test]
    fn test_decode_tolerates_missing_sections() {
        let manifest = Manifest::decode(br#"{"NetworkId":"n-9"}"#).unwrap();
        assert!(manifest.basic_containers.is_empty());
        assert_eq!(manifest.network_id, "n-9");
    }

    #[tokio::test]
    async fn test_manager_rewrites_file_on_each_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut backup = BackupManager::new(dir.path(), &session("1"));

        backup.record_network("n-1").await.unwrap();
        backup.record_container(ContainerKind::Basic, "c-1", "").await.unwrap();

        let on_disk = read_manifest(backup.path()).await.unwrap();
        assert_eq!(&on_disk, backup.manifest());
        assert_eq!(on_disk.basic_containers.len(), 1);

        // No temporary file is left next to the manifest.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["testenv-docker-session_1".to_string()]);

        backup.remove_file().await.unwrap();
        backup.remove_file().await.unwrap();
        assert!(!backup.path().exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_containers_then_network() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        runtime.insert_network("n-1", "net");
        runtime.insert_container("c-1", "postgres");
        runtime.insert_container("c-2", "app:1");
        runtime.insert_image("app:1");

        let mut backup = BackupManager::new(dir.path(), &session("1"));
        backup.record_network("n-1").await.unwrap();
        backup.record_container(ContainerKind::Basic, "c-1", "").await.unwrap();
        backup.record_container(ContainerKind::App, "c-2", "app:1").await.unwrap();

        let report = sweep_orphans(&runtime, dir.path(), None).await.unwrap();
        assert_eq!(report.files_swept, 1);
        assert_eq!(report.containers_removed, 2);
        assert_eq!(report.images_removed, 1);
        assert_eq!(report.networks_removed, 1);
        assert_eq!(
            runtime.calls(),
            vec![
                "remove_container:c-2".to_string(),
                "remove_image:app:1".to_string(),
                "remove_container:c-1".to_string(),
                "remove_network:n-1".to_string(),
            ]
        );
        assert!(!backup.path().exists());
    }

    #[tokio::test]
    async fn test_sweep_skips_active_session() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        let active = session("active");
        let mut backup = BackupManager::new(dir.path(), &active);
        backup.record_network("n-1").await.unwrap();

        let report = sweep_orphans(&runtime, dir.path(), Some(&active)).await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(runtime.calls().is_empty());
        assert!(backup.path().exists());
    }

    #[tokio::test]
    async fn test_sweep_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep").unwrap();
        std::fs::write(dir.path().join(".testenv-docker-session_1.tmp"), "{").unwrap();

        let report = sweep_orphans(&MockRuntime::new(), dir.path(), None).await.unwrap();
        assert_eq!(report.files_swept, 0);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_unreadable_manifest_is_reported_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testenv-docker-session_broken");
        std::fs::write(&path, "not json").unwrap();

        let err = sweep_orphans(&MockRuntime::new(), dir.path(), None).await.unwrap_err();
        assert!(err.to_string().contains("testenv-docker-session_broken"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_failed_image_removal_keeps_entry() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        runtime.insert_container("c-1", "app:1");
        runtime.insert_image("app:1");
        runtime.fail_on(ops::REMOVE_IMAGE, "app:1");

        let mut backup = BackupManager::new(dir.path(), &session("1"));
        backup.record_container(ContainerKind::App, "c-1", "app:1").await.unwrap();

        assert!(sweep_orphans(&runtime, dir.path(), None).await.is_err());
        let kept = read_manifest(backup.path()).await.unwrap();
        assert_eq!(kept.app_containers["c-1"], "app:1");

        runtime.clear_failures();
        let report = sweep_orphans(&runtime, dir.path(), None).await.unwrap();
        assert_eq!(report.images_removed, 1);
        assert_eq!(report.files_swept, 1);
    }
}
