use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::config::UpdaterConfig;
use crate::download::{format_bytes, Downloader};
use crate::error::{Result, UpdateError};
use crate::package;
use crate::patch;
use crate::progress::{ProgressCallback, ProgressRange, ProgressReporter};
use crate::relaunch;
use crate::util;
use crate::verify::Verifier;

pub const BACKUP_SUFFIX: &str = ".backup";
pub const CANDIDATE_SUFFIX: &str = ".new";
const RESTORE_SUFFIX: &str = ".restore";

/// Where an update attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Downloading,
    BackingUp,
    Applying,
    Committing,
    Verifying,
    Completed,
    RolledBack,
    Failed,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateState::Completed | UpdateState::RolledBack | UpdateState::Failed
        )
    }

    /// An attempt is between `Idle` and a terminal state.
    pub fn is_running(self) -> bool {
        !self.is_terminal() && self != UpdateState::Idle
    }
}

/// What the host wants installed.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    /// Location of the diff artifact (`http(s)://` or `file://`).
    pub url: String,
    pub target_version: String,
    /// Version of the running binary. When set, the manifest must match it.
    pub current_version: Option<String>,
}

/// Outcome of an attempt that did not need manual recovery.
#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub success: bool,
    pub state: UpdateState,
    pub detail: String,
    /// The host should terminate so the relauncher can take over.
    pub exit_requested: bool,
    pub relaunch_script: Option<PathBuf>,
}

/// Drives download, backup, patch, commit, verify and hand-off for one
/// executable, rolling back from the backup when any step fails.
///
/// The orchestrator assumes it is the only writer of the executable and its
/// `.backup`/`.new` siblings for the duration of an attempt.
pub struct UpdateOrchestrator {
    exe: PathBuf,
    backup: PathBuf,
    candidate: PathBuf,
    config: UpdaterConfig,
    downloader: Downloader,
    progress: ProgressReporter,
    cancel: CancellationToken,
    state: UpdateState,
}

impl UpdateOrchestrator {
    pub fn new(exe: impl Into<PathBuf>, config: UpdaterConfig) -> Self {
        let exe = exe.into();
        Self {
            backup: util::sibling_with_suffix(&exe, BACKUP_SUFFIX),
            candidate: util::sibling_with_suffix(&exe, CANDIDATE_SUFFIX),
            downloader: Downloader::new(&config),
            progress: ProgressReporter::silent(),
            cancel: CancellationToken::new(),
            state: UpdateState::Idle,
            exe,
            config,
        }
    }

    /// Orchestrator for the running executable, symlinks resolved.
    pub fn for_current_exe(config: UpdaterConfig) -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| UpdateError::io("<current exe>", e))?;
        let exe = exe.canonicalize().map_err(|e| UpdateError::io(&exe, e))?;
        Ok(Self::new(exe, config))
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = ProgressReporter::new(callback);
        self
    }

    /// Token that cancels the next or current attempt up to the commit point.
    ///
    /// A cancelled token is replaced once its attempt ends, so fetch a fresh
    /// one before each `run`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn exe_path(&self) -> &Path {
        &self.exe
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub fn candidate_path(&self) -> &Path {
        &self.candidate
    }

    /// Run one full update attempt. Blocking; call it from a worker thread.
    ///
    /// Returns `Ok` with `success == false` for every failure that left the
    /// original executable in place, and `Err` only for
    /// [`UpdateError::RollbackFailed`] or [`UpdateError::AlreadyInProgress`].
    /// The latter only occurs when a previous `run` unwound mid-attempt (for
    /// example a panicking progress callback caught by the host), leaving
    /// the executable and its siblings in an unknown state.
    pub fn run(&mut self, request: &UpdateRequest) -> Result<UpdateReport> {
        if self.state.is_running() {
            return Err(UpdateError::AlreadyInProgress);
        }
        self.state = UpdateState::Idle;
        tracing::info!(
            exe = %self.exe.display(),
            url = %request.url,
            target = %request.target_version,
            "starting update attempt"
        );

        let work_root = self.config.work_root();
        let work = match tempfile::Builder::new()
            .prefix("selfpatch-")
            .tempdir_in(&work_root)
        {
            Ok(dir) => dir,
            Err(e) => {
                self.renew_cancel_token();
                return Ok(self.fail(UpdateError::io(work_root, e)));
            }
        };

        let result = self.attempt(request, work.path());

        if let Err(e) = work.close() {
            tracing::debug!(error = %e, "scratch directory cleanup failed");
        }
        self.renew_cancel_token();
        result
    }

    fn attempt(&mut self, request: &UpdateRequest, work: &Path) -> Result<UpdateReport> {
        self.discard_stale_artifacts();

        // 1. Download the diff artifact. Nothing is mutated yet.
        self.transition(UpdateState::Downloading);
        let artifact = work.join("diff.zip");
        if let Err(e) = self.downloader.download(
            &request.url,
            &artifact,
            &self.progress,
            ProgressRange::DOWNLOAD,
            &self.cancel,
        ) {
            return Ok(self.fail(e));
        }

        // 2. Back up the live executable.
        if let Err(e) = self.check_cancelled() {
            return Ok(self.fail(e));
        }
        self.transition(UpdateState::BackingUp);
        self.progress.report(
            "Backing up",
            ProgressRange::APPLY.scale(0.0),
            self.exe.display().to_string(),
        );
        if let Err(e) = std::fs::copy(&self.exe, &self.backup) {
            let _ = util::remove_file_if_exists(&self.backup);
            return Ok(self.fail(UpdateError::io(&self.exe, e)));
        }

        // 3. Extract, patch, and write the candidate next to the executable.
        self.transition(UpdateState::Applying);
        let expected_hash = match self.apply_phase(request, &artifact, work) {
            Ok(hash) => hash,
            Err(e) => return self.roll_back(e),
        };

        // 4. Commit: the only mutation of the live path.
        self.transition(UpdateState::Committing);
        self.progress.report(
            "Installing",
            ProgressRange::FINISH.scale(0.25),
            self.exe.display().to_string(),
        );
        if let Err(e) = util::replace_file(&self.candidate, &self.exe) {
            return self.roll_back(e);
        }

        // 5. Verify what is now live.
        self.transition(UpdateState::Verifying);
        self.progress.report(
            "Verifying",
            ProgressRange::FINISH.scale(0.5),
            request.target_version.clone(),
        );
        let verifier = Verifier::new(&request.target_version)
            .with_min_size(self.config.min_binary_size)
            .with_expected_hash(expected_hash);
        if let Err(e) = verifier.check(&self.exe) {
            return self.roll_back(e);
        }

        // 6. Hand off.
        self.transition(UpdateState::Completed);
        Ok(self.complete(request))
    }

    /// Returns the manifest's content hash, if any, for the verify step.
    fn apply_phase(
        &self,
        request: &UpdateRequest,
        artifact: &Path,
        work: &Path,
    ) -> Result<Option<[u8; 32]>> {
        self.check_cancelled()?;
        self.progress
            .report("Extracting", ProgressRange::APPLY.scale(0.1), "unpacking diff artifact");
        let package = package::extract_package(artifact, &work.join("package"))?;
        let manifest = &package.manifest;

        if manifest.target_version != request.target_version {
            return Err(UpdateError::Manifest(format!(
                "manifest targets {} but {} was requested",
                manifest.target_version, request.target_version
            )));
        }
        if let Some(current) = &request.current_version {
            if &manifest.current_version != current {
                return Err(UpdateError::Manifest(format!(
                    "manifest patches {} but {} is installed",
                    manifest.current_version, current
                )));
            }
        }
        let expected_hash = manifest.expected_hash()?;

        self.check_cancelled()?;
        self.progress.report(
            "Applying",
            ProgressRange::APPLY.scale(0.3),
            format!("{} chunks", manifest.chunks.len()),
        );
        // The backup is a byte-identical copy of the live image we fully own.
        let image = {
            let base = util::mmap_file(&self.backup)?;
            patch::apply(&base, manifest, &package.root)?
        };

        self.progress.report(
            "Writing",
            ProgressRange::APPLY.scale(0.8),
            format_bytes(image.len() as u64),
        );
        let mut file =
            File::create(&self.candidate).map_err(|e| UpdateError::io(&self.candidate, e))?;
        file.write_all(&image)
            .and_then(|_| file.sync_all())
            .map_err(|e| UpdateError::io(&self.candidate, e))?;
        drop(file);
        util::copy_permissions(&self.backup, &self.candidate)?;

        self.check_cancelled()?;
        self.progress
            .report("Applying", ProgressRange::APPLY.scale(1.0), "candidate ready");
        Ok(expected_hash)
    }

    fn complete(&self, request: &UpdateRequest) -> UpdateReport {
        let mut detail = format!("updated to {}", request.target_version);
        let mut relaunch_script = None;

        if self.config.relaunch {
            match relaunch::launch(
                &self.exe,
                &self.backup,
                self.config.relaunch_grace,
                &self.config.work_root(),
            ) {
                Ok(r) => relaunch_script = Some(r.script),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "could not start relauncher; start the new binary manually"
                    );
                    detail.push_str("; restart manually");
                    self.discard_backup();
                }
            }
        } else {
            self.discard_backup();
        }

        self.progress.report("Completed", 1.0, detail.clone());
        tracing::info!(
            exe = %self.exe.display(),
            version = %request.target_version,
            "update complete"
        );
        UpdateReport {
            success: true,
            state: UpdateState::Completed,
            detail,
            exit_requested: relaunch_script.is_some(),
            relaunch_script,
        }
    }

    /// Non-recoverable-by-rollback failure before anything was mutated.
    fn fail(&mut self, cause: UpdateError) -> UpdateReport {
        self.transition(UpdateState::Failed);
        tracing::error!(error = %cause, "update failed");
        let detail = cause.to_string();
        self.progress.report("Update failed", 1.0, detail.clone());
        UpdateReport {
            success: false,
            state: UpdateState::Failed,
            detail,
            exit_requested: false,
            relaunch_script: None,
        }
    }

    /// Restore the original executable from the backup after `cause`.
    fn roll_back(&mut self, cause: UpdateError) -> Result<UpdateReport> {
        tracing::warn!(error = %cause, state = ?self.state, "rolling back");
        let _ = util::remove_file_if_exists(&self.candidate);

        if let Err(e) = self.restore_from_backup() {
            self.transition(UpdateState::Failed);
            tracing::error!(
                exe = %self.exe.display(),
                backup = %self.backup.display(),
                error = %e,
                "rollback failed; manual recovery required"
            );
            return Err(UpdateError::RollbackFailed {
                exe: self.exe.clone(),
                backup: self.backup.clone(),
                reason: e.to_string(),
                cause: cause.to_string(),
            });
        }

        self.discard_backup();
        self.transition(UpdateState::RolledBack);
        let detail = format!("{cause}; original restored");
        self.progress.report("Rolled back", 1.0, detail.clone());
        Ok(UpdateReport {
            success: false,
            state: UpdateState::RolledBack,
            detail,
            exit_requested: false,
            relaunch_script: None,
        })
    }

    /// Copy the backup to a sibling and rename it over the live path, so the
    /// live path never holds a half-written file. Skipped when the live file
    /// already matches the backup.
    fn restore_from_backup(&self) -> Result<()> {
        let backup_hash = util::hash_file_streaming(&self.backup)?;
        if self.exe.exists() && util::hash_file_streaming(&self.exe)? == backup_hash {
            tracing::debug!("live executable untouched; nothing to restore");
            return Ok(());
        }

        let staging = util::sibling_with_suffix(&self.exe, RESTORE_SUFFIX);
        std::fs::copy(&self.backup, &staging).map_err(|e| UpdateError::io(&staging, e))?;
        if let Err(e) = util::replace_file(&staging, &self.exe) {
            let _ = util::remove_file_if_exists(&staging);
            return Err(e);
        }
        tracing::info!(exe = %self.exe.display(), "original executable restored");
        Ok(())
    }

    fn discard_backup(&self) {
        if let Err(e) = util::remove_file_if_exists(&self.backup) {
            tracing::warn!(backup = %self.backup.display(), error = %e, "could not delete backup");
        }
    }

    /// Leftovers from an attempt that was killed. A `.backup` or `.restore`
    /// is only stale while the live executable still exists.
    fn discard_stale_artifacts(&self) {
        if self.candidate.exists() {
            tracing::warn!(path = %self.candidate.display(), "removing stale candidate");
            let _ = util::remove_file_if_exists(&self.candidate);
        }
        if !self.exe.exists() {
            return;
        }
        let staging = util::sibling_with_suffix(&self.exe, RESTORE_SUFFIX);
        if staging.exists() {
            tracing::warn!(path = %staging.display(), "removing stale restore copy");
            let _ = util::remove_file_if_exists(&staging);
        }
        if self.backup.exists() {
            tracing::warn!(path = %self.backup.display(), "removing stale backup");
            self.discard_backup();
        }
    }

    /// Tokens cannot be reset, so a cancelled one is swapped for the next run.
    fn renew_cancel_token(&mut self) {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(UpdateError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, next: UpdateState) {
        tracing::info!(from = ?self.state, to = ?next, "update state");
        self.state = next;
    }
}

impl std::fmt::Debug for UpdateOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateOrchestrator")
            .field("exe", &self.exe)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{DiffChunk, DiffManifest};
    use crate::progress::Progress;
    use std::sync::{Arc, Mutex};

    const MIB: usize = 1024 * 1024;

    struct Fixture {
        dir: tempfile::TempDir,
        exe: PathBuf,
        original: Vec<u8>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("app");
        let mut original = vec![0x90u8; 2 * MIB];
        original[..8].copy_from_slice(b"APP v130");
        std::fs::write(&exe, &original).unwrap();
        Fixture { dir, exe, original }
    }

    fn config(dir: &Path) -> UpdaterConfig {
        let work = dir.join("work");
        std::fs::create_dir_all(&work).unwrap();
        UpdaterConfig {
            relaunch: false,
            work_dir: Some(work),
            ..UpdaterConfig::default()
        }
    }

    fn write_artifact(dir: &Path, manifest: &str, assets: &[(&str, &[u8])]) -> String {
        let path = dir.join("diff.zip");
        let file = File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("manifest.json", options).unwrap();
        zip.write_all(manifest.as_bytes()).unwrap();
        for (name, data) in assets {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
        format!("file://{}", path.display())
    }

    fn manifest_json(chunks: Vec<DiffChunk>, hash: Option<String>) -> String {
        serde_json::to_string(&DiffManifest {
            current_version: "1.3.0".into(),
            target_version: "1.4.0".into(),
            target_blake3: hash,
            chunks,
        })
        .unwrap()
    }

    fn request(url: String) -> UpdateRequest {
        UpdateRequest {
            url,
            target_version: "1.4.0".into(),
            current_version: Some("1.3.0".into()),
        }
    }

    fn assert_clean(f: &Fixture) {
        assert!(!util::sibling_with_suffix(&f.exe, BACKUP_SUFFIX).exists());
        assert!(!util::sibling_with_suffix(&f.exe, CANDIDATE_SUFFIX).exists());
        assert!(!util::sibling_with_suffix(&f.exe, RESTORE_SUFFIX).exists());
    }

    #[test]
    fn test_successful_update() {
        let f = fixture();
        let url = write_artifact(
            f.dir.path(),
            &manifest_json(
                vec![DiffChunk::copy(0, f.original.len() as u64), DiffChunk::insert("tail.bin")],
                None,
            ),
            &[("tail.bin", b"APP v140")],
        );

        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        let report = orch.run(&request(url)).unwrap();

        assert!(report.success, "{}", report.detail);
        assert_eq!(report.state, UpdateState::Completed);
        assert_eq!(orch.state(), UpdateState::Completed);
        assert!(!report.exit_requested);

        let mut expected = f.original.clone();
        expected.extend_from_slice(b"APP v140");
        assert_eq!(std::fs::read(&f.exe).unwrap(), expected);
        assert_clean(&f);
    }

    #[test]
    fn test_update_with_matching_hash() {
        let f = fixture();
        let mut expected = f.original.clone();
        expected.extend_from_slice(b"v140");
        let hash = blake3::hash(&expected).to_hex().to_string();
        let url = write_artifact(
            f.dir.path(),
            &manifest_json(
                vec![DiffChunk::copy(0, f.original.len() as u64), DiffChunk::replace("v.bin")],
                Some(hash),
            ),
            &[("v.bin", b"v140")],
        );

        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        let report = orch.run(&request(url)).unwrap();
        assert!(report.success, "{}", report.detail);
        assert_eq!(std::fs::read(&f.exe).unwrap(), expected);
    }

    #[test]
    fn test_corrupt_manifest_rolls_back() {
        let f = fixture();
        let url = write_artifact(f.dir.path(), "{ this is not json", &[]);

        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        let report = orch.run(&request(url)).unwrap();

        assert!(!report.success);
        assert_eq!(report.state, UpdateState::RolledBack);
        assert!(report.detail.contains("manifest"), "{}", report.detail);
        assert_eq!(std::fs::read(&f.exe).unwrap(), f.original);
        assert_clean(&f);
    }

    #[test]
    fn test_out_of_range_copy_rolls_back() {
        let f = fixture();
        let url = write_artifact(
            f.dir.path(),
            &manifest_json(vec![DiffChunk::copy(0, f.original.len() as u64 + 1)], None),
            &[],
        );

        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        let report = orch.run(&request(url)).unwrap();
        assert_eq!(report.state, UpdateState::RolledBack);
        assert_eq!(std::fs::read(&f.exe).unwrap(), f.original);
        assert_clean(&f);
    }

    #[test]
    fn test_verification_failure_restores_original() {
        let f = fixture();
        // Output is big enough but carries no "140" marker.
        let url = write_artifact(
            f.dir.path(),
            &manifest_json(
                vec![DiffChunk::copy(8, f.original.len() as u64 - 8), DiffChunk::insert("x.bin")],
                None,
            ),
            &[("x.bin", b"nothing here")],
        );

        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        let report = orch.run(&request(url)).unwrap();

        assert_eq!(report.state, UpdateState::RolledBack);
        assert!(report.detail.contains("verification failed"), "{}", report.detail);
        assert_eq!(std::fs::read(&f.exe).unwrap(), f.original);
        assert_clean(&f);
    }

    #[test]
    fn test_hash_mismatch_restores_original() {
        let f = fixture();
        let url = write_artifact(
            f.dir.path(),
            &manifest_json(
                vec![DiffChunk::copy(0, f.original.len() as u64), DiffChunk::insert("t.bin")],
                Some(blake3::hash(b"something else").to_hex().to_string()),
            ),
            &[("t.bin", b"140")],
        );

        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        let report = orch.run(&request(url)).unwrap();
        assert_eq!(report.state, UpdateState::RolledBack);
        assert_eq!(std::fs::read(&f.exe).unwrap(), f.original);
    }

    #[test]
    fn test_version_mismatch_rolls_back() {
        let f = fixture();
        let url = write_artifact(
            f.dir.path(),
            &manifest_json(vec![DiffChunk::copy(0, 16)], None),
            &[],
        );
        let mut req = request(url);
        req.current_version = Some("1.2.9".into());

        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        let report = orch.run(&req).unwrap();
        assert_eq!(report.state, UpdateState::RolledBack);
        assert!(report.detail.contains("1.2.9"));
    }

    #[test]
    fn test_download_failure_leaves_nothing_behind() {
        let f = fixture();
        let url = format!("file://{}", f.dir.path().join("missing.zip").display());

        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        let report = orch.run(&request(url)).unwrap();
        assert_eq!(report.state, UpdateState::Failed);
        assert_eq!(std::fs::read(&f.exe).unwrap(), f.original);
        assert_clean(&f);
    }

    #[test]
    fn test_missing_executable_fails_at_backup() {
        let f = fixture();
        let url = write_artifact(
            f.dir.path(),
            &manifest_json(vec![DiffChunk::copy(0, 1)], None),
            &[],
        );
        let missing = f.dir.path().join("no-such-app");
        let mut orch = UpdateOrchestrator::new(missing, config(f.dir.path()));
        let report = orch.run(&request(url)).unwrap();
        assert_eq!(report.state, UpdateState::Failed);
    }

    #[test]
    fn test_cancelled_attempt_does_not_mutate() {
        let f = fixture();
        let url = write_artifact(
            f.dir.path(),
            &manifest_json(vec![DiffChunk::copy(0, 1)], None),
            &[],
        );
        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        orch.cancel_token().cancel();
        let report = orch.run(&request(url)).unwrap();
        assert_eq!(report.state, UpdateState::Failed);
        assert!(report.detail.contains("cancelled"));
        assert_eq!(std::fs::read(&f.exe).unwrap(), f.original);
        assert_clean(&f);
    }

    #[test]
    fn test_runs_again_after_cancellation() {
        let f = fixture();
        let mut image = f.original.clone();
        image.extend_from_slice(b"v140");
        let url = write_artifact(
            f.dir.path(),
            &manifest_json(
                vec![
                    DiffChunk::copy(0, f.original.len() as u64),
                    DiffChunk::insert("tail.bin"),
                ],
                None,
            ),
            &[("tail.bin", b"v140")],
        );
        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        let stale_token = orch.cancel_token();
        stale_token.cancel();

        let first = orch.run(&request(url.clone())).unwrap();
        assert_eq!(first.state, UpdateState::Failed);
        assert!(first.detail.contains("cancelled"));
        assert!(!orch.cancel_token().is_cancelled());

        let second = orch.run(&request(url)).unwrap();
        assert!(second.success, "{}", second.detail);
        assert_eq!(second.state, UpdateState::Completed);
        assert_eq!(std::fs::read(&f.exe).unwrap(), image);
        assert_clean(&f);
    }

    #[test]
    fn test_guard_after_unwound_attempt() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let f = fixture();
        let url = write_artifact(
            f.dir.path(),
            &manifest_json(vec![DiffChunk::copy(0, 1)], None),
            &[],
        );
        let armed = Arc::new(AtomicBool::new(true));
        let trigger = armed.clone();
        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path())).with_progress(
            Box::new(move |p: &Progress| {
                if p.status == "Backing up" && trigger.swap(false, Ordering::SeqCst) {
                    panic!("host callback failed");
                }
            }),
        );

        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            orch.run(&request(url.clone()))
        }));
        assert!(unwound.is_err());
        assert_eq!(orch.state(), UpdateState::BackingUp);
        assert!(matches!(
            orch.run(&request(url)),
            Err(UpdateError::AlreadyInProgress)
        ));
        assert_eq!(std::fs::read(&f.exe).unwrap(), f.original);
    }

    #[test]
    fn test_guard_rejects_overlapping_attempt() {
        let f = fixture();
        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        orch.state = UpdateState::Applying;
        assert!(matches!(
            orch.run(&request("file:///nowhere".into())),
            Err(UpdateError::AlreadyInProgress)
        ));

        // A separate instance has its own guard.
        let mut other = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        assert!(other.run(&request("file:///nowhere".into())).is_ok());
    }

    #[test]
    fn test_rollback_failure_is_fatal() {
        let f = fixture();
        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        // Simulate a committed-but-bad image with the backup gone.
        std::fs::write(&f.exe, b"broken").unwrap();
        orch.state = UpdateState::Verifying;

        let err = orch
            .roll_back(UpdateError::VerificationFailed("marker missing".into()))
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(orch.state(), UpdateState::Failed);
    }

    #[test]
    fn test_stale_backup_is_discarded() {
        let f = fixture();
        let stale = util::sibling_with_suffix(&f.exe, BACKUP_SUFFIX);
        std::fs::write(&stale, b"from a killed attempt").unwrap();
        let url = format!("file://{}", f.dir.path().join("missing.zip").display());

        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        orch.run(&request(url)).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn test_stale_restore_copy_is_discarded() {
        let f = fixture();
        let staging = util::sibling_with_suffix(&f.exe, RESTORE_SUFFIX);
        std::fs::write(&staging, &f.original).unwrap();
        let url = format!("file://{}", f.dir.path().join("missing.zip").display());

        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path()));
        orch.run(&request(url)).unwrap();
        assert!(!staging.exists());
        assert_eq!(std::fs::read(&f.exe).unwrap(), f.original);
    }

    #[test]
    fn test_progress_is_monotonic_and_finishes() {
        let f = fixture();
        let url = write_artifact(
            f.dir.path(),
            &manifest_json(
                vec![DiffChunk::copy(0, f.original.len() as u64), DiffChunk::insert("t.bin")],
                None,
            ),
            &[("t.bin", b"140")],
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut orch = UpdateOrchestrator::new(&f.exe, config(f.dir.path())).with_progress(
            Box::new(move |p: &Progress| {
                sink.lock().unwrap().push((p.status.clone(), p.fraction));
            }),
        );
        assert!(orch.run(&request(url)).unwrap().success);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0].1 <= w[1].1), "{seen:?}");
        assert_eq!(seen.last().unwrap().0, "Completed");
        assert!((seen.last().unwrap().1 - 1.0).abs() < 1e-9);
    }
}
