//! Mount point lifecycle
//!
//! `MountLifecycle` owns the target mount point (usually `/mnt`) for exactly
//! one installation attempt and guarantees it is unmounted on every exit
//! path: explicit `release`, `Drop`, or a forced cleanup from the signal
//! handler.
//!
//! # State Flow
//!
//! ```text
//! Unmounted -> Mounting -> Mounted -> Unmounting -> Unmounted
//!                 |                       |
//!                 +--(mount failed)-------+--> Unmounted / Mounted (unmount failed)
//! ```
//!
//! Only one live `MountLifecycle` may claim a given target path per process.

use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, info, warn};

use crate::command::{CommandSpec, run_command, run_checked};
use crate::error::ResourceError;

/// Current state of the mount point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unmounted => "unmounted",
            Self::Mounting => "mounting",
            Self::Mounted => "mounted",
            Self::Unmounting => "unmounting",
        };
        f.write_str(s)
    }
}

/// What to mount: a root device plus devices nested below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountLayout {
    pub root: PathBuf,
    /// `(device, path relative to the mount point)`, mounted in order
    pub nested: Vec<(PathBuf, PathBuf)>,
}

impl MountLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            nested: Vec::new(),
        }
    }

    pub fn with_nested(mut self, device: impl Into<PathBuf>, at: impl Into<PathBuf>) -> Self {
        self.nested.push((device.into(), at.into()));
        self
    }
}

/// Performs the actual mount/unmount syscalls or commands.
pub trait MountBackend: Send + Sync {
    /// Mount `layout` under `target`. On error nothing may stay mounted.
    fn mount(&self, layout: &MountLayout, target: &Path) -> Result<()>;

    /// Recursively unmount `target`. Unmounting something that is not
    /// mounted must succeed.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// `mount(8)` / `umount(8)` backed implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMount;

impl MountBackend for SystemMount {
    fn mount(&self, layout: &MountLayout, target: &Path) -> Result<()> {
        run_checked(&CommandSpec::new("mkdir").arg("-p").arg(target))?;
        run_checked(&CommandSpec::new("mount").arg(&layout.root).arg(target))?;

        for (device, at) in &layout.nested {
            let dir = target.join(at);
            let mounted = run_checked(&CommandSpec::new("mkdir").arg("-p").arg(&dir))
                .and_then(|_| run_checked(&CommandSpec::new("mount").arg(device).arg(&dir)));
            if let Err(e) = mounted {
                // Roll back the partial tree before reporting
                if let Err(undo) = self.unmount(target) {
                    warn!("Rollback unmount of {} failed: {:#}", target.display(), undo);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let output = run_command(&CommandSpec::new("umount").arg("-R").arg(target))?;
        if output.success || output.stderr.to_lowercase().contains("not mounted") {
            return Ok(());
        }
        output.ensure_success(&format!("umount -R {}", target.display()))
    }
}

/// Proof of a live mount, returned by [`MountLifecycle::acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    id: u64,
    target: PathBuf,
    device: PathBuf,
}

impl MountHandle {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn device(&self) -> &Path {
        &self.device
    }
}

struct Claim {
    mounted: bool,
    backend: Arc<dyn MountBackend>,
}

/// Process-wide map of claimed mount points
static CLAIMS: OnceLock<Mutex<HashMap<PathBuf, Claim>>> = OnceLock::new();

/// Lock the claim map.
///
/// Every mutation is a single insert, remove or flag update, so a map left
/// behind by a panicking holder is still consistent and is used as is.
fn lock_claims() -> MutexGuard<'static, HashMap<PathBuf, Claim>> {
    CLAIMS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn set_claim_mounted(target: &Path, mounted: bool) {
    if let Some(claim) = lock_claims().get_mut(target) {
        claim.mounted = mounted;
    }
}

/// Unmount every claimed mount point that is currently mounted.
///
/// Called from the signal handler right before the process exits.
pub fn force_unmount_claimed() {
    let map = lock_claims();
    for (target, claim) in map.iter().filter(|(_, c)| c.mounted) {
        match claim.backend.unmount(target) {
            Ok(()) => info!("Force-unmounted {}", target.display()),
            Err(e) => warn!("Force unmount of {} failed: {:#}", target.display(), e),
        }
    }
}

/// Owner of one mount point for one installation attempt.
pub struct MountLifecycle {
    target: PathBuf,
    state: MountState,
    backend: Arc<dyn MountBackend>,
    current: Option<MountHandle>,
    next_id: u64,
}

impl fmt::Debug for MountLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountLifecycle")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("current", &self.current)
            .finish()
    }
}

impl MountLifecycle {
    /// Claim `target` for this process.
    ///
    /// # Errors
    ///
    /// `MountPointInUse` if another live instance already claims it.
    pub fn new(
        target: impl Into<PathBuf>,
        backend: Arc<dyn MountBackend>,
    ) -> Result<Self, ResourceError> {
        let target = target.into();
        let mut map = lock_claims();
        if map.contains_key(&target) {
            return Err(ResourceError::MountPointInUse(target));
        }
        map.insert(
            target.clone(),
            Claim {
                mounted: false,
                backend: Arc::clone(&backend),
            },
        );
        debug!("Claimed mount point {}", target.display());

        Ok(Self {
            target,
            state: MountState::Unmounted,
            backend,
            current: None,
            next_id: 1,
        })
    }

    /// Claim `target` with the `mount(8)` backend
    pub fn system(target: impl Into<PathBuf>) -> Result<Self, ResourceError> {
        Self::new(target, Arc::new(SystemMount))
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn is_mounted(&self) -> bool {
        self.state == MountState::Mounted
    }

    /// The live handle, if mounted
    pub fn handle(&self) -> Option<&MountHandle> {
        self.current.as_ref()
    }

    /// Mount `layout` at the target.
    ///
    /// # Errors
    ///
    /// - `AlreadyMounted` if a handle is still live
    /// - `MountFailed` if the backend failed; state is back to Unmounted
    pub fn acquire(&mut self, layout: &MountLayout) -> Result<MountHandle, ResourceError> {
        if let Some(handle) = &self.current {
            return Err(ResourceError::AlreadyMounted {
                target: self.target.clone(),
                device: handle.device.clone(),
            });
        }

        self.state = MountState::Mounting;
        info!(
            "Mounting {} at {}",
            layout.root.display(),
            self.target.display()
        );

        if let Err(e) = self.backend.mount(layout, &self.target) {
            self.state = MountState::Unmounted;
            return Err(ResourceError::MountFailed {
                device: layout.root.clone(),
                target: self.target.clone(),
                reason: format!("{:#}", e),
            });
        }

        let handle = MountHandle {
            id: self.next_id,
            target: self.target.clone(),
            device: layout.root.clone(),
        };
        self.next_id += 1;
        self.current = Some(handle.clone());
        self.state = MountState::Mounted;
        set_claim_mounted(&self.target, true);

        Ok(handle)
    }

    /// Unmount the target. A no-op success when nothing is mounted.
    ///
    /// On failure the mount is still considered live so a later call can
    /// retry.
    pub fn release(&mut self) -> Result<(), ResourceError> {
        if self.current.is_none() {
            debug!("{} not mounted, nothing to release", self.target.display());
            return Ok(());
        }

        self.state = MountState::Unmounting;
        info!("Unmounting {}", self.target.display());

        match self.backend.unmount(&self.target) {
            Ok(()) => {
                self.current = None;
                self.state = MountState::Unmounted;
                set_claim_mounted(&self.target, false);
                Ok(())
            }
            Err(e) => {
                self.state = MountState::Mounted;
                Err(ResourceError::UnmountFailed {
                    target: self.target.clone(),
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    /// Release a specific handle; stale handles are ignored.
    pub fn release_handle(&mut self, handle: &MountHandle) -> Result<(), ResourceError> {
        match &self.current {
            Some(current) if current.id == handle.id => self.release(),
            _ => Ok(()),
        }
    }
}

impl Drop for MountLifecycle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Unmount on drop failed: {}", e);
        }
        lock_claims().remove(&self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeMount {
        mounts: AtomicUsize,
        unmounts: AtomicUsize,
        fail_mount: AtomicBool,
        fail_unmount: AtomicBool,
    }

    impl MountBackend for FakeMount {
        fn mount(&self, _layout: &MountLayout, _target: &Path) -> Result<()> {
            if self.fail_mount.load(Ordering::SeqCst) {
                anyhow::bail!("special device does not exist");
            }
            self.mounts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn unmount(&self, _target: &Path) -> Result<()> {
            if self.fail_unmount.load(Ordering::SeqCst) {
                anyhow::bail!("target is busy");
            }
            self.unmounts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn lifecycle(name: &str) -> (MountLifecycle, Arc<FakeMount>) {
        let backend = Arc::new(FakeMount::default());
        let target = std::env::temp_dir().join(format!("mount-test-{}", name));
        let ml = MountLifecycle::new(target, backend.clone()).expect("claim");
        (ml, backend)
    }

    #[test]
    fn test_acquire_and_release() {
        let (mut ml, backend) = lifecycle("acquire");
        assert_eq!(ml.state(), MountState::Unmounted);

        let handle = ml.acquire(&MountLayout::new("/dev/sdX2")).unwrap();
        assert_eq!(ml.state(), MountState::Mounted);
        assert_eq!(handle.device(), Path::new("/dev/sdX2"));
        assert_eq!(handle.target(), ml.target());

        ml.release().unwrap();
        assert_eq!(ml.state(), MountState::Unmounted);
        assert_eq!(backend.unmounts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (mut ml, backend) = lifecycle("idempotent");
        ml.acquire(&MountLayout::new("/dev/sdX2")).unwrap();
        ml.release().unwrap();
        ml.release().unwrap();
        assert_eq!(backend.unmounts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_when_never_mounted() {
        let (mut ml, backend) = lifecycle("never");
        ml.release().unwrap();
        assert_eq!(backend.unmounts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_acquire_twice_fails() {
        let (mut ml, _) = lifecycle("twice");
        ml.acquire(&MountLayout::new("/dev/sdX2")).unwrap();
        let err = ml.acquire(&MountLayout::new("/dev/sdY2")).unwrap_err();
        assert!(matches!(err, ResourceError::AlreadyMounted { .. }));
        assert!(ml.is_mounted());
    }

    #[test]
    fn test_failed_mount_returns_to_unmounted() {
        let (mut ml, backend) = lifecycle("failmount");
        backend.fail_mount.store(true, Ordering::SeqCst);

        let err = ml.acquire(&MountLayout::new("/dev/sdX2")).unwrap_err();
        assert!(matches!(err, ResourceError::MountFailed { .. }));
        assert_eq!(ml.state(), MountState::Unmounted);
        assert!(ml.handle().is_none());

        // Nothing live, so release does not touch the backend
        ml.release().unwrap();
        assert_eq!(backend.unmounts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_unmount_keeps_mount_live_for_retry() {
        let (mut ml, backend) = lifecycle("failunmount");
        ml.acquire(&MountLayout::new("/dev/sdX2")).unwrap();

        backend.fail_unmount.store(true, Ordering::SeqCst);
        let err = ml.release().unwrap_err();
        assert!(matches!(err, ResourceError::UnmountFailed { .. }));
        assert!(ml.is_mounted());

        backend.fail_unmount.store(false, Ordering::SeqCst);
        ml.release().unwrap();
        assert!(!ml.is_mounted());
    }

    #[test]
    fn test_second_claim_on_same_target_is_rejected() {
        let (ml, _) = lifecycle("claim");
        let err = MountLifecycle::new(ml.target().to_path_buf(), Arc::new(FakeMount::default()))
            .unwrap_err();
        assert!(matches!(err, ResourceError::MountPointInUse(_)));

        let target = ml.target().to_path_buf();
        drop(ml);
        assert!(MountLifecycle::new(target, Arc::new(FakeMount::default())).is_ok());
    }

    #[test]
    fn test_claims_survive_a_panicking_holder() {
        let holder = std::thread::spawn(|| {
            let _map = lock_claims();
            panic!("claim holder died");
        });
        assert!(holder.join().is_err());

        let (ml, _) = lifecycle("after-poison");
        assert_eq!(ml.state(), MountState::Unmounted);
        let err = MountLifecycle::new(ml.target().to_path_buf(), Arc::new(FakeMount::default()))
            .unwrap_err();
        assert!(matches!(err, ResourceError::MountPointInUse(_)));
    }

    #[test]
    fn test_drop_unmounts() {
        let (mut ml, backend) = lifecycle("drop");
        ml.acquire(&MountLayout::new("/dev/sdX2")).unwrap();
        drop(ml);
        assert_eq!(backend.unmounts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_handle_release_is_ignored() {
        let (mut ml, backend) = lifecycle("stale");
        let first = ml.acquire(&MountLayout::new("/dev/sdX2")).unwrap();
        ml.release().unwrap();
        ml.acquire(&MountLayout::new("/dev/sdX2")).unwrap();

        ml.release_handle(&first).unwrap();
        assert!(ml.is_mounted());
        assert_eq!(backend.unmounts.load(Ordering::SeqCst), 1);
    }
}
