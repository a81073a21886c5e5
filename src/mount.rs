//! Disk image attach/detach.
//!
//! The [`DiskImageMounter`] trait is the seam to the OS mount service. The
//! default implementation, [`Hdiutil`], shells out to macOS `hdiutil`.
//!
//! A [`MountGuard`] owns a mount created by this process and detaches it when
//! dropped, retrying a bounded number of times. Mounts that already existed
//! are never wrapped in a guard, so they are never detached.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

/// Number of detach attempts before giving up.
pub const UNMOUNT_ATTEMPTS: u32 = 3;

/// Pause between detach attempts.
pub const UNMOUNT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Mount service
// ---------------------------------------------------------------------------

/// Result of attaching a disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    pub mount_point: PathBuf,
    /// The image was attached before we asked; we do not own the mount.
    pub already_mounted: bool,
}

/// Attach and detach disk images.
pub trait DiskImageMounter {
    /// Attach `image`, or report where it is already attached.
    fn mount(&self, image: &Path) -> io::Result<MountHandle>;

    /// Detach the volume at `mount_point`.
    fn unmount(&self, mount_point: &Path, force: bool) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// Bounded retry
// ---------------------------------------------------------------------------

/// Run `op` up to `attempts` times, sleeping `delay` between failures.
///
/// Returns the first success, or the error of the last attempt. An
/// `attempts` of zero is treated as one. No sleep follows the final attempt.
pub fn retry<T, E, F>(attempts: u32, delay: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= attempts => return Err(e),
            Err(_) => {
                attempt += 1;
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
        }
    }
}

/// How hard to try when detaching a mount we created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmountPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub force: bool,
}

impl Default for UnmountPolicy {
    fn default() -> Self {
        Self {
            attempts: UNMOUNT_ATTEMPTS,
            delay: UNMOUNT_DELAY,
            force: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Detaches an image mounted by this process when dropped.
///
/// Detach failures are logged and swallowed: by the time the guard drops the
/// signature may already be on disk, and the caller's result must not change.
pub struct MountGuard<'a> {
    mounter: &'a dyn DiskImageMounter,
    image: PathBuf,
    mount_point: PathBuf,
    policy: UnmountPolicy,
}

impl<'a> MountGuard<'a> {
    pub fn new(
        mounter: &'a dyn DiskImageMounter,
        image: impl Into<PathBuf>,
        mount_point: impl Into<PathBuf>,
        policy: UnmountPolicy,
    ) -> Self {
        Self {
            mounter,
            image: image.into(),
            mount_point: mount_point.into(),
            policy,
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    fn release(&self) {
        debug!("Unmounting {}", self.image.display());
        let result = retry(self.policy.attempts, self.policy.delay, || {
            self.mounter
                .unmount(&self.mount_point, self.policy.force)
                .inspect_err(|e| warn!("unmount of {} failed: {e}", self.mount_point.display()))
        });
        if let Err(e) = result {
            error!(
                "failed to unmount {} at {}: {e}",
                self.image.display(),
                self.mount_point.display()
            );
        }
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MountGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountGuard")
            .field("image", &self.image)
            .field("mount_point", &self.mount_point)
            .field("policy", &self.policy)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// hdiutil
// ---------------------------------------------------------------------------

/// [`DiskImageMounter`] backed by macOS `hdiutil`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hdiutil;

impl Hdiutil {
    fn run<S: AsRef<OsStr>>(args: &[S]) -> io::Result<Vec<u8>> {
        if !cfg!(target_os = "macos") {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "mounting disk images requires macOS (hdiutil)",
            ));
        }
        let output = Command::new("hdiutil").args(args).output()?;
        if !output.status.success() {
            let verb = args
                .first()
                .map(|a| a.as_ref().to_string_lossy().into_owned())
                .unwrap_or_default();
            return Err(io::Error::other(format!(
                "hdiutil {verb} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    fn run_plist<S: AsRef<OsStr>>(args: &[S]) -> io::Result<plist::Value> {
        let stdout = Self::run(args)?;
        plist::Value::from_reader(io::Cursor::new(stdout))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl DiskImageMounter for Hdiutil {
    fn mount(&self, image: &Path) -> io::Result<MountHandle> {
        let info = Self::run_plist(&["info", "-plist"])?;
        if let Some(mount_point) = find_attached(&info, image) {
            return Ok(MountHandle {
                mount_point,
                already_mounted: true,
            });
        }

        let attach: [&OsStr; 5] = [
            "attach".as_ref(),
            "-plist".as_ref(),
            "-noverify".as_ref(),
            "-nobrowse".as_ref(),
            image.as_os_str(),
        ];
        let attached = Self::run_plist(&attach)?;
        let mount_point = attached
            .as_dictionary()
            .and_then(first_mount_point)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("hdiutil attach reported no mount point for {}", image.display()),
                )
            })?;
        Ok(MountHandle {
            mount_point,
            already_mounted: false,
        })
    }

    fn unmount(&self, mount_point: &Path, force: bool) -> io::Result<()> {
        let mut args: Vec<&OsStr> = vec!["detach".as_ref(), mount_point.as_os_str()];
        if force {
            args.push("-force".as_ref());
        }
        Self::run(args.as_slice()).map(|_| ())
    }
}

/// Look up `image` in `hdiutil info -plist` output and return its mount point.
fn find_attached(info: &plist::Value, image: &Path) -> Option<PathBuf> {
    let wanted = fs::canonicalize(image).unwrap_or_else(|_| image.to_path_buf());
    info.as_dictionary()?
        .get("images")?
        .as_array()?
        .iter()
        .filter_map(|img| img.as_dictionary())
        .find(|img| {
            img.get("image-path")
                .and_then(|p| p.as_string())
                .is_some_and(|p| Path::new(p) == wanted || Path::new(p) == image)
        })
        .and_then(first_mount_point)
}

/// First `mount-point` listed under `system-entities`.
fn first_mount_point(dict: &plist::Dictionary) -> Option<PathBuf> {
    dict.get("system-entities")?
        .as_array()?
        .iter()
        .filter_map(|e| e.as_dictionary())
        .find_map(|e| e.get("mount-point").and_then(|p| p.as_string()))
        .map(PathBuf::from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
