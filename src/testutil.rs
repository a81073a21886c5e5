//! Test doubles for the mount and signing collaborators.

use std::cell::{Cell, RefCell};
use std::io;
use std::path::{Path, PathBuf};

use crate::mount::{DiskImageMounter, MountHandle};
use crate::tss::{PersonalizationRequest, SignatureArtifact, Signer, SigningError};

/// Minimal DDI-style BuildManifest with one identity (board 0x0C, chip 0x8103).
pub const SAMPLE_MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>BuildIdentities</key>
    <array>
        <dict>
            <key>ApBoardID</key><string>0x0C</string>
            <key>ApChipID</key><string>0x8103</string>
            <key>ApSecurityDomain</key><string>0x01</string>
            <key>UniqueBuildID</key><data>3q2+7w==</data>
            <key>Info</key>
            <dict>
                <key>Variant</key><string>DeveloperDiskImage</string>
            </dict>
            <key>Manifest</key>
            <dict>
                <key>PersonalizedDMG</key>
                <dict>
                    <key>Digest</key><data>AQIDBA==</data>
                    <key>Trusted</key><true/>
                    <key>Info</key>
                    <dict><key>Path</key><string>Restore/PersonalizedDMG.dmg</string></dict>
                </dict>
                <key>LoadableTrustCache</key>
                <dict>
                    <key>Digest</key><data>BQYHCA==</data>
                    <key>Trusted</key><true/>
                </dict>
                <key>Untrusted</key>
                <dict>
                    <key>Digest</key><data>CQoLDA==</data>
                    <key>Trusted</key><false/>
                </dict>
            </dict>
        </dict>
    </array>
    <key>ProductBuildVersion</key><string>21A5268h</string>
    <key>ProductVersion</key><string>17.0</string>
    <key>SupportedProductTypes</key>
    <array><string>iPhone14,2</string></array>
</dict>
</plist>"#;

/// Records every call; optionally reports a pre-existing mount or fails.
pub struct FakeMounter {
    mount_point: PathBuf,
    already_mounted: bool,
    fail_mount: bool,
    unmount_failures_left: Cell<u32>,
    mount_calls: Cell<u32>,
    unmount_calls: Cell<u32>,
    unmounted: RefCell<Vec<PathBuf>>,
}

impl FakeMounter {
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            already_mounted: false,
            fail_mount: false,
            unmount_failures_left: Cell::new(0),
            mount_calls: Cell::new(0),
            unmount_calls: Cell::new(0),
            unmounted: RefCell::new(Vec::new()),
        }
    }

    pub fn already_mounted(mut self) -> Self {
        self.already_mounted = true;
        self
    }

    pub fn failing_mount(mut self) -> Self {
        self.fail_mount = true;
        self
    }

    /// Fail the next `n` unmount calls with a "resource busy" error.
    pub fn failing_unmounts(self, n: u32) -> Self {
        self.unmount_failures_left.set(n);
        self
    }

    pub fn mount_calls(&self) -> u32 {
        self.mount_calls.get()
    }

    pub fn unmount_calls(&self) -> u32 {
        self.unmount_calls.get()
    }

    pub fn unmounted(&self) -> Vec<PathBuf> {
        self.unmounted.borrow().clone()
    }
}

impl DiskImageMounter for FakeMounter {
    fn mount(&self, _image: &Path) -> io::Result<MountHandle> {
        self.mount_calls.set(self.mount_calls.get() + 1);
        if self.fail_mount {
            return Err(io::Error::other("attach failed"));
        }
        Ok(MountHandle {
            mount_point: self.mount_point.clone(),
            already_mounted: self.already_mounted,
        })
    }

    fn unmount(&self, mount_point: &Path, _force: bool) -> io::Result<()> {
        self.unmount_calls.set(self.unmount_calls.get() + 1);
        let left = self.unmount_failures_left.get();
        if left > 0 {
            self.unmount_failures_left.set(left - 1);
            return Err(io::Error::new(io::ErrorKind::ResourceBusy, "resource busy"));
        }
        self.unmounted.borrow_mut().push(mount_point.to_path_buf());
        Ok(())
    }
}

/// Returns a fixed ticket, or rejects every request.
pub struct FakeSigner {
    ticket: Option<Vec<u8>>,
    calls: Cell<u32>,
    last_identifiers: Cell<Option<(u64, u64, u64)>>,
}

impl FakeSigner {
    pub fn returning(ticket: &[u8]) -> Self {
        Self {
            ticket: Some(ticket.to_vec()),
            calls: Cell::new(0),
            last_identifiers: Cell::new(None),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            ticket: None,
            calls: Cell::new(0),
            last_identifiers: Cell::new(None),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }

    pub fn last_identifiers(&self) -> Option<(u64, u64, u64)> {
        self.last_identifiers.get()
    }
}

impl Signer for FakeSigner {
    fn personalize(
        &self,
        request: &PersonalizationRequest,
    ) -> Result<SignatureArtifact, SigningError> {
        self.calls.set(self.calls.get() + 1);
        let ids = request.identifiers();
        self.last_identifiers
            .set(Some((ids.board_id, ids.chip_id, ids.unique_chip_id)));
        match &self.ticket {
            Some(t) => Ok(SignatureArtifact::new(t.clone())),
            None => Err(SigningError::Rejected {
                status: 94,
                message: "This device isn't eligible for the requested build.".into(),
            }),
        }
    }
}
