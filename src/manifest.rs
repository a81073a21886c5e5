//! Locating, loading and parsing the DDI `BuildManifest.plist`.
//!
//! The manifest comes either from the Developer Disk Image bundled with
//! Xcode (which has to be mounted first) or from a file the user points at.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::info;
use serde::Deserialize;

use crate::mount::{DiskImageMounter, MountGuard, UnmountPolicy};
use crate::{parse_u64, PersonalizeError, Result};

/// Xcode install used when neither `--xcode` nor `--manifest` is given.
pub const DEFAULT_XCODE_PATH: &str = "/Applications/Xcode.app";

/// Location of the DDI inside an Xcode bundle.
pub const DDI_IMAGE_PATH: &str = "Contents/Resources/CoreDeviceDDIs/iOS_DDI.dmg";

/// Location of the manifest inside the mounted DDI.
pub const MANIFEST_PATH: &str = "Restore/BuildManifest.plist";

// ---------------------------------------------------------------------------
// Source selection
// ---------------------------------------------------------------------------

/// Where the build manifest comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// An Xcode bundle whose DDI gets mounted.
    XcodePath(PathBuf),
    /// A `BuildManifest.plist` on disk.
    ManifestFile(PathBuf),
}

impl ManifestSource {
    /// Pick a source from the two optional flags. Exactly one must be set;
    /// empty paths count as unset.
    pub fn from_options(xcode: Option<PathBuf>, manifest: Option<PathBuf>) -> Result<Self> {
        let xcode = xcode.filter(|p| !p.as_os_str().is_empty());
        let manifest = manifest.filter(|p| !p.as_os_str().is_empty());
        match (xcode, manifest) {
            (Some(_), Some(_)) => Err(PersonalizeError::Config(
                "cannot specify both --xcode and --manifest".into(),
            )),
            (None, None) => Err(PersonalizeError::Config(
                "must specify either --xcode or --manifest".into(),
            )),
            (Some(xcode), None) => Ok(Self::XcodePath(xcode)),
            (None, Some(manifest)) => Ok(Self::ManifestFile(manifest)),
        }
    }
}

/// Path of the DDI disk image inside `xcode`.
pub fn ddi_image_path(xcode: &Path) -> PathBuf {
    xcode.join(DDI_IMAGE_PATH)
}

// ---------------------------------------------------------------------------
// BuildManifest
// ---------------------------------------------------------------------------

/// Parsed `BuildManifest.plist`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BuildManifest {
    #[serde(default)]
    pub build_identities: Vec<BuildIdentity>,
    #[serde(default)]
    pub product_version: Option<String>,
    #[serde(default)]
    pub product_build_version: Option<String>,
    #[serde(default)]
    pub supported_product_types: Vec<String>,
}

/// One entry of `BuildIdentities`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildIdentity {
    /// `<string>0x0C</string>` in Apple's manifests, `<integer>` in some others.
    #[serde(rename = "ApBoardID", default)]
    pub ap_board_id: Option<plist::Value>,
    #[serde(rename = "ApChipID", default)]
    pub ap_chip_id: Option<plist::Value>,
    #[serde(rename = "ApSecurityDomain", default)]
    pub ap_security_domain: Option<plist::Value>,
    #[serde(rename = "UniqueBuildID", default)]
    pub unique_build_id: Option<plist::Value>,
    /// Component name → `{ Digest, Trusted, Info, ... }`.
    #[serde(rename = "Manifest", default)]
    pub manifest: BTreeMap<String, plist::Value>,
}

impl BuildManifest {
    /// Parse a binary or XML plist.
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, plist::Error> {
        plist::from_bytes(data)
    }

    /// The identity matching a device's board and chip ids.
    pub fn identity_for(&self, board_id: u64, chip_id: u64) -> Option<&BuildIdentity> {
        self.build_identities
            .iter()
            .find(|bi| bi.board_id() == Some(board_id) && bi.chip_id() == Some(chip_id))
    }
}

impl BuildIdentity {
    pub fn board_id(&self) -> Option<u64> {
        self.ap_board_id.as_ref().and_then(id_value)
    }

    pub fn chip_id(&self) -> Option<u64> {
        self.ap_chip_id.as_ref().and_then(id_value)
    }

    pub fn security_domain(&self) -> Option<u64> {
        self.ap_security_domain.as_ref().and_then(id_value)
    }

    pub fn unique_build_id(&self) -> Option<&[u8]> {
        self.unique_build_id.as_ref().and_then(|v| v.as_data())
    }
}

fn id_value(value: &plist::Value) -> Option<u64> {
    match value {
        plist::Value::String(s) => parse_u64(s).ok(),
        plist::Value::Integer(i) => i.as_unsigned(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// A loaded manifest, plus the mount it was read from when we created one.
///
/// Keep this alive until the run is over: dropping it detaches the DDI.
#[derive(Debug)]
pub struct ResolvedManifest<'a> {
    pub manifest: BuildManifest,
    pub path: PathBuf,
    pub mount: Option<MountGuard<'a>>,
}

/// Turns a [`ManifestSource`] into a parsed [`BuildManifest`].
pub struct ManifestResolver<'a> {
    mounter: &'a dyn DiskImageMounter,
    policy: UnmountPolicy,
}

impl<'a> ManifestResolver<'a> {
    pub fn new(mounter: &'a dyn DiskImageMounter, policy: UnmountPolicy) -> Self {
        Self { mounter, policy }
    }

    pub fn resolve(&self, source: &ManifestSource) -> Result<ResolvedManifest<'a>> {
        let (path, mount) = match source {
            ManifestSource::ManifestFile(path) => (path.clone(), None),
            ManifestSource::XcodePath(xcode) => {
                let (mount_point, guard) = self.mount_ddi(xcode)?;
                (mount_point.join(MANIFEST_PATH), guard)
            }
        };

        // On error `mount` drops here and the DDI is detached.
        let data = fs::read(&path).map_err(|source| PersonalizeError::ManifestRead {
            path: path.clone(),
            source,
        })?;
        let manifest =
            BuildManifest::from_bytes(&data).map_err(|source| PersonalizeError::ManifestParse {
                path: path.clone(),
                source,
            })?;

        Ok(ResolvedManifest {
            manifest,
            path,
            mount,
        })
    }

    fn mount_ddi(&self, xcode: &Path) -> Result<(PathBuf, Option<MountGuard<'a>>)> {
        let image = ddi_image_path(xcode);
        if matches!(fs::metadata(&image), Err(e) if e.kind() == io::ErrorKind::NotFound) {
            return Err(PersonalizeError::DiskImageNotFound {
                xcode: xcode.to_path_buf(),
            });
        }

        info!("Mounting {}", image.display());
        let handle = self
            .mounter
            .mount(&image)
            .map_err(|source| PersonalizeError::Mount {
                image: image.clone(),
                source,
            })?;

        if handle.already_mounted {
            info!("{} already mounted", image.display());
            return Ok((handle.mount_point, None));
        }
        let guard = MountGuard::new(self.mounter, image, handle.mount_point.clone(), self.policy);
        Ok((handle.mount_point, Some(guard)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
