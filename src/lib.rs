//! # ddisign
//!
//! Personalize Apple Developer Disk Images (DDI) for a specific device.
//!
//! Given a device's board id, chip id, ECID and ApNonce, this crate:
//!
//! - loads the DDI `BuildManifest.plist`, either from a file or by mounting
//!   the `iOS_DDI.dmg` shipped inside Xcode
//! - builds a personalization request and sends it to Apple's TSS
//! - writes the returned ticket to `<board>.<chip>.<ecid>.personalized.signature`
//!
//! A disk image mounted by this crate is always detached again, whether the
//! run succeeds or not. An image that was already mounted is left alone.
//!
//! ## Example
//!
//! ```no_run
//! use ddisign::SignOptions;
//!
//! let options = SignOptions {
//!     manifest: Some("BuildManifest.plist".into()),
//!     board_id: Some(0x0C),
//!     chip_id: Some(0x8103),
//!     ecid: Some(0x1A2B3C4D5E),
//!     nonce: Some("3b1f7a...".into()),
//!     output: Some("signatures".into()),
//!     ..SignOptions::default()
//! };
//!
//! let written = ddisign::personalize_ddi(options).unwrap();
//! println!("{}", written.display());
//! ```

pub mod manifest;
pub mod mount;
pub mod tss;

#[cfg(test)]
mod testutil;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;
use url::Url;

use crate::manifest::{ManifestResolver, ManifestSource, ResolvedManifest};
use crate::mount::{DiskImageMounter, Hdiutil, UnmountPolicy};
use crate::tss::{
    NetworkOptions, PersonalizationRequest, SignatureArtifact, Signer, SigningError, TssClient,
};

/// Suffix of the written signature file.
pub const SIGNATURE_SUFFIX: &str = "personalized.signature";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PersonalizeError {
    /// Missing or conflicting options. Raised before anything touches disk
    /// or network.
    #[error("{0}")]
    Config(String),

    #[error(
        "failed to find iOS_DDI.dmg in '{}' (install NEW Xcode.app or Xcode-beta.app)",
        .xcode.display()
    )]
    DiskImageNotFound { xcode: PathBuf },

    #[error("failed to mount {}: {source}", .image.display())]
    Mount { image: PathBuf, source: io::Error },

    #[error("failed to read BuildManifest.plist '{}': {source}", .path.display())]
    ManifestRead { path: PathBuf, source: io::Error },

    #[error("failed to parse BuildManifest.plist '{}': {source}", .path.display())]
    ManifestParse { path: PathBuf, source: plist::Error },

    #[error("failed to personalize DDI: {0}")]
    Signing(#[from] SigningError),

    #[error("failed to create output folder '{}': {source}", .path.display())]
    CreateOutputDir { path: PathBuf, source: io::Error },

    #[error("failed to write signature to '{}': {source}", .path.display())]
    WriteSignature { path: PathBuf, source: io::Error },
}

pub type Result<T> = std::result::Result<T, PersonalizeError>;

/// Parse a decimal or `0x`-prefixed hexadecimal integer.
pub fn parse_u64(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|_| PersonalizeError::Config(format!("invalid integer value: {s}")))
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Device a personalization is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub board_id: u64,
    pub chip_id: u64,
    pub ecid: u64,
    /// ApNonce, hex encoded.
    pub nonce: String,
}

impl DeviceIdentity {
    /// All four fields are required; zero and empty count as missing.
    pub fn new(board_id: u64, chip_id: u64, ecid: u64, nonce: impl Into<String>) -> Result<Self> {
        let nonce = nonce.into();
        if board_id == 0 || chip_id == 0 || ecid == 0 || nonce.trim().is_empty() {
            return Err(PersonalizeError::Config(
                "must specify --board-id, --chip-id, --ecid AND --nonce".into(),
            ));
        }
        Ok(Self {
            board_id,
            chip_id,
            ecid,
            nonce,
        })
    }
}

/// Raw, unvalidated inputs as they come from the command line.
#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    pub xcode: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub board_id: Option<u64>,
    pub chip_id: Option<u64>,
    pub ecid: Option<u64>,
    pub nonce: Option<String>,
    pub proxy: Option<String>,
    pub insecure: bool,
    pub output: Option<PathBuf>,
}

/// Validated inputs for one personalization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub source: ManifestSource,
    pub identity: DeviceIdentity,
    pub network: NetworkOptions,
    pub output_dir: Option<PathBuf>,
}

impl SignOptions {
    /// Check the options without touching the filesystem or network.
    pub fn validate(self) -> Result<SignRequest> {
        let source = ManifestSource::from_options(self.xcode, self.manifest)?;
        let identity = DeviceIdentity::new(
            self.board_id.unwrap_or(0),
            self.chip_id.unwrap_or(0),
            self.ecid.unwrap_or(0),
            self.nonce.unwrap_or_default(),
        )?;
        let proxy = match self.proxy.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(p) => Some(Url::parse(p).map_err(|e| {
                PersonalizeError::Config(format!("invalid --proxy URL '{p}': {e}"))
            })?),
        };
        Ok(SignRequest {
            source,
            identity,
            network: NetworkOptions {
                proxy,
                insecure: self.insecure,
            },
            output_dir: self.output.filter(|p| !p.as_os_str().is_empty()),
        })
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// `<board>.<chip>.<ecid>.personalized.signature`
pub fn signature_filename(identity: &DeviceIdentity) -> String {
    format!(
        "{}.{}.{}.{SIGNATURE_SUFFIX}",
        identity.board_id, identity.chip_id, identity.ecid
    )
}

fn create_output_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o750).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

/// Write `artifact` to its signature file, under `output_dir` if given.
/// Returns the path written.
pub fn write_signature(
    identity: &DeviceIdentity,
    output_dir: Option<&Path>,
    artifact: SignatureArtifact,
) -> Result<PathBuf> {
    let mut path = PathBuf::from(signature_filename(identity));
    if let Some(dir) = output_dir {
        create_output_dir(dir).map_err(|source| PersonalizeError::CreateOutputDir {
            path: dir.to_path_buf(),
            source,
        })?;
        path = dir.join(path);
    }

    info!("Writing signature to {}", path.display());
    fs::write(&path, artifact.into_bytes()).map_err(|source| {
        PersonalizeError::WriteSignature {
            path: path.clone(),
            source,
        }
    })?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Runs a [`SignRequest`] against a mount service and a signer.
pub struct Personalizer<'a> {
    mounter: &'a dyn DiskImageMounter,
    signer: &'a dyn Signer,
    unmount_policy: UnmountPolicy,
}

impl<'a> Personalizer<'a> {
    pub fn new(mounter: &'a dyn DiskImageMounter, signer: &'a dyn Signer) -> Self {
        Self {
            mounter,
            signer,
            unmount_policy: UnmountPolicy::default(),
        }
    }

    pub fn unmount_policy(mut self, policy: UnmountPolicy) -> Self {
        self.unmount_policy = policy;
        self
    }

    /// Resolve the manifest, sign, write. Returns the signature path.
    ///
    /// A DDI mounted along the way is detached when this returns, on every
    /// path. Detach failures are logged only.
    pub fn run(&self, request: &SignRequest) -> Result<PathBuf> {
        let resolver = ManifestResolver::new(self.mounter, self.unmount_policy);
        let ResolvedManifest {
            manifest,
            path,
            mount: _mount,
        } = resolver.resolve(&request.source)?;
        debug!(
            "Loaded {} ({} build identities)",
            path.display(),
            manifest.build_identities.len()
        );
        if let Some(version) = &manifest.product_version {
            debug!(
                "DDI for {} {} ({})",
                version,
                manifest.product_build_version.as_deref().unwrap_or("unknown build"),
                manifest.supported_product_types.join(", ")
            );
        }

        let personalization =
            PersonalizationRequest::new(&request.identity, manifest, request.network.clone());
        let artifact = self.signer.personalize(&personalization)?;
        if artifact.is_empty() {
            return Err(SigningError::MissingTicket.into());
        }
        debug!("Received {} byte signature", artifact.len());

        write_signature(&request.identity, request.output_dir.as_deref(), artifact)
    }
}

/// Validate `options` and personalize using `hdiutil` and Apple's TSS.
pub fn personalize_ddi(options: SignOptions) -> Result<PathBuf> {
    let request = options.validate()?;
    let mounter = Hdiutil;
    let signer = TssClient::new();
    Personalizer::new(&mounter, &signer).run(&request)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
