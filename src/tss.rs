//! Personalization requests and the TSS signing service.
//!
//! A [`PersonalizationRequest`] bundles the device identifiers, the parsed
//! manifest, the ApNonce and the network options. A [`Signer`] turns it into
//! a [`SignatureArtifact`] (an IMG4 ticket). [`TssClient`] is the default
//! signer and talks to Apple's TSS controller over HTTP.

use std::time::Duration;

use log::debug;
use plist::{Dictionary, Integer, Value};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use url::Url;

use crate::manifest::BuildManifest;
use crate::DeviceIdentity;

/// TSS controller endpoint used for personalization.
pub const TSS_CONTROLLER_URL: &str = "http://gs.apple.com/TSS/controller?action=2";

const TSS_CLIENT_VERSION: &str = "libauthinstall-1033.0.2";
const TSS_USER_AGENT: &str = "InetURL/1.0";
const TSS_CONTENT_TYPE: &str = "text/xml; charset=\"utf-8\"";
const TSS_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid ApNonce: {0}")]
    InvalidNonce(#[from] hex::FromHexError),

    #[error("no build identity matches board 0x{board_id:x} / chip 0x{chip_id:x}")]
    NoMatchingIdentity { board_id: u64, chip_id: u64 },

    #[error("failed to encode TSS request: {0}")]
    Encode(#[source] plist::Error),

    #[error("TSS request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TSS server rejected request (status {status}): {message}")]
    Rejected { status: i64, message: String },

    #[error("malformed TSS response: {0}")]
    MalformedResponse(String),

    #[error("TSS response contains no ApImg4Ticket")]
    MissingTicket,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// The identifiers a personalization is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    BoardId,
    ChipId,
    UniqueChipId,
}

impl IdentityKey {
    pub const ALL: [IdentityKey; 3] = [Self::BoardId, Self::ChipId, Self::UniqueChipId];

    /// Name used in personalization identifier maps.
    pub fn name(self) -> &'static str {
        match self {
            Self::BoardId => "BoardId",
            Self::ChipId => "ChipID",
            Self::UniqueChipId => "UniqueChipID",
        }
    }

    /// Field carrying the value in a TSS request.
    pub fn tss_field(self) -> &'static str {
        match self {
            Self::BoardId => "ApBoardID",
            Self::ChipId => "ApChipID",
            Self::UniqueChipId => "ApECID",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersonalizationIdentifiers {
    pub board_id: u64,
    pub chip_id: u64,
    pub unique_chip_id: u64,
}

impl PersonalizationIdentifiers {
    pub fn get(&self, key: IdentityKey) -> u64 {
        match key {
            IdentityKey::BoardId => self.board_id,
            IdentityKey::ChipId => self.chip_id,
            IdentityKey::UniqueChipId => self.unique_chip_id,
        }
    }

    pub fn entries(&self) -> [(IdentityKey, u64); 3] {
        IdentityKey::ALL.map(|k| (k, self.get(k)))
    }
}

/// Proxy and TLS settings for the signing exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkOptions {
    pub proxy: Option<Url>,
    /// Accept invalid TLS certificates.
    pub insecure: bool,
}

/// Everything a [`Signer`] needs. Immutable once built.
#[derive(Debug, Clone)]
pub struct PersonalizationRequest {
    identifiers: PersonalizationIdentifiers,
    manifest: BuildManifest,
    nonce: String,
    network: NetworkOptions,
}

impl PersonalizationRequest {
    pub fn new(identity: &DeviceIdentity, manifest: BuildManifest, network: NetworkOptions) -> Self {
        Self {
            identifiers: PersonalizationIdentifiers {
                board_id: identity.board_id,
                chip_id: identity.chip_id,
                unique_chip_id: identity.ecid,
            },
            manifest,
            nonce: identity.nonce.clone(),
            network,
        }
    }

    pub fn identifiers(&self) -> &PersonalizationIdentifiers {
        &self.identifiers
    }

    pub fn manifest(&self) -> &BuildManifest {
        &self.manifest
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn network(&self) -> &NetworkOptions {
        &self.network
    }
}

/// Signature bytes returned by the signing service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureArtifact(Vec<u8>);

impl SignatureArtifact {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Performs the personalization exchange.
pub trait Signer {
    fn personalize(&self, request: &PersonalizationRequest)
        -> Result<SignatureArtifact, SigningError>;
}

// ---------------------------------------------------------------------------
// TSS wire format
// ---------------------------------------------------------------------------

/// Build the TSS request dictionary for `request`.
///
/// Uses the build identity matching the device's board and chip, and adds
/// every manifest component that carries a digest.
pub fn build_tss_request(request: &PersonalizationRequest) -> Result<Dictionary, SigningError> {
    let ids = request.identifiers();
    let identity = request
        .manifest()
        .identity_for(ids.board_id, ids.chip_id)
        .ok_or(SigningError::NoMatchingIdentity {
            board_id: ids.board_id,
            chip_id: ids.chip_id,
        })?;
    let nonce = hex::decode(request.nonce().trim())?;

    let mut req = Dictionary::new();
    req.insert("@ApImg4Ticket".into(), Value::Boolean(true));
    req.insert("@HostPlatformInfo".into(), Value::String("mac".into()));
    req.insert("@VersionInfo".into(), Value::String(TSS_CLIENT_VERSION.into()));
    req.insert(
        "@UUID".into(),
        Value::String(uuid::Uuid::new_v4().to_string().to_uppercase()),
    );
    req.insert("ApNonce".into(), Value::Data(nonce));
    req.insert("ApProductionMode".into(), Value::Boolean(true));
    req.insert("ApSecurityMode".into(), Value::Boolean(true));

    for (key, value) in ids.entries() {
        req.insert(key.tss_field().into(), Value::Integer(Integer::from(value)));
    }
    if let Some(domain) = identity.security_domain() {
        req.insert(
            "ApSecurityDomain".into(),
            Value::Integer(Integer::from(domain)),
        );
    }
    if let Some(ubid) = identity.unique_build_id() {
        req.insert("UniqueBuildID".into(), Value::Data(ubid.to_vec()));
    }

    for (name, entry) in &identity.manifest {
        let Some(entry) = entry.as_dictionary() else {
            continue;
        };
        let Some(digest) = entry.get("Digest").and_then(Value::as_data) else {
            continue;
        };
        let trusted = entry
            .get("Trusted")
            .and_then(Value::as_boolean)
            .unwrap_or(false);

        let mut component = Dictionary::new();
        component.insert("Digest".into(), Value::Data(digest.to_vec()));
        component.insert("Trusted".into(), Value::Boolean(trusted));
        component.insert("EPRO".into(), Value::Boolean(true));
        component.insert("ESEC".into(), Value::Boolean(true));
        req.insert(name.clone(), Value::Dictionary(component));
    }

    Ok(req)
}

/// Extract the ticket from a `STATUS=..&MESSAGE=..&REQUEST_STRING=<plist>` body.
pub fn parse_tss_response(body: &str) -> Result<Vec<u8>, SigningError> {
    let (head, payload) = match body.split_once("REQUEST_STRING=") {
        Some((head, payload)) => (head, Some(payload)),
        None => (body, None),
    };

    let mut status = None;
    let mut message = String::new();
    for field in head.split('&') {
        match field.split_once('=') {
            Some(("STATUS", v)) => status = v.trim().parse::<i64>().ok(),
            Some(("MESSAGE", m)) => message = m.trim().to_string(),
            _ => {}
        }
    }

    let status =
        status.ok_or_else(|| SigningError::MalformedResponse("missing STATUS field".into()))?;
    if status != 0 {
        return Err(SigningError::Rejected { status, message });
    }

    let payload = payload
        .ok_or_else(|| SigningError::MalformedResponse("missing REQUEST_STRING".into()))?;
    let value = Value::from_reader_xml(payload.as_bytes())
        .map_err(|e| SigningError::MalformedResponse(e.to_string()))?;
    value
        .as_dictionary()
        .and_then(|d| d.get("ApImg4Ticket"))
        .and_then(Value::as_data)
        .filter(|ticket| !ticket.is_empty())
        .map(<[u8]>::to_vec)
        .ok_or(SigningError::MissingTicket)
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// [`Signer`] that posts to the TSS controller.
#[derive(Debug, Clone)]
pub struct TssClient {
    url: String,
    timeout: Duration,
}

impl Default for TssClient {
    fn default() -> Self {
        Self {
            url: TSS_CONTROLLER_URL.to_string(),
            timeout: TSS_TIMEOUT,
        }
    }
}

impl TssClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn http_client(&self, network: &NetworkOptions) -> Result<Client, reqwest::Error> {
        let mut builder = Client::builder()
            .timeout(self.timeout)
            .user_agent(TSS_USER_AGENT)
            .danger_accept_invalid_certs(network.insecure);
        if let Some(proxy) = &network.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }
        builder.build()
    }
}

impl Signer for TssClient {
    fn personalize(
        &self,
        request: &PersonalizationRequest,
    ) -> Result<SignatureArtifact, SigningError> {
        for (key, value) in request.identifiers().entries() {
            debug!("{} = {value:#x}", key.name());
        }
        let tss_request = build_tss_request(request)?;
        let mut body = Vec::new();
        Value::Dictionary(tss_request)
            .to_writer_xml(&mut body)
            .map_err(SigningError::Encode)?;

        debug!("Sending TSS request to {} ({} bytes)", self.url, body.len());
        let response = self
            .http_client(request.network())?
            .post(&self.url)
            .header(CONTENT_TYPE, TSS_CONTENT_TYPE)
            .body(body)
            .send()?
            .error_for_status()?;
        let text = response.text()?;

        let ticket = parse_tss_response(&text)?;
        debug!("Received {} byte ticket", ticket.len());
        Ok(SignatureArtifact::new(ticket))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
