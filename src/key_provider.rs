//! Content key providers.
//!
//! Three interchangeable ways to obtain the key of a file:
//!
//! * [`ChannelKeyProvider`] asks the access point over the session channel
//! * [`LicenseKeyProvider`] asks the license server and unwraps the
//!   obfuscated key with an external [`KeyUnwrapper`]
//! * [`CdmKeyProvider`] runs a DRM license exchange through an external
//!   [`ContentDecryptionModule`] and yields `kid:key` pairs
//!
//! Providers return `Ok(None)` when a key is not available for the file and
//! reserve errors for transport and authentication failures. Because the
//! DRM path yields key sets for an external decryption tool rather than an
//! AES key, [`ContentKey`] tells the two apart.
//!
//! [`KeyCache`] remembers resolved keys per provider kind and group id so
//! that concurrent downloads of the same content resolve it once.

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
};

use protobuf::Message;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use url::Url;
use veil::Redact;

use crate::{
    audio_key::KeyResolution,
    decrypt::Key,
    error::{Error, ErrorKind, Result},
    http,
    protocol::{
        self,
        protos::playplay::{
            ContentType, Interactivity, PlayPlayLicenseRequest, PlayPlayLicenseResponse,
        },
    },
    resolve::{self, CLIENT_TOKEN_HEADER},
    session::Session,
    track::{FileId, Gid},
    transport::Socket,
};

/// License server endpoint, followed by the hex file id.
pub const LICENSE_URL: &str = "https://spclient.wg.spotify.com/playplay/v1/key/";

/// Seek tables holding the protection header of a file.
pub const SEEKTABLE_URL: &str = "https://seektables.scdn.co/seektable/";

/// Version of the license request.
const LICENSE_REQUEST_VERSION: i32 = 2;

/// Key for one track of a protected file.
#[derive(Clone, Eq, PartialEq, Hash, Redact)]
pub struct CdmKey {
    /// Key id, hex.
    pub kid: String,

    /// Key, hex.
    #[redact]
    pub key: String,
}

impl fmt::Display for CdmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kid, self.key)
    }
}

impl FromStr for CdmKey {
    type Err = Error;

    /// Parses `kid:key` in hex.
    fn from_str(s: &str) -> Result<Self> {
        let (kid, key) = s
            .split_once(':')
            .ok_or_else(|| Error::invalid_argument("cdm key should be kid:key"))?;
        hex::decode(kid)?;
        hex::decode(key)?;

        Ok(Self {
            kid: kid.to_lowercase(),
            key: key.to_lowercase(),
        })
    }
}

/// A resolved content key.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ContentKey {
    /// AES key for decrypting the stream while downloading.
    Aes(Key),

    /// Key set for decrypting the downloaded file afterwards.
    Cdm(Vec<CdmKey>),
}

impl ContentKey {
    #[must_use]
    pub fn aes(&self) -> Option<Key> {
        match self {
            Self::Aes(key) => Some(*key),
            Self::Cdm(_) => None,
        }
    }

    #[must_use]
    pub fn cdm_keys(&self) -> Option<&[CdmKey]> {
        match self {
            Self::Aes(_) => None,
            Self::Cdm(keys) => Some(keys),
        }
    }
}

/// Which kind of provider resolved a key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum KeySource {
    Channel,
    License,
    Cdm,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel => write!(f, "channel"),
            Self::License => write!(f, "license"),
            Self::Cdm => write!(f, "cdm"),
        }
    }
}

/// Resolves content keys.
pub trait KeyProvider: Send + Sync {
    fn source(&self) -> KeySource;

    /// Resolves the key of `file_id` in group `gid`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport or authentication failures only. An
    /// unavailable key is `Ok(None)`.
    fn resolve(&self, gid: &Gid, file_id: &FileId) -> Result<Option<ContentKey>>;
}

/// Keys from the access point.
pub struct ChannelKeyProvider<S = std::net::TcpStream> {
    session: Arc<Session<S>>,
}

impl<S: Socket> ChannelKeyProvider<S> {
    #[must_use]
    pub fn new(session: Arc<Session<S>>) -> Self {
        Self { session }
    }
}

impl<S: Socket> KeyProvider for ChannelKeyProvider<S> {
    fn source(&self) -> KeySource {
        KeySource::Channel
    }

    fn resolve(&self, gid: &Gid, file_id: &FileId) -> Result<Option<ContentKey>> {
        Ok(match self.session.request_key(gid, file_id)? {
            KeyResolution::Key(key) => Some(ContentKey::Aes(key)),
            KeyResolution::Unavailable { .. } => None,
        })
    }
}

/// Turns the obfuscated key of a license response into an AES key.
pub trait KeyUnwrapper: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the key cannot be unwrapped.
    fn unwrap_key(&self, obfuscated: &[u8], file_id: &FileId) -> Result<Key>;
}

/// Keys from the license server.
pub struct LicenseKeyProvider {
    client: Arc<http::Client>,
    access_token: String,
    client_token: Option<String>,
    license_token: Vec<u8>,
    unwrapper: Box<dyn KeyUnwrapper>,
    base: Url,
}

impl LicenseKeyProvider {
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `license_token` is not hex.
    pub fn new(
        client: Arc<http::Client>,
        access_token: impl Into<String>,
        client_token: Option<String>,
        license_token: &str,
        unwrapper: Box<dyn KeyUnwrapper>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            access_token: access_token.into(),
            client_token,
            license_token: hex::decode(license_token.trim())?,
            unwrapper,
            base: Url::parse(LICENSE_URL)?,
        })
    }

    /// Sends requests to another license server.
    #[must_use]
    pub fn with_base(mut self, base: Url) -> Self {
        self.base = base;
        self
    }

    fn request(&self) -> PlayPlayLicenseRequest {
        let mut request = PlayPlayLicenseRequest::new();
        request.set_version(LICENSE_REQUEST_VERSION);
        request.set_token(self.license_token.clone());
        request.set_interactivity(Interactivity::INTERACTIVE);
        request.set_content_type(ContentType::AUDIO_TRACK);
        request
    }
}

impl KeyProvider for LicenseKeyProvider {
    fn source(&self) -> KeySource {
        KeySource::License
    }

    fn resolve(&self, _gid: &Gid, file_id: &FileId) -> Result<Option<ContentKey>> {
        let url = self.base.join(&file_id.to_hex())?;
        let mut request = self.client.post(url, self.request().write_to_bytes()?);

        let headers = request.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-protobuf"),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(AUTHORIZATION, bearer(&self.access_token)?);
        if let Some(ref token) = self.client_token {
            headers.insert(CLIENT_TOKEN_HEADER, HeaderValue::from_str(token)?);
        }

        let response = match self.client.execute(request) {
            Ok(response) => response,
            Err(e) if refuses_key(&e) => {
                warn!("{file_id}: license server refused key: {e}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let license = PlayPlayLicenseResponse::parse_from_bytes(&response.bytes()?)?;
        let obfuscated = license.obfuscated_key();
        if obfuscated.is_empty() {
            warn!("{file_id}: license response without key");
            return Ok(None);
        }

        let key = self.unwrapper.unwrap_key(obfuscated, file_id)?;
        Ok(Some(ContentKey::Aes(key)))
    }
}

/// Opaque DRM module that turns a license exchange into keys.
pub trait ContentDecryptionModule: Send + Sync {
    /// Builds a license challenge for a protection header (base64 PSSH).
    ///
    /// # Errors
    ///
    /// Returns an error if the header is not understood.
    fn challenge(&self, pssh: &str) -> Result<Vec<u8>>;

    /// Reads the keys from a license response.
    ///
    /// # Errors
    ///
    /// Returns an error if the license is not valid for the last challenge.
    fn keys(&self, license: &[u8]) -> Result<Vec<LicenseKey>>;
}

/// A key returned by a [`ContentDecryptionModule`].
#[derive(Clone, Eq, PartialEq, Redact)]
pub struct LicenseKey {
    pub kid: Vec<u8>,

    #[redact]
    pub key: Vec<u8>,

    /// Content keys decrypt media; other keys are for the license itself.
    pub is_content: bool,
}

#[derive(Debug, Deserialize)]
struct Seektable {
    pssh: String,
}

/// Keys from a DRM license exchange.
pub struct CdmKeyProvider {
    client: Arc<http::Client>,
    access_token: String,
    client_token: Option<String>,
    cdm: Box<dyn ContentDecryptionModule>,
    seektable_base: Url,
    license_url: Option<Url>,
}

impl CdmKeyProvider {
    /// # Errors
    ///
    /// Never fails with the built-in seek table URL.
    pub fn new(
        client: Arc<http::Client>,
        access_token: impl Into<String>,
        client_token: Option<String>,
        cdm: Box<dyn ContentDecryptionModule>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            access_token: access_token.into(),
            client_token,
            cdm,
            seektable_base: Url::parse(SEEKTABLE_URL)?,
            license_url: None,
        })
    }

    /// Uses fixed endpoints instead of resolving a license host.
    #[must_use]
    pub fn with_endpoints(mut self, seektable_base: Url, license_url: Url) -> Self {
        self.seektable_base = seektable_base;
        self.license_url = Some(license_url);
        self
    }

    fn pssh(&self, file_id: &FileId) -> Result<String> {
        let url = self
            .seektable_base
            .join(&format!("{}.json", file_id.to_hex()))?;
        let body = self.client.execute(self.client.get(url))?.text()?;
        let seektable: Seektable = protocol::json(&body, "seektable")?;
        Ok(seektable.pssh)
    }

    fn license_url(&self) -> Result<Url> {
        if let Some(ref url) = self.license_url {
            return Ok(url.clone());
        }

        let spclients = resolve::spclients(&self.client)?;
        let spclient = fastrand::choice(&spclients)
            .ok_or_else(|| Error::not_found("no spclients"))?;
        Ok(Url::parse(&format!(
            "https://{}/widevine-license/v1/audio/license",
            spclient.host
        ))?)
    }
}

impl KeyProvider for CdmKeyProvider {
    fn source(&self) -> KeySource {
        KeySource::Cdm
    }

    fn resolve(&self, _gid: &Gid, file_id: &FileId) -> Result<Option<ContentKey>> {
        let pssh = match self.pssh(file_id) {
            Ok(pssh) => pssh,
            Err(e) if e.kind == ErrorKind::NotFound => {
                warn!("{file_id}: no protection header");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let challenge = self.cdm.challenge(&pssh)?;

        let mut request = self.client.post(self.license_url()?, challenge);
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, bearer(&self.access_token)?);
        if let Some(ref token) = self.client_token {
            headers.insert(CLIENT_TOKEN_HEADER, HeaderValue::from_str(token)?);
        }

        let response = match self.client.execute(request) {
            Ok(response) => response,
            Err(e) if refuses_key(&e) => {
                warn!("{file_id}: license refused: {e}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let keys: Vec<CdmKey> = self
            .cdm
            .keys(&response.bytes()?)?
            .into_iter()
            .filter(|key| key.is_content)
            .map(|key| CdmKey {
                kid: hex::encode(key.kid),
                key: hex::encode(key.key),
            })
            .collect();

        if keys.is_empty() {
            warn!("{file_id}: license without content keys");
            return Ok(None);
        }

        debug!("{file_id}: {} content keys", keys.len());
        Ok(Some(ContentKey::Cdm(keys)))
    }
}

fn bearer(token: &str) -> Result<HeaderValue> {
    Ok(HeaderValue::from_str(&format!("Bearer {token}"))?)
}

/// Whether a license server error means "no key for this file".
fn refuses_key(e: &Error) -> bool {
    matches!(e.kind, ErrorKind::NotFound | ErrorKind::PermissionDenied)
}

/// Resolved keys per provider kind and group id, shared by all downloads.
///
/// Resolution is single-flight: while one caller resolves a group id,
/// others asking for the same id and kind wait and receive its result.
/// Unavailable keys are not remembered. An AES key from the channel never
/// answers a lookup for DRM key sets, or the other way round.
#[derive(Default)]
pub struct KeyCache {
    entries: Mutex<HashMap<(KeySource, String), Arc<Mutex<Option<ContentKey>>>>>,
}

impl KeyCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached `source` key of `gid`, resolving it with `resolve`
    /// first if needed.
    ///
    /// # Errors
    ///
    /// Returns the error of `resolve`, or an error if a lock is poisoned.
    pub fn get_or_resolve<F>(
        &self,
        source: KeySource,
        gid: &Gid,
        resolve: F,
    ) -> Result<Option<ContentKey>>
    where
        F: FnOnce() -> Result<Option<ContentKey>>,
    {
        let slot = {
            let mut entries = self.entries.lock()?;
            Arc::clone(entries.entry((source, gid.to_hex())).or_default())
        };

        let mut key = slot.lock()?;
        if let Some(ref key) = *key {
            trace!("{gid}: {source} key cached");
            return Ok(Some(key.clone()));
        }

        let resolved = resolve()?;
        *key = resolved.clone();
        Ok(resolved)
    }

    /// Returns the cached `source` key of `gid`, if any.
    #[must_use]
    pub fn get(&self, source: KeySource, gid: &Gid) -> Option<ContentKey> {
        let slot = self
            .entries
            .lock()
            .ok()?
            .get(&(source, gid.to_hex()))
            .cloned()?;
        let key = slot.lock().ok()?;
        key.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{
        channel::{testing::FrameEncoder, Channel},
        config::Config,
        http::testing::{response, serve},
        protocol::packet::PacketType,
        transport::{testing::MemorySocket, Transport},
    };

    fn gid() -> Gid {
        Gid::from_bytes(&[0x11; 16])
    }

    fn file_id() -> FileId {
        FileId::from_bytes(&[0x22; 20])
    }

    fn client() -> Arc<http::Client> {
        Arc::new(http::Client::new(&Config::new()).unwrap())
    }

    #[test]
    fn cache_resolves_once_for_concurrent_callers() {
        let cache = Arc::new(KeyCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_resolve(KeySource::Channel, &gid(), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok(Some(ContentKey::Aes(Key::new([7; 16]))))
                        })
                        .unwrap()
                })
            })
            .collect();

        let keys: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(keys[0], keys[1]);
        assert_eq!(keys[0], Some(ContentKey::Aes(Key::new([7; 16]))));
    }

    #[test]
    fn cache_does_not_remember_missing_keys() {
        let cache = KeyCache::new();
        assert_eq!(
            cache
                .get_or_resolve(KeySource::License, &gid(), || Ok(None))
                .unwrap(),
            None
        );
        assert_eq!(cache.get(KeySource::License, &gid()), None);

        let key = ContentKey::Aes(Key::new([1; 16]));
        let resolved = cache
            .get_or_resolve(KeySource::License, &gid(), || Ok(Some(key.clone())))
            .unwrap();
        assert_eq!(resolved, Some(key.clone()));
        assert_eq!(cache.get(KeySource::License, &gid()), Some(key));
    }

    #[test]
    fn cache_keeps_provider_kinds_apart() {
        let cache = KeyCache::new();
        let aes = ContentKey::Aes(Key::new([4; 16]));
        cache
            .get_or_resolve(KeySource::Channel, &gid(), || Ok(Some(aes.clone())))
            .unwrap();
        assert_eq!(cache.get(KeySource::Cdm, &gid()), None);

        let cdm = ContentKey::Cdm(vec![
            "00112233445566778899aabbccddeeff:ffeeddccbbaa99887766554433221100"
                .parse()
                .unwrap(),
        ]);
        let resolved = cache
            .get_or_resolve(KeySource::Cdm, &gid(), || Ok(Some(cdm.clone())))
            .unwrap();
        assert_eq!(resolved, Some(cdm.clone()));
        assert_eq!(cache.get(KeySource::Channel, &gid()), Some(aes));
        assert_eq!(cache.get(KeySource::Cdm, &gid()), Some(cdm));
    }

    #[test]
    fn channel_provider_maps_key_error_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new();
        config.credentials_dir = dir.path().to_path_buf();

        let send_key = [1; 32];
        let recv_key = [2; 32];
        let mut server = FrameEncoder::new(&recv_key);
        let socket = MemorySocket::default();
        let mut welcome = crate::protocol::protos::authentication::APWelcome::new();
        welcome.set_canonical_username("gus".to_owned());
        socket.push_input(&server.encode(PacketType::ApWelcome, &welcome.write_to_bytes().unwrap()));
        socket.push_input(&server.encode(PacketType::AesKeyError, &[0, 0, 0, 0, 0, 1]));

        let channel = Channel::new(Transport::new(socket.clone()), &send_key, &recv_key);
        let session = Arc::new(Session::login(channel, &config, "token").unwrap());
        let provider = ChannelKeyProvider::new(session);

        assert_eq!(provider.source(), KeySource::Channel);
        assert_eq!(provider.resolve(&gid(), &file_id()).unwrap(), None);
    }

    struct XorUnwrapper;

    impl KeyUnwrapper for XorUnwrapper {
        fn unwrap_key(&self, obfuscated: &[u8], _file_id: &FileId) -> Result<Key> {
            let bytes: Vec<u8> = obfuscated.iter().map(|b| b ^ 0xff).collect();
            Key::from_slice(&bytes)
        }
    }

    #[test]
    fn license_provider_unwraps_key() {
        let mut license = PlayPlayLicenseResponse::new();
        license.set_obfuscated_key(vec![0xf0; 16]);
        let body = license.write_to_bytes().unwrap();
        let (base, requests) = serve(vec![response("200 OK", &[], &body)]);

        let provider = LicenseKeyProvider::new(
            client(),
            "token",
            Some("client".to_owned()),
            "01e132cae527bd21620e822f58514932",
            Box::new(XorUnwrapper),
        )
        .unwrap()
        .with_base(base.join("key/").unwrap());

        let key = provider.resolve(&gid(), &file_id()).unwrap();
        assert_eq!(key, Some(ContentKey::Aes(Key::new([0x0f; 16]))));

        let requests = requests.lock().unwrap();
        assert!(requests[0].0.starts_with(&format!("POST /key/{} ", file_id().to_hex())));
        let sent = PlayPlayLicenseRequest::parse_from_bytes(&requests[0].1).unwrap();
        assert_eq!(sent.version(), 2);
        assert_eq!(sent.token()[..2], [0x01, 0xe1]);
        assert_eq!(sent.interactivity(), Interactivity::INTERACTIVE);
        assert_eq!(sent.content_type(), ContentType::AUDIO_TRACK);
    }

    #[test]
    fn license_refusal_is_none() {
        let (base, _) = serve(vec![response("403 Forbidden", &[], b"")]);
        let provider =
            LicenseKeyProvider::new(client(), "token", None, "00", Box::new(XorUnwrapper))
                .unwrap()
                .with_base(base);

        assert_eq!(provider.resolve(&gid(), &file_id()).unwrap(), None);
    }

    struct FakeCdm;

    impl ContentDecryptionModule for FakeCdm {
        fn challenge(&self, pssh: &str) -> Result<Vec<u8>> {
            Ok(format!("challenge for {pssh}").into_bytes())
        }

        fn keys(&self, license: &[u8]) -> Result<Vec<LicenseKey>> {
            assert_eq!(license, b"license");
            Ok(vec![
                LicenseKey {
                    kid: vec![0xaa; 16],
                    key: vec![0xbb; 16],
                    is_content: true,
                },
                LicenseKey {
                    kid: vec![0xcc; 16],
                    key: vec![0xdd; 16],
                    is_content: false,
                },
                LicenseKey {
                    kid: vec![0xee; 16],
                    key: vec![0xff; 16],
                    is_content: true,
                },
            ])
        }
    }

    #[test]
    fn cdm_provider_returns_content_keys() {
        let (base, requests) = serve(vec![
            response("200 OK", &[], br#"{"pssh": "AAAAPHBzc2g="}"#),
            response("200 OK", &[], b"license"),
        ]);

        let provider = CdmKeyProvider::new(client(), "token", None, Box::new(FakeCdm))
            .unwrap()
            .with_endpoints(
                base.join("seektable/").unwrap(),
                base.join("license").unwrap(),
            );

        let key = provider.resolve(&gid(), &file_id()).unwrap().unwrap();
        let keys = key.cdm_keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].to_string(), format!("{}:{}", "aa".repeat(16), "bb".repeat(16)));
        assert_eq!(keys[1].kid, "ee".repeat(16));
        assert_eq!(key.aes(), None);

        let requests = requests.lock().unwrap();
        assert!(requests[0]
            .0
            .starts_with(&format!("GET /seektable/{}.json ", file_id().to_hex())));
        assert_eq!(requests[1].1, b"challenge for AAAAPHBzc2g=");
    }

    #[test]
    fn cdm_key_parses_pairs() {
        let key: CdmKey = "0A0B:0C0D".parse().unwrap();
        assert_eq!(key.to_string(), "0a0b:0c0d");
        assert!("0a0b".parse::<CdmKey>().is_err());
        assert!("zz:00".parse::<CdmKey>().is_err());
        assert!(!format!("{key:?}").contains("0c0d"));
    }
}
