//! Authenticated access point session.
//!
//! A session owns one encrypted packet channel. Connecting goes through:
//!
//! 1. Resolve the access points and shuffle them
//! 2. Dial each in turn, retrying refused connections a few times
//! 3. Run the handshake, moving on to the next access point when it rejects
//!    the client or fails the signature check
//! 4. Log in with stored credentials if present, otherwise with the access
//!    token
//! 5. Announce the client and its locale, then store the reusable
//!    credentials from the welcome message
//!
//! Key requests share the channel and are serialized by a lock. Their
//! sequence numbers come from a counter owned by the session.

use std::{
    net::TcpStream,
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

use protobuf::{Message, MessageField};
use rand::RngCore;

use crate::{
    audio_key::{self, KeyResolution},
    channel::Channel,
    config::Config,
    credentials::{self, StoredCredentials},
    error::{Error, ErrorKind, Result},
    handshake, http,
    protocol::{
        packet::PacketType,
        protos::{
            authentication::{
                APWelcome, AuthenticationType, ClientResponseEncrypted, CpuFamily,
                LoginCredentials, Os, SystemInfo,
            },
            keyexchange::APLoginFailed,
        },
        resolve::Endpoint,
    },
    resolve,
    track::{FileId, Gid},
    transport::{Socket, Transport},
};

/// Pause before dialing again after a refused connection.
const REFUSED_BACKOFF: Duration = Duration::from_millis(200);

/// Length of the random announcement sent after login.
const ANNOUNCEMENT_LENGTH: usize = 20;

/// Locale announcement sent after login.
const PREFERRED_LOCALE: &[u8] = b"\x00\x00\x10\x00\x02preferred-localeen";

/// Authenticated session on one access point.
pub struct Session<S = TcpStream> {
    channel: Mutex<Channel<S>>,
    sequence: AtomicU32,
    username: String,
}

impl Session<TcpStream> {
    /// Connects to a random access point and logs in.
    ///
    /// # Errors
    ///
    /// * `Unavailable` if no access point can be reached, or every one of
    ///   them failed the handshake
    /// * `Unauthenticated` if the login is refused
    pub fn connect(config: &Config, client: &http::Client, access_token: &str) -> Result<Self> {
        let mut endpoints = resolve::access_points(client)?;
        fastrand::shuffle(&mut endpoints);

        let channel = first_channel(&endpoints, |endpoint| {
            let stream = dial(endpoint, config.connect_attempts)
                .map_err(|e| Error::unavailable(e.to_string()))?;
            info!("connected to {endpoint}");
            handshake::handshake(Transport::new(stream))
        })?;

        Self::login(channel, config, access_token)
    }
}

impl<S: Socket> Session<S> {
    /// Logs in on a keyed channel.
    ///
    /// Stored credentials are preferred over the access token. On success
    /// the reusable credentials of the welcome message replace the stored
    /// ones; failing to store them is only logged.
    ///
    /// # Errors
    ///
    /// * `Unauthenticated` if the access point refuses the login
    /// * `FailedPrecondition` on an unexpected reply
    /// * channel errors
    pub fn login(mut channel: Channel<S>, config: &Config, access_token: &str) -> Result<Self> {
        let path = credentials_path(config);
        let login = match StoredCredentials::load(&path) {
            Some(stored) => {
                debug!("logging in with stored credentials of {}", stored.username);
                login_credentials(
                    Some(stored.username),
                    stored.auth_data,
                    AuthenticationType::AUTHENTICATION_STORED_SPOTIFY_CREDENTIALS,
                )
            }
            None => {
                debug!("logging in with access token");
                login_credentials(
                    None,
                    access_token.as_bytes().to_vec(),
                    AuthenticationType::AUTHENTICATION_SPOTIFY_TOKEN,
                )
            }
        };

        let request = client_response(config, login).write_to_bytes()?;
        channel.send(PacketType::Login, &request)?;

        let welcome = loop {
            let packet = channel.receive()?;
            match packet.kind {
                PacketType::ApWelcome => break APWelcome::parse_from_bytes(&packet.payload)?,
                PacketType::AuthFailure => {
                    let failure = APLoginFailed::parse_from_bytes(&packet.payload)?;
                    return Err(Error::unauthenticated(format!(
                        "login failed: {:?} ({})",
                        failure.error_code(),
                        failure.error_description()
                    )));
                }
                PacketType::Ping => channel.send(PacketType::Pong, &[0; 4])?,
                other => {
                    return Err(Error::failed_precondition(format!(
                        "unexpected {other} packet during login"
                    )))
                }
            }
        };

        let username = welcome.canonical_username().to_owned();
        info!("authenticated as {username}");

        let mut announcement = [0; ANNOUNCEMENT_LENGTH];
        rand::thread_rng().fill_bytes(&mut announcement);
        channel.send(PacketType::Unknown0x0f, &announcement)?;
        channel.send(PacketType::PreferredLocale, PREFERRED_LOCALE)?;

        let reusable = welcome.reusable_auth_credentials();
        if reusable.is_empty() {
            debug!("no reusable credentials in welcome");
        } else if let Err(e) =
            StoredCredentials::new(username.clone(), reusable.to_vec()).save(&path)
        {
            warn!("could not store credentials: {e}");
        }

        Ok(Self {
            channel: Mutex::new(channel),
            sequence: AtomicU32::new(0),
            username,
        })
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Requests the audio key of `file_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel fails. A refused key is
    /// [`KeyResolution::Unavailable`].
    pub fn request_key(&self, gid: &Gid, file_id: &FileId) -> Result<KeyResolution> {
        let mut channel = self.channel.lock()?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        audio_key::request_key(&mut *channel, sequence, gid, file_id)
    }
}

/// Dials an access point, retrying refused connections.
fn dial(endpoint: &Endpoint, attempts: usize) -> Result<TcpStream> {
    for attempt in 1..=attempts.max(1) {
        match TcpStream::connect((endpoint.host.as_str(), endpoint.port)) {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                debug!("{endpoint} refused connection (attempt {attempt}/{attempts})");
                thread::sleep(REFUSED_BACKOFF);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::unavailable(format!(
        "{endpoint} refused {attempts} connections"
    )))
}

/// Opens a keyed channel on the first endpoint that completes a handshake.
///
/// Endpoints that cannot be reached, that fail the signature check or that
/// reject the client are skipped. Any other error ends the search.
fn first_channel<S, F>(endpoints: &[Endpoint], mut open: F) -> Result<Channel<S>>
where
    F: FnMut(&Endpoint) -> Result<Channel<S>>,
{
    let mut last_error = None;
    for endpoint in endpoints {
        match open(endpoint) {
            Ok(channel) => return Ok(channel),
            Err(e) if tries_next_endpoint(&e) => {
                warn!("{endpoint}: {e}");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::unavailable(match last_error {
        Some(e) => format!("tried all {} access points, last: {e}", endpoints.len()),
        None => "no access points".to_owned(),
    }))
}

fn tries_next_endpoint(e: &Error) -> bool {
    matches!(
        e.kind,
        ErrorKind::Unavailable
            | ErrorKind::Aborted
            | ErrorKind::DeadlineExceeded
            | ErrorKind::DataLoss
            | ErrorKind::PermissionDenied
            | ErrorKind::Unauthenticated
    )
}

fn credentials_path(config: &Config) -> PathBuf {
    config.credentials_dir.join(credentials::FILE_NAME)
}

fn login_credentials(
    username: Option<String>,
    auth_data: Vec<u8>,
    typ: AuthenticationType,
) -> LoginCredentials {
    let mut credentials = LoginCredentials::new();
    if let Some(username) = username {
        credentials.set_username(username);
    }
    credentials.set_typ(typ);
    credentials.set_auth_data(auth_data);
    credentials
}

fn client_response(config: &Config, credentials: LoginCredentials) -> ClientResponseEncrypted {
    let mut system_info = SystemInfo::new();
    system_info.set_cpu_family(CpuFamily::CPU_UNKNOWN);
    system_info.set_os(Os::OS_UNKNOWN);
    system_info.set_system_information_string(config.app_name.clone());
    system_info.set_device_id(config.device_id_string());

    let mut response = ClientResponseEncrypted::new();
    response.login_credentials = MessageField::some(credentials);
    response.system_info = MessageField::some(system_info);
    response.set_version_string(config.app_version.clone());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::testing::{FrameDecoder, FrameEncoder},
        decrypt::Key,
        protocol::protos::keyexchange::ErrorCode,
        transport::testing::MemorySocket,
    };

    const SEND_KEY: [u8; 32] = [0x0a; 32];
    const RECV_KEY: [u8; 32] = [0x0b; 32];

    fn config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::new();
        config.credentials_dir = dir.path().to_path_buf();
        config
    }

    fn welcome(username: &str, reusable: &[u8]) -> Vec<u8> {
        let mut welcome = APWelcome::new();
        welcome.set_canonical_username(username.to_owned());
        welcome.set_reusable_auth_credentials(reusable.to_vec());
        welcome.write_to_bytes().unwrap()
    }

    fn channel(socket: &MemorySocket) -> Channel<MemorySocket> {
        Channel::new(Transport::new(socket.clone()), &SEND_KEY, &RECV_KEY)
    }

    fn endpoints(names: &[&str]) -> Vec<Endpoint> {
        names.iter().map(|name| name.parse().unwrap()).collect()
    }

    #[test]
    fn rejecting_access_point_is_skipped() {
        let endpoints = endpoints(&["ap-a:4070", "ap-b:443", "ap-c:80"]);
        let socket = MemorySocket::default();

        let mut tried = Vec::new();
        let result = first_channel(&endpoints, |endpoint| {
            tried.push(endpoint.host.clone());
            match endpoint.host.as_str() {
                "ap-a" => Err(Error::unauthenticated("TryAnotherAP")),
                _ => Ok(channel(&socket)),
            }
        });

        assert!(result.is_ok());
        assert_eq!(tried, ["ap-a", "ap-b"]);
    }

    #[test]
    fn exhausted_access_points_are_unavailable() {
        let endpoints = endpoints(&["ap-a:4070", "ap-b:443"]);

        let mut tried = 0;
        let err = first_channel::<MemorySocket, _>(&endpoints, |endpoint| {
            tried += 1;
            if endpoint.port == 443 {
                Err(Error::permission_denied("bad server signature"))
            } else {
                Err(Error::unavailable("connection reset"))
            }
        })
        .unwrap_err();

        assert_eq!(tried, 2);
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(err.to_string().contains("bad server signature"));

        let err = first_channel::<MemorySocket, _>(&[], |_| unreachable!()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }

    #[test]
    fn unexpected_handshake_error_stops_search() {
        let endpoints = endpoints(&["ap-a:4070", "ap-b:443"]);

        let mut tried = 0;
        let err = first_channel::<MemorySocket, _>(&endpoints, |_| {
            tried += 1;
            Err(Error::internal("client hello too large"))
        })
        .unwrap_err();

        assert_eq!(tried, 1);
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn token_login_announces_and_stores_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);

        let mut server = FrameEncoder::new(&RECV_KEY);
        let socket = MemorySocket::default();
        socket.push_input(&server.encode(PacketType::ApWelcome, &welcome("dave", b"reuse")));

        let session = Session::login(channel(&socket), &config, "token-123").unwrap();
        assert_eq!(session.username(), "dave");

        let frames = FrameDecoder::new(&SEND_KEY).decode_all(&socket.output());
        assert_eq!(frames.len(), 3);

        assert_eq!(frames[0].0, PacketType::Login);
        let login = ClientResponseEncrypted::parse_from_bytes(&frames[0].1).unwrap();
        assert_eq!(
            login.login_credentials.typ(),
            AuthenticationType::AUTHENTICATION_SPOTIFY_TOKEN
        );
        assert_eq!(login.login_credentials.auth_data(), b"token-123");
        assert!(!login.login_credentials.has_username());

        assert_eq!(frames[1].0, PacketType::Unknown0x0f);
        assert_eq!(frames[1].1.len(), ANNOUNCEMENT_LENGTH);
        assert_eq!(frames[2], (PacketType::PreferredLocale, PREFERRED_LOCALE.to_vec()));

        let stored = StoredCredentials::load(&credentials_path(&config)).unwrap();
        assert_eq!(stored, StoredCredentials::new("dave", b"reuse".to_vec()));
    }

    #[test]
    fn stored_credentials_are_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        StoredCredentials::new("erin", b"stored".to_vec())
            .save(&credentials_path(&config))
            .unwrap();

        let mut server = FrameEncoder::new(&RECV_KEY);
        let socket = MemorySocket::default();
        socket.push_input(&server.encode(PacketType::ApWelcome, &welcome("erin", b"next")));

        Session::login(channel(&socket), &config, "unused").unwrap();

        let frames = FrameDecoder::new(&SEND_KEY).decode_all(&socket.output());
        let login = ClientResponseEncrypted::parse_from_bytes(&frames[0].1).unwrap();
        assert_eq!(
            login.login_credentials.typ(),
            AuthenticationType::AUTHENTICATION_STORED_SPOTIFY_CREDENTIALS
        );
        assert_eq!(login.login_credentials.username(), "erin");
        assert_eq!(login.login_credentials.auth_data(), b"stored");

        let stored = StoredCredentials::load(&credentials_path(&config)).unwrap();
        assert_eq!(stored.auth_data, b"next");
    }

    #[test]
    fn auth_failure_is_unauthenticated() {
        let dir = tempfile::tempdir().unwrap();

        let mut failure = APLoginFailed::new();
        failure.set_error_code(ErrorCode::BadCredentials);
        let mut server = FrameEncoder::new(&RECV_KEY);
        let socket = MemorySocket::default();
        socket.push_input(
            &server.encode(PacketType::AuthFailure, &failure.write_to_bytes().unwrap()),
        );

        let err = match Session::login(channel(&socket), &config(&dir), "bad") {
            Ok(_) => panic!("login succeeded"),
            Err(e) => e,
        };
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
        assert!(!credentials_path(&config(&dir)).exists());
    }

    #[test]
    fn key_requests_use_increasing_sequences() {
        let dir = tempfile::tempdir().unwrap();

        let mut server = FrameEncoder::new(&RECV_KEY);
        let socket = MemorySocket::default();
        socket.push_input(&server.encode(PacketType::ApWelcome, &welcome("fay", b"")));
        for sequence in 0..2_u32 {
            let mut payload = sequence.to_be_bytes().to_vec();
            payload.extend_from_slice(&[sequence as u8; 16]);
            socket.push_input(&server.encode(PacketType::AesKey, &payload));
        }

        let session = Session::login(channel(&socket), &config(&dir), "token").unwrap();
        let gid = Gid::from_bytes(&[1; 16]);
        let file_id = FileId::from_bytes(&[2; 20]);

        assert_eq!(
            session.request_key(&gid, &file_id).unwrap(),
            KeyResolution::Key(Key::new([0; 16]))
        );
        assert_eq!(
            session.request_key(&gid, &file_id).unwrap(),
            KeyResolution::Key(Key::new([1; 16]))
        );
    }
}
