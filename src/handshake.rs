//! Access point handshake.
//!
//! Negotiates the session keys for the packet channel:
//!
//! 1. Send a `ClientHello` with an ephemeral Diffie-Hellman public value
//! 2. Read the `APResponseMessage`; a login failure here ends the handshake
//! 3. Verify the RSA signature of the server's public value against the
//!    hard-coded server key; a bad signature ends the handshake
//! 4. Derive 100 bytes of key material with HMAC-SHA1 over the transcript
//!    and answer the challenge
//! 5. Briefly wait for an unsolicited failure message
//! 6. Key the send and receive ciphers from the key material
//!
//! Nothing is retried here. Callers start over with a fresh connection.

use std::{io, time::Duration};

use hmac::{Hmac, Mac};
use protobuf::{Message, MessageField};
use rand::RngCore;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest, Sha1};
use veil::Redact;

use crate::{
    channel::Channel,
    dh::DhLocalKeys,
    error::{Error, Result},
    protocol::protos::keyexchange::{
        APResponseMessage, BuildInfo, ClientHello, ClientResponsePlaintext, CryptoResponseUnion,
        Cryptosuite, LoginCryptoDiffieHellmanHello, LoginCryptoDiffieHellmanResponse,
        LoginCryptoHelloUnion, LoginCryptoResponseUnion, Platform, PoWResponseUnion, Product,
        ProductFlags,
    },
    transport::{Socket, Transport},
};

type HmacSha1 = Hmac<Sha1>;

/// Client version announced in the hello.
const CLIENT_VERSION: u64 = 117_300_517;

/// How long to wait for a late failure message after the challenge.
const FAILURE_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest handshake message accepted from the server, length prefix
/// included.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024;

/// Public exponent of the server signing key.
const SERVER_EXPONENT: u32 = 65_537;

/// Modulus of the server signing key, big-endian.
const SERVER_MODULUS: [u8; 256] = [
    0xac, 0xe0, 0x46, 0x0b, 0xff, 0xc2, 0x30, 0xaf, 0xf4, 0x6b, 0xfe, 0xc3, 0xbf, 0xbf, 0x86, 0x3d,
    0xa1, 0x91, 0xc6, 0xcc, 0x33, 0x6c, 0x93, 0xa1, 0x4f, 0xb3, 0xb0, 0x16, 0x12, 0xac, 0xac, 0x6a,
    0xf1, 0x80, 0xe7, 0xf6, 0x14, 0xd9, 0x42, 0x9d, 0xbe, 0x2e, 0x34, 0x66, 0x43, 0xe3, 0x62, 0xd2,
    0x32, 0x7a, 0x1a, 0x0d, 0x92, 0x3b, 0xae, 0xdd, 0x14, 0x02, 0xb1, 0x81, 0x55, 0x05, 0x61, 0x04,
    0xd5, 0x2c, 0x96, 0xa4, 0x4c, 0x1e, 0xcc, 0x02, 0x4a, 0xd4, 0xb2, 0x0c, 0x00, 0x1f, 0x17, 0xed,
    0xc2, 0x2f, 0xc4, 0x35, 0x21, 0xc8, 0xf0, 0xcb, 0xae, 0xd2, 0xad, 0xd7, 0x2b, 0x0f, 0x9d, 0xb3,
    0xc5, 0x32, 0x1a, 0x2a, 0xfe, 0x59, 0xf3, 0x5a, 0x0d, 0xac, 0x68, 0xf1, 0xfa, 0x62, 0x1e, 0xfb,
    0x2c, 0x8d, 0x0c, 0xb7, 0x39, 0x2d, 0x92, 0x47, 0xe3, 0xd7, 0x35, 0x1a, 0x6d, 0xbd, 0x24, 0xc2,
    0xae, 0x25, 0x5b, 0x88, 0xff, 0xab, 0x73, 0x29, 0x8a, 0x0b, 0xcc, 0xcd, 0x0c, 0x58, 0x67, 0x31,
    0x89, 0xe8, 0xbd, 0x34, 0x80, 0x78, 0x4a, 0x5f, 0xc9, 0x6b, 0x89, 0x9d, 0x95, 0x6b, 0xfc, 0x86,
    0xd7, 0x4f, 0x33, 0xa6, 0x78, 0x17, 0x96, 0xc9, 0xc3, 0x2d, 0x0d, 0x32, 0xa5, 0xab, 0xcd, 0x05,
    0x27, 0xe2, 0xf7, 0x10, 0xa3, 0x96, 0x13, 0xc4, 0x2f, 0x99, 0xc0, 0x27, 0xbf, 0xed, 0x04, 0x9c,
    0x3c, 0x27, 0x58, 0x04, 0xb6, 0xb2, 0x19, 0xf9, 0xc1, 0x2f, 0x02, 0xe9, 0x48, 0x63, 0xec, 0xa1,
    0xb6, 0x42, 0xa0, 0x9d, 0x48, 0x25, 0xf8, 0xb3, 0x9d, 0xd0, 0xe8, 0x6a, 0xf9, 0x48, 0x4d, 0xa1,
    0xc2, 0xba, 0x86, 0x30, 0x42, 0xea, 0x9d, 0xb3, 0x08, 0x6c, 0x19, 0x0e, 0x48, 0xb3, 0x9d, 0x66,
    0xeb, 0x00, 0x06, 0xa2, 0x5a, 0xee, 0xa1, 0x1b, 0x13, 0x87, 0x3c, 0xd7, 0x19, 0xe6, 0x55, 0xbd,
];

/// Session keys derived from the handshake transcript.
#[derive(Clone, Redact)]
pub struct SessionKeys {
    /// Answer to the server challenge.
    #[redact]
    pub challenge: [u8; 20],

    #[redact]
    pub send_key: [u8; 32],

    #[redact]
    pub recv_key: [u8; 32],
}

/// Returns the hard-coded access point signing key.
///
/// # Errors
///
/// Returns an error if the embedded key is rejected by `rsa`, which would
/// indicate a corrupted build.
pub fn server_key() -> Result<RsaPublicKey> {
    let key = RsaPublicKey::new(
        BigUint::from_bytes_be(&SERVER_MODULUS),
        BigUint::from(SERVER_EXPONENT),
    )?;
    Ok(key)
}

/// Performs the handshake against the production server key.
///
/// # Errors
///
/// See [`handshake_with_key`].
pub fn handshake<S: Socket>(transport: Transport<S>) -> Result<Channel<S>> {
    handshake_with_key(transport, &server_key()?)
}

/// Performs the handshake and returns a keyed packet channel.
///
/// # Errors
///
/// * `Unauthenticated` if the server answers the hello with a login failure
///   or reports a failure after the challenge
/// * `PermissionDenied` if the server signature does not verify
/// * `DataLoss` if a message is truncated or cannot be decoded
/// * I/O errors from the transport
pub fn handshake_with_key<S: Socket>(
    mut transport: Transport<S>,
    server_key: &RsaPublicKey,
) -> Result<Channel<S>> {
    let local_keys = DhLocalKeys::random();

    let hello = client_hello(&local_keys).write_to_bytes()?;
    let hello_len = i32::try_from(hello.len() + 6)
        .map_err(|_| Error::internal("client hello too large"))?;

    transport.write(&[0x00, 0x04]);
    transport.write_i32(hello_len);
    transport.write(&hello);

    let mut transcript = transport.staged().to_vec();
    transport.flush()?;

    let size = transport.read_u32()?;
    let body = transport.read_exact(body_length(size)?)?;

    transcript.extend_from_slice(&size.to_be_bytes());
    transcript.extend_from_slice(&body);

    let response = APResponseMessage::parse_from_bytes(&body)?;
    if response.login_failed.is_some() {
        let failure = &response.login_failed;
        error!(
            "access point refused hello: {:?} ({})",
            failure.error_code(),
            failure.error_description()
        );
        return Err(Error::unauthenticated(format!(
            "login failed: {:?}",
            failure.error_code()
        )));
    }

    let dh = &response
        .challenge
        .login_crypto_challenge
        .diffie_hellman;
    let remote_key = dh.gs();

    let digest = Sha1::digest(remote_key);
    server_key
        .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, dh.gs_signature())
        .map_err(|e| Error::permission_denied(format!("server signature check failed: {e}")))?;

    let shared_secret = local_keys.shared_secret(remote_key);
    let keys = derive_keys(&shared_secret, &transcript)?;

    let response = client_response(&keys.challenge).write_to_bytes()?;
    let response_len = i32::try_from(response.len() + 4)
        .map_err(|_| Error::internal("client response too large"))?;
    transport.write_i32(response_len);
    transport.write(&response);
    transport.flush()?;

    probe_failure(&mut transport)?;

    info!("handshake complete");
    Ok(Channel::new(transport, &keys.send_key, &keys.recv_key))
}

/// Derives the challenge answer and session keys.
///
/// The key material is `HMAC-SHA1(shared, transcript ‖ i)` for `i` in
/// `1..=5`, concatenated. Its first 20 bytes key the challenge HMAC over the
/// transcript; bytes `20..52` and `52..84` are the send and receive keys.
///
/// # Errors
///
/// Returns `Internal` if the HMAC cannot be keyed, which does not happen
/// for SHA-1.
pub fn derive_keys(shared_secret: &[u8], transcript: &[u8]) -> Result<SessionKeys> {
    let mut material = Vec::with_capacity(100);
    for i in 1..=5_u8 {
        let mut mac = HmacSha1::new_from_slice(shared_secret)
            .map_err(|e| Error::internal(e.to_string()))?;
        mac.update(transcript);
        mac.update(&[i]);
        material.extend_from_slice(&mac.finalize().into_bytes());
    }

    let mut mac =
        HmacSha1::new_from_slice(&material[..20]).map_err(|e| Error::internal(e.to_string()))?;
    mac.update(transcript);

    let mut keys = SessionKeys {
        challenge: [0; 20],
        send_key: [0; 32],
        recv_key: [0; 32],
    };
    keys.challenge.copy_from_slice(&mac.finalize().into_bytes());
    keys.send_key.copy_from_slice(&material[20..52]);
    keys.recv_key.copy_from_slice(&material[52..84]);

    Ok(keys)
}

fn client_hello(local_keys: &DhLocalKeys) -> ClientHello {
    let mut build_info = BuildInfo::new();
    build_info.set_product(Product::PRODUCT_CLIENT);
    build_info
        .product_flags
        .push(ProductFlags::PRODUCT_FLAG_NONE.into());
    build_info.set_platform(Platform::PLATFORM_LINUX_X86);
    build_info.set_version(CLIENT_VERSION);

    let mut dh_hello = LoginCryptoDiffieHellmanHello::new();
    dh_hello.set_gc(local_keys.public_key());
    dh_hello.set_server_keys_known(1);

    let mut crypto_hello = LoginCryptoHelloUnion::new();
    crypto_hello.diffie_hellman = MessageField::some(dh_hello);

    let mut nonce = vec![0; 16];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut hello = ClientHello::new();
    hello.build_info = MessageField::some(build_info);
    hello
        .cryptosuites_supported
        .push(Cryptosuite::CRYPTO_SUITE_SHANNON.into());
    hello.login_crypto_hello = MessageField::some(crypto_hello);
    hello.set_client_nonce(nonce);
    hello.set_padding(vec![0x1e]);
    hello
}

fn client_response(challenge: &[u8]) -> ClientResponsePlaintext {
    let mut dh_response = LoginCryptoDiffieHellmanResponse::new();
    dh_response.set_hmac(challenge.to_vec());

    let mut login_response = LoginCryptoResponseUnion::new();
    login_response.diffie_hellman = MessageField::some(dh_response);

    let mut response = ClientResponsePlaintext::new();
    response.login_crypto_response = MessageField::some(login_response);
    response.pow_response = MessageField::some(PoWResponseUnion::new());
    response.crypto_response = MessageField::some(CryptoResponseUnion::new());
    response
}

/// Length of a message body following a length prefix of `size`.
///
/// The prefix counts itself, so anything below four bytes is malformed.
fn body_length(size: u32) -> Result<usize> {
    if !(4..=MAX_MESSAGE_SIZE).contains(&size) {
        return Err(Error::data_loss(format!("invalid message size {size}")));
    }
    usize::try_from(size - 4).map_err(|e| Error::data_loss(e.to_string()))
}

/// Waits briefly for a failure message after answering the challenge.
///
/// Silence, a timeout or a closed read side all mean the challenge was
/// accepted.
fn probe_failure<S: Socket>(transport: &mut Transport<S>) -> Result<()> {
    transport.set_read_timeout(Some(FAILURE_PROBE_TIMEOUT))?;
    let probe = transport.read_u32();
    transport.set_read_timeout(None)?;

    let size = match probe {
        Ok(size) => size,
        Err(e) => {
            return match e.downcast::<io::Error>().map(io::Error::kind) {
                Some(
                    io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::UnexpectedEof,
                ) => Ok(()),
                _ => Err(e),
            };
        }
    };

    let body = transport.read_exact(body_length(size)?)?;
    let failure = APResponseMessage::parse_from_bytes(&body)?;
    Err(Error::unauthenticated(format!(
        "challenge rejected: {:?} ({})",
        failure.login_failed.error_code(),
        failure.login_failed.error_description()
    )))
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        thread,
    };

    use protobuf::Message;
    use rsa::{RsaPrivateKey, RsaPublicKey};

    use super::*;
    use crate::{
        error::ErrorKind,
        protocol::{
            packet::PacketType,
            protos::keyexchange::{
                APChallenge, APLoginFailed, ErrorCode, LoginCryptoChallengeUnion,
                LoginCryptoDiffieHellmanChallenge,
            },
        },
        shannon::Shannon,
    };

    fn read_message(stream: &mut TcpStream, prefix: usize) -> (Vec<u8>, Vec<u8>) {
        let mut head = vec![0; prefix + 4];
        stream.read_exact(&mut head).unwrap();
        let size = u32::from_be_bytes(head[prefix..].try_into().unwrap()) as usize;
        let mut body = vec![0; size - prefix - 4];
        stream.read_exact(&mut body).unwrap();
        (head, body)
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut message = ((body.len() + 4) as u32).to_be_bytes().to_vec();
        message.extend_from_slice(body);
        message
    }

    /// How the fake server ends the handshake.
    #[derive(Clone, Copy, PartialEq)]
    enum Ending {
        Accept,
        TamperSignature,
        RejectChallenge,
    }

    fn login_failed(code: ErrorCode) -> Vec<u8> {
        let mut failed = APLoginFailed::new();
        failed.set_error_code(code);
        let mut response = APResponseMessage::new();
        response.login_failed = MessageField::some(failed);
        framed(&response.write_to_bytes().unwrap())
    }

    /// Plays the server side of the handshake. Returns the keys the server
    /// derived.
    fn serve(listener: &TcpListener, signing_key: &RsaPrivateKey, ending: Ending) -> SessionKeys {
        let (mut stream, _) = listener.accept().unwrap();

        let (head, body) = read_message(&mut stream, 2);
        assert_eq!(&head[..2], &[0x00, 0x04]);
        let hello = ClientHello::parse_from_bytes(&body).unwrap();
        let client_public = hello.login_crypto_hello.diffie_hellman.gc().to_vec();

        let server_keys = DhLocalKeys::random();
        let gs = server_keys.public_key();
        let mut signature = signing_key
            .sign(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(&gs))
            .unwrap();
        if ending == Ending::TamperSignature {
            signature[0] ^= 0xff;
        }

        let mut dh = LoginCryptoDiffieHellmanChallenge::new();
        dh.set_gs(gs);
        dh.set_gs_signature(signature);
        let mut union = LoginCryptoChallengeUnion::new();
        union.diffie_hellman = MessageField::some(dh);
        let mut challenge = APChallenge::new();
        challenge.login_crypto_challenge = MessageField::some(union);
        let mut response = APResponseMessage::new();
        response.challenge = MessageField::some(challenge);

        let reply = framed(&response.write_to_bytes().unwrap());
        stream.write_all(&reply).unwrap();

        let mut transcript = head;
        transcript.extend_from_slice(&body);
        transcript.extend_from_slice(&reply);

        let shared = server_keys.shared_secret(&client_public);
        let keys = derive_keys(&shared, &transcript).unwrap();

        if ending == Ending::TamperSignature {
            return keys;
        }

        let (_, body) = read_message(&mut stream, 0);
        let answer = ClientResponsePlaintext::parse_from_bytes(&body).unwrap();
        assert_eq!(
            answer.login_crypto_response.diffie_hellman.hmac(),
            keys.challenge.as_slice()
        );

        if ending == Ending::RejectChallenge {
            stream.write_all(&login_failed(ErrorCode::BadCredentials)).unwrap();
        } else {
            // Let the client's failure probe run into its timeout, then send
            // one packet with the server's send key (the client's receive key).
            thread::sleep(Duration::from_millis(1200));
            let mut cipher = Shannon::new(&keys.recv_key);
            cipher.nonce(0);
            let mut frame = vec![u8::from(PacketType::CountryCode), 0, 2, b'S', b'E'];
            cipher.encrypt(&mut frame);
            let mut mac = [0; 4];
            cipher.finish(&mut mac);
            frame.extend_from_slice(&mac);
            stream.write_all(&frame).unwrap();
        }

        keys
    }

    fn signing_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap()
    }

    #[test]
    fn handshake_against_local_server() {
        let key = signing_key();
        let public = RsaPublicKey::from(&key);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || serve(&listener, &key, Ending::Accept));

        let stream = TcpStream::connect(addr).unwrap();
        let mut channel = handshake_with_key(Transport::new(stream), &public).unwrap();

        let packet = channel.receive().unwrap();
        assert_eq!(packet.kind, PacketType::CountryCode);
        assert_eq!(packet.payload, b"SE");

        server.join().unwrap();
    }

    #[test]
    fn bad_signature_is_fatal() {
        let key = signing_key();
        let public = RsaPublicKey::from(&key);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || serve(&listener, &key, Ending::TamperSignature));

        let stream = TcpStream::connect(addr).unwrap();
        let err = handshake_with_key(Transport::new(stream), &public).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        server.join().unwrap();
    }

    #[test]
    fn login_failure_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _ = read_message(&mut stream, 2);
            stream.write_all(&login_failed(ErrorCode::TryAnotherAP)).unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let err = handshake(Transport::new(stream)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);

        server.join().unwrap();
    }

    #[test]
    fn late_failure_after_challenge_is_unauthenticated() {
        let key = signing_key();
        let public = RsaPublicKey::from(&key);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || serve(&listener, &key, Ending::RejectChallenge));

        let stream = TcpStream::connect(addr).unwrap();
        let err = handshake_with_key(Transport::new(stream), &public).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
        assert!(err.to_string().contains("BadCredentials"));

        server.join().unwrap();
    }

    #[test]
    fn oversized_response_is_data_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _ = read_message(&mut stream, 2);
            stream.write_all(&u32::MAX.to_be_bytes()).unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let err = handshake(Transport::new(stream)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataLoss);

        server.join().unwrap();
    }

    #[test]
    fn message_sizes_are_bounded() {
        assert_eq!(body_length(4).unwrap(), 0);
        assert_eq!(body_length(MAX_MESSAGE_SIZE).unwrap(), 64 * 1024 - 4);
        assert_eq!(body_length(3).unwrap_err().kind, ErrorKind::DataLoss);
        assert_eq!(
            body_length(MAX_MESSAGE_SIZE + 1).unwrap_err().kind,
            ErrorKind::DataLoss
        );
    }

    #[test]
    fn derived_keys_are_distinct_windows() {
        let keys = derive_keys(b"shared secret", b"transcript").unwrap();
        assert_ne!(keys.send_key, keys.recv_key);
        assert_ne!(&keys.challenge[..], &keys.send_key[..20]);

        let again = derive_keys(b"shared secret", b"transcript").unwrap();
        assert_eq!(keys.send_key, again.send_key);
        assert_eq!(keys.challenge, again.challenge);
    }

    #[test]
    fn embedded_server_key_is_valid() {
        let key = server_key().unwrap();
        assert_eq!(rsa::traits::PublicKeyParts::size(&key), 256);
    }
}
