//! Drains a media stream into a file.
//!
//! The downloader reads through a buffer holding about [`BUFFER_SECONDS`]
//! of audio at the track's average bitrate, so read-ahead follows the
//! bitrate rather than a fixed byte count. Each filled buffer is written to
//! the output file and, when a playback sink is attached, the same bytes are
//! pushed to it as they are read. With playback emulation the downloader
//! sleeps for as long as the written bytes take to play.
//!
//! Ogg Vorbis files start with a service header of
//! [`AudioCodec::OGG_HEADER_SKIP`] bytes that is not part of the
//! container and is skipped when the stream is decrypted, after reading its
//! replay gain values. Encrypted files are written whole so they can be
//! decrypted from offset 0 later.

use std::{
    fs::{self, File},
    io::{Read, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::SyncSender,
        Arc,
    },
    thread,
    time::Duration,
};

use crate::{
    error::Result,
    stream::{MediaStream, CHUNK_SIZE},
    track::{AudioCodec, ReplayGain, Track},
};

/// Seconds of audio buffered between stream and file.
pub const BUFFER_SECONDS: u64 = 3;

/// Outcome of a finished download.
#[derive(Clone, Debug, PartialEq)]
pub struct Download {
    pub path: PathBuf,

    /// Bytes written to the file.
    pub bytes: u64,

    /// Replay gain from the stream header, for decrypted Ogg Vorbis only.
    pub replay_gain: Option<ReplayGain>,

    /// Codec detected from the written bytes, or the track's codec when the
    /// stream is encrypted or unrecognized.
    pub codec: AudioCodec,
}

/// Downloads one track to a file.
#[derive(Debug)]
pub struct Downloader {
    track: Track,
    path: PathBuf,
    emulate_playback: bool,
    playback: Option<SyncSender<Vec<u8>>>,

    position: AtomicU64,
    size: AtomicU64,
    finished: Arc<AtomicBool>,
}

impl Downloader {
    #[must_use]
    pub fn new(track: Track, path: impl Into<PathBuf>) -> Self {
        Self {
            track,
            path: path.into(),
            emulate_playback: false,
            playback: None,
            position: AtomicU64::new(0),
            size: AtomicU64::new(0),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Paces writes at playback speed.
    #[must_use]
    pub fn with_playback_emulation(mut self, emulate_playback: bool) -> Self {
        self.emulate_playback = emulate_playback;
        self
    }

    /// Pushes every read to `sink` as well. An empty buffer marks the end of
    /// the stream.
    #[must_use]
    pub fn with_playback(mut self, sink: SyncSender<Vec<u8>>) -> Self {
        self.playback = Some(sink);
        self
    }

    #[must_use]
    pub fn track(&self) -> &Track {
        &self.track
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Signal set once the download ended, successfully or not.
    #[must_use]
    pub fn finished(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.finished)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Fraction of the stream read so far, from 0.0 to 1.0.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f32 {
        let size = self.size.load(Ordering::Relaxed);
        if size == 0 {
            return 0.0;
        }
        (self.position.load(Ordering::Relaxed) as f64 / size as f64) as f32
    }

    /// Downloads `stream` to the output file.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be read or the file cannot be
    /// written.
    pub fn download(&mut self, stream: &mut dyn MediaStream) -> Result<Download> {
        self.download_with(stream, |_, _| {})
    }

    /// Like [`download`](Self::download), calling `report` with the stream
    /// position and size after every write.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be read or the file cannot be
    /// written.
    pub fn download_with<F>(&mut self, stream: &mut dyn MediaStream, report: F) -> Result<Download>
    where
        F: FnMut(u64, u64),
    {
        let result = self.drain(stream, report);

        stream.close();
        if let Some(sink) = self.playback.take() {
            let _ = sink.send(Vec::new());
        }
        self.finished.store(true, Ordering::Release);

        result
    }

    fn drain<F>(&mut self, stream: &mut dyn MediaStream, mut report: F) -> Result<Download>
    where
        F: FnMut(u64, u64),
    {
        let size = stream.size();
        self.size.store(size, Ordering::Relaxed);

        let bytes_per_second = bytes_per_second(size, self.track.duration());
        let capacity = usize::try_from(BUFFER_SECONDS * bytes_per_second).unwrap_or(usize::MAX);
        debug!(
            "{}: {size} bytes at {bytes_per_second} B/s, buffering {capacity} bytes",
            self.track
        );

        let mut replay_gain = None;
        let mut codec = self.track.codec();
        if stream.is_decrypted() {
            if codec == AudioCodec::OggVorbis {
                match stream.replay_gain() {
                    Ok(gain) => replay_gain = Some(gain),
                    Err(e) => warn!("{}: no replay gain: {e}", self.track),
                }
                stream.seek(SeekFrom::Start(AudioCodec::OGG_HEADER_SKIP.min(size)))?;
            }
            codec = self.sniff(stream)?;
        } else if codec == AudioCodec::OggVorbis {
            warn!(
                "{}: stream is encrypted, keeping the {} byte header at offset 0",
                self.track,
                AudioCodec::OGG_HEADER_SKIP
            );
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&self.path)?;

        #[expect(clippy::cast_possible_truncation)]
        let mut chunk = vec![0; CHUNK_SIZE as usize];
        let mut buffer = Vec::with_capacity(capacity.min(size as usize));
        let mut written = 0;
        let mut eof = false;

        while !eof {
            while buffer.len() < capacity {
                let want = chunk.len().min(capacity - buffer.len());
                let read = stream.read(&mut chunk[..want])?;
                if read == 0 {
                    eof = true;
                    break;
                }

                self.forward(&chunk[..read]);
                buffer.extend_from_slice(&chunk[..read]);
                self.position.store(stream.position(), Ordering::Relaxed);
            }

            if !buffer.is_empty() {
                file.write_all(&buffer)?;
                written += buffer.len() as u64;
                report(stream.position(), size);

                if self.emulate_playback {
                    thread::sleep(playback_time(buffer.len() as u64, bytes_per_second));
                }
                buffer.clear();
            }
        }

        file.flush()?;
        info!("{}: wrote {written} bytes to {}", self.track, self.path.display());

        Ok(Download {
            path: self.path.clone(),
            bytes: written,
            replay_gain,
            codec,
        })
    }

    /// Detects the codec from the bytes at the current position and seeks
    /// back.
    fn sniff(&self, stream: &mut dyn MediaStream) -> Result<AudioCodec> {
        let start = stream.position();
        let mut head = Vec::with_capacity(AudioCodec::SNIFF_LENGTH);
        Read::take(&mut *stream, AudioCodec::SNIFF_LENGTH as u64).read_to_end(&mut head)?;
        stream.seek(SeekFrom::Start(start))?;

        let expected = self.track.codec();
        Ok(match AudioCodec::sniff(&head) {
            AudioCodec::Unknown => expected,
            sniffed => {
                if sniffed != expected {
                    warn!("{}: expected {expected} but found {sniffed}", self.track);
                }
                sniffed
            }
        })
    }

    fn forward(&mut self, bytes: &[u8]) {
        if let Some(ref sink) = self.playback {
            if sink.send(bytes.to_vec()).is_err() {
                debug!("{}: playback receiver hung up", self.track);
                self.playback = None;
            }
        }
    }
}

/// Average bytes per second of a stream of `size` bytes lasting `duration`.
#[must_use]
#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn bytes_per_second(size: u64, duration: Duration) -> u64 {
    let seconds = duration.as_secs_f64();
    if seconds <= 0.0 {
        return size.max(1);
    }
    ((size as f64 / seconds).ceil() as u64).max(1)
}

#[expect(clippy::cast_precision_loss)]
fn playback_time(bytes: u64, bytes_per_second: u64) -> Duration {
    Duration::from_secs_f64(bytes as f64 / bytes_per_second as f64)
}
