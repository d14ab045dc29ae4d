//! Concurrent download orchestration.
//!
//! A [`DownloadCoordinator`] runs a fixed pool of worker threads over a
//! shared FIFO queue of [`DownloadParam`]s. Each worker drives one download
//! at a time through the [`Pipeline`]:
//!
//! 1. Resolve the CDN URLs of the file
//! 2. Resolve the content key through the shared [`KeyCache`]
//! 3. Open the first URL that works, decrypting while streaming when an AES
//!    key is known
//! 4. Drain the stream into the output file
//! 5. Decrypt DRM protected files with the external tool
//! 6. Hand the file to the metadata [`Tagger`]
//!
//! Workers never touch shared state directly. They publish [`Update`]s over
//! a channel to an observer thread that keeps the set of active downloads
//! and wakes anyone blocked in [`DownloadCoordinator::wait_for_change`].
//!
//! Downloads that have not started yet can be cancelled. A running
//! download always runs to completion or failure; a panic inside the
//! pipeline counts as a failure.

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    fmt,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender, SyncSender},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    downloader::{Download, Downloader},
    error::{Error, Result},
    key_provider::{KeyCache, KeyProvider, KeySource},
    metadata::{LogTagger, Tagger},
    postprocess::Mp4Decrypt,
    resolve::CdnResolver,
    stream::{self, StreamOpener},
    track::Track,
};

/// Identifies a download for the lifetime of a coordinator.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DownloadId(u64);

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of work.
pub struct DownloadParam {
    pub track: Track,
    pub path: PathBuf,

    /// Provider of the content key. Without one the file is downloaded as
    /// served.
    pub key_provider: Option<Arc<dyn KeyProvider>>,

    pub emulate_playback: bool,

    /// Live playback consumer of the downloaded bytes.
    pub playback: Option<SyncSender<Vec<u8>>>,
}

impl DownloadParam {
    #[must_use]
    pub fn new(track: Track, path: impl Into<PathBuf>) -> Self {
        Self {
            track,
            path: path.into(),
            key_provider: None,
            emulate_playback: false,
            playback: None,
        }
    }

    #[must_use]
    pub fn with_key_provider(mut self, provider: Arc<dyn KeyProvider>) -> Self {
        self.key_provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_playback_emulation(mut self, emulate_playback: bool) -> Self {
        self.emulate_playback = emulate_playback;
        self
    }

    #[must_use]
    pub fn with_playback(mut self, sink: SyncSender<Vec<u8>>) -> Self {
        self.playback = Some(sink);
        self
    }
}

impl fmt::Debug for DownloadParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadParam")
            .field("track", &self.track)
            .field("path", &self.path)
            .field(
                "key_provider",
                &self.key_provider.as_ref().map(|provider| provider.source()),
            )
            .field("emulate_playback", &self.emulate_playback)
            .field("playback", &self.playback.is_some())
            .finish()
    }
}

/// State transition of a download.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Queued,
    Started { track: Track, path: PathBuf },
    Progress { bytes: u64, total: u64 },
    Finished { path: PathBuf },
    Failed { error: String },
}

/// An [`Event`] of one download.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub id: DownloadId,
    pub event: Event,
}

/// Progress of an active download.
#[derive(Clone, Debug)]
pub struct Progress {
    pub track: Track,
    pub path: PathBuf,
    pub bytes: u64,
    pub total: u64,
    pub started: Instant,
}

impl Progress {
    /// Fraction done, from 0.0 to 1.0.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.bytes as f64 / self.total as f64) as f32
    }

    /// Estimated time left at the average rate so far.
    #[must_use]
    pub fn eta(&self) -> Option<Duration> {
        eta(self.bytes, self.total, self.started.elapsed())
    }
}

/// Time to transfer the rest of `total` at the rate of `bytes` in `elapsed`.
#[must_use]
#[expect(clippy::cast_precision_loss)]
pub fn eta(bytes: u64, total: u64, elapsed: Duration) -> Option<Duration> {
    if bytes == 0 || elapsed.is_zero() {
        return None;
    }
    let remaining = total.saturating_sub(bytes) as f64;
    let rate = bytes as f64 / elapsed.as_secs_f64();
    Some(Duration::from_secs_f64(remaining / rate))
}

/// Final result of a download.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    pub id: DownloadId,
    pub track: Track,
    pub result: std::result::Result<PathBuf, String>,
}

/// Shared steps of every download.
pub struct Pipeline {
    cdn: Arc<dyn CdnResolver>,
    opener: Arc<dyn StreamOpener>,
    keys: KeyCache,
    decrypt: Mp4Decrypt,
    tagger: Arc<dyn Tagger>,
}

impl Pipeline {
    #[must_use]
    pub fn new(cdn: Arc<dyn CdnResolver>, opener: Arc<dyn StreamOpener>) -> Self {
        Self {
            cdn,
            opener,
            keys: KeyCache::new(),
            decrypt: Mp4Decrypt::default(),
            tagger: Arc::new(LogTagger),
        }
    }

    #[must_use]
    pub fn with_decrypt(mut self, decrypt: Mp4Decrypt) -> Self {
        self.decrypt = decrypt;
        self
    }

    #[must_use]
    pub fn with_tagger(mut self, tagger: Arc<dyn Tagger>) -> Self {
        self.tagger = tagger;
        self
    }

    #[must_use]
    pub fn keys(&self) -> &KeyCache {
        &self.keys
    }

    /// Downloads `param`, calling `report` with position and size as the
    /// file is written.
    ///
    /// # Errors
    ///
    /// Returns an error if no URL could be resolved or opened, key
    /// resolution failed, or the download itself failed. Decryption and
    /// tagging failures are logged only.
    pub fn run<F>(&self, param: DownloadParam, report: F) -> Result<Download>
    where
        F: FnMut(u64, u64),
    {
        let DownloadParam {
            track,
            path,
            key_provider,
            emulate_playback,
            playback,
        } = param;

        let urls = self.cdn.cdn_urls(track.file_id())?;

        let key = match key_provider {
            Some(ref provider) => {
                let key = self.keys.get_or_resolve(provider.source(), track.gid(), || {
                    provider.resolve(track.gid(), track.file_id())
                })?;
                if key.is_none() {
                    warn!(
                        "{track}: no key from {} provider, downloading as served",
                        provider.source()
                    );
                }
                key
            }
            None => None,
        };

        let is_cdm = key_provider
            .as_ref()
            .is_some_and(|provider| provider.source() == KeySource::Cdm);
        let aes_key = if is_cdm {
            None
        } else {
            key.as_ref().and_then(|key| key.aes())
        };

        let mut stream = stream::open_first(&*self.opener, &urls, aes_key)?;

        let mut downloader = Downloader::new(track.clone(), path)
            .with_playback_emulation(emulate_playback);
        if let Some(sink) = playback {
            downloader = downloader.with_playback(sink);
        }
        let download = downloader.download_with(&mut *stream, report)?;

        if let Some(cdm_keys) = key.as_ref().and_then(|key| key.cdm_keys()) {
            if let Err(e) = self.decrypt.decrypt(&download.path, cdm_keys) {
                warn!("{track}: left encrypted: {e}");
            }
        }

        if let Err(e) = self
            .tagger
            .tag(&track, &download.path, download.replay_gain)
        {
            warn!("{track}: tagging failed: {e}");
        }

        Ok(download)
    }
}

#[derive(Default)]
struct Queue {
    items: VecDeque<(DownloadId, DownloadParam)>,
    closed: bool,
}

/// Blocking FIFO shared by the workers.
#[derive(Default)]
struct WorkQueue {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl WorkQueue {
    fn push(&self, id: DownloadId, param: DownloadParam) -> Result<()> {
        let mut queue = self.queue.lock()?;
        if queue.closed {
            return Err(Error::failed_precondition("download queue is closed"));
        }
        queue.items.push_back((id, param));
        self.available.notify_one();
        Ok(())
    }

    /// Waits for the next item. Returns `None` once the queue is closed and
    /// empty.
    fn pop(&self) -> Option<(DownloadId, DownloadParam)> {
        let mut queue = self.queue.lock().ok()?;
        loop {
            if let Some(item) = queue.items.pop_front() {
                return Some(item);
            }
            if queue.closed {
                return None;
            }
            queue = self.available.wait(queue).ok()?;
        }
    }

    fn close(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.closed = true;
        }
        self.available.notify_all();
    }

    fn drain(&self) -> Vec<(DownloadId, DownloadParam)> {
        self.queue
            .lock()
            .map(|mut queue| queue.items.drain(..).collect())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<(DownloadId, Track)> {
        self.queue
            .lock()
            .map(|queue| {
                queue
                    .items
                    .iter()
                    .map(|(id, param)| (*id, param.track.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct State {
    active: HashMap<DownloadId, Progress>,
    outcomes: Vec<Outcome>,
    submitted: usize,
    generation: u64,
}

/// Aggregated view kept by the observer thread.
#[derive(Default)]
struct Observed {
    state: Mutex<State>,
    changed: Condvar,
}

impl Observed {
    fn apply(&self, update: Update) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        let id = update.id;
        match update.event {
            Event::Queued => trace!("{id}: queued"),
            Event::Started { track, path } => {
                info!("{id}: downloading {track}");
                state.active.insert(
                    id,
                    Progress {
                        track,
                        path,
                        bytes: 0,
                        total: 0,
                        started: Instant::now(),
                    },
                );
            }
            Event::Progress { bytes, total } => {
                if let Some(progress) = state.active.get_mut(&id) {
                    progress.bytes = bytes;
                    progress.total = total;
                }
            }
            Event::Finished { path } => {
                if let Some(progress) = state.active.remove(&id) {
                    info!("{id}: finished {}", progress.track);
                    state.outcomes.push(Outcome {
                        id,
                        track: progress.track,
                        result: Ok(path),
                    });
                }
            }
            Event::Failed { error } => {
                if let Some(progress) = state.active.remove(&id) {
                    state.outcomes.push(Outcome {
                        id,
                        track: progress.track,
                        result: Err(error),
                    });
                }
            }
        }

        state.generation += 1;
        self.changed.notify_all();
    }
}

/// Pool of download workers.
pub struct DownloadCoordinator {
    queue: Arc<WorkQueue>,
    observed: Arc<Observed>,
    events: Option<Sender<Update>>,
    next_id: AtomicU64,

    workers: Vec<JoinHandle<()>>,
    observer: Option<JoinHandle<()>>,
}

impl DownloadCoordinator {
    /// Starts `workers` threads running `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for zero workers, or an error if a thread
    /// cannot be spawned.
    pub fn new(workers: usize, pipeline: Pipeline) -> Result<Self> {
        if workers == 0 {
            return Err(Error::invalid_argument("need at least one worker"));
        }

        let queue = Arc::new(WorkQueue::default());
        let observed = Arc::new(Observed::default());
        let pipeline = Arc::new(pipeline);
        let (events, updates) = mpsc::channel();

        let observer = {
            let observed = Arc::clone(&observed);
            thread::Builder::new()
                .name("download-observer".to_owned())
                .spawn(move || observe(&updates, &observed))?
        };

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let queue = Arc::clone(&queue);
            let pipeline = Arc::clone(&pipeline);
            let events = events.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("download-{i}"))
                    .spawn(move || work(&queue, &pipeline, &events))?,
            );
        }
        debug!("started {workers} download workers");

        Ok(Self {
            queue,
            observed,
            events: Some(events),
            next_id: AtomicU64::new(1),
            workers: handles,
            observer: Some(observer),
        })
    }

    /// Queues a download.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator is shutting down.
    pub fn enqueue(&self, param: DownloadParam) -> Result<DownloadId> {
        let id = DownloadId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.observed.state.lock()?.submitted += 1;
        if let Err(e) = self.queue.push(id, param) {
            self.observed.state.lock()?.submitted -= 1;
            return Err(e);
        }

        if let Some(ref events) = self.events {
            let _ = events.send(Update {
                id,
                event: Event::Queued,
            });
        }
        Ok(id)
    }

    /// Downloads that have not started.
    #[must_use]
    pub fn queued(&self) -> Vec<(DownloadId, Track)> {
        self.queue.snapshot()
    }

    /// Drops every download that has not started, returning their ids.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn cancel_queued(&self) -> Result<Vec<DownloadId>> {
        let cancelled = self.queue.drain();

        let mut state = self.observed.state.lock()?;
        let ids = cancelled
            .into_iter()
            .map(|(id, param)| {
                info!("{id}: cancelled {}", param.track);
                state.outcomes.push(Outcome {
                    id,
                    track: param.track,
                    result: Err("cancelled".to_owned()),
                });
                id
            })
            .collect();
        state.generation += 1;
        self.observed.changed.notify_all();

        Ok(ids)
    }

    /// Snapshot of the running downloads.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn active(&self) -> Result<Vec<(DownloadId, Progress)>> {
        let state = self.observed.state.lock()?;
        let mut active: Vec<_> = state
            .active
            .iter()
            .map(|(id, progress)| (*id, progress.clone()))
            .collect();
        active.sort_by_key(|(id, _)| *id);
        Ok(active)
    }

    /// Results of downloads that ended, in order of completion.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn outcomes(&self) -> Result<Vec<Outcome>> {
        Ok(self.observed.state.lock()?.outcomes.clone())
    }

    /// Blocks until a download changes state or `timeout` passes. Returns
    /// whether anything changed.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn wait_for_change(&self, timeout: Duration) -> Result<bool> {
        let state = self.observed.state.lock()?;
        let generation = state.generation;
        let (state, _) = self
            .observed
            .changed
            .wait_timeout_while(state, timeout, |state| state.generation == generation)?;
        Ok(state.generation != generation)
    }

    /// Blocks until every queued download ended, returning all outcomes.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn wait_idle(&self) -> Result<Vec<Outcome>> {
        let state = self.observed.state.lock()?;
        let state = self
            .observed
            .changed
            .wait_while(state, |state| state.outcomes.len() < state.submitted)?;
        Ok(state.outcomes.clone())
    }

    /// Stops accepting work, finishes started downloads and joins all
    /// threads. Queued downloads still run.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.queue.close();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("download worker panicked");
            }
        }

        self.events = None;
        if let Some(observer) = self.observer.take() {
            let _ = observer.join();
        }
    }
}

impl Drop for DownloadCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn work(queue: &WorkQueue, pipeline: &Pipeline, events: &Sender<Update>) {
    let publish = |id, event| {
        let _ = events.send(Update { id, event });
    };

    while let Some((id, param)) = queue.pop() {
        publish(
            id,
            Event::Started {
                track: param.track.clone(),
                path: param.path.clone(),
            },
        );

        let track = param.track.clone();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            pipeline.run(param, |bytes, total| {
                publish(id, Event::Progress { bytes, total });
            })
        }))
        .unwrap_or_else(|payload| Err(Error::internal(panic_message(&*payload))));

        match result {
            Ok(download) => publish(
                id,
                Event::Finished {
                    path: download.path,
                },
            ),
            Err(e) => {
                error!("{id}: {track} failed: {e}");
                publish(
                    id,
                    Event::Failed {
                        error: e.to_string(),
                    },
                );
            }
        }
    }

    trace!("{} exiting", thread::current().name().unwrap_or("worker"));
}

/// Message of a caught panic.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown cause"
    };
    format!("download panicked: {message}")
}

fn observe(updates: &Receiver<Update>, observed: &Observed) {
    for update in updates {
        observed.apply(update);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::atomic::AtomicUsize,
    };

    use url::Url;

    use super::*;
    use crate::{
        decrypt::Key,
        key_provider::ContentKey,
        stream::{
            testing::{sample, MemorySource},
            ChunkedStream, EncryptedChunkedStream, MediaStream,
        },
        track::{AudioFormat, FileId, Gid},
    };

    const KEY: [u8; 16] = [0x5a; 16];

    fn track(gid: u8, file: u8) -> Track {
        Track::new(
            Gid::from_bytes(&[gid; 16]),
            FileId::from_bytes(&[file; 20]),
            Duration::from_secs(5),
            AudioFormat::MP3_320,
        )
    }

    struct FixedCdn;

    impl CdnResolver for FixedCdn {
        fn cdn_urls(&self, file_id: &FileId) -> Result<Vec<Url>> {
            if file_id[0] == 0xff {
                return Err(Error::not_found("no cdn urls"));
            }
            Ok(vec![
                "https://refused.example/a".parse()?,
                format!("https://cdn.example/{}", file_id.to_hex()).parse()?,
            ])
        }
    }

    /// Serves every file encrypted with `KEY`.
    struct EncryptedCdn {
        plain: Vec<u8>,
    }

    impl StreamOpener for EncryptedCdn {
        fn open(&self, url: &Url, key: Option<Key>) -> Result<Box<dyn MediaStream>> {
            if url.host_str() == Some("refused.example") {
                return Err(Error::unavailable("connection refused"));
            }

            let mut data = self.plain.clone();
            Key::new(KEY).apply_keystream(0, &mut data);
            let source = MemorySource::new(data);
            Ok(match key {
                Some(key) => Box::new(EncryptedChunkedStream::open(source, key, 0)?),
                None => Box::new(ChunkedStream::open(source, 0)?),
            })
        }
    }

    struct CountingProvider {
        calls: AtomicUsize,
    }

    impl KeyProvider for CountingProvider {
        fn source(&self) -> KeySource {
            KeySource::Channel
        }

        fn resolve(&self, _gid: &Gid, _file_id: &FileId) -> Result<Option<ContentKey>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            Ok(Some(ContentKey::Aes(Key::new(KEY))))
        }
    }

    fn pipeline(plain: &[u8]) -> Pipeline {
        Pipeline::new(
            Arc::new(FixedCdn),
            Arc::new(EncryptedCdn {
                plain: plain.to_vec(),
            }),
        )
    }

    #[test]
    fn workers_share_resolved_keys() {
        let plain = sample(300_000);
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });

        let coordinator = DownloadCoordinator::new(2, pipeline(&plain)).unwrap();
        for file in 1..=2 {
            let param = DownloadParam::new(track(1, file), dir.path().join(format!("{file}.mp3")))
                .with_key_provider(Arc::clone(&provider) as Arc<dyn KeyProvider>);
            coordinator.enqueue(param).unwrap();
        }

        let outcomes = coordinator.wait_idle().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|outcome| outcome.result.is_ok()));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        for file in 1..=2 {
            assert_eq!(fs::read(dir.path().join(format!("{file}.mp3"))).unwrap(), plain);
        }
        assert!(coordinator.active().unwrap().is_empty());
        coordinator.shutdown();
    }

    struct PanickingProvider;

    impl KeyProvider for PanickingProvider {
        fn source(&self) -> KeySource {
            KeySource::Channel
        }

        fn resolve(&self, _gid: &Gid, _file_id: &FileId) -> Result<Option<ContentKey>> {
            panic!("key service exploded");
        }
    }

    #[test]
    fn panicking_download_is_reported_failed() {
        let plain = sample(1000);
        let dir = tempfile::tempdir().unwrap();

        let coordinator = DownloadCoordinator::new(1, pipeline(&plain)).unwrap();
        let panicking = coordinator
            .enqueue(
                DownloadParam::new(track(1, 1), dir.path().join("bad.mp3"))
                    .with_key_provider(Arc::new(PanickingProvider)),
            )
            .unwrap();
        let working = coordinator
            .enqueue(DownloadParam::new(track(2, 2), dir.path().join("good.mp3")))
            .unwrap();

        let outcomes = coordinator.wait_idle().unwrap();
        assert_eq!(outcomes.len(), 2);

        let failed = outcomes.iter().find(|outcome| outcome.id == panicking).unwrap();
        let error = failed.result.clone().unwrap_err();
        assert!(error.contains("key service exploded"), "{error}");

        let succeeded = outcomes.iter().find(|outcome| outcome.id == working).unwrap();
        assert!(succeeded.result.is_ok());
        assert!(coordinator.active().unwrap().is_empty());
        coordinator.shutdown();
    }

    #[test]
    fn failure_does_not_stop_other_downloads() {
        let plain = sample(1000);
        let dir = tempfile::tempdir().unwrap();

        let coordinator = DownloadCoordinator::new(1, pipeline(&plain)).unwrap();
        let failing = coordinator
            .enqueue(DownloadParam::new(track(1, 0xff), dir.path().join("bad.mp3")))
            .unwrap();
        let working = coordinator
            .enqueue(DownloadParam::new(track(2, 2), dir.path().join("good.mp3")))
            .unwrap();

        let outcomes = coordinator.wait_idle().unwrap();
        let result = |id| {
            outcomes
                .iter()
                .find(|outcome| outcome.id == id)
                .map(|outcome| outcome.result.clone())
                .unwrap()
        };

        assert!(result(failing).unwrap_err().starts_with("not found"));
        assert_eq!(result(working).unwrap(), dir.path().join("good.mp3"));

        // Without a key the file is written as served.
        let written = fs::read(dir.path().join("good.mp3")).unwrap();
        assert_eq!(written.len(), plain.len());
        assert_ne!(written, plain);
    }

    #[test]
    fn queue_closes_and_drains() {
        let queue = WorkQueue::default();
        let param = |n| DownloadParam::new(track(n, n), format!("{n}.mp3"));
        queue.push(DownloadId(1), param(1)).unwrap();
        queue.push(DownloadId(2), param(2)).unwrap();

        assert_eq!(
            queue.snapshot().iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            [DownloadId(1), DownloadId(2)]
        );
        assert_eq!(queue.pop().map(|(id, _)| id), Some(DownloadId(1)));
        assert_eq!(queue.drain().len(), 1);

        queue.close();
        assert!(queue.pop().is_none());
        assert!(queue.push(DownloadId(3), param(3)).is_err());
    }

    #[test]
    fn wait_for_change_times_out() {
        let coordinator = DownloadCoordinator::new(1, pipeline(&[])).unwrap();
        assert!(!coordinator
            .wait_for_change(Duration::from_millis(10))
            .unwrap());
        assert!(coordinator.queued().is_empty());
        assert!(coordinator.cancel_queued().unwrap().is_empty());
    }

    #[test]
    fn eta_follows_average_rate() {
        assert_eq!(eta(0, 100, Duration::from_secs(1)), None);
        assert_eq!(
            eta(25, 100, Duration::from_secs(1)),
            Some(Duration::from_secs(3))
        );
        assert_eq!(eta(100, 100, Duration::from_secs(4)), Some(Duration::ZERO));
    }
}
