//! Handoff of finished downloads to a metadata tagger.

use std::path::Path;

use crate::{
    error::Result,
    track::{ReplayGain, Track},
};

/// Writes metadata into downloaded files.
///
/// Tagging is best effort: the coordinator logs failures and still counts
/// the download as finished.
pub trait Tagger: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the file could not be tagged.
    fn tag(&self, track: &Track, path: &Path, replay_gain: Option<ReplayGain>) -> Result<()>;
}

/// Logs the handoff instead of tagging.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogTagger;

impl Tagger for LogTagger {
    fn tag(&self, track: &Track, path: &Path, replay_gain: Option<ReplayGain>) -> Result<()> {
        match replay_gain {
            Some(gain) => info!(
                "{track}: {} (track gain {:.2} dB, peak {:.4})",
                path.display(),
                gain.track_gain,
                gain.track_peak
            ),
            None => info!("{track}: {}", path.display()),
        }
        Ok(())
    }
}
