//! OS media controls adapter (MPRIS/SMTC/Now Playing) via `souvlaki`.
//!
//! Implements the `NowPlayingWidget` port over platform media controls and
//! feeds control events back through the remote command router.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use log::warn;
use souvlaki::{MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, MediaPosition};

use crate::now_playing::{NowPlayingWidget, ProjectedInfo, WidgetPlaybackState};
use crate::remote_commands::{RemoteCommandRouter, TransportIntent};

const MEDIA_CONTROLS_DISPLAY_NAME: &str = "Tonebridge";
const MEDIA_CONTROLS_DBUS_NAME: &str = "tonebridge";
const ARTWORK_FILE_NAME: &str = "now_playing_artwork.png";

/// `NowPlayingWidget` backed by the OS media controls surface.
pub struct SouvlakiNowPlayingWidget {
    controls: Option<MediaControls>,
    artwork_export_path: Option<PathBuf>,
    last_elapsed: f64,
}

impl SouvlakiNowPlayingWidget {
    pub fn new(router: Arc<RemoteCommandRouter>) -> Self {
        let controls = Self::create_controls(router);
        let artwork_export_path =
            dirs::cache_dir().map(|dir| dir.join("tonebridge").join(ARTWORK_FILE_NAME));
        SouvlakiNowPlayingWidget {
            controls,
            artwork_export_path,
            last_elapsed: 0.0,
        }
    }

    #[cfg(not(target_os = "windows"))]
    fn create_controls(router: Arc<RemoteCommandRouter>) -> Option<MediaControls> {
        if !router.mark_attached() {
            warn!("SouvlakiNowPlayingWidget: media controls already attached");
            return None;
        }

        let mut controls = match MediaControls::new(souvlaki::PlatformConfig {
            display_name: MEDIA_CONTROLS_DISPLAY_NAME,
            dbus_name: MEDIA_CONTROLS_DBUS_NAME,
            hwnd: None,
        }) {
            Ok(controls) => controls,
            Err(err) => {
                warn!(
                    "SouvlakiNowPlayingWidget: failed to create media controls backend: {:?}",
                    err
                );
                return None;
            }
        };

        if let Err(err) = controls.attach(move |event| {
            if let Some(intent) = map_media_event(event) {
                router.handle_intent(intent);
            }
        }) {
            warn!(
                "SouvlakiNowPlayingWidget: failed to attach media controls handler: {:?}",
                err
            );
            return None;
        }

        Some(controls)
    }

    #[cfg(target_os = "windows")]
    fn create_controls(_router: Arc<RemoteCommandRouter>) -> Option<MediaControls> {
        // Souvlaki requires an HWND on Windows, which the bridge has no
        // window to provide.
        warn!("SouvlakiNowPlayingWidget: Windows media controls are disabled without an HWND");
        None
    }

    /// SMTC and MPRIS want a cover URL rather than bytes, so the decoded
    /// artwork is written to the cache directory and referenced by file
    /// URL.
    fn export_artwork(&self, artwork: &Arc<DynamicImage>) -> Option<String> {
        let path = self.artwork_export_path.as_ref()?;
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!("SouvlakiNowPlayingWidget: failed to create artwork dir: {err}");
                return None;
            }
        }
        if let Err(err) = artwork.save(path) {
            warn!("SouvlakiNowPlayingWidget: failed to export artwork: {err}");
            return None;
        }
        Some(format!("file://{}", path.display()))
    }
}

impl NowPlayingWidget for SouvlakiNowPlayingWidget {
    fn set_info(&mut self, info: &ProjectedInfo) {
        self.last_elapsed = info.elapsed_secs;
        let cover_url = info
            .artwork
            .as_ref()
            .and_then(|artwork| self.export_artwork(artwork));
        let Some(controls) = self.controls.as_mut() else {
            return;
        };
        let metadata = MediaMetadata {
            title: info.title.as_deref(),
            artist: info.artist.as_deref(),
            album: info.album.as_deref(),
            cover_url: cover_url.as_deref(),
            duration: info.duration_secs.map(Duration::from_secs_f64),
        };
        if let Err(err) = controls.set_metadata(metadata) {
            warn!("SouvlakiNowPlayingWidget: failed to publish metadata: {:?}", err);
        }
    }

    fn clear_info(&mut self) {
        self.last_elapsed = 0.0;
        let Some(controls) = self.controls.as_mut() else {
            return;
        };
        if let Err(err) = controls.set_metadata(MediaMetadata::default()) {
            warn!("SouvlakiNowPlayingWidget: failed to clear metadata: {:?}", err);
        }
    }

    fn set_playback_state(&mut self, state: WidgetPlaybackState) {
        let Some(controls) = self.controls.as_mut() else {
            return;
        };
        let progress = Some(MediaPosition(Duration::from_secs_f64(
            self.last_elapsed.max(0.0),
        )));
        let playback = match state {
            WidgetPlaybackState::Stopped => MediaPlayback::Stopped,
            WidgetPlaybackState::Paused => MediaPlayback::Paused { progress },
            WidgetPlaybackState::Playing => MediaPlayback::Playing { progress },
        };
        if let Err(err) = controls.set_playback(playback) {
            warn!(
                "SouvlakiNowPlayingWidget: failed to publish playback state {:?}: {:?}",
                state, err
            );
        }
    }
}

/// Maps an OS control event to a transport intent. Toggle stays a toggle;
/// the router resolves it against the last known playing flag. All seek
/// shapes become scrub intents, which the router reports as unsupported.
fn map_media_event(event: MediaControlEvent) -> Option<TransportIntent> {
    match event {
        MediaControlEvent::Play => Some(TransportIntent::Play),
        MediaControlEvent::Pause => Some(TransportIntent::Pause),
        MediaControlEvent::Toggle => Some(TransportIntent::TogglePlayPause),
        MediaControlEvent::Next => Some(TransportIntent::Next),
        MediaControlEvent::Previous => Some(TransportIntent::Previous),
        MediaControlEvent::SetPosition(position) => {
            Some(TransportIntent::ScrubToPosition(position.0.as_secs_f64()))
        }
        MediaControlEvent::Seek(_) | MediaControlEvent::SeekBy(_, _) => {
            Some(TransportIntent::ScrubToPosition(0.0))
        }
        MediaControlEvent::Stop
        | MediaControlEvent::SetVolume(_)
        | MediaControlEvent::OpenUri(_)
        | MediaControlEvent::Raise
        | MediaControlEvent::Quit => None,
    }
}
