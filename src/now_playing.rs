//! Canonical now-playing snapshot and its projection to OS surfaces.
//!
//! The projector owns the merged snapshot built from partial updates,
//! reconciles positions through the tracker, and pushes projections to the
//! OS widget (via the `NowPlayingWidget` port) and to any connected
//! head-unit scene. All surface mutation is resequenced onto the
//! UI-affinity executor.

use std::sync::{Arc, Mutex, Weak};

use image::DynamicImage;
use log::debug;

use crate::artwork_cache::{ArtworkApply, ArtworkCache};
use crate::executor::MainExecutor;
use crate::navigation::{NowPlayingMedia, NowPlayingRefresher};
use crate::position_tracker::PositionTracker;
use crate::protocol::{ArtworkRef, SnapshotDelta};
use crate::remote_commands::SharedTransportState;
use crate::scene_registry::SceneRegistry;

/// Title shown when a track is known but carries no usable title.
pub const PLACEHOLDER_TITLE: &str = "Now Playing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetPlaybackState {
    Stopped,
    Paused,
    Playing,
}

/// Everything the OS widget needs for one render.
#[derive(Clone, Default)]
pub struct ProjectedInfo {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_secs: Option<f64>,
    pub elapsed_secs: f64,
    pub playback_rate: f64,
    pub artwork: Option<Arc<DynamicImage>>,
}

impl ProjectedInfo {
    /// A forced refresh skips an empty projection so it never wipes the
    /// widget; a normal publish pushes it through.
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.artwork.is_none()
    }
}

/// Rendering port for the OS now-playing widget.
pub trait NowPlayingWidget: Send {
    fn set_info(&mut self, info: &ProjectedInfo);
    fn clear_info(&mut self);
    fn set_playback_state(&mut self, state: WidgetPlaybackState);
}

pub type SharedWidget = Arc<Mutex<Box<dyn NowPlayingWidget>>>;

#[derive(Default)]
struct PlaybackSnapshot {
    track_id: Option<String>,
    epoch: i64,
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    duration_secs: f64,
    is_playing: bool,
    liked: bool,
    artwork_ref: Option<ArtworkRef>,
    artwork_image: Option<Arc<DynamicImage>>,
}

impl PlaybackSnapshot {
    fn has_track(&self) -> bool {
        self.track_id.is_some()
    }
}

pub type SharedProjector = Arc<Mutex<NowPlayingProjector>>;

pub struct NowPlayingProjector {
    snapshot: PlaybackSnapshot,
    position: PositionTracker,
    widget: SharedWidget,
    executor: Arc<dyn MainExecutor>,
    scenes: Arc<SceneRegistry>,
    transport: SharedTransportState,
    artwork: Option<Arc<ArtworkCache>>,
}

impl NowPlayingProjector {
    pub fn new(
        widget: Box<dyn NowPlayingWidget>,
        executor: Arc<dyn MainExecutor>,
        scenes: Arc<SceneRegistry>,
        transport: SharedTransportState,
    ) -> SharedProjector {
        Arc::new(Mutex::new(NowPlayingProjector {
            snapshot: PlaybackSnapshot::default(),
            position: PositionTracker::new(),
            widget: Arc::new(Mutex::new(widget)),
            executor,
            scenes,
            transport,
            artwork: None,
        }))
    }

    /// The cache is built after the projector (its apply callback points
    /// back here), so it is attached in a second step.
    pub fn attach_artwork_cache(&mut self, cache: Arc<ArtworkCache>) {
        self.artwork = Some(cache);
    }

    /// Merges one partial update into the snapshot and republishes.
    ///
    /// A track change resets the position tracker and drops the held
    /// artwork before the delta's own fields apply, so nothing from the
    /// previous track leaks into the new one. An epoch change resets the
    /// tracker only.
    pub fn ingest(&mut self, delta: &SnapshotDelta) {
        if let Some(track_id) = &delta.track_id {
            if self.snapshot.track_id.as_deref() != Some(track_id.as_str()) {
                self.position.reset();
                self.snapshot.artwork_image = None;
                self.snapshot.artwork_ref = None;
                if let Some(cache) = &self.artwork {
                    cache.invalidate();
                }
                self.snapshot.track_id = Some(track_id.clone());
            }
        }
        if let Some(epoch) = delta.epoch {
            if epoch != self.snapshot.epoch {
                self.position.reset();
                self.snapshot.epoch = epoch;
            }
        }
        if let Some(title) = &delta.title {
            self.snapshot.title = Some(title.clone());
        }
        if let Some(artist) = &delta.artist {
            self.snapshot.artist = Some(artist.clone());
        }
        if let Some(album) = &delta.album {
            self.snapshot.album = Some(album.clone());
        }
        if let Some(duration) = delta.duration {
            self.snapshot.duration_secs = if duration.is_finite() {
                duration.max(0.0)
            } else {
                0.0
            };
        }
        if let Some(is_playing) = delta.is_playing {
            self.snapshot.is_playing = is_playing;
        }
        if let Some(liked) = delta.liked {
            self.snapshot.liked = liked;
        }
        if let Some(position) = delta.position {
            self.position.apply(position);
        }
        if let Some(bytes) = &delta.artwork_bytes {
            if !bytes.is_empty() {
                match image::load_from_memory(bytes) {
                    Ok(decoded) => {
                        self.snapshot.artwork_image = Some(Arc::new(decoded));
                        self.snapshot.artwork_ref = None;
                        if let Some(cache) = &self.artwork {
                            cache.invalidate();
                        }
                    }
                    Err(error) => debug!("NowPlayingProjector: inline artwork decode failed: {error}"),
                }
            }
        }

        self.update_transport_state();
        self.publish(false);
        self.project_to_head_unit();

        // URL fetches start last so the widget update never waits on them.
        if let Some(url) = &delta.artwork_url {
            if !url.is_empty() {
                let target = ArtworkRef {
                    url: url.clone(),
                    token: delta.token.clone(),
                };
                if self.snapshot.artwork_ref.as_ref() != Some(&target) {
                    self.snapshot.artwork_ref = Some(target.clone());
                    if let Some(cache) = &self.artwork {
                        cache.fetch(target);
                    }
                }
            }
        }
    }

    /// Empties the snapshot and stops both surfaces.
    pub fn clear(&mut self) {
        self.snapshot = PlaybackSnapshot::default();
        self.position.reset();
        if let Some(cache) = &self.artwork {
            cache.invalidate();
        }
        self.update_transport_state();

        let widget = self.widget.clone();
        self.executor.dispatch(Box::new(move || {
            let mut widget = lock_widget(&widget);
            widget.clear_info();
            widget.set_playback_state(WidgetPlaybackState::Stopped);
        }));

        let scenes = self.scenes.clone();
        self.executor.dispatch(Box::new(move || {
            if let Some(nav) = scenes.head_unit() {
                let mut nav = match nav.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                nav.clear_now_playing_item();
                nav.update_now_playing_buttons(false, false);
                nav.update_now_playing_visibility(false);
            }
        }));
    }

    /// Republishes the current snapshot. `force` first drops the widget to
    /// stopped so a stuck OS cache re-reads everything.
    pub fn refresh(&mut self, force: bool) {
        self.publish(force);
        self.project_to_head_unit();
    }

    /// Completion path for a URL artwork fetch. The snapshot may have
    /// moved on while the fetch ran, so the identity is re-checked here.
    pub fn apply_fetched_artwork(&mut self, target: &ArtworkRef, image: Arc<DynamicImage>) {
        if self.snapshot.artwork_ref.as_ref() != Some(target) {
            debug!("NowPlayingProjector: dropping artwork for superseded ref {}", target.url);
            return;
        }
        self.snapshot.artwork_image = Some(image);
        self.publish(false);
        self.project_to_head_unit();
    }

    fn publish(&mut self, force: bool) {
        let info = self.build_projection();
        if force && info.is_empty() {
            return;
        }
        let state = if self.snapshot.is_playing {
            WidgetPlaybackState::Playing
        } else {
            WidgetPlaybackState::Paused
        };
        let widget = self.widget.clone();
        self.executor.dispatch(Box::new(move || {
            let mut widget = lock_widget(&widget);
            if force {
                widget.set_playback_state(WidgetPlaybackState::Stopped);
            }
            widget.set_info(&info);
            widget.set_playback_state(state);
        }));
    }

    fn build_projection(&self) -> ProjectedInfo {
        let title = normalize(&self.snapshot.title);
        let artist = normalize(&self.snapshot.artist);
        let album = normalize(&self.snapshot.album);
        // A known duration or a reported position identifies a track just
        // as well as text metadata; a position-only snapshot still shows
        // the placeholder with its elapsed time.
        let has_metadata = title.is_some()
            || artist.is_some()
            || album.is_some()
            || self.snapshot.artwork_image.is_some()
            || self.snapshot.duration_secs > 0.0
            || self.position.last_published().is_some();
        let title = match title {
            Some(title) => Some(title),
            None if has_metadata => Some(PLACEHOLDER_TITLE.to_string()),
            None => None,
        };
        ProjectedInfo {
            title,
            artist,
            album,
            duration_secs: (self.snapshot.duration_secs > 0.0).then_some(self.snapshot.duration_secs),
            elapsed_secs: self.position.last_published().unwrap_or(0.0),
            playback_rate: if self.snapshot.is_playing { 1.0 } else { 0.0 },
            artwork: self.snapshot.artwork_image.clone(),
        }
    }

    fn project_to_head_unit(&self) {
        let has_track = self.snapshot.has_track();
        let media = NowPlayingMedia {
            title: self.snapshot.title.clone(),
            artist: self.snapshot.artist.clone(),
            album: self.snapshot.album.clone(),
            artwork: self.snapshot.artwork_image.clone(),
        };
        let liked = self.snapshot.liked;
        let scenes = self.scenes.clone();
        self.executor.dispatch(Box::new(move || {
            if let Some(nav) = scenes.head_unit() {
                let mut nav = match nav.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if has_track {
                    nav.update_now_playing_item(media);
                } else {
                    nav.clear_now_playing_item();
                }
                nav.update_now_playing_buttons(liked, has_track);
                nav.update_now_playing_visibility(has_track);
            }
        }));
    }

    fn update_transport_state(&self) {
        let mut transport = match self.transport.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        transport.is_playing = self.snapshot.is_playing;
        transport.liked = self.snapshot.liked;
        transport.has_track = self.snapshot.has_track();
    }
}

fn normalize(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn lock_widget(widget: &SharedWidget) -> std::sync::MutexGuard<'_, Box<dyn NowPlayingWidget>> {
    match widget.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Builds the artwork-cache apply callback for a projector. The callback
/// holds the projector weakly and resequences onto the executor.
pub fn artwork_apply_for(
    projector: &SharedProjector,
    executor: Arc<dyn MainExecutor>,
) -> ArtworkApply {
    let weak = Arc::downgrade(projector);
    Arc::new(move |target: ArtworkRef, image: Arc<DynamicImage>| {
        let weak = weak.clone();
        executor.dispatch(Box::new(move || {
            if let Some(projector) = weak.upgrade() {
                let mut projector = match projector.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                projector.apply_fetched_artwork(&target, image);
            }
        }));
    })
}

/// `NowPlayingRefresher` handed to the navigation state machine. Always
/// dispatches, so the navigation lock is never held while the projector
/// lock is taken.
pub struct ProjectorRefresher {
    projector: Weak<Mutex<NowPlayingProjector>>,
    executor: Arc<dyn MainExecutor>,
}

impl ProjectorRefresher {
    pub fn new(projector: &SharedProjector, executor: Arc<dyn MainExecutor>) -> Self {
        ProjectorRefresher {
            projector: Arc::downgrade(projector),
            executor,
        }
    }
}

impl NowPlayingRefresher for ProjectorRefresher {
    fn refresh(&self, force: bool) {
        let weak = self.projector.clone();
        self.executor.dispatch(Box::new(move || {
            if let Some(projector) = weak.upgrade() {
                let mut projector = match projector.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                projector.refresh(force);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ManualExecutor;
    use crate::remote_commands::{transport_snapshot, TransportState};
    use std::io::Cursor;

    #[derive(Debug, Clone, PartialEq)]
    enum WidgetCall {
        SetInfo {
            title: Option<String>,
            artist: Option<String>,
            elapsed: f64,
            rate: f64,
            has_artwork: bool,
        },
        Clear,
        State(WidgetPlaybackState),
    }

    #[derive(Clone, Default)]
    struct FakeWidget {
        calls: Arc<Mutex<Vec<WidgetCall>>>,
    }

    impl FakeWidget {
        fn calls(&self) -> Vec<WidgetCall> {
            self.calls.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }
    }

    impl NowPlayingWidget for FakeWidget {
        fn set_info(&mut self, info: &ProjectedInfo) {
            self.calls.lock().unwrap().push(WidgetCall::SetInfo {
                title: info.title.clone(),
                artist: info.artist.clone(),
                elapsed: info.elapsed_secs,
                rate: info.playback_rate,
                has_artwork: info.artwork.is_some(),
            });
        }

        fn clear_info(&mut self) {
            self.calls.lock().unwrap().push(WidgetCall::Clear);
        }

        fn set_playback_state(&mut self, state: WidgetPlaybackState) {
            self.calls.lock().unwrap().push(WidgetCall::State(state));
        }
    }

    struct Fixture {
        projector: SharedProjector,
        widget: FakeWidget,
        executor: Arc<ManualExecutor>,
        transport: SharedTransportState,
    }

    fn fixture() -> Fixture {
        let widget = FakeWidget::default();
        let executor = Arc::new(ManualExecutor::new());
        let transport = Arc::new(Mutex::new(TransportState::default()));
        let projector = NowPlayingProjector::new(
            Box::new(widget.clone()),
            executor.clone(),
            Arc::new(SceneRegistry::new()),
            transport.clone(),
        );
        Fixture {
            projector,
            widget,
            executor,
            transport,
        }
    }

    fn delta(json: serde_json::Value) -> SnapshotDelta {
        serde_json::from_value(json).expect("valid delta")
    }

    fn ingest(fx: &Fixture, json: serde_json::Value) {
        fx.projector.lock().unwrap().ingest(&delta(json));
        fx.executor.drain();
    }

    fn last_set_info(fx: &Fixture) -> WidgetCall {
        fx.widget
            .calls()
            .into_iter()
            .filter(|c| matches!(c, WidgetCall::SetInfo { .. }))
            .last()
            .expect("expected a publish")
    }

    fn png_bytes_base64() -> String {
        use base64::Engine as _;
        let image = image::RgbaImage::from_pixel(1, 1, image::Rgba([1, 2, 3, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("png encode");
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_ingest_merges_fields_and_publishes() {
        let fx = fixture();
        ingest(
            &fx,
            serde_json::json!({
                "trackId": "t1",
                "title": "Song",
                "artist": "Artist",
                "isPlaying": true,
                "position": 12.0,
            }),
        );
        assert_eq!(
            last_set_info(&fx),
            WidgetCall::SetInfo {
                title: Some("Song".to_string()),
                artist: Some("Artist".to_string()),
                elapsed: 12.0,
                rate: 1.0,
                has_artwork: false,
            }
        );
        assert!(fx
            .widget
            .calls()
            .contains(&WidgetCall::State(WidgetPlaybackState::Playing)));

        // A later partial update keeps the merged fields.
        fx.widget.clear();
        ingest(&fx, serde_json::json!({ "isPlaying": false }));
        let WidgetCall::SetInfo { title, rate, .. } = last_set_info(&fx) else {
            panic!("expected publish");
        };
        assert_eq!(title.as_deref(), Some("Song"));
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn test_position_only_snapshot_publishes_placeholder_with_elapsed() {
        let fx = fixture();
        ingest(
            &fx,
            serde_json::json!({ "trackId": "t1", "epoch": 1, "title": "", "position": 10.0 }),
        );
        assert_eq!(
            last_set_info(&fx),
            WidgetCall::SetInfo {
                title: Some(PLACEHOLDER_TITLE.to_string()),
                artist: None,
                elapsed: 10.0,
                rate: 0.0,
                has_artwork: false,
            }
        );

        // Tolerance still applies to the published elapsed time.
        ingest(&fx, serde_json::json!({ "position": 9.5 }));
        let WidgetCall::SetInfo { elapsed, .. } = last_set_info(&fx) else {
            panic!("expected publish");
        };
        assert_eq!(elapsed, 9.5);
        ingest(&fx, serde_json::json!({ "position": 5.0 }));
        let WidgetCall::SetInfo { elapsed, .. } = last_set_info(&fx) else {
            panic!("expected publish");
        };
        assert_eq!(elapsed, 9.5);
    }

    #[test]
    fn test_duration_only_snapshot_publishes_placeholder() {
        let fx = fixture();
        ingest(&fx, serde_json::json!({ "trackId": "t1", "duration": 200.0 }));
        let WidgetCall::SetInfo { title, .. } = last_set_info(&fx) else {
            panic!("expected publish");
        };
        assert_eq!(title.as_deref(), Some(PLACEHOLDER_TITLE));
    }

    #[test]
    fn test_placeholder_title_requires_some_metadata() {
        let fx = fixture();
        ingest(&fx, serde_json::json!({ "trackId": "t1", "artist": "Artist" }));
        let WidgetCall::SetInfo { title, .. } = last_set_info(&fx) else {
            panic!("expected publish");
        };
        assert_eq!(title.as_deref(), Some(PLACEHOLDER_TITLE));
    }

    #[test]
    fn test_position_never_jumps_backward_within_a_track() {
        let fx = fixture();
        ingest(
            &fx,
            serde_json::json!({ "trackId": "t1", "title": "Song", "position": 30.0 }),
        );
        ingest(&fx, serde_json::json!({ "position": 5.0 }));
        let WidgetCall::SetInfo { elapsed, .. } = last_set_info(&fx) else {
            panic!("expected publish");
        };
        assert_eq!(elapsed, 30.0);
    }

    #[test]
    fn test_track_change_resets_position() {
        let fx = fixture();
        ingest(
            &fx,
            serde_json::json!({ "trackId": "t1", "title": "Song", "position": 100.0 }),
        );
        ingest(
            &fx,
            serde_json::json!({ "trackId": "t2", "title": "Next", "position": 2.0 }),
        );
        let WidgetCall::SetInfo { elapsed, .. } = last_set_info(&fx) else {
            panic!("expected publish");
        };
        assert_eq!(elapsed, 2.0);
    }

    #[test]
    fn test_epoch_change_resets_position_without_track_change() {
        let fx = fixture();
        ingest(
            &fx,
            serde_json::json!({ "trackId": "t1", "title": "Song", "epoch": 1, "position": 100.0 }),
        );
        ingest(&fx, serde_json::json!({ "epoch": 2, "position": 4.0 }));
        let WidgetCall::SetInfo { elapsed, .. } = last_set_info(&fx) else {
            panic!("expected publish");
        };
        assert_eq!(elapsed, 4.0);
    }

    #[test]
    fn test_inline_artwork_wins_and_track_change_drops_it() {
        let fx = fixture();
        ingest(
            &fx,
            serde_json::json!({
                "trackId": "t1",
                "title": "Song",
                "artworkBytes": png_bytes_base64(),
            }),
        );
        let WidgetCall::SetInfo { has_artwork, .. } = last_set_info(&fx) else {
            panic!("expected publish");
        };
        assert!(has_artwork);

        // Nothing from the previous track may survive a track change.
        ingest(&fx, serde_json::json!({ "trackId": "t2", "title": "Next" }));
        let WidgetCall::SetInfo { has_artwork, .. } = last_set_info(&fx) else {
            panic!("expected publish");
        };
        assert!(!has_artwork);
    }

    #[test]
    fn test_fetched_artwork_applies_only_for_current_ref() {
        let fx = fixture();
        ingest(
            &fx,
            serde_json::json!({
                "trackId": "t1",
                "title": "Song",
                "artworkUrl": "http://a/one.png",
            }),
        );
        let image = Arc::new(DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            1,
            1,
            image::Rgba([0, 0, 0, 255]),
        )));

        // Stale identity is dropped.
        fx.projector.lock().unwrap().apply_fetched_artwork(
            &ArtworkRef {
                url: "http://a/zero.png".to_string(),
                token: None,
            },
            image.clone(),
        );
        fx.executor.drain();
        let WidgetCall::SetInfo { has_artwork, .. } = last_set_info(&fx) else {
            panic!("expected publish");
        };
        assert!(!has_artwork);

        // Current identity applies.
        fx.projector.lock().unwrap().apply_fetched_artwork(
            &ArtworkRef {
                url: "http://a/one.png".to_string(),
                token: None,
            },
            image,
        );
        fx.executor.drain();
        let WidgetCall::SetInfo { has_artwork, .. } = last_set_info(&fx) else {
            panic!("expected publish");
        };
        assert!(has_artwork);
    }

    #[test]
    fn test_transport_state_follows_snapshot() {
        let fx = fixture();
        ingest(
            &fx,
            serde_json::json!({ "trackId": "t1", "title": "Song", "isPlaying": true, "liked": true }),
        );
        let state = transport_snapshot(&fx.transport);
        assert!(state.is_playing);
        assert!(state.liked);
        assert!(state.has_track);
    }

    #[test]
    fn test_clear_stops_widget_and_resets_transport() {
        let fx = fixture();
        ingest(&fx, serde_json::json!({ "trackId": "t1", "title": "Song" }));
        fx.widget.clear();

        fx.projector.lock().unwrap().clear();
        fx.executor.drain();
        let calls = fx.widget.calls();
        assert_eq!(
            calls,
            vec![
                WidgetCall::Clear,
                WidgetCall::State(WidgetPlaybackState::Stopped)
            ]
        );
        assert!(!transport_snapshot(&fx.transport).has_track);

        // A forced refresh of the now-empty snapshot must not wipe the
        // widget again.
        fx.widget.clear();
        fx.projector.lock().unwrap().refresh(true);
        fx.executor.drain();
        assert!(fx.widget.calls().is_empty());
    }

    #[test]
    fn test_forced_refresh_drops_to_stopped_first() {
        let fx = fixture();
        ingest(
            &fx,
            serde_json::json!({ "trackId": "t1", "title": "Song", "isPlaying": true }),
        );
        fx.widget.clear();

        fx.projector.lock().unwrap().refresh(true);
        fx.executor.drain();
        let calls = fx.widget.calls();
        assert_eq!(calls[0], WidgetCall::State(WidgetPlaybackState::Stopped));
        assert!(matches!(calls[1], WidgetCall::SetInfo { .. }));
        assert_eq!(calls[2], WidgetCall::State(WidgetPlaybackState::Playing));
    }
}
