//! Head-unit navigation state machine.
//!
//! Owns the template tree shown on an in-vehicle display: a Home/Library
//! tab root when authorized, a single placeholder when logged out, pushed
//! Artists/Albums/Playlists lists, and the now-playing overlay. Rendering
//! goes through the `HeadUnitSurface` port, data comes from the
//! application layer through the `AppClient` port, and every mutation runs
//! on the UI-affinity executor.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use image::DynamicImage;
use log::{debug, warn};
use tokio::sync::broadcast;

use crate::executor::MainExecutor;
use crate::now_playing::PLACEHOLDER_TITLE;
use crate::protocol::{LibraryStatus, ListEntry, Message, PlaybackAction, RemoteCommand};

/// Forced projection refresh after opening now-playing, matching the
/// moment the overlay animation settles.
pub const NOW_PLAYING_OPEN_REFRESH_DELAY: Duration = Duration::from_millis(250);

const LOADING_TEXT: &str = "Loading…";
const ERROR_TEXT: &str = "Connect to a server";

const ROW_ARTISTS: &str = "artists";
const ROW_PLAYLISTS: &str = "playlists";
const ROW_LIKED: &str = "liked";

pub type TemplateId = u64;

/// Glyph shown next to a list row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowIcon {
    Home,
    Artists,
    Playlists,
    Heart,
    Shuffle,
    Filter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    pub detail: Option<String>,
    pub enabled: bool,
    pub icon: Option<RowIcon>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Home,
    Library,
}

/// One rendered list template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSnapshot {
    pub id: TemplateId,
    pub title: String,
    pub tab: Option<Tab>,
    pub rows: Vec<ListRow>,
    pub shows_now_playing_button: bool,
}

/// Metadata the projector hands over for the now-playing overlay item.
#[derive(Clone, Default)]
pub struct NowPlayingMedia {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub artwork: Option<Arc<DynamicImage>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NowPlayingButton {
    Like { filled: bool },
}

/// Rendering port for the head-unit display.
pub trait HeadUnitSurface: Send {
    fn set_root(&mut self, tabs: Vec<TemplateSnapshot>);
    fn push(&mut self, template: TemplateSnapshot);
    fn replace_rows(&mut self, id: TemplateId, rows: Vec<ListRow>);
    fn set_now_playing_button(&mut self, id: TemplateId, visible: bool);
    fn show_now_playing(&mut self);
    fn set_now_playing_item(
        &mut self,
        title: String,
        detail: String,
        artwork: Option<Arc<DynamicImage>>,
    );
    fn set_now_playing_buttons(&mut self, buttons: Vec<NowPlayingButton>);
}

pub type ListResult = Result<Vec<ListEntry>, String>;
pub type ListCallback = Box<dyn FnOnce(ListResult) + Send>;
pub type StatusCallback = Box<dyn FnOnce(LibraryStatus) + Send>;
pub type AuthCallback = Box<dyn FnOnce(bool) + Send>;

/// Data port into the application layer. Every call completes through its
/// callback, possibly on an arbitrary thread.
pub trait AppClient: Send + Sync {
    fn get_home_actions(&self, done: ListCallback);
    fn get_artists(&self, done: ListCallback);
    fn get_albums(&self, artist_id: &str, done: ListCallback);
    fn get_playlists(&self, done: ListCallback);
    fn get_library_status(&self, done: StatusCallback);
    fn get_auth_state(&self, done: AuthCallback);
}

/// Lets the state machine ask for a now-playing projection refresh
/// without holding a strong handle on the projector.
pub trait NowPlayingRefresher: Send + Sync {
    fn refresh(&self, force: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Home,
    Library,
    Artists,
    Albums,
    Playlists,
    LoggedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    HomeActions,
    Artists,
    Albums,
    Playlists,
}

impl FetchKind {
    fn empty_text(self) -> &'static str {
        match self {
            FetchKind::HomeActions => "No actions available",
            FetchKind::Artists => "No artists found",
            FetchKind::Albums => "No albums found",
            FetchKind::Playlists => "No playlists found",
        }
    }
}

#[derive(Debug)]
struct ListNode {
    id: TemplateId,
    kind: NodeKind,
    title: String,
    rows: Vec<ListRow>,
}

#[derive(Debug)]
enum RootState {
    Uninitialized,
    Authorized { home: ListNode, library: ListNode },
    LoggedOut { placeholder: ListNode },
}

pub struct NavigationStateMachine {
    self_weak: Weak<Mutex<NavigationStateMachine>>,
    surface: Box<dyn HeadUnitSurface>,
    client: Arc<dyn AppClient>,
    executor: Arc<dyn MainExecutor>,
    bus_producer: broadcast::Sender<Message>,
    refresher: Arc<dyn NowPlayingRefresher>,
    root: RootState,
    stack: Vec<ListNode>,
    authorized: bool,
    now_playing_button_visible: bool,
    now_playing_on_top: bool,
    next_template_id: TemplateId,
}

impl NavigationStateMachine {
    pub fn new(
        surface: Box<dyn HeadUnitSurface>,
        client: Arc<dyn AppClient>,
        executor: Arc<dyn MainExecutor>,
        bus_producer: broadcast::Sender<Message>,
        refresher: Arc<dyn NowPlayingRefresher>,
    ) -> Arc<Mutex<NavigationStateMachine>> {
        Arc::new_cyclic(|weak| {
            Mutex::new(NavigationStateMachine {
                self_weak: weak.clone(),
                surface,
                client,
                executor,
                bus_producer,
                refresher,
                root: RootState::Uninitialized,
                stack: Vec::new(),
                authorized: false,
                now_playing_button_visible: false,
                now_playing_on_top: false,
                next_template_id: 1,
            })
        })
    }

    /// Scene connection. Renders the logged-out placeholder right away so
    /// the display is never empty, then asks the application layer for the
    /// real auth state and for a forced projection refresh.
    pub fn connect(&mut self) {
        self.set_auth_state_forced(false);
        let weak = self.self_weak.clone();
        let executor = self.executor.clone();
        self.client.get_auth_state(Box::new(move |authorized| {
            executor.dispatch(Box::new(move || {
                if let Some(nav) = weak.upgrade() {
                    lock_nav(&nav).set_auth_state(authorized);
                }
            }));
        }));
        self.refresher.refresh(true);
    }

    /// Scene teardown. Drops all templates so a later reconnect starts
    /// from a clean tree.
    pub fn disconnect(&mut self) {
        self.root = RootState::Uninitialized;
        self.stack.clear();
        self.now_playing_on_top = false;
    }

    /// Applies an auth signal. The very first signal always builds a root;
    /// afterwards only an actual transition rebuilds the tree.
    pub fn set_auth_state(&mut self, authorized: bool) {
        if !matches!(self.root, RootState::Uninitialized) && authorized == self.authorized {
            return;
        }
        self.rebuild_root(authorized);
    }

    pub fn set_auth_state_forced(&mut self, authorized: bool) {
        self.rebuild_root(authorized);
    }

    fn rebuild_root(&mut self, authorized: bool) {
        self.authorized = authorized;
        self.stack.clear();
        self.now_playing_on_top = false;
        if authorized {
            let home = ListNode {
                id: self.alloc_id(),
                kind: NodeKind::Home,
                title: "Home".to_string(),
                rows: loading_rows(),
            };
            let library = ListNode {
                id: self.alloc_id(),
                kind: NodeKind::Library,
                title: "Library".to_string(),
                rows: library_rows(false, LOADING_TEXT),
            };
            self.surface.set_root(vec![
                template_for(&home, Some(Tab::Home), self.now_playing_button_visible),
                template_for(&library, Some(Tab::Library), self.now_playing_button_visible),
            ]);
            let home_id = home.id;
            self.root = RootState::Authorized { home, library };
            self.client
                .get_home_actions(self.list_callback(home_id, FetchKind::HomeActions));
            self.request_library_status();
        } else {
            self.now_playing_button_visible = false;
            let placeholder = ListNode {
                id: self.alloc_id(),
                kind: NodeKind::LoggedOut,
                title: "Tonebridge".to_string(),
                rows: vec![ListRow {
                    id: "logged-out".to_string(),
                    title: "Not logged into server".to_string(),
                    detail: Some("Open the app to log in".to_string()),
                    enabled: false,
                    icon: Some(RowIcon::Home),
                }],
            };
            self.surface
                .set_root(vec![template_for(&placeholder, None, false)]);
            self.root = RootState::LoggedOut { placeholder };
        }
    }

    /// Row selection from the display. Unknown or dead template ids are
    /// ignored; they belong to a tree that has already been replaced.
    pub fn handle_row_selected(&mut self, template_id: TemplateId, row_id: &str) {
        let Some((kind, row)) = self.find_live_row(template_id, row_id) else {
            debug!("Navigation: selection on dead template {template_id}");
            return;
        };
        if !row.enabled {
            return;
        }
        match kind {
            NodeKind::Home => self.handle_home_action(&row.id),
            NodeKind::Library => match row.id.as_str() {
                ROW_ARTISTS => self.push_artists(),
                ROW_PLAYLISTS => self.push_playlists(),
                ROW_LIKED => {
                    self.send_action(PlaybackAction::PlayLiked);
                    self.show_now_playing();
                }
                _ => {}
            },
            NodeKind::Artists => self.push_albums(row.id.clone(), row.title.clone()),
            NodeKind::Albums => {
                self.send_action(PlaybackAction::PlayAlbum { album_id: row.id });
                self.show_now_playing();
            }
            NodeKind::Playlists => {
                self.send_action(PlaybackAction::PlayPlaylist { playlist_id: row.id });
                self.show_now_playing();
            }
            NodeKind::LoggedOut => {}
        }
    }

    fn handle_home_action(&mut self, action_id: &str) {
        let action = match action_id {
            "startLibraryShuffle" => PlaybackAction::StartLibraryShuffle,
            "startLikedShuffle" => PlaybackAction::StartLikedShuffle,
            "startCustomShuffle" => PlaybackAction::StartCustomShuffle,
            other => {
                debug!("Navigation: unknown home action {other}");
                return;
            }
        };
        self.send_action(action);
        self.show_now_playing();
    }

    /// Back navigation reported by the display after it already popped.
    pub fn handle_back(&mut self) {
        if self.now_playing_on_top {
            self.now_playing_on_top = false;
        } else {
            self.stack.pop();
        }
    }

    /// Presents the now-playing overlay unless it is already topmost, and
    /// schedules one forced projection refresh for after the transition.
    pub fn show_now_playing(&mut self) {
        if self.now_playing_on_top {
            return;
        }
        self.now_playing_on_top = true;
        self.surface.show_now_playing();
        let refresher = self.refresher.clone();
        self.executor.dispatch_after(
            NOW_PLAYING_OPEN_REFRESH_DELAY,
            Box::new(move || refresher.refresh(true)),
        );
    }

    pub fn update_now_playing_item(&mut self, media: NowPlayingMedia) {
        let title = media
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| PLACEHOLDER_TITLE.to_string());
        let artist = media
            .artist
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let album = media
            .album
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let detail = match (artist, album) {
            (Some(artist), Some(album)) => format!("{artist} • {album}"),
            (Some(artist), None) => artist,
            (None, Some(album)) => album,
            (None, None) => "Tap to open".to_string(),
        };
        self.surface.set_now_playing_item(title, detail, media.artwork);
    }

    pub fn clear_now_playing_item(&mut self) {
        self.surface.set_now_playing_item(
            PLACEHOLDER_TITLE.to_string(),
            "Tap to open".to_string(),
            None,
        );
    }

    pub fn update_now_playing_buttons(&mut self, liked: bool, available: bool) {
        let buttons = if available {
            vec![NowPlayingButton::Like { filled: liked }]
        } else {
            Vec::new()
        };
        self.surface.set_now_playing_buttons(buttons);
    }

    /// Recomputes the now-playing button and applies it to every live
    /// template, the topmost included.
    pub fn update_now_playing_visibility(&mut self, has_track: bool) {
        let visible = self.authorized && has_track;
        self.now_playing_button_visible = visible;
        for id in self.live_template_ids() {
            self.surface.set_now_playing_button(id, visible);
        }
    }

    /// Like button on the now-playing overlay.
    pub fn handle_now_playing_button(&mut self) {
        if self
            .bus_producer
            .send(Message::Remote(RemoteCommand::ToggleLike))
            .is_err()
        {
            warn!("Navigation: no bus receivers for like toggle");
        }
    }

    pub fn request_library_status(&self) {
        let weak = self.self_weak.clone();
        let executor = self.executor.clone();
        self.client.get_library_status(Box::new(move |status| {
            executor.dispatch(Box::new(move || {
                if let Some(nav) = weak.upgrade() {
                    lock_nav(&nav).apply_library_status(status);
                }
            }));
        }));
    }

    fn push_artists(&mut self) {
        let id = self.push_node(NodeKind::Artists, "Artists".to_string());
        self.client
            .get_artists(self.list_callback(id, FetchKind::Artists));
    }

    fn push_playlists(&mut self) {
        let id = self.push_node(NodeKind::Playlists, "Playlists".to_string());
        self.client
            .get_playlists(self.list_callback(id, FetchKind::Playlists));
    }

    fn push_albums(&mut self, artist_id: String, artist_title: String) {
        let id = self.push_node(NodeKind::Albums, artist_title);
        self.client
            .get_albums(&artist_id, self.list_callback(id, FetchKind::Albums));
    }

    /// Pushes a fresh node showing the loading row. Each push allocates a
    /// new template id, so a stale fetch can never target a re-entered
    /// screen.
    fn push_node(&mut self, kind: NodeKind, title: String) -> TemplateId {
        let node = ListNode {
            id: self.alloc_id(),
            kind,
            title,
            rows: loading_rows(),
        };
        self.surface
            .push(template_for(&node, None, self.now_playing_button_visible));
        let id = node.id;
        self.stack.push(node);
        id
    }

    fn list_callback(&self, id: TemplateId, kind: FetchKind) -> ListCallback {
        let weak = self.self_weak.clone();
        let executor = self.executor.clone();
        Box::new(move |result| {
            executor.dispatch(Box::new(move || {
                if let Some(nav) = weak.upgrade() {
                    lock_nav(&nav).apply_list_result(id, kind, result);
                }
            }));
        })
    }

    fn apply_list_result(&mut self, id: TemplateId, kind: FetchKind, result: ListResult) {
        if !self.is_live(id) {
            debug!("Navigation: discarding fetch result for dead template {id}");
            return;
        }
        let rows = match result {
            Err(error) => {
                debug!("Navigation: list fetch failed: {error}");
                vec![status_row(ERROR_TEXT)]
            }
            Ok(entries) if entries.is_empty() => vec![status_row(kind.empty_text())],
            Ok(entries) => entries
                .into_iter()
                .map(|entry| ListRow {
                    icon: match kind {
                        FetchKind::HomeActions => home_action_icon(&entry.id),
                        _ => None,
                    },
                    id: entry.id,
                    title: entry.title,
                    detail: entry.subtitle,
                    enabled: entry.enabled,
                })
                .collect(),
        };
        self.store_rows(id, rows.clone());
        self.surface.replace_rows(id, rows);
    }

    fn apply_library_status(&mut self, status: LibraryStatus) {
        let RootState::Authorized { library, .. } = &mut self.root else {
            return;
        };
        let (enabled, subtitle) = match (&status.error, status.liked_available) {
            (Some(_), _) => (false, ERROR_TEXT),
            (None, true) => (true, "Play from the top"),
            (None, false) => (false, "No liked songs yet"),
        };
        library.rows = library_rows(enabled, subtitle);
        let id = library.id;
        let rows = library.rows.clone();
        self.surface.replace_rows(id, rows);
    }

    fn send_action(&self, action: PlaybackAction) {
        if self.bus_producer.send(Message::Action(action)).is_err() {
            warn!("Navigation: no bus receivers for action");
        }
    }

    fn alloc_id(&mut self) -> TemplateId {
        let id = self.next_template_id;
        self.next_template_id += 1;
        id
    }

    fn live_template_ids(&self) -> Vec<TemplateId> {
        let mut ids = Vec::new();
        match &self.root {
            RootState::Uninitialized => {}
            RootState::Authorized { home, library } => {
                ids.push(home.id);
                ids.push(library.id);
            }
            RootState::LoggedOut { placeholder } => ids.push(placeholder.id),
        }
        ids.extend(self.stack.iter().map(|node| node.id));
        ids
    }

    fn is_live(&self, id: TemplateId) -> bool {
        self.live_template_ids().contains(&id)
    }

    fn find_live_row(&self, id: TemplateId, row_id: &str) -> Option<(NodeKind, ListRow)> {
        let node = match &self.root {
            RootState::Authorized { home, .. } if home.id == id => Some(home),
            RootState::Authorized { library, .. } if library.id == id => Some(library),
            RootState::LoggedOut { placeholder } if placeholder.id == id => Some(placeholder),
            _ => None,
        }
        .or_else(|| self.stack.iter().find(|node| node.id == id))?;
        let row = node.rows.iter().find(|row| row.id == row_id)?;
        Some((node.kind, row.clone()))
    }

    fn store_rows(&mut self, id: TemplateId, rows: Vec<ListRow>) {
        match &mut self.root {
            RootState::Authorized { home, .. } if home.id == id => {
                home.rows = rows;
                return;
            }
            RootState::Authorized { library, .. } if library.id == id => {
                library.rows = rows;
                return;
            }
            _ => {}
        }
        if let Some(node) = self.stack.iter_mut().find(|node| node.id == id) {
            node.rows = rows;
        }
    }
}

fn lock_nav(nav: &Arc<Mutex<NavigationStateMachine>>) -> std::sync::MutexGuard<'_, NavigationStateMachine> {
    match nav.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn template_for(node: &ListNode, tab: Option<Tab>, button: bool) -> TemplateSnapshot {
    TemplateSnapshot {
        id: node.id,
        title: node.title.clone(),
        tab,
        rows: node.rows.clone(),
        shows_now_playing_button: button,
    }
}

fn loading_rows() -> Vec<ListRow> {
    vec![status_row(LOADING_TEXT)]
}

fn status_row(text: &str) -> ListRow {
    ListRow {
        id: "status".to_string(),
        title: text.to_string(),
        detail: None,
        enabled: false,
        icon: None,
    }
}

fn library_rows(liked_enabled: bool, liked_subtitle: &str) -> Vec<ListRow> {
    vec![
        ListRow {
            id: ROW_ARTISTS.to_string(),
            title: "Artists".to_string(),
            detail: Some("Browse artists".to_string()),
            enabled: true,
            icon: Some(RowIcon::Artists),
        },
        ListRow {
            id: ROW_PLAYLISTS.to_string(),
            title: "Playlists".to_string(),
            detail: Some("Pick a playlist".to_string()),
            enabled: true,
            icon: Some(RowIcon::Playlists),
        },
        ListRow {
            id: ROW_LIKED.to_string(),
            title: "Liked Songs".to_string(),
            detail: Some(liked_subtitle.to_string()),
            enabled: liked_enabled,
            icon: Some(RowIcon::Heart),
        },
    ]
}

fn home_action_icon(action_id: &str) -> Option<RowIcon> {
    match action_id {
        "startLibraryShuffle" => Some(RowIcon::Shuffle),
        "startLikedShuffle" => Some(RowIcon::Heart),
        "startCustomShuffle" => Some(RowIcon::Filter),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ManualExecutor;
    use crate::scene_registry::{SceneId, SceneRegistry};

    #[derive(Debug, Clone, PartialEq)]
    enum SurfaceCall {
        SetRoot(Vec<TemplateSnapshot>),
        Push(TemplateSnapshot),
        ReplaceRows(TemplateId, Vec<ListRow>),
        SetNowPlayingButton(TemplateId, bool),
        ShowNowPlaying,
        SetNowPlayingItem(String, String, bool),
        SetNowPlayingButtons(Vec<NowPlayingButton>),
    }

    #[derive(Clone, Default)]
    struct FakeSurface {
        calls: Arc<Mutex<Vec<SurfaceCall>>>,
    }

    impl FakeSurface {
        fn calls(&self) -> Vec<SurfaceCall> {
            self.calls.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }
    }

    impl HeadUnitSurface for FakeSurface {
        fn set_root(&mut self, tabs: Vec<TemplateSnapshot>) {
            self.calls.lock().unwrap().push(SurfaceCall::SetRoot(tabs));
        }

        fn push(&mut self, template: TemplateSnapshot) {
            self.calls.lock().unwrap().push(SurfaceCall::Push(template));
        }

        fn replace_rows(&mut self, id: TemplateId, rows: Vec<ListRow>) {
            self.calls
                .lock()
                .unwrap()
                .push(SurfaceCall::ReplaceRows(id, rows));
        }

        fn set_now_playing_button(&mut self, id: TemplateId, visible: bool) {
            self.calls
                .lock()
                .unwrap()
                .push(SurfaceCall::SetNowPlayingButton(id, visible));
        }

        fn show_now_playing(&mut self) {
            self.calls.lock().unwrap().push(SurfaceCall::ShowNowPlaying);
        }

        fn set_now_playing_item(
            &mut self,
            title: String,
            detail: String,
            artwork: Option<Arc<DynamicImage>>,
        ) {
            self.calls.lock().unwrap().push(SurfaceCall::SetNowPlayingItem(
                title,
                detail,
                artwork.is_some(),
            ));
        }

        fn set_now_playing_buttons(&mut self, buttons: Vec<NowPlayingButton>) {
            self.calls
                .lock()
                .unwrap()
                .push(SurfaceCall::SetNowPlayingButtons(buttons));
        }
    }

    /// Stores the completion callbacks so tests control when and with what
    /// each outstanding request resolves.
    #[derive(Default)]
    struct FakeClient {
        home: Mutex<Vec<ListCallback>>,
        artists: Mutex<Vec<ListCallback>>,
        albums: Mutex<Vec<(String, ListCallback)>>,
        playlists: Mutex<Vec<ListCallback>>,
        status: Mutex<Vec<StatusCallback>>,
        auth: Mutex<Vec<AuthCallback>>,
    }

    impl FakeClient {
        fn resolve_home(&self, result: ListResult) {
            (self.home.lock().unwrap().remove(0))(result);
        }

        fn resolve_artists(&self, result: ListResult) {
            (self.artists.lock().unwrap().remove(0))(result);
        }

        fn resolve_albums(&self, result: ListResult) -> String {
            let (artist_id, done) = self.albums.lock().unwrap().remove(0);
            done(result);
            artist_id
        }

        fn resolve_status(&self, status: LibraryStatus) {
            (self.status.lock().unwrap().remove(0))(status);
        }

        fn resolve_auth(&self, authorized: bool) {
            (self.auth.lock().unwrap().remove(0))(authorized);
        }

        fn pending_artists(&self) -> usize {
            self.artists.lock().unwrap().len()
        }
    }

    impl AppClient for FakeClient {
        fn get_home_actions(&self, done: ListCallback) {
            self.home.lock().unwrap().push(done);
        }

        fn get_artists(&self, done: ListCallback) {
            self.artists.lock().unwrap().push(done);
        }

        fn get_albums(&self, artist_id: &str, done: ListCallback) {
            self.albums
                .lock()
                .unwrap()
                .push((artist_id.to_string(), done));
        }

        fn get_playlists(&self, done: ListCallback) {
            self.playlists.lock().unwrap().push(done);
        }

        fn get_library_status(&self, done: StatusCallback) {
            self.status.lock().unwrap().push(done);
        }

        fn get_auth_state(&self, done: AuthCallback) {
            self.auth.lock().unwrap().push(done);
        }
    }

    #[derive(Default)]
    struct RecordingRefresher {
        calls: Mutex<Vec<bool>>,
    }

    impl NowPlayingRefresher for RecordingRefresher {
        fn refresh(&self, force: bool) {
            self.calls.lock().unwrap().push(force);
        }
    }

    struct Fixture {
        nav: Arc<Mutex<NavigationStateMachine>>,
        surface: FakeSurface,
        client: Arc<FakeClient>,
        executor: Arc<ManualExecutor>,
        refresher: Arc<RecordingRefresher>,
        bus: broadcast::Receiver<Message>,
    }

    fn fixture() -> Fixture {
        let surface = FakeSurface::default();
        let client = Arc::new(FakeClient::default());
        let executor = Arc::new(ManualExecutor::new());
        let refresher = Arc::new(RecordingRefresher::default());
        let (producer, bus) = broadcast::channel(64);
        let nav = NavigationStateMachine::new(
            Box::new(surface.clone()),
            client.clone(),
            executor.clone(),
            producer,
            refresher.clone(),
        );
        Fixture {
            nav,
            surface,
            client,
            executor,
            refresher,
            bus,
        }
    }

    fn authorized_fixture() -> (Fixture, TemplateId, TemplateId) {
        let fx = fixture();
        fx.nav.lock().unwrap().set_auth_state(true);
        let calls = fx.surface.calls();
        let SurfaceCall::SetRoot(tabs) = &calls[0] else {
            panic!("expected root");
        };
        let home_id = tabs[0].id;
        let library_id = tabs[1].id;
        fx.surface.clear();
        (fx, home_id, library_id)
    }

    fn entry(id: &str, title: &str) -> ListEntry {
        ListEntry {
            id: id.to_string(),
            title: title.to_string(),
            subtitle: None,
            enabled: true,
            artwork_url: None,
            token: None,
        }
    }

    #[test]
    fn test_connect_renders_placeholder_then_authorized_root() {
        let fx = fixture();
        fx.nav.lock().unwrap().connect();

        let calls = fx.surface.calls();
        let SurfaceCall::SetRoot(tabs) = &calls[0] else {
            panic!("expected logged-out root");
        };
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].rows[0].title, "Not logged into server");
        assert!(!tabs[0].rows[0].enabled);
        assert_eq!(fx.refresher.calls.lock().unwrap().as_slice(), &[true]);

        fx.client.resolve_auth(true);
        fx.executor.drain();

        let calls = fx.surface.calls();
        let SurfaceCall::SetRoot(tabs) = calls.last().unwrap() else {
            panic!("expected authorized root");
        };
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].tab, Some(Tab::Home));
        assert_eq!(tabs[0].rows[0].title, "Loading…");
        assert!(!tabs[0].rows[0].enabled);
        assert_eq!(tabs[1].tab, Some(Tab::Library));
        assert_eq!(tabs[1].rows.len(), 3);
        assert_eq!(tabs[1].rows[2].detail.as_deref(), Some("Loading…"));
        assert!(!tabs[1].rows[2].enabled);
    }

    #[test]
    fn test_repeated_auth_signal_does_not_rebuild() {
        let (fx, _home, _library) = authorized_fixture();
        fx.nav.lock().unwrap().set_auth_state(true);
        assert!(fx.surface.calls().is_empty());
    }

    #[test]
    fn test_auth_loss_rebuilds_root_and_drops_stack() {
        let (fx, _home, library_id) = authorized_fixture();
        {
            let mut nav = fx.nav.lock().unwrap();
            nav.handle_row_selected(library_id, ROW_ARTISTS);
            nav.set_auth_state(false);
        }
        let calls = fx.surface.calls();
        let SurfaceCall::SetRoot(tabs) = calls.last().unwrap() else {
            panic!("expected logged-out root");
        };
        assert_eq!(tabs.len(), 1);
        assert!(!tabs[0].shows_now_playing_button);
    }

    #[test]
    fn test_home_actions_resolve_with_icons() {
        let (fx, home_id, _library) = authorized_fixture();
        fx.client.resolve_home(Ok(vec![
            entry("startLibraryShuffle", "Shuffle everything"),
            entry("startLikedShuffle", "Shuffle liked"),
        ]));
        fx.executor.drain();

        let calls = fx.surface.calls();
        let SurfaceCall::ReplaceRows(id, rows) = &calls[0] else {
            panic!("expected rows");
        };
        assert_eq!(*id, home_id);
        assert_eq!(rows[0].icon, Some(RowIcon::Shuffle));
        assert_eq!(rows[1].icon, Some(RowIcon::Heart));
        assert!(rows.iter().all(|row| row.enabled));
    }

    #[test]
    fn test_empty_and_failed_fetches_render_single_disabled_row() {
        let (fx, home_id, library_id) = authorized_fixture();
        fx.client.resolve_home(Ok(Vec::new()));
        fx.executor.drain();
        let calls = fx.surface.calls();
        assert_eq!(
            calls[0],
            SurfaceCall::ReplaceRows(home_id, vec![status_row("No actions available")])
        );

        fx.surface.clear();
        fx.nav
            .lock()
            .unwrap()
            .handle_row_selected(library_id, ROW_ARTISTS);
        fx.client.resolve_artists(Err("offline".to_string()));
        fx.executor.drain();
        let calls = fx.surface.calls();
        let SurfaceCall::ReplaceRows(_, rows) = calls.last().unwrap() else {
            panic!("expected rows");
        };
        assert_eq!(rows, &vec![status_row(ERROR_TEXT)]);
    }

    #[test]
    fn test_library_status_updates_liked_row() {
        let (fx, _home, library_id) = authorized_fixture();
        fx.client.resolve_status(LibraryStatus {
            liked_available: true,
            error: None,
        });
        fx.executor.drain();
        let calls = fx.surface.calls();
        let SurfaceCall::ReplaceRows(id, rows) = calls.last().unwrap() else {
            panic!("expected rows");
        };
        assert_eq!(*id, library_id);
        assert!(rows[2].enabled);
        assert_eq!(rows[2].detail.as_deref(), Some("Play from the top"));
    }

    #[test]
    fn test_library_status_error_disables_liked_row() {
        let (fx, _home, _library) = authorized_fixture();
        fx.client.resolve_status(LibraryStatus {
            liked_available: true,
            error: Some("offline".to_string()),
        });
        fx.executor.drain();
        let calls = fx.surface.calls();
        let SurfaceCall::ReplaceRows(_, rows) = calls.last().unwrap() else {
            panic!("expected rows");
        };
        assert!(!rows[2].enabled);
        assert_eq!(rows[2].detail.as_deref(), Some(ERROR_TEXT));
    }

    #[test]
    fn test_stale_fetch_after_back_is_discarded_and_reentry_refetches() {
        let (fx, _home, library_id) = authorized_fixture();
        fx.nav
            .lock()
            .unwrap()
            .handle_row_selected(library_id, ROW_ARTISTS);
        assert_eq!(fx.client.pending_artists(), 1);
        let calls = fx.surface.calls();
        let SurfaceCall::Push(pushed) = &calls[0] else {
            panic!("expected push");
        };
        let first_id = pushed.id;
        fx.surface.clear();

        // Leave before the fetch resolves; the late result must not render.
        fx.nav.lock().unwrap().handle_back();
        fx.client.resolve_artists(Ok(vec![entry("ar1", "Stale Artist")]));
        fx.executor.drain();
        assert!(fx.surface.calls().is_empty());

        // Re-entering builds a fresh node in the loading state and fetches
        // again.
        fx.nav
            .lock()
            .unwrap()
            .handle_row_selected(library_id, ROW_ARTISTS);
        let calls = fx.surface.calls();
        let SurfaceCall::Push(pushed) = &calls[0] else {
            panic!("expected push");
        };
        assert_ne!(pushed.id, first_id);
        assert_eq!(pushed.rows[0].title, "Loading…");
        assert_eq!(fx.client.pending_artists(), 1);
    }

    #[test]
    fn test_album_selection_fires_action_and_shows_now_playing() {
        let (mut fx, _home, library_id) = authorized_fixture();
        fx.nav
            .lock()
            .unwrap()
            .handle_row_selected(library_id, ROW_ARTISTS);
        fx.client.resolve_artists(Ok(vec![entry("ar1", "Some Artist")]));
        fx.executor.drain();

        let calls = fx.surface.calls();
        let SurfaceCall::Push(artists) = &calls[0] else {
            panic!("expected artists push");
        };
        fx.nav
            .lock()
            .unwrap()
            .handle_row_selected(artists.id, "ar1");
        let artist_id = fx.client.resolve_albums(Ok(vec![entry("al1", "Some Album")]));
        assert_eq!(artist_id, "ar1");
        fx.executor.drain();

        let calls = fx.surface.calls();
        let albums = calls
            .iter()
            .filter_map(|call| match call {
                SurfaceCall::Push(t) => Some(t.clone()),
                _ => None,
            })
            .last()
            .expect("expected albums push");
        assert_eq!(albums.title, "Some Artist");
        fx.surface.clear();

        fx.nav.lock().unwrap().handle_row_selected(albums.id, "al1");
        assert_eq!(
            fx.bus.try_recv(),
            Ok(Message::Action(PlaybackAction::PlayAlbum {
                album_id: "al1".to_string()
            }))
        );
        assert!(fx.surface.calls().contains(&SurfaceCall::ShowNowPlaying));

        // The forced refresh fires only after the presentation delay.
        let before = fx.refresher.calls.lock().unwrap().len();
        fx.executor.run_delayed();
        let after = fx.refresher.calls.lock().unwrap();
        assert_eq!(after.len(), before + 1);
        assert_eq!(after.last(), Some(&true));
    }

    #[test]
    fn test_liked_row_plays_without_pushing() {
        let (fx, _home, library_id) = authorized_fixture();
        fx.client.resolve_status(LibraryStatus {
            liked_available: true,
            error: None,
        });
        fx.executor.drain();
        fx.surface.clear();

        let mut bus = fx.bus;
        fx.nav
            .lock()
            .unwrap()
            .handle_row_selected(library_id, ROW_LIKED);
        assert_eq!(bus.try_recv(), Ok(Message::Action(PlaybackAction::PlayLiked)));
        let calls = fx.surface.calls();
        assert!(calls.contains(&SurfaceCall::ShowNowPlaying));
        assert!(!calls.iter().any(|c| matches!(c, SurfaceCall::Push(_))));
    }

    #[test]
    fn test_disabled_liked_row_ignores_selection() {
        let (fx, _home, library_id) = authorized_fixture();
        let mut bus = fx.bus;
        fx.nav
            .lock()
            .unwrap()
            .handle_row_selected(library_id, ROW_LIKED);
        assert!(bus.try_recv().is_err());
        assert!(fx.surface.calls().is_empty());
    }

    #[test]
    fn test_show_now_playing_is_a_singleton_overlay() {
        let (fx, _home, _library) = authorized_fixture();
        {
            let mut nav = fx.nav.lock().unwrap();
            nav.show_now_playing();
            nav.show_now_playing();
        }
        let shows = fx
            .surface
            .calls()
            .iter()
            .filter(|c| **c == SurfaceCall::ShowNowPlaying)
            .count();
        assert_eq!(shows, 1);

        // Dismissing and reopening presents again.
        {
            let mut nav = fx.nav.lock().unwrap();
            nav.handle_back();
            nav.show_now_playing();
        }
        let shows = fx
            .surface
            .calls()
            .iter()
            .filter(|c| **c == SurfaceCall::ShowNowPlaying)
            .count();
        assert_eq!(shows, 2);
    }

    #[test]
    fn test_now_playing_visibility_requires_auth_and_track() {
        let (fx, home_id, library_id) = authorized_fixture();
        fx.nav.lock().unwrap().update_now_playing_visibility(true);
        let calls = fx.surface.calls();
        assert!(calls.contains(&SurfaceCall::SetNowPlayingButton(home_id, true)));
        assert!(calls.contains(&SurfaceCall::SetNowPlayingButton(library_id, true)));

        fx.surface.clear();
        fx.nav.lock().unwrap().update_now_playing_visibility(false);
        assert!(fx
            .surface
            .calls()
            .contains(&SurfaceCall::SetNowPlayingButton(home_id, false)));

        // Logged out, a track never shows the button.
        fx.nav.lock().unwrap().set_auth_state(false);
        fx.surface.clear();
        fx.nav.lock().unwrap().update_now_playing_visibility(true);
        let calls = fx.surface.calls();
        assert!(calls
            .iter()
            .all(|c| !matches!(c, SurfaceCall::SetNowPlayingButton(_, true))));
    }

    #[test]
    fn test_now_playing_item_detail_formatting() {
        let (fx, _home, _library) = authorized_fixture();
        {
            let mut nav = fx.nav.lock().unwrap();
            nav.update_now_playing_item(NowPlayingMedia {
                title: Some("Song".to_string()),
                artist: Some("Artist".to_string()),
                album: Some("Album".to_string()),
                artwork: None,
            });
            nav.update_now_playing_item(NowPlayingMedia {
                title: Some("  ".to_string()),
                artist: None,
                album: None,
                artwork: None,
            });
        }
        let calls = fx.surface.calls();
        assert_eq!(
            calls[0],
            SurfaceCall::SetNowPlayingItem(
                "Song".to_string(),
                "Artist • Album".to_string(),
                false
            )
        );
        assert_eq!(
            calls[1],
            SurfaceCall::SetNowPlayingItem(
                PLACEHOLDER_TITLE.to_string(),
                "Tap to open".to_string(),
                false
            )
        );
    }

    #[test]
    fn test_now_playing_like_button_round_trip() {
        let (fx, _home, _library) = authorized_fixture();
        let mut bus = fx.bus;
        {
            let mut nav = fx.nav.lock().unwrap();
            nav.update_now_playing_buttons(true, true);
            nav.update_now_playing_buttons(false, false);
            nav.handle_now_playing_button();
        }
        let calls = fx.surface.calls();
        assert_eq!(
            calls[0],
            SurfaceCall::SetNowPlayingButtons(vec![NowPlayingButton::Like { filled: true }])
        );
        assert_eq!(calls[1], SurfaceCall::SetNowPlayingButtons(Vec::new()));
        assert_eq!(
            bus.try_recv(),
            Ok(Message::Remote(RemoteCommand::ToggleLike))
        );
    }

    #[test]
    fn test_scene_registry_tracks_live_head_units() {
        let registry = SceneRegistry::new();
        assert!(registry.head_unit().is_none());

        let fx = fixture();
        registry.register_head_unit(SceneId(7), &fx.nav);
        assert!(registry.head_unit().is_some());

        registry.deregister_head_unit(SceneId(7));
        assert!(registry.head_unit().is_none());

        registry.register_head_unit(SceneId(8), &fx.nav);
        drop(fx);
        assert!(registry.head_unit().is_none());
    }
}
