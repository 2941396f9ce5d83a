//! Host binary.
//!
//! Wires the real adapters together and speaks a newline-delimited JSON
//! method channel on stdin/stdout: inbound calls carry `method`/`args`,
//! responses echo the call `id`, and outbound traffic is either a request
//! to the app layer (list fetches, auth state) or a fire-and-forget
//! event (remote commands, permission changes, playback actions).

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use tonebridge::artwork_cache::{ArtworkCache, HttpArtworkFetcher};
use tonebridge::channel::{BridgeChannel, SystemSettingsPort};
use tonebridge::executor::{MainExecutor, ThreadExecutor};
use tonebridge::navigation::{
    AppClient, AuthCallback, HeadUnitSurface, ListCallback, ListRow, NavigationStateMachine,
    NowPlayingButton, StatusCallback, TemplateId, TemplateSnapshot,
};
use tonebridge::now_playing::{artwork_apply_for, NowPlayingProjector, ProjectorRefresher};
use tonebridge::permission_probe::LocalCapabilityProbe;
use tonebridge::persistence::ProbeStore;
use tonebridge::protocol::{parse_list_response, LibraryStatus, Message};
use tonebridge::remote_commands::{RemoteCommandRouter, SharedTransportState};
use tonebridge::scene_registry::{SceneId, SceneRegistry};

const SETTINGS_URL: &str = "app-settings:";

enum PendingCallback {
    List(ListCallback),
    Status(StatusCallback),
    Auth(AuthCallback),
}

/// `AppClient` over stdout JSON lines. Requests carry an id; the stdin
/// loop feeds matching responses back through `complete`.
struct StdioAppChannel {
    out: Mutex<std::io::Stdout>,
    pending: Mutex<HashMap<u64, PendingCallback>>,
    next_id: AtomicU64,
}

impl StdioAppChannel {
    fn new() -> Self {
        StdioAppChannel {
            out: Mutex::new(std::io::stdout()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn write_line(&self, value: Value) {
        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if writeln!(out, "{value}").and_then(|()| out.flush()).is_err() {
            warn!("StdioAppChannel: stdout write failed");
        }
    }

    fn request(&self, method: &str, args: Value, callback: PendingCallback) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut pending = match self.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            pending.insert(id, callback);
        }
        self.write_line(json!({ "id": id, "method": method, "args": args }));
    }

    /// Resolves one outstanding request from a response line.
    fn complete(&self, id: u64, result: &Value) {
        let callback = {
            let mut pending = match self.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            pending.remove(&id)
        };
        match callback {
            Some(PendingCallback::List(done)) => {
                let (entries, error) = parse_list_response(result);
                done(match error {
                    Some(error) => Err(error),
                    None => Ok(entries),
                });
            }
            Some(PendingCallback::Status(done)) => {
                let status: LibraryStatus =
                    serde_json::from_value(result.clone()).unwrap_or_default();
                done(status);
            }
            Some(PendingCallback::Auth(done)) => {
                let authorized = result
                    .get("authorized")
                    .and_then(Value::as_bool)
                    .or_else(|| result.as_bool())
                    .unwrap_or(false);
                done(authorized);
            }
            None => debug!("StdioAppChannel: response for unknown request {id}"),
        }
    }

    fn emit_event(&self, event: &str, payload: Value) {
        self.write_line(json!({ "event": event, "payload": payload }));
    }

    fn invoke(&self, method: &str, args: Option<Value>) {
        self.write_line(json!({ "method": method, "args": args.unwrap_or(Value::Null) }));
    }
}

impl AppClient for StdioAppChannel {
    fn get_home_actions(&self, done: ListCallback) {
        self.request("getHomeActions", Value::Null, PendingCallback::List(done));
    }

    fn get_artists(&self, done: ListCallback) {
        self.request("getArtists", Value::Null, PendingCallback::List(done));
    }

    fn get_albums(&self, artist_id: &str, done: ListCallback) {
        self.request(
            "getAlbums",
            json!({ "artistId": artist_id }),
            PendingCallback::List(done),
        );
    }

    fn get_playlists(&self, done: ListCallback) {
        self.request("getPlaylists", Value::Null, PendingCallback::List(done));
    }

    fn get_library_status(&self, done: StatusCallback) {
        self.request("getLibraryStatus", Value::Null, PendingCallback::Status(done));
    }

    fn get_auth_state(&self, done: AuthCallback) {
        self.request("getAuthState", Value::Null, PendingCallback::Auth(done));
    }
}

/// Head-unit adapter for hosts without a real display attached; template
/// operations land in the log so the tree stays observable.
struct TraceHeadUnitSurface;

impl HeadUnitSurface for TraceHeadUnitSurface {
    fn set_root(&mut self, tabs: Vec<TemplateSnapshot>) {
        let titles: Vec<&str> = tabs.iter().map(|t| t.title.as_str()).collect();
        info!("HeadUnit: root set to {titles:?}");
    }

    fn push(&mut self, template: TemplateSnapshot) {
        info!("HeadUnit: pushed '{}' ({})", template.title, template.id);
    }

    fn replace_rows(&mut self, id: TemplateId, rows: Vec<ListRow>) {
        debug!("HeadUnit: template {id} now has {} rows", rows.len());
    }

    fn set_now_playing_button(&mut self, id: TemplateId, visible: bool) {
        debug!("HeadUnit: template {id} now-playing button visible={visible}");
    }

    fn show_now_playing(&mut self) {
        info!("HeadUnit: now-playing presented");
    }

    fn set_now_playing_item(
        &mut self,
        title: String,
        detail: String,
        artwork: Option<Arc<image::DynamicImage>>,
    ) {
        debug!(
            "HeadUnit: now-playing item '{title}' / '{detail}' artwork={}",
            artwork.is_some()
        );
    }

    fn set_now_playing_buttons(&mut self, buttons: Vec<NowPlayingButton>) {
        debug!("HeadUnit: now-playing buttons {buttons:?}");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Debug);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    // Bus for outbound fire-and-forget traffic.
    let (bus_sender, _) = broadcast::channel::<Message>(1024);

    let executor: Arc<dyn MainExecutor> = Arc::new(ThreadExecutor::new());
    let scenes = Arc::new(SceneRegistry::new());
    let transport = SharedTransportState::default();

    let router = Arc::new(RemoteCommandRouter::new(
        bus_sender.clone(),
        transport.clone(),
    ));
    let widget = tonebridge::media_surface::SouvlakiNowPlayingWidget::new(router.clone());

    let projector = NowPlayingProjector::new(
        Box::new(widget),
        executor.clone(),
        scenes.clone(),
        transport.clone(),
    );
    let cache = Arc::new(ArtworkCache::new(
        Arc::new(HttpArtworkFetcher::new()),
        artwork_apply_for(&projector, executor.clone()),
    ));
    {
        let mut projector = projector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        projector.attach_artwork_cache(cache);
    }

    let client = Arc::new(StdioAppChannel::new());
    let refresher = Arc::new(ProjectorRefresher::new(&projector, executor.clone()));
    let nav = NavigationStateMachine::new(
        Box::new(TraceHeadUnitSurface),
        client.clone(),
        executor.clone(),
        bus_sender.clone(),
        refresher,
    );
    scenes.register_head_unit(SceneId(1), &nav);
    {
        let nav = nav.clone();
        executor.dispatch(Box::new(move || {
            let mut nav = match nav.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            nav.connect();
        }));
    }

    let probe = Arc::new(LocalCapabilityProbe::new(
        ProbeStore::at_default_location(),
        bus_sender.clone(),
    ));
    probe.refresh();

    let channel = BridgeChannel::new(
        projector,
        scenes,
        probe,
        Arc::new(SystemSettingsPort::new(SETTINGS_URL.to_string())),
        executor,
    );

    // Outbound pump: bus traffic becomes stdout events and invocations.
    {
        let client = client.clone();
        let mut bus_consumer = bus_sender.subscribe();
        std::thread::Builder::new()
            .name("outbound-pump".to_string())
            .spawn(move || loop {
                match bus_consumer.blocking_recv() {
                    Ok(Message::Remote(command)) => {
                        client.emit_event("remoteCommand", json!({ "type": command.wire_name() }));
                    }
                    Ok(Message::Permission(status)) => {
                        client.emit_event(
                            "localNetworkPermission",
                            json!({ "status": status.as_str() }),
                        );
                    }
                    Ok(Message::Action(action)) => {
                        client.invoke(action.method_name(), action.arguments());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("OutboundPump: bus lagged by {skipped} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            })?;
    }

    info!("Tonebridge: started");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(err) => {
                warn!("Tonebridge: dropping unparseable line: {err}");
                continue;
            }
        };

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            let args = value.get("args").cloned().unwrap_or(Value::Null);
            let response = channel.handle_call(method, &args);
            if let Some(id) = value.get("id").and_then(Value::as_u64) {
                match response {
                    Ok(result) => client.write_line(json!({ "id": id, "result": result })),
                    Err(error) => client.write_line(json!({
                        "id": id,
                        "error": { "code": error.code(), "message": error.to_string() },
                    })),
                }
            }
            continue;
        }

        if let (Some(id), Some(result)) =
            (value.get("id").and_then(Value::as_u64), value.get("result"))
        {
            client.complete(id, result);
            continue;
        }

        debug!("Tonebridge: ignoring line without method or result");
    }

    info!("Tonebridge: stdin closed, shutting down");
    Ok(())
}
