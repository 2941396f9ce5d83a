//! Background artwork fetching with apply-time staleness checks.
//!
//! The cache tracks at most one desired artwork identity. Fetches run on
//! background threads; a completion whose identity no longer matches the
//! desired one is discarded silently, so a burst of track changes settles
//! on the last requested artwork.

use std::io::Read;
use std::sync::{Arc, Mutex};

use image::DynamicImage;
use log::{debug, warn};

use crate::protocol::ArtworkRef;

/// Fetches raw artwork bytes for a URL, optionally with a bearer token.
pub trait ArtworkFetcher: Send + Sync {
    fn fetch(&self, url: &str, token: Option<&str>) -> Result<Vec<u8>, String>;
}

/// Callback applying a decoded artwork image back to the snapshot owner.
pub type ArtworkApply = Arc<dyn Fn(ArtworkRef, Arc<DynamicImage>) + Send + Sync>;

/// `ArtworkFetcher` over HTTP, with the same agent timeouts the rest of
/// the app uses for server traffic.
pub struct HttpArtworkFetcher {
    agent: ureq::Agent,
}

impl HttpArtworkFetcher {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(std::time::Duration::from_secs(5))
            .timeout_read(std::time::Duration::from_secs(15))
            .timeout_write(std::time::Duration::from_secs(15))
            .build();
        HttpArtworkFetcher { agent }
    }
}

impl Default for HttpArtworkFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtworkFetcher for HttpArtworkFetcher {
    fn fetch(&self, url: &str, token: Option<&str>) -> Result<Vec<u8>, String> {
        let mut request = self.agent.get(url);
        if let Some(token) = token {
            if !token.is_empty() {
                request = request.set("Authorization", &format!("Bearer {token}"));
            }
        }
        let response = request
            .call()
            .map_err(|e| format!("artwork request failed: {e}"))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| format!("artwork read failed: {e}"))?;
        Ok(bytes)
    }
}

pub struct ArtworkCache {
    desired: Arc<Mutex<Option<ArtworkRef>>>,
    fetcher: Arc<dyn ArtworkFetcher>,
    on_artwork: ArtworkApply,
}

impl ArtworkCache {
    pub fn new(fetcher: Arc<dyn ArtworkFetcher>, on_artwork: ArtworkApply) -> Self {
        ArtworkCache {
            desired: Arc::new(Mutex::new(None)),
            fetcher,
            on_artwork,
        }
    }

    /// Records `target` as the desired artwork and starts one background
    /// fetch for it. A repeat request for the already-desired identity is
    /// skipped.
    pub fn fetch(&self, target: ArtworkRef) {
        {
            let mut desired = match self.desired.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if desired.as_ref() == Some(&target) {
                debug!("ArtworkCache: fetch already pending for {}", target.url);
                return;
            }
            *desired = Some(target.clone());
        }
        let desired = self.desired.clone();
        let fetcher = self.fetcher.clone();
        let on_artwork = self.on_artwork.clone();
        std::thread::spawn(move || {
            let result = fetcher.fetch(&target.url, target.token.as_deref());
            Self::resolve(&desired, &target, result, &on_artwork);
        });
    }

    /// Drops the desired identity so any in-flight completion is discarded.
    /// Called when inline bytes win or the snapshot is cleared.
    pub fn invalidate(&self) {
        let mut desired = match self.desired.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *desired = None;
    }

    /// Completion path for a finished fetch. The desired identity is
    /// re-checked here because a newer fetch or an invalidate may have
    /// superseded this one while it was in flight.
    fn resolve(
        desired: &Mutex<Option<ArtworkRef>>,
        target: &ArtworkRef,
        result: Result<Vec<u8>, String>,
        on_artwork: &ArtworkApply,
    ) {
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!("ArtworkCache: fetch for {} failed: {error}", target.url);
                return;
            }
        };
        let image = match image::load_from_memory(&bytes) {
            Ok(image) => image,
            Err(error) => {
                warn!("ArtworkCache: decode for {} failed: {error}", target.url);
                return;
            }
        };
        {
            let guard = match desired.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard.as_ref() != Some(target) {
                debug!("ArtworkCache: discarding stale artwork for {}", target.url);
                return;
            }
        }
        on_artwork(target.clone(), Arc::new(image));
    }
}
