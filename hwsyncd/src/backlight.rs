//! Keyboard backlight synchronization
//!
//! [`BacklightWorker`] owns the LED class files and keeps them consistent with
//! the persisted settings in both directions. Collaborators hold a
//! [`BacklightHandle`] to read what the worker published and to push new
//! states. Pushes land in a single-slot [`Mailbox`], so a burst of pushes
//! collapses to the most recent one.

use async_trait::async_trait;
use hwsync_common::{decode_backlight_state, tracing, BacklightCapabilities, BacklightZoneState, Rgb};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BacklightOptions;
use crate::leds::LedLayout;
use crate::power::LidMonitor;
use crate::settings::SettingsStore;
use crate::worker::{Worker, WorkerResult, WorkerSchedule};

/// Latest-value slot with a wake-up signal
#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<Option<String>>,
    signal: Arc<Notify>,
}

impl Mailbox {
    /// Store `value`, replacing any value not yet taken. Returns true if one was replaced.
    pub fn put(&self, value: String) -> bool {
        let superseded = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(value)
            .is_some();
        self.signal.notify_one();
        superseded
    }

    pub fn take(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn signal(&self) -> Arc<Notify> {
        Arc::clone(&self.signal)
    }
}

/// Outcome of backlight discovery as seen by collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BacklightSupport {
    /// Discovery has not finished yet
    Probing,
    Supported(BacklightCapabilities),
    /// No backlight found after every discovery attempt
    Unsupported,
}

#[derive(Debug)]
struct Shared {
    support: RwLock<BacklightSupport>,
    state: RwLock<Vec<BacklightZoneState>>,
    mailbox: Mailbox,
}

/// Read side and push channel of a [`BacklightWorker`]
#[derive(Debug, Clone)]
pub struct BacklightHandle {
    shared: Arc<Shared>,
}

impl BacklightHandle {
    /// Discovered capabilities, `None` while probing or if unsupported
    pub async fn capabilities(&self) -> Option<BacklightCapabilities> {
        match &*self.shared.support.read().await {
            BacklightSupport::Supported(capabilities) => Some(capabilities.clone()),
            _ => None,
        }
    }

    pub async fn support(&self) -> BacklightSupport {
        self.shared.support.read().await.clone()
    }

    /// Most recently published backlight state
    pub async fn state(&self) -> Vec<BacklightZoneState> {
        self.shared.state.read().await.clone()
    }

    /// Queue a JSON encoded backlight state for the hardware.
    ///
    /// Only the latest queued state is applied. Malformed payloads are dropped
    /// by the worker.
    pub fn push_state(&self, payload: String) {
        if self.shared.mailbox.put(payload) {
            debug!("Pending backlight state superseded");
        }
    }
}

#[derive(Debug)]
enum Discovery {
    Probing { next_attempt: Option<Instant> },
    Ready { layout: LedLayout, capabilities: BacklightCapabilities },
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    Idle,
    /// Applying pushed states to hardware
    Draining,
    /// Hardware reads stay suppressed until the writes have settled
    Settling { until: Instant },
}

/// Bidirectional keyboard backlight synchronization
pub struct BacklightWorker {
    options: BacklightOptions,
    schedule: WorkerSchedule,
    store: Arc<dyn SettingsStore>,
    lid: Arc<dyn LidMonitor>,
    shared: Arc<Shared>,
    discovery: Discovery,
    attempts: u32,
    phase: SyncPhase,
}

impl BacklightWorker {
    pub fn new(
        options: BacklightOptions,
        store: Arc<dyn SettingsStore>,
        lid: Arc<dyn LidMonitor>,
    ) -> WorkerResult<(Self, BacklightHandle)> {
        let schedule = WorkerSchedule::from_millis(options.poll_interval_ms)?;
        let shared = Arc::new(Shared {
            support: RwLock::new(BacklightSupport::Probing),
            state: RwLock::new(Vec::new()),
            mailbox: Mailbox::default(),
        });
        let handle = BacklightHandle {
            shared: Arc::clone(&shared),
        };
        let worker = Self {
            options,
            schedule,
            store,
            lid,
            shared,
            discovery: Discovery::Probing { next_attempt: None },
            attempts: 0,
            phase: SyncPhase::Idle,
        };
        Ok((worker, handle))
    }

    /// One discovery attempt. Schedules the next one or gives up once the
    /// attempt budget is spent.
    async fn discover(&mut self) -> WorkerResult<()> {
        self.attempts += 1;
        let layout = LedLayout::discover(&self.options).await;
        let probed = match layout.probe().await {
            Ok(probed) => probed,
            Err(e) => {
                warn!("Backlight probe failed: {}", e);
                None
            }
        };

        let Some(capabilities) = probed else {
            let budget = self.options.discovery_attempts.max(1);
            if self.attempts >= budget {
                info!("No keyboard backlight found after {} attempts", self.attempts);
                self.discovery = Discovery::Unsupported;
                *self.shared.support.write().await = BacklightSupport::Unsupported;
            } else {
                debug!(
                    "No keyboard backlight found (attempt {}/{}), retrying",
                    self.attempts, budget
                );
                self.discovery = Discovery::Probing {
                    next_attempt: Some(Instant::now() + self.options.discovery_retry_delay()),
                };
            }
            return Ok(());
        };

        info!(
            "Keyboard backlight: {} zone(s), max brightness {}",
            capabilities.zones, capabilities.max_brightness
        );
        match self.store.read().await {
            Ok(settings) if settings.keyboard_backlight_control_enabled => {
                if let Err(e) = layout.apply(&capabilities, &settings).await {
                    warn!("Failed to restore keyboard backlight settings: {}", e);
                }
            }
            Ok(_) => debug!("Backlight control disabled, leaving hardware as is"),
            Err(e) => warn!("Failed to read settings: {}", e),
        }
        *self.shared.support.write().await = BacklightSupport::Supported(capabilities.clone());
        self.discovery = Discovery::Ready { layout, capabilities };

        if self.shared.mailbox.is_pending() {
            self.drain().await?;
        }
        Ok(())
    }

    /// Apply pushed states until the mailbox stays empty.
    ///
    /// A wake-up with nothing queued leaves the phase untouched, so a settle
    /// window opened by an earlier drain keeps running.
    async fn drain(&mut self) -> WorkerResult<()> {
        let Some(mut payload) = self.shared.mailbox.take() else {
            return Ok(());
        };
        self.phase = SyncPhase::Draining;
        loop {
            if let Err(e) = self.apply_payload(&payload).await {
                warn!("Dropping pushed backlight state: {}", e);
            }
            match self.shared.mailbox.take() {
                Some(next) => payload = next,
                None => break,
            }
        }
        self.phase = SyncPhase::Settling {
            until: Instant::now() + self.options.settle_delay(),
        };
        Ok(())
    }

    async fn apply_payload(&self, payload: &str) -> WorkerResult<()> {
        let Discovery::Ready { layout, capabilities } = &self.discovery else {
            return Ok(());
        };
        let mut states = decode_backlight_state(payload)?;
        let mut settings = self.store.read().await?;
        if !settings.keyboard_backlight_control_enabled {
            debug!("Backlight control disabled, ignoring pushed state");
            return Ok(());
        }

        states.truncate(capabilities.zones as usize);
        if capabilities.has_rgb() {
            let published = self.shared.state.read().await;
            for (index, state) in states.iter_mut().enumerate() {
                let fallback = published
                    .get(index)
                    .and_then(BacklightZoneState::color)
                    .unwrap_or(Rgb::WHITE);
                fill_missing_channels(state, fallback);
            }
        } else {
            for state in &mut states {
                *state = BacklightZoneState::white(state.brightness);
            }
        }
        if !settings.record_backlight_state(&states) {
            debug!("Ignoring empty backlight state");
            return Ok(());
        }

        self.store.write(&settings).await?;
        let applied = layout.apply(capabilities, &settings).await;
        *self.shared.state.write().await = states;
        applied
    }

    /// Mirror the hardware state into the published state and the settings
    async fn sync_from_hardware(&self) -> WorkerResult<()> {
        let Discovery::Ready { layout, capabilities } = &self.discovery else {
            return Ok(());
        };
        let mut settings = self.store.read().await?;
        if !settings.keyboard_backlight_control_enabled {
            return Ok(());
        }

        match self.lid.lid_closed().await {
            Ok(true) => {
                debug!("Lid closed, skipping backlight read");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => debug!("Lid state unavailable, assuming open: {}", e),
        }

        let states = layout.read_states(capabilities).await?;
        if self.shared.mailbox.is_pending() {
            debug!("Backlight state pushed during read, discarding read");
            return Ok(());
        }

        let before = settings.clone();
        settings.record_backlight_state(&states);
        *self.shared.state.write().await = states;
        if settings != before {
            debug!("Hardware backlight state changed, updating settings");
            self.store.write(&settings).await?;
        }
        Ok(())
    }
}

/// RGB zones always carry all three channels; unset ones come from `fallback`
fn fill_missing_channels(state: &mut BacklightZoneState, fallback: Rgb) {
    state.red = state.red.or(Some(fallback.red));
    state.green = state.green.or(Some(fallback.green));
    state.blue = state.blue.or(Some(fallback.blue));
}

#[async_trait]
impl Worker for BacklightWorker {
    fn name(&self) -> &'static str {
        "keyboard-backlight"
    }

    fn schedule(&self) -> WorkerSchedule {
        self.schedule
    }

    async fn on_start(&mut self) -> WorkerResult<()> {
        self.discover().await
    }

    async fn on_work(&mut self) -> WorkerResult<()> {
        match self.discovery {
            Discovery::Probing { next_attempt } => match next_attempt {
                Some(at) if at <= Instant::now() => self.discover().await,
                _ => Ok(()),
            },
            Discovery::Unsupported => Ok(()),
            Discovery::Ready { .. } => match self.phase {
                SyncPhase::Idle => self.sync_from_hardware().await,
                SyncPhase::Draining => Ok(()),
                SyncPhase::Settling { until } => {
                    if until > Instant::now() {
                        return Ok(());
                    }
                    self.phase = SyncPhase::Idle;
                    self.sync_from_hardware().await
                }
            },
        }
    }

    async fn on_exit(&mut self) -> WorkerResult<()> {
        if !matches!(self.discovery, Discovery::Ready { .. }) {
            return Ok(());
        }
        if self.shared.mailbox.is_pending() {
            self.drain().await
        } else if self.phase == SyncPhase::Idle {
            self.sync_from_hardware().await
        } else {
            Ok(())
        }
    }

    fn wake_signal(&self) -> Option<Arc<Notify>> {
        Some(self.shared.mailbox.signal())
    }

    async fn on_wake(&mut self) -> WorkerResult<()> {
        match self.discovery {
            Discovery::Ready { .. } => self.drain().await,
            Discovery::Unsupported => {
                if self.shared.mailbox.take().is_some() {
                    debug!("No keyboard backlight, dropping pushed state");
                }
                Ok(())
            }
            // Picked up once discovery succeeds
            Discovery::Probing { .. } => Ok(()),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (&self.discovery, self.phase) {
            (Discovery::Probing { next_attempt }, _) => *next_attempt,
            (Discovery::Ready { .. }, SyncPhase::Settling { until }) => Some(until),
            _ => None,
        }
    }
}
