use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Category, WidgetConfig},
    store::{DocumentStore, Fields, Snapshot, Subscription, COUNT_FIELD, RATINGS_COLLECTION},
};

use super::state::{Popup, VotePhase, WidgetState};

/// How long the "+1" popup stays visible after a vote.
pub const POPUP_VISIBLE_MS: u64 = 1000;
/// How long the widget refuses further votes after a vote. Deliberately
/// decoupled from write completion: the widget re-enables on time, not on
/// the write settling.
pub const VOTE_COOLDOWN_MS: u64 = 1200;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum WidgetEvent {
    CountsChanged { counts: BTreeMap<Category, u64> },
    PopupShown { category: Category },
    PopupCleared,
    VoteReady,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCount {
    pub category: Category,
    pub glyph: &'static str,
    pub label: &'static str,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSnapshot {
    pub counts: Vec<CategoryCount>,
    pub phase: VotePhase,
    pub popup: Option<Popup>,
}

struct SubscriptionTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// The widget core: holds the eventually-consistent count mirror, submits
/// votes, and emits events for the embedding UI. Cheap to clone; clones
/// share state.
#[derive(Clone)]
pub struct RatingWidget {
    config: WidgetConfig,
    store: Arc<dyn DocumentStore>,
    state: Arc<Mutex<WidgetState>>,
    events: broadcast::Sender<WidgetEvent>,
    task: Arc<Mutex<Option<SubscriptionTask>>>,
}

impl RatingWidget {
    pub fn new(store: Arc<dyn DocumentStore>, config: WidgetConfig) -> Self {
        let state = WidgetState::new(&config);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            store,
            state: Arc::new(Mutex::new(state)),
            events,
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<WidgetEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> WidgetSnapshot {
        let state = self.state.lock().await;
        let counts = self
            .config
            .categories
            .iter()
            .map(|&category| CategoryCount {
                category,
                glyph: category.glyph(),
                label: category.label(),
                count: state.count(category),
            })
            .collect();

        WidgetSnapshot {
            counts,
            phase: state.phase,
            popup: state.popup,
        }
    }

    /// Opens the live subscription and starts mirroring counts. Fails if the
    /// widget is already active.
    pub async fn activate(&self) -> Result<()> {
        let mut task_guard = self.task.lock().await;
        if task_guard.is_some() {
            bail!("widget already active");
        }

        let subscription = self
            .store
            .subscribe(RATINGS_COLLECTION)
            .await
            .context("failed to subscribe to the ratings collection")?;

        info!("Widget activated, subscription {} open", subscription.id());

        let token = CancellationToken::new();
        let handle = tokio::spawn(subscription_loop(
            self.state.clone(),
            self.events.clone(),
            subscription,
            token.clone(),
        ));

        *task_guard = Some(SubscriptionTask { token, handle });
        Ok(())
    }

    /// Releases the subscription. No further snapshots are applied; an
    /// update in flight at release time is discarded without error.
    pub async fn deactivate(&self) -> Result<()> {
        if let Some(task) = self.task.lock().await.take() {
            task.token.cancel();
            task.handle
                .await
                .context("subscription task failed to join")?;
            info!("Widget deactivated");
        }
        Ok(())
    }

    /// Submits one vote. Dropped silently while a previous vote is cooling
    /// down. Write failures are absorbed: the popup and the cooldown run
    /// regardless of the outcome, and counts only move when the subscription
    /// delivers the new snapshot.
    pub async fn vote(&self, category: Category) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.phase == VotePhase::CoolingDown {
                debug!("vote for {category} dropped while cooling down");
                return Ok(());
            }
            state.phase = VotePhase::CoolingDown;
        }

        if let Err(err) = self
            .store
            .increment(RATINGS_COLLECTION, category.as_str(), COUNT_FIELD, 1)
            .await
        {
            if err.is_missing() {
                debug!("no counter record for {category} yet, creating one");
            } else {
                warn!("increment for {category} failed ({err}), falling back to create");
            }

            let mut fields = Fields::new();
            fields.insert(COUNT_FIELD.to_string(), Value::from(1));
            if let Err(create_err) = self
                .store
                .create(RATINGS_COLLECTION, category.as_str(), fields)
                .await
            {
                warn!("fallback create for {category} failed: {create_err}");
            }
        }

        {
            let mut state = self.state.lock().await;
            state.popup = Some(Popup { category });
        }
        let _ = self.events.send(WidgetEvent::PopupShown { category });

        self.spawn_popup_timer();
        self.spawn_cooldown_timer();
        Ok(())
    }

    fn spawn_popup_timer(&self) {
        let state = self.state.clone();
        let events = self.events.clone();
        let sleep = time::sleep(Duration::from_millis(POPUP_VISIBLE_MS));
        tokio::spawn(async move {
            sleep.await;
            state.lock().await.popup = None;
            let _ = events.send(WidgetEvent::PopupCleared);
        });
    }

    fn spawn_cooldown_timer(&self) {
        let state = self.state.clone();
        let events = self.events.clone();
        let sleep = time::sleep(Duration::from_millis(VOTE_COOLDOWN_MS));
        tokio::spawn(async move {
            sleep.await;
            state.lock().await.phase = VotePhase::Accepting;
            let _ = events.send(WidgetEvent::VoteReady);
        });
    }
}

async fn subscription_loop(
    state: Arc<Mutex<WidgetState>>,
    events: broadcast::Sender<WidgetEvent>,
    mut subscription: Subscription,
    token: CancellationToken,
) {
    apply_snapshot(&state, &events, subscription.latest()).await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            changed = subscription.changed() => match changed {
                Ok(snapshot) => apply_snapshot(&state, &events, snapshot).await,
                Err(_) => {
                    debug!("snapshot stream ended, stopping subscription loop");
                    break;
                }
            }
        }
    }
}

async fn apply_snapshot(
    state: &Mutex<WidgetState>,
    events: &broadcast::Sender<WidgetEvent>,
    snapshot: Snapshot,
) {
    let counts = {
        let mut guard = state.lock().await;
        guard.apply_snapshot(&snapshot);
        guard.counts.clone()
    };
    let _ = events.send(WidgetEvent::CountsChanged { counts });
}
