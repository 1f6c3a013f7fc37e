//! Shared helpers for the dispatch integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use courier_dispatch::{
    Clock, Courier, Delivery, DispatchConfig, Dispatcher, EventKind, LifecycleEvent, ManualClock,
    NewPost, Subscription,
};
use courier_platforms::{
    AdapterRegistry, PlatformAdapter, PublishContext, PublishError, PublishReceipt, RefreshError,
    Rendered,
};
use courier_store::{
    AccountId, Credentials, MediaRef, MemoryStore, OwnerId, Platform, PlatformAttempt, PostId,
    SocialAccount, Store,
};
use tokio::sync::Notify;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 1, 9, 0, 0).unwrap()
}

pub fn test_config() -> DispatchConfig {
    DispatchConfig {
        worker_count: 2,
        take_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

/// One recorded publish call.
#[derive(Debug, Clone)]
pub struct PublishCall {
    pub idempotency_key: String,
    pub access_token: String,
    pub content: String,
}

/// Parks a publish call until released.
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Adapter that replays scripted publish results, then succeeds.
pub struct ScriptedAdapter {
    platform: Platform,
    clock: Arc<ManualClock>,
    script: Mutex<VecDeque<Result<PublishReceipt, PublishError>>>,
    calls: Mutex<Vec<PublishCall>>,
    refreshes: AtomicUsize,
    gate: Option<Arc<Gate>>,
}

impl ScriptedAdapter {
    pub fn new(platform: Platform, clock: Arc<ManualClock>) -> Self {
        Self {
            platform,
            clock,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            refreshes: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn then(self, result: Result<PublishReceipt, PublishError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn then_transient(self, reason: &str) -> Self {
        self.then(Err(PublishError::transient(reason)))
    }

    pub fn gated(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<PublishCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformAdapter for ScriptedAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn publish(
        &self,
        rendered: &Rendered,
        credentials: &Credentials,
        ctx: &PublishContext,
    ) -> Result<PublishReceipt, PublishError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(PublishCall {
                idempotency_key: ctx.idempotency_key.clone(),
                access_token: credentials.access_token.clone(),
                content: rendered.content.clone(),
            });
            calls.len()
        };

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(PublishReceipt {
                platform_post_id: format!("{}-{}", self.platform, n),
                url: Some(format!("https://{}.example/{}", self.platform, n)),
            })
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<Credentials, RefreshError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(25)).await;
        Ok(Credentials {
            access_token: format!("access-{}", n + 1),
            refresh_token: Some(format!("refresh-{}", n + 1)),
            expires_at: self.clock.now() + chrono::Duration::hours(1),
        })
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub courier: Courier,
    pub owner: OwnerId,
    pub adapters: HashMap<Platform, Arc<ScriptedAdapter>>,
}

impl Harness {
    /// A dispatcher over a fresh store with one connected account per
    /// adapter.
    pub async fn new(adapters: Vec<ScriptedAdapter>) -> Self {
        let clock = adapters
            .first()
            .map(|a| a.clock.clone())
            .unwrap_or_else(|| Arc::new(ManualClock::new(start_time())));
        Self::with_store(adapters, clock, Arc::new(MemoryStore::new()), OwnerId::new()).await
    }

    pub async fn with_store(
        adapters: Vec<ScriptedAdapter>,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        owner: OwnerId,
    ) -> Self {
        let mut registry = AdapterRegistry::new();
        let mut by_platform = HashMap::new();
        for adapter in adapters {
            let adapter = Arc::new(adapter);
            registry.register(adapter.clone());
            by_platform.insert(adapter.platform, adapter);
        }

        for &platform in by_platform.keys() {
            if store.active_account(owner, platform).await.unwrap().is_none() {
                connect(&store, owner, platform, clock.now() + chrono::Duration::days(30)).await;
            }
        }

        let dispatcher = Arc::new(
            Dispatcher::with_clock(test_config(), store.clone(), registry, clock.clone()).unwrap(),
        );
        let courier = dispatcher.courier();
        Self {
            clock,
            store,
            dispatcher,
            courier,
            owner,
            adapters: by_platform,
        }
    }

    pub fn adapter(&self, platform: Platform) -> &Arc<ScriptedAdapter> {
        &self.adapters[&platform]
    }

    pub fn subscribe(&self) -> Subscription {
        self.courier.subscribe(self.owner)
    }

    pub fn new_post(&self, platforms: &[Platform], content: &str) -> NewPost {
        NewPost {
            owner_id: self.owner,
            title: "Launch".to_string(),
            base_content: content.to_string(),
            media_refs: Vec::new(),
            platforms: platforms.iter().map(|p| p.to_string()).collect(),
            variants: BTreeMap::new(),
            scheduled_at: self.clock.now() + chrono::Duration::seconds(1),
            timezone: "Europe/Berlin".to_string(),
            pre_validate: false,
        }
    }

    pub async fn submit(&self, platforms: &[Platform], content: &str) -> PostId {
        self.courier
            .submit_post(self.new_post(platforms, content))
            .await
            .unwrap()
    }

    pub async fn submit_with_media(&self, platforms: &[Platform], content: &str) -> PostId {
        let mut post = self.new_post(platforms, content);
        post.media_refs = vec![MediaRef::new("media/cover.jpg")];
        self.courier.submit_post(post).await.unwrap()
    }

    /// Move past the schedule and run one scheduler pass.
    pub async fn fire(&self) {
        self.clock.advance(Duration::from_secs(1));
        self.dispatcher.tick().await.unwrap();
    }

    /// Process tickets until the dispatch queue is empty.
    pub async fn drain(&self) -> Vec<PlatformAttempt> {
        let mut recorded = Vec::new();
        while !self.dispatcher.queue().is_empty() {
            if let Some(attempt) = self.dispatcher.process_next().await.unwrap() {
                recorded.push(attempt);
            }
        }
        recorded
    }

    pub async fn attempt(&self, post_id: PostId, platform: Platform) -> PlatformAttempt {
        self.store
            .attempts_for(post_id)
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.platform == platform)
            .unwrap()
    }
}

pub async fn connect(
    store: &MemoryStore,
    owner: OwnerId,
    platform: Platform,
    expires_at: DateTime<Utc>,
) -> AccountId {
    let account = SocialAccount {
        id: AccountId::new(),
        owner_id: owner,
        platform,
        handle: format!("@{}-owner", platform),
        access_token: "access-1".to_string(),
        refresh_token: Some("refresh-1".to_string()),
        token_expires_at: expires_at,
        active: true,
    };
    store.upsert_account(&account).await.unwrap();
    account.id
}

/// Events buffered on `sub`, failing on lag.
pub fn events(sub: &mut Subscription) -> Vec<LifecycleEvent> {
    sub.drain()
        .into_iter()
        .map(|d| match d {
            Delivery::Event(event) => event,
            Delivery::Lagged(n) => panic!("subscriber lagged by {}", n),
        })
        .collect()
}

pub fn kinds(events: &[LifecycleEvent], post_id: PostId) -> Vec<EventKind> {
    events
        .iter()
        .filter(|e| e.post_id == post_id)
        .map(|e| e.kind)
        .collect()
}

/// Per-post ordering: `scheduled` first, `dispatching` before any attempt
/// event, at most one terminal event and nothing after it.
pub fn assert_lifecycle_order(events: &[LifecycleEvent]) {
    let mut posts: Vec<PostId> = Vec::new();
    for event in events {
        if !posts.contains(&event.post_id) {
            posts.push(event.post_id);
        }
    }

    for post_id in posts {
        let kinds = kinds(events, post_id);
        assert_eq!(kinds.first(), Some(&EventKind::Scheduled), "{:?}", kinds);

        let dispatching = kinds.iter().position(|k| *k == EventKind::Dispatching);
        let terminals: Vec<usize> = kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| k.is_terminal())
            .map(|(i, _)| i)
            .collect();
        assert!(terminals.len() <= 1, "multiple terminal events: {:?}", kinds);
        if let Some(&end) = terminals.first() {
            assert_eq!(end, kinds.len() - 1, "events after terminal: {:?}", kinds);
        }

        for (i, kind) in kinds.iter().enumerate() {
            if kind.is_attempt() {
                let dispatching = dispatching.expect("attempt event without dispatching");
                assert!(i > dispatching, "attempt event before dispatching: {:?}", kinds);
            }
        }
    }
}
