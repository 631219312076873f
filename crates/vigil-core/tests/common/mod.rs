//! Fakes shared by the engine integration tests: a recording notifier, an in-memory
//! ledger, and a timer queue that hands armed jobs back to the test instead of sleeping.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use vigil_core::{
    AlertChannels, ChatId, EngineSettings, Job, LivenessEngine, LivenessRecord, LivenessStore,
    ManualClock, MessageRef, Notifier, ReputationLedger, ResponseControl, Result, TimerQueue,
    UserId, UserRef, VigilError,
};

pub const ALERTS: ChatId = ChatId(-100);
pub const WARNINGS: ChatId = ChatId(-200);

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// max_retries = 2, response_timeout = 60 s, retry_interval = 30 s, reward = 1.
pub fn settings() -> EngineSettings {
    EngineSettings {
        response_timeout: Duration::from_secs(60),
        max_retries: 2,
        retry_interval: Duration::from_secs(30),
        reward: 1,
        channels: AlertChannels {
            alerts: ALERTS,
            warnings: WARNINGS,
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub chat: ChatId,
    pub text: String,
    pub control: Option<ResponseControl>,
    pub message: MessageRef,
}

/// Records every transport call. Sends to `failing` chats error out; sends to the
/// `gated` chat block until the gate opens.
pub struct FakeNotifier {
    next_id: AtomicI64,
    pub sent: Mutex<Vec<Sent>>,
    pub acks: Mutex<Vec<String>>,
    pub edits: Mutex<Vec<(MessageRef, String)>>,
    pub failing: Mutex<HashSet<ChatId>>,
    gated: Mutex<Option<ChatId>>,
    gate: watch::Sender<bool>,
    pub send_attempts: AtomicUsize,
}

impl Default for FakeNotifier {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            next_id: AtomicI64::new(1),
            sent: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            edits: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            gated: Mutex::new(None),
            gate,
            send_attempts: AtomicUsize::new(0),
        }
    }
}

impl FakeNotifier {
    pub fn fail_chat(&self, chat: ChatId) {
        self.failing.lock().unwrap().insert(chat);
    }

    /// Holds sends to `chat` until [`FakeNotifier::open_gate`].
    pub fn close_gate(&self, chat: ChatId) {
        *self.gated.lock().unwrap() = Some(chat);
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn sent_to(&self, chat: ChatId) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.chat == chat)
            .cloned()
            .collect()
    }

    pub fn challenges_to(&self, user: UserId) -> Vec<Sent> {
        self.sent_to(ChatId::from(user))
    }

    pub fn alerts(&self) -> Vec<String> {
        self.sent_to(ALERTS).into_iter().map(|s| s.text).collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.sent_to(WARNINGS).into_iter().map(|s| s.text).collect()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send(
        &self,
        chat: ChatId,
        text: &str,
        control: Option<&ResponseControl>,
    ) -> Result<MessageRef> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let gated = *self.gated.lock().unwrap() == Some(chat);
        if gated {
            let mut rx = self.gate.subscribe();
            let _ = rx.wait_for(|open| *open).await;
        }
        if self.failing.lock().unwrap().contains(&chat) {
            return Err(VigilError::Notifier(format!("chat {chat} unreachable")));
        }
        let message = MessageRef {
            chat_id: chat,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        };
        self.sent.lock().unwrap().push(Sent {
            chat,
            text: text.to_string(),
            control: control.cloned(),
            message,
        });
        Ok(message)
    }

    async fn acknowledge(&self, control_ref: &str) -> Result<()> {
        self.acks.lock().unwrap().push(control_ref.to_string());
        Ok(())
    }

    async fn edit(&self, message: MessageRef, text: &str) -> Result<()> {
        self.edits.lock().unwrap().push((message, text.to_string()));
        Ok(())
    }
}

/// In-memory ledger with switchable failures.
#[derive(Default)]
pub struct FakeLedger {
    pub users: Mutex<BTreeMap<UserId, (String, i64)>>,
    pub fail_list: AtomicBool,
    pub fail_add: AtomicBool,
    pub add_calls: AtomicUsize,
}

impl FakeLedger {
    pub fn with_users(users: &[(i64, &str)]) -> Self {
        let ledger = Self::default();
        {
            let mut map = ledger.users.lock().unwrap();
            for (id, name) in users {
                map.insert(UserId(*id), (name.to_string(), 0));
            }
        }
        ledger
    }

    pub fn score(&self, user: UserId) -> i64 {
        self.users.lock().unwrap().get(&user).map_or(0, |(_, s)| *s)
    }
}

#[async_trait]
impl ReputationLedger for FakeLedger {
    async fn list_all_users(&self) -> Result<Vec<UserRef>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(VigilError::Ledger("directory offline".into()));
        }
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .map(|(id, (name, _))| UserRef {
                id: *id,
                username: name.clone(),
            })
            .collect())
    }

    async fn add_points(&self, user: UserId, amount: i64) -> Result<()> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(VigilError::Ledger("write rejected".into()));
        }
        let mut users = self.users.lock().unwrap();
        let entry = users.get_mut(&user).ok_or(VigilError::UnknownUser(user))?;
        entry.1 += amount;
        Ok(())
    }

    async fn alive_score(&self, user: UserId) -> Result<i64> {
        self.users
            .lock()
            .unwrap()
            .get(&user)
            .map(|(_, s)| *s)
            .ok_or(VigilError::UnknownUser(user))
    }
}

/// Keeps armed jobs so a test can fire them in any order.
#[derive(Default)]
pub struct RecordingTimers {
    armed: Mutex<Vec<(Duration, Option<Job>)>>,
}

impl RecordingTimers {
    pub fn len(&self) -> usize {
        self.armed.lock().unwrap().len()
    }

    pub fn delay(&self, index: usize) -> Duration {
        self.armed.lock().unwrap()[index].0
    }

    /// Removes the job so it can be awaited. Panics if already taken.
    pub fn take(&self, index: usize) -> Job {
        self.armed.lock().unwrap()[index]
            .1
            .take()
            .expect("timer already fired")
    }
}

impl TimerQueue for RecordingTimers {
    fn schedule_once(&self, delay: Duration, job: Job) -> bool {
        self.armed.lock().unwrap().push((delay, Some(job)));
        true
    }
}

pub struct Harness {
    pub _dir: tempfile::TempDir,
    pub store: Arc<LivenessStore>,
    pub notifier: Arc<FakeNotifier>,
    pub ledger: Arc<FakeLedger>,
    pub timers: Arc<RecordingTimers>,
    pub clock: ManualClock,
    pub engine: Arc<LivenessEngine>,
}

impl Harness {
    pub fn new(users: &[(i64, &str)]) -> Self {
        Self::with_settings(users, settings())
    }

    pub fn with_settings(users: &[(i64, &str)], settings: EngineSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LivenessStore::open_path(dir.path().join("liveness")).unwrap());
        let notifier = Arc::new(FakeNotifier::default());
        let ledger = Arc::new(FakeLedger::with_users(users));
        let timers = Arc::new(RecordingTimers::default());
        let clock = ManualClock::new(t0());
        let engine = Arc::new(LivenessEngine::new(
            Arc::clone(&store),
            notifier.clone(),
            ledger.clone(),
            timers.clone(),
            Arc::new(clock.clone()),
            settings,
        ));
        Self {
            _dir: dir,
            store,
            notifier,
            ledger,
            timers,
            clock,
            engine,
        }
    }

    pub fn record(&self, user: i64) -> LivenessRecord {
        self.store
            .get(UserId(user))
            .unwrap()
            .expect("record should exist")
    }

    pub fn advance_secs(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    /// Fires armed timer `index` on the current task.
    pub async fn fire(&self, index: usize) {
        self.timers.take(index).await;
    }
}
