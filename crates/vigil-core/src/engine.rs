//! Liveness engine: the per-user check state machine.
//!
//! ```text
//! NoRecord ──sweep──▶ AwaitingResponse ──response──▶ Responded
//!                        │   ▲
//!                timeout │   │ retry challenge (retry_count < max)
//!                        ▼   │
//!                     TimedOut ──retry_count ≥ max──▶ Inactive ──next sweep──▶ AwaitingResponse
//! ```
//!
//! Work enters through [`Step`]s. A timeout that still has retry budget yields a
//! follow-up `Step::Challenge`, which [`LivenessEngine::run`] executes in a loop, so
//! escalation never grows the call stack. Every read-modify-write of a record happens
//! under the store's per-user lock.

use crate::clock::Clock;
use crate::config::ActivityCheckConfig;
use crate::error::{Result, VigilError};
use crate::ledger::ReputationLedger;
use crate::model::{
    is_timer_stale, ActivityCheckEvent, ChatId, LivenessRecord, MessageRef, UserId, UserRef,
};
use crate::notifier::{AlertChannels, Notifier, ResponseControl};
use crate::scheduler::{Job, TimerQueue};
use crate::store::LivenessStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CHALLENGE_TEXT: &str = "Hey! Still alive? Please answer with the button below.";
pub const CHALLENGE_BUTTON: &str = "🟢 Yes, I'm here!";
pub const ANSWERED_TEXT: &str = "Hey! Still alive? ✅ Yes!";

/// Timing and reward knobs, resolved from [`ActivityCheckConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Wait after a sweep challenge.
    pub response_timeout: Duration,
    /// Timeouts tolerated before deactivation (≥ 1).
    pub max_retries: u32,
    /// Wait after a retry challenge.
    pub retry_interval: Duration,
    /// Points per confirmed response.
    pub reward: i64,
    pub channels: AlertChannels,
}

impl EngineSettings {
    pub fn from_config(cfg: &ActivityCheckConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            response_timeout: cfg.response_timeout(),
            max_retries: cfg.max_retries,
            retry_interval: cfg.retry_interval(),
            reward: cfg.rewards.alive_score,
            channels: cfg.alert_channels()?,
        })
    }
}

/// Why a challenge is being issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Part of the recurring sweep; re-admits inactive users.
    Sweep,
    /// Escalation after a timeout. Only proceeds while the record still carries the
    /// deadline that timeout wrote; anything that moved it in between wins.
    Retry { expected_deadline: DateTime<Utc> },
}

/// A unit of engine work.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Challenge { user: UserRef, kind: ChallengeKind },
    /// A timer armed for `armed_deadline` fired.
    Timeout { user: UserId, armed_deadline: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeOutcome {
    Issued {
        message: MessageRef,
        deadline: DateTime<Utc>,
        timer_armed: bool,
    },
    /// Transport refused the prompt; the next sweep tries again.
    SendFailed,
    /// A retry found nothing left to escalate (answered, deactivated or re-challenged meanwhile).
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutOutcome {
    /// Superseded, answered, premature or inactive: nothing changed.
    Stale,
    NoRecord,
    /// Budget remains; the caller should re-challenge `user`.
    Retry {
        user: UserRef,
        retry_count: u32,
        remaining: u32,
        /// Deadline persisted for the retry; the follow-up challenge must still see it.
        deadline: DateTime<Utc>,
    },
    Deactivated { retry_count: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    /// State reset. `total` is the post-award score when the ledger could report it.
    Accepted { awarded: bool, total: Option<i64> },
    /// Late answer from a deactivated user; state untouched.
    Inactive,
    /// Unknown user or no outstanding challenge (e.g. a second tap).
    NotChallenged,
}

/// An acknowledgement coming back from the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundResponse {
    pub user: UserRef,
    /// Transport handle for the used control (callback query id on Telegram).
    pub control_ref: Option<String>,
    /// The challenge message that carried the control.
    pub message: Option<MessageRef>,
}

/// Counters for one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub users: usize,
    pub issued: usize,
    pub failed: usize,
}

/// Orchestrates notifier, ledger, store and timers for every user.
pub struct LivenessEngine {
    store: Arc<LivenessStore>,
    notifier: Arc<dyn Notifier>,
    ledger: Arc<dyn ReputationLedger>,
    timers: Arc<dyn TimerQueue>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl LivenessEngine {
    pub fn new(
        store: Arc<LivenessStore>,
        notifier: Arc<dyn Notifier>,
        ledger: Arc<dyn ReputationLedger>,
        timers: Arc<dyn TimerQueue>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            notifier,
            ledger,
            timers,
            clock,
            settings,
        }
    }

    /// Executes `step` and every follow-up it produces.
    pub async fn run(self: &Arc<Self>, step: Step) {
        let mut next = Some(step);
        while let Some(step) = next.take() {
            next = match step {
                Step::Challenge { user, kind } => {
                    if let Err(e) = self.issue_challenge(&user, kind).await {
                        log_step_error("challenge", user.id, &e);
                    }
                    None
                }
                Step::Timeout {
                    user,
                    armed_deadline,
                } => match self.handle_timeout(user, armed_deadline).await {
                    Ok(TimeoutOutcome::Retry { user, deadline, .. }) => Some(Step::Challenge {
                        user,
                        kind: ChallengeKind::Retry {
                            expected_deadline: deadline,
                        },
                    }),
                    Ok(_) => None,
                    Err(e) => {
                        log_step_error("timeout", user, &e);
                        None
                    }
                },
            };
        }
    }

    /// `step` packaged for the scheduler.
    pub fn job(self: &Arc<Self>, step: Step) -> Job {
        let engine = Arc::clone(self);
        Box::pin(async move { engine.run(step).await })
    }

    /// The recurring sweep packaged for the scheduler.
    pub fn sweep_job(self: &Arc<Self>) -> Job {
        let engine = Arc::clone(self);
        Box::pin(async move {
            engine.sweep().await;
        })
    }

    /// Re-arms the timeout of every challenge still outstanding in the store. Timers live
    /// only in memory, so a restarted process calls this once before the first sweep;
    /// deadlines already in the past fire straight away.
    pub fn resume_outstanding(self: &Arc<Self>) -> Result<usize> {
        let now = self.clock.now();
        let mut armed = 0;
        for record in self.store.records()? {
            let Some(deadline) = record.next_check_deadline else {
                continue;
            };
            if !record.is_active || record.pending_message.is_none() {
                continue;
            }
            let wait = (deadline - now).to_std().unwrap_or(Duration::ZERO);
            let step = Step::Timeout {
                user: record.user_id,
                armed_deadline: deadline,
            };
            if self.timers.schedule_once(wait, self.job(step)) {
                armed += 1;
            }
        }
        info!(target: "vigil::engine", armed, "outstanding timeouts re-armed");
        Ok(armed)
    }

    /// Challenges every user in the directory, whatever their current state.
    pub async fn sweep(self: &Arc<Self>) -> SweepReport {
        let users = match self.ledger.list_all_users().await {
            Ok(users) => users,
            Err(e) => {
                self.alert(&format!("Error getting users for activity check: {e}"))
                    .await;
                return SweepReport::default();
            }
        };

        let mut report = SweepReport {
            users: users.len(),
            ..SweepReport::default()
        };
        info!(target: "vigil::engine", users = report.users, "sweep started");

        for user in users {
            match self.issue_challenge(&user, ChallengeKind::Sweep).await {
                Ok(ChallengeOutcome::Issued { .. }) => report.issued += 1,
                Ok(_) => report.failed += 1,
                Err(VigilError::ShutDown) => {
                    debug!(target: "vigil::engine", "sweep aborted: store shut down");
                    report.failed += 1;
                    break;
                }
                Err(e) => {
                    log_step_error("challenge", user.id, &e);
                    report.failed += 1;
                }
            }
        }

        info!(
            target: "vigil::engine",
            users = report.users,
            issued = report.issued,
            failed = report.failed,
            "sweep finished"
        );
        report
    }

    /// Sends a challenge and arms its timeout.
    pub async fn issue_challenge(
        self: &Arc<Self>,
        user: &UserRef,
        kind: ChallengeKind,
    ) -> Result<ChallengeOutcome> {
        let _guard = self.store.lock_user(user.id).await;

        let mut record = match (self.store.get(user.id)?, kind) {
            (Some(record), ChallengeKind::Sweep) => record,
            (None, ChallengeKind::Sweep) => LivenessRecord::new(user, self.clock.now()),
            (Some(record), ChallengeKind::Retry { expected_deadline })
                if record.is_active
                    && record.pending_message.is_some()
                    && record.next_check_deadline == Some(expected_deadline) =>
            {
                record
            }
            (_, ChallengeKind::Retry { .. }) => {
                debug!(target: "vigil::engine", user_id = %user.id, "retry skipped: nothing outstanding");
                return Ok(ChallengeOutcome::Skipped);
            }
        };

        let control = ResponseControl::alive(user.id, CHALLENGE_BUTTON);
        let message = match self
            .notifier
            .send(ChatId::from(user.id), CHALLENGE_TEXT, Some(&control))
            .await
        {
            Ok(message) => message,
            Err(e) => {
                debug!(
                    target: "vigil::engine",
                    user_id = %user.id,
                    error = %e,
                    "challenge not delivered; waiting for next sweep"
                );
                return Ok(ChallengeOutcome::SendFailed);
            }
        };

        let wait = match kind {
            ChallengeKind::Sweep => self.settings.response_timeout,
            ChallengeKind::Retry { .. } => self.settings.retry_interval,
        };
        let now = self.clock.now();
        let deadline = deadline_after(now, wait);

        if kind == ChallengeKind::Sweep && !record.is_active {
            info!(target: "vigil::engine", user_id = %user.id, "inactive user re-admitted by sweep");
            record.is_active = true;
            record.retry_count = 0;
        }
        if !user.username.is_empty() {
            record.username = user.username.clone();
        }
        record.last_check_time = now;
        record.next_check_deadline = Some(deadline);
        record.pending_message = Some(message);
        self.save(&record).await?;

        let timer_armed = self.timers.schedule_once(
            wait,
            self.job(Step::Timeout {
                user: user.id,
                armed_deadline: deadline,
            }),
        );
        if !timer_armed {
            debug!(target: "vigil::engine", user_id = %user.id, "timeout not armed: scheduler stopped");
        }

        debug!(
            target: "vigil::engine",
            user_id = %user.id,
            kind = ?kind,
            deadline = %deadline,
            retry_count = record.retry_count,
            "challenge issued"
        );
        Ok(ChallengeOutcome::Issued {
            message,
            deadline,
            timer_armed,
        })
    }

    /// Applies one expired timer. Never re-challenges by itself; see [`TimeoutOutcome::Retry`].
    pub async fn handle_timeout(
        &self,
        user: UserId,
        armed_deadline: DateTime<Utc>,
    ) -> Result<TimeoutOutcome> {
        let guard = self.store.lock_user(user).await;
        let now = self.clock.now();

        let Some(mut record) = self.store.get(user)? else {
            return Ok(TimeoutOutcome::NoRecord);
        };
        if is_timer_stale(&record, armed_deadline, now) {
            debug!(target: "vigil::engine", user_id = %user, armed = %armed_deadline, "stale timer ignored");
            return Ok(TimeoutOutcome::Stale);
        }

        record.retry_count = record.retry_count.saturating_add(1);
        let max = self.settings.max_retries;

        if record.retry_count >= max {
            record.is_active = false;
            self.save(&record).await?;
            drop(guard);

            warn!(target: "vigil::engine", user_id = %user, retry_count = record.retry_count, "user deactivated");
            self.alert(&format!(
                "User {} is no longer responding! Marked inactive. 💀",
                record.username
            ))
            .await;
            return Ok(TimeoutOutcome::Deactivated {
                retry_count: record.retry_count,
            });
        }

        let remaining = max - record.retry_count;
        let deadline = deadline_after(now, self.settings.retry_interval);
        record.next_check_deadline = Some(deadline);
        self.save(&record).await?;
        drop(guard);

        self.warning(&format!(
            "User {} still hasn't answered! Checking {} more time(s).",
            record.username, remaining
        ))
        .await;
        Ok(TimeoutOutcome::Retry {
            user: UserRef {
                id: record.user_id,
                username: record.username,
            },
            retry_count: record.retry_count,
            remaining,
            deadline,
        })
    }

    /// Applies an "I'm alive" acknowledgement, then closes the loop with the transport
    /// (the control is acknowledged and the prompt edited even when the answer is ignored).
    pub async fn handle_response(&self, response: &InboundResponse) -> Result<ResponseOutcome> {
        let outcome = self.apply_response(response).await;

        if let Some(control_ref) = response.control_ref.as_deref() {
            if let Err(e) = self.notifier.acknowledge(control_ref).await {
                warn!(target: "vigil::engine", error = %e, "control acknowledge failed");
            }
        }
        if let Some(message) = response.message {
            let total = match &outcome {
                Ok(ResponseOutcome::Accepted { total, .. }) => *total,
                _ => None,
            };
            if let Err(e) = self.notifier.edit(message, &answered_text(total)).await {
                warn!(target: "vigil::engine", error = %e, "challenge edit failed");
            }
        }
        outcome
    }

    async fn apply_response(&self, response: &InboundResponse) -> Result<ResponseOutcome> {
        let user = &response.user;
        let guard = self.store.lock_user(user.id).await;
        let now = self.clock.now();

        let Some(mut record) = self.store.get(user.id)? else {
            return Ok(ResponseOutcome::NotChallenged);
        };
        if !record.is_active {
            info!(target: "vigil::engine", user_id = %user.id, "late response from inactive user ignored");
            return Ok(ResponseOutcome::Inactive);
        }
        let Some(pending) = record.pending_message else {
            debug!(target: "vigil::engine", user_id = %user.id, "no outstanding challenge");
            return Ok(ResponseOutcome::NotChallenged);
        };
        if response.message.is_some_and(|m| m != pending) {
            debug!(target: "vigil::engine", user_id = %user.id, "answer came from an earlier challenge");
        }

        record.last_response_time = Some(now);
        record.retry_count = 0;
        record.is_active = true;
        record.pending_message = None;
        if !user.username.is_empty() {
            record.username = user.username.clone();
        }
        self.save(&record).await?;
        drop(guard);

        let reward = self.settings.reward;
        let event = ActivityCheckEvent {
            user_id: user.id,
            username: record.username.clone(),
            checked_at: now,
            responded: true,
            points: reward,
        };
        if let Err(e) = self.store.append_event(&event) {
            self.alert(&format!(
                "Error saving activity check for user {}: {e}",
                record.username
            ))
            .await;
        }

        if let Err(e) = self.ledger.add_points(user.id, reward).await {
            self.alert(&format!(
                "Error awarding points to user {}: {e}",
                record.username
            ))
            .await;
            return Ok(ResponseOutcome::Accepted {
                awarded: false,
                total: None,
            });
        }

        let total = match self.ledger.alive_score(user.id).await {
            Ok(total) => Some(total),
            Err(e) => {
                warn!(target: "vigil::engine", user_id = %user.id, error = %e, "score read failed");
                None
            }
        };
        let total_text = total.map_or_else(|| "?".to_string(), |t| t.to_string());
        self.alert(&format!(
            "User {} is alive! 🎉 +{reward} points (total {total_text}).",
            record.username
        ))
        .await;

        Ok(ResponseOutcome::Accepted {
            awarded: true,
            total,
        })
    }

    async fn save(&self, record: &LivenessRecord) -> Result<()> {
        if let Err(e) = self.store.put(record) {
            if !matches!(e, VigilError::ShutDown) {
                self.alert(&format!(
                    "Error saving activity status for user {}: {e}",
                    record.username
                ))
                .await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn alert(&self, text: &str) {
        self.settings.channels.alert(self.notifier.as_ref(), text).await;
    }

    async fn warning(&self, text: &str) {
        self.settings.channels.warning(self.notifier.as_ref(), text).await;
    }
}

/// Text the answered prompt is edited to; shows the new alive score when known.
pub fn answered_text(total: Option<i64>) -> String {
    match total {
        Some(total) => format!("{ANSWERED_TEXT}\nYour alive score: {total}"),
        None => ANSWERED_TEXT.to_string(),
    }
}

/// `now + wait`, saturating at the far end of the calendar.
fn deadline_after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn log_step_error(step: &str, user: UserId, e: &VigilError) {
    match e {
        VigilError::ShutDown => {
            debug!(target: "vigil::engine", step, user_id = %user, "dropped after shutdown")
        }
        e => warn!(target: "vigil::engine", step, user_id = %user, error = %e, "step failed"),
    }
}
