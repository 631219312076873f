//! vigil-core: activity-check liveness scheduler for a chat bot.
//!
//! A cron sweep challenges every known user; silence escalates through bounded retries
//! to deactivation, and a confirmed response resets state and credits reputation.
//! Transport and ledger sit behind traits so the daemon (or a test) can plug in its own.

mod clock;
mod config;
mod engine;
mod error;
mod ledger;
mod model;
mod notifier;
mod scheduler;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ActivityCheckConfig, AppConfig, ChannelsConfig, RewardsConfig, VigilConfig};
pub use engine::{
    answered_text, ChallengeKind, ChallengeOutcome, EngineSettings, InboundResponse,
    LivenessEngine, ResponseOutcome, Step, SweepReport, TimeoutOutcome, ANSWERED_TEXT,
    CHALLENGE_BUTTON, CHALLENGE_TEXT,
};
pub use error::{Result, VigilError};
pub use ledger::{ReputationLedger, ReputationRecord, SledLedger};
pub use model::{
    is_timer_stale, ActivityCheckEvent, ChatId, LivenessRecord, LivenessState, MessageRef,
    UserId, UserRef, TIMER_SLACK_MS,
};
pub use notifier::{
    parse_alive_payload, AlertChannels, Notifier, ResponseControl, ALIVE_CALLBACK_PREFIX,
};
pub use scheduler::{parse_schedule, Job, Scheduler, TimerQueue};
pub use store::LivenessStore;
