#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;
use taskmarket::application::marketplace::Marketplace;
use taskmarket::config::MarketConfig;
use taskmarket::domain::account::{Amount, UserTier};
use taskmarket::domain::clock::ManualClock;
use taskmarket::domain::task::{Evidence, NewTask, Task, TaskExecution, TaskKind};
use taskmarket::domain::UserId;
use taskmarket::infrastructure::in_memory::{InMemoryBackend, RecordingNotifier, StaticVerifier};

pub const CHANNEL: &str = "@news_room";

/// A marketplace over in-memory storage with a controllable clock and verifier.
pub struct Harness {
    pub market: Marketplace,
    pub clock: ManualClock,
    pub verifier: StaticVerifier,
    pub notifier: RecordingNotifier,
    pub backend: Arc<InMemoryBackend>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(MarketConfig::default())
    }

    pub fn with_config(config: MarketConfig) -> Self {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap());
        let verifier = StaticVerifier::new();
        let notifier = RecordingNotifier::new();
        let backend = Arc::new(InMemoryBackend::new());
        let market = Marketplace::new(
            backend.clone(),
            Arc::new(verifier.clone()),
            Arc::new(notifier.clone()),
            Arc::new(clock.clone()),
            config,
        );
        Self {
            market,
            clock,
            verifier,
            notifier,
            backend,
        }
    }

    /// Opens an account and deposits `balance` into it, if positive.
    pub async fn funded(&self, user: UserId, balance: Decimal) {
        self.market.open_account(user, UserTier::Basic).await.unwrap();
        if balance > Decimal::ZERO {
            self.market.deposit(user, amount(balance)).await.unwrap();
        }
    }

    pub async fn subscription_task(&self, author: UserId, reward: Decimal, executions: u32) -> Task {
        self.market
            .create_task(
                author,
                NewTask::new(TaskKind::ChannelSubscription, CHANNEL, amount(reward), executions),
            )
            .await
            .unwrap()
    }

    /// Starts and submits an execution of `task` by `user`.
    pub async fn submitted(&self, task: &Task, user: UserId) -> TaskExecution {
        let execution = self.market.start_execution(task.id, user).await.unwrap();
        self.market
            .submit_execution(execution.id, user, Evidence::default())
            .await
            .unwrap()
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.clock.advance(chrono::Duration::minutes(minutes));
    }
}

pub fn amount(value: Decimal) -> Amount {
    Amount::new(value).unwrap()
}

/// Writes a command script with the standard header.
pub fn write_script(path: &Path, rows: &[&str]) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record([
        "op", "user", "task", "execution", "amount", "count", "code", "password", "target", "kind",
        "tier",
    ])?;
    for row in rows {
        let mut fields: Vec<&str> = row.split(',').map(str::trim).collect();
        fields.resize(11, "");
        wtr.write_record(&fields)?;
    }
    wtr.flush()?;
    Ok(())
}
