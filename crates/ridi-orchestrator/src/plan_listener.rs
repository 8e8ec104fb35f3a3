// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plan queue consumer.
//!
//! Leases batches of plan notifications from the queue and dispatches each
//! on its own task. A message stays invisible to other readers while it is
//! handled: its lease is extended periodically until the dispatcher returns.
//! The dispatcher's outcome decides whether the message is deleted or
//! redelivered later.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ridi_core::Persistence;
use ridi_core::models::{PlanQueueMessage, PlanState};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchOutcome, PlanDispatcher};
use crate::error::Result;

/// Plan listener configuration.
#[derive(Debug, Clone)]
pub struct PlanListenerConfig {
    /// Lease taken on read and renewed while handling.
    pub visibility_timeout: Duration,
    /// Messages leased per poll.
    pub batch_size: i64,
    /// Time between polls.
    pub poll_interval: Duration,
    /// Lease renewal period.
    pub keep_alive_interval: Duration,
    /// Redelivery delay after a dispatch error.
    pub error_retry_after: Duration,
    /// Deliveries after which a failing message is dropped.
    pub max_reads: i64,
    /// Deliveries after which a plan still waiting for its router is failed.
    pub max_retry_reads: i64,
}

impl Default for PlanListenerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(5),
            batch_size: 100,
            poll_interval: Duration::from_millis(200),
            keep_alive_interval: Duration::from_secs(4),
            error_retry_after: Duration::from_secs(30),
            max_reads: 6,
            max_retry_reads: 120,
        }
    }
}

fn secs(d: Duration) -> i64 {
    d.as_secs_f64().ceil() as i64
}

/// Consumes plan notifications.
#[derive(Clone)]
pub struct PlanListener {
    store: Arc<dyn Persistence>,
    dispatcher: Arc<PlanDispatcher>,
    config: PlanListenerConfig,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl PlanListener {
    /// Create a new listener.
    pub fn new(
        store: Arc<dyn Persistence>,
        dispatcher: Arc<PlanDispatcher>,
        config: PlanListenerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Flag set while the poll loop runs.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Whether the poll loop runs.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Poll until shutdown is signalled, then wait for in-flight messages.
    pub async fn run(self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Plan listener started"
        );

        let mut tasks = JoinSet::new();
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Plan listener shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self
                        .store
                        .plan_queue_read(secs(self.config.visibility_timeout), self.config.batch_size)
                        .await
                    {
                        Ok(messages) => {
                            for message in messages {
                                let listener = self.clone();
                                tasks.spawn(async move {
                                    let msg_id = message.msg_id;
                                    if let Err(e) = listener.handle_message(message).await {
                                        error!(msg_id, error = %e, "Failed to settle plan message");
                                    }
                                });
                            }
                        }
                        Err(e) => error!(error = %e, "Failed to read plan queue"),
                    }
                    while let Some(joined) = tasks.try_join_next() {
                        if let Err(e) = joined {
                            error!(error = %e, "Plan message task panicked");
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Dispatch one message and settle it.
    pub async fn handle_message(&self, message: PlanQueueMessage) -> Result<()> {
        debug!(msg_id = message.msg_id, plan_id = %message.plan_id, read_ct = message.read_ct, "Plan message received");

        let keep_alive = tokio::spawn(keep_alive(
            self.store.clone(),
            message.msg_id,
            self.config.keep_alive_interval,
            secs(self.config.visibility_timeout),
        ));
        let outcome = self
            .dispatcher
            .handle_plan_notification(&message.plan_id)
            .await;
        keep_alive.abort();

        match outcome {
            Ok(DispatchOutcome::RetryAfter(_)) if message.read_ct >= self.config.max_retry_reads => {
                error!(
                    msg_id = message.msg_id,
                    plan_id = %message.plan_id,
                    read_ct = message.read_ct,
                    "Router never became available, giving up"
                );
                self.dispatcher.abandon(&message.plan_id).await;
                self.store
                    .plan_set_state(&message.plan_id, PlanState::Error)
                    .await?;
                self.store.plan_queue_delete(message.msg_id).await?;
            }
            Ok(DispatchOutcome::RetryAfter(delay)) => {
                self.store
                    .plan_queue_set_visibility(message.msg_id, secs(delay))
                    .await?;
            }
            Ok(DispatchOutcome::Done) => {
                self.store.plan_queue_delete(message.msg_id).await?;
            }
            Ok(DispatchOutcome::Failed) => {
                self.dispatcher.abandon(&message.plan_id).await;
                self.store.plan_queue_delete(message.msg_id).await?;
            }
            Err(e) if message.read_ct < self.config.max_reads => {
                let retry_in = secs(self.config.error_retry_after);
                error!(
                    msg_id = message.msg_id,
                    plan_id = %message.plan_id,
                    read_ct = message.read_ct,
                    retry_in_secs = retry_in,
                    error = %e,
                    "Plan message error, retry"
                );
                self.dispatcher.abandon(&message.plan_id).await;
                self.store
                    .plan_queue_set_visibility(message.msg_id, retry_in)
                    .await?;
                if let Err(e) = self
                    .store
                    .plan_set_state(&message.plan_id, PlanState::Error)
                    .await
                {
                    warn!(plan_id = %message.plan_id, error = %e, "Failed to mark plan as error");
                }
            }
            Err(e) => {
                error!(
                    msg_id = message.msg_id,
                    plan_id = %message.plan_id,
                    read_ct = message.read_ct,
                    error = %e,
                    "Plan message error, giving up"
                );
                self.dispatcher.abandon(&message.plan_id).await;
                self.store.plan_queue_delete(message.msg_id).await?;
            }
        }
        Ok(())
    }
}

async fn keep_alive(store: Arc<dyn Persistence>, msg_id: i64, period: Duration, lease_secs: i64) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        interval.tick().await;
        if let Err(e) = store.plan_queue_set_visibility(msg_id, lease_secs).await {
            warn!(msg_id, error = %e, "Failed to extend plan message lease");
        }
    }
}
