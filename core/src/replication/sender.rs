//! Replication sender
//!
//! One task per destination. Each cycle ships the next slice of the change log
//! after the destination's cursor, then advances the cursor over the items the
//! destination accepted. Failures back off exponentially; a write to local
//! storage wakes an idle sender immediately.

use super::backoff::Backoff;
use super::protocol::{
    accepted_prefix, Heartbeat, ReplicationAck, ReplicationBatch, ReplicationMessage,
    ReplicationReply,
};
use super::stats::SenderStats;
use crate::config::ReplicationConfig;
use crate::network::Transport;
use crate::storage::Storage;
use crate::types::{now_millis, Destination};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Result of one sender cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// A full batch went out; more changes are probably waiting
    More,
    /// Caught up with the change log
    Idle,
}

pub struct Sender {
    storage: Arc<Storage>,
    transport: Arc<dyn Transport>,
    destination: Destination,
    config: ReplicationConfig,
    backoff: Backoff,
    stats: Arc<Mutex<SenderStats>>,
    cursor: u64,
    last_exchange: Instant,
}

impl Sender {
    pub fn new(
        storage: Arc<Storage>,
        transport: Arc<dyn Transport>,
        destination: Destination,
        config: ReplicationConfig,
    ) -> Result<Self> {
        let cursor = storage.cursor(&destination.node_id)?;
        let backoff = Backoff::new(config.backoff_base(), config.backoff_max());
        let stats = SenderStats {
            cursor,
            ..SenderStats::default()
        };
        Ok(Self {
            storage,
            transport,
            destination,
            config,
            backoff,
            stats: Arc::new(Mutex::new(stats)),
            cursor,
            last_exchange: Instant::now(),
        })
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Shared handle to this sender's counters
    pub fn stats(&self) -> Arc<Mutex<SenderStats>> {
        Arc::clone(&self.stats)
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let storage = Arc::clone(&self.storage);
        let mut failures: u32 = 0;

        tracing::info!(destination = %self.destination, cursor = self.cursor, "Replication sender started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Registered before the cycle so a commit racing with it still wakes us.
            let notified = storage.changed().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = self.cycle() => outcome,
            };

            let delay = match outcome {
                Ok(Cycle::More) => {
                    failures = 0;
                    continue;
                }
                Ok(Cycle::Idle) => {
                    failures = 0;
                    self.until_heartbeat().min(self.config.poll_interval())
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.backoff.delay(failures);
                    self.update_stats(|s| s.record_failure(e.to_string()));
                    tracing::warn!(
                        destination = %self.destination,
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Replication failed, backing off"
                    );
                    delay
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = &mut notified, if failures == 0 => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(destination = %self.destination, "Replication sender stopped");
    }

    /// Ship one batch, or a heartbeat when idle long enough
    pub async fn cycle(&mut self) -> Result<Cycle> {
        let batch_size = self.config.batch_size;
        let changes = self.storage.changes_since(self.cursor, batch_size)?;

        if changes.is_empty() {
            if self.until_heartbeat().is_zero() {
                self.heartbeat().await?;
            }
            return Ok(Cycle::Idle);
        }

        let full = changes.len() >= batch_size;
        let batch = ReplicationBatch::from_changes(self.storage.node_id(), changes);
        let item_count = batch.items.len();

        let ack = self
            .exchange(ReplicationMessage::Batch(batch.clone()))
            .await?;
        if ack.statuses.len() != item_count {
            return Err(Error::ReplicationUnavailable(format!(
                "{} acknowledged {} of {} items",
                self.destination,
                ack.statuses.len(),
                item_count
            )));
        }

        for (item, status) in batch.items.iter().zip(&ack.statuses) {
            if item.is_tombstone() && status.is_accepted() {
                self.storage
                    .acknowledge_tombstone(&item.identity, item.seq, self.destination.node_id)?;
            }
        }

        let accepted = accepted_prefix(&batch.items, &ack.statuses);
        if let Some(seq) = accepted {
            self.advance_cursor(seq)?;
        }

        let now = now_millis();
        let cursor = self.cursor;
        self.update_stats(|s| {
            s.batches_sent += 1;
            s.items_sent += item_count as u64;
            s.cursor = cursor;
        });

        if accepted != batch.last_seq() {
            let rejected = ack.statuses.iter().filter(|s| !s.is_accepted()).count();
            return Err(Error::ReplicationUnavailable(format!(
                "{} rejected {} items",
                self.destination, rejected
            )));
        }

        self.update_stats(|s| s.record_success(now));
        tracing::debug!(
            destination = %self.destination,
            items = item_count,
            cursor = self.cursor,
            "Batch replicated"
        );

        Ok(if full { Cycle::More } else { Cycle::Idle })
    }

    async fn heartbeat(&mut self) -> Result<()> {
        let message = ReplicationMessage::Heartbeat(Heartbeat::new(self.storage.node_id()));
        let ack = self.exchange(message).await?;

        if ack.last_accepted_seq < self.cursor {
            tracing::warn!(
                destination = %self.destination,
                cursor = self.cursor,
                peer_position = ack.last_accepted_seq,
                "Destination is behind our cursor, rewinding"
            );
            self.cursor = ack.last_accepted_seq;
            self.storage
                .save_cursor(&self.destination.node_id, self.cursor)?;
        }

        let now = now_millis();
        let cursor = self.cursor;
        self.update_stats(|s| {
            s.heartbeats_sent += 1;
            s.cursor = cursor;
            s.record_success(now);
        });
        Ok(())
    }

    /// Send one message and check the reply came from the expected node
    async fn exchange(&mut self, message: ReplicationMessage) -> Result<ReplicationAck> {
        let timeout = self.config.request_timeout();
        let reply = tokio::time::timeout(timeout, self.transport.send(&self.destination, message))
            .await
            .map_err(|_| {
                Error::ReplicationUnavailable(format!(
                    "{} did not answer within {:?}",
                    self.destination, timeout
                ))
            })??;

        match reply {
            ReplicationReply::Ack(ack) => {
                if ack.responder != self.destination.node_id {
                    return Err(Error::ReplicationUnavailable(format!(
                        "expected {} at {}, reached {}",
                        self.destination.node_id, self.destination.address, ack.responder
                    )));
                }
                self.last_exchange = Instant::now();
                Ok(ack)
            }
            ReplicationReply::Reject(reason) => Err(Error::MalformedBatch(format!(
                "{} rejected the message: {}",
                self.destination, reason
            ))),
        }
    }

    fn advance_cursor(&mut self, seq: u64) -> Result<()> {
        if seq > self.cursor {
            self.storage.save_cursor(&self.destination.node_id, seq)?;
            self.cursor = seq;
        }
        Ok(())
    }

    fn until_heartbeat(&self) -> Duration {
        self.config
            .heartbeat_interval()
            .saturating_sub(self.last_exchange.elapsed())
    }

    fn update_stats(&self, f: impl FnOnce(&mut SenderStats)) {
        let mut stats = self.stats.lock();
        f(&mut stats);
    }
}
