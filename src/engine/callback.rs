use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::error::{EngineError, EngineResult};
use super::store::{RunStore, WaiterTransition};
use super::types::{CallbackToken, CallbackWaiter, RunId, WaiterResolution};
use crate::observability::EngineMetrics;

/// Sent when a waiter times out so the owning run can be re-driven.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeSignal {
    pub run_id: RunId,
    pub callback_token: CallbackToken,
}

/// Answer to an external delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome")]
pub enum DeliveryOutcome {
    /// This delivery resolved the waiter.
    Accepted,
    /// The waiter was already resolved; the recorded resolution is returned.
    AlreadyResolved { resolution: WaiterResolution },
}

impl DeliveryOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliveryOutcome::Accepted)
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryOutcome::Accepted => f.write_str("Accepted"),
            DeliveryOutcome::AlreadyResolved { .. } => f.write_str("AlreadyResolved"),
        }
    }
}

/// Resolves parked waiters and owns their timeout timers.
///
/// Each waiter moves out of `Pending` exactly once. Delivery and timeout race
/// on the store's compare-and-set, so a writer in another process sharing
/// the store is seen too; the loser observes the recorded resolution.
pub struct CallbackGateway {
    store: Arc<dyn RunStore>,
    timers: Mutex<HashMap<CallbackToken, AbortHandle>>,
    resume_tx: mpsc::UnboundedSender<ResumeSignal>,
    metrics: Arc<EngineMetrics>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CallbackGateway {
    pub fn new(
        store: Arc<dyn RunStore>,
        resume_tx: mpsc::UnboundedSender<ResumeSignal>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            timers: Mutex::new(HashMap::new()),
            resume_tx,
            metrics,
        })
    }

    /// Park a new waiter and schedule its timeout.
    pub async fn register_waiter(
        self: &Arc<Self>,
        run_id: &RunId,
        branch_id: &str,
        timeout: Duration,
    ) -> EngineResult<CallbackToken> {
        let registered_at = Utc::now();
        let timeout = chrono::Duration::from_std(timeout).map_err(|e| {
            EngineError::InvalidConfiguration {
                reason: format!("callback timeout out of range: {e}"),
            }
        })?;
        let waiter = CallbackWaiter {
            callback_token: CallbackToken::generate(),
            run_id: run_id.clone(),
            branch_id: branch_id.to_string(),
            registered_at,
            timeout_at: registered_at + timeout,
            resolution: WaiterResolution::Pending,
        };
        self.store.save_waiter(&waiter).await?;

        let token = waiter.callback_token.clone();
        let timeout_at = waiter.timeout_at;
        self.schedule_timeout(token.clone(), timeout_at);

        info!(
            run_id = %run_id,
            branch = %branch_id,
            callback_token = %token,
            timeout_at = %timeout_at,
            "Callback waiter registered"
        );
        Ok(token)
    }

    /// Resolve a waiter with an externally supplied payload.
    pub async fn deliver(&self, token: &CallbackToken, payload: Value) -> EngineResult<DeliveryOutcome> {
        let (outcome, _) = self
            .resolve(token, WaiterResolution::Delivered { payload })
            .await?;
        self.cancel_timer(token);
        if outcome.is_accepted() {
            self.metrics.record_callback_delivered();
            info!(callback_token = %token, "Callback delivered");
        } else {
            debug!(callback_token = %token, "Duplicate callback delivery ignored");
        }
        Ok(outcome)
    }

    /// Resolve a waiter as timed out and signal its run.
    pub async fn fire_timeout(&self, token: &CallbackToken) -> EngineResult<DeliveryOutcome> {
        let (outcome, waiter) = self.resolve(token, WaiterResolution::TimedOut).await?;
        if outcome.is_accepted() {
            self.metrics.record_callback_timed_out();
            info!(run_id = %waiter.run_id, callback_token = %token, "Callback timed out");
            let signal = ResumeSignal {
                run_id: waiter.run_id,
                callback_token: token.clone(),
            };
            if self.resume_tx.send(signal).is_err() {
                debug!(callback_token = %token, "No resumer listening; run resumes on recovery");
            }
        } else {
            debug!(callback_token = %token, "Timer fired for an already resolved waiter");
        }
        Ok(outcome)
    }

    pub async fn resolution(&self, token: &CallbackToken) -> EngineResult<Option<WaiterResolution>> {
        Ok(self.waiter(token).await?.map(|waiter| waiter.resolution))
    }

    pub async fn waiter(&self, token: &CallbackToken) -> EngineResult<Option<CallbackWaiter>> {
        Ok(self.store.load_waiter(token).await?)
    }

    /// Pending waiters of one run, as persisted.
    pub async fn pending_for_run(&self, run_id: &RunId) -> EngineResult<Vec<CallbackWaiter>> {
        Ok(self
            .store
            .list_waiters_for_run(run_id)
            .await?
            .into_iter()
            .filter(|waiter| waiter.resolution.is_pending())
            .collect())
    }

    /// Rebuild timers for every persisted pending waiter. Waiters whose
    /// deadline has already passed time out immediately.
    pub async fn recover(self: &Arc<Self>) -> EngineResult<usize> {
        let mut rescheduled = 0;
        for waiter in self.store.list_waiters().await? {
            if !waiter.resolution.is_pending() {
                continue;
            }
            let token = waiter.callback_token;
            if !lock(&self.timers).contains_key(&token) {
                self.schedule_timeout(token, waiter.timeout_at);
                rescheduled += 1;
            }
        }
        info!(rescheduled, "Callback timers recovered");
        Ok(rescheduled)
    }

    /// Abort every outstanding timer. Timers are rebuilt by `recover`.
    pub fn shutdown(&self) {
        let mut timers = lock(&self.timers);
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    pub fn pending_timers(&self) -> usize {
        lock(&self.timers).len()
    }

    async fn resolve(
        &self,
        token: &CallbackToken,
        resolution: WaiterResolution,
    ) -> EngineResult<(DeliveryOutcome, CallbackWaiter)> {
        match self.store.resolve_waiter(token, &resolution).await? {
            WaiterTransition::Applied(waiter) => Ok((DeliveryOutcome::Accepted, waiter)),
            WaiterTransition::AlreadyResolved(waiter) => Ok((
                DeliveryOutcome::AlreadyResolved {
                    resolution: waiter.resolution.clone(),
                },
                waiter,
            )),
            WaiterTransition::Missing => Err(EngineError::UnknownCallback {
                token: token.clone(),
            }),
        }
    }

    fn schedule_timeout(self: &Arc<Self>, token: CallbackToken, timeout_at: DateTime<Utc>) {
        let delay = (timeout_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let gateway: Weak<Self> = Arc::downgrade(self);
        let timer_token = token.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(gateway) = gateway.upgrade() else {
                return;
            };
            lock(&gateway.timers).remove(&timer_token);
            if let Err(e) = gateway.fire_timeout(&timer_token).await {
                warn!(callback_token = %timer_token, error = %e, "Failed to record callback timeout");
            }
        });

        if let Some(previous) = lock(&self.timers).insert(token, handle.abort_handle()) {
            previous.abort();
        }
    }

    fn cancel_timer(&self, token: &CallbackToken) {
        if let Some(handle) = lock(&self.timers).remove(token) {
            handle.abort();
        }
    }
}

impl Drop for CallbackGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::MemoryStore;
    use serde_json::json;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn gateway(
        store: Arc<MemoryStore>,
    ) -> (Arc<CallbackGateway>, mpsc::UnboundedReceiver<ResumeSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CallbackGateway::new(store, tx, Arc::new(EngineMetrics::new())), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_delivery_wins() {
        let (gateway, mut rx) = gateway(Arc::new(MemoryStore::new()));
        let run_id = RunId::new("run-1");
        let token = gateway.register_waiter(&run_id, "email", DAY).await.unwrap();

        let first = gateway.deliver(&token, json!({"result": "approved"})).await.unwrap();
        assert_eq!(first, DeliveryOutcome::Accepted);

        let second = gateway.deliver(&token, json!({"result": "declined"})).await.unwrap();
        assert_eq!(
            second,
            DeliveryOutcome::AlreadyResolved {
                resolution: WaiterResolution::Delivered {
                    payload: json!({"result": "approved"})
                }
            }
        );

        // The timer was cancelled by the delivery.
        tokio::time::advance(DAY * 2).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(gateway.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_and_signals() {
        let (gateway, mut rx) = gateway(Arc::new(MemoryStore::new()));
        let run_id = RunId::new("run-1");
        let token = gateway.register_waiter(&run_id, "sms", DAY).await.unwrap();

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.run_id, run_id);
        assert_eq!(signal.callback_token, token);
        assert_eq!(
            gateway.resolution(&token).await.unwrap(),
            Some(WaiterResolution::TimedOut)
        );

        let late = gateway.deliver(&token, json!({"result": "approved"})).await.unwrap();
        assert_eq!(
            late,
            DeliveryOutcome::AlreadyResolved {
                resolution: WaiterResolution::TimedOut
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let (gateway, _rx) = gateway(Arc::new(MemoryStore::new()));
        let err = gateway
            .deliver(&CallbackToken::from("nope"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownCallback { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_rebuilds_timers_from_store() {
        let store = Arc::new(MemoryStore::new());
        let run_id = RunId::new("run-1");
        let now = Utc::now();

        let expired = CallbackWaiter {
            callback_token: CallbackToken::from("expired"),
            run_id: run_id.clone(),
            branch_id: "email".to_string(),
            registered_at: now - chrono::Duration::days(2),
            timeout_at: now - chrono::Duration::days(1),
            resolution: WaiterResolution::Pending,
        };
        let live = CallbackWaiter {
            callback_token: CallbackToken::from("live"),
            timeout_at: now + chrono::Duration::days(1),
            ..expired.clone()
        };
        store.save_waiter(&expired).await.unwrap();
        store.save_waiter(&live).await.unwrap();

        let (gateway, mut rx) = gateway(store);
        assert_eq!(gateway.recover().await.unwrap(), 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.callback_token, CallbackToken::from("expired"));
        assert_eq!(
            gateway.resolution(&CallbackToken::from("live")).await.unwrap(),
            Some(WaiterResolution::Pending)
        );

        let accepted = gateway
            .deliver(&CallbackToken::from("live"), json!({"result": "approved"}))
            .await
            .unwrap();
        assert!(accepted.is_accepted());
        assert!(gateway.pending_for_run(&run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_is_persisted_before_acknowledgement() {
        let store = Arc::new(MemoryStore::new());
        let (gateway, _rx) = gateway(store.clone());
        let token = gateway
            .register_waiter(&RunId::new("run-1"), "email", DAY)
            .await
            .unwrap();

        gateway.deliver(&token, json!({"result": "approved"})).await.unwrap();
        let persisted = store.load_waiter(&token).await.unwrap().unwrap();
        assert!(matches!(persisted.resolution, WaiterResolution::Delivered { .. }));
    }

    #[tokio::test]
    async fn test_resolution_by_another_gateway_is_respected() {
        let store = Arc::new(MemoryStore::new());
        let (worker, mut worker_rx) = gateway(store.clone());
        let (operator, _operator_rx) = gateway(store.clone());
        let token = worker
            .register_waiter(&RunId::new("run-1"), "email", DAY)
            .await
            .unwrap();

        let delivered = operator.deliver(&token, json!({"result": "approved"})).await.unwrap();
        assert!(delivered.is_accepted());

        // The worker still holds a timer for the waiter.
        assert_eq!(worker.pending_timers(), 1);
        let fired = worker.fire_timeout(&token).await.unwrap();
        assert_eq!(
            fired,
            DeliveryOutcome::AlreadyResolved {
                resolution: WaiterResolution::Delivered {
                    payload: json!({"result": "approved"})
                }
            }
        );
        assert!(worker_rx.try_recv().is_err());
        assert!(matches!(
            store.load_waiter(&token).await.unwrap().unwrap().resolution,
            WaiterResolution::Delivered { .. }
        ));
    }
}
