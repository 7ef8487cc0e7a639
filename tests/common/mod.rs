#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use logrelay::{BatchSink, DeliveryBatch, Pipeline, SinkError};

/// Sink that fails a configurable number of calls, optionally stalls, and records what it
/// delivered.
#[derive(Debug, Default)]
pub struct ScriptedSink {
    delivered: Mutex<Vec<DeliveryBatch>>,
    calls: AtomicU32,
    fail_remaining: AtomicU32,
    stall: Option<Duration>,
    /// Fail with a permanent rejection instead of a transport error.
    reject: bool,
}

impl ScriptedSink {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_first(n: u32) -> Arc<Self> {
        Arc::new(Self { fail_remaining: AtomicU32::new(n), ..Self::default() })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::failing_first(u32::MAX)
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self { fail_remaining: AtomicU32::new(u32::MAX), reject: true, ..Self::default() })
    }

    pub fn stalling(stall: Duration) -> Arc<Self> {
        Arc::new(Self { stall: Some(stall), ..Self::default() })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.events.iter().map(|e| e.message().to_string()).collect())
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.batches().concat()
    }

    pub fn delivered(&self) -> Vec<DeliveryBatch> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl BatchSink for ScriptedSink {
    async fn send(&self, batch: &DeliveryBatch) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing && self.reject {
            return Err(SinkError::Rejected("payload too large".into()));
        }
        if failing {
            return Err(SinkError::Transport("connection refused".into()));
        }
        self.delivered.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

/// Let the worker finish everything queued. Meant for runtimes with paused time.
pub async fn settle(pipeline: &Pipeline) {
    for _ in 0..10_000 {
        if pipeline.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("pipeline never settled; {} events in flight", pipeline.in_flight());
}
