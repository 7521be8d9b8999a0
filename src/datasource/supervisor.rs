//! # Connection Supervisor
//!
//! Pings a connection on a fixed interval. A failed ping triggers up to
//! `max_reconnects` reconnect attempts; when all of them fail the target
//! is marked disconnected and the supervisor stops. Once disconnected,
//! operations on the target fail with `DatasourceError::Disconnected`.

use std::sync::Weak;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;

use super::errors::DatasourceResult;

/// Default ping interval
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of reconnect attempts before giving up
pub const MAX_RECONNECTS: u32 = 2;

/// A connection the supervisor can ping and repair
pub trait Supervised: Send + Sync + 'static {
    fn label(&self) -> &str;

    fn ping(&self) -> BoxFuture<'_, DatasourceResult<()>>;

    fn reconnect(&self) -> BoxFuture<'_, DatasourceResult<()>>;

    /// Enter the terminal disconnected state
    fn mark_disconnected(&self);
}

/// Supervisor tuning
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub interval: Duration,
    pub max_reconnects: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: PING_INTERVAL,
            max_reconnects: MAX_RECONNECTS,
        }
    }
}

/// Start supervising `target`. The task ends when the target is dropped
/// or declared disconnected.
pub fn spawn<T: Supervised>(target: Weak<T>, config: SupervisorConfig) -> JoinHandle<()> {
    tokio::spawn(supervise(target, config))
}

async fn supervise<T: Supervised>(target: Weak<T>, config: SupervisorConfig) {
    loop {
        tokio::time::sleep(config.interval).await;
        let Some(target) = target.upgrade() else {
            return;
        };
        let Err(e) = target.ping().await else {
            continue;
        };

        tracing::warn!(connection = target.label(), error = %e, "ping failed, reconnecting");
        if !recover(target.as_ref(), config.max_reconnects).await {
            tracing::error!(
                connection = target.label(),
                attempts = config.max_reconnects,
                "could not reconnect, marking disconnected"
            );
            target.mark_disconnected();
            return;
        }
    }
}

async fn recover<T: Supervised>(target: &T, attempts: u32) -> bool {
    for attempt in 1..=attempts {
        let outcome = match target.reconnect().await {
            Ok(()) => target.ping().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                tracing::info!(connection = target.label(), attempt, "reconnected");
                return true;
            }
            Err(e) => {
                tracing::warn!(connection = target.label(), attempt, error = %e, "reconnect failed")
            }
        }
    }
    false
}
