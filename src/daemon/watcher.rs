//! Folder Watcher (`spec.md` §4.2): turns IMAP IDLE pushes or a poll timer
//! into "process this folder now" triggers handed to the Work Dispatcher,
//! built on the already-dedicated [`IdleSession`] connection the way the
//! teacher keeps IDLE separate from the fetch/search/move session.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, Notify};

use crate::imap::session::{IdleOutcome, IdleSession};

/// RFC 2177's convention: re-enter IDLE at least this often even with no
/// server activity.
const IDLE_RENEWAL: Duration = Duration::from_secs(29 * 60);
const IDLE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Runs until `stop` is notified. In IDLE mode this owns a dedicated
/// connection for the lifetime of the watcher; in poll mode it only needs a
/// timer, since the actual scan runs on the account's shared session via the
/// dispatcher.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    account: String,
    folder: String,
    host: String,
    port: u16,
    username: String,
    password: String,
    polling_interval: Duration,
    supports_idle: bool,
    trigger_tx: mpsc::UnboundedSender<String>,
    stop: Arc<Notify>,
) {
    if supports_idle {
        run_idle(&account, &folder, &host, port, &username, &password, &trigger_tx, &stop).await;
    } else {
        run_poll(&folder, polling_interval, &trigger_tx, &stop).await;
    }
}

/// Stop signals for a watcher are delivered with [`Notify::notify_one`]
/// rather than `notify_waiters`: a watcher's `stop` is dedicated to that one
/// task, and `notify_one` stores a permit for a not-yet-registered waiter,
/// so a stop sent before the watcher reaches its first `.notified().await`
/// is never lost.
async fn run_poll(folder: &str, interval: Duration, trigger_tx: &mpsc::UnboundedSender<String>, stop: &Arc<Notify>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if trigger_tx.send(folder.to_string()).is_err() {
                    return;
                }
            }
            _ = stop.notified() => return,
        }
    }
}

async fn run_idle(
    account: &str,
    folder: &str,
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    trigger_tx: &mpsc::UnboundedSender<String>,
    stop: &Arc<Notify>,
) {
    let mut backoff = Duration::from_secs(1);

    loop {
        let connected = tokio::select! {
            result = IdleSession::connect(host, port, username, password, folder, IDLE_CONNECT_TIMEOUT) => result,
            _ = stop.notified() => return,
        };

        let mut session = match connected {
            Ok(session) => {
                backoff = Duration::from_secs(1);
                session
            }
            Err(e) => {
                warn!("IDLE connect for {account}:{folder} failed: {e}, retrying in {backoff:?}");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = stop.notified() => return,
                }
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                continue;
            }
        };

        loop {
            let outcome = tokio::select! {
                result = session.wait(IDLE_RENEWAL) => result,
                _ = stop.notified() => return,
            };
            match outcome {
                Ok(IdleOutcome::ServerActivity) => {
                    debug!("IDLE activity on {account}:{folder}");
                    if trigger_tx.send(folder.to_string()).is_err() {
                        return;
                    }
                }
                Ok(IdleOutcome::RenewalTimeout) => {}
                Err(e) => {
                    warn!("IDLE wait on {account}:{folder} failed: {e}, reconnecting");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_mode_triggers_then_honors_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stop = Arc::new(Notify::new());
        tokio::select! {
            _ = run_poll("INBOX", Duration::from_millis(5), &tx, &stop) => {}
            _ = async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                stop.notify_one();
            } => {}
        }
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn poll_mode_returns_immediately_when_already_stopped() {
        let (tx, _rx) = mpsc::unbounded_channel::<String>();
        let stop = Arc::new(Notify::new());
        stop.notify_one();
        tokio::time::timeout(Duration::from_millis(50), run_poll("INBOX", Duration::from_secs(3600), &tx, &stop))
            .await
            .expect("run_poll should return as soon as stop is notified");
    }
}
