//! Restart supervision.
//!
//! Each long-lived component runs on its own task under a one-for-one
//! policy: a failed component is restarted in place, up to 10 times
//! within a rolling 10 minutes. Past that the supervisor gives up,
//! cancels the root token, and reports the failure.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What supervised components fail with.
pub type ComponentError = Box<dyn std::error::Error + Send + Sync>;

/// Supervisor error types
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Component '{component}' exceeded {limit} restarts in {window:?}")]
    TooManyRestarts {
        component: &'static str,
        limit: usize,
        window: Duration,
    },

    #[error("Component '{component}' panicked")]
    Panicked { component: &'static str },
}

const RESTART_LIMIT: usize = 10;
const RESTART_WINDOW: Duration = Duration::from_secs(600);

/// One-for-one restart supervisor.
pub struct Supervisor {
    root: CancellationToken,
    restart_limit: usize,
    restart_window: Duration,
    handles: Vec<JoinHandle<Result<(), SupervisorError>>>,
}

impl Supervisor {
    /// A supervisor with the default 10-restarts-per-10-minutes policy.
    pub fn new(root: CancellationToken) -> Self {
        Self::with_policy(root, RESTART_LIMIT, RESTART_WINDOW)
    }

    /// A supervisor with a custom restart policy.
    pub fn with_policy(
        root: CancellationToken,
        restart_limit: usize,
        restart_window: Duration,
    ) -> Self {
        Self {
            root,
            restart_limit,
            restart_window,
            handles: Vec::new(),
        }
    }

    /// Supervise a component. The factory is called for the initial start
    /// and for every restart, each time with a child of the root token.
    pub fn supervise<F, Fut>(&mut self, component: &'static str, mut factory: F)
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ComponentError>> + Send + 'static,
    {
        let token = self.root.child_token();
        let limit = self.restart_limit;
        let window = self.restart_window;

        self.handles.push(tokio::spawn(async move {
            let mut restarts: VecDeque<Instant> = VecDeque::new();
            loop {
                tracing::info!(component, "starting component");
                match factory(token.clone()).await {
                    Ok(()) => {
                        tracing::info!(component, "component stopped");
                        return Ok(());
                    }
                    Err(error) => {
                        if token.is_cancelled() {
                            // Shutdown raced the failure; nothing to restart.
                            return Ok(());
                        }
                        tracing::error!(component, %error, "component failed");

                        let now = Instant::now();
                        restarts.push_back(now);
                        while restarts
                            .front()
                            .is_some_and(|at| now.duration_since(*at) > window)
                        {
                            restarts.pop_front();
                        }
                        if restarts.len() > limit {
                            return Err(SupervisorError::TooManyRestarts {
                                component,
                                limit,
                                window,
                            });
                        }
                    }
                }
            }
        }));
    }

    /// Wait for every supervised component. The first give-up or panic
    /// cancels the root token, the remaining components drain, and the
    /// failure is returned.
    pub async fn join(self) -> Result<(), SupervisorError> {
        use futures_util::stream::{FuturesUnordered, StreamExt};

        let mut pending: FuturesUnordered<_> = self.handles.into_iter().collect();
        let mut first_failure = None;
        while let Some(joined) = pending.next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    tracing::error!(%join_error, "supervised task panicked");
                    Err(SupervisorError::Panicked {
                        component: "unknown",
                    })
                }
            };
            if let Err(e) = outcome {
                self.root.cancel();
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_clean_exit_is_not_restarted() {
        let root = CancellationToken::new();
        let mut supervisor = Supervisor::new(root.clone());
        let starts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&starts);
        supervisor.supervise("oneshot", move |_token| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        supervisor.join().await.expect("join");
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_component_is_restarted_then_given_up_on() {
        let root = CancellationToken::new();
        let mut supervisor = Supervisor::with_policy(root.clone(), 3, Duration::from_secs(600));
        let starts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&starts);
        supervisor.supervise("flaky", move |_token| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), ComponentError>("kaboom".into())
            }
        });

        let outcome = supervisor.join().await;
        assert!(matches!(
            outcome,
            Err(SupervisorError::TooManyRestarts { component: "flaky", .. })
        ));
        // Initial start plus `limit` restarts.
        assert_eq!(starts.load(Ordering::SeqCst), 4);
        assert!(root.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_component_exits_cleanly() {
        let root = CancellationToken::new();
        let mut supervisor = Supervisor::new(root.clone());

        supervisor.supervise("loop", move |token| async move {
            token.cancelled().await;
            Ok(())
        });

        root.cancel();
        supervisor.join().await.expect("join");
    }

    #[tokio::test]
    async fn test_one_for_one_restarts_do_not_touch_siblings() {
        let root = CancellationToken::new();
        let mut supervisor = Supervisor::with_policy(root.clone(), 1, Duration::from_secs(600));
        let healthy_starts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&healthy_starts);
        supervisor.supervise("healthy", move |token| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                token.cancelled().await;
                Ok(())
            }
        });
        supervisor.supervise("flaky", move |_token| async move {
            Err::<(), ComponentError>("kaboom".into())
        });

        let outcome = supervisor.join().await;
        assert!(outcome.is_err());
        // The healthy sibling was started exactly once and only stopped
        // when the whole supervisor gave up.
        assert_eq!(healthy_starts.load(Ordering::SeqCst), 1);
    }
}
