//! One long-lived watch of one resource kind in one scope.
//!
//! ```text
//! starting -> watching -> expiring -> starting
//!                      -> erroring -> backoff -> starting
//!                      -> cancelling -> stopped
//! ```
//!
//! A session without a cursor lists its scope and hands the full listing to
//! the reconciler before it watches; this covers both the first start and a
//! cursor the server rejected as too old.

use std::{fmt, sync::Arc, time::Duration};

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Backoff, Config},
    error::{Cause, Error, ErrorClass, Operation},
};

use super::{Cluster, Event, Intake, Lister, ResourceKind, Scope, WatchItem, WatchStream};

/// Slack on top of the server-side timeout before we consider a silent watch expired.
const EXPIRY_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Watching,
    Expiring,
    Erroring,
    Backoff,
    Cancelling,
    Stopped,
}

/// Why a session reached [`SessionState::Stopped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Cancelled,
    /// The namespace disappeared while we were watching it.
    ScopeGone,
    /// Retries ran out.
    Exhausted,
    /// The reconciler is gone.
    IntakeClosed,
}

enum Interrupt {
    Cancelled,
    IntakeClosed,
    Failed(Error),
}

pub struct WatchSession<C> {
    kind: ResourceKind,
    scope: Scope,
    cursor: Option<String>,
    state: SessionState,
    cluster: Arc<C>,
    lister: Lister<C>,
    intake: mpsc::Sender<Intake>,
    token: CancellationToken,
    watch_timeout: Duration,
    backoff: Backoff,
}

impl<C> fmt::Debug for WatchSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSession")
            .field("kind", &self.kind)
            .field("scope", &self.scope)
            .field("cursor", &self.cursor)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<C: Cluster> WatchSession<C> {
    pub fn new(
        kind: ResourceKind,
        scope: Scope,
        cluster: Arc<C>,
        config: &Config,
        intake: mpsc::Sender<Intake>,
        token: CancellationToken,
    ) -> Self {
        Self {
            kind,
            scope,
            cursor: None,
            state: SessionState::Starting,
            lister: Lister::new(Arc::clone(&cluster), config.list_timeout),
            cluster,
            intake,
            token,
            watch_timeout: config.watch_timeout,
            backoff: config.backoff(),
        }
    }

    /// Skips the initial listing and watches from `cursor`.
    pub fn resume_from(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run(mut self) -> Exit {
        let exit = self.run_inner().await;
        if exit == Exit::Cancelled {
            self.transition(SessionState::Cancelling);
        }
        self.transition(SessionState::Stopped);
        exit
    }

    async fn run_inner(&mut self) -> Exit {
        loop {
            self.transition(SessionState::Starting);
            let err = match self.establish().await {
                Ok(stream) => {
                    self.transition(SessionState::Watching);
                    match self.drain(stream).await {
                        Ok(()) => {
                            self.transition(SessionState::Expiring);
                            self.backoff.reset();
                            continue;
                        }
                        Err(Interrupt::Failed(err)) => err,
                        Err(Interrupt::Cancelled) => return Exit::Cancelled,
                        Err(Interrupt::IntakeClosed) => return Exit::IntakeClosed,
                    }
                }
                Err(Interrupt::Failed(err)) => err,
                Err(Interrupt::Cancelled) => return Exit::Cancelled,
                Err(Interrupt::IntakeClosed) => return Exit::IntakeClosed,
            };

            match err.class() {
                ErrorClass::StateGap => {
                    self.cursor = None;
                    self.transition(SessionState::Expiring);
                    let Some(delay) = self.backoff.next_delay() else {
                        return self.give_up(&err);
                    };
                    // Only a gap that follows another failure waits before relisting.
                    if self.backoff.attempts() == 1 {
                        warn!("{err}: {}; resyncing", err.cause);
                    } else {
                        warn!("{err}: {}; resyncing in {delay:?}", err.cause);
                        self.transition(SessionState::Backoff);
                        if !self.pause(delay).await {
                            return Exit::Cancelled;
                        }
                    }
                }
                ErrorClass::RaceNotFound => {
                    info!(
                        "{} watch in {} stopped: scope already gone",
                        self.kind, self.scope
                    );
                    return Exit::ScopeGone;
                }
                ErrorClass::Transient => {
                    self.transition(SessionState::Erroring);
                    let Some(delay) = self.backoff.next_delay() else {
                        return self.give_up(&err);
                    };
                    warn!("{err}: {}; retrying in {delay:?}", err.cause);
                    self.transition(SessionState::Backoff);
                    if !self.pause(delay).await {
                        return Exit::Cancelled;
                    }
                }
            }
        }
    }

    fn give_up(&self, err: &Error) -> Exit {
        error!(
            "{err}: {}; giving up after {} attempts",
            err.cause,
            self.backoff.attempts()
        );
        Exit::Exhausted
    }

    /// Sleeps for `delay`. Returns `false` if cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.token.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Opens the watch, resyncing first if there is no cursor to resume from.
    async fn establish(&mut self) -> Result<WatchStream, Interrupt> {
        let cursor = match self.cursor.clone() {
            Some(cursor) => cursor,
            None => self.resync().await?,
        };

        let open = self
            .cluster
            .watch(self.kind, &self.scope, &cursor, self.watch_timeout);
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Interrupt::Cancelled),
            result = open => result.map_err(|err| {
                Interrupt::Failed(Error::new(Operation::Watch, self.kind, self.scope.clone(), err))
            }),
        }
    }

    async fn resync(&mut self) -> Result<String, Interrupt> {
        let listing = tokio::select! {
            biased;
            () = self.token.cancelled() => return Err(Interrupt::Cancelled),
            result = self.lister.list(self.kind, self.scope.clone()) => {
                result.map_err(Interrupt::Failed)?
            }
        };
        debug!(
            "listed {} {} in {}",
            listing.items.len(),
            self.kind,
            self.scope
        );

        self.send(Intake::Resync {
            kind: self.kind,
            scope: self.scope.clone(),
            items: listing.items,
        })
        .await?;

        let cursor = listing.resource_version.unwrap_or_else(|| "0".to_string());
        self.cursor = Some(cursor.clone());
        Ok(cursor)
    }

    /// Forwards events until the watch ends. `Ok` means it expired normally.
    ///
    /// A stream that ends silently before its timeout counts as a failure.
    async fn drain(&mut self, mut stream: WatchStream) -> Result<(), Interrupt> {
        let opened = Instant::now();
        let deadline = opened + self.watch_timeout + EXPIRY_GRACE;
        let mut delivered = false;
        loop {
            let next = tokio::select! {
                biased;
                () = self.token.cancelled() => return Err(Interrupt::Cancelled),
                () = tokio::time::sleep_until(deadline) => return Ok(()),
                next = stream.next() => next,
            };

            match next {
                None if delivered || opened.elapsed() >= self.watch_timeout => return Ok(()),
                None => return Err(self.failed(Cause::Closed)),
                Some(Ok(WatchItem::Applied {
                    event_type,
                    resource,
                    resource_version,
                })) => {
                    delivered = true;
                    self.backoff.reset();
                    self.send(Intake::Event(Event::new(event_type, resource)))
                        .await?;
                    if let Some(version) = resource_version {
                        self.cursor = Some(version);
                    }
                }
                Some(Ok(WatchItem::Bookmark { resource_version })) => {
                    delivered = true;
                    self.backoff.reset();
                    debug!(
                        "bookmark for {} in {} at {resource_version}",
                        self.kind, self.scope
                    );
                    self.cursor = Some(resource_version);
                }
                Some(Ok(WatchItem::Error(resp))) => {
                    return Err(self.failed(resp));
                }
                Some(Err(err)) => {
                    return Err(self.failed(err));
                }
            }
        }
    }

    fn failed(&self, cause: impl Into<Cause>) -> Interrupt {
        Interrupt::Failed(Error::new(
            Operation::Watch,
            self.kind,
            self.scope.clone(),
            cause,
        ))
    }

    async fn send(&self, intake: Intake) -> Result<(), Interrupt> {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Interrupt::Cancelled),
            result = self.intake.send(intake) => result.map_err(|_| Interrupt::IntakeClosed),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            "{} session in {}: {:?} -> {:?}",
            self.kind, self.scope, self.state, next
        );
        self.state = next;
    }
}
