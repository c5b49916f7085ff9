//! Lamport's bakery algorithm over plain object storage.
//!
//! The store offers nothing beyond independent reads and writes, yet the
//! bakery algorithm only needs each participant to write its own keys and
//! read everyone else's:
//!
//! 1. announce `entering = 1`
//! 2. take `ticket = 1 + max(all tickets)`
//! 3. publish the ticket, announce `entering = 0`
//! 4. wait for every participant whose `(ticket, priority)` is lower
//!
//! Priorities come from the append-only priorities list and only break ties
//! between equal tickets.
//!
//! Waiting polls the store with bounded exponential backoff. An optional
//! timeout and cancellation signal abort a wait; the waiter then withdraws its
//! ticket so that it never blocks anyone.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::StorageError;
use crate::namespace::{validate_participant, LockNamespace, Participants, PRIORITY_SEPARATOR};
use crate::store::{WriteOutcome, WritePrecondition};

/// Default first delay between polls of a competitor's state.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Default upper bound for the delay between polls.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Smallest delay between polls; a zero delay would never grow.
pub const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Attempts of the compare-and-swap loop registering a new participant.
const JOIN_MAX_ATTEMPTS: u32 = 16;

const JOIN_BACKOFF_BASE: Duration = Duration::from_millis(10);
const JOIN_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// How `acquire` waits for competitors.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Give up with `LockTimeout` after this long. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Abort with `Cancelled` once the channel carries `true`.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            timeout: None,
            cancel: None,
        }
    }
}

impl AcquireOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the poll delays. A zero base is raised to `MIN_BACKOFF`.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        let base = base.max(MIN_BACKOFF);
        self.backoff_base = base;
        self.backoff_max = max.max(base);
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Register `participant` in the namespace and return its priority.
///
/// Already registered participants get their existing priority back. A new
/// participant is appended to the priorities list and its ticket and
/// entering flag are initialized to `"0"`.
///
/// On backends with conditional writes the append is a compare-and-swap, so
/// concurrent first joins cannot lose each other. Without them the list is
/// appended blindly; a lost registration is detected by re-reading the list
/// and reported as `JoinRace`.
#[instrument(skip(namespace), level = "debug", fields(prefix = namespace.prefix()))]
pub async fn join(namespace: &LockNamespace, participant: &str) -> Result<usize, StorageError> {
    validate_participant(participant)?;
    if namespace.store().supports_conditional_writes() {
        join_conditional(namespace, participant).await
    } else {
        join_unconditional(namespace, participant).await
    }
}

async fn join_conditional(
    namespace: &LockNamespace,
    participant: &str,
) -> Result<usize, StorageError> {
    let store = namespace.store();
    let key = namespace.priorities_key();
    let mut backoff = JOIN_BACKOFF_BASE;

    for attempt in 1..=JOIN_MAX_ATTEMPTS {
        let (current, precondition) = match store.get_versioned(&key).await? {
            None => (Participants::default(), WritePrecondition::DoesNotExist),
            Some(object) => (
                Participants::parse(&String::from_utf8_lossy(&object.data)),
                WritePrecondition::MatchesVersion(object.version),
            ),
        };

        if let Some(priority) = current.priority_of(participant) {
            return Ok(priority);
        }

        let updated = current.with_appended(participant);
        match store
            .put_conditional(&key, updated.encode().as_bytes(), &precondition)
            .await?
        {
            WriteOutcome::Written => {
                let priority = current.len();
                init_entries(namespace, participant).await?;
                info!(
                    "Participant {} joined namespace '{}' with priority {}",
                    participant,
                    namespace.prefix(),
                    priority
                );
                return Ok(priority);
            }
            WriteOutcome::PreconditionFailed => {
                debug!(
                    "Priorities list changed under {} (attempt {}), retrying join",
                    participant, attempt
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(JOIN_BACKOFF_MAX);
            }
        }
    }

    Err(StorageError::JoinRace {
        namespace: namespace.prefix().to_string(),
        message: format!(
            "{} could not register after {} attempts",
            participant, JOIN_MAX_ATTEMPTS
        ),
    })
}

async fn join_unconditional(
    namespace: &LockNamespace,
    participant: &str,
) -> Result<usize, StorageError> {
    let store = namespace.store();
    let key = namespace.priorities_key();

    let current = namespace.participants().await?;
    if let Some(priority) = current.priority_of(participant) {
        return Ok(priority);
    }

    warn!(
        "{} backend has no conditional writes: concurrent first joins to '{}' may corrupt the priorities list",
        store.backend_name(),
        namespace.prefix()
    );

    if store.exists(&key).await? {
        store
            .append(&key, format!("{}{}", PRIORITY_SEPARATOR, participant).as_bytes())
            .await?;
    } else {
        store.set(&key, participant.as_bytes()).await?;
    }
    init_entries(namespace, participant).await?;

    let after = namespace.participants().await?;
    match after.priority_of(participant) {
        Some(priority) => {
            if priority != current.len() {
                warn!(
                    "{} joined '{}' with priority {} instead of {}: another participant joined concurrently",
                    participant,
                    namespace.prefix(),
                    priority,
                    current.len()
                );
            }
            info!(
                "Participant {} joined namespace '{}' with priority {}",
                participant,
                namespace.prefix(),
                priority
            );
            Ok(priority)
        }
        None => Err(StorageError::JoinRace {
            namespace: namespace.prefix().to_string(),
            message: format!("registration of {} was overwritten", participant),
        }),
    }
}

async fn init_entries(namespace: &LockNamespace, participant: &str) -> Result<(), StorageError> {
    namespace.write_number(participant, 0).await?;
    namespace.write_entering(participant, false).await
}

/// Enter the critical section of the namespace as `participant`.
///
/// Joins first if needed. With fewer than two known participants there is
/// nobody to contend with and this returns without touching any ticket.
#[instrument(skip(namespace, options), level = "debug", fields(prefix = namespace.prefix()))]
pub async fn acquire(
    namespace: &LockNamespace,
    participant: &str,
    options: &AcquireOptions,
) -> Result<(), StorageError> {
    validate_participant(participant)?;

    let mut participants = namespace.participants().await?;
    let priority = match participants.priority_of(participant) {
        Some(priority) => priority,
        None => {
            join(namespace, participant).await?;
            participants = namespace.participants().await?;
            participants
                .priority_of(participant)
                .ok_or_else(|| StorageError::JoinRace {
                    namespace: namespace.prefix().to_string(),
                    message: format!("{} missing from priorities after join", participant),
                })?
        }
    };

    if participants.len() < 2 {
        debug!("{} is the only participant, no contention", participant);
        return Ok(());
    }

    let mut guard = TicketGuard::new(namespace, participant);
    let result = take_ticket_and_wait(namespace, participant, priority, &participants, options).await;
    let ticket = match result {
        Ok(ticket) => ticket,
        Err(e) => {
            withdraw(namespace, participant).await;
            guard.disarm();
            return Err(e);
        }
    };
    guard.disarm();

    debug!("{} entered with ticket {}", participant, ticket);
    Ok(())
}

async fn take_ticket_and_wait(
    namespace: &LockNamespace,
    participant: &str,
    priority: usize,
    participants: &Participants,
    options: &AcquireOptions,
) -> Result<u64, StorageError> {
    namespace.write_entering(participant, true).await?;

    let mut highest = 0;
    for other in participants.iter() {
        highest = highest.max(namespace.read_number(other).await?);
    }
    let ticket = highest + 1;
    namespace.write_number(participant, ticket).await?;
    namespace.write_entering(participant, false).await?;
    debug!("{} drew ticket {} (priority {})", participant, ticket, priority);

    let mut waiter = Waiter::new(participant, options);
    let mut seen = Vec::with_capacity(participants.len());

    for (their_priority, other) in participants.iter().enumerate() {
        if other == participant || seen.contains(&other) {
            continue;
        }
        seen.push(other);

        waiter.reset();
        let mut announced = false;
        while namespace.read_entering(other).await? {
            if !announced {
                info!("{} waiting for {} to draw its ticket", participant, other);
                announced = true;
            }
            waiter.pause().await?;
        }

        waiter.reset();
        announced = false;
        loop {
            let theirs = namespace.read_number(other).await?;
            if theirs == 0 || (theirs, their_priority) > (ticket, priority) {
                break;
            }
            if !announced {
                info!(
                    "{} (ticket {}) waiting for {} (ticket {}) to release",
                    participant, ticket, other, theirs
                );
                announced = true;
            } else {
                debug!("{} still holds ticket {}", other, theirs);
            }
            waiter.pause().await?;
        }
    }

    Ok(ticket)
}

/// Best-effort reset of a participant's keys after a failed acquire.
async fn withdraw(namespace: &LockNamespace, participant: &str) {
    if let Err(e) = namespace.write_entering(participant, false).await {
        warn!("Failed to clear entering flag of {}: {}", participant, e);
    }
    if let Err(e) = namespace.write_number(participant, 0).await {
        warn!("Failed to withdraw ticket of {}: {}", participant, e);
    }
}

/// Withdraws a participant's ticket if dropped while armed.
///
/// A future dropped mid-wait or inside the critical section (timeout, task
/// abort, `select!`) never reaches its own release, so the guard spawns the
/// withdrawal on the current runtime instead.
pub(crate) struct TicketGuard {
    namespace: LockNamespace,
    participant: String,
    armed: bool,
}

impl TicketGuard {
    pub(crate) fn new(namespace: &LockNamespace, participant: &str) -> Self {
        Self {
            namespace: namespace.clone(),
            participant: participant.to_string(),
            armed: true,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let namespace = self.namespace.clone();
        let participant = std::mem::take(&mut self.participant);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Lock of {} abandoned, withdrawing its ticket", participant);
                handle.spawn(async move {
                    withdraw(&namespace, &participant).await;
                });
            }
            Err(_) => warn!(
                "Lock of {} abandoned outside a runtime; its ticket stays until released",
                participant
            ),
        }
    }
}

/// Leave the critical section by resetting the ticket to `"0"`.
///
/// Nothing is written when the ticket already is `"0"`.
#[instrument(skip(namespace), level = "debug", fields(prefix = namespace.prefix()))]
pub async fn release(namespace: &LockNamespace, participant: &str) -> Result<(), StorageError> {
    validate_participant(participant)?;
    let ticket = namespace.read_number(participant).await?;
    if ticket == 0 {
        debug!("{} holds no ticket, nothing to release", participant);
        return Ok(());
    }
    namespace.write_number(participant, 0).await?;
    debug!("{} released ticket {}", participant, ticket);
    Ok(())
}

enum Wake {
    Timer,
    Signal,
    Closed,
}

/// Sleeps between polls, enforcing the timeout and cancellation.
struct Waiter {
    participant: String,
    base: Duration,
    max: Duration,
    current: Duration,
    started: Instant,
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl Waiter {
    fn new(participant: &str, options: &AcquireOptions) -> Self {
        let started = Instant::now();
        let base = options.backoff_base.max(MIN_BACKOFF);
        Self {
            participant: participant.to_string(),
            base,
            max: options.backoff_max.max(base),
            current: base,
            started,
            deadline: options.timeout.map(|t| started + t),
            cancel: options.cancel.clone(),
        }
    }

    fn reset(&mut self) {
        self.current = self.base;
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    async fn pause(&mut self) -> Result<(), StorageError> {
        if self.cancelled() {
            return Err(StorageError::Cancelled(self.participant.clone()));
        }

        let mut delay = self.current;
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(StorageError::LockTimeout {
                    participant: self.participant.clone(),
                    waited: now - self.started,
                });
            }
            delay = delay.min(deadline - now);
        }

        let wake = match self.cancel.as_mut() {
            Some(rx) => tokio::select! {
                _ = tokio::time::sleep(delay) => Wake::Timer,
                changed = rx.changed() => {
                    if changed.is_ok() { Wake::Signal } else { Wake::Closed }
                }
            },
            None => {
                tokio::time::sleep(delay).await;
                Wake::Timer
            }
        };

        match wake {
            Wake::Timer => {}
            Wake::Signal => {
                if self.cancelled() {
                    return Err(StorageError::Cancelled(self.participant.clone()));
                }
            }
            Wake::Closed => {
                // Nobody can cancel anymore; keep waiting on the timer alone.
                self.cancel = None;
                tokio::time::sleep(delay).await;
            }
        }

        self.current = (self.current * 2).min(self.max);
        Ok(())
    }
}

/// A participant bound to a namespace, with its acquire options.
#[derive(Debug, Clone)]
pub struct BakeryLock {
    namespace: LockNamespace,
    participant: String,
    options: AcquireOptions,
}

impl BakeryLock {
    pub fn new(namespace: LockNamespace, participant: impl Into<String>) -> Result<Self, StorageError> {
        let participant = participant.into();
        validate_participant(&participant)?;
        Ok(Self {
            namespace,
            participant,
            options: AcquireOptions::default(),
        })
    }

    pub fn with_options(mut self, options: AcquireOptions) -> Self {
        self.options = options;
        self
    }

    pub fn namespace(&self) -> &LockNamespace {
        &self.namespace
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn options(&self) -> &AcquireOptions {
        &self.options
    }

    pub async fn join(&self) -> Result<usize, StorageError> {
        join(&self.namespace, &self.participant).await
    }

    pub async fn acquire(&self) -> Result<(), StorageError> {
        acquire(&self.namespace, &self.participant, &self.options).await
    }

    pub async fn release(&self) -> Result<(), StorageError> {
        release(&self.namespace, &self.participant).await
    }

    /// Run `work` inside the critical section and release afterwards.
    ///
    /// The lock is released whether `work` succeeds or fails, and withdrawn
    /// in the background if the returned future is dropped.
    pub async fn hold<F, Fut, T, E>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StorageError>,
    {
        self.acquire().await?;
        let mut guard = TicketGuard::new(&self.namespace, &self.participant);
        let outcome = work().await;
        let released = self.release().await;
        guard.disarm();

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), released) => {
                if let Err(release_err) = released {
                    warn!(
                        "Release of {} after failed work also failed: {}",
                        self.participant, release_err
                    );
                }
                Err(e)
            }
        }
    }
}
