use crate::config::LotteryConfig;
use crate::storage::{BetStore, StorageError};
use crate::types::{AgencyId, Bet};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("agency {0} is not part of this lottery")]
    UnknownAgency(AgencyId),
    #[error("draw pending: {finished} of {total} agencies finished")]
    DrawPending { finished: usize, total: usize },
    #[error("draw already held, no more bets are accepted")]
    DrawClosed,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Decides which bets win the draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawPolicy {
    winning_number: u32,
}

impl DrawPolicy {
    pub fn new(winning_number: u32) -> Self {
        Self { winning_number }
    }

    pub fn has_won(&self, bet: &Bet) -> bool {
        bet.number == self.winning_number
    }
}

impl From<&LotteryConfig> for DrawPolicy {
    fn from(config: &LotteryConfig) -> Self {
        Self::new(config.winning_number)
    }
}

/// What `finish_agency` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Other agencies are still submitting.
    Waiting { finished: usize, total: usize },
    /// This agency was the last one; the draw ran now.
    DrawHeld { winners: usize },
    /// The draw had already been held before this call.
    AlreadyDrawn,
}

struct DrawState {
    agencies: BTreeMap<AgencyId, bool>,
    /// `None` until the draw runs, then fixed for the lifetime of the server.
    winners: Option<Vec<Bet>>,
}

impl DrawState {
    fn finished(&self) -> usize {
        self.agencies.values().filter(|done| **done).count()
    }

    fn all_finished(&self) -> bool {
        self.agencies.values().all(|done| *done)
    }

    fn pending(&self) -> CoordinatorError {
        CoordinatorError::DrawPending {
            finished: self.finished(),
            total: self.agencies.len(),
        }
    }
}

/// Barrier between agencies submitting bets and the draw.
///
/// Holds the per-agency completion flags and the winners cache behind a
/// single lock. Every operation, including writes to the bet store, runs
/// inside that critical section, so the agency that finishes last performs
/// the draw exactly once and every later winners query observes it.
pub struct Coordinator {
    store: Arc<dyn BetStore>,
    policy: DrawPolicy,
    agency_count: usize,
    state: Mutex<DrawState>,
}

impl Coordinator {
    /// Create a coordinator for agencies `1..=agencies`, none finished.
    pub fn new(agencies: u32, store: Arc<dyn BetStore>, policy: DrawPolicy) -> Self {
        let agencies: BTreeMap<AgencyId, bool> = (1..=agencies)
            .filter_map(|id| AgencyId::new(id).ok())
            .map(|id| (id, false))
            .collect();

        Self {
            store,
            policy,
            agency_count: agencies.len(),
            state: Mutex::new(DrawState {
                agencies,
                winners: None,
            }),
        }
    }

    /// Append a batch of bets to the store.
    pub async fn store_bets(&self, bets: &[Bet]) -> Result<(), CoordinatorError> {
        let state = self.state.lock().await;
        if state.winners.is_some() {
            return Err(CoordinatorError::DrawClosed);
        }
        self.store.append(bets)?;
        debug!("Stored {} bets", bets.len());
        Ok(())
    }

    /// Record that `agency` has sent all of its bets.
    pub async fn mark_finished(&self, agency: AgencyId) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock().await;
        Self::mark_locked(&mut state, agency)
    }

    /// Run the draw if every agency has finished and it has not run yet.
    /// Returns whether this call performed it.
    pub async fn check_and_run_draw(&self) -> Result<bool, CoordinatorError> {
        let mut state = self.state.lock().await;
        self.draw_locked(&mut state)
    }

    /// `mark_finished` followed by `check_and_run_draw` in one critical
    /// section.
    pub async fn finish_agency(&self, agency: AgencyId) -> Result<FinishOutcome, CoordinatorError> {
        let mut state = self.state.lock().await;
        let already_drawn = state.winners.is_some();
        Self::mark_locked(&mut state, agency)?;

        if already_drawn {
            return Ok(FinishOutcome::AlreadyDrawn);
        }
        if self.draw_locked(&mut state)? {
            let winners = state.winners.as_ref().map_or(0, Vec::len);
            return Ok(FinishOutcome::DrawHeld { winners });
        }
        Ok(FinishOutcome::Waiting {
            finished: state.finished(),
            total: state.agencies.len(),
        })
    }

    /// Winning bets placed through `agency`. Fails with `DrawPending` until
    /// every agency has finished.
    pub async fn winners_for(&self, agency: AgencyId) -> Result<Vec<Bet>, CoordinatorError> {
        let state = self.state.lock().await;
        if !state.agencies.contains_key(&agency) {
            return Err(CoordinatorError::UnknownAgency(agency));
        }
        let winners = state.winners.as_ref().ok_or_else(|| state.pending())?;

        Ok(winners
            .iter()
            .filter(|bet| bet.agency == agency)
            .cloned()
            .collect())
    }

    pub async fn is_draw_complete(&self) -> bool {
        self.state.lock().await.winners.is_some()
    }

    pub async fn finished_count(&self) -> usize {
        self.state.lock().await.finished()
    }

    /// Number of agencies taking part in the draw.
    pub fn agencies(&self) -> usize {
        self.agency_count
    }

    fn mark_locked(state: &mut DrawState, agency: AgencyId) -> Result<(), CoordinatorError> {
        let done = state
            .agencies
            .get_mut(&agency)
            .ok_or(CoordinatorError::UnknownAgency(agency))?;
        *done = true;
        Ok(())
    }

    fn draw_locked(&self, state: &mut DrawState) -> Result<bool, CoordinatorError> {
        if state.winners.is_some() || !state.all_finished() {
            return Ok(false);
        }

        let bets = self.store.load_all()?;
        let total = bets.len();
        let winners: Vec<Bet> = bets
            .into_iter()
            .filter(|bet| self.policy.has_won(bet))
            .collect();

        info!(
            action = "sorteo",
            result = "success",
            bets = total,
            winners = winners.len(),
            "Draw held"
        );
        state.winners = Some(winners);
        Ok(true)
    }
}
