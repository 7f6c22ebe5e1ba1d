//! Cluster barrier with checkpoint checking.
//!
//! Blocks each caller until every participant has arrived; no timeout, no
//! partial release. On top of the plain barrier, every call names the
//! [`Checkpoint`] it belongs to. A participant arriving at a different
//! checkpoint, or leaving while others wait, poisons the barrier and every
//! participant gets a [`SyncError`] instead of deadlocking or racing.

use std::fmt;

use parking_lot::{Condvar, Mutex};

use crate::cluster::CoreId;
use crate::error::SyncError;

/// Named synchronization points of the kernel protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// The outer tile (query tile / input tile) is resident.
    TileLoaded,
    /// Running row statistics were reset.
    StatsReset,
    /// Key and value tiles are resident.
    KeyValueLoaded,
    /// The score tile was computed.
    ScoresComputed,
    /// Row statistics and the probability tile were updated.
    StatsUpdated,
    /// The column tile's contribution was added to the output tile.
    OutputAccumulated,
    /// The output tile is final and may be stored.
    OutputFinalized,
    /// System-wide completion.
    KernelDone,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Checkpoint::TileLoaded => "tile-loaded",
            Checkpoint::StatsReset => "stats-reset",
            Checkpoint::KeyValueLoaded => "key-value-loaded",
            Checkpoint::ScoresComputed => "scores-computed",
            Checkpoint::StatsUpdated => "stats-updated",
            Checkpoint::OutputAccumulated => "output-accumulated",
            Checkpoint::OutputFinalized => "output-finalized",
            Checkpoint::KernelDone => "kernel-done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    checkpoint: Option<Checkpoint>,
    departed: Option<CoreId>,
    poisoned: Option<SyncError>,
}

/// A full barrier over a fixed set of participants.
pub struct ClusterBarrier {
    participants: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl ClusterBarrier {
    pub fn new(participants: usize) -> Self {
        Self {
            participants,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Arrive at `checkpoint` and block until every participant arrived.
    ///
    /// Returns the number of completed generations after release.
    pub fn wait(&self, core: CoreId, checkpoint: Checkpoint) -> Result<u64, SyncError> {
        let mut st = self.state.lock();
        if let Some(err) = &st.poisoned {
            return Err(err.clone());
        }
        if let Some(gone) = st.departed {
            return Err(self.poison(&mut st, SyncError::ParticipantExited { core: gone, checkpoint }));
        }
        let current = st.checkpoint;
        match current {
            None => st.checkpoint = Some(checkpoint),
            Some(expected) if expected != checkpoint => {
                return Err(self.poison(
                    &mut st,
                    SyncError::CheckpointMismatch { expected, got: checkpoint, core },
                ));
            }
            Some(_) => {}
        }

        st.arrived += 1;
        if st.arrived == self.participants {
            st.arrived = 0;
            st.checkpoint = None;
            st.generation += 1;
            self.cvar.notify_all();
            return Ok(st.generation);
        }

        let generation = st.generation;
        while st.generation == generation && st.poisoned.is_none() {
            self.cvar.wait(&mut st);
        }
        if st.generation != generation {
            Ok(generation + 1)
        } else {
            Err(st.poisoned.clone().unwrap_or(SyncError::ParticipantExited { core, checkpoint }))
        }
    }

    /// Record that `core` will not call [`wait`](Self::wait) again.
    ///
    /// If other participants are already waiting, they are released with
    /// [`SyncError::ParticipantExited`]; later arrivals fail the same way.
    pub fn leave(&self, core: CoreId) {
        let mut st = self.state.lock();
        if st.departed.is_none() {
            st.departed = Some(core);
        }
        if st.arrived > 0 && st.poisoned.is_none() {
            let checkpoint = st.checkpoint.unwrap_or(Checkpoint::KernelDone);
            self.poison(&mut st, SyncError::ParticipantExited { core, checkpoint });
        }
    }

    /// Completed generations so far.
    pub fn generations(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned.is_some()
    }

    fn poison(&self, st: &mut BarrierState, err: SyncError) -> SyncError {
        tracing::error!("barrier poisoned: {}", err);
        st.poisoned = Some(err.clone());
        self.cvar.notify_all();
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::CoreRole;
    use std::sync::Arc;

    fn calc(i: usize) -> CoreId {
        CoreId { cluster: 0, role: CoreRole::Calculator(i) }
    }

    #[test]
    fn test_single_participant() {
        let b = ClusterBarrier::new(1);
        assert_eq!(b.wait(calc(0), Checkpoint::TileLoaded), Ok(1));
        assert_eq!(b.wait(calc(0), Checkpoint::OutputFinalized), Ok(2));
        assert_eq!(b.generations(), 2);
    }

    #[test]
    fn test_releases_all_participants() {
        let b = Arc::new(ClusterBarrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let b = Arc::clone(&b);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        b.wait(calc(i), Checkpoint::StatsUpdated).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(b.generations(), 10);
        assert!(!b.is_poisoned());
    }

    #[test]
    fn test_checkpoint_mismatch_poisons() {
        let b = Arc::new(ClusterBarrier::new(2));
        let waiter = {
            let b = Arc::clone(&b);
            std::thread::spawn(move || b.wait(calc(0), Checkpoint::ScoresComputed))
        };
        // Let the waiter arrive first
        while b.state.lock().arrived == 0 {
            std::thread::yield_now();
        }
        let err = b.wait(calc(1), Checkpoint::StatsUpdated).unwrap_err();
        assert_eq!(
            err,
            SyncError::CheckpointMismatch {
                expected: Checkpoint::ScoresComputed,
                got: Checkpoint::StatsUpdated,
                core: calc(1),
            }
        );
        assert_eq!(waiter.join().unwrap(), Err(err));
        assert!(b.is_poisoned());
    }

    #[test]
    fn test_leave_releases_waiters() {
        let b = Arc::new(ClusterBarrier::new(2));
        let waiter = {
            let b = Arc::clone(&b);
            std::thread::spawn(move || b.wait(calc(0), Checkpoint::OutputAccumulated))
        };
        while b.state.lock().arrived == 0 {
            std::thread::yield_now();
        }
        b.leave(calc(1));
        assert_eq!(
            waiter.join().unwrap(),
            Err(SyncError::ParticipantExited {
                core: calc(1),
                checkpoint: Checkpoint::OutputAccumulated,
            })
        );
    }

    #[test]
    fn test_arrival_after_leave_fails() {
        let b = ClusterBarrier::new(2);
        b.leave(calc(1));
        assert!(matches!(
            b.wait(calc(0), Checkpoint::TileLoaded),
            Err(SyncError::ParticipantExited { .. })
        ));
    }
}
