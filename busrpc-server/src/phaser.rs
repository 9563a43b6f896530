//! Reusable synchronization barrier for coordinating shutdown.
//!
//! Parties register, then either arrive and wait for the phase to advance, or
//! arrive and deregister. The phase advances once every registered party has
//! arrived. A party that deregisters stops counting toward the barrier, which
//! may release the others.

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct PhaserState {
    phase: u64,
    parties: usize,
    arrived: usize,
}

#[derive(Debug)]
pub struct Phaser {
    state: Mutex<PhaserState>,
    phase: watch::Sender<u64>,
}

impl Default for Phaser {
    fn default() -> Self {
        Self::new()
    }
}

impl Phaser {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(0);
        Self {
            state: Mutex::new(PhaserState::default()),
            phase,
        }
    }

    /// Adds a party. Returns the current phase.
    pub fn register(&self) -> u64 {
        let mut state = self.state.lock();
        state.parties += 1;
        state.phase
    }

    /// Registers a party that deregisters when the guard is dropped.
    pub fn register_guard(&self) -> Registration<'_> {
        self.register();
        Registration {
            phaser: self,
            arrived_in: Mutex::new(None),
        }
    }

    /// Arrives and waits for the other parties. Returns the new phase.
    pub async fn arrive_and_await_advance(&self) -> u64 {
        let rx = self.phase.subscribe();
        match self.arrive() {
            Arrival::Advanced(phase) => phase,
            Arrival::Waiting(phase) => self.await_advance(rx, phase).await,
        }
    }

    /// Arrives and removes this party without waiting.
    pub fn arrive_and_deregister(&self) {
        self.deregister(None);
    }

    fn arrive(&self) -> Arrival {
        let mut state = self.state.lock();
        state.arrived += 1;
        if state.arrived >= state.parties {
            Arrival::Advanced(self.advance(&mut state))
        } else {
            Arrival::Waiting(state.phase)
        }
    }

    async fn await_advance(&self, mut rx: watch::Receiver<u64>, phase: u64) -> u64 {
        let _ = rx.wait_for(|current| *current != phase).await;
        let current = *rx.borrow();
        current
    }

    /// Removes a party. A party that arrived in the still-current phase
    /// withdraws that arrival instead of counting again.
    fn deregister(&self, arrived_in: Option<u64>) {
        let mut state = self.state.lock();
        if arrived_in == Some(state.phase) {
            state.arrived = state.arrived.saturating_sub(1);
        }
        state.parties = state.parties.saturating_sub(1);
        if state.parties == 0 {
            state.arrived = 0;
        } else if state.arrived >= state.parties {
            self.advance(&mut state);
        }
    }

    pub fn phase(&self) -> u64 {
        self.state.lock().phase
    }

    pub fn registered_parties(&self) -> usize {
        self.state.lock().parties
    }

    pub fn arrived_parties(&self) -> usize {
        self.state.lock().arrived
    }

    fn advance(&self, state: &mut PhaserState) -> u64 {
        state.phase += 1;
        state.arrived = 0;
        self.phase.send_replace(state.phase);
        state.phase
    }
}

enum Arrival {
    Advanced(u64),
    Waiting(u64),
}

/// A registered party. Deregisters on drop.
pub struct Registration<'a> {
    phaser: &'a Phaser,
    /// Phase this party is waiting in, if any.
    arrived_in: Mutex<Option<u64>>,
}

impl Registration<'_> {
    /// Arrives as this party and waits for the others. Returns the new phase.
    ///
    /// If the returned future is dropped while waiting, the arrival is
    /// withdrawn when the registration is dropped.
    pub async fn arrive_and_await_advance(&self) -> u64 {
        let rx = self.phaser.phase.subscribe();
        match self.phaser.arrive() {
            Arrival::Advanced(phase) => phase,
            Arrival::Waiting(phase) => {
                *self.arrived_in.lock() = Some(phase);
                let next = self.phaser.await_advance(rx, phase).await;
                *self.arrived_in.lock() = None;
                next
            }
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let arrived_in = self.arrived_in.get_mut().take();
        self.phaser.deregister(arrived_in);
    }
}
