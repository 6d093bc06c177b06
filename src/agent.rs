//! Duty-cycle agents and the runner that drives them.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BackupError;

/// A unit of work driven by repeated non-blocking invocations.
pub trait Agent {
    /// Called once before the first duty cycle.
    fn on_start(&mut self) -> Result<(), BackupError> {
        Ok(())
    }

    /// Perform one duty cycle without blocking; returns the work done.
    ///
    /// An error does not terminate the agent: the caller reports it and
    /// keeps invoking `do_work`.
    fn do_work(&mut self) -> Result<usize, BackupError>;

    /// Called once after the last duty cycle.
    fn on_close(&mut self) {}

    /// Name used for logging and thread naming.
    fn role_name(&self) -> &str;
}

/// How the runner behaves when a duty cycle produced no work.
#[derive(Debug, Clone)]
pub enum IdleStrategy {
    /// Spin.
    Busy,
    /// Yield the thread.
    Yield,
    /// Park for a fixed duration.
    Sleep(Duration),
    /// Spin, then yield, then park with a doubling duration up to `max`.
    Backoff {
        /// Spins before yielding.
        max_spins: u32,
        /// Yields before parking.
        max_yields: u32,
        /// Initial park duration.
        min_park: Duration,
        /// Park duration ceiling.
        max_park: Duration,
    },
}

impl Default for IdleStrategy {
    fn default() -> Self {
        IdleStrategy::Backoff {
            max_spins: 10,
            max_yields: 5,
            min_park: Duration::from_micros(1),
            max_park: Duration::from_millis(1),
        }
    }
}

/// Per-thread idle state for an [`IdleStrategy`].
#[derive(Debug, Default)]
struct IdleState {
    spins: u32,
    yields: u32,
    park: Option<Duration>,
}

impl IdleStrategy {
    fn idle(&self, state: &mut IdleState, work_count: usize) {
        if work_count > 0 {
            *state = IdleState::default();
            return;
        }

        match self {
            IdleStrategy::Busy => {
                std::hint::spin_loop();
            }
            IdleStrategy::Yield => {
                std::thread::yield_now();
            }
            IdleStrategy::Sleep(duration) => {
                std::thread::park_timeout(*duration);
            }
            IdleStrategy::Backoff {
                max_spins,
                max_yields,
                min_park,
                max_park,
            } => {
                if state.spins < *max_spins {
                    state.spins += 1;
                    std::hint::spin_loop();
                } else if state.yields < *max_yields {
                    state.yields += 1;
                    std::thread::yield_now();
                } else {
                    let park = state.park.unwrap_or(*min_park);
                    std::thread::park_timeout(park);
                    state.park = Some((park * 2).min(*max_park));
                }
            }
        }
    }
}

/// Drives an [`Agent`] on the calling thread until stopped.
///
/// Errors from `do_work` are passed to the error handler and the loop
/// continues, matching the duty-cycle contract.
pub struct AgentRunner<A: Agent> {
    agent: A,
    idle_strategy: IdleStrategy,
    is_running: Arc<AtomicBool>,
}

impl<A: Agent> AgentRunner<A> {
    /// Create a runner; `is_running` is shared so another thread can stop it.
    pub fn new(agent: A, idle_strategy: IdleStrategy, is_running: Arc<AtomicBool>) -> Self {
        Self {
            agent,
            idle_strategy,
            is_running,
        }
    }

    /// A handle that stops the runner when set to `false`.
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        self.is_running.clone()
    }

    /// Run the agent until the running flag clears; returns the agent.
    pub fn run(mut self, mut on_error: impl FnMut(&BackupError)) -> Result<A, BackupError> {
        tracing::info!("agent {} starting", self.agent.role_name());
        self.agent.on_start()?;

        let mut idle_state = IdleState::default();
        while self.is_running.load(Ordering::Acquire) {
            match self.agent.do_work() {
                Ok(work_count) => self.idle_strategy.idle(&mut idle_state, work_count),
                Err(e) => {
                    on_error(&e);
                    self.idle_strategy.idle(&mut idle_state, 0);
                }
            }
        }

        tracing::info!("agent {} closing", self.agent.role_name());
        self.agent.on_close();
        Ok(self.agent)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use super::Agent;
    use super::AgentRunner;
    use super::IdleStrategy;
    use crate::error::BackupError;

    struct CountingAgent {
        cycles: usize,
        stop_after: usize,
        is_running: Arc<AtomicBool>,
        started: bool,
        closed: bool,
        fail_on: Option<usize>,
    }

    impl Agent for CountingAgent {
        fn on_start(&mut self) -> Result<(), BackupError> {
            self.started = true;
            Ok(())
        }

        fn do_work(&mut self) -> Result<usize, BackupError> {
            self.cycles += 1;
            if self.cycles >= self.stop_after {
                self.is_running.store(false, Ordering::Release);
            }
            if Some(self.cycles) == self.fail_on {
                return Err(BackupError::ProgressStalled);
            }
            Ok(1)
        }

        fn on_close(&mut self) {
            self.closed = true;
        }

        fn role_name(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn test_runner_drives_agent_until_stopped() -> anyhow::Result<()> {
        let is_running = Arc::new(AtomicBool::new(true));
        let agent = CountingAgent {
            cycles: 0,
            stop_after: 5,
            is_running: is_running.clone(),
            started: false,
            closed: false,
            fail_on: None,
        };

        let runner = AgentRunner::new(agent, IdleStrategy::Busy, is_running);
        let agent = runner.run(|_| {})?;

        assert!(agent.started);
        assert!(agent.closed);
        assert_eq!(5, agent.cycles);
        Ok(())
    }

    #[test]
    fn test_runner_continues_after_error() -> anyhow::Result<()> {
        let is_running = Arc::new(AtomicBool::new(true));
        let agent = CountingAgent {
            cycles: 0,
            stop_after: 4,
            is_running: is_running.clone(),
            started: false,
            closed: false,
            fail_on: Some(2),
        };

        let mut errors = 0;
        let runner = AgentRunner::new(agent, IdleStrategy::Sleep(Duration::from_millis(1)), is_running);
        let agent = runner.run(|_| errors += 1)?;

        assert_eq!(1, errors);
        assert_eq!(4, agent.cycles);
        Ok(())
    }
}
