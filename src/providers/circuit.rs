//! Sliding-window circuit breaker shared by all calls through one adapter.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Window over which the failure ratio is computed.
    pub window: Duration,
    /// Calls required in the window before the ratio is consulted.
    pub min_throughput: usize,
    /// Failure ratio at which the circuit opens.
    pub failure_ratio: f64,
    /// How long an open circuit rejects before allowing a probe.
    pub break_for: Duration,
}

/// Externally observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
enum State {
    Closed {
        // (finished_at, success) per call, pruned to the window.
        outcomes: VecDeque<(Instant, bool)>,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        probe_in_flight: bool,
    },
}

/// Closed → Open → HalfOpen automaton with atomic transitions behind one
/// lock. Critical sections are a few comparisons, safe to take from async
/// context.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::Closed {
                outcomes: VecDeque::new(),
            }),
        }
    }

    /// Whether a call may proceed. An open circuit past its break window
    /// moves to half-open and admits exactly one probe.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().expect("circuit lock poisoned");

        match &mut *state {
            State::Closed { .. } => true,
            State::Open { until } => {
                if now >= *until {
                    tracing::info!(circuit = %self.name, "circuit half-open, admitting probe");
                    *state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    false
                } else {
                    *probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record the outcome of an admitted call.
    pub fn record(&self, success: bool) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("circuit lock poisoned");

        match &mut *state {
            State::Closed { outcomes } => {
                outcomes.push_back((now, success));
                while let Some((at, _)) = outcomes.front() {
                    if now.duration_since(*at) > self.config.window {
                        outcomes.pop_front();
                    } else {
                        break;
                    }
                }

                let total = outcomes.len();
                if total >= self.config.min_throughput {
                    let failures = outcomes.iter().filter(|(_, ok)| !ok).count();
                    let ratio = failures as f64 / total as f64;
                    if ratio >= self.config.failure_ratio {
                        tracing::warn!(
                            circuit = %self.name,
                            failures,
                            total,
                            "failure ratio {:.2} reached, circuit open for {:?}",
                            ratio,
                            self.config.break_for,
                        );
                        *state = State::Open {
                            until: now + self.config.break_for,
                        };
                    }
                }
            }
            State::HalfOpen { .. } => {
                if success {
                    tracing::info!(circuit = %self.name, "probe succeeded, circuit closed");
                    *state = State::Closed {
                        outcomes: VecDeque::new(),
                    };
                } else {
                    tracing::warn!(circuit = %self.name, "probe failed, circuit re-opened");
                    *state = State::Open {
                        until: now + self.config.break_for,
                    };
                }
            }
            // A late result after the breaker already opened carries no
            // new information.
            State::Open { .. } => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        let state = self.state.lock().expect("circuit lock poisoned");
        match &*state {
            State::Closed { .. } => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitConfig {
        CircuitConfig {
            window: Duration::from_secs(30),
            min_throughput: 5,
            failure_ratio: 0.5,
            break_for: Duration::from_secs(30),
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("email", config())
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_failure_ratio_at_min_throughput() {
        let cb = breaker();

        for _ in 0..4 {
            assert!(cb.try_acquire());
            cb.record(false);
            // Below min throughput the ratio is not consulted.
            assert_eq!(cb.state(), CircuitState::Closed);
        }

        assert!(cb.try_acquire());
        cb.record(false);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_outcomes_below_ratio_stay_closed() {
        let cb = breaker();

        // 4 failures out of 10 (ratio 0.4), spread so no prefix of five or
        // more calls reaches the 0.5 threshold either.
        for success in [
            true, true, true, false, true, false, true, false, true, false,
        ] {
            assert!(cb.try_acquire());
            cb.record(success);
        }

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_single_probe() {
        let cb = breaker();

        for _ in 0..5 {
            cb.try_acquire();
            cb.record(false);
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(cb.try_acquire());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Second caller is rejected while the probe is in flight.
        assert!(!cb.try_acquire());

        cb.record(true);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let cb = breaker();

        for _ in 0..5 {
            cb.try_acquire();
            cb.record(false);
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.try_acquire());
        cb.record(false);

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn window_prunes_old_outcomes() {
        let cb = breaker();

        for _ in 0..4 {
            cb.try_acquire();
            cb.record(false);
        }

        // The old failures age out of the 30s window.
        tokio::time::advance(Duration::from_secs(31)).await;

        for _ in 0..4 {
            cb.try_acquire();
            cb.record(true);
        }
        cb.try_acquire();
        cb.record(false);

        // Window holds 4 successes + 1 failure: ratio 0.2.
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
