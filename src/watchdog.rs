//! Idle watchdog
//!
//! Reset-on-activity timer: every pulse restarts the idle window, and the
//! task completes once a whole window passes without one.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

/// Why the watchdog task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// No pulse within the idle window
    Idle,
    /// Every pulse sender was dropped
    Released,
}

/// Sending side of the liveness signal
#[derive(Debug, Clone)]
pub struct Pulse {
    sender: mpsc::Sender<()>,
}

impl Pulse {
    /// Record activity; never waits
    pub fn beat(&self) {
        // A full buffer already holds an unconsumed beat
        let _ = self.sender.try_send(());
    }
}

/// Spawn a watchdog with the given idle window
pub fn spawn(idle: Duration) -> (Pulse, JoinHandle<Expiry>) {
    let (sender, receiver) = mpsc::channel(1);
    let task = tokio::spawn(watch(idle, receiver));
    (Pulse { sender }, task)
}

async fn watch(idle: Duration, mut pulses: mpsc::Receiver<()>) -> Expiry {
    loop {
        tokio::select! {
            pulse = pulses.recv() => {
                if pulse.is_none() {
                    return Expiry::Released;
                }
            }
            _ = time::sleep(idle) => return Expiry::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_silence() {
        let (_pulse, task) = spawn(Duration::from_secs(300));
        let started = time::Instant::now();

        assert_eq!(task.await.unwrap(), Expiry::Idle);
        assert!(started.elapsed() >= Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_postpone_expiry() {
        let (pulse, task) = spawn(Duration::from_secs(300));

        for _ in 0..5 {
            time::sleep(Duration::from_secs(200)).await;
            pulse.beat();
        }
        assert!(!task.is_finished());

        let resumed = time::Instant::now();
        assert_eq!(task.await.unwrap(), Expiry::Idle);
        assert!(resumed.elapsed() >= Duration::from_secs(299));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_pulse_releases() {
        let (pulse, task) = spawn(Duration::from_secs(300));
        drop(pulse);

        assert_eq!(task.await.unwrap(), Expiry::Released);
    }
}
