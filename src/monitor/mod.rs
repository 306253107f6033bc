//! Game process monitor
//!
//! Polls the process list on a background task and reports monitored games
//! starting and stopping. The list of games can change while running.

mod process;

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub use process::{executable_file_name, ProcessSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A monitored executable appeared
    Started(String),
    /// A monitored executable is gone
    Stopped(String),
}

/// Keep only the entries whose executable is in `games` (case-insensitive)
pub fn filter_watched(snapshot: &ProcessSnapshot, games: &[String]) -> ProcessSnapshot {
    snapshot
        .iter()
        .filter(|(key, _)| games.iter().any(|game| game.eq_ignore_ascii_case(key)))
        .map(|(key, name)| (key.clone(), name.clone()))
        .collect()
}

/// Events that turn `previous` into `current`. Stops are reported before
/// starts, each group in name order.
pub fn diff_snapshots(previous: &ProcessSnapshot, current: &ProcessSnapshot) -> Vec<ProcessEvent> {
    let mut stopped: Vec<&String> = previous
        .iter()
        .filter(|(key, _)| !current.contains_key(*key))
        .map(|(_, name)| name)
        .collect();
    stopped.sort();

    let mut started: Vec<&String> = current
        .iter()
        .filter(|(key, _)| !previous.contains_key(*key))
        .map(|(_, name)| name)
        .collect();
    started.sort();

    stopped
        .into_iter()
        .map(|name| ProcessEvent::Stopped(name.clone()))
        .chain(started.into_iter().map(|name| ProcessEvent::Started(name.clone())))
        .collect()
}

pub struct ProcessMonitor {
    interval: Duration,
    games: watch::Receiver<Vec<String>>,
    events: mpsc::Sender<ProcessEvent>,
}

impl ProcessMonitor {
    pub fn new(
        interval: Duration,
        games: watch::Receiver<Vec<String>>,
        events: mpsc::Sender<ProcessEvent>,
    ) -> Self {
        Self {
            interval,
            games,
            events,
        }
    }

    /// Run on a background task until the event receiver goes away
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!("Process monitor polling every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut previous = ProcessSnapshot::new();

        loop {
            ticker.tick().await;

            let current = match tokio::task::spawn_blocking(process::snapshot).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Process enumeration failed: {}", e);
                    continue;
                }
            };
            let games = self.games.borrow().clone();
            let current = filter_watched(&current, &games);

            for event in diff_snapshots(&previous, &current) {
                debug!("Process event: {:?}", event);
                if self.events.send(event).await.is_err() {
                    debug!("Process monitor receiver closed");
                    return;
                }
            }
            previous = current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_of(names: &[&str]) -> ProcessSnapshot {
        let mut snapshot = ProcessSnapshot::new();
        for name in names {
            process::insert(&mut snapshot, name);
        }
        snapshot
    }

    #[test]
    fn diff_reports_stops_then_starts() {
        let previous = snapshot_of(&["explorer.exe", "Halo.exe", "b.exe"]);
        let current = snapshot_of(&["explorer.exe", "valorant.exe", "a.exe"]);

        assert_eq!(
            diff_snapshots(&previous, &current),
            vec![
                ProcessEvent::Stopped("Halo.exe".to_string()),
                ProcessEvent::Stopped("b.exe".to_string()),
                ProcessEvent::Started("a.exe".to_string()),
                ProcessEvent::Started("valorant.exe".to_string()),
            ]
        );
        assert!(diff_snapshots(&current, &current).is_empty());
    }

    #[test]
    fn watched_filter_ignores_case() {
        let snapshot = snapshot_of(&["EldenRing.exe", "steam.exe"]);
        let watched = filter_watched(&snapshot, &["eldenring.exe".to_string()]);

        assert_eq!(watched.len(), 1);
        assert_eq!(watched["eldenring.exe"], "EldenRing.exe");
    }

    #[test]
    fn newly_watched_running_game_is_reported() {
        let running = snapshot_of(&["Hades.exe"]);
        let before = filter_watched(&running, &[]);
        let after = filter_watched(&running, &["hades.exe".to_string()]);

        assert_eq!(
            diff_snapshots(&before, &after),
            vec![ProcessEvent::Started("Hades.exe".to_string())]
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn monitor_reports_watched_running_process() {
        let own = std::env::current_exe().unwrap();
        let own = own.file_name().unwrap().to_string_lossy().into_owned();
        let (_games_tx, games_rx) = watch::channel(vec![own.clone()]);
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ProcessMonitor::new(Duration::from_millis(10), games_rx, tx).spawn();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        match event {
            Some(ProcessEvent::Started(name)) => assert!(name.eq_ignore_ascii_case(&own)),
            other => panic!("unexpected event {:?}", other),
        }
        handle.abort();
    }
}
