//! Online/offline state shared by the sync service and the forwarder

use tokio::sync::watch;

/// Observable connectivity flag
#[derive(Debug)]
pub struct ConnectivityService {
    state: watch::Sender<bool>,
}

impl ConnectivityService {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self { state }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Set the state; returns true if it changed
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for ConnectivityService {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_are_observed() {
        let connectivity = ConnectivityService::new(false);
        let mut rx = connectivity.subscribe();

        assert!(!connectivity.set_online(false));
        assert!(connectivity.set_online(true));
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(connectivity.is_online());
    }
}
