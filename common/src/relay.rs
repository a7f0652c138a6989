/// Where a relay request came from. MQTT and the HTTP API share
/// [`RelaySource::RemoteApi`]; they have identical, lowest precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySource {
    Physical,
    RemoteApi,
}

/// Single source of truth for the commanded relay state.
///
/// Any caller may request a value, and the request takes effect
/// immediately. The debounced physical contact is master at tick
/// granularity: [`RelayArbiter::reconcile`] runs once per control-loop
/// iteration and overwrites whatever a remote request left behind, so a
/// conflicting remote override survives at most one tick. The caller owns
/// the GPIO write and the retained state publish for every change this
/// returns.
#[derive(Debug, Clone)]
pub struct RelayArbiter {
    commanded: bool,
    last_source: RelaySource,
}

impl RelayArbiter {
    /// Relay state is never persisted; it is re-derived from the debounced
    /// input at boot.
    pub fn new(input_closed: bool) -> Self {
        Self {
            commanded: input_closed,
            last_source: RelaySource::Physical,
        }
    }

    pub fn commanded(&self) -> bool {
        self.commanded
    }

    pub fn last_source(&self) -> RelaySource {
        self.last_source
    }

    /// Returns the new commanded value when it changed, `None` otherwise.
    pub fn request(&mut self, desired: bool, source: RelaySource) -> Option<bool> {
        self.last_source = source;
        if self.commanded == desired {
            return None;
        }
        self.commanded = desired;
        Some(desired)
    }

    /// Once per control tick: re-derive the desired state from the stable
    /// input (closed contact means relay on) and force it if it differs.
    pub fn reconcile(&mut self, input_closed: bool) -> Option<bool> {
        if self.commanded == input_closed {
            return None;
        }
        self.request(input_closed, RelaySource::Physical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_state_follows_input() {
        assert!(RelayArbiter::new(true).commanded());
        assert!(!RelayArbiter::new(false).commanded());
    }

    #[test]
    fn remote_request_takes_effect_immediately() {
        let mut relay = RelayArbiter::new(false);

        assert_eq!(relay.request(true, RelaySource::RemoteApi), Some(true));
        assert!(relay.commanded());
        assert_eq!(relay.last_source(), RelaySource::RemoteApi);
    }

    #[test]
    fn duplicate_request_reports_no_change() {
        let mut relay = RelayArbiter::new(true);

        assert_eq!(relay.request(true, RelaySource::RemoteApi), None);
        assert_eq!(relay.reconcile(true), None);
    }

    #[test]
    fn physical_input_wins_on_next_tick() {
        let mut relay = RelayArbiter::new(false);

        // Conflicting remote override: visible until the next tick only.
        assert_eq!(relay.request(true, RelaySource::RemoteApi), Some(true));
        assert_eq!(relay.reconcile(false), Some(false));
        assert!(!relay.commanded());
        assert_eq!(relay.last_source(), RelaySource::Physical);
    }

    #[test]
    fn agreeing_remote_request_persists_across_ticks() {
        let mut relay = RelayArbiter::new(true);
        relay.reconcile(true);

        assert_eq!(relay.request(true, RelaySource::RemoteApi), None);
        for _ in 0..5 {
            assert_eq!(relay.reconcile(true), None);
        }
        assert!(relay.commanded());
    }

    #[test]
    fn input_transition_forces_relay_through_tick() {
        let mut relay = RelayArbiter::new(false);

        assert_eq!(relay.reconcile(true), Some(true));
        assert_eq!(relay.reconcile(true), None);
        assert_eq!(relay.reconcile(false), Some(false));
    }
}
