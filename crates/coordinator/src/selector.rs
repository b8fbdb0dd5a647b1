use mesh_wire::Alias;

/// Which comm-servers a newly-registered client should connect to.
///
/// Owned exclusively by the coordinator's central task — no other task
/// touches selector state, matching the registry's ownership rule.
pub trait ServerSelector: Send {
    fn server_registered(&mut self, alias: Alias);
    fn server_unregistered(&mut self, alias: Alias);
    fn get_server_alias_list(&self, for_peer: Alias) -> Vec<Alias>;
}

/// Returns the full connected-server list, in registration order. This is
/// the default per §4.1 and is what production deployments should use;
/// the spec explicitly does not mandate round-robin or any other split.
#[derive(Default)]
pub struct DefaultServerSelector {
    servers: Vec<Alias>,
}

impl ServerSelector for DefaultServerSelector {
    fn server_registered(&mut self, alias: Alias) {
        if !self.servers.contains(&alias) {
            self.servers.push(alias);
        }
    }

    fn server_unregistered(&mut self, alias: Alias) {
        self.servers.retain(|a| *a != alias);
    }

    fn get_server_alias_list(&self, _for_peer: Alias) -> Vec<Alias> {
        self.servers.clone()
    }
}

/// Returns only the first `limit` connected servers. Exists for driving
/// small, deterministic end-to-end scenarios (the "availableServers[0]
/// and [1]" pattern from the open questions); not the default.
pub struct FixedCountSelector {
    inner: DefaultServerSelector,
    limit: usize,
}

impl FixedCountSelector {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: DefaultServerSelector::default(),
            limit,
        }
    }
}

impl ServerSelector for FixedCountSelector {
    fn server_registered(&mut self, alias: Alias) {
        self.inner.server_registered(alias);
    }

    fn server_unregistered(&mut self, alias: Alias) {
        self.inner.server_unregistered(alias);
    }

    fn get_server_alias_list(&self, for_peer: Alias) -> Vec<Alias> {
        let mut list = self.inner.get_server_alias_list(for_peer);
        list.truncate(self.limit);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_selector_returns_registration_order() {
        let mut selector = DefaultServerSelector::default();
        selector.server_registered(3);
        selector.server_registered(1);
        selector.server_registered(2);
        assert_eq!(selector.get_server_alias_list(99), vec![3, 1, 2]);
    }

    #[test]
    fn unregistering_removes_from_list() {
        let mut selector = DefaultServerSelector::default();
        selector.server_registered(1);
        selector.server_registered(2);
        selector.server_unregistered(1);
        assert_eq!(selector.get_server_alias_list(99), vec![2]);
    }

    #[test]
    fn fixed_count_selector_truncates() {
        let mut selector = FixedCountSelector::new(2);
        selector.server_registered(1);
        selector.server_registered(2);
        selector.server_registered(3);
        assert_eq!(selector.get_server_alias_list(99), vec![1, 2]);
    }
}
