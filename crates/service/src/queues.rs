use ahash::{HashMap, HashMapExt};

struct Binding {
    queue_id: u32,
    port_no: Option<u16>,
}

/// Output-queue bindings, configured by port *name* and resolved to port
/// *numbers* once the datapath has announced its ports.
///
/// The name map owns the bindings; the number index is the projection of
/// the resolved ones, so a lookup by port number is O(1) on the packet
/// path.
///
/// # Test
///
/// ```
/// use lswitch_service::queues::QueueBindings;
///
/// let mut bindings = QueueBindings::new();
/// bindings.bind("eth0", 7);
///
/// // Unresolved names never match a port number.
/// assert_eq!(bindings.queue_for(5), None);
///
/// bindings.resolve("eth0", 5);
/// assert_eq!(bindings.queue_for(5), Some(7));
///
/// // Re-announcing the port changes nothing.
/// bindings.resolve("eth0", 5);
/// assert_eq!(bindings.queue_for(5), Some(7));
/// ```
#[derive(Default)]
pub struct QueueBindings {
    names: HashMap<String, Binding>,
    ports: HashMap<u16, u32>,
}

impl QueueBindings {
    pub fn new() -> Self {
        Self {
            names: HashMap::new(),
            ports: HashMap::new(),
        }
    }

    /// Bind `name` to `queue_id`. A second bind on the same name replaces
    /// the first, dropping any resolution it had.
    pub fn bind(&mut self, name: &str, queue_id: u32) {
        if let Some(old) = self.names.insert(
            name.to_string(),
            Binding {
                queue_id,
                port_no: None,
            },
        ) {
            if let Some(port_no) = old.port_no {
                self.ports.remove(&port_no);
            }
        }
    }

    /// Record that the port called `name` has number `port_no`. A no-op
    /// for unknown names and for bindings already resolved.
    pub fn resolve(&mut self, name: &str, port_no: u16) {
        if let Some(binding) = self.names.get_mut(name) {
            if binding.port_no.is_none() {
                binding.port_no = Some(port_no);
                self.ports.insert(port_no, binding.queue_id);
            }
        }
    }

    /// The queue bound to `port_no`, if its name has been resolved.
    pub fn queue_for(&self, port_no: u16) -> Option<u32> {
        self.ports.get(&port_no).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebind_replaces_and_drops_resolution() {
        let mut bindings = QueueBindings::new();
        bindings.bind("eth0", 7);
        bindings.resolve("eth0", 5);

        bindings.bind("eth0", 8);
        assert_eq!(bindings.queue_for(5), None);

        bindings.resolve("eth0", 5);
        assert_eq!(bindings.queue_for(5), Some(8));
    }

    #[test]
    fn distinct_ports_keep_distinct_bindings() {
        let mut bindings = QueueBindings::new();
        bindings.bind("eth0", 1);
        bindings.bind("eth1", 2);
        bindings.resolve("eth0", 10);
        bindings.resolve("eth1", 11);

        assert_eq!(bindings.queue_for(10), Some(1));
        assert_eq!(bindings.queue_for(11), Some(2));
        assert_eq!(bindings.queue_for(12), None);
    }

    #[test]
    fn resolve_unknown_name_is_ignored() {
        let mut bindings = QueueBindings::new();
        bindings.resolve("eth9", 3);

        assert_eq!(bindings.queue_for(3), None);
    }
}
