//! The ordered registry of UA cores.

use std::sync::{Arc, RwLock};

use sipflow_sip_core::Message;

use crate::handler::UserAgentCore;

/// Identifies a registered core, for deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreId(u64);

/// An ordered set of cores; the first whose `is_applicable` accepts a
/// message handles it. Registration order is dispatch order, and a core
/// stays registered for the process lifetime unless explicitly removed.
#[derive(Default)]
pub struct CoreRegistry {
    inner: RwLock<Vec<(CoreId, Arc<dyn UserAgentCore>)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl CoreRegistry {
    /// An empty registry.
    pub fn new() -> CoreRegistry {
        CoreRegistry::default()
    }

    /// Appends a core, returning its id.
    pub fn register(&self, core: Arc<dyn UserAgentCore>) -> CoreId {
        let id = CoreId(self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
        self.inner.write().unwrap().push((id, core));
        id
    }

    /// Removes a core by id. Returns whether it was present.
    pub fn deregister(&self, id: CoreId) -> bool {
        let mut cores = self.inner.write().unwrap();
        let before = cores.len();
        cores.retain(|(core_id, _)| *core_id != id);
        cores.len() != before
    }

    /// The first core that takes the message, in registration order.
    pub fn find(&self, message: &Message) -> Option<Arc<dyn UserAgentCore>> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .find(|(_, core)| core.is_applicable(message))
            .map(|(_, core)| Arc::clone(core))
    }

    /// Number of registered cores.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    /// Whether no cores are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{CoreAction, CoreContext};
    use async_trait::async_trait;
    use sipflow_sip_core::prelude::*;

    struct MethodCore(Method);

    #[async_trait]
    impl UserAgentCore for MethodCore {
        fn is_applicable(&self, message: &Message) -> bool {
            message.method() == Some(&self.0)
        }
        fn allowed_methods(&self) -> Vec<Method> {
            vec![self.0.clone()]
        }
        async fn on_request(&self, _ctx: &CoreContext, _request: &Request) -> CoreAction {
            CoreAction::Noreply
        }
    }

    fn request(method: Method) -> Message {
        Message::Request(RequestBuilder::new(method, "sip:a@b").unwrap().build())
    }

    #[test]
    fn first_match_wins_in_registration_order() {
        let registry = CoreRegistry::new();
        let options_core = registry.register(Arc::new(MethodCore(Method::Options)));
        registry.register(Arc::new(MethodCore(Method::Options)));

        let found = registry.find(&request(Method::Options)).expect("a core");
        assert!(found.is_applicable(&request(Method::Options)));

        // Dropping the first reveals the second.
        assert!(registry.deregister(options_core));
        assert!(registry.find(&request(Method::Options)).is_some());
    }

    #[test]
    fn no_applicable_core_finds_nothing() {
        let registry = CoreRegistry::new();
        registry.register(Arc::new(MethodCore(Method::Options)));
        assert!(registry.find(&request(Method::Invite)).is_none());
    }

    #[test]
    fn deregister_unknown_id_is_false() {
        let registry = CoreRegistry::new();
        let id = registry.register(Arc::new(MethodCore(Method::Options)));
        assert!(registry.deregister(id));
        assert!(!registry.deregister(id));
        assert!(registry.is_empty());
    }
}
