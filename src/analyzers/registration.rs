//! Wires the six thin section producers into a [`DependencyResolver`].
//!
//! The statistical content of each section analyser is out of scope for
//! this crate; these adapters exist so the orchestration core is runnable
//! end-to-end against a real file and so the producer contract has a
//! concrete, testable implementation.

use std::sync::Arc;

use crate::core::artefact::NodeId;
use crate::core::resolver::DependencyResolver;

/// Register the built-in section producers on `resolver`.
pub fn register_default_producers(resolver: &DependencyResolver) {
    resolver.register(NodeId::Section1, Arc::new(crate::analyzers::section1::Section1Producer));
    resolver.register(NodeId::Section2, Arc::new(crate::analyzers::section2::Section2Producer));
    resolver.register(NodeId::Section3, Arc::new(crate::analyzers::section3::Section3Producer));
    resolver.register(NodeId::Section4, Arc::new(crate::analyzers::section4::Section4Producer));
    resolver.register(NodeId::Section5, Arc::new(crate::analyzers::section5::Section5Producer));
    resolver.register(NodeId::Section6, Arc::new(crate::analyzers::section6::Section6Producer));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::ResultCache;
    use crate::core::config::Options;
    use crate::core::graph::DependencyGraph;
    use std::sync::Arc as StdArc;

    #[test]
    fn all_six_producers_register() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        std::fs::write(&file, b"a,b\n1,2\n").unwrap();
        let graph = StdArc::new(DependencyGraph::default_graph().unwrap());
        let cache = StdArc::new(ResultCache::new(64 * 1024 * 1024, "1"));
        let resolver = DependencyResolver::new(&file, Options::default(), graph, cache);
        register_default_producers(&resolver);
        for node in NodeId::ALL {
            assert!(resolver.has_producer(node));
        }
    }
}
