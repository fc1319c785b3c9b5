//! Route table.
//!
//! # Responsibilities
//! - Store routes in registration order
//! - Select every route whose predicate matches a request
//! - Merge captured parameters across matches
//!
//! # Design Decisions
//! - Immutable once the server starts (shared via Arc, no locks)
//! - O(n) scan; route counts are small
//! - All matches are returned, in registration order; later matches win
//!   parameter-name collisions

use std::fmt;
use std::sync::Arc;

use hyper::Method;

use crate::routing::predicate::{Params, Predicate};

#[derive(Clone)]
struct Route<H> {
    predicate: Arc<dyn Predicate>,
    handler: H,
}

/// Ordered list of predicate/handler pairs.
#[derive(Clone)]
pub struct RouteTable<H> {
    routes: Vec<Route<H>>,
}

/// Outcome of a lookup.
#[derive(Debug)]
pub struct Selection<H> {
    pub handlers: Vec<H>,
    pub params: Params,
}

impl<H> Selection<H> {
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<H: Clone> RouteTable<H> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn add(&mut self, predicate: impl Predicate + 'static, handler: H) {
        self.routes.push(Route {
            predicate: Arc::new(predicate),
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Every matching handler, in registration order. Captures are merged;
    /// later routes overwrite earlier ones.
    pub fn select(&self, method: &Method, path: &str) -> Selection<H> {
        let mut handlers = Vec::new();
        let mut params = Params::new();
        for route in &self.routes {
            if let Some(captured) = route.predicate.test(method, path) {
                params.extend(captured);
                handlers.push(route.handler.clone());
            }
        }
        Selection { handlers, params }
    }
}

impl<H: Clone> Default for RouteTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> fmt::Debug for RouteTable<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|r| &r.predicate))
            .finish()
    }
}
