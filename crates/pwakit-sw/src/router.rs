//! Request classification.
//!
//! Routes are evaluated in order and the first match wins. Requests that are
//! not GET or not HTTP(S) are never intercepted, whatever the table says.

use std::fmt;

use pwakit_common::Result;
use pwakit_core::{NavigationStrategy, WorkerConfig};
use pwakit_net::{matches_any, Request, UrlPattern};
use tracing::trace;

use crate::offline::FallbackKind;

/// Caching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    NetworkOnly,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::CacheFirst => "cache-first",
            Strategy::NetworkFirst => "network-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
            Strategy::NetworkOnly => "network-only",
        };
        f.write_str(name)
    }
}

impl From<NavigationStrategy> for Strategy {
    fn from(strategy: NavigationStrategy) -> Self {
        match strategy {
            NavigationStrategy::StaleWhileRevalidate => Strategy::StaleWhileRevalidate,
            NavigationStrategy::NetworkFirst => Strategy::NetworkFirst,
        }
    }
}

/// What a route matches.
#[derive(Debug, Clone)]
pub enum RouteMatcher {
    /// Any of the URL patterns.
    Patterns(Vec<UrlPattern>),
    /// Navigations and requests that accept `text/html`.
    Navigation,
    /// Everything.
    Any,
}

impl RouteMatcher {
    pub fn matches(&self, request: &Request) -> bool {
        match self {
            RouteMatcher::Patterns(patterns) => matches_any(patterns, &request.url),
            RouteMatcher::Navigation => request.is_navigation() || request.accepts_html(),
            RouteMatcher::Any => true,
        }
    }
}

/// One routing rule.
#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    pub matcher: RouteMatcher,
    pub strategy: Strategy,
    pub fallback: FallbackKind,
}

impl Route {
    pub fn new(name: &str, matcher: RouteMatcher, strategy: Strategy) -> Self {
        Self {
            name: name.to_string(),
            matcher,
            strategy,
            fallback: FallbackKind::Auto,
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackKind) -> Self {
        self.fallback = fallback;
        self
    }
}

/// Result of classifying a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Not intercepted; the host performs the request itself.
    Passthrough,
    /// Handle with a strategy.
    Handle {
        route: String,
        strategy: Strategy,
        fallback: FallbackKind,
    },
}

/// Ordered route table.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Router over an explicit table.
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Default table for a worker configuration:
    /// never-cache, navigation, static assets, everything else.
    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        let navigation = Strategy::from(config.navigation_strategy);
        Ok(Self::new(vec![
            Route::new(
                "never-cache",
                RouteMatcher::Patterns(config.never_cache_patterns()?),
                Strategy::NetworkOnly,
            ),
            Route::new("navigation", RouteMatcher::Navigation, navigation)
                .with_fallback(FallbackKind::Document),
            Route::new(
                "static-asset",
                RouteMatcher::Patterns(config.asset_patterns()),
                Strategy::CacheFirst,
            ),
            Route::new("default", RouteMatcher::Any, Strategy::StaleWhileRevalidate),
        ]))
    }

    /// Append a route after the existing ones.
    pub fn push(&mut self, route: Route) {
        self.routes.push(route);
    }

    /// Route table, in evaluation order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Classify a request.
    pub fn classify(&self, request: &Request) -> RouteDecision {
        if request.method != http::Method::GET || !request.is_http() {
            trace!(url = %request.url, method = %request.method, "Passing through");
            return RouteDecision::Passthrough;
        }

        match self.routes.iter().find(|r| r.matcher.matches(request)) {
            Some(route) => {
                trace!(url = %request.url, route = %route.name, strategy = %route.strategy, "Routed");
                RouteDecision::Handle {
                    route: route.name.clone(),
                    strategy: route.strategy,
                    fallback: route.fallback,
                }
            }
            None => RouteDecision::Passthrough,
        }
    }
}
