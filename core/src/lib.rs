//! Record storage for the meal planner.
//!
//! [`StoreFacade`](service::StoreFacade) routes each call to browser-style
//! local storage or to a multi-tenant remote backend, depending on whether a
//! user is signed in, and copies local data across on first sign-in.

pub mod error;
pub mod local;
pub mod migration;
pub mod models;
pub mod remote;
pub mod selector;
pub mod service;
pub mod session;
pub mod store;
