//! Per-call choice between local and remote storage.

use crate::models::Identity;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote(Identity),
}

#[must_use]
pub fn use_remote(session: &Session) -> bool {
    session.backend_ready && session.user.is_some()
}

/// Decide the backend for one call. Evaluate against a fresh snapshot every
/// time; the session can change between calls.
#[must_use]
pub fn route(session: &Session) -> Route {
    match &session.user {
        Some(user) if session.backend_ready => Route::Remote(user.clone()),
        _ => Route::Local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Identity {
        Identity {
            id: "u1".to_string(),
            email: None,
        }
    }

    #[test]
    fn test_route_table() {
        let cases = [
            (false, None, Route::Local),
            (false, Some(user()), Route::Local),
            (true, None, Route::Local),
            (true, Some(user()), Route::Remote(user())),
        ];
        for (backend_ready, user, expected) in cases {
            let session = Session { user, backend_ready };
            assert_eq!(use_remote(&session), expected != Route::Local);
            assert_eq!(route(&session), expected);
        }
    }
}
