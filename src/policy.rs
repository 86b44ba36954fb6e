//! Collaborator seams and the liveness activity policy.
//!
//! The core never decides session policy; it only forwards signals to the
//! collaborators defined here. Every trait has a no-op default implementation
//! so the core can be constructed without wiring the full application.

use serde_json::Value;

use crate::domain::Destination;

/// Raw-socket close codes with session-policy meaning.
///
/// Any other code (or the absence of one) is treated as a transient loss and
/// triggers the silent reconnect loop.
pub const CLOSE_SESSION_EXPIRED: u16 = 4000;
pub const CLOSE_LOGGED_OUT: u16 = 4001;
pub const CLOSE_ADMIN_LOGOUT: u16 = 4002;

/// Session lifecycle collaborator.
///
/// Receives forwarded signals when the raw socket closes with a code that
/// indicates the session ended by policy rather than by network accident.
pub trait SessionEvents: Send + Sync {
    /// The user was logged out elsewhere.
    ///
    /// `indirect` is true when the logout did not originate from this
    /// window; `from_admin_console` is true when an administrator forced it.
    fn logout(&self, indirect: bool, from_admin_console: bool);

    /// The server-side session timed out.
    fn session_expired(&self);
}

/// Liveness collaborator.
///
/// Called zero or more times per outbound send, gated by the
/// [`ActivityPolicy`]. Throttling and dispatch are the collaborator's
/// responsibility.
pub trait Liveness: Send + Sync {
    fn heartbeat(&self);
}

/// Environment reload collaborator.
///
/// Invoked when the reconnect budget exhausts and the configuration asks for
/// a hard reload instead of a terminal error.
pub trait ReloadHook: Send + Sync {
    fn reload(&self);
}

/// Decides whether an outbound send is evidence of user activity.
///
/// High-frequency automated traffic must not keep a session alive on its
/// own; the policy inspects destination and payload to tell the difference.
/// The heuristic is deliberately pluggable: the field names it keys on are
/// protocol details, not core semantics.
pub trait ActivityPolicy: Send + Sync {
    /// True if sending `body` to `destination` should signal liveness.
    fn signals_activity(&self, destination: &Destination, body: &[u8]) -> bool;
}

/// Default activity policy.
///
/// Destinations whose final path segment is `touch` carry periodic
/// machine-generated payloads; for those the JSON body is inspected and
/// liveness is signaled only when `userOriginated` or `visible` is true.
/// Unparseable touch bodies stay silent. Every other destination signals on
/// each send.
#[derive(Debug, Default, Clone, Copy)]
pub struct TouchInspectionPolicy;

impl ActivityPolicy for TouchInspectionPolicy {
    fn signals_activity(&self, destination: &Destination, body: &[u8]) -> bool {
        // ---
        let is_touch = destination
            .0
            .rsplit('/')
            .next()
            .is_some_and(|segment| segment == "touch");

        if !is_touch {
            return true;
        }

        match serde_json::from_slice::<Value>(body) {
            Ok(value) => {
                let flag = |name: &str| value.get(name).and_then(Value::as_bool).unwrap_or(false);
                flag("userOriginated") || flag("visible")
            }
            Err(_) => false,
        }
    }
}

/// No-op collaborator wired in when the application does not care about a
/// signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCollaborator;

impl SessionEvents for NullCollaborator {
    fn logout(&self, _indirect: bool, _from_admin_console: bool) {}
    fn session_expired(&self) {}
}

impl Liveness for NullCollaborator {
    fn heartbeat(&self) {}
}

impl ReloadHook for NullCollaborator {
    fn reload(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_destination_always_signals() {
        // ---
        let policy = TouchInspectionPolicy;
        let dest = Destination::from("/app/chat/send");

        assert!(policy.signals_activity(&dest, b"{}"));
        assert!(policy.signals_activity(&dest, b"not json"));
    }

    #[test]
    fn touch_signals_only_on_activity_flags() {
        // ---
        let policy = TouchInspectionPolicy;
        let dest = Destination::from("/app/session/touch");

        assert!(policy.signals_activity(&dest, br#"{"userOriginated":true}"#));
        assert!(policy.signals_activity(&dest, br#"{"visible":true,"userOriginated":false}"#));
        assert!(!policy.signals_activity(&dest, br#"{"userOriginated":false,"visible":false}"#));
        assert!(!policy.signals_activity(&dest, br#"{"other":true}"#));
    }

    #[test]
    fn unparseable_touch_body_is_silent() {
        // ---
        let policy = TouchInspectionPolicy;
        let dest = Destination::from("/app/session/touch");

        assert!(!policy.signals_activity(&dest, b"binary \xff payload"));
    }
}
