//! Idle notification side effect.
//!
//! Fires only for sessions resolved directly (never for subagents) when
//! their idle event arrives. The notification carries the session and
//! project ids so the shell's click handler can focus the window and
//! deep-link to the session.

use tracing::{debug, warn};

use paddock_protocol::SessionNotification;

use crate::traits::{Desktop, Storage};

/// Settings key gating idle notifications. Absent means on; only the
/// literal string `"false"` turns them off.
pub const NOTIFY_IDLE_KEY: &str = "notify.idle";

const FALLBACK_TITLE: &str = "Agent session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotifyOutcome {
    Notified,
    Skipped,
}

/// Show a desktop notification for an idle session, unless the window is
/// focused or the user turned notifications off. Lookup and delivery
/// failures are logged and swallowed; idle handling never fails the stream.
pub(crate) async fn maybe_notify(
    storage: &dyn Storage,
    desktop: &dyn Desktop,
    client_session_id: &str,
) -> NotifyOutcome {
    match desktop.window_focused().await {
        Ok(true) => {
            debug!(
                component = "notify",
                event = "notify.skipped",
                client_session_id = %client_session_id,
                reason = "window focused",
                "Skipping idle notification"
            );
            return NotifyOutcome::Skipped;
        }
        Ok(false) => {}
        // Cannot tell; assume unfocused so the user is not left waiting on
        // a finished session.
        Err(error) => {
            debug!(
                component = "notify",
                event = "notify.focus_check_failed",
                error = %error,
                "Focus query failed; treating window as unfocused"
            );
        }
    }

    match storage.setting(NOTIFY_IDLE_KEY).await {
        Ok(Some(value)) if value == "false" => {
            debug!(
                component = "notify",
                event = "notify.skipped",
                client_session_id = %client_session_id,
                reason = "disabled by setting",
                "Skipping idle notification"
            );
            return NotifyOutcome::Skipped;
        }
        Ok(_) => {}
        Err(error) => {
            warn!(
                component = "notify",
                event = "notify.setting_failed",
                error = %error,
                "Could not read notification setting; notifying anyway"
            );
        }
    }

    let session = match storage.session(client_session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            warn!(
                component = "notify",
                event = "notify.session_missing",
                client_session_id = %client_session_id,
                "No session record for idle notification"
            );
            return NotifyOutcome::Skipped;
        }
        Err(error) => {
            warn!(
                component = "notify",
                event = "notify.session_failed",
                client_session_id = %client_session_id,
                error = %error,
                "Session lookup failed for idle notification"
            );
            return NotifyOutcome::Skipped;
        }
    };

    let project = match storage.project(&session.project_id).await {
        Ok(Some(project)) => project,
        Ok(None) => {
            warn!(
                component = "notify",
                event = "notify.project_missing",
                client_session_id = %client_session_id,
                project_id = %session.project_id,
                "No project record for idle notification"
            );
            return NotifyOutcome::Skipped;
        }
        Err(error) => {
            warn!(
                component = "notify",
                event = "notify.project_failed",
                client_session_id = %client_session_id,
                error = %error,
                "Project lookup failed for idle notification"
            );
            return NotifyOutcome::Skipped;
        }
    };

    let notification = SessionNotification {
        client_session_id: client_session_id.to_string(),
        project_id: project.id.clone(),
        title: session
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_TITLE.to_string()),
        body: format!("Finished in {}", project.name),
    };

    if let Err(error) = desktop.notify(notification).await {
        warn!(
            component = "notify",
            event = "notify.delivery_failed",
            client_session_id = %client_session_id,
            error = %error,
            "Desktop notification failed"
        );
        return NotifyOutcome::Skipped;
    }

    debug!(
        component = "notify",
        event = "notify.sent",
        client_session_id = %client_session_id,
        "Idle notification delivered"
    );
    NotifyOutcome::Notified
}
