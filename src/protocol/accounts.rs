//! Account lifecycle operations: register, login, logout, change-password.
//!
//! Every failure path maps to exactly one directive; the dispatcher
//! correlates it with the request's sequence id. Password material is
//! wrapped in `Zeroizing` so it is wiped on every exit path, and lookup
//! timing is equalized with a sink derivation when the username is unknown.

use crate::core::frame::{ControlType, Directive, DirectiveFlags, Packet, Reason, Advice};
use crate::protocol::dispatcher::HandlerOutcome;
use crate::protocol::PermissionLevel;
use crate::service::connection::Connection;
use crate::service::server::ServerContext;
use crate::store::NewAccount;
use crate::utils::password;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, Zeroizing};

/// Username shape: 3 to 20 characters from `[A-Za-z0-9_-]`.
pub fn validate_username(username: &str) -> bool {
    (3..=20).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Password policy: 8 to 128 bytes with at least one lowercase letter, one
/// uppercase letter, and one digit.
pub fn is_strong_password(password: &str) -> bool {
    (8..=128).contains(&password.len())
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
}

fn internal_error() -> HandlerOutcome {
    HandlerOutcome::Directive(Directive::error_with(
        Reason::InternalError,
        Advice::BackoffRetry,
        DirectiveFlags::transient(),
    ))
}

pub async fn register(
    ctx: Arc<ServerContext>,
    conn: Arc<Connection>,
    packet: Packet,
    _sequence: u32,
) -> HandlerOutcome {
    let Packet::Credentials { username, password } = packet else {
        return HandlerOutcome::Directive(Directive::error(
            Reason::UnsupportedPacket,
            Advice::DoNotRetry,
        ));
    };
    let password = Zeroizing::new(password);

    if !validate_username(&username) {
        return HandlerOutcome::Directive(Directive::error(
            Reason::InvalidUsername,
            Advice::FixAndRetry,
        ));
    }
    if !is_strong_password(&password) {
        return HandlerOutcome::Directive(Directive::error(
            Reason::WeakPassword,
            Advice::FixAndRetry,
        ));
    }

    let rounds = ctx.config.security.pbkdf2_rounds;
    let (mut salt, mut hash) = password::hash(&password, rounds);

    let inserted = ctx
        .store
        .insert_or_ignore(NewAccount {
            username: username.clone(),
            salt,
            hash,
            role: PermissionLevel::User,
            is_active: true,
        })
        .await;
    salt.zeroize();
    hash.zeroize();

    let id = match inserted {
        Ok(id) => id,
        Err(e) => {
            error!(connection = conn.id(), error = %e, "Account insert failed");
            return internal_error();
        }
    };
    if id <= 0 {
        debug!(connection = conn.id(), username = %username, "Registration rejected: username taken");
        return HandlerOutcome::Directive(Directive::error(
            Reason::AlreadyExists,
            Advice::FixAndRetry,
        ));
    }

    ctx.metrics.registrations.fetch_add(1, Ordering::Relaxed);
    info!(connection = conn.id(), username = %username, "Account registered");
    HandlerOutcome::Directive(Directive::ack())
}

pub async fn login(
    ctx: Arc<ServerContext>,
    conn: Arc<Connection>,
    packet: Packet,
    _sequence: u32,
) -> HandlerOutcome {
    let Packet::Credentials { username, password } = packet else {
        return HandlerOutcome::Directive(Directive::error(
            Reason::UnsupportedPacket,
            Advice::DoNotRetry,
        ));
    };
    let password = Zeroizing::new(password);

    if username.is_empty() || password.is_empty() {
        return HandlerOutcome::Directive(Directive::error(
            Reason::MissingRequiredField,
            Advice::FixAndRetry,
        ));
    }

    let rounds = ctx.config.security.pbkdf2_rounds;
    let view = match ctx.store.get_auth_view_by_username(&username).await {
        Ok(view) => view,
        Err(e) => {
            error!(connection = conn.id(), error = %e, "Auth lookup failed");
            return internal_error();
        }
    };

    let Some(mut view) = view else {
        // Unknown user: burn the same derivation cost as a real verify so
        // the two paths are not separable by timing.
        password::verify_sink(&password, rounds);
        ctx.metrics.logins_failed.fetch_add(1, Ordering::Relaxed);
        return HandlerOutcome::Directive(Directive::error_with(
            Reason::Unauthenticated,
            Advice::Reauthenticate,
            DirectiveFlags::auth_related(),
        ));
    };

    let now = Utc::now();
    if view.failed_login_count >= ctx.config.security.lockout_threshold {
        let window = chrono::Duration::from_std(ctx.config.security.lockout_window())
            .unwrap_or_else(|_| chrono::Duration::seconds(180));
        if let Some(last_failed) = view.last_failed_login_at {
            if now < last_failed + window {
                view.salt.zeroize();
                view.hash.zeroize();
                ctx.metrics.logins_failed.fetch_add(1, Ordering::Relaxed);
                warn!(connection = conn.id(), username = %username, "Login rejected: account locked");
                return HandlerOutcome::Directive(Directive::error_with(
                    Reason::AccountLocked,
                    Advice::BackoffRetry,
                    DirectiveFlags::auth_related(),
                ));
            }
        }
    }

    let verified = password::verify(&password, &view.salt, &view.hash, rounds);
    view.salt.zeroize();
    view.hash.zeroize();

    if !verified {
        if let Err(e) = ctx.store.increment_failed(view.id, now).await {
            warn!(connection = conn.id(), error = %e, "Failed-login stamp failed");
        }
        ctx.metrics.logins_failed.fetch_add(1, Ordering::Relaxed);
        return HandlerOutcome::Directive(Directive::error_with(
            Reason::Unauthenticated,
            Advice::Reauthenticate,
            DirectiveFlags::auth_related(),
        ));
    }

    if !view.is_active {
        ctx.metrics.logins_failed.fetch_add(1, Ordering::Relaxed);
        return HandlerOutcome::Directive(Directive::error_with(
            Reason::AccountSuspended,
            Advice::DoNotRetry,
            DirectiveFlags::auth_related(),
        ));
    }

    if let Err(e) = ctx.store.reset_failed_and_stamp_login(view.id, now).await {
        error!(connection = conn.id(), error = %e, "Login stamp failed");
        return internal_error();
    }

    conn.set_level(view.role.max(PermissionLevel::User));
    ctx.hub.associate_username(&conn, &username);
    ctx.metrics.logins_success.fetch_add(1, Ordering::Relaxed);
    info!(connection = conn.id(), username = %username, level = ?conn.level(), "Login succeeded");
    HandlerOutcome::Directive(Directive::ack())
}

pub async fn logout(
    ctx: Arc<ServerContext>,
    conn: Arc<Connection>,
    _packet: Packet,
    sequence: u32,
) -> HandlerOutcome {
    // The permission gate already required USER; the lookup guards the race
    // where the association vanished in between.
    let Some(username) = ctx.hub.username_of(conn.id()) else {
        return HandlerOutcome::Directive(Directive::error(
            Reason::SessionNotFound,
            Advice::DoNotRetry,
        ));
    };

    if let Err(e) = ctx.store.stamp_logout(&username, Utc::now()).await {
        warn!(connection = conn.id(), username = %username, error = %e, "Logout stamp failed");
    }

    conn.set_level(PermissionLevel::None);
    ctx.hub.dissociate(conn.id());

    conn.send_directive(
        Directive {
            control: ControlType::Disconnect,
            reason: Reason::ClientQuit,
            advice: Advice::None,
            flags: DirectiveFlags::default(),
        },
        sequence,
    );
    conn.disconnect();
    info!(connection = conn.id(), username = %username, "Session logged out");
    HandlerOutcome::None
}

pub async fn change_password(
    ctx: Arc<ServerContext>,
    conn: Arc<Connection>,
    packet: Packet,
    _sequence: u32,
) -> HandlerOutcome {
    let Packet::CredsUpdate {
        old_password,
        new_password,
    } = packet
    else {
        return HandlerOutcome::Directive(Directive::error(
            Reason::UnsupportedPacket,
            Advice::DoNotRetry,
        ));
    };
    let old_password = Zeroizing::new(old_password);
    let new_password = Zeroizing::new(new_password);

    let Some(username) = ctx.hub.username_of(conn.id()) else {
        return HandlerOutcome::Directive(Directive::error(
            Reason::SessionNotFound,
            Advice::DoNotRetry,
        ));
    };

    if !is_strong_password(&new_password) {
        return HandlerOutcome::Directive(Directive::error(
            Reason::WeakPassword,
            Advice::FixAndRetry,
        ));
    }

    let rounds = ctx.config.security.pbkdf2_rounds;
    let mut view = match ctx
        .store
        .get_for_password_change_by_username(&username)
        .await
    {
        Ok(Some(view)) => view,
        Ok(None) => {
            return HandlerOutcome::Directive(Directive::error(
                Reason::SessionNotFound,
                Advice::DoNotRetry,
            ));
        }
        Err(e) => {
            error!(connection = conn.id(), error = %e, "Password-change lookup failed");
            return internal_error();
        }
    };

    if !view.is_active {
        view.salt.zeroize();
        view.hash.zeroize();
        return HandlerOutcome::Directive(Directive::error_with(
            Reason::AccountSuspended,
            Advice::DoNotRetry,
            DirectiveFlags::auth_related(),
        ));
    }

    if !password::verify(&old_password, &view.salt, &view.hash, rounds) {
        view.salt.zeroize();
        view.hash.zeroize();
        return HandlerOutcome::Directive(Directive::error_with(
            Reason::Unauthenticated,
            Advice::Reauthenticate,
            DirectiveFlags::auth_related(),
        ));
    }

    let (mut new_salt, mut new_hash) = password::hash(&new_password, rounds);
    let updated = ctx
        .store
        .update_password_if_matches(view.id, &view.hash, &new_salt, &new_hash)
        .await;
    new_salt.zeroize();
    new_hash.zeroize();
    view.salt.zeroize();
    view.hash.zeroize();

    match updated {
        Ok(0) => {
            // The hash moved between read and update: a concurrent change
            // won the race.
            debug!(connection = conn.id(), username = %username, "Password update lost optimistic race");
            HandlerOutcome::Directive(Directive::error_with(
                Reason::ValidationFailed,
                Advice::BackoffRetry,
                DirectiveFlags::transient(),
            ))
        }
        Ok(_) => {
            info!(connection = conn.id(), username = %username, "Password changed");
            HandlerOutcome::Directive(Directive::ack())
        }
        Err(e) => {
            error!(connection = conn.id(), error = %e, "Password update failed");
            internal_error()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_shape() {
        assert!(validate_username("alice"));
        assert!(validate_username("a_b-c123"));
        assert!(validate_username("abc"));
        assert!(validate_username("a".repeat(20).as_str()));
        assert!(!validate_username("ab"));
        assert!(!validate_username("a".repeat(21).as_str()));
        assert!(!validate_username("bad space"));
        assert!(!validate_username("bad!char"));
        assert!(!validate_username(""));
    }

    #[test]
    fn password_policy() {
        assert!(is_strong_password("Str0ng!Pass"));
        assert!(is_strong_password("Abcdefg1"));
        assert!(!is_strong_password("short1A"));
        assert!(!is_strong_password("alllowercase1"));
        assert!(!is_strong_password("ALLUPPERCASE1"));
        assert!(!is_strong_password("NoDigitsHere"));
        assert!(!is_strong_password(&"Aa1".repeat(50)));
    }
}
