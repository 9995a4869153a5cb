//! External reviewer invitations and one-time login tokens
//!
//! An external reviewer is sent an invitation code by the reviewee. With
//! that code (or, later, just their email) they request a token, which is
//! emailed as a link and redeemed once for a session.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use rand::Rng;
use uuid::Uuid;

use super::ReviewError;
use crate::models::{ExternalUser, ExternalUserToken};

/// Smallest code handed out; six digits without a leading zero
pub const MIN_CODE: i32 = 100_000;
pub const MAX_CODE: i32 = 999_999;

pub const TOKEN_LIFETIME_MINUTES: i64 = 120;
pub const RESEND_COOLDOWN_MINUTES: i64 = 30;

/// Attempts at finding an unused code before giving up
pub const MAX_CODE_ATTEMPTS: usize = 10;

pub const DEFAULT_INVITE_MESSAGE: &str = "[This is an automatically generated message]

Dear %NAME%,

Thank you for agreeing to provide feedback on me for our review process.

Below you will find a code and link to register and submit the feedback. I would be very grateful if you would do this before the deadline of %DEADLINE%.

Thank you so much for your help.

Best wishes,

%SENDER%";

/// Six random decimal digits, re-rolled until there is no leading zero
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> i32 {
    loop {
        let value = (0..6).fold(0, |acc, _| acc * 10 + rng.gen_range(0..10));
        if value >= MIN_CODE {
            return value;
        }
    }
}

/// URL-safe token secret (hex of 32 random bytes)
pub fn generate_secret() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

pub fn token_expiry(issued_at: DateTime<Utc>) -> DateTime<Utc> {
    issued_at + Duration::minutes(TOKEN_LIFETIME_MINUTES)
}

pub fn is_expired(token: &ExternalUserToken, now: DateTime<Utc>) -> bool {
    token.expiry < now
}

/// A found token can still be refused: each one is good for a single login
/// within its lifetime.
pub fn check_token(token: &ExternalUserToken, now: DateTime<Utc>) -> Result<(), ReviewError> {
    if token.redeemed_at.is_some() {
        return Err(ReviewError::rule("This token has already been used."));
    }
    if is_expired(token, now) {
        return Err(ReviewError::rule(
            "This token has expired. Please request a new one.",
        ));
    }
    Ok(())
}

pub fn token_not_found() -> ReviewError {
    ReviewError::not_found("This token is not valid.")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimAction {
    /// Invitation is unclaimed and should be bound to the user
    Bind,
    /// Invitation already belongs to the user
    AlreadyOwned,
}

pub fn claim_invitation(
    current_owner: Option<Uuid>,
    user_id: Uuid,
) -> Result<ClaimAction, ReviewError> {
    match current_owner {
        None => Ok(ClaimAction::Bind),
        Some(owner) if owner == user_id => Ok(ClaimAction::AlreadyOwned),
        Some(_) => Err(ReviewError::rule(
            "This invitation has already been claimed.",
        )),
    }
}

pub fn ensure_enabled(user: &ExternalUser) -> Result<(), ReviewError> {
    if user.is_enabled {
        Ok(())
    } else {
        Err(ReviewError::forbidden("This account has been disabled."))
    }
}

pub fn no_pending_invitations() -> ReviewError {
    ReviewError::not_found("You have no pending invitations.")
}

/// One message per invitation per half hour
pub fn check_resend_cooldown(
    last_sent: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), ReviewError> {
    match last_sent {
        Some(sent) if sent > now - Duration::minutes(RESEND_COOLDOWN_MINUTES) => Err(
            ReviewError::rule("Invitation was already sent less than 30 minutes ago."),
        ),
        _ => Ok(()),
    }
}

/// e.g. "Friday 14 June 2024"
pub fn format_deadline(deadline: Option<DateTime<Utc>>, tz: Tz) -> String {
    match deadline {
        Some(d) => d.with_timezone(&tz).format("%A %-d %B %Y").to_string(),
        None => "the deadline".to_string(),
    }
}

/// Fill in %NAME%, %SENDER% and %DEADLINE%
pub fn personalize(template: &str, name: &str, sender: &str, deadline: &str) -> String {
    template
        .replace("%NAME%", name)
        .replace("%SENDER%", sender)
        .replace("%DEADLINE%", deadline)
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

pub fn invite_url(public_url: &str, email: &str, code: i32) -> String {
    format!(
        "{}/#/login/?email={}&code={}",
        public_url.trim_end_matches('/'),
        encode(email),
        code
    )
}

pub fn redeem_url(public_url: &str, secret: &str) -> String {
    format!("{}/#/key/{}", public_url.trim_end_matches('/'), secret)
}

pub fn invitation_body(message: &str, code: i32, url: &str) -> String {
    format!(
        "{}\n\nYour invitation code: {}\n\nRegister and give feedback here: {}\n",
        message.trim_end(),
        code,
        url
    )
}

pub fn token_body(url: &str) -> String {
    format!(
        "Use the link below to sign in and give feedback. \
        The link can be used once and expires in {} minutes.\n\n{}\n",
        TOKEN_LIFETIME_MINUTES, url
    )
}
