use crate::config::Settings;
use crate::database::{SessionDb, UserDb};
use crate::error::{log_error, Error};
use crate::forms::{LoginForm, RegisterForm};
use crate::model::User;
use actix_identity::{CookieIdentityPolicy, Identity, IdentityService};
use actix_web::{
    cookie::Cookie, dev::Payload, http::StatusCode, web, FromRequest, HttpMessage, HttpRequest,
    HttpResponse, ResponseError,
};
use log::{debug, info, warn};
use std::{future::Future, pin::Pin};
use thiserror::Error;

/// Long-lived cookie set by "remember me". It holds the same opaque token as
/// the identity cookie, so the server-side session still decides when it ends.
pub const REMEMBER_COOKIE: &str = "remember-token";

/// The cookie only carries an opaque session token; everything else lives in
/// the `sessions` tree. It has no max age, so it goes away with the browser
/// session; see [`remember_cookie`] for logins that should outlive it.
pub fn identity_service(settings: &Settings) -> IdentityService<CookieIdentityPolicy> {
    IdentityService::new(
        CookieIdentityPolicy::new(&settings.secret_key)
            .name("auth-cookie")
            .secure(settings.secure_cookie),
    )
}

pub fn remember_cookie(token: String, settings: &Settings) -> Cookie<'static> {
    Cookie::build(REMEMBER_COOKIE, token)
        .path("/")
        .http_only(true)
        .secure(settings.secure_cookie)
        .permanent()
        .finish()
}

/// Pass to `del_cookie` to clear [`remember_cookie`].
pub fn forgotten_remember_cookie() -> Cookie<'static> {
    Cookie::build(REMEMBER_COOKIE, "").path("/").finish()
}

pub fn remembered_token(req: &HttpRequest) -> Option<String> {
    req.cookie(REMEMBER_COOKIE)
        .map(|cookie| cookie.value().to_owned())
        .filter(|token| !token.is_empty())
}

/// A logged-in user, resolved from the request's session cookie.
///
/// Using it as a handler argument makes the route require authentication:
/// anonymous requests are redirected to the login page with the requested
/// path and query in `next`. Use `Option<AuthUser>` on public routes.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: u64,
    pub user: User,
    pub token: String,
}

#[derive(Debug, Error)]
#[error("login required for {next}")]
pub struct LoginRequired {
    next: String,
}

impl ResponseError for LoginRequired {
    fn status_code(&self) -> StatusCode {
        StatusCode::FOUND
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::Found()
            .header("location", login_location(&self.next))
            .finish()
    }
}

pub fn login_location(next: &str) -> String {
    format!("/login?next={}", urlencoding::encode(next))
}

impl FromRequest for AuthUser {
    type Error = actix_web::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;
    type Config = ();

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let db = web::Data::<sled::Db>::from_request(req, payload);
        let identity = Identity::from_request(req, payload);
        let remembered = remembered_token(req);
        let next = req
            .uri()
            .path_and_query()
            .map(|path| path.as_str().to_owned())
            .unwrap_or_else(|| req.path().to_owned());
        Box::pin(async move {
            let db = db.await?;
            let identity = identity.await?;
            let current = identity.identity();
            for token in current.iter().chain(remembered.iter()) {
                let found = resolve(&db, token).map_err(|err| log_error(err, "Database error"))?;
                if let Some(user) = found {
                    if current.as_ref() != Some(token) {
                        debug!("restored remembered session for user {}", user.id);
                        identity.remember(user.token.clone());
                    }
                    return Ok(user);
                }
            }
            if current.is_some() {
                debug!("stale session cookie on {}", next);
                identity.forget();
            }
            Err(LoginRequired { next }.into())
        })
    }
}

/// Maps a session token to its user. Expired sessions and sessions whose
/// user no longer exists resolve to `None`.
pub fn resolve(db: &sled::Db, token: &str) -> Result<Option<AuthUser>, Error> {
    let session = match db.get_session(token)? {
        Some(session) => session,
        None => return Ok(None),
    };
    match db.get_user(session.user_id)? {
        Some(user) => Ok(Some(AuthUser {
            id: session.user_id,
            user,
            token: token.to_owned(),
        })),
        None => {
            db.delete_session(token)?;
            Ok(None)
        }
    }
}

pub fn register(db: &sled::Db, form: &RegisterForm, bcrypt_cost: u32) -> Result<u64, Error> {
    let registration = form.validate()?;
    // The insert re-checks inside its transaction; this only avoids hashing
    // for an obvious duplicate.
    if db.get_user_by_email(&registration.details.email)?.is_some() {
        return Err(Error::taken("email"));
    }
    let user = User {
        password_hash: bcrypt::hash(&registration.password, bcrypt_cost)?,
        email: registration.details.email,
        first_name: registration.details.first_name,
        last_name: registration.details.last_name,
    };
    let id = db.add_user(&user)?;
    info!("registered user {}", id);
    Ok(id)
}

/// Verifies the credentials and opens a session, returning its token.
pub fn login(db: &sled::Db, form: &LoginForm, settings: &Settings) -> Result<String, Error> {
    let (user_id, user) = match db.get_user_by_email(&form.email)? {
        Some(found) => found,
        None => {
            warn!("login attempt for unknown email");
            return Err(Error::Auth);
        }
    };
    if !bcrypt::verify(&form.password, &user.password_hash)? {
        warn!("wrong password for user {}", user_id);
        return Err(Error::Auth);
    }
    let ttl = if form.remember() {
        settings.remember_ttl_secs
    } else {
        settings.session_ttl_secs
    };
    let token = db.create_session(user_id, ttl)?;
    info!("user {} logged in", user_id);
    let purged = db.purge_expired_sessions()?;
    if purged > 0 {
        debug!("purged {} expired sessions", purged);
    }
    Ok(token)
}

pub fn logout(db: &sled::Db, token: Option<&str>) -> Result<(), Error> {
    if let Some(token) = token {
        db.delete_session(token)?;
    }
    Ok(())
}

/// Only local paths are accepted as post-login targets.
pub fn safe_next(next: Option<&str>) -> &str {
    match next {
        Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => {
            path
        }
        _ => "/",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    fn settings() -> Settings {
        Settings {
            bcrypt_cost: 4,
            ..Settings::default()
        }
    }

    fn register_form(email: &str) -> RegisterForm {
        RegisterForm {
            first_name: "System".to_owned(),
            last_name: "Testing".to_owned(),
            email: email.to_owned(),
            password: "Sy5temT35t1n8".to_owned(),
            confirm_password: "Sy5temT35t1n8".to_owned(),
        }
    }

    fn login_form(email: &str, password: &str) -> LoginForm {
        LoginForm {
            email: email.to_owned(),
            password: password.to_owned(),
            remember: None,
        }
    }

    fn session_count(db: &sled::Db) -> usize {
        db.open_tree("sessions").unwrap().len()
    }

    #[test]
    fn register_stores_a_hash_not_the_password() {
        let db = db();
        let id = register(&db, &register_form("System@Testing.com"), 4).unwrap();
        let user = db.get_user(id).unwrap().unwrap();
        assert_ne!(user.password_hash, "Sy5temT35t1n8");
        assert!(bcrypt::verify("Sy5temT35t1n8", &user.password_hash).unwrap());
    }

    #[test]
    fn register_with_existing_email_fails() {
        let db = db();
        register(&db, &register_form("System@Testing.com"), 4).unwrap();
        match register(&db, &register_form("system@testing.com"), 4) {
            Err(Error::Validation(errors)) => assert!(errors.get("email").is_some()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(db.count_users().unwrap(), 1);
    }

    #[test]
    fn register_with_invalid_form_writes_nothing() {
        let db = db();
        let form = RegisterForm {
            confirm_password: "mismatch".to_owned(),
            ..register_form("System@Testing.com")
        };
        assert!(matches!(register(&db, &form, 4), Err(Error::Validation(_))));
        assert_eq!(db.count_users().unwrap(), 0);
    }

    #[test]
    fn wrong_password_issues_no_session() {
        let db = db();
        register(&db, &register_form("System@Testing.com"), 4).unwrap();
        let form = login_form("System@Testing.com", "wrong");
        assert!(matches!(login(&db, &form, &settings()), Err(Error::Auth)));
        let form = login_form("nobody@Testing.com", "Sy5temT35t1n8");
        assert!(matches!(login(&db, &form, &settings()), Err(Error::Auth)));
        assert_eq!(session_count(&db), 0);
    }

    #[test]
    fn login_opens_a_session_that_resolves_to_the_user() {
        let db = db();
        let id = register(&db, &register_form("System@Testing.com"), 4).unwrap();
        let form = login_form("system@testing.com", "Sy5temT35t1n8");
        let token = login(&db, &form, &settings()).unwrap();

        let current = resolve(&db, &token).unwrap().unwrap();
        assert_eq!(current.id, id);
        assert_eq!(current.user.first_name, "System");
    }

    #[test]
    fn remember_me_extends_the_session() {
        let db = db();
        let id = register(&db, &register_form("System@Testing.com"), 4).unwrap();
        let settings = Settings {
            session_ttl_secs: 60,
            remember_ttl_secs: 600,
            ..settings()
        };
        let mut form = login_form("System@Testing.com", "Sy5temT35t1n8");
        let short = login(&db, &form, &settings).unwrap();
        form.remember = Some("on".to_owned());
        let long = login(&db, &form, &settings).unwrap();

        let short = db.get_session(&short).unwrap().unwrap();
        let long = db.get_session(&long).unwrap().unwrap();
        assert_eq!(short.user_id, id);
        assert!(long.expires_at >= short.expires_at + 500);
    }

    #[test]
    fn login_sweeps_expired_sessions() {
        let db = db();
        let id = register(&db, &register_form("System@Testing.com"), 4).unwrap();
        let other = register(&db, &register_form("Other@Testing.com"), 4).unwrap();
        let expired = db.create_session(other, 0).unwrap();
        let live = db.create_session(other, 3600).unwrap();

        let form = login_form("System@Testing.com", "Sy5temT35t1n8");
        let token = login(&db, &form, &settings()).unwrap();

        let sessions = db.open_tree("sessions").unwrap();
        assert!(!sessions.contains_key(expired.as_bytes()).unwrap());
        assert!(sessions.contains_key(live.as_bytes()).unwrap());
        assert_eq!(db.get_session(&token).unwrap().unwrap().user_id, id);
        assert_eq!(session_count(&db), 2);
    }

    #[test]
    fn login_location_keeps_the_query() {
        assert_eq!(
            login_location("/catalogue/7/add?own=wanted"),
            "/login?next=%2Fcatalogue%2F7%2Fadd%3Fown%3Dwanted"
        );
    }

    #[test]
    fn logout_is_idempotent() {
        let db = db();
        register(&db, &register_form("System@Testing.com"), 4).unwrap();
        let form = login_form("System@Testing.com", "Sy5temT35t1n8");
        let token = login(&db, &form, &settings()).unwrap();

        logout(&db, Some(&token)).unwrap();
        logout(&db, Some(&token)).unwrap();
        logout(&db, None).unwrap();
        assert!(resolve(&db, &token).unwrap().is_none());
    }

    #[test]
    fn session_of_a_deleted_user_resolves_to_nobody() {
        let db = db();
        let id = register(&db, &register_form("System@Testing.com"), 4).unwrap();
        let token = db.create_session(id, 3600).unwrap();
        let users = db.open_tree("users").unwrap();
        users.remove(id.to_be_bytes()).unwrap();

        assert!(resolve(&db, &token).unwrap().is_none());
        assert_eq!(session_count(&db), 0);
    }

    #[test]
    fn next_must_be_a_local_path() {
        assert_eq!(safe_next(Some("/collection")), "/collection");
        assert_eq!(safe_next(Some("//evil.example")), "/");
        assert_eq!(safe_next(Some("https://evil.example")), "/");
        assert_eq!(safe_next(Some("/\\evil.example")), "/");
        assert_eq!(safe_next(None), "/");
    }
}
