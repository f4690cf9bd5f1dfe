use crate::auth::{self, AuthUser};
use crate::config::Settings;
use crate::database::*;
use crate::error::{log_error, Error};
use crate::forms::*;
use crate::model::*;
use actix_identity::Identity;
use actix_web::{http::StatusCode, web, HttpRequest, HttpResponse};
use log::info;
use serde::{Deserialize, Serialize};

type Tera = web::Data<tera::Tera>;
type Db = web::Data<sled::Db>;
type Config = web::Data<Settings>;

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/")
            .route(web::get().to(home))
            .route(web::post().to(home)),
    )
    .service(
        web::resource("/home")
            .route(web::get().to(home))
            .route(web::post().to(home)),
    )
    .service(
        web::resource("/about")
            .route(web::get().to(about))
            .route(web::post().to(about)),
    )
    .service(
        web::resource("/catalogue")
            .route(web::get().to(catalogue))
            .route(web::post().to(catalogue)),
    )
    .service(
        web::resource("/catalogue/{film_id}/add")
            .route(web::get().to(add_to_collection))
            .route(web::post().to(add_to_collection)),
    )
    .service(
        web::resource("/catalogue/{film_id}/edit_movie")
            .route(web::get().to(edit_movie_form))
            .route(web::post().to(edit_movie)),
    )
    .service(
        web::resource("/add_movie")
            .route(web::get().to(add_movie_form))
            .route(web::post().to(add_movie)),
    )
    .service(
        web::resource("/collection")
            .route(web::get().to(collection))
            .route(web::post().to(collection)),
    )
    .service(
        web::resource("/collection/{film_id}/delete")
            .route(web::get().to(remove_from_collection))
            .route(web::post().to(remove_from_collection)),
    )
    .service(
        web::resource("/register")
            .route(web::get().to(register_form))
            .route(web::post().to(register)),
    )
    .service(
        web::resource("/login")
            .route(web::get().to(login_form))
            .route(web::post().to(login)),
    )
    .service(
        web::resource("/logout")
            .route(web::get().to(logout))
            .route(web::post().to(logout)),
    )
    .service(
        web::resource("/account")
            .route(web::get().to(account_form))
            .route(web::post().to(account)),
    )
    .service(
        web::resource("/account/delete")
            .route(web::get().to(account_delete))
            .route(web::post().to(account_delete)),
    );
}

#[derive(Serialize)]
struct Viewer<'a> {
    id: u64,
    email: &'a str,
    first_name: &'a str,
    last_name: &'a str,
}

fn context(current: Option<&AuthUser>) -> tera::Context {
    let mut ctx = tera::Context::new();
    let viewer = current.map(|current| Viewer {
        id: current.id,
        email: &current.user.email,
        first_name: &current.user.first_name,
        last_name: &current.user.last_name,
    });
    ctx.insert("current_user", &viewer);
    ctx
}

fn render(tera: &tera::Tera, template: &str, ctx: &tera::Context) -> actix_web::Result<HttpResponse> {
    render_with_status(tera, template, ctx, StatusCode::OK)
}

fn render_with_status(
    tera: &tera::Tera,
    template: &str,
    ctx: &tera::Context,
    status: StatusCode,
) -> actix_web::Result<HttpResponse> {
    let body = tera
        .render(template, ctx)
        .map_err(|err| log_error(err, "Template error"))?;
    Ok(HttpResponse::build(status)
        .content_type("text/html; charset=utf-8")
        .body(body))
}

fn redirect(location: &str) -> HttpResponse {
    HttpResponse::Found().header("location", location).finish()
}

fn not_found_page(
    tera: &tera::Tera,
    current: Option<&AuthUser>,
    what: &str,
) -> actix_web::Result<HttpResponse> {
    let mut ctx = context(current);
    ctx.insert("what", what);
    render_with_status(tera, "not_found.html", &ctx, StatusCode::NOT_FOUND)
}

pub async fn not_found(current: Option<AuthUser>, tera: Tera) -> actix_web::Result<HttpResponse> {
    not_found_page(&tera, current.as_ref(), "page")
}

async fn home(current: Option<AuthUser>, tera: Tera) -> actix_web::Result<HttpResponse> {
    render(&tera, "home.html", &context(current.as_ref()))
}

async fn about(current: Option<AuthUser>, tera: Tera) -> actix_web::Result<HttpResponse> {
    render(&tera, "about.html", &context(current.as_ref()))
}

#[derive(Serialize)]
struct FilmRow<'a> {
    id: u64,
    #[serde(flatten)]
    film: &'a Film,
}

async fn catalogue(current: Option<AuthUser>, tera: Tera, db: Db) -> actix_web::Result<HttpResponse> {
    let films = db
        .list_films()
        .map_err(|err| log_error(err, "Database error"))?;
    let rows = films
        .iter()
        .map(|(id, film)| FilmRow { id: *id, film })
        .collect::<Vec<_>>();
    let mut ctx = context(current.as_ref());
    ctx.insert("films", &rows);
    render(&tera, "catalogue.html", &ctx)
}

#[derive(Deserialize)]
struct CollectParams {
    #[serde(default)]
    own: OwnStatus,
}

async fn add_to_collection(
    current: AuthUser,
    tera: Tera,
    db: Db,
    film_id: web::Path<u64>,
    params: web::Query<CollectParams>,
) -> actix_web::Result<HttpResponse> {
    let film_id = film_id.into_inner();
    match db.add_to_collection(current.id, film_id, params.own) {
        Ok(entry) => {
            info!(
                "user {} marked film {} as {:?}",
                current.id, film_id, entry.own
            );
            Ok(redirect("/collection"))
        }
        Err(Error::NotFound(what)) => not_found_page(&tera, Some(&current), what),
        Err(err) => Err(log_error(err, "Database error")),
    }
}

fn film_page(
    tera: &tera::Tera,
    current: &AuthUser,
    heading: &str,
    action: &str,
    form: &FilmForm,
    errors: &FieldErrors,
) -> actix_web::Result<HttpResponse> {
    let mut ctx = context(Some(current));
    ctx.insert("heading", heading);
    ctx.insert("action", action);
    ctx.insert("form", form);
    ctx.insert("errors", errors);
    render(tera, "film_form.html", &ctx)
}

async fn add_movie_form(current: AuthUser, tera: Tera) -> actix_web::Result<HttpResponse> {
    film_page(
        &tera,
        &current,
        "Add a film",
        "/add_movie",
        &FilmForm::default(),
        &FieldErrors::default(),
    )
}

async fn add_movie(
    current: AuthUser,
    tera: Tera,
    db: Db,
    form: web::Form<FilmForm>,
) -> actix_web::Result<HttpResponse> {
    let film = match form.validate() {
        Ok(film) => film,
        Err(errors) => return film_page(&tera, &current, "Add a film", "/add_movie", &form, &errors),
    };
    match db.add_film(&film) {
        Ok(film_id) => {
            info!("user {} added film {}", current.id, film_id);
            Ok(redirect("/catalogue"))
        }
        Err(Error::Validation(errors)) => {
            film_page(&tera, &current, "Add a film", "/add_movie", &form, &errors)
        }
        Err(err) => Err(log_error(err, "Database error")),
    }
}

fn edit_action(film_id: u64) -> String {
    format!("/catalogue/{}/edit_movie", film_id)
}

async fn edit_movie_form(
    current: AuthUser,
    tera: Tera,
    db: Db,
    film_id: web::Path<u64>,
) -> actix_web::Result<HttpResponse> {
    let film_id = film_id.into_inner();
    match db
        .get_film(film_id)
        .map_err(|err| log_error(err, "Database error"))?
    {
        Some(film) => film_page(
            &tera,
            &current,
            "Edit film",
            &edit_action(film_id),
            &FilmForm::from(&film),
            &FieldErrors::default(),
        ),
        None => not_found_page(&tera, Some(&current), "film"),
    }
}

async fn edit_movie(
    current: AuthUser,
    tera: Tera,
    db: Db,
    film_id: web::Path<u64>,
    form: web::Form<FilmForm>,
) -> actix_web::Result<HttpResponse> {
    let film_id = film_id.into_inner();
    let action = edit_action(film_id);
    let film = match form.validate() {
        Ok(film) => film,
        Err(errors) => return film_page(&tera, &current, "Edit film", &action, &form, &errors),
    };
    match db.update_film(film_id, &film) {
        Ok(()) => {
            info!("user {} edited film {}", current.id, film_id);
            Ok(redirect("/catalogue"))
        }
        Err(Error::Validation(errors)) => {
            film_page(&tera, &current, "Edit film", &action, &form, &errors)
        }
        Err(Error::NotFound(what)) => not_found_page(&tera, Some(&current), what),
        Err(err) => Err(log_error(err, "Database error")),
    }
}

#[derive(Serialize)]
struct CollectionRow<'a> {
    id: u64,
    own: OwnStatus,
    #[serde(flatten)]
    film: &'a Film,
}

async fn collection(current: AuthUser, tera: Tera, db: Db) -> actix_web::Result<HttpResponse> {
    let items = db
        .list_collection(current.id)
        .map_err(|err| log_error(err, "Database error"))?;
    let rows = items
        .iter()
        .map(|(entry, film)| CollectionRow {
            id: entry.film_id,
            own: entry.own,
            film,
        })
        .collect::<Vec<_>>();
    let mut ctx = context(Some(&current));
    ctx.insert("films", &rows);
    render(&tera, "collection.html", &ctx)
}

async fn remove_from_collection(
    current: AuthUser,
    db: Db,
    film_id: web::Path<u64>,
) -> actix_web::Result<HttpResponse> {
    let film_id = film_id.into_inner();
    let removed = db
        .remove_from_collection(current.id, film_id)
        .map_err(|err| log_error(err, "Database error"))?;
    if removed > 0 {
        info!("user {} removed film {}", current.id, film_id);
    }
    Ok(redirect("/collection"))
}

fn register_page(
    tera: &tera::Tera,
    form: &RegisterForm,
    errors: &FieldErrors,
) -> actix_web::Result<HttpResponse> {
    let mut ctx = context(None);
    ctx.insert("form", form);
    ctx.insert("errors", errors);
    render(tera, "register.html", &ctx)
}

async fn register_form(current: Option<AuthUser>, tera: Tera) -> actix_web::Result<HttpResponse> {
    if current.is_some() {
        return Ok(redirect("/"));
    }
    register_page(&tera, &RegisterForm::default(), &FieldErrors::default())
}

async fn register(
    current: Option<AuthUser>,
    tera: Tera,
    db: Db,
    settings: Config,
    form: web::Form<RegisterForm>,
) -> actix_web::Result<HttpResponse> {
    if current.is_some() {
        return Ok(redirect("/"));
    }
    match auth::register(&db, &form, settings.bcrypt_cost) {
        Ok(_) => Ok(redirect("/login")),
        Err(Error::Validation(errors)) => {
            register_page(&tera, &form.into_inner().without_passwords(), &errors)
        }
        Err(err) => Err(log_error(err, "Registration error")),
    }
}

#[derive(Deserialize)]
struct LoginQuery {
    next: Option<String>,
    failed: Option<String>,
}

async fn login_form(
    current: Option<AuthUser>,
    tera: Tera,
    query: web::Query<LoginQuery>,
) -> actix_web::Result<HttpResponse> {
    let next = query.next.as_deref().map(|next| auth::safe_next(Some(next)));
    if current.is_some() {
        return Ok(redirect(next.unwrap_or("/")));
    }
    let mut ctx = context(None);
    ctx.insert("next", &next);
    ctx.insert("failed", &query.failed.is_some());
    render(&tera, "login.html", &ctx)
}

async fn login(
    req: HttpRequest,
    id: Identity,
    db: Db,
    settings: Config,
    query: web::Query<LoginQuery>,
    form: web::Form<LoginForm>,
) -> actix_web::Result<HttpResponse> {
    let next = query.next.as_deref();
    match auth::login(&db, &form, &settings) {
        Ok(token) => {
            if let Some(previous) = id.identity() {
                auth::logout(&db, Some(&previous))
                    .map_err(|err| log_error(err, "Database error"))?;
            }
            let mut response = HttpResponse::Found();
            response.header("location", auth::safe_next(next));
            if form.remember() {
                response.cookie(auth::remember_cookie(token.clone(), &settings));
            } else if auth::remembered_token(&req).is_some() {
                response.del_cookie(&auth::forgotten_remember_cookie());
            }
            id.remember(token);
            Ok(response.finish())
        }
        Err(Error::Auth) => {
            let location = match next {
                Some(next) => format!(
                    "/login?failed&next={}",
                    urlencoding::encode(auth::safe_next(Some(next)))
                ),
                None => "/login?failed".to_owned(),
            };
            Ok(redirect(&location))
        }
        Err(err) => Err(log_error(err, "Authentication error")),
    }
}

/// Ends the login on the browser side: both the identity and the remember
/// cookie are cleared.
fn forget_login(id: Identity, location: &str) -> HttpResponse {
    id.forget();
    HttpResponse::Found()
        .header("location", location)
        .del_cookie(&auth::forgotten_remember_cookie())
        .finish()
}

async fn logout(req: HttpRequest, id: Identity, db: Db) -> actix_web::Result<HttpResponse> {
    for token in id.identity().into_iter().chain(auth::remembered_token(&req)) {
        auth::logout(&db, Some(&token)).map_err(|err| log_error(err, "Database error"))?;
    }
    Ok(forget_login(id, "/login"))
}

fn account_page(
    tera: &tera::Tera,
    current: &AuthUser,
    form: &AccountForm,
    errors: &FieldErrors,
) -> actix_web::Result<HttpResponse> {
    let mut ctx = context(Some(current));
    ctx.insert("form", form);
    ctx.insert("errors", errors);
    render(tera, "account.html", &ctx)
}

async fn account_form(current: AuthUser, tera: Tera) -> actix_web::Result<HttpResponse> {
    let form = AccountForm::from(&current.user);
    account_page(&tera, &current, &form, &FieldErrors::default())
}

async fn account(
    current: AuthUser,
    tera: Tera,
    db: Db,
    form: web::Form<AccountForm>,
) -> actix_web::Result<HttpResponse> {
    let details = match form.validate() {
        Ok(details) => details,
        Err(errors) => return account_page(&tera, &current, &form, &errors),
    };
    match db.update_user(current.id, &details) {
        Ok(_) => {
            info!("user {} updated their account", current.id);
            Ok(redirect("/account"))
        }
        Err(Error::Validation(errors)) => account_page(&tera, &current, &form, &errors),
        Err(Error::NotFound(what)) => not_found_page(&tera, None, what),
        Err(err) => Err(log_error(err, "Database error")),
    }
}

async fn account_delete(current: AuthUser, id: Identity, db: Db) -> actix_web::Result<HttpResponse> {
    match db.delete_user(current.id, Some(&current.token)) {
        Ok(()) => info!("user {} deleted their account", current.id),
        // Already gone, e.g. a second click racing the first.
        Err(Error::NotFound(_)) => {}
        Err(err) => return Err(log_error(err, "Database error")),
    }
    Ok(forget_login(id, "/register"))
}
