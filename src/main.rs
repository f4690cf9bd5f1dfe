mod auth;
mod config;
mod database;
mod error;
mod forms;
mod handlers;
mod model;

use actix_web::{middleware::Logger, web, App, HttpServer};
use config::Settings;
use database::{FilmDb, SessionDb, UserDb};
use log::info;
use model::*;
use std::io;

fn startup_error<E: std::fmt::Display>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

fn seed_demo(db: &sled::Db) -> Result<(), error::Error> {
    if !db.list_films()?.is_empty() {
        return Ok(());
    }
    let pulp_fiction_id = db.add_film(&Film {
        title: "Pulp Fiction".to_owned(),
        year: 1994,
        age: "18".to_owned(),
        director: "Quentin Tarantino".to_owned(),
        genre: "Crime".to_owned(),
        format: "DVD".to_owned(),
        description: "The lives of two mob hitmen, a boxer and a pair of diner bandits intertwine."
            .to_owned(),
        code: 1,
    })?;
    info!("seeded demo film {}", pulp_fiction_id);
    Ok(())
}

#[actix_rt::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("reelshelf=info,actix_web=info"),
    )
    .init();

    let settings = Settings::from_env().map_err(startup_error)?;
    let tera = tera::Tera::new(concat!(env!("CARGO_MANIFEST_DIR"), "/templates/**/*"))
        .map_err(startup_error)?;
    let db = settings.open_database().map_err(startup_error)?;

    let purged = db.purge_expired_sessions().map_err(startup_error)?;
    if purged > 0 {
        info!("purged {} expired sessions", purged);
    }
    if settings.seed_demo {
        seed_demo(&db).map_err(startup_error)?;
    }

    let users = db.count_users().map_err(startup_error)?;
    let bind_address = settings.bind_address.clone();
    info!("{} registered users, listening on {}", users, bind_address);
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(auth::identity_service(&settings))
            .data(tera.clone())
            .data(db.clone())
            .data(settings.clone())
            .configure(handlers::routes)
            .default_service(web::route().to(handlers::not_found))
    })
    .bind(bind_address)?
    .run()
    .await
}
