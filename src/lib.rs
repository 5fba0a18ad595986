//! The central report server which accepts agents, their pictures and their reports

#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    deprecated
)]

#[macro_use]
extern crate diesel;

pub mod config;
pub mod db;
pub mod digest;
pub mod endpoints;
pub mod error;
pub mod images;
pub mod ingest;
pub mod models;
pub mod requests;
#[cfg(not(tarpaulin_include))]
pub mod schema;
pub mod util;

use std::path::Path;

use actix_web::{
    middleware::Logger,
    web::{self, Data},
    App, HttpServer,
};
use config::Config;
use db::{Database, DbBackend};
use digest::DigestVerifier;
use images::ImageStore;
use log::info;

/// Collaborators shared by every request, built once from the configuration
#[derive(Debug)]
pub struct State {
    /// Checks the digests of mutating requests
    pub verifier: DigestVerifier,
    /// Where agent pictures and report images are written
    pub images: ImageStore,
    /// The instant that the server started
    pub start_time: std::time::Instant,
}

impl State {
    /// Build the shared state described by `config`
    pub fn new(config: &Config) -> Self {
        Self {
            verifier: DigestVerifier::new(config.secret.as_bytes()),
            images: ImageStore::new(config.data_dir.clone(), config.image_format),
            start_time: std::time::Instant::now(),
        }
    }
}

/// Create the folder tree, then open the database inside it and apply the schema.
///
/// Returns the database and whether the folder tree already existed.
pub async fn init(
    images: &ImageStore,
    db_path: &Path,
) -> Result<(Database, bool), Box<dyn std::error::Error>> {
    // the database file lives inside the data directory, so the tree has to exist first
    let existed = images.init()?;
    if existed {
        info!(
            "folder tree {:?} already exists, using it as is",
            images.root()
        );
    } else {
        info!("created folder tree at {:?}", images.root());
    }

    let database = Database::new(db_path.to_string_lossy())?;
    database.init().await?;
    info!("initialized the database at {:?}", db_path);
    Ok((database, existed))
}

/// Register the shared data and every endpoint of the api
pub fn configure_app(
    cfg: &mut web::ServiceConfig,
    state: Data<State>,
    database: Data<Database>,
    max_payload_bytes: usize,
) {
    cfg.app_data(state)
        .app_data(database)
        .app_data(web::PayloadConfig::new(max_payload_bytes))
        .configure(endpoints::configure);
}

#[doc(hidden)]
pub async fn start(config: Config, state: Data<State>) -> Result<(), Box<dyn std::error::Error>> {
    let (database, _) = init(&state.images, &config.db_path()).await?;
    let database = Data::new(database);
    let max_payload = config.max_payload_bytes;

    // begin listening for connections
    let mut server_handle = HttpServer::new(move || {
        App::new()
            .configure(|cfg| configure_app(cfg, state.clone(), database.clone(), max_payload))
            .wrap(Logger::default())
    })
    .listen(config.listener)?
    .run();

    tokio::select! {
        biased;

        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }

        _ = &mut server_handle => {
            info!("Server task has exited, shutting down");
        }
    }

    Ok(())
}
