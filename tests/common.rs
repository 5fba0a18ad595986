#![cfg(not(tarpaulin_include))]
#![allow(dead_code)]

use std::{path::Path, sync::Once, thread::JoinHandle};

use actix_web::{middleware::Logger, web::Data, App, HttpServer};
use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use tokio::sync::oneshot;

use field_reports_lib::{
    configure_app, db::Database, digest::DigestVerifier, images::ImageStore, init, State,
};

pub const SECRET: &str = "password";

static INIT: Once = Once::new();

pub fn init_logger() {
    INIT.call_once(|| {
        pretty_env_logger::init();
    });
}

pub fn find_open_port() -> std::net::TcpListener {
    for port in 1025..65535 {
        if let Ok(l) = std::net::TcpListener::bind(("127.0.0.1", port)) {
            return l;
        }
    }
    panic!("no open ports found");
}

/// Serialize `body` and compute the digest the server expects for it
pub fn sign(body: &serde_json::Value) -> (Vec<u8>, String) {
    let body = serde_json::to_vec(body).unwrap();
    let digest = DigestVerifier::new(SECRET).sign(&body);
    (body, digest)
}

/// Base64 encoded png of random pixels, which does not compress
pub fn noisy_png_payload(width: u32, height: u32) -> String {
    let img = DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |_, _| {
        Rgb(rand::random::<[u8; 3]>())
    }));
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    general_purpose::STANDARD.encode(buf.into_inner())
}

/// Base64 encoded png of the given size
pub fn png_payload(width: u32, height: u32) -> String {
    let img = DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 90])
    }));
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    general_purpose::STANDARD.encode(buf.into_inner())
}

pub fn dimensions(bytes: &[u8]) -> (u32, u32) {
    let img = image::load_from_memory(bytes).unwrap();
    (img.width(), img.height())
}

pub async fn create_server(
    data_dir: &Path,
    port: std::net::TcpListener,
    max_payload_bytes: usize,
) -> (
    Data<Database>,
    Data<State>,
    JoinHandle<()>,
    oneshot::Sender<()>,
) {
    let state = Data::new(State {
        verifier: DigestVerifier::new(SECRET),
        images: ImageStore::new(data_dir, ImageFormat::Png),
        start_time: std::time::Instant::now(),
    });

    let (db, _) = init(&state.images, &data_dir.join("reports.db"))
        .await
        .expect("a valid database connection");
    let db = Data::new(db);

    let server_db = db.clone();
    let server_state = state.clone();
    let (tx, mut rx) = oneshot::channel::<()>();
    let handle = std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let mut server = HttpServer::new(move || {
                App::new()
                    .configure(|cfg| {
                        configure_app(
                            cfg,
                            server_state.clone(),
                            server_db.clone(),
                            max_payload_bytes,
                        )
                    })
                    .wrap(Logger::default())
            })
            .workers(1)
            .listen(port)
            .unwrap()
            .run();

            tokio::select! {
                biased;
                _ = &mut rx => {}
                _ = &mut server => {}
            }
        });
    });

    (db, state, handle, tx)
}
