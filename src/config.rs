//! Handle configuration of the report server.

use std::{
    env, fmt,
    net::{Ipv4Addr, TcpListener},
    path::PathBuf,
};

use dotenv::dotenv;
use image::ImageFormat;

/// Name of the sqlite file inside the data directory
pub const DB_FILE: &str = "reports.db";
/// Default limit on request bodies, base64 photos are large
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Handles all configuration variables for the crate
pub struct Config {
    /// The listener to bind to
    pub listener: TcpListener,
    /// Root of the persisted layout: the database file and the image folders
    pub data_dir: PathBuf,
    /// Shared secret keying the HMAC digests of all mutating requests
    pub secret: String,
    /// Format every stored image is encoded as
    pub image_format: ImageFormat,
    /// Largest request body accepted, in bytes
    pub max_payload_bytes: usize,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("listener", &self.listener)
            .field("data_dir", &self.data_dir)
            .field("secret", &"<redacted>")
            .field("image_format", &self.image_format)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .finish()
    }
}

/// Parse the name of one of the supported output formats
pub fn parse_image_format(name: &str) -> Result<ImageFormat, String> {
    match name.trim().to_ascii_lowercase().as_str() {
        "png" => Ok(ImageFormat::Png),
        "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
        "gif" => Ok(ImageFormat::Gif),
        "bmp" => Ok(ImageFormat::Bmp),
        "webp" => Ok(ImageFormat::WebP),
        other => Err(format!("IMAGE_FORMAT `{}` is not a supported format", other)),
    }
}

impl Config {
    /// Load configuration from the environment
    pub fn load() -> Result<Config, String> {
        dotenv().ok();

        let host: Ipv4Addr = env::var("HOST")
            .map_err(|_| "HOST must be set")?
            .parse()
            .map_err(|_| "HOST must be a valid IPv4 address")?;

        let port: u16 = env::var("PORT")
            .map_err(|_| "PORT must be set")?
            .parse()
            .map_err(|_| "PORT must be a valid port number")?;

        let listener = TcpListener::bind((host, port))
            .map_err(|e| format!("failed to bind to {}:{} due to error: {}", host, port, e))?;

        let secret = env::var("SECRET").map_err(|_| "SECRET must be set")?;
        if secret.is_empty() {
            return Err(String::from("SECRET must not be empty"));
        }

        Ok(Self {
            listener,
            data_dir: env::var("DATA_DIR")
                .map_err(|_| "DATA_DIR must be set")?
                .into(),
            secret,
            image_format: match env::var("IMAGE_FORMAT") {
                Ok(f) => parse_image_format(&f)?,
                Err(_) => ImageFormat::Png,
            },
            max_payload_bytes: match env::var("MAX_PAYLOAD_BYTES") {
                Ok(v) => v
                    .parse()
                    .map_err(|_| "MAX_PAYLOAD_BYTES must be a positive integer")?,
                Err(_) => DEFAULT_MAX_PAYLOAD_BYTES,
            },
        })
    }

    /// Location of the sqlite database
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }
}
