use actix_web::web::Data;
use field_reports_lib::{config::Config, *};

#[doc(hidden)]
#[actix_web::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let config = Config::load()?;
    let state = Data::new(State::new(&config));
    start(config, state).await?;
    Ok(())
}
