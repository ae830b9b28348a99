use actix::Actor;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use log::info;
use std::time::Duration;
use vspd::app::{self, AppCfg, AppState};
use vspd::cron::Cron;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let cfg = AppCfg::from_env();
    let state = AppState::new(cfg.clone()).expect("failed to initialize server state");
    let state = web::Data::new(state);

    info!("starting vspd for {} on {}", cfg.network, cfg.listen);
    Cron::new(state.clone()).start();

    HttpServer::new({
        let state = state.clone();
        move || {
            let admin = app::admin_routes(&state).expect("failed to build admin routes");
            App::new()
                .app_data(state.clone())
                .wrap(Logger::default())
                .service(app::api_routes(&state))
                .service(admin)
        }
    })
    .client_request_timeout(Duration::from_secs(5))
    .shutdown_timeout(10)
    .bind(&cfg.listen)?
    .run()
    .await
}
