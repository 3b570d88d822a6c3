pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod errors;
pub mod expiry;
pub mod geo;
pub mod hub;
pub mod invites;
pub mod models;
pub mod reminders;
pub mod routes;
pub mod wechat;

use config::Config;
use db::Db;
use hub::Hub;
use rocket::fairing::AdHoc;
use rocket::fs::FileServer;
use rocket_cors::CorsOptions;
use std::sync::Arc;
use wechat::WeChatClient;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    build_rocket(Config::from_env())
}

/// Test entry point: same server over a caller-chosen SQLite file.
pub fn rocket_with_db(db_path: &str) -> rocket::Rocket<rocket::Build> {
    let mut config = Config::from_env();
    config.database_url = format!("sqlite://{db_path}");
    build_rocket(config)
}

pub fn build_rocket(config: Config) -> rocket::Rocket<rocket::Build> {
    let db_path = config
        .sqlite_path()
        .expect("DATABASE_URL must be a sqlite:// URL for this build")
        .to_string();
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    std::fs::create_dir_all(&config.upload_dir).ok();

    let db = Db::new(&db_path);
    let hub = Hub::new();
    let wechat = Arc::new(WeChatClient::new(config.wechat.clone()));

    let cors = CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    let (address, port) = config.bind();
    let figment = rocket::Config::figment()
        .merge(("address", address))
        .merge(("port", port))
        .merge(("limits.json", 2 * 1024 * 1024))
        // Multipart uploads: 50 MiB file cap plus form overhead.
        .merge(("limits.file", 50 * 1024 * 1024))
        .merge(("limits.data-form", 51 * 1024 * 1024));

    let upload_dir = config.upload_dir.clone();

    rocket::custom(figment)
        .manage(db)
        .manage(hub)
        .manage(wechat)
        .manage(config)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![
                routes::bad_request,
                routes::unauthorized,
                routes::not_found,
                routes::method_not_allowed,
                routes::unprocessable,
                routes::internal_error,
            ],
        )
        .mount(
            "/",
            rocket::routes![
                routes::healthz,
                routes::readyz,
                routes::register,
                routes::login,
                routes::logout,
                routes::me,
                routes::list_users,
                routes::get_me,
                routes::get_user_by_id,
                routes::update_me,
                routes::create_session,
                routes::list_sessions,
                routes::archive_session,
                routes::reactivate_session,
                routes::hide_session,
                routes::get_relationship,
                routes::put_relationship,
                routes::list_messages,
                routes::create_message,
                routes::read_burn_message,
                routes::list_session_requests,
                routes::create_session_request,
                routes::session_invite,
                routes::update_session_invite,
                routes::consume_session_invite,
                routes::accept_session_request,
                routes::reject_session_request,
                routes::cancel_session_request,
                routes::list_friends,
                routes::list_friend_requests,
                routes::create_friend_request,
                routes::friend_invite,
                routes::update_friend_invite,
                routes::consume_friend_invite,
                routes::accept_friend_request,
                routes::reject_friend_request,
                routes::cancel_friend_request,
                routes::create_activity,
                routes::list_activities,
                routes::get_activity_route,
                routes::activity_invite,
                routes::update_activity_invite,
                routes::consume_activity_invite,
                routes::list_members,
                routes::remove_member,
                routes::extend_activity,
                routes::get_reminder,
                routes::put_reminder,
                routes::get_home_base,
                routes::put_home_base,
                routes::create_post,
                routes::list_my_posts,
                routes::list_user_posts,
                routes::delete_post,
                routes::list_pins,
                routes::get_profile,
                routes::put_profile,
                routes::create_call,
                routes::get_call_route,
                routes::accept_call,
                routes::reject_call,
                routes::hangup_call,
                routes::bind_wechat,
                routes::upload,
                routes::ws_connect,
            ],
        )
        .mount("/uploads", FileServer::from(upload_dir))
        .attach(AdHoc::on_liftoff("Burn sweeper", |rocket| {
            Box::pin(async move {
                let db = rocket.state::<Db>().expect("db managed").clone();
                let hub = rocket.state::<Hub>().expect("hub managed").clone();
                expiry::spawn_burn_sweeper(db, hub, rocket.shutdown());
                tracing::info!("burn sweeper started");
            })
        }))
        .attach(AdHoc::on_liftoff("Activity sweeper", |rocket| {
            Box::pin(async move {
                let db = rocket.state::<Db>().expect("db managed").clone();
                let hub = rocket.state::<Hub>().expect("hub managed").clone();
                expiry::spawn_activity_sweeper(db, hub, rocket.shutdown());
                tracing::info!("activity sweeper started");
            })
        }))
        .attach(AdHoc::on_liftoff("Reminder sweeper", |rocket| {
            Box::pin(async move {
                let db = rocket.state::<Db>().expect("db managed").clone();
                let wechat = rocket
                    .state::<Arc<WeChatClient>>()
                    .expect("wechat client managed")
                    .clone();
                reminders::spawn_reminder_sweeper(db, wechat, rocket.shutdown());
                tracing::info!("reminder sweeper started");
            })
        }))
        .attach(AdHoc::on_shutdown("Realtime close", |rocket| {
            Box::pin(async move {
                if let Some(hub) = rocket.state::<Hub>() {
                    hub.close_all();
                }
            })
        }))
}
