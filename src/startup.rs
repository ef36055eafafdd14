use actix_web::dev::Server;
use actix_web::{middleware::Logger, web, App, HttpServer};
use std::net::TcpListener;

use crate::auth::AuthenticationService;
use crate::logger::LoggerMiddleware;
use crate::middleware::JwtMiddleware;
use crate::routes::{
    change_password, get_current_user, health_check, login, logout, refresh, register,
};

pub fn run(listener: TcpListener, service: AuthenticationService) -> Result<Server, std::io::Error> {
    let jwt_config = service.jwt_settings().clone();
    let service = web::Data::new(service);

    let server = HttpServer::new(move || {
        App::new()
            // Global middleware
            .wrap(Logger::default())
            .wrap(LoggerMiddleware)
            .app_data(service.clone())
            // Public routes
            .route("/health_check", web::get().to(health_check))
            .route("/auth/register", web::post().to(register))
            .route("/auth/login", web::post().to(login))
            .route("/auth/refresh", web::post().to(refresh))
            .route("/auth/logout", web::post().to(logout))
            // Protected routes (require a bearer access token)
            .service(
                web::scope("/api")
                    .wrap(JwtMiddleware::new(jwt_config.clone()))
                    .route("/me", web::get().to(get_current_user))
                    .route("/password", web::put().to(change_password)),
            )
    })
    .listen(listener)?
    .run();

    Ok(server)
}
