//! Operator web UI for users and sync configurations.

use crate::identity::CalendarType;
use crate::metrics;
use crate::store::{NewConfiguration, Store, SyncDirection};
use crate::{Error, ServerConfig};
use actix_utils::future::{ready, Ready};
use actix_web::{
    dev::{self, ServiceResponse},
    error,
    http::{header::ContentType, StatusCode},
    middleware::{Compress, ErrorHandlerResponse, ErrorHandlers, Logger},
    post, route,
    web::{self, Data, Html},
    App, FromRequest, HttpRequest, HttpResponse, HttpServer, Responder, Result,
};
use minijinja_autoreload::AutoReloader;
use prometheus::Registry;
use serde::Deserialize;
use std::io;

/// Number of runs shown on the index page.
const RECENT_RUNS: u32 = 20;

pub(crate) struct MiniJinjaRenderer {
    tmpl_env: Data<AutoReloader>,
}

impl MiniJinjaRenderer {
    fn render(&self, tmpl: &str, ctx: impl Into<minijinja::value::Value>) -> Result<Html> {
        self.tmpl_env
            .acquire_env()
            .map_err(|_| error::ErrorInternalServerError("could not acquire template env"))?
            .get_template(tmpl)
            .map_err(|_| error::ErrorInternalServerError("could not find template"))?
            .render(ctx.into())
            .map(Html::new)
            .map_err(|err| {
                log::error!("{err}");
                error::ErrorInternalServerError("template error")
            })
    }
}

impl FromRequest for MiniJinjaRenderer {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _pl: &mut dev::Payload) -> Self::Future {
        ready(
            req.app_data::<Data<AutoReloader>>()
                .cloned()
                .map(|tmpl_env| Self { tmpl_env })
                .ok_or_else(|| error::ErrorInternalServerError("template env is not configured")),
        )
    }
}

/// Creates the template environment. Templates are reloaded on change if enabled.
pub fn template_reloader(config: &ServerConfig) -> AutoReloader {
    let template_dir = config.template_dir.clone();
    let autoreload = config.template_autoreload;

    // The closure is invoked every time the environment is outdated to recreate it.
    AutoReloader::new(move |notifier| {
        let mut env: minijinja::Environment<'static> = minijinja::Environment::new();

        // if watch_path is never called, no fs watcher is created
        if autoreload {
            notifier.watch_path(&template_dir, true);
        }

        env.set_loader(minijinja::path_loader(&template_dir));

        Ok(env)
    })
}

/// Feedback shown above the forms after a submission.
#[derive(Default)]
struct Notice {
    message: Option<String>,
    error: Option<String>,
}

impl Notice {
    fn message(message: impl Into<String>) -> Notice {
        Notice {
            message: Some(message.into()),
            error: None,
        }
    }

    fn error(error: impl Into<String>) -> Notice {
        Notice {
            message: None,
            error: Some(error.into()),
        }
    }
}

fn internal_error(err: Error) -> actix_web::Error {
    log::error!("{err}");
    error::ErrorInternalServerError("internal error")
}

async fn render_index(
    tmpl_env: &MiniJinjaRenderer,
    store: &Store,
    notice: Notice,
    status: StatusCode,
) -> Result<impl Responder> {
    let users = store.users.list().await.map_err(internal_error)?;
    let configurations = store.configurations.list().await.map_err(internal_error)?;
    let runs = store.runs.recent(RECENT_RUNS).await.map_err(internal_error)?;

    let ctx = minijinja::context! {
        users,
        configurations,
        runs,
        message => notice.message,
        error => notice.error,
    };

    Ok(tmpl_env.render("index.html", ctx)?.customize().with_status(status))
}

#[route("/", method = "GET", method = "HEAD")]
async fn index(tmpl_env: MiniJinjaRenderer, store: Data<Store>) -> Result<impl Responder> {
    render_index(&tmpl_env, &store, Notice::default(), StatusCode::OK).await
}

#[derive(Debug, Deserialize)]
struct UserForm {
    email: String,
    display_name: String,
}

#[post("/users")]
async fn add_user(
    tmpl_env: MiniJinjaRenderer,
    store: Data<Store>,
    form: web::Form<UserForm>,
) -> Result<impl Responder> {
    let email = form.email.trim();
    let display_name = form.display_name.trim();

    if !email.contains('@') || display_name.is_empty() {
        let notice = Notice::error("A user needs an email address and a display name");
        return render_index(&tmpl_env, &store, notice, StatusCode::BAD_REQUEST).await;
    }

    let (notice, status) = match store.users.add(email, display_name).await {
        Ok(user) => {
            log::info!("added user {} ({})", user.email, user.id);
            (Notice::message("User added successfully"), StatusCode::OK)
        }
        Err(Error::Persistence(sqlx::Error::Database(err))) if err.is_unique_violation() => (
            Notice::error(format!("A user with email {email} already exists")),
            StatusCode::CONFLICT,
        ),
        Err(err) => return Err(internal_error(err)),
    };

    render_index(&tmpl_env, &store, notice, status).await
}

/// Calendar type selection of the configuration form.
#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TypeChoice {
    /// Classify the identity.
    #[default]
    Auto,
    Google,
    Microsoft,
}

impl TypeChoice {
    fn calendar_type(self) -> Option<CalendarType> {
        match self {
            TypeChoice::Auto => None,
            TypeChoice::Google => Some(CalendarType::Google),
            TypeChoice::Microsoft => Some(CalendarType::Microsoft),
        }
    }
}

fn default_frequency() -> u32 {
    15
}

#[derive(Debug, Deserialize)]
struct ConfigurationForm {
    user_id: i64,
    source_email: String,
    target_email: String,
    #[serde(default)]
    source_type: TypeChoice,
    #[serde(default)]
    target_type: TypeChoice,
    sync_direction: SyncDirection,
    #[serde(default = "default_frequency")]
    sync_frequency_minutes: u32,
}

#[post("/configurations")]
async fn add_configuration(
    tmpl_env: MiniJinjaRenderer,
    store: Data<Store>,
    form: web::Form<ConfigurationForm>,
) -> Result<impl Responder> {
    let form = form.into_inner();
    let source_email = form.source_email.trim();
    let target_email = form.target_email.trim();

    let invalid = if source_email.is_empty() || target_email.is_empty() {
        Some("Source and target calendar are required".to_owned())
    } else if !(5..=1440).contains(&form.sync_frequency_minutes) {
        Some("Sync frequency must be between 5 and 1440 minutes".to_owned())
    } else if store
        .users
        .get(form.user_id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        Some(format!("Unknown user {}", form.user_id))
    } else {
        None
    };

    if let Some(invalid) = invalid {
        return render_index(
            &tmpl_env,
            &store,
            Notice::error(invalid),
            StatusCode::BAD_REQUEST,
        )
        .await;
    }

    let new = NewConfiguration {
        user_id: form.user_id,
        source_email: source_email.to_owned(),
        target_email: target_email.to_owned(),
        source_type: form.source_type.calendar_type(),
        target_type: form.target_type.calendar_type(),
        sync_direction: form.sync_direction,
        sync_frequency_minutes: form.sync_frequency_minutes,
    };

    let configuration = store
        .configurations
        .add(&new)
        .await
        .map_err(internal_error)?;

    log::info!(
        "added sync configuration {}: {} ({}) -> {} ({})",
        configuration.id,
        configuration.source_email,
        configuration.source_type,
        configuration.target_email,
        configuration.target_type
    );

    render_index(
        &tmpl_env,
        &store,
        Notice::message("Sync configuration added successfully"),
        StatusCode::OK,
    )
    .await
}

#[derive(Debug, Deserialize)]
struct ActiveForm {
    is_active: bool,
}

#[post("/configurations/{id}/active")]
async fn set_active(
    tmpl_env: MiniJinjaRenderer,
    store: Data<Store>,
    id: web::Path<i64>,
    form: web::Form<ActiveForm>,
) -> Result<impl Responder> {
    let id = id.into_inner();

    match store.configurations.set_active(id, form.is_active).await {
        Ok(()) => {}
        Err(Error::NotFound { .. }) => {
            return Err(error::ErrorNotFound("sync configuration not found"))
        }
        Err(err) => return Err(internal_error(err)),
    }

    log::info!(
        "{} sync configuration {id}",
        if form.is_active {
            "activated"
        } else {
            "deactivated"
        }
    );

    render_index(
        &tmpl_env,
        &store,
        Notice::message("Sync configuration updated successfully"),
        StatusCode::OK,
    )
    .await
}

#[route("/metrics", method = "GET", method = "HEAD")]
async fn metrics_endpoint(registry: Data<Registry>) -> Result<HttpResponse> {
    let body = metrics::render(&registry).map_err(internal_error)?;

    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

/// Registers all routes.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(index)
        .service(add_user)
        .service(add_configuration)
        .service(set_active)
        .service(metrics_endpoint);
}

/// Runs the web server until it is stopped.
pub async fn serve(config: &ServerConfig, store: Store, registry: Registry) -> io::Result<()> {
    if config.template_autoreload {
        log::info!("template auto-reloading is enabled");
    } else {
        log::info!(
            "template auto-reloading is disabled; run with SERVER__TEMPLATE_AUTORELOAD=true to enable"
        );
    }

    let tmpl_reloader = Data::new(template_reloader(config));
    let store = Data::new(store);
    let registry = Data::new(registry);

    log::info!("starting HTTP server at {}", config.listen_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(store.clone())
            .app_data(registry.clone())
            .app_data(tmpl_reloader.clone())
            .configure(routes)
            .wrap(
                ErrorHandlers::new()
                    .handler(StatusCode::NOT_FOUND, not_found)
                    .handler(StatusCode::INTERNAL_SERVER_ERROR, internal_server_error),
            )
            .wrap(Compress::default())
            // Don't log things that could identify the user, e.g. omit client IP, referrer and
            // user agent.
            .wrap(Logger::new(r#""%r" %s %b %T"#))
    })
    .workers(2)
    .bind(config.listen_addr)?
    .run()
    .await
}

/// Error handler for a 404 Page not found error.
fn not_found<B>(svc_res: ServiceResponse<B>) -> Result<ErrorHandlerResponse<B>> {
    error_handler(svc_res, "not_found.html")
}

/// Error handler for a 500 Internal server error.
fn internal_server_error<B>(svc_res: ServiceResponse<B>) -> Result<ErrorHandlerResponse<B>> {
    error_handler(svc_res, "error.html")
}

/// Generic error handler.
fn error_handler<B>(svc_res: ServiceResponse<B>, tmpl: &str) -> Result<ErrorHandlerResponse<B>> {
    let req = svc_res.request();

    let reason = svc_res
        .status()
        .canonical_reason()
        .unwrap_or("Unknown error");

    // Provide a fallback to a simple plain text response in case an error occurs during the
    // rendering of the error page.
    let fallback = |err: &str| {
        HttpResponse::build(svc_res.status())
            .content_type(ContentType::plaintext())
            .body(err.to_string())
    };

    let ctx = minijinja::context! {
        status_code => svc_res.status().as_str(),
        reason => reason,
    };

    let rendered = MiniJinjaRenderer::extract(req)
        .into_inner()
        .and_then(|tmpl_env| tmpl_env.render(tmpl, ctx));

    let res = match rendered {
        Ok(body) => body
            .customize()
            .with_status(svc_res.status())
            .respond_to(req)
            .map_into_boxed_body(),
        Err(_) => fallback(reason),
    };

    Ok(ErrorHandlerResponse::Response(ServiceResponse::new(
        svc_res.into_parts().0,
        res.map_into_right_body(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;
    use std::path::PathBuf;

    fn server_config() -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            template_autoreload: false,
            template_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates"),
        }
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        crate::metrics::SyncMetrics::new()
            .unwrap()
            .register(&registry)
            .unwrap();
        registry
    }

    macro_rules! app {
        ($store:expr) => {
            test::init_service(
                App::new()
                    .app_data(Data::new($store))
                    .app_data(Data::new(registry()))
                    .app_data(Data::new(template_reloader(&server_config())))
                    .configure(routes)
                    .wrap(
                        ErrorHandlers::new()
                            .handler(StatusCode::NOT_FOUND, not_found)
                            .handler(StatusCode::INTERNAL_SERVER_ERROR, internal_server_error),
                    ),
            )
            .await
        };
    }

    macro_rules! body {
        ($res:expr) => {
            String::from_utf8(test::read_body($res).await.to_vec()).unwrap()
        };
    }

    #[actix_rt::test]
    async fn index_lists_users_and_configurations() {
        let store = Store::open_in_memory().await.unwrap();
        let user = store.users.add("a@company.com", "Alice").await.unwrap();
        store
            .configurations
            .add(&NewConfiguration::new(
                user.id,
                "a@company.com",
                "team@gmail.com",
                SyncDirection::SourceToTarget,
            ))
            .await
            .unwrap();
        let app = app!(store);

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;

        assert_eq!(res.status(), StatusCode::OK);
        let body = body!(res);
        assert!(body.contains("Alice"));
        assert!(body.contains("team@gmail.com"));
    }

    #[actix_rt::test]
    async fn adds_user() {
        let store = Store::open_in_memory().await.unwrap();
        let app = app!(store.clone());

        let req = test::TestRequest::post()
            .uri("/users")
            .set_form([("email", "bob@company.com"), ("display_name", "Bob")])
            .to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::OK);
        assert!(body!(res).contains("User added successfully"));

        let users = store.users.list().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].display_name, "Bob");
    }

    #[actix_rt::test]
    async fn duplicate_user_is_a_conflict() {
        let store = Store::open_in_memory().await.unwrap();
        store.users.add("bob@company.com", "Bob").await.unwrap();
        let app = app!(store);

        let req = test::TestRequest::post()
            .uri("/users")
            .set_form([("email", "bob@company.com"), ("display_name", "Bobby")])
            .to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert!(body!(res).contains("already exists"));
    }

    #[actix_rt::test]
    async fn invalid_user_is_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let app = app!(store.clone());

        let req = test::TestRequest::post()
            .uri("/users")
            .set_form([("email", "bob"), ("display_name", "Bob")])
            .to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(store.users.list().await.unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn add_configuration_classifies_automatic_types() {
        let store = Store::open_in_memory().await.unwrap();
        let user = store.users.add("a@company.com", "Alice").await.unwrap();
        let app = app!(store.clone());

        let user_id = user.id.to_string();
        let req = test::TestRequest::post()
            .uri("/configurations")
            .set_form([
                ("user_id", user_id.as_str()),
                ("source_email", "a@company.com"),
                ("source_type", "auto"),
                ("target_email", "b@gmail.com"),
                ("target_type", "auto"),
                ("sync_direction", "bidirectional"),
                ("sync_frequency_minutes", "30"),
            ])
            .to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::OK);

        let configurations = store.configurations.list().await.unwrap();
        assert_eq!(configurations.len(), 1);
        let configuration = &configurations[0].configuration;
        assert_eq!(configuration.source_type, CalendarType::Microsoft);
        assert_eq!(configuration.target_type, CalendarType::Google);
        assert_eq!(configuration.sync_direction, SyncDirection::Bidirectional);
        assert_eq!(configuration.sync_frequency_minutes, 30);
    }

    #[actix_rt::test]
    async fn add_configuration_for_unknown_user_is_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let app = app!(store.clone());

        let req = test::TestRequest::post()
            .uri("/configurations")
            .set_form([
                ("user_id", "7"),
                ("source_email", "a@company.com"),
                ("target_email", "primary"),
                ("sync_direction", "source_to_target"),
            ])
            .to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(body!(res).contains("Unknown user 7"));
        assert!(store.configurations.list().await.unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn toggle_configuration() {
        let store = Store::open_in_memory().await.unwrap();
        let user = store.users.add("a@company.com", "Alice").await.unwrap();
        let configuration = store
            .configurations
            .add(&NewConfiguration::new(
                user.id,
                "a@company.com",
                "primary",
                SyncDirection::SourceToTarget,
            ))
            .await
            .unwrap();
        let app = app!(store.clone());

        let req = test::TestRequest::post()
            .uri(&format!("/configurations/{}/active", configuration.id))
            .set_form([("is_active", "false")])
            .to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::OK);
        assert!(store.configurations.active().await.unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn toggle_unknown_configuration_is_not_found() {
        let store = Store::open_in_memory().await.unwrap();
        let app = app!(store);

        let req = test::TestRequest::post()
            .uri("/configurations/99/active")
            .set_form([("is_active", "true")])
            .to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(body!(res).contains("Not Found"));
    }

    #[actix_rt::test]
    async fn metrics_are_exposed() {
        let store = Store::open_in_memory().await.unwrap();
        let app = app!(store);

        let res = test::call_service(
            &app,
            test::TestRequest::get().uri("/metrics").to_request(),
        )
        .await;

        assert_eq!(res.status(), StatusCode::OK);
        assert!(body!(res).contains("calsync_active_configurations"));
    }
}
