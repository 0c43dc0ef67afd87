use std::{env, net::SocketAddr, sync::Arc};

use axum::{Router, response::IntoResponse, routing::get};
use dotenv::dotenv;
use sea_orm::DatabaseConnection;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

mod argon_hasher;
mod credential_flows;
mod email_client;
mod entities;
mod masking;
mod routes;
mod secret_codec;
mod settings_store;
mod token;

use argon_hasher::{ArgonHasher, Config};
use credential_flows::CredentialFlows;
use email_client::{Mailer, SmtpMailer};
use routes::{auth::auth_router, settings::settings_router};
use secret_codec::SecretCodec;
use token::TokenSigner;

async fn root() -> impl IntoResponse {
    "Compliance admin backend"
}

#[derive(OpenApi)]
#[openapi(paths(
    routes::auth::login,
    routes::auth::initiate_email_change,
    routes::auth::verify_email_change,
    routes::auth::forgot_password,
    routes::auth::reset_password,
    routes::settings::get_setting,
    routes::settings::upsert_setting,
    routes::settings::batch_upsert,
    routes::settings::test_email,
))]
struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub flows: Arc<CredentialFlows>,
    pub session_tokens: TokenSigner,
    pub hasher: ArgonHasher,
    pub codec: SecretCodec,
    pub mailer: Arc<dyn Mailer>,
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=debug", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let password_hashing_secret = env::var("PASSWORD_HASHING_SECRET").unwrap();
    let codec_key = env::var("SECRET_CODEC_KEY").unwrap();
    // Distinct signing secrets: a leaked session secret must not allow
    // forging email-change tokens, and vice versa.
    let verification_secret = env::var("VERIFICATION_TOKEN_SECRET").unwrap();
    let session_secret = env::var("SESSION_TOKEN_SECRET").unwrap();
    let public_base_url = env::var("PUBLIC_BASE_URL").unwrap();

    let hasher = ArgonHasher::new(Config {
        iterations: 4,
        parallelism: 4,
        memory_cost: 512,
        secret_key: password_hashing_secret.as_bytes().to_vec(),
    })
    .unwrap();

    let codec = SecretCodec::new(&codec_key).unwrap();
    let verify_tokens = TokenSigner::new(verification_secret.into_bytes());
    let session_tokens = TokenSigner::new(session_secret.into_bytes());
    let mailer: Arc<dyn Mailer> = Arc::new(SmtpMailer);

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let db = sea_orm::Database::connect(&database_url).await.unwrap();

    let flows = Arc::new(CredentialFlows::new(
        db.clone(),
        hasher.clone(),
        verify_tokens,
        codec.clone(),
        mailer.clone(),
        public_base_url,
    ));

    let app_state = AppState {
        db,
        flows,
        session_tokens,
        hasher,
        codec,
        mailer,
    };

    let app = Router::new()
        .route("/", get(root))
        .nest("/auth", auth_router())
        .nest("/settings", settings_router())
        .with_state(app_state)
        .merge(Scalar::with_url("/scalar", ApiDoc::openapi()));

    let port = env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::debug!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
