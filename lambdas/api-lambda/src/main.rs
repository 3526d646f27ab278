use aws_config::timeout::TimeoutConfig;
use aws_sdk_cognitoidentityprovider::Client as CognitoClient;
use aws_sdk_dynamodb::Client as DynamoClient;
use foodshare_shared::{
    auth::CognitoVerifier,
    config::{Config, StoreBackend},
    payments::StripeGateway,
    store::{DocumentStore, DynamoStore, MemoryStore},
    AppState,
};
use lambda_http::{run, service_fn, tracing, Error, Request};
use std::sync::Arc;

mod http_handler;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing::init_default_subscriber();

    let config = Config::from_env()?;

    // Initialize AWS clients once at startup
    let aws_config = aws_config::from_env()
        .timeout_config(
            TimeoutConfig::builder()
                .operation_timeout(config.dependency_timeout)
                .build(),
        )
        .load()
        .await;

    let store: Arc<dyn DocumentStore> = match config.store_backend {
        StoreBackend::DynamoDb => Arc::new(
            DynamoStore::open(
                DynamoClient::new(&aws_config),
                config.table_name.clone(),
                config.dependency_timeout,
            )
            .await?,
        ),
        StoreBackend::Memory => {
            tracing::warn!("using in-memory store; data will not survive this instance");
            Arc::new(MemoryStore::new())
        }
    };

    let state = AppState::new(
        store,
        Arc::new(CognitoVerifier::new(
            CognitoClient::new(&aws_config),
            config.dependency_timeout,
        )),
        Arc::new(StripeGateway::new(
            config.stripe_api_base.clone(),
            config.stripe_secret_key.clone(),
            config.dependency_timeout,
        )?),
        &config,
    );

    let shutdown_state = Arc::clone(&state);
    let result = run(service_fn(move |event: Request| {
        let state = Arc::clone(&state);
        async move { http_handler::function_handler(event, state).await }
    }))
    .await;

    if let Err(e) = shutdown_state.store.close().await {
        tracing::error!(error = %e, "failed to close document store");
    }
    result
}
