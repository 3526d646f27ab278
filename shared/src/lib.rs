pub mod auth;
pub mod config;
pub mod deadline;
pub mod error;
pub mod foods;
pub mod payments;
pub mod requests;
pub mod responses;
pub mod store;
pub mod types;
pub mod users;

use std::sync::Arc;
use std::time::Duration;

use auth::IdentityVerifier;
use foods::FoodListings;
use payments::{PaymentGateway, Payments};
use requests::RequestLifecycle;
use store::DocumentStore;
use users::UserAccounts;

/// Shared application state, built once per cold start.
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub users: Arc<UserAccounts>,
    pub foods: FoodListings,
    pub requests: RequestLifecycle,
    pub payments: Payments,
    pub allowed_origins: Vec<String>,
    pub dependency_timeout: Duration,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        verifier: Arc<dyn IdentityVerifier>,
        gateway: Arc<dyn PaymentGateway>,
        config: &config::Config,
    ) -> Arc<Self> {
        let users = Arc::new(UserAccounts::new(Arc::clone(&store)));
        Arc::new(Self {
            foods: FoodListings::new(Arc::clone(&store), Arc::clone(&users)),
            requests: RequestLifecycle::new(Arc::clone(&store), Arc::clone(&users)),
            payments: Payments::new(
                Arc::clone(&store),
                gateway,
                config.payment_currency.clone(),
                config.dependency_timeout,
            ),
            users,
            store,
            verifier,
            allowed_origins: config.allowed_origins.clone(),
            dependency_timeout: config.dependency_timeout,
        })
    }
}
