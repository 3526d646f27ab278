use chrono::Utc;
use foodshare_shared::{
    auth,
    error::AppError,
    requests::{CancelOutcome, SubmitOutcome},
    responses,
    types::{
        CreateFoodRequest, CreatePaymentIntentRequest, FoodPatch, FoodStatus, RecordPaymentRequest,
        SortOrder, SubmitFoodRequest, UpdateFoodStatusRequest, UpsertUserRequest,
    },
    AppState,
};
use lambda_http::{
    http::{Method, StatusCode},
    Body, Error, Request, RequestExt, Response,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;

type Outcome = Result<Response<Body>, AppError>;

/// Main Lambda handler - routes requests to the managers and applies CORS.
pub(crate) async fn function_handler(
    event: Request,
    state: Arc<AppState>,
) -> Result<Response<Body>, Error> {
    tracing::info!(method = %event.method(), path = %event.uri().path(), "request received");

    let origin = event
        .headers()
        .get("Origin")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut response = match route(&event, &state).await {
        Ok(response) => response,
        Err(err) => err.into_response()?,
    };
    responses::apply_cors(response.headers_mut(), origin.as_deref(), &state.allowed_origins);
    Ok(response)
}

async fn route(event: &Request, state: &AppState) -> Outcome {
    let method = event.method();
    if method == Method::OPTIONS {
        return Ok(responses::preflight()?);
    }

    let segments: Vec<String> = event
        .uri()
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(percent_decode)
        .collect();
    let parts: Vec<&str> = segments.iter().map(String::as_str).collect();

    match (method, parts.as_slice()) {
        (&Method::GET, []) => Ok(responses::ok(&serde_json::json!({
            "status": "ok",
            "message": "FoodShare API running"
        }))?),

        // ----- users -----
        (&Method::POST, ["users"]) => {
            let req: UpsertUserRequest = parse_body(event)?;
            let created = state.users.upsert_profile(req).await?;
            Ok(responses::ok(&serde_json::json!({"success": true, "upserted": created}))?)
        }
        (&Method::GET, ["users"]) => Ok(responses::ok(&state.users.list_users().await?)?),
        (&Method::GET, ["users", email]) => {
            Ok(responses::ok(&state.users.get_profile(email).await?)?)
        }
        (&Method::PATCH, ["users", "membership", email]) => {
            state.users.grant_membership(email).await?;
            Ok(responses::ok(&serde_json::json!({"success": true}))?)
        }

        // ----- food -----
        (&Method::POST, ["food"]) => {
            let req: CreateFoodRequest = parse_body(event)?;
            let item = state.foods.create_listing(req).await?;
            Ok(responses::created(&serde_json::json!({"insertedId": item.food_id}))?)
        }
        (&Method::GET, ["food"]) | (&Method::GET, ["available-foods"]) => {
            let status = match query(event, "status") {
                None => Some(FoodStatus::Available),
                Some(raw) => Some(
                    FoodStatus::parse(raw)
                        .ok_or_else(|| AppError::validation(format!("Unknown status: {}", raw)))?,
                ),
            };
            let order = query(event, "sortOrder")
                .map(SortOrder::parse)
                .unwrap_or_default();
            let items = state
                .foods
                .search(status, query(event, "search"), Utc::now(), order)
                .await?;
            Ok(responses::ok(&items)?)
        }
        (&Method::GET, ["food", "user", email]) => {
            let principal = authenticate(event, state).await?;
            auth::require_principal(&principal, email)?;
            Ok(responses::ok(&state.foods.list_for_donor(email).await?)?)
        }
        (&Method::GET, ["food", food_id]) => {
            Ok(responses::ok(&state.foods.get_listing(food_id).await?)?)
        }
        (&Method::PUT, ["food", food_id]) => {
            let patch: FoodPatch = parse_body(event)?;
            let item = state.foods.update_listing(food_id, patch).await?;
            Ok(responses::ok(&serde_json::json!({"success": true, "result": item}))?)
        }
        (&Method::PATCH, ["food", food_id]) => {
            let req: UpdateFoodStatusRequest = parse_body_or_default(event)?;
            let item = state.foods.transition_status(food_id, req.food_status).await?;
            Ok(responses::ok(&item)?)
        }
        (&Method::DELETE, ["food", food_id]) => {
            let principal = authenticate(event, state).await?;
            state.foods.delete_listing(food_id, &principal.email).await?;
            Ok(responses::ok(&serde_json::json!({"success": true}))?)
        }

        // ----- food requests -----
        (&Method::POST, ["requestfoods"]) | (&Method::POST, ["requestedfoods"]) => {
            let req: SubmitFoodRequest = parse_body(event)?;
            match state.requests.submit_request(req).await? {
                SubmitOutcome::Merged {
                    request_id,
                    new_quantity,
                } => Ok(responses::ok(&serde_json::json!({
                    "success": true,
                    "merged": true,
                    "requestId": request_id,
                    "newQuantity": new_quantity
                }))?),
                SubmitOutcome::Inserted { inserted_id } => {
                    Ok(responses::created(&serde_json::json!({
                        "success": true,
                        "merged": false,
                        "insertedId": inserted_id
                    }))?)
                }
            }
        }
        (&Method::GET, ["myfoodrequest"]) => {
            let principal = authenticate(event, state).await?;
            let email = query(event, "email").ok_or_else(|| AppError::validation("email is required"))?;
            auth::require_principal(&principal, email)?;
            Ok(responses::ok(&state.requests.list_requests_for_user(email).await?)?)
        }
        (&Method::DELETE, ["myfoodrequest", request_id]) => {
            let principal = authenticate(event, state).await?;
            match state
                .requests
                .cancel_request(request_id, Some(principal.email.as_str()))
                .await?
            {
                CancelOutcome::Completed(report) => Ok(responses::ok(&serde_json::json!({
                    "success": true,
                    "requestId": report.request_id,
                    "completed": report.completed_steps()
                }))?),
                CancelOutcome::PartiallyApplied(report) => Ok(responses::json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &serde_json::json!({
                        "error": "Request cancelled but follow-up updates failed",
                        "partial": true,
                        "requestId": report.request_id,
                        "completed": report.completed_steps(),
                        "failed": report.failed_steps()
                    }),
                )?),
            }
        }

        // ----- payments -----
        (&Method::POST, ["create-payment-intent"]) => {
            let req: CreatePaymentIntentRequest = parse_body(event)?;
            let intent = state.payments.create_intent(req.price).await?;
            Ok(responses::ok(&serde_json::json!({"clientSecret": intent.client_secret}))?)
        }
        (&Method::POST, ["payments"]) => {
            let req: RecordPaymentRequest = parse_body(event)?;
            let record = state.payments.record_payment(req).await?;
            Ok(responses::created(&serde_json::json!({"insertedId": record.payment_id}))?)
        }
        (&Method::GET, ["payments", email]) => {
            let principal = authenticate(event, state).await?;
            auth::require_principal(&principal, email)?;
            Ok(responses::ok(&state.payments.list_for_user(email).await?)?)
        }

        _ => Ok(responses::not_found()?),
    }
}

async fn authenticate(event: &Request, state: &AppState) -> Result<auth::Principal, AppError> {
    auth::authenticate(&state.verifier, event.headers(), state.dependency_timeout).await
}

fn query<'a>(event: &'a Request, name: &str) -> Option<&'a str> {
    event
        .query_string_parameters_ref()
        .and_then(|params| params.first(name))
        .filter(|v| !v.is_empty())
}

fn parse_body<T: DeserializeOwned>(event: &Request) -> Result<T, AppError> {
    Ok(serde_json::from_slice(event.body())?)
}

/// Like [`parse_body`], but an empty body means "all defaults".
fn parse_body_or_default<T: DeserializeOwned + Default>(event: &Request) -> Result<T, AppError> {
    if event.body().is_empty() {
        return Ok(T::default());
    }
    parse_body(event)
}

/// Decode `%XX` escapes in a path segment (emails arrive as `a%40b.com`).
fn percent_decode(segment: &str) -> String {
    percent_encoding::percent_decode_str(segment)
        .decode_utf8_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foodshare_shared::{
        auth::{IdentityVerifier, Principal},
        config::Config,
        payments::PaymentGateway,
        store::{DocumentStore, FoodUpdate, MemoryStore, StatusChange, StoreError},
        types::{
            FoodFilter, FoodItem, FoodRequest, Membership, PaymentIntent, PaymentRecord,
            ProfileUpsert, UserAccount, UserCounter,
        },
    };
    use chrono::DateTime;
    use std::collections::HashMap;

    /// Accepts tokens of the form `token-for:<email>`.
    struct PrefixVerifier;

    #[async_trait]
    impl IdentityVerifier for PrefixVerifier {
        async fn verify(&self, token: &str) -> Result<Principal, AppError> {
            token
                .strip_prefix("token-for:")
                .map(|email| Principal {
                    email: email.to_string(),
                })
                .ok_or_else(|| AppError::forbidden("Invalid token"))
        }
    }

    struct FixedGateway;

    #[async_trait]
    impl PaymentGateway for FixedGateway {
        async fn create_intent(&self, amount: i64, _currency: &str) -> Result<PaymentIntent, AppError> {
            Ok(PaymentIntent {
                intent_id: format!("pi_{amount}"),
                client_secret: format!("pi_{amount}_secret"),
            })
        }
    }

    /// Memory store whose listing-quantity counter is unreachable.
    #[derive(Default)]
    struct QuantityOutage {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DocumentStore for QuantityOutage {
        async fn upsert_user(&self, profile: &ProfileUpsert) -> Result<bool, StoreError> {
            self.inner.upsert_user(profile).await
        }
        async fn find_user(&self, email: &str) -> Result<Option<UserAccount>, StoreError> {
            self.inner.find_user(email).await
        }
        async fn list_users(&self) -> Result<Vec<UserAccount>, StoreError> {
            self.inner.list_users().await
        }
        async fn set_membership(
            &self,
            email: &str,
            membership: Membership,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.set_membership(email, membership, now).await
        }
        async fn add_to_user_counter(
            &self,
            email: &str,
            counter: UserCounter,
            delta: i64,
        ) -> Result<Option<i64>, StoreError> {
            self.inner.add_to_user_counter(email, counter, delta).await
        }
        async fn insert_food(&self, item: &FoodItem) -> Result<(), StoreError> {
            self.inner.insert_food(item).await
        }
        async fn find_food(&self, food_id: &str) -> Result<Option<FoodItem>, StoreError> {
            self.inner.find_food(food_id).await
        }
        async fn update_food(
            &self,
            food_id: &str,
            patch: &FoodPatch,
            now: DateTime<Utc>,
        ) -> Result<FoodUpdate, StoreError> {
            self.inner.update_food(food_id, patch, now).await
        }
        async fn update_food_status(
            &self,
            food_id: &str,
            target: FoodStatus,
            allowed_from: &[FoodStatus],
            now: DateTime<Utc>,
        ) -> Result<StatusChange, StoreError> {
            self.inner
                .update_food_status(food_id, target, allowed_from, now)
                .await
        }
        async fn delete_food(&self, food_id: &str, donor_email: &str) -> Result<bool, StoreError> {
            self.inner.delete_food(food_id, donor_email).await
        }
        async fn find_foods(&self, filter: &FoodFilter) -> Result<Vec<FoodItem>, StoreError> {
            self.inner.find_foods(filter).await
        }
        async fn list_foods_by_donor(&self, donor_email: &str) -> Result<Vec<FoodItem>, StoreError> {
            self.inner.list_foods_by_donor(donor_email).await
        }
        async fn add_to_food_quantity(
            &self,
            _food_id: &str,
            _delta: i64,
        ) -> Result<Option<i64>, StoreError> {
            Err(StoreError::backend("provisioned throughput exceeded"))
        }
        async fn find_active_request(
            &self,
            food_id: &str,
            user_email: &str,
        ) -> Result<Option<FoodRequest>, StoreError> {
            self.inner.find_active_request(food_id, user_email).await
        }
        async fn insert_active_request(&self, request: &FoodRequest) -> Result<(), StoreError> {
            self.inner.insert_active_request(request).await
        }
        async fn merge_into_request(
            &self,
            request_id: &str,
            quantity: i64,
            notes: Option<String>,
            now: DateTime<Utc>,
        ) -> Result<Option<FoodRequest>, StoreError> {
            self.inner
                .merge_into_request(request_id, quantity, notes, now)
                .await
        }
        async fn find_request(&self, request_id: &str) -> Result<Option<FoodRequest>, StoreError> {
            self.inner.find_request(request_id).await
        }
        async fn delete_request(&self, request: &FoodRequest) -> Result<bool, StoreError> {
            self.inner.delete_request(request).await
        }
        async fn list_requests_for_user(
            &self,
            user_email: &str,
        ) -> Result<Vec<FoodRequest>, StoreError> {
            self.inner.list_requests_for_user(user_email).await
        }
        async fn insert_payment(&self, record: &PaymentRecord) -> Result<(), StoreError> {
            self.inner.insert_payment(record).await
        }
        async fn list_payments_for_user(&self, email: &str) -> Result<Vec<PaymentRecord>, StoreError> {
            self.inner.list_payments_for_user(email).await
        }
        async fn close(&self) -> Result<(), StoreError> {
            self.inner.close().await
        }
    }

    fn state() -> Arc<AppState> {
        state_with(Arc::new(MemoryStore::new()))
    }

    fn state_with(store: Arc<dyn DocumentStore>) -> Arc<AppState> {
        let config = Config::from_lookup(|name| {
            (name == "STRIPE_SECRET_KEY").then(|| "sk_test".to_string())
        })
        .unwrap();
        AppState::new(store, Arc::new(PrefixVerifier), Arc::new(FixedGateway), &config)
    }

    fn request(method: Method, path: &str, body: Option<serde_json::Value>) -> Request {
        let body = body.map_or(Body::Empty, |b| Body::from(b.to_string()));
        let mut req = Request::new(body);
        *req.method_mut() = method;
        *req.uri_mut() = path.parse().unwrap();
        req
    }

    fn authed(mut req: Request, email: &str) -> Request {
        req.headers_mut().insert(
            "Authorization",
            format!("Bearer token-for:{email}").parse().unwrap(),
        );
        req
    }

    async fn call(state: &Arc<AppState>, req: Request) -> (u16, serde_json::Value) {
        let resp = function_handler(req, Arc::clone(state)).await.unwrap();
        let status = resp.status().as_u16();
        let body = if resp.body().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(resp.body()).unwrap()
        };
        (status, body)
    }

    async fn create_food(state: &Arc<AppState>, donor: &str, name: &str) -> String {
        let (status, body) = call(
            state,
            request(
                Method::POST,
                "/food",
                Some(serde_json::json!({
                    "donorEmail": donor,
                    "foodName": name,
                    "foodQuantity": 3,
                    "expiredDateTime": (Utc::now() + chrono::Duration::days(1)).to_rfc3339(),
                    "pickupLocation": "Main St"
                })),
            ),
        )
        .await;
        assert_eq!(status, 201);
        body["insertedId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_check() {
        let (status, body) = call(&state(), request(Method::GET, "/", None)).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn preflight_and_cors_headers() {
        let state = state();
        let mut req = request(Method::OPTIONS, "/food", None);
        req.headers_mut()
            .insert("Origin", "http://localhost:5173".parse().unwrap());
        let resp = function_handler(req, Arc::clone(&state)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("Access-Control-Allow-Origin").unwrap(),
            "http://localhost:5173"
        );
        assert!(resp.headers().get("Access-Control-Allow-Methods").is_some());
    }

    #[tokio::test]
    async fn user_upsert_and_lookup_by_encoded_email() {
        let state = state();
        let (status, body) = call(
            &state,
            request(
                Method::POST,
                "/users",
                Some(serde_json::json!({"email": "a@example.com", "name": "Ada"})),
            ),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["upserted"], true);

        let (status, body) = call(&state, request(Method::GET, "/users/a%40example.com", None)).await;
        assert_eq!(status, 200);
        assert_eq!(body["membership"], "no");
        assert_eq!(body["postCount"], 0);

        let (status, _) = call(
            &state,
            request(Method::PATCH, "/users/membership/a@example.com", None),
        )
        .await;
        assert_eq!(status, 200);

        let (status, _) = call(&state, request(Method::GET, "/users/nobody@example.com", None)).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn missing_user_email_is_a_bad_request() {
        let (status, body) = call(
            &state(),
            request(Method::POST, "/users", Some(serde_json::json!({"name": "x"}))),
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body, serde_json::json!({"error": "Email is required"}));
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let mut req = request(Method::POST, "/food", None);
        *req.body_mut() = Body::from("{not json");
        let (status, body) = call(&state(), req).await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request body"));
    }

    #[tokio::test]
    async fn food_search_and_lookup() {
        let state = state();
        let food_id = create_food(&state, "donor@example.com", "Banana Bread").await;
        create_food(&state, "donor@example.com", "Rice").await;

        let mut params = HashMap::new();
        params.insert("search".to_string(), "bread".to_string());
        let req = request(Method::GET, "/available-foods", None).with_query_string_parameters(params);
        let (status, body) = call(&state, req).await;
        assert_eq!(status, 200);
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["foodName"], "Banana Bread");
        assert_eq!(items[0]["pickupLocation"], "Main St");

        let (status, body) = call(&state, request(Method::GET, &format!("/food/{food_id}"), None)).await;
        assert_eq!(status, 200);
        assert_eq!(body["foodStatus"], "available");

        let (status, _) = call(&state, request(Method::GET, "/food/not-an-id", None)).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn delete_food_requires_token_and_ownership() {
        let state = state();
        let food_id = create_food(&state, "donor@example.com", "Soup").await;
        let path = format!("/food/{food_id}");

        let (status, body) = call(&state, request(Method::DELETE, &path, None)).await;
        assert_eq!(status, 401);
        assert_eq!(body["error"], "No token");

        let (status, _) = call(
            &state,
            authed(request(Method::DELETE, &path, None), "other@example.com"),
        )
        .await;
        assert_eq!(status, 403);

        let (status, _) = call(
            &state,
            authed(request(Method::DELETE, &path, None), "donor@example.com"),
        )
        .await;
        assert_eq!(status, 200);

        let (status, _) = call(&state, request(Method::GET, &path, None)).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn donor_listing_route_checks_principal() {
        let state = state();
        create_food(&state, "donor@example.com", "Soup").await;

        let (status, _) = call(
            &state,
            authed(
                request(Method::GET, "/food/user/donor@example.com", None),
                "other@example.com",
            ),
        )
        .await;
        assert_eq!(status, 403);

        let (status, body) = call(
            &state,
            authed(
                request(Method::GET, "/food/user/donor@example.com", None),
                "donor@example.com",
            ),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn request_submit_merge_list_and_cancel() {
        let state = state();
        let food_id = create_food(&state, "donor@example.com", "Soup").await;
        let submit = |quantity: i64| {
            request(
                Method::POST,
                "/requestfoods",
                Some(serde_json::json!({
                    "foodId": food_id,
                    "userEmail": "u@example.com",
                    "requestedQuantity": quantity,
                    "notes": "evening"
                })),
            )
        };

        let (status, body) = call(&state, submit(3)).await;
        assert_eq!(status, 201);
        assert_eq!(body["merged"], false);
        let request_id = body["insertedId"].as_str().unwrap().to_string();

        let (status, body) = call(&state, submit(2)).await;
        assert_eq!(status, 200);
        assert_eq!(body["merged"], true);
        assert_eq!(body["newQuantity"], 5);

        let mut params = HashMap::new();
        params.insert("email".to_string(), "u@example.com".to_string());
        let list = request(Method::GET, "/myfoodrequest", None).with_query_string_parameters(params);
        let (status, body) = call(&state, authed(list, "u@example.com")).await;
        assert_eq!(status, 200);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["requestedQuantity"], 5);

        let cancel_path = format!("/myfoodrequest/{request_id}");
        let (status, _) = call(
            &state,
            authed(request(Method::DELETE, &cancel_path, None), "x@example.com"),
        )
        .await;
        assert_eq!(status, 403);

        let (status, body) = call(
            &state,
            authed(request(Method::DELETE, &cancel_path, None), "u@example.com"),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["success"], true);

        let (_, food) = call(&state, request(Method::GET, &format!("/food/{food_id}"), None)).await;
        assert_eq!(food["foodQuantity"], 4);

        let (status, _) = call(
            &state,
            authed(request(Method::DELETE, &cancel_path, None), "u@example.com"),
        )
        .await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn cancel_with_failed_follow_up_reports_partial_success() {
        let state = state_with(Arc::new(QuantityOutage::default()));
        let food_id = create_food(&state, "donor@example.com", "Rice").await;
        let (status, body) = call(
            &state,
            request(
                Method::POST,
                "/requestfoods",
                Some(serde_json::json!({
                    "foodId": food_id,
                    "userEmail": "u@example.com",
                    "requestedQuantity": 1
                })),
            ),
        )
        .await;
        assert_eq!(status, 201);
        let request_id = body["insertedId"].as_str().unwrap().to_string();

        let cancel_path = format!("/myfoodrequest/{request_id}");
        let (status, body) = call(
            &state,
            authed(request(Method::DELETE, &cancel_path, None), "u@example.com"),
        )
        .await;
        assert_eq!(status, 500);
        assert_eq!(body["partial"], true);
        assert_eq!(body["requestId"], request_id.as_str());
        assert!(body["error"].is_string());
        assert_eq!(body["failed"], serde_json::json!(["food_quantity_restored"]));
        assert_eq!(
            body["completed"],
            serde_json::json!(["request_deleted", "request_count_adjusted"])
        );

        // The request itself is gone; a retry is a plain miss.
        let (status, _) = call(
            &state,
            authed(request(Method::DELETE, &cancel_path, None), "u@example.com"),
        )
        .await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn request_listing_for_someone_else_is_forbidden() {
        let mut params = HashMap::new();
        params.insert("email".to_string(), "victim@example.com".to_string());
        let req = request(Method::GET, "/myfoodrequest", None).with_query_string_parameters(params);
        let (status, body) = call(&state(), authed(req, "u@example.com")).await;
        assert_eq!(status, 403);
        assert_eq!(body["error"], "Forbidden access");
    }

    #[tokio::test]
    async fn payments_flow() {
        let state = state();
        let (status, body) = call(
            &state,
            request(
                Method::POST,
                "/create-payment-intent",
                Some(serde_json::json!({"price": 12.5})),
            ),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["clientSecret"], "pi_1250_secret");

        let (status, _) = call(
            &state,
            request(
                Method::POST,
                "/create-payment-intent",
                Some(serde_json::json!({"price": 0})),
            ),
        )
        .await;
        assert_eq!(status, 400);

        let payment = serde_json::json!({
            "email": "p@example.com",
            "amount": 12.5,
            "transactionId": "pi_1250",
            "status": "succeeded"
        });
        let (status, _) = call(&state, request(Method::POST, "/payments", Some(payment.clone()))).await;
        assert_eq!(status, 201);
        let (status, _) = call(&state, request(Method::POST, "/payments", Some(payment))).await;
        assert_eq!(status, 409);

        let (status, body) = call(
            &state,
            authed(request(Method::GET, "/payments/p@example.com", None), "p@example.com"),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body[0]["transactionId"], "pi_1250");
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let (status, body) = call(&state(), request(Method::GET, "/nope", None)).await;
        assert_eq!(status, 404);
        assert_eq!(body["error"], "Not found");
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%40example.com"), "a@example.com");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
