use lambda_http::{
    http::{HeaderMap, HeaderValue, StatusCode},
    Body, Error, Response,
};
use serde::Serialize;

const ALLOWED_METHODS: &str = "GET,POST,PUT,PATCH,DELETE,OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type,Authorization";

/// Serialize `body` as a JSON response.
pub fn json<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(serde_json::to_string(body)?.into())
        .map_err(Box::new)?)
}

pub fn ok<T: Serialize + ?Sized>(body: &T) -> Result<Response<Body>, Error> {
    json(StatusCode::OK, body)
}

pub fn created<T: Serialize + ?Sized>(body: &T) -> Result<Response<Body>, Error> {
    json(StatusCode::CREATED, body)
}

pub fn preflight() -> Result<Response<Body>, Error> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Methods", ALLOWED_METHODS)
        .header("Access-Control-Allow-Headers", ALLOWED_HEADERS)
        .body(Body::Empty)
        .map_err(Box::new)?)
}

pub fn not_found() -> Result<Response<Body>, Error> {
    json(StatusCode::NOT_FOUND, &serde_json::json!({"error": "Not found"}))
}

/// Echo the caller's origin back when it is on the allow-list.
pub fn apply_cors(headers: &mut HeaderMap, origin: Option<&str>, allowed_origins: &[String]) {
    let Some(origin) = origin else {
        return;
    };
    if !allowed_origins.iter().any(|allowed| allowed == origin) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert("Access-Control-Allow-Origin", value);
        headers.insert(
            "Access-Control-Allow-Credentials",
            HeaderValue::from_static("true"),
        );
        headers.insert("Vary", HeaderValue::from_static("Origin"));
    }
}
