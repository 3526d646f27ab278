use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Render a timestamp the way every record stores it: RFC 3339, UTC,
/// millisecond precision. Fixed width keeps string order chronological.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse RFC 3339, or the offset-less `YYYY-MM-DDTHH:MM[:SS]` form that
/// browser datetime inputs submit (read as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn deserialize_optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_timestamp(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {s}"))),
    }
}

// ========== USER ==========
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Yes,
    #[default]
    No,
}

impl Membership {
    pub fn as_str(&self) -> &'static str {
        match self {
            Membership::Yes => "yes",
            Membership::No => "no",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "yes" => Some(Membership::Yes),
            "no" => Some(Membership::No),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    #[serde(rename = "_id")]
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    #[serde(rename = "photourl")]
    pub photo_url: Option<String>,
    pub membership: Membership,
    pub post_count: i64,
    pub request_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertUserRequest {
    pub email: Option<String>,
    pub name: Option<String>,
    #[serde(alias = "photoUrl")]
    pub photourl: Option<String>,
    pub membership: Option<Membership>,
}

/// Everything the store needs to create-or-refresh a profile in one write.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileUpsert {
    /// Id assigned only if this write creates the record.
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub photo_url: Option<String>,
    /// Applied on insert only.
    pub membership: Membership,
    pub now: DateTime<Utc>,
}

/// Counters on a user account that other managers adjust.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCounter {
    Posts,
    Requests,
}

impl UserCounter {
    pub fn attribute(&self) -> &'static str {
        match self {
            UserCounter::Posts => "post_count",
            UserCounter::Requests => "request_count",
        }
    }
}

// ========== FOOD ==========
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FoodStatus {
    Available,
    Requested,
    Completed,
    Cancelled,
}

impl FoodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FoodStatus::Available => "available",
            FoodStatus::Requested => "requested",
            FoodStatus::Completed => "completed",
            FoodStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "available" => Some(FoodStatus::Available),
            "requested" => Some(FoodStatus::Requested),
            "completed" => Some(FoodStatus::Completed),
            "cancelled" => Some(FoodStatus::Cancelled),
            _ => None,
        }
    }

    /// States a listing may move into `self` from.
    pub fn allowed_predecessors(&self) -> &'static [FoodStatus] {
        match self {
            FoodStatus::Available => &[FoodStatus::Requested],
            FoodStatus::Requested => &[FoodStatus::Available],
            FoodStatus::Completed => &[FoodStatus::Requested],
            FoodStatus::Cancelled => &[FoodStatus::Available, FoodStatus::Requested],
        }
    }

    pub fn can_transition_to(&self, target: FoodStatus) -> bool {
        target.allowed_predecessors().contains(self)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FoodItem {
    #[serde(rename = "_id")]
    pub food_id: String,
    pub donor_email: String,
    pub donor_name: Option<String>,
    pub donor_image: Option<String>,
    pub food_name: String,
    pub food_image: Option<String>,
    #[serde(rename = "foodQuantity")]
    pub quantity: i64,
    pub pickup_location: Option<String>,
    #[serde(rename = "expiredDateTime")]
    pub expires_at: Option<DateTime<Utc>>,
    pub additional_notes: Option<String>,
    pub food_status: FoodStatus,
    /// Display fields the client sent that have no typed slot. They sit
    /// beside the typed fields on the wire.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Keys with a typed slot or owned by the server; dropped from
/// client-supplied `extra` maps so a flattened listing never repeats a key.
const RESERVED_FOOD_KEYS: &[&str] = &[
    "_id",
    "donorEmail",
    "donorName",
    "donorImage",
    "foodName",
    "foodImage",
    "foodQuantity",
    "quantity",
    "pickupLocation",
    "expiredDateTime",
    "additionalNotes",
    "foodStatus",
    "createdAt",
    "updatedAt",
    "extra",
];

fn strip_reserved(mut extra: Map<String, Value>) -> Map<String, Value> {
    extra.retain(|k, _| !RESERVED_FOOD_KEYS.contains(&k.as_str()));
    extra
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateFoodRequest {
    pub donor_email: Option<String>,
    pub donor_name: Option<String>,
    pub donor_image: Option<String>,
    pub food_name: Option<String>,
    pub food_image: Option<String>,
    #[serde(rename = "foodQuantity", alias = "quantity")]
    pub quantity: Option<i64>,
    pub pickup_location: Option<String>,
    #[serde(
        rename = "expiredDateTime",
        default,
        deserialize_with = "deserialize_optional_timestamp"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    pub additional_notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CreateFoodRequest {
    pub fn extra_fields(&self) -> Map<String, Value> {
        strip_reserved(self.extra.clone())
    }
}

/// Partial update for a listing. Status is deliberately absent: it only
/// moves through status transitions.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FoodPatch {
    pub donor_name: Option<String>,
    pub donor_image: Option<String>,
    pub food_name: Option<String>,
    pub food_image: Option<String>,
    #[serde(rename = "foodQuantity", alias = "quantity")]
    pub quantity: Option<i64>,
    pub pickup_location: Option<String>,
    #[serde(
        rename = "expiredDateTime",
        default,
        deserialize_with = "deserialize_optional_timestamp"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    pub additional_notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FoodPatch {
    /// Drop keys the server owns, the donor included.
    pub fn sanitized(mut self) -> Self {
        self.extra = strip_reserved(self.extra);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.donor_name.is_none()
            && self.donor_image.is_none()
            && self.food_name.is_none()
            && self.food_image.is_none()
            && self.quantity.is_none()
            && self.pickup_location.is_none()
            && self.expires_at.is_none()
            && self.additional_notes.is_none()
            && self.extra.is_empty()
    }

    /// Merge into an in-memory copy; the document store does the same with
    /// an update expression.
    pub fn apply_to(&self, item: &mut FoodItem, now: DateTime<Utc>) {
        if let Some(v) = &self.donor_name {
            item.donor_name = Some(v.clone());
        }
        if let Some(v) = &self.donor_image {
            item.donor_image = Some(v.clone());
        }
        if let Some(v) = &self.food_name {
            item.food_name = v.clone();
        }
        if let Some(v) = &self.food_image {
            item.food_image = Some(v.clone());
        }
        if let Some(v) = self.quantity {
            item.quantity = v;
        }
        if let Some(v) = &self.pickup_location {
            item.pickup_location = Some(v.clone());
        }
        if let Some(v) = self.expires_at {
            item.expires_at = Some(v);
        }
        if let Some(v) = &self.additional_notes {
            item.additional_notes = Some(v.clone());
        }
        for (k, v) in &self.extra {
            item.extra.insert(k.clone(), v.clone());
        }
        item.updated_at = now;
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFoodStatusRequest {
    pub food_status: Option<FoodStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Soonest expiry first.
    Ascending,
    #[default]
    Descending,
}

impl SortOrder {
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("asc") {
            SortOrder::Ascending
        } else {
            SortOrder::Descending
        }
    }
}

/// Filter applied by the store when listing food. `None` means "don't care".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FoodFilter {
    pub status: Option<FoodStatus>,
    /// Lower-cased substring of the food name.
    pub name_contains: Option<String>,
    /// Only items whose expiry is strictly after this instant. Items without
    /// an expiry never match once a cutoff is set.
    pub expires_after: Option<DateTime<Utc>>,
}

impl FoodFilter {
    pub fn matches(&self, item: &FoodItem) -> bool {
        if let Some(status) = self.status {
            if item.food_status != status {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !item.food_name.to_lowercase().contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(cutoff) = self.expires_after {
            match item.expires_at {
                Some(expiry) if expiry > cutoff => {}
                _ => return false,
            }
        }
        true
    }
}

// ========== FOOD REQUEST ==========
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    /// Nothing moves a request here yet.
    Accepted,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RequestStatus::Pending),
            "accepted" => Some(RequestStatus::Accepted),
            "cancelled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::Accepted)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FoodRequest {
    #[serde(rename = "_id")]
    pub request_id: String,
    pub food_id: String,
    pub user_email: String,
    pub requested_quantity: i64,
    pub additional_notes: Option<String>,
    pub status: RequestStatus,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubmitFoodRequest {
    pub food_id: Option<String>,
    pub user_email: Option<String>,
    pub requested_quantity: Option<i64>,
    #[serde(alias = "additionalNotes")]
    pub notes: Option<String>,
}

// ========== PAYMENT ==========
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    #[serde(rename = "_id")]
    pub payment_id: String,
    pub email: String,
    pub amount: f64,
    pub transaction_id: String,
    pub status: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecordPaymentRequest {
    pub email: Option<String>,
    pub amount: Option<f64>,
    pub transaction_id: Option<String>,
    pub status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CreatePaymentIntentRequest {
    pub price: Option<f64>,
}

/// What the payment processor hands back for the client to confirm with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub client_secret: String,
}
