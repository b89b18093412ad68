use chrono::{DateTime, Utc};
use mongodb::bson::Bson;
use serde::{Deserialize, Serialize};

use crate::db::Record;

/// Timestamps are kept as fixed-width RFC 3339 strings so that string order
/// in the store is chronological order.
pub mod ts {
    use chrono::{DateTime, Utc};
    use mongodb::bson::Bson;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn format(t: &DateTime<Utc>) -> String {
        t.format(FORMAT).to_string()
    }

    pub fn bson(t: &DateTime<Utc>) -> Bson {
        Bson::String(format(t))
    }

    fn parse<E: serde::de::Error>(raw: &str) -> Result<DateTime<Utc>, E> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(E::custom)
    }

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(t: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => s.serialize_str(&format(t)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(raw) => parse(&raw).map(Some),
                None => Ok(None),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Customer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "CUSTOMER",
            Role::Admin => "ADMIN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    MainProduct,
    SparePart,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::MainProduct => "MAIN_PRODUCT",
            ProductType::SparePart => "SPARE_PART",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStatus {
    New,
    Contacted,
    Converted,
    Closed,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "NEW",
            LeadStatus::Contacted => "CONTACTED",
            LeadStatus::Converted => "CONVERTED",
            LeadStatus::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    PaymentPending,
    PaymentVerified,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::PaymentPending => "PAYMENT_PENDING",
            OrderStatus::PaymentVerified => "PAYMENT_VERIFIED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplaintStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl ComplaintStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplaintStatus::Open => "OPEN",
            ComplaintStatus::InProgress => "IN_PROGRESS",
            ComplaintStatus::Resolved => "RESOLVED",
            ComplaintStatus::Closed => "CLOSED",
        }
    }
}

macro_rules! status_into_bson {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Bson {
            fn from(value: $ty) -> Bson {
                Bson::String(value.as_str().to_string())
            }
        })*
    };
}

status_into_bson!(Role, ProductType, LeadStatus, OrderStatus, ComplaintStatus);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub password: String,
    pub name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub verification_token: Option<String>,
    #[serde(default, with = "ts::option")]
    pub verification_token_expiry: Option<DateTime<Utc>>,
    /// Last token that verified this account; replays of it report success.
    #[serde(default)]
    pub consumed_verification_token: Option<String>,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

impl Record for User {
    const COLLECTION: &'static str = "users";
}

/// User as it leaves the server: no password hash, no verification token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub role: Role,
    pub is_verified: bool,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

impl From<User> for PublicUser {
    fn from(user: User) -> Self {
        PublicUser {
            id: user.id,
            email: user.email,
            name: user.name,
            phone: user.phone,
            address: user.address,
            role: user.role,
            is_verified: user.is_verified,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// Short form attached to orders, leads and complaints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        UserSummary {
            id: user.id.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            phone: user.phone.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub product_type: ProductType,
    pub base_price: Option<f64>,
    pub image_url: Option<String>,
    pub is_active: bool,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

impl Record for Product {
    const COLLECTION: &'static str = "products";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductVariant {
    pub id: String,
    pub product_id: String,
    pub name: String,
    pub capacity: Option<String>,
    pub price: f64,
    pub sku: Option<String>,
    pub is_active: bool,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

impl Record for ProductVariant {
    const COLLECTION: &'static str = "productVariants";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    pub id: String,
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: i64,
    pub qr_code: String,
    pub location: Option<String>,
    pub notes: Option<String>,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

impl Record for Inventory {
    const COLLECTION: &'static str = "inventory";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    pub product_id: Option<String>,
    pub user_id: Option<String>,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub message: Option<String>,
    pub status: LeadStatus,
    pub notes: Option<String>,
    pub converted_to_order_id: Option<String>,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

impl Record for Lead {
    const COLLECTION: &'static str = "leads";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub user_id: String,
    pub status: OrderStatus,
    pub total_amount: f64,
    pub payment_link: Option<String>,
    pub payment_verified: bool,
    #[serde(default, with = "ts::option")]
    pub payment_verified_at: Option<DateTime<Utc>>,
    pub shipping_address: Option<String>,
    pub notes: Option<String>,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

impl Record for Order {
    const COLLECTION: &'static str = "orders";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: i64,
    pub price: f64,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
}

impl Record for OrderItem {
    const COLLECTION: &'static str = "orderItems";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Complaint {
    pub id: String,
    pub user_id: String,
    pub order_id: String,
    pub order_number: String,
    pub subject: String,
    pub description: String,
    pub status: ComplaintStatus,
    pub resolution: Option<String>,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

impl Record for Complaint {
    const COLLECTION: &'static str = "complaints";
}

/// An order item joined with its catalogue entries.
#[derive(Debug, Clone, Serialize)]
pub struct OrderItemView {
    #[serde(flatten)]
    pub item: OrderItem,
    pub product: Option<Product>,
    pub variant: Option<ProductVariant>,
}

/// An order as it is returned and printed: customer summary plus items.
#[derive(Debug, Clone, Serialize)]
pub struct OrderView {
    #[serde(flatten)]
    pub order: Order,
    pub user: Option<UserSummary>,
    pub items: Vec<OrderItemView>,
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_are_fixed_width() {
        let t = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(ts::format(&t), "2026-03-04T05:06:07.000Z");
    }

    #[test]
    fn order_serializes_camel_case_with_screaming_status() {
        let now = Utc::now();
        let order = Order {
            id: "o1".into(),
            order_number: "ORD-1-1".into(),
            user_id: "u1".into(),
            status: OrderStatus::PaymentPending,
            total_amount: 250.0,
            payment_link: None,
            payment_verified: false,
            payment_verified_at: None,
            shipping_address: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["status"], "PAYMENT_PENDING");
        assert_eq!(json["orderNumber"], "ORD-1-1");
        assert_eq!(json["paymentVerifiedAt"], serde_json::Value::Null);
    }

    #[test]
    fn product_type_uses_type_key() {
        let json = serde_json::json!({
            "id": "p1",
            "name": "Incubator",
            "description": null,
            "type": "SPARE_PART",
            "basePrice": null,
            "imageUrl": null,
            "isActive": true,
            "createdAt": "2026-01-01T00:00:00.000Z",
            "updatedAt": "2026-01-01T00:00:00.000Z"
        });
        let product: Product = serde_json::from_value(json).unwrap();
        assert_eq!(product.product_type, ProductType::SparePart);
    }

    #[test]
    fn public_user_drops_secrets() {
        let now = Utc::now();
        let user = User {
            id: "u1".into(),
            email: "a@b.c".into(),
            password: "hash".into(),
            name: "A".into(),
            phone: None,
            address: None,
            role: Role::Customer,
            is_verified: false,
            verification_token: Some("tok".into()),
            verification_token_expiry: Some(now),
            consumed_verification_token: None,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(PublicUser::from(user)).unwrap();
        assert!(json.get("password").is_none());
        assert!(json.get("verificationToken").is_none());
    }
}
