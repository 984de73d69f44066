use super::{Direction, FieldKind, OrderBy, ResourceSchema};

/// Delivery zones, listed by name.
pub fn delivery_zones() -> ResourceSchema {
    ResourceSchema::new("delivery_zones", OrderBy::name("name"))
        .required("name", FieldKind::Text)
        .field("fee", FieldKind::Number)
        .field("min_order", FieldKind::Number)
        .field("eta_minutes", FieldKind::Integer)
        .field("is_active", FieldKind::Bool)
        .field("created_at", FieldKind::Timestamp)
}

/// Checkout payment methods in display order.
pub fn payment_methods() -> ResourceSchema {
    ResourceSchema::new("payment_methods", OrderBy::sort_index("sort_order"))
        .required("name", FieldKind::Text)
        .field("kind", FieldKind::Text)
        .field("is_active", FieldKind::Bool)
        .field("sort_order", FieldKind::Integer)
}

/// Storefront banners in display order.
pub fn banners() -> ResourceSchema {
    ResourceSchema::new("banners", OrderBy::sort_index("sort_order"))
        .required("title", FieldKind::Text)
        .field("image_url", FieldKind::Text)
        .field("link_url", FieldKind::Text)
        .field("is_active", FieldKind::Bool)
        .field("sort_order", FieldKind::Integer)
}

/// Third-party integrations, newest first.
pub fn integrations() -> ResourceSchema {
    ResourceSchema::new("integrations", OrderBy::created_at("created_at", Direction::Desc))
        .required("provider", FieldKind::Text)
        .field("config", FieldKind::Json)
        .field("is_active", FieldKind::Bool)
        .field("created_at", FieldKind::Timestamp)
}

/// Customer message templates by name.
pub fn message_templates() -> ResourceSchema {
    ResourceSchema::new("message_templates", OrderBy::name("name"))
        .required("name", FieldKind::Text)
        .field("channel", FieldKind::Text)
        .field("body", FieldKind::Text)
        .field("is_active", FieldKind::Bool)
}

/// Payment projection of orders, newest first.
pub fn order_payments() -> ResourceSchema {
    ResourceSchema::new("order_payments", OrderBy::created_at("created_at", Direction::Desc))
        .required("order_id", FieldKind::Text)
        .field("method", FieldKind::Text)
        .field("amount", FieldKind::Number)
        .field("status", FieldKind::Text)
        .field("created_at", FieldKind::Timestamp)
}

/// Append-only admin audit log, newest first.
pub fn audit_logs() -> ResourceSchema {
    ResourceSchema::new("audit_logs", OrderBy::created_at("created_at", Direction::Desc))
        .required("action", FieldKind::Text)
        .field("entity", FieldKind::Text)
        .field("entity_id", FieldKind::Text)
        .field("user_id", FieldKind::Text)
        .field("details", FieldKind::Json)
        .field("created_at", FieldKind::Timestamp)
}

/// User profiles used for display-name lookups.
pub fn users() -> ResourceSchema {
    ResourceSchema::new("users", OrderBy::name("name"))
        .required("name", FieldKind::Text)
        .field("email", FieldKind::Text)
}
