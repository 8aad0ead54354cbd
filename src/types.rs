use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Menu {
    pub id: i64,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub is_out_of_stock: bool,
}

/// Partial menu update; unset fields are left untouched by the server.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MenuUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_out_of_stock: Option<bool>,
}

impl MenuUpdate {
    pub fn price(price: f64) -> Self {
        Self {
            price: Some(price),
            ..Self::default()
        }
    }

    pub fn out_of_stock(is_out_of_stock: bool) -> Self {
        Self {
            is_out_of_stock: Some(is_out_of_stock),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderItemCreate {
    pub menu_id: i64,
    pub quantity: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrderCreate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_id: Option<i64>,
    pub order_items: Vec<OrderItemCreate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub menu_id: i64,
    pub quantity: u32,
    #[serde(default)]
    pub menu: Option<Menu>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    #[serde(default)]
    pub table_id: Option<i64>,
    #[serde(default)]
    pub payment_number: Option<String>,
    pub status: String,
    #[serde(default)]
    pub total_price: Option<f64>,
    pub created_at: String,
    #[serde(default)]
    pub order_items: Vec<OrderItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SalesByTime {
    pub time_slot: String,
    pub total: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MenuSales {
    pub menu_id: i64,
    pub menu_name: String,
    pub quantity_sold: u64,
    pub total_sales: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RealtimeSales {
    #[serde(default)]
    pub daily_total: f64,
    #[serde(default)]
    pub past_hour_total: f64,
    #[serde(default)]
    pub past_30min_total: f64,
    #[serde(default)]
    pub menu_sales: Vec<MenuSales>,
}
