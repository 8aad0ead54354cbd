//! Typed helpers for the order, menu, table and sales resources.
//!
//! Every helper builds a [`Request`] and runs it through
//! [`ApiClient::fetch_json`], so it uses the client's default retry policy.

use serde_json::json;

use crate::{
    types::{Menu, MenuUpdate, Order, OrderCreate, RealtimeSales, SalesByTime, Table},
    ApiClient, Request, Result,
};

impl ApiClient {
    /// `GET /menus/`
    pub async fn list_menus(&self) -> Result<Vec<Menu>> {
        self.fetch_json(&Request::get("menus/")).await
    }

    /// `GET /menus/categories/`
    pub async fn list_menu_categories(&self) -> Result<Vec<String>> {
        self.fetch_json(&Request::get("menus/categories/")).await
    }

    /// `PATCH /menus/{id}`; the server broadcasts `menu_update` afterwards.
    pub async fn update_menu(&self, menu_id: i64, update: &MenuUpdate) -> Result<Menu> {
        let req = Request::patch(format!("menus/{menu_id}")).json(update)?;
        self.fetch_json(&req).await
    }

    /// `GET /orders/`
    pub async fn list_orders(&self) -> Result<Vec<Order>> {
        self.fetch_json(&Request::get("orders/")).await
    }

    /// `GET /orders/{table_id}`
    pub async fn list_table_orders(&self, table_id: i64) -> Result<Vec<Order>> {
        self.fetch_json(&Request::get(format!("orders/{table_id}")))
            .await
    }

    /// `GET /orders/by_payment_number/{n}`
    pub async fn order_by_payment_number(&self, payment_number: &str) -> Result<Order> {
        let path = format!("orders/by_payment_number/{}", payment_number.trim());
        self.fetch_json(&Request::get(path)).await
    }

    /// `POST /orders/`; the server broadcasts `new_order` afterwards.
    pub async fn place_order(&self, order: &OrderCreate) -> Result<Order> {
        let req = Request::post("orders/").json(order)?;
        self.fetch_json(&req).await
    }

    /// `PATCH /orders/{id}` with `{"status": ...}`.
    pub async fn update_order_status(&self, order_id: i64, status: &str) -> Result<Order> {
        let req = Request::patch(format!("orders/{order_id}")).json(&json!({ "status": status }))?;
        self.fetch_json(&req).await
    }

    /// `GET /tables/`
    pub async fn list_tables(&self) -> Result<Vec<Table>> {
        self.fetch_json(&Request::get("tables/")).await
    }

    /// `GET /orders/sales/realtime`
    pub async fn realtime_sales(&self) -> Result<RealtimeSales> {
        self.fetch_json(&Request::get("orders/sales/realtime")).await
    }

    /// `GET /orders/sales/by-time?start=..&end=..` with `YYYY-MM-DD` dates.
    pub async fn sales_by_time(&self, start: &str, end: &str) -> Result<Vec<SalesByTime>> {
        let path = format!("orders/sales/by-time?start={}&end={}", start.trim(), end.trim());
        self.fetch_json(&Request::get(path)).await
    }
}
