//! The three participant operations of the purchase flow.

use core_2pc::{GlobalId, Row, TableRef};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{element::ResourceManager, error::ElementError};

pub const STORAGE: TableRef = TableRef {
    name: "storage",
    key_column: "product_id",
    columns: &["product_id", "total", "used", "residue"],
};

pub const ACCOUNT: TableRef = TableRef {
    name: "account",
    key_column: "user_id",
    columns: &["user_id", "total", "used", "residue"],
};

pub const ORDER: TableRef = TableRef {
    name: "t_order",
    key_column: "id",
    columns: &["id", "user_id", "product_id", "count", "money", "status"],
};

/// Order status right after creation.
pub const ORDER_CREATED: i64 = 0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecreaseStock {
    pub product_id: i64,
    pub count: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecreaseBalance {
    pub user_id: i64,
    /// Amount in cents.
    pub money: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrder {
    pub user_id: i64,
    pub product_id: i64,
    pub count: i64,
    pub money: i64,
}

/// Row with `used += amount`, `residue -= amount`, if the residue covers it.
fn consume(row: Option<Row>, amount: i64) -> Option<(Row, Row)> {
    let before = row?;
    let used = before.get("used")?;
    let residue = before.get("residue")?;
    if residue < amount {
        return None;
    }
    let after = before.clone().with("used", used + amount).with("residue", residue - amount);
    Some((before, after))
}

pub async fn decrease_stock(
    manager: &ResourceManager,
    global_id: GlobalId,
    request: DecreaseStock,
) -> Result<(), ElementError> {
    manager
        .begin(global_id)
        .await?
        .commit_with(move |unit| {
            Box::pin(async move {
                match consume(unit.read(&STORAGE, request.product_id).await?, request.count) {
                    Some((_, after)) => unit.update(&STORAGE, request.product_id, after).await,
                    None => Err(ElementError::Business("insufficient stock".to_string())),
                }
            })
        })
        .await?;

    info!(%global_id, product_id = request.product_id, count = request.count, "stock decreased");
    Ok(())
}

pub async fn decrease_balance(
    manager: &ResourceManager,
    global_id: GlobalId,
    request: DecreaseBalance,
) -> Result<(), ElementError> {
    manager
        .begin(global_id)
        .await?
        .commit_with(move |unit| {
            Box::pin(async move {
                match consume(unit.read(&ACCOUNT, request.user_id).await?, request.money) {
                    Some((_, after)) => unit.update(&ACCOUNT, request.user_id, after).await,
                    None => Err(ElementError::Business("insufficient balance".to_string())),
                }
            })
        })
        .await?;

    info!(%global_id, user_id = request.user_id, money = request.money, "balance decreased");
    Ok(())
}

/// Insert an order in the created state and return its id.
pub async fn create_order(
    manager: &ResourceManager,
    global_id: GlobalId,
    request: CreateOrder,
) -> Result<i64, ElementError> {
    let order_id = manager
        .begin(global_id)
        .await?
        .commit_with(move |unit| {
            let row = Row::new()
                .with("user_id", request.user_id)
                .with("product_id", request.product_id)
                .with("count", request.count)
                .with("money", request.money)
                .with("status", ORDER_CREATED);
            Box::pin(async move { unit.insert(&ORDER, row).await })
        })
        .await?;

    info!(%global_id, order_id, user_id = request.user_id, "order created");
    Ok(order_id)
}
