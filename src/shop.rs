use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::{
    error::{Error, Result},
    gamification::economy::adjust_gems_in,
    utils::Clock,
};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub price: i64,
    /// `None` means unlimited.
    pub stock: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Purchase {
    pub id: i64,
    pub product_id: i64,
    pub price: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub purchased_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PurchaseReceipt {
    pub purchase: Purchase,
    pub balance: i64,
}

#[derive(Clone)]
pub struct Shop {
    database: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl Shop {
    pub fn new(database: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { database, clock }
    }

    pub async fn add_product(&self, name: &str, price: i64, stock: Option<i64>) -> Result<i64> {
        if price < 0 || stock.is_some_and(|s| s < 0) {
            return Err(Error::validation("price and stock must be non-negative"));
        }
        let id = sqlx::query("insert into product (name, price, stock) values (?, ?, ?)")
            .bind(name)
            .bind(price)
            .bind(stock)
            .execute(&self.database)
            .await?
            .last_insert_rowid();
        info!(id, name, price, "product added");
        Ok(id)
    }

    pub async fn list_products(&self) -> Result<Vec<Product>> {
        let products =
            sqlx::query_as::<_, Product>("select id, name, price, stock from product order by id")
                .fetch_all(&self.database)
                .await?;
        Ok(products)
    }

    pub async fn purchases(&self, student_id: i64) -> Result<Vec<Purchase>> {
        let purchases = sqlx::query_as::<_, Purchase>(
            "select id, product_id, price, purchased_at from purchase where student_id = ? order by id",
        )
        .bind(student_id)
        .fetch_all(&self.database)
        .await?;
        Ok(purchases)
    }

    /// Stock, balance, purchase record and ledger move together or not at
    /// all. Each guard is part of the statement that writes.
    pub async fn purchase(&self, student_id: i64, product_id: i64) -> Result<PurchaseReceipt> {
        let now = self.clock.now();
        let mut tx = self.database.begin().await?;
        let Some((name, price)) = sqlx::query_as::<_, (String, i64)>(
            "update product set stock = case when stock is null then null else stock - 1 end \
             where id = ? and (stock is null or stock > 0) returning name, price",
        )
        .bind(product_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            let exists = sqlx::query_scalar::<_, i64>("select count(*) from product where id = ?")
                .bind(product_id)
                .fetch_one(&mut *tx)
                .await?;
            return Err(if exists == 0 {
                Error::NotFound(format!("product {product_id}"))
            } else {
                Error::validation(format!("product {product_id} is sold out"))
            });
        };
        let balance = if price > 0 {
            adjust_gems_in(&mut tx, student_id, -price, &format!("purchase: {name}"), now).await?
        } else {
            sqlx::query_scalar::<_, i64>("select gems from student where id = ?")
                .bind(student_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| Error::NotFound(format!("student {student_id}")))?
        };
        let id = sqlx::query(
            "insert into purchase (student_id, product_id, price, purchased_at) values (?, ?, ?, ?)",
        )
        .bind(student_id)
        .bind(product_id)
        .bind(price)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;
        info!(student_id, product_id, price, balance, "purchase");
        Ok(PurchaseReceipt {
            purchase: Purchase {
                id,
                product_id,
                price,
                purchased_at: now,
            },
            balance,
        })
    }
}
