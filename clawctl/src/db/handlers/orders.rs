//! Database repository for billing orders.
//!
//! Every state transition predicates on the source status in its WHERE
//! clause. A transition that matches no rows is not an error: the repository
//! re-reads the row and returns its current state, which makes webhook
//! replays and concurrent bridges safe to retry.

use crate::db::errors::{DbError, Result};
use crate::db::models::orders::{Order, OrderCreateDBRequest, OrderEvent, OrderRow, OrderStatus, PaymentSettlement};
use crate::types::{DeploymentId, OrderId, abbrev_uuid, now_ms};
use sqlx::SqliteConnection;
use tracing::instrument;
use uuid::Uuid;

pub struct Orders<'c> {
    db: &'c mut SqliteConnection,
}

impl<'c> Orders<'c> {
    pub fn new(db: &'c mut SqliteConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(plan_id = %request.plan_id), err)]
    pub async fn create(&mut self, request: &OrderCreateDBRequest) -> Result<Order> {
        let now = now_ms();
        let id: OrderId = Uuid::new_v4();

        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            INSERT INTO orders (
                id, provider, status, plan_id, amount, currency,
                deployment_intent_enc, metadata, customer_email,
                created_at, updated_at
            )
            VALUES (?, 'stripe', ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(OrderStatus::PendingPayment.to_db_string())
        .bind(&request.plan_id)
        .bind(request.amount)
        .bind(&request.currency)
        .bind(&request.deployment_intent_enc)
        .bind(request.metadata.to_string())
        .bind(&request.customer_email)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(row.into())
    }

    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&id)), err)]
    pub async fn get_by_id(&mut self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(row.map(Into::into))
    }

    pub async fn get_by_checkout_session(&mut self, session_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE checkout_session_id = ?")
            .bind(session_id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(row.map(Into::into))
    }

    pub async fn list(&mut self, skip: i64, limit: i64) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders ORDER BY created_at DESC, id LIMIT ? OFFSET ?")
            .bind(limit)
            .bind(skip)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Re-read the current row after an update matched nothing.
    async fn current(&mut self, id: OrderId) -> Result<Order> {
        self.get_by_id(id).await?.ok_or(DbError::NotFound)
    }

    /// Persist the checkout session the payment provider issued for this order.
    #[instrument(skip(self, checkout_url), fields(order_id = %abbrev_uuid(&id)), err)]
    pub async fn attach_checkout_session(&mut self, id: OrderId, session_id: &str, checkout_url: &str) -> Result<Order> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            UPDATE orders
            SET checkout_session_id = ?, checkout_url = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(checkout_url)
        .bind(now_ms())
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => self.current(id).await,
        }
    }

    /// Transition to `paid` from `pending_payment` or `failed`. Settlement
    /// fields fill with COALESCE semantics; `error_message` is cleared only
    /// on a legal transition. Any other source state is a no-op.
    #[instrument(skip(self, settlement), fields(order_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_paid(&mut self, id: OrderId, settlement: &PaymentSettlement) -> Result<Order> {
        let now = now_ms();
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            UPDATE orders
            SET status = 'paid',
                payment_intent_id = COALESCE(payment_intent_id, ?),
                customer_id = COALESCE(customer_id, ?),
                customer_email = COALESCE(customer_email, ?),
                paid_at = COALESCE(paid_at, ?),
                error_message = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('pending_payment', 'failed')
            RETURNING *
            "#,
        )
        .bind(&settlement.payment_intent_id)
        .bind(&settlement.customer_id)
        .bind(&settlement.customer_email)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => self.current(id).await,
        }
    }

    /// Transition to `failed` with a message. Refuses to downgrade a
    /// terminal order: `deployment_created`, `expired` and `canceled` rows
    /// are returned untouched.
    #[instrument(skip(self, message), fields(order_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_failed(&mut self, id: OrderId, message: &str) -> Result<Order> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            UPDATE orders
            SET status = 'failed', error_message = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending_payment', 'paid', 'failed')
            RETURNING *
            "#,
        )
        .bind(message)
        .bind(now_ms())
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => self.current(id).await,
        }
    }

    /// Expire the order bound to a checkout session, if it is still awaiting
    /// payment. Returns `None` when no order carries the session id.
    #[instrument(skip(self), err)]
    pub async fn mark_expired_by_checkout_session(&mut self, session_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            UPDATE orders
            SET status = 'expired', updated_at = ?
            WHERE checkout_session_id = ? AND status = 'pending_payment'
            RETURNING *
            "#,
        )
        .bind(now_ms())
        .bind(session_id)
        .fetch_optional(&mut *self.db)
        .await?;

        match row {
            Some(row) => Ok(Some(row.into())),
            None => self.get_by_checkout_session(session_id).await,
        }
    }

    /// Transition `paid` -> `deployment_created`, linking the deployment.
    /// The link, once set, is never cleared.
    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&id), deployment_id = %abbrev_uuid(&deployment_id)), err)]
    pub async fn mark_deployment_created(&mut self, id: OrderId, deployment_id: DeploymentId) -> Result<Order> {
        let now = now_ms();
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            UPDATE orders
            SET status = 'deployment_created',
                deployment_id = COALESCE(deployment_id, ?),
                completed_at = COALESCE(completed_at, ?),
                updated_at = ?
            WHERE id = ? AND status = 'paid'
            RETURNING *
            "#,
        )
        .bind(deployment_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => self.current(id).await,
        }
    }

    /// Append an audit event.
    pub async fn append_event(
        &mut self,
        order_id: OrderId,
        event_type: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<OrderEvent> {
        let event = sqlx::query_as::<_, OrderEvent>(
            r#"
            INSERT INTO order_events (order_id, event_type, message, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(event_type)
        .bind(message)
        .bind(payload.map(|p| p.to_string()))
        .bind(now_ms())
        .fetch_one(&mut *self.db)
        .await?;

        Ok(event)
    }

    /// Events in append order (monotonic event id).
    pub async fn list_events(&mut self, order_id: OrderId) -> Result<Vec<OrderEvent>> {
        let events = sqlx::query_as::<_, OrderEvent>("SELECT * FROM order_events WHERE order_id = ? ORDER BY id ASC")
            .bind(order_id)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::SqlitePool;

    async fn create_order(pool: &SqlitePool) -> Order {
        let mut conn = pool.acquire().await.unwrap();
        Orders::new(&mut conn)
            .create(&OrderCreateDBRequest {
                plan_id: "hetzner-cx23-launch".to_string(),
                amount: 2900,
                currency: "eur".to_string(),
                deployment_intent_enc: "v1.aaaa.bbbb.cccc".to_string(),
                metadata: json!({"source": "test"}),
                customer_email: Some("buyer@example.com".to_string()),
            })
            .await
            .unwrap()
    }

    fn settlement() -> PaymentSettlement {
        PaymentSettlement {
            payment_intent_id: Some("pi_123".to_string()),
            customer_id: Some("cus_123".to_string()),
            customer_email: Some("buyer@example.com".to_string()),
        }
    }

    #[sqlx::test(migrations = "./migrations/orders")]
    async fn test_create_starts_pending_payment(pool: SqlitePool) {
        let order = create_order(&pool).await;
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.amount, 2900);
        assert!(order.paid_at.is_none());
        assert!(order.deployment_id.is_none());
    }

    #[sqlx::test(migrations = "./migrations/orders")]
    async fn test_mark_paid_fills_settlement(pool: SqlitePool) {
        let order = create_order(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut orders = Orders::new(&mut conn);

        let paid = orders.mark_paid(order.id, &settlement()).await.unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);
        assert_eq!(paid.payment_intent_id.as_deref(), Some("pi_123"));
        assert!(paid.paid_at.is_some());

        // A replayed settlement must not overwrite the original fields
        let replay = orders
            .mark_paid(
                order.id,
                &PaymentSettlement {
                    payment_intent_id: Some("pi_other".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(replay.status, OrderStatus::Paid);
        assert_eq!(replay.payment_intent_id.as_deref(), Some("pi_123"));
    }

    #[sqlx::test(migrations = "./migrations/orders")]
    async fn test_failed_then_paid_recovers(pool: SqlitePool) {
        let order = create_order(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut orders = Orders::new(&mut conn);

        let failed = orders.mark_failed(order.id, "async payment failed").await.unwrap();
        assert_eq!(failed.status, OrderStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("async payment failed"));

        let paid = orders.mark_paid(order.id, &settlement()).await.unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);
        assert!(paid.error_message.is_none(), "error must clear on recovery");
    }

    #[sqlx::test(migrations = "./migrations/orders")]
    async fn test_terminal_is_sticky(pool: SqlitePool) {
        let order = create_order(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut orders = Orders::new(&mut conn);

        orders.mark_paid(order.id, &settlement()).await.unwrap();
        let deployment_id = Uuid::new_v4();
        let done = orders.mark_deployment_created(order.id, deployment_id).await.unwrap();
        assert_eq!(done.status, OrderStatus::DeploymentCreated);
        assert_eq!(done.deployment_id, Some(deployment_id));

        // Failure reports after the terminal state are ignored without
        // clearing error state
        let after = orders.mark_failed(order.id, "late failure").await.unwrap();
        assert_eq!(after.status, OrderStatus::DeploymentCreated);
        assert!(after.error_message.is_none());

        // The deployment link never changes
        let relink = orders.mark_deployment_created(order.id, Uuid::new_v4()).await.unwrap();
        assert_eq!(relink.deployment_id, Some(deployment_id));
    }

    #[sqlx::test(migrations = "./migrations/orders")]
    async fn test_expire_only_from_pending(pool: SqlitePool) {
        let order = create_order(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut orders = Orders::new(&mut conn);

        orders.attach_checkout_session(order.id, "cs_test_1", "https://pay.example/cs_test_1").await.unwrap();

        let expired = orders.mark_expired_by_checkout_session("cs_test_1").await.unwrap().unwrap();
        assert_eq!(expired.status, OrderStatus::Expired);

        // Expiring a paid order is a no-op
        let order2 = create_order(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut orders = Orders::new(&mut conn);
        orders.attach_checkout_session(order2.id, "cs_test_2", "https://pay.example/cs_test_2").await.unwrap();
        orders.mark_paid(order2.id, &settlement()).await.unwrap();
        let still_paid = orders.mark_expired_by_checkout_session("cs_test_2").await.unwrap().unwrap();
        assert_eq!(still_paid.status, OrderStatus::Paid);

        // Unknown session
        assert!(orders.mark_expired_by_checkout_session("cs_missing").await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations/orders")]
    async fn test_checkout_session_unique(pool: SqlitePool) {
        let a = create_order(&pool).await;
        let b = create_order(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut orders = Orders::new(&mut conn);

        orders.attach_checkout_session(a.id, "cs_dup", "https://pay.example/a").await.unwrap();
        let err = orders.attach_checkout_session(b.id, "cs_dup", "https://pay.example/b").await;
        assert!(matches!(err, Err(e) if e.is_unique_violation()));
    }

    #[sqlx::test(migrations = "./migrations/orders")]
    async fn test_events_are_ordered(pool: SqlitePool) {
        let order = create_order(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let mut orders = Orders::new(&mut conn);

        orders.append_event(order.id, "checkout.created", "checkout session issued", None).await.unwrap();
        orders
            .append_event(order.id, "payment.pending_async", "awaiting async settlement", Some(&json!({"session": "cs_1"})))
            .await
            .unwrap();
        orders.append_event(order.id, "payment.settled", "payment settled", None).await.unwrap();

        let events = orders.list_events(order.id).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(events[0].event_type, "checkout.created");
        assert_eq!(events[2].event_type, "payment.settled");
    }
}
