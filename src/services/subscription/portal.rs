// src/services/subscription/portal.rs

use tracing::debug;
use uuid::Uuid;

use super::SubscriptionService;
use crate::{
    errors::{AppError, AppResult},
    models::subscription::{ListSubscriptionsQuery, Order, SubscriptionPage},
};

/// Outcome of opening a subscription page from the portal.
#[derive(Debug)]
pub enum PortalAccess {
    Granted(Order),
    /// Anonymous visitor without a token: send them to the login page.
    Redirect(String),
}

impl SubscriptionService {
    /// Resolves who may see a subscription: a matching access token, or a
    /// session of the owning partner. Anything else looks like a missing page.
    pub async fn resolve_access(
        &self,
        order_id: Uuid,
        session_partner: Option<Uuid>,
        access_token: Option<&str>,
    ) -> AppResult<PortalAccess> {
        let not_found = || AppError::NotFound(format!("Subscription {} not found", order_id));
        let order = self.store.get_order(order_id).await?.ok_or_else(not_found)?;

        if let Some(token) = access_token {
            if !tokens_match(token, &order.access_token) {
                debug!("Wrong access token for subscription {}", order.name);
                return Err(not_found());
            }
            return Ok(PortalAccess::Granted(self.with_amounts(order).await?));
        }

        match session_partner {
            Some(partner) if partner == order.partner_id => {
                Ok(PortalAccess::Granted(self.with_amounts(order).await?))
            }
            Some(_) => Err(not_found()),
            None => Ok(PortalAccess::Redirect(format!(
                "/web/login?redirect=/my/subscriptions/{}",
                order_id
            ))),
        }
    }

    /// One page of the partner's subscriptions, newest first.
    pub async fn list_subscriptions(
        &self,
        partner_id: Uuid,
        query: &ListSubscriptionsQuery,
    ) -> AppResult<SubscriptionPage> {
        let per_page = self.settings.portal_page_size.max(1);
        let page = query.page.unwrap_or(1).max(1);
        let offset = i64::from(page - 1).saturating_mul(i64::from(per_page));

        let (items, total) = self
            .store
            .list_partner_orders(partner_id, query.state, offset, i64::from(per_page))
            .await?;

        let page_count = ((total.max(0) as u64).div_ceil(u64::from(per_page))).max(1) as u32;
        Ok(SubscriptionPage {
            items,
            page,
            page_count,
            total,
        })
    }
}

/// Compares without short-circuiting on the first differing byte.
fn tokens_match(given: &str, expected: &str) -> bool {
    let (given, expected) = (given.as_bytes(), expected.as_bytes());
    given.len() == expected.len()
        && given
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fixture, order_request};
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn access_needs_the_token_or_the_owning_session() {
        let fx = fixture().await;
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let order = fx
            .service
            .create_order(order_request(&fx, dec!(1), start))
            .await
            .unwrap();

        let by_token = fx
            .service
            .resolve_access(order.id, None, Some(&order.access_token))
            .await
            .unwrap();
        assert!(matches!(by_token, PortalAccess::Granted(_)));

        let wrong = fx.service.resolve_access(order.id, None, Some("nope")).await;
        assert!(matches!(wrong, Err(AppError::NotFound(_))));

        let owner = fx
            .service
            .resolve_access(order.id, Some(order.partner_id), None)
            .await
            .unwrap();
        assert!(matches!(owner, PortalAccess::Granted(_)));

        let stranger = fx.service.resolve_access(order.id, Some(Uuid::new_v4()), None).await;
        assert!(matches!(stranger, Err(AppError::NotFound(_))));

        match fx.service.resolve_access(order.id, None, None).await.unwrap() {
            PortalAccess::Redirect(url) => {
                assert_eq!(url, format!("/web/login?redirect=/my/subscriptions/{}", order.id))
            }
            other => panic!("expected a redirect, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn listing_is_paged_per_partner() {
        let fx = fixture().await;
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let first = fx
            .service
            .create_order(order_request(&fx, dec!(1), start))
            .await
            .unwrap();
        for _ in 0..21 {
            let mut req = order_request(&fx, dec!(1), start);
            req.partner_id = first.partner_id;
            fx.service.create_order(req).await.unwrap();
        }
        // someone else's subscription
        fx.service
            .create_order(order_request(&fx, dec!(1), start))
            .await
            .unwrap();

        let query = ListSubscriptionsQuery {
            page: Some(2),
            state: None,
        };
        let page = fx.service.list_subscriptions(first.partner_id, &query).await.unwrap();
        assert_eq!(page.total, 22);
        assert_eq!(page.page_count, 2);
        assert_eq!(page.items.len(), 2);

        let query = ListSubscriptionsQuery {
            page: Some(u32::MAX),
            state: None,
        };
        let page = fx.service.list_subscriptions(first.partner_id, &query).await.unwrap();
        assert_eq!(page.page, u32::MAX);
        assert_eq!(page.total, 22);
        assert!(page.items.is_empty());
    }
}
