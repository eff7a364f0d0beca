//! HTTP client for the expense-sharing REST API.
//!
//! Bearer authentication through a [`TokenProvider`], one retry after a token
//! refresh on 401, and an `Idempotency-Key` header carrying the queued
//! operation's id on every mutating request.

use crate::auth::TokenProvider;
use crate::config::CloudConfig;
use crate::error::{CloudError, CloudResult};
use crate::remote::{ApiResponse, RemoteApi};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use splitsync_types::{
    now_millis, CachedBalance, CachedExpense, CachedGroup, CachedUser, EntityId, ExchangeRate,
    Operation, OperationId,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// What a route's success body decodes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Expense,
    Group,
    Guest,
    GroupOrEmpty,
    Empty,
}

#[derive(Debug)]
struct Route {
    method: Method,
    path: String,
    body: Option<Value>,
    expect: Expect,
}

fn path_id(id: &EntityId) -> CloudResult<i64> {
    id.as_canonical()
        .ok_or_else(|| CloudError::Protocol(format!("unresolved temp id {id} in request path")))
}

fn route(op: &Operation) -> CloudResult<Route> {
    let r = |method: Method, path: String, body: Option<Value>, expect: Expect| Route {
        method,
        path,
        body,
        expect,
    };
    Ok(match op {
        Operation::CreateExpense(new) => r(
            Method::POST,
            "/api/expenses".into(),
            Some(serde_json::to_value(new)?),
            Expect::Expense,
        ),
        Operation::UpdateExpense {
            expense_id,
            changes,
        } => r(
            Method::PUT,
            format!("/api/expenses/{}", path_id(expense_id)?),
            Some(serde_json::to_value(changes)?),
            Expect::Expense,
        ),
        Operation::DeleteExpense { expense_id } => r(
            Method::DELETE,
            format!("/api/expenses/{}", path_id(expense_id)?),
            None,
            Expect::Empty,
        ),
        Operation::CreateGroup(new) => r(
            Method::POST,
            "/api/groups".into(),
            Some(serde_json::to_value(new)?),
            Expect::Group,
        ),
        Operation::UpdateGroup { group_id, changes } => r(
            Method::PUT,
            format!("/api/groups/{}", path_id(group_id)?),
            Some(serde_json::to_value(changes)?),
            Expect::GroupOrEmpty,
        ),
        Operation::DeleteGroup { group_id } => r(
            Method::DELETE,
            format!("/api/groups/{}", path_id(group_id)?),
            None,
            Expect::Empty,
        ),
        Operation::SettleUp(new) => r(
            Method::POST,
            "/api/settle-up".into(),
            Some(serde_json::to_value(new)?),
            Expect::Expense,
        ),
        Operation::AddMember { group_id, user_id } => r(
            Method::POST,
            format!("/api/groups/{}/members", path_id(group_id)?),
            Some(serde_json::json!({ "user_id": user_id })),
            Expect::GroupOrEmpty,
        ),
        Operation::RemoveMember { group_id, user_id } => r(
            Method::DELETE,
            format!("/api/groups/{}/members/{user_id}", path_id(group_id)?),
            None,
            Expect::GroupOrEmpty,
        ),
        Operation::AddGuest(new) => r(
            Method::POST,
            format!("/api/groups/{}/guests", path_id(&new.group_id)?),
            Some(serde_json::to_value(new)?),
            Expect::Guest,
        ),
        Operation::RemoveGuest { group_id, guest_id } => r(
            Method::DELETE,
            format!(
                "/api/groups/{}/guests/{}",
                path_id(group_id)?,
                path_id(guest_id)?
            ),
            None,
            Expect::GroupOrEmpty,
        ),
    })
}

/// HTTP implementation of [`RemoteApi`].
pub struct HttpApiClient {
    client: Client,
    config: CloudConfig,
    tokens: Arc<dyn TokenProvider>,
    /// Serializes refreshes so concurrent 401s trigger a single refresh.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped on every successful refresh.
    refresh_generation: AtomicU64,
}

impl HttpApiClient {
    pub fn new(config: CloudConfig, tokens: Arc<dyn TokenProvider>) -> CloudResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config,
            tokens,
            refresh_lock: tokio::sync::Mutex::new(()),
            refresh_generation: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    fn request(
        &self,
        method: &Method,
        url: &str,
        token: &str,
        body: Option<&Value>,
        idempotency_key: Option<&OperationId>,
    ) -> RequestBuilder {
        let mut req = self.client.request(method.clone(), url).bearer_auth(token);
        if let Some(key) = idempotency_key {
            req = req.header(IDEMPOTENCY_HEADER, key.to_string());
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        req
    }

    async fn refresh_token(&self) -> CloudResult<String> {
        let pre_gen = self.refresh_generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;

        // A concurrent refresh finished while we waited: use its token.
        if self.refresh_generation.load(Ordering::Acquire) > pre_gen {
            return self.tokens.access_token().await;
        }

        let token = self.tokens.refresh().await?;
        self.refresh_generation.fetch_add(1, Ordering::AcqRel);
        Ok(token)
    }

    /// Sends an authenticated request, retrying once after a refresh on 401.
    /// Non-success statuses come back as [`CloudError::Status`].
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&OperationId>,
    ) -> CloudResult<Response> {
        let url = self.url(path);
        let token = self.tokens.access_token().await?;
        let resp = self
            .request(&method, &url, &token, body, idempotency_key)
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            debug!("401 on {method} {path}, refreshing token");
            let token = self.refresh_token().await?;
            let resp = self
                .request(&method, &url, &token, body, idempotency_key)
                .send()
                .await?;
            return check_status(resp).await;
        }

        check_status(resp).await
    }
}

async fn check_status(resp: Response) -> CloudResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(CloudError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode(resp: Response, expect: Expect) -> CloudResult<ApiResponse> {
    let bytes = resp.bytes().await?;
    let empty = bytes.iter().all(|b| b.is_ascii_whitespace());
    match expect {
        Expect::Empty => Ok(ApiResponse::Empty),
        Expect::GroupOrEmpty if empty => Ok(ApiResponse::Empty),
        _ if empty => Err(CloudError::Protocol(
            "expected a resource in the response body, got nothing".to_string(),
        )),
        Expect::Expense => Ok(ApiResponse::Expense(serde_json::from_slice(&bytes)?)),
        Expect::Group | Expect::GroupOrEmpty => {
            Ok(ApiResponse::Group(serde_json::from_slice(&bytes)?))
        }
        Expect::Guest => Ok(ApiResponse::Guest(serde_json::from_slice(&bytes)?)),
    }
}

#[async_trait]
impl RemoteApi for HttpApiClient {
    async fn execute(
        &self,
        idempotency_key: &OperationId,
        operation: &Operation,
    ) -> CloudResult<ApiResponse> {
        let route = route(operation)?;
        debug!(
            kind = %operation.kind(),
            key = %idempotency_key,
            "{} {}",
            route.method,
            route.path
        );
        let resp = self
            .send(
                route.method,
                &route.path,
                route.body.as_ref(),
                Some(idempotency_key),
            )
            .await?;
        decode(resp, route.expect).await
    }

    async fn fetch_groups(&self) -> CloudResult<Vec<CachedGroup>> {
        #[derive(Deserialize)]
        struct Resp {
            groups: Vec<CachedGroup>,
        }
        let resp = self.send(Method::GET, "/api/groups", None, None).await?;
        let data: Resp = resp.json().await?;
        Ok(data.groups)
    }

    async fn fetch_group_expenses(&self, group_id: i64) -> CloudResult<Vec<CachedExpense>> {
        #[derive(Deserialize)]
        struct Resp {
            expenses: Vec<CachedExpense>,
        }
        let resp = self
            .send(
                Method::GET,
                &format!("/api/groups/{group_id}/expenses"),
                None,
                None,
            )
            .await?;
        let data: Resp = resp.json().await?;
        Ok(data.expenses)
    }

    async fn fetch_balances(&self) -> CloudResult<Vec<CachedBalance>> {
        #[derive(Deserialize)]
        struct Resp {
            balances: Vec<CachedBalance>,
        }
        let resp = self.send(Method::GET, "/api/balances", None, None).await?;
        let data: Resp = resp.json().await?;
        Ok(data.balances)
    }

    async fn fetch_friends(&self) -> CloudResult<Vec<CachedUser>> {
        #[derive(Deserialize)]
        struct Resp {
            friends: Vec<CachedUser>,
        }
        let resp = self.send(Method::GET, "/api/friends", None, None).await?;
        let data: Resp = resp.json().await?;
        Ok(data.friends)
    }

    async fn fetch_exchange_rates(&self, base: &str) -> CloudResult<Vec<ExchangeRate>> {
        #[derive(Deserialize)]
        struct Resp {
            base: String,
            rates: BTreeMap<String, f64>,
        }
        let resp = self
            .send(
                Method::GET,
                &format!("/api/exchange-rates?base={base}"),
                None,
                None,
            )
            .await?;
        let data: Resp = resp.json().await?;
        let fetched_at = now_millis();
        Ok(data
            .rates
            .into_iter()
            .map(|(quote, rate)| ExchangeRate {
                base: data.base.clone(),
                quote,
                rate,
                fetched_at,
            })
            .collect())
    }
}
