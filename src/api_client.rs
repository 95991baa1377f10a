use crate::config::Config;
use crate::date_range::DateRange;
use crate::error::{Error, TransportError};
use crate::models::{Breakdown, Platform};
use futures::stream::{self, Stream, TryStreamExt};
use log::{debug, info, warn};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Graph API error codes that mean "slow down" even when the status is 400.
const RATE_LIMIT_CODES: [i64; 4] = [4, 17, 32, 613];
const PAGE_LIMIT: &str = "100";

/// Status line and body of a completed HTTP exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a GET request. Any status code is a successful exchange; only
    /// failures to get a response at all are errors.
    async fn get(&self, url: Url) -> Result<RawResponse, TransportError>;

    /// Sends a POST request with a JSON body.
    async fn post(&self, url: Url, body: Value) -> Result<RawResponse, TransportError>;
}

/// [`Transport`] backed by `reqwest`, with every call bounded by a timeout.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        Ok(HttpTransport {
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: Url) -> Result<RawResponse, TransportError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(RawResponse { status, body })
    }

    async fn post(&self, url: Url, body: Value) -> Result<RawResponse, TransportError> {
        let resp = self.client.post(url).json(&body).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(RawResponse { status, body })
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait GraphApi: Send + Sync + 'static {
    /// Lists the Pages the token manages, each with its linked Instagram
    /// Business account when there is one.
    async fn list_pages(&self) -> Result<Vec<PageRecord>, Error>;

    /// Lists the ad accounts the token can read.
    async fn list_ad_accounts(&self) -> Result<Vec<AdAccountRecord>, Error>;

    /// Fetches daily insight series for a Page or Instagram account.
    /// # Arguments
    /// * `account_id` - Page or Instagram Business account id.
    /// * `metric_names` - Graph API metric names to request.
    /// * `date_range` - Inclusive reporting window.
    /// # Returns
    /// One [`RawMetricSeries`] per metric the API reported, values in
    /// chronological order.
    async fn fetch_insights(
        &self,
        account_id: &str,
        metric_names: &[String],
        date_range: &DateRange,
    ) -> Result<Vec<RawMetricSeries>, Error>;

    /// Fetches daily campaign-level insights for an ad account.
    async fn fetch_ad_insights(
        &self,
        ad_account_id: &str,
        date_range: &DateRange,
    ) -> Result<Vec<RawAdInsight>, Error>;

    /// Fetches account-level ad delivery over the whole window, one row per
    /// segment of `breakdown`.
    async fn fetch_ad_breakdown(
        &self,
        ad_account_id: &str,
        breakdown: Breakdown,
        date_range: &DateRange,
    ) -> Result<Vec<RawAdBreakdown>, Error>;

    /// Fetches the posts (Pages) or media (Instagram) published in the
    /// window, each with its lifetime insights inlined.
    async fn fetch_posts(
        &self,
        account_id: &str,
        platform: Platform,
        date_range: &DateRange,
    ) -> Result<Vec<RawPost>, Error>;

    /// Fetches `period=lifetime` insight metrics, such as audience splits.
    async fn fetch_lifetime_insights(
        &self,
        account_id: &str,
        metric_names: &[String],
    ) -> Result<Vec<RawMetricSeries>, Error>;
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct PageRecord {
    pub id: String,
    pub name: String,
    pub category: Option<String>,
    pub instagram_business_account: Option<InstagramRecord>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct InstagramRecord {
    pub id: String,
    pub username: Option<String>,
    pub name: Option<String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct AdAccountRecord {
    pub id: String,
    pub name: Option<String>,
    pub account_status: Option<u32>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct RawMetricSeries {
    pub name: String,
    #[serde(default)]
    pub values: Vec<RawMetricValue>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct RawMetricValue {
    #[serde(default)]
    pub value: Value,
    pub end_time: Option<String>,
}

/// One row of the ads insights edge. The API reports numbers as strings.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct RawAdInsight {
    pub campaign_id: Option<String>,
    pub campaign_name: Option<String>,
    pub date_start: String,
    pub spend: Option<String>,
    pub clicks: Option<String>,
    pub impressions: Option<String>,
    pub reach: Option<String>,
}

/// One row of the ads insights edge split by a breakdown. Only the field
/// named after the requested breakdown is set.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct RawAdBreakdown {
    pub spend: Option<String>,
    pub clicks: Option<String>,
    pub impressions: Option<String>,
    pub reach: Option<String>,
    #[serde(default)]
    pub cost_per_result: Value,
    pub age: Option<String>,
    pub gender: Option<String>,
    pub device_platform: Option<String>,
    pub region: Option<String>,
}

impl RawAdBreakdown {
    pub fn segment(&self, breakdown: Breakdown) -> Option<&str> {
        match breakdown {
            Breakdown::Age => self.age.as_deref(),
            Breakdown::Gender => self.gender.as_deref(),
            Breakdown::DevicePlatform => self.device_platform.as_deref(),
            Breakdown::Region => self.region.as_deref(),
        }
    }
}

/// A Page post or an Instagram media item. Both edges are read into the
/// same record; Instagram's field names are accepted as aliases.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct RawPost {
    pub id: String,
    #[serde(alias = "caption")]
    pub message: Option<String>,
    #[serde(alias = "timestamp")]
    pub created_time: Option<String>,
    pub media_type: Option<String>,
    #[serde(alias = "permalink_url")]
    pub permalink: Option<String>,
    #[serde(default)]
    pub insights: RawInsights,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RawInsights {
    #[serde(default)]
    pub data: Vec<RawMetricSeries>,
}

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    data: Vec<Value>,
    paging: Option<Paging>,
}

#[derive(Deserialize)]
struct Paging {
    next: Option<String>,
}

#[derive(Deserialize)]
struct GraphErrorBody {
    error: GraphErrorDetail,
}

#[derive(Deserialize)]
struct GraphErrorDetail {
    message: Option<String>,
    code: Option<i64>,
}

enum Method {
    Get,
    Post(Value),
}

enum Outcome {
    Success(String),
    Transient { status: Option<u16>, body: String },
    Permanent { status: u16, message: String },
}

/// Client for the Facebook Graph API.
///
/// Every request carries the access token and targets the configured API
/// version. Transient failures are retried here and nowhere else.
pub struct GraphClient<T: Transport = HttpTransport> {
    transport: T,
    base_url: Url,
    access_token: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl GraphClient<HttpTransport> {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let transport = HttpTransport::new(config.request_timeout())?;
        GraphClient::with_transport(config, transport)
    }
}

impl<T: Transport> GraphClient<T> {
    pub fn with_transport(config: &Config, transport: T) -> Result<Self, Error> {
        let access_token = config
            .access_token
            .clone()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| Error::Config {
                message: "a Facebook access token is required, set FACEBOOK_ACCESS_TOKEN or pass --access-token".to_string(),
            })?;

        let mut base_url = Url::parse(&config.graph_url)?;
        base_url
            .path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .push(&config.api_version);

        info!(
            "Initialized Graph API client with API version {}",
            config.api_version
        );

        Ok(GraphClient {
            transport,
            base_url,
            access_token,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        })
    }

    /// Issues a single GET and returns the decoded JSON body.
    pub async fn get(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Value, Error> {
        let url = self.endpoint_url(endpoint, params)?;
        self.send(url, Method::Get).await
    }

    /// Issues a single POST with `params` as the JSON body.
    pub async fn post(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Value, Error> {
        let url = self.endpoint_url(endpoint, &[])?;
        let body = params
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect::<serde_json::Map<_, _>>();
        self.send(url, Method::Post(Value::Object(body))).await
    }

    /// Lazily walks every page of a collection edge.
    ///
    /// Nothing is requested until the stream is polled, and the next page is
    /// only requested once the records of the current one have been consumed.
    /// Dropping the stream stops the walk. Calling this again starts over from
    /// the first page.
    pub fn fetch_paged<'a>(
        &'a self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> impl Stream<Item = Result<Value, Error>> + 'a {
        let first = self.endpoint_url(endpoint, params);

        stream::try_unfold(Some(first), move |next: Option<Result<Url, Error>>| async move {
            match next {
                None => Ok(None),
                Some(url) => self.fetch_page(url?).await.map(Some),
            }
        })
        .map_ok(|records: Vec<Value>| stream::iter(records.into_iter().map(Ok::<Value, Error>)))
        .try_flatten()
    }

    /// Collects every record of a paged edge.
    pub async fn fetch_all(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<Value>, Error> {
        let records: Vec<Value> = self.fetch_paged(endpoint, params).try_collect().await?;
        info!("Retrieved a total of {} items from {}", records.len(), endpoint);
        Ok(records)
    }

    async fn fetch_page(&self, url: Url) -> Result<(Vec<Value>, Option<Result<Url, Error>>), Error> {
        let endpoint = url.path().to_string();
        let page: Page = serde_json::from_value(self.send(url, Method::Get).await?)?;
        debug!("Retrieved {} items from {}", page.data.len(), endpoint);

        let next = page
            .paging
            .and_then(|paging| paging.next)
            .map(|next| self.authorize_next(&next));

        Ok((page.data, next))
    }

    fn endpoint_url(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .extend(endpoint.split('/').filter(|segment| !segment.is_empty()));

        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
            query.append_pair("access_token", &self.access_token);
        }

        Ok(url)
    }

    /// Pagination links come back with a token embedded; it is replaced with
    /// the configured one.
    fn authorize_next(&self, next: &str) -> Result<Url, Error> {
        let mut url = Url::parse(next)?;
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "access_token")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        url.query_pairs_mut()
            .clear()
            .extend_pairs(pairs)
            .append_pair("access_token", &self.access_token);

        Ok(url)
    }

    async fn send(&self, url: Url, method: Method) -> Result<Value, Error> {
        let endpoint = url.path().to_string();
        let mut attempt: u32 = 0;

        loop {
            debug!("Request to {} (attempt {}/{})", endpoint, attempt + 1, self.max_retries + 1);

            let exchange = match &method {
                Method::Get => self.transport.get(url.clone()).await,
                Method::Post(body) => self.transport.post(url.clone(), body.clone()).await,
            };

            let (status, body) = match classify(exchange)? {
                Outcome::Success(body) => return Ok(serde_json::from_str(&body)?),
                Outcome::Permanent { status, message } => {
                    return Err(Error::PermanentApi { status, message })
                }
                Outcome::Transient { status, body } => (status, body),
            };

            if attempt >= self.max_retries {
                warn!("Max retries ({}) reached for {}", self.max_retries, endpoint);
                return Err(Error::TransientApi {
                    status,
                    body,
                    attempts: attempt + 1,
                });
            }

            attempt += 1;
            warn!(
                "Transient failure for {} (status {:?}), retrying in {:?}",
                endpoint, status, self.retry_delay
            );
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

fn classify(exchange: Result<RawResponse, TransportError>) -> Result<Outcome, Error> {
    let resp = match exchange {
        Ok(resp) => resp,
        Err(err) if err.is_transient() => {
            return Ok(Outcome::Transient {
                status: None,
                body: err.to_string(),
            })
        }
        Err(err) => return Err(Error::Transport(err)),
    };

    if (200..300).contains(&resp.status) {
        return Ok(Outcome::Success(resp.body));
    }

    let detail = serde_json::from_str::<GraphErrorBody>(&resp.body)
        .ok()
        .map(|body| body.error);
    let rate_limited = detail
        .as_ref()
        .and_then(|d| d.code)
        .is_some_and(|code| RATE_LIMIT_CODES.contains(&code));

    if resp.status == 429 || resp.status >= 500 || rate_limited {
        return Ok(Outcome::Transient {
            status: Some(resp.status),
            body: resp.body,
        });
    }

    let message = detail
        .and_then(|d| d.message)
        .unwrap_or_else(|| resp.body.clone());

    Ok(Outcome::Permanent {
        status: resp.status,
        message,
    })
}

#[async_trait::async_trait]
impl<T: Transport> GraphApi for GraphClient<T> {
    async fn list_pages(&self) -> Result<Vec<PageRecord>, Error> {
        let records = self
            .fetch_all(
                "me/accounts",
                &[
                    ("fields", "id,name,category,instagram_business_account{id,username,name}"),
                    ("limit", PAGE_LIMIT),
                ],
            )
            .await?;

        records
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(Error::from))
            .collect()
    }

    async fn list_ad_accounts(&self) -> Result<Vec<AdAccountRecord>, Error> {
        let records = self
            .fetch_all(
                "me/adaccounts",
                &[("fields", "id,name,account_status"), ("limit", PAGE_LIMIT)],
            )
            .await?;

        records
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(Error::from))
            .collect()
    }

    async fn fetch_insights(
        &self,
        account_id: &str,
        metric_names: &[String],
        date_range: &DateRange,
    ) -> Result<Vec<RawMetricSeries>, Error> {
        let endpoint = format!("{}/insights", account_id);
        let metric = metric_names.join(",");
        let mut merged: Vec<RawMetricSeries> = vec![];

        // The insights edge only accepts short windows, so the range is
        // requested one calendar month at a time.
        for chunk in date_range.monthly_chunks() {
            let since = chunk.start().format("%Y-%m-%d").to_string();
            let until = chunk.end().format("%Y-%m-%d").to_string();

            let body = self
                .get(
                    &endpoint,
                    &[
                        ("metric", metric.as_str()),
                        ("period", "day"),
                        ("since", since.as_str()),
                        ("until", until.as_str()),
                    ],
                )
                .await?;
            let response: RawInsights = serde_json::from_value(body)?;

            for series in response.data {
                match merged.iter_mut().find(|s| s.name == series.name) {
                    Some(existing) => existing.values.extend(series.values),
                    None => merged.push(series),
                }
            }
        }

        debug!("Fetched {} metrics for account {}", merged.len(), account_id);
        Ok(merged)
    }

    async fn fetch_ad_insights(
        &self,
        ad_account_id: &str,
        date_range: &DateRange,
    ) -> Result<Vec<RawAdInsight>, Error> {
        let endpoint = format!("{}/insights", ad_account_id);
        let time_range = time_range_param(date_range);

        let records = self
            .fetch_all(
                &endpoint,
                &[
                    ("level", "campaign"),
                    ("fields", "campaign_id,campaign_name,spend,clicks,impressions,reach"),
                    ("time_range", time_range.as_str()),
                    ("time_increment", "1"),
                    ("limit", PAGE_LIMIT),
                ],
            )
            .await?;

        records
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(Error::from))
            .collect()
    }

    async fn fetch_ad_breakdown(
        &self,
        ad_account_id: &str,
        breakdown: Breakdown,
        date_range: &DateRange,
    ) -> Result<Vec<RawAdBreakdown>, Error> {
        let endpoint = format!("{}/insights", ad_account_id);
        let time_range = time_range_param(date_range);

        let records = self
            .fetch_all(
                &endpoint,
                &[
                    ("level", "account"),
                    ("fields", "spend,clicks,impressions,reach,cost_per_result"),
                    ("breakdowns", breakdown.api_name()),
                    ("time_range", time_range.as_str()),
                    ("limit", PAGE_LIMIT),
                ],
            )
            .await?;

        records
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(Error::from))
            .collect()
    }

    async fn fetch_posts(
        &self,
        account_id: &str,
        platform: Platform,
        date_range: &DateRange,
    ) -> Result<Vec<RawPost>, Error> {
        let insights = format!("insights.metric({})", platform.post_metrics().join(","));
        let (edge, fields) = match platform {
            Platform::FacebookPage => ("posts", format!("id,message,created_time,permalink_url,{}", insights)),
            Platform::InstagramBusiness => (
                "media",
                format!("id,caption,media_type,permalink,timestamp,{}", insights),
            ),
        };
        let since = date_range.start().format("%Y-%m-%d").to_string();
        let until = date_range.end().format("%Y-%m-%d").to_string();

        let records = self
            .fetch_all(
                &format!("{}/{}", account_id, edge),
                &[
                    ("fields", fields.as_str()),
                    ("since", since.as_str()),
                    ("until", until.as_str()),
                    ("limit", PAGE_LIMIT),
                ],
            )
            .await?;

        records
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(Error::from))
            .collect()
    }

    async fn fetch_lifetime_insights(
        &self,
        account_id: &str,
        metric_names: &[String],
    ) -> Result<Vec<RawMetricSeries>, Error> {
        let metric = metric_names.join(",");
        let body = self
            .get(
                &format!("{}/insights", account_id),
                &[("metric", metric.as_str()), ("period", "lifetime")],
            )
            .await?;
        let response: RawInsights = serde_json::from_value(body)?;
        Ok(response.data)
    }
}

/// `time_range` parameter of the ads insights edge, both bounds inclusive.
fn time_range_param(date_range: &DateRange) -> String {
    serde_json::json!({
        "since": date_range.start().format("%Y-%m-%d").to_string(),
        "until": date_range.end().format("%Y-%m-%d").to_string(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use chrono::NaiveDate;
    use futures::StreamExt;
    use serde_json::json;

    const BASE: &str = "https://graph.example.com";

    fn client(transport: MockTransport) -> GraphClient<MockTransport> {
        GraphClient::with_transport(&test_config(BASE), transport).unwrap()
    }

    fn ok(body: Value) -> Result<RawResponse, TransportError> {
        Ok(RawResponse {
            status: 200,
            body: body.to_string(),
        })
    }

    fn status(code: u16, body: &str) -> Result<RawResponse, TransportError> {
        Ok(RawResponse {
            status: code,
            body: body.to_string(),
        })
    }

    fn query_value(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    fn three_pages(url: Url) -> Result<RawResponse, TransportError> {
        let page = match query_value(&url, "after").as_deref() {
            None => json!({
                "data": [{"id": "1"}, {"id": "2"}],
                "paging": {"next": format!("{}/v18.0/me/accounts?after=p2&access_token=stale", BASE)}
            }),
            Some("p2") => json!({
                "data": [{"id": "3"}],
                "paging": {"next": format!("{}/v18.0/me/accounts?after=p3&access_token=stale", BASE)}
            }),
            Some("p3") => json!({
                "data": [{"id": "4"}, {"id": "5"}],
                "paging": {}
            }),
            Some(other) => panic!("unexpected cursor {}", other),
        };
        ok(page)
    }

    fn ids(records: &[Value]) -> Vec<&str> {
        records.iter().filter_map(|r| r["id"].as_str()).collect()
    }

    #[tokio::test]
    async fn test_fetch_paged_follows_every_cursor_in_order() {
        let mut transport = MockTransport::new();
        transport.expect_get().times(3).returning(three_pages);
        let client = client(transport);

        let records: Vec<Value> = client
            .fetch_paged("me/accounts", &[])
            .try_collect()
            .await
            .unwrap();

        assert_eq!(ids(&records), vec!["1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_fetch_paged_is_lazy() {
        let mut transport = MockTransport::new();
        transport.expect_get().times(1).returning(three_pages);
        let client = client(transport);

        let records: Vec<Value> = client
            .fetch_paged("me/accounts", &[])
            .take(2)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(ids(&records), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_fetch_paged_without_polling_sends_nothing() {
        let mut transport = MockTransport::new();
        transport.expect_get().times(0);
        let client = client(transport);

        let stream = client.fetch_paged("me/accounts", &[]);
        drop(stream);
    }

    #[tokio::test]
    async fn test_fetch_paged_restarts_from_first_page() {
        let mut transport = MockTransport::new();
        transport.expect_get().times(6).returning(three_pages);
        let client = client(transport);

        let first = client.fetch_all("me/accounts", &[]).await.unwrap();
        let second = client.fetch_all("me/accounts", &[]).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_every_request_carries_token_and_version() {
        let mut transport = MockTransport::new();
        transport.expect_get().times(3).returning(|url| {
            assert!(url.path().starts_with("/v18.0/me/accounts"), "{}", url);
            let tokens: Vec<_> = url
                .query_pairs()
                .filter(|(k, _)| k == "access_token")
                .map(|(_, v)| v.into_owned())
                .collect();
            assert_eq!(tokens, vec!["test_token".to_string()]);
            three_pages(url)
        });
        let client = client(transport);

        client.fetch_all("me/accounts", &[("fields", "id")]).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_with_fixed_delay() {
        let mut transport = MockTransport::new();
        let mut calls = 0;
        transport.expect_get().times(4).returning(move |_| {
            calls += 1;
            if calls <= 3 {
                status(500, "oops")
            } else {
                ok(json!({"id": "me"}))
            }
        });
        let client = client(transport);

        let started = tokio::time::Instant::now();
        let body = client.get("me", &[]).await.unwrap();
        let waited = started.elapsed();

        assert_eq!(body["id"], "me");
        let expected = Duration::from_secs(3 * 5);
        assert!(
            waited >= expected && waited < expected + Duration::from_millis(10),
            "waited {:?}",
            waited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_last_status() {
        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .times(4)
            .returning(|_| status(503, "unavailable"));
        let client = client(transport);

        let err = client.get("me", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::TransientApi { status: Some(503), ref body, attempts: 4 } if body == "unavailable"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limits_and_timeouts_are_transient() {
        let mut transport = MockTransport::new();
        let mut calls = 0;
        transport.expect_get().times(4).returning(move |_| {
            calls += 1;
            match calls {
                1 => status(429, ""),
                2 => Err(TransportError::Timeout("deadline elapsed".to_string())),
                3 => status(
                    400,
                    r#"{"error": {"message": "User request limit reached", "code": 17}}"#,
                ),
                _ => ok(json!({"data": []})),
            }
        });
        let client = client(transport);

        assert!(client.get("me/accounts", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_client_errors_fail_without_retry() {
        let mut transport = MockTransport::new();
        transport.expect_get().times(1).returning(|_| {
            status(
                400,
                r#"{"error": {"message": "Invalid OAuth access token.", "code": 190}}"#,
            )
        });
        let client = client(transport);

        let err = client.get("me", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::PermanentApi { status: 400, ref message } if message == "Invalid OAuth access token."
        ));
    }

    #[tokio::test]
    async fn test_non_transient_transport_error_is_not_retried() {
        let mut transport = MockTransport::new();
        transport
            .expect_get()
            .times(1)
            .returning(|_| Err(TransportError::Other("bad request builder".to_string())));
        let client = client(transport);

        let err = client.get("me", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Other(_))));
    }

    #[tokio::test]
    async fn test_post_sends_params_as_json_body() {
        let mut transport = MockTransport::new();
        transport.expect_post().times(1).returning(|url, body| {
            assert_eq!(url.path(), "/v18.0/123/feed");
            assert_eq!(body, json!({"message": "hello"}));
            ok(json!({"id": "123_456"}))
        });
        let client = client(transport);

        let body = client.post("123/feed", &[("message", "hello")]).await.unwrap();
        assert_eq!(body["id"], "123_456");
    }

    #[tokio::test]
    async fn test_fetch_insights_requests_one_window_per_month() {
        let mut transport = MockTransport::new();
        transport.expect_get().times(2).returning(|url| {
            assert_eq!(url.path(), "/v18.0/42/insights");
            assert_eq!(query_value(&url, "period").as_deref(), Some("day"));
            assert_eq!(
                query_value(&url, "metric").as_deref(),
                Some("page_impressions,page_fans")
            );
            let since = query_value(&url, "since").unwrap();
            let end_time = format!("{}T08:00:00+0000", since);
            ok(json!({
                "data": [
                    {"name": "page_impressions", "values": [{"value": 10, "end_time": end_time}]},
                    {"name": "page_fans", "values": [{"value": 3, "end_time": end_time}]}
                ]
            }))
        });
        let client = client(transport);

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 20).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
        )
        .unwrap();
        let metrics = vec!["page_impressions".to_string(), "page_fans".to_string()];
        let series = client.fetch_insights("42", &metrics, &range).await.unwrap();

        assert_eq!(series.len(), 2);
        assert_eq!(series[0].name, "page_impressions");
        let end_times: Vec<_> = series[0]
            .values
            .iter()
            .map(|v| v.end_time.clone().unwrap())
            .collect();
        assert_eq!(
            end_times,
            vec!["2024-01-20T08:00:00+0000", "2024-02-01T08:00:00+0000"]
        );
    }

    #[tokio::test]
    async fn test_list_pages_parses_linked_instagram_accounts() {
        let mut transport = MockTransport::new();
        transport.expect_get().times(1).returning(|_| {
            ok(json!({
                "data": [
                    {"id": "1", "name": "Bakery", "category": "Food",
                     "instagram_business_account": {"id": "17841", "username": "bakery"}},
                    {"id": "2", "name": "Blog"}
                ]
            }))
        });
        let client = client(transport);

        let pages = client.list_pages().await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(
            pages[0].instagram_business_account.as_ref().map(|ig| ig.id.as_str()),
            Some("17841")
        );
        assert!(pages[1].instagram_business_account.is_none());
    }

    fn january() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_posts_reads_instagram_media_fields() {
        let mut transport = MockTransport::new();
        transport.expect_get().times(1).returning(|url| {
            assert_eq!(url.path(), "/v18.0/17841/media");
            let fields = query_value(&url, "fields").unwrap();
            assert!(fields.contains("caption"), "{}", fields);
            assert!(fields.ends_with("insights.metric(impressions,reach,engagement)"));
            assert_eq!(query_value(&url, "since").as_deref(), Some("2024-01-01"));
            assert_eq!(query_value(&url, "until").as_deref(), Some("2024-01-31"));
            ok(json!({
                "data": [{
                    "id": "m1",
                    "caption": "Fresh bread",
                    "media_type": "IMAGE",
                    "permalink": "https://instagram.com/p/m1",
                    "timestamp": "2024-01-05T10:00:00+0000",
                    "insights": {"data": [{"name": "impressions", "values": [{"value": 900}]}]}
                }]
            }))
        });
        let client = client(transport);

        let posts = client
            .fetch_posts("17841", Platform::InstagramBusiness, &january())
            .await
            .unwrap();

        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].message.as_deref(), Some("Fresh bread"));
        assert_eq!(posts[0].created_time.as_deref(), Some("2024-01-05T10:00:00+0000"));
        assert_eq!(posts[0].permalink.as_deref(), Some("https://instagram.com/p/m1"));
        assert_eq!(posts[0].insights.data[0].name, "impressions");
    }

    #[tokio::test]
    async fn test_fetch_posts_uses_page_posts_edge() {
        let mut transport = MockTransport::new();
        transport.expect_get().times(1).returning(|url| {
            assert_eq!(url.path(), "/v18.0/1001/posts");
            assert!(query_value(&url, "fields")
                .unwrap()
                .contains("post_reactions_by_type_total"));
            ok(json!({"data": [{"id": "1001_1", "message": "Hi", "created_time": "2024-01-02T08:00:00+0000"}]}))
        });
        let client = client(transport);

        let posts = client
            .fetch_posts("1001", Platform::FacebookPage, &january())
            .await
            .unwrap();
        assert_eq!(posts[0].id, "1001_1");
        assert!(posts[0].insights.data.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_ad_breakdown_requests_one_dimension() {
        let mut transport = MockTransport::new();
        transport.expect_get().times(1).returning(|url| {
            assert_eq!(url.path(), "/v18.0/act_9/insights");
            assert_eq!(query_value(&url, "breakdowns").as_deref(), Some("device_platform"));
            assert_eq!(query_value(&url, "level").as_deref(), Some("account"));
            assert_eq!(
                query_value(&url, "time_range").as_deref(),
                Some(r#"{"since":"2024-01-01","until":"2024-01-31"}"#)
            );
            ok(json!({
                "data": [
                    {"spend": "10.5", "impressions": "300", "device_platform": "mobile_app"},
                    {"spend": "2", "device_platform": "desktop"}
                ]
            }))
        });
        let client = client(transport);

        let rows = client
            .fetch_ad_breakdown("act_9", Breakdown::DevicePlatform, &january())
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].segment(Breakdown::DevicePlatform), Some("mobile_app"));
        assert_eq!(rows[0].segment(Breakdown::Age), None);
        assert_eq!(rows[1].cost_per_result, Value::Null);
    }

    #[tokio::test]
    async fn test_fetch_lifetime_insights() {
        let mut transport = MockTransport::new();
        transport.expect_get().times(1).returning(|url| {
            assert_eq!(url.path(), "/v18.0/1001/insights");
            assert_eq!(query_value(&url, "period").as_deref(), Some("lifetime"));
            assert_eq!(
                query_value(&url, "metric").as_deref(),
                Some("page_fans_gender_age,page_fans_country")
            );
            ok(json!({
                "data": [{"name": "page_fans_country", "values": [{"value": {"US": 10, "DE": 2}}]}]
            }))
        });
        let client = client(transport);

        let metrics: Vec<String> = Platform::FacebookPage
            .demographic_metrics()
            .iter()
            .map(|m| m.to_string())
            .collect();
        let series = client.fetch_lifetime_insights("1001", &metrics).await.unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].values[0].value["US"], 10);
    }

    #[test]
    fn test_invalid_graph_url() {
        let err = GraphClient::with_transport(&test_config("invalid_url"), MockTransport::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::UrlParsingFailed(_)));
    }

    #[test]
    fn test_missing_token_is_a_config_error() {
        let mut config = test_config(BASE);
        config.access_token = None;
        let err = GraphClient::with_transport(&config, MockTransport::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config { .. }));
    }
}
