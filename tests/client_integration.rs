use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    Router,
};
use pos_link::{ApiClient, ClientError, ClientOptions, Request, RetryPolicy};
use serde_json::{json, Value as JsonValue};

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    body: String,
    content_type: &'static str,
    delay: Duration,
}

impl MockResponse {
    fn json(status: StatusCode, body: JsonValue) -> Self {
        Self {
            status,
            body: body.to_string(),
            content_type: "application/json",
            delay: Duration::from_millis(0),
        }
    }

    fn text(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: body.to_owned(),
            content_type: "text/plain",
            delay: Duration::from_millis(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct Recorded {
    method: Method,
    path: String,
    content_type: Option<String>,
    body: String,
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    recorded: Arc<Mutex<Vec<Recorded>>>,
    arrivals: Arc<Mutex<Vec<Instant>>>,
    hits: Arc<AtomicUsize>,
}

async fn api_handler(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    state
        .arrivals
        .lock()
        .expect("arrivals mutex must not be poisoned")
        .push(Instant::now());
    state.hits.fetch_add(1, Ordering::SeqCst);
    state
        .recorded
        .lock()
        .expect("recorded mutex must not be poisoned")
        .push(Recorded {
            method,
            path: uri
                .path_and_query()
                .map(|pq| pq.as_str().to_owned())
                .unwrap_or_default(),
            content_type: headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned),
            body,
        });

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| {
            MockResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"detail": "no mock response available"}),
            )
        })
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    (
        response.status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Vec<Recorded>>>,
    arrivals: Arc<Mutex<Vec<Instant>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn api_url(&self) -> String {
        format!("{}/api/", self.base_url)
    }

    fn recorded(&self) -> Vec<Recorded> {
        self.recorded
            .lock()
            .expect("recorded mutex must not be poisoned")
            .clone()
    }

    /// Time between consecutive requests reaching the server.
    fn gaps(&self) -> Vec<Duration> {
        let arrivals = self
            .arrivals
            .lock()
            .expect("arrivals mutex must not be poisoned");
        arrivals
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect()
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        recorded: Arc::new(Mutex::new(Vec::new())),
        arrivals: Arc::new(Mutex::new(Vec::new())),
        hits: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .fallback(api_handler)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        recorded: state.recorded,
        arrivals: state.arrivals,
        task,
    }
}

fn fast_policy(max_attempts: usize) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_initial_delay(Duration::from_millis(1))
}

fn client(server: &TestServer, timeout: Duration) -> ApiClient {
    ApiClient::new(server.api_url()).with_options(ClientOptions {
        timeout,
        retry: fast_policy(3),
    })
}

fn order_body(id: i64, status: &str) -> JsonValue {
    json!({
        "id": id,
        "table_id": null,
        "payment_number": "0007",
        "status": status,
        "total_price": 900.0,
        "created_at": "2024-05-01T12:00:00",
        "order_items": []
    })
}

#[tokio::test]
async fn get_returns_parsed_json_body() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::OK,
        json!([{"id": 1, "name": "Ramen", "price": 600.0}]),
    )])
    .await;
    let api = client(&server, Duration::from_secs(1));

    let value = api
        .request(&Request::get("menus/"), &fast_policy(3))
        .await
        .expect("request must succeed");

    assert_eq!(value[0]["name"], "Ramen");
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    assert_eq!(server.recorded()[0].path, "/api/menus/");
}

#[tokio::test]
async fn patch_sends_json_body_with_content_type() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::OK,
        order_body(5, "preparing"),
    )])
    .await;
    let api = client(&server, Duration::from_secs(1));

    let order = api
        .update_order_status(5, "preparing")
        .await
        .expect("status update must succeed");

    assert_eq!(order.id, 5);
    assert_eq!(order.status, "preparing");

    let recorded = server.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].method, Method::PATCH);
    assert_eq!(recorded[0].path, "/api/orders/5");
    assert_eq!(
        recorded[0].content_type.as_deref(),
        Some("application/json")
    );
    let body: JsonValue = serde_json::from_str(&recorded[0].body).expect("body must be JSON");
    assert_eq!(body, json!({"status": "preparing"}));
}

#[tokio::test]
async fn client_error_status_fails_without_retry() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::NOT_FOUND, json!({"detail": "Order not found"})),
        MockResponse::json(StatusCode::OK, order_body(9, "pending")),
    ])
    .await;
    let api = client(&server, Duration::from_secs(1));

    let err = api
        .request(&Request::get("orders/by_payment_number/9999"), &fast_policy(3))
        .await
        .expect_err("404 must fail");

    match err {
        ClientError::Http {
            status,
            message,
            detail,
        } => {
            assert_eq!(status, 404);
            assert_eq!(message, "Order not found");
            assert_eq!(detail, Some(json!({"detail": "Order not found"})));
        }
        other => panic!("expected http error, got {other:?}"),
    }
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_error_with_non_json_body_uses_generic_message() {
    let server = spawn_server(vec![MockResponse::text(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal Server Error",
    )])
    .await;
    let api = client(&server, Duration::from_secs(1));

    let err = api
        .request(&Request::get("orders/"), &fast_policy(3))
        .await
        .expect_err("500 must fail");

    match err {
        ClientError::Http {
            status,
            message,
            detail,
        } => {
            assert_eq!(status, 500);
            assert_eq!(message, "HTTP 500");
            assert!(detail.is_none());
        }
        other => panic!("expected http error, got {other:?}"),
    }
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timeouts_are_retried_exactly_max_attempts_times() {
    let slow = MockResponse::json(StatusCode::OK, json!([])).with_delay(Duration::from_millis(300));
    let server = spawn_server(vec![slow.clone(), slow.clone(), slow.clone(), slow]).await;
    let api = client(&server, Duration::from_millis(30));

    let err = api
        .request(&Request::get("orders/"), &fast_policy(3))
        .await
        .expect_err("every attempt must time out");

    assert!(err.is_retryable());
    match err {
        ClientError::Transport(inner) => assert!(inner.is_timeout()),
        other => panic!("expected transport timeout, got {other:?}"),
    }
    assert_eq!(server.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn transport_failure_recovers_on_next_attempt() {
    let server = spawn_server(vec![
        MockResponse::json(StatusCode::OK, json!([])).with_delay(Duration::from_millis(300)),
        MockResponse::json(StatusCode::OK, json!(["general", "drinks"])),
    ])
    .await;
    let api = client(&server, Duration::from_millis(30));

    let categories = api
        .list_menu_categories()
        .await
        .expect("second attempt must succeed");

    assert_eq!(categories, vec!["general".to_owned(), "drinks".to_owned()]);
    assert_eq!(server.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn connection_refused_surfaces_last_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind probe listener");
    let address = listener.local_addr().expect("must have local addr");
    drop(listener);

    let api = ApiClient::new(format!("http://{address}/api"));
    let err = api
        .request(&Request::get("orders/"), &fast_policy(2))
        .await
        .expect_err("nothing is listening");

    assert!(err.is_retryable());
    match err {
        ClientError::Transport(inner) => assert!(inner.is_connect()),
        other => panic!("expected transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn opted_in_status_is_retried_with_growing_delays() {
    let unavailable = MockResponse::json(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"detail": "kitchen printer offline"}),
    );
    let server = spawn_server(vec![
        unavailable.clone(),
        unavailable.clone(),
        unavailable,
        MockResponse::json(StatusCode::OK, order_body(5, "preparing")),
    ])
    .await;
    let api = client(&server, Duration::from_secs(1));
    let policy = RetryPolicy::default()
        .with_max_attempts(3)
        .with_initial_delay(Duration::from_millis(40))
        .with_backoff_multiplier(2.0)
        .retry_on_statuses([503]);
    let req = Request::patch("orders/5")
        .json(&json!({"status": "preparing"}))
        .expect("body must serialize");

    let err = api
        .request(&req, &policy)
        .await
        .expect_err("three 503s exhaust three attempts");

    assert_eq!(err.status(), Some(503));
    assert_eq!(server.hits.load(Ordering::SeqCst), 3);

    let gaps = server.gaps();
    assert_eq!(gaps.len(), 2);
    assert!(
        gaps[0] >= Duration::from_millis(40) && gaps[0] < Duration::from_millis(80),
        "first retry must wait the initial delay, waited {:?}",
        gaps[0]
    );
    assert!(
        gaps[1] >= Duration::from_millis(80) && gaps[1] < Duration::from_millis(160),
        "second retry must wait twice the initial delay, waited {:?}",
        gaps[1]
    );
}

#[tokio::test]
async fn timed_out_attempts_back_off_by_attempt_index() {
    let slow = MockResponse::json(StatusCode::OK, json!([])).with_delay(Duration::from_millis(500));
    let server = spawn_server(vec![slow.clone(), slow.clone(), slow]).await;
    let api = client(&server, Duration::from_millis(20));
    let policy = RetryPolicy::default()
        .with_max_attempts(3)
        .with_initial_delay(Duration::from_millis(100))
        .with_backoff_multiplier(2.0);

    let err = api
        .request(&Request::get("orders/"), &policy)
        .await
        .expect_err("every attempt must time out");
    assert!(err.is_retryable());

    // each gap is the 20ms attempt timeout plus the backoff delay
    let gaps = server.gaps();
    assert_eq!(gaps.len(), 2);
    assert!(
        gaps[0] >= Duration::from_millis(100) && gaps[0] < Duration::from_millis(200),
        "first retry must wait about 100ms, waited {:?}",
        gaps[0]
    );
    assert!(
        gaps[1] >= Duration::from_millis(200) && gaps[1] < Duration::from_millis(400),
        "second retry must wait about 200ms, waited {:?}",
        gaps[1]
    );
}

#[tokio::test]
async fn status_errors_raised_by_reqwest_are_not_retryable() {
    let server = spawn_server(vec![MockResponse::text(StatusCode::BAD_GATEWAY, "down")]).await;

    let status_err = reqwest::get(server.api_url())
        .await
        .expect("mock server must answer")
        .error_for_status()
        .expect_err("502 must become a status error");
    assert!(status_err.is_status());

    assert!(!ClientError::Transport(status_err).is_retryable());
    assert!(!ClientError::Decode("bad body".to_owned()).is_retryable());
    assert!(!ClientError::InvalidRequest("bad url".to_owned()).is_retryable());
}

#[tokio::test]
async fn empty_success_body_returns_null() {
    let server = spawn_server(vec![MockResponse::text(StatusCode::OK, "")]).await;
    let api = client(&server, Duration::from_secs(1));

    let value = api
        .request(&Request::delete("orders/5"), &fast_policy(1))
        .await
        .expect("empty body must succeed");

    assert_eq!(value, JsonValue::Null);
}

#[tokio::test]
async fn invalid_success_json_is_decode_error() {
    let server = spawn_server(vec![MockResponse::text(StatusCode::OK, "<html></html>")]).await;
    let api = client(&server, Duration::from_secs(1));

    let err = api
        .request(&Request::get("menus/"), &fast_policy(3))
        .await
        .expect_err("html must not decode");

    assert!(matches!(err, ClientError::Decode(_)));
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sales_by_time_passes_query_string() {
    let server = spawn_server(vec![MockResponse::json(
        StatusCode::OK,
        json!([{"time_slot": "12:00", "total": 4200.0}]),
    )])
    .await;
    let api = client(&server, Duration::from_secs(1));

    let slots = api
        .sales_by_time("2024-05-01", "2024-05-01")
        .await
        .expect("sales query must succeed");

    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].time_slot, "12:00");
    assert_eq!(
        server.recorded()[0].path,
        "/api/orders/sales/by-time?start=2024-05-01&end=2024-05-01"
    );
}
