// Integration tests for host-based routing through a live proxy
mod common;

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use axum::{
        Router,
        body::Body,
        extract::Request,
        http::{StatusCode, header},
        response::Response,
    };
    use reqwest::header::HOST;

    use crate::common::{TestProxy, http_client, spawn_backend};

    /// Backend that reports what it received through response headers.
    fn echo_backend(name: &'static str, hits: Arc<AtomicUsize>) -> Router {
        Router::new().fallback(move |req: Request| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let seen = |h: &str| {
                    req.headers()
                        .get(h)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string()
                };
                Response::builder()
                    .header("x-backend", name)
                    .header("x-seen-uri", req.uri().to_string())
                    .header("x-seen-host", seen("host"))
                    .header("x-seen-forwarded-host", seen("x-forwarded-host"))
                    .header("x-seen-forwarded-for", seen("x-forwarded-for"))
                    .header("x-seen-forwarded-proto", seen("x-forwarded-proto"))
                    .body(Body::from(format!("hello from {name}")))
                    .unwrap()
            }
        })
    }

    fn header<'a>(resp: &'a reqwest::Response, name: &str) -> &'a str {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exact_host_and_wildcard_fallback() {
        let a_hits = Arc::new(AtomicUsize::new(0));
        let default_hits = Arc::new(AtomicUsize::new(0));
        let a = spawn_backend(echo_backend("a", a_hits.clone())).await;
        let fallback = spawn_backend(echo_backend("default", default_hits.clone())).await;

        let proxy = TestProxy::start(&[
            ("a.example.com", format!("http://{a}")),
            ("*", format!("http://{fallback}")),
        ])
        .await;
        let client = http_client();

        let resp = client
            .get(proxy.url("/"))
            .header(HOST, "a.example.com")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header(&resp, "x-backend"), "a");

        let resp = client
            .get(proxy.url("/"))
            .header(HOST, "unknown.example.com")
            .send()
            .await
            .unwrap();
        assert_eq!(header(&resp, "x-backend"), "default");

        // case and port do not matter
        let resp = client
            .get(proxy.url("/"))
            .header(HOST, "A.EXAMPLE.COM:8080")
            .send()
            .await
            .unwrap();
        assert_eq!(header(&resp, "x-backend"), "a");

        assert_eq!(a_hits.load(Ordering::SeqCst), 2);
        assert_eq!(default_hits.load(Ordering::SeqCst), 1);
        proxy.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unmatched_host_is_404_without_backend_contact() {
        let hits = Arc::new(AtomicUsize::new(0));
        let a = spawn_backend(echo_backend("a", hits.clone())).await;
        let proxy = TestProxy::start(&[("a.example.com", format!("http://{a}"))]).await;

        let resp = http_client()
            .get(proxy.url("/anything"))
            .header(HOST, "b.example.com")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let entries = proxy.wait_for_entries(1).await;
        assert_eq!(entries[0].status, StatusCode::NOT_FOUND);
        assert_eq!(entries[0].host, "b.example.com");
        proxy.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forwarding_rewrites_target_and_headers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let a = spawn_backend(echo_backend("a", hits)).await;
        let proxy = TestProxy::start(&[("a.example.com", format!("http://{a}/api"))]).await;

        let resp = http_client()
            .get(proxy.url("/foo?x=1"))
            .header(HOST, "a.example.com")
            .header("x-forwarded-for", "192.0.2.7")
            .header(header::CONNECTION, "keep-alive")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header(&resp, "x-seen-uri"), "/api/foo?x=1");
        assert_eq!(header(&resp, "x-seen-host"), a.to_string());
        assert_eq!(header(&resp, "x-seen-forwarded-host"), "a.example.com");
        assert_eq!(
            header(&resp, "x-seen-forwarded-for"),
            "192.0.2.7, 127.0.0.1"
        );
        assert_eq!(header(&resp, "x-seen-forwarded-proto"), "http");

        let body = resp.text().await.unwrap();
        assert_eq!(body, "hello from a");

        let entries = proxy.wait_for_entries(1).await;
        let entry = &entries[0];
        assert_eq!(entry.status, StatusCode::OK);
        assert_eq!(entry.bytes, body.len() as u64);
        assert_eq!(entry.method, reqwest::Method::GET);
        assert_eq!(entry.scheme, "http");
        assert_eq!(entry.host, "a.example.com");
        assert_eq!(entry.path, "/foo");
        proxy.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_backend_status_is_recorded() {
        let backend = spawn_backend(Router::new().fallback(|| async {
            (StatusCode::IM_A_TEAPOT, "short and stout")
        }))
        .await;
        let proxy = TestProxy::start(&[("*", format!("http://{backend}"))]).await;

        let resp = http_client().get(proxy.url("/tea")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(resp.text().await.unwrap(), "short and stout");

        let entries = proxy.wait_for_entries(1).await;
        assert_eq!(entries[0].status, StatusCode::IM_A_TEAPOT);
        assert_eq!(entries[0].bytes, "short and stout".len() as u64);
        proxy.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_hosts_are_independent() {
        let a = spawn_backend(Router::new().fallback(|| async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            (StatusCode::OK, "a".repeat(100))
        }))
        .await;
        let b = spawn_backend(Router::new().fallback(|| async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            (StatusCode::CREATED, "b".repeat(7))
        }))
        .await;
        let proxy = TestProxy::start(&[
            ("a.example.com", format!("http://{a}")),
            ("b.example.com", format!("http://{b}")),
        ])
        .await;
        let client = http_client();

        let requests = (0..20).map(|i| {
            let host = if i % 2 == 0 { "a.example.com" } else { "b.example.com" };
            let req = client.get(proxy.url("/")).header(HOST, host).send();
            async move {
                let resp = req.await.unwrap();
                (host, resp.status(), resp.text().await.unwrap())
            }
        });
        let results = futures_util::future::join_all(requests).await;

        for (host, status, body) in results {
            match host {
                "a.example.com" => {
                    assert_eq!(status, StatusCode::OK);
                    assert_eq!(body, "a".repeat(100));
                }
                _ => {
                    assert_eq!(status, StatusCode::CREATED);
                    assert_eq!(body, "b".repeat(7));
                }
            }
        }

        let entries = proxy.wait_for_entries(20).await;
        assert_eq!(entries.len(), 20);
        for entry in entries {
            match entry.host.as_str() {
                "a.example.com" => {
                    assert_eq!(entry.status, StatusCode::OK);
                    assert_eq!(entry.bytes, 100);
                }
                "b.example.com" => {
                    assert_eq!(entry.status, StatusCode::CREATED);
                    assert_eq!(entry.bytes, 7);
                }
                other => panic!("unexpected host {other}"),
            }
        }
        proxy.stop().await.unwrap();
    }
}
