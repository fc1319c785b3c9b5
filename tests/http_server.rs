//! HTTP routing and dispatch tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use hyper::header::{HeaderName, HeaderValue};
use hyper::StatusCode;
use reactive_net::http::X_REQUEST_ID;
use reactive_net::{HttpChannel, HttpServer, NetError};

mod common;

async fn ok(channel: HttpChannel, body: &'static str) -> reactive_net::Result<()> {
    channel.send_string(body).await
}

#[tokio::test]
async fn path_parameters_are_captured() {
    let server = HttpServer::new(common::options()).get("/users/{id}/posts/{post}", |ch: HttpChannel| async move {
        let reply = format!("{}:{}", ch.param("id").unwrap_or("?"), ch.param("post").unwrap_or("?"));
        ch.send_string(reply).await
    });
    let addr = server.start().await.unwrap();

    let res = common::client()
        .get(format!("http://{addr}/users/7/posts/42?ignored=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "7:42");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn unmatched_request_is_404_without_invoking_handlers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let server = HttpServer::new(common::options()).get("/known", move |ch: HttpChannel| {
        counter.fetch_add(1, Ordering::SeqCst);
        ok(ch, "known")
    });
    let addr = server.start().await.unwrap();

    let res = common::client()
        .get(format!("http://{addr}/unknown"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn matching_handlers_run_in_registration_order() {
    let server = HttpServer::new(common::options())
        .get("/multi", |ch: HttpChannel| ok(ch, "A"))
        .post("/multi", |ch: HttpChannel| ok(ch, "never"))
        .route(reactive_net::routing::PrefixPredicate::new(None, "/"), |ch: HttpChannel| ok(ch, "B"))
        .get("/{name}", |ch: HttpChannel| ok(ch, "C"));
    let addr = server.start().await.unwrap();

    let body = common::client()
        .get(format!("http://{addr}/multi"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ABC");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn last_status_write_before_flush_wins() {
    let server = HttpServer::new(common::options())
        .get("/status", |ch: HttpChannel| async move {
            ch.set_status(StatusCode::CREATED)?;
            ch.set_header(HeaderName::from_static("x-first"), HeaderValue::from_static("1"))
        })
        .get("/status", |ch: HttpChannel| async move {
            ch.set_status(StatusCode::ACCEPTED)?;
            ch.send_string("done").await?;
            // Flushed: further changes are refused.
            assert!(matches!(ch.set_status(StatusCode::OK), Err(NetError::HeadersSent)));
            Ok(())
        });
    let addr = server.start().await.unwrap();

    let res = common::client()
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 202);
    assert_eq!(res.headers()["x-first"], "1");
    assert_eq!(res.text().await.unwrap(), "done");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn default_handler_serves_unmatched_requests() {
    let server = HttpServer::new(common::options())
        .get("/a", |ch: HttpChannel| ok(ch, "a"))
        .default_handler(|ch: HttpChannel| async move {
            ch.set_status(StatusCode::IM_A_TEAPOT)?;
            ch.send_string(format!("fallback {}", ch.path())).await
        });
    let addr = server.start().await.unwrap();

    let res = common::client()
        .get(format!("http://{addr}/b"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 418);
    assert_eq!(res.text().await.unwrap(), "fallback /b");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn not_found_falls_through_to_the_next_route() {
    let server = HttpServer::new(common::options())
        .get("/maybe", |_ch: HttpChannel| async move { Err(NetError::NotFound("first".into())) })
        .get("/maybe", |ch: HttpChannel| ok(ch, "second"))
        .get("/never", |_ch: HttpChannel| async move { Err(NetError::NotFound("only".into())) });
    let addr = server.start().await.unwrap();
    let client = common::client();

    let res = client.get(format!("http://{addr}/maybe")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "second");

    let res = client.get(format!("http://{addr}/never")).send().await.unwrap();
    assert_eq!(res.status(), 404);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn handler_failures_become_500() {
    let server = HttpServer::new(common::options())
        .get("/error", |_ch: HttpChannel| async move { Err(NetError::handler("boom")) })
        .get("/panic", |_ch: HttpChannel| async move {
            if true {
                panic!("handler bug");
            }
            Ok(())
        });
    let addr = server.start().await.unwrap();
    let client = common::client();

    let res = client.get(format!("http://{addr}/error")).send().await.unwrap();
    assert_eq!(res.status(), 500);
    let res = client.get(format!("http://{addr}/panic")).send().await.unwrap();
    assert_eq!(res.status(), 500);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn request_body_is_streamed_to_the_handler() {
    let server = HttpServer::new(common::options()).post("/echo", |ch: HttpChannel| async move {
        let mut body = ch.receive()?;
        let mut total = Vec::new();
        while let Some(chunk) = body.next().await {
            total.extend_from_slice(&chunk?);
        }
        ch.send(total).await
    });
    let addr = server.start().await.unwrap();

    let payload = "x".repeat(100_000);
    let res = common::client()
        .post(format!("http://{addr}/echo"))
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), payload);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn request_id_is_echoed() {
    let server = HttpServer::new(common::options()).get("/id", |ch: HttpChannel| async move {
        ch.send_string(ch.id().to_string()).await
    });
    let addr = server.start().await.unwrap();

    let id = uuid::Uuid::new_v4().to_string();
    let res = common::client()
        .get(format!("http://{addr}/id"))
        .header(X_REQUEST_ID, &id)
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers()[X_REQUEST_ID], id.as_str());
    assert_eq!(res.text().await.unwrap(), id);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn directory_serves_files_below_the_root() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("readme.txt"), "hello from disk").unwrap();
    std::fs::create_dir(root.path().join("docs")).unwrap();
    std::fs::write(root.path().join("docs").join("a.json"), "{}").unwrap();

    let server = HttpServer::new(common::options()).directory("/files", root.path());
    let addr = server.start().await.unwrap();
    let client = common::client();

    let res = client.get(format!("http://{addr}/files/readme.txt")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-type"], "text/plain; charset=utf-8");
    assert_eq!(res.text().await.unwrap(), "hello from disk");

    let res = client.get(format!("http://{addr}/files/docs/a.json")).send().await.unwrap();
    assert_eq!(res.headers()["content-type"], "application/json");

    let res = client.get(format!("http://{addr}/files/missing.txt")).send().await.unwrap();
    assert_eq!(res.status(), 404);

    let raw = common::raw_exchange(
        addr,
        "GET /files/../secret HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        Duration::from_secs(5),
    )
    .await;
    assert!(raw.starts_with("HTTP/1.1 404"), "got {raw}");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_file_falls_through_to_a_later_route() {
    let root = tempfile::tempdir().unwrap();
    let server = HttpServer::new(common::options())
        .directory("/files", root.path())
        .get("/files/{name}", |ch: HttpChannel| ok(ch, "generated"));
    let addr = server.start().await.unwrap();

    let res = common::client()
        .get(format!("http://{addr}/files/report"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "generated");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn upgrade_after_flush_fails() {
    let outcome = Arc::new(std::sync::Mutex::new(None));
    let seen = Arc::clone(&outcome);
    let server = HttpServer::new(common::options()).get("/late", move |ch: HttpChannel| {
        let seen = Arc::clone(&seen);
        async move {
            ch.send_string("plain").await?;
            let result = ch.upgrade_websocket(None).await;
            *seen.lock().unwrap() = Some(matches!(result, Err(NetError::Upgrade(_))));
            Ok(())
        }
    });
    let addr = server.start().await.unwrap();

    let res = common::client()
        .get(format!("http://{addr}/late"))
        .header("upgrade", "websocket")
        .header("connection", "upgrade")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "plain");
    assert_eq!(*outcome.lock().unwrap(), Some(true));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn multipart_upload_is_decoded_part_by_part() {
    let server = HttpServer::new(common::options()).post("/upload", |ch: HttpChannel| async move {
        let mut multipart = ch.receive_multipart()?;
        let mut summary = Vec::new();
        while let Some(part) = multipart.next_part().await? {
            let name = part.name().unwrap_or("?").to_string();
            let file = part.filename().map(str::to_string);
            let body = part.bytes().await?;
            summary.push(format!("{name}={}{}", String::from_utf8_lossy(&body), file.map(|f| format!("@{f}")).unwrap_or_default()));
        }
        ch.send_string(summary.join(",")).await
    });
    let addr = server.start().await.unwrap();

    let body = "--xyz\r\n\
        Content-Disposition: form-data; name=\"title\"\r\n\r\n\
        hello\r\n\
        --xyz\r\n\
        Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        line one\r\nline two\r\n\
        --xyz--\r\n";
    let res = common::client()
        .post(format!("http://{addr}/upload"))
        .header("content-type", "multipart/form-data; boundary=xyz")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "title=hello,doc=line one\r\nline two@a.txt");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn multipart_without_boundary_fails_before_any_part() {
    let server = HttpServer::new(common::options()).post("/upload", |ch: HttpChannel| async move {
        match ch.receive_multipart() {
            Err(NetError::Decode(_)) => {
                ch.set_status(StatusCode::BAD_REQUEST)?;
                ch.send_string("no boundary").await
            }
            other => Err(NetError::handler(format!("unexpected {other:?}"))),
        }
    });
    let addr = server.start().await.unwrap();

    let res = common::client()
        .post(format!("http://{addr}/upload"))
        .header("content-type", "text/plain")
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);

    server.shutdown().await.unwrap();
}
