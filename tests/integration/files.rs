use crate::*;

const FAST: f64 = 10_000_000.0;

#[tokio::test]
async fn serves_files_with_content_type() {
    let server = start_server(
        FAST,
        &[
            ("webpages/index.html", &b"<html><body>coffee</body></html>"[..]),
            ("webpages/style.css", &b"body { color: brown; }"[..]),
            ("bag dance/default.png", &[0x89, b'P', b'N', b'G'][..]),
        ],
    )
    .await
    .unwrap();

    let html = http_get(server.addr(), "/webpages/index.html").await.unwrap();
    assert_eq!(html.status, 200);
    assert!(html.header("content-type").unwrap().starts_with("text/html"));
    assert_eq!(html.body, b"<html><body>coffee</body></html>");

    let css = http_get(server.addr(), "/webpages/style.css").await.unwrap();
    assert!(css.header("content-type").unwrap().starts_with("text/css"));

    let png = http_get(server.addr(), "/bag%20dance/default.png").await.unwrap();
    assert_eq!(png.status, 200);
    assert_eq!(png.header("content-type"), Some("image/png"));

    server.running.stop().await.unwrap();
}

#[tokio::test]
async fn missing_file_is_404() {
    let server = start_server(FAST, &[("present.txt", &b"here"[..])]).await.unwrap();

    let resp = http_get(server.addr(), "/absent.txt").await.unwrap();
    assert_eq!(resp.status, 404);

    server.running.stop().await.unwrap();
}

#[tokio::test]
async fn directory_serves_index_and_redirects_bare_path() {
    let server = start_server(FAST, &[("webpages/index.html", &b"<h1>menu</h1>"[..])])
        .await
        .unwrap();

    let index = http_get(server.addr(), "/webpages/").await.unwrap();
    assert_eq!(index.status, 200);
    assert_eq!(index.body, b"<h1>menu</h1>");

    let bare = http_get(server.addr(), "/webpages").await.unwrap();
    assert!((300..400).contains(&bare.status), "status {}", bare.status);
    assert!(bare.header("location").unwrap().ends_with("/webpages/"));

    server.running.stop().await.unwrap();
}

#[tokio::test]
async fn headers_are_paced_too() {
    // A 404 has a tiny body, so nearly all paced bytes are the response head.
    let server = start_server(FAST, &[]).await.unwrap();
    let before = server.running.tracker().snapshot().cumulative_bytes;

    let resp = http_get(server.addr(), "/nothing-here").await.unwrap();
    assert_eq!(resp.status, 404);

    let counted = server.running.tracker().snapshot().cumulative_bytes - before;
    assert!(counted as usize >= resp.head.len());

    server.running.stop().await.unwrap();
}
