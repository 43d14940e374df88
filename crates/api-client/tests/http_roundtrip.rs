use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use cutline_api_client::{
    wait_for_export, ExportStatus, ExportStatusClient, GenerationClient, GenerationKind, GenerationRequest,
    HttpApiClient,
};
use cutline_common::config::ApiConfig;
use cutline_common::signal::AbortSignal;

/// Read one request: the head, then `Content-Length` bytes of body.
async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let body_len = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while data.len() < head_end + body_len {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    head
}

/// Minimal HTTP/1.1 server answering each connection with the next scripted
/// `(status, body)` pair and recording request heads.
async fn serve(replies: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    tokio::spawn(async move {
        for (status, body) in replies {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            log.lock().unwrap().push(request.lines().next().unwrap_or_default().to_string());
            let response = format!(
                "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        }
    });
    (format!("http://{addr}/api"), seen)
}

fn client(base_url: String) -> HttpApiClient {
    HttpApiClient::new(&ApiConfig {
        base_url,
        poll_interval_ms: 2000,
        request_timeout_secs: 5,
    })
    .unwrap()
}

#[tokio::test]
async fn export_status_and_generation_submit_over_http() {
    let (base, seen) = serve(vec![
        (200, r#"{"status":"processing"}"#),
        (200, r#"{"generationId":"gen-7"}"#),
        (200, r#"{"status":"completed","resultUrl":"https://cdn/gen-7.mp4"}"#),
    ])
    .await;
    let api = client(base);

    let status = api.export_status("job-1").await.unwrap();
    assert_eq!(status.status, ExportStatus::Processing);

    let submitted = api
        .submit(GenerationKind::Video, &GenerationRequest::new("waves"))
        .await
        .unwrap();
    assert_eq!(submitted.generation_id, "gen-7");

    let generation = api.generation("gen-7").await.unwrap();
    assert_eq!(generation.result_url.as_deref(), Some("https://cdn/gen-7.mp4"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0], "GET /api/export/job-1 HTTP/1.1");
    assert_eq!(seen[1], "POST /api/generate/video HTTP/1.1");
    assert_eq!(seen[2], "GET /api/generations/gen-7 HTTP/1.1");
}

#[tokio::test]
async fn server_errors_surface_status_and_body() {
    let (base, _) = serve(vec![(500, r#"{"message":"boom"}"#)]).await;
    let err = client(base).export_status("job-1").await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("500"), "{message}");
    assert!(message.contains("boom"), "{message}");
}

#[tokio::test]
async fn wait_for_export_polls_until_completed() {
    let (base, seen) = serve(vec![
        (200, r#"{"status":"processing"}"#),
        (200, r#"{"status":"completed","downloadUrl":"https://cdn/final.mp4"}"#),
    ])
    .await;
    let api = client(base);
    let abort = AbortSignal::new();
    let done = wait_for_export(&api, "job-9", Duration::from_millis(1), &abort)
        .await
        .unwrap();
    assert_eq!(done.status, ExportStatus::Completed);
    assert_eq!(done.download_url.as_deref(), Some("https://cdn/final.mp4"));
    assert_eq!(seen.lock().unwrap().len(), 2);
}
