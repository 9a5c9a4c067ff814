//! HTTP server for the supply dashboard's question box
//! Simple HTTP server using tokio and basic HTTP handling

use std::collections::HashMap;
use std::sync::Arc;
use supply_qa::bootstrap;
use supply_qa::config::EngineConfig;
use supply_qa::db::query_history::Feedback;
use supply_qa::execution_loop::{CancelHandle, QueryService};
use supply_qa::model::{QaOutcome, QaRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("QA_CONFIG").ok().map(std::path::PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref())?;
    let service = Arc::new(bootstrap::build_service(&config).await?);

    let addr = std::env::var("QA_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "Server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "New connection");
        tokio::spawn(handle_connection(stream, Arc::clone(&service)));
    }
}

async fn handle_connection(mut stream: TcpStream, service: Arc<QueryService>) {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            warn!("Failed to read from stream: {}", e);
            return;
        }
    };

    // a client that hangs up abandons its question
    let cancel = CancelHandle::new();
    let response = {
        let handler = handle_request(&request, &service, &cancel);
        tokio::pin!(handler);
        let mut probe = [0u8; 1];
        tokio::select! {
            response = &mut handler => response,
            read = stream.read(&mut probe) => {
                if matches!(read, Ok(0) | Err(_)) {
                    cancel.cancel();
                }
                handler.await
            }
        }
    };

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        warn!("Failed to write response: {}", e);
    }
}

/// Read headers plus a `Content-Length` body.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut data = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        let size = stream.read(&mut buffer).await?;
        if size == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..size]);
        if data.len() > MAX_REQUEST_BYTES {
            break;
        }
        let text = String::from_utf8_lossy(&data);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(key, _)| key.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    Ok(String::from_utf8_lossy(&data).into_owned())
}

async fn handle_request(request: &str, service: &QueryService, cancel: &CancelHandle) -> String {
    let lines: Vec<&str> = request.lines().collect();
    if lines.is_empty() {
        return create_response(400, "Bad Request", "{}");
    }

    let parts: Vec<&str> = lines[0].split_whitespace().collect();
    if parts.len() < 2 {
        return create_response(400, "Bad Request", "{}");
    }

    let method = parts[0];
    let (path, query) = match parts[1].split_once('?') {
        Some((path, query)) => (path, query),
        None => (parts[1], ""),
    };
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };

    let body = request
        .find("\r\n\r\n")
        .map(|idx| request[idx + 4..].trim())
        .unwrap_or("");

    info!(method, path, "Request");

    match (method, path) {
        ("OPTIONS", _) => create_response(204, "No Content", ""),
        ("GET", "/api/health") => {
            let body = serde_json::json!({
                "status": "ok",
                "service": "supply-qa",
                "available_permits": service.available_permits(),
            });
            create_response(200, "OK", &body.to_string())
        }
        ("POST", "/api/ask") => {
            let request: QaRequest = match serde_json::from_str(body) {
                Ok(request) => request,
                Err(e) => {
                    let body = serde_json::json!({"error": format!("invalid request body: {}", e)});
                    return create_response(400, "Bad Request", &body.to_string());
                }
            };
            let outcome = service.outcome(request, cancel).await;
            let (status, text) = match &outcome {
                QaOutcome::Answer(_) => (200, "OK"),
                QaOutcome::Failure(f) if f.retryable => (503, "Service Unavailable"),
                QaOutcome::Failure(_) => (422, "Unprocessable Entity"),
            };
            json_response(status, text, &outcome)
        }
        ("GET", "/api/history") => {
            let Some(history) = service.engine().history() else {
                return create_response(200, "OK", r#"{"records":[]}"#);
            };
            let limit = query_params(query)
                .get("limit")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(20)
                .min(200);
            match history.recent(limit).await {
                Ok(records) => json_response(200, "OK", &serde_json::json!({"records": records})),
                Err(e) => {
                    error!("History read failed: {}", e);
                    create_response(500, "Internal Server Error", r#"{"error":"history unavailable"}"#)
                }
            }
        }
        ("POST", "/api/feedback") => {
            #[derive(serde::Deserialize)]
            struct FeedbackBody {
                id: Uuid,
                helpful: bool,
                #[serde(default)]
                comment: Option<String>,
            }
            let Some(history) = service.engine().history() else {
                return create_response(404, "Not Found", r#"{"error":"history is disabled"}"#);
            };
            let parsed: FeedbackBody = match serde_json::from_str(body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    let body = serde_json::json!({"error": format!("invalid feedback body: {}", e)});
                    return create_response(400, "Bad Request", &body.to_string());
                }
            };
            match history
                .append_feedback(parsed.id, &Feedback::new(parsed.helpful, parsed.comment))
                .await
            {
                Ok(()) => create_response(200, "OK", r#"{"success":true}"#),
                Err(e) => {
                    warn!("Feedback rejected: {}", e);
                    create_response(404, "Not Found", r#"{"error":"unknown history record"}"#)
                }
            }
        }
        _ => create_response(404, "Not Found", r#"{"error":"Not found"}"#),
    }
}

fn query_params(query: &str) -> HashMap<&str, &str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .collect()
}

fn json_response<T: serde::Serialize>(status: u16, status_text: &str, value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(body) => create_response(status, status_text, &body),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            create_response(500, "Internal Server Error", r#"{"error":"Failed to serialize response"}"#)
        }
    }
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
