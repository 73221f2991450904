//! Streaming batch validation
//!
//! `POST /validate/batch` accepts newline-delimited JSON position reports
//! and streams back one NDJSON response line per report, in report order.
//! All reports of a stream are processed on a single task, so side-effect
//! scheduling is serialized in report order as well; only the completion
//! of the detached tasks is unordered.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use coordcheck_common::model::{PositionReport, ValidateResponse, Verdict};

use crate::AppState;

pub async fn validate_batch(State(ctx): State<AppState>, request: Request) -> Response {
    let body_stream = request.into_body().into_data_stream();
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(16);

    tokio::spawn(process_stream(ctx, body_stream, tx));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .expect("static response construction")
}

async fn process_stream(
    ctx: AppState,
    mut body: axum::body::BodyDataStream,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
) {
    let mut buf: Vec<u8> = Vec::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("batch stream aborted while reading body: {}", e);
                return;
            }
        };
        buf.extend_from_slice(&chunk);

        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            if !process_line(&ctx, &line, &tx).await {
                return;
            }
        }
    }

    // Trailing report without a final newline
    if !buf.is_empty() {
        process_line(&ctx, &buf, &tx).await;
    }
}

/// Validate one report line and emit its response line
///
/// Returns false when the stream should stop (writer gone or a dependency
/// failure that prevents decision-making).
async fn process_line(
    ctx: &AppState,
    line: &[u8],
    tx: &mpsc::Sender<Result<Bytes, Infallible>>,
) -> bool {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return true;
    }

    let response = match serde_json::from_slice::<PositionReport>(trimmed) {
        Ok(report) => match ctx.validator.validate(&report).await {
            Ok(outcome) => {
                super::handlers::schedule_side_effects(ctx, &report, &outcome).await;
                outcome.response
            }
            Err(e) => {
                warn!("batch validation aborted: {}", e);
                return false;
            }
        },
        // A malformed report is categorized, not a transport error
        Err(_) => ValidateResponse {
            verdict: Verdict::Invalid,
            confidence: 0.0,
            estimated_accuracy: 0.0,
            reason: "malformed report".to_string(),
        },
    };

    let mut line = match serde_json::to_vec(&response) {
        Ok(line) => line,
        Err(e) => {
            warn!("batch response serialization failed: {}", e);
            return false;
        }
    };
    line.push(b'\n');

    tx.send(Ok(Bytes::from(line))).await.is_ok()
}
