use std::io;
use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use powerproxy_core::clock::Clock;
use powerproxy_core::metrics::Metrics;
use powerproxy_core::slip::RoutingSlip;
use powerproxy_core::target::ByteStream;
use powerproxy_plugins::base::{Hook, PluginHost};

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// Relay an upstream event stream downstream, line by line.
///
/// Every upstream line is emitted verbatim with a `\r\n` suffix; the
/// per-chunk hook fires between reading a line and writing it. The bounded
/// channel gives one-line backpressure: a slow client transitively slows
/// upstream consumption. When the client disconnects the upstream read is
/// abandoned, but the terminal hook still fires with whatever counters were
/// accumulated.
pub fn forward_stream(
    plugins: Arc<PluginHost>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    mut slip: RoutingSlip,
    mut upstream: ByteStream,
) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(1);

    tokio::spawn(async move {
        let mut buffer = String::new();
        let mut downstream_connected = true;

        'read: while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!("Upstream stream failed mid-response: {e}");
                    let _ = tx
                        .send(Err(io::Error::other(format!("upstream stream failed: {e}"))))
                        .await;
                    break 'read;
                }
            };
            match std::str::from_utf8(&chunk) {
                Ok(text) => buffer.push_str(text),
                Err(e) => {
                    tracing::warn!("Upstream stream is not valid UTF-8: {e}");
                    let _ = tx
                        .send(Err(io::Error::other("upstream stream is not valid UTF-8")))
                        .await;
                    break 'read;
                }
            }

            while let Some(newline) = buffer.find('\n') {
                let mut line = buffer[..newline].to_string();
                buffer.drain(..=newline);
                if line.ends_with('\r') {
                    line.pop();
                }
                if !relay_line(&plugins, &clock, &mut slip, &tx, line).await {
                    downstream_connected = false;
                    break 'read;
                }
            }
        }

        // A final line without a trailing newline is still a line.
        if downstream_connected && !buffer.is_empty() {
            let line = std::mem::take(&mut buffer);
            relay_line(&plugins, &clock, &mut slip, &tx, line).await;
        }

        slip.data_from_target = None;
        slip.measure_roundtrip(clock.now_ms());
        if let Some(ms) = slip.roundtrip_time_ms {
            metrics.record_latency_ms(ms);
        }

        plugins.finalize_stream_token_counts(&mut slip);
        if plugins.requires_token_counts() {
            metrics.record_tokens(slip.usage.prompt_tokens, slip.usage.completion_tokens);
            if let Err(e) = plugins.fire(Hook::TokenCountsForRequestAvailable, &slip).await {
                log_mid_stream_hook_error("on_token_counts_for_request_available", e);
            }
        }
        if let Err(e) = plugins
            .fire(Hook::EndOfTargetResponseStreamReached, &slip)
            .await
        {
            log_mid_stream_hook_error("on_end_of_target_response_stream_reached", e);
        }
    });

    Body::from_stream(ReceiverStream::new(rx))
}

/// Fire the data-event hook for one upstream line, then send it downstream.
/// Returns false once the downstream side is gone.
async fn relay_line(
    plugins: &PluginHost,
    clock: &Arc<dyn Clock>,
    slip: &mut RoutingSlip,
    tx: &mpsc::Sender<Result<Bytes, io::Error>>,
    line: String,
) -> bool {
    slip.data_from_target = None;
    if let Some(payload) = line.strip_prefix(DATA_PREFIX) {
        if slip.time_to_response_ms.is_none() {
            slip.time_to_response_ms =
                Some(clock.now_ms().saturating_sub(slip.request_start_ms));
        }
        if payload != DONE_SENTINEL {
            slip.data_from_target = Some(payload.to_string());
            plugins.accumulate_stream_tokens(slip);
            if let Err(e) = plugins.fire(Hook::DataEventFromTargetReceived, slip).await {
                log_mid_stream_hook_error("on_data_event_from_target_received", e);
            }
        }
    }

    tx.send(Ok(Bytes::from(format!("{line}\r\n")))).await.is_ok()
}

/// Response headers are already on the wire, so a hook interruption here can
/// only be logged, not returned.
fn log_mid_stream_hook_error(hook: &str, error: powerproxy_plugins::base::HookError) {
    match error {
        powerproxy_plugins::base::HookError::Immediate(response) => {
            tracing::warn!(
                hook,
                status = response.status.as_u16(),
                "Plugin raised an immediate response mid-stream; ignoring"
            );
        }
        powerproxy_plugins::base::HookError::Internal(e) => {
            tracing::error!(hook, "Plugin hook failed mid-stream: {e}");
        }
    }
}
