/// Sends a few messages to an echo server and prints what comes back.
///
/// cargo run --example echo_client -- wss://echo.websocket.org
use std::time::Duration;

use nnws::{CloseCode, Event, Frame, Options, VerboseLevel, native::WebSocket};

#[tokio::main]
async fn main() -> nnws::Result<()> {
    tracing_subscriber::fmt::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:9001".to_owned());

    let options = Options::default()
        .with_verbose(VerboseLevel::Info)
        .with_read_timeout(Duration::from_secs(30))
        .with_fragment_size(4096);

    let (ws, mut events) = WebSocket::connect(url.parse()?, options)?;

    let mut echoed = 0;
    while let Some(event) = events.recv().await {
        match event {
            Event::Opened { protocol } => {
                tracing::info!(?protocol, "connected");
                ws.send_text("hello").await?;
                ws.send_binary(vec![0u8; 10_000]).await?;
                ws.send_frame(Frame::ping("are you there")).await?;
            }
            Event::OpenFailed(err) => {
                tracing::error!("could not connect: {err}");
                break;
            }
            Event::Text(text) => {
                tracing::info!("text: {text}");
                echoed += 1;
            }
            Event::Binary(data) => {
                tracing::info!("binary: {} bytes", data.len());
                echoed += 1;
            }
            Event::Frame(frame) => tracing::debug!(opcode = ?frame.opcode(), "frame"),
            Event::Closed { status, error } => {
                tracing::info!(status = u16::from(status), ?error, "closed");
                break;
            }
            chunk => tracing::info!(?chunk, "chunk"),
        }

        if echoed == 2 {
            echoed += 1;
            ws.close_with_reason(CloseCode::Normal, "done").await?;
        }
    }

    Ok(())
}
